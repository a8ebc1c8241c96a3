// Batched, retrying transmission of one voice's timeline to the host.
//
// `partition` cuts a timeline into contiguous batches of at most
// `batch_size` events, numbered from 1 in timeline order. Batches never
// reorder events. `BatchedDispatcher::dispatch` then sends them one at a time:
// batch N+1 is not sent until batch N has been confirmed or given up on, so a
// voice has at most one call in flight.
//
// Per batch:
// - `Retryable` / `Timeout`: back off and resend, up to `max_retries` times.
//   The backoff is `base * 2^(attempt - 1)`, capped at `backoff_cap_ms`,
//   scaled by a jitter factor in [0.5, 1] drawn from a per-voice PRNG stream.
// - Resending after a failure must not duplicate notes. Idempotent hosts
//   skip known keys themselves; for other hosts the dispatcher first queries
//   the batch's time range and drops keys the host already holds.
// - Retries exhausted: the batch goes into `failed_batches` and dispatch moves
//   on to the next batch.
// - `Fatal`: dispatch stops. The batch is reported failed, the rest unsent.
//   Batches already confirmed stay in place; nothing is rolled back.
//
// Cancellation is checked at batch boundaries only. A cancelled voice keeps
// what it has sent and lists the remainder as unsent.
//
// Setup calls (track, clip, instrument) go through `with_retry`, which applies
// the same retry policy to a single call.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use spiral_canon_music::event::TICKS_PER_BEAT;
use spiral_canon_music::{NoteEvent, NoteKey, ScoreError, ScoreResult, VoiceId};
use spiral_canon_prng::CanonRng;
use spiral_canon_protocol::{ClipHandle, TrackHandle};

use crate::interface::{SequencerError, SequencerInterface, SequencerResult};

/// Share of the backoff delay that jitter may remove.
const JITTER_SPREAD: f64 = 0.5;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    pub batch_size: usize,
    /// Resends after the first attempt.
    pub max_retries: u32,
    pub backoff_base_ms: u64,
    pub backoff_cap_ms: u64,
    /// Seed for backoff jitter.
    pub seed: u64,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            batch_size: 30,
            max_retries: 8,
            backoff_base_ms: 25,
            backoff_cap_ms: 1000,
            seed: 0,
        }
    }
}

impl DispatchConfig {
    pub fn validate(&self) -> ScoreResult<()> {
        if self.batch_size == 0 {
            return Err(ScoreError::config("dispatch batch size must be at least 1"));
        }
        if self.backoff_cap_ms < self.backoff_base_ms {
            return Err(ScoreError::config(format!(
                "backoff cap ({} ms) is below the base delay ({} ms)",
                self.backoff_cap_ms, self.backoff_base_ms
            )));
        }
        Ok(())
    }
}

/// Position of a batch within its voice, starting at 1.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BatchSequence(pub u32);

impl fmt::Display for BatchSequence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DispatchBatch<'a> {
    pub sequence: BatchSequence,
    pub events: &'a [NoteEvent],
}

/// Split `events` into ordered batches of at most `batch_size`.
pub fn partition(events: &[NoteEvent], batch_size: usize) -> Vec<DispatchBatch<'_>> {
    events
        .chunks(batch_size.max(1))
        .enumerate()
        .map(|(i, chunk)| DispatchBatch {
            sequence: BatchSequence(i as u32 + 1),
            events: chunk,
        })
        .collect()
}

/// Where a voice's notes go on the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatchTarget {
    pub voice: VoiceId,
    pub track: TrackHandle,
    pub clip: ClipHandle,
}

/// Shared flag that stops dispatch at the next batch boundary.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

/// Outcome of dispatching one voice.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct DispatchReport {
    pub voice: Option<VoiceId>,
    pub total_events: usize,
    /// Events the host is known to hold after dispatch.
    pub confirmed_events: usize,
    /// Events skipped on resend because the host already had them.
    pub skipped_events: usize,
    pub sent_batches: Vec<BatchSequence>,
    pub failed_batches: Vec<BatchSequence>,
    pub unsent_batches: Vec<BatchSequence>,
    /// Host calls made, including retries and range queries.
    pub attempts: u32,
    pub retries: u32,
    /// Set when a fatal error stopped the voice.
    pub aborted: Option<String>,
    pub cancelled: bool,
}

impl DispatchReport {
    pub fn for_voice(voice: VoiceId, total_events: usize) -> Self {
        Self {
            voice: Some(voice),
            total_events,
            ..Default::default()
        }
    }

    /// Every event confirmed and nothing failed, aborted, or cancelled.
    pub fn is_complete(&self) -> bool {
        self.confirmed_events == self.total_events
            && self.failed_batches.is_empty()
            && self.unsent_batches.is_empty()
            && self.aborted.is_none()
            && !self.cancelled
    }
}

/// Backoff before retry number `retry` (1-based), jitter applied.
pub fn backoff_delay(config: &DispatchConfig, retry: u32, rng: &mut CanonRng) -> Duration {
    let exponent = retry.saturating_sub(1).min(20);
    let raw = config.backoff_base_ms.saturating_mul(1u64 << exponent);
    let capped = raw.min(config.backoff_cap_ms);
    let jittered = capped as f64 * rng.jitter_factor(JITTER_SPREAD);
    Duration::from_micros((jittered * 1000.0).round() as u64)
}

enum BatchOutcome {
    Confirmed,
    Exhausted(SequencerError),
    Fatal(SequencerError),
}

pub struct BatchedDispatcher<'h> {
    host: &'h dyn SequencerInterface,
    config: DispatchConfig,
    cancel: CancelToken,
}

impl<'h> BatchedDispatcher<'h> {
    pub fn new(host: &'h dyn SequencerInterface, config: DispatchConfig) -> ScoreResult<Self> {
        config.validate()?;
        Ok(Self {
            host,
            config,
            cancel: CancelToken::new(),
        })
    }

    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn config(&self) -> &DispatchConfig {
        &self.config
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Jitter stream for one voice; voices never share a stream.
    pub fn rng_for(&self, voice: VoiceId) -> CanonRng {
        CanonRng::new(self.config.seed).fork(u64::from(voice.0))
    }

    /// Run one host call under the retry policy. Returns the value and the
    /// number of attempts it took.
    pub fn with_retry<T>(
        &self,
        what: &str,
        rng: &mut CanonRng,
        mut call: impl FnMut() -> SequencerResult<T>,
    ) -> (SequencerResult<T>, u32) {
        let mut attempts = 0;
        loop {
            attempts += 1;
            match call() {
                Ok(value) => return (Ok(value), attempts),
                Err(e) if e.is_retryable() && attempts <= self.config.max_retries => {
                    let delay = backoff_delay(&self.config, attempts, rng);
                    warn!("{what}: {e}; retry {attempts} in {delay:?}");
                    thread::sleep(delay);
                }
                Err(e) => return (Err(e), attempts),
            }
        }
    }

    /// Send `events` to `target` in batches.
    pub fn dispatch(&self, target: &DispatchTarget, events: &[NoteEvent]) -> DispatchReport {
        let mut report = DispatchReport::for_voice(target.voice, events.len());
        let batches = partition(events, self.config.batch_size);
        let mut rng = self.rng_for(target.voice);

        for (i, batch) in batches.iter().enumerate() {
            if self.cancel.is_cancelled() {
                warn!("{}: cancelled before batch {}", target.voice, batch.sequence);
                report.cancelled = true;
                report.unsent_batches.extend(batches[i..].iter().map(|b| b.sequence));
                break;
            }
            match self.send_batch(target, batch, &mut rng, &mut report) {
                BatchOutcome::Confirmed => {
                    report.sent_batches.push(batch.sequence);
                    report.confirmed_events += batch.events.len();
                }
                BatchOutcome::Exhausted(e) => {
                    error!(
                        "{}: batch {} failed after {} retries: {e}",
                        target.voice, batch.sequence, self.config.max_retries
                    );
                    report.failed_batches.push(batch.sequence);
                }
                BatchOutcome::Fatal(e) => {
                    error!("{}: aborting at batch {}: {e}", target.voice, batch.sequence);
                    report.failed_batches.push(batch.sequence);
                    report.unsent_batches.extend(batches[i + 1..].iter().map(|b| b.sequence));
                    report.aborted = Some(e.to_string());
                    break;
                }
            }
        }

        if report.is_complete() {
            info!(
                "{}: {} events in {} batches ({} retries)",
                target.voice,
                report.confirmed_events,
                report.sent_batches.len(),
                report.retries
            );
        }
        report
    }

    fn send_batch(
        &self,
        target: &DispatchTarget,
        batch: &DispatchBatch<'_>,
        rng: &mut CanonRng,
        report: &mut DispatchReport,
    ) -> BatchOutcome {
        let mut pending: Vec<NoteEvent> = batch.events.to_vec();
        let mut failures = 0u32;
        let mut needs_check = false;

        loop {
            if needs_check && !self.host.idempotent_inserts() {
                report.attempts += 1;
                match self.already_stored(target, &pending) {
                    Ok(present) => {
                        let before = pending.len();
                        pending.retain(|e| !present.contains(&e.key()));
                        report.skipped_events += before - pending.len();
                        #[allow(unused_assignments)]
                        {
                            needs_check = false;
                        }
                    }
                    Err(e) if e.is_retryable() => {
                        match self.note_failure(target, batch, &e, &mut failures, rng, report) {
                            Some(outcome) => return outcome,
                            None => continue,
                        }
                    }
                    Err(e) => return BatchOutcome::Fatal(e),
                }
            }
            if pending.is_empty() {
                return BatchOutcome::Confirmed;
            }

            report.attempts += 1;
            match self.host.insert_notes(target.track, target.clip, &pending) {
                Ok(stored) => {
                    debug!(
                        "{}: batch {} stored {stored}/{} events",
                        target.voice,
                        batch.sequence,
                        pending.len()
                    );
                    return BatchOutcome::Confirmed;
                }
                Err(e) if e.is_retryable() => {
                    needs_check = true;
                    if let Some(outcome) =
                        self.note_failure(target, batch, &e, &mut failures, rng, report)
                    {
                        return outcome;
                    }
                }
                Err(e) => return BatchOutcome::Fatal(e),
            }
        }
    }

    /// Count a retryable failure and back off. Returns an outcome once the
    /// retry budget is spent.
    fn note_failure(
        &self,
        target: &DispatchTarget,
        batch: &DispatchBatch<'_>,
        e: &SequencerError,
        failures: &mut u32,
        rng: &mut CanonRng,
        report: &mut DispatchReport,
    ) -> Option<BatchOutcome> {
        *failures += 1;
        if *failures > self.config.max_retries {
            return Some(BatchOutcome::Exhausted(e.clone()));
        }
        report.retries += 1;
        let delay = backoff_delay(&self.config, *failures, rng);
        warn!(
            "{}: batch {} attempt {} failed: {e}; retrying in {delay:?}",
            target.voice, batch.sequence, failures
        );
        thread::sleep(delay);
        None
    }

    /// Keys from `pending` that the host already holds.
    fn already_stored(
        &self,
        target: &DispatchTarget,
        pending: &[NoteEvent],
    ) -> SequencerResult<BTreeSet<NoteKey>> {
        let Some(from) = pending.iter().map(|e| e.start).reduce(f64::min) else {
            return Ok(BTreeSet::new());
        };
        let last = pending.iter().map(|e| e.start).fold(from, f64::max);
        let to = last + 1.0 / TICKS_PER_BEAT;
        let existing = self.host.query_notes(target.track, target.clip, from, to)?;
        let wanted: BTreeSet<NoteKey> = pending.iter().map(NoteEvent::key).collect();
        Ok(existing
            .iter()
            .map(NoteEvent::key)
            .filter(|k| wanted.contains(k))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::simulated::{CallOutcome, ScriptedFailure, SimulatedConfig, SimulatedSequencer};

    fn timeline(n: usize) -> Vec<NoteEvent> {
        (0..n)
            .map(|i| NoteEvent {
                voice: VoiceId(1),
                pitch: 48 + (i % 24) as u8,
                start: i as f64 * 0.5,
                duration: 0.5,
                velocity: 90,
                muted: false,
            })
            .collect()
    }

    fn fast() -> DispatchConfig {
        DispatchConfig {
            backoff_base_ms: 0,
            backoff_cap_ms: 0,
            ..Default::default()
        }
    }

    fn target(host: &SimulatedSequencer) -> DispatchTarget {
        let track = host.create_track(1).unwrap();
        let clip = host.create_clip(track, 0, 96.0).unwrap();
        DispatchTarget {
            voice: VoiceId(1),
            track,
            clip,
        }
    }

    fn unique_keys(host: &SimulatedSequencer, clip: ClipHandle) -> usize {
        host.notes(clip).iter().map(NoteEvent::key).collect::<BTreeSet<_>>().len()
    }

    #[test]
    fn partition_keeps_order_and_bounds() {
        let events = timeline(67);
        let batches = partition(&events, 30);
        let sizes: Vec<usize> = batches.iter().map(|b| b.events.len()).collect();
        assert_eq!(sizes, vec![30, 30, 7]);
        let seqs: Vec<u32> = batches.iter().map(|b| b.sequence.0).collect();
        assert_eq!(seqs, vec![1, 2, 3]);
        let rejoined: Vec<NoteEvent> = batches.iter().flat_map(|b| b.events.to_vec()).collect();
        assert_eq!(rejoined, events);
        assert!(partition(&[], 30).is_empty());
    }

    #[test]
    fn one_transient_failure_retries_batch_two_once() {
        let host = SimulatedSequencer::reliable();
        let t = target(&host);
        host.script_insert_failure(t.track, 2, ScriptedFailure::Retryable);

        let dispatcher = BatchedDispatcher::new(&host, fast()).unwrap();
        let report = dispatcher.dispatch(&t, &timeline(67));

        assert!(report.is_complete(), "{report:?}");
        assert_eq!(report.confirmed_events, 67);
        assert_eq!(report.retries, 1);
        assert_eq!(report.attempts, 4);
        assert_eq!(report.sent_batches, vec![BatchSequence(1), BatchSequence(2), BatchSequence(3)]);

        let calls = host.insert_calls(t.track);
        let sizes: Vec<usize> = calls.iter().map(|c| c.keys.len()).collect();
        assert_eq!(sizes, vec![30, 30, 30, 7]);
        assert_eq!(calls[1].outcome, CallOutcome::Retryable);
        assert_eq!(calls[1].keys, calls[2].keys);

        assert_eq!(host.notes(t.clip).len(), 67);
        assert_eq!(unique_keys(&host, t.clip), 67);
    }

    #[test]
    fn lost_ack_on_non_idempotent_host_is_not_resent() {
        let host = SimulatedSequencer::new(SimulatedConfig {
            idempotent: false,
            ..Default::default()
        });
        let t = target(&host);
        host.script_insert_failure(t.track, 2, ScriptedFailure::LostAck);

        let report = BatchedDispatcher::new(&host, fast()).unwrap().dispatch(&t, &timeline(67));

        assert!(report.is_complete(), "{report:?}");
        assert_eq!(report.skipped_events, 30);
        assert_eq!(host.duplicate_count(), 0);
        assert_eq!(host.notes(t.clip).len(), 67);
        // The batch was queried, found complete, and never re-inserted.
        assert_eq!(host.insert_calls(t.track).len(), 3);
    }

    #[test]
    fn exhausted_batch_is_reported_and_dispatch_continues() {
        let host = SimulatedSequencer::reliable();
        let t = target(&host);
        let config = DispatchConfig {
            max_retries: 2,
            ..fast()
        };
        for call in 2..=4 {
            host.script_insert_failure(t.track, call, ScriptedFailure::Retryable);
        }

        let report = BatchedDispatcher::new(&host, config).unwrap().dispatch(&t, &timeline(67));

        assert_eq!(report.failed_batches, vec![BatchSequence(2)]);
        assert_eq!(report.sent_batches, vec![BatchSequence(1), BatchSequence(3)]);
        assert_eq!(report.confirmed_events, 37);
        assert_eq!(report.retries, 2);
        assert!(report.aborted.is_none());
        assert!(!report.is_complete());
        assert_eq!(host.notes(t.clip).len(), 37);
    }

    #[test]
    fn fatal_error_aborts_and_keeps_earlier_batches() {
        let host = SimulatedSequencer::reliable();
        let t = target(&host);
        host.script_insert_failure(t.track, 2, ScriptedFailure::Fatal);

        let report = BatchedDispatcher::new(&host, fast()).unwrap().dispatch(&t, &timeline(67));

        assert_eq!(report.sent_batches, vec![BatchSequence(1)]);
        assert_eq!(report.failed_batches, vec![BatchSequence(2)]);
        assert_eq!(report.unsent_batches, vec![BatchSequence(3)]);
        assert!(report.aborted.is_some());
        assert_eq!(report.retries, 0);
        assert_eq!(host.notes(t.clip).len(), 30);
    }

    #[test]
    fn cancellation_takes_effect_at_the_next_boundary() {
        let host = SimulatedSequencer::reliable();
        let t = target(&host);
        let cancel = CancelToken::new();
        cancel.cancel();
        let report = BatchedDispatcher::new(&host, fast())
            .unwrap()
            .with_cancel(cancel)
            .dispatch(&t, &timeline(67));
        assert!(report.cancelled);
        assert_eq!(report.unsent_batches.len(), 3);
        assert_eq!(report.confirmed_events, 0);
        assert_eq!(host.total_notes(), 0);
    }

    #[test]
    fn random_failures_still_deliver_everything_once() {
        for idempotent in [true, false] {
            let host = SimulatedSequencer::new(SimulatedConfig {
                idempotent,
                transient_failure_rate: 0.2,
                lost_ack_rate: 0.1,
                seed: 99,
                call_latency_ms: 0,
            });
            let t = target(&host);
            let config = DispatchConfig {
                max_retries: 30,
                ..fast()
            };
            let report = BatchedDispatcher::new(&host, config)
                .unwrap()
                .dispatch(&t, &timeline(200));
            assert!(report.is_complete(), "idempotent={idempotent}: {report:?}");
            assert_eq!(host.duplicate_count(), 0);
            assert_eq!(unique_keys(&host, t.clip), 200);
            assert_eq!(host.notes(t.clip).len(), 200);
        }
    }

    #[test]
    fn backoff_grows_and_is_capped() {
        let config = DispatchConfig {
            backoff_base_ms: 10,
            backoff_cap_ms: 50,
            ..Default::default()
        };
        let mut rng = CanonRng::new(3);
        for retry in 1..=8 {
            let delay = backoff_delay(&config, retry, &mut rng);
            let nominal = (10u64 << (retry - 1)).min(50);
            let ms = delay.as_secs_f64() * 1000.0;
            assert!(ms <= nominal as f64 + 1e-6, "retry {retry}: {ms}");
            assert!(ms >= nominal as f64 * 0.5 - 1e-6, "retry {retry}: {ms}");
        }
    }

    #[test]
    fn setup_calls_use_the_same_policy() {
        let host = SimulatedSequencer::new(SimulatedConfig {
            transient_failure_rate: 0.5,
            seed: 5,
            ..Default::default()
        });
        let dispatcher = BatchedDispatcher::new(
            &host,
            DispatchConfig {
                max_retries: 40,
                ..fast()
            },
        )
        .unwrap();
        let mut rng = dispatcher.rng_for(VoiceId(0));
        let (result, attempts) =
            dispatcher.with_retry("set_tempo", &mut rng, || host.set_tempo(90.0));
        assert!(result.is_ok());
        assert!(attempts >= 1);
        assert_eq!(host.tempo(), Some(90.0));
    }

    #[test]
    fn invalid_config_is_rejected() {
        let host = SimulatedSequencer::reliable();
        let zero = DispatchConfig {
            batch_size: 0,
            ..Default::default()
        };
        assert!(BatchedDispatcher::new(&host, zero).is_err());
    }
}
