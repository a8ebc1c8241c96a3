// In-memory sequencer host with failure injection.
//
// Stands in for a real host application in tests, dry runs, and the loopback
// bridge. It keeps tracks, clips, and notes in memory and records every
// insertion call per track so tests can assert on exactly what was sent.
//
// Failure injection, all deterministic for a given seed:
// - `transient_failure_rate`: any call fails with `Retryable` before it is
//   applied.
// - `lost_ack_rate`: an insertion is applied, then reported as `Retryable`
//   (the reply was lost). Only meaningful for insertions.
// - `script_insert_failure`: the n-th insertion call on a track fails with a
//   chosen outcome, regardless of the random rates.
// - `mark_instrument_missing`: loading that instrument is `Fatal`.
//
// Insertion is idempotent per `NoteKey` when `idempotent` is set. Otherwise
// every insert is stored as sent, and re-sent keys are counted as duplicates.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use spiral_canon_music::event::{canonical_cmp, tick_of};
use spiral_canon_music::{NoteEvent, NoteKey};
use spiral_canon_prng::CanonRng;
use spiral_canon_protocol::{ClipHandle, TrackHandle};

use crate::interface::{SequencerError, SequencerInterface, SequencerResult};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulatedConfig {
    pub idempotent: bool,
    pub transient_failure_rate: f64,
    pub lost_ack_rate: f64,
    pub seed: u64,
    /// Sleep per call, to make concurrency observable.
    pub call_latency_ms: u64,
}

impl Default for SimulatedConfig {
    fn default() -> Self {
        Self {
            idempotent: true,
            transient_failure_rate: 0.0,
            lost_ack_rate: 0.0,
            seed: 0,
            call_latency_ms: 0,
        }
    }
}

/// Outcome forced onto a scripted insertion call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScriptedFailure {
    Retryable,
    LostAck,
    Fatal,
}

/// What happened to one insertion call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallOutcome {
    Stored,
    Retryable,
    LostAck,
    Fatal,
}

#[derive(Debug, Clone, PartialEq)]
pub struct InsertCall {
    /// 1-based call number on this track.
    pub call: usize,
    pub keys: Vec<NoteKey>,
    pub outcome: CallOutcome,
}

#[derive(Debug, Clone)]
struct SimTrack {
    index: u32,
    name: Option<String>,
    instrument: Option<String>,
    inserts: Vec<InsertCall>,
}

#[derive(Debug, Clone)]
struct SimClip {
    track: TrackHandle,
    slot: u32,
    length_beats: f64,
    name: Option<String>,
    notes: Vec<NoteEvent>,
    keys: BTreeSet<NoteKey>,
    fired: bool,
}

#[derive(Debug)]
struct State {
    rng: CanonRng,
    tempo: Option<f64>,
    tracks: Vec<SimTrack>,
    clips: Vec<SimClip>,
    scripts: BTreeMap<(TrackHandle, usize), ScriptedFailure>,
    missing_instruments: BTreeSet<String>,
    duplicates: usize,
    calls: usize,
}

pub struct SimulatedSequencer {
    config: SimulatedConfig,
    state: Mutex<State>,
}

impl SimulatedSequencer {
    pub fn new(config: SimulatedConfig) -> Self {
        let state = State {
            rng: CanonRng::new(config.seed),
            tempo: None,
            tracks: Vec::new(),
            clips: Vec::new(),
            scripts: BTreeMap::new(),
            missing_instruments: BTreeSet::new(),
            duplicates: 0,
            calls: 0,
        };
        Self {
            config,
            state: Mutex::new(state),
        }
    }

    /// Reliable, idempotent host.
    pub fn reliable() -> Self {
        Self::new(SimulatedConfig::default())
    }

    pub fn config(&self) -> &SimulatedConfig {
        &self.config
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Make the `call`-th insertion (1-based) on `track` fail with `failure`.
    pub fn script_insert_failure(&self, track: TrackHandle, call: usize, failure: ScriptedFailure) {
        self.state().scripts.insert((track, call), failure);
    }

    pub fn mark_instrument_missing(&self, instrument: impl Into<String>) {
        self.state().missing_instruments.insert(instrument.into());
    }

    pub fn tempo(&self) -> Option<f64> {
        self.state().tempo
    }

    pub fn track_count(&self) -> usize {
        self.state().tracks.len()
    }

    pub fn track_index(&self, track: TrackHandle) -> Option<u32> {
        self.state().tracks.get(track.0 as usize).map(|t| t.index)
    }

    pub fn track_name(&self, track: TrackHandle) -> Option<String> {
        self.state().tracks.get(track.0 as usize).and_then(|t| t.name.clone())
    }

    pub fn instrument(&self, track: TrackHandle) -> Option<String> {
        self.state()
            .tracks
            .get(track.0 as usize)
            .and_then(|t| t.instrument.clone())
    }

    pub fn clip_name(&self, clip: ClipHandle) -> Option<String> {
        self.state().clips.get(clip.0 as usize).and_then(|c| c.name.clone())
    }

    /// `(track, slot, length)` of a clip.
    pub fn clip_layout(&self, clip: ClipHandle) -> Option<(TrackHandle, u32, f64)> {
        self.state()
            .clips
            .get(clip.0 as usize)
            .map(|c| (c.track, c.slot, c.length_beats))
    }

    /// Stored notes of a clip, in insertion order.
    pub fn notes(&self, clip: ClipHandle) -> Vec<NoteEvent> {
        self.state()
            .clips
            .get(clip.0 as usize)
            .map(|c| c.notes.clone())
            .unwrap_or_default()
    }

    pub fn total_notes(&self) -> usize {
        self.state().clips.iter().map(|c| c.notes.len()).sum()
    }

    /// Notes stored under a key that was already present.
    pub fn duplicate_count(&self) -> usize {
        self.state().duplicates
    }

    pub fn insert_calls(&self, track: TrackHandle) -> Vec<InsertCall> {
        self.state()
            .tracks
            .get(track.0 as usize)
            .map(|t| t.inserts.clone())
            .unwrap_or_default()
    }

    pub fn fired_clips(&self) -> Vec<ClipHandle> {
        self.state()
            .clips
            .iter()
            .enumerate()
            .filter(|(_, c)| c.fired)
            .map(|(i, _)| ClipHandle(i as u32))
            .collect()
    }

    /// Every call made so far, successful or not.
    pub fn call_count(&self) -> usize {
        self.state().calls
    }

    /// Common preamble: latency, call counting, random transient failure.
    fn begin_call(&self, what: &str) -> SequencerResult<MutexGuard<'_, State>> {
        if self.config.call_latency_ms > 0 {
            thread::sleep(Duration::from_millis(self.config.call_latency_ms));
        }
        let mut state = self.state();
        state.calls += 1;
        let rate = self.config.transient_failure_rate;
        if rate > 0.0 && state.rng.random_bool(rate) {
            return Err(SequencerError::Retryable(format!("{what}: host busy")));
        }
        Ok(state)
    }
}

impl State {
    fn track_mut(&mut self, track: TrackHandle) -> SequencerResult<&mut SimTrack> {
        self.tracks
            .get_mut(track.0 as usize)
            .ok_or_else(|| SequencerError::Fatal(format!("unknown {track}")))
    }

    fn clip_mut(&mut self, track: TrackHandle, clip: ClipHandle) -> SequencerResult<&mut SimClip> {
        match self.clips.get_mut(clip.0 as usize) {
            Some(c) if c.track == track => Ok(c),
            Some(_) => Err(SequencerError::Fatal(format!("{clip} is not on {track}"))),
            None => Err(SequencerError::Fatal(format!("unknown {clip}"))),
        }
    }
}

impl SequencerInterface for SimulatedSequencer {
    fn set_tempo(&self, bpm: f64) -> SequencerResult<()> {
        let mut state = self.begin_call("set_tempo")?;
        if !(bpm.is_finite() && bpm > 0.0) {
            return Err(SequencerError::Fatal(format!("invalid tempo {bpm}")));
        }
        state.tempo = Some(bpm);
        Ok(())
    }

    fn create_track(&self, index: u32) -> SequencerResult<TrackHandle> {
        let mut state = self.begin_call("create_track")?;
        let handle = TrackHandle(state.tracks.len() as u32);
        state.tracks.push(SimTrack {
            index,
            name: None,
            instrument: None,
            inserts: Vec::new(),
        });
        Ok(handle)
    }

    fn name_track(&self, track: TrackHandle, name: &str) -> SequencerResult<()> {
        let mut state = self.begin_call("name_track")?;
        state.track_mut(track)?.name = Some(name.to_string());
        Ok(())
    }

    fn load_instrument(&self, track: TrackHandle, instrument: &str) -> SequencerResult<()> {
        let mut state = self.begin_call("load_instrument")?;
        if state.missing_instruments.contains(instrument) {
            return Err(SequencerError::Fatal(format!("instrument '{instrument}' not found")));
        }
        state.track_mut(track)?.instrument = Some(instrument.to_string());
        Ok(())
    }

    fn create_clip(
        &self,
        track: TrackHandle,
        slot: u32,
        length_beats: f64,
    ) -> SequencerResult<ClipHandle> {
        let mut state = self.begin_call("create_clip")?;
        state.track_mut(track)?;
        if !(length_beats.is_finite() && length_beats > 0.0) {
            return Err(SequencerError::Fatal(format!("invalid clip length {length_beats}")));
        }
        let handle = ClipHandle(state.clips.len() as u32);
        state.clips.push(SimClip {
            track,
            slot,
            length_beats,
            name: None,
            notes: Vec::new(),
            keys: BTreeSet::new(),
            fired: false,
        });
        Ok(handle)
    }

    fn name_clip(&self, clip: ClipHandle, name: &str) -> SequencerResult<()> {
        let mut state = self.begin_call("name_clip")?;
        let c = state
            .clips
            .get_mut(clip.0 as usize)
            .ok_or_else(|| SequencerError::Fatal(format!("unknown {clip}")))?;
        c.name = Some(name.to_string());
        Ok(())
    }

    fn insert_notes(
        &self,
        track: TrackHandle,
        clip: ClipHandle,
        notes: &[NoteEvent],
    ) -> SequencerResult<usize> {
        let keys: Vec<NoteKey> = notes.iter().map(NoteEvent::key).collect();
        let mut guard = match self.begin_call("insert_notes") {
            Ok(guard) => guard,
            Err(e) => {
                let mut state = self.state();
                let t = state.track_mut(track)?;
                let call = t.inserts.len() + 1;
                t.inserts.push(InsertCall {
                    call,
                    keys,
                    outcome: CallOutcome::Retryable,
                });
                return Err(e);
            }
        };
        let state = &mut *guard;
        let call = state.track_mut(track)?.inserts.len() + 1;
        state.clip_mut(track, clip)?;

        let scripted = state.scripts.remove(&(track, call));
        let lost_ack = match scripted {
            Some(ScriptedFailure::LostAck) => true,
            Some(_) => false,
            None => {
                let rate = self.config.lost_ack_rate;
                rate > 0.0 && state.rng.random_bool(rate)
            }
        };
        let outcome = match scripted {
            Some(ScriptedFailure::Retryable) => CallOutcome::Retryable,
            Some(ScriptedFailure::Fatal) => CallOutcome::Fatal,
            _ if lost_ack => CallOutcome::LostAck,
            _ => CallOutcome::Stored,
        };
        state.track_mut(track)?.inserts.push(InsertCall { call, keys, outcome });

        match outcome {
            CallOutcome::Retryable => {
                return Err(SequencerError::Retryable(format!(
                    "insert_notes on {track}: rate limited"
                )));
            }
            CallOutcome::Fatal => {
                return Err(SequencerError::Fatal(format!("insert_notes on {track}: clip locked")));
            }
            CallOutcome::Stored | CallOutcome::LostAck => {}
        }

        let idempotent = self.config.idempotent;
        let mut stored = 0;
        let mut duplicates = 0;
        let target = state.clip_mut(track, clip)?;
        for note in notes {
            let fresh = target.keys.insert(note.key());
            if fresh || !idempotent {
                target.notes.push(note.clone());
                stored += 1;
                if !fresh {
                    duplicates += 1;
                }
            }
        }
        state.duplicates += duplicates;

        if lost_ack {
            return Err(SequencerError::Retryable(format!(
                "insert_notes on {track}: reply lost"
            )));
        }
        Ok(stored)
    }

    fn query_notes(
        &self,
        track: TrackHandle,
        clip: ClipHandle,
        from: f64,
        to: f64,
    ) -> SequencerResult<Vec<NoteEvent>> {
        let mut state = self.begin_call("query_notes")?;
        let (lo, hi) = (tick_of(from), tick_of(to));
        let c = state.clip_mut(track, clip)?;
        let mut found: Vec<NoteEvent> = c
            .notes
            .iter()
            .filter(|n| (lo..hi).contains(&tick_of(n.start)))
            .cloned()
            .collect();
        // Clips list notes by time, not by arrival.
        found.sort_by(canonical_cmp);
        Ok(found)
    }

    fn fire_clip(&self, track: TrackHandle, clip: ClipHandle) -> SequencerResult<()> {
        let mut state = self.begin_call("fire_clip")?;
        state.clip_mut(track, clip)?.fired = true;
        Ok(())
    }

    fn idempotent_inserts(&self) -> bool {
        self.config.idempotent
    }
}
