// Top-level driver: configuration in, score generated, score dispatched.
//
// A run has two phases.
//
// **Generation** is pure and parallel. Each voice is generated section by
// section with `VoiceScoreGenerator` and composed into one timeline by the
// `TimelineCompositor`, on rayon's pool. Voices share nothing, and a voice
// that fails (configuration or integrity error) contributes no events at all:
// its report carries the error and it is never dispatched.
//
// **Dispatch** talks to the host. The tempo is set first. Then every voice
// that generated cleanly gets its own scoped thread, which sets up a track
// (create, name, load instrument) and a clip (create with the timeline's
// length, name), sends the timeline through a `BatchedDispatcher`, and
// launches the clip if configured. Each voice has at most one call in flight;
// voices run concurrently because they address independent tracks. Setup
// calls share the dispatcher's retry policy, and a setup failure leaves that
// voice aborted with every batch unsent.
//
// The `CancelToken` is checked before a voice's setup and at every batch
// boundary.

use std::thread;

use log::{debug, error, info, warn};
use rayon::prelude::*;
use spiral_canon_music::midi::MidiPart;
use spiral_canon_music::{
    ScoreResult, Timeline, TimelineCompositor, VoiceId, VoiceScoreGenerator, VoiceSpec,
};
use spiral_canon_prng::CanonRng;
use spiral_canon_sequencer::{
    BatchedDispatcher, CancelToken, DispatchReport, DispatchTarget, SequencerInterface,
    SequencerResult, partition,
};

use crate::config::CompositionConfig;
use crate::report::{CompositionReport, VoiceReport};

/// Jitter stream for calls that belong to no voice.
const SESSION_STREAM: u64 = u64::MAX;

/// One voice after generation.
#[derive(Debug, Clone)]
pub struct GeneratedVoice {
    pub report: VoiceReport,
    /// `None` when generation failed.
    pub timeline: Option<Timeline>,
}

/// Every voice's timeline, in configuration order.
#[derive(Debug, Clone)]
pub struct GeneratedScore {
    pub total_length: f64,
    pub voices: Vec<GeneratedVoice>,
}

impl GeneratedScore {
    pub fn total_events(&self) -> usize {
        self.voices.iter().map(|v| v.report.generated_events).sum()
    }

    pub fn timeline(&self, voice: VoiceId) -> Option<&Timeline> {
        self.voices
            .iter()
            .find(|v| v.report.voice == voice)
            .and_then(|v| v.timeline.as_ref())
    }

    pub fn failed_voices(&self) -> impl Iterator<Item = &GeneratedVoice> {
        self.voices.iter().filter(|v| v.timeline.is_none())
    }
}

/// Setup-call bookkeeping folded into the voice's dispatch report.
#[derive(Default)]
struct SetupTally {
    attempts: u32,
    retries: u32,
}

pub struct CompositionOrchestrator {
    config: CompositionConfig,
}

impl CompositionOrchestrator {
    /// Validate `config` and build an orchestrator for it.
    pub fn new(config: CompositionConfig) -> ScoreResult<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn config(&self) -> &CompositionConfig {
        &self.config
    }

    /// Generate and compose every voice.
    pub fn generate(&self) -> ScoreResult<GeneratedScore> {
        let compositor = TimelineCompositor::from_sections(&self.config.sections)?;
        let voices: Vec<GeneratedVoice> = self
            .config
            .voices
            .par_iter()
            .map(|spec| self.generate_voice(&compositor, spec))
            .collect();
        Ok(GeneratedScore {
            total_length: compositor.total_length(),
            voices,
        })
    }

    fn generate_voice(&self, compositor: &TimelineCompositor, spec: &VoiceSpec) -> GeneratedVoice {
        let mut report = VoiceReport::new(spec.role.id, spec.role.name.clone());
        let generator = VoiceScoreGenerator::new(&self.config.spiral, self.config.tonic);
        let composed = generator
            .generate_voice(spec, &self.config.sections)
            .and_then(|sections| {
                let slices: Vec<&[_]> = sections.iter().map(Vec::as_slice).collect();
                compositor.compose_voice(spec.role.id, &slices)
            });
        match composed {
            Ok(timeline) => {
                report.generated_events = timeline.len();
                report.muted_events = timeline.events.iter().filter(|e| e.muted).count();
                report.per_section = self
                    .config
                    .sections
                    .iter()
                    .enumerate()
                    .map(|(i, s)| (s.kind, timeline.section_events(i).len()))
                    .collect();
                debug!(
                    "{} '{}': {} events {:?}",
                    spec.role.id, spec.role.name, report.generated_events, report.per_section
                );
                GeneratedVoice {
                    report,
                    timeline: Some(timeline),
                }
            }
            Err(e) => {
                error!("{} '{}': generation failed: {e}", spec.role.id, spec.role.name);
                report.generation_error = Some(e.to_string());
                GeneratedVoice {
                    report,
                    timeline: None,
                }
            }
        }
    }

    /// Summary of a generation-only run.
    pub fn summarize(&self, score: &GeneratedScore) -> CompositionReport {
        CompositionReport {
            title: self.config.title.clone(),
            tempo: self.config.tempo,
            total_beats: score.total_length,
            voices: score.voices.iter().map(|v| v.report.clone()).collect(),
            tempo_error: None,
            dispatched: false,
        }
    }

    /// Send a generated score to `host`.
    pub fn dispatch(
        &self,
        host: &dyn SequencerInterface,
        score: &GeneratedScore,
        cancel: &CancelToken,
    ) -> ScoreResult<CompositionReport> {
        let dispatcher =
            BatchedDispatcher::new(host, self.config.dispatch.clone())?.with_cancel(cancel.clone());
        let mut report = self.summarize(score);
        report.dispatched = true;

        let mut session_rng = CanonRng::new(self.config.dispatch.seed).fork(SESSION_STREAM);
        let (tempo, _) = dispatcher.with_retry("set_tempo", &mut session_rng, || {
            host.set_tempo(self.config.tempo)
        });
        if let Err(e) = tempo {
            error!("tempo {} BPM not applied: {e}", self.config.tempo);
            report.tempo_error = Some(e.to_string());
        }

        let outcomes: Vec<Option<(DispatchReport, Option<String>)>> = thread::scope(|scope| {
            let handles: Vec<_> = score
                .voices
                .iter()
                .zip(&self.config.voices)
                .enumerate()
                .map(|(index, (generated, spec))| {
                    let dispatcher = &dispatcher;
                    generated.timeline.as_ref().map(|timeline| {
                        scope.spawn(move || {
                            self.dispatch_voice(
                                dispatcher,
                                host,
                                index as u32,
                                spec,
                                timeline,
                                score.total_length,
                            )
                        })
                    })
                })
                .collect();
            handles
                .into_iter()
                .map(|handle| {
                    handle.map(|h| {
                        h.join().unwrap_or_else(|_| {
                            (
                                DispatchReport {
                                    aborted: Some("dispatch thread panicked".into()),
                                    ..DispatchReport::default()
                                },
                                None,
                            )
                        })
                    })
                })
                .collect()
        });

        for (voice, outcome) in report.voices.iter_mut().zip(outcomes) {
            let Some((dispatch, playback)) = outcome else {
                continue;
            };
            if self.config.fire_clips && dispatch.is_complete() {
                voice.fired = playback.is_none();
                voice.playback_error = playback;
            }
            voice.dispatch = Some(dispatch);
        }

        info!(
            "dispatched {}/{} events ({} retries)",
            report.total_confirmed(),
            report.total_generated(),
            report.total_retries()
        );
        Ok(report)
    }

    /// Generate, then dispatch to `host`.
    pub fn run(
        &self,
        host: &dyn SequencerInterface,
        cancel: &CancelToken,
    ) -> ScoreResult<CompositionReport> {
        let score = self.generate()?;
        info!(
            "generated {} events across {} voices",
            score.total_events(),
            score.voices.len()
        );
        self.dispatch(host, &score, cancel)
    }

    /// Set up the voice's track and clip, send its timeline, launch the clip.
    /// Returns the dispatch report and, if launching failed, why.
    fn dispatch_voice(
        &self,
        dispatcher: &BatchedDispatcher<'_>,
        host: &dyn SequencerInterface,
        index: u32,
        spec: &VoiceSpec,
        timeline: &Timeline,
        length: f64,
    ) -> (DispatchReport, Option<String>) {
        let voice = spec.role.id;
        let unsent = || {
            partition(&timeline.events, self.config.dispatch.batch_size)
                .iter()
                .map(|b| b.sequence)
                .collect()
        };

        let mut rng = dispatcher.rng_for(voice);
        let mut tally = SetupTally::default();
        if dispatcher.is_cancelled() {
            warn!("{voice}: cancelled before setup");
            let report = DispatchReport {
                cancelled: true,
                unsent_batches: unsent(),
                ..DispatchReport::for_voice(voice, timeline.len())
            };
            return (report, None);
        }

        let setup = self.setup_voice(dispatcher, host, index, spec, length, &mut rng, &mut tally);
        let target = match setup {
            Ok(target) => target,
            Err(e) => {
                error!("{voice} '{}': setup failed: {e}", spec.role.name);
                let report = DispatchReport {
                    attempts: tally.attempts,
                    retries: tally.retries,
                    unsent_batches: unsent(),
                    aborted: Some(format!("setup failed: {e}")),
                    ..DispatchReport::for_voice(voice, timeline.len())
                };
                return (report, None);
            }
        };

        let mut report = dispatcher.dispatch(&target, &timeline.events);
        report.attempts += tally.attempts;
        report.retries += tally.retries;

        let mut playback = None;
        if self.config.fire_clips && report.is_complete() {
            let fired = retried(dispatcher, "fire_clip", &mut rng, &mut tally, || {
                host.fire_clip(target.track, target.clip)
            });
            match fired {
                Ok(()) => debug!("{voice}: clip {} playing", target.clip),
                Err(e) => {
                    error!("{voice}: clip {} not launched: {e}", target.clip);
                    playback = Some(e.to_string());
                }
            }
        }
        (report, playback)
    }

    #[allow(clippy::too_many_arguments)]
    fn setup_voice(
        &self,
        dispatcher: &BatchedDispatcher<'_>,
        host: &dyn SequencerInterface,
        index: u32,
        spec: &VoiceSpec,
        length: f64,
        rng: &mut CanonRng,
        tally: &mut SetupTally,
    ) -> SequencerResult<DispatchTarget> {
        let name = spec.role.name.as_str();
        let track = retried(dispatcher, "create_track", rng, tally, || host.create_track(index))?;
        retried(dispatcher, "name_track", rng, tally, || host.name_track(track, name))?;
        retried(dispatcher, "load_instrument", rng, tally, || {
            host.load_instrument(track, &spec.instrument)
        })?;
        let clip = retried(dispatcher, "create_clip", rng, tally, || {
            host.create_clip(track, self.config.clip_slot, length)
        })?;
        retried(dispatcher, "name_clip", rng, tally, || host.name_clip(clip, &self.config.title))?;
        debug!("{} '{name}': track {track}, clip {clip}", spec.role.id);
        Ok(DispatchTarget {
            voice: spec.role.id,
            track,
            clip,
        })
    }

    /// Timelines paired with their voice names and programs, for MIDI export.
    pub fn midi_parts<'a>(&'a self, score: &'a GeneratedScore) -> Vec<MidiPart<'a>> {
        score
            .voices
            .iter()
            .zip(&self.config.voices)
            .filter_map(|(generated, spec)| {
                generated.timeline.as_ref().map(|timeline| MidiPart {
                    name: &spec.role.name,
                    program: spec.midi_program,
                    timeline,
                })
            })
            .collect()
    }
}

fn retried<T>(
    dispatcher: &BatchedDispatcher<'_>,
    what: &str,
    rng: &mut CanonRng,
    tally: &mut SetupTally,
    call: impl FnMut() -> SequencerResult<T>,
) -> SequencerResult<T> {
    let (result, attempts) = dispatcher.with_retry(what, rng, call);
    tally.attempts += attempts;
    tally.retries += attempts.saturating_sub(1);
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use spiral_canon_music::canon::CanonOptions;
    use spiral_canon_music::section::SectionKind;
    use spiral_canon_music::voice::VoiceSectionPlan;
    use spiral_canon_music::NoteKey;
    use spiral_canon_sequencer::SimulatedSequencer;
    use std::collections::BTreeSet;

    fn orchestrator() -> CompositionOrchestrator {
        let mut config = CompositionConfig::default();
        config.dispatch.backoff_base_ms = 1;
        config.dispatch.backoff_cap_ms = 2;
        CompositionOrchestrator::new(config).unwrap()
    }

    #[test]
    fn generation_is_deterministic_across_runs() {
        let o = orchestrator();
        let a = o.generate().unwrap();
        let b = o.generate().unwrap();
        assert_eq!(a.voices.len(), 6);
        for (x, y) in a.voices.iter().zip(&b.voices) {
            assert_eq!(x.timeline, y.timeline);
        }
        assert!(a.failed_voices().next().is_none());
        assert_eq!(a.total_length, 96.0);
    }

    #[test]
    fn per_section_counts_add_up() {
        let score = orchestrator().generate().unwrap();
        for v in &score.voices {
            let sum: usize = v.report.per_section.iter().map(|(_, n)| n).sum();
            assert_eq!(sum, v.report.generated_events, "{}", v.report.name);
            assert_eq!(v.report.per_section.len(), 3);
        }
    }

    #[test]
    fn invalid_config_is_rejected_up_front() {
        let mut config = CompositionConfig::default();
        config.tempo = 0.0;
        assert!(CompositionOrchestrator::new(config).is_err());
    }

    #[test]
    fn a_failing_voice_does_not_stop_the_others() {
        let mut config = CompositionConfig::default();
        config.voices[2].plans.insert(
            SectionKind::Development,
            VoiceSectionPlan {
                canon: CanonOptions {
                    rate: Some(0.0),
                    ..Default::default()
                },
                muted: false,
            },
        );
        let o = CompositionOrchestrator::new(config).unwrap();
        let score = o.generate().unwrap();
        let failed: Vec<_> = score.failed_voices().map(|v| v.report.voice).collect();
        assert_eq!(failed, vec![o.config.voices[2].role.id]);
        let message = score.voices[2].report.generation_error.as_deref().unwrap();
        assert!(message.contains("rate"), "{message}");
        assert!(score.voices[2].timeline.is_none());

        let host = SimulatedSequencer::reliable();
        let report = o.dispatch(&host, &score, &CancelToken::new()).unwrap();
        assert!(!report.is_complete());
        assert_eq!(host.track_count(), 5);
        assert!(report.voices[2].dispatch.is_none());
        assert!(report.voices[2].generation_error.is_some());
    }

    #[test]
    fn reliable_host_receives_the_whole_score() {
        let o = orchestrator();
        let host = SimulatedSequencer::reliable();
        let report = o.run(&host, &CancelToken::new()).unwrap();
        assert!(report.is_complete(), "{report}");
        assert_eq!(host.tempo(), Some(120.0));
        assert_eq!(host.track_count(), 6);
        assert_eq!(host.total_notes(), report.total_generated());
        assert_eq!(host.fired_clips().len(), 6);
        assert!(report.voices.iter().all(|v| v.fired));

        let keys: BTreeSet<NoteKey> = host
            .fired_clips()
            .into_iter()
            .flat_map(|clip| host.notes(clip))
            .map(|e| e.key())
            .collect();
        assert_eq!(keys.len(), report.total_generated());
    }

    #[test]
    fn cancelled_run_sends_nothing() {
        let o = orchestrator();
        let host = SimulatedSequencer::reliable();
        let cancel = CancelToken::new();
        cancel.cancel();
        let report = o.run(&host, &cancel).unwrap();
        assert!(!report.is_complete());
        assert_eq!(host.total_notes(), 0);
        assert!(report.voices.iter().all(|v| v.dispatch.as_ref().is_some_and(|d| d.cancelled)));
        assert!(host.fired_clips().is_empty());
    }

    #[test]
    fn clips_stay_silent_when_firing_is_off() {
        let mut config = CompositionConfig::default();
        config.fire_clips = false;
        let o = CompositionOrchestrator::new(config).unwrap();
        let host = SimulatedSequencer::reliable();
        let report = o.run(&host, &CancelToken::new()).unwrap();
        assert!(report.is_complete());
        assert!(host.fired_clips().is_empty());
    }

    #[test]
    fn clip_length_matches_the_timeline() {
        let o = orchestrator();
        let host = SimulatedSequencer::reliable();
        o.run(&host, &CancelToken::new()).unwrap();
        for clip in host.fired_clips() {
            let (_, slot, length) = host.clip_layout(clip).unwrap();
            assert_eq!(slot, 0);
            assert_eq!(length, 96.0);
        }
    }
}
