// Timeline composition: independent section scores -> one gapless timeline
// per voice.
//
// Section boundaries are fixed configuration. Offsets are the running sum of
// section durations (`offset[i] = sum(duration[..i])`), and each section's
// events are shifted by a pure addition to `start`. Sections are never
// reordered, interleaved, or overlap-detected; tails of sustained notes may
// ring into the next section.
//
// Integrity is checked while composing and any violation rejects the voice
// with `ScoreError::CompositionIntegrity` naming the section and index:
// - an event whose `voice` is not the voice being composed,
// - an event starting outside `[0, duration)` of its own section,
// - a non-positive duration or out-of-range velocity,
// - two events sharing `(voice, start, pitch)` on the final timeline.
// All of these are generator defects; nothing here tries to repair them.

use std::collections::{BTreeMap, BTreeSet};
use std::ops::Range;

use crate::error::{ScoreError, ScoreResult};
use crate::event::{NoteEvent, NoteKey, VoiceId};
use crate::section::SectionSpec;

/// One section's events, keyed by voice.
pub type SectionEvents = BTreeMap<VoiceId, Vec<NoteEvent>>;

/// One voice's composed score.
#[derive(Debug, Clone, PartialEq)]
pub struct Timeline {
    pub voice: VoiceId,
    pub events: Vec<NoteEvent>,
    /// Index range of `events` contributed by each section.
    pub sections: Vec<Range<usize>>,
    /// Total length in beats (sum of section durations).
    pub length: f64,
}

impl Timeline {
    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn section_events(&self, section: usize) -> &[NoteEvent] {
        self.sections
            .get(section)
            .map_or(&[][..], |range| &self.events[range.clone()])
    }
}

#[derive(Debug, Clone)]
pub struct TimelineCompositor {
    durations: Vec<f64>,
}

impl TimelineCompositor {
    pub fn new(durations: Vec<f64>) -> ScoreResult<Self> {
        if durations.is_empty() {
            return Err(ScoreError::config("timeline needs at least one section"));
        }
        for (i, d) in durations.iter().enumerate() {
            if !(d.is_finite() && *d > 0.0) {
                return Err(ScoreError::config(format!(
                    "section {i} duration must be > 0 beats, got {d}"
                )));
            }
        }
        Ok(Self { durations })
    }

    pub fn from_sections(sections: &[SectionSpec]) -> ScoreResult<Self> {
        Self::new(sections.iter().map(|s| s.duration).collect())
    }

    pub fn durations(&self) -> &[f64] {
        &self.durations
    }

    /// Start of each section on the timeline.
    pub fn offsets(&self) -> Vec<f64> {
        let mut acc = 0.0;
        self.durations
            .iter()
            .map(|d| {
                let offset = acc;
                acc += d;
                offset
            })
            .collect()
    }

    pub fn total_length(&self) -> f64 {
        self.durations.iter().sum()
    }

    /// Compose one voice from its per-section events (section-relative).
    pub fn compose_voice(
        &self,
        voice: VoiceId,
        sections: &[&[NoteEvent]],
    ) -> ScoreResult<Timeline> {
        if sections.len() != self.durations.len() {
            return Err(ScoreError::config(format!(
                "voice {voice}: got {} sections of events for {} section durations",
                sections.len(),
                self.durations.len()
            )));
        }

        let total: usize = sections.iter().map(|s| s.len()).sum();
        let mut events = Vec::with_capacity(total);
        let mut ranges = Vec::with_capacity(sections.len());
        let mut seen: BTreeSet<NoteKey> = BTreeSet::new();

        for (section, ((section_events, offset), duration)) in sections
            .iter()
            .zip(self.offsets())
            .zip(&self.durations)
            .enumerate()
        {
            let first = events.len();
            for (index, event) in section_events.iter().enumerate() {
                let fail = |reason: String| ScoreError::CompositionIntegrity {
                    voice,
                    section,
                    index,
                    start: event.start,
                    pitch: event.pitch,
                    reason,
                };
                if event.voice != voice {
                    return Err(fail(format!("event belongs to voice {}", event.voice)));
                }
                if !(event.start.is_finite() && event.start >= 0.0 && event.start < *duration) {
                    return Err(fail(format!("start outside section window [0, {duration})")));
                }
                if !(event.duration.is_finite() && event.duration > 0.0) {
                    return Err(fail(format!("non-positive duration {}", event.duration)));
                }
                if !(1..=127).contains(&event.velocity) || event.pitch > 127 {
                    return Err(fail("velocity or pitch out of MIDI range".into()));
                }
                let shifted = event.shifted(offset);
                if !seen.insert(shifted.key()) {
                    return Err(fail(format!(
                        "collides with an earlier event at timeline beat {}",
                        shifted.start
                    )));
                }
                events.push(shifted);
            }
            ranges.push(first..events.len());
        }

        Ok(Timeline {
            voice,
            events,
            sections: ranges,
            length: self.total_length(),
        })
    }

    /// Compose every voice that appears in any section. A voice missing from
    /// a section contributes nothing there.
    pub fn compose(&self, sections: &[SectionEvents]) -> ScoreResult<BTreeMap<VoiceId, Timeline>> {
        let voices: BTreeSet<VoiceId> = sections.iter().flat_map(|s| s.keys().copied()).collect();
        voices
            .into_iter()
            .map(|voice| {
                let per_section: Vec<&[NoteEvent]> = sections
                    .iter()
                    .map(|s| s.get(&voice).map_or(&[][..], Vec::as_slice))
                    .collect();
                self.compose_voice(voice, &per_section).map(|t| (voice, t))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ev(voice: u32, start: f64, pitch: u8) -> NoteEvent {
        NoteEvent {
            voice: VoiceId(voice),
            pitch,
            start,
            duration: 1.0,
            velocity: 80,
            muted: false,
        }
    }

    fn section(events: Vec<NoteEvent>) -> SectionEvents {
        let mut map = SectionEvents::new();
        for e in events {
            map.entry(e.voice).or_default().push(e);
        }
        map
    }

    #[test]
    fn offsets_are_cumulative() {
        let c = TimelineCompositor::new(vec![32.0, 32.0, 32.0]).unwrap();
        assert_eq!(c.offsets(), vec![0.0, 32.0, 64.0]);
        assert_eq!(c.total_length(), 96.0);
        let uneven = TimelineCompositor::new(vec![16.0, 24.0, 8.0]).unwrap();
        assert_eq!(uneven.offsets(), vec![0.0, 16.0, 40.0]);
    }

    #[test]
    fn sections_land_at_their_offsets() {
        let c = TimelineCompositor::new(vec![32.0, 32.0, 32.0]).unwrap();
        let sections = vec![
            section(vec![ev(0, 4.0, 60)]),
            section(vec![ev(0, 0.0, 62)]),
            section(vec![ev(0, 0.0, 60)]),
        ];
        let timelines = c.compose(&sections).unwrap();
        let t = &timelines[&VoiceId(0)];
        let starts: Vec<f64> = t.events.iter().map(|e| e.start).collect();
        assert_eq!(starts, vec![4.0, 32.0, 64.0]);
        assert_eq!(t.section_events(2)[0].start, 64.0);
        assert_eq!(t.section_events(1)[0].pitch, 62);
    }

    #[test]
    fn shift_touches_only_start() {
        let c = TimelineCompositor::new(vec![8.0, 8.0]).unwrap();
        let mut loud = ev(1, 3.0, 70);
        loud.velocity = 120;
        loud.duration = 9.5;
        loud.muted = true;
        let t = c
            .compose_voice(VoiceId(1), &[&[], std::slice::from_ref(&loud)])
            .unwrap();
        let out = &t.events[0];
        assert_eq!(out.start, 11.0);
        assert_eq!((out.pitch, out.velocity, out.duration, out.muted), (70, 120, 9.5, true));
    }

    #[test]
    fn within_section_order_is_preserved() {
        let c = TimelineCompositor::new(vec![8.0]).unwrap();
        let events = vec![ev(0, 1.0, 64), ev(0, 1.0, 60), ev(0, 2.0, 62)];
        let t = c.compose_voice(VoiceId(0), &[&events]).unwrap();
        let pitches: Vec<u8> = t.events.iter().map(|e| e.pitch).collect();
        assert_eq!(pitches, vec![64, 60, 62]);
    }

    #[test]
    fn duplicate_keys_are_rejected_with_location() {
        let c = TimelineCompositor::new(vec![8.0, 8.0]).unwrap();
        let first = vec![ev(0, 1.0, 60)];
        let second = vec![ev(0, 2.0, 60), ev(0, 2.0, 60)];
        let err = c.compose_voice(VoiceId(0), &[&first, &second]).unwrap_err();
        match err {
            ScoreError::CompositionIntegrity {
                voice,
                section,
                index,
                pitch,
                ..
            } => {
                assert_eq!((voice, section, index, pitch), (VoiceId(0), 1, 1, 60));
            }
            other => panic!("expected integrity error, got {other:?}"),
        }
    }

    #[test]
    fn events_outside_their_section_are_rejected() {
        let c = TimelineCompositor::new(vec![8.0, 8.0]).unwrap();
        // Would collide with section 1's beat 0 if it were allowed through.
        let late = vec![ev(0, 8.0, 60)];
        let err = c.compose_voice(VoiceId(0), &[&late, &[]]).unwrap_err();
        assert!(matches!(err, ScoreError::CompositionIntegrity { section: 0, index: 0, .. }));
    }

    #[test]
    fn foreign_voice_events_are_rejected() {
        let c = TimelineCompositor::new(vec![8.0]).unwrap();
        let events = vec![ev(1, 0.0, 60)];
        assert!(c.compose_voice(VoiceId(0), &[&events]).is_err());
    }

    #[test]
    fn missing_voice_in_a_section_is_empty() {
        let c = TimelineCompositor::new(vec![4.0, 4.0]).unwrap();
        let sections = vec![
            section(vec![ev(0, 0.0, 60), ev(1, 0.0, 60)]),
            section(vec![ev(0, 1.0, 60)]),
        ];
        let timelines = c.compose(&sections).unwrap();
        assert_eq!(timelines[&VoiceId(0)].len(), 2);
        assert_eq!(timelines[&VoiceId(1)].len(), 1);
        assert!(timelines[&VoiceId(1)].section_events(1).is_empty());
    }

    #[test]
    fn section_count_mismatch_is_a_configuration_error() {
        let c = TimelineCompositor::new(vec![4.0, 4.0]).unwrap();
        let err = c.compose_voice(VoiceId(0), &[&[]]).unwrap_err();
        assert!(matches!(err, ScoreError::Configuration(_)));
        assert!(TimelineCompositor::new(vec![4.0, 0.0]).is_err());
    }
}
