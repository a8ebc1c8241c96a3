// Note events and their identity keys.
//
// A `NoteEvent` is the unit that flows through the whole pipeline: produced
// by the voice generator (section-relative times), shifted by the timeline
// compositor (timeline-relative times), batched by the dispatcher, and
// finally inserted into the host sequencer. Events are immutable values;
// every stage builds new vectors instead of mutating in place.
//
// Times are in beats (quarter notes). Identity is the `NoteKey`:
// `(voice, tick, pitch)` with `tick = round(start * TICKS_PER_BEAT)`. The key
// is what the compositor checks for collisions and what the dispatcher and
// host use for idempotent insertion.

use std::cmp::Ordering;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Resolution at which start times are compared for identity.
pub const TICKS_PER_BEAT: f64 = 960.0;

/// Identity of one instrumental part.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct VoiceId(pub u32);

impl fmt::Display for VoiceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.0)
    }
}

/// Quantize a beat position to the identity grid.
pub fn tick_of(beats: f64) -> i64 {
    (beats * TICKS_PER_BEAT).round() as i64
}

/// Dedup / idempotency key of a note: unique per voice after composition.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NoteKey {
    pub voice: VoiceId,
    pub tick: i64,
    pub pitch: u8,
}

/// One timed note of one voice.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NoteEvent {
    pub voice: VoiceId,
    /// MIDI note number (0-127).
    pub pitch: u8,
    /// Start in beats, section-relative before composition and
    /// timeline-relative after.
    pub start: f64,
    /// Length in beats, always > 0.
    pub duration: f64,
    /// MIDI velocity (1-127).
    pub velocity: u8,
    pub muted: bool,
}

impl NoteEvent {
    pub fn key(&self) -> NoteKey {
        NoteKey {
            voice: self.voice,
            tick: tick_of(self.start),
            pitch: self.pitch,
        }
    }

    pub fn end(&self) -> f64 {
        self.start + self.duration
    }

    /// A copy moved later by `offset` beats. Nothing but `start` changes.
    pub fn shifted(&self, offset: f64) -> NoteEvent {
        NoteEvent {
            start: self.start + offset,
            ..self.clone()
        }
    }
}

/// Canonical event order: start, then pitch, then duration.
pub fn canonical_cmp(a: &NoteEvent, b: &NoteEvent) -> Ordering {
    a.start
        .total_cmp(&b.start)
        .then(a.pitch.cmp(&b.pitch))
        .then(a.duration.total_cmp(&b.duration))
}
