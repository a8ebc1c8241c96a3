// Canonic transformations of a subject.
//
// A `Subject` is one canonic theme: pitch offsets (semitones from the voice's
// register) with relative start, duration, and velocity. A `CanonLine` is a
// subject in flight, carrying its cycle window `[origin, origin + cycle]` so
// the generator knows how to tile it across a section.
//
// `CanonTransformer::derive` applies the operations in one fixed order:
//   1. transposition   (+ role.transposition_interval)
//   2. time shift      (+ role.canonic_entry_offset)
//   3. augmentation / diminution (start and duration * rate)
//   4. inversion       (pitch -> 2 * axis - pitch)
//   5. retrograde      (reflect inside the cycle window)
// The order is not configurable: scaling after the shift stretches the entry
// offset too, and the retrograde window depends on both. Only the optional
// steps (3-5) can be switched on or off.
//
// Notes are kept in canonical order (start, pitch, duration) after every
// step. That is what makes retrograde an exact involution.

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};

use crate::error::{ScoreError, ScoreResult};
use crate::voice::VoiceRole;

/// Shortest subject cycle accepted, in beats.
pub const MIN_CYCLE: f64 = 0.25;

/// One note of a subject, relative to the subject's start.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubjectNote {
    /// Semitones above the voice's register.
    pub pitch: i32,
    pub start: f64,
    pub duration: f64,
    /// Multiplier on the voice's base velocity.
    pub velocity: f64,
}

impl SubjectNote {
    pub fn new(pitch: i32, start: f64, duration: f64, velocity: f64) -> Self {
        Self {
            pitch,
            start,
            duration,
            velocity,
        }
    }

    pub fn end(&self) -> f64 {
        self.start + self.duration
    }
}

fn note_cmp(a: &SubjectNote, b: &SubjectNote) -> Ordering {
    a.start
        .total_cmp(&b.start)
        .then(a.pitch.cmp(&b.pitch))
        .then(a.duration.total_cmp(&b.duration))
}

/// A canonic theme.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Subject {
    pub name: String,
    pub notes: Vec<SubjectNote>,
    /// Length of one statement in beats, including any trailing rest.
    pub cycle: f64,
}

impl Subject {
    pub fn new(name: impl Into<String>, mut notes: Vec<SubjectNote>, cycle: f64) -> Self {
        notes.sort_by(note_cmp);
        Self {
            name: name.into(),
            notes,
            cycle,
        }
    }

    /// Latest end time of any note.
    pub fn total_duration(&self) -> f64 {
        self.notes.iter().map(SubjectNote::end).fold(0.0, f64::max)
    }

    pub fn validate(&self) -> ScoreResult<()> {
        if self.notes.is_empty() {
            return Err(ScoreError::config(format!("subject '{}' has no notes", self.name)));
        }
        for (i, note) in self.notes.iter().enumerate() {
            if !(note.start.is_finite() && note.start >= 0.0) {
                return Err(ScoreError::config(format!(
                    "subject '{}' note {i}: start must be >= 0, got {}",
                    self.name, note.start
                )));
            }
            if !(note.duration.is_finite() && note.duration > 0.0) {
                return Err(ScoreError::config(format!(
                    "subject '{}' note {i}: duration must be > 0, got {}",
                    self.name, note.duration
                )));
            }
            if !(note.velocity.is_finite() && note.velocity > 0.0) {
                return Err(ScoreError::config(format!(
                    "subject '{}' note {i}: relative velocity must be > 0, got {}",
                    self.name, note.velocity
                )));
            }
        }
        if !(self.cycle.is_finite() && self.cycle >= MIN_CYCLE) {
            return Err(ScoreError::config(format!(
                "subject '{}': cycle must be >= {MIN_CYCLE} beats, got {}",
                self.name, self.cycle
            )));
        }
        if self.cycle + 1e-9 < self.total_duration() {
            return Err(ScoreError::config(format!(
                "subject '{}': cycle {} is shorter than its notes ({})",
                self.name,
                self.cycle,
                self.total_duration()
            )));
        }
        Ok(())
    }
}

/// A subject after zero or more canonic operations.
#[derive(Debug, Clone, PartialEq)]
pub struct CanonLine {
    pub notes: Vec<SubjectNote>,
    /// Start of the cycle window.
    pub origin: f64,
    /// Width of the cycle window; the line repeats every `cycle` beats.
    pub cycle: f64,
    /// Sounding length from `origin` to the latest note end; retrograde
    /// mirrors inside `[origin, origin + span]`.
    pub span: f64,
}

impl CanonLine {
    pub fn from_subject(subject: &Subject) -> Self {
        Self {
            notes: subject.notes.clone(),
            origin: 0.0,
            cycle: subject.cycle,
            span: subject.total_duration(),
        }
    }

    fn with_notes(self, mut notes: Vec<SubjectNote>) -> Self {
        notes.sort_by(note_cmp);
        Self { notes, ..self }
    }

    pub fn transpose(self, semitones: i32) -> Self {
        let notes = self
            .notes
            .iter()
            .map(|n| SubjectNote {
                pitch: n.pitch + semitones,
                ..n.clone()
            })
            .collect();
        self.with_notes(notes)
    }

    pub fn shift(self, offset: f64) -> Self {
        let notes = self
            .notes
            .iter()
            .map(|n| SubjectNote {
                start: n.start + offset,
                ..n.clone()
            })
            .collect();
        Self {
            origin: self.origin + offset,
            ..self.with_notes(notes)
        }
    }

    /// Multiply every start and duration (and the window) by `rate`.
    /// `rate > 1` augments, `0 < rate < 1` diminishes.
    pub fn scale_time(self, rate: f64) -> ScoreResult<Self> {
        check_rate(rate)?;
        let notes = self
            .notes
            .iter()
            .map(|n| SubjectNote {
                start: n.start * rate,
                duration: n.duration * rate,
                ..n.clone()
            })
            .collect();
        let (origin, cycle, span) = (self.origin * rate, self.cycle * rate, self.span * rate);
        Ok(Self {
            origin,
            cycle,
            span,
            ..self.with_notes(notes)
        })
    }

    /// Reflect pitches around `axis`.
    pub fn invert(self, axis: i32) -> Self {
        let notes = self
            .notes
            .iter()
            .map(|n| SubjectNote {
                pitch: 2 * axis - n.pitch,
                ..n.clone()
            })
            .collect();
        self.with_notes(notes)
    }

    /// Play the line backwards.
    ///
    /// Each note is mirrored so that `start' = 2 * origin + span - end`;
    /// with the line at 0 that is `total_duration - end`.
    pub fn retrograde(self) -> Self {
        let pivot = 2.0 * self.origin + self.span;
        let notes = self
            .notes
            .iter()
            .rev()
            .map(|n| SubjectNote {
                start: pivot - n.end(),
                ..n.clone()
            })
            .collect();
        self.with_notes(notes)
    }
}

fn check_rate(rate: f64) -> ScoreResult<()> {
    if rate == 0.0 {
        return Err(ScoreError::config("canonic rate 0 would collapse the line"));
    }
    if !(rate.is_finite() && rate > 0.0) {
        return Err(ScoreError::config(format!(
            "canonic rate must be finite and > 0, got {rate}"
        )));
    }
    Ok(())
}

/// Which optional operations to apply for one voice in one section.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CanonOptions {
    /// Augmentation (> 1) or diminution (< 1).
    pub rate: Option<f64>,
    /// Inversion axis in semitones relative to the voice register.
    pub inversion_axis: Option<i32>,
    pub retrograde: bool,
}

impl CanonOptions {
    pub fn validate(&self) -> ScoreResult<()> {
        if let Some(rate) = self.rate {
            check_rate(rate)?;
        }
        Ok(())
    }
}

/// Derives a voice's line from a subject.
#[derive(Debug, Clone)]
pub struct CanonTransformer {
    options: CanonOptions,
}

impl CanonTransformer {
    pub fn new(options: CanonOptions) -> ScoreResult<Self> {
        options.validate()?;
        Ok(Self { options })
    }

    pub fn options(&self) -> &CanonOptions {
        &self.options
    }

    pub fn derive(&self, subject: &Subject, role: &VoiceRole) -> ScoreResult<CanonLine> {
        let mut line = CanonLine::from_subject(subject)
            .transpose(role.transposition_interval)
            .shift(role.canonic_entry_offset);
        if let Some(rate) = self.options.rate {
            line = line.scale_time(rate)?;
        }
        if let Some(axis) = self.options.inversion_axis {
            line = line.invert(axis);
        }
        if self.options.retrograde {
            line = line.retrograde();
        }
        Ok(line)
    }
}
