// Voice roles and per-voice static material.
//
// A `VoiceRole` is the identity of one instrumental part: where it sits in
// pitch, when it enters the canon, how it is transposed, and what texture it
// plays. Roles are built once at setup and never mutated.
//
// `VoiceSpec` bundles a role with the material the generator needs for it
// (subject, per-section canonic plan) and the host-facing details (track
// name, instrument reference, MIDI program for file export).

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::canon::{CanonOptions, Subject};
use crate::error::{ScoreError, ScoreResult};
use crate::event::VoiceId;
use crate::section::SectionKind;

/// How a voice's notes relate to one another.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Texture {
    /// One line; overlapping notes are truncated.
    Monophonic,
    /// Chords and sustained pads; overlaps are allowed.
    Polyphonic,
    /// Monophonic line that breaks into running figures where the density
    /// wave is high.
    Ornamental,
}

impl Texture {
    pub fn is_polyphonic(self) -> bool {
        matches!(self, Texture::Polyphonic)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VoiceRole {
    pub id: VoiceId,
    pub name: String,
    /// Semitones from the composition tonic.
    pub register_offset: i32,
    /// Beats after the section start at which this voice enters.
    pub canonic_entry_offset: f64,
    /// Semitones added to every subject pitch.
    pub transposition_interval: i32,
    pub texture: Texture,
    pub base_velocity: u8,
    /// Extra velocity at full density.
    pub velocity_range: u8,
}

impl VoiceRole {
    pub fn validate(&self) -> ScoreResult<()> {
        if self.name.trim().is_empty() {
            return Err(ScoreError::config(format!("voice {} has an empty name", self.id)));
        }
        if !(self.canonic_entry_offset.is_finite() && self.canonic_entry_offset >= 0.0) {
            return Err(ScoreError::config(format!(
                "voice '{}': canonic entry offset must be >= 0, got {}",
                self.name, self.canonic_entry_offset
            )));
        }
        if !(1..=127).contains(&self.base_velocity) {
            return Err(ScoreError::config(format!(
                "voice '{}': base velocity must be in 1..=127, got {}",
                self.name, self.base_velocity
            )));
        }
        if self.velocity_range > 126 {
            return Err(ScoreError::config(format!(
                "voice '{}': velocity range must be <= 126, got {}",
                self.name, self.velocity_range
            )));
        }
        Ok(())
    }
}

/// What one voice does in one section.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct VoiceSectionPlan {
    pub canon: CanonOptions,
    /// Events are still generated and sent, but flagged muted.
    pub muted: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VoiceSpec {
    pub role: VoiceRole,
    /// Host-side instrument reference (preset path or URI).
    pub instrument: String,
    /// General MIDI program used by the file export.
    #[serde(default)]
    pub midi_program: u8,
    pub subject: Subject,
    /// Sections without an entry use the default plan.
    #[serde(default)]
    pub plans: BTreeMap<SectionKind, VoiceSectionPlan>,
}

impl VoiceSpec {
    pub fn plan_for(&self, kind: SectionKind) -> VoiceSectionPlan {
        self.plans.get(&kind).cloned().unwrap_or_default()
    }

    pub fn validate(&self) -> ScoreResult<()> {
        self.role.validate()?;
        self.subject.validate()?;
        if self.midi_program > 127 {
            return Err(ScoreError::config(format!(
                "voice '{}': midi program must be <= 127",
                self.role.name
            )));
        }
        for (kind, plan) in &self.plans {
            plan.canon.validate().map_err(|e| {
                ScoreError::config(format!("voice '{}' in {kind}: {e}", self.role.name))
            })?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::canon::SubjectNote;

    fn spec() -> VoiceSpec {
        VoiceSpec {
            role: VoiceRole {
                id: VoiceId(0),
                name: "bass".into(),
                register_offset: -24,
                canonic_entry_offset: 0.0,
                transposition_interval: 0,
                texture: Texture::Monophonic,
                base_velocity: 70,
                velocity_range: 30,
            },
            instrument: "Bass/Sub.adg".into(),
            midi_program: 38,
            subject: Subject::new("root", vec![SubjectNote::new(0, 0.0, 2.0, 1.0)], 4.0),
            plans: BTreeMap::new(),
        }
    }

    #[test]
    fn missing_plan_defaults() {
        let s = spec();
        assert_eq!(s.plan_for(SectionKind::Development), VoiceSectionPlan::default());
    }

    #[test]
    fn validation_catches_bad_role_fields() {
        assert!(spec().validate().is_ok());

        let mut s = spec();
        s.role.base_velocity = 0;
        assert!(s.validate().is_err());

        let mut s = spec();
        s.role.canonic_entry_offset = -1.0;
        assert!(s.validate().is_err());

        let mut s = spec();
        s.plans.insert(
            SectionKind::Culmination,
            VoiceSectionPlan {
                canon: CanonOptions {
                    rate: Some(0.0),
                    ..Default::default()
                },
                muted: false,
            },
        );
        assert!(s.validate().is_err());
    }

    #[test]
    fn plans_roundtrip_through_json() {
        let mut s = spec();
        s.plans.insert(
            SectionKind::Development,
            VoiceSectionPlan {
                canon: CanonOptions {
                    rate: Some(2.0),
                    inversion_axis: Some(5),
                    retrograde: true,
                },
                muted: true,
            },
        );
        let json = serde_json::to_string(&s).unwrap();
        let back: VoiceSpec = serde_json::from_str(&json).unwrap();
        assert_eq!(back, s);
    }
}
