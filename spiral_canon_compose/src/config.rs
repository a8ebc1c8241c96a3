// Composition configuration.
//
// One JSON document describes a whole run: tempo and tonic, the spiral
// constants, the ordered sections, the voices with their subjects and
// per-section canonic plans, and the dispatch policy. Missing fields fall
// back to the reference composition, so `{}` is a valid config and
// `{"tempo": 96}` changes only the tempo.
//
// `validate` covers what the whole run depends on (tempo, spiral, sections,
// voice ids, dispatch) and is called before anything is generated. A voice's
// own role, subject, and canonic plans are checked when that voice is
// generated, so a bad voice fails alone. Every violation is a
// `ScoreError::Configuration` naming the offending field.

use std::collections::BTreeSet;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use spiral_canon_music::material::{
    REFERENCE_TEMPO, REFERENCE_TONIC, reference_sections, reference_voices,
};
use spiral_canon_music::section::validate_section_order;
use spiral_canon_music::{ScoreError, ScoreResult, SectionSpec, SpiralModel, VoiceSpec};
use spiral_canon_sequencer::DispatchConfig;

use crate::error::{ComposeError, ComposeResult};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompositionConfig {
    pub title: String,
    /// Beats per minute.
    pub tempo: f64,
    /// MIDI note the voices' register offsets are measured from.
    pub tonic: u8,
    pub spiral: SpiralModel,
    /// In form order: Exposition, Development, Culmination.
    pub sections: Vec<SectionSpec>,
    pub voices: Vec<VoiceSpec>,
    pub dispatch: DispatchConfig,
    /// Clip slot used on every track.
    pub clip_slot: u32,
    /// Launch each voice's clip once its notes are in.
    pub fire_clips: bool,
}

impl Default for CompositionConfig {
    fn default() -> Self {
        let spiral = SpiralModel::default();
        let voices = reference_voices(&spiral);
        Self {
            title: "Spiral Canon".into(),
            tempo: REFERENCE_TEMPO,
            tonic: REFERENCE_TONIC,
            spiral,
            sections: reference_sections(),
            voices,
            dispatch: DispatchConfig::default(),
            clip_slot: 0,
            fire_clips: true,
        }
    }
}

impl CompositionConfig {
    pub fn from_json(json: &str) -> ComposeResult<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn load(path: &Path) -> ComposeResult<Self> {
        let json = fs::read_to_string(path).map_err(|source| ComposeError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json(&json)
    }

    pub fn to_json_pretty(&self) -> ComposeResult<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Total length of the piece in beats.
    pub fn total_beats(&self) -> f64 {
        self.sections.iter().map(|s| s.duration).sum()
    }

    /// Run-wide checks. Per-voice settings are left to generation.
    pub fn validate(&self) -> ScoreResult<()> {
        if !(self.tempo.is_finite() && self.tempo > 0.0) {
            return Err(ScoreError::config(format!("tempo must be > 0 BPM, got {}", self.tempo)));
        }
        if self.tonic > 127 {
            return Err(ScoreError::config(format!(
                "tonic must be a MIDI note, got {}",
                self.tonic
            )));
        }
        self.spiral.validate()?;
        validate_section_order(&self.sections)?;
        for section in &self.sections {
            section.validate()?;
        }
        if self.voices.is_empty() {
            return Err(ScoreError::config("a composition needs at least one voice"));
        }
        let mut ids = BTreeSet::new();
        for voice in &self.voices {
            if !ids.insert(voice.role.id) {
                return Err(ScoreError::config(format!(
                    "voice id {} is used more than once",
                    voice.role.id
                )));
            }
        }
        self.dispatch.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_is_the_valid_reference_composition() {
        let config = CompositionConfig::default();
        config.validate().unwrap();
        assert_eq!(config.voices.len(), 6);
        assert_eq!(config.sections.len(), 3);
        assert_eq!(config.total_beats(), 96.0);
        assert_eq!(config.dispatch.batch_size, 30);
    }

    #[test]
    fn json_roundtrip_preserves_everything() {
        let config = CompositionConfig::default();
        let json = config.to_json_pretty().unwrap();
        let back = CompositionConfig::from_json(&json).unwrap();
        assert_eq!(back, config);
    }

    #[test]
    fn partial_json_falls_back_to_defaults() {
        let json = r#"{"tempo": 96, "dispatch": {"batch_size": 12}}"#;
        let config = CompositionConfig::from_json(json).unwrap();
        assert_eq!(config.tempo, 96.0);
        assert_eq!(config.dispatch.batch_size, 12);
        assert_eq!(config.dispatch.max_retries, 8);
        assert_eq!(config.voices.len(), 6);
        config.validate().unwrap();
    }

    #[test]
    fn zero_growth_section_is_rejected() {
        let mut config = CompositionConfig::default();
        config.sections[1].growth = 0.0;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("circle"), "{err}");
    }

    #[test]
    fn duplicate_voice_ids_are_rejected() {
        let mut config = CompositionConfig::default();
        config.voices[3].role.id = config.voices[0].role.id;
        assert!(config.validate().is_err());
    }

    #[test]
    fn a_bad_voice_plan_is_not_a_run_wide_error() {
        let mut config = CompositionConfig::default();
        config.voices[2].subject.notes.clear();
        config.validate().unwrap();
        assert!(config.voices[2].validate().is_err());
    }

    #[test]
    fn malformed_json_is_a_json_error() {
        let err = CompositionConfig::from_json("{tempo: fast}").unwrap_err();
        assert!(matches!(err, ComposeError::Json(_)));
    }

    #[test]
    fn missing_file_names_the_path() {
        let err = CompositionConfig::load(Path::new("/nonexistent/spiral.json")).unwrap_err();
        assert!(err.to_string().contains("/nonexistent/spiral.json"));
    }
}
