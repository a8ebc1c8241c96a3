// Error taxonomy for score generation and composition.
//
// Both variants are fatal for the voice they concern: a configuration error
// aborts generation before anything is dispatched, and an integrity error
// means the generator produced colliding events (a logic defect, never a
// runtime condition to recover from).

use thiserror::Error;

use crate::event::VoiceId;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ScoreError {
    /// Invalid spiral, canonic, section, or voice parameters.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Two events of one voice share `(start, pitch)`, or an event lies
    /// outside its section window.
    #[error(
        "composition integrity error in voice {voice} at section {section}, event {index} \
         (start {start}, pitch {pitch}): {reason}"
    )]
    CompositionIntegrity {
        voice: VoiceId,
        section: usize,
        index: usize,
        start: f64,
        pitch: u8,
        reason: String,
    },
}

impl ScoreError {
    pub fn config(message: impl Into<String>) -> Self {
        ScoreError::Configuration(message.into())
    }
}

pub type ScoreResult<T> = Result<T, ScoreError>;
