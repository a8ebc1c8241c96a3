// Error type for loading configuration and running the CLI.
//
// Generation and dispatch failures are not errors at this level: the
// orchestrator records them per voice in the report. `ComposeError` covers
// what stops a run before it starts (unreadable or invalid configuration,
// an unreachable remote host) and output failures (MIDI file writes).

use std::io;
use std::path::PathBuf;

use spiral_canon_music::ScoreError;
use spiral_canon_sequencer::SequencerError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ComposeError {
    #[error("cannot read {path}: {source}")]
    Read { path: PathBuf, source: io::Error },
    #[error("invalid composition JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Score(#[from] ScoreError),
    #[error("sequencer host: {0}")]
    Sequencer(#[from] SequencerError),
    #[error("cannot write {path}: {source}")]
    Write { path: PathBuf, source: io::Error },
    #[error("{0}")]
    Usage(String),
}

pub type ComposeResult<T> = Result<T, ComposeError>;
