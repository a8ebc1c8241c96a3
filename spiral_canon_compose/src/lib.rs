// Spiral Canon composition driver
//
// Ties the pure generation core (`spiral_canon_music`) to a host sequencer
// (`spiral_canon_sequencer`).
//
// - config.rs: `CompositionConfig`, the JSON description of a whole run
// - orchestrator.rs: `CompositionOrchestrator`: parallel generation, then
//   per-voice setup and batched dispatch, then clip launch
// - report.rs: Per-voice and total outcome of a run
// - error.rs: `ComposeError` for configuration and CLI failures
//
// The `compose` binary (main.rs) is a thin CLI over these.

pub mod config;
pub mod error;
pub mod orchestrator;
pub mod report;

pub use config::CompositionConfig;
pub use error::{ComposeError, ComposeResult};
pub use orchestrator::{CompositionOrchestrator, GeneratedScore, GeneratedVoice};
pub use report::{CompositionReport, VoiceReport};
