// Spiral Canon score generator
//
// Maps the geometry of a logarithmic spiral (a spiral-galaxy arm) onto
// canonic counterpoint and assembles the result into one continuous,
// multi-section timeline per voice. Everything in this crate is pure and
// deterministic: the same configuration always yields the same events.
//
// Architecture:
// - spiral.rs: Spiral radius, density wave, golden-ratio entry offsets
// - canon.rs: Subjects and the fixed-order canonic transforms (transpose,
//   shift, augment/diminish, invert, retrograde)
// - voice.rs: Voice roles, textures, per-section canonic plans
// - section.rs: Section kinds and their spiral parameters
// - generator.rs: One voice, one section -> NoteEvents (velocity swell,
//   ornament subdivision, registral lift, overlap truncation)
// - timeline.rs: Section offsets and the per-voice integrity check
// - material.rs: The reference six-voice composition
// - midi.rs: Standard MIDI File export of composed timelines
// - event.rs / error.rs: Shared event types and the error taxonomy
//
// Voices share no state, so callers may generate them in parallel.

pub mod canon;
pub mod error;
pub mod event;
pub mod generator;
pub mod material;
pub mod midi;
pub mod section;
pub mod spiral;
pub mod timeline;
pub mod voice;

pub use canon::{CanonLine, CanonOptions, CanonTransformer, Subject, SubjectNote};
pub use error::{ScoreError, ScoreResult};
pub use event::{NoteEvent, NoteKey, VoiceId};
pub use generator::VoiceScoreGenerator;
pub use section::{SectionKind, SectionSpec};
pub use spiral::{DensityProfile, GoldenDirection, SpiralModel, SpiralPoint};
pub use timeline::{SectionEvents, Timeline, TimelineCompositor};
pub use voice::{Texture, VoiceRole, VoiceSectionPlan, VoiceSpec};
