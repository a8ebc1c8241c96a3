// The external sequencer's control surface, as seen by the composer.
//
// `SequencerInterface` is the fixed command set a host application exposes:
// tempo, track and clip lifecycle, note insertion, clip launch. The host owns
// instruments, playback, and rendering; this crate only drives it.
//
// Every call is a suspension point (an IPC or network round trip) and may fail
// with a `SequencerError`:
// - `Retryable`: transient, the same call may succeed if repeated.
// - `Timeout`: the call did not complete in time; treated as retryable.
// - `Fatal`: permanent for this call (unknown handle, missing instrument).
//
// Methods take `&self` so one host can be shared by the per-voice dispatch
// threads. Implementations synchronize internally.
//
// `insert_notes` is keyed by `(voice, start, pitch)`. Hosts that skip keys
// they already hold report `idempotent_inserts() == true`; for the others the
// dispatcher queries the target range before resubmitting a batch.

use std::time::Duration;

use spiral_canon_music::NoteEvent;
use spiral_canon_protocol::{ClipHandle, TrackHandle};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum SequencerError {
    #[error("transient sequencer failure: {0}")]
    Retryable(String),
    #[error("sequencer call timed out after {0:?}")]
    Timeout(Duration),
    #[error("sequencer failure: {0}")]
    Fatal(String),
}

impl SequencerError {
    pub fn is_retryable(&self) -> bool {
        !matches!(self, SequencerError::Fatal(_))
    }
}

pub type SequencerResult<T> = Result<T, SequencerError>;

pub trait SequencerInterface: Send + Sync {
    fn set_tempo(&self, bpm: f64) -> SequencerResult<()>;

    fn create_track(&self, index: u32) -> SequencerResult<TrackHandle>;

    fn name_track(&self, track: TrackHandle, name: &str) -> SequencerResult<()>;

    fn load_instrument(&self, track: TrackHandle, instrument: &str) -> SequencerResult<()>;

    /// Create a clip in `slot` of `track`, `length_beats` long.
    fn create_clip(
        &self,
        track: TrackHandle,
        slot: u32,
        length_beats: f64,
    ) -> SequencerResult<ClipHandle>;

    fn name_clip(&self, clip: ClipHandle, name: &str) -> SequencerResult<()>;

    /// Insert an ordered batch. Returns how many notes the host newly stored.
    fn insert_notes(
        &self,
        track: TrackHandle,
        clip: ClipHandle,
        notes: &[NoteEvent],
    ) -> SequencerResult<usize>;

    /// Notes already in the clip whose start lies in `[from, to)`.
    fn query_notes(
        &self,
        track: TrackHandle,
        clip: ClipHandle,
        from: f64,
        to: f64,
    ) -> SequencerResult<Vec<NoteEvent>>;

    fn fire_clip(&self, track: TrackHandle, clip: ClipHandle) -> SequencerResult<()>;

    /// Whether re-inserting a stored key is a no-op on this host.
    fn idempotent_inserts(&self) -> bool;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeouts_are_retryable() {
        assert!(SequencerError::Retryable("busy".into()).is_retryable());
        assert!(SequencerError::Timeout(Duration::from_millis(5)).is_retryable());
        assert!(!SequencerError::Fatal("no such instrument".into()).is_retryable());
    }

    #[test]
    fn messages_name_the_failure() {
        let err = SequencerError::Fatal("instrument 'x' not found".into());
        assert!(err.to_string().contains("instrument 'x' not found"));
    }
}
