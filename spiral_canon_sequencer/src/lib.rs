// spiral_canon_sequencer - getting a composed score into a host sequencer.
//
// The host application (tracks, clips, instruments, playback) is external.
// This crate defines the control surface the composer expects from it and
// the machinery for moving a large, precisely timed event set across a
// rate-limited boundary without loss, duplication, or reordering.
//
// Module overview:
// - `interface.rs`:  `SequencerInterface` trait and the `SequencerError`
//                    taxonomy (retryable, timeout, fatal).
// - `dispatch.rs`:   `BatchedDispatcher`: bounded ordered batches, retry with
//                    jittered exponential backoff, query-before-resend for
//                    non-idempotent hosts, per-voice `DispatchReport`.
// - `simulated.rs`:  In-memory host with deterministic failure injection.
//
// Remote-host adapter (feature `remote`, on by default):
// - `remote.rs`:     `RemoteSequencer`, a `SequencerInterface` that forwards
//                    each call to a host in another process.
// - `bridge.rs`:     The host-side end of that link: exposes an in-process
//                    `SequencerInterface` to a `RemoteSequencer`.
// The adapter only carries the interface's calls. Dispatch and its
// guarantees never depend on it.

#[cfg(feature = "remote")]
pub mod bridge;
pub mod dispatch;
pub mod interface;
#[cfg(feature = "remote")]
pub mod remote;
pub mod simulated;

#[cfg(feature = "remote")]
pub use bridge::{BridgeHandle, serve};
pub use dispatch::{
    BatchSequence, BatchedDispatcher, CancelToken, DispatchBatch, DispatchConfig, DispatchReport,
    DispatchTarget, partition,
};
pub use interface::{SequencerError, SequencerInterface, SequencerResult};
#[cfg(feature = "remote")]
pub use remote::RemoteSequencer;
pub use simulated::{SimulatedConfig, SimulatedSequencer};
