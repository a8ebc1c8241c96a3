// spiral_canon_protocol - message types for the remote-host adapter.
//
// The composer's contract with a sequencer is the `SequencerInterface`
// command set and the note event schema, not a file or wire format. When the
// host application runs in another process, the adapter in
// `spiral_canon_sequencer` (feature `remote`) carries those same calls as
// request/response pairs using the types here. `HostCommand` mirrors the
// interface's methods one to one and `WireNote` is the event schema flattened.
// The handle types are shared with the interface itself.
//
// Module overview:
// - `types.rs`:    Handle types: `TrackHandle`, `ClipHandle`, `RequestId`.
// - `message.rs`:  `HostCommand` / `HostReply`, the `Request` / `Response`
//                  envelopes, and `WireNote`.
// - `framing.rs`:  Length-delimited framing over any `Read`/`Write` stream:
//                  4-byte big-endian length prefix, then JSON payload.
//
// No async runtime: framing works on blocking `std::io` streams.

pub mod framing;
pub mod message;
pub mod types;

pub use framing::{FrameError, MAX_MESSAGE_SIZE, encode, receive, send};
pub use message::{
    FailureKind, HostCommand, HostReply, PROTOCOL_VERSION, Request, Response, WireNote,
};
pub use types::{ClipHandle, RequestId, TrackHandle};
