// Protocol messages between the composer (client) and a sequencer host.
//
// The vocabulary mirrors the host's control surface one-to-one:
// - `HostCommand`: one call into the host (tempo, tracks, clips, notes).
// - `HostReply`: the host's answer, including a classified failure.
//
// Every command travels inside a `Request` carrying a client-chosen
// `RequestId`; the host answers with a `Response` echoing that ID. One
// request is in flight per connection at a time.
//
// Notes travel as `WireNote`, a flat copy of the composer's note event. The
// host treats `(voice, start, pitch)` as the insertion key.

use serde::{Deserialize, Serialize};

use crate::types::{ClipHandle, RequestId, TrackHandle};

/// Bumped whenever a message shape changes.
pub const PROTOCOL_VERSION: u32 = 1;

/// One note on the wire. Times are in beats from the clip start.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WireNote {
    pub voice: u32,
    pub pitch: u8,
    pub start: f64,
    pub duration: f64,
    pub velocity: u8,
    pub muted: bool,
}

/// Calls into the host.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum HostCommand {
    /// Ask for protocol version and host capabilities.
    Describe,
    SetTempo {
        bpm: f64,
    },
    CreateTrack {
        index: u32,
    },
    NameTrack {
        track: TrackHandle,
        name: String,
    },
    LoadInstrument {
        track: TrackHandle,
        instrument: String,
    },
    CreateClip {
        track: TrackHandle,
        slot: u32,
        length_beats: f64,
    },
    NameClip {
        clip: ClipHandle,
        name: String,
    },
    InsertNotes {
        track: TrackHandle,
        clip: ClipHandle,
        notes: Vec<WireNote>,
    },
    /// Notes whose start lies in `[from, to)`.
    QueryNotes {
        track: TrackHandle,
        clip: ClipHandle,
        from: f64,
        to: f64,
    },
    FireClip {
        track: TrackHandle,
        clip: ClipHandle,
    },
}

/// How a failed call should be treated by the caller.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailureKind {
    /// Transient; the same call may succeed if repeated.
    Retryable,
    /// Permanent for this call (e.g. a missing instrument).
    Fatal,
}

/// Answers from the host.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum HostReply {
    Ack,
    Description {
        protocol_version: u32,
        idempotent_inserts: bool,
    },
    Track {
        track: TrackHandle,
    },
    Clip {
        clip: ClipHandle,
    },
    /// Notes newly stored by an insert (already-present keys are not counted).
    Inserted {
        stored: u32,
    },
    Notes {
        notes: Vec<WireNote>,
    },
    Failed {
        kind: FailureKind,
        message: String,
    },
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub id: RequestId,
    pub command: HostCommand,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub id: RequestId,
    pub reply: HostReply,
}
