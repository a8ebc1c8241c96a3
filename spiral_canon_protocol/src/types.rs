// Handle and ID types for the sequencer protocol.
//
// Handles are issued by the host and are opaque to the composer: it only
// stores them and passes them back. `RequestId` is assigned by the client and
// echoed in the matching response, so a late reply to a timed-out request can
// be recognised and dropped.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Host-issued track handle.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TrackHandle(pub u32);

/// Host-issued clip handle, unique across all tracks.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ClipHandle(pub u32);

/// Client-assigned, monotonically increasing request ID.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RequestId(pub u64);

impl fmt::Display for TrackHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "track#{}", self.0)
    }
}

impl fmt::Display for ClipHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "clip#{}", self.0)
    }
}
