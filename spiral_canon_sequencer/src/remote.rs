// Remote-host adapter: a `SequencerInterface` for a sequencer host running
// in another process.
//
// `RemoteSequencer` implements `SequencerInterface` by sending one framed
// `Request` per call and waiting for the `Response` with the same ID.
//
// Connections are pooled: a call takes an idle connection (or opens a new
// one), uses it for exactly one round trip, and returns it to the pool. That
// lets per-voice dispatch threads talk to the host concurrently while each
// connection carries one request at a time.
//
// Failure mapping:
// - connect / write / read errors drop the connection and are `Retryable`; the
//   next call reconnects.
// - a socket timeout drops the connection and is `Timeout`. A reply that
//   arrives later is lost with the connection, never mistaken for another
//   call's reply.
// - `HostReply::Failed` maps to `Retryable` or `Fatal` by its kind.
//
// `connect` performs a `Describe` round trip to check the protocol version
// and learn whether inserts are idempotent on the host.

use std::io::{BufReader, BufWriter};
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use log::{debug, warn};
use spiral_canon_music::{NoteEvent, VoiceId};
use spiral_canon_protocol::{
    ClipHandle, FailureKind, FrameError, HostCommand, HostReply, PROTOCOL_VERSION, Request,
    RequestId, Response, TrackHandle, WireNote, receive, send,
};

use crate::interface::{SequencerError, SequencerInterface, SequencerResult};

pub(crate) fn to_wire(note: &NoteEvent) -> WireNote {
    WireNote {
        voice: note.voice.0,
        pitch: note.pitch,
        start: note.start,
        duration: note.duration,
        velocity: note.velocity,
        muted: note.muted,
    }
}

pub(crate) fn from_wire(note: &WireNote) -> NoteEvent {
    NoteEvent {
        voice: VoiceId(note.voice),
        pitch: note.pitch,
        start: note.start,
        duration: note.duration,
        velocity: note.velocity,
        muted: note.muted,
    }
}

struct Connection {
    reader: BufReader<TcpStream>,
    writer: BufWriter<TcpStream>,
}

pub struct RemoteSequencer {
    addr: SocketAddr,
    timeout: Duration,
    idle: Mutex<Vec<Connection>>,
    next_id: AtomicU64,
    idempotent: bool,
}

impl RemoteSequencer {
    /// Resolve `addr`, open a first connection, and ask the host to describe
    /// itself. `timeout` bounds every connect, read, and write.
    pub fn connect(addr: impl ToSocketAddrs, timeout: Duration) -> SequencerResult<Self> {
        let addr = addr
            .to_socket_addrs()
            .map_err(|e| SequencerError::Fatal(format!("cannot resolve host address: {e}")))?
            .next()
            .ok_or_else(|| SequencerError::Fatal("host address resolved to nothing".into()))?;
        let mut remote = Self {
            addr,
            timeout,
            idle: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
            idempotent: false,
        };
        match remote.call(HostCommand::Describe)? {
            HostReply::Description {
                protocol_version,
                idempotent_inserts,
            } => {
                if protocol_version != PROTOCOL_VERSION {
                    return Err(SequencerError::Fatal(format!(
                        "host speaks protocol {protocol_version}, expected {PROTOCOL_VERSION}"
                    )));
                }
                remote.idempotent = idempotent_inserts;
            }
            other => return Err(unexpected("Describe", &other)),
        }
        debug!("connected to sequencer host at {}", remote.addr);
        Ok(remote)
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    fn open(&self) -> SequencerResult<Connection> {
        let stream = TcpStream::connect_timeout(&self.addr, self.timeout)
            .map_err(|e| SequencerError::Retryable(format!("connect to {}: {e}", self.addr)))?;
        let io = |e: std::io::Error| SequencerError::Retryable(format!("socket setup: {e}"));
        stream.set_read_timeout(Some(self.timeout)).map_err(io)?;
        stream.set_write_timeout(Some(self.timeout)).map_err(io)?;
        stream.set_nodelay(true).ok();
        let reader = BufReader::new(stream.try_clone().map_err(io)?);
        Ok(Connection {
            reader,
            writer: BufWriter::new(stream),
        })
    }

    fn checkout(&self) -> SequencerResult<Connection> {
        let pooled = self.idle.lock().unwrap_or_else(PoisonError::into_inner).pop();
        match pooled {
            Some(conn) => Ok(conn),
            None => self.open(),
        }
    }

    fn checkin(&self, conn: Connection) {
        self.idle.lock().unwrap_or_else(PoisonError::into_inner).push(conn);
    }

    fn frame_error(&self, what: &str, e: &FrameError) -> SequencerError {
        if e.is_timeout() {
            SequencerError::Timeout(self.timeout)
        } else {
            SequencerError::Retryable(format!("{what}: {e}"))
        }
    }

    /// One round trip. Transport failures discard the connection.
    fn call(&self, command: HostCommand) -> SequencerResult<HostReply> {
        let mut conn = self.checkout()?;
        let id = RequestId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let request = Request { id, command };

        if let Err(e) = send(&mut conn.writer, &request) {
            warn!("sequencer host {}: send failed: {e}", self.addr);
            return Err(self.frame_error("send", &e));
        }
        let response: Response = loop {
            match receive::<_, Response>(&mut conn.reader) {
                Ok(response) if response.id == id => break response,
                Ok(stale) => debug!("dropping reply to stale request {:?}", stale.id),
                Err(e) => {
                    warn!("sequencer host {}: receive failed: {e}", self.addr);
                    return Err(self.frame_error("receive", &e));
                }
            }
        };
        self.checkin(conn);

        match response.reply {
            HostReply::Failed {
                kind: FailureKind::Retryable,
                message,
            } => Err(SequencerError::Retryable(message)),
            HostReply::Failed {
                kind: FailureKind::Fatal,
                message,
            } => Err(SequencerError::Fatal(message)),
            reply => Ok(reply),
        }
    }

    fn call_ack(&self, what: &str, command: HostCommand) -> SequencerResult<()> {
        match self.call(command)? {
            HostReply::Ack => Ok(()),
            other => Err(unexpected(what, &other)),
        }
    }
}

fn unexpected(what: &str, reply: &HostReply) -> SequencerError {
    SequencerError::Fatal(format!("unexpected reply to {what}: {reply:?}"))
}

impl SequencerInterface for RemoteSequencer {
    fn set_tempo(&self, bpm: f64) -> SequencerResult<()> {
        self.call_ack("SetTempo", HostCommand::SetTempo { bpm })
    }

    fn create_track(&self, index: u32) -> SequencerResult<TrackHandle> {
        match self.call(HostCommand::CreateTrack { index })? {
            HostReply::Track { track } => Ok(track),
            other => Err(unexpected("CreateTrack", &other)),
        }
    }

    fn name_track(&self, track: TrackHandle, name: &str) -> SequencerResult<()> {
        self.call_ack(
            "NameTrack",
            HostCommand::NameTrack {
                track,
                name: name.to_string(),
            },
        )
    }

    fn load_instrument(&self, track: TrackHandle, instrument: &str) -> SequencerResult<()> {
        self.call_ack(
            "LoadInstrument",
            HostCommand::LoadInstrument {
                track,
                instrument: instrument.to_string(),
            },
        )
    }

    fn create_clip(
        &self,
        track: TrackHandle,
        slot: u32,
        length_beats: f64,
    ) -> SequencerResult<ClipHandle> {
        match self.call(HostCommand::CreateClip {
            track,
            slot,
            length_beats,
        })? {
            HostReply::Clip { clip } => Ok(clip),
            other => Err(unexpected("CreateClip", &other)),
        }
    }

    fn name_clip(&self, clip: ClipHandle, name: &str) -> SequencerResult<()> {
        self.call_ack(
            "NameClip",
            HostCommand::NameClip {
                clip,
                name: name.to_string(),
            },
        )
    }

    fn insert_notes(
        &self,
        track: TrackHandle,
        clip: ClipHandle,
        notes: &[NoteEvent],
    ) -> SequencerResult<usize> {
        let command = HostCommand::InsertNotes {
            track,
            clip,
            notes: notes.iter().map(to_wire).collect(),
        };
        match self.call(command)? {
            HostReply::Inserted { stored } => Ok(stored as usize),
            other => Err(unexpected("InsertNotes", &other)),
        }
    }

    fn query_notes(
        &self,
        track: TrackHandle,
        clip: ClipHandle,
        from: f64,
        to: f64,
    ) -> SequencerResult<Vec<NoteEvent>> {
        match self.call(HostCommand::QueryNotes {
            track,
            clip,
            from,
            to,
        })? {
            HostReply::Notes { notes } => Ok(notes.iter().map(from_wire).collect()),
            other => Err(unexpected("QueryNotes", &other)),
        }
    }

    fn fire_clip(&self, track: TrackHandle, clip: ClipHandle) -> SequencerResult<()> {
        self.call_ack("FireClip", HostCommand::FireClip { track, clip })
    }

    fn idempotent_inserts(&self) -> bool {
        self.idempotent
    }
}
