// Host side of the remote-host adapter: serve any `SequencerInterface` over
// TCP to a `RemoteSequencer`.
//
// The link forwards `SequencerInterface` calls one to one and adds no
// semantics of its own. Tests use it to put a real socket between the
// dispatcher and a `SimulatedSequencer`.
//
// Architecture: thread-per-connection.
// - **Listener thread**: non-blocking `accept()` loop that polls
//   `keep_running` between attempts and spawns a handler per connection.
// - **Connection threads**: read a `Request`, run it against the wrapped
//   host, write the `Response`, repeat until the peer disconnects.
//
// Host errors travel back as `HostReply::Failed`, classified retryable or
// fatal, so a `RemoteSequencer` on the other side sees the same taxonomy the
// wrapped host produced.
//
// Shutdown: `BridgeHandle::stop` clears `keep_running` and joins the listener.
// Connection threads end when their peer closes the socket.

use std::io::{self, BufReader, BufWriter};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use log::{debug, info, warn};
use spiral_canon_protocol::{
    FailureKind, HostCommand, HostReply, PROTOCOL_VERSION, Request, Response, receive, send,
};

use crate::interface::{SequencerError, SequencerInterface};
use crate::remote::{from_wire, to_wire};

/// Handle returned by `serve` to stop the bridge.
pub struct BridgeHandle {
    keep_running: Arc<AtomicBool>,
    thread: Option<thread::JoinHandle<()>>,
}

impl BridgeHandle {
    /// Signal the listener to stop and wait for it.
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        self.keep_running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.thread.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for BridgeHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Serve `host` on `127.0.0.1:port` from a background thread. Port 0 lets the
/// OS pick; the bound address is returned.
pub fn serve(
    host: Arc<dyn SequencerInterface>,
    port: u16,
) -> io::Result<(BridgeHandle, SocketAddr)> {
    let listener = TcpListener::bind(("127.0.0.1", port))?;
    let addr = listener.local_addr()?;
    listener.set_nonblocking(true)?;
    let keep_running = Arc::new(AtomicBool::new(true));
    let keep_running_listener = keep_running.clone();

    let thread = thread::spawn(move || {
        while keep_running_listener.load(Ordering::SeqCst) {
            match listener.accept() {
                Ok((stream, peer)) => {
                    stream.set_nonblocking(false).ok();
                    debug!("bridge: connection from {peer}");
                    let host = host.clone();
                    thread::spawn(move || connection_loop(stream, host.as_ref()));
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                    thread::sleep(Duration::from_millis(10));
                }
                Err(e) => {
                    warn!("bridge: accept failed: {e}");
                    break;
                }
            }
        }
    });

    info!("bridge: serving sequencer on {addr}");
    Ok((
        BridgeHandle {
            keep_running,
            thread: Some(thread),
        },
        addr,
    ))
}

fn connection_loop(stream: TcpStream, host: &dyn SequencerInterface) {
    let mut reader = BufReader::new(match stream.try_clone() {
        Ok(s) => s,
        Err(_) => return,
    });
    let mut writer = BufWriter::new(stream);
    loop {
        let request: Request = match receive(&mut reader) {
            Ok(request) => request,
            Err(e) => {
                if !e.is_eof() {
                    warn!("bridge: dropping connection: {e}");
                }
                break;
            }
        };
        let response = Response {
            id: request.id,
            reply: execute(host, request.command),
        };
        if let Err(e) = send(&mut writer, &response) {
            warn!("bridge: reply failed: {e}");
            break;
        }
    }
}

/// Run one command against the host.
pub fn execute(host: &dyn SequencerInterface, command: HostCommand) -> HostReply {
    let result = match command {
        HostCommand::Describe => Ok(HostReply::Description {
            protocol_version: PROTOCOL_VERSION,
            idempotent_inserts: host.idempotent_inserts(),
        }),
        HostCommand::SetTempo { bpm } => host.set_tempo(bpm).map(|()| HostReply::Ack),
        HostCommand::CreateTrack { index } => {
            host.create_track(index).map(|track| HostReply::Track { track })
        }
        HostCommand::NameTrack { track, name } => {
            host.name_track(track, &name).map(|()| HostReply::Ack)
        }
        HostCommand::LoadInstrument { track, instrument } => {
            host.load_instrument(track, &instrument).map(|()| HostReply::Ack)
        }
        HostCommand::CreateClip {
            track,
            slot,
            length_beats,
        } => host
            .create_clip(track, slot, length_beats)
            .map(|clip| HostReply::Clip { clip }),
        HostCommand::NameClip { clip, name } => {
            host.name_clip(clip, &name).map(|()| HostReply::Ack)
        }
        HostCommand::InsertNotes { track, clip, notes } => {
            let notes: Vec<_> = notes.iter().map(from_wire).collect();
            host.insert_notes(track, clip, &notes).map(|stored| HostReply::Inserted {
                stored: u32::try_from(stored).unwrap_or(u32::MAX),
            })
        }
        HostCommand::QueryNotes {
            track,
            clip,
            from,
            to,
        } => host.query_notes(track, clip, from, to).map(|notes| HostReply::Notes {
            notes: notes.iter().map(to_wire).collect(),
        }),
        HostCommand::FireClip { track, clip } => {
            host.fire_clip(track, clip).map(|()| HostReply::Ack)
        }
    };
    result.unwrap_or_else(|e| {
        // The client wraps the message in its own variant again.
        let (kind, message) = match e {
            SequencerError::Fatal(m) => (FailureKind::Fatal, m),
            SequencerError::Retryable(m) => (FailureKind::Retryable, m),
            timeout @ SequencerError::Timeout(_) => (FailureKind::Retryable, timeout.to_string()),
        };
        HostReply::Failed { kind, message }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::simulated::SimulatedSequencer;

    #[test]
    fn execute_maps_host_errors_to_failure_kinds() {
        let host = SimulatedSequencer::reliable();
        host.mark_instrument_missing("Gone.adg");
        let track = match execute(&host, HostCommand::CreateTrack { index: 0 }) {
            HostReply::Track { track } => track,
            other => panic!("unexpected {other:?}"),
        };
        let reply = execute(
            &host,
            HostCommand::LoadInstrument {
                track,
                instrument: "Gone.adg".into(),
            },
        );
        assert!(matches!(
            reply,
            HostReply::Failed {
                kind: FailureKind::Fatal,
                ..
            }
        ));
    }

    #[test]
    fn failure_messages_cross_without_a_second_prefix() {
        let host = SimulatedSequencer::reliable();
        host.mark_instrument_missing("Gone.adg");
        let track = host.create_track(0).unwrap();
        let reply = execute(
            &host,
            HostCommand::LoadInstrument {
                track,
                instrument: "Gone.adg".into(),
            },
        );
        assert_eq!(
            reply,
            HostReply::Failed {
                kind: FailureKind::Fatal,
                message: "instrument 'Gone.adg' not found".into(),
            }
        );
    }

    #[test]
    fn describe_reports_idempotency() {
        let host = SimulatedSequencer::reliable();
        assert_eq!(
            execute(&host, HostCommand::Describe),
            HostReply::Description {
                protocol_version: PROTOCOL_VERSION,
                idempotent_inserts: true,
            }
        );
    }
}
