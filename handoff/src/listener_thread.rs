use protocol::{ControlMessage, TokenTuple};
use std::collections::HashMap;
use std::io::ErrorKind;
use std::os::unix::net::{UnixListener, UnixStream};
use tracing::{debug, info, warn};

use crate::channel::{read_message, send_bytes, send_message, MAX_SHM_PATH_LEN};
use crate::poller::{Readiness, WaitResult};
use crate::producer::{ClientLink, ProducerPhase, ProducerShared, SessionEvent};
use crate::{HandoffError, Result};

const LISTENER_TOKEN: u64 = 0;

/// Runs until the poller is set to flushing. Owns the listener and the read
/// half of the client connection; the write half lives in the shared state
/// so publishers can send on it.
pub(crate) fn producer_event_loop(listener: UnixListener, shared: &ProducerShared) -> Result<()> {
    shared.poller.add(&listener, LISTENER_TOKEN)?;

    let mut clients: HashMap<u64, UnixStream> = HashMap::new();
    let mut next_client_id = 1;

    loop {
        let ready = match shared.poller.wait(None)? {
            WaitResult::Ready(ready) => ready,
            WaitResult::TimedOut => continue,
            WaitResult::Flushing => {
                debug!("producer event loop shutting down");
                break;
            }
        };

        for event in ready {
            match event.token {
                LISTENER_TOKEN => {
                    accept_clients(&listener, shared, &mut clients, &mut next_client_id)
                }
                client_id => {
                    if let Some(stream) = clients.get(&client_id) {
                        if !service_client(shared, client_id, stream, event) {
                            if let Some(stream) = clients.remove(&client_id) {
                                shared.poller.remove(&stream)?;
                            }
                            handle_disconnect(shared, client_id);
                        }
                    }
                }
            }
        }
    }

    for stream in clients.values() {
        let _ = shared.poller.remove(stream);
    }
    Ok(())
}

fn accept_clients(
    listener: &UnixListener,
    shared: &ProducerShared,
    clients: &mut HashMap<u64, UnixStream>,
    next_client_id: &mut u64,
) {
    loop {
        let stream = match listener.accept() {
            Ok((stream, _)) => stream,
            Err(e) if e.kind() == ErrorKind::WouldBlock => return,
            Err(e) => {
                warn!(error = ?e, "error accepting connection");
                return;
            }
        };

        if !clients.is_empty() {
            warn!("refusing second client, one is already connected");
            continue;
        }

        let client_id = *next_client_id;
        *next_client_id += 1;

        let admitted = admit_client(shared, client_id, &stream)
            .and_then(|writer| register_client(shared, clients, client_id, stream, writer));
        match admitted {
            Ok(()) => info!(client_id, "client connected"),
            Err(e) => warn!(client_id, error = %e, "failed to admit client, dropping it"),
        }
    }
}

/// Starts watching the client and makes it the session's peer. On error
/// nothing is recorded and the stream is closed.
fn register_client(
    shared: &ProducerShared,
    clients: &mut HashMap<u64, UnixStream>,
    client_id: u64,
    stream: UnixStream,
    writer: UnixStream,
) -> Result<()> {
    shared.poller.add(&stream, client_id)?;
    clients.insert(client_id, stream);
    {
        let mut state = shared.state.lock();
        state.client = Some(ClientLink {
            id: client_id,
            writer,
            sent: 0,
            acked: 0,
        });
        state.phase = ProducerPhase::Connected;
    }
    shared.state.notify();
    let _ = shared.events.send(SessionEvent::ClientConnected { client_id });
    Ok(())
}

/// Puts the stream in blocking mode and sends the mailbox name.
fn admit_client(shared: &ProducerShared, client_id: u64, stream: &UnixStream) -> Result<UnixStream> {
    stream.set_nonblocking(false)?;

    let path = shared.mailbox_name.as_bytes();
    if path.len() > MAX_SHM_PATH_LEN {
        return Err(HandoffError::InvalidShmPath(shared.mailbox_name.clone()));
    }
    send_message(
        stream,
        &ControlMessage::ShmPath {
            len: path.len() as u32,
        },
    )?;
    send_bytes(stream, path)?;
    debug!(client_id, mailbox = %shared.mailbox_name, "sent SHM_PATH");

    Ok(stream.try_clone()?)
}

/// Handles one readiness report. Returns false when the client is gone.
fn service_client(
    shared: &ProducerShared,
    client_id: u64,
    stream: &UnixStream,
    event: Readiness,
) -> bool {
    if !event.readable {
        if event.closed || event.error {
            debug!(client_id, "client hung up");
            return false;
        }
        return true;
    }

    let message = match read_message(stream) {
        Ok(Some(message)) => message,
        Ok(None) => {
            debug!(client_id, "client closed the connection");
            return false;
        }
        Err(e) => {
            warn!(client_id, error = %e, "error reading from client");
            return false;
        }
    };

    match message {
        ControlMessage::BufferReceived => {
            let mut state = shared.state.lock();
            state.stats.acknowledged += 1;
            if let Some(client) = state.client.as_mut().filter(|c| c.id == client_id) {
                client.acked += 1;
            }
            drop(state);
            shared.state.notify();
        }
        ControlMessage::BufferRelease { tokens } => {
            let tokens = TokenTuple(tokens);
            let released = {
                let mut state = shared.state.lock();
                let released = state.outstanding.remove(&tokens);
                if released.is_some() {
                    state.stats.released += 1;
                }
                released
            };
            shared.state.notify();
            match released {
                Some(buffer) => {
                    debug!(client_id, tokens = %tokens, "buffer released");
                    drop(buffer);
                }
                None => warn!(client_id, tokens = %tokens, "release for unknown buffer"),
            }
        }
        ControlMessage::CloseClient => {
            debug!(client_id, "client sent CLOSE_CLIENT");
            return false;
        }
        other => warn!(client_id, message = other.name(), "unexpected message from client"),
    }
    true
}

fn handle_disconnect(shared: &ProducerShared, client_id: u64) {
    let forced = {
        let mut state = shared.state.lock();
        // stop() may already have taken the client over.
        if !state.client.as_ref().is_some_and(|c| c.id == client_id) {
            return;
        }
        state.client = None;
        if state.phase == ProducerPhase::Connected {
            state.phase = ProducerPhase::Listening;
        }
        if shared.release_on_disconnect {
            state.force_release()
        } else {
            Vec::new()
        }
    };
    shared.state.notify();

    if !forced.is_empty() {
        info!(client_id, count = forced.len(), "released buffers of departed client");
    }
    drop(forced);

    let _ = shared.events.send(SessionEvent::ClientDisconnected { client_id });
    info!(client_id, "client disconnected");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::outstanding::{Guarded, OutstandingTable};
    use crate::poller::Poller;
    use crate::producer::{ProducerState, ProducerStats};
    use crossbeam::channel::{unbounded, Receiver};
    use rstest::*;

    #[fixture]
    fn shared() -> (ProducerShared, Receiver<SessionEvent>) {
        crate::test_util::init_tracing();
        let (events, events_rx) = unbounded();
        let shared = ProducerShared {
            state: Guarded::new(ProducerState {
                phase: ProducerPhase::Listening,
                client: None,
                outstanding: OutstandingTable::with_capacity(4),
                stats: ProducerStats::default(),
            }),
            poller: Poller::new().unwrap(),
            events,
            mailbox_name: "/handoff-test.0.0".to_string(),
            release_on_disconnect: false,
        };
        (shared, events_rx)
    }

    #[rstest]
    fn test_registered_client_becomes_peer(shared: (ProducerShared, Receiver<SessionEvent>)) {
        let (shared, events) = shared;
        let (stream, _peer) = UnixStream::pair().unwrap();
        let writer = stream.try_clone().unwrap();
        let mut clients = HashMap::new();

        register_client(&shared, &mut clients, 3, stream, writer).unwrap();

        assert!(clients.contains_key(&3));
        assert_eq!(shared.state.lock().phase, ProducerPhase::Connected);
        assert_eq!(
            events.try_recv().unwrap(),
            SessionEvent::ClientConnected { client_id: 3 }
        );
    }

    #[rstest]
    fn test_unwatchable_client_is_dropped(shared: (ProducerShared, Receiver<SessionEvent>)) {
        let (shared, events) = shared;
        let (stream, _peer) = UnixStream::pair().unwrap();
        // Registering the same descriptor twice makes epoll refuse it.
        shared.poller.add(&stream, 99).unwrap();
        let writer = stream.try_clone().unwrap();
        let mut clients = HashMap::new();

        assert!(register_client(&shared, &mut clients, 1, stream, writer).is_err());

        assert!(clients.is_empty());
        let state = shared.state.lock();
        assert!(state.client.is_none());
        assert_eq!(state.phase, ProducerPhase::Listening);
        assert!(events.try_recv().is_err());
    }
}
