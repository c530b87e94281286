use crossbeam::channel::{unbounded, Receiver, Sender};
use parking_lot::Mutex;
use protocol::{encode_descriptor, ControlMessage, TokenTuple, DESCRIPTOR_SIZE};
use shmem::Mailbox;
use std::fs::Permissions;
use std::io::ErrorKind;
use std::net::Shutdown;
use std::os::unix::fs::PermissionsExt;
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::{debug, info, warn};

use crate::buffer::{Exporter, FdExporter, MediaBuffer};
use crate::channel::send_message;
use crate::config::ProducerConfig;
use crate::listener_thread::producer_event_loop;
use crate::outstanding::{Guarded, InsertError, OutstandingTable};
use crate::poller::Poller;
use crate::{HandoffError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProducerPhase {
    Idle,
    /// Bound and waiting for a client.
    Listening,
    Connected,
    Closing,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishOutcome {
    /// Nobody is connected; the buffer was not lent.
    NoClient,
    /// A plane could not be exported; the buffer was not lent.
    Skipped,
    /// The descriptor was handed over. `acknowledged` is false when the ack
    /// did not arrive within the configured timeout.
    Delivered { generation: u64, acknowledged: bool },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEvent {
    ClientConnected { client_id: u64 },
    ClientDisconnected { client_id: u64 },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProducerStats {
    pub published: u64,
    pub skipped: u64,
    /// Buffers refused for lack of a client or a free slot.
    pub dropped: u64,
    pub acknowledged: u64,
    pub ack_timeouts: u64,
    pub released: u64,
    pub force_released: u64,
}

pub(crate) struct ClientLink {
    pub(crate) id: u64,
    pub(crate) writer: UnixStream,
    pub(crate) sent: u64,
    pub(crate) acked: u64,
}

pub(crate) struct ProducerState {
    pub(crate) phase: ProducerPhase,
    pub(crate) client: Option<ClientLink>,
    pub(crate) outstanding: OutstandingTable<Arc<MediaBuffer>>,
    pub(crate) stats: ProducerStats,
}

impl ProducerState {
    /// Drops every lent buffer without waiting for the client.
    pub(crate) fn force_release(&mut self) -> Vec<(TokenTuple, Arc<MediaBuffer>)> {
        let released = self.outstanding.drain();
        self.stats.force_released += released.len() as u64;
        released
    }
}

/// State shared between the session owner, publishing threads and the event
/// loop thread.
pub(crate) struct ProducerShared {
    pub(crate) state: Guarded<ProducerState>,
    pub(crate) poller: Poller,
    pub(crate) events: Sender<SessionEvent>,
    pub(crate) mailbox_name: String,
    pub(crate) release_on_disconnect: bool,
}

struct Publisher {
    mailbox: Mailbox,
    generation: u64,
}

struct Running {
    thread: JoinHandle<Result<()>>,
    socket_path: PathBuf,
}

/// The serving side of a handoff session.
///
/// `start` binds the control socket and spawns the event loop; `publish`
/// lends a buffer to the connected consumer and may be called from any
/// thread; `stop` drains outstanding buffers and tears everything down. The
/// session stops itself when dropped.
pub struct ProducerSession {
    config: ProducerConfig,
    exporter: Arc<dyn Exporter>,
    shared: Option<Arc<ProducerShared>>,
    publisher: Mutex<Option<Publisher>>,
    running: Option<Running>,
    events_tx: Sender<SessionEvent>,
    events_rx: Receiver<SessionEvent>,
    closed: bool,
}

impl ProducerSession {
    pub fn new(config: ProducerConfig) -> Self {
        Self::with_exporter(config, Arc::new(FdExporter))
    }

    pub fn with_exporter(config: ProducerConfig, exporter: Arc<dyn Exporter>) -> Self {
        let (events_tx, events_rx) = unbounded();
        ProducerSession {
            config,
            exporter,
            shared: None,
            publisher: Mutex::new(None),
            running: None,
            events_tx,
            events_rx,
            closed: false,
        }
    }

    pub fn start(&mut self) -> Result<()> {
        if self.shared.is_some() || self.closed {
            return Err(HandoffError::AlreadyStarted);
        }

        let (listener, socket_path) = bind_with_retry(&self.config)?;

        // From here on every early return drops what was created so far;
        // only the socket path needs explicit cleanup.
        let started = self.start_bound(listener, &socket_path);
        if let Err(e) = &started {
            warn!(path = %socket_path.display(), error = %e, "producer start failed, rolling back");
            let _ = std::fs::remove_file(&socket_path);
        }
        started
    }

    fn start_bound(&mut self, listener: UnixListener, socket_path: &Path) -> Result<()> {
        std::fs::set_permissions(socket_path, Permissions::from_mode(self.config.permissions))?;
        listener.set_nonblocking(true)?;

        let mailbox = Mailbox::create(
            &self.config.mailbox_prefix,
            DESCRIPTOR_SIZE,
            self.config.permissions & 0o666,
        )?;

        let shared = Arc::new(ProducerShared {
            state: Guarded::new(ProducerState {
                phase: ProducerPhase::Listening,
                client: None,
                outstanding: OutstandingTable::with_capacity(self.config.capacity),
                stats: ProducerStats::default(),
            }),
            poller: Poller::new()?,
            events: self.events_tx.clone(),
            mailbox_name: mailbox.name().to_string(),
            release_on_disconnect: self.config.release_on_disconnect,
        });

        let thread = {
            let shared = shared.clone();
            std::thread::Builder::new()
                .name("handoff-producer".to_string())
                .spawn(move || {
                    let result = producer_event_loop(listener, &shared);
                    if let Err(e) = &result {
                        warn!(error = %e, "producer event loop failed");
                    }
                    result
                })?
        };

        info!(
            path = %socket_path.display(),
            mailbox = %mailbox.name(),
            "producer listening"
        );

        *self.publisher.lock() = Some(Publisher {
            mailbox,
            generation: 0,
        });
        self.shared = Some(shared);
        self.running = Some(Running {
            thread,
            socket_path: socket_path.to_path_buf(),
        });
        Ok(())
    }

    /// Lends `buffer` to the connected consumer.
    ///
    /// Never blocks on a full table; waits at most the ack timeout for the
    /// consumer to pick the descriptor up.
    pub fn publish(&self, buffer: Arc<MediaBuffer>) -> Result<PublishOutcome> {
        let shared = self.shared.as_ref().ok_or(HandoffError::NotConnected)?;
        let mut publisher = self.publisher.lock();
        let publisher = publisher.as_mut().ok_or(HandoffError::NotConnected)?;

        let client_id = {
            let mut state = shared.state.lock();
            match state.client.as_ref() {
                Some(client) => client.id,
                None => {
                    state.stats.dropped += 1;
                    debug!("no client connected, dropping buffer");
                    return Ok(PublishOutcome::NoClient);
                }
            }
        };

        let mut tokens = Vec::with_capacity(buffer.planes().len());
        for (index, plane) in buffer.planes().iter().enumerate() {
            match self.exporter.export(plane) {
                Ok(token) => tokens.push(token),
                Err(e) => {
                    warn!(plane = index, error = %e, "failed to export plane, skipping buffer");
                    shared.state.lock().stats.skipped += 1;
                    return Ok(PublishOutcome::Skipped);
                }
            }
        }

        let generation = publisher.generation + 1;
        let descriptor = buffer.descriptor(generation, &tokens);
        let key = descriptor.token_tuple();
        let frame = encode_descriptor(&descriptor)?;

        {
            let mut state = shared.state.lock();
            match state.outstanding.insert(key, buffer) {
                Ok(slot) => debug!(slot, tokens = %key, "buffer lent"),
                Err(InsertError::Full(_)) => {
                    state.stats.dropped += 1;
                    warn!(capacity = state.outstanding.capacity(), "outstanding table full");
                    return Err(HandoffError::CapacityExceeded(state.outstanding.capacity()));
                }
                Err(InsertError::Duplicate(_)) => {
                    state.stats.dropped += 1;
                    return Err(HandoffError::DuplicateTokens(key));
                }
            }
        }

        publisher.mailbox.write(frame.as_bytes())?;
        publisher.generation = generation;

        let mut state = shared.state.lock();
        let notified = match state.client.as_mut() {
            Some(client) if client.id == client_id => {
                Some(
                    send_message(&client.writer, &ControlMessage::BufferNew { generation }).map(
                        |()| {
                            client.sent += 1;
                            client.sent
                        },
                    ),
                )
            }
            _ => None,
        };
        let target = match notified {
            Some(Ok(target)) => target,
            Some(Err(e)) => {
                warn!(client_id, error = %e, "failed to notify client");
                state.outstanding.remove(&key);
                state.stats.dropped += 1;
                return Ok(PublishOutcome::NoClient);
            }
            None => {
                debug!(client_id, "client left before notification");
                state.outstanding.remove(&key);
                state.stats.dropped += 1;
                return Ok(PublishOutcome::NoClient);
            }
        };
        state.stats.published += 1;

        let acknowledged =
            shared
                .state
                .wait_until(&mut state, self.config.ack_timeout(), |s| match &s.client {
                    Some(client) => client.id != client_id || client.acked >= target,
                    None => true,
                });
        let acknowledged = acknowledged
            && state
                .client
                .as_ref()
                .is_some_and(|client| client.id == client_id);

        if !acknowledged {
            state.stats.ack_timeouts += 1;
            warn!(
                generation,
                timeout_ms = self.config.ack_timeout_ms,
                "no acknowledgement within timeout"
            );
        }

        Ok(PublishOutcome::Delivered {
            generation,
            acknowledged,
        })
    }

    /// Drains outstanding buffers, then shuts the event loop down and
    /// releases the socket path and mailbox. Idempotent.
    pub fn stop(&mut self) -> Result<()> {
        let (Some(shared), Some(running)) = (self.shared.clone(), self.running.take()) else {
            self.closed = true;
            return Ok(());
        };

        let forced = {
            let mut state = shared.state.lock();
            state.phase = ProducerPhase::Closing;

            let drained = shared.state.wait_until(
                &mut state,
                self.config.drain_timeout(),
                |s| s.outstanding.is_empty(),
            );
            let forced = if drained {
                Vec::new()
            } else {
                let forced = state.force_release();
                warn!(count = forced.len(), "drain timed out, force-releasing buffers");
                forced
            };

            if let Some(client) = &state.client {
                if let Err(e) = send_message(&client.writer, &ControlMessage::CloseClient) {
                    debug!(client_id = client.id, error = %e, "could not send CLOSE_CLIENT");
                }
            }
            forced
        };
        drop(forced);

        shared.poller.set_flushing(true)?;
        match running.thread.join() {
            Ok(Ok(())) => debug!("producer event loop joined"),
            Ok(Err(e)) => warn!(error = %e, "producer event loop ended with error"),
            Err(_) => warn!("producer event loop panicked"),
        }

        let client = {
            let mut state = shared.state.lock();
            state.phase = ProducerPhase::Closed;
            state.client.take()
        };
        shared.state.notify();
        if let Some(client) = client {
            let _ = client.writer.shutdown(Shutdown::Both);
            let _ = shared.events.send(SessionEvent::ClientDisconnected {
                client_id: client.id,
            });
            info!(client_id = client.id, "client closed");
        }

        self.publisher.lock().take();
        if let Err(e) = std::fs::remove_file(&running.socket_path) {
            warn!(path = %running.socket_path.display(), error = %e, "failed to remove socket");
        }

        self.closed = true;
        info!("producer stopped");
        Ok(())
    }

    pub fn phase(&self) -> ProducerPhase {
        match &self.shared {
            Some(shared) => shared.state.lock().phase,
            None if self.closed => ProducerPhase::Closed,
            None => ProducerPhase::Idle,
        }
    }

    /// Number of buffers currently lent to the consumer.
    pub fn outstanding(&self) -> usize {
        self.shared
            .as_ref()
            .map_or(0, |shared| shared.state.lock().outstanding.len())
    }

    /// The path actually bound, which differs from the configured one when a
    /// suffix had to be added.
    pub fn socket_path(&self) -> Option<&Path> {
        self.running.as_ref().map(|r| r.socket_path.as_path())
    }

    pub fn mailbox_name(&self) -> Option<String> {
        self.shared.as_ref().map(|s| s.mailbox_name.clone())
    }

    pub fn events(&self) -> Receiver<SessionEvent> {
        self.events_rx.clone()
    }

    pub fn stats(&self) -> ProducerStats {
        self.shared
            .as_ref()
            .map(|shared| shared.state.lock().stats)
            .unwrap_or_default()
    }
}

impl Drop for ProducerSession {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            warn!(error = %e, "error stopping producer");
        }
    }
}

fn bind_with_retry(config: &ProducerConfig) -> Result<(UnixListener, PathBuf)> {
    let attempts = config.bind_attempts.max(1);
    for attempt in 0..attempts {
        let path = candidate_path(&config.socket_path, attempt);
        match UnixListener::bind(&path) {
            Ok(listener) => return Ok((listener, path)),
            Err(e) if e.kind() == ErrorKind::AddrInUse => {
                debug!(path = %path.display(), "socket path in use, trying next suffix");
            }
            Err(e) => return Err(e.into()),
        }
    }
    Err(HandoffError::BindExhausted {
        path: config.socket_path.display().to_string(),
        attempts,
    })
}

/// `/tmp/handoff.0` becomes `/tmp/handoff.1`, `/tmp/handoff.2`, ...; a path
/// without a numeric suffix gets one appended.
pub(crate) fn candidate_path(base: &Path, attempt: usize) -> PathBuf {
    if attempt == 0 {
        return base.to_path_buf();
    }
    let text = base.to_string_lossy();
    if let Some((stem, suffix)) = text.rsplit_once('.') {
        if let Ok(n) = suffix.parse::<usize>() {
            return PathBuf::from(format!("{}.{}", stem, n + attempt));
        }
    }
    PathBuf::from(format!("{}.{}", text, attempt))
}
