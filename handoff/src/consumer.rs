use nix::sys::socket::{getsockopt, sockopt::PeerCredentials};
use parking_lot::Mutex;
use protocol::{
    decode_descriptor, BufferDescriptor, ControlMessage, DescriptorFrame, PlaneInfo, TokenTuple,
    DESCRIPTOR_SIZE, NO_TIMESTAMP,
};
use nix::errno::Errno;
use shmem::{ImportedRegion, Mailbox, ShmemError};
use std::net::Shutdown;
use std::os::unix::net::UnixStream;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::buffer::{Importer, PeerProcess, ProcFdImporter};
use crate::channel::{read_exact, read_message, send_message, MAX_SHM_PATH_LEN};
use crate::config::ConsumerConfig;
use crate::outstanding::{Guarded, InsertError, OutstandingTable};
use crate::poller::{Poller, WaitResult};
use crate::{HandoffError, Result};

const CONTROL_TOKEN: u64 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerPhase {
    Idle,
    Connecting,
    AwaitingShmPath,
    Ready,
    Closed,
}

/// Parts of the session reachable from received buffers, which may be
/// dropped on any thread.
pub(crate) struct ConsumerShared {
    writer: Mutex<Option<UnixStream>>,
    live: Guarded<OutstandingTable<()>>,
}

impl ConsumerShared {
    fn send(&self, message: &ControlMessage) -> Result<()> {
        match self.writer.lock().as_ref() {
            Some(writer) => send_message(writer, message),
            None => Err(HandoffError::NotConnected),
        }
    }

    fn release(&self, tokens: TokenTuple) {
        let message = ControlMessage::BufferRelease {
            tokens: tokens.as_array(),
        };
        match self.send(&message) {
            Ok(()) => debug!(tokens = %tokens, "sent BUFFER_RELEASE"),
            Err(HandoffError::NotConnected) => {
                debug!(tokens = %tokens, "session closed, release not sent")
            }
            Err(e) => warn!(tokens = %tokens, error = %e, "failed to send BUFFER_RELEASE"),
        }
    }
}

/// Interrupts a blocked [`ConsumerSession::pull`] from another thread.
#[derive(Clone)]
pub struct FlushHandle {
    poller: Arc<Poller>,
}

impl FlushHandle {
    pub fn set_flushing(&self, flushing: bool) -> Result<()> {
        self.poller.set_flushing(flushing)
    }

    pub fn is_flushing(&self) -> bool {
        self.poller.is_flushing()
    }
}

/// The receiving side of a handoff session.
pub struct ConsumerSession {
    config: ConsumerConfig,
    importer: Arc<dyn Importer>,
    phase: ConsumerPhase,
    poller: Arc<Poller>,
    control: Option<UnixStream>,
    peer: Option<PeerProcess>,
    mailbox: Option<Mailbox>,
    shared: Arc<ConsumerShared>,
}

impl ConsumerSession {
    pub fn new(config: ConsumerConfig) -> Result<Self> {
        Self::with_importer(config, Arc::new(ProcFdImporter))
    }

    pub fn with_importer(config: ConsumerConfig, importer: Arc<dyn Importer>) -> Result<Self> {
        let live = Guarded::new(OutstandingTable::with_capacity(config.capacity));
        Ok(ConsumerSession {
            config,
            importer,
            phase: ConsumerPhase::Idle,
            poller: Arc::new(Poller::new()?),
            control: None,
            peer: None,
            mailbox: None,
            shared: Arc::new(ConsumerShared {
                writer: Mutex::new(None),
                live,
            }),
        })
    }

    /// Creates a session and, for live sessions, connects right away.
    pub fn open(config: ConsumerConfig) -> Result<Self> {
        let live = config.live;
        let mut session = Self::new(config)?;
        if live {
            session.start()?;
        }
        Ok(session)
    }

    pub fn start(&mut self) -> Result<()> {
        if self.phase != ConsumerPhase::Idle {
            return Err(HandoffError::AlreadyStarted);
        }
        self.phase = ConsumerPhase::Connecting;

        match self.connect() {
            Ok(()) => {
                self.phase = ConsumerPhase::AwaitingShmPath;
                Ok(())
            }
            Err(e) => {
                warn!(path = %self.config.socket_path.display(), error = %e, "consumer failed to connect");
                self.phase = ConsumerPhase::Idle;
                Err(e)
            }
        }
    }

    fn connect(&mut self) -> Result<()> {
        let stream = UnixStream::connect(&self.config.socket_path)?;
        let credentials = getsockopt(&stream, PeerCredentials)?;
        let writer = stream.try_clone()?;
        self.poller.add(&stream, CONTROL_TOKEN)?;

        info!(
            path = %self.config.socket_path.display(),
            peer_pid = credentials.pid(),
            "consumer connected"
        );
        self.peer = Some(PeerProcess {
            pid: credentials.pid(),
        });
        *self.shared.writer.lock() = Some(writer);
        self.control = Some(stream);
        Ok(())
    }

    /// Blocks until the producer hands over a buffer.
    ///
    /// Returns `Ok(None)` once the producer has closed the session, and
    /// `Err(Flushing)` while the flushing flag is set.
    pub fn pull(&mut self) -> Result<Option<ReceivedBuffer>> {
        match self.phase {
            ConsumerPhase::Closed => return Ok(None),
            ConsumerPhase::Idle => self.start()?,
            _ => {}
        }

        loop {
            match self.poller.wait(None)? {
                WaitResult::Ready(_) => {}
                WaitResult::TimedOut => continue,
                WaitResult::Flushing => return Err(HandoffError::Flushing),
            }

            let stream = self.control.as_ref().ok_or(HandoffError::NotConnected)?;
            let message = match read_message(stream)? {
                Some(message) => message,
                None => {
                    warn!("producer closed the connection");
                    return Err(HandoffError::Disconnected);
                }
            };

            match message {
                ControlMessage::ShmPath { len } => {
                    let len = len as usize;
                    if len == 0 || len > MAX_SHM_PATH_LEN {
                        return Err(HandoffError::InvalidShmPath(format!("length {}", len)));
                    }
                    let bytes = read_exact(stream, len)?;
                    let name = String::from_utf8(bytes)
                        .map_err(|e| HandoffError::InvalidShmPath(e.to_string()))?;

                    match Mailbox::open(&name, DESCRIPTOR_SIZE) {
                        Ok(mailbox) => {
                            self.mailbox = Some(mailbox);
                            self.phase = ConsumerPhase::Ready;
                            debug!(mailbox = %name, "mailbox opened");
                        }
                        // The producer stopped before we got here; CLOSE_CLIENT follows.
                        Err(ShmemError::Nix(Errno::ENOENT)) => {
                            warn!(mailbox = %name, "mailbox already unlinked");
                        }
                        Err(e) => return Err(e.into()),
                    }
                }
                ControlMessage::BufferNew { generation } => {
                    return self.receive(generation).map(Some);
                }
                ControlMessage::CloseClient => {
                    info!("producer closed the session");
                    self.phase = ConsumerPhase::Closed;
                    return Ok(None);
                }
                other => warn!(message = other.name(), "unexpected message from producer"),
            }
        }
    }

    fn receive(&self, generation: u64) -> Result<ReceivedBuffer> {
        let mailbox = self
            .mailbox
            .as_ref()
            .ok_or(HandoffError::Unexpected("BUFFER_NEW before SHM_PATH"))?;

        let mut frame = DescriptorFrame::zeroed();
        let copied = mailbox.read(frame.as_mut_bytes());

        // The mailbox is free for reuse once copied out, whatever it held.
        self.shared.send(&ControlMessage::BufferReceived)?;

        match copied {
            Ok(()) => {}
            Err(ShmemError::TornRead) => {
                warn!(generation, "descriptor rewritten during copy");
                return Err(HandoffError::TornDescriptor {
                    expected: generation,
                });
            }
            Err(e) => return Err(e.into()),
        }
        let descriptor = decode_descriptor(&frame)?;
        if descriptor.generation != generation {
            warn!(
                expected = generation,
                found = descriptor.generation,
                "stale descriptor in mailbox"
            );
            return Err(HandoffError::StaleDescriptor {
                expected: generation,
                found: descriptor.generation,
            });
        }

        let tokens = descriptor.token_tuple();
        let peer = self.peer.ok_or(HandoffError::NotConnected)?;

        let mut planes = Vec::with_capacity(descriptor.plane_count as usize);
        for (info, token) in descriptor.active_planes().iter().zip(descriptor.tokens) {
            let len = info.offset as usize + info.size as usize;
            match self.importer.import(&peer, token, len) {
                Ok(region) => planes.push(ReceivedPlane {
                    info: *info,
                    region,
                }),
                Err(e) => {
                    warn!(token, error = %e, "failed to import plane, returning buffer");
                    self.shared.release(tokens);
                    return Err(e);
                }
            }
        }

        {
            let mut live = self.shared.live.lock();
            match live.insert(tokens, ()) {
                Ok(_) => {}
                Err(InsertError::Full(())) => {
                    let capacity = live.capacity();
                    drop(live);
                    warn!(capacity, "too many live buffers, returning buffer");
                    self.shared.release(tokens);
                    return Err(HandoffError::CapacityExceeded(capacity));
                }
                Err(InsertError::Duplicate(())) => {
                    drop(live);
                    warn!(tokens = %tokens, "tokens already live, returning buffer");
                    self.shared.release(tokens);
                    return Err(HandoffError::DuplicateTokens(tokens));
                }
            }
        }

        debug!(generation, tokens = %tokens, "buffer received");
        Ok(ReceivedBuffer {
            descriptor,
            tokens,
            planes,
            session: self.shared.clone(),
        })
    }

    /// Waits for outstanding buffers to come back, then closes the session.
    /// Idempotent.
    pub fn stop(&mut self) -> Result<()> {
        if self.phase == ConsumerPhase::Idle {
            self.phase = ConsumerPhase::Closed;
        }
        if self.control.is_none() && self.mailbox.is_none() {
            self.phase = ConsumerPhase::Closed;
            return Ok(());
        }

        {
            let mut live = self.shared.live.lock();
            let drained = self.shared.live.wait_until(
                &mut live,
                self.config.drain_timeout(),
                |table| table.is_empty(),
            );
            if !drained {
                warn!(count = live.len(), "buffers still held at stop");
            }
        }

        if let Some(writer) = self.shared.writer.lock().take() {
            if let Err(e) = send_message(&writer, &ControlMessage::CloseClient) {
                debug!(error = %e, "could not send CLOSE_CLIENT");
            }
            let _ = writer.shutdown(Shutdown::Both);
        }

        self.poller.set_flushing(true)?;
        if let Some(stream) = self.control.take() {
            let _ = self.poller.remove(&stream);
        }
        self.mailbox = None;
        self.phase = ConsumerPhase::Closed;
        info!("consumer stopped");
        Ok(())
    }

    pub fn flush_handle(&self) -> FlushHandle {
        FlushHandle {
            poller: self.poller.clone(),
        }
    }

    pub fn live_buffers(&self) -> usize {
        self.shared.live.lock().len()
    }

    pub fn phase(&self) -> ConsumerPhase {
        self.phase
    }

    pub fn peer(&self) -> Option<PeerProcess> {
        self.peer
    }
}

impl Drop for ConsumerSession {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            warn!(error = %e, "error stopping consumer");
        }
    }
}

/// One plane of a [`ReceivedBuffer`], mapped read-only.
pub struct ReceivedPlane {
    info: PlaneInfo,
    region: ImportedRegion,
}

impl ReceivedPlane {
    pub fn info(&self) -> PlaneInfo {
        self.info
    }

    pub fn data(&self) -> &[u8] {
        let start = self.info.offset as usize;
        &self.region.as_slice()[start..start + self.info.size as usize]
    }
}

/// A buffer borrowed from the producer. Dropping it returns the buffer.
pub struct ReceivedBuffer {
    descriptor: BufferDescriptor,
    tokens: TokenTuple,
    planes: Vec<ReceivedPlane>,
    session: Arc<ConsumerShared>,
}

impl ReceivedBuffer {
    pub fn descriptor(&self) -> &BufferDescriptor {
        &self.descriptor
    }

    pub fn tokens(&self) -> TokenTuple {
        self.tokens
    }

    pub fn generation(&self) -> u64 {
        self.descriptor.generation
    }

    pub fn width(&self) -> u32 {
        self.descriptor.width
    }

    pub fn height(&self) -> u32 {
        self.descriptor.height
    }

    pub fn format(&self) -> u32 {
        self.descriptor.format
    }

    pub fn pts_ns(&self) -> Option<u64> {
        Some(self.descriptor.pts_ns).filter(|&pts| pts != NO_TIMESTAMP)
    }

    pub fn duration_ns(&self) -> Option<u64> {
        Some(self.descriptor.duration_ns).filter(|&d| d != NO_TIMESTAMP)
    }

    pub fn planes(&self) -> &[ReceivedPlane] {
        &self.planes
    }

    pub fn plane_data(&self, index: usize) -> Option<&[u8]> {
        self.planes.get(index).map(ReceivedPlane::data)
    }
}

impl Drop for ReceivedBuffer {
    fn drop(&mut self) {
        self.planes.clear();

        // The producer may reuse the tokens as soon as it sees the release,
        // so the entry must be gone before `pull` can insert them again.
        let mut live = self.session.live.lock();
        live.remove(&self.tokens);
        self.session.release(self.tokens);
        drop(live);
        self.session.live.notify();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::send_bytes;
    use crate::test_util::init_tracing;
    use rstest::*;
    use std::os::unix::net::UnixListener;
    use std::thread;
    use std::time::Duration;
    use tempfile::TempDir;

    #[fixture]
    fn socket_dir() -> TempDir {
        init_tracing();
        tempfile::tempdir().unwrap()
    }

    #[rstest]
    fn test_lazy_session_connects_on_pull(socket_dir: TempDir) {
        let path = socket_dir.path().join("c.sock");
        let listener = UnixListener::bind(&path).unwrap();

        let mut config = ConsumerConfig::new(&path);
        config.live = false;
        let mut session = ConsumerSession::open(config).unwrap();
        assert_eq!(session.phase(), ConsumerPhase::Idle);

        let producer = thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            send_message(&stream, &ControlMessage::CloseClient).unwrap();
            stream
        });

        assert!(session.pull().unwrap().is_none());
        assert_eq!(session.phase(), ConsumerPhase::Closed);
        assert!(session.pull().unwrap().is_none());

        let _stream = producer.join().unwrap();
        assert_eq!(
            session.peer(),
            Some(PeerProcess {
                pid: std::process::id() as i32
            })
        );
    }

    #[rstest]
    fn test_connect_failure_returns_to_idle(socket_dir: TempDir) {
        let mut session =
            ConsumerSession::new(ConsumerConfig::new(socket_dir.path().join("absent"))).unwrap();

        assert!(session.start().is_err());
        assert_eq!(session.phase(), ConsumerPhase::Idle);
    }

    #[rstest]
    fn test_buffer_new_before_shm_path_is_rejected(socket_dir: TempDir) {
        let path = socket_dir.path().join("c.sock");
        let listener = UnixListener::bind(&path).unwrap();
        let mut session = ConsumerSession::open(ConsumerConfig::new(&path)).unwrap();

        let (stream, _) = listener.accept().unwrap();
        send_message(&stream, &ControlMessage::BufferNew { generation: 1 }).unwrap();

        assert!(matches!(session.pull(), Err(HandoffError::Unexpected(_))));
    }

    #[rstest]
    fn test_oversized_shm_path_is_rejected(socket_dir: TempDir) {
        let path = socket_dir.path().join("c.sock");
        let listener = UnixListener::bind(&path).unwrap();
        let mut session = ConsumerSession::open(ConsumerConfig::new(&path)).unwrap();

        let (stream, _) = listener.accept().unwrap();
        send_message(&stream, &ControlMessage::ShmPath { len: 4096 }).unwrap();

        assert!(matches!(session.pull(), Err(HandoffError::InvalidShmPath(_))));
    }

    #[rstest]
    fn test_unlinked_mailbox_then_close_ends_stream(socket_dir: TempDir) {
        let path = socket_dir.path().join("c.sock");
        let listener = UnixListener::bind(&path).unwrap();
        let mut session = ConsumerSession::open(ConsumerConfig::new(&path)).unwrap();

        let (stream, _) = listener.accept().unwrap();
        let name = b"/handoff-test.gone.0";
        send_message(
            &stream,
            &ControlMessage::ShmPath {
                len: name.len() as u32,
            },
        )
        .unwrap();
        send_bytes(&stream, name).unwrap();
        send_message(&stream, &ControlMessage::CloseClient).unwrap();

        assert!(session.pull().unwrap().is_none());
        assert_eq!(session.phase(), ConsumerPhase::Closed);
    }

    #[rstest]
    fn test_peer_hangup_is_disconnect(socket_dir: TempDir) {
        let path = socket_dir.path().join("c.sock");
        let listener = UnixListener::bind(&path).unwrap();
        let mut session = ConsumerSession::open(ConsumerConfig::new(&path)).unwrap();

        let (stream, _) = listener.accept().unwrap();
        drop(stream);

        assert!(matches!(session.pull(), Err(HandoffError::Disconnected)));
    }

    #[rstest]
    fn test_flush_handle_interrupts_pull(socket_dir: TempDir) {
        let path = socket_dir.path().join("c.sock");
        let listener = UnixListener::bind(&path).unwrap();
        let mut session = ConsumerSession::open(ConsumerConfig::new(&path)).unwrap();
        let (_stream, _) = listener.accept().unwrap();

        let flush = session.flush_handle();
        let flusher = thread::spawn(move || {
            thread::sleep(Duration::from_millis(30));
            flush.set_flushing(true).unwrap();
        });

        assert!(matches!(session.pull(), Err(HandoffError::Flushing)));
        flusher.join().unwrap();

        session.flush_handle().set_flushing(false).unwrap();
        assert!(!session.flush_handle().is_flushing());
    }
}
