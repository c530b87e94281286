use protocol::{ProtocolError, TokenTuple, MAX_PLANES};
use shmem::ShmemError;
use thiserror::Error;

pub mod buffer;
pub(crate) mod channel;
pub mod config;
pub mod consumer;
pub(crate) mod listener_thread;
pub mod outstanding;
pub mod poller;
pub mod producer;

pub use buffer::{Exporter, FdExporter, Importer, MediaBuffer, PeerProcess, Plane, ProcFdImporter};
pub use config::{ConsumerConfig, ProducerConfig};
pub use consumer::{ConsumerPhase, ConsumerSession, FlushHandle, ReceivedBuffer, ReceivedPlane};
pub use producer::{ProducerPhase, ProducerSession, ProducerStats, PublishOutcome, SessionEvent};

#[derive(Error, Debug)]
pub enum HandoffError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("System error: {0}")]
    Nix(#[from] nix::Error),
    #[error("shared memory error: {0}")]
    Shmem(#[from] ShmemError),
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),
    #[error("no free socket path after {attempts} attempts starting at {path}")]
    BindExhausted { path: String, attempts: usize },
    #[error("session already started")]
    AlreadyStarted,
    #[error("session is not connected")]
    NotConnected,
    #[error("peer disconnected")]
    Disconnected,
    #[error("unexpected message: {0}")]
    Unexpected(&'static str),
    #[error("invalid mailbox path: {0}")]
    InvalidShmPath(String),
    #[error("export of plane {plane} failed: {reason}")]
    Export { plane: usize, reason: String },
    #[error("import of token {token} failed: {reason}")]
    Import { token: i32, reason: String },
    #[error("stale descriptor: expected generation {expected}, mailbox holds {found}")]
    StaleDescriptor { expected: u64, found: u64 },
    #[error("descriptor for generation {expected} was overwritten while being read")]
    TornDescriptor { expected: u64 },
    #[error("outstanding table full ({0} entries)")]
    CapacityExceeded(usize),
    #[error("buffer with tokens {0} is already outstanding")]
    DuplicateTokens(TokenTuple),
    #[error("buffer has {0} planes, expected 1 to {max}", max = MAX_PLANES)]
    InvalidPlaneCount(usize),
    #[error("plane layout exceeds its memory: offset {offset} + size {size} > {available}")]
    InvalidPlaneLayout {
        offset: usize,
        size: usize,
        available: usize,
    },
    #[error("session is flushing")]
    Flushing,
}

impl HandoffError {
    /// Whether the error ends the session, as opposed to costing a single buffer.
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            HandoffError::Export { .. }
                | HandoffError::Import { .. }
                | HandoffError::StaleDescriptor { .. }
                | HandoffError::TornDescriptor { .. }
                | HandoffError::CapacityExceeded(_)
                | HandoffError::DuplicateTokens(_)
                | HandoffError::InvalidPlaneCount(_)
                | HandoffError::InvalidPlaneLayout { .. }
                | HandoffError::Flushing
        )
    }
}

pub type Result<T> = std::result::Result<T, HandoffError>;


#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::capacity(HandoffError::CapacityExceeded(30), false)]
    #[case::export(HandoffError::Export { plane: 0, reason: "denied".into() }, false)]
    #[case::stale(HandoffError::StaleDescriptor { expected: 2, found: 1 }, false)]
    #[case::torn(HandoffError::TornDescriptor { expected: 4 }, false)]
    #[case::flushing(HandoffError::Flushing, false)]
    #[case::disconnected(HandoffError::Disconnected, true)]
    #[case::short_read(
        HandoffError::Protocol(ProtocolError::ShortRead { expected: 32, actual: 3 }),
        true
    )]
    #[case::bind(HandoffError::BindExhausted { path: "/tmp/x".into(), attempts: 3 }, true)]
    fn test_error_classification(#[case] error: HandoffError, #[case] fatal: bool) {
        assert_eq!(error.is_fatal(), fatal);
    }
}
