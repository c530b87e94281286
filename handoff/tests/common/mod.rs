#![allow(dead_code)]

use handoff::{
    ConsumerConfig, ConsumerSession, MediaBuffer, Plane, ProducerConfig, ProducerSession,
    SessionEvent,
};
use protocol::fourcc;
use shmem::{page_size, SharedMemory};
use std::path::PathBuf;
use std::sync::{Arc, Once};
use std::thread;
use std::time::{Duration, Instant};
use tempfile::TempDir;

static INIT: Once = Once::new();

pub fn init_tracing() {
    INIT.call_once(|| {
        tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("debug")),
            )
            .with_test_writer()
            .init();
    });
}

pub const EVENT_TIMEOUT: Duration = Duration::from_secs(2);

/// A started producer and a connected consumer in one temp directory.
pub struct TestPair {
    pub producer: ProducerSession,
    pub consumer: ConsumerSession,
    pub socket_path: PathBuf,
    pub temp_dir: TempDir,
}

impl TestPair {
    pub fn new() -> Self {
        Self::with_configs(|_| {}, |_| {})
    }

    pub fn with_configs(
        producer: impl FnOnce(&mut ProducerConfig),
        consumer: impl FnOnce(&mut ConsumerConfig),
    ) -> Self {
        init_tracing();
        let temp_dir = TempDir::new().unwrap();
        let socket_path = temp_dir.path().join("test.sock");

        let mut producer_config = ProducerConfig::new(&socket_path);
        producer_config.mailbox_prefix = "handoff-test".to_string();
        producer(&mut producer_config);
        let mut producer = ProducerSession::new(producer_config);
        producer.start().unwrap();
        let events = producer.events();

        let socket_path = producer.socket_path().unwrap().to_path_buf();
        let mut consumer_config = ConsumerConfig::new(&socket_path);
        consumer(&mut consumer_config);
        let consumer = ConsumerSession::open(consumer_config).unwrap();

        match events.recv_timeout(EVENT_TIMEOUT).unwrap() {
            SessionEvent::ClientConnected { .. } => {}
            other => panic!("expected a connection, got {:?}", other),
        }

        TestPair {
            producer,
            consumer,
            socket_path,
            temp_dir,
        }
    }
}

/// A single-plane grey frame filled with `value`.
pub fn frame(value: u8) -> Arc<MediaBuffer> {
    let mut memory = SharedMemory::new(page_size()).unwrap();
    memory.as_mut_slice().fill(value);
    let plane = Plane::new(memory, 64, fourcc(b"GREY")).unwrap();
    Arc::new(MediaBuffer::new(vec![plane], 64, 64, fourcc(b"GREY")).unwrap())
}

pub fn wait_for(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    condition()
}
