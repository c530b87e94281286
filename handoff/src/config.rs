use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_SOCKET_PATH: &str = "/tmp/handoff.0";
pub const DEFAULT_CAPACITY: usize = 30;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProducerConfig {
    #[serde(default = "default_socket_path")]
    pub socket_path: PathBuf,

    /// Mode applied to the control socket; the mailbox gets the same bits
    /// without execute permission.
    #[serde(default = "default_permissions")]
    pub permissions: u32,

    #[serde(default = "default_mailbox_prefix")]
    pub mailbox_prefix: String,

    #[serde(default = "default_bind_attempts")]
    pub bind_attempts: usize,

    #[serde(default = "default_capacity")]
    pub capacity: usize,

    #[serde(default = "default_ack_timeout_ms")]
    pub ack_timeout_ms: u64,

    #[serde(default = "default_drain_timeout_ms")]
    pub drain_timeout_ms: u64,

    /// Release everything lent to a client as soon as it disconnects instead
    /// of waiting for the shutdown drain.
    #[serde(default)]
    pub release_on_disconnect: bool,
}

impl ProducerConfig {
    pub fn new(socket_path: impl Into<PathBuf>) -> Self {
        ProducerConfig {
            socket_path: socket_path.into(),
            ..Default::default()
        }
    }

    pub fn ack_timeout(&self) -> Duration {
        Duration::from_millis(self.ack_timeout_ms)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }
}

impl Default for ProducerConfig {
    fn default() -> Self {
        ProducerConfig {
            socket_path: default_socket_path(),
            permissions: default_permissions(),
            mailbox_prefix: default_mailbox_prefix(),
            bind_attempts: default_bind_attempts(),
            capacity: default_capacity(),
            ack_timeout_ms: default_ack_timeout_ms(),
            drain_timeout_ms: default_drain_timeout_ms(),
            release_on_disconnect: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsumerConfig {
    #[serde(default = "default_socket_path")]
    pub socket_path: PathBuf,

    /// Connect as soon as the session is opened rather than on the first pull.
    #[serde(default = "default_live")]
    pub live: bool,

    #[serde(default = "default_capacity")]
    pub capacity: usize,

    #[serde(default = "default_drain_timeout_ms")]
    pub drain_timeout_ms: u64,
}

impl ConsumerConfig {
    pub fn new(socket_path: impl Into<PathBuf>) -> Self {
        ConsumerConfig {
            socket_path: socket_path.into(),
            ..Default::default()
        }
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        ConsumerConfig {
            socket_path: default_socket_path(),
            live: default_live(),
            capacity: default_capacity(),
            drain_timeout_ms: default_drain_timeout_ms(),
        }
    }
}

fn default_socket_path() -> PathBuf {
    PathBuf::from(DEFAULT_SOCKET_PATH)
}

fn default_permissions() -> u32 {
    0o660
}

fn default_mailbox_prefix() -> String {
    "handoff-mailbox".to_string()
}

fn default_bind_attempts() -> usize {
    10
}

fn default_capacity() -> usize {
    DEFAULT_CAPACITY
}

fn default_ack_timeout_ms() -> u64 {
    200
}

fn default_drain_timeout_ms() -> u64 {
    3000
}

fn default_live() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    fn test_producer_defaults_from_empty_toml() {
        let config: ProducerConfig = toml::from_str("").unwrap();

        assert_eq!(config.socket_path, PathBuf::from(DEFAULT_SOCKET_PATH));
        assert_eq!(config.permissions, 0o660);
        assert_eq!(config.capacity, 30);
        assert_eq!(config.ack_timeout(), Duration::from_millis(200));
        assert_eq!(config.drain_timeout(), Duration::from_secs(3));
        assert!(!config.release_on_disconnect);
    }

    #[rstest]
    fn test_producer_overrides() {
        let config: ProducerConfig = toml::from_str(
            r#"
socket_path = "/tmp/test.sock"
permissions = 0o640
ack_timeout_ms = 0
release_on_disconnect = true
"#,
        )
        .unwrap();

        assert_eq!(config.socket_path, PathBuf::from("/tmp/test.sock"));
        assert_eq!(config.permissions, 0o640);
        assert_eq!(config.ack_timeout(), Duration::ZERO);
        assert!(config.release_on_disconnect);
    }

    #[rstest]
    fn test_consumer_defaults() {
        let config: ConsumerConfig = toml::from_str(r#"socket_path = "/tmp/x.sock""#).unwrap();

        assert_eq!(config.socket_path, PathBuf::from("/tmp/x.sock"));
        assert!(config.live);
        assert_eq!(config.drain_timeout(), Duration::from_secs(3));
    }
}
