//! Configuration for the relay engine
//!
//! Compile-time defaults are grouped in constant modules; `RelayConfig`
//! carries the runtime values and can be loaded from JSON.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{RelayError, Result};

/// Network-related configuration
pub mod network {
    /// User agent for HTTP requests
    pub const USER_AGENT: &str = concat!("icyrelay/", env!("CARGO_PKG_VERSION"));

    /// Connection timeout in seconds
    pub const CONNECT_TIMEOUT_SECS: u64 = 10;

    /// Read timeout in seconds (no data for this long counts as a dead connection)
    pub const READ_TIMEOUT_SECS: u64 = 15;

    /// Chunk size for network reads (bytes)
    pub const READ_CHUNK_SIZE: usize = 8 * 1024;

    /// How long `stop()` waits for the receive thread before detaching it (milliseconds)
    pub const STOP_GRACE_MS: u64 = 200;
}

/// Stream buffer configuration
pub mod buffer {
    /// Maximum buffered audio (bytes)
    pub const CAPACITY_BYTES: usize = 1024 * 1024;

    /// Buffered bytes required before leaving `Buffering`.
    /// 64KB is ~2-4 seconds of audio for typical radio streams (128-256 kbps).
    pub const READY_THRESHOLD_BYTES: usize = 64 * 1024;

    /// How often blocked producers/consumers re-check for cancellation (milliseconds)
    pub const WAIT_SLICE_MS: u64 = 100;
}

/// Reconnect policy configuration
pub mod retry {
    /// Attempts after a connectivity fault before settling in `Error`
    pub const MAX_RETRIES: u32 = 5;

    /// Delay before each `Reconnecting -> Connecting` transition (milliseconds)
    pub const RETRY_DELAY_MS: u64 = 2000;

    /// Granularity of the cancellable retry sleep (milliseconds)
    pub const CANCEL_CHECK_MS: u64 = 50;
}

/// Event publication configuration
pub mod events {
    /// Minimum time between two progress events (milliseconds)
    pub const PROGRESS_INTERVAL_MS: u64 = 250;
}

/// Local proxy configuration
pub mod proxy {
    /// Content type served when the upstream does not declare one
    pub const FALLBACK_CONTENT_TYPE: &str = "audio/mpeg";

    /// Read timeout for the client's request head (seconds)
    pub const REQUEST_READ_TIMEOUT_SECS: u64 = 5;

    /// Maximum size of a client request head (bytes)
    pub const MAX_REQUEST_HEAD_BYTES: usize = 16 * 1024;

    /// How often the accept loop polls for shutdown (milliseconds)
    pub const ACCEPT_POLL_MS: u64 = 50;
}

/// What the proxy does when a second local client connects
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionPolicy {
    /// Close the current session and serve the newcomer
    #[default]
    Replace,
    /// Answer the newcomer with 503 and keep the current session
    Reject,
}

/// Runtime settings for a relay session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Time allowed for DNS + TCP + response headers before `ConnectionError`
    #[serde(with = "duration_ms")]
    pub connect_timeout: Duration,

    /// Time allowed between two body reads before the connection is considered dead
    #[serde(with = "duration_ms")]
    pub read_timeout: Duration,

    /// Reconnect attempts before the terminal `Error` state
    pub max_retries: u32,

    /// Wait before each reconnect attempt
    #[serde(with = "duration_ms")]
    pub retry_delay: Duration,

    /// Stream buffer capacity in bytes
    pub buffer_capacity: usize,

    /// Buffered bytes needed for `Buffering -> Streaming`
    pub ready_threshold: usize,

    /// Minimum interval between progress events
    #[serde(with = "duration_ms")]
    pub progress_interval: Duration,

    /// Loopback port for the proxy (0 = ephemeral)
    pub bind_port: u16,

    /// Handling of a second concurrent local client
    pub session_policy: SessionPolicy,

    /// User agent sent upstream
    pub user_agent: String,

    /// Content type served when the upstream declares none
    pub fallback_content_type: String,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(network::CONNECT_TIMEOUT_SECS),
            read_timeout: Duration::from_secs(network::READ_TIMEOUT_SECS),
            max_retries: retry::MAX_RETRIES,
            retry_delay: Duration::from_millis(retry::RETRY_DELAY_MS),
            buffer_capacity: buffer::CAPACITY_BYTES,
            ready_threshold: buffer::READY_THRESHOLD_BYTES,
            progress_interval: Duration::from_millis(events::PROGRESS_INTERVAL_MS),
            bind_port: 0,
            session_policy: SessionPolicy::Replace,
            user_agent: network::USER_AGENT.to_string(),
            fallback_content_type: proxy::FALLBACK_CONTENT_TYPE.to_string(),
        }
    }
}

impl RelayConfig {
    /// Load settings from a JSON file. Missing fields take their defaults.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&raw)
            .map_err(|e| RelayError::Config(format!("{}: {}", path.display(), e)))?;
        config.validate()
    }

    /// Check invariants and normalize derived values.
    ///
    /// The ready threshold is clamped to the capacity, otherwise `Buffering`
    /// could never complete.
    pub fn validate(mut self) -> Result<Self> {
        if self.buffer_capacity == 0 {
            return Err(RelayError::Config(
                "buffer_capacity must be greater than zero".to_string(),
            ));
        }
        if self.read_timeout.is_zero() {
            return Err(RelayError::Config(
                "read_timeout must be greater than zero".to_string(),
            ));
        }
        self.ready_threshold = self.ready_threshold.clamp(1, self.buffer_capacity);
        Ok(self)
    }
}

mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_constants() {
        let c = RelayConfig::default();
        assert_eq!(c.max_retries, retry::MAX_RETRIES);
        assert_eq!(c.buffer_capacity, buffer::CAPACITY_BYTES);
        assert_eq!(c.bind_port, 0);
        assert_eq!(c.session_policy, SessionPolicy::Replace);
        assert_eq!(c.fallback_content_type, "audio/mpeg");
        assert!(c.user_agent.starts_with("icyrelay/"));
    }

    #[test]
    fn json_uses_milliseconds_and_defaults() {
        let c: RelayConfig =
            serde_json::from_str(r#"{"retry_delay": 500, "max_retries": 2}"#).unwrap();
        assert_eq!(c.retry_delay, Duration::from_millis(500));
        assert_eq!(c.max_retries, 2);
        assert_eq!(c.buffer_capacity, buffer::CAPACITY_BYTES);

        let json = serde_json::to_value(&c).unwrap();
        assert_eq!(json["retry_delay"], 500);
    }

    #[test]
    fn session_policy_from_json() {
        let c: RelayConfig = serde_json::from_str(r#"{"session_policy": "reject"}"#).unwrap();
        assert_eq!(c.session_policy, SessionPolicy::Reject);
    }

    #[test]
    fn validate_rejects_zero_capacity() {
        let c = RelayConfig {
            buffer_capacity: 0,
            ..RelayConfig::default()
        };
        assert!(matches!(c.validate(), Err(RelayError::Config(_))));
    }

    #[test]
    fn validate_clamps_threshold() {
        let c = RelayConfig {
            buffer_capacity: 1000,
            ready_threshold: 5000,
            ..RelayConfig::default()
        }
        .validate()
        .unwrap();
        assert_eq!(c.ready_threshold, 1000);
    }

    #[test]
    fn load_from_file() {
        let path = std::env::temp_dir().join(format!("icyrelay-config-{}.json", std::process::id()));
        std::fs::write(&path, r#"{"bind_port": 8123, "ready_threshold": 0}"#).unwrap();
        let c = RelayConfig::from_json_file(&path).unwrap();
        std::fs::remove_file(&path).ok();
        assert_eq!(c.bind_port, 8123);
        assert_eq!(c.ready_threshold, 1);
    }

    #[test]
    fn load_from_bad_file_is_config_error() {
        let path = std::env::temp_dir().join(format!("icyrelay-bad-{}.json", std::process::id()));
        std::fs::write(&path, "not json").unwrap();
        let err = RelayConfig::from_json_file(&path).unwrap_err();
        std::fs::remove_file(&path).ok();
        assert!(matches!(err, RelayError::Config(_)));
    }
}
