//! Configuration loading for walletsync clients.
//!
//! Configuration is loaded from a TOML file (default: `walletsync.toml`):
//!
//! ```toml
//! [channel]
//! url = "tcp://127.0.0.1:9000"
//! request_timeout_secs = 30
//!
//! [engine]
//! namespace = "walletsync"
//! state_path = "walletsync.json"
//! ```

use serde::Deserialize;
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use walletsync_core::BackoffPolicy;

/// Root configuration for a walletsync client.
#[derive(Debug, Clone, Deserialize)]
pub struct ClientConfig {
    /// RPC channel configuration.
    pub channel: ChannelConfig,
    /// Sync engine options.
    #[serde(default)]
    pub engine: EngineOptions,
}

/// RPC channel configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ChannelConfig {
    /// Server address handed to the transport.
    pub url: String,
    /// Per-call timeout in seconds; 0 waits forever (default: 30).
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    /// Consecutive timeouts before the channel forces a reconnect (default: 3).
    #[serde(default = "default_max_consecutive_timeouts")]
    pub max_consecutive_timeouts: u32,
    /// First reconnect delay in seconds (default: 1).
    #[serde(default = "default_reconnect_base_secs")]
    pub reconnect_base_secs: u64,
    /// Reconnect delay cap in seconds (default: 30).
    #[serde(default = "default_reconnect_max_secs")]
    pub reconnect_max_secs: u64,
    /// Random jitter added to each reconnect delay (default: 1000ms).
    #[serde(default = "default_reconnect_jitter_ms")]
    pub reconnect_jitter_ms: u64,
    /// Maximum requests in flight (default: 1024).
    #[serde(default = "default_max_pending")]
    pub max_pending: usize,
    /// Method called right after every (re)connect, e.g. a login.
    #[serde(default)]
    pub handshake_method: Option<String>,
    /// Params for the handshake call.
    #[serde(default)]
    pub handshake_params: Value,
    /// Re-send registered subscriptions after a reconnect (default: true).
    #[serde(default = "default_replay_subscriptions")]
    pub replay_subscriptions: bool,
}

/// SyncEngine options.
#[derive(Debug, Clone, Deserialize)]
pub struct EngineOptions {
    /// Key under which the replica state is persisted (default: "walletsync").
    #[serde(default = "default_namespace")]
    pub namespace: String,
    /// Backup server used when the replica has none recorded.
    #[serde(default)]
    pub remote_url: Option<String>,
    /// Write the replica to disk; false keeps it in memory (default: true).
    #[serde(default = "default_persist")]
    pub persist: bool,
    /// Replica file location (default: walletsync.json).
    #[serde(default = "default_state_path")]
    pub state_path: PathBuf,
}

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read config file.
    #[error("failed to read config file '{path}': {source}")]
    ReadError {
        /// Path that failed.
        path: PathBuf,
        /// Underlying error.
        source: std::io::Error,
    },
    /// Failed to parse config file.
    #[error("failed to parse config file '{path}': {source}")]
    ParseError {
        /// Path that failed.
        path: PathBuf,
        /// Underlying error.
        source: toml::de::Error,
    },
}

// Default value functions
fn default_request_timeout_secs() -> u64 {
    30
}

fn default_max_consecutive_timeouts() -> u32 {
    3
}

fn default_reconnect_base_secs() -> u64 {
    1
}

fn default_reconnect_max_secs() -> u64 {
    30
}

fn default_reconnect_jitter_ms() -> u64 {
    1000
}

fn default_max_pending() -> usize {
    1024
}

fn default_replay_subscriptions() -> bool {
    true
}

fn default_namespace() -> String {
    "walletsync".to_string()
}

fn default_persist() -> bool {
    true
}

fn default_state_path() -> PathBuf {
    PathBuf::from("walletsync.json")
}

impl ClientConfig {
    /// Load configuration from a TOML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
            path: path.to_path_buf(),
            source: e,
        })?;
        toml::from_str(&content).map_err(|e| ConfigError::ParseError {
            path: path.to_path_buf(),
            source: e,
        })
    }
}

impl ChannelConfig {
    /// Create a channel config with defaults for everything but the url.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            request_timeout_secs: default_request_timeout_secs(),
            max_consecutive_timeouts: default_max_consecutive_timeouts(),
            reconnect_base_secs: default_reconnect_base_secs(),
            reconnect_max_secs: default_reconnect_max_secs(),
            reconnect_jitter_ms: default_reconnect_jitter_ms(),
            max_pending: default_max_pending(),
            handshake_method: None,
            handshake_params: Value::Null,
            replay_subscriptions: default_replay_subscriptions(),
        }
    }

    /// Set the per-call timeout (zero disables it).
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout_secs = timeout.as_secs();
        self
    }

    /// Set the handshake call re-sent on every (re)connect.
    pub fn with_handshake(mut self, method: impl Into<String>, params: Value) -> Self {
        self.handshake_method = Some(method.into());
        self.handshake_params = params;
        self
    }

    /// Set reconnect backoff bounds.
    pub fn with_reconnect(mut self, base_secs: u64, max_secs: u64, jitter_ms: u64) -> Self {
        self.reconnect_base_secs = base_secs;
        self.reconnect_max_secs = max_secs;
        self.reconnect_jitter_ms = jitter_ms;
        self
    }

    /// Enable or disable subscription replay after reconnect.
    pub fn with_replay_subscriptions(mut self, replay: bool) -> Self {
        self.replay_subscriptions = replay;
        self
    }

    /// Set the number of consecutive timeouts that force a reconnect.
    pub fn with_max_consecutive_timeouts(mut self, max: u32) -> Self {
        self.max_consecutive_timeouts = max;
        self
    }

    /// Per-call timeout, `None` when disabled.
    pub fn request_timeout(&self) -> Option<Duration> {
        (self.request_timeout_secs > 0).then(|| Duration::from_secs(self.request_timeout_secs))
    }

    /// Reconnect backoff policy.
    pub fn backoff(&self) -> BackoffPolicy {
        BackoffPolicy {
            base: Duration::from_secs(self.reconnect_base_secs),
            max: Duration::from_secs(self.reconnect_max_secs),
            jitter: Duration::from_millis(self.reconnect_jitter_ms),
        }
    }
}

impl EngineOptions {
    /// Set the replica namespace.
    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    /// Set the default backup server.
    pub fn with_remote_url(mut self, url: impl Into<String>) -> Self {
        self.remote_url = Some(url.into());
        self
    }

    /// Keep the replica in memory only.
    pub fn in_memory(mut self) -> Self {
        self.persist = false;
        self
    }

    /// Set the replica file location.
    pub fn with_state_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.state_path = path.into();
        self
    }
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            namespace: default_namespace(),
            remote_url: None,
            persist: default_persist(),
            state_path: default_state_path(),
        }
    }
}
