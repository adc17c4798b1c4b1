//! Configuration loading and defaults.
//!
//! Configuration is resolved in order of precedence (highest wins):
//!
//! 1. **Environment variables**: `CHAT_RELAY_LISTEN`, `CHAT_RELAY_AGENT_LISTEN`,
//!    `CHAT_RELAY_AGENT_URL`
//! 2. **Config file**: path via `--config <path>`, or `chat-relay.toml` in CWD
//! 3. **Compiled defaults**: see each field's default value below
//!
//! The TOML file mirrors the struct hierarchy:
//!
//! ```toml
//! [server]
//! listen = "0.0.0.0:8766"          # OpenAI-compatible API
//! agent_listen = "0.0.0.0:8765"    # browser agent WebSocket
//!
//! [relay]
//! busy_policy = "reject"           # or "queue"
//! queue_depth = 8
//! queue_timeout_secs = 30
//! idle_timeout_secs = 120
//! trim_snapshots = true
//! verify_checksums = true
//!
//! [logging]
//! level = "info"
//!
//! # Only read by `chat-relay agent`
//! [agent]
//! url = "ws://127.0.0.1:8765"
//! chunk_size = 1024
//! snapshot_steps = 4
//! snapshot_interval_ms = 50
//! max_attempts = 5
//! ack_timeout_ms = 5000
//! heartbeat_interval_secs = 30
//! reconnect_delay_secs = 2
//! reconnect_max_delay_secs = 30
//! ```

use std::path::Path;

use serde::Deserialize;

use crate::error::ConfigError;

/// Default config file looked up in the working directory.
const DEFAULT_CONFIG_FILE: &str = "chat-relay.toml";

/// Top-level configuration, deserialized from TOML.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub relay: RelayConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub agent: AgentConfig,
}

/// Listener addresses.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Socket address for the HTTP API (default `0.0.0.0:8766`).
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Socket address the browser agent connects to (default `0.0.0.0:8765`).
    /// When equal to `listen`, the agent socket is mounted at `/agent`.
    #[serde(default = "default_agent_listen")]
    pub agent_listen: String,
}

/// How a request is handled while another exchange holds the channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BusyPolicy {
    /// Fail immediately with `429`.
    #[default]
    Reject,
    /// Wait FIFO for the channel, bounded by `queue_depth` and `queue_timeout_secs`.
    Queue,
}

/// Relay core behaviour.
#[derive(Debug, Clone, Deserialize)]
pub struct RelayConfig {
    #[serde(default)]
    pub busy_policy: BusyPolicy,
    /// Maximum requests waiting for the channel in queue mode (default 8).
    #[serde(default = "default_queue_depth")]
    pub queue_depth: usize,
    /// Seconds a queued request waits before giving up (default 30).
    #[serde(default = "default_queue_timeout")]
    pub queue_timeout_secs: u64,
    /// Seconds without any agent message before an exchange fails (default 120).
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: u64,
    /// Trim snapshots before diffing (default true).
    #[serde(default = "default_true")]
    pub trim_snapshots: bool,
    /// Verify `completeSha256` on reassembled chunk sets (default true).
    #[serde(default = "default_true")]
    pub verify_checksums: bool,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// tracing filter level (default `info`). Overridden by `RUST_LOG` env var.
    #[serde(default = "default_log_level")]
    pub level: String,
}

/// Settings for the reference echo agent (`chat-relay agent`).
#[derive(Debug, Clone, Deserialize)]
pub struct AgentConfig {
    /// Relay agent socket URL (default `ws://127.0.0.1:8765`).
    #[serde(default = "default_agent_url")]
    pub url: String,
    /// Snapshots longer than this many characters are sent as chunks (default 1024).
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    /// Number of progressive `answer` snapshots per reply (default 4).
    #[serde(default = "default_snapshot_steps")]
    pub snapshot_steps: usize,
    /// Delay between progressive snapshots in milliseconds (default 50).
    #[serde(default = "default_snapshot_interval")]
    pub snapshot_interval_ms: u64,
    /// Send attempts per chunk before giving up (default 5).
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Milliseconds to wait for an ack before resending (default 5000).
    #[serde(default = "default_ack_timeout")]
    pub ack_timeout_ms: u64,
    /// Seconds between heartbeats (default 30).
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_secs: u64,
    /// Initial reconnect backoff in seconds (default 2).
    #[serde(default = "default_reconnect_delay")]
    pub reconnect_delay_secs: u64,
    /// Maximum reconnect backoff in seconds (default 30).
    #[serde(default = "default_reconnect_max_delay")]
    pub reconnect_max_delay_secs: u64,
}

fn default_listen() -> String {
    "0.0.0.0:8766".to_string()
}
fn default_agent_listen() -> String {
    "0.0.0.0:8765".to_string()
}
fn default_queue_depth() -> usize {
    8
}
fn default_queue_timeout() -> u64 {
    30
}
fn default_idle_timeout() -> u64 {
    120
}
fn default_true() -> bool {
    true
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_agent_url() -> String {
    "ws://127.0.0.1:8765".to_string()
}
fn default_chunk_size() -> usize {
    1024
}
fn default_snapshot_steps() -> usize {
    4
}
fn default_snapshot_interval() -> u64 {
    50
}
fn default_max_attempts() -> u32 {
    5
}
fn default_ack_timeout() -> u64 {
    5000
}
fn default_heartbeat_interval() -> u64 {
    30
}
fn default_reconnect_delay() -> u64 {
    2
}
fn default_reconnect_max_delay() -> u64 {
    30
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            agent_listen: default_agent_listen(),
        }
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            busy_policy: BusyPolicy::default(),
            queue_depth: default_queue_depth(),
            queue_timeout_secs: default_queue_timeout(),
            idle_timeout_secs: default_idle_timeout(),
            trim_snapshots: true,
            verify_checksums: true,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            url: default_agent_url(),
            chunk_size: default_chunk_size(),
            snapshot_steps: default_snapshot_steps(),
            snapshot_interval_ms: default_snapshot_interval(),
            max_attempts: default_max_attempts(),
            ack_timeout_ms: default_ack_timeout(),
            heartbeat_interval_secs: default_heartbeat_interval(),
            reconnect_delay_secs: default_reconnect_delay(),
            reconnect_max_delay_secs: default_reconnect_max_delay(),
        }
    }
}

impl Config {
    /// Load configuration with the precedence chain: env vars > file > defaults.
    ///
    /// If `path` is `Some`, reads that file. Otherwise looks for
    /// `chat-relay.toml` in the current directory, falling back to compiled
    /// defaults.
    pub fn load(path: Option<&str>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(p) => Self::from_file(p)?,
            None if Path::new(DEFAULT_CONFIG_FILE).exists() => {
                Self::from_file(DEFAULT_CONFIG_FILE)?
            }
            None => Self::default(),
        };

        // Env var overrides
        if let Ok(listen) = std::env::var("CHAT_RELAY_LISTEN") {
            config.server.listen = listen;
        }
        if let Ok(listen) = std::env::var("CHAT_RELAY_AGENT_LISTEN") {
            config.server.agent_listen = listen;
        }
        if let Ok(url) = std::env::var("CHAT_RELAY_AGENT_URL") {
            config.agent.url = url;
        }

        Ok(config)
    }

    fn from_file(path: &str) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_string(),
            source,
        })?;
        Self::parse(&content).map_err(|source| ConfigError::Parse {
            path: path.to_string(),
            source,
        })
    }

    /// Parse a TOML document; missing sections and fields take their defaults.
    pub fn parse(content: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(content)
    }
}
