//! Relay error taxonomy.
//!
//! Every per-exchange failure resolves the caller's response with one of these.
//! [`RelayError::code`] is the stable wire identifier; [`RelayError::status`]
//! maps it onto the HTTP surface.

use axum::http::StatusCode;
use thiserror::Error;

/// Failures of the relay core.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RelayError {
    /// No agent is connected to the control channel.
    #[error("no browser agent connected")]
    ChannelUnavailable,

    /// Another exchange holds the channel.
    #[error("agent is busy with another request")]
    Busy,

    /// A channel frame failed to parse or carried an unknown `type`.
    #[error("malformed channel message: {0}")]
    MalformedMessage(String),

    /// Conflicting chunk totals or a shrinking snapshot. Never fatal.
    #[error("protocol inconsistency: {0}")]
    ProtocolInconsistency(String),

    /// A chunk exhausted its retry budget on the sending side.
    #[error("chunk {index} not acknowledged after {attempts} attempts")]
    ChunkDeliveryFailure { index: u32, attempts: u32 },

    /// The control channel went away mid-exchange.
    #[error("agent session lost: {0}")]
    SessionLost(String),

    /// The agent reported a failure with an `error` message.
    #[error("agent error {code}: {message}")]
    Agent { code: String, message: String },

    /// No message arrived within the idle timeout.
    #[error("no response from agent within {0}s")]
    Timeout(u64),
}

impl RelayError {
    /// Stable machine-readable code.
    pub fn code(&self) -> &'static str {
        match self {
            Self::ChannelUnavailable => "CHANNEL_UNAVAILABLE",
            Self::Busy => "AGENT_BUSY",
            Self::MalformedMessage(_) => "MALFORMED_MESSAGE",
            Self::ProtocolInconsistency(_) => "PROTOCOL_INCONSISTENCY",
            Self::ChunkDeliveryFailure { .. } => "CHUNK_DELIVERY_FAILURE",
            Self::SessionLost(_) => "SESSION_LOST",
            Self::Agent { .. } => "AGENT_ERROR",
            Self::Timeout(_) => "AGENT_TIMEOUT",
        }
    }

    /// HTTP status used when the error terminates an external request.
    pub fn status(&self) -> StatusCode {
        match self {
            Self::ChannelUnavailable => StatusCode::SERVICE_UNAVAILABLE,
            Self::Busy => StatusCode::TOO_MANY_REQUESTS,
            Self::ChunkDeliveryFailure { .. } | Self::SessionLost(_) | Self::Agent { .. } => {
                StatusCode::BAD_GATEWAY
            }
            Self::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            Self::MalformedMessage(_) | Self::ProtocolInconsistency(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

/// Failures while loading configuration at startup.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: toml::de::Error,
    },
}
