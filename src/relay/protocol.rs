//! Control-channel envelope.
//!
//! JSON text frames with a `type` discriminator. The module knows nothing about
//! sockets; the agent WebSocket handler and the reference agent adapt these
//! types to their transport.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::RelayError;

/// Turn to be played by the agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestPayload {
    pub text: String,
    pub model: String,
    #[serde(rename = "newChat", default = "default_new_chat")]
    pub new_chat: bool,
}

fn default_new_chat() -> bool {
    true
}

/// Per-chunk acknowledgment status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AckStatus {
    Success,
    Retry,
}

/// Receiver's verdict on one chunk, correlated by index only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkAck {
    pub index: u32,
    pub status: AckStatus,
}

/// One indexed fragment of a snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chunk {
    pub index: u32,
    pub total: u32,
    #[serde(rename = "data", alias = "chunk")]
    pub text: String,
    /// Lowercase hex SHA-256 of the whole reassembled snapshot.
    #[serde(
        rename = "completeSha256",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub complete_sha256: Option<String>,
}

/// Frames sent by the relay to the agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum RelayMessage {
    Request { data: RequestPayload },
    Ack(ChunkAck),
}

/// Frames sent by the agent to the relay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum AgentMessage {
    /// Complete reply-so-far snapshot.
    Answer { text: String },
    Chunk(Chunk),
    /// Sender-facing; the relay ignores these.
    Ack(ChunkAck),
    /// Terminal. `text`, when present, is a final snapshot bundled with the stop.
    Stop {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        text: Option<String>,
    },
    Heartbeat,
    Error {
        #[serde(default, deserialize_with = "lenient_code")]
        code: String,
        #[serde(default)]
        message: String,
    },
}

/// Accept `"code": "E1"` as well as `"code": 500`.
fn lenient_code<'de, D: serde::Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
    Ok(match Value::deserialize(deserializer)? {
        Value::String(s) => s,
        Value::Null => String::new(),
        other => other.to_string(),
    })
}

const AGENT_MESSAGE_TYPES: &[&str] = &["answer", "chunk", "ack", "stop", "heartbeat", "error"];
const RELAY_MESSAGE_TYPES: &[&str] = &["request", "ack"];

/// Parse an agent frame.
///
/// Invalid JSON, a missing or unknown `type`, and a known `type` with the wrong
/// shape all map to [`RelayError::MalformedMessage`].
pub fn parse_agent_message(text: &str) -> Result<AgentMessage, RelayError> {
    parse_tagged(text, AGENT_MESSAGE_TYPES)
}

/// Parse a relay frame (agent side).
pub fn parse_relay_message(text: &str) -> Result<RelayMessage, RelayError> {
    parse_tagged(text, RELAY_MESSAGE_TYPES)
}

fn parse_tagged<T: serde::de::DeserializeOwned>(
    text: &str,
    known: &[&str],
) -> Result<T, RelayError> {
    let value: Value = serde_json::from_str(text)
        .map_err(|e| RelayError::MalformedMessage(format!("invalid JSON: {e}")))?;
    let kind = match value.get("type").and_then(Value::as_str) {
        Some(kind) if known.contains(&kind) => kind.to_string(),
        Some(kind) => {
            return Err(RelayError::MalformedMessage(format!(
                "unknown message type {kind:?}"
            )))
        }
        None => {
            return Err(RelayError::MalformedMessage(
                "missing message type".to_string(),
            ))
        }
    };
    serde_json::from_value(value)
        .map_err(|e| RelayError::MalformedMessage(format!("invalid {kind} message: {e}")))
}

/// Serialize a frame for the wire.
pub fn encode<T: Serialize>(message: &T) -> Result<String, RelayError> {
    serde_json::to_string(message)
        .map_err(|e| RelayError::MalformedMessage(format!("failed to encode frame: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_request_envelope_shape() {
        let msg = RelayMessage::Request {
            data: RequestPayload {
                text: "hi".into(),
                model: "gpt-4o".into(),
                new_chat: true,
            },
        };
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(
            value,
            json!({"type": "request", "data": {"text": "hi", "model": "gpt-4o", "newChat": true}})
        );
    }

    #[test]
    fn test_ack_envelope_shape() {
        let msg = RelayMessage::Ack(ChunkAck {
            index: 2,
            status: AckStatus::Retry,
        });
        assert_eq!(
            serde_json::to_value(&msg).unwrap(),
            json!({"type": "ack", "index": 2, "status": "retry"})
        );
    }

    #[test]
    fn test_parse_chunk_accepts_both_text_fields() {
        let a = parse_agent_message(r#"{"type":"chunk","index":0,"total":2,"data":"ab"}"#).unwrap();
        let b = parse_agent_message(
            r#"{"type":"chunk","index":0,"total":2,"chunk":"ab","completeSha256":"ff"}"#,
        )
        .unwrap();
        let AgentMessage::Chunk(a) = a else {
            panic!("expected chunk")
        };
        let AgentMessage::Chunk(b) = b else {
            panic!("expected chunk")
        };
        assert_eq!(a.text, "ab");
        assert_eq!(b.text, "ab");
        assert_eq!(a.complete_sha256, None);
        assert_eq!(b.complete_sha256.as_deref(), Some("ff"));
    }

    #[test]
    fn test_parse_stop_with_and_without_text() {
        assert_eq!(
            parse_agent_message(r#"{"type":"stop"}"#).unwrap(),
            AgentMessage::Stop { text: None }
        );
        assert_eq!(
            parse_agent_message(r#"{"type":"stop","text":"done"}"#).unwrap(),
            AgentMessage::Stop {
                text: Some("done".into())
            }
        );
    }

    #[test]
    fn test_parse_heartbeat_and_error() {
        assert_eq!(
            parse_agent_message(r#"{"type":"heartbeat"}"#).unwrap(),
            AgentMessage::Heartbeat
        );
        assert_eq!(
            parse_agent_message(r#"{"type":"error","code":"E1","message":"boom"}"#).unwrap(),
            AgentMessage::Error {
                code: "E1".into(),
                message: "boom".into()
            }
        );
    }

    #[test]
    fn test_parse_numeric_error_code() {
        assert_eq!(
            parse_agent_message(r#"{"type":"error","code":429,"message":"slow down"}"#).unwrap(),
            AgentMessage::Error {
                code: "429".into(),
                message: "slow down".into()
            }
        );
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(matches!(
            parse_agent_message("not json"),
            Err(RelayError::MalformedMessage(_))
        ));
        assert!(matches!(
            parse_agent_message(r#"{"text":"x"}"#),
            Err(RelayError::MalformedMessage(_))
        ));
        let err = parse_agent_message(r#"{"type":"typing"}"#).unwrap_err();
        assert!(err.to_string().contains("unknown message type"));
        let err = parse_agent_message(r#"{"type":"chunk","index":"x"}"#).unwrap_err();
        assert!(err.to_string().contains("invalid chunk message"));
    }

    #[test]
    fn test_parse_request_defaults_new_chat() {
        let msg =
            parse_relay_message(r#"{"type":"request","data":{"text":"t","model":"m"}}"#).unwrap();
        let RelayMessage::Request { data } = msg else {
            panic!("expected request")
        };
        assert!(data.new_chat);
    }
}
