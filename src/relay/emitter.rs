//! Rendering of exchange events as chat-completion payloads.
//!
//! Streaming mode turns each [`ExchangeEvent`] into zero or more [`Frame`]s in
//! arrival order. Non-streaming mode ignores deltas and builds one
//! [`ChatCompletion`] from the final text.

use std::time::{SystemTime, UNIX_EPOCH};

use uuid::Uuid;

use super::correlator::ExchangeEvent;
use crate::error::RelayError;
use crate::openai::{
    AssistantMessage, ChatCompletion, ChatCompletionChunk, Choice, ChunkChoice, ChunkDelta,
    ErrorBody, ErrorDetail,
};

/// Literal payload of the stream's end marker.
pub const DONE_SENTINEL: &str = "[DONE]";

/// One event-stream payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Chunk(ChatCompletionChunk),
    Error(ErrorBody),
    Done,
}

impl Frame {
    /// The `data:` line contents.
    pub fn to_data(&self) -> String {
        match self {
            Self::Chunk(chunk) => serde_json::to_string(chunk).unwrap_or_default(),
            Self::Error(body) => serde_json::to_string(body).unwrap_or_default(),
            Self::Done => DONE_SENTINEL.to_string(),
        }
    }

    pub fn is_done(&self) -> bool {
        matches!(self, Self::Done)
    }
}

/// Shared identity of every payload in one response.
#[derive(Debug, Clone)]
pub struct StreamEmitter {
    id: String,
    created: u64,
    model: String,
}

impl StreamEmitter {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            id: format!("chatcmpl-{}", Uuid::new_v4()),
            created: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map_or(0, |d| d.as_secs()),
            model: model.into(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    fn chunk(&self, delta: ChunkDelta, finish_reason: Option<String>) -> ChatCompletionChunk {
        ChatCompletionChunk {
            id: self.id.clone(),
            object: "chat.completion.chunk".to_string(),
            created: self.created,
            model: self.model.clone(),
            choices: vec![ChunkChoice {
                index: 0,
                delta,
                finish_reason,
            }],
        }
    }

    /// Content frame, or `None` for an empty delta.
    pub fn content(&self, delta: &str) -> Option<ChatCompletionChunk> {
        (!delta.is_empty()).then(|| {
            self.chunk(
                ChunkDelta {
                    content: Some(delta.to_string()),
                },
                None,
            )
        })
    }

    /// Closing `finish_reason: "stop"` frame.
    pub fn stop(&self) -> ChatCompletionChunk {
        self.chunk(ChunkDelta::default(), Some("stop".to_string()))
    }

    /// Non-streaming response carrying the final text.
    pub fn completion(&self, text: &str) -> ChatCompletion {
        ChatCompletion {
            id: self.id.clone(),
            object: "chat.completion".to_string(),
            created: self.created,
            model: self.model.clone(),
            choices: vec![Choice {
                index: 0,
                message: AssistantMessage {
                    role: "assistant".to_string(),
                    content: text.to_string(),
                },
                finish_reason: "stop".to_string(),
            }],
        }
    }

    /// Streaming frames for one exchange event.
    pub fn frames(&self, event: &ExchangeEvent) -> Vec<Frame> {
        match event {
            ExchangeEvent::Delta(delta) => self.content(delta).map(Frame::Chunk).into_iter().collect(),
            ExchangeEvent::Completed { delta, .. } => {
                let mut frames: Vec<Frame> =
                    self.content(delta).map(Frame::Chunk).into_iter().collect();
                frames.push(Frame::Chunk(self.stop()));
                frames.push(Frame::Done);
                frames
            }
            ExchangeEvent::Failed(err) => vec![Frame::Error(error_body(err)), Frame::Done],
        }
    }
}

/// Structured error body for a failed exchange.
pub fn error_body(err: &RelayError) -> ErrorBody {
    let kind = match err {
        RelayError::ChannelUnavailable | RelayError::Busy => "unavailable",
        RelayError::Timeout(_) => "timeout",
        _ => "relay_error",
    };
    ErrorBody {
        error: ErrorDetail {
            message: err.to_string(),
            kind: kind.to_string(),
            code: err.code().to_string(),
        },
    }
}
