//! Reference echo agent: stands in for the browser page script.
//!
//! Run with `chat-relay agent`. Maintains a persistent WebSocket to the relay
//! with exponential-backoff reconnect and heartbeat. Each `request` is answered
//! by echoing the last message of the framed prompt: a few progressive
//! `answer` snapshots, then the full reply either bundled with `stop` or, when
//! it exceeds `chunk_size`, as a checksummed chunk set driven through the
//! ack/retry coordinator.

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use crate::config::AgentConfig;
use crate::error::RelayError;
use crate::prompt;
use crate::relay::ack::ChunkSender;
use crate::relay::protocol::{self, AgentMessage, ChunkAck, RelayMessage, RequestPayload};

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Connect, serve, reconnect. Runs until the task is cancelled.
pub async fn run(config: AgentConfig) {
    let initial_delay = Duration::from_secs(config.reconnect_delay_secs);
    let max_delay = Duration::from_secs(config.reconnect_max_delay_secs);
    let mut delay = initial_delay;

    loop {
        info!(url = %config.url, "Connecting to relay");
        match connect_and_run(&config).await {
            Ok(()) => {
                info!("Connection closed cleanly, reconnecting...");
                delay = initial_delay;
            }
            Err(e) => {
                warn!("Connection error: {e}, reconnecting in {}s", delay.as_secs());
            }
        }
        tokio::time::sleep(delay).await;
        delay = (delay * 2).min(max_delay);
    }
}

/// The reply currently being produced, with the route for its acks.
struct Reply {
    acks: mpsc::Sender<ChunkAck>,
    task: JoinHandle<()>,
}

/// A single connection: serve requests until the relay goes away.
async fn connect_and_run(config: &AgentConfig) -> Result<(), BoxError> {
    let (ws, _response) = tokio_tungstenite::connect_async(config.url.as_str()).await?;
    let (mut ws_sink, mut ws_stream) = ws.split();
    info!("Connected to relay, waiting for requests");

    let (out_tx, mut out_rx) = mpsc::channel::<String>(256);
    let writer_task = tokio::spawn(async move {
        while let Some(text) = out_rx.recv().await {
            if ws_sink.send(Message::Text(text.into())).await.is_err() {
                break;
            }
        }
    });

    let heartbeat_tx = out_tx.clone();
    let heartbeat_interval = Duration::from_secs(config.heartbeat_interval_secs.max(1));
    let heartbeat_task = tokio::spawn(async move {
        let mut interval = tokio::time::interval(heartbeat_interval);
        interval.tick().await;
        loop {
            interval.tick().await;
            let Ok(frame) = protocol::encode(&AgentMessage::Heartbeat) else {
                break;
            };
            if heartbeat_tx.send(frame).await.is_err() {
                break;
            }
        }
    });

    let mut reply: Option<Reply> = None;
    let result = loop {
        let msg = match ws_stream.next().await {
            Some(Ok(msg)) => msg,
            Some(Err(e)) => break Err(e.into()),
            None => break Ok(()),
        };
        match msg {
            Message::Text(text) => match protocol::parse_relay_message(text.as_str()) {
                Ok(RelayMessage::Request { data }) => {
                    if let Some(previous) = reply.take() {
                        warn!("New request while replying, abandoning previous reply");
                        previous.task.abort();
                    }
                    let (acks_tx, acks_rx) = mpsc::channel(64);
                    let task = tokio::spawn(answer(data, out_tx.clone(), acks_rx, config.clone()));
                    reply = Some(Reply {
                        acks: acks_tx,
                        task,
                    });
                }
                Ok(RelayMessage::Ack(ack)) => match &reply {
                    Some(reply) => {
                        let _ = reply.acks.send(ack).await;
                    }
                    None => debug!(index = ack.index, "Ack with no reply in progress"),
                },
                Err(e) => warn!("{e}, ignoring"),
            },
            Message::Close(_) => break Ok(()),
            _ => {}
        }
    };

    heartbeat_task.abort();
    writer_task.abort();
    if let Some(reply) = reply {
        reply.task.abort();
    }
    result
}

/// What the echo agent says back.
pub fn echo_reply(request_text: &str) -> String {
    match prompt::last_content(request_text) {
        Some(content) => format!("You said: {content}"),
        None => format!("You said: {request_text}"),
    }
}

/// Produce one reply; failures are reported to the relay as an `error` frame.
async fn answer(
    request: RequestPayload,
    out: mpsc::Sender<String>,
    mut acks: mpsc::Receiver<ChunkAck>,
    config: AgentConfig,
) {
    info!(model = %request.model, new_chat = request.new_chat, "Answering request");
    let text = echo_reply(&request.text);
    if let Err(err) = deliver(&text, &out, &mut acks, &config).await {
        warn!(code = err.code(), "Reply failed: {err}");
        let frame = AgentMessage::Error {
            code: err.code().to_string(),
            message: err.to_string(),
        };
        if let Ok(frame) = protocol::encode(&frame) {
            let _ = out.send(frame).await;
        }
    }
}

async fn deliver(
    text: &str,
    out: &mpsc::Sender<String>,
    acks: &mut mpsc::Receiver<ChunkAck>,
    config: &AgentConfig,
) -> Result<(), RelayError> {
    let total_chars = text.chars().count();
    let steps = config.snapshot_steps.max(1);
    let interval = Duration::from_millis(config.snapshot_interval_ms);

    for step in 1..steps {
        let snapshot: String = text.chars().take(total_chars * step / steps).collect();
        send(out, &AgentMessage::Answer { text: snapshot }).await?;
        tokio::time::sleep(interval).await;
    }

    if total_chars > config.chunk_size {
        let sender = ChunkSender {
            chunk_size: config.chunk_size,
            max_attempts: config.max_attempts,
            ack_timeout: Duration::from_millis(config.ack_timeout_ms),
        };
        sender.send(text, out, acks).await?;
        send(out, &AgentMessage::Stop { text: None }).await
    } else {
        send(
            out,
            &AgentMessage::Stop {
                text: Some(text.to_string()),
            },
        )
        .await
    }
}

async fn send(out: &mpsc::Sender<String>, message: &AgentMessage) -> Result<(), RelayError> {
    let frame = protocol::encode(message)?;
    out.send(frame)
        .await
        .map_err(|_| RelayError::SessionLost("socket writer closed".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RelayConfig;
    use crate::relay::{ChannelManager, Correlator, ExchangeEvent};
    use serde_json::json;

    fn config(chunk_size: usize) -> AgentConfig {
        AgentConfig {
            chunk_size,
            snapshot_steps: 3,
            snapshot_interval_ms: 0,
            ..AgentConfig::default()
        }
    }

    #[test]
    fn test_echo_reply() {
        let framed = prompt::build(&[json!({"role": "user", "content": "ping"})]);
        assert_eq!(echo_reply(&framed), "You said: ping");
        assert_eq!(echo_reply("raw"), "You said: raw");
    }

    #[tokio::test]
    async fn test_short_reply_bundles_text_with_stop() {
        let (out, mut frames) = mpsc::channel(16);
        let (_acks_tx, mut acks) = mpsc::channel(16);
        deliver("abcdef", &out, &mut acks, &config(64)).await.unwrap();
        drop(out);

        let mut parsed = Vec::new();
        while let Some(frame) = frames.recv().await {
            parsed.push(protocol::parse_agent_message(&frame).unwrap());
        }
        assert_eq!(
            parsed,
            vec![
                AgentMessage::Answer { text: "ab".into() },
                AgentMessage::Answer {
                    text: "abcd".into()
                },
                AgentMessage::Stop {
                    text: Some("abcdef".into())
                },
            ]
        );
    }

    /// Agent and relay core wired back to back without sockets.
    async fn round_trip(messages: serde_json::Value, config: AgentConfig) -> (Vec<ExchangeEvent>, String) {
        let channel = ChannelManager::new();
        let (relay_tx, mut relay_rx) = mpsc::channel::<String>(64);
        let session = channel.connect(relay_tx).id;
        let correlator = Correlator::new(channel.clone(), RelayConfig::default());

        let (agent_tx, mut agent_rx) = mpsc::channel::<String>(64);
        let pump = channel.clone();
        tokio::spawn(async move {
            while let Some(frame) = agent_rx.recv().await {
                pump.deliver(session, frame);
            }
        });

        let text = prompt::build(messages.as_array().unwrap());
        let expected = echo_reply(&text);
        let mut exchange = correlator
            .dispatch(RequestPayload {
                text,
                model: "m".into(),
                new_chat: true,
            })
            .await
            .unwrap();

        let Ok(RelayMessage::Request { data }) =
            protocol::parse_relay_message(&relay_rx.recv().await.unwrap())
        else {
            panic!("expected request")
        };
        let (ack_tx, ack_rx) = mpsc::channel(64);
        tokio::spawn(async move {
            while let Some(frame) = relay_rx.recv().await {
                if let Ok(RelayMessage::Ack(ack)) = protocol::parse_relay_message(&frame) {
                    let _ = ack_tx.send(ack).await;
                }
            }
        });
        tokio::spawn(answer(data, agent_tx, ack_rx, config));

        let mut events = Vec::new();
        while let Some(event) = exchange.next_event().await {
            events.push(event);
        }
        (events, expected)
    }

    fn streamed_text(events: &[ExchangeEvent]) -> String {
        events
            .iter()
            .map(|e| match e {
                ExchangeEvent::Delta(d) | ExchangeEvent::Completed { delta: d, .. } => d.as_str(),
                ExchangeEvent::Failed(_) => "",
            })
            .collect()
    }

    #[tokio::test]
    async fn test_round_trip_with_answers() {
        let (events, expected) =
            round_trip(json!([{"role": "user", "content": "hello relay"}]), config(1024)).await;
        let Some(ExchangeEvent::Completed { text, delta }) = events.last() else {
            panic!("expected completion, got {events:?}")
        };
        assert_eq!(text, &expected);
        assert!(!delta.is_empty());
        assert_eq!(streamed_text(&events), expected);
    }

    #[tokio::test]
    async fn test_round_trip_with_chunks() {
        let (events, expected) = round_trip(
            json!([{"role": "user", "content": "a message long enough to be chunked"}]),
            config(8),
        )
        .await;
        assert_eq!(
            events.last(),
            Some(&ExchangeEvent::Completed {
                text: expected.clone(),
                delta: String::new(),
            })
        );
        assert_eq!(streamed_text(&events), expected);
    }
}
