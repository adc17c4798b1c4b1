//! WebSocket transport for the browser agent's control channel.
//!
//! ## Connection lifecycle
//!
//! 1. The agent connects to `GET /` on the agent listener (or `GET /agent` when
//!    it shares the API listener). No handshake message is required.
//! 2. The connection becomes the current session, replacing any previous one.
//! 3. Every text frame (and every UTF-8 binary frame) is handed to the
//!    [`ChannelManager`] unparsed; the active exchange classifies it.
//! 4. On close, error, or replacement the session is torn down and the
//!    in-flight exchange fails.

use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::response::Response;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::relay::channel::SessionHandle;
use crate::relay::ChannelManager;
use crate::AppState;

/// Outbound frames buffered per agent connection.
const OUTBOUND_BUFFER: usize = 256;

/// How long the writer may take to flush after the session ends.
const WRITER_DRAIN: Duration = Duration::from_secs(2);

/// `GET /` (agent listener): WebSocket upgrade for the browser agent.
pub async fn agent_upgrade(State(state): State<AppState>, ws: WebSocketUpgrade) -> Response {
    let channel = state.channel.clone();
    ws.on_upgrade(move |socket| {
        handle_agent_ws(socket, channel).instrument(info_span!("agent_socket"))
    })
}

/// Pump one agent socket until it closes or is replaced.
async fn handle_agent_ws(socket: WebSocket, channel: ChannelManager) {
    let (mut ws_sink, mut ws_stream) = socket.split();
    let (tx, mut rx) = mpsc::channel::<String>(OUTBOUND_BUFFER);
    let SessionHandle { id, mut shutdown } = channel.connect(tx);

    let mut send_task = tokio::spawn(async move {
        while let Some(text) = rx.recv().await {
            if ws_sink.send(Message::Text(text.into())).await.is_err() {
                break;
            }
        }
        let _ = ws_sink.close().await;
    });

    loop {
        tokio::select! {
            ws_msg = ws_stream.next() => {
                let Some(Ok(msg)) = ws_msg else { break };
                match msg {
                    Message::Text(text) => channel.deliver(id, text.as_str().to_owned()),
                    Message::Binary(data) => match String::from_utf8(data.to_vec()) {
                        Ok(text) => channel.deliver(id, text),
                        Err(_) => warn!(session_id = id, len = data.len(), "Non-UTF-8 binary frame dropped"),
                    },
                    Message::Close(_) => break,
                    Message::Ping(_) | Message::Pong(_) => {}
                }
            }
            _ = shutdown.changed() => {
                info!(session_id = id, "Agent session superseded, closing socket");
                break;
            }
        }
    }

    channel.disconnect(id);
    // The session's sender is gone now, so the writer drains and sends Close.
    if tokio::time::timeout(WRITER_DRAIN, &mut send_task).await.is_err() {
        send_task.abort();
    }
    debug!(session_id = id, "Agent socket handler exited");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::relay::protocol::RequestPayload;
    use crate::relay::ExchangeEvent;
    use crate::RelayError;
    use serde_json::json;
    use tokio::net::TcpListener;
    use tokio_tungstenite::tungstenite::Message as WsMessage;

    async fn serve(state: &AppState) -> String {
        let app = crate::routes::agent_routes("/").with_state(state.clone());
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });
        format!("ws://{addr}/")
    }

    async fn wait_for_session(state: &AppState, previous: Option<u64>) -> u64 {
        for _ in 0..200 {
            if let Some(session) = state.channel.current() {
                if Some(session.id) != previous {
                    return session.id;
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("agent session never registered");
    }

    fn payload() -> RequestPayload {
        RequestPayload {
            text: "hi".into(),
            model: "m".into(),
            new_chat: true,
        }
    }

    #[tokio::test]
    async fn test_agent_socket_lifecycle() {
        let state = AppState::new(Config::default());
        let url = serve(&state).await;
        let (mut agent, _) = tokio_tungstenite::connect_async(url.as_str()).await.unwrap();
        wait_for_session(&state, None).await;

        let mut exchange = state.correlator.dispatch(payload()).await.unwrap();
        let request = agent.next().await.unwrap().unwrap();
        assert!(request.to_text().unwrap().contains(r#""type":"request""#));

        let frame = json!({"type": "answer", "text": "hi there"}).to_string();
        agent.send(WsMessage::Text(frame.into())).await.unwrap();
        assert_eq!(
            exchange.next_event().await,
            Some(ExchangeEvent::Delta("hi there".into()))
        );

        agent.close(None).await.unwrap();
        assert_eq!(
            exchange.next_event().await,
            Some(ExchangeEvent::Failed(RelayError::SessionLost(
                "agent disconnected".into()
            )))
        );
        assert!(state.channel.current().is_none());
    }

    #[tokio::test]
    async fn test_reconnect_replaces_session() {
        let state = AppState::new(Config::default());
        let url = serve(&state).await;
        let (mut first, _) = tokio_tungstenite::connect_async(url.as_str()).await.unwrap();
        let first_id = wait_for_session(&state, None).await;

        let (_second, _) = tokio_tungstenite::connect_async(url.as_str()).await.unwrap();
        let second_id = wait_for_session(&state, Some(first_id)).await;
        assert_ne!(first_id, second_id);

        // The superseded socket is closed by the relay.
        loop {
            match first.next().await {
                Some(Ok(WsMessage::Close(_)) | Err(_)) | None => break,
                Some(Ok(_)) => {}
            }
        }
        assert_eq!(state.channel.current().map(|s| s.id), Some(second_id));
    }
}
