//! OpenAI-compatible chat completions.
//!
//! `POST /v1/chat/completions` frames the conversation as one prompt, hands it
//! to the browser agent, and answers either as a `text/event-stream` of
//! `chat.completion.chunk` frames ending in `[DONE]`, or as a single
//! `chat.completion` object once the agent stops.

use std::collections::VecDeque;
use std::convert::Infallible;
use std::time::Duration;

use axum::extract::State;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::Json;
use tracing::{debug, warn};

use crate::error::RelayError;
use crate::openai::ChatCompletionRequest;
use crate::prompt;
use crate::relay::emitter::error_body;
use crate::relay::protocol::RequestPayload;
use crate::relay::{Exchange, ExchangeEvent, Frame, StreamEmitter};
use crate::AppState;

/// SSE comment interval while the agent is thinking.
const KEEP_ALIVE_SECS: u64 = 15;

/// `POST /v1/chat/completions`
pub async fn chat_completions(
    State(state): State<AppState>,
    Json(request): Json<ChatCompletionRequest>,
) -> Response {
    let payload = RequestPayload {
        text: prompt::build(&request.messages),
        model: request.model.clone(),
        new_chat: request.new_chat,
    };
    let emitter = StreamEmitter::new(request.model);

    let exchange = match state.correlator.dispatch(payload).await {
        Ok(exchange) => exchange,
        Err(err) => return error_response(&err),
    };
    debug!(
        exchange_id = exchange.id(),
        response_id = emitter.id(),
        stream = request.stream,
        "Exchange started"
    );

    if request.stream {
        stream_response(exchange, emitter).into_response()
    } else {
        collect_response(exchange, &emitter).await
    }
}

/// Structured error body with the error's HTTP status.
pub fn error_response(err: &RelayError) -> Response {
    warn!(code = err.code(), "Request failed: {err}");
    (err.status(), Json(error_body(err))).into_response()
}

async fn collect_response(mut exchange: Exchange, emitter: &StreamEmitter) -> Response {
    while let Some(event) = exchange.next_event().await {
        match event {
            ExchangeEvent::Delta(_) => {}
            ExchangeEvent::Completed { text, .. } => {
                return Json(emitter.completion(&text)).into_response()
            }
            ExchangeEvent::Failed(err) => return error_response(&err),
        }
    }
    error_response(&RelayError::SessionLost(
        "exchange ended without a result".to_string(),
    ))
}

struct StreamState {
    exchange: Exchange,
    emitter: StreamEmitter,
    pending: VecDeque<Frame>,
    finished: bool,
}

/// Frames are written in arrival order; dropping the stream drops the exchange.
fn stream_response(
    exchange: Exchange,
    emitter: StreamEmitter,
) -> Sse<impl futures::Stream<Item = Result<Event, Infallible>>> {
    let state = StreamState {
        exchange,
        emitter,
        pending: VecDeque::new(),
        finished: false,
    };

    let stream = futures::stream::unfold(state, |mut state| async move {
        loop {
            if let Some(frame) = state.pending.pop_front() {
                let event = Event::default().data(frame.to_data());
                return Some((Ok(event), state));
            }
            if state.finished {
                return None;
            }
            match state.exchange.next_event().await {
                Some(event) => {
                    let frames = state.emitter.frames(&event);
                    state.pending.extend(frames);
                }
                None => state.finished = true,
            }
        }
    });

    Sse::new(stream).keep_alive(KeepAlive::default().interval(Duration::from_secs(KEEP_ALIVE_SECS)))
}
