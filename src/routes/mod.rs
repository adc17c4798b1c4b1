//! HTTP route handlers.
//!
//! [`api_routes`] is the OpenAI-compatible surface; [`agent_routes`] mounts the
//! browser agent's WebSocket upgrade. Both are stateful routers finished with
//! `.with_state(..)` by the caller.

pub mod completions;
pub mod health;

use axum::routing::{get, post};
use axum::Router;

use crate::AppState;

/// Path of the agent socket when it shares the API listener.
pub const SHARED_AGENT_PATH: &str = "/agent";

/// `GET /health`, `POST /v1/chat/completions`.
pub fn api_routes() -> Router<AppState> {
    Router::new()
        .route("/health", get(health::health))
        .route("/v1/chat/completions", post(completions::chat_completions))
}

/// Agent WebSocket upgrade at `path`.
pub fn agent_routes(path: &str) -> Router<AppState> {
    Router::new().route(path, get(crate::ws::agent_upgrade))
}
