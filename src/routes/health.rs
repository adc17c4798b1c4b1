//! Health-check endpoint.

use std::time::{SystemTime, UNIX_EPOCH};

use axum::{extract::State, Json};
use serde_json::{json, Value};

use crate::AppState;

/// `GET /health`: liveness probe.
///
/// Returns status, uptime, a wall-clock timestamp, version, and whether a
/// browser agent currently holds the control channel.
pub async fn health(State(state): State<AppState>) -> Json<Value> {
    let uptime = state.start_time.elapsed().as_secs_f64();
    let timestamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| millis(d.as_millis()));

    let agent = match state.channel.current() {
        Some(session) => json!({
            "connected": true,
            "connected_secs": session.connected_for.as_secs(),
            "last_seen_ms": millis(session.idle_for.as_millis()),
            "busy": state.channel.is_busy(),
        }),
        None => json!({ "connected": false }),
    };

    Json(json!({
        "status": "ok",
        "uptime": uptime,
        "timestamp": timestamp,
        "version": env!("CARGO_PKG_VERSION"),
        "agent": agent,
    }))
}

fn millis(ms: u128) -> u64 {
    u64::try_from(ms).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use tokio::sync::mpsc;

    #[tokio::test]
    async fn test_reports_agent_presence() {
        let state = AppState::new(Config::default());
        let Json(body) = health(State(state.clone())).await;
        assert_eq!(body["status"], "ok");
        assert_eq!(body["agent"]["connected"], false);
        assert_eq!(body["version"], env!("CARGO_PKG_VERSION"));

        let (tx, _rx) = mpsc::channel(1);
        state.channel.connect(tx);
        let Json(body) = health(State(state)).await;
        assert_eq!(body["agent"]["connected"], true);
        assert_eq!(body["agent"]["busy"], false);
    }
}
