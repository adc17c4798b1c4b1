//! Shared application state passed to every handler via Axum's `State` extractor.

use std::sync::Arc;
use std::time::Instant;

use crate::config::Config;
use crate::relay::{ChannelManager, Correlator};

/// Shared application state for the relay server.
#[derive(Clone)]
pub struct AppState {
    /// Immutable configuration loaded at startup.
    pub config: Arc<Config>,
    /// Monotonic instant when the server started (for uptime calculation).
    pub start_time: Instant,
    /// Owner of the browser agent's control channel.
    pub channel: ChannelManager,
    /// Dispatches API requests onto the channel.
    pub correlator: Arc<Correlator>,
}

impl AppState {
    pub fn new(config: Config) -> Self {
        let channel = ChannelManager::new();
        let correlator = Arc::new(Correlator::new(channel.clone(), config.relay.clone()));
        Self {
            config: Arc::new(config),
            start_time: Instant::now(),
            channel,
            correlator,
        }
    }
}
