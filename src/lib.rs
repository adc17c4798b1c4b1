#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::too_many_lines)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::unused_async)]
#![allow(clippy::redundant_closure_for_method_calls)]

//! chat-relay library: an OpenAI-compatible endpoint served by a browser agent.
//!
//! This library exposes the building blocks:
//! - `relay`: control channel, request correlation, chunk reassembly, deltas
//! - `routes`: `/health` and `/v1/chat/completions` handlers
//! - `ws`: the agent's WebSocket transport
//! - `agent`: reference echo agent speaking the control-channel protocol
//! - `config`: configuration loading
//! - `openai`: chat-completion wire types
//! - `prompt`: conversation framing for the chat UI

pub mod agent;
pub mod config;
pub mod error;
pub mod openai;
pub mod prompt;
pub mod relay;
pub mod routes;
pub mod state;
pub mod ws;

// Re-export key types at crate root for convenience.
pub use config::Config;
pub use error::{ConfigError, RelayError};
pub use relay::{ChannelManager, Correlator};
pub use state::AppState;
