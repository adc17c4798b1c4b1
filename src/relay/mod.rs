//! Relay core: one agent control channel shared by short-lived API exchanges.
//!
//! - [`channel`]: single-session ownership and frame routing
//! - [`correlator`]: request dispatch, single-flight, exchange state machine
//! - [`reassembly`]: indexed chunk buffering with checksum-deferred acks
//! - [`delta`]: snapshot-to-delta translation
//! - [`emitter`]: chat-completion frames and payloads
//! - [`ack`]: sender-side ack tracking and bounded retry
//! - [`protocol`]: control-channel envelope types

pub mod ack;
pub mod channel;
pub mod correlator;
pub mod delta;
pub mod emitter;
pub mod hasher;
pub mod protocol;
pub mod reassembly;

pub use channel::{ChannelManager, SessionId};
pub use correlator::{Correlator, Exchange, ExchangeEvent, ExchangeState};
pub use emitter::{Frame, StreamEmitter};
