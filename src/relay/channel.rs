//! Single control-channel ownership.
//!
//! [`ChannelManager`] holds the one live agent [`Session`] and the one listener
//! registered by the active exchange. It is purely reactive: the agent socket
//! task reports connect, frames and disconnect; the correlator subscribes and
//! sends. Reconnection is the agent's job.
//!
//! A new connection replaces the current session. The old socket task is told
//! to close through its `watch` shutdown channel, and a listener bound to the
//! old session is failed with `Lost`. Frames and disconnects reported under a
//! stale session id are ignored.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, watch};
use tracing::{debug, info, trace, warn};

use super::protocol::{self, RelayMessage};
use crate::error::RelayError;

/// Monotonic identifier of an agent connection.
pub type SessionId = u64;

/// What an exchange's listener receives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    /// Raw text frame from the agent.
    Frame(String),
    /// The session this listener was bound to is gone.
    Lost(String),
}

/// The live agent connection.
struct Session {
    id: SessionId,
    /// Frames queued for the socket writer task.
    outbound: mpsc::Sender<String>,
    connected_since: Instant,
    last_seen: Instant,
    /// Signals the socket task to close when this session is replaced.
    shutdown_tx: watch::Sender<bool>,
}

struct Listener {
    id: u64,
    session_id: SessionId,
    tx: mpsc::UnboundedSender<ChannelEvent>,
}

#[derive(Default)]
struct Inner {
    session: Option<Session>,
    listener: Option<Listener>,
}

/// Returned to the socket task on connect.
pub struct SessionHandle {
    pub id: SessionId,
    /// Flips to `true` when the session is replaced or the relay shuts down.
    pub shutdown: watch::Receiver<bool>,
}

/// Read-only view of the current session.
#[derive(Debug, Clone, Copy)]
pub struct SessionInfo {
    pub id: SessionId,
    pub connected_for: Duration,
    pub idle_for: Duration,
}

/// Owner of the single control channel. Cheap to clone.
#[derive(Clone, Default)]
pub struct ChannelManager {
    inner: Arc<Mutex<Inner>>,
    next_id: Arc<AtomicU64>,
}

impl ChannelManager {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Install a new agent connection, replacing any existing one.
    pub fn connect(&self, outbound: mpsc::Sender<String>) -> SessionHandle {
        let id = self.next_id();
        let (shutdown_tx, shutdown) = watch::channel(false);
        let now = Instant::now();
        let session = Session {
            id,
            outbound,
            connected_since: now,
            last_seen: now,
            shutdown_tx,
        };

        let mut inner = self.lock();
        if let Some(old) = inner.session.replace(session) {
            warn!(
                session_id = id,
                old_session_id = old.id,
                "Agent reconnected while a session was open, replacing old session"
            );
            let _ = old.shutdown_tx.send(true);
            fail_listener(&mut inner, old.id, "replaced by new connection");
        }
        info!(session_id = id, "Agent connected, can process requests now");
        SessionHandle { id, shutdown }
    }

    /// Tear down `session_id` if it is still current. Returns whether it was.
    pub fn disconnect(&self, session_id: SessionId) -> bool {
        let mut inner = self.lock();
        if inner.session.as_ref().map(|s| s.id) != Some(session_id) {
            debug!(session_id, "Disconnect from stale session ignored");
            return false;
        }
        inner.session = None;
        fail_listener(&mut inner, session_id, "agent disconnected");
        info!(session_id, "Agent disconnected, requests cannot be processed");
        true
    }

    /// Route an inbound frame to the active exchange, if any.
    pub fn deliver(&self, session_id: SessionId, text: String) {
        let mut inner = self.lock();
        match inner.session.as_mut() {
            Some(session) if session.id == session_id => session.last_seen = Instant::now(),
            _ => {
                debug!(session_id, "Frame from stale session dropped");
                return;
            }
        }
        match inner.listener.as_ref() {
            Some(listener) if listener.session_id == session_id => {
                let _ = listener.tx.send(ChannelEvent::Frame(text));
            }
            _ => trace!(session_id, "Frame with no active exchange dropped"),
        }
    }

    /// Send a frame to the current agent.
    pub async fn send(&self, message: &RelayMessage) -> Result<(), RelayError> {
        let text = protocol::encode(message)?;
        let outbound = self
            .lock()
            .session
            .as_ref()
            .map(|s| s.outbound.clone())
            .ok_or(RelayError::ChannelUnavailable)?;
        outbound
            .send(text)
            .await
            .map_err(|_| RelayError::ChannelUnavailable)
    }

    /// Register the single exchange listener on the current session.
    pub fn subscribe(&self) -> Result<Subscription, RelayError> {
        let id = self.next_id();
        let mut inner = self.lock();
        let session_id = inner
            .session
            .as_ref()
            .map(|s| s.id)
            .ok_or(RelayError::ChannelUnavailable)?;
        if inner.listener.is_some() {
            return Err(RelayError::Busy);
        }
        let (tx, rx) = mpsc::unbounded_channel();
        inner.listener = Some(Listener { id, session_id, tx });
        drop(inner);
        debug!(session_id, listener_id = id, "Exchange listener registered");
        Ok(Subscription {
            id,
            session_id,
            rx,
            channel: self.clone(),
            closed: false,
        })
    }

    fn release(&self, listener_id: u64) {
        let mut inner = self.lock();
        if inner.listener.as_ref().is_some_and(|l| l.id == listener_id) {
            inner.listener = None;
            debug!(listener_id, "Exchange listener released");
        }
    }

    /// Current session, if an agent is connected.
    pub fn current(&self) -> Option<SessionInfo> {
        self.lock().session.as_ref().map(|s| SessionInfo {
            id: s.id,
            connected_for: s.connected_since.elapsed(),
            idle_for: s.last_seen.elapsed(),
        })
    }

    /// Whether an exchange listener is registered.
    pub fn is_busy(&self) -> bool {
        self.lock().listener.is_some()
    }

    /// Drop the session and fail the active exchange (relay shutdown).
    pub fn shutdown(&self, reason: &str) {
        let mut inner = self.lock();
        if let Some(session) = inner.session.take() {
            let _ = session.shutdown_tx.send(true);
            fail_listener(&mut inner, session.id, reason);
            info!(session_id = session.id, reason, "Agent session closed");
        }
    }
}

/// Fail and remove the listener bound to `session_id`.
fn fail_listener(inner: &mut Inner, session_id: SessionId, reason: &str) {
    if inner
        .listener
        .as_ref()
        .is_some_and(|l| l.session_id == session_id)
    {
        if let Some(listener) = inner.listener.take() {
            let _ = listener.tx.send(ChannelEvent::Lost(reason.to_string()));
            warn!(session_id, reason, "Failing in-flight exchange");
        }
    }
}

/// An exchange's registration on the channel.
///
/// Deregisters exactly once, on [`Subscription::close`] or drop, whichever
/// comes first. If the channel already removed it (session lost), release is
/// a no-op.
pub struct Subscription {
    id: u64,
    session_id: SessionId,
    rx: mpsc::UnboundedReceiver<ChannelEvent>,
    channel: ChannelManager,
    closed: bool,
}

impl Subscription {
    /// Next event for this exchange. `None` once the subscription is closed.
    pub async fn recv(&mut self) -> Option<ChannelEvent> {
        if self.closed {
            return None;
        }
        self.rx.recv().await
    }

    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    pub fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            self.channel.release(self.id);
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::protocol::RequestPayload;

    fn request() -> RelayMessage {
        RelayMessage::Request {
            data: RequestPayload {
                text: "hi".into(),
                model: "m".into(),
                new_chat: true,
            },
        }
    }

    #[tokio::test]
    async fn test_send_without_session_is_unavailable() {
        let channel = ChannelManager::new();
        assert!(channel.current().is_none());
        assert_eq!(
            channel.send(&request()).await,
            Err(RelayError::ChannelUnavailable)
        );
        assert!(matches!(
            channel.subscribe(),
            Err(RelayError::ChannelUnavailable)
        ));
    }

    #[tokio::test]
    async fn test_send_reaches_current_session() {
        let channel = ChannelManager::new();
        let (tx, mut rx) = mpsc::channel(4);
        channel.connect(tx);
        channel.send(&request()).await.unwrap();
        let frame = rx.recv().await.unwrap();
        assert!(frame.contains(r#""type":"request""#));
    }

    #[tokio::test]
    async fn test_single_listener() {
        let channel = ChannelManager::new();
        let (tx, _rx) = mpsc::channel(4);
        channel.connect(tx);
        let first = channel.subscribe().unwrap();
        assert!(channel.is_busy());
        assert!(matches!(channel.subscribe(), Err(RelayError::Busy)));
        drop(first);
        assert!(!channel.is_busy());
        assert!(channel.subscribe().is_ok());
    }

    #[tokio::test]
    async fn test_frames_routed_to_listener() {
        let channel = ChannelManager::new();
        let (tx, _rx) = mpsc::channel(4);
        let handle = channel.connect(tx);
        let mut sub = channel.subscribe().unwrap();
        channel.deliver(handle.id, "one".into());
        channel.deliver(handle.id, "two".into());
        assert_eq!(sub.recv().await, Some(ChannelEvent::Frame("one".into())));
        assert_eq!(sub.recv().await, Some(ChannelEvent::Frame("two".into())));
    }

    #[tokio::test]
    async fn test_disconnect_fails_listener() {
        let channel = ChannelManager::new();
        let (tx, _rx) = mpsc::channel(4);
        let handle = channel.connect(tx);
        let mut sub = channel.subscribe().unwrap();
        assert!(channel.disconnect(handle.id));
        assert_eq!(
            sub.recv().await,
            Some(ChannelEvent::Lost("agent disconnected".into()))
        );
        assert!(channel.current().is_none());
        assert!(!channel.is_busy());
    }

    #[tokio::test]
    async fn test_replacement_invalidates_old_session() {
        let channel = ChannelManager::new();
        let (old_tx, _old_rx) = mpsc::channel(4);
        let mut old = channel.connect(old_tx);
        let mut sub = channel.subscribe().unwrap();

        let (new_tx, _new_rx) = mpsc::channel(4);
        let new = channel.connect(new_tx);
        assert_ne!(old.id, new.id);
        assert!(*old.shutdown.borrow_and_update());
        assert_eq!(
            sub.recv().await,
            Some(ChannelEvent::Lost("replaced by new connection".into()))
        );

        // Stale handler is inert: its frames and disconnect are ignored.
        drop(sub);
        let mut sub = channel.subscribe().unwrap();
        channel.deliver(old.id, "late".into());
        assert!(!channel.disconnect(old.id));
        assert_eq!(channel.current().map(|s| s.id), Some(new.id));
        channel.deliver(new.id, "fresh".into());
        assert_eq!(sub.recv().await, Some(ChannelEvent::Frame("fresh".into())));
    }

    #[tokio::test]
    async fn test_closed_subscription_yields_none() {
        let channel = ChannelManager::new();
        let (tx, _rx) = mpsc::channel(4);
        let handle = channel.connect(tx);
        let mut sub = channel.subscribe().unwrap();
        sub.close();
        channel.deliver(handle.id, "ignored".into());
        assert_eq!(sub.recv().await, None);
        assert!(!channel.is_busy());
    }

    #[tokio::test]
    async fn test_shutdown_fails_listener() {
        let channel = ChannelManager::new();
        let (tx, _rx) = mpsc::channel(4);
        let mut handle = channel.connect(tx);
        let mut sub = channel.subscribe().unwrap();
        channel.shutdown("relay shutting down");
        assert!(*handle.shutdown.borrow_and_update());
        assert_eq!(
            sub.recv().await,
            Some(ChannelEvent::Lost("relay shutting down".into()))
        );
    }
}
