//! Binding of external requests to relay exchanges.
//!
//! [`Correlator::dispatch`] checks for a session, takes the single-flight
//! permit, registers the exchange listener and only then sends the request
//! envelope, so no reply can arrive unobserved. The returned [`Exchange`] is
//! driven by [`Exchange::next_event`] until it yields a terminal event.
//!
//! The control channel carries no exchange id, so an exchange dropped before
//! its terminal event keeps the channel reserved: a background task consumes
//! the rest of that reply and only then releases the listener and permit.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use super::channel::{ChannelEvent, ChannelManager, Subscription};
use super::delta::DeltaState;
use super::protocol::{self, AgentMessage, RelayMessage, RequestPayload};
use super::reassembly::{ChunkBuffer, Ingested};
use crate::config::{BusyPolicy, RelayConfig};
use crate::error::RelayError;

/// Lifecycle of one exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeState {
    AwaitingFirstEvent,
    Streaming,
    Done,
    Failed,
}

/// What an exchange yields to its caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExchangeEvent {
    /// Non-empty increment of the reply.
    Delta(String),
    /// Terminal success. `delta` is whatever the `stop` frame itself added.
    Completed { text: String, delta: String },
    /// Terminal failure.
    Failed(RelayError),
}

/// Entry point for external requests.
pub struct Correlator {
    channel: ChannelManager,
    config: RelayConfig,
    gate: Arc<Semaphore>,
    waiting: Arc<AtomicUsize>,
}

impl Correlator {
    pub fn new(channel: ChannelManager, config: RelayConfig) -> Self {
        Self {
            channel,
            config,
            gate: Arc::new(Semaphore::new(1)),
            waiting: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Start an exchange for `payload`.
    pub async fn dispatch(&self, payload: RequestPayload) -> Result<Exchange, RelayError> {
        if self.channel.current().is_none() {
            return Err(RelayError::ChannelUnavailable);
        }
        let permit = self.acquire().await?;
        let subscription = self.channel.subscribe()?;

        let id = Uuid::new_v4().to_string();
        let idle_timeout = Duration::from_secs(self.config.idle_timeout_secs);
        let model = payload.model.clone();
        self.channel
            .send(&RelayMessage::Request { data: payload })
            .await?;
        info!(
            exchange_id = %id,
            session_id = subscription.session_id(),
            model = %model,
            "Request sent to agent"
        );

        Ok(Exchange {
            id,
            state: ExchangeState::AwaitingFirstEvent,
            subscription: Some(subscription),
            channel: self.channel.clone(),
            chunks: ChunkBuffer::new(self.config.verify_checksums),
            delta: DeltaState::new(self.config.trim_snapshots),
            idle_timeout,
            deadline: Instant::now() + idle_timeout,
            permit: Some(permit),
            abandoned: false,
        })
    }

    async fn acquire(&self) -> Result<OwnedSemaphorePermit, RelayError> {
        if let Ok(permit) = Arc::clone(&self.gate).try_acquire_owned() {
            return Ok(permit);
        }
        if self.config.busy_policy == BusyPolicy::Reject {
            debug!("Exchange in flight, rejecting request");
            return Err(RelayError::Busy);
        }

        let _waiter = WaitSlot::claim(&self.waiting, self.config.queue_depth)
            .ok_or(RelayError::Busy)?;
        debug!("Exchange in flight, queueing request");
        let wait = Duration::from_secs(self.config.queue_timeout_secs);
        match tokio::time::timeout(wait, Arc::clone(&self.gate).acquire_owned()).await {
            Ok(Ok(permit)) => Ok(permit),
            Ok(Err(_)) | Err(_) => {
                warn!(wait_secs = wait.as_secs(), "Queued request gave up waiting");
                Err(RelayError::Busy)
            }
        }
    }

    /// Requests currently queued for the permit.
    pub fn queued(&self) -> usize {
        self.waiting.load(Ordering::SeqCst)
    }
}

/// A queue position, released on drop.
struct WaitSlot(Arc<AtomicUsize>);

impl WaitSlot {
    fn claim(counter: &Arc<AtomicUsize>, depth: usize) -> Option<Self> {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| (n < depth).then_some(n + 1))
            .ok()
            .map(|_| Self(Arc::clone(counter)))
    }
}

impl Drop for WaitSlot {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// One request's round trip through the control channel.
///
/// Dropping it before a terminal event (client went away) hands the rest of
/// the reply to a drain task; the listener and permit are released when that
/// reply ends, the session is lost, or the idle timeout fires.
pub struct Exchange {
    id: String,
    state: ExchangeState,
    /// Released before `permit` so a queued request can subscribe at once.
    subscription: Option<Subscription>,
    channel: ChannelManager,
    chunks: ChunkBuffer,
    delta: DeltaState,
    idle_timeout: Duration,
    /// Pushed forward only by reply progress (`answer`, `chunk`).
    deadline: Instant,
    permit: Option<OwnedSemaphorePermit>,
    /// Set on the copy owned by a drain task; it is never handed off again.
    abandoned: bool,
}

impl Exchange {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn state(&self) -> ExchangeState {
        self.state
    }

    /// Reply accumulated so far.
    pub fn text(&self) -> &str {
        self.delta.baseline()
    }

    pub fn is_finished(&self) -> bool {
        matches!(self.state, ExchangeState::Done | ExchangeState::Failed)
    }

    /// Wait for the next observable event. `None` after a terminal event.
    pub async fn next_event(&mut self) -> Option<ExchangeEvent> {
        while !self.is_finished() {
            let Some(subscription) = self.subscription.as_mut() else {
                break;
            };
            let frame =
                match tokio::time::timeout_at(self.deadline, subscription.recv()).await {
                    Ok(Some(ChannelEvent::Frame(frame))) => frame,
                    Ok(Some(ChannelEvent::Lost(reason))) => {
                        return Some(self.fail(RelayError::SessionLost(reason)))
                    }
                    Ok(None) => {
                        return Some(self.fail(RelayError::SessionLost(
                            "listener closed".to_string(),
                        )))
                    }
                    Err(_) => {
                        return Some(self.fail(RelayError::Timeout(self.idle_timeout.as_secs())))
                    }
                };

            let message = match protocol::parse_agent_message(&frame) {
                Ok(message) => message,
                Err(err) => {
                    warn!(exchange_id = %self.id, "{err}, dropping frame");
                    continue;
                }
            };
            if let Some(event) = self.handle(message).await {
                return Some(event);
            }
        }
        None
    }

    async fn handle(&mut self, message: AgentMessage) -> Option<ExchangeEvent> {
        match message {
            AgentMessage::Answer { text } => {
                self.progressed();
                self.snapshot(&text)
            }
            AgentMessage::Chunk(chunk) => {
                self.progressed();
                let Ingested { snapshot, acks } = self.chunks.ingest(chunk);
                for ack in acks {
                    if let Err(err) = self.channel.send(&RelayMessage::Ack(ack)).await {
                        warn!(exchange_id = %self.id, index = ack.index, "Failed to send ack: {err}");
                    }
                }
                snapshot.and_then(|text| self.snapshot(&text))
            }
            AgentMessage::Stop { text } => {
                let delta = text.map(|t| self.delta.advance(&t)).unwrap_or_default();
                let discarded = self.chunks.discard();
                if discarded > 0 {
                    warn!(exchange_id = %self.id, discarded, "Stop with incomplete chunk set");
                }
                self.finish(ExchangeState::Done);
                info!(exchange_id = %self.id, len = self.text().len(), "Exchange complete");
                Some(ExchangeEvent::Completed {
                    text: self.text().to_string(),
                    delta,
                })
            }
            AgentMessage::Error { code, message } => {
                Some(self.fail(RelayError::Agent { code, message }))
            }
            AgentMessage::Heartbeat => {
                trace!(exchange_id = %self.id, "Heartbeat");
                None
            }
            AgentMessage::Ack(ack) => {
                debug!(exchange_id = %self.id, index = ack.index, "Ignoring sender-facing ack");
                None
            }
        }
    }

    fn progressed(&mut self) {
        self.deadline = Instant::now() + self.idle_timeout;
    }

    fn snapshot(&mut self, text: &str) -> Option<ExchangeEvent> {
        self.state = ExchangeState::Streaming;
        let delta = self.delta.advance(text);
        (!delta.is_empty()).then_some(ExchangeEvent::Delta(delta))
    }

    fn fail(&mut self, err: RelayError) -> ExchangeEvent {
        self.chunks.discard();
        warn!(exchange_id = %self.id, code = err.code(), "Exchange failed: {err}");
        self.finish(ExchangeState::Failed);
        ExchangeEvent::Failed(err)
    }

    fn finish(&mut self, state: ExchangeState) {
        self.state = state;
        self.subscription = None;
        self.permit = None;
    }
}

impl Drop for Exchange {
    fn drop(&mut self) {
        if self.abandoned || self.is_finished() || self.subscription.is_none() {
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };
        info!(exchange_id = %self.id, "Client went away, draining the rest of the reply");
        let mut rest = Exchange {
            id: self.id.clone(),
            state: self.state,
            subscription: self.subscription.take(),
            channel: self.channel.clone(),
            chunks: std::mem::replace(&mut self.chunks, ChunkBuffer::new(false)),
            delta: std::mem::replace(&mut self.delta, DeltaState::new(false)),
            idle_timeout: self.idle_timeout,
            deadline: self.deadline,
            permit: self.permit.take(),
            abandoned: true,
        };
        runtime.spawn(async move {
            while rest.next_event().await.is_some() {}
            debug!(exchange_id = %rest.id, state = ?rest.state, "Abandoned exchange drained");
        });
    }
}
