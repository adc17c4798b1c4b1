//! Sender-side chunk acknowledgment with bounded retry.
//!
//! Each chunk moves through `sent -> awaiting-ack -> {acked | resend}`. A
//! `retry` ack or an expired per-attempt timeout both count as a failed
//! attempt; once a chunk has used `max_attempts` sends the whole transfer fails
//! with [`RelayError::ChunkDeliveryFailure`]. Nothing is ever dropped silently.
//!
//! An acked chunk stays resendable until the whole set is acked: the receiver
//! may still answer `retry` for every index if the reassembled set fails its
//! checksum.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::hasher;
use super::protocol::{self, AckStatus, AgentMessage, Chunk, ChunkAck};
use crate::error::RelayError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChunkState {
    AwaitingAck { attempts: u32, deadline: Instant },
    Acked { attempts: u32 },
}

/// What the sender must do after an ack or a timeout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckAction {
    /// Not awaited (unknown index, or a repeated `success`).
    Ignore,
    Acked,
    /// Send the same chunk again.
    Resend(u32),
    /// Retry budget spent; the transfer is dead.
    Exhausted { index: u32, attempts: u32 },
}

/// Per-chunk ack tracking for one chunk set.
#[derive(Debug)]
pub struct AckCoordinator {
    states: BTreeMap<u32, ChunkState>,
    max_attempts: u32,
    ack_timeout: Duration,
}

impl AckCoordinator {
    pub fn new(max_attempts: u32, ack_timeout: Duration) -> Self {
        Self {
            states: BTreeMap::new(),
            max_attempts: max_attempts.max(1),
            ack_timeout,
        }
    }

    /// Record that `index` went out at `now`; starts a fresh attempt.
    pub fn mark_sent(&mut self, index: u32, now: Instant) {
        let attempts = match self.states.get(&index) {
            Some(
                ChunkState::AwaitingAck { attempts, .. } | ChunkState::Acked { attempts },
            ) => attempts + 1,
            None => 1,
        };
        self.states.insert(
            index,
            ChunkState::AwaitingAck {
                attempts,
                deadline: now + self.ack_timeout,
            },
        );
    }

    pub fn on_ack(&mut self, ack: ChunkAck) -> AckAction {
        match (self.states.get(&ack.index).copied(), ack.status) {
            (Some(ChunkState::AwaitingAck { attempts, .. }), AckStatus::Success) => {
                self.states.insert(ack.index, ChunkState::Acked { attempts });
                AckAction::Acked
            }
            (
                Some(ChunkState::AwaitingAck { attempts, .. } | ChunkState::Acked { attempts }),
                AckStatus::Retry,
            ) => self.failed_attempt(ack.index, attempts),
            _ => {
                debug!(index = ack.index, "Ack for chunk not awaited, ignoring");
                AckAction::Ignore
            }
        }
    }

    /// Indices whose current attempt deadline has passed.
    pub fn expired(&self, now: Instant) -> Vec<u32> {
        self.states
            .iter()
            .filter_map(|(&index, state)| match state {
                ChunkState::AwaitingAck { deadline, .. } if *deadline <= now => Some(index),
                _ => None,
            })
            .collect()
    }

    /// Treat the current attempt of `index` as failed by timeout.
    pub fn on_timeout(&mut self, index: u32) -> AckAction {
        match self.states.get(&index).copied() {
            Some(ChunkState::AwaitingAck { attempts, .. }) => {
                warn!(index, attempts, "Chunk ack timed out");
                self.failed_attempt(index, attempts)
            }
            _ => AckAction::Ignore,
        }
    }

    fn failed_attempt(&self, index: u32, attempts: u32) -> AckAction {
        if attempts >= self.max_attempts {
            AckAction::Exhausted { index, attempts }
        } else {
            AckAction::Resend(index)
        }
    }

    /// Earliest pending deadline.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.states
            .values()
            .filter_map(|state| match state {
                ChunkState::AwaitingAck { deadline, .. } => Some(*deadline),
                ChunkState::Acked { .. } => None,
            })
            .min()
    }

    pub fn is_complete(&self) -> bool {
        self.states
            .values()
            .all(|s| matches!(s, ChunkState::Acked { .. }))
    }
}

/// Split `text` into pieces of at most `chunk_size` chars.
///
/// Always yields at least one piece so an empty snapshot is still a valid set.
pub fn split_chunks(text: &str, chunk_size: usize) -> Vec<String> {
    let chunk_size = chunk_size.max(1);
    let chars: Vec<char> = text.chars().collect();
    if chars.is_empty() {
        return vec![String::new()];
    }
    chars
        .chunks(chunk_size)
        .map(|piece| piece.iter().collect())
        .collect()
}

/// Sends one snapshot as a checksummed chunk set and drives it to completion.
#[derive(Debug, Clone, Copy)]
pub struct ChunkSender {
    pub chunk_size: usize,
    pub max_attempts: u32,
    pub ack_timeout: Duration,
}

impl ChunkSender {
    /// Send every chunk, then resend on `retry` or timeout until all are acked.
    ///
    /// `out` carries encoded frames to the socket writer; `acks` yields the
    /// receiver's acks for this set.
    pub async fn send(
        &self,
        text: &str,
        out: &mpsc::Sender<String>,
        acks: &mut mpsc::Receiver<ChunkAck>,
    ) -> Result<(), RelayError> {
        let checksum = hasher::sha256_hex(text);
        let pieces = split_chunks(text, self.chunk_size);
        let total = u32::try_from(pieces.len()).map_err(|_| {
            RelayError::ProtocolInconsistency(format!("too many chunks: {}", pieces.len()))
        })?;
        let frames = pieces
            .into_iter()
            .zip(0..total)
            .map(|(text, index)| {
                protocol::encode(&AgentMessage::Chunk(Chunk {
                    index,
                    total,
                    text,
                    complete_sha256: Some(checksum.clone()),
                }))
            })
            .collect::<Result<Vec<_>, _>>()?;

        let mut coordinator = AckCoordinator::new(self.max_attempts, self.ack_timeout);
        for (index, frame) in (0..total).zip(&frames) {
            send_frame(out, frame).await?;
            coordinator.mark_sent(index, Instant::now());
        }
        debug!(total, "Chunk set sent, awaiting acks");

        while let Some(deadline) = coordinator.next_deadline() {
            let actions = tokio::select! {
                ack = acks.recv() => {
                    let ack = ack.ok_or_else(|| {
                        RelayError::SessionLost("ack stream closed".to_string())
                    })?;
                    vec![coordinator.on_ack(ack)]
                }
                () = tokio::time::sleep_until(tokio::time::Instant::from_std(deadline)) => {
                    coordinator
                        .expired(Instant::now())
                        .into_iter()
                        .map(|index| coordinator.on_timeout(index))
                        .collect()
                }
            };

            for action in actions {
                match action {
                    AckAction::Resend(index) => {
                        debug!(index, "Resending chunk");
                        send_frame(out, &frames[index as usize]).await?;
                        coordinator.mark_sent(index, Instant::now());
                    }
                    AckAction::Exhausted { index, attempts } => {
                        warn!(index, attempts, "Chunk delivery failed");
                        return Err(RelayError::ChunkDeliveryFailure { index, attempts });
                    }
                    AckAction::Acked | AckAction::Ignore => {}
                }
            }
        }

        debug_assert!(coordinator.is_complete());
        info!(total, len = text.len(), "Chunk set delivered");
        Ok(())
    }
}

async fn send_frame(out: &mpsc::Sender<String>, frame: &str) -> Result<(), RelayError> {
    out.send(frame.to_string())
        .await
        .map_err(|_| RelayError::SessionLost("socket writer closed".to_string()))
}
