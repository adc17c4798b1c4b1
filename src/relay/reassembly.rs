//! Chunk reassembly for snapshots delivered piecewise.
//!
//! Chunks are stored by index and joined in index order once every index in
//! `0..total` is present, independent of arrival order. A duplicate index
//! overwrites. Every stored chunk is acked `success` on arrival, except the
//! one that completes a set carrying `completeSha256` (with verification
//! enabled): that ack waits for the checksum. A match acks it `success`; a
//! mismatch acks every index `retry` and starts the set over so the sender's
//! resends rebuild it. Chunks with `total == 0` or `index >= total` are
//! dropped unacked.

use std::collections::BTreeMap;

use tracing::{debug, warn};

use super::hasher;
use super::protocol::{AckStatus, Chunk, ChunkAck};
use crate::error::RelayError;

/// Result of ingesting one chunk.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Ingested {
    /// Reconstructed snapshot, present only when this chunk completed the set.
    pub snapshot: Option<String>,
    /// Acks the receiver must send back, in index order.
    pub acks: Vec<ChunkAck>,
}

/// Reassembly state for one chunk set.
#[derive(Debug)]
pub struct ChunkBuffer {
    parts: BTreeMap<u32, String>,
    total: Option<u32>,
    checksum: Option<String>,
    verify_checksums: bool,
}

impl ChunkBuffer {
    pub fn new(verify_checksums: bool) -> Self {
        Self {
            parts: BTreeMap::new(),
            total: None,
            checksum: None,
            verify_checksums,
        }
    }

    /// Store one chunk and report completion.
    pub fn ingest(&mut self, chunk: Chunk) -> Ingested {
        let Chunk {
            index,
            total,
            text,
            complete_sha256,
        } = chunk;

        if index >= total {
            let err = RelayError::MalformedMessage(format!(
                "chunk index {index} out of range for total {total}"
            ));
            warn!(index, total, "{err}, dropping chunk");
            return Ingested::default();
        }

        if let Some(previous) = self.total.filter(|&t| t != total) {
            let err = RelayError::ProtocolInconsistency(format!(
                "chunk total changed from {previous} to {total}"
            ));
            warn!(index, "{err}, using latest");
        }
        self.total = Some(total);

        if let Some(sum) = complete_sha256 {
            if self.checksum.as_deref().is_some_and(|prev| prev != sum) {
                warn!(index, "Chunk checksum changed mid-set, using latest");
            }
            self.checksum = Some(sum);
        }

        if self.parts.insert(index, text).is_some() {
            debug!(index, "Duplicate chunk, overwriting");
        }

        let acks = vec![ack(index, AckStatus::Success)];
        if !self.is_complete() {
            return Ingested {
                snapshot: None,
                acks,
            };
        }

        let text = self.join(total);
        if self.verify_checksums && self.checksum.is_some() {
            let expected = self.checksum.take().unwrap_or_default();
            if !hasher::matches(&text, &expected) {
                warn!(
                    total,
                    expected = %expected,
                    actual = %hasher::sha256_hex(&text),
                    "Reassembled snapshot failed checksum, requesting resend"
                );
                self.reset();
                return Ingested {
                    snapshot: None,
                    acks: (0..total).map(|i| ack(i, AckStatus::Retry)).collect(),
                };
            }
        }

        debug!(total, len = text.len(), "Chunk set complete");
        self.reset();
        Ingested {
            snapshot: Some(text),
            acks,
        }
    }

    /// Complete iff every index in `0..total` has been received.
    pub fn is_complete(&self) -> bool {
        self.total
            .is_some_and(|total| (0..total).all(|i| self.parts.contains_key(&i)))
    }

    /// Number of distinct indices currently buffered.
    pub fn received(&self) -> usize {
        self.parts.len()
    }

    /// Drop any partial set. Returns how many chunks were discarded.
    pub fn discard(&mut self) -> usize {
        let count = self.parts.len();
        self.reset();
        count
    }

    fn join(&self, total: u32) -> String {
        (0..total)
            .filter_map(|i| self.parts.get(&i).map(String::as_str))
            .collect()
    }

    fn reset(&mut self) {
        self.parts.clear();
        self.total = None;
        self.checksum = None;
    }
}

fn ack(index: u32, status: AckStatus) -> ChunkAck {
    ChunkAck { index, status }
}
