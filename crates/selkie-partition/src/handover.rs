//! Chunked ownership handover
//!
//! TigerStyle: Idempotent chunk streams with explicit completion.
//!
//! During a topology change, every member streams the activations it
//! hosts to their new ring owners. Streams are chunked; chunk ids are
//! sequential per (sender, target, topology) starting at 1, and every
//! stream ends with a final chunk carrying the authoritative sent/skipped
//! totals — even when that chunk carries no activations.
//!
//! The sink side tracks received chunk ids per sending member. A sender's
//! stream is complete once the final chunk has been seen and the id set
//! covers every id from 1 to the final id with no gaps, regardless of
//! arrival order. Duplicates are counted and never applied twice.

use selkie_cluster::{Activation, HandoverChunk, HashRing};
use selkie_core::MemberId;
use std::collections::{BTreeSet, HashMap};
use tracing::{debug, warn};

// =============================================================================
// Source
// =============================================================================

/// Plans handover chunk streams from locally hosted activations
#[derive(Debug, Clone)]
pub struct HandoverSource {
    chunk_size: usize,
}

struct StreamBuffer {
    next_chunk_id: u32,
    chunks: Vec<HandoverChunk>,
    pending: Vec<Activation>,
    sent: u32,
    skipped: u32,
}

impl StreamBuffer {
    fn new() -> Self {
        Self {
            next_chunk_id: 1,
            chunks: Vec::new(),
            pending: Vec::new(),
            sent: 0,
            skipped: 0,
        }
    }

    fn push(&mut self, activation: Activation, chunk_size: usize, topology_hash: u64) {
        self.pending.push(activation);
        self.sent += 1;
        if self.pending.len() >= chunk_size {
            let chunk_id = self.next_chunk_id;
            self.next_chunk_id += 1;
            self.chunks.push(HandoverChunk::regular(
                chunk_id,
                topology_hash,
                std::mem::take(&mut self.pending),
            ));
        }
    }

    fn finish(mut self, topology_hash: u64) -> Vec<HandoverChunk> {
        // The final chunk must be sent even when empty: it signals stream
        // length and carries the authoritative totals.
        let chunk_id = self.next_chunk_id;
        self.chunks.push(HandoverChunk::final_chunk(
            chunk_id,
            topology_hash,
            std::mem::take(&mut self.pending),
            self.sent,
            self.skipped,
        ));
        self.chunks
    }
}

impl HandoverSource {
    /// Create a source with the given chunk size
    ///
    /// # Panics
    /// Panics if `chunk_size` is zero.
    pub fn new(chunk_size: usize) -> Self {
        assert!(chunk_size >= 1, "chunk size must be positive");
        Self { chunk_size }
    }

    /// Plan the chunk streams for one topology change
    ///
    /// Iterates the locally hosted activations and routes each to its
    /// owner under `target_ring`. In delta mode (`previous_ring`
    /// supplied), activations whose owner is unchanged from the baseline
    /// are counted as skipped instead of transmitted — the receiver is
    /// assumed to already have them.
    ///
    /// With `restrict_to` set, only that member's stream is produced
    /// (pull-mode targeted handover); otherwise every member on the
    /// target ring gets a stream, if only a final chunk.
    pub fn plan<'a>(
        &self,
        hosted: impl IntoIterator<Item = &'a Activation>,
        target_ring: &HashRing,
        topology_hash: u64,
        previous_ring: Option<&HashRing>,
        restrict_to: Option<&MemberId>,
    ) -> HashMap<MemberId, Vec<HandoverChunk>> {
        let mut streams: HashMap<MemberId, StreamBuffer> = HashMap::new();

        // Seed every target so each gets its final chunk even when empty.
        match restrict_to {
            Some(target) => {
                streams.insert(target.clone(), StreamBuffer::new());
            }
            None => {
                for member in target_ring.members() {
                    streams.insert(member.id.clone(), StreamBuffer::new());
                }
            }
        }

        for activation in hosted {
            let owner = match target_ring.owner(&activation.identity) {
                Some(owner) => owner.id.clone(),
                None => continue,
            };

            if let Some(target) = restrict_to {
                if &owner != target {
                    continue;
                }
            }

            let buffer = match streams.get_mut(&owner) {
                Some(buffer) => buffer,
                None => continue,
            };

            let unchanged = previous_ring
                .and_then(|ring| ring.owner(&activation.identity))
                .map(|previous| previous.id == owner)
                .unwrap_or(false);

            if unchanged {
                buffer.skipped += 1;
            } else {
                buffer.push(activation.clone(), self.chunk_size, topology_hash);
            }
        }

        streams
            .into_iter()
            .map(|(target, buffer)| (target, buffer.finish(topology_hash)))
            .collect()
    }
}

// =============================================================================
// Sink
// =============================================================================

/// Outcome of receiving one chunk
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChunkOutcome {
    /// New chunk: apply these activations to the identity table
    Apply(Vec<Activation>),
    /// Chunk id already recorded; nothing to apply
    Duplicate,
    /// Chunk keyed to a topology this sink does not serve
    IncorrectTopology,
    /// Sender is not part of the expected topology
    UnknownSender,
}

#[derive(Debug, Default)]
struct SenderProgress {
    received: BTreeSet<u32>,
    final_chunk_id: Option<u32>,
    duplicates: u32,
    sent_total: u32,
    skipped_total: u32,
    /// Set when the sender is excused (e.g. abandoned after retries)
    forced_complete: bool,
}

impl SenderProgress {
    fn is_complete(&self) -> bool {
        if self.forced_complete {
            return true;
        }
        match self.final_chunk_id {
            Some(final_id) => (1..=final_id).all(|id| self.received.contains(&id)),
            None => false,
        }
    }
}

/// Tracks one rebalance's incoming chunk streams
///
/// One sink per in-progress rebalance on the receiving member.
#[derive(Debug)]
pub struct HandoverSink {
    topology_hash: u64,
    senders: HashMap<MemberId, SenderProgress>,
}

impl HandoverSink {
    /// Create a sink expecting streams from the given senders
    pub fn new(topology_hash: u64, expected: impl IntoIterator<Item = MemberId>) -> Self {
        let senders = expected
            .into_iter()
            .map(|id| (id, SenderProgress::default()))
            .collect();
        Self {
            topology_hash,
            senders,
        }
    }

    /// The topology fingerprint this sink serves
    pub fn topology_hash(&self) -> u64 {
        self.topology_hash
    }

    /// Record one incoming chunk
    pub fn receive(&mut self, from: &MemberId, chunk: HandoverChunk) -> ChunkOutcome {
        if chunk.topology_hash != self.topology_hash {
            debug!(
                from = %from,
                chunk_topology = chunk.topology_hash,
                sink_topology = self.topology_hash,
                "rejecting chunk for foreign topology"
            );
            return ChunkOutcome::IncorrectTopology;
        }

        let progress = match self.senders.get_mut(from) {
            Some(progress) => progress,
            None => {
                debug!(from = %from, "chunk from sender outside expected set");
                return ChunkOutcome::UnknownSender;
            }
        };

        debug_assert!(chunk.chunk_id >= 1, "chunk ids start at 1");

        if !progress.received.insert(chunk.chunk_id) {
            progress.duplicates += 1;
            return ChunkOutcome::Duplicate;
        }

        if chunk.is_final {
            progress.final_chunk_id = Some(chunk.chunk_id);
            progress.sent_total = chunk.sent;
            progress.skipped_total = chunk.skipped;
        }

        ChunkOutcome::Apply(chunk.activations)
    }

    /// Check whether one sender's stream is complete
    pub fn sender_complete(&self, sender: &MemberId) -> bool {
        self.senders
            .get(sender)
            .map(|p| p.is_complete())
            .unwrap_or(false)
    }

    /// Check whether every expected sender's stream is complete
    pub fn is_complete(&self) -> bool {
        self.senders.values().all(|p| p.is_complete())
    }

    /// Senders whose streams are still incomplete
    pub fn incomplete_senders(&self) -> Vec<MemberId> {
        self.senders
            .iter()
            .filter(|(_, p)| !p.is_complete())
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Duplicate count recorded for one sender
    pub fn duplicates(&self, sender: &MemberId) -> u32 {
        self.senders.get(sender).map(|p| p.duplicates).unwrap_or(0)
    }

    /// Reported (sent, skipped) totals for a completed sender
    pub fn reported_totals(&self, sender: &MemberId) -> Option<(u32, u32)> {
        let progress = self.senders.get(sender)?;
        progress.final_chunk_id?;
        Some((progress.sent_total, progress.skipped_total))
    }

    /// Validate a completed delta stream against the local table
    ///
    /// `locally_attributed` is the number of activations the local table
    /// now attributes to this sender. A mismatch against the reported
    /// totals means the delta baseline was unsafe (e.g. a spawn committed
    /// between baselines) and the sender's stream must be redone in full.
    pub fn validate_delta(&self, sender: &MemberId, locally_attributed: u32) -> bool {
        match self.reported_totals(sender) {
            Some((sent, skipped)) => {
                let reported = sent + skipped;
                if reported != locally_attributed {
                    warn!(
                        sender = %sender,
                        reported,
                        locally_attributed,
                        "delta handover validation mismatch"
                    );
                    false
                } else {
                    true
                }
            }
            None => false,
        }
    }

    /// Clear one sender's progress so its stream can be redone
    pub fn reset_sender(&mut self, sender: &MemberId) {
        if let Some(progress) = self.senders.get_mut(sender) {
            *progress = SenderProgress::default();
        }
    }

    /// Excuse one sender from completion (retries exhausted or member gone)
    pub fn force_sender_complete(&mut self, sender: &MemberId) {
        if let Some(progress) = self.senders.get_mut(sender) {
            progress.forced_complete = true;
        }
    }
}
