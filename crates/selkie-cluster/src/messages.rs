//! Placement protocol messages
//!
//! TigerStyle: Explicit message types with bounded payloads.
//!
//! These are the transport-agnostic record shapes exchanged between
//! members. Serialization and delivery belong to the wire layer; this
//! crate only defines the closed union so every component matches
//! exhaustively.

use crate::activation::{Activation, Pid};
use selkie_core::{ClusterIdentity, Member, MemberId};
use serde::{Deserialize, Serialize};

/// Protocol request ID
pub type RequestId = u64;

/// One unit of the handover stream
///
/// Chunk ids are assigned sequentially starting at 1 per
/// (sender, target, topology) stream. The final chunk may carry no
/// activations but must always be sent: it tells the sink the stream's
/// length and the authoritative sent/skipped totals.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandoverChunk {
    /// Position of this chunk in the sender's stream (1-based)
    pub chunk_id: u32,
    /// Whether this is the sender's last chunk for this stream
    #[serde(rename = "final")]
    pub is_final: bool,
    /// Fingerprint of the topology this stream belongs to
    pub topology_hash: u64,
    /// Activations transferred in this chunk
    pub activations: Vec<Activation>,
    /// Total activations transmitted over the stream (final chunk only)
    pub sent: u32,
    /// Total activations skipped as already-owned (final chunk only)
    pub skipped: u32,
}

impl HandoverChunk {
    /// Create a regular (non-final) chunk
    pub fn regular(chunk_id: u32, topology_hash: u64, activations: Vec<Activation>) -> Self {
        debug_assert!(chunk_id >= 1, "chunk ids start at 1");
        Self {
            chunk_id,
            is_final: false,
            topology_hash,
            activations,
            sent: 0,
            skipped: 0,
        }
    }

    /// Create the final chunk carrying authoritative totals
    pub fn final_chunk(
        chunk_id: u32,
        topology_hash: u64,
        activations: Vec<Activation>,
        sent: u32,
        skipped: u32,
    ) -> Self {
        debug_assert!(chunk_id >= 1, "chunk ids start at 1");
        Self {
            chunk_id,
            is_final: true,
            topology_hash,
            activations,
            sent,
            skipped,
        }
    }
}

/// Sink's verdict on one received chunk
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HandoverAckState {
    /// Chunk applied (or recognized as a duplicate)
    Processed,
    /// Chunk was tagged with a topology the receiver no longer serves
    IncorrectTopology,
}

/// How a handover stream should be produced
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum HandoverMode {
    /// Stream every activation owned by the target under the new topology
    Full,
    /// Stream only activations whose owner changed since the baseline;
    /// unchanged ones are counted as skipped
    Delta {
        /// Fingerprint of the baseline topology
        previous_topology_hash: u64,
    },
}

/// Placement protocol message union
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PartitionMessage {
    /// Ask a member to activate an identity
    ActivationRequest {
        request_id: RequestId,
        identity: ClusterIdentity,
        topology_hash: u64,
    },

    /// Activation outcome
    ActivationResponse {
        request_id: RequestId,
        pid: Option<Pid>,
        failed: bool,
        invalid_identity: bool,
        topology_hash: u64,
    },

    /// One chunk of an ownership handover stream
    IdentityHandover { from: MemberId, chunk: HandoverChunk },

    /// Acknowledgement for one handover chunk
    IdentityHandoverAck {
        chunk_id: u32,
        topology_hash: u64,
        state: HandoverAckState,
    },

    /// Ask a member to stream its activations to the requester
    HandoverRequest {
        requester: MemberId,
        topology_hash: u64,
        mode: HandoverMode,
    },

    /// Topology snapshot dissemination
    ClusterTopology {
        topology_hash: u64,
        members: Vec<Member>,
        joined: Vec<Member>,
        left: Vec<Member>,
        blocked: Vec<MemberId>,
    },

    /// Ask a member to stop one spawned instance (duplicate resolution)
    StopActivation {
        identity: ClusterIdentity,
        pid: Pid,
    },
}

impl PartitionMessage {
    /// Get the request ID if this message has one
    pub fn request_id(&self) -> Option<RequestId> {
        match self {
            Self::ActivationRequest { request_id, .. } => Some(*request_id),
            Self::ActivationResponse { request_id, .. } => Some(*request_id),
            Self::IdentityHandover { .. } => None,
            Self::IdentityHandoverAck { .. } => None,
            Self::HandoverRequest { .. } => None,
            Self::ClusterTopology { .. } => None,
            Self::StopActivation { .. } => None,
        }
    }

    /// Check if this is a response message
    pub fn is_response(&self) -> bool {
        matches!(
            self,
            Self::ActivationResponse { .. } | Self::IdentityHandoverAck { .. }
        )
    }

    /// Get the topology fingerprint this message is keyed to, if any
    pub fn topology_hash(&self) -> Option<u64> {
        match self {
            Self::ActivationRequest { topology_hash, .. } => Some(*topology_hash),
            Self::ActivationResponse { topology_hash, .. } => Some(*topology_hash),
            Self::IdentityHandover { chunk, .. } => Some(chunk.topology_hash),
            Self::IdentityHandoverAck { topology_hash, .. } => Some(*topology_hash),
            Self::HandoverRequest { topology_hash, .. } => Some(*topology_hash),
            Self::ClusterTopology { topology_hash, .. } => Some(*topology_hash),
            Self::StopActivation { .. } => None,
        }
    }
}
