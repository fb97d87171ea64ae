//! Cross-member call contract
//!
//! TigerStyle: Asynchronous request/response with caller-supplied
//! deadlines.
//!
//! The wire layer (serialization, retries, connections) is an external
//! collaborator. Components in this workspace call other members through
//! this trait; tests wire members together with in-process
//! implementations. Deadline expiry fails the call locally without
//! necessarily cancelling the remote side — callers must reconcile late
//! completions defensively.

use crate::activation::Pid;
use crate::error::ClientError;
use crate::messages::{HandoverAckState, HandoverChunk, HandoverMode};
use async_trait::async_trait;
use selkie_core::{ClusterIdentity, Member, MemberId};

/// Calls one member can make against another
#[async_trait]
pub trait ClusterClient: Send + Sync {
    /// Ask `target` to activate `identity`, waiting at most `timeout_ms`
    async fn request_activation(
        &self,
        target: &Member,
        identity: &ClusterIdentity,
        timeout_ms: u64,
    ) -> Result<Pid, ClientError>;

    /// Deliver one handover chunk to `target`
    async fn send_handover_chunk(
        &self,
        target: &Member,
        from: MemberId,
        chunk: HandoverChunk,
    ) -> Result<HandoverAckState, ClientError>;

    /// Ask `target` to stream its activations to `requester`
    ///
    /// Returns `IncorrectTopology` when the target has not (yet) observed
    /// the topology the request is keyed to; callers retry.
    async fn request_handover(
        &self,
        target: &Member,
        requester: MemberId,
        topology_hash: u64,
        mode: HandoverMode,
    ) -> Result<HandoverAckState, ClientError>;

    /// Ask `target` to stop one spawned instance (duplicate resolution)
    async fn stop_activation(
        &self,
        target: &Member,
        identity: &ClusterIdentity,
        pid: &Pid,
    ) -> Result<(), ClientError>;
}
