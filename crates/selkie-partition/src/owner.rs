//! Partition identity owner
//!
//! TigerStyle: One logical sequential actor per member; suspended
//! continuations re-validate before touching state.
//!
//! The owner holds the identity table for every identity whose ring
//! owner is this member. It processes one command at a time; awaited
//! sub-operations (activation requests, consensus waits, chunk delivery)
//! run in spawned tasks that resume the owner by sending commands back
//! through its own mailbox. Nothing blocks the loop, so lookups keep
//! being served while a spawn or a handover is in flight.
//!
//! States: `Normal` (serving from the table) and `Rebalancing` (a
//! handover is in progress for the current topology; requests for
//! identities not already owned suspend and are retried when the
//! rebalance resolves).

use crate::activator::PlacementActivator;
use crate::error::{PartitionError, PartitionResult};
use crate::handover::{ChunkOutcome, HandoverSink, HandoverSource};
use selkie_cluster::{
    Activation, ClientError, ClusterClient, ConsensusChecks, HandoverAckState, HandoverChunk,
    HandoverMode, HashRing, KindRegistry, Pid, Topology,
};
use selkie_core::{
    ClusterIdentity, Member, MemberId, CONSENSUS_TIMEOUT_MS_DEFAULT, EVENT_CHANNEL_CAPACITY,
    HANDOVER_CHUNK_ACTIVATIONS_COUNT_DEFAULT, HANDOVER_RETRY_COUNT_MAX, OWNER_MAILBOX_DEPTH_MAX,
    RING_VIRTUAL_POINTS_COUNT_DEFAULT, SPAWN_TIMEOUT_MS_DEFAULT,
};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Attempts to deliver a chunk or handover request to a member that has
/// not observed the topology yet
const DELIVERY_RETRY_COUNT_MAX: u32 = 10;

/// Delay between delivery retries in milliseconds
const DELIVERY_RETRY_DELAY_MS: u64 = 50;

// =============================================================================
// Configuration
// =============================================================================

/// How ownership records move on a topology change
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RebalanceMode {
    /// Every member streams to every other member as soon as the
    /// topology changes. Simpler, higher bandwidth.
    #[default]
    Push,
    /// The new owner waits for the in-flight-activation consensus check,
    /// then requests targeted handovers. Narrower duplicate window,
    /// higher latency.
    Pull,
}

/// Partition owner configuration
#[derive(Debug, Clone)]
pub struct OwnerConfig {
    /// Virtual points per member on the hash ring
    pub virtual_points: usize,
    /// Activations per handover chunk
    pub chunk_size: usize,
    /// Deadline for cross-member activation requests
    pub spawn_timeout_ms: u64,
    /// Bounded wait for the pull-mode consensus check
    pub consensus_timeout_ms: u64,
    /// Retries for a sender whose delta stream failed validation
    pub handover_retry_max: u32,
    /// Rebalance delivery mode
    pub mode: RebalanceMode,
    /// Mailbox depth
    pub mailbox_depth: usize,
}

impl Default for OwnerConfig {
    fn default() -> Self {
        Self {
            virtual_points: RING_VIRTUAL_POINTS_COUNT_DEFAULT,
            chunk_size: HANDOVER_CHUNK_ACTIVATIONS_COUNT_DEFAULT,
            spawn_timeout_ms: SPAWN_TIMEOUT_MS_DEFAULT,
            consensus_timeout_ms: CONSENSUS_TIMEOUT_MS_DEFAULT,
            handover_retry_max: HANDOVER_RETRY_COUNT_MAX,
            mode: RebalanceMode::Push,
            mailbox_depth: OWNER_MAILBOX_DEPTH_MAX,
        }
    }
}

impl OwnerConfig {
    /// Configuration with short timeouts for tests
    pub fn for_testing() -> Self {
        Self {
            chunk_size: 10,
            spawn_timeout_ms: 1_000,
            consensus_timeout_ms: 200,
            handover_retry_max: 2,
            mailbox_depth: 1024,
            ..Default::default()
        }
    }
}

// =============================================================================
// Public surface
// =============================================================================

/// Result of one lookup
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LookupOutcome {
    /// The identity's live location
    Found(Pid),
    /// This member does not own the identity; re-send to this member
    Redirect(Member),
}

/// Events published by the owner
#[derive(Debug, Clone)]
pub enum OwnerEvent {
    /// A rebalance started for the given topology
    RebalanceStarted { topology_hash: u64 },
    /// Every expected sender's stream completed
    RebalanceCompleted { topology_hash: u64 },
    /// Two locations raced for one identity; the older one was stopped
    DuplicateResolved { identity: ClusterIdentity },
}

type LookupReply = oneshot::Sender<PartitionResult<LookupOutcome>>;

/// Closed command union processed by the owner loop
enum OwnerCommand {
    GetOrSpawn {
        identity: ClusterIdentity,
        topology_hash: u64,
        reply: LookupReply,
    },
    TopologyChanged {
        topology: Arc<Topology>,
    },
    HandoverReceived {
        from: MemberId,
        chunk: HandoverChunk,
        reply: oneshot::Sender<HandoverAckState>,
    },
    HandoverRequested {
        requester: MemberId,
        topology_hash: u64,
        mode: HandoverMode,
        reply: oneshot::Sender<HandoverAckState>,
    },
    ActivationTerminated {
        identity: ClusterIdentity,
        pid: Pid,
    },
    SpawnSettled {
        identity: ClusterIdentity,
        target: MemberId,
        result: PartitionResult<Pid>,
    },
    ConsensusSettled {
        topology_hash: u64,
        agreed: bool,
    },
    Shutdown,
}

/// Handle to a running partition owner
#[derive(Clone)]
pub struct PartitionOwnerHandle {
    tx: mpsc::Sender<OwnerCommand>,
    events_tx: broadcast::Sender<OwnerEvent>,
}

impl PartitionOwnerHandle {
    /// Resolve an identity, spawning it if this member owns it
    pub async fn get_or_spawn(
        &self,
        identity: ClusterIdentity,
        topology_hash: u64,
    ) -> PartitionResult<LookupOutcome> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(OwnerCommand::GetOrSpawn {
                identity,
                topology_hash,
                reply,
            })
            .await
            .map_err(|_| PartitionError::ShuttingDown)?;
        rx.await.map_err(|_| PartitionError::ShuttingDown)?
    }

    /// Deliver a new topology snapshot
    pub async fn topology_changed(&self, topology: Arc<Topology>) {
        let _ = self.tx.send(OwnerCommand::TopologyChanged { topology }).await;
    }

    /// Deliver one handover chunk from another member
    pub async fn handover_chunk(
        &self,
        from: MemberId,
        chunk: HandoverChunk,
    ) -> PartitionResult<HandoverAckState> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(OwnerCommand::HandoverReceived { from, chunk, reply })
            .await
            .map_err(|_| PartitionError::ShuttingDown)?;
        rx.await.map_err(|_| PartitionError::ShuttingDown)
    }

    /// Ask this member to stream its hosted activations to `requester`
    pub async fn handover_requested(
        &self,
        requester: MemberId,
        topology_hash: u64,
        mode: HandoverMode,
    ) -> PartitionResult<HandoverAckState> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(OwnerCommand::HandoverRequested {
                requester,
                topology_hash,
                mode,
                reply,
            })
            .await
            .map_err(|_| PartitionError::ShuttingDown)?;
        rx.await.map_err(|_| PartitionError::ShuttingDown)
    }

    /// Report that an activation terminated
    pub async fn activation_terminated(&self, identity: ClusterIdentity, pid: Pid) {
        let _ = self
            .tx
            .send(OwnerCommand::ActivationTerminated { identity, pid })
            .await;
    }

    /// Subscribe to owner events
    pub fn events(&self) -> broadcast::Receiver<OwnerEvent> {
        self.events_tx.subscribe()
    }

    /// Stop the owner loop
    pub async fn shutdown(&self) {
        let _ = self.tx.send(OwnerCommand::Shutdown).await;
    }
}

// =============================================================================
// Owner
// =============================================================================

struct PendingSpawn {
    target: Member,
    waiters: Vec<LookupReply>,
}

struct Rebalance {
    sink: HandoverSink,
    retries: HashMap<MemberId, u32>,
}

/// The per-member identity owner actor
pub struct PartitionOwner {
    member_id: MemberId,
    config: OwnerConfig,
    client: Arc<dyn ClusterClient>,
    kinds: Arc<KindRegistry>,
    activator: Arc<PlacementActivator>,
    consensus: Option<Arc<dyn ConsensusChecks>>,
    topology: Arc<Topology>,
    ring: HashRing,
    /// Baseline of the superseded topology, kept until the rebalance ends
    previous: Option<(u64, HashRing)>,
    /// Identity table: identities this member owns under the current ring
    owned: HashMap<ClusterIdentity, Activation>,
    /// In-flight spawn memoization: concurrent requests share one result
    spawns: HashMap<ClusterIdentity, PendingSpawn>,
    /// Lookups suspended while a rebalance is in progress
    suspended: Vec<(ClusterIdentity, LookupReply)>,
    rebalance: Option<Rebalance>,
    self_tx: mpsc::Sender<OwnerCommand>,
    events_tx: broadcast::Sender<OwnerEvent>,
}

impl PartitionOwner {
    /// Spawn the owner loop for one member
    pub fn spawn(
        member_id: MemberId,
        config: OwnerConfig,
        kinds: Arc<KindRegistry>,
        activator: Arc<PlacementActivator>,
        client: Arc<dyn ClusterClient>,
        consensus: Option<Arc<dyn ConsensusChecks>>,
    ) -> (PartitionOwnerHandle, JoinHandle<()>) {
        assert!(config.chunk_size >= 1, "chunk size must be positive");
        assert!(config.mailbox_depth >= 1, "mailbox depth must be positive");

        let (tx, rx) = mpsc::channel(config.mailbox_depth);
        let (events_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        let ring = HashRing::new(config.virtual_points);
        let owner = Self {
            member_id,
            config,
            client,
            kinds,
            activator,
            consensus,
            topology: Arc::new(Topology::empty()),
            ring,
            previous: None,
            owned: HashMap::new(),
            spawns: HashMap::new(),
            suspended: Vec::new(),
            rebalance: None,
            self_tx: tx.clone(),
            events_tx: events_tx.clone(),
        };

        let handle = PartitionOwnerHandle { tx, events_tx };
        let join = tokio::spawn(owner.run(rx));
        (handle, join)
    }

    async fn run(mut self, mut rx: mpsc::Receiver<OwnerCommand>) {
        while let Some(command) = rx.recv().await {
            match command {
                OwnerCommand::Shutdown => break,
                OwnerCommand::GetOrSpawn {
                    identity,
                    topology_hash,
                    reply,
                } => self.handle_get_or_spawn(identity, topology_hash, reply).await,
                OwnerCommand::TopologyChanged { topology } => {
                    self.handle_topology_changed(topology).await
                }
                OwnerCommand::HandoverReceived { from, chunk, reply } => {
                    let ack = self.apply_chunk(from.clone(), chunk);
                    let _ = reply.send(ack);
                    self.after_chunk(from).await;
                }
                OwnerCommand::HandoverRequested {
                    requester,
                    topology_hash,
                    mode,
                    reply,
                } => {
                    let ack = self.handle_handover_requested(requester, topology_hash, mode).await;
                    let _ = reply.send(ack);
                }
                OwnerCommand::ActivationTerminated { identity, pid } => {
                    self.handle_activation_terminated(identity, pid)
                }
                OwnerCommand::SpawnSettled {
                    identity,
                    target,
                    result,
                } => self.handle_spawn_settled(identity, target, result),
                OwnerCommand::ConsensusSettled {
                    topology_hash,
                    agreed,
                } => self.handle_consensus_settled(topology_hash, agreed),
            }
        }

        // Shutting down: nothing suspended or in flight can complete now.
        for (_, reply) in self.suspended.drain(..) {
            let _ = reply.send(Err(PartitionError::ShuttingDown));
        }
        for (_, pending) in self.spawns.drain() {
            for waiter in pending.waiters {
                let _ = waiter.send(Err(PartitionError::ShuttingDown));
            }
        }
    }

    // =========================================================================
    // Lookup
    // =========================================================================

    async fn handle_get_or_spawn(
        &mut self,
        identity: ClusterIdentity,
        caller_topology_hash: u64,
        reply: LookupReply,
    ) {
        if let Some(activation) = self.owned.get(&identity) {
            let _ = reply.send(Ok(LookupOutcome::Found(activation.pid.clone())));
            return;
        }

        // Invariant: while a rebalance is in progress, requests for
        // identities not already owned suspend and retry afterwards.
        if self.rebalance.is_some() {
            debug!(identity = %identity, "suspending lookup during rebalance");
            self.suspended.push((identity, reply));
            return;
        }

        if caller_topology_hash != self.topology.hash {
            debug!(
                identity = %identity,
                caller = caller_topology_hash,
                local = self.topology.hash,
                "caller topology stale, re-resolving owner"
            );
        }

        let owner = match self.ring.owner(&identity) {
            Some(member) => member.clone(),
            None => {
                let _ = reply.send(Err(PartitionError::ClusterEmpty));
                return;
            }
        };

        if owner.id != self.member_id {
            let _ = reply.send(Ok(LookupOutcome::Redirect(owner)));
            return;
        }

        // Memoize in-flight spawns: concurrent requests for the same
        // identity share one pending result.
        if let Some(pending) = self.spawns.get_mut(&identity) {
            pending.waiters.push(reply);
            return;
        }

        let target = match self.kinds.select_for_kind(identity.kind()) {
            Some(member) => member,
            None => {
                let _ = reply.send(Err(PartitionError::NoActivatorAvailable {
                    kind: identity.kind().to_string(),
                }));
                return;
            }
        };

        self.spawns.insert(
            identity.clone(),
            PendingSpawn {
                target: target.clone(),
                waiters: vec![reply],
            },
        );

        // Reentrant continuation: the request runs in its own task and
        // resumes the owner through the mailbox.
        let client = self.client.clone();
        let self_tx = self.self_tx.clone();
        let timeout_ms = self.config.spawn_timeout_ms;
        tokio::spawn(async move {
            let result = client
                .request_activation(&target, &identity, timeout_ms)
                .await
                .map_err(|e| match e {
                    ClientError::Timeout { .. } => PartitionError::SpawnTimeout {
                        identity: identity.qualified_name(),
                        timeout_ms,
                    },
                    ClientError::InvalidIdentity { .. } => PartitionError::InvalidIdentity {
                        identity: identity.qualified_name(),
                    },
                    other => PartitionError::from(other),
                });
            let _ = self_tx
                .send(OwnerCommand::SpawnSettled {
                    identity,
                    target: target.id,
                    result,
                })
                .await;
        });
    }

    fn handle_spawn_settled(
        &mut self,
        identity: ClusterIdentity,
        target: MemberId,
        result: PartitionResult<Pid>,
    ) {
        let Some(pending) = self.spawns.remove(&identity) else {
            // The entry was failed while we were suspended (e.g. the
            // target left). Waiters are gone; discard the orphan.
            if let Ok(pid) = result {
                debug!(identity = %identity, pid = %pid, "late spawn discarded");
                self.request_stop(&target, &identity, &pid);
            }
            return;
        };

        // Re-validate after the suspension window: ownership may have moved.
        match self.ring.owner(&identity).cloned() {
            Some(member) if member.id == self.member_id => {}
            Some(member) => {
                debug!(identity = %identity, owner = %member.id, "ownership moved during spawn");
                if let Ok(pid) = &result {
                    self.request_stop(&target, &identity, pid);
                }
                for waiter in pending.waiters {
                    let _ = waiter.send(Ok(LookupOutcome::Redirect(member.clone())));
                }
                return;
            }
            None => {
                for waiter in pending.waiters {
                    let _ = waiter.send(Err(PartitionError::ClusterEmpty));
                }
                return;
            }
        }

        match result {
            Ok(pid) => {
                self.insert_owned(Activation::new(identity, pid.clone(), target));
                for waiter in pending.waiters {
                    let _ = waiter.send(Ok(LookupOutcome::Found(pid.clone())));
                }
            }
            Err(e) => {
                warn!(identity = %identity, error = %e, "activation request failed");
                for waiter in pending.waiters {
                    let _ = waiter.send(Err(e.clone()));
                }
            }
        }
    }

    /// Insert a record, resolving conflicts toward the later arrival
    fn insert_owned(&mut self, activation: Activation) {
        match self.ring.owner(&activation.identity) {
            Some(member) if member.id == self.member_id => {}
            _ => {
                debug!(identity = %activation.identity, "dropping record not owned here");
                return;
            }
        }
        if !self.topology.contains(&activation.hosted_on) {
            debug!(
                identity = %activation.identity,
                member_id = %activation.hosted_on,
                "dropping record hosted on unknown member"
            );
            return;
        }

        let identity = activation.identity.clone();
        let pid = activation.pid.clone();
        if let Some(existing) = self.owned.insert(identity.clone(), activation) {
            if existing.pid != pid {
                info!(
                    identity = %identity,
                    older = %existing.pid,
                    newer = %pid,
                    "duplicate activation resolved, stopping older instance"
                );
                self.request_stop(&existing.hosted_on, &existing.identity, &existing.pid);
                let _ = self.events_tx.send(OwnerEvent::DuplicateResolved { identity });
            }
        }
    }

    fn handle_activation_terminated(&mut self, identity: ClusterIdentity, pid: Pid) {
        // Remove only the exact instance: a newer replacement under the
        // same identity must survive a stale termination report.
        match self.owned.get(&identity) {
            Some(current) if current.pid == pid => {
                self.owned.remove(&identity);
                debug!(identity = %identity, pid = %pid, "activation removed");
            }
            _ => {
                debug!(identity = %identity, pid = %pid, "stale termination ignored");
            }
        }
    }

    fn request_stop(&self, hosted_on: &MemberId, identity: &ClusterIdentity, pid: &Pid) {
        let Some(member) = self.topology.member(hosted_on).cloned() else {
            return;
        };
        let client = self.client.clone();
        let identity = identity.clone();
        let pid = pid.clone();
        tokio::spawn(async move {
            if let Err(e) = client.stop_activation(&member, &identity, &pid).await {
                debug!(identity = %identity, error = %e, "stop request failed");
            }
        });
    }

    // =========================================================================
    // Topology change
    // =========================================================================

    async fn handle_topology_changed(&mut self, topology: Arc<Topology>) {
        if topology.hash == self.topology.hash {
            return;
        }

        info!(
            member_id = %self.member_id,
            topology_hash = topology.hash,
            members = topology.members.len(),
            "topology changed, starting rebalance"
        );

        let new_ring = match HashRing::from_members(
            topology.members.iter().cloned(),
            self.config.virtual_points,
        ) {
            Ok(ring) => ring,
            Err(e) => {
                warn!(error = %e, "cannot build ring for topology, ignoring update");
                return;
            }
        };

        let old_topology = std::mem::replace(&mut self.topology, topology.clone());
        let old_ring = std::mem::replace(&mut self.ring, new_ring);
        self.previous = (!old_topology.members.is_empty()).then(|| (old_topology.hash, old_ring));

        // Fail spawn-in-flight requests that targeted members now gone.
        let failed: Vec<ClusterIdentity> = self
            .spawns
            .iter()
            .filter(|(_, pending)| !topology.contains(&pending.target.id))
            .map(|(identity, _)| identity.clone())
            .collect();
        for identity in failed {
            if let Some(pending) = self.spawns.remove(&identity) {
                warn!(
                    identity = %identity,
                    member_id = %pending.target.id,
                    "failing spawn: target left the topology"
                );
                for waiter in pending.waiters {
                    let _ = waiter.send(Err(PartitionError::MemberLeft {
                        member_id: pending.target.id.to_string(),
                    }));
                }
            }
        }

        // Drop records hosted on departed members and records whose ring
        // owner is no longer this member (their new owner learns about
        // them from the hosts' handover streams).
        let ring = &self.ring;
        let member_id = &self.member_id;
        let current = topology.as_ref();
        self.owned.retain(|identity, activation| {
            if !current.contains(&activation.hosted_on) {
                return false;
            }
            ring.owner(identity)
                .map(|owner| &owner.id == member_id)
                .unwrap_or(false)
        });

        let expected: Vec<MemberId> = topology.member_ids().cloned().collect();
        self.rebalance = Some(Rebalance {
            sink: HandoverSink::new(topology.hash, expected),
            retries: HashMap::new(),
        });
        let _ = self.events_tx.send(OwnerEvent::RebalanceStarted {
            topology_hash: topology.hash,
        });

        match self.config.mode {
            RebalanceMode::Push => self.start_push_handover().await,
            RebalanceMode::Pull => self.start_pull_handover().await,
        }

        // A single-member cluster completes synchronously.
        self.try_complete_rebalance().await;
    }

    async fn start_push_handover(&mut self) {
        let topology = self.topology.clone();
        let hosted = self.activator.local_activations().await;
        let source = HandoverSource::new(self.config.chunk_size);
        let previous_ring = self.previous.as_ref().map(|(_, ring)| ring);

        let streams = source.plan(hosted.iter(), &self.ring, topology.hash, previous_ring, None);

        for (target_id, chunks) in streams {
            if target_id == self.member_id {
                for chunk in chunks {
                    let from = self.member_id.clone();
                    self.apply_chunk(from, chunk);
                }
            } else if let Some(member) = topology.member(&target_id).cloned() {
                self.deliver_stream(member, chunks);
            }
        }
    }

    /// Ship one chunk stream to a remote member, retrying while the
    /// target has not yet observed the topology
    fn deliver_stream(&self, member: Member, chunks: Vec<HandoverChunk>) {
        let client = self.client.clone();
        let from = self.member_id.clone();
        let epoch = self.topology.epoch.clone();
        tokio::spawn(async move {
            for chunk in chunks {
                let mut attempts = 0;
                loop {
                    if epoch.is_cancelled() {
                        // The topology moved on; abort silently.
                        return;
                    }
                    match client
                        .send_handover_chunk(&member, from.clone(), chunk.clone())
                        .await
                    {
                        Ok(HandoverAckState::Processed) => break,
                        Ok(HandoverAckState::IncorrectTopology) => {
                            attempts += 1;
                            if attempts >= DELIVERY_RETRY_COUNT_MAX {
                                debug!(to = %member.id, "giving up on handover stream");
                                return;
                            }
                            tokio::time::sleep(Duration::from_millis(DELIVERY_RETRY_DELAY_MS))
                                .await;
                        }
                        Err(e) => {
                            warn!(to = %member.id, error = %e, "handover delivery failed");
                            return;
                        }
                    }
                }
            }
        });
    }

    async fn start_pull_handover(&mut self) {
        // Our own hosted records do not need the network.
        let hosted = self.activator.local_activations().await;
        let source = HandoverSource::new(self.config.chunk_size);
        let previous_ring = self.previous.as_ref().map(|(_, ring)| ring);
        let topology_hash = self.topology.hash;

        let local = self.member_id.clone();
        let mut streams = source.plan(
            hosted.iter(),
            &self.ring,
            topology_hash,
            previous_ring,
            Some(&local),
        );
        if let Some(chunks) = streams.remove(&local) {
            for chunk in chunks {
                let from = self.member_id.clone();
                self.apply_chunk(from, chunk);
            }
        }

        match &self.consensus {
            Some(checks) => {
                // Wait (bounded) for every member to report no in-flight
                // activations for this topology before requesting records.
                let checks = checks.clone();
                let self_tx = self.self_tx.clone();
                let timeout = Duration::from_millis(self.config.consensus_timeout_ms);
                let epoch = self.topology.epoch.clone();
                tokio::spawn(async move {
                    let handle = checks.register("partition-rebalance").await;
                    let outcome = handle.try_get_consensus(timeout).await;
                    if epoch.is_cancelled() {
                        return;
                    }
                    let agreed = outcome.all_agree && outcome.value == Some(topology_hash);
                    let _ = self_tx
                        .send(OwnerCommand::ConsensusSettled {
                            topology_hash,
                            agreed,
                        })
                        .await;
                });
            }
            None => {
                // No consensus layer: request full streams right away.
                self.request_all_handovers(false);
            }
        }
    }

    fn handle_consensus_settled(&mut self, topology_hash: u64, agreed: bool) {
        if self.topology.hash != topology_hash || self.rebalance.is_none() {
            debug!(topology_hash, "consensus result for superseded topology");
            return;
        }
        if !agreed {
            debug!(topology_hash, "consensus not reached, requesting full handovers");
        }
        self.request_all_handovers(agreed);
    }

    /// Request handover streams from every other member
    ///
    /// Delta streams are only safe when consensus confirmed quiescence;
    /// otherwise everything is requested in full (never silently drop
    /// records).
    fn request_all_handovers(&self, delta_safe: bool) {
        let mode = if delta_safe {
            self.previous
                .as_ref()
                .map(|(hash, _)| HandoverMode::Delta {
                    previous_topology_hash: *hash,
                })
                .unwrap_or(HandoverMode::Full)
        } else {
            HandoverMode::Full
        };

        let topology_hash = self.topology.hash;
        for member in &self.topology.members {
            if member.id == self.member_id {
                continue;
            }
            let member = member.clone();
            let client = self.client.clone();
            let requester = self.member_id.clone();
            let epoch = self.topology.epoch.clone();
            tokio::spawn(async move {
                let mut attempts = 0;
                loop {
                    if epoch.is_cancelled() {
                        return;
                    }
                    match client
                        .request_handover(&member, requester.clone(), topology_hash, mode)
                        .await
                    {
                        Ok(HandoverAckState::Processed) => return,
                        Ok(HandoverAckState::IncorrectTopology) => {
                            attempts += 1;
                            if attempts >= DELIVERY_RETRY_COUNT_MAX {
                                debug!(to = %member.id, "giving up on handover request");
                                return;
                            }
                            tokio::time::sleep(Duration::from_millis(DELIVERY_RETRY_DELAY_MS))
                                .await;
                        }
                        Err(e) => {
                            warn!(to = %member.id, error = %e, "handover request failed");
                            return;
                        }
                    }
                }
            });
        }
    }

    // =========================================================================
    // Handover, source side
    // =========================================================================

    async fn handle_handover_requested(
        &mut self,
        requester: MemberId,
        topology_hash: u64,
        mode: HandoverMode,
    ) -> HandoverAckState {
        if topology_hash != self.topology.hash {
            debug!(
                requester = %requester,
                requested = topology_hash,
                local = self.topology.hash,
                "handover request for foreign topology"
            );
            return HandoverAckState::IncorrectTopology;
        }

        let Some(member) = self.topology.member(&requester).cloned() else {
            debug!(requester = %requester, "handover request from unknown member");
            return HandoverAckState::IncorrectTopology;
        };

        let hosted = self.activator.local_activations().await;
        let source = HandoverSource::new(self.config.chunk_size);

        // A delta baseline is only honored when it matches the topology we
        // were serving before; otherwise the stream is produced in full.
        let previous_ring = match mode {
            HandoverMode::Full => None,
            HandoverMode::Delta {
                previous_topology_hash,
            } => self
                .previous
                .as_ref()
                .filter(|(hash, _)| *hash == previous_topology_hash)
                .map(|(_, ring)| ring),
        };

        let mut streams = source.plan(
            hosted.iter(),
            &self.ring,
            topology_hash,
            previous_ring,
            Some(&requester),
        );
        if let Some(chunks) = streams.remove(&requester) {
            self.deliver_stream(member, chunks);
        }

        HandoverAckState::Processed
    }

    // =========================================================================
    // Handover, sink side
    // =========================================================================

    fn apply_chunk(&mut self, from: MemberId, chunk: HandoverChunk) -> HandoverAckState {
        if self.rebalance.is_none() {
            // No rebalance in progress: accept stragglers for the
            // current topology, reject anything else.
            if chunk.topology_hash == self.topology.hash {
                for activation in chunk.activations {
                    self.insert_owned(activation);
                }
                return HandoverAckState::Processed;
            }
            return HandoverAckState::IncorrectTopology;
        }

        let outcome = self
            .rebalance
            .as_mut()
            .expect("rebalance checked above")
            .sink
            .receive(&from, chunk);
        match outcome {
            ChunkOutcome::Apply(activations) => {
                for activation in activations {
                    self.insert_owned(activation);
                }
                HandoverAckState::Processed
            }
            ChunkOutcome::Duplicate => HandoverAckState::Processed,
            ChunkOutcome::IncorrectTopology | ChunkOutcome::UnknownSender => {
                HandoverAckState::IncorrectTopology
            }
        }
    }

    /// Post-chunk bookkeeping: delta validation and completion checks
    async fn after_chunk(&mut self, from: MemberId) {
        let Some(rebalance) = &mut self.rebalance else {
            return;
        };

        if rebalance.sink.sender_complete(&from) {
            let attributed = self
                .owned
                .values()
                .filter(|activation| activation.hosted_on == from)
                .count() as u32;

            if !rebalance.sink.validate_delta(&from, attributed) {
                let retries = rebalance.retries.entry(from.clone()).or_insert(0);
                *retries += 1;
                if *retries <= self.config.handover_retry_max {
                    warn!(
                        sender = %from,
                        retry = *retries,
                        "handover incomplete, re-requesting full stream"
                    );
                    rebalance.sink.reset_sender(&from);
                    self.request_full_retry(from);
                    return;
                }
                // Retries exhausted: keep serving with the partial view
                // rather than deadlocking the partition.
                warn!(sender = %from, "handover retries exhausted, serving partial view");
                rebalance.sink.force_sender_complete(&from);
            }
        }

        self.try_complete_rebalance().await;
    }

    fn request_full_retry(&self, sender: MemberId) {
        let topology_hash = self.topology.hash;
        if sender == self.member_id {
            // Local stream: redo through the mailbox like any other sender.
            let self_tx = self.self_tx.clone();
            let requester = self.member_id.clone();
            tokio::spawn(async move {
                let (reply, _rx) = oneshot::channel();
                let _ = self_tx
                    .send(OwnerCommand::HandoverRequested {
                        requester,
                        topology_hash,
                        mode: HandoverMode::Full,
                        reply,
                    })
                    .await;
            });
            return;
        }

        let Some(member) = self.topology.member(&sender).cloned() else {
            return;
        };
        let client = self.client.clone();
        let requester = self.member_id.clone();
        let epoch = self.topology.epoch.clone();
        tokio::spawn(async move {
            if epoch.is_cancelled() {
                return;
            }
            if let Err(e) = client
                .request_handover(&member, requester, topology_hash, HandoverMode::Full)
                .await
            {
                warn!(to = %member.id, error = %e, "full handover retry failed");
            }
        });
    }

    async fn try_complete_rebalance(&mut self) {
        let complete = self
            .rebalance
            .as_ref()
            .map(|rebalance| rebalance.sink.is_complete())
            .unwrap_or(false);
        if !complete {
            return;
        }

        let rebalance = self.rebalance.take().expect("checked above");
        self.previous = None;

        info!(
            member_id = %self.member_id,
            topology_hash = rebalance.sink.topology_hash(),
            owned = self.owned.len(),
            "rebalance complete"
        );
        let _ = self.events_tx.send(OwnerEvent::RebalanceCompleted {
            topology_hash: rebalance.sink.topology_hash(),
        });

        // Resume suspended lookups: retried from scratch against the new
        // topology, never against state captured before the suspension.
        let suspended = std::mem::take(&mut self.suspended);
        let topology_hash = self.topology.hash;
        for (identity, reply) in suspended {
            self.handle_get_or_spawn(identity, topology_hash, reply).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::activator::ActorSpawner;
    use async_trait::async_trait;
    use selkie_cluster::TopologyTracker;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct NoopSpawner;

    #[async_trait]
    impl ActorSpawner for NoopSpawner {
        async fn spawn(&self, _identity: &ClusterIdentity, _pid: &Pid) -> PartitionResult<()> {
            Ok(())
        }
        async fn stop(&self, _identity: &ClusterIdentity, _pid: &Pid) {}
    }

    /// Client that activates against a single local activator and counts
    /// activation requests
    struct LocalClient {
        activator: Arc<PlacementActivator>,
        activation_requests: AtomicUsize,
        delay_ms: u64,
    }

    #[async_trait]
    impl ClusterClient for LocalClient {
        async fn request_activation(
            &self,
            _target: &Member,
            identity: &ClusterIdentity,
            _timeout_ms: u64,
        ) -> Result<Pid, ClientError> {
            self.activation_requests.fetch_add(1, Ordering::SeqCst);
            if self.delay_ms > 0 {
                tokio::time::sleep(Duration::from_millis(self.delay_ms)).await;
            }
            self.activator
                .activate(identity)
                .await
                .map_err(|e| ClientError::Failed {
                    member_id: "member-1".into(),
                    reason: e.to_string(),
                })
        }

        async fn send_handover_chunk(
            &self,
            _target: &Member,
            _from: MemberId,
            _chunk: HandoverChunk,
        ) -> Result<HandoverAckState, ClientError> {
            Ok(HandoverAckState::Processed)
        }

        async fn request_handover(
            &self,
            _target: &Member,
            _requester: MemberId,
            _topology_hash: u64,
            _mode: HandoverMode,
        ) -> Result<HandoverAckState, ClientError> {
            Ok(HandoverAckState::Processed)
        }

        async fn stop_activation(
            &self,
            _target: &Member,
            identity: &ClusterIdentity,
            pid: &Pid,
        ) -> Result<(), ClientError> {
            self.activator.terminate(identity, pid).await;
            Ok(())
        }
    }

    fn test_member(n: u32) -> Member {
        Member::new(
            MemberId::new(format!("member-{}", n)).unwrap(),
            "127.0.0.1",
            8000 + n as u16,
            ["order".to_string()],
        )
    }

    struct TestNode {
        handle: PartitionOwnerHandle,
        tracker: TopologyTracker,
        client: Arc<LocalClient>,
        topology: Arc<Topology>,
    }

    /// Single-member node: every spawn lands on the local activator
    async fn single_node(delay_ms: u64) -> TestNode {
        let member = test_member(1);
        let activator = Arc::new(PlacementActivator::new(&member, Arc::new(NoopSpawner)));
        let client = Arc::new(LocalClient {
            activator: activator.clone(),
            activation_requests: AtomicUsize::new(0),
            delay_ms,
        });

        let tracker = TopologyTracker::new(member.id.clone());
        let topology = tracker
            .apply_members(vec![member.clone()])
            .await
            .unwrap()
            .unwrap();

        let (handle, _join) = PartitionOwner::spawn(
            member.id.clone(),
            OwnerConfig::for_testing(),
            tracker.kinds(),
            activator,
            client.clone(),
            None,
        );
        handle.topology_changed(topology.clone()).await;

        TestNode {
            handle,
            tracker,
            client,
            topology,
        }
    }

    async fn wait_for_rebalance(events: &mut broadcast::Receiver<OwnerEvent>, hash: u64) {
        tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                match events.recv().await {
                    Ok(OwnerEvent::RebalanceCompleted { topology_hash }) if topology_hash == hash => {
                        return
                    }
                    Ok(_) => {}
                    Err(e) => panic!("event channel closed: {}", e),
                }
            }
        })
        .await
        .expect("rebalance did not complete");
    }

    #[tokio::test]
    async fn test_get_or_spawn_resolves_locally() {
        let node = single_node(0).await;
        let identity = ClusterIdentity::new("order", "42").unwrap();

        let outcome = node
            .handle
            .get_or_spawn(identity.clone(), node.topology.hash)
            .await
            .unwrap();

        match outcome {
            LookupOutcome::Found(pid) => assert_eq!(pid.address, "127.0.0.1:8001"),
            other => panic!("unexpected outcome: {:?}", other),
        }

        // Second lookup is served from the table without a new request
        let again = node
            .handle
            .get_or_spawn(identity, node.topology.hash)
            .await
            .unwrap();
        assert!(matches!(again, LookupOutcome::Found(_)));
        assert_eq!(node.client.activation_requests.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_concurrent_spawns_deduplicated() {
        // N concurrent lookups for one unseen identity: exactly one
        // activation request, every caller gets the same PID.
        let node = single_node(50).await;
        let identity = ClusterIdentity::new("order", "42").unwrap();

        let mut tasks = Vec::new();
        for _ in 0..10 {
            let handle = node.handle.clone();
            let identity = identity.clone();
            let hash = node.topology.hash;
            tasks.push(tokio::spawn(async move {
                handle.get_or_spawn(identity, hash).await.unwrap()
            }));
        }

        let mut pids = Vec::new();
        for task in tasks {
            match task.await.unwrap() {
                LookupOutcome::Found(pid) => pids.push(pid),
                other => panic!("unexpected outcome: {:?}", other),
            }
        }

        assert_eq!(node.client.activation_requests.load(Ordering::SeqCst), 1);
        assert!(pids.windows(2).all(|w| w[0] == w[1]));
    }

    #[tokio::test]
    async fn test_stale_caller_hash_still_resolves() {
        let node = single_node(0).await;
        let identity = ClusterIdentity::new("order", "42").unwrap();

        // Caller believes an old topology; the single member still owns
        // everything, so the request is answered, not redirected.
        let outcome = node
            .handle
            .get_or_spawn(identity, node.topology.hash ^ 0xdead)
            .await
            .unwrap();
        assert!(matches!(outcome, LookupOutcome::Found(_)));
    }

    #[tokio::test]
    async fn test_terminated_activation_removed() {
        let node = single_node(0).await;
        let identity = ClusterIdentity::new("order", "42").unwrap();

        let pid = match node
            .handle
            .get_or_spawn(identity.clone(), node.topology.hash)
            .await
            .unwrap()
        {
            LookupOutcome::Found(pid) => pid,
            other => panic!("unexpected outcome: {:?}", other),
        };

        // A stale report (wrong pid) must not remove the entry
        let stale = Pid::new(pid.address.clone(), pid.sequence + 7);
        node.handle
            .activation_terminated(identity.clone(), stale)
            .await;
        let outcome = node
            .handle
            .get_or_spawn(identity.clone(), node.topology.hash)
            .await
            .unwrap();
        assert_eq!(outcome, LookupOutcome::Found(pid.clone()));

        node.handle
            .activation_terminated(identity.clone(), pid)
            .await;
        // Entry gone: the next lookup spawns a fresh instance
        let outcome = node
            .handle
            .get_or_spawn(identity, node.topology.hash)
            .await
            .unwrap();
        assert!(matches!(outcome, LookupOutcome::Found(_)));
        assert_eq!(node.client.activation_requests.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_no_activator_for_unknown_kind() {
        let node = single_node(0).await;
        let identity = ClusterIdentity::new("invoice", "1").unwrap();

        let result = node.handle.get_or_spawn(identity, node.topology.hash).await;
        assert!(matches!(
            result,
            Err(PartitionError::NoActivatorAvailable { .. })
        ));
    }

    #[tokio::test]
    async fn test_lookup_suspends_during_rebalance_and_resumes() {
        let node = single_node(0).await;
        let mut events = node.handle.events();

        // Grow to two members: the rebalance now also waits on member-2,
        // which never pushes on its own in this test.
        let topology = node
            .tracker
            .apply_members(vec![test_member(1), test_member(2)])
            .await
            .unwrap()
            .unwrap();
        node.handle.topology_changed(topology.clone()).await;

        // Find an identity owned by member-1 under the new ring so the
        // lookup suspends rather than redirects.
        let ring = HashRing::from_members(
            [test_member(1), test_member(2)],
            RING_VIRTUAL_POINTS_COUNT_DEFAULT,
        )
        .unwrap();
        let identity = (0..)
            .map(|n| ClusterIdentity::new("order", format!("{}", n)).unwrap())
            .find(|id| ring.owner(id).unwrap().id.as_str() == "member-1")
            .unwrap();

        let lookup = {
            let handle = node.handle.clone();
            let identity = identity.clone();
            let hash = topology.hash;
            tokio::spawn(async move { handle.get_or_spawn(identity, hash).await })
        };

        // The lookup must still be suspended
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!lookup.is_finished());

        // member-2 reports an empty stream; the rebalance completes and
        // the suspended lookup resumes.
        let ack = node
            .handle
            .handover_chunk(
                MemberId::new("member-2").unwrap(),
                HandoverChunk::final_chunk(1, topology.hash, Vec::new(), 0, 0),
            )
            .await
            .unwrap();
        assert_eq!(ack, HandoverAckState::Processed);

        wait_for_rebalance(&mut events, topology.hash).await;

        let outcome = lookup.await.unwrap().unwrap();
        assert!(matches!(outcome, LookupOutcome::Found(_)));
    }

    #[tokio::test]
    async fn test_redirect_for_foreign_identity() {
        let node = single_node(0).await;
        let mut events = node.handle.events();

        let topology = node
            .tracker
            .apply_members(vec![test_member(1), test_member(2)])
            .await
            .unwrap()
            .unwrap();
        node.handle.topology_changed(topology.clone()).await;

        node.handle
            .handover_chunk(
                MemberId::new("member-2").unwrap(),
                HandoverChunk::final_chunk(1, topology.hash, Vec::new(), 0, 0),
            )
            .await
            .unwrap();
        wait_for_rebalance(&mut events, topology.hash).await;

        let ring = HashRing::from_members(
            [test_member(1), test_member(2)],
            RING_VIRTUAL_POINTS_COUNT_DEFAULT,
        )
        .unwrap();
        let foreign = (0..)
            .map(|n| ClusterIdentity::new("order", format!("{}", n)).unwrap())
            .find(|id| ring.owner(id).unwrap().id.as_str() == "member-2")
            .unwrap();

        let outcome = node
            .handle
            .get_or_spawn(foreign, topology.hash)
            .await
            .unwrap();
        match outcome {
            LookupOutcome::Redirect(member) => assert_eq!(member.id.as_str(), "member-2"),
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_stale_chunk_rejected() {
        let node = single_node(0).await;

        let ack = node
            .handle
            .handover_chunk(
                MemberId::new("member-1").unwrap(),
                HandoverChunk::final_chunk(1, node.topology.hash ^ 0xbeef, Vec::new(), 0, 0),
            )
            .await
            .unwrap();
        assert_eq!(ack, HandoverAckState::IncorrectTopology);
    }

    #[tokio::test]
    async fn test_shutdown_fails_pending() {
        let node = single_node(500).await;
        let identity = ClusterIdentity::new("order", "42").unwrap();

        let lookup = {
            let handle = node.handle.clone();
            let hash = node.topology.hash;
            tokio::spawn(async move { handle.get_or_spawn(identity, hash).await })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        node.handle.shutdown().await;

        let result = lookup.await.unwrap();
        assert!(matches!(result, Err(PartitionError::ShuttingDown)));
    }
}
