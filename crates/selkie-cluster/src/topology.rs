//! Topology tracking
//!
//! TigerStyle: Immutable snapshots, explicit deltas, blocked-forever
//! departures.
//!
//! The tracker consumes member lists from the external cluster provider
//! and turns them into immutable [`Topology`] snapshots. Each snapshot
//! carries a deterministic, order-independent fingerprint of its member
//! id set: two snapshots over the same ids always produce the same hash,
//! which is what lets consumers detect no-op updates and reject stale
//! protocol messages.
//!
//! Members that leave are blocked by id and never re-admitted; a
//! restarted process joins under a fresh id.

use crate::error::TopologyError;
use crate::messages::PartitionMessage;
use crate::strategy::KindRegistry;
use rapidhash::RapidHasher;
use selkie_core::{Member, MemberId, CLUSTER_MEMBERS_COUNT_MAX, EVENT_CHANNEL_CAPACITY};
use std::collections::{BTreeMap, BTreeSet};
use std::hash::Hasher;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, watch, RwLock};
use tracing::{debug, info, warn};

/// Seed for topology fingerprints (distinct from ring point hashing)
const TOPOLOGY_HASH_SEED: u64 = 0xC2B2_AE3D_27D4_EB4F;

/// Compute the deterministic fingerprint of a member id set
///
/// Order-independent: ids are sorted before hashing.
pub fn topology_fingerprint<'a>(ids: impl IntoIterator<Item = &'a MemberId>) -> u64 {
    let mut sorted: Vec<&MemberId> = ids.into_iter().collect();
    sorted.sort();

    let mut hasher = RapidHasher::new(TOPOLOGY_HASH_SEED);
    for id in sorted {
        hasher.write(id.as_str().as_bytes());
        hasher.write_u8(0);
    }
    hasher.finish()
}

/// Cancellation flag tied to one topology epoch
///
/// Cancelled the instant a newer topology supersedes its snapshot. Any
/// in-flight work keyed to the old topology must observe the token and
/// abort before mutating shared state.
#[derive(Debug, Clone, Default)]
pub struct EpochToken {
    cancelled: Arc<AtomicBool>,
}

impl EpochToken {
    /// Create a live token
    pub fn new() -> Self {
        Self::default()
    }

    /// Cancel the epoch
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    /// Check whether the epoch has been superseded
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

/// Immutable snapshot of the active member set
#[derive(Debug, Clone)]
pub struct Topology {
    /// Active members, sorted by id
    pub members: Vec<Member>,
    /// Deterministic fingerprint of the member id set
    pub hash: u64,
    /// Members that joined relative to the previous snapshot
    pub joined: Vec<Member>,
    /// Members that left relative to the previous snapshot
    pub left: Vec<Member>,
    /// Ids blocked from re-admission
    pub blocked: Vec<MemberId>,
    /// Cancellation token for work keyed to this snapshot
    pub epoch: EpochToken,
}

impl Topology {
    /// The empty topology (before the first member list arrives)
    pub fn empty() -> Self {
        Self {
            members: Vec::new(),
            hash: topology_fingerprint([]),
            joined: Vec::new(),
            left: Vec::new(),
            blocked: Vec::new(),
            epoch: EpochToken::new(),
        }
    }

    /// Look up a member by id
    pub fn member(&self, member_id: &MemberId) -> Option<&Member> {
        self.members.iter().find(|m| &m.id == member_id)
    }

    /// Check whether the member set contains the given id
    pub fn contains(&self, member_id: &MemberId) -> bool {
        self.member(member_id).is_some()
    }

    /// Stable index of a member within this snapshot
    ///
    /// Members are sorted by id, so two processes holding snapshots with
    /// the same fingerprint compute the same index for every member.
    pub fn member_index(&self, member_id: &MemberId) -> Option<usize> {
        self.members.iter().position(|m| &m.id == member_id)
    }

    /// Iterate the active member ids
    pub fn member_ids(&self) -> impl Iterator<Item = &MemberId> {
        self.members.iter().map(|m| &m.id)
    }

    /// Build the dissemination message for this snapshot
    pub fn to_message(&self) -> PartitionMessage {
        PartitionMessage::ClusterTopology {
            topology_hash: self.hash,
            members: self.members.clone(),
            joined: self.joined.clone(),
            left: self.left.clone(),
            blocked: self.blocked.clone(),
        }
    }
}

/// Events published alongside topology snapshots
#[derive(Debug, Clone)]
pub enum TopologyEvent {
    /// A new snapshot was published
    TopologyUpdated { topology_hash: u64 },
    /// A member joined the cluster
    MemberJoined { member_id: MemberId },
    /// A member left; dependents must drop cached locations for it
    MemberLeft { member_id: MemberId },
}

struct TrackerState {
    current: Arc<Topology>,
    blocked: BTreeSet<MemberId>,
}

/// Tracks the locally-known active member set
///
/// One per process. Consumers subscribe to snapshots and events; the
/// tracker never calls back into them.
pub struct TopologyTracker {
    local: MemberId,
    state: RwLock<TrackerState>,
    kinds: Arc<KindRegistry>,
    watch_tx: watch::Sender<Arc<Topology>>,
    events_tx: broadcast::Sender<TopologyEvent>,
}

impl TopologyTracker {
    /// Create a tracker for the given local member
    pub fn new(local: MemberId) -> Self {
        let initial = Arc::new(Topology::empty());
        let (watch_tx, _) = watch::channel(initial.clone());
        let (events_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        Self {
            local,
            state: RwLock::new(TrackerState {
                current: initial,
                blocked: BTreeSet::new(),
            }),
            kinds: Arc::new(KindRegistry::new()),
            watch_tx,
            events_tx,
        }
    }

    /// The local member id
    pub fn local_member_id(&self) -> &MemberId {
        &self.local
    }

    /// Current topology snapshot
    pub async fn current(&self) -> Arc<Topology> {
        self.state.read().await.current.clone()
    }

    /// Subscribe to topology snapshots
    pub fn subscribe(&self) -> watch::Receiver<Arc<Topology>> {
        self.watch_tx.subscribe()
    }

    /// Subscribe to topology events
    pub fn events(&self) -> broadcast::Receiver<TopologyEvent> {
        self.events_tx.subscribe()
    }

    /// Handle to the per-kind placement strategies
    pub fn kinds(&self) -> Arc<KindRegistry> {
        self.kinds.clone()
    }

    /// Apply a member list from the external cluster provider
    ///
    /// Returns the new snapshot, or `None` when the filtered member set is
    /// unchanged (idempotent no-op).
    ///
    /// # Errors
    /// Returns [`TopologyError::SelfEvicted`] when the local member lands
    /// in the left or blocked set: the process no longer trusts its own
    /// membership and must initiate shutdown.
    pub async fn apply_members(
        &self,
        members: Vec<Member>,
    ) -> Result<Option<Arc<Topology>>, TopologyError> {
        let mut state = self.state.write().await;

        // Deduplicate by id and drop blocked members
        let mut filtered: BTreeMap<MemberId, Member> = BTreeMap::new();
        for member in members {
            if state.blocked.contains(&member.id) {
                debug!(member_id = %member.id, "ignoring blocked member in update");
                continue;
            }
            filtered.insert(member.id.clone(), member);
        }

        if filtered.len() > CLUSTER_MEMBERS_COUNT_MAX {
            return Err(TopologyError::TooManyMembers {
                count: filtered.len(),
                limit: CLUSTER_MEMBERS_COUNT_MAX,
            });
        }

        let hash = topology_fingerprint(filtered.keys());
        if hash == state.current.hash {
            debug!(topology_hash = hash, "member update is a no-op");
            return Ok(None);
        }

        let previous = state.current.clone();

        let joined: Vec<Member> = filtered
            .values()
            .filter(|m| !previous.contains(&m.id))
            .cloned()
            .collect();

        let left: Vec<Member> = previous
            .members
            .iter()
            .filter(|m| !filtered.contains_key(&m.id))
            .cloned()
            .collect();

        // A process that sees itself leave no longer trusts its own
        // membership view.
        if left.iter().any(|m| m.id == self.local) {
            warn!(member_id = %self.local, "local member evicted by topology update");
            return Err(TopologyError::self_evicted(&self.local));
        }

        for member in &left {
            state.blocked.insert(member.id.clone());
            self.kinds.unregister_member(&member.id);
            let _ = self.events_tx.send(TopologyEvent::MemberLeft {
                member_id: member.id.clone(),
            });
        }

        for member in &joined {
            self.kinds.register_member(member);
            let _ = self.events_tx.send(TopologyEvent::MemberJoined {
                member_id: member.id.clone(),
            });
        }

        let topology = Arc::new(Topology {
            members: filtered.into_values().collect(),
            hash,
            joined,
            left,
            blocked: state.blocked.iter().cloned().collect(),
            epoch: EpochToken::new(),
        });

        // Work keyed to the superseded snapshot must observe cancellation
        previous.epoch.cancel();

        state.current = topology.clone();
        self.watch_tx.send_replace(topology.clone());
        let _ = self
            .events_tx
            .send(TopologyEvent::TopologyUpdated { topology_hash: hash });

        info!(
            topology_hash = hash,
            members = topology.members.len(),
            joined = topology.joined.len(),
            left = topology.left.len(),
            "topology updated"
        );

        Ok(Some(topology))
    }
}
