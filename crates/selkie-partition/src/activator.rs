//! Placement activator
//!
//! TigerStyle: Idempotent local spawns, never reply with an unspawned
//! location.
//!
//! One activator runs per member. It owns the table of actor instances
//! spawned locally; handover sources stream from this table during
//! topology changes. Repeated activation requests for the same identity
//! return the existing instance.

use crate::error::{PartitionError, PartitionResult};
use async_trait::async_trait;
use selkie_cluster::{Activation, Pid};
use selkie_core::{ClusterIdentity, Member, MemberId};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::RwLock;
use tracing::{debug, info};

/// Spawns and stops concrete actor instances
///
/// Implemented by the hosting runtime; the activator only does placement
/// bookkeeping.
#[async_trait]
pub trait ActorSpawner: Send + Sync {
    /// Start an instance for `identity` at `pid`
    ///
    /// # Errors
    /// Returns [`PartitionError::InvalidIdentity`] when the identity's
    /// kind cannot be hosted here.
    async fn spawn(&self, identity: &ClusterIdentity, pid: &Pid) -> PartitionResult<()>;

    /// Stop a previously spawned instance
    async fn stop(&self, identity: &ClusterIdentity, pid: &Pid);
}

/// Receives validated placement requests and spawns locally
pub struct PlacementActivator {
    /// The member this activator runs on
    member_id: MemberId,
    /// Endpoint address instances are reachable at
    address: String,
    /// Runtime hook that actually starts instances
    spawner: std::sync::Arc<dyn ActorSpawner>,
    /// Locally spawned instances
    spawned: RwLock<HashMap<ClusterIdentity, Pid>>,
    /// Per-process spawn sequence
    sequence: AtomicU64,
}

impl PlacementActivator {
    /// Create an activator for the given member
    pub fn new(member: &Member, spawner: std::sync::Arc<dyn ActorSpawner>) -> Self {
        Self {
            member_id: member.id.clone(),
            address: member.address(),
            spawner,
            spawned: RwLock::new(HashMap::new()),
            sequence: AtomicU64::new(1),
        }
    }

    /// The member this activator runs on
    pub fn member_id(&self) -> &MemberId {
        &self.member_id
    }

    /// Activate an identity locally, idempotently
    ///
    /// If an instance already exists for the identity, its PID is returned
    /// without spawning again. A PID is only ever returned after the spawn
    /// succeeded.
    pub async fn activate(&self, identity: &ClusterIdentity) -> PartitionResult<Pid> {
        {
            let spawned = self.spawned.read().await;
            if let Some(pid) = spawned.get(identity) {
                debug!(identity = %identity, pid = %pid, "activation already present");
                return Ok(pid.clone());
            }
        }

        let mut spawned = self.spawned.write().await;
        // Re-check under the write lock: a concurrent activate may have won.
        if let Some(pid) = spawned.get(identity) {
            return Ok(pid.clone());
        }

        let pid = Pid::new(
            self.address.clone(),
            self.sequence.fetch_add(1, Ordering::SeqCst),
        );

        self.spawner.spawn(identity, &pid).await?;
        spawned.insert(identity.clone(), pid.clone());

        info!(identity = %identity, pid = %pid, "activation spawned");
        Ok(pid)
    }

    /// Stop one instance if it is exactly the one recorded
    ///
    /// Guards against stopping a newer replacement under the same identity.
    pub async fn terminate(&self, identity: &ClusterIdentity, pid: &Pid) {
        let mut spawned = self.spawned.write().await;
        match spawned.get(identity) {
            Some(current) if current == pid => {
                spawned.remove(identity);
                drop(spawned);
                self.spawner.stop(identity, pid).await;
                info!(identity = %identity, pid = %pid, "activation stopped");
            }
            _ => {
                debug!(identity = %identity, pid = %pid, "stale terminate ignored");
            }
        }
    }

    /// Snapshot of the locally hosted activations
    ///
    /// This is what handover sources stream from on topology changes.
    pub async fn local_activations(&self) -> Vec<Activation> {
        let spawned = self.spawned.read().await;
        spawned
            .iter()
            .map(|(identity, pid)| {
                Activation::new(identity.clone(), pid.clone(), self.member_id.clone())
            })
            .collect()
    }

    /// Number of locally hosted activations
    pub async fn local_count(&self) -> usize {
        self.spawned.read().await.len()
    }
}
