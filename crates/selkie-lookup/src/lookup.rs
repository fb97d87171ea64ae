//! Storage-backed identity lookup
//!
//! TigerStyle: Cache in front, bounded hashed worker pool behind.
//!
//! `get` consults the PID cache first; on miss (or a cached entry whose
//! member has departed) the request is dispatched to a worker selected
//! by identity hash. Routing by hash means a single worker handles a
//! given identity at a time, which is what makes request coalescing
//! natural: concurrent requests for one identity share one resolution.

use crate::error::{LookupError, LookupResult};
use crate::storage::LookupStorage;
use crate::worker::{spawn_worker, ResolveContext, WorkerRequest};
use rapidhash::RapidHasher;
use selkie_cluster::{Activation, ClusterClient, KindRegistry, Pid, Topology};
use selkie_core::{
    ClusterIdentity, LOCK_WAIT_TIMEOUT_MS_DEFAULT, LOOKUP_WORKERS_COUNT_DEFAULT,
    LOOKUP_WORKER_QUEUE_DEPTH_MAX, SPAWN_TIMEOUT_MS_DEFAULT,
};
use std::collections::HashMap;
use std::hash::Hasher;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch, RwLock};
use tracing::debug;

/// Seed for worker dispatch hashing
const DISPATCH_HASH_SEED: u64 = 0x27D4_EB2F_1656_67C5;

pub(crate) type SharedCache = Arc<RwLock<HashMap<ClusterIdentity, Activation>>>;

/// Storage-backed lookup configuration
#[derive(Debug, Clone)]
pub struct LookupConfig {
    /// Number of workers in the bounded pool
    pub workers: usize,
    /// Queue depth per worker
    pub queue_depth: usize,
    /// Deadline for activation requests
    pub spawn_timeout_ms: u64,
    /// Bounded wait for another resolver's activation
    pub lock_wait_timeout_ms: u64,
}

impl Default for LookupConfig {
    fn default() -> Self {
        Self {
            workers: LOOKUP_WORKERS_COUNT_DEFAULT,
            queue_depth: LOOKUP_WORKER_QUEUE_DEPTH_MAX,
            spawn_timeout_ms: SPAWN_TIMEOUT_MS_DEFAULT,
            lock_wait_timeout_ms: LOCK_WAIT_TIMEOUT_MS_DEFAULT,
        }
    }
}

impl LookupConfig {
    /// Configuration with short timeouts for tests
    pub fn for_testing() -> Self {
        Self {
            workers: 2,
            queue_depth: 64,
            spawn_timeout_ms: 1_000,
            lock_wait_timeout_ms: 1_000,
        }
    }
}

/// Storage-backed identity resolver
pub struct StorageLookup {
    workers: Vec<mpsc::Sender<WorkerRequest>>,
    cache: SharedCache,
    topology: watch::Receiver<Arc<Topology>>,
}

impl StorageLookup {
    /// Spawn the worker pool
    pub fn spawn(
        config: LookupConfig,
        storage: Arc<dyn LookupStorage>,
        kinds: Arc<KindRegistry>,
        topology: watch::Receiver<Arc<Topology>>,
        client: Arc<dyn ClusterClient>,
    ) -> Self {
        assert!(config.workers >= 1, "pool needs at least one worker");
        assert!(config.queue_depth >= 1, "queue depth must be positive");

        let cache: SharedCache = Arc::new(RwLock::new(HashMap::new()));
        let ctx = ResolveContext {
            storage,
            kinds,
            topology: topology.clone(),
            client,
            config: config.clone(),
        };

        let workers = (0..config.workers)
            .map(|index| spawn_worker(index, ctx.clone(), cache.clone()))
            .collect();

        Self {
            workers,
            cache,
            topology,
        }
    }

    /// Resolve an identity to its live location
    ///
    /// Returns `Ok(None)` when this attempt lost a race or timed out;
    /// callers decide whether to retry. Internal forwarding, lock
    /// reconciliation, and stale-member eviction are invisible here.
    pub async fn get(&self, identity: &ClusterIdentity) -> LookupResult<Option<Pid>> {
        // Cache first; a hit is only valid while its member is active.
        let cached = self.cache.read().await.get(identity).cloned();
        if let Some(activation) = cached {
            if self.topology.borrow().contains(&activation.hosted_on) {
                return Ok(Some(activation.pid));
            }
            debug!(
                identity = %identity,
                member_id = %activation.hosted_on,
                "dropping cached location for departed member"
            );
            self.cache.write().await.remove(identity);
        }

        let index = worker_index(identity, self.workers.len());
        let (reply, rx) = oneshot::channel();
        self.workers[index]
            .send(WorkerRequest {
                identity: identity.clone(),
                reply,
            })
            .await
            .map_err(|_| LookupError::ShuttingDown)?;

        let resolved = rx.await.map_err(|_| LookupError::ShuttingDown)??;
        Ok(resolved.map(|activation| activation.pid))
    }

    /// Drop one cached location (e.g. after a termination event)
    pub async fn evict(&self, identity: &ClusterIdentity) {
        self.cache.write().await.remove(identity);
    }

    /// Number of cached locations
    pub async fn cached_count(&self) -> usize {
        self.cache.read().await.len()
    }
}

/// Stable worker slot for an identity
fn worker_index(identity: &ClusterIdentity, workers: usize) -> usize {
    debug_assert!(workers >= 1);
    let mut hasher = RapidHasher::new(DISPATCH_HASH_SEED);
    hasher.write(&identity.to_key_bytes());
    (hasher.finish() % workers as u64) as usize
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryLookupStorage;
    use async_trait::async_trait;
    use selkie_cluster::{
        ClientError, HandoverAckState, HandoverChunk, HandoverMode, TopologyTracker,
    };
    use selkie_core::{Member, MemberId};
    use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
    use std::time::Duration;

    /// Client that "spawns" by allocating PIDs locally
    struct StubClient {
        activation_requests: AtomicUsize,
        sequence: AtomicU64,
        delay_ms: u64,
    }

    impl StubClient {
        fn new(delay_ms: u64) -> Self {
            Self {
                activation_requests: AtomicUsize::new(0),
                sequence: AtomicU64::new(1),
                delay_ms,
            }
        }
    }

    #[async_trait]
    impl ClusterClient for StubClient {
        async fn request_activation(
            &self,
            target: &Member,
            _identity: &ClusterIdentity,
            _timeout_ms: u64,
        ) -> Result<Pid, ClientError> {
            self.activation_requests.fetch_add(1, Ordering::SeqCst);
            if self.delay_ms > 0 {
                tokio::time::sleep(Duration::from_millis(self.delay_ms)).await;
            }
            Ok(Pid::new(
                target.address(),
                self.sequence.fetch_add(1, Ordering::SeqCst),
            ))
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
            _identity: &ClusterIdentity,
            _pid: &Pid,
        ) -> Result<(), ClientError> {
            Ok(())
        }
    }

    fn test_member(n: u32) -> Member {
        Member::new(
            MemberId::new(format!("member-{}", n)).unwrap(),
            "10.2.0.1",
            7000 + n as u16,
            ["order".to_string()],
        )
    }

    struct Fixture {
        lookup: StorageLookup,
        storage: Arc<MemoryLookupStorage>,
        client: Arc<StubClient>,
    }

    async fn fixture_with(
        storage: Arc<MemoryLookupStorage>,
        delay_ms: u64,
        members: Vec<Member>,
    ) -> Fixture {
        let tracker = TopologyTracker::new(MemberId::new("member-1").unwrap());
        let subscription = tracker.subscribe();
        tracker.apply_members(members).await.unwrap();

        let client = Arc::new(StubClient::new(delay_ms));
        let lookup = StorageLookup::spawn(
            LookupConfig::for_testing(),
            storage.clone(),
            tracker.kinds(),
            subscription,
            client.clone(),
        );

        Fixture {
            lookup,
            storage,
            client,
        }
    }

    async fn fixture(delay_ms: u64) -> Fixture {
        fixture_with(
            Arc::new(MemoryLookupStorage::new()),
            delay_ms,
            vec![test_member(1), test_member(2)],
        )
        .await
    }

    fn identity(n: u32) -> ClusterIdentity {
        ClusterIdentity::new("order", format!("{}", n)).unwrap()
    }

    #[tokio::test]
    async fn test_get_spawns_and_caches() {
        let f = fixture(0).await;

        let pid = f.lookup.get(&identity(1)).await.unwrap().unwrap();
        assert_eq!(f.client.activation_requests.load(Ordering::SeqCst), 1);
        assert_eq!(f.storage.activation_count().await, 1);

        // Second get: served from cache, storage untouched by new spawns
        let again = f.lookup.get(&identity(1)).await.unwrap().unwrap();
        assert_eq!(pid, again);
        assert_eq!(f.client.activation_requests.load(Ordering::SeqCst), 1);
        assert_eq!(f.lookup.cached_count().await, 1);
    }

    #[tokio::test]
    async fn test_concurrent_gets_coalesce() {
        let f = Arc::new(fixture(50).await);

        let mut tasks = Vec::new();
        for _ in 0..10 {
            let f = f.clone();
            tasks.push(tokio::spawn(async move {
                f.lookup.get(&identity(1)).await.unwrap().unwrap()
            }));
        }

        let mut pids = Vec::new();
        for task in tasks {
            pids.push(task.await.unwrap());
        }

        assert_eq!(f.client.activation_requests.load(Ordering::SeqCst), 1);
        assert!(pids.windows(2).all(|w| w[0] == w[1]));
    }

    #[tokio::test]
    async fn test_lock_race_two_resolvers_one_activation() {
        // Two independent resolver fronts share one store: exactly one
        // spawns, the other adopts the winner's record.
        let storage = Arc::new(MemoryLookupStorage::new());
        let members = vec![test_member(1), test_member(2)];
        let a = fixture_with(storage.clone(), 30, members.clone()).await;
        let b = fixture_with(storage.clone(), 30, members).await;

        let id_a = identity(7);
        let id_b = identity(7);
        let (pid_a, pid_b) = tokio::join!(a.lookup.get(&id_a), b.lookup.get(&id_b));
        let pid_a = pid_a.unwrap();
        let pid_b = pid_b.unwrap();

        assert_eq!(storage.activation_count().await, 1);

        let total = a.client.activation_requests.load(Ordering::SeqCst)
            + b.client.activation_requests.load(Ordering::SeqCst);
        assert_eq!(total, 1, "only the lock winner may spawn");

        // The loser either adopted the winner's record or returned None
        // (caller retries); it must never produce a second location.
        let winner = pid_a.clone().or(pid_b.clone()).expect("winner resolved");
        for pid in [pid_a, pid_b].into_iter().flatten() {
            assert_eq!(pid, winner);
        }
    }

    #[tokio::test]
    async fn test_stale_member_record_evicted_and_respawned() {
        let storage = Arc::new(MemoryLookupStorage::new());

        // Pre-seed a record hosted on a member that is not in the topology.
        let stale_identity = identity(3);
        let lock = storage
            .try_acquire_lock(&stale_identity)
            .await
            .unwrap()
            .unwrap();
        storage
            .store_activation(
                &lock,
                Activation::new(
                    stale_identity.clone(),
                    Pid::new("10.9.9.9:7009", 1),
                    MemberId::new("member-9").unwrap(),
                ),
            )
            .await
            .unwrap();

        let f = fixture_with(storage.clone(), 0, vec![test_member(1), test_member(2)]).await;

        let pid = f.lookup.get(&stale_identity).await.unwrap().unwrap();
        assert_ne!(pid.address, "10.9.9.9:7009");
        assert_eq!(f.client.activation_requests.load(Ordering::SeqCst), 1);

        // The stale record was replaced, not duplicated.
        assert_eq!(storage.activation_count().await, 1);
        let stored = storage.try_get_existing(&stale_identity).await.unwrap();
        assert_ne!(stored.unwrap().hosted_on.as_str(), "member-9");
    }

    #[tokio::test]
    async fn test_no_activator_for_unknown_kind() {
        let f = fixture(0).await;
        let unknown = ClusterIdentity::new("invoice", "1").unwrap();

        let result = f.lookup.get(&unknown).await;
        assert!(matches!(
            result,
            Err(LookupError::NoActivatorAvailable { .. })
        ));
    }

    #[tokio::test]
    async fn test_evict_drops_cache_entry() {
        let f = fixture(0).await;

        f.lookup.get(&identity(1)).await.unwrap().unwrap();
        assert_eq!(f.lookup.cached_count().await, 1);

        f.lookup.evict(&identity(1)).await;
        assert_eq!(f.lookup.cached_count().await, 0);

        // Next get re-reads storage (the record is still there: no respawn)
        f.lookup.get(&identity(1)).await.unwrap().unwrap();
        assert_eq!(f.client.activation_requests.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_worker_index_stable() {
        let id = identity(42);
        let first = worker_index(&id, 8);
        let second = worker_index(&id, 8);
        assert_eq!(first, second);
        assert!(first < 8);
    }
}
