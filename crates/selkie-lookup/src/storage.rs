//! Storage backend contract and in-memory implementation
//!
//! TigerStyle: Optimistic locks with stale-lock reclaim, never long-held
//! mutual exclusion.
//!
//! The external store is the only shared resource requiring real mutual
//! exclusion, achieved with spawn locks: a holder may write the final
//! activation only while presenting the matching lock id. A holder that
//! disappears must not cause permanent unavailability, so an unreleased
//! lock becomes reclaimable after a timeout.

use crate::error::{LookupError, LookupResult};
use async_trait::async_trait;
use selkie_cluster::{Activation, Pid};
use selkie_core::{
    ClusterIdentity, MemberId, RngProvider, StdRngProvider, TimeProvider, WallClockTime,
    LOCK_STALE_TIMEOUT_MS_DEFAULT,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Notify, RwLock};
use tracing::{debug, warn};

/// Lease permitting one resolver to persist an activation
///
/// The `lock_id` is the optimistic-concurrency token: `store_activation`
/// fails with `LockNotFound` when a newer lock has superseded it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpawnLock {
    /// Optimistic-concurrency token
    pub lock_id: String,
    /// The identity this lock covers
    pub identity: ClusterIdentity,
}

/// Storage backend contract for identity resolution
///
/// Consumed, not implemented, by the resolution logic; the in-memory
/// implementation below backs tests and single-process deployments.
#[async_trait]
pub trait LookupStorage: Send + Sync {
    /// Fetch an existing activation record, if any
    async fn try_get_existing(
        &self,
        identity: &ClusterIdentity,
    ) -> LookupResult<Option<Activation>>;

    /// Try to acquire the spawn lock for an identity
    ///
    /// Returns `None` when another resolver currently holds it.
    async fn try_acquire_lock(&self, identity: &ClusterIdentity) -> LookupResult<Option<SpawnLock>>;

    /// Wait (bounded) for the current lock holder's activation to appear
    async fn wait_for_activation(
        &self,
        identity: &ClusterIdentity,
        timeout_ms: u64,
    ) -> LookupResult<Option<Activation>>;

    /// Release a lock without writing an activation
    async fn remove_lock(&self, lock: &SpawnLock) -> LookupResult<()>;

    /// Persist an activation under a held lock
    ///
    /// # Errors
    /// Fails with [`LookupError::LockNotFound`] when the lock was
    /// superseded: another resolver won the race under a newer lock.
    async fn store_activation(&self, lock: &SpawnLock, activation: Activation) -> LookupResult<()>;

    /// Remove one activation record, matched exactly by PID
    async fn remove_activation(&self, identity: &ClusterIdentity, pid: &Pid) -> LookupResult<()>;

    /// Best-effort cleanup of every record owned by a departed member
    async fn remove_member(&self, member_id: &MemberId) -> LookupResult<()>;
}

// =============================================================================
// In-memory implementation
// =============================================================================

struct LockEntry {
    lock_id: String,
    acquired_at_ms: u64,
}

#[derive(Default)]
struct StorageState {
    activations: HashMap<ClusterIdentity, Activation>,
    locks: HashMap<ClusterIdentity, LockEntry>,
}

/// In-memory storage backend
///
/// All state is lost on restart; suitable for tests and single-process
/// deployments.
pub struct MemoryLookupStorage {
    state: RwLock<StorageState>,
    stored: Notify,
    time: Arc<dyn TimeProvider>,
    rng: Arc<dyn RngProvider>,
    stale_timeout_ms: u64,
}

impl MemoryLookupStorage {
    /// Create with production providers
    pub fn new() -> Self {
        Self::with_providers(
            Arc::new(WallClockTime::new()),
            Arc::new(StdRngProvider::new()),
        )
    }

    /// Create with injected providers (for deterministic tests)
    pub fn with_providers(time: Arc<dyn TimeProvider>, rng: Arc<dyn RngProvider>) -> Self {
        Self {
            state: RwLock::new(StorageState::default()),
            stored: Notify::new(),
            time,
            rng,
            stale_timeout_ms: LOCK_STALE_TIMEOUT_MS_DEFAULT,
        }
    }

    /// Override the stale-lock reclaim timeout
    pub fn with_stale_timeout(mut self, stale_timeout_ms: u64) -> Self {
        assert!(stale_timeout_ms > 0, "stale timeout must be positive");
        self.stale_timeout_ms = stale_timeout_ms;
        self
    }

    /// Number of stored activations
    pub async fn activation_count(&self) -> usize {
        self.state.read().await.activations.len()
    }
}

impl Default for MemoryLookupStorage {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LookupStorage for MemoryLookupStorage {
    async fn try_get_existing(
        &self,
        identity: &ClusterIdentity,
    ) -> LookupResult<Option<Activation>> {
        let state = self.state.read().await;
        Ok(state.activations.get(identity).cloned())
    }

    async fn try_acquire_lock(&self, identity: &ClusterIdentity) -> LookupResult<Option<SpawnLock>> {
        let mut state = self.state.write().await;
        let now_ms = self.time.now_ms();

        if let Some(entry) = state.locks.get(identity) {
            let age_ms = now_ms.saturating_sub(entry.acquired_at_ms);
            if age_ms <= self.stale_timeout_ms {
                return Ok(None);
            }
            // The holder disappeared; the lock must not cause permanent
            // unavailability.
            warn!(identity = %identity, age_ms, "reclaiming stale spawn lock");
        }

        let lock_id = self.rng.gen_token();
        state.locks.insert(
            identity.clone(),
            LockEntry {
                lock_id: lock_id.clone(),
                acquired_at_ms: now_ms,
            },
        );

        Ok(Some(SpawnLock {
            lock_id,
            identity: identity.clone(),
        }))
    }

    async fn wait_for_activation(
        &self,
        identity: &ClusterIdentity,
        timeout_ms: u64,
    ) -> LookupResult<Option<Activation>> {
        let deadline = tokio::time::Instant::now() + Duration::from_millis(timeout_ms);

        loop {
            let notified = self.stored.notified();
            tokio::pin!(notified);
            // Register before checking so a store between the check and
            // the await is not lost.
            notified.as_mut().enable();

            {
                let state = self.state.read().await;
                if let Some(activation) = state.activations.get(identity) {
                    return Ok(Some(activation.clone()));
                }
            }

            tokio::select! {
                _ = &mut notified => {}
                _ = tokio::time::sleep_until(deadline) => return Ok(None),
            }
        }
    }

    async fn remove_lock(&self, lock: &SpawnLock) -> LookupResult<()> {
        let mut state = self.state.write().await;
        if let Some(entry) = state.locks.get(&lock.identity) {
            if entry.lock_id == lock.lock_id {
                state.locks.remove(&lock.identity);
            }
        }
        Ok(())
    }

    async fn store_activation(&self, lock: &SpawnLock, activation: Activation) -> LookupResult<()> {
        debug_assert_eq!(lock.identity, activation.identity);

        let mut state = self.state.write().await;
        match state.locks.get(&lock.identity) {
            Some(entry) if entry.lock_id == lock.lock_id => {}
            _ => {
                return Err(LookupError::lock_not_found(lock.identity.qualified_name()));
            }
        }

        state.locks.remove(&lock.identity);
        state
            .activations
            .insert(activation.identity.clone(), activation);
        drop(state);

        self.stored.notify_waiters();
        Ok(())
    }

    async fn remove_activation(&self, identity: &ClusterIdentity, pid: &Pid) -> LookupResult<()> {
        let mut state = self.state.write().await;
        match state.activations.get(identity) {
            Some(current) if &current.pid == pid => {
                state.activations.remove(identity);
                debug!(identity = %identity, pid = %pid, "activation record removed");
            }
            _ => {
                debug!(identity = %identity, pid = %pid, "stale removal ignored");
            }
        }
        Ok(())
    }

    async fn remove_member(&self, member_id: &MemberId) -> LookupResult<()> {
        let mut state = self.state.write().await;
        let before = state.activations.len();
        state
            .activations
            .retain(|_, activation| &activation.hosted_on != member_id);
        let removed = before - state.activations.len();
        if removed > 0 {
            debug!(member_id = %member_id, removed, "member records removed");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use selkie_core::MockClock;

    fn test_identity() -> ClusterIdentity {
        ClusterIdentity::new("order", "x").unwrap()
    }

    fn test_activation(member: u32, sequence: u64) -> Activation {
        Activation::new(
            test_identity(),
            Pid::new(format!("10.0.0.{}:9000", member), sequence),
            MemberId::new(format!("member-{}", member)).unwrap(),
        )
    }

    fn seeded_storage() -> MemoryLookupStorage {
        MemoryLookupStorage::with_providers(
            Arc::new(WallClockTime::new()),
            Arc::new(StdRngProvider::with_seed(7)),
        )
    }

    #[tokio::test]
    async fn test_lock_race_single_winner() {
        let storage = seeded_storage();

        let first = storage.try_acquire_lock(&test_identity()).await.unwrap();
        let second = storage.try_acquire_lock(&test_identity()).await.unwrap();

        assert!(first.is_some());
        assert!(second.is_none());
    }

    #[tokio::test]
    async fn test_wait_returns_winner_record() {
        let storage = Arc::new(seeded_storage());

        let lock = storage
            .try_acquire_lock(&test_identity())
            .await
            .unwrap()
            .unwrap();

        // Loser waits while the winner persists in the background.
        let writer = storage.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            writer
                .store_activation(&lock, test_activation(1, 1))
                .await
                .unwrap();
        });

        let activation = storage
            .wait_for_activation(&test_identity(), 1_000)
            .await
            .unwrap()
            .expect("winner's record must appear");
        assert_eq!(activation.pid, Pid::new("10.0.0.1:9000", 1));
    }

    #[tokio::test]
    async fn test_wait_times_out_without_record() {
        let storage = seeded_storage();
        let result = storage
            .wait_for_activation(&test_identity(), 50)
            .await
            .unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn test_store_without_lock_fails() {
        let storage = seeded_storage();

        let forged = SpawnLock {
            lock_id: "no-such-lock".into(),
            identity: test_identity(),
        };
        let result = storage.store_activation(&forged, test_activation(1, 1)).await;
        assert!(matches!(result, Err(LookupError::LockNotFound { .. })));
    }

    #[tokio::test]
    async fn test_superseded_lock_fails_store() {
        let clock = Arc::new(MockClock::new(1_000));
        let storage = MemoryLookupStorage::with_providers(
            clock.clone(),
            Arc::new(StdRngProvider::with_seed(7)),
        )
        .with_stale_timeout(5_000);

        let stale = storage
            .try_acquire_lock(&test_identity())
            .await
            .unwrap()
            .unwrap();

        // The holder goes quiet past the stale timeout; a newer resolver
        // reclaims the lock.
        clock.advance(6_000).await;
        let fresh = storage
            .try_acquire_lock(&test_identity())
            .await
            .unwrap()
            .expect("stale lock must be reclaimable");
        assert_ne!(stale.lock_id, fresh.lock_id);

        // The zombie holder's write loses.
        let result = storage.store_activation(&stale, test_activation(1, 1)).await;
        assert!(matches!(result, Err(LookupError::LockNotFound { .. })));

        // The new holder's write wins.
        storage
            .store_activation(&fresh, test_activation(2, 1))
            .await
            .unwrap();
        let stored = storage.try_get_existing(&test_identity()).await.unwrap();
        assert_eq!(stored.unwrap().hosted_on.as_str(), "member-2");
    }

    #[tokio::test]
    async fn test_remove_activation_exact_pid_only() {
        let storage = seeded_storage();

        let lock = storage
            .try_acquire_lock(&test_identity())
            .await
            .unwrap()
            .unwrap();
        storage
            .store_activation(&lock, test_activation(1, 1))
            .await
            .unwrap();

        // A different PID must not remove the record
        storage
            .remove_activation(&test_identity(), &Pid::new("10.0.0.1:9000", 99))
            .await
            .unwrap();
        assert_eq!(storage.activation_count().await, 1);

        storage
            .remove_activation(&test_identity(), &Pid::new("10.0.0.1:9000", 1))
            .await
            .unwrap();
        assert_eq!(storage.activation_count().await, 0);
    }

    #[tokio::test]
    async fn test_remove_member_clears_its_records() {
        let storage = seeded_storage();

        for n in 0..4u32 {
            let identity = ClusterIdentity::new("order", format!("{}", n)).unwrap();
            let lock = storage.try_acquire_lock(&identity).await.unwrap().unwrap();
            let hosted = if n % 2 == 0 { 1 } else { 2 };
            let activation = Activation::new(
                identity.clone(),
                Pid::new(format!("10.0.0.{}:9000", hosted), n as u64),
                MemberId::new(format!("member-{}", hosted)).unwrap(),
            );
            storage.store_activation(&lock, activation).await.unwrap();
        }

        storage
            .remove_member(&MemberId::new("member-1").unwrap())
            .await
            .unwrap();
        assert_eq!(storage.activation_count().await, 2);
    }

    #[tokio::test]
    async fn test_released_lock_is_reacquirable() {
        let storage = seeded_storage();

        let lock = storage
            .try_acquire_lock(&test_identity())
            .await
            .unwrap()
            .unwrap();
        storage.remove_lock(&lock).await.unwrap();

        let again = storage.try_acquire_lock(&test_identity()).await.unwrap();
        assert!(again.is_some());
    }
}
