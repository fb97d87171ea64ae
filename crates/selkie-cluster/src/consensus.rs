//! Gossip consensus contract
//!
//! TigerStyle: Opaque bounded-wait primitive, no global ordering assumed.
//!
//! The gossip layer is an external collaborator; this module only defines
//! the contract consumed by pull-mode rebalancing ("wait until all members
//! report no activations in flight") plus an in-memory implementation for
//! tests and single-process clusters. The primitive narrows the
//! duplicate-activation window; it does not close it.

use async_trait::async_trait;
use selkie_core::MemberId;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Notify, RwLock};

/// Result of one consensus poll
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsensusOutcome {
    /// Whether every expected member reported the same value
    pub all_agree: bool,
    /// The agreed value, when `all_agree` is true
    pub value: Option<u64>,
}

impl ConsensusOutcome {
    /// Outcome for a failed or timed-out poll
    pub fn disagreement() -> Self {
        Self {
            all_agree: false,
            value: None,
        }
    }

    /// Outcome for an agreed value
    pub fn agreement(value: u64) -> Self {
        Self {
            all_agree: true,
            value: Some(value),
        }
    }
}

/// Handle to one registered consensus check
#[async_trait]
pub trait ConsensusHandle: Send + Sync {
    /// Wait up to `timeout` for every expected member to agree on a value
    ///
    /// Returns a disagreement outcome on timeout; never blocks longer than
    /// the deadline.
    async fn try_get_consensus(&self, timeout: Duration) -> ConsensusOutcome;
}

/// Registration surface of the gossip consensus layer
#[async_trait]
pub trait ConsensusChecks: Send + Sync {
    /// Register a consensus check for the given gossip state key
    async fn register(&self, key: &str) -> Arc<dyn ConsensusHandle>;
}

// =============================================================================
// In-memory implementation
// =============================================================================

struct ConsensusState {
    /// Latest value reported per member, per key
    reports: HashMap<String, HashMap<MemberId, u64>>,
    /// Members expected to report
    expected: Vec<MemberId>,
}

/// In-memory consensus for tests and single-process clusters
///
/// Members publish per-key values with [`MemoryConsensus::set_state`];
/// a check agrees once every expected member reported the same value.
pub struct MemoryConsensus {
    state: Arc<RwLock<ConsensusState>>,
    changed: Arc<Notify>,
}

impl MemoryConsensus {
    /// Create a consensus instance expecting reports from the given members
    pub fn new(expected: Vec<MemberId>) -> Self {
        Self {
            state: Arc::new(RwLock::new(ConsensusState {
                reports: HashMap::new(),
                expected,
            })),
            changed: Arc::new(Notify::new()),
        }
    }

    /// Replace the set of members expected to report
    pub async fn set_expected(&self, expected: Vec<MemberId>) {
        let mut state = self.state.write().await;
        state.expected = expected;
        drop(state);
        self.changed.notify_waiters();
    }

    /// Publish one member's value for a key
    pub async fn set_state(&self, member_id: MemberId, key: &str, value: u64) {
        let mut state = self.state.write().await;
        state
            .reports
            .entry(key.to_string())
            .or_default()
            .insert(member_id, value);
        drop(state);
        self.changed.notify_waiters();
    }

    async fn poll(&self, key: &str) -> ConsensusOutcome {
        let state = self.state.read().await;
        let reports = match state.reports.get(key) {
            Some(reports) => reports,
            None => return ConsensusOutcome::disagreement(),
        };

        let mut agreed: Option<u64> = None;
        for member_id in &state.expected {
            match reports.get(member_id) {
                Some(value) => match agreed {
                    None => agreed = Some(*value),
                    Some(previous) if previous == *value => {}
                    Some(_) => return ConsensusOutcome::disagreement(),
                },
                None => return ConsensusOutcome::disagreement(),
            }
        }

        match agreed {
            Some(value) => ConsensusOutcome::agreement(value),
            None => ConsensusOutcome::disagreement(),
        }
    }
}

#[async_trait]
impl ConsensusChecks for MemoryConsensus {
    async fn register(&self, key: &str) -> Arc<dyn ConsensusHandle> {
        Arc::new(MemoryConsensusHandle {
            key: key.to_string(),
            state: self.state.clone(),
            changed: self.changed.clone(),
        })
    }
}

struct MemoryConsensusHandle {
    key: String,
    state: Arc<RwLock<ConsensusState>>,
    changed: Arc<Notify>,
}

impl MemoryConsensusHandle {
    async fn poll(&self) -> ConsensusOutcome {
        let consensus = MemoryConsensus {
            state: self.state.clone(),
            changed: self.changed.clone(),
        };
        consensus.poll(&self.key).await
    }
}

#[async_trait]
impl ConsensusHandle for MemoryConsensusHandle {
    async fn try_get_consensus(&self, timeout: Duration) -> ConsensusOutcome {
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            let notified = self.changed.notified();
            tokio::pin!(notified);
            // Register before polling so a report between the poll and
            // the await is not lost.
            notified.as_mut().enable();

            let outcome = self.poll().await;
            if outcome.all_agree {
                return outcome;
            }

            tokio::select! {
                _ = &mut notified => {}
                _ = tokio::time::sleep_until(deadline) => {
                    return ConsensusOutcome::disagreement();
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn member(n: u32) -> MemberId {
        MemberId::new(format!("member-{}", n)).unwrap()
    }

    #[tokio::test]
    async fn test_consensus_agreement() {
        let consensus = MemoryConsensus::new(vec![member(1), member(2)]);
        let handle = consensus.register("in-flight").await;

        consensus.set_state(member(1), "in-flight", 77).await;
        consensus.set_state(member(2), "in-flight", 77).await;

        let outcome = handle.try_get_consensus(Duration::from_millis(100)).await;
        assert!(outcome.all_agree);
        assert_eq!(outcome.value, Some(77));
    }

    #[tokio::test]
    async fn test_consensus_disagreement_times_out() {
        let consensus = MemoryConsensus::new(vec![member(1), member(2)]);
        let handle = consensus.register("in-flight").await;

        consensus.set_state(member(1), "in-flight", 77).await;
        consensus.set_state(member(2), "in-flight", 78).await;

        let outcome = handle.try_get_consensus(Duration::from_millis(50)).await;
        assert!(!outcome.all_agree);
        assert_eq!(outcome.value, None);
    }

    #[tokio::test]
    async fn test_consensus_missing_report_times_out() {
        let consensus = MemoryConsensus::new(vec![member(1), member(2)]);
        let handle = consensus.register("in-flight").await;

        consensus.set_state(member(1), "in-flight", 77).await;

        let outcome = handle.try_get_consensus(Duration::from_millis(50)).await;
        assert!(!outcome.all_agree);
    }

    #[tokio::test]
    async fn test_consensus_wakes_on_late_report() {
        let consensus = Arc::new(MemoryConsensus::new(vec![member(1), member(2)]));
        let handle = consensus.register("in-flight").await;

        consensus.set_state(member(1), "in-flight", 77).await;

        let publisher = consensus.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            publisher.set_state(member(2), "in-flight", 77).await;
        });

        let outcome = handle.try_get_consensus(Duration::from_secs(1)).await;
        assert!(outcome.all_agree);
        assert_eq!(outcome.value, Some(77));
    }
}
