//! Bounded lookup worker
//!
//! TigerStyle: One worker per identity-hash slot; a given identity is
//! always handled by the same worker, so coalescing needs no shared
//! locks.
//!
//! Each worker is a single logical sequential actor: requests for an
//! identity already being resolved join the pending waiter list; the
//! resolution itself runs in a sub-task and resumes the worker through a
//! completion channel, so the worker keeps absorbing requests while
//! storage round-trips are in flight.

use crate::error::{LookupError, LookupResult};
use crate::lookup::{LookupConfig, SharedCache};
use crate::storage::LookupStorage;
use selkie_cluster::{Activation, ClientError, ClusterClient, KindRegistry, Topology};
use selkie_core::ClusterIdentity;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, warn};

pub(crate) type WorkerReply = oneshot::Sender<LookupResult<Option<Activation>>>;

pub(crate) struct WorkerRequest {
    pub identity: ClusterIdentity,
    pub reply: WorkerReply,
}

/// Everything a resolution needs, cloneable into sub-tasks
#[derive(Clone)]
pub(crate) struct ResolveContext {
    pub storage: Arc<dyn LookupStorage>,
    pub kinds: Arc<KindRegistry>,
    pub topology: watch::Receiver<Arc<Topology>>,
    pub client: Arc<dyn ClusterClient>,
    pub config: LookupConfig,
}

/// Spawn one worker task; returns its request queue
pub(crate) fn spawn_worker(
    index: usize,
    ctx: ResolveContext,
    cache: SharedCache,
) -> mpsc::Sender<WorkerRequest> {
    let (tx, mut rx) = mpsc::channel::<WorkerRequest>(ctx.config.queue_depth);

    tokio::spawn(async move {
        let (done_tx, mut done_rx) =
            mpsc::channel::<(ClusterIdentity, LookupResult<Option<Activation>>)>(
                ctx.config.queue_depth,
            );
        // Identical concurrent requests share one in-flight resolution
        let mut in_flight: HashMap<ClusterIdentity, Vec<WorkerReply>> = HashMap::new();

        loop {
            tokio::select! {
                request = rx.recv() => {
                    let Some(WorkerRequest { identity, reply }) = request else {
                        break;
                    };

                    if let Some(waiters) = in_flight.get_mut(&identity) {
                        waiters.push(reply);
                        continue;
                    }

                    in_flight.insert(identity.clone(), vec![reply]);
                    let ctx = ctx.clone();
                    let done = done_tx.clone();
                    tokio::spawn(async move {
                        let result = resolve(&ctx, &identity).await;
                        let _ = done.send((identity, result)).await;
                    });
                }
                settled = done_rx.recv() => {
                    let Some((identity, result)) = settled else {
                        break;
                    };

                    if let Ok(Some(activation)) = &result {
                        cache.write().await.insert(identity.clone(), activation.clone());
                    }

                    if let Some(waiters) = in_flight.remove(&identity) {
                        for waiter in waiters {
                            let _ = waiter.send(result.clone());
                        }
                    }
                }
            }
        }

        debug!(worker = index, "lookup worker stopped");
    });

    tx
}

/// Resolve one identity against storage
///
/// Failures that only mean "this attempt lost" (spawn timeout, lock race
/// lost, waiting out the lock holder) resolve to `Ok(None)`: the caller
/// decides whether to retry.
async fn resolve(
    ctx: &ResolveContext,
    identity: &ClusterIdentity,
) -> LookupResult<Option<Activation>> {
    // An existing record wins if its member is still with us.
    if let Some(activation) = ctx.storage.try_get_existing(identity).await? {
        if ctx.topology.borrow().contains(&activation.hosted_on) {
            return Ok(Some(activation));
        }
        warn!(
            identity = %identity,
            member_id = %activation.hosted_on,
            "activation references departed member, evicting"
        );
        let _ = ctx
            .storage
            .remove_activation(identity, &activation.pid)
            .await;
        let _ = ctx.storage.remove_member(&activation.hosted_on).await;
    }

    let Some(target) = ctx.kinds.select_for_kind(identity.kind()) else {
        return Err(LookupError::NoActivatorAvailable {
            kind: identity.kind().to_string(),
        });
    };

    match ctx.storage.try_acquire_lock(identity).await? {
        Some(lock) => {
            let spawned = ctx
                .client
                .request_activation(&target, identity, ctx.config.spawn_timeout_ms)
                .await;

            match spawned {
                Ok(pid) => {
                    let activation = Activation::new(identity.clone(), pid, target.id.clone());
                    match ctx.storage.store_activation(&lock, activation.clone()).await {
                        Ok(()) => Ok(Some(activation)),
                        Err(LookupError::LockNotFound { .. }) => {
                            // Another resolver won under a newer lock. Our
                            // spawned instance self-terminates when it
                            // notices it was never persisted.
                            debug!(identity = %identity, "lost persistence race, discarding spawn");
                            Ok(None)
                        }
                        Err(e) => Err(e),
                    }
                }
                Err(ClientError::Timeout { timeout_ms, .. }) => {
                    warn!(identity = %identity, timeout_ms, "activation request timed out");
                    let _ = ctx.storage.remove_lock(&lock).await;
                    Ok(None)
                }
                Err(e) => {
                    warn!(identity = %identity, error = %e, "activation request failed");
                    let _ = ctx.storage.remove_lock(&lock).await;
                    Ok(None)
                }
            }
        }
        None => {
            // Someone else is spawning; wait for their record.
            let waited = ctx
                .storage
                .wait_for_activation(identity, ctx.config.lock_wait_timeout_ms)
                .await?;
            match waited {
                Some(activation) if ctx.topology.borrow().contains(&activation.hosted_on) => {
                    Ok(Some(activation))
                }
                Some(activation) => {
                    warn!(
                        identity = %identity,
                        member_id = %activation.hosted_on,
                        "lock holder's record references departed member"
                    );
                    let _ = ctx
                        .storage
                        .remove_activation(identity, &activation.pid)
                        .await;
                    Ok(None)
                }
                None => {
                    debug!(identity = %identity, "lock holder produced no record in time");
                    Ok(None)
                }
            }
        }
    }
}
