//! Failure classification and cache repair
//!
//! ```text
//! reconcile failed ──▶ classify(status)
//!     400/404/409              ──▶ fast: refresh the VS subtree, re-publish
//!     408/429/5xx/transport    ──▶ slow: probe the failed object
//!                                     gone    → full refresh, re-publish every
//!                                               model that lost its VS
//!                                     present → re-publish after backoff
//!     anything else            ──▶ logged, not retried
//! ```
//!
//! Every routed failure spends one unit of the model's retry budget; a spent
//! budget parks the model until its graph changes or the next full sync.

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, error, info, warn};

use crate::apis::metrics::record_retry;
use crate::keys::{ModelKey, ObjKey};
use crate::locks::safe_lock;
use crate::queue::{KeyHandler, ShardedQueue};
use crate::remote::{RemoteClient, RemoteError};
use crate::rest::{FailedOp, Reconciler, SyncState};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RetryTier {
    Fast,
    Slow,
}

impl RetryTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            RetryTier::Fast => "fast",
            RetryTier::Slow => "slow",
        }
    }
}

impl fmt::Display for RetryTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Tier for a failed op's error; `None` means do not retry
pub fn classify(error: &RemoteError) -> Option<RetryTier> {
    match error {
        RemoteError::Status { code, .. } => match code {
            400 | 404 | 409 => Some(RetryTier::Fast),
            408 | 429 | 500..=599 => Some(RetryTier::Slow),
            _ => None,
        },
        RemoteError::Transport(_) => Some(RetryTier::Slow),
        RemoteError::Malformed(_) | RemoteError::Aborted => None,
    }
}

/// What a repair decided
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Repair {
    /// Re-publish these models now
    Republish(Vec<String>),
    /// Re-publish the model after the slow backoff
    Backoff(String),
    /// No client to repair with
    Disabled,
}

/// Last failure of every model waiting in a retry tier
#[derive(Debug, Default)]
pub struct FailureLedger {
    failures: Mutex<HashMap<String, FailedOp>>,
}

impl FailureLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, failed: FailedOp) {
        safe_lock(&self.failures).insert(failed.model.clone(), failed);
    }

    pub fn take(&self, model: &str) -> Option<FailedOp> {
        safe_lock(&self.failures).remove(model)
    }

    pub fn peek(&self, model: &str) -> Option<FailedOp> {
        safe_lock(&self.failures).get(model).cloned()
    }
}

/// Cache repair for both tiers
pub struct Retrier {
    reconciler: Arc<Reconciler>,
    ledger: FailureLedger,
}

impl Retrier {
    pub fn new(reconciler: Arc<Reconciler>) -> Self {
        Self {
            reconciler,
            ledger: FailureLedger::new(),
        }
    }

    pub fn ledger(&self) -> &FailureLedger {
        &self.ledger
    }

    /// Route a failed reconcile to its tier, spending retry budget.
    ///
    /// Returns the tier the model was parked in, or `None` when it will not
    /// be retried.
    pub fn route(&self, failed: FailedOp) -> Option<RetryTier> {
        let model = failed.model.clone();
        let states = self.reconciler.states();
        let Some(tier) = classify(&failed.error) else {
            error!(
                model = %model,
                "{} {} {} failed with a non-retryable error: {}",
                failed.method, failed.obj_type, failed.obj_name, failed.error
            );
            states.set(&model, SyncState::Idle);
            return None;
        };
        if !self.reconciler.store().consume_retry(&model) {
            error!(model = %model, "Retry budget exhausted, waiting for a graph change or full sync");
            states.set(&model, SyncState::Exhausted);
            return None;
        }

        record_retry(tier.as_str());
        states.set(
            &model,
            match tier {
                RetryTier::Fast => SyncState::FastRetry,
                RetryTier::Slow => SyncState::SlowRetry,
            },
        );
        debug!(model = %model, tier = %tier, "Routed failure: {}", failed.error);
        self.ledger.record(failed);
        Some(tier)
    }

    fn client_for(&self, model: &str) -> Option<Arc<dyn RemoteClient>> {
        self.reconciler.clients().for_model(model)
    }

    /// Refresh only the failed VS subtree.
    ///
    /// Without a VS uuid, or when the VS turns out to be gone, falls through
    /// to the full refresh.
    pub async fn fast_repair(&self, failed: &FailedOp) -> Repair {
        let Some(client) = self.client_for(&failed.model) else {
            return Repair::Disabled;
        };
        let Some(vs_uuid) = &failed.vs_uuid else {
            debug!(model = %failed.model, "{} has no uuid yet, refreshing everything", failed.vs_key);
            return self.full_refresh(client.as_ref(), &failed.model).await;
        };

        match self.reconciler.cache().refresh_subtree(client.as_ref(), vs_uuid).await {
            Ok(()) => {
                debug!(model = %failed.model, "Refreshed subtree of {}", failed.vs_key);
                Repair::Republish(vec![failed.model.clone()])
            }
            Err(e) if e.is_not_found() => {
                info!(model = %failed.model, "{} is gone remotely, refreshing everything", failed.vs_key);
                self.full_refresh(client.as_ref(), &failed.model).await
            }
            Err(e) => {
                warn!(model = %failed.model, "Subtree refresh of {} failed: {}", failed.vs_key, e);
                Repair::Backoff(failed.model.clone())
            }
        }
    }

    /// Probe the failed object; full refresh only when it is confirmed gone
    pub async fn slow_repair(&self, failed: &FailedOp) -> Repair {
        let Some(client) = self.client_for(&failed.model) else {
            return Repair::Disabled;
        };
        let Some(uuid) = &failed.uuid else {
            return Repair::Backoff(failed.model.clone());
        };

        match client.get(&failed.obj_type.object_path(uuid)).await {
            Err(e) if e.is_not_found() => {
                info!(model = %failed.model, "{} {} is gone remotely", failed.obj_type, failed.obj_name);
                self.full_refresh(client.as_ref(), &failed.model).await
            }
            Ok(_) => Repair::Backoff(failed.model.clone()),
            Err(e) => {
                debug!(model = %failed.model, "Probe of {} {} failed: {}", failed.obj_type, failed.obj_name, e);
                Repair::Backoff(failed.model.clone())
            }
        }
    }

    /// Bulk refresh, then re-publish `model` plus every model whose VS
    /// vanished
    pub async fn full_refresh(&self, client: &dyn RemoteClient, model: &str) -> Repair {
        let cache = self.reconciler.cache();
        // SNI children belong to their parent's model
        let parents: HashMap<ObjKey, ObjKey> = cache
            .virtual_services
            .entries()
            .into_iter()
            .filter_map(|(key, entry)| entry.parent_vs.map(|p| (key, p)))
            .collect();

        match cache.bulk_populate(client).await {
            Ok(removed) => {
                let mut models: BTreeSet<String> = removed
                    .iter()
                    .map(|key| {
                        let owner = parents.get(key).unwrap_or(key);
                        ModelKey::from_vs_key(owner).to_string()
                    })
                    .collect();
                models.insert(model.to_string());
                Repair::Republish(models.into_iter().collect())
            }
            Err(e) => {
                warn!(model = %model, "Full refresh failed: {}", e);
                Repair::Backoff(model.to_string())
            }
        }
    }
}

/// Worker of one retry tier: repair, then hand the model back to the
/// reconcile queue
pub struct RetryHandler {
    tier: RetryTier,
    retrier: Arc<Retrier>,
    reconcile: Arc<ShardedQueue>,
    slow_backoff: Duration,
}

impl RetryHandler {
    pub fn new(
        tier: RetryTier,
        retrier: Arc<Retrier>,
        reconcile: Arc<ShardedQueue>,
        slow_backoff: Duration,
    ) -> Self {
        Self {
            tier,
            retrier,
            reconcile,
            slow_backoff,
        }
    }
}

#[async_trait]
impl KeyHandler for RetryHandler {
    async fn handle(&self, model: String) {
        let repair = match self.retrier.ledger().take(&model) {
            Some(failed) => match self.tier {
                RetryTier::Fast => self.retrier.fast_repair(&failed).await,
                RetryTier::Slow => self.retrier.slow_repair(&failed).await,
            },
            None => Repair::Republish(vec![model.clone()]),
        };
        match repair {
            Repair::Republish(models) => {
                for m in models {
                    self.reconcile.publish(m);
                }
            }
            Repair::Backoff(m) => {
                debug!(model = %m, "Re-publishing in {:?}", self.slow_backoff);
                self.reconcile.publish_after(m, self.slow_backoff);
            }
            Repair::Disabled => {
                debug!(model = %model, "Sync disabled, dropping retry");
            }
        }
    }
}
