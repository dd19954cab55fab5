//! Sync pipeline - four sharded layers
//!
//! ```text
//!  watchers ──"Kind/ns/name"──▶ ingestion ──build_model──▶ reconcile ──▶ remote
//!                                                             │  ▲
//!                                          400/404/409 ◀──────┤  │
//!                                          fast retry ────────┼──┘ refresh subtree
//!                                          408/429/5xx ◀──────┘  │
//!                                          slow retry ───────────┘ probe, backoff
//! ```
//!
//! Ingestion keys are sharded by source key, everything after by model name,
//! so one model is never reconciled by two workers at once.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::SyncConfig;
use crate::error::SyncError;
use crate::graph::GraphBuilder;
use crate::keys::SourceKey;
use crate::queue::{KeyHandler, ShardedQueue};
use crate::rest::{Reconciler, SyncOutcome};
use crate::full_sync::FullSync;
use crate::retry::{Retrier, RetryHandler, RetryTier};

// =============================================================================
// Layer handlers
// =============================================================================

/// Source key → rebuilt models → reconcile queue
pub struct IngestionHandler {
    builder: Arc<GraphBuilder>,
    reconcile: Arc<ShardedQueue>,
}

#[async_trait]
impl KeyHandler for IngestionHandler {
    async fn handle(&self, key: String) {
        let source = match key.parse::<SourceKey>() {
            Ok(source) => source,
            Err(e) => {
                warn!("Dropping ingestion key: {}", e);
                return;
            }
        };
        let changed = self.builder.build_model(&source.namespace, &source.name, &key);
        for model in changed {
            debug!(key = %key, model = %model, "Model changed");
            self.reconcile.publish(model);
        }
    }
}

/// Model → reconcile pass → retry tier on failure
pub struct ReconcileHandler {
    reconciler: Arc<Reconciler>,
    retrier: Arc<Retrier>,
    fast: Arc<ShardedQueue>,
    slow: Arc<ShardedQueue>,
    fast_delay: Duration,
}

#[async_trait]
impl KeyHandler for ReconcileHandler {
    async fn handle(&self, model: String) {
        let SyncOutcome::Failed(failed) = self.reconciler.reconcile(&model).await else {
            return;
        };
        match self.retrier.route(failed) {
            Some(RetryTier::Fast) => {
                self.fast.publish_after(model, self.fast_delay);
            }
            Some(RetryTier::Slow) => {
                self.slow.publish(model);
            }
            None => {}
        }
    }
}

// =============================================================================
// Pipeline
// =============================================================================

pub struct SyncPipeline {
    config: SyncConfig,
    builder: Arc<GraphBuilder>,
    reconciler: Arc<Reconciler>,
    retrier: Arc<Retrier>,
    ingestion: Arc<ShardedQueue>,
    reconcile: Arc<ShardedQueue>,
    fast_retry: Arc<ShardedQueue>,
    slow_retry: Arc<ShardedQueue>,
    full_sync: Arc<FullSync>,
    started: AtomicBool,
}

impl SyncPipeline {
    pub fn new(config: SyncConfig, builder: Arc<GraphBuilder>, reconciler: Arc<Reconciler>) -> Self {
        let workers = &config.workers;
        let ingestion = Arc::new(ShardedQueue::new("ingestion", workers.ingestion_shards));
        let reconcile = Arc::new(ShardedQueue::new("reconcile", workers.reconcile_shards));
        let fast_retry = Arc::new(ShardedQueue::new("fast_retry", workers.fast_retry_shards));
        let slow_retry = Arc::new(ShardedQueue::new("slow_retry", workers.slow_retry_shards));
        let full_sync = Arc::new(FullSync::new(
            builder.clone(),
            reconciler.clone(),
            reconcile.clone(),
            config.full_sync_interval(),
        ));
        Self {
            retrier: Arc::new(Retrier::new(reconciler.clone())),
            config,
            builder,
            reconciler,
            ingestion,
            reconcile,
            fast_retry,
            slow_retry,
            full_sync,
            started: AtomicBool::new(false),
        }
    }

    /// Where watchers publish `Kind/ns/name` keys
    pub fn ingestion_queue(&self) -> Arc<ShardedQueue> {
        self.ingestion.clone()
    }

    pub fn reconciler(&self) -> &Arc<Reconciler> {
        &self.reconciler
    }

    /// Mirror the controller, then start every layer's workers and the
    /// periodic full sync.
    ///
    /// A failed initial mirror disables sync but the workers still start, so
    /// ingestion keeps the model store current.
    pub async fn start(&self, cancel: CancellationToken) -> Result<Vec<JoinHandle<()>>, SyncError> {
        if self.started.swap(true, Ordering::AcqRel) {
            return Err(SyncError::AlreadyStarted);
        }

        match self.reconciler.clients().any() {
            Some(client) => {
                if let Err(e) = self.reconciler.cache().bulk_populate(client.as_ref()).await {
                    self.reconciler.disable(&format!("initial controller refresh failed: {}", e));
                }
            }
            None => self.reconciler.disable("client pool is empty"),
        }

        let mut handles = Vec::new();
        handles.extend(self.ingestion.start(
            Arc::new(IngestionHandler {
                builder: self.builder.clone(),
                reconcile: self.reconcile.clone(),
            }),
            cancel.clone(),
        )?);
        handles.extend(self.reconcile.start(
            Arc::new(ReconcileHandler {
                reconciler: self.reconciler.clone(),
                retrier: self.retrier.clone(),
                fast: self.fast_retry.clone(),
                slow: self.slow_retry.clone(),
                fast_delay: self.config.retry.fast_delay(),
            }),
            cancel.clone(),
        )?);
        for (tier, queue) in [
            (RetryTier::Fast, &self.fast_retry),
            (RetryTier::Slow, &self.slow_retry),
        ] {
            handles.extend(queue.start(
                Arc::new(RetryHandler::new(
                    tier,
                    self.retrier.clone(),
                    self.reconcile.clone(),
                    self.config.retry.slow_backoff(),
                )),
                cancel.clone(),
            )?);
        }
        if let Some(handle) = self.full_sync.clone().spawn(cancel) {
            handles.push(handle);
        }

        info!(
            ingestion = self.ingestion.shard_count(),
            reconcile = self.reconcile.shard_count(),
            fast_retry = self.fast_retry.shard_count(),
            slow_retry = self.slow_retry.shard_count(),
            "Sync pipeline started"
        );
        Ok(handles)
    }

    /// Rebuild everything from the cluster snapshot and queue what changed.
    ///
    /// Used once the watchers finished their initial lists.
    pub fn publish_all(&self) -> BTreeSet<String> {
        let changed = self.builder.resync_all();
        for model in &changed {
            self.reconcile.publish(model.clone());
        }
        changed
    }
}
