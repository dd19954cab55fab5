//! Periodic full sync
//!
//! ```text
//! every interval:
//!   cluster listed? ──no──▶ skip
//!        │
//!   rebuild every model ──▶ changed
//!   bulk-refresh mirror
//!   reset retry budgets
//!   our VS remotely, no model ──▶ tombstone ──▶ drifted
//!   publish changed ∪ drifted ∪ unconverged
//! ```
//!
//! The sweep catches everything the event path missed: lost watch events,
//! objects edited or removed behind our back, and models parked with an
//! exhausted retry budget.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::apis::metrics::record_full_sync;
use crate::error::SyncError;
use crate::graph::GraphBuilder;
use crate::keys::ModelKey;
use crate::queue::ShardedQueue;
use crate::rest::Reconciler;

/// What one sweep did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Models whose graph changed on rebuild
    pub rebuilt: BTreeSet<String>,
    /// Remote virtual services with no model, now tombstoned
    pub drifted: BTreeSet<String>,
    /// Every model handed to the reconcile queue
    pub published: BTreeSet<String>,
}

pub struct FullSync {
    builder: Arc<GraphBuilder>,
    reconciler: Arc<Reconciler>,
    reconcile: Arc<ShardedQueue>,
    interval: Option<Duration>,
}

impl FullSync {
    pub fn new(
        builder: Arc<GraphBuilder>,
        reconciler: Arc<Reconciler>,
        reconcile: Arc<ShardedQueue>,
        interval: Option<Duration>,
    ) -> Self {
        Self {
            builder,
            reconciler,
            reconcile,
            interval,
        }
    }

    /// Run one sweep now
    pub async fn run_once(&self) -> Result<SweepReport, SyncError> {
        let result = self.sweep().await;
        record_full_sync(match &result {
            Ok(_) => "ok",
            Err(SyncError::ClusterNotReady(_)) => "skipped",
            Err(_) => "error",
        });
        result
    }

    async fn sweep(&self) -> Result<SweepReport, SyncError> {
        if self.reconciler.is_disabled() {
            return Err(SyncError::SyncDisabled("full sync skipped".to_string()));
        }
        self.builder.cluster().ensure_synced()?;

        let rebuilt = self.builder.resync_all();

        let Some(client) = self.reconciler.clients().any() else {
            return Err(SyncError::SyncDisabled("client pool is empty".to_string()));
        };
        let cache = self.reconciler.cache();
        cache.bulk_populate(client.as_ref()).await?;

        let store = self.reconciler.store();
        store.reset_retry_budgets();

        let known: BTreeSet<String> = store.model_names().into_iter().collect();
        let mut drifted = BTreeSet::new();
        for (key, entry) in cache.virtual_services.entries() {
            // SNI children are removed through their parent's model
            if entry.uuid.is_none() || entry.parent_vs.is_some() {
                continue;
            }
            let model = ModelKey::from_vs_key(&key).to_string();
            if !known.contains(&model) {
                info!(model = %model, "Remote virtual service has no model, scheduling removal");
                store.save(&model, None);
                drifted.insert(model);
            }
        }

        let mut published: BTreeSet<String> = rebuilt.union(&drifted).cloned().collect();
        for model in store.model_names() {
            if !published.contains(&model) && !self.reconciler.is_converged(&model) {
                debug!(model = %model, "Not converged");
                published.insert(model);
            }
        }
        for model in &published {
            self.reconcile.publish(model.clone());
        }

        info!(
            rebuilt = rebuilt.len(),
            drifted = drifted.len(),
            published = published.len(),
            "Full sync complete"
        );
        Ok(SweepReport {
            rebuilt,
            drifted,
            published,
        })
    }

    /// Sweep on every interval tick until cancelled; no-op when the interval
    /// is disabled
    pub fn spawn(self: Arc<Self>, cancel: CancellationToken) -> Option<JoinHandle<()>> {
        let Some(period) = self.interval else {
            info!("Full sync disabled");
            return None;
        };
        Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // the first tick fires immediately; startup already refreshed
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = self.run_once().await {
                            warn!("Full sync failed: {}", e);
                        }
                    }
                }
            }
            debug!("Full sync stopped");
        }))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;
    use crate::apis::cluster::ClusterStore;
    use crate::cache::ControllerCache;
    use crate::config::SyncConfig;
    use crate::graph::{ModelStore, Naming, NoRouteRules, RelationIndex};
    use crate::remote::{ClientPool, InMemoryController, ObjType, RemoteClient, RestOp};
    use crate::rest::PayloadContext;
    use serde_json::json;

    struct Harness {
        controller: Arc<InMemoryController>,
        store: Arc<ModelStore>,
        sync: FullSync,
        queue: Arc<ShardedQueue>,
    }

    fn harness(cluster: ClusterStore) -> Harness {
        let config = SyncConfig::default();
        let controller = Arc::new(InMemoryController::new(&config.tenant));
        let store = Arc::new(ModelStore::new(config.retry.retry_budget));
        let builder = Arc::new(GraphBuilder::new(
            Naming::from_config(&config),
            Arc::new(cluster),
            store.clone(),
            Arc::new(RelationIndex::new()),
            Arc::new(NoRouteRules),
        ));
        let reconciler = Arc::new(Reconciler::new(
            store.clone(),
            Arc::new(ControllerCache::new(config.tenant.clone(), config.controller.created_by.clone(), 100)),
            ClientPool::shared(controller.clone(), 1),
            PayloadContext::from_config(&config),
        ));
        let queue = Arc::new(ShardedQueue::new("reconcile", 2));
        Harness {
            controller,
            store,
            sync: FullSync::new(builder, reconciler, queue.clone(), None),
            queue,
        }
    }

    #[tokio::test]
    async fn test_sweep_waits_for_cluster_listing() {
        let h = harness(ClusterStore::new());
        assert!(matches!(h.sync.run_once().await, Err(SyncError::ClusterNotReady(_))));
        assert!(h.queue.is_empty());
    }

    #[tokio::test]
    async fn test_sweep_tombstones_orphaned_remote_vs() {
        let h = harness(ClusterStore::new_synced());
        let config = SyncConfig::default();
        h.controller
            .execute(&RestOp::create(
                ObjType::VirtualService,
                &config.tenant,
                "orphan",
                json!({"name": "orphan", "created_by": config.controller.created_by.clone()}),
            ))
            .await
            .unwrap();

        let report = h.sync.run_once().await.unwrap();
        let orphan = format!("{}/orphan", config.tenant);
        assert!(report.drifted.contains(&orphan));
        assert!(report.published.contains(&orphan));
        assert!(h.queue.is_pending(&orphan));

        let (exists, graph) = h.store.get(&orphan);
        assert!(exists && graph.is_none(), "orphan stored as a tombstone");
    }

    #[tokio::test]
    async fn test_sweep_ignores_foreign_objects() {
        let h = harness(ClusterStore::new_synced());
        h.controller
            .execute(&RestOp::create(
                ObjType::VirtualService,
                "admin",
                "someone-else",
                json!({"name": "someone-else", "created_by": "another-controller"}),
            ))
            .await
            .unwrap();

        let report = h.sync.run_once().await.unwrap();
        assert!(report.drifted.is_empty());
    }

    #[tokio::test]
    async fn test_sweep_resets_retry_budgets() {
        let h = harness(ClusterStore::new_synced());
        h.store.save("admin/vs", None);
        while h.store.consume_retry("admin/vs") {}

        h.sync.run_once().await.unwrap();
        assert!(h.store.consume_retry("admin/vs"), "budget restored");
        assert!(h.queue.is_pending("admin/vs"), "tombstones are never converged");
    }
}
