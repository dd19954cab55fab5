//! In-process test harness
//!
//! Wires the real graph builder, reconciler and retry tiers to the in-memory
//! cluster store and remote controller. Queues are replaced by direct calls
//! so every step of a scenario is deterministic.

#![allow(dead_code, clippy::expect_used, clippy::panic, clippy::unwrap_used)]

pub mod fixtures;

use std::collections::BTreeSet;
use std::sync::Arc;

use control::apis::cluster::ClusterStore;
use control::cache::ControllerCache;
use control::full_sync::FullSync;
use control::graph::{GraphBuilder, ModelStore, Naming, NoRouteRules, ObjectGraph, RelationIndex};
use control::queue::ShardedQueue;
use control::remote::{ClientPool, InMemoryController};
use control::rest::{PayloadContext, Reconciler, SyncOutcome};
use control::retry::{Repair, Retrier, RetryTier};
use control::SyncConfig;

pub struct Harness {
    pub config: SyncConfig,
    pub cluster: Arc<ClusterStore>,
    pub controller: Arc<InMemoryController>,
    pub store: Arc<ModelStore>,
    pub builder: Arc<GraphBuilder>,
    pub reconciler: Arc<Reconciler>,
    pub retrier: Retrier,
    pub reconcile_queue: Arc<ShardedQueue>,
    pub full_sync: FullSync,
}

impl Harness {
    pub fn new() -> Self {
        let config = SyncConfig::default();
        let cluster = Arc::new(ClusterStore::new_synced());
        let controller = Arc::new(InMemoryController::new(&config.tenant));
        let store = Arc::new(ModelStore::new(config.retry.retry_budget));
        let builder = Arc::new(GraphBuilder::new(
            Naming::from_config(&config),
            cluster.clone(),
            store.clone(),
            Arc::new(RelationIndex::new()),
            Arc::new(NoRouteRules),
        ));
        let reconciler = Arc::new(Reconciler::new(
            store.clone(),
            Arc::new(ControllerCache::new(
                config.tenant.clone(),
                config.controller.created_by.clone(),
                config.controller.page_size,
            )),
            ClientPool::shared(controller.clone(), 2),
            PayloadContext::from_config(&config),
        ));
        let reconcile_queue = Arc::new(ShardedQueue::new("reconcile", 2));
        let full_sync = FullSync::new(builder.clone(), reconciler.clone(), reconcile_queue.clone(), None);
        Self {
            retrier: Retrier::new(reconciler.clone()),
            config,
            cluster,
            controller,
            store,
            builder,
            reconciler,
            reconcile_queue,
            full_sync,
        }
    }

    pub fn cache(&self) -> &ControllerCache {
        self.reconciler.cache()
    }

    /// Run one ingestion key through the builder
    pub fn ingest(&self, key: &str) -> BTreeSet<String> {
        let parts: Vec<&str> = key.split('/').collect();
        let (namespace, name) = match parts.as_slice() {
            [_, ns, name] => (*ns, *name),
            [_, name] => ("", *name),
            _ => panic!("bad key {}", key),
        };
        self.builder.build_model(namespace, name, key)
    }

    pub fn graph(&self, model: &str) -> Option<ObjectGraph> {
        self.store.get(model).1
    }

    pub async fn reconcile(&self, model: &str) -> SyncOutcome {
        self.reconciler.reconcile(model).await
    }

    /// Reconcile and, on failure, route and repair once.
    ///
    /// Returns the tier used and the repair decision, or `None` when the pass
    /// did not fail.
    pub async fn reconcile_and_repair(&self, model: &str) -> Option<(RetryTier, Repair)> {
        let SyncOutcome::Failed(failed) = self.reconcile(model).await else {
            return None;
        };
        let tier = self.retrier.route(failed)?;
        let failed = self.retrier.ledger().take(model).expect("routed failure is recorded");
        let repair = match tier {
            RetryTier::Fast => self.retrier.fast_repair(&failed).await,
            RetryTier::Slow => self.retrier.slow_repair(&failed).await,
        };
        Some((tier, repair))
    }

    /// Reconcile `models` until every one converges or `rounds` run out
    pub async fn settle(&self, models: &BTreeSet<String>, rounds: usize) {
        for _ in 0..rounds {
            let mut pending = false;
            for model in models {
                match self.reconcile(model).await {
                    SyncOutcome::Converged | SyncOutcome::Removed => {}
                    SyncOutcome::Failed(_) => pending = true,
                    SyncOutcome::Disabled => panic!("sync disabled"),
                }
            }
            if !pending {
                return;
            }
        }
        panic!("models did not settle: {:?}", models);
    }
}
