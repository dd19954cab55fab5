//! Diff-and-apply for one model at a time
//!
//! ```text
//! model name ─▶ store.get_copy ─▶ client = pool[bucket(model)]
//!                    │
//!        ┌───────────┼──────────────────────┐
//!        ▼           ▼                      ▼
//!    tombstone     VRF graph              VS graph
//!    SNI children  PUT when changed       parent batch
//!    then parent   (never created)        SNI child batches
//!    cascades                             stale SNI child cascades
//! ```
//!
//! Batches run strictly in that order on the model's client; the first failed
//! batch ends the pass and is reported as a [`FailedOp`] for retry
//! classification. Successful ops are folded into the cache either way.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use serde_json::Value;
use tracing::{debug, error, info, warn};

use super::builders::{vrf_payload, PayloadContext};
use super::fold::fold_batch;
use super::plan::{
    cached_sni_children, child_checksum, desired_children, graph_has, plan_cascade, plan_vs, VsBatch,
};
use super::state::{ModelStates, SyncState};
use super::status::StatusSender;
use crate::apis::metrics::record_reconcile;
use crate::cache::entries::parse_identity;
use crate::cache::{ChildCacheEntry, ControllerCache, CHILD_TYPES};
use crate::graph::nodes::VrfNode;
use crate::graph::{ModelStore, ObjectGraph};
use crate::keys::{ModelKey, ObjKey};
use crate::remote::{execute_batch, ClientPool, ObjType, RemoteClient, RemoteError, RestMethod, RestOp};

/// The op that stopped a reconcile pass
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailedOp {
    pub model: String,
    pub method: RestMethod,
    pub obj_type: ObjType,
    pub obj_name: String,
    pub tenant: String,
    /// uuid of the failing object, when it had one
    pub uuid: Option<String>,
    /// VS the failing batch was applied for
    pub vs_key: ObjKey,
    /// uuid of that VS after folding, when it exists remotely
    pub vs_uuid: Option<String>,
    pub error: RemoteError,
}

impl FailedOp {
    fn from_op(model: &str, op: &RestOp, vs_key: &ObjKey, vs_uuid: Option<String>, error: RemoteError) -> Self {
        Self {
            model: model.to_string(),
            method: op.method,
            obj_type: op.obj_type,
            obj_name: op.obj_name.clone(),
            tenant: op.tenant.clone(),
            uuid: op.uuid.clone(),
            vs_key: vs_key.clone(),
            vs_uuid,
            error,
        }
    }
}

/// Result of one reconcile pass
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncOutcome {
    /// Remote side matches the graph
    Converged,
    /// Tombstone applied, model forgotten
    Removed,
    Failed(FailedOp),
    /// Sync is off for good (no usable remote client)
    Disabled,
}

impl SyncOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncOutcome::Converged => "converged",
            SyncOutcome::Removed => "removed",
            SyncOutcome::Failed(_) => "failed",
            SyncOutcome::Disabled => "disabled",
        }
    }
}

pub struct Reconciler {
    store: Arc<ModelStore>,
    cache: Arc<ControllerCache>,
    clients: ClientPool,
    payloads: PayloadContext,
    states: ModelStates,
    status: Option<StatusSender>,
    disabled: AtomicBool,
}

impl Reconciler {
    /// An empty client pool disables sync from the start
    pub fn new(
        store: Arc<ModelStore>,
        cache: Arc<ControllerCache>,
        clients: ClientPool,
        payloads: PayloadContext,
    ) -> Self {
        let reconciler = Self {
            store,
            cache,
            clients,
            payloads,
            states: ModelStates::new(),
            status: None,
            disabled: AtomicBool::new(false),
        };
        if reconciler.clients.is_empty() {
            reconciler.disable("no remote client configured");
        }
        reconciler
    }

    /// Emit status events on `tx`
    pub fn with_status(mut self, tx: StatusSender) -> Self {
        self.status = Some(tx);
        self
    }

    pub fn store(&self) -> &Arc<ModelStore> {
        &self.store
    }

    pub fn cache(&self) -> &Arc<ControllerCache> {
        &self.cache
    }

    pub fn clients(&self) -> &ClientPool {
        &self.clients
    }

    pub fn states(&self) -> &ModelStates {
        &self.states
    }

    pub fn is_disabled(&self) -> bool {
        self.disabled.load(Ordering::Acquire)
    }

    /// Turn sync off permanently
    pub fn disable(&self, reason: &str) {
        if !self.disabled.swap(true, Ordering::AcqRel) {
            error!("Sync disabled: {}", reason);
        }
    }

    /// Bring the remote side of one model in line with its stored graph
    pub async fn reconcile(&self, model: &str) -> SyncOutcome {
        if self.is_disabled() {
            self.states.set(model, SyncState::Disabled);
            return SyncOutcome::Disabled;
        }
        let Some(snapshot) = self.store.get_copy(model) else {
            debug!(model = %model, "Not in the model store, nothing to do");
            return SyncOutcome::Converged;
        };
        let Some(client) = self.clients.for_model(model) else {
            self.disable("client pool is empty");
            self.states.set(model, SyncState::Disabled);
            return SyncOutcome::Disabled;
        };

        self.states.set(model, SyncState::Syncing);
        let started = Instant::now();
        let outcome = match &snapshot.graph {
            None => self.remove_model(client.as_ref(), model).await,
            Some(graph) => match graph.vrf() {
                Some(vrf) => self.sync_vrf(client.as_ref(), model, vrf).await,
                None => self.apply_graph(client.as_ref(), model, graph).await,
            },
        };
        record_reconcile("reconcile", outcome.as_str(), started.elapsed().as_secs_f64());

        match &outcome {
            SyncOutcome::Converged => self.states.set(model, SyncState::Idle),
            SyncOutcome::Removed => self.states.forget(model),
            SyncOutcome::Disabled => self.states.set(model, SyncState::Disabled),
            SyncOutcome::Failed(failed) => {
                warn!(model = %model, "Reconcile stopped at {} {} {}: {}", failed.method, failed.obj_type, failed.obj_name, failed.error);
            }
        }
        outcome
    }

    /// Whether the cache already reflects the model's stored state
    pub fn is_converged(&self, model: &str) -> bool {
        let Some(snapshot) = self.store.get_copy(model) else {
            return true;
        };
        let Some(graph) = snapshot.graph else {
            return false;
        };
        if let Some(vrf) = graph.vrf() {
            return self
                .cache
                .vrfs
                .get(&vrf.key())
                .map(|e| e.checksum == Some(vrf.checksum))
                .unwrap_or(false);
        }
        let all_applied = graph.virtual_services().all(|vs| {
            let vs_applied = self
                .cache
                .virtual_services
                .get(&vs.key())
                .map(|e| e.uuid.is_some() && e.checksum == Some(vs.checksum))
                .unwrap_or(false);
            vs_applied
                && CHILD_TYPES.into_iter().all(|obj_type| {
                    let Some(child_cache) = self.cache.children(obj_type) else {
                        return true;
                    };
                    desired_children(vs, obj_type).iter().all(|key| {
                        let want = child_checksum(&graph, obj_type, key);
                        want.is_none() || child_cache.get(key).map(|c| c.checksum) == Some(want)
                    })
                })
        });
        let no_stale_children = graph
            .top_vs()
            .map(|top| {
                cached_sni_children(&self.cache, &top.key())
                    .iter()
                    .all(|k| graph.vs(k).is_some())
            })
            .unwrap_or(true);
        all_applied && no_stale_children
    }

    // =========================================================================
    // Graph path
    // =========================================================================

    async fn apply_graph(&self, client: &dyn RemoteClient, model: &str, graph: &ObjectGraph) -> SyncOutcome {
        match self.apply_graph_batches(client, model, graph).await {
            Ok(()) => SyncOutcome::Converged,
            Err(failed) => SyncOutcome::Failed(failed),
        }
    }

    async fn apply_graph_batches(
        &self,
        client: &dyn RemoteClient,
        model: &str,
        graph: &ObjectGraph,
    ) -> Result<(), FailedOp> {
        let Some(top) = graph.top_vs() else {
            warn!(model = %model, "Graph has no virtual service, nothing to apply");
            return Ok(());
        };
        let top_key = top.key();

        // each batch is planned right before it runs, against the cache as
        // the previous batch left it
        let batch = plan_vs(&self.cache, &self.payloads, graph, top);
        self.run_batch(client, model, &top_key, batch).await?;

        for child in graph.sni_children(top) {
            let batch = plan_vs(&self.cache, &self.payloads, graph, child);
            self.run_batch(client, model, &top_key, batch).await?;
        }

        for stale in cached_sni_children(&self.cache, &top_key) {
            if graph.vs(&stale).is_some() {
                continue;
            }
            info!(model = %model, "Removing SNI child {}", stale);
            let batch = plan_cascade(&self.cache, &stale, |t, k| graph_has(graph, t, k));
            self.run_batch(client, model, &top_key, batch).await?;
        }
        Ok(())
    }

    // =========================================================================
    // Tombstone path
    // =========================================================================

    async fn remove_model(&self, client: &dyn RemoteClient, model: &str) -> SyncOutcome {
        let top_key = match model.parse::<ModelKey>() {
            Ok(key) => key.vs_key(),
            Err(e) => {
                warn!("Dropping tombstone: {}", e);
                self.store.remove_tombstone(model);
                return SyncOutcome::Removed;
            }
        };

        // children reference their parent, so they go first
        let mut batches: Vec<VsBatch> = cached_sni_children(&self.cache, &top_key)
            .iter()
            .map(|child| plan_cascade(&self.cache, child, |_, _| false))
            .collect();
        batches.push(plan_cascade(&self.cache, &top_key, |_, _| false));

        for batch in batches {
            if let Err(failed) = self.run_batch(client, model, &top_key, batch).await {
                return SyncOutcome::Failed(failed);
            }
        }
        self.store.remove_tombstone(model);
        info!(model = %model, "Model removed");
        SyncOutcome::Removed
    }

    // =========================================================================
    // VRF path
    // =========================================================================

    async fn sync_vrf(&self, client: &dyn RemoteClient, model: &str, vrf: &VrfNode) -> SyncOutcome {
        let key = vrf.key();
        let entry = match self.cache.vrfs.get(&key) {
            Some(entry) => entry,
            None => match self.lookup_vrf(client, &key).await {
                Ok(Some(entry)) => entry,
                Ok(None) => {
                    error!(model = %model, "VRF context {} does not exist remotely and is never created", key);
                    let op = RestOp::update(ObjType::Vrf, &key.namespace, &key.name, "", Value::Null);
                    return SyncOutcome::Failed(FailedOp::from_op(
                        model,
                        &op,
                        &key,
                        None,
                        RemoteError::Malformed(format!("VRF context {} is missing", key)),
                    ));
                }
                Err(e) => {
                    let op = RestOp::update(ObjType::Vrf, &key.namespace, &key.name, "", Value::Null);
                    return SyncOutcome::Failed(FailedOp::from_op(model, &op, &key, None, e));
                }
            },
        };
        if entry.checksum == Some(vrf.checksum) {
            debug!(model = %model, "VRF {} unchanged", key);
            return SyncOutcome::Converged;
        }

        let payload = vrf_payload(&self.payloads, vrf);
        let batch = VsBatch {
            owner: key.clone(),
            ops: vec![RestOp::update(ObjType::Vrf, &key.namespace, &key.name, &entry.uuid, payload)],
            desired: None,
        };
        match self.run_batch(client, model, &key, batch).await {
            Ok(()) => SyncOutcome::Converged,
            Err(failed) => SyncOutcome::Failed(failed),
        }
    }

    async fn lookup_vrf(&self, client: &dyn RemoteClient, key: &ObjKey) -> Result<Option<ChildCacheEntry>, RemoteError> {
        let path = format!("{}?name={}", ObjType::Vrf.collection_path(), key.name);
        let listing = client.get(&path).await?;
        let found = listing
            .get("results")
            .and_then(Value::as_array)
            .and_then(|r| r.first())
            .and_then(parse_identity);
        let Some((name, uuid, checksum)) = found else {
            return Ok(None);
        };
        let entry = ChildCacheEntry {
            name,
            tenant: key.namespace.clone(),
            uuid,
            checksum,
        };
        self.cache.vrfs.upsert(key.clone(), entry.clone());
        Ok(Some(entry))
    }

    // =========================================================================
    // Execution
    // =========================================================================

    async fn run_batch(
        &self,
        client: &dyn RemoteClient,
        model: &str,
        top_key: &ObjKey,
        mut batch: VsBatch,
    ) -> Result<(), FailedOp> {
        if batch.is_empty() {
            fold_batch(&self.cache, &batch, model, top_key, self.status.as_ref(), true);
            return Ok(());
        }
        debug!(model = %model, "Applying {} op(s) for {}", batch.ops.len(), batch.owner);

        let all_succeeded = execute_batch(client, &mut batch.ops).await;
        fold_batch(&self.cache, &batch, model, top_key, self.status.as_ref(), all_succeeded);
        if all_succeeded {
            return Ok(());
        }

        let vs_uuid = self
            .cache
            .virtual_services
            .get(&batch.owner)
            .and_then(|e| e.uuid);
        let failed = batch
            .ops
            .iter()
            .find_map(|op| match &op.error {
                Some(RemoteError::Aborted) | None => None,
                Some(e) => Some(FailedOp::from_op(model, op, &batch.owner, vs_uuid.clone(), e.clone())),
            });
        match failed {
            Some(failed) => Err(failed),
            // execute_batch reports failure only with a failed op
            None => Ok(()),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;
    use crate::config::SyncConfig;
    use crate::graph::nodes::{GraphNode, PoolGroupMember, PoolGroupNode, PoolNode, PoolServer, VipNode, VsNode};
    use crate::remote::InMemoryController;
    use crate::rest::status::{status_channel, StatusEvent};

    fn key(name: &str) -> ObjKey {
        ObjKey::new("admin", name)
    }

    struct Harness {
        controller: Arc<InMemoryController>,
        store: Arc<ModelStore>,
        cache: Arc<ControllerCache>,
        reconciler: Reconciler,
    }

    fn harness() -> Harness {
        let controller = Arc::new(InMemoryController::new("admin"));
        let store = Arc::new(ModelStore::new(10));
        let cache = Arc::new(ControllerCache::new("admin", "lbsync", 100));
        let reconciler = Reconciler::new(
            store.clone(),
            cache.clone(),
            ClientPool::shared(controller.clone(), 2),
            PayloadContext::from_config(&SyncConfig::default()),
        );
        Harness {
            controller,
            store,
            cache,
            reconciler,
        }
    }

    fn l4_graph(servers: &[&str]) -> ObjectGraph {
        let mut graph = ObjectGraph::new("admin", "vs");
        let mut vs = VsNode::new("admin", "vs");
        vs.application_profile = "System-L4-Application".into();
        let vip = VipNode {
            name: "vs-vip".into(),
            tenant: "admin".into(),
            fqdns: vec![],
            vrf_context: "global".into(),
            east_west: false,
            checksum: 0,
        };
        vs.vip_refs.push(vip.key());
        let mut pool = PoolNode::new("admin", "vs-pool");
        pool.servers = servers.iter().map(|ip| PoolServer::new(*ip, 8080)).collect();
        let mut pg = PoolGroupNode::new("admin", "vs-pg");
        pg.members.push(PoolGroupMember {
            pool: pool.key(),
            priority_label: None,
        });
        vs.pool_refs.push(pool.key());
        vs.pool_group_refs.push(pg.key());
        graph.add_node(GraphNode::Vip(vip));
        graph.add_node(GraphNode::Pool(pool));
        graph.add_node(GraphNode::PoolGroup(pg));
        graph.add_node(GraphNode::VirtualService(vs));
        graph.finalize();
        graph
    }

    #[tokio::test]
    async fn test_create_then_noop() {
        let h = harness();
        h.store.save("admin/vs", Some(l4_graph(&["10.0.0.1"])));

        assert_eq!(h.reconciler.reconcile("admin/vs").await, SyncOutcome::Converged);
        assert_eq!(
            h.controller.take_calls(),
            vec![
                "POST vsvip/vs-vip",
                "POST pool/vs-pool",
                "POST poolgroup/vs-pg",
                "POST virtualservice/vs",
            ]
        );
        assert!(h.reconciler.is_converged("admin/vs"));
        assert_eq!(h.reconciler.states().get("admin/vs"), SyncState::Idle);

        assert_eq!(h.reconciler.reconcile("admin/vs").await, SyncOutcome::Converged);
        assert!(h.controller.take_calls().is_empty(), "second pass must be a no-op");
    }

    #[tokio::test]
    async fn test_server_change_updates_pool_and_vs_only() {
        let h = harness();
        h.store.save("admin/vs", Some(l4_graph(&["10.0.0.1"])));
        h.reconciler.reconcile("admin/vs").await;
        h.controller.take_calls();

        h.store.save("admin/vs", Some(l4_graph(&["10.0.0.1", "10.0.0.2"])));
        assert_eq!(h.reconciler.reconcile("admin/vs").await, SyncOutcome::Converged);
        assert_eq!(
            h.controller.take_calls(),
            vec!["PUT pool/vs-pool", "PUT virtualservice/vs"]
        );
    }

    #[tokio::test]
    async fn test_tombstone_removes_everything() {
        let h = harness();
        let (tx, mut rx) = status_channel();
        let reconciler = Reconciler::new(
            h.store.clone(),
            h.cache.clone(),
            ClientPool::shared(h.controller.clone(), 1),
            PayloadContext::from_config(&SyncConfig::default()),
        )
        .with_status(tx);

        h.store.save("admin/vs", Some(l4_graph(&["10.0.0.1"])));
        reconciler.reconcile("admin/vs").await;
        assert!(matches!(rx.try_recv().unwrap(), StatusEvent::Applied { .. }));

        h.store.save("admin/vs", None);
        assert!(!reconciler.is_converged("admin/vs"));
        assert_eq!(reconciler.reconcile("admin/vs").await, SyncOutcome::Removed);
        assert!(matches!(rx.try_recv().unwrap(), StatusEvent::Removed { .. }));

        assert_eq!(h.controller.count(ObjType::VirtualService), 0);
        assert_eq!(h.controller.count(ObjType::Pool), 0);
        assert_eq!(h.controller.count(ObjType::Vip), 0);
        assert!(h.cache.virtual_services.is_empty());
        assert!(h.cache.pools.is_empty());
        assert!(h.store.get_copy("admin/vs").is_none(), "tombstone cleared");
    }

    #[tokio::test]
    async fn test_failure_reports_first_failed_op() {
        let h = harness();
        h.controller.fail_next(RestMethod::Post, ObjType::PoolGroup, 503);
        h.store.save("admin/vs", Some(l4_graph(&["10.0.0.1"])));

        let SyncOutcome::Failed(failed) = h.reconciler.reconcile("admin/vs").await else {
            panic!("expected failure");
        };
        assert_eq!(failed.obj_type, ObjType::PoolGroup);
        assert_eq!(failed.error.code(), Some(503));
        assert_eq!(failed.vs_key, key("vs"));
        assert!(failed.vs_uuid.is_none());

        // pool create succeeded and is tracked under a hollow entry
        let hollow = h.cache.virtual_services.get(&key("vs")).unwrap();
        assert!(hollow.uuid.is_none());
        assert!(hollow.pools.contains(&key("vs-pool")));
        assert!(!h.reconciler.is_converged("admin/vs"));

        // next pass picks up where it stopped
        h.controller.take_calls();
        assert_eq!(h.reconciler.reconcile("admin/vs").await, SyncOutcome::Converged);
        assert_eq!(
            h.controller.take_calls(),
            vec!["POST poolgroup/vs-pg", "POST virtualservice/vs"]
        );
    }

    #[tokio::test]
    async fn test_empty_pool_disables_sync() {
        let store = Arc::new(ModelStore::new(10));
        let cache = Arc::new(ControllerCache::new("admin", "lbsync", 100));
        let reconciler = Reconciler::new(
            store.clone(),
            cache,
            ClientPool::new(Vec::new()),
            PayloadContext::from_config(&SyncConfig::default()),
        );
        store.save("admin/vs", Some(l4_graph(&["10.0.0.1"])));
        assert!(reconciler.is_disabled());
        assert_eq!(reconciler.reconcile("admin/vs").await, SyncOutcome::Disabled);
        assert_eq!(reconciler.states().get("admin/vs"), SyncState::Disabled);
    }
}
