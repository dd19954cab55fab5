//! Graph ↔ cache diff into ordered remote operations
//!
//! ```text
//! one batch per virtual service
//!   1. child creates/updates   VIP → pool → pool group → data script → cert
//!   2. VS create/update        only when its checksum moved
//!   3. stale child deletes     data script → pool group → pool → cert → VIP
//!
//! cascade (VS leaving)
//!   VS delete, then every child it owned, in delete order
//! ```
//!
//! Create vs update is decided against the child caches by key, not against
//! the owning VS entry, so an object left behind by an interrupted create is
//! updated instead of re-posted.

use std::collections::BTreeMap;

use serde_json::Value;
use tracing::{debug, warn};

use super::builders::{
    cert_payload, datascript_payload, pool_group_payload, pool_payload, vip_payload, vs_payload,
    PayloadContext,
};
use crate::cache::{ControllerCache, CHILD_TYPES};
use crate::graph::nodes::VsNode;
use crate::graph::ObjectGraph;
use crate::keys::ObjKey;
use crate::remote::{ObjType, RestOp};

/// Child types in delete order
pub const DELETE_ORDER: [ObjType; 5] = [
    ObjType::DataScript,
    ObjType::PoolGroup,
    ObjType::Pool,
    ObjType::SslCert,
    ObjType::Vip,
];

/// Operations for one virtual service
#[derive(Debug, Clone)]
pub struct VsBatch {
    /// VS every child op in the batch belongs to
    pub owner: ObjKey,
    pub ops: Vec<RestOp>,
    /// Children the graph wants under `owner`, per type; `None` for a cascade
    pub desired: Option<BTreeMap<ObjType, Vec<ObjKey>>>,
}

impl VsBatch {
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

/// Child keys a VS node references, per type
pub fn desired_children(vs: &VsNode, obj_type: ObjType) -> Vec<ObjKey> {
    match obj_type {
        ObjType::Vip => vs.vip_refs.clone(),
        ObjType::Pool => vs.pool_refs.clone(),
        ObjType::PoolGroup => {
            let mut keys = vs.pool_group_refs.clone();
            if let Some(default) = &vs.default_pool_group {
                if !keys.contains(default) {
                    keys.push(default.clone());
                }
            }
            keys
        }
        ObjType::DataScript => vs.datascript_refs.clone(),
        ObjType::SslCert => vs.ssl_cert_refs.clone(),
        ObjType::VirtualService | ObjType::Vrf => Vec::new(),
    }
}

/// Whether any VS of the graph still uses the object
pub fn graph_has(graph: &ObjectGraph, obj_type: ObjType, key: &ObjKey) -> bool {
    match obj_type {
        ObjType::Vip => graph.vip(key).is_some(),
        ObjType::Pool => graph.pool(key).is_some(),
        ObjType::PoolGroup => graph.pool_group(key).is_some(),
        ObjType::DataScript => graph.datascript(key).is_some(),
        ObjType::SslCert => graph.tls_cert(key).is_some(),
        ObjType::VirtualService => graph.vs(key).is_some(),
        ObjType::Vrf => graph.vrf().is_some(),
    }
}

/// Checksum the graph wants for a child object
pub fn child_checksum(graph: &ObjectGraph, obj_type: ObjType, key: &ObjKey) -> Option<u32> {
    match obj_type {
        ObjType::Vip => graph.vip(key).map(|n| n.checksum),
        ObjType::Pool => graph.pool(key).map(|n| n.checksum),
        ObjType::PoolGroup => graph.pool_group(key).map(|n| n.checksum),
        ObjType::DataScript => graph.datascript(key).map(|n| n.checksum),
        ObjType::SslCert => graph.tls_cert(key).map(|n| n.checksum),
        ObjType::VirtualService | ObjType::Vrf => None,
    }
}

fn child_payload(
    ctx: &PayloadContext,
    graph: &ObjectGraph,
    obj_type: ObjType,
    key: &ObjKey,
) -> Option<(Value, u32)> {
    match obj_type {
        ObjType::Vip => graph.vip(key).map(|n| (vip_payload(ctx, n), n.checksum)),
        ObjType::Pool => graph.pool(key).map(|n| (pool_payload(ctx, n), n.checksum)),
        ObjType::PoolGroup => graph
            .pool_group(key)
            .map(|n| (pool_group_payload(ctx, n), n.checksum)),
        ObjType::DataScript => graph
            .datascript(key)
            .map(|n| (datascript_payload(ctx, n), n.checksum)),
        ObjType::SslCert => graph.tls_cert(key).map(|n| (cert_payload(ctx, n), n.checksum)),
        ObjType::VirtualService | ObjType::Vrf => None,
    }
}

/// Diff one VS node and its children against the cache
pub fn plan_vs(
    cache: &ControllerCache,
    ctx: &PayloadContext,
    graph: &ObjectGraph,
    vs: &VsNode,
) -> VsBatch {
    let owner = vs.key();
    let cached = cache.virtual_services.get(&owner);
    let mut ops = Vec::new();
    let mut desired = BTreeMap::new();

    for obj_type in CHILD_TYPES {
        let Some(child_cache) = cache.children(obj_type) else {
            continue;
        };
        let keys = desired_children(vs, obj_type);
        for key in &keys {
            let Some((payload, checksum)) = child_payload(ctx, graph, obj_type, key) else {
                warn!("{} references {} {} which is not in its graph", owner, obj_type, key);
                continue;
            };
            match child_cache.get(key) {
                Some(entry) if entry.checksum == Some(checksum) => {}
                Some(entry) => ops.push(RestOp::update(obj_type, &key.namespace, &key.name, &entry.uuid, payload)),
                None => ops.push(RestOp::create(obj_type, &key.namespace, &key.name, payload)),
            }
        }
        desired.insert(obj_type, keys);
    }

    let vs_uuid = cached.as_ref().and_then(|c| c.uuid.clone());
    match vs_uuid {
        Some(uuid) if cached.as_ref().and_then(|c| c.checksum) == Some(vs.checksum) => {
            debug!("{} unchanged ({})", owner, uuid);
        }
        Some(uuid) => ops.push(RestOp::update(
            ObjType::VirtualService,
            &vs.tenant,
            &vs.name,
            &uuid,
            vs_payload(ctx, vs),
        )),
        None => ops.push(RestOp::create(
            ObjType::VirtualService,
            &vs.tenant,
            &vs.name,
            vs_payload(ctx, vs),
        )),
    }

    if let Some(cached) = &cached {
        for obj_type in DELETE_ORDER {
            let (Some(owned), Some(child_cache)) = (cached.children(obj_type), cache.children(obj_type)) else {
                continue;
            };
            for key in owned.iter() {
                if graph_has(graph, obj_type, key) {
                    continue;
                }
                if let Some(entry) = child_cache.get(key) {
                    ops.push(RestOp::delete(obj_type, &key.namespace, &key.name, &entry.uuid));
                }
            }
        }
    }

    VsBatch {
        owner,
        ops,
        desired: Some(desired),
    }
}

/// Delete a cached VS and every child it owns.
///
/// Children for which `keep` answers true are left alone (another VS of the
/// same graph took them over).
pub fn plan_cascade<F>(cache: &ControllerCache, key: &ObjKey, keep: F) -> VsBatch
where
    F: Fn(ObjType, &ObjKey) -> bool,
{
    let mut ops = Vec::new();
    if let Some(entry) = cache.virtual_services.get(key) {
        if let Some(uuid) = &entry.uuid {
            ops.push(RestOp::delete(ObjType::VirtualService, &key.namespace, &key.name, uuid));
        }
        for obj_type in DELETE_ORDER {
            let (Some(owned), Some(child_cache)) = (entry.children(obj_type), cache.children(obj_type)) else {
                continue;
            };
            for child in owned.iter().filter(|c| !keep(obj_type, c)) {
                if let Some(c) = child_cache.get(child) {
                    ops.push(RestOp::delete(obj_type, &child.namespace, &child.name, &c.uuid));
                }
            }
        }
    }
    VsBatch {
        owner: key.clone(),
        ops,
        desired: None,
    }
}

/// Keys of the SNI children a cached parent tracks
pub fn cached_sni_children(cache: &ControllerCache, parent: &ObjKey) -> Vec<ObjKey> {
    let Some(entry) = cache.virtual_services.get(parent) else {
        return Vec::new();
    };
    entry
        .sni_children
        .iter()
        .filter_map(|uuid| {
            let key = cache.virtual_services.get_key_by_uuid(uuid);
            if key.is_none() {
                debug!("SNI child {} of {} is not mirrored", uuid, parent);
            }
            key
        })
        .collect()
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;
    use crate::cache::{ChildCacheEntry, VsCacheEntry};
    use crate::config::SyncConfig;
    use crate::graph::nodes::{GraphNode, PoolGroupMember, PoolGroupNode, PoolNode, PoolServer, VipNode};
    use crate::remote::RestMethod;

    fn key(name: &str) -> ObjKey {
        ObjKey::new("admin", name)
    }

    fn ctx() -> PayloadContext {
        PayloadContext::from_config(&SyncConfig::default())
    }

    fn graph(pools: &[&str]) -> ObjectGraph {
        let mut graph = ObjectGraph::new("admin", "vs");
        let mut vs = VsNode::new("admin", "vs");
        let vip = VipNode {
            name: "vs-vip".into(),
            tenant: "admin".into(),
            fqdns: vec![],
            vrf_context: "global".into(),
            east_west: false,
            checksum: 0,
        };
        vs.vip_refs.push(vip.key());
        graph.add_node(GraphNode::Vip(vip));

        let mut pg = PoolGroupNode::new("admin", "vs-pg");
        for name in pools {
            let mut pool = PoolNode::new("admin", *name);
            pool.servers.push(PoolServer::new("10.0.0.1", 80));
            pg.members.push(PoolGroupMember {
                pool: pool.key(),
                priority_label: None,
            });
            vs.pool_refs.push(pool.key());
            graph.add_node(GraphNode::Pool(pool));
        }
        vs.pool_group_refs.push(pg.key());
        graph.add_node(GraphNode::PoolGroup(pg));
        graph.add_node(GraphNode::VirtualService(vs));
        graph.finalize();
        graph
    }

    fn mirror(cache: &ControllerCache, graph: &ObjectGraph) {
        let vs = graph.top_vs().unwrap();
        let mut entry = VsCacheEntry::new(&vs.key());
        entry.uuid = Some("virtualservice-1".into());
        entry.checksum = Some(vs.checksum);
        for node in graph.nodes() {
            let (obj_type, k) = match node {
                GraphNode::Pool(p) => (ObjType::Pool, p.key()),
                GraphNode::PoolGroup(p) => (ObjType::PoolGroup, p.key()),
                GraphNode::Vip(v) => (ObjType::Vip, v.key()),
                _ => continue,
            };
            cache.children(obj_type).unwrap().upsert(
                k.clone(),
                ChildCacheEntry {
                    name: k.name.clone(),
                    tenant: "admin".into(),
                    uuid: format!("{}-{}", obj_type, k.name),
                    checksum: Some(node.checksum()),
                },
            );
            entry.children_mut(obj_type).unwrap().insert(k);
        }
        cache.virtual_services.upsert(vs.key(), entry);
    }

    fn summary(batch: &VsBatch) -> Vec<String> {
        batch
            .ops
            .iter()
            .map(|op| format!("{} {}", op.method, op.obj_name))
            .collect()
    }

    #[test]
    fn test_absent_vs_creates_everything_children_first() {
        let cache = ControllerCache::new("admin", "lbsync", 100);
        let g = graph(&["p1"]);
        let batch = plan_vs(&cache, &ctx(), &g, g.top_vs().unwrap());
        assert_eq!(
            summary(&batch),
            vec!["POST vs-vip", "POST p1", "POST vs-pg", "POST vs"]
        );
    }

    #[test]
    fn test_converged_graph_plans_nothing() {
        let cache = ControllerCache::new("admin", "lbsync", 100);
        let g = graph(&["p1"]);
        mirror(&cache, &g);
        let batch = plan_vs(&cache, &ctx(), &g, g.top_vs().unwrap());
        assert!(batch.is_empty(), "unexpected ops: {:?}", summary(&batch));
    }

    #[test]
    fn test_removed_pool_is_deleted_after_parent_update() {
        let cache = ControllerCache::new("admin", "lbsync", 100);
        mirror(&cache, &graph(&["p1", "p2"]));

        let g = graph(&["p1"]);
        let batch = plan_vs(&cache, &ctx(), &g, g.top_vs().unwrap());
        assert_eq!(summary(&batch), vec!["PUT vs-pg", "PUT vs", "DELETE p2"]);
        assert_eq!(batch.ops[2].uuid.as_deref(), Some("pool-p2"));
    }

    #[test]
    fn test_child_left_by_interrupted_create_is_updated() {
        let cache = ControllerCache::new("admin", "lbsync", 100);
        cache.pools.upsert(
            key("p1"),
            ChildCacheEntry {
                name: "p1".into(),
                tenant: "admin".into(),
                uuid: "pool-old".into(),
                checksum: None,
            },
        );
        let g = graph(&["p1"]);
        let batch = plan_vs(&cache, &ctx(), &g, g.top_vs().unwrap());
        let pool_op = batch.ops.iter().find(|op| op.obj_name == "p1").unwrap();
        assert_eq!(pool_op.method, RestMethod::Put, "unknown checksum forces an update");
        assert_eq!(pool_op.uuid.as_deref(), Some("pool-old"));
    }

    #[test]
    fn test_cascade_deletes_vs_before_children() {
        let cache = ControllerCache::new("admin", "lbsync", 100);
        mirror(&cache, &graph(&["p1"]));
        let batch = plan_cascade(&cache, &key("vs"), |_, _| false);
        assert_eq!(
            summary(&batch),
            vec!["DELETE vs", "DELETE vs-pg", "DELETE p1", "DELETE vs-vip"]
        );

        let kept = plan_cascade(&cache, &key("vs"), |t, _| t == ObjType::Pool);
        assert!(!summary(&kept).contains(&"DELETE p1".to_string()));
    }
}
