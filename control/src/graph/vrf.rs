//! VRF graph: static routes from every node's pod CIDR to its InternalIP

use std::collections::BTreeSet;

use k8s_openapi::api::core::v1::Node;
use kube::ResourceExt;
use tracing::debug;

use super::builder::{BuiltModel, Naming};
use super::nodes::{GraphNode, StaticRoute, VrfNode};
use super::object_graph::ObjectGraph;
use crate::apis::cluster::ClusterState;

fn internal_ip(node: &Node) -> Option<String> {
    node.status
        .as_ref()?
        .addresses
        .as_ref()?
        .iter()
        .find(|a| a.type_ == "InternalIP")
        .map(|a| a.address.clone())
}

fn pod_cidrs(node: &Node) -> Vec<String> {
    let Some(spec) = node.spec.as_ref() else {
        return Vec::new();
    };
    match (&spec.pod_cidrs, &spec.pod_cidr) {
        (Some(cidrs), _) if !cidrs.is_empty() => cidrs.clone(),
        (_, Some(cidr)) => vec![cidr.clone()],
        _ => Vec::new(),
    }
}

/// Build the VRF model. It always exists; a cluster without routable nodes
/// yields an empty route list.
pub fn build_vrf_model(cluster: &dyn ClusterState, naming: &Naming) -> BuiltModel {
    let mut nodes = cluster.nodes();
    nodes.sort_by_key(|n| n.name_any());

    let mut routes = Vec::new();
    for node in &nodes {
        let Some(next_hop) = internal_ip(node) else {
            debug!("Node {} has no InternalIP yet, no route", node.name_any());
            continue;
        };
        for prefix in pod_cidrs(node) {
            routes.push(StaticRoute {
                route_id: (routes.len() + 1).to_string(),
                prefix,
                next_hop: next_hop.clone(),
            });
        }
    }

    let mut graph = ObjectGraph::new(naming.tenant.as_str(), naming.vrf.clone());
    graph.add_node(GraphNode::Vrf(VrfNode {
        name: naming.vrf.clone(),
        tenant: naming.tenant.clone(),
        static_routes: routes,
        checksum: 0,
    }));
    graph.finalize();

    BuiltModel {
        model_name: naming.vrf_model_name(),
        graph: Some(graph),
        sources: BTreeSet::new(),
        ingresses: Vec::new(),
        host_rules: Vec::new(),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;
    use crate::apis::cluster::ClusterStore;
    use crate::config::SyncConfig;
    use k8s_openapi::api::core::v1::{NodeAddress, NodeSpec, NodeStatus};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    fn node(name: &str, ip: &str, cidr: &str) -> Node {
        Node {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                ..Default::default()
            },
            spec: Some(NodeSpec {
                pod_cidr: Some(cidr.to_string()),
                ..Default::default()
            }),
            status: Some(NodeStatus {
                addresses: Some(vec![NodeAddress {
                    address: ip.to_string(),
                    type_: "InternalIP".to_string(),
                }]),
                ..Default::default()
            }),
        }
    }

    #[test]
    fn test_routes_are_ordered_by_node_name() {
        let store = ClusterStore::new();
        store.apply_node(node("worker-2", "192.168.0.2", "10.244.2.0/24"));
        store.apply_node(node("worker-1", "192.168.0.1", "10.244.1.0/24"));

        let naming = Naming::from_config(&SyncConfig::default());
        let built = build_vrf_model(&store, &naming);
        assert_eq!(built.model_name, "admin/global");

        let graph = built.graph.unwrap();
        let vrf = graph.vrf().unwrap();
        assert_eq!(vrf.static_routes.len(), 2);
        assert_eq!(vrf.static_routes[0].route_id, "1");
        assert_eq!(vrf.static_routes[0].next_hop, "192.168.0.1");
        assert_eq!(vrf.static_routes[1].prefix, "10.244.2.0/24");
    }

    #[test]
    fn test_node_without_address_gets_no_route() {
        let store = ClusterStore::new();
        let mut pending = node("worker-1", "192.168.0.1", "10.244.1.0/24");
        pending.status = None;
        store.apply_node(pending);

        let naming = Naming::from_config(&SyncConfig::default());
        let graph = build_vrf_model(&store, &naming).graph.unwrap();
        assert!(graph.vrf().unwrap().static_routes.is_empty());
        assert!(graph.is_vrf());
    }
}
