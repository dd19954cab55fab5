//! L4 graphs: one dedicated virtual service per LoadBalancer Service

use std::collections::BTreeSet;

use k8s_openapi::api::core::v1::Service;

use super::backends::{backend_for_port, is_load_balancer, service_ports};
use super::builder::{BuiltModel, Naming};
use super::nodes::{
    GraphNode, PoolGroupMember, PoolGroupNode, PoolNode, PortProtocol, ServiceMetadata, VipNode,
    VsNode,
};
use super::object_graph::ObjectGraph;
use crate::apis::cluster::ClusterState;
use crate::keys::{ObjKey, SourceKey, SourceKind};

const L4_APP_PROFILE: &str = "System-L4-Application";
const TCP_NETWORK_PROFILE: &str = "System-TCP-Proxy";
const UDP_NETWORK_PROFILE: &str = "System-UDP-Fast-Path";

/// Build the graph for Service `namespace/name`.
///
/// A missing Service, or one no longer of type LoadBalancer, builds nothing,
/// which tombstones any graph built earlier.
pub fn build_l4_model(cluster: &dyn ClusterState, naming: &Naming, namespace: &str, name: &str) -> BuiltModel {
    let model_name = naming.model_name(&naming.l4_vs_name(namespace, name));
    let Some(svc) = cluster.service(namespace, name) else {
        return BuiltModel::empty(model_name);
    };
    if !is_load_balancer(&svc) {
        return BuiltModel::empty(model_name);
    }

    let graph = l4_graph(cluster, naming, &svc, namespace, name);
    BuiltModel {
        model_name,
        graph: Some(graph),
        sources: BTreeSet::from([SourceKey::new(SourceKind::Service, namespace, name)]),
        ingresses: Vec::new(),
        host_rules: Vec::new(),
    }
}

fn l4_graph(cluster: &dyn ClusterState, naming: &Naming, svc: &Service, namespace: &str, name: &str) -> ObjectGraph {
    let tenant = naming.tenant.as_str();
    let vs_name = naming.l4_vs_name(namespace, name);
    let metadata = ServiceMetadata::for_service(ObjKey::new(namespace, name));

    let mut graph = ObjectGraph::new(tenant, vs_name.clone());
    let mut vs = VsNode::new(tenant, vs_name.clone());
    vs.application_profile = L4_APP_PROFILE.to_string();
    vs.vrf_context = naming.vrf.clone();
    vs.service_metadata = metadata.clone();

    let vip = VipNode {
        name: format!("{}-vip", vs_name),
        tenant: tenant.to_string(),
        fqdns: Vec::new(),
        vrf_context: naming.vrf.clone(),
        east_west: false,
        checksum: 0,
    };
    vs.vip_refs.push(vip.key());

    let mut children = Vec::new();
    let mut all_udp = true;
    for port in service_ports(svc) {
        let backend = backend_for_port(cluster, svc, &port);
        all_udp &= backend.protocol == "UDP";

        let pg_name = format!("{}-l4-{}", vs_name, backend.port);
        let mut pool = PoolNode::new(tenant, format!("{}-pool", pg_name));
        pool.protocol = backend.protocol.clone();
        pool.port = backend.port;
        pool.target_port = backend.target_port;
        pool.servers = backend.servers;
        pool.service_metadata = metadata.clone();
        pool.vrf_context = naming.vrf.clone();

        let mut pg = PoolGroupNode::new(tenant, pg_name);
        pg.members.push(PoolGroupMember {
            pool: pool.key(),
            priority_label: None,
        });

        vs.ports.push(PortProtocol::new(backend.port, backend.protocol, false));
        vs.pool_refs.push(pool.key());
        vs.pool_group_refs.push(pg.key());
        children.push(GraphNode::PoolGroup(pg));
        children.push(GraphNode::Pool(pool));
    }
    vs.network_profile = if all_udp && !vs.ports.is_empty() {
        UDP_NETWORK_PROFILE.to_string()
    } else {
        TCP_NETWORK_PROFILE.to_string()
    };

    graph.add_node(GraphNode::VirtualService(vs));
    graph.add_node(GraphNode::Vip(vip));
    for child in children {
        graph.add_node(child);
    }
    graph.finalize();
    graph
}
