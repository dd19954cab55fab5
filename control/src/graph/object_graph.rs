//! Object graph: the desired state of one model

use std::collections::HashMap;

use common::fold_unordered;

use super::nodes::{
    DataScriptNode, GraphNode, NodeKind, PoolGroupNode, PoolNode, TlsCertNode, VipNode, VrfNode,
    VsNode,
};
use crate::keys::ObjKey;

/// Ordered set of nodes making up one model, plus its aggregate checksum.
///
/// Built by the graph builder, owned by the model store, and handed to the
/// reconciler only as a copy.
#[derive(Debug, Clone, PartialEq)]
pub struct ObjectGraph {
    tenant: String,
    name: String,
    nodes: Vec<GraphNode>,
    checksum: u32,
}

impl ObjectGraph {
    pub fn new(tenant: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            tenant: tenant.into(),
            name: name.into(),
            nodes: Vec::new(),
            checksum: 0,
        }
    }

    pub fn tenant(&self) -> &str {
        &self.tenant
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn model_name(&self) -> String {
        format!("{}/{}", self.tenant, self.name)
    }

    pub fn add_node(&mut self, node: GraphNode) {
        self.nodes.push(node);
    }

    pub fn nodes(&self) -> &[GraphNode] {
        &self.nodes
    }

    pub fn checksum(&self) -> u32 {
        self.checksum
    }

    pub fn count(&self, kind: NodeKind) -> usize {
        self.nodes.iter().filter(|n| n.kind() == kind).count()
    }

    /// Compute every node checksum bottom-up, then the graph checksum.
    ///
    /// Leaves first, then SNI children (which fold their own leaves), then
    /// top-level virtual services (which fold leaves and SNI children).
    pub fn finalize(&mut self) {
        let mut computed: HashMap<(NodeKind, ObjKey), u32> = HashMap::new();

        for node in self.nodes.iter_mut() {
            let checksum = match node {
                GraphNode::Pool(n) => {
                    n.checksum = n.compute_checksum();
                    n.checksum
                }
                GraphNode::PoolGroup(n) => {
                    n.checksum = n.compute_checksum();
                    n.checksum
                }
                GraphNode::DataScript(n) => {
                    n.checksum = n.compute_checksum();
                    n.checksum
                }
                GraphNode::TlsCert(n) => {
                    n.checksum = n.compute_checksum();
                    n.checksum
                }
                GraphNode::Vip(n) => {
                    n.checksum = n.compute_checksum();
                    n.checksum
                }
                GraphNode::Vrf(n) => {
                    n.checksum = n.compute_checksum();
                    n.checksum
                }
                GraphNode::VirtualService(_) => continue,
            };
            computed.insert((node.kind(), node.key()), checksum);
        }

        for sni_pass in [true, false] {
            for node in self.nodes.iter_mut() {
                if let GraphNode::VirtualService(vs) = node {
                    if vs.is_sni_child() != sni_pass {
                        continue;
                    }
                    vs.checksum =
                        vs.compute_checksum(|kind, key| computed.get(&(kind, key.clone())).copied());
                    computed.insert((NodeKind::VirtualService, vs.key()), vs.checksum);
                }
            }
        }

        self.checksum = fold_unordered(self.nodes.iter().map(GraphNode::checksum));
    }

    // =========================================================================
    // Typed lookups
    // =========================================================================

    pub fn virtual_services(&self) -> impl Iterator<Item = &VsNode> {
        self.nodes.iter().filter_map(|n| match n {
            GraphNode::VirtualService(vs) => Some(vs),
            _ => None,
        })
    }

    /// The model's top-level virtual service
    pub fn top_vs(&self) -> Option<&VsNode> {
        self.virtual_services().find(|vs| !vs.is_sni_child())
    }

    pub fn vs(&self, key: &ObjKey) -> Option<&VsNode> {
        self.virtual_services().find(|vs| vs.name == key.name && vs.tenant == key.namespace)
    }

    pub fn sni_children<'a>(&'a self, parent: &'a VsNode) -> impl Iterator<Item = &'a VsNode> {
        parent.sni_child_refs.iter().filter_map(move |key| self.vs(key))
    }

    pub fn pool(&self, key: &ObjKey) -> Option<&PoolNode> {
        self.nodes.iter().find_map(|n| match n {
            GraphNode::Pool(p) if p.name == key.name && p.tenant == key.namespace => Some(p),
            _ => None,
        })
    }

    pub fn pool_group(&self, key: &ObjKey) -> Option<&PoolGroupNode> {
        self.nodes.iter().find_map(|n| match n {
            GraphNode::PoolGroup(p) if p.name == key.name && p.tenant == key.namespace => Some(p),
            _ => None,
        })
    }

    pub fn datascript(&self, key: &ObjKey) -> Option<&DataScriptNode> {
        self.nodes.iter().find_map(|n| match n {
            GraphNode::DataScript(d) if d.name == key.name && d.tenant == key.namespace => Some(d),
            _ => None,
        })
    }

    pub fn tls_cert(&self, key: &ObjKey) -> Option<&TlsCertNode> {
        self.nodes.iter().find_map(|n| match n {
            GraphNode::TlsCert(c) if c.name == key.name && c.tenant == key.namespace => Some(c),
            _ => None,
        })
    }

    pub fn vip(&self, key: &ObjKey) -> Option<&VipNode> {
        self.nodes.iter().find_map(|n| match n {
            GraphNode::Vip(v) if v.name == key.name && v.tenant == key.namespace => Some(v),
            _ => None,
        })
    }

    pub fn vrf(&self) -> Option<&VrfNode> {
        self.nodes.iter().find_map(|n| match n {
            GraphNode::Vrf(v) => Some(v),
            _ => None,
        })
    }

    pub fn is_vrf(&self) -> bool {
        self.vrf().is_some()
    }
}
