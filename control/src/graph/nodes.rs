//! Graph node kinds
//!
//! One variant per remote object kind. Each variant computes its checksum from
//! an explicit field list; transient data (uuids, remote status) never enters a
//! node. Parents reference children by [`ObjKey`] so a graph is plain owned
//! data that clones and diffs cheaply.
//!
//! Checksum policy: collections whose order carries no meaning (servers,
//! FQDNs, domain names, policy refs, static routes) are folded
//! order-independently. Virtual services fold the checksums of everything
//! they reference, so a VS checksum matching the cache means the whole
//! subtree is applied.

use common::{Checksum, ChecksumKind};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::keys::ObjKey;

/// Closed set of node kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum NodeKind {
    VirtualService,
    Pool,
    PoolGroup,
    DataScript,
    TlsCert,
    Vrf,
    Vip,
}

impl fmt::Display for NodeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            NodeKind::VirtualService => "VirtualService",
            NodeKind::Pool => "Pool",
            NodeKind::PoolGroup => "PoolGroup",
            NodeKind::DataScript => "DataScript",
            NodeKind::TlsCert => "TlsCert",
            NodeKind::Vrf => "Vrf",
            NodeKind::Vip => "Vip",
        };
        f.write_str(s)
    }
}

// =============================================================================
// Shared attributes
// =============================================================================

/// Which cluster objects a virtual service or pool was built from.
///
/// Carried on the remote object so the status writer can find the objects to
/// update without consulting the graph.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ServiceMetadata {
    /// L4 source Service
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service: Option<ObjKey>,

    /// L7 source Ingresses, sorted
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ingresses: Vec<ObjKey>,

    /// Hostnames served, sorted
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub hostnames: Vec<String>,
}

impl ServiceMetadata {
    pub fn for_service(key: ObjKey) -> Self {
        Self {
            service: Some(key),
            ..Default::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.service.is_none() && self.ingresses.is_empty() && self.hostnames.is_empty()
    }

    fn fold(&self, checksum: Checksum) -> Checksum {
        let service = self.service.as_ref().map(|s| s.to_string());
        let ingresses: Vec<String> = self.ingresses.iter().map(|k| k.to_string()).collect();
        checksum
            .opt_str(service.as_deref())
            .set(ingresses.iter().map(String::as_str))
            .set(self.hostnames.iter().map(String::as_str))
    }
}

fn fold_keys(checksum: Checksum, keys: &[ObjKey]) -> Checksum {
    let names: Vec<String> = keys.iter().map(|k| k.to_string()).collect();
    checksum.set(names.iter().map(String::as_str))
}

/// Listener port of a virtual service
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct PortProtocol {
    pub port: u16,
    pub protocol: String,
    pub enable_ssl: bool,
}

impl PortProtocol {
    pub fn new(port: u16, protocol: impl Into<String>, enable_ssl: bool) -> Self {
        Self {
            port,
            protocol: protocol.into(),
            enable_ssl,
        }
    }

    fn canonical(&self) -> String {
        format!("{}/{}/{}", self.protocol, self.port, self.enable_ssl)
    }
}

/// Role of a virtual service in SNI hosting
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VsType {
    Normal,
    SniParent,
    SniChild,
}

impl VsType {
    pub fn as_str(&self) -> &'static str {
        match self {
            VsType::Normal => "VS_TYPE_NORMAL",
            VsType::SniParent => "VS_TYPE_VH_PARENT",
            VsType::SniChild => "VS_TYPE_VH_CHILD",
        }
    }
}

// =============================================================================
// Virtual service
// =============================================================================

#[derive(Debug, Clone, PartialEq)]
pub struct VsNode {
    pub name: String,
    pub tenant: String,
    pub vs_type: VsType,
    /// Parent VS name, set for SNI children only
    pub parent: Option<String>,
    pub application_profile: String,
    pub network_profile: String,
    pub ports: Vec<PortProtocol>,
    pub vh_domain_names: Vec<String>,
    pub vip_refs: Vec<ObjKey>,
    /// Referenced pool groups; for L4 services one per listener port, in port order
    pub pool_group_refs: Vec<ObjKey>,
    pub pool_refs: Vec<ObjKey>,
    pub datascript_refs: Vec<ObjKey>,
    pub ssl_cert_refs: Vec<ObjKey>,
    pub sni_child_refs: Vec<ObjKey>,
    pub default_pool_group: Option<ObjKey>,
    /// Policy names contributed by routing rules
    pub policy_refs: Vec<String>,
    pub service_metadata: ServiceMetadata,
    pub vrf_context: String,
    pub checksum: u32,
}

impl VsNode {
    pub fn new(tenant: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            tenant: tenant.into(),
            vs_type: VsType::Normal,
            parent: None,
            application_profile: String::new(),
            network_profile: String::new(),
            ports: Vec::new(),
            vh_domain_names: Vec::new(),
            vip_refs: Vec::new(),
            pool_group_refs: Vec::new(),
            pool_refs: Vec::new(),
            datascript_refs: Vec::new(),
            ssl_cert_refs: Vec::new(),
            sni_child_refs: Vec::new(),
            default_pool_group: None,
            policy_refs: Vec::new(),
            service_metadata: ServiceMetadata::default(),
            vrf_context: String::new(),
            checksum: 0,
        }
    }

    pub fn key(&self) -> ObjKey {
        ObjKey::new(self.tenant.clone(), self.name.clone())
    }

    pub fn is_sni_child(&self) -> bool {
        self.parent.is_some()
    }

    /// Checksum over own fields plus the checksums of every referenced child.
    ///
    /// `child` resolves an already-computed child checksum; a reference with no
    /// node in the graph folds in as 0.
    pub fn compute_checksum<F>(&self, child: F) -> u32
    where
        F: Fn(NodeKind, &ObjKey) -> Option<u32>,
    {
        let ports: Vec<String> = self.ports.iter().map(PortProtocol::canonical).collect();
        let default_pg = self.default_pool_group.as_ref().map(|k| k.to_string());

        let mut checksum = Checksum::new(ChecksumKind::VirtualService)
            .str(self.vs_type.as_str())
            .opt_str(self.parent.as_deref())
            .str(&self.application_profile)
            .str(&self.network_profile)
            .set(ports.iter().map(String::as_str))
            .set(self.vh_domain_names.iter().map(String::as_str))
            .opt_str(default_pg.as_deref())
            .set(self.policy_refs.iter().map(String::as_str))
            .str(&self.vrf_context);
        checksum = self.service_metadata.fold(checksum);

        // L4 pool-group order maps to listener ports, so it is positional
        for key in &self.pool_group_refs {
            checksum = checksum
                .str(&key.name)
                .child(child(NodeKind::PoolGroup, key).unwrap_or(0));
        }

        let unordered: [(NodeKind, &[ObjKey]); 5] = [
            (NodeKind::Vip, &self.vip_refs),
            (NodeKind::Pool, &self.pool_refs),
            (NodeKind::DataScript, &self.datascript_refs),
            (NodeKind::TlsCert, &self.ssl_cert_refs),
            (NodeKind::VirtualService, &self.sni_child_refs),
        ];
        for (kind, keys) in unordered {
            checksum = fold_keys(checksum, keys).checksum_set(
                keys.iter()
                    .map(|key| child(kind, key).unwrap_or(0)),
            );
        }

        checksum.finish()
    }
}

// =============================================================================
// Pool
// =============================================================================

/// One backend server
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PoolServer {
    pub ip: String,
    pub port: u16,
}

impl PoolServer {
    pub fn new(ip: impl Into<String>, port: u16) -> Self {
        Self {
            ip: ip.into(),
            port,
        }
    }
}

impl fmt::Display for PoolServer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.ip.contains(':') {
            write!(f, "[{}]:{}", self.ip, self.port)
        } else {
            write!(f, "{}:{}", self.ip, self.port)
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PoolNode {
    pub name: String,
    pub tenant: String,
    pub protocol: String,
    /// Service port the pool is selected for
    pub port: u16,
    /// Default server port when servers carry none of their own
    pub target_port: u16,
    /// Empty when the backend Service or its endpoints are missing
    pub servers: Vec<PoolServer>,
    pub lb_algorithm: Option<String>,
    /// `host/path` label used by pool-group members
    pub priority_label: Option<String>,
    pub service_metadata: ServiceMetadata,
    pub vrf_context: String,
    pub checksum: u32,
}

impl PoolNode {
    pub fn new(tenant: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            tenant: tenant.into(),
            protocol: "TCP".to_string(),
            port: 0,
            target_port: 0,
            servers: Vec::new(),
            lb_algorithm: None,
            priority_label: None,
            service_metadata: ServiceMetadata::default(),
            vrf_context: String::new(),
            checksum: 0,
        }
    }

    pub fn key(&self) -> ObjKey {
        ObjKey::new(self.tenant.clone(), self.name.clone())
    }

    pub fn compute_checksum(&self) -> u32 {
        let servers: Vec<String> = self.servers.iter().map(|s| s.to_string()).collect();
        let checksum = Checksum::new(ChecksumKind::Pool)
            .str(&self.protocol)
            .u32(self.port.into())
            .u32(self.target_port.into())
            .set(servers.iter().map(String::as_str))
            .opt_str(self.lb_algorithm.as_deref())
            .opt_str(self.priority_label.as_deref())
            .str(&self.vrf_context);
        self.service_metadata.fold(checksum).finish()
    }
}

// =============================================================================
// Pool group
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct PoolGroupMember {
    pub pool: ObjKey,
    pub priority_label: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PoolGroupNode {
    pub name: String,
    pub tenant: String,
    pub members: Vec<PoolGroupMember>,
    pub checksum: u32,
}

impl PoolGroupNode {
    pub fn new(tenant: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            tenant: tenant.into(),
            members: Vec::new(),
            checksum: 0,
        }
    }

    pub fn key(&self) -> ObjKey {
        ObjKey::new(self.tenant.clone(), self.name.clone())
    }

    pub fn compute_checksum(&self) -> u32 {
        let members: Vec<String> = self
            .members
            .iter()
            .map(|m| format!("{}|{}", m.pool, m.priority_label.as_deref().unwrap_or("")))
            .collect();
        Checksum::new(ChecksumKind::PoolGroup)
            .set(members.iter().map(String::as_str))
            .finish()
    }
}

// =============================================================================
// Data script
// =============================================================================

#[derive(Debug, Clone, PartialEq)]
pub struct DataScriptNode {
    pub name: String,
    pub tenant: String,
    pub event: String,
    pub script: String,
    pub pool_group_refs: Vec<ObjKey>,
    pub checksum: u32,
}

impl DataScriptNode {
    pub fn key(&self) -> ObjKey {
        ObjKey::new(self.tenant.clone(), self.name.clone())
    }

    pub fn compute_checksum(&self) -> u32 {
        let checksum = Checksum::new(ChecksumKind::DataScript)
            .str(&self.event)
            .str(&self.script);
        fold_keys(checksum, &self.pool_group_refs).finish()
    }
}

// =============================================================================
// TLS certificate
// =============================================================================

#[derive(Clone, PartialEq)]
pub struct TlsCertNode {
    pub name: String,
    pub tenant: String,
    pub certificate: String,
    pub key: String,
    pub checksum: u32,
}

impl TlsCertNode {
    pub fn obj_key(&self) -> ObjKey {
        ObjKey::new(self.tenant.clone(), self.name.clone())
    }

    pub fn compute_checksum(&self) -> u32 {
        Checksum::new(ChecksumKind::TlsCert)
            .str(&self.certificate)
            .str(&self.key)
            .finish()
    }
}

// Private key material stays out of logs
impl fmt::Debug for TlsCertNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsCertNode")
            .field("name", &self.name)
            .field("tenant", &self.tenant)
            .field("certificate_len", &self.certificate.len())
            .field("key", &"<redacted>")
            .field("checksum", &self.checksum)
            .finish()
    }
}

// =============================================================================
// VIP
// =============================================================================

#[derive(Debug, Clone, PartialEq)]
pub struct VipNode {
    pub name: String,
    pub tenant: String,
    pub fqdns: Vec<String>,
    pub vrf_context: String,
    pub east_west: bool,
    pub checksum: u32,
}

impl VipNode {
    pub fn key(&self) -> ObjKey {
        ObjKey::new(self.tenant.clone(), self.name.clone())
    }

    pub fn compute_checksum(&self) -> u32 {
        Checksum::new(ChecksumKind::Vip)
            .set(self.fqdns.iter().map(String::as_str))
            .str(&self.vrf_context)
            .bool(self.east_west)
            .finish()
    }
}

// =============================================================================
// VRF static routes
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct StaticRoute {
    pub route_id: String,
    /// Destination CIDR, e.g. `10.244.1.0/24`
    pub prefix: String,
    pub next_hop: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct VrfNode {
    pub name: String,
    pub tenant: String,
    pub static_routes: Vec<StaticRoute>,
    pub checksum: u32,
}

impl VrfNode {
    pub fn key(&self) -> ObjKey {
        ObjKey::new(self.tenant.clone(), self.name.clone())
    }

    pub fn compute_checksum(&self) -> u32 {
        let routes: Vec<String> = self
            .static_routes
            .iter()
            .map(|r| format!("{}|{}|{}", r.route_id, r.prefix, r.next_hop))
            .collect();
        Checksum::new(ChecksumKind::Vrf)
            .set(routes.iter().map(String::as_str))
            .finish()
    }
}

// =============================================================================
// GraphNode
// =============================================================================

/// Tagged variant over every node kind
#[derive(Debug, Clone, PartialEq)]
pub enum GraphNode {
    VirtualService(VsNode),
    Pool(PoolNode),
    PoolGroup(PoolGroupNode),
    DataScript(DataScriptNode),
    TlsCert(TlsCertNode),
    Vrf(VrfNode),
    Vip(VipNode),
}

impl GraphNode {
    pub fn kind(&self) -> NodeKind {
        match self {
            GraphNode::VirtualService(_) => NodeKind::VirtualService,
            GraphNode::Pool(_) => NodeKind::Pool,
            GraphNode::PoolGroup(_) => NodeKind::PoolGroup,
            GraphNode::DataScript(_) => NodeKind::DataScript,
            GraphNode::TlsCert(_) => NodeKind::TlsCert,
            GraphNode::Vrf(_) => NodeKind::Vrf,
            GraphNode::Vip(_) => NodeKind::Vip,
        }
    }

    pub fn key(&self) -> ObjKey {
        match self {
            GraphNode::VirtualService(n) => n.key(),
            GraphNode::Pool(n) => n.key(),
            GraphNode::PoolGroup(n) => n.key(),
            GraphNode::DataScript(n) => n.key(),
            GraphNode::TlsCert(n) => n.obj_key(),
            GraphNode::Vrf(n) => n.key(),
            GraphNode::Vip(n) => n.key(),
        }
    }

    /// Checksum cached by the last `ObjectGraph::finalize`
    pub fn checksum(&self) -> u32 {
        match self {
            GraphNode::VirtualService(n) => n.checksum,
            GraphNode::Pool(n) => n.checksum,
            GraphNode::PoolGroup(n) => n.checksum,
            GraphNode::DataScript(n) => n.checksum,
            GraphNode::TlsCert(n) => n.checksum,
            GraphNode::Vrf(n) => n.checksum,
            GraphNode::Vip(n) => n.checksum,
        }
    }
}
