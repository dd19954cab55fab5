//! Identity types shared across layers
//!
//! - [`ObjKey`]: `(namespace, name)` of a graph node or cache entry. For remote
//!   objects the namespace is the tenant.
//! - [`ModelKey`]: `tenant/name` of one logical virtual-service unit.
//! - [`SourceKey`]: `Kind/Namespace/Name` of a cluster object, the ingestion
//!   queue's work item.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::SyncError;

/// (namespace, name) identity of a node or cache entry
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjKey {
    pub namespace: String,
    pub name: String,
}

impl ObjKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for ObjKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Identity of one model: `tenant/name`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ModelKey {
    pub tenant: String,
    pub name: String,
}

impl ModelKey {
    pub fn new(tenant: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            tenant: tenant.into(),
            name: name.into(),
        }
    }

    /// Key of the model's top-level virtual service in the cache.
    pub fn vs_key(&self) -> ObjKey {
        ObjKey::new(self.tenant.clone(), self.name.clone())
    }

    pub fn from_vs_key(key: &ObjKey) -> Self {
        Self::new(key.namespace.clone(), key.name.clone())
    }
}

impl fmt::Display for ModelKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.tenant, self.name)
    }
}

impl FromStr for ModelKey {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once('/') {
            Some((tenant, name)) if !tenant.is_empty() && !name.is_empty() && !name.contains('/') => {
                Ok(Self::new(tenant, name))
            }
            _ => Err(SyncError::MalformedKey(s.to_string())),
        }
    }
}

/// Cluster object kinds the ingestion layer understands
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum SourceKind {
    Service,
    Endpoints,
    Ingress,
    Secret,
    Node,
    HostRule,
}

impl SourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceKind::Service => "Service",
            SourceKind::Endpoints => "Endpoints",
            SourceKind::Ingress => "Ingress",
            SourceKind::Secret => "Secret",
            SourceKind::Node => "Node",
            SourceKind::HostRule => "HostRule",
        }
    }
}

impl FromStr for SourceKind {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Service" => Ok(SourceKind::Service),
            "Endpoints" => Ok(SourceKind::Endpoints),
            "Ingress" => Ok(SourceKind::Ingress),
            "Secret" => Ok(SourceKind::Secret),
            "Node" => Ok(SourceKind::Node),
            "HostRule" => Ok(SourceKind::HostRule),
            other => Err(SyncError::MalformedKey(format!("unknown kind {}", other))),
        }
    }
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// `Kind/Namespace/Name` identity of a cluster object
///
/// Cluster-scoped kinds carry an empty namespace (`Node//worker-1`); the
/// two-segment form `Node/worker-1` is accepted as well.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SourceKey {
    pub kind: SourceKind,
    pub namespace: String,
    pub name: String,
}

impl SourceKey {
    pub fn new(kind: SourceKind, namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            kind,
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    pub fn obj_key(&self) -> ObjKey {
        ObjKey::new(self.namespace.clone(), self.name.clone())
    }
}

impl fmt::Display for SourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.kind, self.namespace, self.name)
    }
}

impl FromStr for SourceKey {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split('/').collect();
        let (kind, namespace, name) = match parts.as_slice() {
            [kind, namespace, name] => (*kind, *namespace, *name),
            [kind, name] => (*kind, "", *name),
            _ => return Err(SyncError::MalformedKey(s.to_string())),
        };
        if name.is_empty() {
            return Err(SyncError::MalformedKey(s.to_string()));
        }
        Ok(Self::new(kind.parse()?, namespace, name))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;

    #[test]
    fn test_source_key_round_trips_through_display() {
        let key: SourceKey = "Ingress/shop/frontend".parse().unwrap();
        assert_eq!(key.kind, SourceKind::Ingress);
        assert_eq!(key.namespace, "shop");
        assert_eq!(key.name, "frontend");
        assert_eq!(key.to_string(), "Ingress/shop/frontend");
    }

    #[test]
    fn test_cluster_scoped_source_keys() {
        let three: SourceKey = "Node//worker-1".parse().unwrap();
        let two: SourceKey = "Node/worker-1".parse().unwrap();
        assert_eq!(three, two);
        assert_eq!(three.namespace, "");
    }

    #[test]
    fn test_malformed_source_keys_are_rejected() {
        assert!("Pod/default/web".parse::<SourceKey>().is_err());
        assert!("Service".parse::<SourceKey>().is_err());
        assert!("Service/default/".parse::<SourceKey>().is_err());
        assert!("Service/a/b/c".parse::<SourceKey>().is_err());
    }

    #[test]
    fn test_model_key_parsing() {
        let key: ModelKey = "admin/cluster--default-web".parse().unwrap();
        assert_eq!(key.tenant, "admin");
        assert_eq!(key.name, "cluster--default-web");
        assert_eq!(key.vs_key(), ObjKey::new("admin", "cluster--default-web"));

        assert!("no-tenant".parse::<ModelKey>().is_err());
        assert!("a/b/c".parse::<ModelKey>().is_err());
    }
}
