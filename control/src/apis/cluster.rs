//! Cluster state snapshot
//!
//! The graph builder reads desired state only through [`ClusterState`], never
//! from event payloads. [`ClusterStore`] is the in-memory implementation fed
//! by the watchers.

use k8s_openapi::api::core::v1::{Node, Secret, Service};
use k8s_openapi::api::discovery::v1::EndpointSlice;
use k8s_openapi::api::networking::v1::Ingress;
use kube::ResourceExt;
use std::collections::{BTreeMap, HashSet};
use std::sync::RwLock;

use crate::error::SyncError;
use crate::locks::{safe_read, safe_write};

/// Label linking an EndpointSlice to its Service
pub const SERVICE_NAME_LABEL: &str = "kubernetes.io/service-name";

/// Resource kinds the store must have listed before a full sync can trust it
pub const REQUIRED_KINDS: [&str; 5] = ["Service", "EndpointSlice", "Ingress", "Secret", "Node"];

/// Read-only view of current cluster state
pub trait ClusterState: Send + Sync {
    fn service(&self, namespace: &str, name: &str) -> Option<Service>;
    fn services(&self) -> Vec<Service>;
    /// EndpointSlices owned by a Service
    fn endpoint_slices(&self, namespace: &str, service: &str) -> Vec<EndpointSlice>;
    fn ingress(&self, namespace: &str, name: &str) -> Option<Ingress>;
    fn ingresses(&self) -> Vec<Ingress>;
    fn secret(&self, namespace: &str, name: &str) -> Option<Secret>;
    fn nodes(&self) -> Vec<Node>;
    /// Fails until every required kind completed its initial list
    fn ensure_synced(&self) -> Result<(), SyncError>;
}

type Keyed<T> = BTreeMap<(String, String), T>;

#[derive(Debug, Default)]
struct Maps {
    services: Keyed<Service>,
    /// keyed by (namespace, slice name)
    endpoint_slices: Keyed<EndpointSlice>,
    ingresses: Keyed<Ingress>,
    secrets: Keyed<Secret>,
    nodes: BTreeMap<String, Node>,
}

/// In-memory cluster state, written by watchers
#[derive(Debug, Default)]
pub struct ClusterStore {
    maps: RwLock<Maps>,
    synced: RwLock<HashSet<&'static str>>,
}

fn key_of<K: ResourceExt>(obj: &K) -> (String, String) {
    (obj.namespace().unwrap_or_default(), obj.name_any())
}

impl ClusterStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// A store whose initial lists are considered complete, for standalone
    /// mode and tests
    pub fn new_synced() -> Self {
        let store = Self::default();
        for kind in REQUIRED_KINDS {
            store.mark_synced(kind);
        }
        store
    }

    pub fn mark_synced(&self, kind: &'static str) {
        safe_write(&self.synced).insert(kind);
    }

    pub fn apply_service(&self, svc: Service) {
        safe_write(&self.maps).services.insert(key_of(&svc), svc);
    }

    pub fn delete_service(&self, namespace: &str, name: &str) {
        safe_write(&self.maps)
            .services
            .remove(&(namespace.to_string(), name.to_string()));
    }

    pub fn apply_endpoint_slice(&self, slice: EndpointSlice) {
        safe_write(&self.maps)
            .endpoint_slices
            .insert(key_of(&slice), slice);
    }

    pub fn delete_endpoint_slice(&self, namespace: &str, name: &str) {
        safe_write(&self.maps)
            .endpoint_slices
            .remove(&(namespace.to_string(), name.to_string()));
    }

    pub fn apply_ingress(&self, ingress: Ingress) {
        safe_write(&self.maps).ingresses.insert(key_of(&ingress), ingress);
    }

    pub fn delete_ingress(&self, namespace: &str, name: &str) {
        safe_write(&self.maps)
            .ingresses
            .remove(&(namespace.to_string(), name.to_string()));
    }

    pub fn apply_secret(&self, secret: Secret) {
        safe_write(&self.maps).secrets.insert(key_of(&secret), secret);
    }

    pub fn delete_secret(&self, namespace: &str, name: &str) {
        safe_write(&self.maps)
            .secrets
            .remove(&(namespace.to_string(), name.to_string()));
    }

    pub fn apply_node(&self, node: Node) {
        safe_write(&self.maps).nodes.insert(node.name_any(), node);
    }

    pub fn delete_node(&self, name: &str) {
        safe_write(&self.maps).nodes.remove(name);
    }
}

impl ClusterState for ClusterStore {
    fn service(&self, namespace: &str, name: &str) -> Option<Service> {
        safe_read(&self.maps)
            .services
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
    }

    fn services(&self) -> Vec<Service> {
        safe_read(&self.maps).services.values().cloned().collect()
    }

    fn endpoint_slices(&self, namespace: &str, service: &str) -> Vec<EndpointSlice> {
        safe_read(&self.maps)
            .endpoint_slices
            .iter()
            .filter(|((ns, _), slice)| {
                ns == namespace
                    && slice
                        .labels()
                        .get(SERVICE_NAME_LABEL)
                        .map(|s| s == service)
                        .unwrap_or(false)
            })
            .map(|(_, slice)| slice.clone())
            .collect()
    }

    fn ingress(&self, namespace: &str, name: &str) -> Option<Ingress> {
        safe_read(&self.maps)
            .ingresses
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
    }

    fn ingresses(&self) -> Vec<Ingress> {
        safe_read(&self.maps).ingresses.values().cloned().collect()
    }

    fn secret(&self, namespace: &str, name: &str) -> Option<Secret> {
        safe_read(&self.maps)
            .secrets
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
    }

    fn nodes(&self) -> Vec<Node> {
        safe_read(&self.maps).nodes.values().cloned().collect()
    }

    fn ensure_synced(&self) -> Result<(), SyncError> {
        let synced = safe_read(&self.synced);
        match REQUIRED_KINDS.iter().find(|kind| !synced.contains(*kind)) {
            Some(kind) => Err(SyncError::ClusterNotReady(kind)),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    fn slice(namespace: &str, name: &str, service: &str) -> EndpointSlice {
        EndpointSlice {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some(namespace.to_string()),
                labels: Some(BTreeMap::from([(
                    SERVICE_NAME_LABEL.to_string(),
                    service.to_string(),
                )])),
                ..Default::default()
            },
            address_type: "IPv4".to_string(),
            endpoints: vec![],
            ports: None,
        }
    }

    #[test]
    fn test_endpoint_slices_are_found_by_service_label() {
        let store = ClusterStore::new();
        store.apply_endpoint_slice(slice("default", "web-abc", "web"));
        store.apply_endpoint_slice(slice("default", "web-def", "web"));
        store.apply_endpoint_slice(slice("default", "api-xyz", "api"));
        store.apply_endpoint_slice(slice("other", "web-zzz", "web"));

        assert_eq!(store.endpoint_slices("default", "web").len(), 2);
        assert_eq!(store.endpoint_slices("default", "api").len(), 1);

        store.delete_endpoint_slice("default", "web-abc");
        assert_eq!(store.endpoint_slices("default", "web").len(), 1);
    }

    #[test]
    fn test_sync_readiness() {
        let store = ClusterStore::new();
        assert!(matches!(
            store.ensure_synced(),
            Err(SyncError::ClusterNotReady("Service"))
        ));

        for kind in REQUIRED_KINDS {
            store.mark_synced(kind);
        }
        assert!(store.ensure_synced().is_ok());
        assert!(ClusterStore::new_synced().ensure_synced().is_ok());
    }

    #[test]
    fn test_service_lifecycle() {
        let store = ClusterStore::new();
        store.apply_service(Service {
            metadata: ObjectMeta {
                name: Some("web".to_string()),
                namespace: Some("default".to_string()),
                ..Default::default()
            },
            ..Default::default()
        });
        assert!(store.service("default", "web").is_some());
        assert_eq!(store.services().len(), 1);

        store.delete_service("default", "web");
        assert!(store.service("default", "web").is_none());
    }
}
