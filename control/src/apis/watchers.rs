//! Kubernetes watchers feeding the cluster store and the ingestion queue
//!
//! ```text
//! watcher(Service | EndpointSlice | Ingress | Secret | Node)
//!     Apply / InitApply / Delete ──▶ ClusterStore ──▶ "Kind/ns/name" ──▶ ingestion
//!     InitDone                   ──▶ ClusterStore::mark_synced(kind)
//! ```
//!
//! The store is always written before the key is published, so the graph
//! builder never sees a key ahead of the state it refers to. EndpointSlices
//! publish their owning Service's `Endpoints` key.

use std::fmt::Debug;
use std::sync::Arc;

use futures::StreamExt;
use k8s_openapi::api::core::v1::{Node, Secret, Service};
use k8s_openapi::api::discovery::v1::EndpointSlice;
use k8s_openapi::api::networking::v1::Ingress;
use kube::runtime::watcher;
use kube::runtime::watcher::Config as WatcherConfig;
use kube::{api::Api, Client, Resource, ResourceExt};
use serde::de::DeserializeOwned;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::cluster::{ClusterStore, SERVICE_NAME_LABEL};
use crate::keys::{SourceKey, SourceKind};
use crate::queue::ShardedQueue;

/// A watched kind: how it lands in the store and which key it publishes
pub trait Watched:
    Resource<DynamicType = ()> + Clone + Debug + DeserializeOwned + Send + Sync + 'static
{
    const KIND: &'static str;

    fn apply(store: &ClusterStore, obj: Self);
    fn delete(store: &ClusterStore, obj: &Self);
    /// `None` when the object cannot be tied to anything we build
    fn source_key(obj: &Self) -> Option<SourceKey>;
}

fn namespaced_key<K: ResourceExt>(kind: SourceKind, obj: &K) -> SourceKey {
    SourceKey::new(kind, obj.namespace().unwrap_or_default(), obj.name_any())
}

impl Watched for Service {
    const KIND: &'static str = "Service";

    fn apply(store: &ClusterStore, obj: Self) {
        store.apply_service(obj);
    }

    fn delete(store: &ClusterStore, obj: &Self) {
        store.delete_service(&obj.namespace().unwrap_or_default(), &obj.name_any());
    }

    fn source_key(obj: &Self) -> Option<SourceKey> {
        Some(namespaced_key(SourceKind::Service, obj))
    }
}

impl Watched for EndpointSlice {
    const KIND: &'static str = "EndpointSlice";

    fn apply(store: &ClusterStore, obj: Self) {
        store.apply_endpoint_slice(obj);
    }

    fn delete(store: &ClusterStore, obj: &Self) {
        store.delete_endpoint_slice(&obj.namespace().unwrap_or_default(), &obj.name_any());
    }

    fn source_key(obj: &Self) -> Option<SourceKey> {
        let service = obj.labels().get(SERVICE_NAME_LABEL)?;
        Some(SourceKey::new(
            SourceKind::Endpoints,
            obj.namespace().unwrap_or_default(),
            service.clone(),
        ))
    }
}

impl Watched for Ingress {
    const KIND: &'static str = "Ingress";

    fn apply(store: &ClusterStore, obj: Self) {
        store.apply_ingress(obj);
    }

    fn delete(store: &ClusterStore, obj: &Self) {
        store.delete_ingress(&obj.namespace().unwrap_or_default(), &obj.name_any());
    }

    fn source_key(obj: &Self) -> Option<SourceKey> {
        Some(namespaced_key(SourceKind::Ingress, obj))
    }
}

impl Watched for Secret {
    const KIND: &'static str = "Secret";

    fn apply(store: &ClusterStore, obj: Self) {
        store.apply_secret(obj);
    }

    fn delete(store: &ClusterStore, obj: &Self) {
        store.delete_secret(&obj.namespace().unwrap_or_default(), &obj.name_any());
    }

    fn source_key(obj: &Self) -> Option<SourceKey> {
        // only TLS secrets can be referenced by an Ingress
        match obj.type_.as_deref() {
            Some("kubernetes.io/tls") => Some(namespaced_key(SourceKind::Secret, obj)),
            _ => None,
        }
    }
}

impl Watched for Node {
    const KIND: &'static str = "Node";

    fn apply(store: &ClusterStore, obj: Self) {
        store.apply_node(obj);
    }

    fn delete(store: &ClusterStore, obj: &Self) {
        store.delete_node(&obj.name_any());
    }

    fn source_key(obj: &Self) -> Option<SourceKey> {
        Some(SourceKey::new(SourceKind::Node, "", obj.name_any()))
    }
}

/// Store one applied object and publish its key
pub fn handle_apply<K: Watched>(store: &ClusterStore, ingestion: &ShardedQueue, obj: K) {
    let key = K::source_key(&obj);
    K::apply(store, obj);
    if let Some(key) = key {
        debug!("{} applied: {}", K::KIND, key);
        ingestion.publish(key.to_string());
    }
}

/// Drop one deleted object and publish its key
pub fn handle_delete<K: Watched>(store: &ClusterStore, ingestion: &ShardedQueue, obj: &K) {
    K::delete(store, obj);
    if let Some(key) = K::source_key(obj) {
        debug!("{} deleted: {}", K::KIND, key);
        ingestion.publish(key.to_string());
    }
}

/// Watch one kind cluster-wide until cancelled
pub async fn watch<K: Watched>(
    client: Client,
    store: Arc<ClusterStore>,
    ingestion: Arc<ShardedQueue>,
    cancel: CancellationToken,
) {
    let api: Api<K> = Api::all(client);
    let stream = watcher(api, WatcherConfig::default());
    futures::pin_mut!(stream);

    info!("Starting {} watcher", K::KIND);
    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => break,
            event = stream.next() => match event {
                Some(event) => event,
                None => break,
            },
        };
        match event {
            Ok(watcher::Event::Apply(obj)) | Ok(watcher::Event::InitApply(obj)) => {
                handle_apply(&store, &ingestion, obj);
            }
            Ok(watcher::Event::Delete(obj)) => {
                handle_delete(&store, &ingestion, &obj);
            }
            Ok(watcher::Event::Init) => {
                debug!("{} watcher initialized", K::KIND);
            }
            Ok(watcher::Event::InitDone) => {
                store.mark_synced(K::KIND);
                info!("{} watcher initial sync complete", K::KIND);
            }
            Err(e) => {
                warn!("{} watcher error: {}", K::KIND, e);
            }
        }
    }
    info!("{} watcher stopped", K::KIND);
}

/// Spawn a watcher for every kind the graph builder reads
pub fn spawn_watchers(
    client: Client,
    store: Arc<ClusterStore>,
    ingestion: Arc<ShardedQueue>,
    cancel: CancellationToken,
) -> Vec<JoinHandle<()>> {
    vec![
        tokio::spawn(watch::<Service>(client.clone(), store.clone(), ingestion.clone(), cancel.clone())),
        tokio::spawn(watch::<EndpointSlice>(client.clone(), store.clone(), ingestion.clone(), cancel.clone())),
        tokio::spawn(watch::<Ingress>(client.clone(), store.clone(), ingestion.clone(), cancel.clone())),
        tokio::spawn(watch::<Secret>(client.clone(), store.clone(), ingestion.clone(), cancel.clone())),
        tokio::spawn(watch::<Node>(client, store, ingestion, cancel)),
    ]
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;
    use crate::apis::cluster::ClusterState;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use std::collections::BTreeMap;

    fn meta(namespace: &str, name: &str) -> ObjectMeta {
        ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn test_service_apply_stores_then_publishes() {
        let store = ClusterStore::new();
        let queue = ShardedQueue::new("ingestion", 2);
        let svc = Service {
            metadata: meta("default", "web"),
            ..Default::default()
        };

        handle_apply(&store, &queue, svc.clone());
        assert!(store.service("default", "web").is_some());
        assert!(queue.is_pending("Service/default/web"));

        handle_delete(&store, &queue, &svc);
        assert!(store.service("default", "web").is_none());
    }

    #[test]
    fn test_endpoint_slice_publishes_owning_service() {
        let store = ClusterStore::new();
        let queue = ShardedQueue::new("ingestion", 2);
        let mut slice = EndpointSlice {
            metadata: meta("default", "web-abc12"),
            address_type: "IPv4".into(),
            endpoints: vec![],
            ports: None,
        };
        slice.metadata.labels = Some(BTreeMap::from([(SERVICE_NAME_LABEL.to_string(), "web".to_string())]));

        handle_apply(&store, &queue, slice);
        assert!(queue.is_pending("Endpoints/default/web"));
        assert_eq!(store.endpoint_slices("default", "web").len(), 1);
    }

    #[test]
    fn test_unlabeled_slice_and_opaque_secret_are_stored_silently() {
        let store = ClusterStore::new();
        let queue = ShardedQueue::new("ingestion", 1);
        handle_apply(
            &store,
            &queue,
            EndpointSlice {
                metadata: meta("default", "orphan"),
                address_type: "IPv4".into(),
                endpoints: vec![],
                ports: None,
            },
        );
        handle_apply(
            &store,
            &queue,
            Secret {
                metadata: meta("default", "creds"),
                type_: Some("Opaque".into()),
                ..Default::default()
            },
        );
        assert!(queue.is_empty());
        assert!(store.secret("default", "creds").is_some());
    }

    #[test]
    fn test_node_key_is_cluster_scoped() {
        let node = Node {
            metadata: ObjectMeta {
                name: Some("worker-1".into()),
                ..Default::default()
            },
            ..Default::default()
        };
        assert_eq!(Node::source_key(&node).unwrap().to_string(), "Node//worker-1");
    }
}
