//! Load-balancer status write-back
//!
//! Consumes reconciler status events and sets `status.loadBalancer.ingress`
//! on the Services and Ingresses a virtual service was built from.

use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Service;
use k8s_openapi::api::networking::v1::Ingress;
use kube::api::{Api, Patch, PatchParams};
use kube::Client;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::SyncError;
use crate::graph::nodes::ServiceMetadata;
use crate::keys::ObjKey;
use crate::rest::{StatusEvent, StatusReceiver};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatusTarget {
    Service(ObjKey),
    Ingress(ObjKey),
}

/// Cluster objects a virtual service reports back to
pub fn targets(metadata: &ServiceMetadata) -> Vec<StatusTarget> {
    metadata
        .service
        .iter()
        .cloned()
        .map(StatusTarget::Service)
        .chain(metadata.ingresses.iter().cloned().map(StatusTarget::Ingress))
        .collect()
}

/// Merge patch for `status.loadBalancer`; no address clears it
pub fn load_balancer_patch(vip: Option<&str>) -> Value {
    let ingress: Vec<Value> = vip.map(|ip| json!({ "ip": ip })).into_iter().collect();
    json!({ "status": { "loadBalancer": { "ingress": ingress } } })
}

#[async_trait]
pub trait StatusPatcher: Send + Sync {
    async fn patch(&self, target: &StatusTarget, patch: &Value) -> Result<(), SyncError>;
}

/// Patches the status subresource through the API server
pub struct KubeStatusPatcher {
    client: Client,
}

impl KubeStatusPatcher {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl StatusPatcher for KubeStatusPatcher {
    async fn patch(&self, target: &StatusTarget, patch: &Value) -> Result<(), SyncError> {
        let params = PatchParams::default();
        match target {
            StatusTarget::Service(key) => {
                let api: Api<Service> = Api::namespaced(self.client.clone(), &key.namespace);
                api.patch_status(&key.name, &params, &Patch::Merge(patch)).await?;
            }
            StatusTarget::Ingress(key) => {
                let api: Api<Ingress> = Api::namespaced(self.client.clone(), &key.namespace);
                api.patch_status(&key.name, &params, &Patch::Merge(patch)).await?;
            }
        }
        Ok(())
    }
}

/// Standalone mode: log what would be written
pub struct LogStatusPatcher;

#[async_trait]
impl StatusPatcher for LogStatusPatcher {
    async fn patch(&self, target: &StatusTarget, patch: &Value) -> Result<(), SyncError> {
        info!("Status for {:?}: {}", target, patch["status"]["loadBalancer"]);
        Ok(())
    }
}

/// Apply one event to every target it names
pub async fn write_status(patcher: &dyn StatusPatcher, event: &StatusEvent) {
    let patch = match event {
        StatusEvent::Applied { vip, .. } => load_balancer_patch(vip.as_deref()),
        StatusEvent::Removed { .. } => load_balancer_patch(None),
    };
    for target in targets(event.metadata()) {
        if let Err(e) = patcher.patch(&target, &patch).await {
            // objects removed from the cluster cannot take a status
            warn!(model = %event.model(), "Status update of {:?} failed: {}", target, e);
        }
    }
}

/// Drain status events until the channel closes or `cancel` fires
pub async fn run_status_writer(
    mut rx: StatusReceiver,
    patcher: Arc<dyn StatusPatcher>,
    cancel: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => break,
            event = rx.recv() => match event {
                Some(event) => event,
                None => break,
            },
        };
        write_status(patcher.as_ref(), &event).await;
    }
    debug!("Status writer stopped");
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder {
        patches: Mutex<Vec<(StatusTarget, Value)>>,
    }

    #[async_trait]
    impl StatusPatcher for Recorder {
        async fn patch(&self, target: &StatusTarget, patch: &Value) -> Result<(), SyncError> {
            self.patches.lock().unwrap().push((target.clone(), patch.clone()));
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_applied_event_patches_every_source() {
        let recorder = Recorder::default();
        let event = StatusEvent::Applied {
            model: "admin/shard-0".into(),
            vip: Some("10.10.0.7".into()),
            metadata: ServiceMetadata {
                service: None,
                ingresses: vec![ObjKey::new("default", "a"), ObjKey::new("web", "b")],
                hostnames: vec!["a.example.com".into()],
            },
        };
        write_status(&recorder, &event).await;

        let patches = recorder.patches.lock().unwrap();
        assert_eq!(patches.len(), 2);
        assert_eq!(patches[1].0, StatusTarget::Ingress(ObjKey::new("web", "b")));
        assert_eq!(patches[0].1["status"]["loadBalancer"]["ingress"][0]["ip"], "10.10.0.7");
    }

    #[tokio::test]
    async fn test_removed_event_clears_status() {
        let recorder = Recorder::default();
        let event = StatusEvent::Removed {
            model: "admin/web".into(),
            metadata: ServiceMetadata::for_service(ObjKey::new("default", "web")),
        };
        write_status(&recorder, &event).await;

        let patches = recorder.patches.lock().unwrap();
        assert_eq!(patches[0].0, StatusTarget::Service(ObjKey::new("default", "web")));
        assert_eq!(patches[0].1["status"]["loadBalancer"]["ingress"], json!([]));
    }
}
