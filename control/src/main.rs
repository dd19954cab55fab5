use anyhow::{Context, Result};
use std::env;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use control::apis::cluster::{ClusterState, ClusterStore};
use control::apis::metrics::serve_metrics;
use control::apis::status::{run_status_writer, KubeStatusPatcher, LogStatusPatcher, StatusPatcher};
use control::apis::watchers::spawn_watchers;
use control::cache::ControllerCache;
use control::graph::{GraphBuilder, ModelStore, Naming, NoRouteRules, RelationIndex};
use control::remote::{ClientPool, HttpRemoteClient, InMemoryController, RemoteClient};
use control::rest::{status_channel, PayloadContext, Reconciler};
use control::{SyncConfig, SyncPipeline};

#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

fn client_pool(config: &SyncConfig) -> ClientPool {
    let count = config.connection_count();
    match &config.controller.url {
        Some(url) => {
            info!("Remote controller: {} ({} connection(s))", url, count);
            let clients = (0..count)
                .map(|_| {
                    Arc::new(HttpRemoteClient::new(url.clone(), config.tenant.clone(), &config.controller))
                        as Arc<dyn RemoteClient>
                })
                .collect();
            ClientPool::new(clients)
        }
        None => {
            info!("No controller URL set, running against the in-memory controller (dry run)");
            let controller = InMemoryController::new(&config.tenant);
            controller.seed_vrf(&config.vrf_name, &config.tenant);
            ClientPool::shared(Arc::new(controller), count)
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Needed by the Kubernetes TLS client
    rustls::crypto::ring::default_provider()
        .install_default()
        .ok();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = SyncConfig::from_env().context("invalid configuration")?;
    info!(
        tenant = %config.tenant,
        cloud = %config.cloud_name,
        cluster = %config.cluster_name,
        "Starting lbsync"
    );

    let k8s_mode = env::var("LBSYNC_K8S_MODE")
        .unwrap_or_else(|_| "false".to_string())
        .parse::<bool>()
        .unwrap_or(false);
    let kube_client = if k8s_mode {
        match kube::Client::try_default().await {
            Ok(client) => Some(client),
            Err(e) => {
                warn!("Failed to create Kubernetes client: {}", e);
                warn!("Running in standalone mode");
                None
            }
        }
    } else {
        info!("Standalone mode - empty cluster snapshot");
        None
    };

    let cluster = Arc::new(match kube_client {
        Some(_) => ClusterStore::new(),
        None => ClusterStore::new_synced(),
    });
    let store = Arc::new(ModelStore::new(config.retry.retry_budget));
    let relations = Arc::new(RelationIndex::new());
    let builder = Arc::new(GraphBuilder::new(
        Naming::from_config(&config),
        cluster.clone(),
        store.clone(),
        relations.clone(),
        Arc::new(NoRouteRules),
    ));

    let (status_tx, status_rx) = status_channel();
    let reconciler = Arc::new(
        Reconciler::new(
            store,
            Arc::new(ControllerCache::new(
                config.tenant.clone(),
                config.controller.created_by.clone(),
                config.controller.page_size,
            )),
            client_pool(&config),
            PayloadContext::from_config(&config),
        )
        .with_status(status_tx),
    );

    let cancel = CancellationToken::new();
    let mut handles = Vec::new();

    let patcher: Arc<dyn StatusPatcher> = match &kube_client {
        Some(client) => Arc::new(KubeStatusPatcher::new(client.clone())),
        None => Arc::new(LogStatusPatcher),
    };
    handles.push(tokio::spawn(run_status_writer(status_rx, patcher, cancel.clone())));

    if let Some(addr) = config.metrics_bind_addr.clone() {
        let relations = relations.clone();
        let cancel = cancel.clone();
        handles.push(tokio::spawn(async move {
            if let Err(e) = serve_metrics(addr, relations, cancel).await {
                tracing::error!("Metrics server error: {}", e);
            }
        }));
    }

    let pipeline = Arc::new(SyncPipeline::new(config, builder, reconciler));
    handles.extend(pipeline.start(cancel.clone()).await?);

    if let Some(client) = kube_client {
        info!("Kubernetes mode enabled - starting watchers");
        handles.extend(spawn_watchers(client, cluster.clone(), pipeline.ingestion_queue(), cancel.clone()));
    }

    // Models with no watch event behind them (the VRF) are built once the
    // snapshot is complete
    {
        let pipeline = pipeline.clone();
        let cluster = cluster.clone();
        let cancel = cancel.clone();
        handles.push(tokio::spawn(async move {
            while cluster.ensure_synced().is_err() {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = tokio::time::sleep(Duration::from_secs(1)) => {}
                }
            }
            let changed = pipeline.publish_all();
            info!("Initial build queued {} model(s)", changed.len());
        }));
    }

    info!("Press Ctrl-C to exit.");
    signal::ctrl_c().await.context("failed to listen for Ctrl-C")?;
    info!("Shutdown signal received");

    cancel.cancel();
    for handle in handles {
        if let Err(e) = handle.await {
            warn!("Task ended abnormally: {}", e);
        }
    }
    Ok(())
}
