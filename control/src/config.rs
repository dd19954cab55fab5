//! Configuration for the lbsync controller
//!
//! Defaults cover a single-cluster install against the default cloud. Every
//! field can be overridden through `LBSYNC_*` environment variables.

use serde::{Deserialize, Serialize};
use std::env;
use std::time::Duration;

use crate::error::SyncError;

/// Top-level sync configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SyncConfig {
    /// Tenant every remote object is created in (default: "admin")
    #[serde(default = "default_tenant")]
    pub tenant: String,

    /// Cloud the remote objects are placed in
    #[serde(default = "default_cloud_name")]
    pub cloud_name: String,

    /// VRF context holding static routes to pod networks
    #[serde(default = "default_vrf_name")]
    pub vrf_name: String,

    /// Cluster name, prefixed to every generated object name
    #[serde(default = "default_cluster_name")]
    pub cluster_name: String,

    /// Prefix of hostname-shard virtual services; derived from cloud and
    /// cluster name when unset
    pub shard_vs_prefix: Option<String>,

    /// Number of hostname-shard virtual services (default: 8)
    #[serde(default = "default_shard_vs_count")]
    pub shard_vs_count: u32,

    /// Full-sync interval in seconds, 0 disables the sweep (default: 300s)
    #[serde(default = "default_full_sync_interval")]
    pub full_sync_interval_secs: u64,

    /// Optional bind address for the Prometheus endpoint
    pub metrics_bind_addr: Option<String>,

    #[serde(default)]
    pub workers: WorkerConfig,

    #[serde(default)]
    pub retry: RetryConfig,

    #[serde(default)]
    pub controller: ControllerEndpointConfig,
}

/// Worker shard count per layer
///
/// A key's shard is `bucket(key, shards)`, so changing a count moves keys
/// between workers. Change these only across restarts.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WorkerConfig {
    #[serde(default = "default_layer_shards")]
    pub ingestion_shards: u32,

    #[serde(default = "default_layer_shards")]
    pub reconcile_shards: u32,

    #[serde(default = "default_retry_shards")]
    pub fast_retry_shards: u32,

    #[serde(default = "default_retry_shards")]
    pub slow_retry_shards: u32,
}

fn default_layer_shards() -> u32 {
    num_cpus::get().clamp(2, 8) as u32
}

fn default_retry_shards() -> u32 {
    2
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            ingestion_shards: default_layer_shards(),
            reconcile_shards: default_layer_shards(),
            fast_retry_shards: default_retry_shards(),
            slow_retry_shards: default_retry_shards(),
        }
    }
}

/// Retry tier configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RetryConfig {
    /// Retries allowed per model between successful saves or sweeps (default: 10)
    #[serde(default = "default_retry_budget")]
    pub retry_budget: u32,

    /// Delay before a fast-tier re-publish in milliseconds (default: 500ms)
    #[serde(default = "default_fast_retry_delay")]
    pub fast_retry_delay_ms: u64,

    /// Backoff before a slow-tier re-publish in seconds (default: 60s)
    #[serde(default = "default_slow_retry_backoff")]
    pub slow_retry_backoff_secs: u64,
}

fn default_retry_budget() -> u32 {
    10
}

fn default_fast_retry_delay() -> u64 {
    500
}

fn default_slow_retry_backoff() -> u64 {
    60
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            retry_budget: default_retry_budget(),
            fast_retry_delay_ms: default_fast_retry_delay(),
            slow_retry_backoff_secs: default_slow_retry_backoff(),
        }
    }
}

impl RetryConfig {
    pub fn fast_delay(&self) -> Duration {
        Duration::from_millis(self.fast_retry_delay_ms)
    }

    pub fn slow_backoff(&self) -> Duration {
        Duration::from_secs(self.slow_retry_backoff_secs)
    }
}

/// Remote controller connection settings
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ControllerEndpointConfig {
    /// Base URL (e.g. `http://10.0.0.10`). Unset runs against the in-memory
    /// controller (dry run).
    pub url: Option<String>,

    /// Bearer token sent with every request
    pub auth_token: Option<String>,

    /// Client connections in the pool; defaults to the reconcile shard count
    pub connections: Option<u32>,

    /// Per-request timeout in seconds (default: 30s)
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Page size for collection listings (default: 100)
    #[serde(default = "default_page_size")]
    pub page_size: u32,

    /// Marker stamped on every created object; bulk refresh only mirrors
    /// objects carrying it
    #[serde(default = "default_created_by")]
    pub created_by: String,
}

fn default_request_timeout() -> u64 {
    30
}

fn default_page_size() -> u32 {
    100
}

fn default_created_by() -> String {
    "lbsync".to_string()
}

impl Default for ControllerEndpointConfig {
    fn default() -> Self {
        Self {
            url: None,
            auth_token: None,
            connections: None,
            request_timeout_secs: default_request_timeout(),
            page_size: default_page_size(),
            created_by: default_created_by(),
        }
    }
}

fn default_tenant() -> String {
    "admin".to_string()
}

fn default_cloud_name() -> String {
    "Default-Cloud".to_string()
}

fn default_vrf_name() -> String {
    "global".to_string()
}

fn default_cluster_name() -> String {
    "cluster".to_string()
}

fn default_shard_vs_count() -> u32 {
    8
}

fn default_full_sync_interval() -> u64 {
    300
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            tenant: default_tenant(),
            cloud_name: default_cloud_name(),
            vrf_name: default_vrf_name(),
            cluster_name: default_cluster_name(),
            shard_vs_prefix: None,
            shard_vs_count: default_shard_vs_count(),
            full_sync_interval_secs: default_full_sync_interval(),
            metrics_bind_addr: None,
            workers: WorkerConfig::default(),
            retry: RetryConfig::default(),
            controller: ControllerEndpointConfig::default(),
        }
    }
}

impl SyncConfig {
    /// Load configuration from `LBSYNC_*` environment variables
    pub fn from_env() -> Result<Self, SyncError> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Build a config from an arbitrary variable source, used by `from_env`
    pub fn from_lookup<F>(lookup: F) -> Result<Self, SyncError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(val) = lookup("LBSYNC_TENANT") {
            config.tenant = val;
        }
        if let Some(val) = lookup("LBSYNC_CLOUD_NAME") {
            config.cloud_name = val;
        }
        if let Some(val) = lookup("LBSYNC_VRF") {
            config.vrf_name = val;
        }
        if let Some(val) = lookup("LBSYNC_CLUSTER_NAME") {
            config.cluster_name = val;
        }
        if let Some(val) = lookup("LBSYNC_SHARD_VS_PREFIX") {
            config.shard_vs_prefix = Some(val);
        }
        if let Some(val) = lookup("LBSYNC_SHARD_VS_COUNT") {
            config.shard_vs_count = parse_var("LBSYNC_SHARD_VS_COUNT", &val)?;
        }
        if let Some(val) = lookup("LBSYNC_FULL_SYNC_INTERVAL") {
            config.full_sync_interval_secs = parse_var("LBSYNC_FULL_SYNC_INTERVAL", &val)?;
        }
        if let Some(val) = lookup("LBSYNC_METRICS_ADDR") {
            config.metrics_bind_addr = Some(val);
        }

        // Workers
        if let Some(val) = lookup("LBSYNC_INGESTION_SHARDS") {
            config.workers.ingestion_shards = parse_var("LBSYNC_INGESTION_SHARDS", &val)?;
        }
        if let Some(val) = lookup("LBSYNC_RECONCILE_SHARDS") {
            config.workers.reconcile_shards = parse_var("LBSYNC_RECONCILE_SHARDS", &val)?;
        }

        // Retry
        if let Some(val) = lookup("LBSYNC_RETRY_BUDGET") {
            config.retry.retry_budget = parse_var("LBSYNC_RETRY_BUDGET", &val)?;
        }
        if let Some(val) = lookup("LBSYNC_SLOW_RETRY_BACKOFF") {
            config.retry.slow_retry_backoff_secs = parse_var("LBSYNC_SLOW_RETRY_BACKOFF", &val)?;
        }

        // Remote controller
        if let Some(val) = lookup("LBSYNC_CONTROLLER_URL") {
            config.controller.url = Some(val);
        }
        if let Some(val) = lookup("LBSYNC_CONTROLLER_TOKEN") {
            config.controller.auth_token = Some(val);
        }
        if let Some(val) = lookup("LBSYNC_CONTROLLER_CONNECTIONS") {
            config.controller.connections = Some(parse_var("LBSYNC_CONTROLLER_CONNECTIONS", &val)?);
        }
        if let Some(val) = lookup("LBSYNC_CONTROLLER_TIMEOUT") {
            config.controller.request_timeout_secs = parse_var("LBSYNC_CONTROLLER_TIMEOUT", &val)?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Reject configurations the pipeline cannot run with
    pub fn validate(&self) -> Result<(), SyncError> {
        let shards = [
            ("ingestion_shards", self.workers.ingestion_shards),
            ("reconcile_shards", self.workers.reconcile_shards),
            ("fast_retry_shards", self.workers.fast_retry_shards),
            ("slow_retry_shards", self.workers.slow_retry_shards),
            ("shard_vs_count", self.shard_vs_count),
        ];
        for (name, value) in shards {
            if value == 0 {
                return Err(SyncError::Config(format!("{} must be at least 1", name)));
            }
        }
        if self.tenant.is_empty() || self.tenant.contains('/') {
            return Err(SyncError::Config(format!(
                "invalid tenant '{}'",
                self.tenant
            )));
        }
        if self.controller.page_size == 0 {
            return Err(SyncError::Config("page_size must be at least 1".to_string()));
        }
        Ok(())
    }

    /// Prefix of hostname-shard virtual services
    pub fn shard_prefix(&self) -> String {
        self.shard_vs_prefix
            .clone()
            .unwrap_or_else(|| format!("{}--{}-shard-", self.cloud_name, self.cluster_name))
    }

    pub fn full_sync_interval(&self) -> Option<Duration> {
        match self.full_sync_interval_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }

    pub fn connection_count(&self) -> u32 {
        self.controller
            .connections
            .unwrap_or(self.workers.reconcile_shards)
            .max(1)
    }
}

fn parse_var<T: std::str::FromStr>(name: &str, value: &str) -> Result<T, SyncError> {
    value
        .trim()
        .parse()
        .map_err(|_| SyncError::Config(format!("{}: cannot parse '{}'", name, value)))
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn test_default_config() {
        let config = SyncConfig::default();
        assert_eq!(config.tenant, "admin");
        assert_eq!(config.cloud_name, "Default-Cloud");
        assert_eq!(config.vrf_name, "global");
        assert!(config.controller.url.is_none(), "no URL means dry run");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_retry_defaults() {
        let config = SyncConfig::default();

        assert_eq!(
            config.retry.retry_budget, 10,
            "Retry budget should allow 10 attempts between sweeps"
        );
        assert_eq!(config.retry.fast_delay(), Duration::from_millis(500));
        assert_eq!(config.retry.slow_backoff(), Duration::from_secs(60));
    }

    #[test]
    fn test_full_sync_zero_disables_sweep() {
        let mut config = SyncConfig::default();
        assert_eq!(config.full_sync_interval(), Some(Duration::from_secs(300)));

        config.full_sync_interval_secs = 0;
        assert_eq!(config.full_sync_interval(), None);
    }

    #[test]
    fn test_shard_prefix_derivation() {
        let mut config = SyncConfig::default();
        assert_eq!(config.shard_prefix(), "Default-Cloud--cluster-shard-");

        config.shard_vs_prefix = Some("edge-".to_string());
        assert_eq!(config.shard_prefix(), "edge-");
    }

    #[test]
    fn test_env_overrides() {
        let config = SyncConfig::from_lookup(lookup_from(&[
            ("LBSYNC_TENANT", "team-a"),
            ("LBSYNC_SHARD_VS_COUNT", "4"),
            ("LBSYNC_FULL_SYNC_INTERVAL", "0"),
            ("LBSYNC_CONTROLLER_URL", "http://10.0.0.10"),
            ("LBSYNC_RECONCILE_SHARDS", "3"),
        ]))
        .unwrap();

        assert_eq!(config.tenant, "team-a");
        assert_eq!(config.shard_vs_count, 4);
        assert_eq!(config.full_sync_interval(), None);
        assert_eq!(config.controller.url.as_deref(), Some("http://10.0.0.10"));
        assert_eq!(
            config.connection_count(),
            3,
            "connections default to the reconcile shard count"
        );
    }

    #[test]
    fn test_invalid_values_are_rejected() {
        let err = SyncConfig::from_lookup(lookup_from(&[("LBSYNC_SHARD_VS_COUNT", "many")]));
        assert!(matches!(err, Err(SyncError::Config(_))));

        let err = SyncConfig::from_lookup(lookup_from(&[("LBSYNC_RECONCILE_SHARDS", "0")]));
        assert!(matches!(err, Err(SyncError::Config(_))));

        let err = SyncConfig::from_lookup(lookup_from(&[("LBSYNC_TENANT", "a/b")]));
        assert!(matches!(err, Err(SyncError::Config(_))));
    }
}
