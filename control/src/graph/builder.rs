//! Graph builder - source key → affected models → rebuilt graphs
//!
//! ## Flow
//!
//! ```text
//! "Kind/ns/name" ──resolve──► {ModelTarget} ──build──► BuiltModel
//!                   │                                     │
//!          RelationIndex (old mappings)      RelationIndex + ModelStore
//!          ClusterState (new mappings)       updated in one pass
//! ```
//!
//! Graphs are always rebuilt from the cluster snapshot; the event only says
//! which models to look at. Rebuilding the same snapshot twice yields the same
//! checksum, so duplicate or reordered events are harmless.

use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, info, warn};

use common::{bucket, fnv1a_hash32};

use super::backends::is_load_balancer;
use super::l4::build_l4_model;
use super::l7::{build_shard_model, ingress_routes};
use super::object_graph::ObjectGraph;
use super::relations::RelationIndex;
use super::rules::RouteRuleEnricher;
use super::store::ModelStore;
use super::vrf::build_vrf_model;
use crate::apis::cluster::ClusterState;
use crate::config::SyncConfig;
use crate::keys::{ObjKey, SourceKey, SourceKind};
use crate::locks::safe_lock;

// =============================================================================
// Naming
// =============================================================================

/// Object naming derived from configuration
#[derive(Debug, Clone)]
pub struct Naming {
    pub tenant: String,
    pub cluster: String,
    pub vrf: String,
    pub shard_prefix: String,
    pub shard_count: u32,
}

impl Naming {
    pub fn from_config(config: &SyncConfig) -> Self {
        Self {
            tenant: config.tenant.clone(),
            cluster: config.cluster_name.clone(),
            vrf: config.vrf_name.clone(),
            shard_prefix: config.shard_prefix(),
            shard_count: config.shard_vs_count,
        }
    }

    pub fn model_name(&self, vs_name: &str) -> String {
        format!("{}/{}", self.tenant, vs_name)
    }

    pub fn l4_vs_name(&self, namespace: &str, name: &str) -> String {
        format!("{}--{}-{}", self.cluster, namespace, name)
    }

    pub fn shard_vs_name(&self, host: &str) -> String {
        format!("{}{}", self.shard_prefix, bucket(host, self.shard_count))
    }

    pub fn sni_child_name(&self, host: &str) -> String {
        format!("{}--{}", self.cluster, host)
    }

    /// `/` in the path becomes `_`; a path that already contains `_` gets a
    /// hash of the raw path appended so `/a_b` and `/a/b` stay distinct
    pub fn l7_pool_name(&self, host: &str, path: &str, ingress: &ObjKey) -> String {
        let mut flat = path.replace('/', "_");
        if path.contains('_') {
            flat = format!("{}-{:08x}", flat, fnv1a_hash32(path.as_bytes()));
        }
        format!(
            "{}--{}{}-{}-{}",
            self.cluster, host, flat, ingress.namespace, ingress.name
        )
    }

    /// Certificates are owned by one SNI child, never shared
    pub fn cert_name(&self, sni_child: &str) -> String {
        format!("{}-cert", sni_child)
    }

    pub fn vrf_model_name(&self) -> String {
        self.model_name(&self.vrf)
    }

    fn is_shard_vs(&self, vs_name: &str) -> bool {
        vs_name
            .strip_prefix(&self.shard_prefix)
            .and_then(|n| n.parse::<u32>().ok())
            .map(|n| n < self.shard_count)
            .unwrap_or(false)
    }
}

// =============================================================================
// Build results
// =============================================================================

/// What one Ingress references
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IngressRefs {
    pub ingress: ObjKey,
    pub services: BTreeSet<ObjKey>,
    pub secrets: BTreeSet<ObjKey>,
}

/// Output of building one model
#[derive(Debug)]
pub struct BuiltModel {
    pub model_name: String,
    /// `None` when no cluster object contributes any more
    pub graph: Option<ObjectGraph>,
    pub sources: BTreeSet<SourceKey>,
    pub ingresses: Vec<IngressRefs>,
    /// host → rules applied to it
    pub host_rules: Vec<(String, BTreeSet<ObjKey>)>,
}

impl BuiltModel {
    pub fn empty(model_name: String) -> Self {
        Self {
            model_name,
            graph: None,
            sources: BTreeSet::new(),
            ingresses: Vec::new(),
            host_rules: Vec::new(),
        }
    }
}

/// Which kind of model a name refers to
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum ModelTarget {
    L4 { service: ObjKey },
    Shard { vs_name: String },
    Vrf,
}

// =============================================================================
// GraphBuilder
// =============================================================================

pub struct GraphBuilder {
    cluster: Arc<dyn ClusterState>,
    store: Arc<ModelStore>,
    relations: Arc<RelationIndex>,
    rules: Arc<dyn RouteRuleEnricher>,
    naming: Naming,
}

impl GraphBuilder {
    pub fn new(
        naming: Naming,
        cluster: Arc<dyn ClusterState>,
        store: Arc<ModelStore>,
        relations: Arc<RelationIndex>,
        rules: Arc<dyn RouteRuleEnricher>,
    ) -> Self {
        Self {
            cluster,
            store,
            relations,
            rules,
            naming,
        }
    }

    pub fn cluster(&self) -> &Arc<dyn ClusterState> {
        &self.cluster
    }

    pub fn relations(&self) -> &Arc<RelationIndex> {
        &self.relations
    }

    pub fn naming(&self) -> &Naming {
        &self.naming
    }

    /// Rebuild every model affected by a change to `namespace/name`.
    ///
    /// `key` is the full `Kind/Namespace/Name` work item. Returns the models
    /// whose stored graph changed (tombstones included); those need a
    /// reconcile.
    pub fn build_model(&self, namespace: &str, name: &str, key: &str) -> BTreeSet<String> {
        let kind = match key.parse::<SourceKey>() {
            Ok(parsed) => parsed.kind,
            Err(e) => {
                warn!("Dropping ingestion key {}: {}", key, e);
                return BTreeSet::new();
            }
        };
        let source = SourceKey::new(kind, namespace, name);
        let targets = self.resolve(&source);
        debug!(
            key = %key,
            targets = targets.len(),
            "Resolved source to models"
        );

        targets
            .into_iter()
            .filter_map(|target| self.rebuild(&target))
            .collect()
    }

    /// Rebuild every model derivable from the snapshot plus every model still
    /// indexed, returning the ones that changed
    pub fn resync_all(&self) -> BTreeSet<String> {
        let mut targets: BTreeSet<ModelTarget> = BTreeSet::new();
        targets.insert(ModelTarget::Vrf);

        for svc in self.cluster.services() {
            if is_load_balancer(&svc) {
                targets.insert(ModelTarget::L4 {
                    service: ObjKey::new(
                        kube::ResourceExt::namespace(&svc).unwrap_or_default(),
                        kube::ResourceExt::name_any(&svc),
                    ),
                });
            }
        }
        for ingress in self.cluster.ingresses() {
            let (routes, _) = ingress_routes(&ingress);
            for route in routes {
                targets.insert(ModelTarget::Shard {
                    vs_name: self.naming.shard_vs_name(&route.host),
                });
            }
        }
        for model in self.relations.indexed_models() {
            if let Some(target) = self.target_for_model(&model) {
                targets.insert(target);
            }
        }

        let changed: BTreeSet<String> = targets
            .iter()
            .filter_map(|target| self.rebuild(target))
            .collect();
        if !changed.is_empty() {
            info!("Resync rebuilt {} changed model(s)", changed.len());
        }
        changed
    }

    /// Map a stored model name back to what builds it
    pub fn target_for_model(&self, model: &str) -> Option<ModelTarget> {
        if model == self.naming.vrf_model_name() {
            return Some(ModelTarget::Vrf);
        }
        let (_, vs_name) = model.split_once('/')?;
        if self.naming.is_shard_vs(vs_name) {
            return Some(ModelTarget::Shard {
                vs_name: vs_name.to_string(),
            });
        }
        self.relations
            .sources_for_model(model)
            .into_iter()
            .find(|s| s.kind == SourceKind::Service)
            .map(|s| ModelTarget::L4 {
                service: s.obj_key(),
            })
    }

    fn shard_targets_for_source(&self, source: &SourceKey) -> BTreeSet<ModelTarget> {
        self.relations
            .models_for_source(source)
            .into_iter()
            .filter_map(|model| self.target_for_model(&model))
            .filter(|t| matches!(t, ModelTarget::Shard { .. }))
            .collect()
    }

    fn resolve(&self, source: &SourceKey) -> BTreeSet<ModelTarget> {
        let mut targets = BTreeSet::new();
        match source.kind {
            SourceKind::Service | SourceKind::Endpoints => {
                let service = source.obj_key();
                targets.insert(ModelTarget::L4 {
                    service: service.clone(),
                });
                for ingress in self.relations.ingresses_for_service(&service) {
                    let key = SourceKey::new(SourceKind::Ingress, ingress.namespace, ingress.name);
                    targets.extend(self.shard_targets_for_source(&key));
                }
            }
            SourceKind::Ingress => {
                // old shards from the index, new shards from the snapshot
                targets.extend(self.shard_targets_for_source(source));
                if let Some(ingress) = self.cluster.ingress(&source.namespace, &source.name) {
                    let (routes, _) = ingress_routes(&ingress);
                    for route in routes {
                        targets.insert(ModelTarget::Shard {
                            vs_name: self.naming.shard_vs_name(&route.host),
                        });
                    }
                }
            }
            SourceKind::Secret => {
                for ingress in self.relations.ingresses_for_secret(&source.obj_key()) {
                    let key = SourceKey::new(SourceKind::Ingress, ingress.namespace, ingress.name);
                    targets.extend(self.shard_targets_for_source(&key));
                }
            }
            SourceKind::Node => {
                targets.insert(ModelTarget::Vrf);
            }
            SourceKind::HostRule => {
                let rule = source.obj_key();
                let mut hosts = self.relations.hosts_for_rule(&rule);
                hosts.extend(self.rules.rule_hosts(&rule));
                for host in hosts {
                    targets.insert(ModelTarget::Shard {
                        vs_name: self.naming.shard_vs_name(&host),
                    });
                }
            }
        }
        targets
    }

    /// Model name a target builds
    pub fn model_name_for(&self, target: &ModelTarget) -> String {
        match target {
            ModelTarget::L4 { service } => self
                .naming
                .model_name(&self.naming.l4_vs_name(&service.namespace, &service.name)),
            ModelTarget::Shard { vs_name } => self.naming.model_name(vs_name),
            ModelTarget::Vrf => self.naming.vrf_model_name(),
        }
    }

    /// Build one model, commit index and store together, and return the
    /// model name if the stored graph changed.
    ///
    /// The model's build lock is held from the first cluster read until the
    /// save, so a rebuild from an older snapshot can never land after one
    /// from a newer snapshot.
    fn rebuild(&self, target: &ModelTarget) -> Option<String> {
        let lock = self.store.build_lock(&self.model_name_for(target));
        let _guard = safe_lock(&lock);

        let built = match target {
            ModelTarget::L4 { service } => {
                build_l4_model(self.cluster.as_ref(), &self.naming, &service.namespace, &service.name)
            }
            ModelTarget::Shard { vs_name } => {
                build_shard_model(self.cluster.as_ref(), &self.naming, self.rules.as_ref(), vs_name)
            }
            ModelTarget::Vrf => build_vrf_model(self.cluster.as_ref(), &self.naming),
        };
        self.commit(built)
    }

    fn commit(&self, built: BuiltModel) -> Option<String> {
        let BuiltModel {
            model_name,
            graph,
            sources,
            ingresses,
            host_rules,
        } = built;

        // Ingresses that used to feed this model but no longer exist lose
        // their relations here
        for old in self.relations.sources_for_model(&model_name) {
            if old.kind == SourceKind::Ingress
                && !sources.contains(&old)
                && self.cluster.ingress(&old.namespace, &old.name).is_none()
            {
                self.relations.remove_ingress(&old.obj_key());
            }
        }
        for refs in ingresses {
            self.relations
                .update_ingress(&refs.ingress, refs.services, refs.secrets);
        }
        for (host, rules) in host_rules {
            self.relations.update_host_rules(&host, rules);
        }
        self.relations.update_model_sources(&model_name, sources);

        let tombstone = graph.is_none();
        if self.store.save_if_changed(&model_name, graph) {
            if tombstone {
                info!(model = %model_name, "Model has no sources left, tombstoned");
            } else {
                debug!(model = %model_name, "Model graph changed");
            }
            Some(model_name)
        } else {
            None
        }
    }
}
