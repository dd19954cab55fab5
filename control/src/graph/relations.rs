//! Relationship index - source objects ↔ the models they feed
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │                          RelationIndex                                │
//! ├──────────────────────────────────────────────────────────────────────┤
//! │  service ↔ ingress      BiIndex<ObjKey, ObjKey>   (ingress on left)   │
//! │  ingress ↔ secret       BiIndex<ObjKey, ObjKey>   (ingress on left)   │
//! │  host    ↔ rule         BiIndex<String, ObjKey>   (host on left)      │
//! │  source  ↔ model        BiIndex<String, SourceKey> (model on left)    │
//! ├──────────────────────────────────────────────────────────────────────┤
//! │  Metrics (atomics): lookups, hits, updates                            │
//! └──────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Each map is replaced per left-hand key in one write-locked pass: the old
//! right-hand set is removed and the new one added together, so a reader
//! never sees a half-updated relation.

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;

use crate::keys::{ObjKey, SourceKey};
use crate::locks::{safe_read, safe_write};

// =============================================================================
// RelationMetrics - Lock-free atomic counters
// =============================================================================

#[derive(Debug, Default)]
pub struct RelationMetrics {
    /// Total fan-out lookups
    lookups: AtomicU64,
    /// Lookups that resolved to at least one related key
    hits: AtomicU64,
    /// Transactional replacements
    updates: AtomicU64,
}

impl RelationMetrics {
    #[inline(always)]
    fn record_lookup(&self, hit: bool) {
        self.lookups.fetch_add(1, Ordering::Relaxed);
        if hit {
            self.hits.fetch_add(1, Ordering::Relaxed);
        }
    }

    #[inline(always)]
    fn record_update(&self) {
        self.updates.fetch_add(1, Ordering::Relaxed);
    }

    pub fn lookups(&self) -> u64 {
        self.lookups.load(Ordering::Relaxed)
    }

    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn updates(&self) -> u64 {
        self.updates.load(Ordering::Relaxed)
    }

    /// Format metrics in Prometheus exposition format
    pub fn to_prometheus(&self) -> String {
        format!(
            r#"# HELP lbsync_relation_lookups_total Relationship index fan-out lookups
# TYPE lbsync_relation_lookups_total counter
lbsync_relation_lookups_total {lookups}
# HELP lbsync_relation_hits_total Relationship index lookups that found related keys
# TYPE lbsync_relation_hits_total counter
lbsync_relation_hits_total {hits}
# HELP lbsync_relation_updates_total Relationship index transactional replacements
# TYPE lbsync_relation_updates_total counter
lbsync_relation_updates_total {updates}
"#,
            lookups = self.lookups(),
            hits = self.hits(),
            updates = self.updates(),
        )
    }
}

// =============================================================================
// BiIndex
// =============================================================================

#[derive(Debug)]
struct BiMaps<L, R> {
    forward: HashMap<L, BTreeSet<R>>,
    reverse: HashMap<R, BTreeSet<L>>,
}

/// Bidirectional many-to-many map
#[derive(Debug)]
pub struct BiIndex<L, R> {
    inner: RwLock<BiMaps<L, R>>,
}

impl<L, R> Default for BiIndex<L, R> {
    fn default() -> Self {
        Self {
            inner: RwLock::new(BiMaps {
                forward: HashMap::new(),
                reverse: HashMap::new(),
            }),
        }
    }
}

impl<L, R> BiIndex<L, R>
where
    L: Clone + Eq + Hash + Ord,
    R: Clone + Eq + Hash + Ord,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace everything `left` relates to with `rights`
    pub fn replace(&self, left: &L, rights: BTreeSet<R>) {
        let mut maps = safe_write(&self.inner);
        if let Some(old) = maps.forward.remove(left) {
            for right in old {
                if let Some(lefts) = maps.reverse.get_mut(&right) {
                    lefts.remove(left);
                    if lefts.is_empty() {
                        maps.reverse.remove(&right);
                    }
                }
            }
        }
        if rights.is_empty() {
            return;
        }
        for right in &rights {
            maps.reverse
                .entry(right.clone())
                .or_default()
                .insert(left.clone());
        }
        maps.forward.insert(left.clone(), rights);
    }

    pub fn remove_left(&self, left: &L) {
        self.replace(left, BTreeSet::new());
    }

    pub fn rights(&self, left: &L) -> BTreeSet<R> {
        safe_read(&self.inner)
            .forward
            .get(left)
            .cloned()
            .unwrap_or_default()
    }

    pub fn lefts(&self, right: &R) -> BTreeSet<L> {
        safe_read(&self.inner)
            .reverse
            .get(right)
            .cloned()
            .unwrap_or_default()
    }

    pub fn all_lefts(&self) -> Vec<L> {
        safe_read(&self.inner).forward.keys().cloned().collect()
    }

    pub fn all_rights(&self) -> Vec<R> {
        safe_read(&self.inner).reverse.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        safe_read(&self.inner).forward.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// =============================================================================
// RelationIndex
// =============================================================================

/// Every relation the graph builder needs for fan-out and fan-in
#[derive(Debug, Default)]
pub struct RelationIndex {
    /// ingress → backend services
    ingress_services: BiIndex<ObjKey, ObjKey>,
    /// ingress → TLS secrets
    ingress_secrets: BiIndex<ObjKey, ObjKey>,
    /// host → routing rules
    host_rules: BiIndex<String, ObjKey>,
    /// model → contributing source objects
    model_sources: BiIndex<String, SourceKey>,
    metrics: RelationMetrics,
}

impl RelationIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn metrics(&self) -> &RelationMetrics {
        &self.metrics
    }

    /// Record what one ingress references
    pub fn update_ingress(&self, ingress: &ObjKey, services: BTreeSet<ObjKey>, secrets: BTreeSet<ObjKey>) {
        self.ingress_services.replace(ingress, services);
        self.ingress_secrets.replace(ingress, secrets);
        self.metrics.record_update();
    }

    pub fn remove_ingress(&self, ingress: &ObjKey) {
        self.ingress_services.remove_left(ingress);
        self.ingress_secrets.remove_left(ingress);
        self.metrics.record_update();
    }

    pub fn ingresses_for_service(&self, service: &ObjKey) -> BTreeSet<ObjKey> {
        let found = self.ingress_services.lefts(service);
        self.metrics.record_lookup(!found.is_empty());
        found
    }

    pub fn ingresses_for_secret(&self, secret: &ObjKey) -> BTreeSet<ObjKey> {
        let found = self.ingress_secrets.lefts(secret);
        self.metrics.record_lookup(!found.is_empty());
        found
    }

    /// Record which rules currently apply to a host
    pub fn update_host_rules(&self, host: &str, rules: BTreeSet<ObjKey>) {
        self.host_rules.replace(&host.to_string(), rules);
        self.metrics.record_update();
    }

    pub fn hosts_for_rule(&self, rule: &ObjKey) -> BTreeSet<String> {
        let found = self.host_rules.lefts(rule);
        self.metrics.record_lookup(!found.is_empty());
        found
    }

    /// Replace the set of sources a model was built from
    pub fn update_model_sources(&self, model: &str, sources: BTreeSet<SourceKey>) {
        self.model_sources.replace(&model.to_string(), sources);
        self.metrics.record_update();
    }

    pub fn models_for_source(&self, source: &SourceKey) -> BTreeSet<String> {
        let found = self.model_sources.lefts(source);
        self.metrics.record_lookup(!found.is_empty());
        found
    }

    pub fn sources_for_model(&self, model: &str) -> BTreeSet<SourceKey> {
        self.model_sources.rights(&model.to_string())
    }

    /// Every model built so far that still has contributing sources
    pub fn indexed_models(&self) -> Vec<String> {
        self.model_sources.all_lefts()
    }

    /// Every source object some model was built from
    pub fn indexed_sources(&self) -> Vec<SourceKey> {
        self.model_sources.all_rights()
    }
}

impl fmt::Display for RelationIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "RelationIndex(models={}, ingresses={}, hosts={})",
            self.model_sources.len(),
            self.ingress_services.len(),
            self.host_rules.len()
        )
    }
}
