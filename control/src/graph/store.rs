//! Model store: the desired-state graphs, one slot per model
//!
//! ## Locking
//!
//! - Store-level `RwLock` over `tenant -> name -> slot`, held only to find or
//!   insert a slot.
//! - Per-model `Mutex` over the slot, held while a graph is swapped in or
//!   copied out.
//! - Per-model build lock, held by the graph builder from reading the cluster
//!   snapshot until the rebuilt graph is saved. Two workers rebuilding the
//!   same model commit in snapshot order.
//!
//! None of these locks is ever held across an await point.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use tracing::debug;

use super::object_graph::ObjectGraph;
use crate::locks::{safe_lock, safe_read, safe_write};

#[derive(Debug)]
struct ModelSlot {
    /// `None` is a tombstone: the model must be deleted remotely
    graph: Option<ObjectGraph>,
    retry_budget: u32,
}

/// Copy of one model handed to the reconciler
#[derive(Debug, Clone)]
pub struct ModelSnapshot {
    pub graph: Option<ObjectGraph>,
    pub retry_budget: u32,
}

impl ModelSnapshot {
    pub fn is_tombstone(&self) -> bool {
        self.graph.is_none()
    }
}

type Partition = HashMap<String, Arc<Mutex<ModelSlot>>>;

/// Namespace-partitioned graph store
#[derive(Debug)]
pub struct ModelStore {
    partitions: RwLock<HashMap<String, Partition>>,
    build_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    retry_budget: u32,
}

fn split_model(model_name: &str) -> (&str, &str) {
    model_name.split_once('/').unwrap_or(("", model_name))
}

impl ModelStore {
    /// `retry_budget` is the per-model retry allowance restored on every
    /// changed save and every full-sync sweep
    pub fn new(retry_budget: u32) -> Self {
        Self {
            partitions: RwLock::new(HashMap::new()),
            build_locks: Mutex::new(HashMap::new()),
            retry_budget,
        }
    }

    fn slot(&self, model_name: &str) -> Option<Arc<Mutex<ModelSlot>>> {
        let (tenant, name) = split_model(model_name);
        let partitions = safe_read(&self.partitions);
        partitions.get(tenant).and_then(|p| p.get(name)).cloned()
    }

    fn slot_or_insert(&self, model_name: &str) -> Arc<Mutex<ModelSlot>> {
        if let Some(slot) = self.slot(model_name) {
            return slot;
        }
        let (tenant, name) = split_model(model_name);
        let mut partitions = safe_write(&self.partitions);
        partitions
            .entry(tenant.to_string())
            .or_default()
            .entry(name.to_string())
            .or_insert_with(|| {
                Arc::new(Mutex::new(ModelSlot {
                    graph: None,
                    retry_budget: self.retry_budget,
                }))
            })
            .clone()
    }

    /// Lock serializing rebuilds of one model.
    ///
    /// Kept separate from the slot so the reconciler can copy a graph while a
    /// rebuild is in progress.
    pub fn build_lock(&self, model_name: &str) -> Arc<Mutex<()>> {
        safe_lock(&self.build_locks)
            .entry(model_name.to_string())
            .or_default()
            .clone()
    }

    /// Look up a model: `(found, graph)`, where a found tombstone is `(true, None)`
    pub fn get(&self, model_name: &str) -> (bool, Option<ObjectGraph>) {
        match self.slot(model_name) {
            Some(slot) => (true, safe_lock(&slot).graph.clone()),
            None => (false, None),
        }
    }

    /// Deep copy of a model for the reconciler
    pub fn get_copy(&self, model_name: &str) -> Option<ModelSnapshot> {
        let slot = self.slot(model_name)?;
        let slot = safe_lock(&slot);
        Some(ModelSnapshot {
            graph: slot.graph.clone(),
            retry_budget: slot.retry_budget,
        })
    }

    /// Store a graph, or a tombstone when `graph` is `None`
    pub fn save(&self, model_name: &str, graph: Option<ObjectGraph>) {
        let slot = self.slot_or_insert(model_name);
        let mut slot = safe_lock(&slot);
        slot.graph = graph;
        slot.retry_budget = self.retry_budget;
    }

    /// Store `graph` only if it differs from the stored one.
    ///
    /// Returns whether the model changed. A tombstone for a model that was
    /// never stored is not recorded.
    pub fn save_if_changed(&self, model_name: &str, graph: Option<ObjectGraph>) -> bool {
        let Some(slot) = self.slot(model_name) else {
            if graph.is_none() {
                return false;
            }
            self.save(model_name, graph);
            return true;
        };

        let mut slot = safe_lock(&slot);
        let unchanged = match (&slot.graph, &graph) {
            (Some(old), Some(new)) => old.checksum() == new.checksum(),
            (None, None) => true,
            _ => false,
        };
        if unchanged {
            debug!("Model {} unchanged, checksum matches", model_name);
            return false;
        }
        slot.graph = graph;
        slot.retry_budget = self.retry_budget;
        true
    }

    /// Remove a model entirely
    pub fn delete(&self, model_name: &str) -> bool {
        let (tenant, name) = split_model(model_name);
        let mut partitions = safe_write(&self.partitions);
        let Some(partition) = partitions.get_mut(tenant) else {
            return false;
        };
        let removed = partition.remove(name).is_some();
        if partition.is_empty() {
            partitions.remove(tenant);
        }
        removed
    }

    /// Remove a model only if it is still a tombstone.
    ///
    /// Called once remote deletion finished; a graph saved in the meantime
    /// survives.
    pub fn remove_tombstone(&self, model_name: &str) -> bool {
        let (tenant, name) = split_model(model_name);
        let mut partitions = safe_write(&self.partitions);
        let Some(partition) = partitions.get_mut(tenant) else {
            return false;
        };
        let is_tombstone = partition
            .get(name)
            .map(|slot| safe_lock(slot).graph.is_none())
            .unwrap_or(false);
        if is_tombstone {
            partition.remove(name);
            if partition.is_empty() {
                partitions.remove(tenant);
            }
        }
        is_tombstone
    }

    /// Spend one retry. Returns false when the budget is exhausted.
    pub fn consume_retry(&self, model_name: &str) -> bool {
        let Some(slot) = self.slot(model_name) else {
            return false;
        };
        let mut slot = safe_lock(&slot);
        if slot.retry_budget == 0 {
            return false;
        }
        slot.retry_budget -= 1;
        true
    }

    pub fn reset_retry_budgets(&self) {
        let partitions = safe_read(&self.partitions);
        for slot in partitions.values().flat_map(|p| p.values()) {
            safe_lock(slot).retry_budget = self.retry_budget;
        }
    }

    /// Every model name, tombstones included
    pub fn model_names(&self) -> Vec<String> {
        let partitions = safe_read(&self.partitions);
        let mut names: Vec<String> = partitions
            .iter()
            .flat_map(|(tenant, p)| p.keys().map(move |name| format!("{}/{}", tenant, name)))
            .collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        safe_read(&self.partitions).values().map(|p| p.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;
    use crate::graph::nodes::{GraphNode, PoolNode, PoolServer};

    fn graph(name: &str, server: &str) -> ObjectGraph {
        let mut graph = ObjectGraph::new("admin", name);
        let mut pool = PoolNode::new("admin", format!("{}-pool", name));
        pool.servers.push(PoolServer::new(server, 80));
        graph.add_node(GraphNode::Pool(pool));
        graph.finalize();
        graph
    }

    #[test]
    fn test_get_missing_model() {
        let store = ModelStore::new(10);
        assert_eq!(store.get("admin/none"), (false, None));
        assert!(store.get_copy("admin/none").is_none());
    }

    #[test]
    fn test_build_lock_is_shared_per_model() {
        let store = ModelStore::new(10);
        let a = store.build_lock("admin/web");
        assert!(Arc::ptr_eq(&a, &store.build_lock("admin/web")));
        assert!(!Arc::ptr_eq(&a, &store.build_lock("admin/other")));
    }

    #[test]
    fn test_save_and_get_copy() {
        let store = ModelStore::new(10);
        store.save("admin/web", Some(graph("web", "10.0.0.1")));

        let snapshot = store.get_copy("admin/web").unwrap();
        assert_eq!(snapshot.graph.unwrap().name(), "web");
        assert_eq!(snapshot.retry_budget, 10);
    }

    #[test]
    fn test_copy_is_isolated_from_later_saves() {
        let store = ModelStore::new(10);
        store.save("admin/web", Some(graph("web", "10.0.0.1")));
        let before = store.get_copy("admin/web").unwrap().graph.unwrap();

        store.save("admin/web", Some(graph("web", "10.0.0.2")));

        assert_eq!(before, graph("web", "10.0.0.1"), "snapshot must not change");
    }

    #[test]
    fn test_save_if_changed() {
        let store = ModelStore::new(10);
        assert!(store.save_if_changed("admin/web", Some(graph("web", "10.0.0.1"))));
        assert!(
            !store.save_if_changed("admin/web", Some(graph("web", "10.0.0.1"))),
            "identical rebuild must not count as a change"
        );
        assert!(store.save_if_changed("admin/web", Some(graph("web", "10.0.0.2"))));
    }

    #[test]
    fn test_tombstones() {
        let store = ModelStore::new(10);
        assert!(
            !store.save_if_changed("admin/ghost", None),
            "tombstone for an unknown model is a no-op"
        );
        assert!(store.is_empty());

        store.save("admin/web", Some(graph("web", "10.0.0.1")));
        assert!(store.save_if_changed("admin/web", None));
        assert_eq!(store.get("admin/web"), (true, None));
        assert!(!store.save_if_changed("admin/web", None));

        assert!(store.remove_tombstone("admin/web"));
        assert_eq!(store.get("admin/web"), (false, None));
    }

    #[test]
    fn test_remove_tombstone_keeps_live_graph() {
        let store = ModelStore::new(10);
        store.save("admin/web", Some(graph("web", "10.0.0.1")));
        assert!(!store.remove_tombstone("admin/web"));
        assert!(store.get("admin/web").0);
    }

    #[test]
    fn test_retry_budget_consumption_and_reset() {
        let store = ModelStore::new(2);
        store.save("admin/web", Some(graph("web", "10.0.0.1")));

        assert!(store.consume_retry("admin/web"));
        assert!(store.consume_retry("admin/web"));
        assert!(!store.consume_retry("admin/web"), "budget exhausted");

        store.reset_retry_budgets();
        assert!(store.consume_retry("admin/web"));

        store.save_if_changed("admin/web", Some(graph("web", "10.0.0.9")));
        assert_eq!(store.get_copy("admin/web").unwrap().retry_budget, 2);
    }

    #[test]
    fn test_model_names_across_tenants() {
        let store = ModelStore::new(10);
        store.save("admin/a", Some(graph("a", "10.0.0.1")));
        store.save("team/b", None);

        assert_eq!(store.model_names(), vec!["admin/a", "team/b"]);
        assert!(store.delete("team/b"));
        assert_eq!(store.len(), 1);
    }
}
