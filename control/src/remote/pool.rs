//! Shard-indexed pool of remote clients
//!
//! A model is always served by client `bucket(model, len)`, so the remote
//! operations of one model are serialized on one connection while different
//! models proceed in parallel.

use std::sync::Arc;

use common::bucket;

use super::RemoteClient;

#[derive(Clone, Default)]
pub struct ClientPool {
    clients: Vec<Arc<dyn RemoteClient>>,
}

impl ClientPool {
    pub fn new(clients: Vec<Arc<dyn RemoteClient>>) -> Self {
        Self { clients }
    }

    /// `count` handles to the same client
    pub fn shared(client: Arc<dyn RemoteClient>, count: u32) -> Self {
        Self {
            clients: (0..count.max(1)).map(|_| client.clone()).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    /// Client serving `model`; `None` only for an empty pool
    pub fn for_model(&self, model: &str) -> Option<Arc<dyn RemoteClient>> {
        if self.clients.is_empty() {
            return None;
        }
        let idx = bucket(model, self.clients.len() as u32) as usize;
        self.clients.get(idx).cloned()
    }

    /// Client for work not tied to one model (bulk refresh)
    pub fn any(&self) -> Option<Arc<dyn RemoteClient>> {
        self.clients.first().cloned()
    }
}

impl std::fmt::Debug for ClientPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientPool")
            .field("clients", &self.clients.len())
            .finish()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;
    use crate::remote::InMemoryController;

    #[test]
    fn test_empty_pool_serves_nothing() {
        let pool = ClientPool::default();
        assert!(pool.is_empty());
        assert!(pool.for_model("admin/vs").is_none());
        assert!(pool.any().is_none());
    }

    #[test]
    fn test_model_always_gets_same_client() {
        let clients: Vec<Arc<dyn RemoteClient>> = (0..4)
            .map(|_| Arc::new(InMemoryController::new("admin")) as Arc<dyn RemoteClient>)
            .collect();
        let pool = ClientPool::new(clients);

        let first = pool.for_model("admin/cluster--default-web").unwrap();
        for _ in 0..10 {
            let again = pool.for_model("admin/cluster--default-web").unwrap();
            assert!(Arc::ptr_eq(&first, &again));
        }
    }
}
