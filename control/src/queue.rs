//! Sharded work queues
//!
//! ```text
//! publish(key) ──▶ bucket(key, N) ──▶ shard i: pending set + unbounded channel
//!                                              │
//!                                              ▼
//!                                      worker i: handler.handle(key)
//! ```
//!
//! A key always lands on the same shard, so all work for one key is handled
//! by one worker in publish order. A key already waiting on its shard is not
//! queued twice; it becomes publishable again as soon as its worker picks it
//! up.

use std::collections::HashSet;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::apis::metrics::set_queue_depth;
use crate::error::SyncError;
use crate::locks::safe_lock;

/// Consumer of one queue's keys
#[async_trait]
pub trait KeyHandler: Send + Sync + 'static {
    async fn handle(&self, key: String);
}

struct Shard {
    tx: mpsc::UnboundedSender<String>,
    rx: Mutex<Option<mpsc::UnboundedReceiver<String>>>,
    pending: Mutex<HashSet<String>>,
}

pub struct ShardedQueue {
    name: &'static str,
    shards: Vec<Shard>,
    depth: AtomicUsize,
    /// Cancelled once the workers stop; pending delayed publishes are dropped
    stopped: CancellationToken,
}

impl std::fmt::Debug for ShardedQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShardedQueue")
            .field("name", &self.name)
            .field("shards", &self.shards.len())
            .field("depth", &self.len())
            .finish()
    }
}

impl ShardedQueue {
    /// `shards` of zero is treated as one
    pub fn new(name: &'static str, shards: u32) -> Self {
        let shards = (0..shards.max(1))
            .map(|_| {
                let (tx, rx) = mpsc::unbounded_channel();
                Shard {
                    tx,
                    rx: Mutex::new(Some(rx)),
                    pending: Mutex::new(HashSet::new()),
                }
            })
            .collect();
        Self {
            name,
            shards,
            depth: AtomicUsize::new(0),
            stopped: CancellationToken::new(),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    pub fn shard_for(&self, key: &str) -> usize {
        common::bucket(key, self.shards.len() as u32) as usize
    }

    /// Keys waiting across all shards
    pub fn len(&self) -> usize {
        self.depth.load(Ordering::Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether `key` is waiting to be handled
    pub fn is_pending(&self, key: &str) -> bool {
        self.shards
            .get(self.shard_for(key))
            .map(|s| safe_lock(&s.pending).contains(key))
            .unwrap_or(false)
    }

    /// Queue `key` on its shard; returns false when it was already waiting
    pub fn publish(&self, key: impl Into<String>) -> bool {
        let key = key.into();
        let idx = self.shard_for(&key);
        let Some(shard) = self.shards.get(idx) else {
            return false;
        };
        if !safe_lock(&shard.pending).insert(key.clone()) {
            debug!(queue = self.name, shard = idx, key = %key, "Already queued");
            return false;
        }
        if shard.tx.send(key.clone()).is_err() {
            safe_lock(&shard.pending).remove(&key);
            debug!(queue = self.name, shard = idx, key = %key, "Queue closed, key dropped");
            return false;
        }
        let depth = self.depth.fetch_add(1, Ordering::Relaxed) + 1;
        set_queue_depth(self.name, depth as i64);
        true
    }

    /// Queue `key` once `delay` has passed, unless the workers stop first
    pub fn publish_after(self: &Arc<Self>, key: impl Into<String>, delay: Duration) -> JoinHandle<()> {
        let key = key.into();
        let queue = Arc::clone(self);
        tokio::spawn(async move {
            tokio::select! {
                _ = queue.stopped.cancelled() => {
                    debug!(queue = queue.name, key = %key, "Queue stopped, delayed key dropped");
                }
                _ = tokio::time::sleep(delay) => {
                    queue.publish(key);
                }
            }
        })
    }

    fn take(&self, idx: usize, key: &str) {
        if let Some(shard) = self.shards.get(idx) {
            safe_lock(&shard.pending).remove(key);
        }
        let depth = self
            .depth
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |d| Some(d.saturating_sub(1)))
            .unwrap_or(0)
            .saturating_sub(1);
        set_queue_depth(self.name, depth as i64);
    }

    /// Spawn one worker per shard.
    ///
    /// Workers stop on `cancel` after handling whatever was already queued.
    /// A panicking handler is logged and the worker moves on to the next key.
    pub fn start(
        self: &Arc<Self>,
        handler: Arc<dyn KeyHandler>,
        cancel: CancellationToken,
    ) -> Result<Vec<JoinHandle<()>>, SyncError> {
        let mut receivers = Vec::with_capacity(self.shards.len());
        for shard in &self.shards {
            match safe_lock(&shard.rx).take() {
                Some(rx) => receivers.push(rx),
                None => return Err(SyncError::AlreadyStarted),
            }
        }

        info!("Starting {} {} worker(s)", receivers.len(), self.name);
        let handles = receivers
            .into_iter()
            .enumerate()
            .map(|(idx, mut rx)| {
                let queue = Arc::clone(self);
                let handler = Arc::clone(&handler);
                let cancel = cancel.clone();
                tokio::spawn(async move {
                    loop {
                        tokio::select! {
                            biased;
                            _ = cancel.cancelled() => break,
                            item = rx.recv() => match item {
                                Some(key) => queue.process(idx, key, handler.as_ref()).await,
                                None => break,
                            },
                        }
                    }
                    queue.stopped.cancel();
                    while let Ok(key) = rx.try_recv() {
                        queue.process(idx, key, handler.as_ref()).await;
                    }
                    debug!(queue = queue.name, shard = idx, "Worker stopped");
                })
            })
            .collect();
        Ok(handles)
    }

    async fn process(&self, idx: usize, key: String, handler: &dyn KeyHandler) {
        self.take(idx, &key);
        let result = AssertUnwindSafe(handler.handle(key.clone()))
            .catch_unwind()
            .await;
        if result.is_err() {
            error!(queue = self.name, shard = idx, key = %key, "Handler panicked");
        }
    }
}
