//! lbsync control plane
//!
//! Keeps a remote load-balancer controller in line with Kubernetes Services
//! and Ingresses.
//!
//! ```text
//! watchers ─▶ ClusterStore ─▶ GraphBuilder ─▶ ModelStore
//!                                                │
//!                  ControllerCache ◀─fold── Reconciler ─▶ remote controller
//!                        ▲                       │
//!                        └──── retry tiers ◀─────┘
//! ```

pub mod apis;
pub mod cache;
pub mod config;
pub mod error;
pub mod full_sync;
pub mod graph;
pub mod keys;
mod locks;
pub mod pipeline;
pub mod queue;
pub mod remote;
pub mod rest;
pub mod retry;

pub use config::SyncConfig;
pub use error::SyncError;
pub use pipeline::SyncPipeline;
