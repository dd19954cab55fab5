//! Kubernetes-facing side of the controller
//!
//! Watchers fill the cluster store and publish source keys; the status writer
//! reports assigned addresses back; metrics are served on `/metrics`.

pub mod cluster;
pub mod metrics;
pub mod status;
pub mod watchers;
