//! Post-apply notifications
//!
//! The reconciler only emits these; writing addresses back to the cluster is
//! the status writer's job (`apis::status`).

use tokio::sync::mpsc;

use crate::graph::nodes::ServiceMetadata;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatusEvent {
    /// A model's top-level VS was created or updated
    Applied {
        model: String,
        vip: Option<String>,
        metadata: ServiceMetadata,
    },
    /// A model's top-level VS was deleted
    Removed {
        model: String,
        metadata: ServiceMetadata,
    },
}

impl StatusEvent {
    pub fn model(&self) -> &str {
        match self {
            StatusEvent::Applied { model, .. } | StatusEvent::Removed { model, .. } => model,
        }
    }

    pub fn metadata(&self) -> &ServiceMetadata {
        match self {
            StatusEvent::Applied { metadata, .. } | StatusEvent::Removed { metadata, .. } => metadata,
        }
    }
}

pub type StatusSender = mpsc::UnboundedSender<StatusEvent>;
pub type StatusReceiver = mpsc::UnboundedReceiver<StatusEvent>;

pub fn status_channel() -> (StatusSender, StatusReceiver) {
    mpsc::unbounded_channel()
}
