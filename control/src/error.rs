use thiserror::Error;

use crate::remote::RemoteError;

/// lbsync control-plane errors
#[derive(Error, Debug)]
pub enum SyncError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Kubernetes error: {0}")]
    Kubernetes(#[from] kube::Error),

    #[error("Remote controller error: {0}")]
    Remote(#[from] RemoteError),

    #[error("Cluster state not ready: {0} has not completed its initial list")]
    ClusterNotReady(&'static str),

    #[error("Sync disabled: {0}")]
    SyncDisabled(String),

    #[error("Malformed key: {0}")]
    MalformedKey(String),

    #[error("Sync pipeline already started")]
    AlreadyStarted,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
