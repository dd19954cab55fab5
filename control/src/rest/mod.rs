//! Apply layer: graph snapshots → ordered remote operations → cache
//!
//! - [`plan`] diffs one virtual service against the cache
//! - [`builders`] renders node payloads
//! - [`fold`] writes successful responses back into the cache
//! - [`reconciler`] runs the batches of a model in order and reports the
//!   outcome

pub mod builders;
pub mod fold;
pub mod plan;
pub mod reconciler;
pub mod state;
pub mod status;

pub use builders::PayloadContext;
pub use reconciler::{FailedOp, Reconciler, SyncOutcome};
pub use state::{ModelStates, SyncState};
pub use status::{status_channel, StatusEvent, StatusReceiver, StatusSender};
