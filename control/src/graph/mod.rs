//! Desired state: object graphs built from the cluster snapshot
//!
//! ```text
//! ClusterState ──► GraphBuilder ──► ModelStore
//!                   │    ▲
//!                   ▼    │
//!               RelationIndex
//! ```

pub mod backends;
pub mod builder;
pub mod l4;
pub mod l7;
pub mod nodes;
pub mod object_graph;
pub mod relations;
pub mod rules;
pub mod store;
pub mod vrf;

pub use builder::{GraphBuilder, ModelTarget, Naming};
pub use nodes::{GraphNode, NodeKind};
pub use object_graph::ObjectGraph;
pub use relations::RelationIndex;
pub use rules::{HostRuleTable, NoRouteRules, RouteRuleEnricher, RuleAttributes};
pub use store::{ModelSnapshot, ModelStore};
