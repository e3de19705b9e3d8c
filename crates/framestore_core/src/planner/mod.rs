//! Lazy plans of deferred operations, and the rewrites run on them before
//! execution.
pub mod callbacks;
pub mod fusion;
pub mod node;
pub mod resolve;
pub mod segment;
pub mod slice;

pub use callbacks::{Aggregator, Count, Max, Min, RowTransform, Sum, ValuePredicate, ValueTransform};
pub use fusion::{Fuser, OptimizeRule};
pub use node::{NodeId, NodeKind, Plan, PlanGraph, PlannerNode};
pub use segment::{domain_length, segment};
pub use slice::{slice, slice_into};
