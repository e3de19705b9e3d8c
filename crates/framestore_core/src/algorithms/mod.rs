//! Out of core algorithms over materialized frames.
pub mod join;
pub mod permute;
pub mod sort;

pub use join::{JoinStrategy, JoinType, join, join_with};
pub use permute::permute;
pub use sort::{SortKey, sort};
