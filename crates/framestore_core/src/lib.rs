//! Out of core columnar frames with lazy, parallel query execution.
//!
//! Data lives in immutable, segmented on-disk [`Array`]s grouped into
//! [`Frame`]s. Operations on [`LazyFrame`] and [`LazyArray`] handles build a
//! plan graph that is only executed on materialization, producing new
//! arrays. Sorting, joining and permuting run out of core within the memory
//! limits set through the session's settings.
pub mod algorithms;
pub mod arrays;
pub mod config;
pub mod execution;
pub mod lazy;
pub mod planner;
pub mod session;
pub mod storage;
pub mod testutil;
pub mod value;

pub use algorithms::{JoinStrategy, JoinType, SortKey};
pub use arrays::{Array, Batch, Frame};
pub use config::{Settings, SettingsSnapshot};
pub use framestore_error::{FrameStoreError, Result};
pub use lazy::{LazyArray, LazyFrame};
pub use planner::{Aggregator, RowTransform, ValuePredicate, ValueTransform};
pub use session::Session;
pub use value::{Value, ValueType};
