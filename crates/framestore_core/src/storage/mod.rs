//! On-disk storage: blocks, segments, and index manifests.
pub mod block;
pub mod dir;
pub mod index;
pub mod segment;

pub use block::{BlockInfo, BlockStats};
pub use dir::{SegmentFile, StorageDir};
pub use segment::{SegmentHandle, SegmentIter, SegmentReader, SegmentWriter};
