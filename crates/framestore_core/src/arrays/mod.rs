//! Immutable arrays and frames over segment storage.
pub mod array;
pub mod batch;
pub mod frame;

pub use array::{Array, ArrayReader, ArrayWriter, SegmentAppender};
pub use batch::Batch;
pub use frame::{Frame, FrameReader, FrameWriter};

/// Bounds of partition `idx` when splitting `len` rows into `n` contiguous
/// partitions.
///
/// Partitions differ in size by at most one row, with the extra rows going to
/// the earliest partitions.
pub fn partition_bounds(len: u64, n: u64, idx: u64) -> (u64, u64) {
    let base = len / n;
    let rem = len % n;
    let begin = idx * base + idx.min(rem);
    let size = base + u64::from(idx < rem);
    (begin, begin + size)
}
