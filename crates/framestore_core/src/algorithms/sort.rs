//! External merge sort.
//!
//! Rows are buffered per worker up to a share of `sort_buffer_size`, sorted
//! in memory and spilled as temporary runs. Runs are then merged with a
//! binary heap into the output frame.
use std::cmp::{Ordering, Reverse};
use std::collections::{BinaryHeap, VecDeque};
use std::fmt;
use std::sync::Arc;

use framestore_error::{FrameStoreError, Result, internal};
use tracing::{debug, trace};

use crate::arrays::{Frame, FrameReader, FrameWriter, partition_bounds};
use crate::execution::{ExecutionContext, ExecutionGuard, default_names, lock_execution};
use crate::value::Value;

/// Maximum number of runs read at once while merging.
const MAX_MERGE_FAN_IN: usize = 64;

/// A column to sort by.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SortKey {
    pub column: String,
    pub descending: bool,
}

impl SortKey {
    pub fn ascending(column: impl Into<String>) -> Self {
        SortKey {
            column: column.into(),
            descending: false,
        }
    }

    pub fn descending(column: impl Into<String>) -> Self {
        SortKey {
            column: column.into(),
            descending: true,
        }
    }
}

/// Compare two key tuples, reversing columns flagged as descending.
pub(crate) fn compare_keys(a: &[Value], b: &[Value], descending: &[bool]) -> Ordering {
    for ((a, b), desc) in a.iter().zip(b).zip(descending) {
        let ord = a.cmp(b);
        let ord = if *desc { ord.reverse() } else { ord };
        if ord != Ordering::Equal {
            return ord;
        }
    }
    Ordering::Equal
}

/// Compare the key columns of two full rows.
pub(crate) fn compare_row_keys(
    a: &[Value],
    b: &[Value],
    key_indices: &[usize],
    descending: &[bool],
) -> Ordering {
    for (idx, desc) in key_indices.iter().zip(descending) {
        let ord = a[*idx].cmp(&b[*idx]);
        let ord = if *desc { ord.reverse() } else { ord };
        if ord != Ordering::Equal {
            return ord;
        }
    }
    Ordering::Equal
}

/// Approximate in-memory size of a row.
pub(crate) fn row_size(row: &[Value]) -> usize {
    row.iter().map(|v| v.estimated_size()).sum()
}

/// Pulls rows one at a time from a frame reader.
#[derive(Debug)]
pub(crate) struct RowCursor {
    reader: FrameReader,
    buffered: VecDeque<Vec<Value>>,
    batch_size: usize,
}

impl RowCursor {
    pub(crate) fn new(reader: FrameReader, batch_size: usize) -> Self {
        RowCursor {
            reader,
            buffered: VecDeque::new(),
            batch_size: batch_size.max(1),
        }
    }

    fn fill(&mut self) -> Result<()> {
        if self.buffered.is_empty() {
            if let Some(batch) = self.reader.next_batch(self.batch_size)? {
                self.buffered.extend(batch.into_rows());
            }
        }
        Ok(())
    }

    pub(crate) fn peek(&mut self) -> Result<Option<&Vec<Value>>> {
        self.fill()?;
        Ok(self.buffered.front())
    }

    pub(crate) fn next_row(&mut self) -> Result<Option<Vec<Value>>> {
        self.fill()?;
        Ok(self.buffered.pop_front())
    }
}

/// Sort a frame by one or more key columns.
///
/// The sort is stable. Output has the same schema as the input.
pub fn sort(frame: &Frame, keys: &[SortKey], ctx: &ExecutionContext) -> Result<Frame> {
    let guard = lock_execution();
    sort_with_guard(&guard, frame, keys, ctx)
}

pub(crate) fn sort_with_guard(
    _guard: &ExecutionGuard,
    frame: &Frame,
    keys: &[SortKey],
    ctx: &ExecutionContext,
) -> Result<Frame> {
    if keys.is_empty() {
        return Err(internal!("sort requires at least one key"));
    }
    let key_indices = keys
        .iter()
        .map(|k| frame.column_index(&k.column))
        .collect::<Result<Vec<_>>>()?;
    let descending: Arc<[bool]> = keys.iter().map(|k| k.descending).collect();

    let len = frame.len();
    let partitions = (ctx.num_workers() as u64)
        .min(frame.num_segments().max(1) as u64)
        .min(len)
        .max(1) as usize;
    let budget = (ctx.settings.sort_buffer_size as usize / partitions).max(1);
    debug!(rows = len, partitions, budget, "sorting frame");

    let runs = generate_runs(frame, &key_indices, &descending, partitions, budget, ctx)?;
    debug!(runs = runs.len(), "generated sort runs");

    merge_runs(frame, runs, &key_indices, &descending, partitions, ctx)
}

/// Sort chunks of each partition into temporary runs.
///
/// Runs are returned in input order.
fn generate_runs(
    frame: &Frame,
    key_indices: &[usize],
    descending: &[bool],
    partitions: usize,
    budget: usize,
    ctx: &ExecutionContext,
) -> Result<Vec<Frame>> {
    let types = frame.column_types();
    let names = default_names(types.len());
    let len = frame.len();

    let spill = |rows: &mut Vec<Vec<Value>>| -> Result<Frame> {
        rows.sort_by(|a, b| compare_row_keys(a, b, key_indices, descending));
        let mut writer = FrameWriter::new(&ctx.storage, names.clone(), &types, 1, ctx.block_size())?;
        for row in rows.drain(..) {
            writer.write_row(row)?;
        }
        writer.close()
    };

    let per_partition = ctx.scheduler.run_partitions(partitions, |idx, failure| {
        let (begin, end) = partition_bounds(len, partitions as u64, idx as u64);
        let mut reader = frame.range_reader(begin, end)?;
        let mut runs = Vec::new();
        let mut rows = Vec::new();
        let mut bytes = 0;

        while let Some(batch) = reader.next_batch(ctx.batch_size())? {
            failure.check()?;
            for row in batch.into_rows() {
                bytes += row_size(&row);
                rows.push(row);
                if bytes >= budget {
                    trace!(partition = idx, rows = rows.len(), bytes, "spilling run");
                    runs.push(spill(&mut rows)?);
                    bytes = 0;
                }
            }
        }
        if !rows.is_empty() {
            runs.push(spill(&mut rows)?);
        }
        Ok(runs)
    })?;

    Ok(per_partition.into_iter().flatten().collect())
}

/// Head row of a run in the merge heap.
///
/// Ordered by key, then by run so equal keys keep their input order.
struct MergeEntry {
    key: Vec<Value>,
    row: Vec<Value>,
    run: usize,
    descending: Arc<[bool]>,
}

impl PartialEq for MergeEntry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for MergeEntry {}

impl PartialOrd for MergeEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for MergeEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        compare_keys(&self.key, &other.key, &self.descending).then(self.run.cmp(&other.run))
    }
}

impl fmt::Debug for MergeEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MergeEntry")
            .field("key", &self.key)
            .field("run", &self.run)
            .finish_non_exhaustive()
    }
}

/// Merge runs into the output frame.
///
/// At most [`MAX_MERGE_FAN_IN`] runs are merged at once. Larger run counts
/// are first merged in groups of adjacent runs, which keeps the merge
/// stable.
fn merge_runs(
    frame: &Frame,
    mut runs: Vec<Frame>,
    key_indices: &[usize],
    descending: &Arc<[bool]>,
    partitions: usize,
    ctx: &ExecutionContext,
) -> Result<Frame> {
    let len = frame.len();
    let total: u64 = runs.iter().map(|r| r.len()).sum();
    if total != len {
        return Err(FrameStoreError::LengthMismatch {
            expected: len,
            got: total,
        });
    }

    let types = frame.column_types();
    let mut pass = 0;
    while runs.len() > MAX_MERGE_FAN_IN {
        pass += 1;
        let names = default_names(types.len());
        runs = runs
            .chunks(MAX_MERGE_FAN_IN)
            .map(|group| {
                let writer = FrameWriter::new(&ctx.storage, names.clone(), &types, 1, ctx.block_size())?;
                merge(group, writer, key_indices, descending, u64::MAX, ctx)
            })
            .collect::<Result<Vec<_>>>()?;
        debug!(pass, runs = runs.len(), "merged intermediate runs");
    }

    let writer = FrameWriter::new(
        &ctx.storage,
        frame.column_names().to_vec(),
        &types,
        partitions,
        ctx.block_size(),
    )?;
    let per_segment = len.div_ceil(partitions as u64).max(1);
    merge(&runs, writer, key_indices, descending, per_segment, ctx)
}

/// K-way merge of sorted runs, rotating the writer's segment every
/// `per_segment` rows.
fn merge(
    runs: &[Frame],
    mut writer: FrameWriter,
    key_indices: &[usize],
    descending: &Arc<[bool]>,
    per_segment: u64,
    ctx: &ExecutionContext,
) -> Result<Frame> {
    // Per run read batches are small so memory stays bounded by the number
    // of runs.
    let batch_size = (ctx.batch_size() / runs.len().max(1)).max(16);
    let mut cursors: Vec<_> = runs
        .iter()
        .map(|run| RowCursor::new(run.reader(), batch_size))
        .collect();

    let key_of =
        |row: &[Value]| -> Vec<Value> { key_indices.iter().map(|idx| row[*idx].clone()).collect() };

    let mut heap = BinaryHeap::with_capacity(cursors.len());
    for (run, cursor) in cursors.iter_mut().enumerate() {
        if let Some(row) = cursor.next_row()? {
            heap.push(Reverse(MergeEntry {
                key: key_of(&row),
                row,
                run,
                descending: descending.clone(),
            }));
        }
    }

    let mut written = 0;
    while let Some(Reverse(entry)) = heap.pop() {
        if written > 0 && written % per_segment == 0 {
            writer.rotate();
        }
        let run = entry.run;
        writer.write_row(entry.row)?;
        written += 1;

        if let Some(row) = cursors[run].next_row()? {
            heap.push(Reverse(MergeEntry {
                key: key_of(&row),
                row,
                run,
                descending: descending.clone(),
            }));
        }
    }

    writer.close()
}

#[cfg(test)]
mod tests {
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    use super::*;
    use crate::testutil::test_context;
    use crate::value::ValueType;

    fn frame(ctx: &ExecutionContext, a: Vec<Value>, b: Vec<Value>) -> Frame {
        Frame::from_values(
            &ctx.storage,
            vec![("a", ValueType::Integer, a), ("b", ValueType::Integer, b)],
            256,
        )
        .unwrap()
    }

    #[test]
    fn compare_descending() {
        let a = [Value::Integer(1), Value::Integer(2)];
        let b = [Value::Integer(1), Value::Integer(3)];
        assert_eq!(Ordering::Less, compare_keys(&a, &b, &[false, false]));
        assert_eq!(Ordering::Greater, compare_keys(&a, &b, &[false, true]));
    }

    #[test]
    fn sort_is_stable_with_spilling() {
        // Small enough buffer to need more than one merge pass.
        let ctx = test_context(3, 4096);
        let mut rng = StdRng::seed_from_u64(7);
        let n = 2000;
        let keys: Vec<_> = (0..n).map(|_| Value::Integer(rng.random_range(0..50))).collect();
        let seq: Vec<_> = (0..n).map(Value::Integer).collect();
        let input = frame(&ctx, keys, seq);

        let sorted = sort(&input, &[SortKey::ascending("a")], &ctx).unwrap();
        assert_eq!(n as u64, sorted.len());
        assert_eq!(input.column_names(), sorted.column_names());

        let rows = sorted.read_rows().unwrap();
        for pair in rows.windows(2) {
            let (a0, a1) = (&pair[0][0], &pair[1][0]);
            assert!(a0 <= a1);
            if a0 == a1 {
                // Equal keys keep their input order.
                assert!(pair[0][1] < pair[1][1]);
            }
        }
    }

    #[test]
    fn descending_multi_key() {
        let ctx = test_context(2, 1024);
        let input = frame(
            &ctx,
            vec![1, 2, 1, 2, 3].into_iter().map(Value::Integer).collect(),
            vec![5, 6, 7, 8, 9].into_iter().map(Value::Integer).collect(),
        );
        let sorted = sort(
            &input,
            &[SortKey::descending("a"), SortKey::ascending("b")],
            &ctx,
        )
        .unwrap();
        let b: Vec<_> = sorted.column("b").unwrap().read_all().unwrap();
        assert_eq!(
            vec![9, 6, 8, 5, 7].into_iter().map(Value::Integer).collect::<Vec<_>>(),
            b
        );
    }

    #[test]
    fn undefined_sorts_first() {
        let ctx = test_context(1, 1024);
        let input = frame(
            &ctx,
            vec![Value::Integer(2), Value::Undefined, Value::Integer(1)],
            vec![Value::Integer(0); 3],
        );
        let sorted = sort(&input, &[SortKey::ascending("a")], &ctx).unwrap();
        assert_eq!(
            vec![Value::Undefined, Value::Integer(1), Value::Integer(2)],
            sorted.column("a").unwrap().read_all().unwrap()
        );
    }

    #[test]
    fn missing_key_column() {
        let ctx = test_context(1, 1024);
        let input = frame(&ctx, vec![Value::Integer(1)], vec![Value::Integer(1)]);
        assert!(sort(&input, &[SortKey::ascending("nope")], &ctx).is_err());
        assert!(sort(&input, &[], &ctx).is_err());
    }

    #[test]
    fn empty_frame() {
        let ctx = test_context(2, 1024);
        let input = frame(&ctx, Vec::new(), Vec::new());
        let sorted = sort(&input, &[SortKey::ascending("a")], &ctx).unwrap();
        assert_eq!(0, sorted.len());
    }
}
