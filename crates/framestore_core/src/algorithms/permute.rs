//! Out of core row permutation.
//!
//! Rows are first scattered into buckets covering contiguous ranges of
//! destination rows. Buckets too large to hold in memory are scattered again
//! over their own range. Each small enough bucket is then placed in memory and
//! written out in order.
use framestore_error::{FrameStoreError, Result, internal};
use tracing::{debug, trace};

use crate::arrays::{Array, Frame, FrameWriter, partition_bounds};
use crate::execution::{ExecutionContext, FailureState, default_names, lock_execution};
use crate::value::{Value, ValueType};

/// Maximum number of buckets rows are scattered into in one pass.
///
/// Every partition keeps a writer open per bucket. Buckets still larger than
/// `sort_buffer_size` are split again before placing.
const MAX_BUCKETS: u64 = 64;

/// Move row `i` of `frame` to row `forward_map[i]` of the output.
///
/// `forward_map` must be an integer array of the same length as the frame
/// holding every destination in `0..len` exactly once. Out of range,
/// repeated or missing destinations fail with a permutation assertion.
pub fn permute(frame: &Frame, forward_map: &Array, ctx: &ExecutionContext) -> Result<Frame> {
    if forward_map.len() != frame.len() {
        return Err(FrameStoreError::LengthMismatch {
            expected: frame.len(),
            got: forward_map.len(),
        });
    }
    if !matches!(
        forward_map.value_type(),
        ValueType::Integer | ValueType::Undefined
    ) {
        return Err(FrameStoreError::type_mismatch(format!(
            "forward map must be int, got {}",
            forward_map.value_type()
        )));
    }

    let _guard = lock_execution();
    let len = frame.len();
    let rows_per_bucket = rows_per_bucket(frame.estimated_size()?, len, ctx.settings.sort_buffer_size);
    let buckets = fan_out(len, rows_per_bucket);
    let partitions = (ctx.num_workers() as u64)
        .min(frame.num_segments().max(1) as u64)
        .min(len)
        .max(1) as usize;
    debug!(rows = len, rows_per_bucket, buckets, partitions, "permuting frame");

    let scattered = scatter(frame, forward_map, buckets, partitions, ctx)?;
    let placed = place(frame, &scattered, buckets, rows_per_bucket, ctx)?;
    Frame::concat(&placed)
}

/// Number of rows placed in memory at once, keeping a bucket within
/// `buffer_size` bytes.
fn rows_per_bucket(size: u64, len: u64, buffer_size: u64) -> u64 {
    if len == 0 {
        return 1;
    }
    let row_bytes = size.div_ceil(len).max(1);
    (buffer_size / row_bytes).max(1)
}

/// Buckets to split `rows` destinations into in one pass.
fn fan_out(rows: u64, rows_per_bucket: u64) -> u64 {
    rows.div_ceil(rows_per_bucket)
        .min(MAX_BUCKETS)
        .clamp(1, rows.max(1))
}

/// Bucket holding destination row `dest`.
fn bucket_of(dest: u64, len: u64, buckets: u64) -> u64 {
    let base = len / buckets;
    let rem = len % buckets;
    // The first `rem` buckets hold one extra row.
    let big = rem * (base + 1);
    if dest < big {
        dest / (base + 1)
    } else {
        rem + (dest - big) / base
    }
}

/// Write every row to the bucket of its destination, along with the
/// destination.
///
/// Returns per partition, per bucket frames.
fn scatter(
    frame: &Frame,
    forward_map: &Array,
    buckets: u64,
    partitions: usize,
    ctx: &ExecutionContext,
) -> Result<Vec<Vec<Frame>>> {
    let len = frame.len();
    let mut types = frame.column_types();
    types.push(ValueType::Integer);
    let names = default_names(types.len());

    ctx.scheduler.run_partitions(partitions, |idx, failure| {
        let (begin, end) = partition_bounds(len, partitions as u64, idx as u64);
        let mut rows = frame.range_reader(begin, end)?;
        let mut dests = forward_map.range_reader(begin, end)?;
        let mut writers = (0..buckets)
            .map(|_| FrameWriter::new(&ctx.storage, names.clone(), &types, 1, ctx.block_size()))
            .collect::<Result<Vec<_>>>()?;

        let mut src = begin;
        let mut dest_buf = Vec::new();
        while let Some(batch) = rows.next_batch(ctx.batch_size())? {
            failure.check()?;
            dest_buf.clear();
            dests.next_chunk(batch.num_rows(), &mut dest_buf)?;
            for (mut row, dest) in batch.into_rows().into_iter().zip(dest_buf.drain(..)) {
                let dest = match dest {
                    Value::Integer(d) if d >= 0 && (d as u64) < len => d as u64,
                    other => {
                        return Err(FrameStoreError::PermutationAssertion(format!(
                            "row {src} maps to {other}, outside of 0..{len}"
                        )));
                    }
                };
                row.push(Value::Integer(dest as i64));
                writers[bucket_of(dest, len, buckets) as usize].write_row(row)?;
                src += 1;
            }
        }
        trace!(partition = idx, rows = src - begin, "scattered rows");

        writers.into_iter().map(|w| w.close()).collect()
    })
}

/// Place the rows of each bucket, returning frames covering the output in
/// order.
fn place(
    frame: &Frame,
    scattered: &[Vec<Frame>],
    buckets: u64,
    rows_per_bucket: u64,
    ctx: &ExecutionContext,
) -> Result<Vec<Frame>> {
    let len = frame.len();
    let layout = Layout {
        width: frame.num_columns(),
        types: frame.column_types(),
        names: frame.column_names().to_vec(),
        rows_per_bucket,
    };

    let placed = ctx.scheduler.run_partitions(buckets as usize, |bucket, failure| {
        let (begin, end) = partition_bounds(len, buckets, bucket as u64);
        let pieces: Vec<Frame> = scattered.iter().map(|part| part[bucket].clone()).collect();
        let mut out = Vec::new();
        arrange(&pieces, begin, end, &layout, ctx, failure, &mut out)?;
        Ok(out)
    })?;
    Ok(placed.into_iter().flatten().collect())
}

/// Output schema and the in memory row budget.
#[derive(Debug)]
struct Layout {
    width: usize,
    types: Vec<ValueType>,
    names: Vec<String>,
    rows_per_bucket: u64,
}

/// Write rows destined for `[begin, end)` to `out` in destination order.
///
/// Ranges larger than the row budget are scattered again into sub-buckets
/// until each fits in memory.
fn arrange(
    pieces: &[Frame],
    begin: u64,
    end: u64,
    layout: &Layout,
    ctx: &ExecutionContext,
    failure: &FailureState,
    out: &mut Vec<Frame>,
) -> Result<()> {
    let rows = end - begin;
    if rows <= layout.rows_per_bucket {
        out.push(place_bucket(pieces, begin, end, layout, ctx, failure)?);
        return Ok(());
    }

    let buckets = fan_out(rows, layout.rows_per_bucket);
    trace!(begin, end, buckets, "splitting oversized bucket");
    let mut types = layout.types.clone();
    types.push(ValueType::Integer);
    let names = default_names(types.len());
    let mut writers = (0..buckets)
        .map(|_| FrameWriter::new(&ctx.storage, names.clone(), &types, 1, ctx.block_size()))
        .collect::<Result<Vec<_>>>()?;

    for piece in pieces {
        let mut reader = piece.reader();
        while let Some(batch) = reader.next_batch(ctx.batch_size())? {
            failure.check()?;
            for row in batch.into_rows() {
                let dest = destination(&row)?;
                if dest < begin || dest >= end {
                    return Err(internal!("destination {dest} outside of bucket [{begin}, {end})"));
                }
                writers[bucket_of(dest - begin, rows, buckets) as usize].write_row(row)?;
            }
        }
    }
    let split = writers.into_iter().map(|w| w.close()).collect::<Result<Vec<_>>>()?;

    for (bucket, sub) in split.into_iter().enumerate() {
        let (sub_begin, sub_end) = partition_bounds(rows, buckets, bucket as u64);
        arrange(&[sub], begin + sub_begin, begin + sub_end, layout, ctx, failure, out)?;
    }
    Ok(())
}

/// Destination carried in the last value of a scattered row.
fn destination(row: &[Value]) -> Result<u64> {
    match row.last() {
        Some(Value::Integer(d)) if *d >= 0 => Ok(*d as u64),
        _ => Err(FrameStoreError::PermutationAssertion("missing destination".to_string())),
    }
}

/// Place one bucket that fits in memory.
fn place_bucket(
    pieces: &[Frame],
    begin: u64,
    end: u64,
    layout: &Layout,
    ctx: &ExecutionContext,
    failure: &FailureState,
) -> Result<Frame> {
    let mut slots: Vec<Option<Vec<Value>>> = vec![None; (end - begin) as usize];

    for piece in pieces {
        let mut reader = piece.reader();
        while let Some(batch) = reader.next_batch(ctx.batch_size())? {
            failure.check()?;
            for mut row in batch.into_rows() {
                let dest = destination(&row)?;
                row.pop();
                if dest < begin || dest >= end {
                    return Err(FrameStoreError::PermutationAssertion(format!(
                        "destination {dest} outside of bucket [{begin}, {end})"
                    )));
                }
                let slot = &mut slots[(dest - begin) as usize];
                if slot.is_some() {
                    return Err(FrameStoreError::PermutationAssertion(format!(
                        "destination {dest} assigned more than once"
                    )));
                }
                *slot = Some(row);
            }
        }
    }

    let mut writer = FrameWriter::new(
        &ctx.storage,
        layout.names.clone(),
        &layout.types,
        1,
        ctx.block_size(),
    )?;
    for (offset, slot) in slots.into_iter().enumerate() {
        match slot {
            Some(row) if row.len() == layout.width => writer.write_row(row)?,
            Some(row) => {
                return Err(internal!(
                    "scattered row has {} values, expected {}",
                    row.len(),
                    layout.width
                ));
            }
            None => {
                return Err(FrameStoreError::PermutationAssertion(format!(
                    "no row maps to destination {}",
                    begin + offset as u64
                )));
            }
        }
    }
    writer.close()
}
