//! Equi-joins between two frames.
//!
//! A hash join is used when the smaller side fits in `join_buffer_size`,
//! otherwise both sides are sorted on the keys and merged.
use std::cmp::Ordering as CmpOrdering;
use std::sync::atomic::{AtomicBool, Ordering};

use ahash::RandomState;
use framestore_error::{FrameStoreError, Result, internal};
use hashbrown::HashMap;
use tracing::debug;

use super::sort::{RowCursor, SortKey, sort_with_guard};
use crate::arrays::{Frame, FrameWriter, partition_bounds};
use crate::execution::{ExecutionContext, ExecutionGuard, lock_execution};
use crate::value::{Value, ValueType};

/// Fixed seeds keep build table iteration order stable across runs.
const RANDOM_STATE: RandomState = RandomState::with_seeds(0, 0, 0, 0);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JoinType {
    Inner,
    Left,
    Right,
    Outer,
}

impl JoinType {
    /// Whether unmatched left rows are kept.
    pub const fn preserves_left(&self) -> bool {
        matches!(self, Self::Left | Self::Outer)
    }

    /// Whether unmatched right rows are kept.
    pub const fn preserves_right(&self) -> bool {
        matches!(self, Self::Right | Self::Outer)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum JoinStrategy {
    /// Pick based on the estimated size of the smaller side.
    #[default]
    Auto,
    Hash,
    SortMerge,
}

/// Join two frames on pairs of `(left column, right column)` keys.
///
/// Output contains every left column followed by the right columns that
/// aren't keys. Right column names clashing with earlier names get a `.1`
/// suffix. Rows without a match carry `Undefined` for the other side,
/// except that key columns of unmatched right rows hold the right keys.
/// Undefined keys match each other.
pub fn join<S: AsRef<str>>(
    left: &Frame,
    right: &Frame,
    on: &[(S, S)],
    how: JoinType,
    ctx: &ExecutionContext,
) -> Result<Frame> {
    join_with(left, right, on, how, JoinStrategy::Auto, ctx)
}

pub fn join_with<S: AsRef<str>>(
    left: &Frame,
    right: &Frame,
    on: &[(S, S)],
    how: JoinType,
    strategy: JoinStrategy,
    ctx: &ExecutionContext,
) -> Result<Frame> {
    let layout = JoinLayout::try_new(left, right, on, how)?;

    let guard = lock_execution();
    let left_size = left.estimated_size()?;
    let right_size = right.estimated_size()?;
    let build_right = right_size <= left_size;
    let build_size = left_size.min(right_size);

    let strategy = match strategy {
        JoinStrategy::Auto if build_size <= ctx.settings.join_buffer_size => JoinStrategy::Hash,
        JoinStrategy::Auto => JoinStrategy::SortMerge,
        other => other,
    };
    debug!(
        ?how,
        ?strategy,
        left_rows = left.len(),
        right_rows = right.len(),
        build_size,
        "joining frames"
    );

    match strategy {
        JoinStrategy::Hash => hash_join(&layout, left, right, build_right, ctx),
        _ => sort_merge_join(&guard, &layout, left, right, ctx),
    }
}

/// Resolved key columns and output schema of a join.
#[derive(Debug)]
struct JoinLayout {
    how: JoinType,
    left_width: usize,
    left_keys: Vec<usize>,
    right_keys: Vec<usize>,
    /// Right columns included in the output.
    right_output: Vec<usize>,
    names: Vec<String>,
    types: Vec<ValueType>,
}

/// Common type of a pair of key columns.
fn unify_key_types(left: ValueType, right: ValueType) -> Result<ValueType> {
    match (left, right) {
        (l, r) if l == r => Ok(l),
        (l, r) if l.is_numeric() && r.is_numeric() => Ok(ValueType::Float),
        (ValueType::Undefined, other) | (other, ValueType::Undefined) => Ok(other),
        (l, r) => Err(FrameStoreError::type_mismatch(format!(
            "cannot join {l} key with {r} key"
        ))),
    }
}

impl JoinLayout {
    fn try_new<S: AsRef<str>>(left: &Frame, right: &Frame, on: &[(S, S)], how: JoinType) -> Result<Self> {
        if on.is_empty() {
            return Err(internal!("join requires at least one key pair"));
        }

        let mut types = left.column_types();
        let right_types = right.column_types();
        let mut left_keys = Vec::with_capacity(on.len());
        let mut right_keys = Vec::with_capacity(on.len());
        for (l, r) in on {
            let l = left.column_index(l.as_ref())?;
            let r = right.column_index(r.as_ref())?;
            types[l] = unify_key_types(types[l], right_types[r])?;
            left_keys.push(l);
            right_keys.push(r);
        }

        let mut names = left.column_names().to_vec();
        let mut right_output = Vec::new();
        for (idx, name) in right.column_names().iter().enumerate() {
            if right_keys.contains(&idx) {
                continue;
            }
            let mut out_name = name.clone();
            let mut suffix = 1;
            while names.contains(&out_name) {
                out_name = format!("{name}.{suffix}");
                suffix += 1;
            }
            names.push(out_name);
            types.push(right_types[idx]);
            right_output.push(idx);
        }

        Ok(JoinLayout {
            how,
            left_width: left.num_columns(),
            left_keys,
            right_keys,
            right_output,
            names,
            types,
        })
    }

    fn output_row(&self, left: Option<&[Value]>, right: Option<&[Value]>) -> Vec<Value> {
        let mut row = Vec::with_capacity(self.types.len());
        match left {
            Some(left) => row.extend(left.iter().cloned()),
            None => {
                row.resize(self.left_width, Value::Undefined);
                if let Some(right) = right {
                    for (l, r) in self.left_keys.iter().zip(&self.right_keys) {
                        row[*l] = right[*r].clone();
                    }
                }
            }
        }
        for idx in &self.right_output {
            row.push(right.map(|r| r[*idx].clone()).unwrap_or_default());
        }
        row
    }

    fn writer(&self, ctx: &ExecutionContext) -> Result<FrameWriter> {
        FrameWriter::new(&ctx.storage, self.names.clone(), &self.types, 1, ctx.block_size())
    }
}

fn key_of(row: &[Value], keys: &[usize]) -> Vec<Value> {
    keys.iter().map(|idx| row[*idx].clone()).collect()
}

/// Build a hash table over one side and probe it in parallel with the
/// other.
///
/// Unmatched build rows, if kept, are written after all probe output.
fn hash_join(
    layout: &JoinLayout,
    left: &Frame,
    right: &Frame,
    build_right: bool,
    ctx: &ExecutionContext,
) -> Result<Frame> {
    let (build, probe) = if build_right { (right, left) } else { (left, right) };
    let (build_keys, probe_keys) = if build_right {
        (&layout.right_keys, &layout.left_keys)
    } else {
        (&layout.left_keys, &layout.right_keys)
    };
    let (preserve_build, preserve_probe) = if build_right {
        (layout.how.preserves_right(), layout.how.preserves_left())
    } else {
        (layout.how.preserves_left(), layout.how.preserves_right())
    };

    let build_rows = build.read_rows()?;
    let mut table: HashMap<Vec<Value>, Vec<usize>, RandomState> =
        HashMap::with_capacity_and_hasher(build_rows.len(), RANDOM_STATE);
    for (idx, row) in build_rows.iter().enumerate() {
        table.entry(key_of(row, build_keys)).or_default().push(idx);
    }
    let matched: Vec<AtomicBool> = (0..build_rows.len()).map(|_| AtomicBool::new(false)).collect();
    debug!(build_rows = build_rows.len(), distinct_keys = table.len(), "built join table");

    // Orient a (probe, build) pair as (left, right).
    let output = |probe_row: Option<&[Value]>, build_row: Option<&[Value]>| {
        if build_right {
            layout.output_row(probe_row, build_row)
        } else {
            layout.output_row(build_row, probe_row)
        }
    };

    let len = probe.len();
    let partitions = (ctx.num_workers() as u64)
        .min(probe.num_segments().max(1) as u64)
        .min(len)
        .max(1) as usize;

    let mut frames = ctx.scheduler.run_partitions(partitions, |idx, failure| {
        let (begin, end) = partition_bounds(len, partitions as u64, idx as u64);
        let mut reader = probe.range_reader(begin, end)?;
        let mut writer = layout.writer(ctx)?;
        while let Some(batch) = reader.next_batch(ctx.batch_size())? {
            failure.check()?;
            for row in batch.rows() {
                match table.get(&key_of(&row, probe_keys)) {
                    Some(matches) => {
                        for build_idx in matches {
                            matched[*build_idx].store(true, Ordering::Relaxed);
                            let build_row = build_rows[*build_idx].as_slice();
                            writer.write_row(output(Some(row.as_slice()), Some(build_row)))?;
                        }
                    }
                    None if preserve_probe => writer.write_row(output(Some(row.as_slice()), None))?,
                    None => (),
                }
            }
        }
        writer.close()
    })?;

    if preserve_build {
        let mut writer = layout.writer(ctx)?;
        for (row, matched) in build_rows.iter().zip(&matched) {
            if !matched.load(Ordering::Relaxed) {
                writer.write_row(output(None, Some(row.as_slice())))?;
            }
        }
        frames.push(writer.close()?);
    }

    Frame::concat(&frames)
}

/// Sort both sides on their keys and merge groups of equal keys.
fn sort_merge_join(
    guard: &ExecutionGuard,
    layout: &JoinLayout,
    left: &Frame,
    right: &Frame,
    ctx: &ExecutionContext,
) -> Result<Frame> {
    let sort_keys = |frame: &Frame, keys: &[usize]| -> Vec<SortKey> {
        keys.iter()
            .map(|idx| SortKey::ascending(frame.column_names()[*idx].clone()))
            .collect()
    };
    let left_sorted = sort_with_guard(guard, left, &sort_keys(left, &layout.left_keys), ctx)?;
    let right_sorted = sort_with_guard(guard, right, &sort_keys(right, &layout.right_keys), ctx)?;

    let mut lc = RowCursor::new(left_sorted.reader(), ctx.batch_size());
    let mut rc = RowCursor::new(right_sorted.reader(), ctx.batch_size());
    let mut writer = layout.writer(ctx)?;
    let how = layout.how;

    loop {
        let lkey = lc.peek()?.map(|r| key_of(r, &layout.left_keys));
        let rkey = rc.peek()?.map(|r| key_of(r, &layout.right_keys));
        match (lkey, rkey) {
            (None, None) => break,
            (Some(_), None) => {
                let row = next_row(&mut lc)?;
                if how.preserves_left() {
                    writer.write_row(layout.output_row(Some(row.as_slice()), None))?;
                }
            }
            (None, Some(_)) => {
                let row = next_row(&mut rc)?;
                if how.preserves_right() {
                    writer.write_row(layout.output_row(None, Some(row.as_slice())))?;
                }
            }
            (Some(lkey), Some(rkey)) => match lkey.cmp(&rkey) {
                CmpOrdering::Less => {
                    let row = next_row(&mut lc)?;
                    if how.preserves_left() {
                        writer.write_row(layout.output_row(Some(row.as_slice()), None))?;
                    }
                }
                CmpOrdering::Greater => {
                    let row = next_row(&mut rc)?;
                    if how.preserves_right() {
                        writer.write_row(layout.output_row(None, Some(row.as_slice())))?;
                    }
                }
                CmpOrdering::Equal => {
                    let mut group = Vec::new();
                    while let Some(row) = rc.peek()? {
                        if key_of(row, &layout.right_keys) != rkey {
                            break;
                        }
                        group.push(next_row(&mut rc)?);
                    }
                    while let Some(row) = lc.peek()? {
                        if key_of(row, &layout.left_keys) != lkey {
                            break;
                        }
                        let row = next_row(&mut lc)?;
                        for right_row in &group {
                            let out = layout.output_row(Some(row.as_slice()), Some(right_row.as_slice()));
                            writer.write_row(out)?;
                        }
                    }
                }
            },
        }
    }

    writer.close()
}

fn next_row(cursor: &mut RowCursor) -> Result<Vec<Value>> {
    cursor
        .next_row()?
        .ok_or_else(|| internal!("join cursor exhausted after peek"))
}

#[cfg(test)]
mod tests {
    use framestore_error::ErrorKind;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    use super::*;
    use crate::testutil::test_context;

    fn keyed(ctx: &ExecutionContext, keys: &[i64], col: &str) -> Frame {
        Frame::from_values(
            &ctx.storage,
            vec![
                ("k", ValueType::Integer, keys.iter().map(|k| Value::Integer(*k)).collect()),
                (
                    col,
                    ValueType::Integer,
                    keys.iter().map(|k| Value::Integer(k * 10)).collect(),
                ),
            ],
            256,
        )
        .unwrap()
    }

    fn sorted_rows(frame: &Frame) -> Vec<Vec<Value>> {
        let mut rows = frame.read_rows().unwrap();
        rows.sort();
        rows
    }

    const STRATEGIES: [JoinStrategy; 2] = [JoinStrategy::Hash, JoinStrategy::SortMerge];

    #[test]
    fn join_types() {
        let ctx = test_context(2, 1024);
        let left = keyed(&ctx, &[1, 2, 3], "a");
        let right = keyed(&ctx, &[2, 3, 4], "b");
        let on = [("k", "k")];

        for strategy in STRATEGIES {
            let inner = join_with(&left, &right, &on, JoinType::Inner, strategy, &ctx).unwrap();
            assert_eq!(&["k", "a", "b"], inner.column_names());
            assert_eq!(2, inner.len());

            let l = join_with(&left, &right, &on, JoinType::Left, strategy, &ctx).unwrap();
            assert_eq!(
                vec![
                    vec![Value::Integer(1), Value::Integer(10), Value::Undefined],
                    vec![Value::Integer(2), Value::Integer(20), Value::Integer(20)],
                    vec![Value::Integer(3), Value::Integer(30), Value::Integer(30)],
                ],
                sorted_rows(&l)
            );

            let r = join_with(&left, &right, &on, JoinType::Right, strategy, &ctx).unwrap();
            let rows = sorted_rows(&r);
            assert_eq!(3, rows.len());
            assert_eq!(
                vec![Value::Integer(4), Value::Undefined, Value::Integer(40)],
                rows[2]
            );

            let o = join_with(&left, &right, &on, JoinType::Outer, strategy, &ctx).unwrap();
            assert_eq!(4, o.len());
        }
    }

    #[test]
    fn name_clash_suffix() {
        let ctx = test_context(1, 1024);
        let left = keyed(&ctx, &[1], "v");
        let right = keyed(&ctx, &[1], "v");
        let out = join(&left, &right, &[("k", "k")], JoinType::Inner, &ctx).unwrap();
        assert_eq!(&["k", "v", "v.1"], out.column_names());
    }

    #[test]
    fn key_types() {
        let ctx = test_context(1, 1024);
        let left = keyed(&ctx, &[1, 2], "a");
        let right = Frame::from_values(
            &ctx.storage,
            vec![("f", ValueType::Float, vec![Value::Float(2.0)])],
            256,
        )
        .unwrap();
        let out = join(&left, &right, &[("k", "f")], JoinType::Inner, &ctx).unwrap();
        assert_eq!(ValueType::Float, out.column_types()[0]);
        assert_eq!(vec![vec![Value::Float(2.0), Value::Integer(20)]], out.read_rows().unwrap());

        let strings = Frame::from_values(
            &ctx.storage,
            vec![("s", ValueType::String, vec![Value::from("x")])],
            256,
        )
        .unwrap();
        let err = join(&left, &strings, &[("k", "s")], JoinType::Inner, &ctx).unwrap_err();
        assert_eq!(ErrorKind::TypeMismatch, err.kind());
    }

    #[test]
    fn undefined_keys_match() {
        let ctx = test_context(1, 1024);
        let frame = Frame::from_values(
            &ctx.storage,
            vec![("k", ValueType::Integer, vec![Value::Undefined, Value::Integer(1)])],
            256,
        )
        .unwrap();
        for strategy in STRATEGIES {
            let out = join_with(&frame, &frame, &[("k", "k")], JoinType::Inner, strategy, &ctx).unwrap();
            assert_eq!(2, out.len());
        }
    }

    #[test]
    fn strategies_agree() {
        let ctx = test_context(3, 4096);
        let mut rng = StdRng::seed_from_u64(11);
        let lk: Vec<i64> = (0..300).map(|_| rng.random_range(0..40)).collect();
        let rk: Vec<i64> = (0..200).map(|_| rng.random_range(20..60)).collect();
        let left = keyed(&ctx, &lk, "a");
        let right = keyed(&ctx, &rk, "b");

        for how in [JoinType::Inner, JoinType::Left, JoinType::Right, JoinType::Outer] {
            let hash = join_with(&left, &right, &[("k", "k")], how, JoinStrategy::Hash, &ctx).unwrap();
            let merge =
                join_with(&left, &right, &[("k", "k")], how, JoinStrategy::SortMerge, &ctx).unwrap();
            assert_eq!(sorted_rows(&hash), sorted_rows(&merge), "join type {how:?}");
        }
    }

    #[test]
    fn missing_key_column() {
        let ctx = test_context(1, 1024);
        let left = keyed(&ctx, &[1], "a");
        let err = join(&left, &left, &[("k", "nope")], JoinType::Inner, &ctx).unwrap_err();
        assert_eq!(ErrorKind::Schema, err.kind());
        let none: [(&str, &str); 0] = [];
        assert!(join(&left, &left, &none, JoinType::Inner, &ctx).is_err());
    }
}
