//! Turning plans into new physical storage.
//!
//! Every materialization and length resolution in the process runs under a
//! single execution lock. Within a materialization the plan is partitioned
//! into independent sub-plans that run in parallel on the scheduler, each
//! writing its own output segment. Segments are concatenated in partition
//! order so the output order matches the plan's logical order.
pub mod context;
pub mod failure;
pub mod operators;
pub mod scheduler;

use std::sync::Arc;
use std::time::Instant;

use framestore_error::{FrameStoreError, Result, internal};
use parking_lot::{Mutex, MutexGuard};
use tracing::{debug, info, trace};

pub use context::ExecutionContext;
pub use failure::FailureState;
pub use operators::{PhysicalOperator, compile};
pub use scheduler::Scheduler;

use crate::arrays::{Frame, FrameWriter};
use crate::planner::resolve::unresolved_dependencies;
use crate::planner::{Fuser, NodeId, NodeKind, Plan, PlanGraph, domain_length, segment};
use crate::value::Value;

static EXECUTION_LOCK: Mutex<()> = parking_lot::const_mutex(());

/// Proof that the caller holds the execution lock.
///
/// Functions that may run while the lock is already held take a reference
/// to the guard instead of locking again.
#[derive(Debug)]
pub struct ExecutionGuard {
    _guard: MutexGuard<'static, ()>,
}

/// Block until no other materialization is running.
pub fn lock_execution() -> ExecutionGuard {
    trace!("waiting for execution lock");
    ExecutionGuard {
        _guard: EXECUTION_LOCK.lock(),
    }
}

/// Execute a plan into a new frame with the given column names.
pub fn materialize(plan: &Plan, names: Vec<String>, ctx: &ExecutionContext) -> Result<Frame> {
    let guard = lock_execution();
    info!(node = %plan.root(), workers = ctx.num_workers(), "materializing plan");
    let frame = execute(&guard, plan, ctx)?;
    frame.with_names(names)
}

/// Length of a plan, executing and caching the root if it depends on data.
pub fn resolve_length(plan: &Plan, ctx: &ExecutionContext) -> Result<u64> {
    if let Some(len) = plan.length()? {
        return Ok(len);
    }
    let guard = lock_execution();
    Ok(resolve_node(&guard, plan, ctx)?.len())
}

/// Execute the root of a plan and cache the result in the plan's graph.
pub fn resolve_node(guard: &ExecutionGuard, plan: &Plan, ctx: &ExecutionContext) -> Result<Frame> {
    if let Some(frame) = plan.graph().resolved(plan.root()) {
        return Ok(frame);
    }
    let frame = execute(guard, plan, ctx)?;
    plan.graph().set_resolved(plan.root(), frame.clone())?;
    debug!(node = %plan.root(), len = frame.len(), "resolved node");
    Ok(frame)
}

/// Default names for execution output columns.
pub fn default_names(num_columns: usize) -> Vec<String> {
    (0..num_columns).map(|idx| format!("c{idx}")).collect()
}

/// Execute a plan while holding the execution lock.
///
/// Output columns use [`default_names`].
pub fn execute(guard: &ExecutionGuard, plan: &Plan, ctx: &ExecutionContext) -> Result<Frame> {
    if let Some(frame) = plan.graph().resolved(plan.root()) {
        return frame.with_names(default_names(frame.num_columns()));
    }

    resolve_dependencies(guard, plan, ctx)?;

    let start = Instant::now();
    let frame = match plan.node()?.kind() {
        NodeKind::Reduce { .. } => execute_reduce(plan, ctx)?,
        _ => execute_partitioned(plan, ctx)?,
    };
    info!(
        node = %plan.root(),
        rows = frame.len(),
        columns = frame.num_columns(),
        segments = frame.num_segments(),
        elapsed_ms = start.elapsed().as_millis() as u64,
        "materialized plan"
    );
    Ok(frame)
}

/// Resolve every node that prevents the plan from being partitioned.
fn resolve_dependencies(guard: &ExecutionGuard, plan: &Plan, ctx: &ExecutionContext) -> Result<()> {
    let mut previous: Vec<NodeId> = Vec::new();
    loop {
        let deps = unresolved_dependencies(plan)?;
        if deps.is_empty() {
            return Ok(());
        }
        if deps == previous {
            return Err(internal!("resolution made no progress on nodes {deps:?}"));
        }
        debug!(root = %plan.root(), ?deps, "resolving dependencies");
        for dep in &deps {
            resolve_node(guard, &plan.with_root(*dep), ctx)?;
        }
        previous = deps;
    }
}

/// Number of partitions to split a plan over.
fn parallelism(plan: &Plan, domain: u64, ctx: &ExecutionContext) -> Result<usize> {
    let segments = max_source_segments(plan.graph(), plan.root())?;
    let p = (ctx.num_workers() as u64)
        .min(segments.max(1) as u64)
        .min(domain)
        .max(1);
    Ok(p as usize)
}

fn max_source_segments(graph: &PlanGraph, id: NodeId) -> Result<usize> {
    let node = graph.node(id)?;
    let own = match node.kind() {
        NodeKind::ArraySource { array, begin, end } => array.segments_in_range(*begin, *end),
        NodeKind::FrameSource {
            frame,
            columns,
            begin,
            end,
        } => columns
            .first()
            .and_then(|idx| frame.column_at(*idx))
            .map(|c| c.segments_in_range(*begin, *end))
            .unwrap_or(0),
        _ => 0,
    };
    let mut max = own;
    for input in node.inputs() {
        max = max.max(max_source_segments(graph, *input)?);
    }
    Ok(max)
}

/// Fuse a plan and pick its partition count.
fn prepare(plan: &Plan, ctx: &ExecutionContext) -> Result<(Plan, usize)> {
    let fused = Fuser::default().fuse(plan)?;
    let domain = domain_length(fused.graph(), fused.root())?
        .ok_or_else(|| internal!("plan {} still has unresolved lengths", plan.root()))?;
    let partitions = parallelism(&fused, domain, ctx)?;
    debug!(root = %plan.root(), domain, partitions, "prepared plan");
    Ok((fused, partitions))
}

/// Compile the operator tree for one partition of a prepared plan.
fn compile_partition(
    fused: &Plan,
    idx: usize,
    partitions: usize,
    ctx: &ExecutionContext,
) -> Result<Box<dyn PhysicalOperator>> {
    let dst = Arc::new(PlanGraph::new());
    let part = segment(fused, idx as u64, partitions as u64, &dst)?;
    compile(part.graph(), part.root(), ctx)
}

fn execute_partitioned(plan: &Plan, ctx: &ExecutionContext) -> Result<Frame> {
    let (fused, partitions) = prepare(plan, ctx)?;
    let types = fused.output_types()?;
    let names = default_names(types.len());
    let batch_size = ctx.batch_size();

    let frames = ctx.scheduler.run_partitions(partitions, |idx, failure| {
        let mut op = compile_partition(&fused, idx, partitions, ctx)?;
        let mut writer =
            FrameWriter::new(&ctx.storage, names.clone(), &types, 1, ctx.block_size())?;
        loop {
            failure.check()?;
            match op.next_batch(batch_size)? {
                Some(batch) => {
                    trace!(partition = idx, rows = batch.num_rows(), "writing batch");
                    writer.write_batch(batch)?;
                }
                None => break,
            }
        }
        writer.close()
    })?;

    Frame::concat(&frames)
}

/// Run a reduction at the root of a plan.
///
/// Each partition computes a partial state. Partial states are combined in
/// partition order.
fn execute_reduce(plan: &Plan, ctx: &ExecutionContext) -> Result<Frame> {
    let node = plan.node()?;
    let NodeKind::Reduce { aggregator } = node.kind() else {
        return Err(internal!("node {} is not a reduction", plan.root()));
    };
    let input = plan.with_root(node.input(0)?);
    let (fused, partitions) = prepare(&input, ctx)?;
    let batch_size = ctx.batch_size();

    let partials = ctx.scheduler.run_partitions(partitions, |idx, failure| {
        let mut op = compile_partition(&fused, idx, partitions, ctx)?;
        let mut state = aggregator.init();
        loop {
            failure.check()?;
            let Some(batch) = op.next_batch(batch_size)? else {
                break;
            };
            let values = batch
                .column(0)
                .ok_or_else(|| internal!("reduce input has no columns"))?;
            for value in values {
                aggregator
                    .update(&mut state, value)
                    .map_err(|e| FrameStoreError::operator_failure(aggregator.name(), e))?;
            }
        }
        Ok(state)
    })?;

    let mut state = aggregator.init();
    for partial in partials {
        aggregator
            .combine(&mut state, partial)
            .map_err(|e| FrameStoreError::operator_failure(aggregator.name(), e))?;
    }
    let ty = node
        .output_types()
        .first()
        .copied()
        .ok_or_else(|| internal!("reduce has no output type"))?;
    let value: Value = aggregator.finalize(state).coerce_to(ty)?;
    debug!(aggregator = aggregator.name(), %value, "reduced");

    Frame::from_values(&ctx.storage, vec![("c0", ty, vec![value])], ctx.block_size())
}

#[cfg(test)]
mod tests {
    use framestore_error::ErrorKind;

    use super::*;
    use crate::arrays::Array;
    use crate::config::SettingsSnapshot;
    use crate::planner::callbacks::{Sum, ValuePredicate, ValueTransform};
    use crate::storage::StorageDir;
    use crate::value::ValueType;

    fn context(workers: u64) -> ExecutionContext {
        let settings = SettingsSnapshot {
            num_workers: workers,
            read_batch_size: 3,
            ..Default::default()
        };
        ExecutionContext::new(
            settings,
            StorageDir::temp().unwrap(),
            Scheduler::try_new(workers as usize).unwrap(),
        )
    }

    /// Array of `0..n` spread over `segments` segments.
    fn segmented_array(ctx: &ExecutionContext, n: i64, segments: usize) -> Array {
        let parts: Vec<_> = (0..segments as u64)
            .map(|idx| {
                let (b, e) = crate::arrays::partition_bounds(n as u64, segments as u64, idx);
                Array::from_values(
                    &ctx.storage,
                    ValueType::Integer,
                    (b as i64..e as i64).map(Value::Integer),
                    64,
                )
                .unwrap()
            })
            .collect();
        Array::concat(&parts).unwrap()
    }

    fn source(graph: &PlanGraph, array: &Array) -> NodeId {
        graph
            .add(
                NodeKind::ArraySource {
                    array: array.clone(),
                    begin: 0,
                    end: array.len(),
                },
                vec![],
            )
            .unwrap()
    }

    fn column(frame: &Frame, idx: usize) -> Vec<Value> {
        frame.column_at(idx).unwrap().read_all().unwrap()
    }

    #[test]
    fn partitions_follow_source_segments() {
        let ctx = context(4);
        let array = segmented_array(&ctx, 100, 3);
        let graph = Arc::new(PlanGraph::new());
        let s = source(&graph, &array);
        let plan = Plan::new(graph, s);

        let frame = materialize(&plan, vec!["x".to_string()], &ctx).unwrap();
        assert_eq!(3, frame.num_segments());
        assert_eq!(
            (0..100).map(Value::Integer).collect::<Vec<_>>(),
            column(&frame, 0)
        );
        assert_eq!(&["x".to_string()], frame.column_names());
    }

    #[test]
    fn filter_over_union_resolves_first() {
        let ctx = context(2);
        let graph = Arc::new(PlanGraph::new());
        let array = segmented_array(&ctx, 20, 2);
        let s = source(&graph, &array);
        let f = graph
            .add(
                NodeKind::Filter {
                    column: 0,
                    predicate: ValuePredicate::infallible(|v| v.try_as_i64().unwrap() % 3 == 0),
                },
                vec![s],
            )
            .unwrap();
        let doubled = graph
            .add(
                NodeKind::Transform {
                    column: 0,
                    func: ValueTransform::infallible(|v| Value::Integer(v.try_as_i64().unwrap() * 2)),
                    ty: ValueType::Integer,
                },
                vec![f],
            )
            .unwrap();
        let u = graph.add(NodeKind::Union, vec![f, doubled]).unwrap();
        let plan = Plan::new(graph.clone(), u);

        let frame = materialize(&plan, vec!["a".into(), "b".into()], &ctx).unwrap();
        let expected: Vec<_> = (0..20).filter(|v| v % 3 == 0).collect();
        assert_eq!(expected.iter().map(|v| Value::Integer(*v)).collect::<Vec<_>>(), column(&frame, 0));
        assert_eq!(
            expected.iter().map(|v| Value::Integer(v * 2)).collect::<Vec<_>>(),
            column(&frame, 1)
        );
        assert!(graph.resolved(f).is_some());
    }

    #[test]
    fn reduce_combines_partials() {
        let ctx = context(3);
        let graph = Arc::new(PlanGraph::new());
        let array = segmented_array(&ctx, 50, 5);
        let s = source(&graph, &array);
        let red = graph
            .add(
                NodeKind::Reduce {
                    aggregator: Arc::new(Sum),
                },
                vec![s],
            )
            .unwrap();
        let plan = Plan::new(graph, red);
        let frame = materialize(&plan, vec!["sum".into()], &ctx).unwrap();
        assert_eq!(vec![Value::Integer((0..50).sum())], column(&frame, 0));
    }

    #[test]
    fn nested_reduce_resolved() {
        let ctx = context(2);
        let graph = Arc::new(PlanGraph::new());
        let r = graph.add(NodeKind::Range { start: 0, end: 10 }, vec![]).unwrap();
        let red = graph
            .add(
                NodeKind::Reduce {
                    aggregator: Arc::new(Sum),
                },
                vec![r],
            )
            .unwrap();
        let one = graph.add(NodeKind::Range { start: 7, end: 8 }, vec![]).unwrap();
        let u = graph.add(NodeKind::Union, vec![one, red]).unwrap();
        let frame = materialize(&Plan::new(graph, u), vec!["a".into(), "b".into()], &ctx).unwrap();
        assert_eq!(vec![Value::Integer(7)], column(&frame, 0));
        assert_eq!(vec![Value::Integer(45)], column(&frame, 1));
    }

    #[test]
    fn resolve_length_caches() {
        let ctx = context(2);
        let graph = Arc::new(PlanGraph::new());
        let r = graph.add(NodeKind::Range { start: 0, end: 10 }, vec![]).unwrap();
        let f = graph
            .add(
                NodeKind::Filter {
                    column: 0,
                    predicate: ValuePredicate::infallible(|v| v.try_as_i64().unwrap() < 4),
                },
                vec![r],
            )
            .unwrap();
        let plan = Plan::new(graph.clone(), f);
        assert_eq!(None, plan.length().unwrap());
        assert_eq!(4, resolve_length(&plan, &ctx).unwrap());
        assert_eq!(Some(4), plan.length().unwrap());
        assert_eq!(1, graph.num_resolved());
    }

    #[test]
    fn failure_cleans_up_segments() {
        let ctx = context(4);
        let graph = Arc::new(PlanGraph::new());
        let array = segmented_array(&ctx, 40, 4);
        let s = source(&graph, &array);
        let t = graph
            .add(
                NodeKind::Transform {
                    column: 0,
                    func: ValueTransform::new(|v| match v.try_as_i64()? {
                        35 => Err("bad row".into()),
                        v => Ok(Value::Integer(v)),
                    }),
                    ty: ValueType::Integer,
                },
                vec![s],
            )
            .unwrap();
        let before = std::fs::read_dir(ctx.storage.path()).unwrap().count();
        let err = materialize(&Plan::new(graph, t), vec!["x".into()], &ctx).unwrap_err();
        assert_eq!(ErrorKind::OperatorFailure, err.kind());
        let after = std::fs::read_dir(ctx.storage.path()).unwrap().count();
        assert_eq!(before, after);
    }

    #[test]
    fn empty_plan() {
        let ctx = context(4);
        let graph = Arc::new(PlanGraph::new());
        let r = graph.add(NodeKind::Range { start: 3, end: 3 }, vec![]).unwrap();
        let frame = materialize(&Plan::new(graph, r), vec!["x".into()], &ctx).unwrap();
        assert_eq!(0, frame.len());
        assert_eq!(vec![ValueType::Integer], frame.column_types());
    }
}
