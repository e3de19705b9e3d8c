//! Partitioning plans for parallel execution.
//!
//! A plan with known length is partitioned by output rows. A plan whose
//! length depends on a filter is partitioned by the rows of the filter's
//! input instead, as long as every node between the root and the filter
//! maps rows one to one (or drops rows, for further filters). Plans that fit
//! neither case need their unknown lengths resolved first.
use std::collections::HashMap;
use std::sync::Arc;

use framestore_error::{FrameStoreError, Result, internal};

use super::node::{NodeId, NodeKind, Plan, PlanGraph};
use super::slice::Slicer;
use crate::arrays::partition_bounds;

/// Number of rows the plan can be partitioned over, if it can be partitioned
/// without resolving any lengths.
pub fn domain_length(graph: &PlanGraph, id: NodeId) -> Result<Option<u64>> {
    if let Some(len) = graph.length(id)? {
        return Ok(Some(len));
    }
    let node = graph.node(id)?;
    match node.kind() {
        NodeKind::Filter { .. }
        | NodeKind::Project { .. }
        | NodeKind::Transform { .. }
        | NodeKind::GeneralizedTransform { .. } => domain_length(graph, node.input(0)?),
        NodeKind::LogicalFilter => {
            let data = graph.length(node.input(0)?)?;
            let mask = graph.length(node.input(1)?)?;
            match (data, mask) {
                (Some(a), Some(b)) if a == b => Ok(Some(a)),
                _ => Ok(None),
            }
        }
        _ => Ok(None),
    }
}

/// Rewrite `plan` into a plan producing only partition `split_idx` of
/// `n_splits`, building it in `dst`.
///
/// Concatenating the output of every partition in order produces exactly
/// the output of the original plan.
pub fn segment(plan: &Plan, split_idx: u64, n_splits: u64, dst: &Arc<PlanGraph>) -> Result<Plan> {
    if n_splits == 0 || split_idx >= n_splits {
        return Err(FrameStoreError::invalid_range(split_idx, split_idx + 1, n_splits));
    }
    let domain = domain_length(plan.graph(), plan.root())?.ok_or_else(|| {
        internal!(
            "plan {} must have its lengths resolved before segmenting",
            plan.root()
        )
    })?;
    let (begin, end) = partition_bounds(domain, n_splits, split_idx);

    let mut segmenter = Segmenter {
        graph: plan.graph(),
        dst,
        slicer: Slicer::new(plan.graph(), dst),
        memo: HashMap::new(),
    };
    let root = segmenter.segment_node(plan.root(), begin, end)?;
    Ok(Plan::new(dst.clone(), root))
}

#[derive(Debug)]
struct Segmenter<'a> {
    graph: &'a Arc<PlanGraph>,
    dst: &'a Arc<PlanGraph>,
    slicer: Slicer<'a>,
    memo: HashMap<(NodeId, u64, u64), NodeId>,
}

impl Segmenter<'_> {
    /// Segment a node by the range `[begin, end)` of its domain.
    fn segment_node(&mut self, id: NodeId, begin: u64, end: u64) -> Result<NodeId> {
        if let Some(out) = self.memo.get(&(id, begin, end)) {
            return Ok(*out);
        }

        let out = if self.graph.length(id)?.is_some() {
            self.slicer.slice_node(id, begin, end)?
        } else {
            let node = self.graph.node(id)?;
            match node.kind() {
                NodeKind::Filter { .. }
                | NodeKind::Project { .. }
                | NodeKind::Transform { .. }
                | NodeKind::GeneralizedTransform { .. } => {
                    let input = self.segment_node(node.input(0)?, begin, end)?;
                    self.dst.add(node.kind().clone(), vec![input])?
                }
                NodeKind::LogicalFilter => {
                    let data = self.slicer.slice_node(node.input(0)?, begin, end)?;
                    let mask = self.slicer.slice_node(node.input(1)?, begin, end)?;
                    self.dst.add(NodeKind::LogicalFilter, vec![data, mask])?
                }
                other => {
                    return Err(internal!(
                        "cannot segment {} node {id} with unknown length",
                        other.name()
                    ));
                }
            }
        };

        self.memo.insert((id, begin, end), out);
        Ok(out)
    }
}
