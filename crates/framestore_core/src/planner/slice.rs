//! Restricting plans to a range of output rows.
use std::collections::HashMap;
use std::sync::Arc;

use framestore_error::{FrameStoreError, Result, internal};

use super::node::{NodeId, NodeKind, Plan, PlanGraph};

/// Restrict `plan` to output rows `[begin, end)`, adding nodes to the plan's
/// own graph.
///
/// Slicing composes: slicing a sliced plan offsets relative to the first
/// slice. The plan's length must be known.
pub fn slice(plan: &Plan, begin: u64, end: u64) -> Result<Plan> {
    slice_into(plan, begin, end, plan.graph())
}

/// Like [`slice`], but builds the sliced plan in `dst`.
pub fn slice_into(plan: &Plan, begin: u64, end: u64, dst: &Arc<PlanGraph>) -> Result<Plan> {
    let len = plan
        .length()?
        .ok_or_else(|| internal!("cannot slice plan {} with unknown length", plan.root()))?;
    if begin > end || end > len {
        return Err(FrameStoreError::invalid_range(begin, end, len));
    }
    let mut slicer = Slicer::new(plan.graph(), dst);
    let root = slicer.slice_node(plan.root(), begin, end)?;
    Ok(Plan::new(dst.clone(), root))
}

/// Copies sub-graphs from one graph into another, restricted to a row range.
///
/// Memoized on the source node and range so shared inputs are only copied
/// once per range.
#[derive(Debug)]
pub(crate) struct Slicer<'a> {
    src: &'a Arc<PlanGraph>,
    dst: &'a Arc<PlanGraph>,
    memo: HashMap<(NodeId, u64, u64), NodeId>,
}

impl<'a> Slicer<'a> {
    pub(crate) fn new(src: &'a Arc<PlanGraph>, dst: &'a Arc<PlanGraph>) -> Self {
        Slicer {
            src,
            dst,
            memo: HashMap::new(),
        }
    }

    fn same_graph(&self) -> bool {
        Arc::ptr_eq(self.src, self.dst)
    }

    pub(crate) fn slice_node(&mut self, id: NodeId, begin: u64, end: u64) -> Result<NodeId> {
        if let Some(out) = self.memo.get(&(id, begin, end)) {
            return Ok(*out);
        }

        let len = self
            .src
            .length(id)?
            .ok_or_else(|| internal!("cannot slice node {id} with unknown length"))?;
        if begin > end || end > len {
            return Err(FrameStoreError::invalid_range(begin, end, len));
        }

        let out = if self.same_graph() && begin == 0 && end == len {
            id
        } else if let Some(frame) = self.src.resolved(id) {
            let columns = (0..frame.num_columns()).collect();
            self.dst.add(
                NodeKind::FrameSource {
                    frame,
                    columns,
                    begin,
                    end,
                },
                vec![],
            )?
        } else {
            self.slice_kind(id, begin, end)?
        };

        self.memo.insert((id, begin, end), out);
        Ok(out)
    }

    fn slice_kind(&mut self, id: NodeId, begin: u64, end: u64) -> Result<NodeId> {
        let node = self.src.node(id)?;
        let kind = match node.kind() {
            NodeKind::ArraySource {
                array, begin: b0, ..
            } => NodeKind::ArraySource {
                array: array.clone(),
                begin: b0 + begin,
                end: b0 + end,
            },
            NodeKind::FrameSource {
                frame,
                columns,
                begin: b0,
                ..
            } => NodeKind::FrameSource {
                frame: frame.clone(),
                columns: columns.clone(),
                begin: b0 + begin,
                end: b0 + end,
            },
            NodeKind::Constant { value, ty, .. } => NodeKind::Constant {
                value: value.clone(),
                ty: *ty,
                len: end - begin,
            },
            NodeKind::Range { start, .. } => NodeKind::Range {
                start: offset_range(*start, begin)?,
                end: offset_range(*start, end)?,
            },
            NodeKind::Append => {
                let first = node.input(0)?;
                let second = node.input(1)?;
                let split = self
                    .src
                    .length(first)?
                    .ok_or_else(|| internal!("append input {first} has unknown length"))?;

                if end <= split {
                    return self.slice_node(first, begin, end);
                }
                if begin >= split {
                    return self.slice_node(second, begin - split, end - split);
                }
                let a = self.slice_node(first, begin, split)?;
                let b = self.slice_node(second, 0, end - split)?;
                return self.dst.add(NodeKind::Append, vec![a, b]);
            }
            NodeKind::Project { .. }
            | NodeKind::Transform { .. }
            | NodeKind::GeneralizedTransform { .. }
            | NodeKind::Union
            | NodeKind::Ternary => {
                let inputs = node
                    .inputs()
                    .iter()
                    .map(|input| self.slice_node(*input, begin, end))
                    .collect::<Result<Vec<_>>>()?;
                return self.dst.add(node.kind().clone(), inputs);
            }
            NodeKind::Filter { .. } | NodeKind::LogicalFilter | NodeKind::Reduce { .. } => {
                return Err(internal!(
                    "{} node {id} must be resolved before slicing",
                    node.kind().name()
                ));
            }
        };
        self.dst.add(kind, vec![])
    }
}

/// Value at row `offset` of a range starting at `start`.
fn offset_range(start: i64, offset: u64) -> Result<i64> {
    start
        .checked_add_unsigned(offset)
        .ok_or_else(|| internal!("range offset {offset} from {start} overflows"))
}

#[cfg(test)]
mod tests {
    use framestore_error::ErrorKind;

    use super::*;
    use crate::planner::callbacks::ValueTransform;
    use crate::value::{Value, ValueType};

    fn range_plan(n: i64) -> Plan {
        let graph = Arc::new(PlanGraph::new());
        let r = graph.add(NodeKind::Range { start: 0, end: n }, vec![]).unwrap();
        Plan::new(graph, r)
    }

    fn range_bounds(plan: &Plan) -> (i64, i64) {
        match plan.node().unwrap().kind() {
            NodeKind::Range { start, end } => (*start, *end),
            other => panic!("unexpected node {other:?}"),
        }
    }

    #[test]
    fn slice_composes() {
        let plan = range_plan(100);
        let outer = slice(&plan, 10, 60).unwrap();
        let inner = slice(&outer, 5, 25).unwrap();
        assert_eq!((15, 35), range_bounds(&inner));
        assert_eq!(Some(20), inner.length().unwrap());
    }

    #[test]
    fn extreme_range() {
        let graph = Arc::new(PlanGraph::new());
        let r = graph
            .add(NodeKind::Range { start: i64::MIN, end: i64::MAX }, vec![])
            .unwrap();
        let plan = Plan::new(graph, r);
        assert_eq!(Some(u64::MAX), plan.length().unwrap());

        let tail = slice(&plan, u64::MAX - 3, u64::MAX).unwrap();
        assert_eq!((i64::MAX - 3, i64::MAX), range_bounds(&tail));
        assert_eq!(Some(3), tail.length().unwrap());
    }

    #[test]
    fn out_of_range() {
        let plan = range_plan(10);
        assert_eq!(ErrorKind::InvalidRange, slice(&plan, 0, 11).unwrap_err().kind());
        assert_eq!(ErrorKind::InvalidRange, slice(&plan, 6, 5).unwrap_err().kind());
        let empty = slice(&plan, 10, 10).unwrap();
        assert_eq!(Some(0), empty.length().unwrap());
    }

    #[test]
    fn full_slice_in_same_graph_is_identity() {
        let plan = range_plan(10);
        let same = slice(&plan, 0, 10).unwrap();
        assert_eq!(plan.root(), same.root());
    }

    #[test]
    fn append_split() {
        let plan = range_plan(10);
        let other = plan
            .push(NodeKind::Range { start: 100, end: 105 }, vec![])
            .unwrap();
        let app = plan
            .push(NodeKind::Append, vec![plan.root(), other.root()])
            .unwrap();
        assert_eq!(Some(15), app.length().unwrap());

        // Entirely in the second input.
        let s = slice(&app, 11, 13).unwrap();
        assert_eq!((101, 103), range_bounds(&s));

        // Straddling both inputs.
        let s = slice(&app, 8, 12).unwrap();
        let node = s.node().unwrap();
        assert!(matches!(node.kind(), NodeKind::Append));
        assert_eq!((8, 10), range_bounds(&s.with_root(node.inputs()[0])));
        assert_eq!((100, 102), range_bounds(&s.with_root(node.inputs()[1])));
    }

    #[test]
    fn shared_inputs_sliced_once() {
        let plan = range_plan(10);
        let t = plan
            .push(
                NodeKind::Transform {
                    column: 0,
                    func: ValueTransform::infallible(|v| v.clone()),
                    ty: ValueType::Integer,
                },
                vec![plan.root()],
            )
            .unwrap();
        let u = plan
            .push(NodeKind::Union, vec![plan.root(), t.root()])
            .unwrap();

        let dst = Arc::new(PlanGraph::new());
        let sliced = slice_into(&u, 2, 4, &dst).unwrap();
        // Range, Transform, Union.
        assert_eq!(3, dst.num_nodes());
        assert_eq!(Some(2), sliced.length().unwrap());
    }

    #[test]
    fn constant_slice() {
        let graph = Arc::new(PlanGraph::new());
        let c = graph
            .add(
                NodeKind::Constant {
                    value: Value::Integer(1),
                    ty: ValueType::Integer,
                    len: 8,
                },
                vec![],
            )
            .unwrap();
        let s = slice(&Plan::new(graph, c), 3, 8).unwrap();
        assert_eq!(Some(5), s.length().unwrap());
    }
}
