//! Finding the nodes that must be materialized before a plan can be
//! segmented.
use std::collections::HashSet;

use framestore_error::Result;

use super::node::{NodeId, NodeKind, Plan, PlanGraph};

/// Nodes that must be resolved before `plan` can be segmented, in ascending
/// id order.
///
/// A node needs resolving when its length is unknown but is required to line
/// up with another input, or when it's a reduction below the root. Nodes
/// below a returned node aren't visited, resolving a node resolves
/// everything it depends on.
///
/// A reduction at the root is executed directly, only its input needs to be
/// segmentable.
pub fn unresolved_dependencies(plan: &Plan) -> Result<Vec<NodeId>> {
    let graph: &PlanGraph = plan.graph();
    let root = plan.node()?;
    let mut finder = Finder {
        graph,
        visited: HashSet::new(),
        out: Vec::new(),
    };

    match root.kind() {
        NodeKind::Reduce { .. } => finder.visit(root.input(0)?)?,
        _ => finder.visit(plan.root())?,
    }

    let mut out = finder.out;
    out.sort();
    out.dedup();
    Ok(out)
}

struct Finder<'a> {
    graph: &'a PlanGraph,
    visited: HashSet<NodeId>,
    out: Vec<NodeId>,
}

impl Finder<'_> {
    fn visit(&mut self, id: NodeId) -> Result<()> {
        if !self.visited.insert(id) || self.graph.resolved(id).is_some() {
            return Ok(());
        }

        let node = self.graph.node(id)?;
        match node.kind() {
            NodeKind::ArraySource { .. }
            | NodeKind::FrameSource { .. }
            | NodeKind::Constant { .. }
            | NodeKind::Range { .. } => (),
            NodeKind::Reduce { .. } => self.out.push(id),
            NodeKind::Union | NodeKind::Ternary | NodeKind::Append | NodeKind::LogicalFilter => {
                for input in node.inputs() {
                    if self.graph.length(*input)?.is_none() {
                        self.out.push(*input);
                    } else {
                        self.visit(*input)?;
                    }
                }
            }
            NodeKind::Project { .. }
            | NodeKind::Filter { .. }
            | NodeKind::Transform { .. }
            | NodeKind::GeneralizedTransform { .. } => self.visit(node.input(0)?)?,
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::planner::callbacks::{Count, ValuePredicate};

    fn filter(graph: &PlanGraph, input: NodeId) -> NodeId {
        graph
            .add(
                NodeKind::Filter {
                    column: 0,
                    predicate: ValuePredicate::infallible(|_| true),
                },
                vec![input],
            )
            .unwrap()
    }

    #[test]
    fn linear_plan_needs_nothing() {
        let graph = Arc::new(PlanGraph::new());
        let r = graph.add(NodeKind::Range { start: 0, end: 5 }, vec![]).unwrap();
        let f = filter(&graph, r);
        let f2 = filter(&graph, f);
        let plan = Plan::new(graph, f2);
        assert!(unresolved_dependencies(&plan).unwrap().is_empty());
    }

    #[test]
    fn union_of_filters() {
        let graph = Arc::new(PlanGraph::new());
        let r = graph.add(NodeKind::Range { start: 0, end: 5 }, vec![]).unwrap();
        let f = filter(&graph, r);
        let u = graph.add(NodeKind::Union, vec![f, f]).unwrap();
        let top = filter(&graph, u);
        let plan = Plan::new(graph, top);
        assert_eq!(vec![f], unresolved_dependencies(&plan).unwrap());
    }

    #[test]
    fn nested_reduce() {
        let graph = Arc::new(PlanGraph::new());
        let r = graph.add(NodeKind::Range { start: 0, end: 5 }, vec![]).unwrap();
        let f = filter(&graph, r);
        let red = graph
            .add(
                NodeKind::Reduce {
                    aggregator: Arc::new(Count),
                },
                vec![f],
            )
            .unwrap();
        // Reduce at the root only needs its input segmentable.
        let plan = Plan::new(graph.clone(), red);
        assert!(unresolved_dependencies(&plan).unwrap().is_empty());

        let one = graph.add(NodeKind::Range { start: 0, end: 1 }, vec![]).unwrap();
        let u = graph.add(NodeKind::Union, vec![one, red]).unwrap();
        let plan = Plan::new(graph, u);
        assert_eq!(vec![red], unresolved_dependencies(&plan).unwrap());
    }
}
