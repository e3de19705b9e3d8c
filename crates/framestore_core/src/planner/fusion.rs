//! Merging adjacent operators.
//!
//! The fuser copies a plan into a fresh graph, applying every rule to each
//! node once its inputs have been copied. Passes repeat until no rule
//! applies. Nodes with resolved results are copied as frame sources.
use std::collections::HashMap;
use std::sync::Arc;

use framestore_error::Result;
use tracing::{debug, trace};

use super::node::{NodeId, NodeKind, Plan, PlanGraph};

/// Upper bound on full passes over a plan.
const MAX_PASSES: usize = 16;

/// Upper bound on rule applications to a single node within a pass.
const MAX_NODE_REWRITES: usize = 64;

pub trait OptimizeRule: std::fmt::Debug + Send + Sync {
    fn name(&self) -> &'static str;

    /// Try to rewrite node `id`, returning an equivalent node if the rule
    /// applied.
    ///
    /// New nodes are appended to `graph`. The original node is left in
    /// place.
    fn optimize(&self, graph: &PlanGraph, id: NodeId) -> Result<Option<NodeId>>;
}

#[derive(Debug)]
pub struct Fuser {
    rules: Vec<Box<dyn OptimizeRule>>,
}

impl Default for Fuser {
    fn default() -> Self {
        Fuser {
            rules: vec![
                Box::new(ProjectMerge),
                Box::new(IdentityProjection),
                Box::new(UnionFlatten),
                Box::new(ProjectUnionPruning),
                Box::new(ProjectSourcePruning),
                Box::new(TransformCompose),
            ],
        }
    }
}

impl Fuser {
    pub fn with_rules(rules: Vec<Box<dyn OptimizeRule>>) -> Self {
        Fuser { rules }
    }

    /// Fuse a plan, returning an equivalent plan in a new graph.
    pub fn fuse(&self, plan: &Plan) -> Result<Plan> {
        let mut current = plan.clone();
        for pass in 0..MAX_PASSES {
            let dst = Arc::new(PlanGraph::new());
            let mut copier = Copier {
                fuser: self,
                src: current.graph(),
                dst: &dst,
                memo: HashMap::new(),
                applied: 0,
            };
            let root = copier.copy(current.root())?;
            let applied = copier.applied;
            current = Plan::new(dst, root);

            trace!(pass, applied, "fusion pass");
            if applied == 0 {
                break;
            }
        }
        debug!(
            before = plan.graph().num_nodes(),
            after = current.graph().num_nodes(),
            "fused plan"
        );
        Ok(current)
    }
}

struct Copier<'a> {
    fuser: &'a Fuser,
    src: &'a Arc<PlanGraph>,
    dst: &'a Arc<PlanGraph>,
    memo: HashMap<NodeId, NodeId>,
    applied: usize,
}

impl Copier<'_> {
    fn copy(&mut self, id: NodeId) -> Result<NodeId> {
        if let Some(out) = self.memo.get(&id) {
            return Ok(*out);
        }

        let out = match self.src.resolved(id) {
            Some(frame) => {
                let columns = (0..frame.num_columns()).collect();
                let end = frame.len();
                self.dst.add(
                    NodeKind::FrameSource {
                        frame,
                        columns,
                        begin: 0,
                        end,
                    },
                    vec![],
                )?
            }
            None => {
                let node = self.src.node(id)?;
                let inputs = node
                    .inputs()
                    .iter()
                    .map(|input| self.copy(*input))
                    .collect::<Result<Vec<_>>>()?;
                let copied = self.dst.add(node.kind().clone(), inputs)?;
                self.apply_rules(copied)?
            }
        };

        self.memo.insert(id, out);
        Ok(out)
    }

    fn apply_rules(&mut self, mut id: NodeId) -> Result<NodeId> {
        'outer: for _ in 0..MAX_NODE_REWRITES {
            for rule in &self.fuser.rules {
                if let Some(new_id) = rule.optimize(self.dst, id)? {
                    trace!(rule = rule.name(), from = %id, to = %new_id, "applied rule");
                    self.applied += 1;
                    id = new_id;
                    continue 'outer;
                }
            }
            break;
        }
        Ok(id)
    }
}

/// `Project(Project(x))` => `Project(x)`
#[derive(Debug)]
pub struct ProjectMerge;

impl OptimizeRule for ProjectMerge {
    fn name(&self) -> &'static str {
        "project_merge"
    }

    fn optimize(&self, graph: &PlanGraph, id: NodeId) -> Result<Option<NodeId>> {
        let node = graph.node(id)?;
        let NodeKind::Project { indices: outer } = node.kind() else {
            return Ok(None);
        };
        let child = graph.node(node.input(0)?)?;
        let NodeKind::Project { indices: inner } = child.kind() else {
            return Ok(None);
        };
        let indices = outer.iter().map(|idx| inner[*idx]).collect();
        let merged = graph.add(NodeKind::Project { indices }, vec![child.input(0)?])?;
        Ok(Some(merged))
    }
}

/// Projections selecting every input column in order are removed.
#[derive(Debug)]
pub struct IdentityProjection;

impl OptimizeRule for IdentityProjection {
    fn name(&self) -> &'static str {
        "identity_projection"
    }

    fn optimize(&self, graph: &PlanGraph, id: NodeId) -> Result<Option<NodeId>> {
        let node = graph.node(id)?;
        let NodeKind::Project { indices } = node.kind() else {
            return Ok(None);
        };
        let input = node.input(0)?;
        let num_columns = graph.node(input)?.num_columns();
        let is_identity =
            indices.len() == num_columns && indices.iter().enumerate().all(|(i, idx)| i == *idx);
        Ok(is_identity.then_some(input))
    }
}

/// Nested unions are flattened, and single input unions removed.
#[derive(Debug)]
pub struct UnionFlatten;

impl OptimizeRule for UnionFlatten {
    fn name(&self) -> &'static str {
        "union_flatten"
    }

    fn optimize(&self, graph: &PlanGraph, id: NodeId) -> Result<Option<NodeId>> {
        let node = graph.node(id)?;
        if !matches!(node.kind(), NodeKind::Union) {
            return Ok(None);
        }
        if node.inputs().len() == 1 {
            return Ok(Some(node.inputs()[0]));
        }

        let mut flattened = Vec::with_capacity(node.inputs().len());
        let mut changed = false;
        for input in node.inputs() {
            let child = graph.node(*input)?;
            if matches!(child.kind(), NodeKind::Union) {
                flattened.extend_from_slice(child.inputs());
                changed = true;
            } else {
                flattened.push(*input);
            }
        }
        if !changed {
            return Ok(None);
        }
        Ok(Some(graph.add(NodeKind::Union, flattened)?))
    }
}

/// `Project(Union(a, b))` where some columns of the union are never
/// selected: union only the selected columns of each input.
#[derive(Debug)]
pub struct ProjectUnionPruning;

impl OptimizeRule for ProjectUnionPruning {
    fn name(&self) -> &'static str {
        "project_union_pruning"
    }

    fn optimize(&self, graph: &PlanGraph, id: NodeId) -> Result<Option<NodeId>> {
        let node = graph.node(id)?;
        let NodeKind::Project { indices } = node.kind() else {
            return Ok(None);
        };
        let union = graph.node(node.input(0)?)?;
        if !matches!(union.kind(), NodeKind::Union) {
            return Ok(None);
        }

        let mut used = vec![false; union.num_columns()];
        for idx in indices {
            used[*idx] = true;
        }
        if used.iter().all(|u| *u) {
            return Ok(None);
        }

        // Map from union column to column in the pruned union.
        let mut remap = vec![0; union.num_columns()];
        let mut new_inputs = Vec::new();
        let mut offset = 0;
        let mut next_col = 0;
        for input in union.inputs() {
            let width = graph.node(*input)?.num_columns();
            let keep: Vec<usize> = (0..width).filter(|c| used[offset + c]).collect();
            if !keep.is_empty() {
                for c in &keep {
                    remap[offset + c] = next_col;
                    next_col += 1;
                }
                let pruned = if keep.len() == width {
                    *input
                } else {
                    graph.add(NodeKind::Project { indices: keep }, vec![*input])?
                };
                new_inputs.push(pruned);
            }
            offset += width;
        }

        let child = if new_inputs.len() == 1 {
            new_inputs[0]
        } else {
            graph.add(NodeKind::Union, new_inputs)?
        };
        let indices = indices.iter().map(|idx| remap[*idx]).collect();
        Ok(Some(graph.add(NodeKind::Project { indices }, vec![child])?))
    }
}

/// `Project(FrameSource)` => `FrameSource` reading fewer columns.
#[derive(Debug)]
pub struct ProjectSourcePruning;

impl OptimizeRule for ProjectSourcePruning {
    fn name(&self) -> &'static str {
        "project_source_pruning"
    }

    fn optimize(&self, graph: &PlanGraph, id: NodeId) -> Result<Option<NodeId>> {
        let node = graph.node(id)?;
        let NodeKind::Project { indices } = node.kind() else {
            return Ok(None);
        };
        let source = graph.node(node.input(0)?)?;
        let NodeKind::FrameSource {
            frame,
            columns,
            begin,
            end,
        } = source.kind()
        else {
            return Ok(None);
        };
        let columns = indices.iter().map(|idx| columns[*idx]).collect();
        let pruned = graph.add(
            NodeKind::FrameSource {
                frame: frame.clone(),
                columns,
                begin: *begin,
                end: *end,
            },
            vec![],
        )?;
        Ok(Some(pruned))
    }
}

/// `Transform(g, Transform(f, x))` => `Transform(f then g, x)`
#[derive(Debug)]
pub struct TransformCompose;

impl OptimizeRule for TransformCompose {
    fn name(&self) -> &'static str {
        "transform_compose"
    }

    fn optimize(&self, graph: &PlanGraph, id: NodeId) -> Result<Option<NodeId>> {
        let node = graph.node(id)?;
        let NodeKind::Transform { func: outer, ty, .. } = node.kind() else {
            return Ok(None);
        };
        let child = graph.node(node.input(0)?)?;
        let NodeKind::Transform {
            column,
            func: inner,
            ty: inner_ty,
        } = child.kind()
        else {
            return Ok(None);
        };
        // The inner transform outputs a single column, so the outer one must
        // read column zero.
        let composed = graph.add(
            NodeKind::Transform {
                column: *column,
                func: inner.then(*inner_ty, outer),
                ty: *ty,
            },
            vec![child.input(0)?],
        )?;
        Ok(Some(composed))
    }
}
