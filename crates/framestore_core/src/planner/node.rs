use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, OnceLock};

use framestore_error::{FrameStoreError, Result, internal};
use parking_lot::{Mutex, RwLock};

use super::callbacks::{Aggregator, RowTransform, ValuePredicate, ValueTransform};
use crate::arrays::{Array, Frame};
use crate::value::{Value, ValueType};

/// Opaque identifier of a node within a [`PlanGraph`].
///
/// A node may only reference nodes with smaller ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub(crate) usize);

impl NodeId {
    pub fn index(&self) -> usize {
        self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Operator kind of a planner node.
#[derive(Debug, Clone)]
pub enum NodeKind {
    /// Rows `[begin, end)` of a single array.
    ArraySource { array: Array, begin: u64, end: u64 },
    /// Rows `[begin, end)` of some columns of a frame, by column index.
    FrameSource {
        frame: Frame,
        columns: Vec<usize>,
        begin: u64,
        end: u64,
    },
    /// The same value repeated `len` times.
    Constant {
        value: Value,
        ty: ValueType,
        len: u64,
    },
    /// Integers `start..end`.
    Range { start: i64, end: i64 },
    /// Columns of the input by index.
    Project { indices: Vec<usize> },
    /// Columns of all inputs side by side. Inputs must have equal length.
    Union,
    /// Rows of the first input followed by rows of the second.
    Append,
    /// Rows of the first input where the single column second input is
    /// truthy.
    LogicalFilter,
    /// Rows of the input where the predicate holds for `column`.
    Filter {
        column: usize,
        predicate: ValuePredicate,
    },
    /// Single column produced by applying a function to `column`.
    Transform {
        column: usize,
        func: ValueTransform,
        ty: ValueType,
    },
    /// Columns produced by applying a function to entire rows.
    GeneralizedTransform {
        func: RowTransform,
        types: Vec<ValueType>,
    },
    /// Rows from the second input where the first input is truthy, and from
    /// the third otherwise.
    Ternary,
    /// Single row reduction of a single column input.
    Reduce { aggregator: Arc<dyn Aggregator> },
}

/// Number of inputs accepted by a node kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arity {
    Exact(usize),
    AtLeast(usize),
}

impl NodeKind {
    pub fn name(&self) -> &'static str {
        match self {
            Self::ArraySource { .. } => "ArraySource",
            Self::FrameSource { .. } => "FrameSource",
            Self::Constant { .. } => "Constant",
            Self::Range { .. } => "Range",
            Self::Project { .. } => "Project",
            Self::Union => "Union",
            Self::Append => "Append",
            Self::LogicalFilter => "LogicalFilter",
            Self::Filter { .. } => "Filter",
            Self::Transform { .. } => "Transform",
            Self::GeneralizedTransform { .. } => "GeneralizedTransform",
            Self::Ternary => "Ternary",
            Self::Reduce { .. } => "Reduce",
        }
    }

    pub fn arity(&self) -> Arity {
        match self {
            Self::ArraySource { .. }
            | Self::FrameSource { .. }
            | Self::Constant { .. }
            | Self::Range { .. } => Arity::Exact(0),
            Self::Project { .. }
            | Self::Filter { .. }
            | Self::Transform { .. }
            | Self::GeneralizedTransform { .. }
            | Self::Reduce { .. } => Arity::Exact(1),
            Self::Append | Self::LogicalFilter => Arity::Exact(2),
            Self::Ternary => Arity::Exact(3),
            Self::Union => Arity::AtLeast(1),
        }
    }

    /// Whether a node can produce an arbitrary subrange of its output
    /// without first computing the rows before it.
    ///
    /// Reductions need to see their entire input.
    pub fn supports_segmenting(&self) -> bool {
        !matches!(self, Self::Reduce { .. })
    }

    /// Whether the output length can be determined without executing the
    /// node.
    pub fn has_data_dependent_length(&self) -> bool {
        matches!(self, Self::Filter { .. } | Self::LogicalFilter)
    }

    /// Unary nodes producing exactly one output row for every input row, or
    /// a subset of input rows in order.
    pub fn is_row_wise_unary(&self) -> bool {
        matches!(
            self,
            Self::Project { .. }
                | Self::Filter { .. }
                | Self::Transform { .. }
                | Self::GeneralizedTransform { .. }
        )
    }

    fn source_length(&self) -> Option<u64> {
        match self {
            Self::ArraySource { begin, end, .. } | Self::FrameSource { begin, end, .. } => {
                Some(end - begin)
            }
            Self::Constant { len, .. } => Some(*len),
            Self::Range { start, end } => Some(end.abs_diff(*start)),
            _ => None,
        }
    }
}

/// A single node in the plan graph.
#[derive(Debug)]
pub struct PlannerNode {
    kind: NodeKind,
    inputs: Vec<NodeId>,
    output_types: Vec<ValueType>,
    /// Cached output length, unset while unknown.
    length: OnceLock<u64>,
}

impl PlannerNode {
    pub fn kind(&self) -> &NodeKind {
        &self.kind
    }

    pub fn inputs(&self) -> &[NodeId] {
        &self.inputs
    }

    pub fn input(&self, idx: usize) -> Result<NodeId> {
        self.inputs
            .get(idx)
            .copied()
            .ok_or_else(|| internal!("{} node missing input {idx}", self.kind.name()))
    }

    pub fn output_types(&self) -> &[ValueType] {
        &self.output_types
    }

    pub fn num_columns(&self) -> usize {
        self.output_types.len()
    }

    pub fn arity(&self) -> usize {
        self.inputs.len()
    }

    pub fn supports_segmenting(&self) -> bool {
        self.kind.supports_segmenting()
    }

    /// Length if already known, without deriving it from inputs.
    pub fn cached_length(&self) -> Option<u64> {
        self.length.get().copied()
    }
}

/// Arena of planner nodes.
///
/// Nodes are only ever appended and never mutated apart from caching their
/// length, so ids stay valid for the life of the graph. Construction never
/// performs I/O.
#[derive(Debug, Default)]
pub struct PlanGraph {
    nodes: RwLock<Vec<Arc<PlannerNode>>>,
    /// Materialized results for nodes whose length had to be resolved.
    resolved: Mutex<HashMap<NodeId, Frame>>,
}

impl PlanGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn num_nodes(&self) -> usize {
        self.nodes.read().len()
    }

    pub fn node(&self, id: NodeId) -> Result<Arc<PlannerNode>> {
        self.nodes
            .read()
            .get(id.0)
            .cloned()
            .ok_or_else(|| internal!("missing node {id}"))
    }

    /// Add a node, validating its inputs and inferring its output types.
    pub fn add(&self, kind: NodeKind, inputs: Vec<NodeId>) -> Result<NodeId> {
        let mut nodes = self.nodes.write();

        let next = NodeId(nodes.len());
        let input_nodes = inputs
            .iter()
            .map(|id| {
                if *id >= next {
                    return Err(internal!("node {next} cannot reference later node {id}"));
                }
                Ok(nodes[id.0].clone())
            })
            .collect::<Result<Vec<_>>>()?;

        match kind.arity() {
            Arity::Exact(n) if inputs.len() != n => {
                return Err(internal!(
                    "{} expects {n} inputs, got {}",
                    kind.name(),
                    inputs.len()
                ));
            }
            Arity::AtLeast(n) if inputs.len() < n => {
                return Err(internal!(
                    "{} expects at least {n} inputs, got {}",
                    kind.name(),
                    inputs.len()
                ));
            }
            _ => (),
        }

        let output_types = infer_types(&kind, &input_nodes)?;

        let input_lengths: Vec<_> = inputs
            .iter()
            .map(|id| derive_length(&nodes, &self.resolved, *id))
            .collect();
        check_known_lengths(&kind, &input_lengths)?;

        let length = OnceLock::new();
        if let Some(len) = length_from_inputs(&kind, &input_lengths) {
            let _ = length.set(len);
        }

        nodes.push(Arc::new(PlannerNode {
            kind,
            inputs,
            output_types,
            length,
        }));

        Ok(next)
    }

    /// Output length of a node, or `None` if it depends on data that hasn't
    /// been computed yet.
    pub fn length(&self, id: NodeId) -> Result<Option<u64>> {
        let nodes = self.nodes.read();
        if id.0 >= nodes.len() {
            return Err(internal!("missing node {id}"));
        }
        Ok(derive_length(&nodes, &self.resolved, id))
    }

    pub fn output_types(&self, id: NodeId) -> Result<Vec<ValueType>> {
        Ok(self.node(id)?.output_types.clone())
    }

    /// Cached result for a node that was materialized during resolution.
    pub fn resolved(&self, id: NodeId) -> Option<Frame> {
        self.resolved.lock().get(&id).cloned()
    }

    pub(crate) fn set_resolved(&self, id: NodeId, frame: Frame) -> Result<()> {
        let node = self.node(id)?;
        if let Some(len) = node.cached_length() {
            if len != frame.len() {
                return Err(FrameStoreError::LengthMismatch {
                    expected: len,
                    got: frame.len(),
                });
            }
        }
        let _ = node.length.set(frame.len());
        self.resolved.lock().insert(id, frame);
        Ok(())
    }

    /// Number of nodes holding resolved results.
    pub fn num_resolved(&self) -> usize {
        self.resolved.lock().len()
    }
}

/// Compute, and cache, the length of a node from its inputs.
fn derive_length(
    nodes: &[Arc<PlannerNode>],
    resolved: &Mutex<HashMap<NodeId, Frame>>,
    id: NodeId,
) -> Option<u64> {
    let node = &nodes[id.0];
    if let Some(len) = node.cached_length() {
        return Some(len);
    }
    if let Some(frame) = resolved.lock().get(&id) {
        return Some(frame.len());
    }
    if node.kind.has_data_dependent_length() {
        return None;
    }
    let input_lengths: Vec<_> = node
        .inputs
        .iter()
        .map(|input| derive_length(nodes, resolved, *input))
        .collect();
    let len = length_from_inputs(&node.kind, &input_lengths)?;
    let _ = node.length.set(len);
    Some(len)
}

fn length_from_inputs(kind: &NodeKind, inputs: &[Option<u64>]) -> Option<u64> {
    if let Some(len) = kind.source_length() {
        return Some(len);
    }
    match kind {
        NodeKind::Project { .. } | NodeKind::Transform { .. } | NodeKind::GeneralizedTransform { .. } => {
            inputs[0]
        }
        NodeKind::Union | NodeKind::Ternary => {
            let first = inputs[0]?;
            for len in &inputs[1..] {
                if *len != Some(first) {
                    return None;
                }
            }
            Some(first)
        }
        NodeKind::Append => Some(inputs[0]? + inputs[1]?),
        NodeKind::Reduce { .. } => Some(1),
        NodeKind::Filter { .. } | NodeKind::LogicalFilter => None,
        NodeKind::ArraySource { .. }
        | NodeKind::FrameSource { .. }
        | NodeKind::Constant { .. }
        | NodeKind::Range { .. } => None,
    }
}

/// Error early if inputs that must line up have known, different lengths.
fn check_known_lengths(kind: &NodeKind, inputs: &[Option<u64>]) -> Result<()> {
    if !matches!(
        kind,
        NodeKind::Union | NodeKind::Ternary | NodeKind::LogicalFilter
    ) {
        return Ok(());
    }
    let mut known = inputs.iter().flatten();
    if let Some(first) = known.next() {
        for len in known {
            if len != first {
                return Err(FrameStoreError::LengthMismatch {
                    expected: *first,
                    got: *len,
                });
            }
        }
    }
    Ok(())
}

fn check_column(kind: &NodeKind, column: usize, num_columns: usize) -> Result<()> {
    if column >= num_columns {
        return Err(FrameStoreError::MissingColumn(format!(
            "column index {column} out of range for {} input with {num_columns} columns",
            kind.name()
        )));
    }
    Ok(())
}

fn single_column(kind: &NodeKind, what: &str, node: &PlannerNode) -> Result<ValueType> {
    match node.output_types() {
        [ty] => Ok(*ty),
        types => Err(FrameStoreError::type_mismatch(format!(
            "{} {what} must have exactly one column, got {}",
            kind.name(),
            types.len()
        ))),
    }
}

fn infer_types(kind: &NodeKind, inputs: &[Arc<PlannerNode>]) -> Result<Vec<ValueType>> {
    match kind {
        NodeKind::ArraySource { array, begin, end } => {
            if begin > end || *end > array.len() {
                return Err(FrameStoreError::invalid_range(*begin, *end, array.len()));
            }
            Ok(vec![array.value_type()])
        }
        NodeKind::FrameSource {
            frame,
            columns,
            begin,
            end,
        } => {
            if begin > end || *end > frame.len() {
                return Err(FrameStoreError::invalid_range(*begin, *end, frame.len()));
            }
            if columns.is_empty() {
                return Err(internal!("frame source must read at least one column"));
            }
            columns
                .iter()
                .map(|idx| {
                    frame
                        .column_at(*idx)
                        .map(|c| c.value_type())
                        .ok_or_else(|| {
                            FrameStoreError::MissingColumn(format!("column index {idx}"))
                        })
                })
                .collect()
        }
        NodeKind::Constant { value, ty, .. } => {
            value.clone().coerce_to(*ty)?;
            Ok(vec![*ty])
        }
        NodeKind::Range { start, end } => {
            if start > end {
                return Err(FrameStoreError::InvalidRange {
                    begin: *start as u64,
                    end: *end as u64,
                    len: 0,
                });
            }
            Ok(vec![ValueType::Integer])
        }
        NodeKind::Project { indices } => {
            let input = &inputs[0];
            if indices.is_empty() {
                return Err(internal!("projection must select at least one column"));
            }
            indices
                .iter()
                .map(|idx| {
                    check_column(kind, *idx, input.num_columns())?;
                    Ok(input.output_types[*idx])
                })
                .collect()
        }
        NodeKind::Union => Ok(inputs
            .iter()
            .flat_map(|n| n.output_types.iter().copied())
            .collect()),
        NodeKind::Append => {
            if inputs[0].output_types != inputs[1].output_types {
                return Err(FrameStoreError::type_mismatch(format!(
                    "cannot append rows of types {:?} to {:?}",
                    inputs[1].output_types, inputs[0].output_types
                )));
            }
            Ok(inputs[0].output_types.clone())
        }
        NodeKind::LogicalFilter => {
            single_column(kind, "mask", &inputs[1])?;
            Ok(inputs[0].output_types.clone())
        }
        NodeKind::Filter { column, .. } => {
            check_column(kind, *column, inputs[0].num_columns())?;
            Ok(inputs[0].output_types.clone())
        }
        NodeKind::Transform { column, ty, .. } => {
            check_column(kind, *column, inputs[0].num_columns())?;
            Ok(vec![*ty])
        }
        NodeKind::GeneralizedTransform { types, .. } => {
            if types.is_empty() {
                return Err(internal!("generalized transform must output at least one column"));
            }
            Ok(types.clone())
        }
        NodeKind::Ternary => {
            single_column(kind, "condition", &inputs[0])?;
            if inputs[1].output_types != inputs[2].output_types {
                return Err(FrameStoreError::type_mismatch(format!(
                    "ternary branches have different types {:?} and {:?}",
                    inputs[1].output_types, inputs[2].output_types
                )));
            }
            Ok(inputs[1].output_types.clone())
        }
        NodeKind::Reduce { aggregator } => {
            let ty = single_column(kind, "input", &inputs[0])?;
            Ok(vec![aggregator.output_type(ty)?])
        }
    }
}

/// A node in a graph to be executed as the root of a plan.
#[derive(Debug, Clone)]
pub struct Plan {
    graph: Arc<PlanGraph>,
    root: NodeId,
}

impl Plan {
    pub fn new(graph: Arc<PlanGraph>, root: NodeId) -> Self {
        Plan { graph, root }
    }

    pub fn graph(&self) -> &Arc<PlanGraph> {
        &self.graph
    }

    pub fn root(&self) -> NodeId {
        self.root
    }

    pub fn node(&self) -> Result<Arc<PlannerNode>> {
        self.graph.node(self.root)
    }

    /// Plan rooted at a different node of the same graph.
    pub fn with_root(&self, root: NodeId) -> Plan {
        Plan {
            graph: self.graph.clone(),
            root,
        }
    }

    pub fn output_types(&self) -> Result<Vec<ValueType>> {
        self.graph.output_types(self.root)
    }

    pub fn length(&self) -> Result<Option<u64>> {
        self.graph.length(self.root)
    }

    /// Add a node to this plan's graph, returning a plan rooted at it.
    pub fn push(&self, kind: NodeKind, inputs: Vec<NodeId>) -> Result<Plan> {
        let root = self.graph.add(kind, inputs)?;
        Ok(self.with_root(root))
    }

    /// Render the plan as an indented tree.
    pub fn explain(&self) -> Result<String> {
        let mut out = String::new();
        self.explain_node(self.root, 0, &mut out)?;
        Ok(out)
    }

    fn explain_node(&self, id: NodeId, depth: usize, out: &mut String) -> Result<()> {
        let node = self.graph.node(id)?;
        let len = match self.graph.length(id)? {
            Some(len) => len.to_string(),
            None => "?".to_string(),
        };
        let detail = match node.kind() {
            NodeKind::ArraySource { begin, end, .. } => format!(" [{begin}, {end})"),
            NodeKind::FrameSource {
                columns, begin, end, ..
            } => format!(" {columns:?} [{begin}, {end})"),
            NodeKind::Constant { value, .. } => format!(" {value}"),
            NodeKind::Range { start, end } => format!(" {start}..{end}"),
            NodeKind::Project { indices } => format!(" {indices:?}"),
            NodeKind::Filter { column, .. } | NodeKind::Transform { column, .. } => {
                format!(" column={column}")
            }
            NodeKind::Reduce { aggregator } => format!(" {}", aggregator.name()),
            _ => String::new(),
        };
        out.push_str(&format!(
            "{:indent$}{} {id}{detail} (len: {len})\n",
            "",
            node.kind().name(),
            indent = depth * 2
        ));
        for input in node.inputs() {
            self.explain_node(*input, depth + 1, out)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use framestore_error::ErrorKind;

    use super::*;
    use crate::planner::callbacks::Sum;
    use crate::storage::StorageDir;

    fn int_array(storage: &StorageDir, n: i64) -> Array {
        Array::from_values(storage, ValueType::Integer, (0..n).map(Value::Integer), 64).unwrap()
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

    #[test]
    fn inputs_must_precede_node() {
        let graph = PlanGraph::new();
        let err = graph
            .add(NodeKind::Project { indices: vec![0] }, vec![NodeId(0)])
            .unwrap_err();
        assert_eq!(ErrorKind::Internal, err.kind());
        assert_eq!(0, graph.num_nodes());
    }

    #[test]
    fn arity_checked() {
        let graph = PlanGraph::new();
        let r = graph.add(NodeKind::Range { start: 0, end: 3 }, vec![]).unwrap();
        assert!(graph.add(NodeKind::Ternary, vec![r, r]).is_err());
        assert!(graph.add(NodeKind::Union, vec![]).is_err());
    }

    #[test]
    fn lengths_and_types() {
        let storage = StorageDir::temp().unwrap();
        let graph = PlanGraph::new();
        let a = source(&graph, &int_array(&storage, 10));
        let r = graph.add(NodeKind::Range { start: 5, end: 15 }, vec![]).unwrap();
        let u = graph.add(NodeKind::Union, vec![a, r]).unwrap();
        assert_eq!(Some(10), graph.length(u).unwrap());
        assert_eq!(
            vec![ValueType::Integer, ValueType::Integer],
            graph.output_types(u).unwrap()
        );

        let f = graph
            .add(
                NodeKind::Filter {
                    column: 0,
                    predicate: ValuePredicate::infallible(|v| v.is_truthy()),
                },
                vec![u],
            )
            .unwrap();
        assert_eq!(None, graph.length(f).unwrap());

        let app = graph.add(NodeKind::Append, vec![u, u]).unwrap();
        assert_eq!(Some(20), graph.length(app).unwrap());

        let t = graph
            .add(
                NodeKind::Transform {
                    column: 1,
                    func: ValueTransform::infallible(|v| v.clone()),
                    ty: ValueType::Float,
                },
                vec![f],
            )
            .unwrap();
        assert_eq!(None, graph.length(t).unwrap());
        assert_eq!(vec![ValueType::Float], graph.output_types(t).unwrap());
    }

    #[test]
    fn type_errors_at_construction() {
        let storage = StorageDir::temp().unwrap();
        let graph = PlanGraph::new();
        let a = source(&graph, &int_array(&storage, 3));
        let s = graph
            .add(
                NodeKind::Constant {
                    value: Value::from("x"),
                    ty: ValueType::String,
                    len: 3,
                },
                vec![],
            )
            .unwrap();

        let err = graph.add(NodeKind::Append, vec![a, s]).unwrap_err();
        assert_eq!(ErrorKind::TypeMismatch, err.kind());

        let err = graph
            .add(
                NodeKind::Reduce {
                    aggregator: Arc::new(Sum),
                },
                vec![s],
            )
            .unwrap_err();
        assert_eq!(ErrorKind::TypeMismatch, err.kind());

        let err = graph
            .add(
                NodeKind::Constant {
                    value: Value::from("x"),
                    ty: ValueType::Integer,
                    len: 1,
                },
                vec![],
            )
            .unwrap_err();
        assert_eq!(ErrorKind::TypeMismatch, err.kind());

        let err = graph.add(NodeKind::Project { indices: vec![1] }, vec![a]).unwrap_err();
        assert_eq!(ErrorKind::Schema, err.kind());
    }

    #[test]
    fn known_length_mismatch() {
        let storage = StorageDir::temp().unwrap();
        let graph = PlanGraph::new();
        let a = source(&graph, &int_array(&storage, 3));
        let b = source(&graph, &int_array(&storage, 4));
        let err = graph.add(NodeKind::Union, vec![a, b]).unwrap_err();
        assert_eq!(ErrorKind::Schema, err.kind());
    }

    #[test]
    fn source_range_checked() {
        let storage = StorageDir::temp().unwrap();
        let graph = PlanGraph::new();
        let err = graph
            .add(
                NodeKind::ArraySource {
                    array: int_array(&storage, 3),
                    begin: 1,
                    end: 4,
                },
                vec![],
            )
            .unwrap_err();
        assert_eq!(ErrorKind::InvalidRange, err.kind());
    }

    #[test]
    fn resolution_fills_length() {
        let storage = StorageDir::temp().unwrap();
        let graph = PlanGraph::new();
        let a = source(&graph, &int_array(&storage, 5));
        let f = graph
            .add(
                NodeKind::Filter {
                    column: 0,
                    predicate: ValuePredicate::infallible(|_| true),
                },
                vec![a],
            )
            .unwrap();
        let p = graph.add(NodeKind::Project { indices: vec![0] }, vec![f]).unwrap();
        assert_eq!(None, graph.length(p).unwrap());

        let frame = Frame::try_new(vec![("c0".into(), int_array(&storage, 5))]).unwrap();
        graph.set_resolved(f, frame).unwrap();
        assert_eq!(Some(5), graph.length(p).unwrap());
        assert_eq!(1, graph.num_resolved());
    }

    #[test]
    fn explain_tree() {
        let graph = Arc::new(PlanGraph::new());
        let r = graph.add(NodeKind::Range { start: 0, end: 4 }, vec![]).unwrap();
        let p = graph.add(NodeKind::Project { indices: vec![0, 0] }, vec![r]).unwrap();
        let text = Plan::new(graph, p).explain().unwrap();
        assert_eq!(
            "Project #1 [0, 0] (len: 4)\n  Range #0 0..4 (len: 4)\n",
            text
        );
    }
}
