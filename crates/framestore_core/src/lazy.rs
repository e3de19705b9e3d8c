//! Deferred frames and arrays.
//!
//! Every operation on a lazy handle only adds nodes to the session's plan
//! graph. Nothing is read or written until a handle is materialized, or an
//! operation needs a length that depends on data (slicing a filtered frame).
use std::sync::Arc;

use framestore_error::{FrameStoreError, Result, internal};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::algorithms::{self, JoinType, SortKey};
use crate::arrays::{Array, Frame};
use crate::execution::{materialize, resolve_length};
use crate::planner::{
    Aggregator, Count, Max, Min, NodeId, NodeKind, Plan, RowTransform, Sum, ValuePredicate,
    ValueTransform, slice,
};
use crate::session::Session;
use crate::value::{Value, ValueType};

/// Name given to the single column of a materialized lazy array.
const ARRAY_COLUMN: &str = "X";

/// Mask keeping roughly `fraction` of rows `0..len`.
///
/// Each row's decision only depends on the seed and the row index, so the
/// same rows are kept no matter how the plan is partitioned.
fn sample_mask(session: &Session, len: u64, fraction: f64, seed: u64) -> Result<NodeId> {
    if !(0.0..=1.0).contains(&fraction) {
        return Err(FrameStoreError::InvalidSetting {
            name: "fraction".to_string(),
            reason: format!("{fraction} is not between 0 and 1"),
        });
    }
    let graph = session.graph();
    let rows = graph.add(
        NodeKind::Range {
            start: 0,
            end: len as i64,
        },
        Vec::new(),
    )?;
    let func = ValueTransform::new(move |row| {
        let row = row.try_as_i64()? as u64;
        let mut rng = StdRng::seed_from_u64(seed.wrapping_mul(0x9e37_79b9_7f4a_7c15) ^ row);
        Ok(Value::Integer(i64::from(rng.random::<f64>() < fraction)))
    });
    graph.add(
        NodeKind::Transform {
            column: 0,
            func,
            ty: ValueType::Integer,
        },
        vec![rows],
    )
}

fn check_same_session(a: &Session, b: &Session) -> Result<()> {
    if !Arc::ptr_eq(a.graph(), b.graph()) {
        return Err(internal!("cannot combine lazy values from different sessions"));
    }
    Ok(())
}

/// A frame that has not been computed yet.
#[derive(Debug, Clone)]
pub struct LazyFrame {
    session: Session,
    root: NodeId,
    names: Vec<String>,
}

impl LazyFrame {
    pub(crate) fn new(session: Session, root: NodeId, names: Vec<String>) -> Self {
        LazyFrame {
            session,
            root,
            names,
        }
    }

    fn derive(&self, kind: NodeKind, inputs: Vec<NodeId>, names: Vec<String>) -> Result<Self> {
        let root = self.session.graph().add(kind, inputs)?;
        Ok(LazyFrame::new(self.session.clone(), root, names))
    }

    pub fn plan(&self) -> Plan {
        Plan::new(self.session.graph().clone(), self.root)
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn column_names(&self) -> &[String] {
        &self.names
    }

    pub fn num_columns(&self) -> usize {
        self.names.len()
    }

    pub fn column_types(&self) -> Result<Vec<ValueType>> {
        self.plan().output_types()
    }

    pub fn column_index(&self, name: &str) -> Result<usize> {
        self.names
            .iter()
            .position(|n| n == name)
            .ok_or_else(|| FrameStoreError::MissingColumn(name.to_string()))
    }

    /// Number of rows if known without executing anything.
    pub fn known_len(&self) -> Result<Option<u64>> {
        self.plan().length()
    }

    /// Number of rows, executing the plan if the length depends on data.
    pub fn len(&self) -> Result<u64> {
        resolve_length(&self.plan(), &self.session.context())
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    pub fn explain(&self) -> Result<String> {
        self.plan().explain()
    }

    /// Frame of the named columns, in the order given.
    pub fn select<S: AsRef<str>>(&self, names: &[S]) -> Result<LazyFrame> {
        let indices = names
            .iter()
            .map(|n| self.column_index(n.as_ref()))
            .collect::<Result<Vec<_>>>()?;
        let names = indices.iter().map(|idx| self.names[*idx].clone()).collect();
        self.derive(NodeKind::Project { indices }, vec![self.root], names)
    }

    /// Like `select`, by column position.
    pub fn project(&self, indices: &[usize]) -> Result<LazyFrame> {
        let names = indices
            .iter()
            .map(|idx| {
                self.names
                    .get(*idx)
                    .cloned()
                    .ok_or_else(|| FrameStoreError::MissingColumn(format!("#{idx}")))
            })
            .collect::<Result<Vec<_>>>()?;
        self.derive(
            NodeKind::Project {
                indices: indices.to_vec(),
            },
            vec![self.root],
            names,
        )
    }

    pub fn column(&self, name: &str) -> Result<LazyArray> {
        let idx = self.column_index(name)?;
        let root = self
            .session
            .graph()
            .add(NodeKind::Project { indices: vec![idx] }, vec![self.root])?;
        Ok(LazyArray::new(self.session.clone(), root))
    }

    /// Add `array` as a new last column. Lengths must match.
    pub fn add_column(&self, name: impl Into<String>, array: &LazyArray) -> Result<LazyFrame> {
        check_same_session(&self.session, &array.session)?;
        let name = name.into();
        if self.names.contains(&name) {
            return Err(FrameStoreError::DuplicateColumn(name));
        }
        let mut names = self.names.clone();
        names.push(name);
        self.derive(NodeKind::Union, vec![self.root, array.root], names)
    }

    pub fn remove_column(&self, name: &str) -> Result<LazyFrame> {
        let idx = self.column_index(name)?;
        let indices: Vec<usize> = (0..self.names.len()).filter(|i| *i != idx).collect();
        if indices.is_empty() {
            return Err(internal!("cannot remove the only column {name}"));
        }
        let names = indices.iter().map(|i| self.names[*i].clone()).collect();
        self.derive(NodeKind::Project { indices }, vec![self.root], names)
    }

    pub fn rename(&self, from: &str, to: impl Into<String>) -> Result<LazyFrame> {
        let idx = self.column_index(from)?;
        let to = to.into();
        if self.names.iter().enumerate().any(|(i, n)| i != idx && *n == to) {
            return Err(FrameStoreError::DuplicateColumn(to));
        }
        let mut out = self.clone();
        out.names[idx] = to;
        Ok(out)
    }

    /// Rows where `predicate` holds for the named column.
    pub fn filter(&self, column: &str, predicate: ValuePredicate) -> Result<LazyFrame> {
        let column = self.column_index(column)?;
        self.derive(
            NodeKind::Filter { column, predicate },
            vec![self.root],
            self.names.clone(),
        )
    }

    /// Rows where `mask` is truthy. The mask must have the frame's length.
    pub fn filter_by(&self, mask: &LazyArray) -> Result<LazyFrame> {
        check_same_session(&self.session, &mask.session)?;
        self.derive(
            NodeKind::LogicalFilter,
            vec![self.root, mask.root],
            self.names.clone(),
        )
    }

    /// Apply `func` to every value of the named column.
    pub fn apply(&self, column: &str, func: ValueTransform, ty: ValueType) -> Result<LazyArray> {
        let column = self.column_index(column)?;
        let root = self
            .session
            .graph()
            .add(NodeKind::Transform { column, func, ty }, vec![self.root])?;
        Ok(LazyArray::new(self.session.clone(), root))
    }

    /// Apply `func` to entire rows, producing columns with the given names
    /// and types.
    pub fn apply_rows<S: Into<String>>(
        &self,
        func: RowTransform,
        columns: Vec<(S, ValueType)>,
    ) -> Result<LazyFrame> {
        let (names, types): (Vec<String>, Vec<ValueType>) =
            columns.into_iter().map(|(n, t)| (n.into(), t)).unzip();
        for (idx, name) in names.iter().enumerate() {
            if names[..idx].contains(name) {
                return Err(FrameStoreError::DuplicateColumn(name.clone()));
            }
        }
        self.derive(
            NodeKind::GeneralizedTransform { func, types },
            vec![self.root],
            names,
        )
    }

    /// Rows of `self` followed by rows of `other`. Column names must match.
    pub fn append(&self, other: &LazyFrame) -> Result<LazyFrame> {
        check_same_session(&self.session, &other.session)?;
        if self.names != other.names {
            return Err(FrameStoreError::type_mismatch(format!(
                "cannot append columns {:?} to {:?}",
                other.names, self.names
            )));
        }
        self.derive(
            NodeKind::Append,
            vec![self.root, other.root],
            self.names.clone(),
        )
    }

    /// Rows `[begin, end)`.
    pub fn slice(&self, begin: u64, end: u64) -> Result<LazyFrame> {
        self.len()?;
        let plan = slice(&self.plan(), begin, end)?;
        Ok(LazyFrame::new(
            self.session.clone(),
            plan.root(),
            self.names.clone(),
        ))
    }

    /// At most the first `n` rows.
    pub fn head(&self, n: u64) -> Result<LazyFrame> {
        let len = self.len()?;
        self.slice(0, n.min(len))
    }

    /// Keep each row with probability `fraction`, deterministically for a
    /// given seed.
    pub fn sample(&self, fraction: f64, seed: u64) -> Result<LazyFrame> {
        let len = self.len()?;
        let mask = sample_mask(&self.session, len, fraction, seed)?;
        self.derive(
            NodeKind::LogicalFilter,
            vec![self.root, mask],
            self.names.clone(),
        )
    }

    /// Compute the frame into new storage.
    pub fn materialize(&self) -> Result<Frame> {
        materialize(&self.plan(), self.names.clone(), &self.session.context())
    }

    pub fn sort(&self, keys: &[SortKey]) -> Result<Frame> {
        let frame = self.materialize()?;
        algorithms::sort(&frame, keys, &self.session.context())
    }

    pub fn join<S: AsRef<str>>(
        &self,
        right: &LazyFrame,
        on: &[(S, S)],
        how: JoinType,
    ) -> Result<Frame> {
        check_same_session(&self.session, &right.session)?;
        let left = self.materialize()?;
        let right = right.materialize()?;
        algorithms::join(&left, &right, on, how, &self.session.context())
    }

    /// Move row `i` to row `forward_map[i]`.
    pub fn permute(&self, forward_map: &LazyArray) -> Result<Frame> {
        check_same_session(&self.session, &forward_map.session)?;
        let frame = self.materialize()?;
        let map = forward_map.materialize()?;
        algorithms::permute(&frame, &map, &self.session.context())
    }
}

/// A single column that has not been computed yet.
#[derive(Debug, Clone)]
pub struct LazyArray {
    session: Session,
    root: NodeId,
}

impl LazyArray {
    pub(crate) fn new(session: Session, root: NodeId) -> Self {
        LazyArray { session, root }
    }

    fn derive(&self, kind: NodeKind, inputs: Vec<NodeId>) -> Result<Self> {
        let root = self.session.graph().add(kind, inputs)?;
        Ok(LazyArray::new(self.session.clone(), root))
    }

    pub fn plan(&self) -> Plan {
        Plan::new(self.session.graph().clone(), self.root)
    }

    pub fn value_type(&self) -> Result<ValueType> {
        self.plan()
            .output_types()?
            .first()
            .copied()
            .ok_or_else(|| internal!("lazy array without a column"))
    }

    pub fn known_len(&self) -> Result<Option<u64>> {
        self.plan().length()
    }

    pub fn len(&self) -> Result<u64> {
        resolve_length(&self.plan(), &self.session.context())
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Single column frame named `name`.
    pub fn into_frame(self, name: impl Into<String>) -> LazyFrame {
        LazyFrame::new(self.session, self.root, vec![name.into()])
    }

    pub fn apply(&self, func: ValueTransform, ty: ValueType) -> Result<LazyArray> {
        self.derive(NodeKind::Transform { column: 0, func, ty }, vec![self.root])
    }

    pub fn filter(&self, predicate: ValuePredicate) -> Result<LazyArray> {
        self.derive(
            NodeKind::Filter {
                column: 0,
                predicate,
            },
            vec![self.root],
        )
    }

    pub fn filter_by(&self, mask: &LazyArray) -> Result<LazyArray> {
        check_same_session(&self.session, &mask.session)?;
        self.derive(NodeKind::LogicalFilter, vec![self.root, mask.root])
    }

    pub fn append(&self, other: &LazyArray) -> Result<LazyArray> {
        check_same_session(&self.session, &other.session)?;
        self.derive(NodeKind::Append, vec![self.root, other.root])
    }

    /// Per row, the value of `if_true` where `self` is truthy and of
    /// `if_false` otherwise.
    pub fn ternary(&self, if_true: &LazyArray, if_false: &LazyArray) -> Result<LazyArray> {
        check_same_session(&self.session, &if_true.session)?;
        check_same_session(&self.session, &if_false.session)?;
        self.derive(
            NodeKind::Ternary,
            vec![self.root, if_true.root, if_false.root],
        )
    }

    pub fn slice(&self, begin: u64, end: u64) -> Result<LazyArray> {
        self.len()?;
        let plan = slice(&self.plan(), begin, end)?;
        Ok(LazyArray::new(self.session.clone(), plan.root()))
    }

    pub fn head(&self, n: u64) -> Result<LazyArray> {
        let len = self.len()?;
        self.slice(0, n.min(len))
    }

    pub fn sample(&self, fraction: f64, seed: u64) -> Result<LazyArray> {
        let len = self.len()?;
        let mask = sample_mask(&self.session, len, fraction, seed)?;
        self.derive(NodeKind::LogicalFilter, vec![self.root, mask])
    }

    /// Lazy single row reduction.
    pub fn aggregate(&self, aggregator: Arc<dyn Aggregator>) -> Result<LazyArray> {
        self.derive(NodeKind::Reduce { aggregator }, vec![self.root])
    }

    /// Reduce to a single value.
    pub fn reduce(&self, aggregator: Arc<dyn Aggregator>) -> Result<Value> {
        let array = self.aggregate(aggregator)?.materialize()?;
        array.get(0)
    }

    pub fn sum(&self) -> Result<Value> {
        self.reduce(Arc::new(Sum))
    }

    /// Number of defined values.
    pub fn count(&self) -> Result<Value> {
        self.reduce(Arc::new(Count))
    }

    pub fn min(&self) -> Result<Value> {
        self.reduce(Arc::new(Min))
    }

    pub fn max(&self) -> Result<Value> {
        self.reduce(Arc::new(Max))
    }

    pub fn materialize(&self) -> Result<Array> {
        let frame = materialize(
            &self.plan(),
            vec![ARRAY_COLUMN.to_string()],
            &self.session.context(),
        )?;
        frame
            .column_at(0)
            .cloned()
            .ok_or_else(|| internal!("materialized array without a column"))
    }
}
