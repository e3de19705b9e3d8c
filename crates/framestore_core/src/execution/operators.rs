//! Pull based physical operators compiled from planner nodes.
//!
//! Unless noted otherwise, operators return exactly `min(max, remaining)`
//! rows per call so that inputs of multi-input operators stay aligned.
//! Filters are the exception and may return fewer rows.
use std::fmt;

use framestore_error::{FrameStoreError, Result, internal};
use tracing::trace;

use super::context::ExecutionContext;
use crate::arrays::{ArrayReader, Batch};
use crate::planner::callbacks::{RowTransform, ValuePredicate, ValueTransform};
use crate::planner::{NodeId, NodeKind, PlanGraph};
use crate::value::{Value, ValueType};

pub trait PhysicalOperator: fmt::Debug + Send {
    /// Pull the next batch of at most `max` rows, or `None` once exhausted.
    fn next_batch(&mut self, max: usize) -> Result<Option<Batch>>;
}

/// Build an operator tree for the sub-graph rooted at `id`.
///
/// Inputs shared between multiple nodes are compiled once per use.
pub fn compile(
    graph: &PlanGraph,
    id: NodeId,
    ctx: &ExecutionContext,
) -> Result<Box<dyn PhysicalOperator>> {
    if let Some(frame) = graph.resolved(id) {
        let readers = frame
            .columns()
            .iter()
            .map(|c| c.reader())
            .collect();
        return Ok(Box::new(PhysicalScan::new(readers)));
    }

    let node = graph.node(id)?;
    let mut inputs = node
        .inputs()
        .iter()
        .map(|input| compile(graph, *input, ctx))
        .collect::<Result<Vec<_>>>()?;

    let op: Box<dyn PhysicalOperator> = match node.kind() {
        NodeKind::ArraySource { array, begin, end } => {
            Box::new(PhysicalScan::new(vec![array.range_reader(*begin, *end)?]))
        }
        NodeKind::FrameSource {
            frame,
            columns,
            begin,
            end,
        } => {
            let readers = columns
                .iter()
                .map(|idx| {
                    frame
                        .column_at(*idx)
                        .ok_or_else(|| FrameStoreError::MissingColumn(format!("column index {idx}")))?
                        .range_reader(*begin, *end)
                })
                .collect::<Result<Vec<_>>>()?;
            Box::new(PhysicalScan::new(readers))
        }
        NodeKind::Constant { value, ty, len } => Box::new(PhysicalConstant {
            value: value.clone().coerce_to(*ty)?,
            remaining: *len,
        }),
        NodeKind::Range { start, end } => Box::new(PhysicalRange {
            next: *start,
            end: *end,
        }),
        NodeKind::Project { indices } => Box::new(PhysicalProject {
            indices: indices.clone(),
            input: inputs.remove(0),
        }),
        NodeKind::Union => Box::new(PhysicalUnion { inputs }),
        NodeKind::Append => Box::new(PhysicalAppend {
            inputs,
            current: 0,
        }),
        NodeKind::LogicalFilter => {
            let mask = inputs.remove(1);
            Box::new(PhysicalLogicalFilter {
                input: inputs.remove(0),
                mask,
            })
        }
        NodeKind::Filter { column, predicate } => Box::new(PhysicalFilter {
            column: *column,
            predicate: predicate.clone(),
            input: inputs.remove(0),
        }),
        NodeKind::Transform { column, func, ty } => Box::new(PhysicalTransform {
            column: *column,
            func: func.clone(),
            ty: *ty,
            input: inputs.remove(0),
        }),
        NodeKind::GeneralizedTransform { func, types } => Box::new(PhysicalGeneralizedTransform {
            func: func.clone(),
            types: types.clone(),
            input: inputs.remove(0),
        }),
        NodeKind::Ternary => Box::new(PhysicalTernary { inputs }),
        NodeKind::Reduce { .. } => {
            return Err(internal!("reduce node {id} cannot be compiled as a streaming operator"));
        }
    };

    trace!(node = %id, kind = node.kind().name(), "compiled operator");
    Ok(op)
}

/// Reads equal length columns side by side.
#[derive(Debug)]
pub struct PhysicalScan {
    readers: Vec<ArrayReader>,
}

impl PhysicalScan {
    pub fn new(readers: Vec<ArrayReader>) -> Self {
        PhysicalScan { readers }
    }
}

impl PhysicalOperator for PhysicalScan {
    fn next_batch(&mut self, max: usize) -> Result<Option<Batch>> {
        let n = match self.readers.first() {
            Some(r) => (r.remaining() as usize).min(max),
            None => return Ok(None),
        };
        if n == 0 {
            return Ok(None);
        }
        let mut columns = Vec::with_capacity(self.readers.len());
        for reader in &mut self.readers {
            let mut vals = Vec::with_capacity(n);
            let got = reader.next_chunk(n, &mut vals)?;
            if got != n {
                return Err(internal!("scan read {got} rows, expected {n}"));
            }
            columns.push(vals);
        }
        Batch::try_new(columns).map(Some)
    }
}

#[derive(Debug)]
pub struct PhysicalConstant {
    value: Value,
    remaining: u64,
}

impl PhysicalOperator for PhysicalConstant {
    fn next_batch(&mut self, max: usize) -> Result<Option<Batch>> {
        let n = (self.remaining as usize).min(max);
        if n == 0 {
            return Ok(None);
        }
        self.remaining -= n as u64;
        Batch::try_new(vec![vec![self.value.clone(); n]]).map(Some)
    }
}

#[derive(Debug)]
pub struct PhysicalRange {
    next: i64,
    end: i64,
}

impl PhysicalOperator for PhysicalRange {
    fn next_batch(&mut self, max: usize) -> Result<Option<Batch>> {
        let n = usize::try_from(self.end.abs_diff(self.next))
            .unwrap_or(usize::MAX)
            .min(max);
        if n == 0 {
            return Ok(None);
        }
        let start = self.next;
        self.next += n as i64;
        Batch::try_new(vec![(start..self.next).map(Value::Integer).collect()]).map(Some)
    }
}

#[derive(Debug)]
pub struct PhysicalProject {
    indices: Vec<usize>,
    input: Box<dyn PhysicalOperator>,
}

impl PhysicalOperator for PhysicalProject {
    fn next_batch(&mut self, max: usize) -> Result<Option<Batch>> {
        match self.input.next_batch(max)? {
            Some(batch) => batch.project(&self.indices).map(Some),
            None => Ok(None),
        }
    }
}

/// Pull the same number of rows from every input.
fn next_aligned(inputs: &mut [Box<dyn PhysicalOperator>], max: usize) -> Result<Option<Vec<Batch>>> {
    let mut batches = Vec::with_capacity(inputs.len());
    for input in inputs.iter_mut() {
        batches.push(input.next_batch(max)?);
    }
    let rows: Vec<_> = batches
        .iter()
        .map(|b| b.as_ref().map(|b| b.num_rows()).unwrap_or(0))
        .collect();
    if rows.iter().any(|r| *r != rows[0]) {
        return Err(internal!("inputs produced unaligned batches with {rows:?} rows"));
    }
    if rows.first().copied().unwrap_or(0) == 0 {
        return Ok(None);
    }
    Ok(Some(batches.into_iter().flatten().collect()))
}

#[derive(Debug)]
pub struct PhysicalUnion {
    inputs: Vec<Box<dyn PhysicalOperator>>,
}

impl PhysicalOperator for PhysicalUnion {
    fn next_batch(&mut self, max: usize) -> Result<Option<Batch>> {
        let Some(batches) = next_aligned(&mut self.inputs, max)? else {
            return Ok(None);
        };
        let mut iter = batches.into_iter();
        let Some(mut out) = iter.next() else {
            return Ok(None);
        };
        for batch in iter {
            out.hstack(batch)?;
        }
        Ok(Some(out))
    }
}

#[derive(Debug)]
pub struct PhysicalAppend {
    inputs: Vec<Box<dyn PhysicalOperator>>,
    current: usize,
}

impl PhysicalOperator for PhysicalAppend {
    fn next_batch(&mut self, max: usize) -> Result<Option<Batch>> {
        let mut out: Option<Batch> = None;
        while self.current < self.inputs.len() {
            let have = out.as_ref().map(|b| b.num_rows()).unwrap_or(0);
            if have >= max {
                break;
            }
            match self.inputs[self.current].next_batch(max - have)? {
                Some(batch) => match out.as_mut() {
                    Some(out) => out.vstack(batch)?,
                    None => out = Some(batch),
                },
                None => self.current += 1,
            }
        }
        Ok(out)
    }
}

#[derive(Debug)]
pub struct PhysicalLogicalFilter {
    input: Box<dyn PhysicalOperator>,
    mask: Box<dyn PhysicalOperator>,
}

impl PhysicalOperator for PhysicalLogicalFilter {
    fn next_batch(&mut self, max: usize) -> Result<Option<Batch>> {
        loop {
            let data = self.input.next_batch(max)?;
            let mask = self.mask.next_batch(max)?;
            let (data, mask) = match (data, mask) {
                (None, None) => return Ok(None),
                (Some(data), Some(mask)) if data.num_rows() == mask.num_rows() => (data, mask),
                (data, mask) => {
                    return Err(internal!(
                        "logical filter data ({:?} rows) and mask ({:?} rows) are not aligned",
                        data.map(|b| b.num_rows()),
                        mask.map(|b| b.num_rows())
                    ));
                }
            };
            let selection: Vec<bool> = mask
                .column(0)
                .ok_or_else(|| internal!("logical filter mask has no columns"))?
                .iter()
                .map(|v| v.is_truthy())
                .collect();
            let out = data.select(&selection)?;
            if !out.is_empty() {
                return Ok(Some(out));
            }
        }
    }
}

#[derive(Debug)]
pub struct PhysicalFilter {
    column: usize,
    predicate: ValuePredicate,
    input: Box<dyn PhysicalOperator>,
}

impl PhysicalOperator for PhysicalFilter {
    fn next_batch(&mut self, max: usize) -> Result<Option<Batch>> {
        while let Some(batch) = self.input.next_batch(max)? {
            let values = batch
                .column(self.column)
                .ok_or_else(|| internal!("filter column {} out of range", self.column))?;
            let selection = values
                .iter()
                .map(|v| {
                    self.predicate
                        .call(v)
                        .map_err(|e| FrameStoreError::operator_failure("filter", e))
                })
                .collect::<Result<Vec<_>>>()?;
            let out = batch.select(&selection)?;
            if !out.is_empty() {
                return Ok(Some(out));
            }
        }
        Ok(None)
    }
}

#[derive(Debug)]
pub struct PhysicalTransform {
    column: usize,
    func: ValueTransform,
    ty: ValueType,
    input: Box<dyn PhysicalOperator>,
}

impl PhysicalOperator for PhysicalTransform {
    fn next_batch(&mut self, max: usize) -> Result<Option<Batch>> {
        let Some(batch) = self.input.next_batch(max)? else {
            return Ok(None);
        };
        let values = batch
            .column(self.column)
            .ok_or_else(|| internal!("transform column {} out of range", self.column))?;
        let out = values
            .iter()
            .map(|v| {
                self.func
                    .call(v)
                    .map_err(|e| FrameStoreError::operator_failure("transform", e))?
                    .coerce_to(self.ty)
            })
            .collect::<Result<Vec<_>>>()?;
        Batch::try_new(vec![out]).map(Some)
    }
}

#[derive(Debug)]
pub struct PhysicalGeneralizedTransform {
    func: RowTransform,
    types: Vec<ValueType>,
    input: Box<dyn PhysicalOperator>,
}

impl PhysicalOperator for PhysicalGeneralizedTransform {
    fn next_batch(&mut self, max: usize) -> Result<Option<Batch>> {
        let Some(batch) = self.input.next_batch(max)? else {
            return Ok(None);
        };
        let mut columns: Vec<Vec<Value>> = self
            .types
            .iter()
            .map(|_| Vec::with_capacity(batch.num_rows()))
            .collect();
        for row in batch.rows() {
            let out = self
                .func
                .call(&row)
                .map_err(|e| FrameStoreError::operator_failure("generalized_transform", e))?;
            if out.len() != self.types.len() {
                return Err(FrameStoreError::operator_failure(
                    "generalized_transform",
                    format!(
                        "function returned {} values, expected {}",
                        out.len(),
                        self.types.len()
                    )
                    .into(),
                ));
            }
            for ((col, val), ty) in columns.iter_mut().zip(out).zip(&self.types) {
                col.push(val.coerce_to(*ty)?);
            }
        }
        Batch::try_new(columns).map(Some)
    }
}

/// Inputs are the condition, then the true and false branches.
#[derive(Debug)]
pub struct PhysicalTernary {
    inputs: Vec<Box<dyn PhysicalOperator>>,
}

impl PhysicalOperator for PhysicalTernary {
    fn next_batch(&mut self, max: usize) -> Result<Option<Batch>> {
        let Some(batches) = next_aligned(&mut self.inputs, max)? else {
            return Ok(None);
        };
        let [cond, t, f]: [Batch; 3] = batches
            .try_into()
            .map_err(|_| internal!("ternary expected three input batches"))?;

        let cond = cond
            .column(0)
            .ok_or_else(|| internal!("ternary condition has no columns"))?;
        let t = t.into_columns();
        let f = f.into_columns();
        let columns = t
            .into_iter()
            .zip(f)
            .map(|(t, f)| {
                t.into_iter()
                    .zip(f)
                    .zip(cond)
                    .map(|((t, f), c)| if c.is_truthy() { t } else { f })
                    .collect()
            })
            .collect();
        Batch::try_new(columns).map(Some)
    }
}
