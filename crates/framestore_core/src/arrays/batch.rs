use framestore_error::{FrameStoreError, Result, internal};

use crate::value::Value;

/// A columnar batch of rows passed between operators.
///
/// All columns hold the same number of values.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Batch {
    columns: Vec<Vec<Value>>,
    num_rows: usize,
}

impl Batch {
    pub fn try_new(columns: Vec<Vec<Value>>) -> Result<Self> {
        let num_rows = columns.first().map(|c| c.len()).unwrap_or(0);
        for col in &columns {
            if col.len() != num_rows {
                return Err(FrameStoreError::LengthMismatch {
                    expected: num_rows as u64,
                    got: col.len() as u64,
                });
            }
        }
        Ok(Batch { columns, num_rows })
    }

    /// Create a batch with no rows.
    pub fn empty(num_columns: usize) -> Self {
        Batch {
            columns: vec![Vec::new(); num_columns],
            num_rows: 0,
        }
    }

    /// Create a batch with some number of rows but no columns.
    ///
    /// Used when only the row count of an input matters.
    pub fn empty_with_rows(num_rows: usize) -> Self {
        Batch {
            columns: Vec::new(),
            num_rows,
        }
    }

    pub fn from_rows(rows: Vec<Vec<Value>>, num_columns: usize) -> Result<Self> {
        let mut columns: Vec<Vec<Value>> = (0..num_columns)
            .map(|_| Vec::with_capacity(rows.len()))
            .collect();
        let num_rows = rows.len();
        for row in rows {
            if row.len() != num_columns {
                return Err(internal!(
                    "row has {} values, expected {num_columns}",
                    row.len()
                ));
            }
            for (col, val) in columns.iter_mut().zip(row) {
                col.push(val);
            }
        }
        Ok(Batch { columns, num_rows })
    }

    pub fn num_rows(&self) -> usize {
        self.num_rows
    }

    pub fn num_columns(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.num_rows == 0
    }

    pub fn column(&self, idx: usize) -> Option<&Vec<Value>> {
        self.columns.get(idx)
    }

    pub fn columns(&self) -> &[Vec<Value>] {
        &self.columns
    }

    pub fn into_columns(self) -> Vec<Vec<Value>> {
        self.columns
    }

    pub fn row(&self, idx: usize) -> Option<Vec<Value>> {
        if idx >= self.num_rows {
            return None;
        }
        Some(self.columns.iter().map(|c| c[idx].clone()).collect())
    }

    /// Iterate over rows, cloning each value.
    pub fn rows(&self) -> impl Iterator<Item = Vec<Value>> + '_ {
        (0..self.num_rows).map(|idx| self.columns.iter().map(|c| c[idx].clone()).collect())
    }

    pub fn into_rows(self) -> Vec<Vec<Value>> {
        let mut rows: Vec<Vec<Value>> = (0..self.num_rows)
            .map(|_| Vec::with_capacity(self.columns.len()))
            .collect();
        for col in self.columns {
            for (row, val) in rows.iter_mut().zip(col) {
                row.push(val);
            }
        }
        rows
    }

    /// Select columns by index, cloning the selected columns.
    pub fn project(&self, indices: &[usize]) -> Result<Batch> {
        let columns = indices
            .iter()
            .map(|&idx| {
                self.columns
                    .get(idx)
                    .cloned()
                    .ok_or_else(|| internal!("column {idx} out of range for batch"))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Batch {
            columns,
            num_rows: self.num_rows,
        })
    }

    /// Keep only rows where `selection` is true.
    pub fn select(self, selection: &[bool]) -> Result<Batch> {
        if selection.len() != self.num_rows {
            return Err(FrameStoreError::LengthMismatch {
                expected: self.num_rows as u64,
                got: selection.len() as u64,
            });
        }
        let num_rows = selection.iter().filter(|b| **b).count();
        let columns = self
            .columns
            .into_iter()
            .map(|col| {
                col.into_iter()
                    .zip(selection)
                    .filter_map(|(v, keep)| keep.then_some(v))
                    .collect()
            })
            .collect();
        Ok(Batch { columns, num_rows })
    }

    /// Horizontally concatenate the columns of `other` onto this batch.
    pub fn hstack(&mut self, other: Batch) -> Result<()> {
        if self.columns.is_empty() {
            *self = other;
            return Ok(());
        }
        if other.num_rows != self.num_rows {
            return Err(FrameStoreError::LengthMismatch {
                expected: self.num_rows as u64,
                got: other.num_rows as u64,
            });
        }
        self.columns.extend(other.columns);
        Ok(())
    }

    /// Vertically append the rows of `other` to this batch.
    pub fn vstack(&mut self, other: Batch) -> Result<()> {
        if other.columns.len() != self.columns.len() {
            return Err(internal!(
                "cannot append batch with {} columns to batch with {}",
                other.columns.len(),
                self.columns.len()
            ));
        }
        self.num_rows += other.num_rows;
        for (col, other) in self.columns.iter_mut().zip(other.columns) {
            col.extend(other);
        }
        Ok(())
    }
}
