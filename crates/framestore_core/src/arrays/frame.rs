use std::collections::HashSet;
use std::path::Path;

use framestore_error::{FrameStoreError, Result, corrupt, internal};
use tracing::debug;

use super::array::{Array, ArrayReader, ArrayWriter, index_location};
use super::batch::Batch;
use crate::storage::StorageDir;
use crate::storage::index::{
    self, ColumnEntry, FrameIndex, INDEX_VERSION, read_index, write_index,
};
use crate::value::{Value, ValueType};

/// An ordered collection of uniquely named, equal length arrays.
///
/// Frames are immutable. Operations returning a modified frame share all
/// unaffected columns with the original.
#[derive(Debug, Clone)]
pub struct Frame {
    names: Vec<String>,
    columns: Vec<Array>,
    len: u64,
}

impl Frame {
    pub fn try_new(columns: Vec<(String, Array)>) -> Result<Self> {
        let mut seen = HashSet::with_capacity(columns.len());
        let len = columns.first().map(|(_, arr)| arr.len()).unwrap_or(0);

        let mut names = Vec::with_capacity(columns.len());
        let mut arrays = Vec::with_capacity(columns.len());
        for (name, arr) in columns {
            if !seen.insert(name.clone()) {
                return Err(FrameStoreError::DuplicateColumn(name));
            }
            if arr.len() != len {
                return Err(FrameStoreError::LengthMismatch {
                    expected: len,
                    got: arr.len(),
                });
            }
            names.push(name);
            arrays.push(arr);
        }

        Ok(Frame {
            names,
            columns: arrays,
            len,
        })
    }

    /// A frame with no columns and no rows.
    pub fn empty() -> Self {
        Frame {
            names: Vec::new(),
            columns: Vec::new(),
            len: 0,
        }
    }

    /// Build a frame from in-memory columns, each written to a single
    /// segment.
    pub fn from_values<S>(
        storage: &StorageDir,
        columns: Vec<(S, ValueType, Vec<Value>)>,
        block_size: usize,
    ) -> Result<Self>
    where
        S: Into<String>,
    {
        let columns = columns
            .into_iter()
            .map(|(name, ty, vals)| {
                let name: String = name.into();
                Ok((name, Array::from_values(storage, ty, vals, block_size)?))
            })
            .collect::<Result<Vec<_>>>()?;
        Self::try_new(columns)
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn num_columns(&self) -> usize {
        self.columns.len()
    }

    pub fn column_names(&self) -> &[String] {
        &self.names
    }

    pub fn column_types(&self) -> Vec<ValueType> {
        self.columns.iter().map(|c| c.value_type()).collect()
    }

    pub fn columns(&self) -> &[Array] {
        &self.columns
    }

    pub fn column_index(&self, name: &str) -> Result<usize> {
        self.names
            .iter()
            .position(|n| n == name)
            .ok_or_else(|| FrameStoreError::MissingColumn(name.to_string()))
    }

    pub fn column(&self, name: &str) -> Result<&Array> {
        let idx = self.column_index(name)?;
        Ok(&self.columns[idx])
    }

    pub fn column_at(&self, idx: usize) -> Option<&Array> {
        self.columns.get(idx)
    }

    /// Select a subset of columns in the given order.
    pub fn select<S: AsRef<str>>(&self, names: &[S]) -> Result<Frame> {
        let columns = names
            .iter()
            .map(|name| {
                let name = name.as_ref();
                Ok((name.to_string(), self.column(name)?.clone()))
            })
            .collect::<Result<Vec<_>>>()?;
        Frame::try_new(columns)
    }

    /// Return a new frame with `array` appended as the last column.
    pub fn add_column(&self, name: impl Into<String>, array: Array) -> Result<Frame> {
        let name = name.into();
        if self.names.contains(&name) {
            return Err(FrameStoreError::DuplicateColumn(name));
        }
        if !self.columns.is_empty() && array.len() != self.len {
            return Err(FrameStoreError::LengthMismatch {
                expected: self.len,
                got: array.len(),
            });
        }
        let mut names = self.names.clone();
        let mut columns = self.columns.clone();
        names.push(name);
        columns.push(array);
        let len = columns[0].len();
        Ok(Frame {
            names,
            columns,
            len,
        })
    }

    pub fn remove_column(&self, name: &str) -> Result<Frame> {
        let idx = self.column_index(name)?;
        let mut names = self.names.clone();
        let mut columns = self.columns.clone();
        names.remove(idx);
        columns.remove(idx);
        let len = if columns.is_empty() { 0 } else { self.len };
        Ok(Frame {
            names,
            columns,
            len,
        })
    }

    pub fn rename(&self, from: &str, to: impl Into<String>) -> Result<Frame> {
        let idx = self.column_index(from)?;
        let to = to.into();
        if self.names.iter().enumerate().any(|(i, n)| i != idx && *n == to) {
            return Err(FrameStoreError::DuplicateColumn(to));
        }
        let mut frame = self.clone();
        frame.names[idx] = to;
        Ok(frame)
    }

    /// Replace all column names.
    pub fn with_names(&self, names: Vec<String>) -> Result<Frame> {
        if names.len() != self.columns.len() {
            return Err(internal!(
                "got {} names for frame with {} columns",
                names.len(),
                self.columns.len()
            ));
        }
        Frame::try_new(names.into_iter().zip(self.columns.iter().cloned()).collect())
    }

    pub fn reader(&self) -> FrameReader {
        FrameReader {
            columns: self.columns.iter().map(|c| c.reader()).collect(),
            len: self.len,
            pos: 0,
        }
    }

    pub fn range_reader(&self, begin: u64, end: u64) -> Result<FrameReader> {
        if begin > end || end > self.len {
            return Err(FrameStoreError::invalid_range(begin, end, self.len));
        }
        let columns = self
            .columns
            .iter()
            .map(|c| c.range_reader(begin, end))
            .collect::<Result<Vec<_>>>()?;
        Ok(FrameReader {
            columns,
            len: end - begin,
            pos: 0,
        })
    }

    /// Split the frame into `n` contiguous row readers.
    ///
    /// Partitioned the same way as [`Array::get_reader`].
    pub fn get_reader(&self, n: usize) -> Result<Vec<FrameReader>> {
        if n == 0 {
            return Err(internal!("cannot split frame into zero readers"));
        }
        (0..n)
            .map(|idx| {
                let (begin, end) = super::partition_bounds(self.len, n as u64, idx as u64);
                self.range_reader(begin, end)
            })
            .collect()
    }

    pub fn read_rows(&self) -> Result<Vec<Vec<Value>>> {
        let mut reader = self.reader();
        let mut rows = Vec::with_capacity(self.len as usize);
        while let Some(batch) = reader.next_batch(4096)? {
            rows.extend(batch.into_rows());
        }
        Ok(rows)
    }

    pub fn read_columns(&self) -> Result<Vec<Vec<Value>>> {
        self.columns.iter().map(|c| c.read_all()).collect()
    }

    /// Number of physical segments backing the first column.
    pub fn num_segments(&self) -> usize {
        self.columns.first().map(|c| c.num_segments()).unwrap_or(0)
    }

    pub fn estimated_size(&self) -> Result<u64> {
        let mut total = 0;
        for col in &self.columns {
            total += col.estimated_size()?;
        }
        Ok(total)
    }

    /// Concatenate frames with identical schemas end to end.
    pub fn concat(frames: &[Frame]) -> Result<Frame> {
        let first = match frames.first() {
            Some(f) => f,
            None => return Err(internal!("cannot concat zero frames")),
        };
        for frame in frames {
            if frame.names != first.names {
                return Err(FrameStoreError::type_mismatch(format!(
                    "cannot concat frames with columns {:?} and {:?}",
                    first.names, frame.names
                )));
            }
        }
        let columns = (0..first.num_columns())
            .map(|idx| {
                let arrays: Vec<_> = frames.iter().map(|f| f.columns[idx].clone()).collect();
                Ok((first.names[idx].clone(), Array::concat(&arrays)?))
            })
            .collect::<Result<Vec<_>>>()?;
        Frame::try_new(columns)
    }

    /// Save all columns and a frame index at `path`.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        let (dir, stem) = index_location(path)?;

        let mut entries = Vec::with_capacity(self.columns.len());
        for (idx, (name, col)) in self.names.iter().zip(&self.columns).enumerate() {
            let file = format!("{stem}.col{idx:03}.json");
            col.save(dir.join(&file))?;
            entries.push(ColumnEntry {
                name: name.clone(),
                index: file.into(),
            });
        }

        write_index(
            path,
            &FrameIndex {
                version: INDEX_VERSION,
                len: self.len,
                columns: entries,
            },
        )?;

        debug!(path = %path.display(), len = self.len, columns = self.columns.len(), "saved frame");
        Ok(())
    }

    pub fn open<P: AsRef<Path>>(path: P) -> Result<Frame> {
        let path = path.as_ref();
        let index: FrameIndex = read_index(path)?;
        index.validate()?;

        let columns = index
            .columns
            .iter()
            .map(|entry| {
                let col_path = index::resolve_relative(path, &entry.index);
                Ok((entry.name.clone(), Array::open(col_path)?))
            })
            .collect::<Result<Vec<_>>>()?;
        let frame = Frame::try_new(columns)?;

        if !index.columns.is_empty() && frame.len() != index.len {
            return Err(corrupt!(
                "frame index {} says length {}, columns have length {}",
                path.display(),
                index.len,
                frame.len()
            ));
        }
        Ok(frame)
    }
}

/// Row reader over a frame, zipping a reader per column.
#[derive(Debug)]
pub struct FrameReader {
    columns: Vec<ArrayReader>,
    len: u64,
    pos: u64,
}

impl FrameReader {
    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn remaining(&self) -> u64 {
        self.len - self.pos
    }

    pub fn seek(&mut self, offset: u64) -> Result<()> {
        if offset > self.len {
            return Err(FrameStoreError::invalid_range(offset, offset, self.len));
        }
        for col in &mut self.columns {
            col.seek(offset)?;
        }
        self.pos = offset;
        Ok(())
    }

    /// Read the next batch of at most `max` rows.
    ///
    /// Returns exactly `min(max, remaining)` rows, or `None` once exhausted.
    pub fn next_batch(&mut self, max: usize) -> Result<Option<Batch>> {
        let n = (self.remaining() as usize).min(max);
        if n == 0 {
            return Ok(None);
        }
        let mut columns = Vec::with_capacity(self.columns.len());
        for col in &mut self.columns {
            let mut vals = Vec::with_capacity(n);
            let got = col.next_chunk(n, &mut vals)?;
            if got != n {
                return Err(internal!("column reader returned {got} rows, expected {n}"));
            }
            columns.push(vals);
        }
        self.pos += n as u64;
        Batch::try_new(columns).map(Some)
    }
}

/// Writer for a new frame, one [`ArrayWriter`] per column.
#[derive(Debug)]
pub struct FrameWriter {
    names: Vec<String>,
    writers: Vec<ArrayWriter>,
}

impl FrameWriter {
    pub fn new(
        storage: &StorageDir,
        names: Vec<String>,
        types: &[ValueType],
        num_segments: usize,
        block_size: usize,
    ) -> Result<Self> {
        if names.len() != types.len() {
            return Err(internal!(
                "got {} names for {} column types",
                names.len(),
                types.len()
            ));
        }
        let mut seen = HashSet::new();
        for name in &names {
            if !seen.insert(name) {
                return Err(FrameStoreError::DuplicateColumn(name.clone()));
            }
        }
        let writers = types
            .iter()
            .map(|ty| ArrayWriter::new(storage, *ty, num_segments, block_size))
            .collect::<Result<Vec<_>>>()?;
        Ok(FrameWriter { names, writers })
    }

    pub fn num_columns(&self) -> usize {
        self.writers.len()
    }

    /// Rows written so far.
    pub fn len(&self) -> u64 {
        self.writers.first().map(|w| w.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn write_row(&mut self, row: Vec<Value>) -> Result<()> {
        if row.len() != self.writers.len() {
            return Err(internal!(
                "row has {} values, frame has {} columns",
                row.len(),
                self.writers.len()
            ));
        }
        for (writer, val) in self.writers.iter_mut().zip(row) {
            writer.append(val)?;
        }
        Ok(())
    }

    pub fn write_batch(&mut self, batch: Batch) -> Result<()> {
        if batch.num_columns() != self.writers.len() {
            return Err(internal!(
                "batch has {} columns, frame has {}",
                batch.num_columns(),
                self.writers.len()
            ));
        }
        for (writer, col) in self.writers.iter_mut().zip(batch.into_columns()) {
            for val in col {
                writer.append(val)?;
            }
        }
        Ok(())
    }

    /// Move every column to its next segment.
    pub fn rotate(&mut self) {
        for writer in &mut self.writers {
            writer.rotate();
        }
    }

    pub fn close(self) -> Result<Frame> {
        let columns = self
            .names
            .into_iter()
            .zip(self.writers)
            .map(|(name, w)| Ok((name, w.close()?)))
            .collect::<Result<Vec<_>>>()?;
        Frame::try_new(columns)
    }
}
