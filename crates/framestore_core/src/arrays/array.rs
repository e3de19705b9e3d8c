use std::fs;
use std::path::Path;
use std::sync::Arc;

use framestore_error::{FrameStoreError, IoResultExt, Result, corrupt, internal};
use tracing::debug;

use super::partition_bounds;
use crate::storage::index::{
    self, ArrayIndex, BlockEntry, INDEX_VERSION, SegmentEntry, read_index, write_index,
};
use crate::storage::{SegmentHandle, SegmentIter, SegmentWriter, StorageDir};
use crate::value::{Value, ValueType};

/// Number of values read from the front of an array when estimating its
/// in-memory size.
const SIZE_SAMPLE_ROWS: u64 = 1024;

/// An immutable, typed sequence of values stored in one or more segments.
///
/// Cloning an array is cheap and shares the underlying segments.
#[derive(Debug, Clone)]
pub struct Array {
    inner: Arc<ArrayInner>,
}

#[derive(Debug)]
struct ArrayInner {
    value_type: ValueType,
    segments: Vec<SegmentHandle>,
    /// Row index each segment starts at, with a trailing entry for the total
    /// length.
    starts: Vec<u64>,
}

impl Array {
    pub fn from_segments(value_type: ValueType, segments: Vec<SegmentHandle>) -> Self {
        let mut starts = Vec::with_capacity(segments.len() + 1);
        let mut len = 0;
        for seg in &segments {
            starts.push(len);
            len += seg.len();
        }
        starts.push(len);

        Array {
            inner: Arc::new(ArrayInner {
                value_type,
                segments,
                starts,
            }),
        }
    }

    /// Create an array with no values.
    pub fn empty(value_type: ValueType) -> Self {
        Self::from_segments(value_type, Vec::new())
    }

    /// Write values to a new single segment array.
    pub fn from_values<I>(
        storage: &StorageDir,
        value_type: ValueType,
        values: I,
        block_size: usize,
    ) -> Result<Self>
    where
        I: IntoIterator<Item = Value>,
    {
        let mut writer = ArrayWriter::new(storage, value_type, 1, block_size)?;
        for value in values {
            writer.append(value)?;
        }
        writer.close()
    }

    pub fn len(&self) -> u64 {
        // Last entry always exists.
        self.inner.starts[self.inner.starts.len() - 1]
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn value_type(&self) -> ValueType {
        self.inner.value_type
    }

    pub fn segments(&self) -> &[SegmentHandle] {
        &self.inner.segments
    }

    pub fn num_segments(&self) -> usize {
        self.inner.segments.len()
    }

    /// Number of non-empty segments holding rows in `[begin, end)`.
    pub fn segments_in_range(&self, begin: u64, end: u64) -> usize {
        self.inner
            .segments
            .iter()
            .zip(&self.inner.starts)
            .filter(|(seg, start)| !seg.is_empty() && **start < end && **start + seg.len() > begin)
            .count()
    }

    /// Find the segment holding `idx`, and the row that segment starts at.
    fn locate(&self, idx: u64) -> Option<(usize, u64)> {
        if idx >= self.len() {
            return None;
        }
        let starts = &self.inner.starts[..self.inner.segments.len()];
        let seg = starts.partition_point(|&s| s <= idx) - 1;
        Some((seg, starts[seg]))
    }

    /// Read a single value.
    pub fn get(&self, idx: u64) -> Result<Value> {
        let (seg, start) = self
            .locate(idx)
            .ok_or_else(|| FrameStoreError::invalid_range(idx, idx + 1, self.len()))?;
        self.inner.segments[seg].open_for_read()?.get(idx - start)
    }

    /// Reader over the entire array.
    pub fn reader(&self) -> ArrayReader {
        ArrayReader::new(self.clone(), 0, self.len())
    }

    pub fn range_reader(&self, begin: u64, end: u64) -> Result<ArrayReader> {
        if begin > end || end > self.len() {
            return Err(FrameStoreError::invalid_range(begin, end, self.len()));
        }
        Ok(ArrayReader::new(self.clone(), begin, end))
    }

    /// Split the array into `n` contiguous readers of near-equal size.
    ///
    /// Partitions earlier in the array receive the extra rows when the length
    /// isn't evenly divisible.
    pub fn get_reader(&self, n: usize) -> Result<Vec<ArrayReader>> {
        if n == 0 {
            return Err(internal!("cannot split array into zero readers"));
        }
        (0..n)
            .map(|idx| {
                let (begin, end) = partition_bounds(self.len(), n as u64, idx as u64);
                self.range_reader(begin, end)
            })
            .collect()
    }

    pub fn read_all(&self) -> Result<Vec<Value>> {
        let mut out = Vec::with_capacity(self.len() as usize);
        let mut reader = self.reader();
        while reader.next_chunk(usize::MAX, &mut out)? > 0 {}
        Ok(out)
    }

    /// Concatenate arrays end to end without copying any data.
    pub fn concat(arrays: &[Array]) -> Result<Array> {
        let value_type = match arrays.first() {
            Some(arr) => arr.value_type(),
            None => return Err(internal!("cannot concat zero arrays")),
        };
        let mut segments = Vec::new();
        for arr in arrays {
            if arr.value_type() != value_type {
                return Err(FrameStoreError::type_mismatch(format!(
                    "cannot concat {} array onto {value_type} array",
                    arr.value_type()
                )));
            }
            segments.extend(arr.segments().iter().cloned());
        }
        Ok(Array::from_segments(value_type, segments))
    }

    /// Rough estimate of the in-memory size of all values in the array,
    /// extrapolated from a sample at the front.
    pub fn estimated_size(&self) -> Result<u64> {
        let sample = SIZE_SAMPLE_ROWS.min(self.len());
        if sample == 0 {
            return Ok(0);
        }
        let mut vals = Vec::with_capacity(sample as usize);
        self.range_reader(0, sample)?
            .next_chunk(sample as usize, &mut vals)?;
        let bytes: usize = vals.iter().map(|v| v.estimated_size()).sum();
        Ok((bytes as u64).saturating_mul(self.len()) / sample)
    }

    /// Save the array next to `path`, writing the index to `path`.
    ///
    /// Segment files are copied into the index's directory so the saved array
    /// doesn't depend on any temporary storage.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        let (dir, stem) = index_location(path)?;
        fs::create_dir_all(&dir)
            .io_context(|| format!("create directory {}", dir.display()))?;

        let mut entries = Vec::with_capacity(self.num_segments());
        for (idx, seg) in self.segments().iter().enumerate() {
            let name = format!("{stem}.{idx:04}.seg");
            let dst = dir.join(&name);
            if !is_same_file(seg.path(), &dst) {
                fs::copy(seg.path(), &dst).io_context(|| {
                    format!("copy segment {} to {}", seg.path().display(), dst.display())
                })?;
            }
            entries.push(SegmentEntry {
                path: name.into(),
                len: seg.len(),
                blocks: seg
                    .blocks()
                    .iter()
                    .map(|b| BlockEntry {
                        count: b.count,
                        offset: b.offset,
                        length: b.length,
                    })
                    .collect(),
            });
        }

        let index = ArrayIndex {
            version: INDEX_VERSION,
            value_type: self.value_type(),
            len: self.len(),
            segments: entries,
        };
        write_index(path, &index)?;

        debug!(path = %path.display(), len = self.len(), segments = self.num_segments(), "saved array");
        Ok(())
    }

    /// Open an array previously written with [`Array::save`].
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Array> {
        let path = path.as_ref();
        let index: ArrayIndex = read_index(path)?;
        index.validate()?;

        let mut segments = Vec::with_capacity(index.segments.len());
        for entry in &index.segments {
            let seg_path = index::resolve_relative(path, &entry.path);
            let seg = SegmentHandle::load(&seg_path)?;
            let matches = seg.len() == entry.len
                && seg.num_blocks() == entry.blocks.len()
                && seg.blocks().iter().zip(&entry.blocks).all(|(a, b)| {
                    a.count == b.count && a.offset == b.offset && a.length == b.length
                });
            if !matches {
                return Err(corrupt!(
                    "segment {} doesn't match its entry in index {}",
                    seg_path.display(),
                    path.display()
                ));
            }
            segments.push(seg);
        }

        Ok(Array::from_segments(index.value_type, segments))
    }
}

/// Split an index path into its directory and file stem.
pub(crate) fn index_location(path: &Path) -> Result<(std::path::PathBuf, String)> {
    let stem = path
        .file_stem()
        .and_then(|s| s.to_str())
        .ok_or_else(|| internal!("invalid index path {}", path.display()))?
        .to_string();
    let dir = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => std::path::PathBuf::from("."),
    };
    Ok((dir, stem))
}

fn is_same_file(a: &Path, b: &Path) -> bool {
    match (fs::canonicalize(a), fs::canonicalize(b)) {
        (Ok(a), Ok(b)) => a == b,
        _ => false,
    }
}

/// Reader over a contiguous range of an array.
///
/// Readers are independent of each other and may be repositioned with
/// [`ArrayReader::seek`].
#[derive(Debug)]
pub struct ArrayReader {
    array: Array,
    begin: u64,
    end: u64,
    /// Absolute row position of the next value.
    pos: u64,
    current: Option<SegmentIter>,
}

impl ArrayReader {
    fn new(array: Array, begin: u64, end: u64) -> Self {
        ArrayReader {
            array,
            begin,
            end,
            pos: begin,
            current: None,
        }
    }

    pub fn len(&self) -> u64 {
        self.end - self.begin
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn remaining(&self) -> u64 {
        self.end - self.pos
    }

    /// Range of the array this reader covers.
    pub fn range(&self) -> (u64, u64) {
        (self.begin, self.end)
    }

    /// Move to `offset` relative to the start of this reader.
    pub fn seek(&mut self, offset: u64) -> Result<()> {
        if offset > self.len() {
            return Err(FrameStoreError::invalid_range(offset, offset, self.len()));
        }
        self.pos = self.begin + offset;
        self.current = None;
        Ok(())
    }

    /// Append up to `max` values to `out`, returning how many were appended.
    ///
    /// Only returns fewer than `max` values once the reader is exhausted.
    pub fn next_chunk(&mut self, max: usize, out: &mut Vec<Value>) -> Result<usize> {
        let mut appended = 0;
        while appended < max && self.pos < self.end {
            if self.current.is_none() {
                let (seg, start) = self
                    .array
                    .locate(self.pos)
                    .ok_or_else(|| internal!("reader position {} past end", self.pos))?;
                let handle = &self.array.inner.segments[seg];
                let seg_end = (start + handle.len()).min(self.end);
                self.current = Some(handle.iterate_range(self.pos - start, seg_end - start)?);
            }

            let iter = match self.current.as_mut() {
                Some(iter) => iter,
                None => return Err(internal!("missing segment iterator")),
            };
            let n = iter.next_chunk(max - appended, out)?;
            if iter.remaining() == 0 {
                self.current = None;
            }
            if n == 0 && self.current.is_some() {
                return Err(internal!("segment iterator made no progress"));
            }
            appended += n;
            self.pos += n as u64;
        }
        Ok(appended)
    }
}

impl Iterator for ArrayReader {
    type Item = Result<Value>;

    fn next(&mut self) -> Option<Self::Item> {
        let mut out = Vec::with_capacity(1);
        match self.next_chunk(1, &mut out) {
            Ok(_) => out.pop().map(Ok),
            Err(e) => {
                self.pos = self.end;
                Some(Err(e))
            }
        }
    }
}

/// Writer for a new array.
///
/// Values are written to one of several segments. [`ArrayWriter::append`]
/// writes to the current segment and [`ArrayWriter::rotate`] moves on to the
/// next. Segments may also be written to in parallel through
/// [`ArrayWriter::segment_writers`]. Segments are concatenated in index order
/// on close.
#[derive(Debug)]
pub struct ArrayWriter {
    value_type: ValueType,
    writers: Vec<SegmentWriter>,
    current: usize,
}

impl ArrayWriter {
    pub fn new(
        storage: &StorageDir,
        value_type: ValueType,
        num_segments: usize,
        block_size: usize,
    ) -> Result<Self> {
        let writers = (0..num_segments.max(1))
            .map(|_| storage.create_segment("array", block_size))
            .collect::<Result<Vec<_>>>()?;
        Ok(ArrayWriter {
            value_type,
            writers,
            current: 0,
        })
    }

    pub fn value_type(&self) -> ValueType {
        self.value_type
    }

    pub fn num_segments(&self) -> usize {
        self.writers.len()
    }

    /// Total values written across all segments.
    pub fn len(&self) -> u64 {
        self.writers.iter().map(|w| w.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn append(&mut self, value: Value) -> Result<()> {
        let value = value.coerce_to(self.value_type)?;
        self.writers[self.current].append(&value)
    }

    /// Move to the next segment, wrapping around after the last.
    pub fn rotate(&mut self) {
        self.current = (self.current + 1) % self.writers.len();
    }

    pub fn segment_writer(&mut self, idx: usize) -> Result<SegmentAppender<'_>> {
        let value_type = self.value_type;
        let num_segments = self.writers.len();
        let writer = self
            .writers
            .get_mut(idx)
            .ok_or_else(|| internal!("segment {idx} out of range for writer with {num_segments} segments"))?;
        Ok(SegmentAppender { value_type, writer })
    }

    /// Get an appender for every segment, usable from separate threads.
    pub fn segment_writers(&mut self) -> Vec<SegmentAppender<'_>> {
        let value_type = self.value_type;
        self.writers
            .iter_mut()
            .map(|writer| SegmentAppender { value_type, writer })
            .collect()
    }

    pub fn close(mut self) -> Result<Array> {
        let segments = self
            .writers
            .iter_mut()
            .map(|w| w.close())
            .collect::<Result<Vec<_>>>()?;
        Ok(Array::from_segments(self.value_type, segments))
    }
}

/// Exclusive access to a single segment of an [`ArrayWriter`].
#[derive(Debug)]
pub struct SegmentAppender<'a> {
    value_type: ValueType,
    writer: &'a mut SegmentWriter,
}

impl SegmentAppender<'_> {
    pub fn append(&mut self, value: Value) -> Result<()> {
        let value = value.coerce_to(self.value_type)?;
        self.writer.append(&value)
    }

    pub fn len(&self) -> u64 {
        self.writer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.writer.is_empty()
    }
}
