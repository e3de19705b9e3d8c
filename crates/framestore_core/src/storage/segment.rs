//! Append-only segment files.
//!
//! A segment stores an ordered sequence of values for a single column as a
//! series of compressed blocks followed by a trailer indexing those blocks.
//!
//! ```text
//! "FSSEG\0\0\x01"                 // magic, 8 bytes
//! <block>*                        // see `block`
//! <trailer>
//!   <n blocks>                    // u64
//!   (<count> <offset> <length> <stats>)*n
//!   <total len>                   // u64
//! <footer>
//!   <trailer offset>              // u64
//!   <trailer crc32>               // u32
//!   "FSSEGEND"                    // 8 bytes
//! ```
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use bytes::{Buf, BufMut, BytesMut};
use framestore_error::{IoResultExt, Result, corrupt, internal};
use tracing::trace;

use super::block::{BlockInfo, BlockStats, open_block, seal_block};
use super::dir::SegmentFile;
use crate::value::Value;
use crate::value::encoding::Encodeable;

pub const SEGMENT_MAGIC: &[u8; 8] = b"FSSEG\0\0\x01";
pub const FOOTER_MAGIC: &[u8; 8] = b"FSSEGEND";
pub const FOOTER_SIZE: u64 = 8 + 4 + 8;

/// Writer for a single segment.
///
/// A segment writer is exclusively owned by one thread until closed.
#[derive(Debug)]
pub struct SegmentWriter {
    file: SegmentFileRef,
    out: Option<BufWriter<File>>,
    block_size: usize,
    /// Offset in the file the next block will be written to.
    offset: u64,
    /// Encoded values for the block currently being built.
    buf: BytesMut,
    buf_count: u64,
    buf_stats: BlockStats,
    blocks: Vec<BlockInfo>,
    len: u64,
    /// Set once closed, returned on subsequent calls to close.
    closed: Option<SegmentHandle>,
}

type SegmentFileRef = Arc<SegmentFile>;

impl SegmentWriter {
    /// Create a new segment file at `path`.
    ///
    /// The file is not deleted when handles are dropped.
    pub fn open_for_write<P: AsRef<Path>>(path: P, block_size: usize) -> Result<Self> {
        let file = SegmentFile::persistent(path.as_ref().to_path_buf());
        Self::create(Arc::new(file), block_size)
    }

    pub(crate) fn create(file: SegmentFileRef, block_size: usize) -> Result<Self> {
        let f = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(file.path())
            .io_context(|| format!("create segment {}", file.path().display()))?;

        let mut out = BufWriter::new(f);
        out.write_all(SEGMENT_MAGIC)
            .io_context(|| format!("write segment header {}", file.path().display()))?;

        Ok(SegmentWriter {
            file,
            out: Some(out),
            block_size: block_size.max(1),
            offset: SEGMENT_MAGIC.len() as u64,
            buf: BytesMut::new(),
            buf_count: 0,
            buf_stats: BlockStats::default(),
            blocks: Vec::new(),
            len: 0,
            closed: None,
        })
    }

    pub fn path(&self) -> &Path {
        self.file.path()
    }

    /// Number of values appended so far.
    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn append(&mut self, value: &Value) -> Result<()> {
        if self.closed.is_some() {
            return Err(internal!(
                "append to closed segment {}",
                self.file.path().display()
            ));
        }

        value.encode(&mut self.buf);
        self.buf_stats.update(value);
        self.buf_count += 1;
        self.len += 1;

        if self.buf.len() >= self.block_size {
            self.flush_block()?;
        }

        Ok(())
    }

    fn flush_block(&mut self) -> Result<()> {
        if self.buf_count == 0 {
            return Ok(());
        }

        let out = self
            .out
            .as_mut()
            .ok_or_else(|| internal!("segment writer missing output"))?;

        let block = seal_block(&self.buf);
        out.write_all(&block)
            .io_context(|| format!("write block to {}", self.file.path().display()))?;

        trace!(
            path = %self.file.path().display(),
            block = self.blocks.len(),
            count = self.buf_count,
            raw_bytes = self.buf.len(),
            disk_bytes = block.len(),
            "flushed block"
        );

        self.blocks.push(BlockInfo {
            count: self.buf_count,
            offset: self.offset,
            length: block.len() as u64,
            stats: std::mem::take(&mut self.buf_stats),
        });
        self.offset += block.len() as u64;
        self.buf.clear();
        self.buf_count = 0;

        Ok(())
    }

    /// Flush the last block and write the trailer.
    ///
    /// Calling close more than once returns the same handle.
    pub fn close(&mut self) -> Result<SegmentHandle> {
        if let Some(handle) = &self.closed {
            return Ok(handle.clone());
        }

        self.flush_block()?;

        let mut trailer = Vec::new();
        trailer.put_u64(self.blocks.len() as u64);
        for block in &self.blocks {
            trailer.put_u64(block.count);
            trailer.put_u64(block.offset);
            trailer.put_u64(block.length);
            block.stats.encode(&mut trailer);
        }
        trailer.put_u64(self.len);

        let mut footer = Vec::with_capacity(FOOTER_SIZE as usize);
        footer.put_u64(self.offset);
        footer.put_u32(crc32fast::hash(&trailer));
        footer.put_slice(FOOTER_MAGIC);

        let mut out = self
            .out
            .take()
            .ok_or_else(|| internal!("segment writer missing output"))?;
        let path = self.file.path().to_path_buf();
        out.write_all(&trailer)
            .and_then(|_| out.write_all(&footer))
            .and_then(|_| out.flush())
            .io_context(|| format!("write segment trailer {}", path.display()))?;

        let handle = SegmentHandle::new(self.file.clone(), std::mem::take(&mut self.blocks), self.len)?;
        self.closed = Some(handle.clone());

        Ok(handle)
    }
}

/// Handle to a closed, immutable segment.
///
/// Cheap to clone and freely shareable across threads.
#[derive(Debug, Clone)]
pub struct SegmentHandle {
    inner: Arc<SegmentHandleInner>,
}

#[derive(Debug)]
struct SegmentHandleInner {
    file: SegmentFileRef,
    blocks: Vec<BlockInfo>,
    /// Row index of the first value in each block, plus a final entry for the
    /// total length.
    block_starts: Vec<u64>,
    len: u64,
}

impl SegmentHandle {
    fn new(file: SegmentFileRef, blocks: Vec<BlockInfo>, len: u64) -> Result<Self> {
        let mut block_starts = Vec::with_capacity(blocks.len() + 1);
        let mut count = 0;
        for block in &blocks {
            block_starts.push(count);
            count += block.count;
        }
        block_starts.push(count);

        if count != len {
            return Err(corrupt!(
                "segment {} block counts sum to {count}, trailer says {len}",
                file.path().display()
            ));
        }

        Ok(SegmentHandle {
            inner: Arc::new(SegmentHandleInner {
                file,
                blocks,
                block_starts,
                len,
            }),
        })
    }

    /// Open an existing segment by reading its trailer.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::load_file(Arc::new(SegmentFile::persistent(path.as_ref().to_path_buf())))
    }

    pub(crate) fn load_file(file: SegmentFileRef) -> Result<Self> {
        let path = file.path().to_path_buf();
        let mut f = File::open(&path).io_context(|| format!("open segment {}", path.display()))?;
        let file_len = f
            .metadata()
            .io_context(|| format!("stat segment {}", path.display()))?
            .len();

        if file_len < SEGMENT_MAGIC.len() as u64 + FOOTER_SIZE {
            return Err(corrupt!(
                "segment {} too small to hold trailer ({file_len} bytes)",
                path.display()
            ));
        }

        let mut magic = [0; 8];
        f.read_exact(&mut magic)
            .io_context(|| format!("read segment header {}", path.display()))?;
        if &magic != SEGMENT_MAGIC {
            return Err(corrupt!("segment {} has invalid magic", path.display()));
        }

        let mut footer = [0; FOOTER_SIZE as usize];
        f.seek(SeekFrom::Start(file_len - FOOTER_SIZE))
            .and_then(|_| f.read_exact(&mut footer))
            .io_context(|| format!("read segment footer {}", path.display()))?;

        let mut footer_buf = &footer[..];
        let trailer_offset = footer_buf.get_u64();
        let trailer_crc = footer_buf.get_u32();
        if footer_buf != FOOTER_MAGIC {
            return Err(corrupt!(
                "segment {} is missing its trailer (incomplete write?)",
                path.display()
            ));
        }
        if trailer_offset > file_len - FOOTER_SIZE {
            return Err(corrupt!("segment {} has invalid trailer offset", path.display()));
        }

        let mut trailer = vec![0; (file_len - FOOTER_SIZE - trailer_offset) as usize];
        f.seek(SeekFrom::Start(trailer_offset))
            .and_then(|_| f.read_exact(&mut trailer))
            .io_context(|| format!("read segment trailer {}", path.display()))?;
        if crc32fast::hash(&trailer) != trailer_crc {
            return Err(corrupt!("segment {} trailer checksum mismatch", path.display()));
        }

        let mut src = &trailer[..];
        if src.remaining() < 8 {
            return Err(corrupt!("truncated trailer in {}", path.display()));
        }
        let num_blocks = src.get_u64();
        let mut blocks = Vec::new();
        for _ in 0..num_blocks {
            if src.remaining() < 24 {
                return Err(corrupt!("truncated block index in {}", path.display()));
            }
            let count = src.get_u64();
            let offset = src.get_u64();
            let length = src.get_u64();
            let stats = BlockStats::decode(&mut src)?;
            let block_end = offset
                .checked_add(length)
                .ok_or_else(|| corrupt!("block at offset {offset} overflows in {}", path.display()))?;
            if block_end > trailer_offset {
                return Err(corrupt!(
                    "block at offset {offset} overlaps trailer in {}",
                    path.display()
                ));
            }
            blocks.push(BlockInfo {
                count,
                offset,
                length,
                stats,
            });
        }
        if src.remaining() != 8 {
            return Err(corrupt!("malformed trailer in {}", path.display()));
        }
        let len = src.get_u64();

        Self::new(file, blocks, len)
    }

    pub fn path(&self) -> &Path {
        self.inner.file.path()
    }

    pub fn len(&self) -> u64 {
        self.inner.len
    }

    pub fn is_empty(&self) -> bool {
        self.inner.len == 0
    }

    pub fn num_blocks(&self) -> usize {
        self.inner.blocks.len()
    }

    pub fn blocks(&self) -> &[BlockInfo] {
        &self.inner.blocks
    }

    pub fn is_temporary(&self) -> bool {
        self.inner.file.is_temporary()
    }

    /// Total bytes used on disk by this segment's blocks.
    pub fn block_bytes(&self) -> u64 {
        self.inner.blocks.iter().map(|b| b.length).sum()
    }

    /// Returns the block containing row `idx` and the row index the block
    /// starts at.
    pub fn locate(&self, idx: u64) -> Option<(usize, u64)> {
        if idx >= self.inner.len {
            return None;
        }
        let starts = &self.inner.block_starts;
        // Last block whose start is <= idx, skipping empty blocks.
        let block = starts.partition_point(|&s| s <= idx) - 1;
        Some((block, starts[block]))
    }

    pub fn open_for_read(&self) -> Result<SegmentReader> {
        SegmentReader::open_for_read(self)
    }

    /// Lazily iterate values from `start` to the end of the segment.
    pub fn iterate_from(&self, start: u64) -> Result<SegmentIter> {
        SegmentIter::new(self.open_for_read()?, start, self.len())
    }

    /// Lazily iterate values in `[start, end)`.
    pub fn iterate_range(&self, start: u64, end: u64) -> Result<SegmentIter> {
        SegmentIter::new(self.open_for_read()?, start, end)
    }
}

/// Random access reader over a closed segment.
///
/// A reader isn't meant to be shared between threads, but any number of
/// independent readers may be opened over the same segment.
#[derive(Debug)]
pub struct SegmentReader {
    handle: SegmentHandle,
    file: File,
    /// Most recently read block.
    cached: Option<(usize, Arc<Vec<Value>>)>,
    read_buf: Vec<u8>,
}

impl SegmentReader {
    pub fn open_for_read(handle: &SegmentHandle) -> Result<Self> {
        let file = File::open(handle.path())
            .io_context(|| format!("open segment {}", handle.path().display()))?;
        Ok(SegmentReader {
            handle: handle.clone(),
            file,
            cached: None,
            read_buf: Vec::new(),
        })
    }

    pub fn handle(&self) -> &SegmentHandle {
        &self.handle
    }

    /// Read and decode a single block.
    pub fn read_block(&mut self, block_id: usize) -> Result<Arc<Vec<Value>>> {
        if let Some((id, vals)) = &self.cached {
            if *id == block_id {
                return Ok(vals.clone());
            }
        }

        let info = self.handle.inner.blocks.get(block_id).ok_or_else(|| {
            internal!(
                "block {block_id} out of range for segment with {} blocks",
                self.handle.num_blocks()
            )
        })?;

        let path: PathBuf = self.handle.path().to_path_buf();
        self.read_buf.resize(info.length as usize, 0);
        self.file
            .seek(SeekFrom::Start(info.offset))
            .and_then(|_| self.file.read_exact(&mut self.read_buf))
            .io_context(|| format!("read block {block_id} from {}", path.display()))?;

        let values = open_block(&self.read_buf, info.count)
            .map_err(|e| corrupt!("block {block_id} of {}: {e}", path.display()))?;

        trace!(path = %path.display(), block_id, count = info.count, "read block");

        let values = Arc::new(values);
        self.cached = Some((block_id, values.clone()));
        Ok(values)
    }

    /// Read a single value by row index.
    pub fn get(&mut self, idx: u64) -> Result<Value> {
        let (block, start) = self
            .handle
            .locate(idx)
            .ok_or_else(|| internal!("row {idx} out of range for segment of {}", self.handle.len()))?;
        let vals = self.read_block(block)?;
        Ok(vals[(idx - start) as usize].clone())
    }

    /// Turn this reader into a lazy iterator starting at `start`.
    pub fn iterate_from(self, start: u64) -> Result<SegmentIter> {
        let end = self.handle.len();
        SegmentIter::new(self, start, end)
    }
}

/// Lazy, finite iterator over a range of a segment.
#[derive(Debug)]
pub struct SegmentIter {
    reader: SegmentReader,
    /// Next row to produce.
    pos: u64,
    end: u64,
    current: Option<(u64, Arc<Vec<Value>>)>,
}

impl SegmentIter {
    fn new(reader: SegmentReader, start: u64, end: u64) -> Result<Self> {
        let len = reader.handle.len();
        if start > end || end > len {
            return Err(framestore_error::FrameStoreError::invalid_range(start, end, len));
        }
        Ok(SegmentIter {
            reader,
            pos: start,
            end,
            current: None,
        })
    }

    pub fn remaining(&self) -> u64 {
        self.end - self.pos
    }

    /// Append up to `max` values to `out`, returning the number appended.
    ///
    /// Returns zero once the range is exhausted.
    pub fn next_chunk(&mut self, max: usize, out: &mut Vec<Value>) -> Result<usize> {
        let mut appended = 0;
        while appended < max && self.pos < self.end {
            let (start, vals) = self.current_block()?;
            let offset = (self.pos - start) as usize;
            let block_end = (start + vals.len() as u64).min(self.end);
            let take = ((block_end - self.pos) as usize).min(max - appended);
            out.extend_from_slice(&vals[offset..offset + take]);
            appended += take;
            self.pos += take as u64;
        }
        Ok(appended)
    }

    fn current_block(&mut self) -> Result<(u64, Arc<Vec<Value>>)> {
        if let Some((start, vals)) = &self.current {
            if self.pos >= *start && self.pos < *start + vals.len() as u64 {
                return Ok((*start, vals.clone()));
            }
        }
        let (block, start) = self
            .reader
            .handle
            .locate(self.pos)
            .ok_or_else(|| internal!("position {} past end of segment", self.pos))?;
        let vals = self.reader.read_block(block)?;
        self.current = Some((start, vals.clone()));
        Ok((start, vals))
    }
}

impl Iterator for SegmentIter {
    type Item = Result<Value>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.pos >= self.end {
            return None;
        }
        let mut out = Vec::with_capacity(1);
        match self.next_chunk(1, &mut out) {
            Ok(_) => out.pop().map(Ok),
            Err(e) => {
                // Stop after the first error.
                self.pos = self.end;
                Some(Err(e))
            }
        }
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let rem = self.remaining() as usize;
        (rem, Some(rem))
    }
}
