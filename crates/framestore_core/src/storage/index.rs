//! JSON manifests mapping arrays to segment files and frames to arrays.
//!
//! Paths inside an index are relative to the directory containing the index
//! file so a saved array can be moved as a unit.
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use framestore_error::{IoResultExt, Result, corrupt};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::value::ValueType;

pub const INDEX_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockEntry {
    pub count: u64,
    pub offset: u64,
    pub length: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentEntry {
    pub path: PathBuf,
    pub len: u64,
    pub blocks: Vec<BlockEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArrayIndex {
    pub version: u32,
    pub value_type: ValueType,
    pub len: u64,
    pub segments: Vec<SegmentEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnEntry {
    pub name: String,
    /// Path to the column's array index.
    pub index: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameIndex {
    pub version: u32,
    pub len: u64,
    pub columns: Vec<ColumnEntry>,
}

impl ArrayIndex {
    /// Check the segment lengths agree with each other and the total.
    pub fn validate(&self) -> Result<()> {
        check_version(self.version)?;
        let mut total = 0;
        for seg in &self.segments {
            let blocks: u64 = seg.blocks.iter().map(|b| b.count).sum();
            if blocks != seg.len {
                return Err(corrupt!(
                    "segment {} lists {blocks} values in blocks, but has length {}",
                    seg.path.display(),
                    seg.len
                ));
            }
            total += seg.len;
        }
        if total != self.len {
            return Err(corrupt!(
                "array index segments sum to {total}, index says {}",
                self.len
            ));
        }
        Ok(())
    }
}

impl FrameIndex {
    pub fn validate(&self) -> Result<()> {
        check_version(self.version)
    }
}

fn check_version(version: u32) -> Result<()> {
    if version != INDEX_VERSION {
        return Err(corrupt!(
            "unsupported index version {version}, expected {INDEX_VERSION}"
        ));
    }
    Ok(())
}

/// Write an index, replacing any existing file at `path`.
///
/// The index is first written to a temporary sibling then renamed so a
/// reader never observes a partially written manifest.
pub fn write_index<T: Serialize>(path: &Path, index: &T) -> Result<()> {
    let bytes = serde_json::to_vec_pretty(index)?;
    let tmp = path.with_extension("json.tmp");

    let mut f = fs::File::create(&tmp).io_context(|| format!("create index {}", tmp.display()))?;
    f.write_all(&bytes)
        .and_then(|_| f.sync_all())
        .io_context(|| format!("write index {}", tmp.display()))?;
    fs::rename(&tmp, path).io_context(|| format!("rename index to {}", path.display()))?;

    debug!(path = %path.display(), bytes = bytes.len(), "wrote index");
    Ok(())
}

pub fn read_index<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<T> {
    let bytes = fs::read(path).io_context(|| format!("read index {}", path.display()))?;
    serde_json::from_slice(&bytes).map_err(|e| corrupt!("invalid index {}: {e}", path.display()))
}

/// Resolve a path stored in an index relative to the index location.
pub fn resolve_relative(index_path: &Path, stored: &Path) -> PathBuf {
    if stored.is_absolute() {
        return stored.to_path_buf();
    }
    match index_path.parent() {
        Some(parent) => parent.join(stored),
        None => stored.to_path_buf(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn array_index() -> ArrayIndex {
        ArrayIndex {
            version: INDEX_VERSION,
            value_type: ValueType::Integer,
            len: 5,
            segments: vec![
                SegmentEntry {
                    path: "a.0000.seg".into(),
                    len: 3,
                    blocks: vec![BlockEntry {
                        count: 3,
                        offset: 8,
                        length: 40,
                    }],
                },
                SegmentEntry {
                    path: "a.0001.seg".into(),
                    len: 2,
                    blocks: vec![
                        BlockEntry {
                            count: 1,
                            offset: 8,
                            length: 20,
                        },
                        BlockEntry {
                            count: 1,
                            offset: 28,
                            length: 20,
                        },
                    ],
                },
            ],
        }
    }

    #[test]
    fn write_read() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.json");
        let index = array_index();
        write_index(&path, &index).unwrap();
        let got: ArrayIndex = read_index(&path).unwrap();
        assert_eq!(index, got);
        got.validate().unwrap();
        assert!(!path.with_extension("json.tmp").exists());
    }

    #[test]
    fn inconsistent_lengths_rejected() {
        let mut index = array_index();
        index.len = 6;
        assert!(index.validate().is_err());

        let mut index = array_index();
        index.segments[1].len = 1;
        assert!(index.validate().is_err());
    }

    #[test]
    fn missing_index_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = read_index::<FrameIndex>(&dir.path().join("missing.json")).unwrap_err();
        assert_eq!(framestore_error::ErrorKind::Io, err.kind());
    }

    #[test]
    fn garbage_index_is_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.json");
        fs::write(&path, b"{\"version\": 1").unwrap();
        let err = read_index::<FrameIndex>(&path).unwrap_err();
        assert!(err.to_string().contains("invalid index"), "{err}");
    }

    #[test]
    fn relative_paths() {
        let idx = Path::new("/data/frames/f.json");
        assert_eq!(
            PathBuf::from("/data/frames/f.col0.json"),
            resolve_relative(idx, Path::new("f.col0.json"))
        );
        assert_eq!(
            PathBuf::from("/abs/x.seg"),
            resolve_relative(idx, Path::new("/abs/x.seg"))
        );
    }
}
