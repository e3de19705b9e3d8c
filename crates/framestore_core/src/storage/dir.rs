use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use framestore_error::{IoResultExt, Result};
use tempfile::TempDir;
use tracing::{debug, warn};

use super::segment::SegmentWriter;

/// Directory holding temporary segment files for a session.
///
/// The directory is removed once the storage dir and every segment file
/// created in it have been dropped.
#[derive(Debug, Clone)]
pub struct StorageDir {
    inner: Arc<StorageDirInner>,
}

#[derive(Debug)]
struct StorageDirInner {
    dir: TempDir,
    counter: AtomicU64,
}

impl StorageDir {
    /// Create a storage dir under the system temp directory.
    pub fn temp() -> Result<Self> {
        let dir = tempfile::Builder::new()
            .prefix("framestore-")
            .tempdir()
            .io_context(|| "create temporary storage directory".to_string())?;
        Ok(Self::from_tempdir(dir))
    }

    /// Create a storage dir inside of `parent`.
    pub fn new_in<P: AsRef<Path>>(parent: P) -> Result<Self> {
        let parent = parent.as_ref();
        fs::create_dir_all(parent)
            .io_context(|| format!("create storage parent directory {}", parent.display()))?;
        let dir = tempfile::Builder::new()
            .prefix("framestore-")
            .tempdir_in(parent)
            .io_context(|| format!("create storage directory in {}", parent.display()))?;
        Ok(Self::from_tempdir(dir))
    }

    fn from_tempdir(dir: TempDir) -> Self {
        debug!(path = %dir.path().display(), "created storage directory");
        StorageDir {
            inner: Arc::new(StorageDirInner {
                dir,
                counter: AtomicU64::new(0),
            }),
        }
    }

    pub fn path(&self) -> &Path {
        self.inner.dir.path()
    }

    /// Get a new unique path for a file in this directory.
    pub fn next_path(&self, prefix: &str) -> PathBuf {
        let id = self.inner.counter.fetch_add(1, Ordering::Relaxed);
        self.inner.dir.path().join(format!("{prefix}-{id:06}.seg"))
    }

    /// Create a writer for a temporary segment.
    ///
    /// The segment file is deleted once the writer (if never closed) or every
    /// handle to the closed segment is dropped.
    pub fn create_segment(&self, prefix: &str, block_size: usize) -> Result<SegmentWriter> {
        let path = self.next_path(prefix);
        let file = SegmentFile::temporary(path, self.clone());
        SegmentWriter::create(Arc::new(file), block_size)
    }
}

/// Ownership of a single segment file on disk.
///
/// Temporary files keep their storage directory alive, and remove themselves
/// when dropped.
#[derive(Debug)]
pub struct SegmentFile {
    path: PathBuf,
    temp_dir: Option<StorageDir>,
}

impl SegmentFile {
    pub fn persistent(path: PathBuf) -> Self {
        SegmentFile {
            path,
            temp_dir: None,
        }
    }

    pub fn temporary(path: PathBuf, dir: StorageDir) -> Self {
        SegmentFile {
            path,
            temp_dir: Some(dir),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_temporary(&self) -> bool {
        self.temp_dir.is_some()
    }
}

impl Drop for SegmentFile {
    fn drop(&mut self) {
        if self.temp_dir.is_none() {
            return;
        }
        match fs::remove_file(&self.path) {
            Ok(()) => (),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => (),
            Err(e) => warn!(%e, path = %self.path.display(), "failed to remove temporary segment"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unique_paths() {
        let dir = StorageDir::temp().unwrap();
        let a = dir.next_path("col");
        let b = dir.next_path("col");
        assert_ne!(a, b);
        assert!(a.starts_with(dir.path()));
    }

    #[test]
    fn temporary_file_removed_on_drop() {
        let dir = StorageDir::temp().unwrap();
        let path = dir.next_path("tmp");
        fs::write(&path, b"abc").unwrap();
        let file = SegmentFile::temporary(path.clone(), dir.clone());
        drop(file);
        assert!(!path.exists());
    }

    #[test]
    fn directory_outlives_session_handle() {
        let dir = StorageDir::temp().unwrap();
        let root = dir.path().to_path_buf();
        let path = dir.next_path("tmp");
        fs::write(&path, b"abc").unwrap();
        let file = SegmentFile::temporary(path, dir.clone());
        drop(dir);
        assert!(root.exists());
        drop(file);
        assert!(!root.exists());
    }
}
