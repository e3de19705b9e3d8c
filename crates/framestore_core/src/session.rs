use std::path::Path;
use std::sync::Arc;

use framestore_error::Result;
use tracing::debug;

use crate::algorithms::{self, JoinType, SortKey};
use crate::arrays::{Array, Frame};
use crate::config::{Settings, SettingsSnapshot};
use crate::execution::{ExecutionContext, Scheduler};
use crate::lazy::{LazyArray, LazyFrame};
use crate::planner::{NodeKind, PlanGraph};
use crate::storage::StorageDir;
use crate::value::{Value, ValueType};

/// Entry point for building and executing lazy plans.
///
/// A session owns the settings, the directory temporary segments are written
/// to, the worker pool, and the graph every lazy handle created through it
/// adds nodes to. Cloning a session is cheap and shares all of these.
///
/// The worker pool is sized from `num_workers` at creation. Lowering the
/// setting afterwards reduces parallelism, raising it past the pool size
/// queues partitions on the existing threads.
#[derive(Debug, Clone)]
pub struct Session {
    settings: Arc<Settings>,
    storage: StorageDir,
    scheduler: Scheduler,
    graph: Arc<PlanGraph>,
}

impl Session {
    /// Create a session with default settings, storing temporary segments in
    /// a new directory under the system temp dir.
    pub fn new() -> Result<Self> {
        Self::with_settings(SettingsSnapshot::default())
    }

    pub fn with_settings(settings: SettingsSnapshot) -> Result<Self> {
        Self::with_storage(settings, StorageDir::temp()?)
    }

    /// Create a session storing temporary segments in a new directory under
    /// `parent`.
    pub fn new_in<P: AsRef<Path>>(parent: P, settings: SettingsSnapshot) -> Result<Self> {
        Self::with_storage(settings, StorageDir::new_in(parent)?)
    }

    fn with_storage(settings: SettingsSnapshot, storage: StorageDir) -> Result<Self> {
        let settings = Settings::new(settings)?;
        let scheduler = Scheduler::try_new(settings.snapshot().num_workers as usize)?;
        debug!(
            storage = %storage.path().display(),
            workers = scheduler.num_threads(),
            "created session"
        );
        Ok(Session {
            settings: Arc::new(settings),
            storage,
            scheduler,
            graph: Arc::new(PlanGraph::new()),
        })
    }

    pub fn settings(&self) -> &Arc<Settings> {
        &self.settings
    }

    /// Update a setting. Affects operations started after this returns.
    pub fn set(&self, name: &str, value: impl Into<Value>) -> Result<()> {
        self.settings.set(name, value.into())
    }

    pub fn get(&self, name: &str) -> Result<Value> {
        self.settings.get(name)
    }

    pub fn storage(&self) -> &StorageDir {
        &self.storage
    }

    pub fn graph(&self) -> &Arc<PlanGraph> {
        &self.graph
    }

    /// Context for a single operation using the current settings.
    pub fn context(&self) -> ExecutionContext {
        ExecutionContext::new(
            self.settings.snapshot(),
            self.storage.clone(),
            self.scheduler.clone(),
        )
    }

    /// Lazy handle reading every column of `frame`.
    pub fn frame(&self, frame: Frame) -> Result<LazyFrame> {
        let names = frame.column_names().to_vec();
        let root = self.graph.add(
            NodeKind::FrameSource {
                columns: (0..frame.num_columns()).collect(),
                begin: 0,
                end: frame.len(),
                frame,
            },
            Vec::new(),
        )?;
        Ok(LazyFrame::new(self.clone(), root, names))
    }

    /// Lazy handle reading `array`.
    pub fn array(&self, array: Array) -> Result<LazyArray> {
        let root = self.graph.add(
            NodeKind::ArraySource {
                begin: 0,
                end: array.len(),
                array,
            },
            Vec::new(),
        )?;
        Ok(LazyArray::new(self.clone(), root))
    }

    /// Integers `start..end`.
    pub fn range(&self, start: i64, end: i64) -> Result<LazyArray> {
        let root = self.graph.add(NodeKind::Range { start, end }, Vec::new())?;
        Ok(LazyArray::new(self.clone(), root))
    }

    /// `value` repeated `len` times.
    pub fn constant(&self, value: impl Into<Value>, ty: ValueType, len: u64) -> Result<LazyArray> {
        let root = self.graph.add(
            NodeKind::Constant {
                value: value.into(),
                ty,
                len,
            },
            Vec::new(),
        )?;
        Ok(LazyArray::new(self.clone(), root))
    }

    /// Write in-memory columns to a new frame in this session's storage.
    pub fn frame_from_values<S: Into<String>>(
        &self,
        columns: Vec<(S, ValueType, Vec<Value>)>,
    ) -> Result<Frame> {
        let block_size = self.settings.snapshot().block_size as usize;
        Frame::from_values(&self.storage, columns, block_size)
    }

    pub fn array_from_values<I>(&self, ty: ValueType, values: I) -> Result<Array>
    where
        I: IntoIterator<Item = Value>,
    {
        let block_size = self.settings.snapshot().block_size as usize;
        Array::from_values(&self.storage, ty, values, block_size)
    }

    pub fn sort(&self, frame: &Frame, keys: &[SortKey]) -> Result<Frame> {
        algorithms::sort(frame, keys, &self.context())
    }

    pub fn join<S: AsRef<str>>(
        &self,
        left: &Frame,
        right: &Frame,
        on: &[(S, S)],
        how: JoinType,
    ) -> Result<Frame> {
        algorithms::join(left, right, on, how, &self.context())
    }

    pub fn permute(&self, frame: &Frame, forward_map: &Array) -> Result<Frame> {
        algorithms::permute(frame, forward_map, &self.context())
    }
}

#[cfg(test)]
mod tests {
    use framestore_error::ErrorKind;

    use super::*;

    #[test]
    fn settings_snapshot_per_context() {
        let session = Session::with_settings(SettingsSnapshot {
            num_workers: 2,
            ..Default::default()
        })
        .unwrap();

        let before = session.context();
        session.set("read_batch_size", 7).unwrap();
        let after = session.context();

        assert_eq!(1024, before.batch_size());
        assert_eq!(7, after.batch_size());
        assert_eq!(Value::Integer(7), session.get("read_batch_size").unwrap());
    }

    #[test]
    fn invalid_setting_keeps_value() {
        let session = Session::new().unwrap();
        let err = session.set("num_workers", 0).unwrap_err();
        assert_eq!(ErrorKind::Config, err.kind());
        assert!(session.get("num_workers").unwrap().try_as_i64().unwrap() >= 1);
    }

    #[test]
    fn clones_share_graph() {
        let session = Session::new().unwrap();
        let other = session.clone();
        session.range(0, 4).unwrap();
        assert!(Arc::ptr_eq(session.graph(), other.graph()));
        assert_eq!(1, other.graph().num_nodes());
    }
}
