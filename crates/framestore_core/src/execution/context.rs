use crate::config::SettingsSnapshot;
use crate::storage::StorageDir;

use super::scheduler::Scheduler;

/// Everything a single operation needs to run.
///
/// Settings are a snapshot taken when the operation started.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    pub settings: SettingsSnapshot,
    pub storage: StorageDir,
    pub scheduler: Scheduler,
}

impl ExecutionContext {
    pub fn new(settings: SettingsSnapshot, storage: StorageDir, scheduler: Scheduler) -> Self {
        ExecutionContext {
            settings,
            storage,
            scheduler,
        }
    }

    /// Rows pulled per batch.
    pub fn batch_size(&self) -> usize {
        self.settings.read_batch_size as usize
    }

    pub fn block_size(&self) -> usize {
        self.settings.block_size as usize
    }

    pub fn num_workers(&self) -> usize {
        self.settings.num_workers as usize
    }
}
