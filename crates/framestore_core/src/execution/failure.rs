use std::sync::atomic::{AtomicBool, Ordering};

use framestore_error::{FrameStoreError, Result, internal};
use parking_lot::Mutex;

/// Failure shared by all workers of a single materialization.
///
/// The first recorded error wins, later errors are dropped. Workers poll
/// [`FailureState::check`] between batches and stop early once another
/// worker has failed.
#[derive(Debug, Default)]
pub struct FailureState {
    failed: AtomicBool,
    error: Mutex<Option<FrameStoreError>>,
}

impl FailureState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_failed(&self) -> bool {
        self.failed.load(Ordering::Acquire)
    }

    /// Record an error, returning true if it was the first.
    pub fn set_error(&self, error: FrameStoreError) -> bool {
        let mut slot = self.error.lock();
        if slot.is_some() {
            return false;
        }
        *slot = Some(error);
        self.failed.store(true, Ordering::Release);
        true
    }

    /// Errors if some worker has already failed.
    ///
    /// The returned error is only a signal to stop, it never replaces the
    /// recorded error.
    pub fn check(&self) -> Result<()> {
        if self.is_failed() {
            return Err(internal!("cancelled after failure in another worker"));
        }
        Ok(())
    }

    pub fn take_error(&self) -> Option<FrameStoreError> {
        self.error.lock().take()
    }
}
