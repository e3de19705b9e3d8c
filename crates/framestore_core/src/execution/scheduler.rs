use std::fmt;
use std::sync::Arc;

use framestore_error::{FrameStoreError, Result, internal};
use rayon::prelude::*;
use rayon::{ThreadPool, ThreadPoolBuilder};
use tracing::debug;

use super::failure::FailureState;

/// Runs materialization workers on a rayon thread pool.
#[derive(Clone)]
pub struct Scheduler {
    pool: Arc<ThreadPool>,
}

impl fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scheduler")
            .field("num_threads", &self.pool.current_num_threads())
            .finish_non_exhaustive()
    }
}

impl Scheduler {
    pub fn try_new(num_threads: usize) -> Result<Self> {
        let thread_pool = ThreadPoolBuilder::new()
            .num_threads(num_threads.max(1))
            .thread_name(|idx| format!("framestore-worker-{idx}"))
            .build()
            .map_err(|e| {
                FrameStoreError::io(
                    "build worker thread pool",
                    std::io::Error::other(e.to_string()),
                )
            })?;

        Ok(Scheduler {
            pool: Arc::new(thread_pool),
        })
    }

    pub fn num_threads(&self) -> usize {
        self.pool.current_num_threads()
    }

    /// Run `n` partitions, returning their outputs in partition order.
    ///
    /// The first error from any partition cancels the rest and is returned.
    /// Outputs of partitions that did succeed are dropped in that case.
    pub fn run_partitions<T, F>(&self, n: usize, func: F) -> Result<Vec<T>>
    where
        T: Send,
        F: Fn(usize, &FailureState) -> Result<T> + Send + Sync,
    {
        let failure = FailureState::new();
        debug!(partitions = n, threads = self.num_threads(), "running partitions");

        let results: Vec<Option<T>> = self.pool.install(|| {
            (0..n)
                .into_par_iter()
                .map(|idx| {
                    if failure.is_failed() {
                        return None;
                    }
                    match func(idx, &failure) {
                        Ok(out) => Some(out),
                        Err(e) => {
                            if failure.set_error(e) {
                                debug!(partition = idx, "partition failed");
                            }
                            None
                        }
                    }
                })
                .collect()
        });

        if let Some(err) = failure.take_error() {
            return Err(err);
        }
        results
            .into_iter()
            .enumerate()
            .map(|(idx, out)| {
                out.ok_or_else(|| internal!("partition {idx} produced no output"))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use framestore_error::{ErrorKind, internal};

    use super::*;

    #[test]
    fn outputs_in_order() {
        let scheduler = Scheduler::try_new(4).unwrap();
        let out = scheduler.run_partitions(16, |idx, _| Ok(idx * 2)).unwrap();
        assert_eq!((0..16).map(|i| i * 2).collect::<Vec<_>>(), out);
    }

    #[test]
    fn first_error_returned() {
        let scheduler = Scheduler::try_new(2).unwrap();
        let calls = AtomicUsize::new(0);
        let err = scheduler
            .run_partitions(8, |idx, failure| {
                calls.fetch_add(1, Ordering::Relaxed);
                if idx == 3 {
                    return Err(FrameStoreError::type_mismatch("bad"));
                }
                failure.check()?;
                Ok(idx)
            })
            .unwrap_err();
        assert_eq!(ErrorKind::TypeMismatch, err.kind());
    }

    #[test]
    fn thread_names() {
        let scheduler = Scheduler::try_new(1).unwrap();
        let names = scheduler
            .run_partitions(1, |_, _| {
                std::thread::current()
                    .name()
                    .map(|s| s.to_string())
                    .ok_or_else(|| internal!("unnamed"))
            })
            .unwrap();
        assert_eq!("framestore-worker-0", names[0]);
    }
}
