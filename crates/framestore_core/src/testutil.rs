//! Test utilities.
//!
//! Not behind `#[cfg(test)]` so integration tests can use them too. Should
//! not be used outside of tests.
use crate::arrays::{Array, ArrayWriter};
use crate::config::SettingsSnapshot;
use crate::execution::{ExecutionContext, Scheduler};
use crate::session::Session;
use crate::storage::StorageDir;
use crate::value::{Value, ValueType};

/// Settings with small batches and blocks so tests cross batch, block and
/// segment boundaries with little data.
pub fn test_settings(num_workers: u64) -> SettingsSnapshot {
    SettingsSnapshot {
        read_batch_size: 64,
        block_size: 1024,
        num_workers,
        ..Default::default()
    }
}

/// Session over a fresh temporary directory.
pub fn test_session(num_workers: u64) -> Session {
    Session::with_settings(test_settings(num_workers)).unwrap()
}

/// Context over a fresh temporary directory with the given sort buffer.
pub fn test_context(num_workers: u64, sort_buffer_size: u64) -> ExecutionContext {
    let settings = SettingsSnapshot {
        sort_buffer_size,
        ..test_settings(num_workers)
    };
    ExecutionContext::new(
        settings,
        StorageDir::temp().unwrap(),
        Scheduler::try_new(num_workers as usize).unwrap(),
    )
}

/// Integer array of `0..n`, split into `segments` segments.
pub fn int_array(storage: &StorageDir, n: i64, segments: usize) -> Array {
    let mut writer = ArrayWriter::new(storage, ValueType::Integer, segments, 1024).unwrap();
    let per_segment = (n as usize).div_ceil(segments.max(1)).max(1);
    for v in 0..n {
        if v > 0 && v as usize % per_segment == 0 {
            writer.rotate();
        }
        writer.append(Value::Integer(v)).unwrap();
    }
    writer.close().unwrap()
}

/// Asserts that two value slices are equal, reporting the first differing
/// row.
pub fn assert_values_eq(expected: &[Value], got: &[Value]) {
    for (idx, (a, b)) in expected.iter().zip(got).enumerate() {
        assert_eq!(a, b, "values differ at row {idx}");
    }
    assert_eq!(expected.len(), got.len(), "lengths differ");
}
