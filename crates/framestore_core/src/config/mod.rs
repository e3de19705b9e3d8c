//! Runtime tunable settings.
//!
//! Settings are named, validated on assignment, and may be changed at any
//! time. Operations take a [`SettingsSnapshot`] when they start so a change
//! never affects an in-flight operation.
use std::collections::HashMap;
use std::sync::LazyLock;

use framestore_error::{FrameStoreError, Result};
use parking_lot::RwLock;

use crate::value::Value;

pub const DEFAULT_SORT_BUFFER_SIZE: u64 = 256 * 1024 * 1024;
pub const DEFAULT_JOIN_BUFFER_SIZE: u64 = 256 * 1024 * 1024;
pub const DEFAULT_READ_BATCH_SIZE: u64 = 1024;
pub const DEFAULT_BLOCK_SIZE: u64 = 64 * 1024;

/// Point in time copy of all settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SettingsSnapshot {
    pub sort_buffer_size: u64,
    pub join_buffer_size: u64,
    pub read_batch_size: u64,
    pub block_size: u64,
    pub num_workers: u64,
}

impl Default for SettingsSnapshot {
    fn default() -> Self {
        SettingsSnapshot {
            sort_buffer_size: DEFAULT_SORT_BUFFER_SIZE,
            join_buffer_size: DEFAULT_JOIN_BUFFER_SIZE,
            read_batch_size: DEFAULT_READ_BATCH_SIZE,
            block_size: DEFAULT_BLOCK_SIZE,
            num_workers: num_cpus::get() as u64,
        }
    }
}

/// Shared, runtime mutable settings.
#[derive(Debug, Default)]
pub struct Settings {
    inner: RwLock<SettingsSnapshot>,
}

impl Settings {
    pub fn new(values: SettingsSnapshot) -> Result<Self> {
        let settings = Settings::default();
        // Run everything through the setters so the initial values get the
        // same validation as later assignments.
        settings.set("sort_buffer_size", Value::Integer(values.sort_buffer_size as i64))?;
        settings.set("join_buffer_size", Value::Integer(values.join_buffer_size as i64))?;
        settings.set("read_batch_size", Value::Integer(values.read_batch_size as i64))?;
        settings.set("block_size", Value::Integer(values.block_size as i64))?;
        settings.set("num_workers", Value::Integer(values.num_workers as i64))?;
        Ok(settings)
    }

    pub fn snapshot(&self) -> SettingsSnapshot {
        self.inner.read().clone()
    }

    /// Set a setting by name.
    ///
    /// The current value is left untouched if the new value fails validation.
    pub fn set(&self, name: &str, value: Value) -> Result<()> {
        let func = setting_functions(name)?;
        let mut inner = self.inner.write();
        (func.set)(value, &mut inner)
    }

    pub fn get(&self, name: &str) -> Result<Value> {
        let func = setting_functions(name)?;
        Ok((func.get)(&self.inner.read()))
    }

    /// Reset a setting to its default.
    pub fn reset(&self, name: &str) -> Result<()> {
        let func = setting_functions(name)?;
        let def = (func.get)(&SettingsSnapshot::default());
        self.set(name, def)
    }

    /// Names and descriptions of all settings.
    pub fn describe() -> Vec<(&'static str, &'static str)> {
        let mut descs: Vec<_> = GET_SET_FUNCTIONS
            .values()
            .map(|f| (f.name, f.description))
            .collect();
        descs.sort();
        descs
    }
}

fn setting_functions(name: &str) -> Result<&'static SettingFunctions> {
    GET_SET_FUNCTIONS
        .get(name)
        .ok_or_else(|| FrameStoreError::UnknownSetting(name.to_string()))
}

struct SettingFunctions {
    name: &'static str,
    description: &'static str,
    set: fn(value: Value, conf: &mut SettingsSnapshot) -> Result<()>,
    get: fn(conf: &SettingsSnapshot) -> Value,
}

impl SettingFunctions {
    const fn new<S: Setting>() -> Self {
        SettingFunctions {
            name: S::NAME,
            description: S::DESCRIPTION,
            set: S::set_from_value as _,
            get: S::get_as_value as _,
        }
    }
}

fn insert_setting<S: Setting>(map: &mut HashMap<&'static str, SettingFunctions>) {
    if map.insert(S::NAME, SettingFunctions::new::<S>()).is_some() {
        panic!("Duplicate settings names: {}", S::NAME);
    }
}

static GET_SET_FUNCTIONS: LazyLock<HashMap<&'static str, SettingFunctions>> = LazyLock::new(|| {
    let mut map = HashMap::new();

    insert_setting::<SortBufferSize>(&mut map);
    insert_setting::<JoinBufferSize>(&mut map);
    insert_setting::<ReadBatchSize>(&mut map);
    insert_setting::<BlockSize>(&mut map);
    insert_setting::<NumWorkers>(&mut map);

    map
});

pub trait Setting: Sync + Send + 'static {
    const NAME: &'static str;
    const DESCRIPTION: &'static str;

    fn set_from_value(value: Value, conf: &mut SettingsSnapshot) -> Result<()>;
    fn get_as_value(conf: &SettingsSnapshot) -> Value;
}

/// Extract an integer within `[min, max]` for a setting.
fn bounded_u64(name: &str, value: &Value, min: u64, max: u64) -> Result<u64> {
    let v = value
        .try_as_i64()
        .map_err(|_| FrameStoreError::InvalidSetting {
            name: name.to_string(),
            reason: format!("expected an integer, got {}", value.value_type()),
        })?;

    if v < min as i64 || v as u64 > max {
        return Err(FrameStoreError::InvalidSetting {
            name: name.to_string(),
            reason: format!("{v} not in range [{min}, {max}]"),
        });
    }

    Ok(v as u64)
}

pub struct SortBufferSize;

impl Setting for SortBufferSize {
    const NAME: &'static str = "sort_buffer_size";
    const DESCRIPTION: &'static str =
        "Bytes of rows buffered in memory per sort run or permute bucket";

    fn set_from_value(value: Value, conf: &mut SettingsSnapshot) -> Result<()> {
        conf.sort_buffer_size = bounded_u64(Self::NAME, &value, 1024, i64::MAX as u64)?;
        Ok(())
    }

    fn get_as_value(conf: &SettingsSnapshot) -> Value {
        Value::Integer(conf.sort_buffer_size as i64)
    }
}

pub struct JoinBufferSize;

impl Setting for JoinBufferSize {
    const NAME: &'static str = "join_buffer_size";
    const DESCRIPTION: &'static str =
        "Bytes allowed for the in-memory build side of a hash join before falling back to sort-merge";

    fn set_from_value(value: Value, conf: &mut SettingsSnapshot) -> Result<()> {
        conf.join_buffer_size = bounded_u64(Self::NAME, &value, 1024, i64::MAX as u64)?;
        Ok(())
    }

    fn get_as_value(conf: &SettingsSnapshot) -> Value {
        Value::Integer(conf.join_buffer_size as i64)
    }
}

pub struct ReadBatchSize;

impl Setting for ReadBatchSize {
    const NAME: &'static str = "read_batch_size";
    const DESCRIPTION: &'static str = "Number of rows pulled per batch during execution";

    fn set_from_value(value: Value, conf: &mut SettingsSnapshot) -> Result<()> {
        conf.read_batch_size = bounded_u64(Self::NAME, &value, 1, 1 << 20)?;
        Ok(())
    }

    fn get_as_value(conf: &SettingsSnapshot) -> Value {
        Value::Integer(conf.read_batch_size as i64)
    }
}

pub struct BlockSize;

impl Setting for BlockSize {
    const NAME: &'static str = "block_size";
    const DESCRIPTION: &'static str = "Target uncompressed size in bytes of a segment block";

    fn set_from_value(value: Value, conf: &mut SettingsSnapshot) -> Result<()> {
        conf.block_size = bounded_u64(Self::NAME, &value, 64, 64 * 1024 * 1024)?;
        Ok(())
    }

    fn get_as_value(conf: &SettingsSnapshot) -> Value {
        Value::Integer(conf.block_size as i64)
    }
}

pub struct NumWorkers;

impl Setting for NumWorkers {
    const NAME: &'static str = "num_workers";
    const DESCRIPTION: &'static str = "Maximum number of workers used for a single materialization";

    fn set_from_value(value: Value, conf: &mut SettingsSnapshot) -> Result<()> {
        conf.num_workers = bounded_u64(Self::NAME, &value, 1, 1024)?;
        Ok(())
    }

    fn get_as_value(conf: &SettingsSnapshot) -> Value {
        Value::Integer(conf.num_workers as i64)
    }
}
