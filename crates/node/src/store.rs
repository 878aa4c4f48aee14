//! Durable per-node key/value store for mutable device parameters.
//!
//! Backed by a flat TOML table (`"<device_id>_<param>" = value`). Every
//! `set` rewrites the file through a temp file + rename before the in-memory
//! view changes, so a successful return means the value is on disk.

use anyhow::{Context, Result};
use std::ffi::OsString;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use time::Time;
use toml::{Table, Value};
use tracing::warn;

use crate::hardware::Rgb;
use crate::window::{format_hms, parse_hms};

// ---------------------------------------------------------------------------
// Typed values
// ---------------------------------------------------------------------------

/// A Rust type that can be stored as a config value.
pub trait ConfigType: Sized {
    fn from_toml(value: &Value) -> Option<Self>;
    fn to_toml(&self) -> Value;
}

impl ConfigType for u64 {
    fn from_toml(value: &Value) -> Option<Self> {
        match value {
            Value::Integer(i) => u64::try_from(*i).ok(),
            // Hand-edited files sometimes quote numbers.
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    fn to_toml(&self) -> Value {
        Value::Integer(i64::try_from(*self).unwrap_or(i64::MAX))
    }
}

impl ConfigType for String {
    fn from_toml(value: &Value) -> Option<Self> {
        value.as_str().map(str::to_string)
    }

    fn to_toml(&self) -> Value {
        Value::String(self.clone())
    }
}

impl ConfigType for Rgb {
    fn from_toml(value: &Value) -> Option<Self> {
        let parts = value.as_array()?;
        if parts.len() != 3 {
            return None;
        }
        let channel = |v: &Value| v.as_integer().and_then(|i| u8::try_from(i).ok());
        Some(Rgb::new(
            channel(&parts[0])?,
            channel(&parts[1])?,
            channel(&parts[2])?,
        ))
    }

    fn to_toml(&self) -> Value {
        Value::Array(vec![
            Value::Integer(self.r.into()),
            Value::Integer(self.g.into()),
            Value::Integer(self.b.into()),
        ])
    }
}

impl ConfigType for Time {
    fn from_toml(value: &Value) -> Option<Self> {
        parse_hms(value.as_str()?).ok()
    }

    fn to_toml(&self) -> Value {
        Value::String(format_hms(*self))
    }
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct ConfigStore {
    inner: Arc<Inner>,
}

struct Inner {
    path: PathBuf,
    values: Mutex<Table>,
}

impl ConfigStore {
    /// Open the store at `path`. A missing file is an empty store; it is
    /// created by the first `set`.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let values = read_table(&path)?;
        Ok(Self {
            inner: Arc::new(Inner {
                path,
                values: Mutex::new(values),
            }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    pub fn key_count(&self) -> usize {
        self.values().len()
    }

    /// Typed lookup. Absent keys yield `default` without writing it back;
    /// values of the wrong shape are logged and also yield `default`.
    pub fn get<T: ConfigType>(&self, key: &str, default: T) -> T {
        let values = self.values();
        let Some(raw) = values.get(key) else {
            return default;
        };
        T::from_toml(raw).unwrap_or_else(|| {
            warn!(key, value = %raw, "config value has unexpected type; using default");
            default
        })
    }

    pub fn set<T: ConfigType>(&self, key: &str, value: &T) -> Result<()> {
        self.set_value(key, value.to_toml())
    }

    /// Upsert one key. Durable before returning.
    pub fn set_value(&self, key: &str, value: Value) -> Result<()> {
        let mut values = self.values();
        let mut next = values.clone();
        next.insert(key.to_string(), value);
        write_table(&self.inner.path, &next)
            .with_context(|| format!("failed to persist config key '{key}'"))?;
        *values = next;
        Ok(())
    }

    /// Replace the in-memory view with the file's current contents.
    pub fn reload(&self) -> Result<()> {
        let fresh = read_table(&self.inner.path)?;
        *self.values() = fresh;
        Ok(())
    }

    fn values(&self) -> std::sync::MutexGuard<'_, Table> {
        self.inner
            .values
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

fn read_table(path: &Path) -> Result<Table> {
    if !path.exists() {
        return Ok(Table::new());
    }
    let contents = fs::read_to_string(path)
        .with_context(|| format!("failed to read config store: {}", path.display()))?;
    toml::from_str(&contents)
        .with_context(|| format!("failed to parse config store: {}", path.display()))
}

fn write_table(path: &Path, table: &Table) -> Result<()> {
    let text = toml::to_string(table).context("failed to serialise config store")?;

    let mut tmp: OsString = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);

    let mut file =
        File::create(&tmp).with_context(|| format!("failed to create {}", tmp.display()))?;
    file.write_all(text.as_bytes())?;
    file.sync_all()?;
    fs::rename(&tmp, path)
        .with_context(|| format!("failed to replace {}", path.display()))?;
    Ok(())
}

// ===========================================================================
// Tests
// ===========================================================================
