//! Fast tier: a size-limited key/value store for hot records and state flags.

mod file;
mod memory;

use std::collections::HashMap;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::{AppError, Result};

pub use file::FileFastTier;
pub use memory::MemoryFastTier;

#[async_trait]
pub trait FastTier: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Value>>;

    async fn get_all(&self) -> Result<HashMap<String, Value>>;

    /// Write all entries or none of them.
    async fn set_many(&self, entries: Vec<(String, Value)>) -> Result<()>;

    /// Remove keys. Missing keys are ignored.
    async fn remove(&self, keys: &[String]) -> Result<()>;

    async fn clear(&self) -> Result<()>;

    async fn bytes_in_use(&self) -> Result<usize>;

    async fn set(&self, key: &str, value: Value) -> Result<()> {
        self.set_many(vec![(key.to_string(), value)]).await
    }
}

/// Storage footprint of one entry, measured the way the host quota counts it.
pub fn entry_size(key: &str, value: &Value) -> usize {
    key.len() + value.to_string().len()
}

/// In-memory entry map with running quota accounting.
#[derive(Debug, Default)]
pub(crate) struct Entries {
    map: HashMap<String, Value>,
    used: usize,
}

impl Entries {
    pub(crate) fn from_map(map: HashMap<String, Value>) -> Self {
        let used = map.iter().map(|(k, v)| entry_size(k, v)).sum();
        Self { map, used }
    }

    pub(crate) fn get(&self, key: &str) -> Option<&Value> {
        self.map.get(key)
    }

    pub(crate) fn map(&self) -> &HashMap<String, Value> {
        &self.map
    }

    pub(crate) fn used(&self) -> usize {
        self.used
    }

    /// Size the store would have after applying `entries`.
    fn projected(&self, entries: &[(String, Value)]) -> usize {
        let mut total = self.used;
        let mut seen: HashMap<&str, usize> = HashMap::new();
        for (key, value) in entries {
            let previous = match seen.get(key.as_str()) {
                Some(size) => *size,
                None => self.map.get(key).map(|v| entry_size(key, v)).unwrap_or(0),
            };
            let size = entry_size(key, value);
            total = total - previous + size;
            seen.insert(key, size);
        }
        total
    }

    pub(crate) fn set_many(&mut self, entries: Vec<(String, Value)>, quota: usize) -> Result<()> {
        let needed = self.projected(&entries);
        if needed > quota {
            return Err(AppError::QuotaExceeded { needed, quota });
        }
        for (key, value) in entries {
            self.map.insert(key, value);
        }
        self.used = needed;
        Ok(())
    }

    pub(crate) fn remove(&mut self, keys: &[String]) {
        for key in keys {
            if let Some(old) = self.map.remove(key) {
                self.used -= entry_size(key, &old);
            }
        }
    }

    pub(crate) fn clear(&mut self) {
        self.map.clear();
        self.used = 0;
    }
}
