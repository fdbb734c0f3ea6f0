use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::RwLock;

use crate::error::{AppError, Result};

use super::{Entries, FastTier};

/// Process-local fast tier. Embedding hosts and tests use it directly.
pub struct MemoryFastTier {
    entries: RwLock<Entries>,
    quota: usize,
    available: AtomicBool,
}

impl MemoryFastTier {
    pub fn new(quota: usize) -> Self {
        Self {
            entries: RwLock::new(Entries::default()),
            quota,
            available: AtomicBool::new(true),
        }
    }

    /// Simulate the host store going away (or coming back).
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    fn check(&self) -> Result<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(AppError::StorageUnavailable("memory store offline".to_string()))
        }
    }
}

impl Default for MemoryFastTier {
    fn default() -> Self {
        Self::new(usize::MAX)
    }
}

#[async_trait]
impl FastTier for MemoryFastTier {
    async fn get(&self, key: &str) -> Result<Option<Value>> {
        self.check()?;
        Ok(self.entries.read().await.get(key).cloned())
    }

    async fn get_all(&self) -> Result<HashMap<String, Value>> {
        self.check()?;
        Ok(self.entries.read().await.map().clone())
    }

    async fn set_many(&self, entries: Vec<(String, Value)>) -> Result<()> {
        self.check()?;
        self.entries.write().await.set_many(entries, self.quota)
    }

    async fn remove(&self, keys: &[String]) -> Result<()> {
        self.check()?;
        self.entries.write().await.remove(keys);
        Ok(())
    }

    async fn clear(&self) -> Result<()> {
        self.check()?;
        self.entries.write().await.clear();
        Ok(())
    }

    async fn bytes_in_use(&self) -> Result<usize> {
        self.check()?;
        Ok(self.entries.read().await.used())
    }
}
