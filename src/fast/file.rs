use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::Mutex;

use crate::error::Result;

use super::{Entries, FastTier};

/// Fast tier persisted as a single JSON document.
///
/// Every mutation rewrites the document through a temporary file and a rename,
/// so a write has returned only once it is durable.
pub struct FileFastTier {
    path: PathBuf,
    quota: usize,
    entries: Mutex<Entries>,
}

impl FileFastTier {
    pub async fn open(path: impl AsRef<Path>, quota: usize) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let map: HashMap<String, Value> = match tokio::fs::read(&path).await {
            Ok(bytes) if !bytes.is_empty() => serde_json::from_slice(&bytes)?,
            Ok(_) => HashMap::new(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => HashMap::new(),
            Err(e) => return Err(e.into()),
        };
        tracing::debug!("Opened fast tier {:?} with {} keys", path, map.len());

        Ok(Self {
            path,
            quota,
            entries: Mutex::new(Entries::from_map(map)),
        })
    }

    async fn persist(&self, entries: &Entries) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let bytes = serde_json::to_vec(entries.map())?;
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, bytes).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}

#[async_trait]
impl FastTier for FileFastTier {
    async fn get(&self, key: &str) -> Result<Option<Value>> {
        Ok(self.entries.lock().await.get(key).cloned())
    }

    async fn get_all(&self) -> Result<HashMap<String, Value>> {
        Ok(self.entries.lock().await.map().clone())
    }

    async fn set_many(&self, entries: Vec<(String, Value)>) -> Result<()> {
        let mut guard = self.entries.lock().await;
        let snapshot = guard.map().clone();
        guard.set_many(entries, self.quota)?;
        if let Err(e) = self.persist(&guard).await {
            *guard = Entries::from_map(snapshot);
            return Err(e);
        }
        Ok(())
    }

    async fn remove(&self, keys: &[String]) -> Result<()> {
        let mut guard = self.entries.lock().await;
        if !keys.iter().any(|k| guard.get(k).is_some()) {
            return Ok(());
        }
        guard.remove(keys);
        self.persist(&guard).await
    }

    async fn clear(&self) -> Result<()> {
        let mut guard = self.entries.lock().await;
        guard.clear();
        self.persist(&guard).await
    }

    async fn bytes_in_use(&self) -> Result<usize> {
        Ok(self.entries.lock().await.used())
    }
}
