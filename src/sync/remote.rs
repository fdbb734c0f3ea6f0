use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::{Mutex, RwLock};

use crate::error::{AppError, Result};
use crate::fast::entry_size;

/// Key/value channel shared by every device of one account.
#[async_trait]
pub trait RemoteChannel: Send + Sync {
    /// Every mirrored entry, unfiltered.
    async fn get_all(&self) -> Result<HashMap<String, Value>>;

    /// One remote write. Fails if the batch exceeds `max_write_bytes`.
    async fn set_many(&self, entries: Vec<(String, Value)>) -> Result<()>;

    async fn remove(&self, keys: &[String]) -> Result<()>;

    /// Payload ceiling of a single `set_many` call.
    fn max_write_bytes(&self) -> usize;
}

fn check_payload(entries: &[(String, Value)], ceiling: usize) -> Result<()> {
    let size: usize = entries.iter().map(|(k, v)| entry_size(k, v)).sum();
    if size > ceiling {
        return Err(AppError::SyncUnavailable(format!(
            "write of {size} bytes exceeds the {ceiling} byte limit"
        )));
    }
    Ok(())
}

/// In-process channel. Clones share the same mirror, so two storages wired
/// to clones of one `MemoryRemote` behave like two devices of one account.
#[derive(Clone)]
pub struct MemoryRemote {
    entries: Arc<RwLock<HashMap<String, Value>>>,
    available: Arc<AtomicBool>,
    max_write_bytes: usize,
}

impl MemoryRemote {
    pub fn new(max_write_bytes: usize) -> Self {
        Self {
            entries: Arc::new(RwLock::new(HashMap::new())),
            available: Arc::new(AtomicBool::new(true)),
            max_write_bytes,
        }
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    fn check(&self) -> Result<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(AppError::SyncUnavailable("remote offline".to_string()))
        }
    }
}

#[async_trait]
impl RemoteChannel for MemoryRemote {
    async fn get_all(&self) -> Result<HashMap<String, Value>> {
        self.check()?;
        Ok(self.entries.read().await.clone())
    }

    async fn set_many(&self, entries: Vec<(String, Value)>) -> Result<()> {
        self.check()?;
        check_payload(&entries, self.max_write_bytes)?;
        self.entries.write().await.extend(entries);
        Ok(())
    }

    async fn remove(&self, keys: &[String]) -> Result<()> {
        self.check()?;
        let mut entries = self.entries.write().await;
        for key in keys {
            entries.remove(key);
        }
        Ok(())
    }

    fn max_write_bytes(&self) -> usize {
        self.max_write_bytes
    }
}

/// Mirror kept as one JSON document inside a folder shared between machines.
pub struct DirRemote {
    path: PathBuf,
    max_write_bytes: usize,
    lock: Mutex<()>,
}

impl DirRemote {
    pub const FILE_NAME: &'static str = "watchtrail-sync.json";

    pub async fn open(dir: impl AsRef<Path>, max_write_bytes: usize) -> Result<Self> {
        let dir = dir.as_ref();
        tokio::fs::create_dir_all(dir).await?;
        Ok(Self {
            path: dir.join(Self::FILE_NAME),
            max_write_bytes,
            lock: Mutex::new(()),
        })
    }

    async fn load(&self) -> Result<HashMap<String, Value>> {
        match tokio::fs::read(&self.path).await {
            Ok(bytes) if bytes.is_empty() => Ok(HashMap::new()),
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(HashMap::new()),
            Err(e) => Err(AppError::SyncUnavailable(e.to_string())),
        }
    }

    async fn store(&self, entries: &HashMap<String, Value>) -> Result<()> {
        let tmp = self.path.with_extension("json.tmp");
        let bytes = serde_json::to_vec(entries)?;
        tokio::fs::write(&tmp, bytes)
            .await
            .map_err(|e| AppError::SyncUnavailable(e.to_string()))?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .map_err(|e| AppError::SyncUnavailable(e.to_string()))
    }
}

#[async_trait]
impl RemoteChannel for DirRemote {
    async fn get_all(&self) -> Result<HashMap<String, Value>> {
        let _guard = self.lock.lock().await;
        self.load().await
    }

    async fn set_many(&self, entries: Vec<(String, Value)>) -> Result<()> {
        check_payload(&entries, self.max_write_bytes)?;
        let _guard = self.lock.lock().await;
        let mut current = self.load().await?;
        current.extend(entries);
        self.store(&current).await
    }

    async fn remove(&self, keys: &[String]) -> Result<()> {
        let _guard = self.lock.lock().await;
        let mut current = self.load().await?;
        let before = current.len();
        for key in keys {
            current.remove(key);
        }
        if current.len() != before {
            self.store(&current).await?;
        }
        Ok(())
    }

    fn max_write_bytes(&self) -> usize {
        self.max_write_bytes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn memory_remote_clones_share_state() {
        let a = MemoryRemote::new(1024);
        let b = a.clone();
        a.set_many(vec![("sync_item_x".into(), json!({"id": "x"}))])
            .await
            .unwrap();
        assert!(b.get_all().await.unwrap().contains_key("sync_item_x"));

        b.set_available(false);
        assert!(matches!(a.get_all().await, Err(AppError::SyncUnavailable(_))));
    }

    #[tokio::test]
    async fn oversize_write_is_rejected() {
        let remote = MemoryRemote::new(32);
        let err = remote
            .set_many(vec![("k".into(), json!("x".repeat(64)))])
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::SyncUnavailable(_)));
        assert!(remote.get_all().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn dir_remote_persists_across_handles() {
        let dir = tempfile::tempdir().unwrap();
        let remote = DirRemote::open(dir.path(), 4096).await.unwrap();
        remote
            .set_many(vec![("a".into(), json!(1)), ("b".into(), json!(2))])
            .await
            .unwrap();
        remote.remove(&["a".to_string()]).await.unwrap();

        let reopened = DirRemote::open(dir.path(), 4096).await.unwrap();
        let entries = reopened.get_all().await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries.get("b"), Some(&json!(2)));
    }
}
