//! Deletion markers and their retention sweep.
//!
//! Every tombstone lives in two places: the archive's `deleted_items` table
//! and a `deleted_item_<id>` mirror in the fast tier. Reads take the later of
//! the two, and tolerate the archive being unavailable.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::db::ArchiveTier;
use crate::error::Result;
use crate::fast::FastTier;
use crate::keys;
use crate::models::{now_ms, Tombstone};

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CleanupReport {
    pub archived: usize,
    pub mirrors: usize,
}

impl CleanupReport {
    pub fn total(&self) -> usize {
        self.archived + self.mirrors
    }
}

pub struct TombstoneManager {
    fast: Arc<dyn FastTier>,
    archive: Arc<dyn ArchiveTier>,
    retention_ms: i64,
}

impl TombstoneManager {
    pub fn new(fast: Arc<dyn FastTier>, archive: Arc<dyn ArchiveTier>, retention_ms: i64) -> Self {
        Self {
            fast,
            archive,
            retention_ms,
        }
    }

    pub fn retention_ms(&self) -> i64 {
        self.retention_ms
    }

    /// The live tombstone for `id`, if any.
    pub async fn live_tombstone(&self, id: &str) -> Result<Option<Tombstone>> {
        let mirror = self
            .fast
            .get(&keys::tombstone_key(id))
            .await?
            .and_then(|v| serde_json::from_value::<Tombstone>(v).ok());

        let archived = match self.archive.get_tombstone(id).await {
            Ok(t) => t,
            Err(e) => {
                warn!("Archive tombstone lookup failed for {}: {}", id, e);
                None
            }
        };

        let now = now_ms();
        Ok(later(mirror, archived).filter(|t| t.is_live(now, self.retention_ms)))
    }

    /// All live tombstones from both tiers, keyed by item id.
    pub async fn live_tombstones(&self) -> Result<HashMap<String, Tombstone>> {
        let mut merged = self.mirrored().await?;

        match self.archive.all_tombstones().await {
            Ok(archived) => {
                for t in archived {
                    let current = merged.remove(&t.item_id);
                    if let Some(t) = later(current, Some(t)) {
                        merged.insert(t.item_id.clone(), t);
                    }
                }
            }
            Err(e) => warn!("Archive tombstones unavailable, using fast-tier mirrors: {}", e),
        }

        let now = now_ms();
        merged.retain(|_, t| t.is_live(now, self.retention_ms));
        Ok(merged)
    }

    /// Tombstones mirrored in the fast tier, expired ones included.
    pub async fn mirrored(&self) -> Result<HashMap<String, Tombstone>> {
        let entries = self.fast.get_all().await?;
        Ok(entries
            .into_iter()
            .filter(|(key, _)| keys::tombstone_id(key).is_some())
            .filter_map(|(_, value)| serde_json::from_value::<Tombstone>(value).ok())
            .map(|t| (t.item_id.clone(), t))
            .collect())
    }

    /// Fast-tier entry for a tombstone mirror.
    pub fn mirror_entry(tombstone: &Tombstone) -> Result<(String, serde_json::Value)> {
        Ok((
            keys::tombstone_key(&tombstone.item_id),
            serde_json::to_value(tombstone)?,
        ))
    }

    /// Drop both copies of a tombstone after a newer write revived the item.
    pub async fn clear(&self, id: &str) -> Result<()> {
        self.fast.remove(&[keys::tombstone_key(id)]).await?;
        if let Err(e) = self.archive.remove_tombstone(id).await {
            warn!("Could not clear archived tombstone for {}: {}", id, e);
        }
        Ok(())
    }

    /// Remove every tombstone older than `retention_ms` from both tiers.
    pub async fn cleanup_tombstones(&self, retention_ms: i64) -> Result<CleanupReport> {
        let cutoff = now_ms() - retention_ms;

        let archived = match self.archive.purge_tombstones_before(cutoff).await {
            Ok(n) => n,
            Err(e) => {
                warn!("Archive tombstone sweep failed: {}", e);
                0
            }
        };

        let expired: Vec<String> = self
            .mirrored()
            .await?
            .into_values()
            .filter(|t| t.deleted_at < cutoff)
            .map(|t| keys::tombstone_key(&t.item_id))
            .collect();
        let mirrors = expired.len();
        if mirrors > 0 {
            self.fast.remove(&expired).await?;
        }

        let report = CleanupReport { archived, mirrors };
        if report.total() > 0 {
            info!(
                "Purged {} expired tombstones ({} archived, {} mirrored)",
                report.total(),
                archived,
                mirrors
            );
        } else {
            debug!("No expired tombstones");
        }
        Ok(report)
    }
}

fn later(a: Option<Tombstone>, b: Option<Tombstone>) -> Option<Tombstone> {
    match (a, b) {
        (Some(a), Some(b)) => Some(if b.deleted_at > a.deleted_at { b } else { a }),
        (a, b) => a.or(b),
    }
}
