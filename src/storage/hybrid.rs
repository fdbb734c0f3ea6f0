use std::cmp::Reverse;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::db::{normalize_title, ArchiveTier, DeleteOptions};
use crate::error::{AppError, Result};
use crate::fast::FastTier;
use crate::keys;
use crate::models::{
    now_ms, CollectionRecord, ItemRecord, Settings, SyncState, Tombstone, DAY_MS,
};
use crate::tombstones::{CleanupReport, TombstoneManager};

use super::events::StorageEvent;
use super::legacy::LegacyProgress;
use super::lookup::{merge_collections, merge_items, Lookup};
use super::InFlightGuard;

const EVENT_CAPACITY: usize = 256;

#[derive(Debug, Clone)]
pub struct StorageOptions {
    pub retention_ms: i64,
    pub archive_after_ms: i64,
    pub fast_tier_max_items: usize,
    /// Writes between fire-and-forget migration passes. Zero disables them.
    pub migrate_every_writes: u64,
}

impl Default for StorageOptions {
    fn default() -> Self {
        Self {
            retention_ms: 30 * DAY_MS,
            archive_after_ms: 7 * DAY_MS,
            fast_tier_max_items: 500,
            migrate_every_writes: 50,
        }
    }
}

impl From<&Config> for StorageOptions {
    fn from(config: &Config) -> Self {
        Self {
            retention_ms: config.retention_ms(),
            archive_after_ms: config.archive_after_ms(),
            fast_tier_max_items: config.fast_tier_max_items,
            ..Self::default()
        }
    }
}

impl StorageOptions {
    /// Apply the user's saved retention period.
    pub fn with_settings(mut self, settings: &Settings) -> Self {
        self.retention_ms = i64::from(settings.retention_days.max(1)) * DAY_MS;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    Written,
    /// A newer tombstone covers the id; nothing was written.
    Suppressed,
}

/// History namespaces keyed by record id.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HistorySnapshot {
    pub items: HashMap<String, ItemRecord>,
    pub collections: HashMap<String, CollectionRecord>,
    pub tombstones: HashMap<String, Tombstone>,
}

/// Records arriving from another device.
#[derive(Debug, Clone, Default)]
pub struct InboundChanges {
    pub items: Vec<ItemRecord>,
    pub collections: Vec<CollectionRecord>,
    pub tombstones: Vec<Tombstone>,
}

impl InboundChanges {
    pub fn is_empty(&self) -> bool {
        self.items.is_empty() && self.collections.is_empty() && self.tombstones.is_empty()
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ApplyReport {
    pub written: usize,
    pub suppressed: usize,
    pub deleted: usize,
}

/// Single entry point for collaborators.
///
/// Writes land in the fast tier and return once durable there. Reads fall
/// back to the archive, and degrade to fast-tier-only results when the
/// archive is unavailable. Every write or removal is announced on the event
/// bus, which is also how an enabled sync service learns it has work to do.
#[derive(Clone)]
pub struct HybridStorage {
    inner: Arc<Inner>,
}

struct Inner {
    fast: Arc<dyn FastTier>,
    archive: Arc<dyn ArchiveTier>,
    tombstones: Arc<TombstoneManager>,
    options: StorageOptions,
    events: broadcast::Sender<StorageEvent>,
    writes_since_migration: AtomicU64,
    migrating: AtomicBool,
}

impl HybridStorage {
    pub fn new(
        fast: Arc<dyn FastTier>,
        archive: Arc<dyn ArchiveTier>,
        options: StorageOptions,
    ) -> Self {
        let tombstones = Arc::new(TombstoneManager::new(
            fast.clone(),
            archive.clone(),
            options.retention_ms,
        ));
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        Self {
            inner: Arc::new(Inner {
                fast,
                archive,
                tombstones,
                options,
                events,
                writes_since_migration: AtomicU64::new(0),
                migrating: AtomicBool::new(false),
            }),
        }
    }

    /// One-time upgrades. Call once after construction.
    pub async fn init(&self) -> Result<()> {
        self.migrate_legacy_format().await?;
        Ok(())
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StorageEvent> {
        self.inner.events.subscribe()
    }

    pub fn publish(&self, event: StorageEvent) {
        // No receivers is fine
        let _ = self.inner.events.send(event);
    }

    pub fn tombstones(&self) -> Arc<TombstoneManager> {
        self.inner.tombstones.clone()
    }

    pub fn options(&self) -> &StorageOptions {
        &self.inner.options
    }

    // Item operations

    pub async fn lookup_item(&self, id: &str) -> Result<Lookup> {
        let local = self.read_fast::<ItemRecord>(&keys::item_key(id)).await?;
        let archival = if local.is_none() {
            degraded("get_item", self.inner.archive.get_item(id)).await
        } else {
            None
        };
        let tombstone = self.inner.tombstones.live_tombstone(id).await?;
        Ok(Lookup::resolve(local, archival, tombstone))
    }

    pub async fn get_item(&self, id: &str) -> Result<Option<ItemRecord>> {
        Ok(self.lookup_item(id).await?.into_item())
    }

    pub async fn set_item(&self, id: &str, record: ItemRecord) -> Result<WriteOutcome> {
        let mut record = record.normalized();
        record.id = id.to_string();

        let tombstone = self.inner.tombstones.live_tombstone(id).await?;
        if let Some(t) = &tombstone {
            if t.suppresses(record.last_touched_at) {
                debug!(
                    "Ignoring stale write for deleted item {} ({} <= {})",
                    id, record.last_touched_at, t.deleted_at
                );
                return Ok(WriteOutcome::Suppressed);
            }
        }

        let key = keys::item_key(id);
        self.write_fast(vec![(key.clone(), serde_json::to_value(&record)?)])
            .await?;

        let mut changed = vec![key];
        if tombstone.is_some() {
            if let Err(e) = self.inner.tombstones.clear(id).await {
                warn!("Revived {} but could not drop its tombstone: {}", id, e);
            }
            changed.push(keys::tombstone_key(id));
        }

        self.publish(StorageEvent::Changed { keys: changed });
        self.note_write();
        Ok(WriteOutcome::Written)
    }

    /// Delete an item from both tiers and leave a tombstone. Idempotent.
    pub async fn remove_item(&self, id: &str) -> Result<()> {
        let now = now_ms();
        let key = keys::item_key(id);

        self.inner
            .fast
            .remove(std::slice::from_ref(&key))
            .await
            .map_err(storage_unavailable)?;

        if let Err(e) = self
            .inner
            .archive
            .delete_item(id, DeleteOptions::tombstone(now))
            .await
        {
            warn!("Archive delete failed for {}, relying on fast-tier tombstone: {}", id, e);
        }

        let tombstone = Tombstone::new(id, now);
        self.write_fast(vec![TombstoneManager::mirror_entry(&tombstone)?])
            .await?;

        self.publish(StorageEvent::Changed {
            keys: vec![key, keys::tombstone_key(id)],
        });
        Ok(())
    }

    pub async fn get_all_items(&self) -> Result<Vec<ItemRecord>> {
        let (archived, local, tombstones) = futures::join!(
            degraded("get_all_items", self.inner.archive.get_all_items()),
            self.local_items(),
            self.inner.tombstones.live_tombstones(),
        );
        Ok(merge_items(archived, local?, &tombstones?))
    }

    /// Items whose normalized title contains the normalized query.
    pub async fn search_items(&self, query: &str) -> Result<Vec<ItemRecord>> {
        let needle = normalize_title(query);
        if needle.is_empty() {
            return Ok(Vec::new());
        }
        let (archived, local, tombstones) = futures::join!(
            degraded("search_titles", self.inner.archive.search_titles(query)),
            self.local_items(),
            self.inner.tombstones.live_tombstones(),
        );
        let mut merged = merge_items(archived, local?, &tombstones?);
        merged.retain(|item| normalize_title(&item.title).contains(&needle));
        Ok(merged)
    }

    /// Items touched in `[from, to]`, newest first.
    pub async fn items_touched_between(&self, from: i64, to: i64) -> Result<Vec<ItemRecord>> {
        let (archived, local, tombstones) = futures::join!(
            degraded("items_between", self.inner.archive.items_between(from, to)),
            self.local_items(),
            self.inner.tombstones.live_tombstones(),
        );
        let mut merged = merge_items(archived, local?, &tombstones?);
        merged.retain(|item| (from..=to).contains(&item.last_touched_at));
        Ok(merged)
    }

    // Collection operations

    pub async fn get_collection(&self, id: &str) -> Result<Option<CollectionRecord>> {
        if let Some(collection) = self.read_fast(&keys::collection_key(id)).await? {
            return Ok(Some(collection));
        }
        Ok(degraded("get_collection", self.inner.archive.get_collection(id)).await)
    }

    pub async fn set_collection(&self, id: &str, mut record: CollectionRecord) -> Result<()> {
        record.id = id.to_string();
        let key = keys::collection_key(id);
        self.write_fast(vec![(key.clone(), serde_json::to_value(&record)?)])
            .await?;
        self.publish(StorageEvent::Changed { keys: vec![key] });
        self.note_write();
        Ok(())
    }

    pub async fn remove_collection(&self, id: &str) -> Result<()> {
        let key = keys::collection_key(id);
        self.inner
            .fast
            .remove(std::slice::from_ref(&key))
            .await
            .map_err(storage_unavailable)?;
        if let Err(e) = self.inner.archive.delete_collection(id).await {
            warn!("Archive delete failed for collection {}: {}", id, e);
        }
        self.publish(StorageEvent::Changed { keys: vec![key] });
        Ok(())
    }

    pub async fn get_all_collections(&self) -> Result<Vec<CollectionRecord>> {
        let (archived, entries) = futures::join!(
            degraded("get_all_collections", self.inner.archive.get_all_collections()),
            self.inner.fast.get_all(),
        );
        let local = parse_entries::<CollectionRecord>(&entries?, keys::collection_id);
        Ok(merge_collections(archived, local.into_values().collect()))
    }

    // Settings and state

    pub async fn get_settings(&self) -> Result<Settings> {
        Ok(self.read_state(keys::SETTINGS_KEY).await?.unwrap_or_default())
    }

    pub async fn set_settings(&self, settings: &Settings) -> Result<()> {
        self.write_state(keys::SETTINGS_KEY, settings).await?;
        self.publish(StorageEvent::Changed {
            keys: vec![keys::SETTINGS_KEY.to_string()],
        });
        Ok(())
    }

    pub async fn load_sync_state(&self) -> Result<SyncState> {
        Ok(self.read_state(keys::SYNC_STATE_KEY).await?.unwrap_or_default())
    }

    pub async fn save_sync_state(&self, state: &SyncState) -> Result<()> {
        self.write_state(keys::SYNC_STATE_KEY, state).await
    }

    /// Read a reserved fast-tier value. Malformed values read as absent.
    pub async fn read_state<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        self.read_fast(key).await
    }

    pub async fn write_state<T: Serialize + ?Sized>(&self, key: &str, value: &T) -> Result<()> {
        self.write_fast(vec![(key.to_string(), serde_json::to_value(value)?)])
            .await
    }

    /// Force the next `get_stats` to rebuild from a full scan.
    pub async fn invalidate_stats(&self) -> Result<()> {
        self.inner
            .fast
            .remove(&[keys::STATS_KEY.to_string(), keys::STATS_SYNCED_KEY.to_string()])
            .await
            .map_err(storage_unavailable)
    }

    /// Remove items, collections, tombstones and stats. Settings and sync state stay.
    pub async fn clear_history_only(&self) -> Result<()> {
        self.clear_except(&[keys::SETTINGS_KEY, keys::SYNC_STATE_KEY, keys::MIGRATED_KEY])
            .await?;
        self.publish(StorageEvent::Cleared {
            settings_reset: false,
        });
        Ok(())
    }

    /// Everything `clear_history_only` removes, plus settings.
    pub async fn clear_all(&self) -> Result<()> {
        self.clear_except(&[keys::SYNC_STATE_KEY, keys::MIGRATED_KEY])
            .await?;
        self.publish(StorageEvent::Cleared {
            settings_reset: true,
        });
        Ok(())
    }

    async fn clear_except(&self, keep: &[&str]) -> Result<()> {
        self.inner
            .archive
            .clear_history()
            .await
            .map_err(|e| AppError::ArchivalUnavailable(e.to_string()))?;

        let doomed: Vec<String> = self
            .inner
            .fast
            .get_all()
            .await?
            .into_keys()
            .filter(|key| !keep.contains(&key.as_str()))
            .collect();
        self.inner
            .fast
            .remove(&doomed)
            .await
            .map_err(storage_unavailable)?;
        info!("Cleared {} fast-tier keys and the archive", doomed.len());
        Ok(())
    }

    pub async fn cleanup_tombstones(&self, retention_ms: i64) -> Result<CleanupReport> {
        self.inner.tombstones.cleanup_tombstones(retention_ms).await
    }

    // Sync support

    /// Items, collections and live tombstones currently in the fast tier.
    pub async fn fast_history(&self) -> Result<HistorySnapshot> {
        let entries = self.inner.fast.get_all().await?;
        let now = now_ms();
        let mut tombstones = parse_entries::<Tombstone>(&entries, keys::tombstone_id);
        tombstones.retain(|_, t| t.is_live(now, self.inner.options.retention_ms));

        Ok(HistorySnapshot {
            items: parse_entries(&entries, keys::item_id),
            collections: parse_entries(&entries, keys::collection_id),
            tombstones,
        })
    }

    /// Both tiers merged: live items, collections and live tombstones.
    ///
    /// Falls back to the fast tier alone when the archive is unavailable.
    pub async fn sync_history(&self) -> Result<HistorySnapshot> {
        let (archived_items, archived_collections, local, tombstones) = futures::join!(
            degraded("get_all_items", self.inner.archive.get_all_items()),
            degraded("get_all_collections", self.inner.archive.get_all_collections()),
            self.fast_history(),
            self.inner.tombstones.live_tombstones(),
        );
        let local = local?;
        let tombstones = tombstones?;

        let items = merge_items(archived_items, local.items.into_values().collect(), &tombstones);
        let collections =
            merge_collections(archived_collections, local.collections.into_values().collect());

        Ok(HistorySnapshot {
            items: items.into_iter().map(|i| (i.id.clone(), i)).collect(),
            collections: collections.into_iter().map(|c| (c.id.clone(), c)).collect(),
            tombstones,
        })
    }

    /// Apply remote records through the same tombstone rules as local writes.
    ///
    /// No `Changed` events are emitted; the caller announces completion.
    pub async fn apply_inbound(&self, changes: InboundChanges) -> Result<ApplyReport> {
        let mut report = ApplyReport::default();
        if changes.is_empty() {
            return Ok(report);
        }

        let local = self.fast_history().await?;
        let mut known = self.inner.tombstones.live_tombstones().await?;
        let mut entries = Vec::new();
        let mut doomed = Vec::new();
        let now = now_ms();

        for tombstone in changes.tombstones {
            if !tombstone.is_live(now, self.inner.options.retention_ms) {
                continue;
            }
            let id = tombstone.item_id.clone();
            if known
                .get(&id)
                .is_some_and(|t| t.deleted_at >= tombstone.deleted_at)
            {
                continue;
            }
            if local
                .items
                .get(&id)
                .is_some_and(|item| !tombstone.suppresses(item.last_touched_at))
            {
                // Edited here after it was deleted elsewhere
                continue;
            }

            let archived = degraded("get_item", self.inner.archive.get_item(&id)).await;
            if !archived
                .as_ref()
                .is_some_and(|item| !tombstone.suppresses(item.last_touched_at))
            {
                if let Err(e) = self
                    .inner
                    .archive
                    .delete_item(&id, DeleteOptions::tombstone(tombstone.deleted_at))
                    .await
                {
                    warn!("Archive delete failed for synced tombstone {}: {}", id, e);
                }
            }

            if local.items.contains_key(&id) {
                doomed.push(keys::item_key(&id));
            }
            entries.push(TombstoneManager::mirror_entry(&tombstone)?);
            known.insert(id, tombstone);
            report.deleted += 1;
        }

        for item in changes.items {
            let item = item.normalized();
            match known.get(&item.id) {
                Some(t) if t.suppresses(item.last_touched_at) => {
                    debug!("Dropping synced item {} covered by a tombstone", item.id);
                    report.suppressed += 1;
                    continue;
                }
                Some(_) => doomed.push(keys::tombstone_key(&item.id)),
                None => {}
            }
            entries.push((keys::item_key(&item.id), serde_json::to_value(&item)?));
            report.written += 1;
        }

        for collection in changes.collections {
            entries.push((
                keys::collection_key(&collection.id),
                serde_json::to_value(&collection)?,
            ));
            report.written += 1;
        }

        if !doomed.is_empty() {
            self.inner
                .fast
                .remove(&doomed)
                .await
                .map_err(storage_unavailable)?;
        }
        if !entries.is_empty() {
            self.write_fast(entries).await?;
        }
        Ok(report)
    }

    /// Replace all local history with `snapshot`, in both tiers.
    pub async fn replace_history(&self, snapshot: HistorySnapshot) -> Result<ApplyReport> {
        self.inner
            .archive
            .clear_history()
            .await
            .map_err(|e| AppError::ArchivalUnavailable(e.to_string()))?;

        let doomed: Vec<String> = self
            .inner
            .fast
            .get_all()
            .await?
            .into_keys()
            .filter(|key| keys::is_history_key(key))
            .collect();
        self.inner
            .fast
            .remove(&doomed)
            .await
            .map_err(storage_unavailable)?;

        let mut report = ApplyReport::default();
        let mut entries = Vec::new();
        for tombstone in snapshot.tombstones.values() {
            entries.push(TombstoneManager::mirror_entry(tombstone)?);
            report.deleted += 1;
        }
        for item in snapshot.items.into_values() {
            if snapshot
                .tombstones
                .get(&item.id)
                .is_some_and(|t| t.suppresses(item.last_touched_at))
            {
                report.suppressed += 1;
                continue;
            }
            entries.push((keys::item_key(&item.id), serde_json::to_value(&item)?));
            report.written += 1;
        }
        for collection in snapshot.collections.into_values() {
            entries.push((
                keys::collection_key(&collection.id),
                serde_json::to_value(&collection)?,
            ));
            report.written += 1;
        }

        if !entries.is_empty() {
            self.write_fast(entries).await?;
        }
        self.invalidate_stats().await?;
        Ok(report)
    }

    /// Insert many records at once, straight into the archive when it is up.
    pub async fn bulk_insert(
        &self,
        items: Vec<ItemRecord>,
        collections: Vec<CollectionRecord>,
    ) -> Result<usize> {
        let items: Vec<ItemRecord> = items.into_iter().map(ItemRecord::normalized).collect();
        let mut changed: Vec<String> = items.iter().map(|i| keys::item_key(&i.id)).collect();
        changed.extend(collections.iter().map(|c| keys::collection_key(&c.id)));
        let count = changed.len();

        let archived = async {
            self.inner.archive.put_items(items.clone()).await?;
            self.inner.archive.put_collections(collections.clone()).await
        }
        .await;

        if let Err(e) = archived {
            warn!("Archive bulk insert failed, writing to fast tier instead: {}", e);
            let mut entries = Vec::with_capacity(count);
            for item in &items {
                entries.push((keys::item_key(&item.id), serde_json::to_value(item)?));
            }
            for collection in &collections {
                entries.push((
                    keys::collection_key(&collection.id),
                    serde_json::to_value(collection)?,
                ));
            }
            self.write_fast(entries).await?;
        }

        self.publish(StorageEvent::Changed { keys: changed });
        Ok(count)
    }

    // Archival migration

    /// Move aged or surplus fast-tier records into the archive.
    pub async fn migrate_aged_items(&self) -> Result<usize> {
        self.migrate_with_limit(self.inner.options.fast_tier_max_items)
            .await
    }

    async fn migrate_with_limit(&self, keep: usize) -> Result<usize> {
        let Some(_guard) = InFlightGuard::acquire(&self.inner.migrating) else {
            debug!("Archival migration already running");
            return Ok(0);
        };

        let cutoff = now_ms() - self.inner.options.archive_after_ms;
        let snapshot = self.fast_history().await?;

        let mut items: Vec<ItemRecord> = snapshot.items.into_values().collect();
        items.sort_by_key(|item| Reverse(item.last_touched_at));
        let items: Vec<ItemRecord> = items
            .into_iter()
            .enumerate()
            .filter(|(rank, item)| *rank >= keep || item.last_touched_at < cutoff)
            .map(|(_, item)| item)
            .collect();
        let collections: Vec<CollectionRecord> = snapshot
            .collections
            .into_values()
            .filter(|c| c.last_updated_at < cutoff)
            .collect();

        if items.is_empty() && collections.is_empty() {
            return Ok(0);
        }

        self.inner
            .archive
            .put_items(items.clone())
            .await
            .map_err(|e| AppError::ArchivalUnavailable(e.to_string()))?;
        self.inner
            .archive
            .put_collections(collections.clone())
            .await
            .map_err(|e| AppError::ArchivalUnavailable(e.to_string()))?;

        // Only drop fast copies that nobody touched while the archive write ran
        let current = self.fast_history().await?;
        let mut doomed = Vec::new();
        for item in &items {
            if current.items.get(&item.id) == Some(item) {
                doomed.push(keys::item_key(&item.id));
            }
        }
        for collection in &collections {
            if current.collections.get(&collection.id) == Some(collection) {
                doomed.push(keys::collection_key(&collection.id));
            }
        }
        self.inner.fast.remove(&doomed).await?;

        info!("Archived {} records from the fast tier", doomed.len());
        Ok(doomed.len())
    }

    fn note_write(&self) {
        let every = self.inner.options.migrate_every_writes;
        if every == 0 {
            return;
        }
        let count = self
            .inner
            .writes_since_migration
            .fetch_add(1, Ordering::Relaxed)
            + 1;
        if count < every {
            return;
        }
        self.inner.writes_since_migration.store(0, Ordering::Relaxed);

        let storage = self.clone();
        tokio::spawn(async move {
            if let Err(e) = storage.migrate_aged_items().await {
                warn!("Background archival migration failed: {}", e);
            }
        });
    }

    /// Rewrite un-prefixed legacy progress entries once.
    pub async fn migrate_legacy_format(&self) -> Result<usize> {
        if self.inner.fast.get(keys::MIGRATED_KEY).await?.is_some() {
            return Ok(0);
        }

        let mut converted = Vec::new();
        let mut legacy = Vec::new();
        for (key, value) in self.inner.fast.get_all().await? {
            if keys::is_history_key(&key) || keys::RESERVED_KEYS.contains(&key.as_str()) {
                continue;
            }
            if let Ok(progress) = serde_json::from_value::<LegacyProgress>(value) {
                let item = progress.into_item(&key);
                converted.push((keys::item_key(&key), serde_json::to_value(&item)?));
                legacy.push(key);
            }
        }

        let count = converted.len();
        converted.push((keys::MIGRATED_KEY.to_string(), Value::Bool(true)));
        self.write_fast(converted).await?;
        if !legacy.is_empty() {
            self.inner
                .fast
                .remove(&legacy)
                .await
                .map_err(storage_unavailable)?;
            info!("Migrated {} legacy progress entries", count);
        }
        Ok(count)
    }

    // Tier helpers

    async fn local_items(&self) -> Result<Vec<ItemRecord>> {
        let entries = self.inner.fast.get_all().await?;
        Ok(parse_entries::<ItemRecord>(&entries, keys::item_id)
            .into_values()
            .collect())
    }

    async fn read_fast<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        let Some(value) = self.inner.fast.get(key).await? else {
            return Ok(None);
        };
        match serde_json::from_value(value) {
            Ok(parsed) => Ok(Some(parsed)),
            Err(e) => {
                warn!("Ignoring malformed value under {}: {}", key, e);
                Ok(None)
            }
        }
    }

    /// Fast-tier write with one eviction-and-retry on quota exhaustion.
    async fn write_fast(&self, entries: Vec<(String, Value)>) -> Result<()> {
        match self.inner.fast.set_many(entries.clone()).await {
            Ok(()) => Ok(()),
            Err(AppError::QuotaExceeded { needed, quota }) => {
                warn!(
                    "Fast tier full ({} > {} bytes), archiving oldest records",
                    needed, quota
                );
                let hot = self.fast_history().await?.items.len();
                if let Err(e) = self.migrate_with_limit(hot / 2).await {
                    warn!("Eviction to archive failed: {}", e);
                }
                self.inner
                    .fast
                    .set_many(entries)
                    .await
                    .map_err(storage_unavailable)
            }
            Err(e) => Err(storage_unavailable(e)),
        }
    }
}

fn storage_unavailable(e: AppError) -> AppError {
    match e {
        AppError::StorageUnavailable(_) => e,
        other => AppError::StorageUnavailable(other.to_string()),
    }
}

/// Await an archive read, logging and substituting an empty result on failure.
async fn degraded<T: Default>(operation: &str, read: impl Future<Output = Result<T>>) -> T {
    match read.await {
        Ok(value) => value,
        Err(e) => {
            warn!("Archival tier unavailable during {}: {}", operation, e);
            T::default()
        }
    }
}

fn parse_entries<T: DeserializeOwned>(
    entries: &HashMap<String, Value>,
    id_of: fn(&str) -> Option<&str>,
) -> HashMap<String, T> {
    entries
        .iter()
        .filter_map(|(key, value)| {
            let id = id_of(key)?;
            match serde_json::from_value::<T>(value.clone()) {
                Ok(parsed) => Some((id.to_string(), parsed)),
                Err(e) => {
                    warn!("Skipping malformed record {}: {}", key, e);
                    None
                }
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use tokio_test::assert_ok;

    use crate::db::SqliteArchive;
    use crate::fast::MemoryFastTier;

    /// Archive that fails every call.
    struct OfflineArchive;

    fn offline<T>() -> Result<T> {
        Err(AppError::ArchivalUnavailable("offline".to_string()))
    }

    #[async_trait]
    impl ArchiveTier for OfflineArchive {
        async fn put_items(&self, _: Vec<ItemRecord>) -> Result<usize> {
            offline()
        }
        async fn get_item(&self, _: &str) -> Result<Option<ItemRecord>> {
            offline()
        }
        async fn get_all_items(&self) -> Result<Vec<ItemRecord>> {
            offline()
        }
        async fn items_between(&self, _: i64, _: i64) -> Result<Vec<ItemRecord>> {
            offline()
        }
        async fn items_in_category(&self, _: &str) -> Result<Vec<ItemRecord>> {
            offline()
        }
        async fn search_titles(&self, _: &str) -> Result<Vec<ItemRecord>> {
            offline()
        }
        async fn delete_item(&self, _: &str, _: DeleteOptions) -> Result<()> {
            offline()
        }
        async fn put_collections(&self, _: Vec<CollectionRecord>) -> Result<usize> {
            offline()
        }
        async fn get_collection(&self, _: &str) -> Result<Option<CollectionRecord>> {
            offline()
        }
        async fn get_all_collections(&self) -> Result<Vec<CollectionRecord>> {
            offline()
        }
        async fn delete_collection(&self, _: &str) -> Result<()> {
            offline()
        }
        async fn get_tombstone(&self, _: &str) -> Result<Option<Tombstone>> {
            offline()
        }
        async fn all_tombstones(&self) -> Result<Vec<Tombstone>> {
            offline()
        }
        async fn remove_tombstone(&self, _: &str) -> Result<()> {
            offline()
        }
        async fn purge_tombstones_before(&self, _: i64) -> Result<usize> {
            offline()
        }
        async fn clear_history(&self) -> Result<()> {
            offline()
        }
    }

    struct Fixture {
        fast: Arc<MemoryFastTier>,
        archive: Arc<SqliteArchive>,
        storage: HybridStorage,
    }

    async fn fixture() -> Fixture {
        let fast = Arc::new(MemoryFastTier::default());
        let archive = Arc::new(SqliteArchive::open_in_memory().await.unwrap());
        let options = StorageOptions {
            migrate_every_writes: 0,
            ..StorageOptions::default()
        };
        let storage = HybridStorage::new(fast.clone(), archive.clone(), options);
        storage.init().await.unwrap();
        Fixture {
            fast,
            archive,
            storage,
        }
    }

    fn item(id: &str, touched: i64, position: f64) -> ItemRecord {
        ItemRecord::new(id, touched)
            .with_title(format!("Title {id}"))
            .with_progress(position, 600.0)
    }

    #[tokio::test]
    async fn stale_write_after_delete_is_suppressed() {
        let f = fixture().await;
        let s = &f.storage;

        assert_eq!(s.set_item("v1", item("v1", 1000, 42.0)).await.unwrap(), WriteOutcome::Written);
        s.remove_item("v1").await.unwrap();
        let outcome = s.set_item("v1", item("v1", 500, 10.0)).await.unwrap();

        assert_eq!(outcome, WriteOutcome::Suppressed);
        assert!(s.get_item("v1").await.unwrap().is_none());
        assert!(s.get_all_items().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn newer_write_revives_deleted_item() {
        let f = fixture().await;
        let s = &f.storage;

        s.set_item("v1", item("v1", 1000, 42.0)).await.unwrap();
        s.remove_item("v1").await.unwrap();
        let later = now_ms() + 10_000;
        assert_eq!(
            s.set_item("v1", item("v1", later, 5.0)).await.unwrap(),
            WriteOutcome::Written
        );

        let revived = s.get_item("v1").await.unwrap().unwrap();
        assert_eq!(revived.position_seconds, 5.0);
        assert!(s.tombstones().live_tombstone("v1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn remove_is_idempotent() {
        let f = fixture().await;
        assert_ok!(f.storage.remove_item("never-there").await);
        assert_ok!(f.storage.remove_item("never-there").await);
        assert!(f.storage.get_item("never-there").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn local_write_shadows_archived_copy() {
        let f = fixture().await;
        f.archive.put_items(vec![item("a", 5000, 100.0)]).await.unwrap();

        let archived = f.storage.lookup_item("a").await.unwrap();
        assert!(matches!(archived, Lookup::FoundArchival(_)));

        f.storage.set_item("a", item("a", 6000, 120.0)).await.unwrap();
        let local = f.storage.lookup_item("a").await.unwrap();
        assert!(matches!(local, Lookup::FoundLocal(ref i) if i.position_seconds == 120.0));
    }

    #[tokio::test]
    async fn get_all_merges_tiers_by_timestamp() {
        let f = fixture().await;
        f.archive
            .put_items(vec![item("a", 2000, 1.0), item("b", 1000, 1.0), item("c", 10, 1.0)])
            .await
            .unwrap();
        f.storage.set_item("a", item("a", 1500, 2.0)).await.unwrap();
        f.storage.set_item("b", item("b", 3000, 2.0)).await.unwrap();

        let all = f.storage.get_all_items().await.unwrap();
        let by_id: HashMap<_, _> = all.iter().map(|i| (i.id.as_str(), i.position_seconds)).collect();
        assert_eq!(by_id["a"], 1.0);
        assert_eq!(by_id["b"], 2.0);
        assert_eq!(by_id.len(), 3);

        // Idempotent with no intervening writes
        assert_eq!(all, f.storage.get_all_items().await.unwrap());
    }

    #[tokio::test]
    async fn tombstone_hides_record_left_in_archive() {
        let f = fixture().await;
        f.storage.set_item("a", item("a", 1000, 1.0)).await.unwrap();
        f.storage.remove_item("a").await.unwrap();
        // A copy reappears in the archive, e.g. from an interrupted migration
        f.archive.put_items(vec![item("a", 1000, 1.0)]).await.unwrap();

        assert!(f.storage.get_item("a").await.unwrap().is_none());
        assert!(f.storage.get_all_items().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn archive_outage_degrades_reads_but_not_writes() {
        let fast = Arc::new(MemoryFastTier::default());
        let storage = HybridStorage::new(fast, Arc::new(OfflineArchive), StorageOptions::default());

        storage.set_item("a", item("a", 1000, 1.0)).await.unwrap();
        assert!(storage.get_item("a").await.unwrap().is_some());
        assert!(storage.get_item("missing").await.unwrap().is_none());
        assert_eq!(storage.get_all_items().await.unwrap().len(), 1);

        // Tombstone still applies through the fast-tier mirror
        storage.remove_item("a").await.unwrap();
        assert!(storage.get_item("a").await.unwrap().is_none());
        assert_eq!(
            storage.set_item("a", item("a", 1000, 1.0)).await.unwrap(),
            WriteOutcome::Suppressed
        );
    }

    #[tokio::test]
    async fn fast_tier_outage_fails_writes() {
        let f = fixture().await;
        f.fast.set_available(false);
        let err = f.storage.set_item("a", item("a", 1, 1.0)).await.unwrap_err();
        assert!(matches!(err, AppError::StorageUnavailable(_)));
        assert!(f.storage.remove_item("a").await.is_err());
    }

    #[tokio::test]
    async fn writes_emit_change_events() {
        let f = fixture().await;
        let mut events = f.storage.subscribe();

        f.storage.set_item("a", item("a", 1, 1.0)).await.unwrap();
        f.storage
            .set_collection("pl", CollectionRecord::new("pl", 1))
            .await
            .unwrap();

        let first = events.recv().await.unwrap();
        assert!(first.touches_prefix(keys::ITEM_PREFIX));
        let second = events.recv().await.unwrap();
        assert_eq!(
            second,
            StorageEvent::Changed {
                keys: vec!["collection_pl".to_string()]
            }
        );
    }

    #[tokio::test]
    async fn clear_history_keeps_settings_clear_all_does_not() {
        let f = fixture().await;
        let settings = Settings {
            page_size: 99,
            ..Settings::default()
        };
        f.storage.set_settings(&settings).await.unwrap();
        f.storage
            .save_sync_state(&SyncState {
                enabled: true,
                last_sync_time: Some(5),
            })
            .await
            .unwrap();
        f.storage.set_item("a", item("a", 1, 1.0)).await.unwrap();
        f.archive.put_items(vec![item("b", 1, 1.0)]).await.unwrap();

        f.storage.clear_history_only().await.unwrap();
        assert!(f.storage.get_all_items().await.unwrap().is_empty());
        assert_eq!(f.storage.get_settings().await.unwrap().page_size, 99);

        f.storage.clear_all().await.unwrap();
        assert_eq!(f.storage.get_settings().await.unwrap(), Settings::default());
        assert!(f.storage.load_sync_state().await.unwrap().enabled);
    }

    #[tokio::test]
    async fn collections_merge_across_tiers() {
        let f = fixture().await;
        let mut archived = CollectionRecord::new("pl", 10);
        archived.last_updated_at = 50;
        archived.title = "Archived".to_string();
        f.archive.put_collections(vec![archived]).await.unwrap();

        assert_eq!(
            f.storage.get_collection("pl").await.unwrap().unwrap().title,
            "Archived"
        );

        let mut fresh = CollectionRecord::new("pl", 10);
        fresh.last_updated_at = 80;
        fresh.title = "Fresh".to_string();
        f.storage.set_collection("pl", fresh).await.unwrap();

        let all = f.storage.get_all_collections().await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].title, "Fresh");

        f.storage.remove_collection("pl").await.unwrap();
        assert!(f.storage.get_collection("pl").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn migration_moves_aged_items_into_archive() {
        let f = fixture().await;
        let now = now_ms();
        f.storage.set_item("old", item("old", now - 10 * DAY_MS, 1.0)).await.unwrap();
        f.storage.set_item("new", item("new", now, 1.0)).await.unwrap();

        let moved = f.storage.migrate_aged_items().await.unwrap();
        assert_eq!(moved, 1);

        assert!(f.fast.get("item_old").await.unwrap().is_none());
        assert!(f.archive.get_item("old").await.unwrap().is_some());
        assert!(matches!(
            f.storage.lookup_item("old").await.unwrap(),
            Lookup::FoundArchival(_)
        ));
        assert!(matches!(
            f.storage.lookup_item("new").await.unwrap(),
            Lookup::FoundLocal(_)
        ));
    }

    #[tokio::test]
    async fn quota_exhaustion_evicts_to_archive() {
        let fast = Arc::new(MemoryFastTier::new(2_000));
        let archive = Arc::new(SqliteArchive::open_in_memory().await.unwrap());
        let options = StorageOptions {
            migrate_every_writes: 0,
            ..StorageOptions::default()
        };
        let storage = HybridStorage::new(fast.clone(), archive.clone(), options);

        let now = now_ms();
        for i in 0..40 {
            let id = format!("v{i}");
            storage.set_item(&id, item(&id, now + i, 1.0)).await.unwrap();
        }

        assert_eq!(storage.get_all_items().await.unwrap().len(), 40);
        assert!(!archive.get_all_items().await.unwrap().is_empty());
        assert!(fast.bytes_in_use().await.unwrap() <= 2_000);
    }

    #[tokio::test]
    async fn search_and_range_cover_both_tiers() {
        let f = fixture().await;
        let mut archived = item("a", 1000, 1.0);
        archived.title = "Learning Rust, part 1".to_string();
        f.archive.put_items(vec![archived]).await.unwrap();
        let mut local = item("b", 2000, 1.0);
        local.title = "learning rust: part 2".to_string();
        f.storage.set_item("b", local).await.unwrap();
        f.storage.set_item("c", item("c", 3000, 1.0)).await.unwrap();

        let hits: Vec<_> = f
            .storage
            .search_items("LEARNING rust")
            .await
            .unwrap()
            .into_iter()
            .map(|i| i.id)
            .collect();
        assert_eq!(hits, vec!["b".to_string(), "a".to_string()]);

        let window = f.storage.items_touched_between(1500, 3000).await.unwrap();
        assert_eq!(window.len(), 2);
    }

    #[tokio::test]
    async fn legacy_entries_are_migrated_once() {
        let fast = Arc::new(MemoryFastTier::default());
        fast.set(
            "abc123",
            serde_json::json!({"time": 30, "duration": 300, "timestamp": 1234}),
        )
        .await
        .unwrap();
        let archive = Arc::new(SqliteArchive::open_in_memory().await.unwrap());
        let storage = HybridStorage::new(fast.clone(), archive, StorageOptions::default());

        storage.init().await.unwrap();
        let item = storage.get_item("abc123").await.unwrap().unwrap();
        assert_eq!(item.position_seconds, 30.0);
        assert!(fast.get("abc123").await.unwrap().is_none());

        assert_eq!(storage.migrate_legacy_format().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn inbound_tombstone_removes_older_local_item() {
        let f = fixture().await;
        let now = now_ms();
        f.storage.set_item("a", item("a", now - 5_000, 1.0)).await.unwrap();
        f.storage.set_item("b", item("b", now, 1.0)).await.unwrap();

        let report = f
            .storage
            .apply_inbound(InboundChanges {
                tombstones: vec![
                    Tombstone::new("a", now - 1_000),
                    Tombstone::new("b", now - 1_000),
                    Tombstone::new("c", now - 40 * DAY_MS),
                ],
                ..InboundChanges::default()
            })
            .await
            .unwrap();

        assert_eq!(report.deleted, 1);
        assert!(f.storage.get_item("a").await.unwrap().is_none());
        assert!(f.storage.tombstones().live_tombstone("a").await.unwrap().is_some());
        assert!(f.storage.get_item("b").await.unwrap().is_some());
    }
}
