use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use serde_json::{json, Value};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::SyncConfig;
use crate::error::{AppError, Result};
use crate::keys;
use crate::models::{now_ms, DAY_MS, SyncState, SyncStatus};
use crate::storage::{HistorySnapshot, HybridStorage, InFlightGuard, Lookup, StorageEvent};

use super::chunk::chunk_entries;
use super::merge::{merge, MergeMode};
use super::record::{decode_remote, SyncRecord};
use super::remote::RemoteChannel;

const PROBE_KEY: &str = "sync___probe__";

#[derive(Debug, Clone)]
pub struct SyncOptions {
    pub interval: Duration,
    pub debounce: Duration,
    pub conflict_grace_ms: i64,
    pub stale_after_ms: i64,
    pub max_synced_items: usize,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self::from(&SyncConfig::default())
    }
}

impl From<&SyncConfig> for SyncOptions {
    fn from(config: &SyncConfig) -> Self {
        Self {
            interval: config.interval(),
            debounce: config.debounce(),
            conflict_grace_ms: config.conflict_grace_ms,
            stale_after_ms: config.stale_after_ms(),
            max_synced_items: config.max_synced_items,
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SyncReport {
    /// Records written locally from the remote mirror.
    pub pulled: usize,
    /// Entries written to the remote channel.
    pub pushed: usize,
    /// Remote keys deleted.
    pub removed: usize,
    /// Records larger than one remote write, left unsynced.
    pub oversize: usize,
    /// Local history was replaced because this device was stale.
    pub replaced: bool,
}

/// What an incremental pass does with one changed key.
enum Outgoing {
    Publish(SyncRecord),
    Remove,
    Skip,
}

#[derive(Default)]
struct Tasks {
    listener: Option<JoinHandle<()>>,
    periodic: Option<JoinHandle<()>>,
}

/// Mirrors history through a [`RemoteChannel`] shared with other devices.
///
/// Lifecycle is `new → init → (enable_sync | disable_sync)* → dispose`.
/// Status moves `Disabled → Initializing → Syncing ⇄ Success`, with `Error`
/// after a failed pass and `NotAvailable` when the channel cannot be probed.
/// Only one pass, full or incremental, runs at a time; a request that
/// arrives while one is in flight is dropped.
pub struct SyncService {
    storage: HybridStorage,
    remote: Arc<dyn RemoteChannel>,
    options: SyncOptions,
    status: watch::Sender<SyncStatus>,
    enabled: AtomicBool,
    in_progress: AtomicBool,
    disposed: AtomicBool,
    trigger_pending: AtomicBool,
    resync_needed: AtomicBool,
    dirty: Mutex<HashSet<String>>,
    tasks: Mutex<Tasks>,
}

impl SyncService {
    pub fn new(
        storage: HybridStorage,
        remote: Arc<dyn RemoteChannel>,
        options: SyncOptions,
    ) -> Arc<Self> {
        let (status, _) = watch::channel(SyncStatus::Disabled);
        Arc::new(Self {
            storage,
            remote,
            options,
            status,
            enabled: AtomicBool::new(false),
            in_progress: AtomicBool::new(false),
            disposed: AtomicBool::new(false),
            trigger_pending: AtomicBool::new(false),
            resync_needed: AtomicBool::new(false),
            dirty: Mutex::new(HashSet::new()),
            tasks: Mutex::new(Tasks::default()),
        })
    }

    /// Start listening for storage changes and restore the persisted state.
    pub async fn init(self: &Arc<Self>) -> Result<()> {
        self.check_disposed()?;
        {
            let mut tasks = self.tasks.lock().await;
            if tasks.listener.is_none() {
                tasks.listener = Some(self.spawn_listener());
            }
        }

        let state = self.storage.load_sync_state().await?;
        if state.enabled {
            if let Err(e) = self.enable_sync().await {
                warn!("Sync was enabled but could not resume: {}", e);
            }
        } else {
            self.set_status(SyncStatus::Disabled);
        }
        Ok(())
    }

    pub fn status(&self) -> SyncStatus {
        self.status.borrow().clone()
    }

    pub fn watch_status(&self) -> watch::Receiver<SyncStatus> {
        self.status.subscribe()
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    pub fn is_syncing(&self) -> bool {
        self.in_progress.load(Ordering::SeqCst)
    }

    /// Probe the channel, then turn sync on with one full pass.
    pub async fn enable_sync(self: &Arc<Self>) -> Result<()> {
        self.check_disposed()?;
        self.set_status(SyncStatus::Initializing);
        let state = self.storage.load_sync_state().await?;

        if let Err(e) = self.probe().await {
            warn!("Sync channel not available: {}", e);
            self.enabled.store(false, Ordering::SeqCst);
            self.storage
                .save_sync_state(&SyncState {
                    enabled: false,
                    ..state
                })
                .await?;
            self.set_status(SyncStatus::NotAvailable);
            return Err(match e {
                AppError::SyncUnavailable(_) => e,
                other => AppError::SyncUnavailable(other.to_string()),
            });
        }

        self.enabled.store(true, Ordering::SeqCst);
        self.storage
            .save_sync_state(&SyncState {
                enabled: true,
                ..state
            })
            .await?;
        info!("Sync enabled");

        if let Err(e) = self.full_sync().await {
            warn!("Initial full sync failed: {}", e);
        }
        self.start_periodic().await;
        Ok(())
    }

    /// Stop syncing. Data already mirrored remotely is left in place.
    pub async fn disable_sync(&self) -> Result<()> {
        self.enabled.store(false, Ordering::SeqCst);
        if let Some(handle) = self.tasks.lock().await.periodic.take() {
            handle.abort();
        }
        self.dirty.lock().await.clear();

        let state = self.storage.load_sync_state().await?;
        self.storage
            .save_sync_state(&SyncState {
                enabled: false,
                ..state
            })
            .await?;
        self.set_status(SyncStatus::Disabled);
        info!("Sync disabled");
        Ok(())
    }

    /// Stop all background work. The service cannot be restarted.
    pub async fn dispose(&self) {
        self.disposed.store(true, Ordering::SeqCst);
        self.enabled.store(false, Ordering::SeqCst);
        let mut tasks = self.tasks.lock().await;
        for handle in [tasks.listener.take(), tasks.periodic.take()]
            .into_iter()
            .flatten()
        {
            handle.abort();
        }
    }

    /// Merge with the remote mirror and republish. `None` if a pass was
    /// already running.
    pub async fn full_sync(&self) -> Result<Option<SyncReport>> {
        self.check_disposed()?;
        let Some(_guard) = InFlightGuard::acquire(&self.in_progress) else {
            debug!("Sync already in progress, skipping full sync");
            return Ok(None);
        };

        self.set_status(SyncStatus::Syncing);
        match self.run_full_sync().await {
            Ok(report) => {
                info!(
                    "Full sync complete: {} pulled, {} pushed, {} removed",
                    report.pulled, report.pushed, report.removed
                );
                self.set_status(SyncStatus::Success);
                self.storage.publish(StorageEvent::FullSyncCompleted);
                Ok(Some(report))
            }
            Err(e) => {
                error!("Full sync failed: {}", e);
                self.set_status(SyncStatus::Error(e.to_string()));
                Err(e)
            }
        }
    }

    /// Push keys changed since the last pass. `None` if sync is off or busy.
    pub async fn sync_changes(&self) -> Result<Option<SyncReport>> {
        if !self.is_enabled() || self.disposed.load(Ordering::SeqCst) {
            return Ok(None);
        }
        let Some(_guard) = InFlightGuard::acquire(&self.in_progress) else {
            debug!("Sync already in progress, leaving changes queued");
            return Ok(None);
        };

        let changed: Vec<String> = self.dirty.lock().await.drain().collect();
        if changed.is_empty() {
            return Ok(Some(SyncReport::default()));
        }

        self.set_status(SyncStatus::Syncing);
        match self.run_incremental(&changed).await {
            Ok(report) => {
                debug!("Incremental sync pushed {} keys", report.pushed);
                self.set_status(SyncStatus::Success);
                self.storage.publish(StorageEvent::SyncCompleted);
                Ok(Some(report))
            }
            Err(e) => {
                error!("Incremental sync failed: {}", e);
                self.dirty.lock().await.extend(changed);
                self.set_status(SyncStatus::Error(e.to_string()));
                Err(e)
            }
        }
    }

    async fn run_full_sync(&self) -> Result<SyncReport> {
        let retention = self.storage.options().retention_ms;
        self.storage.cleanup_tombstones(retention).await?;

        // Changes arriving after this point stay queued for the next pass
        self.dirty.lock().await.clear();

        let now = now_ms();
        let state = self.storage.load_sync_state().await?;
        let mode = match state.last_sync_time {
            Some(last) if now - last > self.options.stale_after_ms => {
                warn!(
                    "Last sync was {} days ago, replacing local history with the remote mirror",
                    (now - last) / DAY_MS
                );
                MergeMode::Replace
            }
            _ => MergeMode::Blend,
        };

        let local = self.storage.sync_history().await?;
        let remote_entries = self.remote.get_all().await?;
        let outcome = merge(
            &local,
            decode_remote(remote_entries.clone()),
            self.options.conflict_grace_ms,
            mode,
        );

        let mut report = SyncReport {
            replaced: mode == MergeMode::Replace,
            ..SyncReport::default()
        };
        let applied = match mode {
            MergeMode::Replace => self.storage.replace_history(outcome.merged.clone()).await?,
            MergeMode::Blend => self.storage.apply_inbound(outcome.inbound).await?,
        };
        report.pulled = applied.written + applied.deleted;

        let (entries, stale_keys) =
            self.outbound(&outcome.merged, &remote_entries, now, retention)?;
        (report.pushed, report.oversize) = self.push(entries).await?;
        if !stale_keys.is_empty() {
            self.remote.remove(&stale_keys).await?;
            report.removed = stale_keys.len();
        }

        let state = self.storage.load_sync_state().await?;
        self.storage
            .save_sync_state(&SyncState {
                last_sync_time: Some(now),
                ..state
            })
            .await?;
        Ok(report)
    }

    async fn run_incremental(&self, changed: &[String]) -> Result<SyncReport> {
        let mut entries = Vec::new();
        let mut removed = Vec::new();

        for key in changed {
            match self.resolve_changed(key).await? {
                Outgoing::Publish(record) => entries.push(record.remote_entry()?),
                Outgoing::Remove => removed.push(keys::to_remote_key(key)),
                Outgoing::Skip => {}
            }
        }

        let (pushed, oversize) = self.push(entries).await?;
        let mut report = SyncReport {
            pushed,
            oversize,
            ..SyncReport::default()
        };
        if !removed.is_empty() {
            self.remote.remove(&removed).await?;
            report.removed = removed.len();
        }
        Ok(report)
    }

    /// Look a changed key up through both tiers.
    async fn resolve_changed(&self, key: &str) -> Result<Outgoing> {
        if let Some(id) = keys::item_id(key) {
            return Ok(match self.storage.lookup_item(id).await? {
                Lookup::FoundLocal(item) | Lookup::FoundArchival(item) => {
                    Outgoing::Publish(SyncRecord::Item(item))
                }
                Lookup::Tombstoned(_) => Outgoing::Remove,
                // Nothing stored and no deletion to announce
                Lookup::Absent => Outgoing::Skip,
            });
        }
        if let Some(id) = keys::tombstone_id(key) {
            return Ok(match self.storage.tombstones().live_tombstone(id).await? {
                Some(tombstone) => Outgoing::Publish(SyncRecord::Tombstone(tombstone)),
                None => Outgoing::Remove,
            });
        }
        if let Some(id) = keys::collection_id(key) {
            return Ok(match self.storage.get_collection(id).await? {
                Some(collection) => Outgoing::Publish(SyncRecord::Collection(collection)),
                None => Outgoing::Remove,
            });
        }
        Ok(Outgoing::Skip)
    }

    /// Entries to publish from the merged view, plus remote keys to drop.
    fn outbound(
        &self,
        merged: &HistorySnapshot,
        remote: &HashMap<String, Value>,
        now: i64,
        retention_ms: i64,
    ) -> Result<(Vec<(String, Value)>, Vec<String>)> {
        let mut records = Vec::new();
        let mut stale_keys = Vec::new();

        let mut items: Vec<_> = merged
            .items
            .values()
            .filter(|item| {
                merged
                    .tombstones
                    .get(&item.id)
                    .map_or(true, |t| !t.suppresses(item.last_touched_at))
            })
            .collect();
        items.sort_by(|a, b| {
            b.last_touched_at
                .cmp(&a.last_touched_at)
                .then_with(|| a.id.cmp(&b.id))
        });
        items.truncate(self.options.max_synced_items);
        records.extend(items.into_iter().cloned().map(SyncRecord::Item));
        records.extend(merged.collections.values().cloned().map(SyncRecord::Collection));

        for tombstone in merged.tombstones.values() {
            let item_key = keys::to_remote_key(&keys::item_key(&tombstone.item_id));
            if remote.contains_key(&item_key) {
                stale_keys.push(item_key);
            }
            if tombstone.is_live(now, retention_ms) {
                records.push(SyncRecord::Tombstone(tombstone.clone()));
            } else {
                stale_keys.push(keys::to_remote_key(&keys::tombstone_key(&tombstone.item_id)));
            }
        }

        let mut entries = Vec::with_capacity(records.len());
        for record in records {
            let (key, value) = record.remote_entry()?;
            if remote.get(&key) != Some(&value) {
                entries.push((key, value));
            }
        }
        Ok((entries, stale_keys))
    }

    /// Write entries in chunks. Returns how many were pushed and how many
    /// were too large to send.
    async fn push(&self, entries: Vec<(String, Value)>) -> Result<(usize, usize)> {
        let chunked = chunk_entries(entries, self.remote.max_write_bytes());
        let mut pushed = 0;
        for chunk in chunked.chunks {
            let len = chunk.len();
            self.remote.set_many(chunk).await?;
            pushed += len;
        }
        Ok((pushed, chunked.oversize.len()))
    }

    /// Write, read back and delete a sentinel key.
    async fn probe(&self) -> Result<()> {
        let token = json!(now_ms());
        self.remote
            .set_many(vec![(PROBE_KEY.to_string(), token.clone())])
            .await?;
        let read_back = self.remote.get_all().await?.remove(PROBE_KEY);
        self.remote.remove(&[PROBE_KEY.to_string()]).await?;
        if read_back != Some(token) {
            return Err(AppError::SyncUnavailable(
                "probe value did not read back".to_string(),
            ));
        }
        Ok(())
    }

    fn set_status(&self, status: SyncStatus) {
        self.status.send_replace(status.clone());
        self.storage.publish(StorageEvent::SyncStatusChanged(status));
    }

    fn check_disposed(&self) -> Result<()> {
        if self.disposed.load(Ordering::SeqCst) {
            return Err(AppError::SyncUnavailable("sync service disposed".to_string()));
        }
        Ok(())
    }

    async fn note_changes(self: Arc<Self>, changed: Vec<String>) {
        if !self.is_enabled() {
            return;
        }
        let changed: Vec<String> = changed
            .into_iter()
            .filter(|key| keys::is_history_key(key))
            .collect();
        if changed.is_empty() {
            return;
        }
        self.dirty.lock().await.extend(changed);

        if self.trigger_pending.swap(true, Ordering::SeqCst) {
            return;
        }
        let weak = Arc::downgrade(&self);
        let debounce = self.options.debounce;
        tokio::spawn(async move {
            tokio::time::sleep(debounce).await;
            let Some(service) = weak.upgrade() else {
                return;
            };
            service.trigger_pending.store(false, Ordering::SeqCst);
            if let Err(e) = service.sync_changes().await {
                debug!("Debounced sync failed: {}", e);
            }
        });
    }

    fn spawn_listener(self: &Arc<Self>) -> JoinHandle<()> {
        let mut events = self.storage.subscribe();
        let weak: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(StorageEvent::Changed { keys }) => {
                        let Some(service) = weak.upgrade() else {
                            break;
                        };
                        service.note_changes(keys).await;
                    }
                    Ok(_) => {}
                    Err(RecvError::Lagged(missed)) => {
                        warn!("Missed {} storage events, scheduling a full sync", missed);
                        if let Some(service) = weak.upgrade() {
                            service.resync_needed.store(true, Ordering::SeqCst);
                        }
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        })
    }

    async fn start_periodic(self: &Arc<Self>) {
        let mut tasks = self.tasks.lock().await;
        if let Some(handle) = tasks.periodic.take() {
            handle.abort();
        }

        let weak = Arc::downgrade(self);
        let every = self.options.interval;
        tasks.periodic = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            // The first tick completes immediately
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(service) = weak.upgrade() else {
                    break;
                };
                if !service.is_enabled() {
                    break;
                }
                // Detached so aborting the loop never cancels a running pass
                tokio::spawn(async move { service.periodic_pass().await });
            }
        }));
    }

    /// Push queued changes, or pull from peers when nothing is queued.
    async fn periodic_pass(&self) {
        let queued = !self.dirty.lock().await.is_empty();
        let result = if queued && !self.resync_needed.load(Ordering::SeqCst) {
            self.sync_changes().await
        } else {
            self.resync_needed.store(false, Ordering::SeqCst);
            self.full_sync().await
        };
        if let Err(e) = result {
            debug!("Periodic sync failed: {}", e);
        }
    }
}
