use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::config::Config;
use crate::db::{ArchiveTier, SqliteArchive};
use crate::error::Result;
use crate::fast::{FastTier, FileFastTier};
use crate::keys;
use crate::models::Settings;
use crate::stats::StatsMaintainer;
use crate::storage::{HybridStorage, StorageOptions};
use crate::sync::{DirRemote, RemoteChannel, SyncOptions, SyncService};
use crate::tombstones::CleanupReport;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct MaintenanceReport {
    pub tombstones: CleanupReport,
    pub archived: usize,
}

/// Everything a host needs, wired together.
pub struct Engine {
    pub storage: HybridStorage,
    pub stats: Arc<StatsMaintainer>,
    pub sync: Option<Arc<SyncService>>,
    maintenance: Option<JoinHandle<()>>,
}

impl Engine {
    pub async fn open(config: &Config) -> Result<Self> {
        let fast = Arc::new(FileFastTier::open(&config.fast_tier_path, config.fast_tier_quota_bytes).await?);
        let archive = Arc::new(SqliteArchive::open(&config.db_path).await?);

        let remote: Option<Arc<dyn RemoteChannel>> = match &config.sync.remote_dir {
            Some(dir) => Some(Arc::new(DirRemote::open(dir, config.sync.chunk_bytes).await?)),
            None => None,
        };

        let engine = Self::with_tiers(
            fast,
            archive,
            remote,
            StorageOptions::from(config),
            SyncOptions::from(&config.sync),
        )
        .await?;

        if let Some(sync) = &engine.sync {
            if config.sync.enabled && !sync.is_enabled() {
                if let Err(e) = sync.enable_sync().await {
                    warn!("Could not enable sync: {}", e);
                }
            }
        }
        Ok(engine)
    }

    /// Assemble an engine over caller-supplied tiers.
    ///
    /// Saved settings override `storage_options` for tombstone retention, and
    /// turn sync on when `sync_enabled` is set and a remote is given.
    /// Maintenance is not started; see [`Engine::start_maintenance`].
    pub async fn with_tiers(
        fast: Arc<dyn FastTier>,
        archive: Arc<dyn ArchiveTier>,
        remote: Option<Arc<dyn RemoteChannel>>,
        storage_options: StorageOptions,
        sync_options: SyncOptions,
    ) -> Result<Self> {
        let saved = saved_settings(fast.as_ref()).await?;
        let storage_options = match &saved {
            Some(settings) => storage_options.with_settings(settings),
            None => storage_options,
        };

        let storage = HybridStorage::new(fast, archive, storage_options);
        storage.init().await?;

        let stats = Arc::new(StatsMaintainer::new(storage.clone()));

        let sync = match remote {
            Some(remote) => {
                let service = SyncService::new(storage.clone(), remote, sync_options);
                service.init().await?;
                if saved.as_ref().is_some_and(|s| s.sync_enabled) && !service.is_enabled() {
                    if let Err(e) = service.enable_sync().await {
                        warn!("Sync is on in settings but could not start: {}", e);
                    }
                }
                Some(service)
            }
            None => None,
        };

        Ok(Self {
            storage,
            stats,
            sync,
            maintenance: None,
        })
    }

    /// Tombstone sweep followed by archival migration.
    pub async fn run_maintenance(&self) -> Result<MaintenanceReport> {
        let retention = self.storage.options().retention_ms;
        let tombstones = self.storage.cleanup_tombstones(retention).await?;
        let archived = match self.storage.migrate_aged_items().await {
            Ok(n) => n,
            Err(e) => {
                warn!("Archival migration skipped: {}", e);
                0
            }
        };
        Ok(MaintenanceReport {
            tombstones,
            archived,
        })
    }

    /// Run maintenance now and then on every `every` tick until shutdown.
    pub fn start_maintenance(&mut self, every: Duration) {
        if let Some(handle) = self.maintenance.take() {
            handle.abort();
        }
        let storage = self.storage.clone();
        self.maintenance = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            loop {
                ticker.tick().await;
                let retention = storage.options().retention_ms;
                if let Err(e) = storage.cleanup_tombstones(retention).await {
                    warn!("Tombstone sweep failed: {}", e);
                }
                if let Err(e) = storage.migrate_aged_items().await {
                    warn!("Archival migration failed: {}", e);
                }
            }
        }));
    }

    pub async fn shutdown(mut self) {
        if let Some(handle) = self.maintenance.take() {
            handle.abort();
        }
        if let Some(sync) = self.sync.take() {
            sync.dispose().await;
        }
        info!("Engine stopped");
    }
}

async fn saved_settings(fast: &dyn FastTier) -> Result<Option<Settings>> {
    let Some(value) = fast.get(keys::SETTINGS_KEY).await? else {
        return Ok(None);
    };
    match serde_json::from_value(value) {
        Ok(settings) => Ok(Some(settings)),
        Err(e) => {
            warn!("Ignoring malformed saved settings: {}", e);
            Ok(None)
        }
    }
}
