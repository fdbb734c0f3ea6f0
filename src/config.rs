use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{AppError, Result};
use crate::models::DAY_MS;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_db_path")]
    pub db_path: String,

    #[serde(default = "default_fast_tier_path")]
    pub fast_tier_path: String,

    #[serde(default = "default_fast_tier_quota")]
    pub fast_tier_quota_bytes: usize,

    #[serde(default = "default_archive_after_days")]
    pub archive_after_days: u32,

    #[serde(default = "default_fast_tier_max_items")]
    pub fast_tier_max_items: usize,

    #[serde(default = "default_tombstone_retention_days")]
    pub tombstone_retention_days: u32,

    #[serde(default = "default_maintenance_interval")]
    pub maintenance_interval_secs: u64,

    #[serde(default)]
    pub sync: SyncConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    #[serde(default)]
    pub enabled: bool,

    /// Shared folder used as the remote channel by the command-line tool.
    pub remote_dir: Option<String>,

    #[serde(default = "default_sync_interval")]
    pub interval_secs: u64,

    /// How much newer a remote record must be before it replaces the local one.
    #[serde(default = "default_conflict_grace_ms")]
    pub conflict_grace_ms: i64,

    /// Per-write payload ceiling of the remote channel.
    #[serde(default = "default_chunk_bytes")]
    pub chunk_bytes: usize,

    #[serde(default = "default_stale_after_days")]
    pub stale_after_days: u32,

    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,

    #[serde(default = "default_max_synced_items")]
    pub max_synced_items: usize,
}

fn data_dir() -> PathBuf {
    let data_dir = dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("watchtrail");
    std::fs::create_dir_all(&data_dir).ok();
    data_dir
}

fn default_db_path() -> String {
    data_dir().join("archive.db").to_string_lossy().to_string()
}

fn default_fast_tier_path() -> String {
    data_dir().join("fast.json").to_string_lossy().to_string()
}

fn default_fast_tier_quota() -> usize {
    5 * 1024 * 1024
}

fn default_archive_after_days() -> u32 {
    7
}

fn default_fast_tier_max_items() -> usize {
    500
}

fn default_tombstone_retention_days() -> u32 {
    30
}

fn default_maintenance_interval() -> u64 {
    24 * 60 * 60
}

fn default_sync_interval() -> u64 {
    5 * 60
}

fn default_conflict_grace_ms() -> i64 {
    1000
}

fn default_chunk_bytes() -> usize {
    8000
}

fn default_stale_after_days() -> u32 {
    29
}

fn default_debounce_ms() -> u64 {
    2000
}

fn default_max_synced_items() -> usize {
    400
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            remote_dir: None,
            interval_secs: default_sync_interval(),
            conflict_grace_ms: default_conflict_grace_ms(),
            chunk_bytes: default_chunk_bytes(),
            stale_after_days: default_stale_after_days(),
            debounce_ms: default_debounce_ms(),
            max_synced_items: default_max_synced_items(),
        }
    }
}

impl SyncConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs.max(1))
    }

    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    pub fn stale_after_ms(&self) -> i64 {
        i64::from(self.stale_after_days) * DAY_MS
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            fast_tier_path: default_fast_tier_path(),
            fast_tier_quota_bytes: default_fast_tier_quota(),
            archive_after_days: default_archive_after_days(),
            fast_tier_max_items: default_fast_tier_max_items(),
            tombstone_retention_days: default_tombstone_retention_days(),
            maintenance_interval_secs: default_maintenance_interval(),
            sync: SyncConfig::default(),
        }
    }
}

impl Config {
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path())
    }

    /// Read `path`, writing the defaults there first if it does not exist.
    pub fn load_from(path: &Path) -> Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file {}", path.display()))?;
            let config: Config = toml::from_str(&content)?;
            Ok(config)
        } else {
            let config = Config::default();
            config.save_to(path)?;
            Ok(config)
        }
    }

    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_path())
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create config directory {}", parent.display()))?;
        }
        let content = toml::to_string_pretty(self)
            .map_err(|e| AppError::Config(e.to_string()))?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file {}", path.display()))?;
        Ok(())
    }

    pub fn config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("watchtrail")
            .join("config.toml")
    }

    pub fn retention_ms(&self) -> i64 {
        i64::from(self.tombstone_retention_days) * DAY_MS
    }

    pub fn archive_after_ms(&self) -> i64 {
        i64::from(self.archive_after_days) * DAY_MS
    }

    pub fn maintenance_interval(&self) -> Duration {
        Duration::from_secs(self.maintenance_interval_secs.max(1))
    }
}
