//! Aggregate viewing statistics, rebuilt once and then maintained by deltas.

use chrono::{Local, TimeZone, Timelike};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::error::Result;
use crate::keys;
use crate::models::{now_ms, ItemRecord, StatsSnapshot};
use crate::storage::HybridStorage;

/// What the viewing session knows about the update it is reporting.
#[derive(Debug, Clone, Copy, Default)]
pub struct StatsMeta {
    /// First progress report for this item.
    pub is_new_video: bool,
    pub is_short_form: bool,
    /// Duration to add to `counters.total_duration_seconds`, if known.
    pub duration_seconds: Option<f64>,
    /// The item just crossed the completion threshold.
    pub crossed_completed: bool,
}

pub struct StatsMaintainer {
    storage: HybridStorage,
    // Serializes read-modify-write of the persisted snapshot
    lock: Mutex<()>,
}

impl StatsMaintainer {
    pub fn new(storage: HybridStorage) -> Self {
        Self {
            storage,
            lock: Mutex::new(()),
        }
    }

    pub async fn get_stats(&self) -> Result<StatsSnapshot> {
        let _guard = self.lock.lock().await;
        self.load_or_rebuild().await
    }

    pub async fn update_stats(&self, delta_seconds: f64, when_ms: i64, meta: StatsMeta) -> Result<()> {
        let _guard = self.lock.lock().await;
        let mut stats = self.load_or_rebuild().await?;

        if delta_seconds.is_finite() && delta_seconds > 0.0 {
            stats.total_watch_seconds += delta_seconds;
            if let Some((date, hour)) = local_bucket(when_ms) {
                stats.add_daily(date, delta_seconds);
                stats.add_hourly(hour, delta_seconds);
            }
        }

        if meta.is_new_video {
            stats.counters.items += 1;
            if meta.is_short_form {
                stats.counters.short_form += 1;
            }
        }
        if let Some(duration) = meta.duration_seconds.filter(|d| d.is_finite() && *d > 0.0) {
            stats.counters.total_duration_seconds += duration;
        }
        if meta.crossed_completed {
            stats.counters.completed += 1;
        }

        stats.last_updated_at = now_ms();
        self.storage.write_state(keys::STATS_KEY, &stats).await
    }

    async fn load_or_rebuild(&self) -> Result<StatsSnapshot> {
        let synced: bool = self
            .storage
            .read_state(keys::STATS_SYNCED_KEY)
            .await?
            .unwrap_or(false);
        if synced {
            if let Some(stats) = self.storage.read_state(keys::STATS_KEY).await? {
                return Ok(stats);
            }
            debug!("Stats flag set but snapshot missing, rebuilding");
        }

        let items = self.storage.get_all_items().await?;
        let stats = rebuild(&items);
        self.storage.write_state(keys::STATS_KEY, &stats).await?;
        self.storage.write_state(keys::STATS_SYNCED_KEY, &true).await?;
        info!("Rebuilt stats from {} items", items.len());
        Ok(stats)
    }
}

/// Full-scan snapshot over merged items.
pub fn rebuild(items: &[ItemRecord]) -> StatsSnapshot {
    let mut stats = StatsSnapshot::default();
    for item in items {
        stats.total_watch_seconds += item.position_seconds;
        stats.counters.items += 1;
        if item.is_short_form {
            stats.counters.short_form += 1;
        }
        stats.counters.total_duration_seconds += item.total_duration_seconds;
        if item.is_completed() {
            stats.counters.completed += 1;
        }
        if let Some((date, hour)) = local_bucket(item.last_touched_at) {
            stats.add_daily(date, item.position_seconds);
            stats.add_hourly(hour, item.position_seconds);
        }
    }
    stats.last_updated_at = now_ms();
    stats
}

/// Local calendar date and hour of an epoch-ms instant.
fn local_bucket(epoch_ms: i64) -> Option<(String, usize)> {
    let when = Local.timestamp_millis_opt(epoch_ms).single()?;
    Some((when.format("%Y-%m-%d").to_string(), when.hour() as usize))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::db::SqliteArchive;
    use crate::fast::MemoryFastTier;
    use crate::models::{DAILY_BUCKETS, DAY_MS};
    use crate::storage::StorageOptions;

    async fn maintainer() -> (HybridStorage, StatsMaintainer) {
        let storage = HybridStorage::new(
            Arc::new(MemoryFastTier::default()),
            Arc::new(SqliteArchive::open_in_memory().await.unwrap()),
            StorageOptions::default(),
        );
        (storage.clone(), StatsMaintainer::new(storage))
    }

    fn noon(year: i32, month: u32, day: u32) -> i64 {
        Local
            .with_ymd_and_hms(year, month, day, 12, 0, 0)
            .single()
            .unwrap()
            .timestamp_millis()
    }

    #[tokio::test]
    async fn rebuilds_once_then_serves_snapshot() {
        let (storage, stats) = maintainer().await;
        let now = now_ms();
        storage
            .set_item("a", ItemRecord::new("a", now).with_progress(95.0, 100.0))
            .await
            .unwrap();
        let mut short = ItemRecord::new("b", now).with_progress(10.0, 60.0);
        short.is_short_form = true;
        storage.set_item("b", short).await.unwrap();

        let first = stats.get_stats().await.unwrap();
        assert_eq!(first.counters.items, 2);
        assert_eq!(first.counters.short_form, 1);
        assert_eq!(first.counters.completed, 1);
        assert_eq!(first.total_watch_seconds, 105.0);
        assert_eq!(first.hourly.iter().sum::<f64>(), 105.0);

        // Later writes do not trigger a rescan
        storage
            .set_item("c", ItemRecord::new("c", now).with_progress(50.0, 100.0))
            .await
            .unwrap();
        assert_eq!(stats.get_stats().await.unwrap().counters.items, 2);

        storage.invalidate_stats().await.unwrap();
        assert_eq!(stats.get_stats().await.unwrap().counters.items, 3);
    }

    #[tokio::test]
    async fn deltas_update_buckets_and_counters() {
        let (_storage, stats) = maintainer().await;
        let when = noon(2024, 5, 10);

        stats
            .update_stats(
                30.0,
                when,
                StatsMeta {
                    is_new_video: true,
                    is_short_form: true,
                    duration_seconds: Some(45.0),
                    crossed_completed: false,
                },
            )
            .await
            .unwrap();
        stats
            .update_stats(
                15.0,
                when,
                StatsMeta {
                    crossed_completed: true,
                    ..StatsMeta::default()
                },
            )
            .await
            .unwrap();

        let snapshot = stats.get_stats().await.unwrap();
        assert_eq!(snapshot.total_watch_seconds, 45.0);
        assert_eq!(snapshot.daily.get("2024-05-10"), Some(&45.0));
        assert_eq!(snapshot.hourly[12], 45.0);
        assert_eq!(snapshot.counters.items, 1);
        assert_eq!(snapshot.counters.short_form, 1);
        assert_eq!(snapshot.counters.total_duration_seconds, 45.0);
        assert_eq!(snapshot.counters.completed, 1);
    }

    #[tokio::test]
    async fn daily_histogram_keeps_latest_seven_dates() {
        let (_storage, stats) = maintainer().await;
        let start = noon(2024, 1, 1);

        for day in 0..10 {
            stats
                .update_stats(60.0, start + day * DAY_MS, StatsMeta::default())
                .await
                .unwrap();
        }

        let snapshot = stats.get_stats().await.unwrap();
        assert_eq!(snapshot.daily.len(), DAILY_BUCKETS);
        let dates: Vec<&str> = snapshot.daily.keys().map(String::as_str).collect();
        assert_eq!(dates.first(), Some(&"2024-01-04"));
        assert_eq!(dates.last(), Some(&"2024-01-10"));
        assert_eq!(snapshot.hourly.len(), 24);
    }
}
