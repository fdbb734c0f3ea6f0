use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Number of calendar days kept in the daily histogram.
pub const DAILY_BUCKETS: usize = 7;
pub const HOURLY_SLOTS: usize = 24;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatsCounters {
    pub items: u64,
    pub short_form: u64,
    pub total_duration_seconds: f64,
    pub completed: u64,
}

/// Aggregates maintained incrementally so analytics views avoid full scans.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatsSnapshot {
    pub total_watch_seconds: f64,
    /// Local calendar date (`YYYY-MM-DD`) to seconds watched.
    pub daily: BTreeMap<String, f64>,
    pub hourly: [f64; HOURLY_SLOTS],
    pub counters: StatsCounters,
    pub last_updated_at: i64,
}

impl Default for StatsSnapshot {
    fn default() -> Self {
        Self {
            total_watch_seconds: 0.0,
            daily: BTreeMap::new(),
            hourly: [0.0; HOURLY_SLOTS],
            counters: StatsCounters::default(),
            last_updated_at: 0,
        }
    }
}

impl StatsSnapshot {
    /// Add seconds to a daily bucket, then drop the oldest dates beyond the bound.
    pub fn add_daily(&mut self, date: String, seconds: f64) {
        *self.daily.entry(date).or_insert(0.0) += seconds;
        while self.daily.len() > DAILY_BUCKETS {
            self.daily.pop_first();
        }
    }

    pub fn add_hourly(&mut self, hour: usize, seconds: f64) {
        if let Some(slot) = self.hourly.get_mut(hour) {
            *slot += seconds;
        }
    }
}
