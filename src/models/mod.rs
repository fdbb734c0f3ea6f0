mod collection;
mod item;
mod settings;
mod stats;
mod tombstone;

pub use collection::CollectionRecord;
pub use item::{ItemRecord, COMPLETION_THRESHOLD};
pub use settings::{Settings, SyncState, SyncStatus};
pub use stats::{StatsCounters, StatsSnapshot, DAILY_BUCKETS, HOURLY_SLOTS};
pub use tombstone::Tombstone;

/// Milliseconds in one day.
pub const DAY_MS: i64 = 24 * 60 * 60 * 1000;

/// Current wall-clock time in epoch milliseconds.
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
