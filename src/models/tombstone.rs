use serde::{Deserialize, Serialize};

/// Deletion marker keyed by item id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Tombstone {
    pub item_id: String,
    pub deleted_at: i64,
}

impl Tombstone {
    pub fn new(item_id: impl Into<String>, deleted_at: i64) -> Self {
        Self {
            item_id: item_id.into(),
            deleted_at,
        }
    }

    /// A tombstone stays live until it is older than the retention window.
    pub fn is_live(&self, now: i64, retention_ms: i64) -> bool {
        now - self.deleted_at <= retention_ms
    }

    /// Whether a record stamped `touched_at` is hidden by this marker.
    pub fn suppresses(&self, touched_at: i64) -> bool {
        self.deleted_at >= touched_at
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::DAY_MS;

    #[test]
    fn liveness_follows_retention_window() {
        let now = 100 * DAY_MS;
        let retention = 30 * DAY_MS;
        assert!(!Tombstone::new("a", now - 40 * DAY_MS).is_live(now, retention));
        assert!(Tombstone::new("b", now - 10 * DAY_MS).is_live(now, retention));
    }

    #[test]
    fn equal_timestamps_are_suppressed() {
        let marker = Tombstone::new("a", 500);
        assert!(marker.suppresses(500));
        assert!(marker.suppresses(499));
        assert!(!marker.suppresses(501));
    }
}
