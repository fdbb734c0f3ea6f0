use serde::Deserialize;

use crate::models::ItemRecord;

/// Progress entry written by early releases under a bare id key.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct LegacyProgress {
    time: f64,
    #[serde(default)]
    duration: f64,
    timestamp: i64,
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    url: Option<String>,
    #[serde(default)]
    is_short: bool,
}

impl LegacyProgress {
    pub(crate) fn into_item(self, id: &str) -> ItemRecord {
        let mut item = ItemRecord::new(id, self.timestamp).with_progress(self.time, self.duration);
        item.title = self.title.unwrap_or_default();
        item.source_url = self.url.unwrap_or_default();
        item.is_short_form = self.is_short;
        item.normalized()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn converts_legacy_shape() {
        let legacy: LegacyProgress = serde_json::from_str(
            r#"{"time": 75.5, "duration": 60, "timestamp": 1700000000000, "title": "Old"}"#,
        )
        .unwrap();
        let item = legacy.into_item("abc");
        assert_eq!(item.id, "abc");
        assert_eq!(item.position_seconds, 60.0);
        assert_eq!(item.title, "Old");
        assert_eq!(item.last_touched_at, 1_700_000_000_000);
    }

    #[test]
    fn rejects_modern_records() {
        let modern = serde_json::json!({"id": "x", "positionSeconds": 1, "lastTouchedAt": 2});
        assert!(serde_json::from_value::<LegacyProgress>(modern).is_err());
    }
}
