use serde::{Deserialize, Serialize};

/// Fraction of the duration after which an item counts as completed.
pub const COMPLETION_THRESHOLD: f64 = 0.9;

/// Viewing progress for one watched unit, long-form or short-form.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ItemRecord {
    pub id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub source_url: String,
    #[serde(default)]
    pub position_seconds: f64,
    #[serde(default)]
    pub total_duration_seconds: f64,
    pub last_touched_at: i64,
    #[serde(default)]
    pub is_short_form: bool,
    #[serde(default)]
    pub category_id: String,
    #[serde(default)]
    pub category_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thumbnail_url: Option<String>,
}

impl ItemRecord {
    pub fn new(id: impl Into<String>, last_touched_at: i64) -> Self {
        Self {
            id: id.into(),
            title: String::new(),
            source_url: String::new(),
            position_seconds: 0.0,
            total_duration_seconds: 0.0,
            last_touched_at,
            is_short_form: false,
            category_id: String::new(),
            category_name: String::new(),
            thumbnail_url: None,
        }
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = title.into();
        self
    }

    pub fn with_progress(mut self, position_seconds: f64, total_duration_seconds: f64) -> Self {
        self.position_seconds = position_seconds;
        self.total_duration_seconds = total_duration_seconds;
        self
    }

    /// Clamp the position into `[0, duration]` once the duration is known.
    pub fn normalized(mut self) -> Self {
        if !self.position_seconds.is_finite() || self.position_seconds < 0.0 {
            self.position_seconds = 0.0;
        }
        if !self.total_duration_seconds.is_finite() || self.total_duration_seconds < 0.0 {
            self.total_duration_seconds = 0.0;
        }
        if self.total_duration_seconds > 0.0 && self.position_seconds > self.total_duration_seconds
        {
            self.position_seconds = self.total_duration_seconds;
        }
        self
    }

    pub fn watched_fraction(&self) -> Option<f64> {
        (self.total_duration_seconds > 0.0)
            .then(|| self.position_seconds / self.total_duration_seconds)
    }

    pub fn is_completed(&self) -> bool {
        self.watched_fraction()
            .is_some_and(|f| f >= COMPLETION_THRESHOLD)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalized_clamps_position_to_duration() {
        let item = ItemRecord::new("a", 1).with_progress(130.0, 120.0).normalized();
        assert_eq!(item.position_seconds, 120.0);

        let unknown = ItemRecord::new("b", 1).with_progress(42.0, 0.0).normalized();
        assert_eq!(unknown.position_seconds, 42.0);
    }

    #[test]
    fn completion_uses_ninety_percent() {
        assert!(ItemRecord::new("a", 1).with_progress(91.0, 100.0).is_completed());
        assert!(!ItemRecord::new("a", 1).with_progress(50.0, 100.0).is_completed());
        assert!(!ItemRecord::new("a", 1).with_progress(50.0, 0.0).is_completed());
    }

    #[test]
    fn deserializes_camel_case_with_missing_optionals() {
        let item: ItemRecord = serde_json::from_str(
            r#"{"id":"v1","positionSeconds":42,"lastTouchedAt":1000,"isShortForm":true}"#,
        )
        .unwrap();
        assert_eq!(item.position_seconds, 42.0);
        assert!(item.is_short_form);
        assert!(item.thumbnail_url.is_none());
        assert_eq!(item.title, "");
    }
}
