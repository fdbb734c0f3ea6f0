use serde::{Deserialize, Serialize};

/// A playlist or series the viewer has visited.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CollectionRecord {
    pub id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub source_url: String,
    pub discovered_at: i64,
    pub last_updated_at: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub item_count: Option<u32>,
    #[serde(default)]
    pub ignore_tracking: bool,
}

impl CollectionRecord {
    pub fn new(id: impl Into<String>, discovered_at: i64) -> Self {
        Self {
            id: id.into(),
            title: String::new(),
            source_url: String::new(),
            discovered_at,
            last_updated_at: discovered_at,
            item_count: None,
            ignore_tracking: false,
        }
    }
}
