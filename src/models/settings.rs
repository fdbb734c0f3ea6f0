use serde::{Deserialize, Serialize};

/// Flat user configuration written by the settings layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Settings {
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,
    #[serde(default = "default_page_size")]
    pub page_size: u32,
    #[serde(default = "default_overlay_position")]
    pub overlay_position: String,
    #[serde(default = "default_overlay_opacity")]
    pub overlay_opacity: f32,
    #[serde(default)]
    pub sync_enabled: bool,
    #[serde(default)]
    pub debug: bool,
    /// Keys this build does not know about, preserved on round trips.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

fn default_retention_days() -> u32 {
    30
}

fn default_page_size() -> u32 {
    20
}

fn default_overlay_position() -> String {
    "bottom-right".to_string()
}

fn default_overlay_opacity() -> f32 {
    0.9
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            retention_days: default_retention_days(),
            page_size: default_page_size(),
            overlay_position: default_overlay_position(),
            overlay_opacity: default_overlay_opacity(),
            sync_enabled: false,
            debug: false,
            extra: serde_json::Map::new(),
        }
    }
}

/// Persisted state of the synchronization service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncState {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_sync_time: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "state", content = "message")]
pub enum SyncStatus {
    #[default]
    Disabled,
    Initializing,
    Syncing,
    Success,
    Error(String),
    NotAvailable,
}

impl SyncStatus {
    pub fn is_error(&self) -> bool {
        matches!(self, SyncStatus::Error(_))
    }
}
