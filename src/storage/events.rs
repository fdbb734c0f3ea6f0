use crate::models::SyncStatus;

/// Notifications broadcast by the storage facade.
#[derive(Debug, Clone, PartialEq)]
pub enum StorageEvent {
    /// Keys written or removed by a collaborator.
    Changed { keys: Vec<String> },
    /// History (and possibly settings) wiped.
    Cleared { settings_reset: bool },
    /// An incremental sync pass finished.
    SyncCompleted,
    /// A full sync finished; listeners should reload everything.
    FullSyncCompleted,
    SyncStatusChanged(SyncStatus),
}

impl StorageEvent {
    pub fn touches_prefix(&self, prefix: &str) -> bool {
        match self {
            StorageEvent::Changed { keys } => keys.iter().any(|k| k.starts_with(prefix)),
            StorageEvent::Cleared { .. } | StorageEvent::FullSyncCompleted => true,
            StorageEvent::SyncCompleted | StorageEvent::SyncStatusChanged(_) => false,
        }
    }
}
