//! Logical key namespaces shared by every tier.

pub const ITEM_PREFIX: &str = "item_";
pub const COLLECTION_PREFIX: &str = "collection_";
pub const TOMBSTONE_PREFIX: &str = "deleted_item_";

pub const SETTINGS_KEY: &str = "settings";
pub const STATS_KEY: &str = "stats";
pub const STATS_SYNCED_KEY: &str = "stats_synced";
pub const SYNC_STATE_KEY: &str = "syncSettings";
pub const MIGRATED_KEY: &str = "__migrated__";

/// Marker prepended to namespaced keys on the remote channel.
pub const SYNC_PREFIX: &str = "sync_";

/// Fast-tier keys that never hold history records.
pub const RESERVED_KEYS: [&str; 5] = [
    SETTINGS_KEY,
    STATS_KEY,
    STATS_SYNCED_KEY,
    SYNC_STATE_KEY,
    MIGRATED_KEY,
];

pub fn item_key(id: &str) -> String {
    format!("{ITEM_PREFIX}{id}")
}

pub fn collection_key(id: &str) -> String {
    format!("{COLLECTION_PREFIX}{id}")
}

pub fn tombstone_key(id: &str) -> String {
    format!("{TOMBSTONE_PREFIX}{id}")
}

pub fn item_id(key: &str) -> Option<&str> {
    key.strip_prefix(ITEM_PREFIX)
}

pub fn collection_id(key: &str) -> Option<&str> {
    key.strip_prefix(COLLECTION_PREFIX)
}

pub fn tombstone_id(key: &str) -> Option<&str> {
    key.strip_prefix(TOMBSTONE_PREFIX)
}

/// True for item, collection and tombstone keys.
pub fn is_history_key(key: &str) -> bool {
    key.starts_with(ITEM_PREFIX)
        || key.starts_with(COLLECTION_PREFIX)
        || key.starts_with(TOMBSTONE_PREFIX)
}

pub fn to_remote_key(key: &str) -> String {
    format!("{SYNC_PREFIX}{key}")
}

pub fn from_remote_key(key: &str) -> Option<&str> {
    key.strip_prefix(SYNC_PREFIX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tombstone_keys_are_not_item_keys() {
        let key = tombstone_key("abc");
        assert_eq!(key, "deleted_item_abc");
        assert!(item_id(&key).is_none());
        assert_eq!(tombstone_id(&key), Some("abc"));
    }

    #[test]
    fn remote_keys_round_trip_namespace() {
        let remote = to_remote_key(&collection_key("pl1"));
        assert_eq!(remote, "sync_collection_pl1");
        assert_eq!(from_remote_key(&remote).and_then(collection_id), Some("pl1"));
        assert!(from_remote_key("item_x").is_none());
    }
}
