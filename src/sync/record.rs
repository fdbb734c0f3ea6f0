use std::collections::HashMap;

use serde_json::Value;
use tracing::warn;

use crate::error::Result;
use crate::keys;
use crate::models::{CollectionRecord, ItemRecord, Tombstone};
use crate::storage::HistorySnapshot;

/// One mirrored record, decoded from its namespaced key.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncRecord {
    Item(ItemRecord),
    Collection(CollectionRecord),
    Tombstone(Tombstone),
}

impl SyncRecord {
    /// Decode a local-namespace key and its value. Unknown namespaces yield `None`.
    pub fn from_entry(key: &str, value: Value) -> Option<Self> {
        let decoded = if keys::item_id(key).is_some() {
            serde_json::from_value(value).map(SyncRecord::Item)
        } else if keys::collection_id(key).is_some() {
            serde_json::from_value(value).map(SyncRecord::Collection)
        } else if keys::tombstone_id(key).is_some() {
            serde_json::from_value(value).map(SyncRecord::Tombstone)
        } else {
            return None;
        };

        match decoded {
            Ok(record) => Some(record),
            Err(e) => {
                warn!("Skipping malformed synced record {}: {}", key, e);
                None
            }
        }
    }

    /// Local-namespace key.
    pub fn key(&self) -> String {
        match self {
            SyncRecord::Item(item) => keys::item_key(&item.id),
            SyncRecord::Collection(c) => keys::collection_key(&c.id),
            SyncRecord::Tombstone(t) => keys::tombstone_key(&t.item_id),
        }
    }

    pub fn timestamp(&self) -> i64 {
        match self {
            SyncRecord::Item(item) => item.last_touched_at,
            SyncRecord::Collection(c) => c.last_updated_at,
            SyncRecord::Tombstone(t) => t.deleted_at,
        }
    }

    pub fn to_value(&self) -> Result<Value> {
        Ok(match self {
            SyncRecord::Item(item) => serde_json::to_value(item)?,
            SyncRecord::Collection(c) => serde_json::to_value(c)?,
            SyncRecord::Tombstone(t) => serde_json::to_value(t)?,
        })
    }

    /// Remote key and value, ready for the channel.
    pub fn remote_entry(&self) -> Result<(String, Value)> {
        Ok((keys::to_remote_key(&self.key()), self.to_value()?))
    }
}

/// Decode the remote mirror, ignoring keys outside the sync namespace.
pub fn decode_remote(entries: HashMap<String, Value>) -> HistorySnapshot {
    let mut snapshot = HistorySnapshot::default();
    for (remote_key, value) in entries {
        let Some(key) = keys::from_remote_key(&remote_key) else {
            continue;
        };
        match SyncRecord::from_entry(key, value) {
            Some(SyncRecord::Item(item)) => {
                snapshot.items.insert(item.id.clone(), item);
            }
            Some(SyncRecord::Collection(c)) => {
                snapshot.collections.insert(c.id.clone(), c);
            }
            Some(SyncRecord::Tombstone(t)) => {
                snapshot.tombstones.insert(t.item_id.clone(), t);
            }
            None => {}
        }
    }
    snapshot
}
