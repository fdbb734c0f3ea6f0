//! Archival tier: the indexed on-device store holding the full history.

mod repository;
mod schema;

use async_trait::async_trait;

use crate::error::Result;
use crate::models::{CollectionRecord, ItemRecord, Tombstone};

pub use repository::{normalize_title, SqliteArchive};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeleteOptions {
    pub create_tombstone: bool,
    pub deleted_at: i64,
}

impl DeleteOptions {
    pub fn tombstone(deleted_at: i64) -> Self {
        Self {
            create_tombstone: true,
            deleted_at,
        }
    }
}

#[async_trait]
pub trait ArchiveTier: Send + Sync {
    /// Upsert items, keeping whichever copy has the larger `last_touched_at`.
    async fn put_items(&self, items: Vec<ItemRecord>) -> Result<usize>;

    async fn get_item(&self, id: &str) -> Result<Option<ItemRecord>>;

    async fn get_all_items(&self) -> Result<Vec<ItemRecord>>;

    /// Items touched in `[from, to]`, newest first.
    async fn items_between(&self, from: i64, to: i64) -> Result<Vec<ItemRecord>>;

    async fn items_in_category(&self, category_id: &str) -> Result<Vec<ItemRecord>>;

    async fn search_titles(&self, query: &str) -> Result<Vec<ItemRecord>>;

    /// Delete an item and, optionally, record its tombstone in the same transaction.
    async fn delete_item(&self, id: &str, options: DeleteOptions) -> Result<()>;

    async fn put_collections(&self, collections: Vec<CollectionRecord>) -> Result<usize>;

    async fn get_collection(&self, id: &str) -> Result<Option<CollectionRecord>>;

    async fn get_all_collections(&self) -> Result<Vec<CollectionRecord>>;

    async fn delete_collection(&self, id: &str) -> Result<()>;

    async fn get_tombstone(&self, id: &str) -> Result<Option<Tombstone>>;

    async fn all_tombstones(&self) -> Result<Vec<Tombstone>>;

    async fn remove_tombstone(&self, id: &str) -> Result<()>;

    /// Remove tombstones with `deleted_at < cutoff`. Returns how many went.
    async fn purge_tombstones_before(&self, cutoff: i64) -> Result<usize>;

    /// Drop items, collections and tombstones.
    async fn clear_history(&self) -> Result<()>;
}
