use std::sync::OnceLock;

use async_trait::async_trait;
use regex::Regex;
use rusqlite::{params, OptionalExtension, Row};
use tokio_rusqlite::Connection;

use crate::error::Result;
use crate::models::{CollectionRecord, ItemRecord, Tombstone};

use super::schema::SCHEMA;
use super::{ArchiveTier, DeleteOptions};

const ITEM_COLUMNS: &str = "id, title, source_url, position_seconds, total_duration_seconds, \
     last_touched_at, is_short_form, category_id, category_name, thumbnail_url";

const COLLECTION_COLUMNS: &str =
    "id, title, source_url, discovered_at, last_updated_at, item_count, ignore_tracking";

static NON_WORD: OnceLock<Regex> = OnceLock::new();

/// Lowercase, strip punctuation and collapse whitespace so title lookups
/// ignore formatting differences.
pub fn normalize_title(title: &str) -> String {
    let re = NON_WORD.get_or_init(|| Regex::new(r"[^\p{L}\p{N}]+").expect("static regex"));
    re.replace_all(&title.to_lowercase(), " ").trim().to_string()
}

pub struct SqliteArchive {
    conn: Connection,
}

impl SqliteArchive {
    pub async fn open(db_path: &str) -> Result<Self> {
        let conn = Connection::open(db_path).await?;
        Self::init(conn).await
    }

    pub async fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().await?;
        Self::init(conn).await
    }

    async fn init(conn: Connection) -> Result<Self> {
        conn.call(|conn| {
            conn.execute_batch(SCHEMA)?;
            Ok(())
        })
        .await?;

        Ok(Self { conn })
    }

    async fn query_items(&self, sql: String, args: Vec<rusqlite::types::Value>) -> Result<Vec<ItemRecord>> {
        let items = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(&sql)?;
                let items = stmt
                    .query_map(rusqlite::params_from_iter(args), item_from_row)?
                    .collect::<std::result::Result<Vec<_>, _>>()?;
                Ok(items)
            })
            .await?;
        Ok(items)
    }
}

#[async_trait]
impl ArchiveTier for SqliteArchive {
    async fn put_items(&self, items: Vec<ItemRecord>) -> Result<usize> {
        if items.is_empty() {
            return Ok(0);
        }
        let written = self
            .conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                let mut written = 0;
                {
                    let mut stmt = tx.prepare(
                        r#"INSERT INTO items (id, title, normalized_title, source_url, position_seconds,
                                              total_duration_seconds, last_touched_at, is_short_form,
                                              category_id, category_name, thumbnail_url)
                           VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
                           ON CONFLICT(id) DO UPDATE SET
                               title = excluded.title,
                               normalized_title = excluded.normalized_title,
                               source_url = excluded.source_url,
                               position_seconds = excluded.position_seconds,
                               total_duration_seconds = excluded.total_duration_seconds,
                               last_touched_at = excluded.last_touched_at,
                               is_short_form = excluded.is_short_form,
                               category_id = excluded.category_id,
                               category_name = excluded.category_name,
                               thumbnail_url = excluded.thumbnail_url,
                               archived_at = datetime('now')
                           WHERE excluded.last_touched_at >= items.last_touched_at"#,
                    )?;
                    for item in &items {
                        written += stmt.execute(params![
                            item.id,
                            item.title,
                            normalize_title(&item.title),
                            item.source_url,
                            item.position_seconds,
                            item.total_duration_seconds,
                            item.last_touched_at,
                            item.is_short_form,
                            item.category_id,
                            item.category_name,
                            item.thumbnail_url,
                        ])?;
                    }
                }
                tx.commit()?;
                Ok(written)
            })
            .await?;
        Ok(written)
    }

    async fn get_item(&self, id: &str) -> Result<Option<ItemRecord>> {
        let id = id.to_string();
        let item = self
            .conn
            .call(move |conn| {
                let mut stmt =
                    conn.prepare(&format!("SELECT {ITEM_COLUMNS} FROM items WHERE id = ?1"))?;
                let item = stmt.query_row(params![id], item_from_row).optional()?;
                Ok(item)
            })
            .await?;
        Ok(item)
    }

    async fn get_all_items(&self) -> Result<Vec<ItemRecord>> {
        self.query_items(
            format!("SELECT {ITEM_COLUMNS} FROM items ORDER BY last_touched_at DESC"),
            Vec::new(),
        )
        .await
    }

    async fn items_between(&self, from: i64, to: i64) -> Result<Vec<ItemRecord>> {
        self.query_items(
            format!(
                "SELECT {ITEM_COLUMNS} FROM items WHERE last_touched_at BETWEEN ?1 AND ?2 \
                 ORDER BY last_touched_at DESC"
            ),
            vec![from.into(), to.into()],
        )
        .await
    }

    async fn items_in_category(&self, category_id: &str) -> Result<Vec<ItemRecord>> {
        self.query_items(
            format!(
                "SELECT {ITEM_COLUMNS} FROM items WHERE category_id = ?1 \
                 ORDER BY last_touched_at DESC"
            ),
            vec![category_id.to_string().into()],
        )
        .await
    }

    async fn search_titles(&self, query: &str) -> Result<Vec<ItemRecord>> {
        let needle = normalize_title(query);
        if needle.is_empty() {
            return Ok(Vec::new());
        }
        let pattern = format!(
            "%{}%",
            needle.replace('\\', "\\\\").replace('%', "\\%").replace('_', "\\_")
        );
        self.query_items(
            format!(
                "SELECT {ITEM_COLUMNS} FROM items WHERE normalized_title LIKE ?1 ESCAPE '\\' \
                 ORDER BY last_touched_at DESC"
            ),
            vec![pattern.into()],
        )
        .await
    }

    async fn delete_item(&self, id: &str, options: DeleteOptions) -> Result<()> {
        let id = id.to_string();
        self.conn
            .call(move |conn| {
                // Both statements commit together or not at all
                let tx = conn.transaction()?;
                tx.execute("DELETE FROM items WHERE id = ?1", params![id])?;
                if options.create_tombstone {
                    tx.execute(
                        r#"INSERT INTO deleted_items (item_id, deleted_at) VALUES (?1, ?2)
                           ON CONFLICT(item_id) DO UPDATE SET
                               deleted_at = MAX(deleted_items.deleted_at, excluded.deleted_at)"#,
                        params![id, options.deleted_at],
                    )?;
                }
                tx.commit()?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    async fn put_collections(&self, collections: Vec<CollectionRecord>) -> Result<usize> {
        if collections.is_empty() {
            return Ok(0);
        }
        let written = self
            .conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                let mut written = 0;
                {
                    let mut stmt = tx.prepare(
                        r#"INSERT INTO collections (id, title, source_url, discovered_at,
                                                    last_updated_at, item_count, ignore_tracking)
                           VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                           ON CONFLICT(id) DO UPDATE SET
                               title = excluded.title,
                               source_url = excluded.source_url,
                               discovered_at = MIN(collections.discovered_at, excluded.discovered_at),
                               last_updated_at = excluded.last_updated_at,
                               item_count = excluded.item_count,
                               ignore_tracking = excluded.ignore_tracking
                           WHERE excluded.last_updated_at >= collections.last_updated_at"#,
                    )?;
                    for c in &collections {
                        written += stmt.execute(params![
                            c.id,
                            c.title,
                            c.source_url,
                            c.discovered_at,
                            c.last_updated_at,
                            c.item_count,
                            c.ignore_tracking,
                        ])?;
                    }
                }
                tx.commit()?;
                Ok(written)
            })
            .await?;
        Ok(written)
    }

    async fn get_collection(&self, id: &str) -> Result<Option<CollectionRecord>> {
        let id = id.to_string();
        let collection = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {COLLECTION_COLUMNS} FROM collections WHERE id = ?1"
                ))?;
                let collection = stmt.query_row(params![id], collection_from_row).optional()?;
                Ok(collection)
            })
            .await?;
        Ok(collection)
    }

    async fn get_all_collections(&self) -> Result<Vec<CollectionRecord>> {
        let collections = self
            .conn
            .call(|conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {COLLECTION_COLUMNS} FROM collections ORDER BY last_updated_at DESC"
                ))?;
                let collections = stmt
                    .query_map([], collection_from_row)?
                    .collect::<std::result::Result<Vec<_>, _>>()?;
                Ok(collections)
            })
            .await?;
        Ok(collections)
    }

    async fn delete_collection(&self, id: &str) -> Result<()> {
        let id = id.to_string();
        self.conn
            .call(move |conn| {
                conn.execute("DELETE FROM collections WHERE id = ?1", params![id])?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    async fn get_tombstone(&self, id: &str) -> Result<Option<Tombstone>> {
        let id = id.to_string();
        let tombstone = self
            .conn
            .call(move |conn| {
                let tombstone = conn
                    .query_row(
                        "SELECT item_id, deleted_at FROM deleted_items WHERE item_id = ?1",
                        params![id],
                        tombstone_from_row,
                    )
                    .optional()?;
                Ok(tombstone)
            })
            .await?;
        Ok(tombstone)
    }

    async fn all_tombstones(&self) -> Result<Vec<Tombstone>> {
        let tombstones = self
            .conn
            .call(|conn| {
                let mut stmt = conn.prepare(
                    "SELECT item_id, deleted_at FROM deleted_items ORDER BY deleted_at DESC",
                )?;
                let tombstones = stmt
                    .query_map([], tombstone_from_row)?
                    .collect::<std::result::Result<Vec<_>, _>>()?;
                Ok(tombstones)
            })
            .await?;
        Ok(tombstones)
    }

    async fn remove_tombstone(&self, id: &str) -> Result<()> {
        let id = id.to_string();
        self.conn
            .call(move |conn| {
                conn.execute("DELETE FROM deleted_items WHERE item_id = ?1", params![id])?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    async fn purge_tombstones_before(&self, cutoff: i64) -> Result<usize> {
        let purged = self
            .conn
            .call(move |conn| {
                let purged =
                    conn.execute("DELETE FROM deleted_items WHERE deleted_at < ?1", params![cutoff])?;
                Ok(purged)
            })
            .await?;
        Ok(purged)
    }

    async fn clear_history(&self) -> Result<()> {
        self.conn
            .call(|conn| {
                conn.execute_batch(
                    "DELETE FROM items; DELETE FROM collections; DELETE FROM deleted_items;",
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }
}

fn item_from_row(row: &Row) -> rusqlite::Result<ItemRecord> {
    Ok(ItemRecord {
        id: row.get(0)?,
        title: row.get(1)?,
        source_url: row.get(2)?,
        position_seconds: row.get(3)?,
        total_duration_seconds: row.get(4)?,
        last_touched_at: row.get(5)?,
        is_short_form: row.get::<_, i64>(6)? != 0,
        category_id: row.get(7)?,
        category_name: row.get(8)?,
        thumbnail_url: row.get(9)?,
    })
}

fn collection_from_row(row: &Row) -> rusqlite::Result<CollectionRecord> {
    Ok(CollectionRecord {
        id: row.get(0)?,
        title: row.get(1)?,
        source_url: row.get(2)?,
        discovered_at: row.get(3)?,
        last_updated_at: row.get(4)?,
        item_count: row.get(5)?,
        ignore_tracking: row.get::<_, i64>(6)? != 0,
    })
}

fn tombstone_from_row(row: &Row) -> rusqlite::Result<Tombstone> {
    Ok(Tombstone {
        item_id: row.get(0)?,
        deleted_at: row.get(1)?,
    })
}
