//! JSON export and import of the full history.

use std::path::Path;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{AppError, Result};
use crate::models::{CollectionRecord, ItemRecord, Settings, StatsSnapshot};
use crate::stats::StatsMaintainer;
use crate::storage::{HybridStorage, WriteOutcome};

pub const EXPORT_VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportMetadata {
    /// RFC 3339 timestamp.
    pub exported_at: String,
    pub version: String,
    pub item_count: usize,
    pub collection_count: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportFile {
    pub metadata: ExportMetadata,
    pub items: Vec<ItemRecord>,
    pub collections: Vec<CollectionRecord>,
    #[serde(default)]
    pub settings: Settings,
    #[serde(default)]
    pub stats: Option<StatsSnapshot>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImportMode {
    /// Apply each record through the normal, tombstone-aware write path.
    Merge,
    /// Clear history, then bulk insert the file's contents.
    Replace,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ImportReport {
    pub items: usize,
    pub collections: usize,
    /// Items dropped because a newer tombstone covers them.
    pub suppressed: usize,
}

pub async fn export(storage: &HybridStorage, stats: &StatsMaintainer) -> Result<ExportFile> {
    let items = storage.get_all_items().await?;
    let collections = storage.get_all_collections().await?;
    let settings = storage.get_settings().await?;
    let stats = stats.get_stats().await?;

    Ok(ExportFile {
        metadata: ExportMetadata {
            exported_at: Utc::now().to_rfc3339(),
            version: EXPORT_VERSION.to_string(),
            item_count: items.len(),
            collection_count: collections.len(),
        },
        items,
        collections,
        settings,
        stats: Some(stats),
    })
}

pub async fn export_to_path(
    storage: &HybridStorage,
    stats: &StatsMaintainer,
    path: &Path,
) -> Result<ExportFile> {
    let file = export(storage, stats).await?;
    let json = serde_json::to_vec_pretty(&file)?;
    tokio::fs::write(path, json).await?;
    info!(
        "Exported {} items and {} collections to {:?}",
        file.metadata.item_count, file.metadata.collection_count, path
    );
    Ok(file)
}

/// Decode and validate an export file. Nothing is applied here.
pub fn parse_export(bytes: &[u8]) -> Result<ExportFile> {
    let file: ExportFile = serde_json::from_slice(bytes)
        .map_err(|e| AppError::ImportFormatInvalid(e.to_string()))?;

    if let Some(pos) = file.items.iter().position(|item| item.id.trim().is_empty()) {
        return Err(AppError::ImportFormatInvalid(format!(
            "item at index {pos} has an empty id"
        )));
    }
    if let Some(pos) = file.collections.iter().position(|c| c.id.trim().is_empty()) {
        return Err(AppError::ImportFormatInvalid(format!(
            "collection at index {pos} has an empty id"
        )));
    }
    if file.items.iter().any(|item| item.last_touched_at < 0) {
        return Err(AppError::ImportFormatInvalid(
            "negative lastTouchedAt".to_string(),
        ));
    }
    if file.metadata.item_count != file.items.len() {
        warn!(
            "Export metadata lists {} items but the file holds {}",
            file.metadata.item_count,
            file.items.len()
        );
    }
    Ok(file)
}

pub async fn import(
    storage: &HybridStorage,
    file: ExportFile,
    mode: ImportMode,
) -> Result<ImportReport> {
    let mut report = ImportReport::default();

    match mode {
        ImportMode::Merge => {
            for item in file.items {
                let id = item.id.clone();
                match storage.set_item(&id, item).await? {
                    WriteOutcome::Written => report.items += 1,
                    WriteOutcome::Suppressed => report.suppressed += 1,
                }
            }
            for collection in file.collections {
                let id = collection.id.clone();
                storage.set_collection(&id, collection).await?;
                report.collections += 1;
            }
        }
        ImportMode::Replace => {
            report.items = file.items.len();
            report.collections = file.collections.len();
            storage.clear_history_only().await?;
            storage.bulk_insert(file.items, file.collections).await?;
            storage.set_settings(&file.settings).await?;
        }
    }

    storage.invalidate_stats().await?;
    info!(
        "Imported {} items and {} collections ({} suppressed)",
        report.items, report.collections, report.suppressed
    );
    Ok(report)
}

pub async fn import_from_path(
    storage: &HybridStorage,
    path: &Path,
    mode: ImportMode,
) -> Result<ImportReport> {
    let bytes = tokio::fs::read(path).await?;
    let file = parse_export(&bytes)?;
    import(storage, file, mode).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::db::SqliteArchive;
    use crate::fast::MemoryFastTier;
    use crate::models::now_ms;
    use crate::storage::StorageOptions;

    async fn storage() -> HybridStorage {
        HybridStorage::new(
            Arc::new(MemoryFastTier::default()),
            Arc::new(SqliteArchive::open_in_memory().await.unwrap()),
            StorageOptions::default(),
        )
    }

    fn item(id: &str, touched: i64) -> ItemRecord {
        ItemRecord::new(id, touched)
            .with_title(format!("Video {id}"))
            .with_progress(30.0, 300.0)
    }

    #[tokio::test]
    async fn export_then_replace_import_restores_history() {
        let source = storage().await;
        let now = now_ms();
        source.set_item("a", item("a", now)).await.unwrap();
        source.set_item("b", item("b", now - 1)).await.unwrap();
        source
            .set_collection("pl", CollectionRecord::new("pl", now))
            .await
            .unwrap();
        let settings = Settings {
            page_size: 50,
            ..Settings::default()
        };
        source.set_settings(&settings).await.unwrap();

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("export.json");
        let stats = StatsMaintainer::new(source.clone());
        let exported = export_to_path(&source, &stats, &path).await.unwrap();
        assert_eq!(exported.metadata.item_count, 2);
        assert_eq!(exported.metadata.version, EXPORT_VERSION);

        let target = storage().await;
        target.set_item("old", item("old", now)).await.unwrap();
        let report = import_from_path(&target, &path, ImportMode::Replace)
            .await
            .unwrap();

        assert_eq!(report.items, 2);
        let ids: Vec<String> = target
            .get_all_items()
            .await
            .unwrap()
            .into_iter()
            .map(|i| i.id)
            .collect();
        assert_eq!(ids, vec!["a".to_string(), "b".to_string()]);
        assert_eq!(target.get_all_collections().await.unwrap().len(), 1);
        assert_eq!(target.get_settings().await.unwrap().page_size, 50);
    }

    #[tokio::test]
    async fn merge_import_respects_tombstones() {
        let target = storage().await;
        target.set_item("gone", item("gone", 1_000)).await.unwrap();
        target.remove_item("gone").await.unwrap();

        let file = ExportFile {
            metadata: ExportMetadata {
                exported_at: Utc::now().to_rfc3339(),
                version: EXPORT_VERSION.to_string(),
                item_count: 2,
                collection_count: 0,
            },
            items: vec![item("gone", 1_000), item("kept", now_ms())],
            collections: Vec::new(),
            settings: Settings::default(),
            stats: None,
        };

        let report = import(&target, file, ImportMode::Merge).await.unwrap();
        assert_eq!(
            report,
            ImportReport {
                items: 1,
                collections: 0,
                suppressed: 1
            }
        );
        assert!(target.get_item("gone").await.unwrap().is_none());
        assert!(target.get_item("kept").await.unwrap().is_some());
    }

    #[test]
    fn malformed_files_are_rejected() {
        assert!(matches!(
            parse_export(b"{not json"),
            Err(AppError::ImportFormatInvalid(_))
        ));
        assert!(matches!(
            parse_export(br#"{"metadata": {"exportedAt": "x", "version": "1", "itemCount": 0, "collectionCount": 0}}"#),
            Err(AppError::ImportFormatInvalid(_))
        ));

        let empty_id = br#"{
            "metadata": {"exportedAt": "x", "version": "1", "itemCount": 1, "collectionCount": 0},
            "items": [{"id": " ", "lastTouchedAt": 5}],
            "collections": []
        }"#;
        assert!(matches!(
            parse_export(empty_id),
            Err(AppError::ImportFormatInvalid(_))
        ));
    }
}
