use thiserror::Error;

#[derive(Error, Debug)]
pub enum AppError {
    /// The fast tier rejected a write. Always surfaced to the caller.
    #[error("Fast tier unavailable: {0}")]
    StorageUnavailable(String),

    /// The archival tier failed. Read paths log this and degrade.
    #[error("Archival tier unavailable: {0}")]
    ArchivalUnavailable(String),

    /// The remote channel could not be probed or written.
    #[error("Sync channel unavailable: {0}")]
    SyncUnavailable(String),

    #[error("Invalid import file: {0}")]
    ImportFormatInvalid(String),

    #[error("Fast tier quota exceeded: {needed} bytes needed, {quota} allowed")]
    QuotaExceeded { needed: usize, quota: usize },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Database error: {0}")]
    Database(#[from] tokio_rusqlite::Error),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, AppError>;
