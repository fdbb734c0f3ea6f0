pub const SCHEMA: &str = r#"
-- items table (archived viewing progress)
CREATE TABLE IF NOT EXISTS items (
    id TEXT PRIMARY KEY,
    title TEXT NOT NULL DEFAULT '',
    normalized_title TEXT NOT NULL DEFAULT '',
    source_url TEXT NOT NULL DEFAULT '',
    position_seconds REAL NOT NULL DEFAULT 0,
    total_duration_seconds REAL NOT NULL DEFAULT 0,
    last_touched_at INTEGER NOT NULL,
    is_short_form INTEGER NOT NULL DEFAULT 0,
    category_id TEXT NOT NULL DEFAULT '',
    category_name TEXT NOT NULL DEFAULT '',
    thumbnail_url TEXT,
    archived_at TEXT NOT NULL DEFAULT (datetime('now'))
);

CREATE INDEX IF NOT EXISTS idx_items_last_touched_at ON items(last_touched_at DESC);
CREATE INDEX IF NOT EXISTS idx_items_category_id ON items(category_id);
CREATE INDEX IF NOT EXISTS idx_items_normalized_title ON items(normalized_title);

-- collections table
CREATE TABLE IF NOT EXISTS collections (
    id TEXT PRIMARY KEY,
    title TEXT NOT NULL DEFAULT '',
    source_url TEXT NOT NULL DEFAULT '',
    discovered_at INTEGER NOT NULL,
    last_updated_at INTEGER NOT NULL,
    item_count INTEGER,
    ignore_tracking INTEGER NOT NULL DEFAULT 0
);

CREATE INDEX IF NOT EXISTS idx_collections_last_updated_at ON collections(last_updated_at DESC);

-- deleted_items table (prevents deleted items from coming back)
CREATE TABLE IF NOT EXISTS deleted_items (
    item_id TEXT PRIMARY KEY,
    deleted_at INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_deleted_items_deleted_at ON deleted_items(deleted_at);
"#;
