//! Database schema initialization

use sqlx::SqlitePool;

use crate::error::Result;

/// Initialize the database schema
pub async fn initialize_schema(pool: &SqlitePool) -> Result<()> {
    sqlx::query(SCHEMA_SQL).execute(pool).await?;

    Ok(())
}

const SCHEMA_SQL: &str = r#"
-- One row per in-progress (attachment, tier) upload
CREATE TABLE IF NOT EXISTS attachment_upload_records (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    tier TEXT NOT NULL CHECK (tier IN ('transit', 'media', 'thumbnail')),
    attachment_id TEXT NOT NULL,
    upload_form TEXT,
    upload_form_timestamp_ms INTEGER,
    local_metadata TEXT,
    session_url TEXT,
    attempt INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL DEFAULT (datetime('now')),
    updated_at TEXT NOT NULL DEFAULT (datetime('now')),

    UNIQUE(attachment_id, tier)
);

CREATE INDEX IF NOT EXISTS idx_upload_records_attempt ON attachment_upload_records(attempt);
"#;
