//! Database schema initialization

use sqlx::SqlitePool;

use crate::error::Result;

/// Initialize the database schema
pub async fn initialize_schema(pool: &SqlitePool) -> Result<()> {
    sqlx::query(SCHEMA_SQL)
        .execute(pool)
        .await?;

    Ok(())
}

const SCHEMA_SQL: &str = r#"
-- Upload sessions table (resumable uploads, one row per session)
CREATE TABLE IF NOT EXISTS upload_sessions (
    id TEXT PRIMARY KEY,
    mount TEXT NOT NULL,
    total_length INTEGER,
    upload_offset INTEGER NOT NULL DEFAULT 0,
    metadata TEXT NOT NULL DEFAULT '{}',
    storage_locator TEXT NOT NULL,
    final_object TEXT,
    state TEXT NOT NULL DEFAULT 'created',
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    completed_at TEXT
);

CREATE INDEX IF NOT EXISTS idx_upload_sessions_mount_state ON upload_sessions(mount, state);
CREATE INDEX IF NOT EXISTS idx_upload_sessions_updated ON upload_sessions(mount, updated_at);
"#;
