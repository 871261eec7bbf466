//! SQLite pool setup and schema initialisation.

use std::str::FromStr;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::SqlitePool;
use tracing::info;

use super::StoreError;

/// Open (creating if missing) the database at `path` with WAL enabled and
/// the schema initialised.
///
/// # Errors
///
/// Returns [`StoreError::Database`] on connection or schema failure.
pub async fn connect(path: &str) -> Result<SqlitePool, StoreError> {
    let options = SqliteConnectOptions::from_str(&format!("sqlite://{path}"))
        .map_err(sqlx::Error::from)?
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal);
    let pool = SqlitePoolOptions::new()
        .max_connections(8)
        .connect_with(options)
        .await?;
    init_schema(&pool).await?;
    info!(path, "database ready");
    Ok(pool)
}

/// Open an in-memory database (single connection so every handle sees the
/// same data). Used by tests and the one-shot CLI paths.
///
/// # Errors
///
/// Returns [`StoreError::Database`] on connection or schema failure.
pub async fn connect_memory() -> Result<SqlitePool, StoreError> {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await?;
    init_schema(&pool).await?;
    Ok(pool)
}

/// Create all tables and indexes. Idempotent.
async fn init_schema(pool: &SqlitePool) -> Result<(), StoreError> {
    let statements = [
        "CREATE TABLE IF NOT EXISTS settings (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
        )",
        "CREATE TABLE IF NOT EXISTS batches (
            id TEXT PRIMARY KEY,
            user_id TEXT NOT NULL,
            status TEXT NOT NULL,
            total_files INTEGER NOT NULL DEFAULT 0,
            processed_files INTEGER NOT NULL DEFAULT 0,
            success_files INTEGER NOT NULL DEFAULT 0,
            failed_files INTEGER NOT NULL DEFAULT 0,
            error_summary TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        )",
        "CREATE TABLE IF NOT EXISTS upload_items (
            id TEXT PRIMARY KEY,
            batch_id TEXT NOT NULL REFERENCES batches(id),
            file_name TEXT NOT NULL,
            mime_type TEXT NOT NULL,
            storage_key TEXT NOT NULL,
            status TEXT NOT NULL,
            current_step TEXT,
            ocr_text TEXT,
            extracted_metadata TEXT,
            cutting_instructions TEXT,
            parsed_parts TEXT,
            second_pass_metadata TEXT,
            second_pass_status TEXT,
            adjudicator_status TEXT,
            adjudication_notes TEXT,
            final_confidence REAL,
            auto_approved INTEGER NOT NULL DEFAULT 0,
            requires_human_review INTEGER NOT NULL DEFAULT 0,
            is_packet INTEGER NOT NULL DEFAULT 0,
            error_message TEXT,
            error_details TEXT,
            temp_files TEXT NOT NULL DEFAULT '[]',
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        )",
        "CREATE INDEX IF NOT EXISTS idx_upload_items_batch
            ON upload_items(batch_id)",
        "CREATE INDEX IF NOT EXISTS idx_upload_items_second_pass
            ON upload_items(second_pass_status)
            WHERE second_pass_status IS NOT NULL",
        "CREATE TABLE IF NOT EXISTS catalog_entries (
            id TEXT PRIMARY KEY,
            item_id TEXT NOT NULL,
            title TEXT NOT NULL,
            composer TEXT NOT NULL,
            part_name TEXT NOT NULL,
            instrument TEXT NOT NULL,
            storage_key TEXT NOT NULL,
            page_count INTEGER NOT NULL,
            created_at TEXT NOT NULL
        )",
        "CREATE TABLE IF NOT EXISTS assignment_history (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            assignment_id TEXT NOT NULL,
            action TEXT NOT NULL,
            from_status TEXT,
            to_status TEXT NOT NULL,
            notes TEXT,
            performed_by TEXT NOT NULL,
            performed_at TEXT NOT NULL
        )",
    ];
    for statement in statements {
        sqlx::query(statement).execute(pool).await?;
    }
    Ok(())
}
