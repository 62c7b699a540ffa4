// dbguardian/src/utils/state_db.rs
//! The SQLite database holding task, backup and schedule records.

use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteSynchronous,
};
use std::path::Path;
use std::time::Duration;
use tracing::info;

use crate::errors::{AppError, Result};

pub const STATE_DB_FILE: &str = "dbguardian.db";

/// Opens the state database at `path`, creating it if needed.
///
/// WAL journal with full sync: a write is on disk once its statement returns,
/// and readers never wait for the writer.
pub async fn open(path: &Path) -> Result<SqlitePool> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let options = SqliteConnectOptions::new()
        .filename(path)
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Full)
        .busy_timeout(Duration::from_secs(10));
    let pool = SqlitePoolOptions::new()
        .max_connections(4)
        .connect_with(options)
        .await?;
    info!(path = %path.display(), "State database opened");
    Ok(pool)
}

/// Runs the statements in order. Each one must be idempotent.
pub async fn apply_schema(pool: &SqlitePool, statements: &[&str]) -> Result<()> {
    for statement in statements {
        sqlx::query(statement).execute(pool).await?;
    }
    Ok(())
}

/// A stored value that does not map back onto its Rust type.
pub(crate) fn decode_error(detail: impl Into<String>) -> AppError {
    let detail: String = detail.into();
    AppError::Sqlx(sqlx::Error::Decode(detail.into()))
}

#[cfg(test)]
mod tests {
    use super::*;

    const SCHEMA: &[&str] = &[
        "CREATE TABLE IF NOT EXISTS notes (id INTEGER PRIMARY KEY AUTOINCREMENT, body TEXT NOT NULL)",
        "CREATE INDEX IF NOT EXISTS idx_notes_body ON notes (body)",
    ];

    #[tokio::test]
    async fn test_open_creates_file_and_schema_is_idempotent() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("nested").join(STATE_DB_FILE);

        let pool = open(&path).await?;
        apply_schema(&pool, SCHEMA).await?;
        apply_schema(&pool, SCHEMA).await?;
        sqlx::query("INSERT INTO notes (body) VALUES (?)")
            .bind("kept")
            .execute(&pool)
            .await?;
        pool.close().await;
        assert!(path.is_file());

        let reopened = open(&path).await?;
        apply_schema(&reopened, SCHEMA).await?;
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM notes")
            .fetch_one(&reopened)
            .await?;
        assert_eq!(count, 1);
        Ok(())
    }
}
