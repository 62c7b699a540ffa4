// dbguardian/src/restore/verification.rs
use sqlx::postgres::PgPoolOptions;
use std::path::Path;
use std::time::Duration;
use tracing::{info, warn};

use crate::credentials::DatabaseCredentials;
use crate::crypto::sha256_file;
use crate::errors::{AppError, Result};

/// Compares the decrypted dump file against the checksum recorded at backup time.
/// Runs before anything touches the live database.
pub fn verify_checksum(dump_path: &Path, expected: Option<&str>) -> Result<()> {
    let expected = expected.ok_or_else(|| {
        AppError::IntegrityError("backup record carries no checksum".to_string())
    })?;
    let actual = sha256_file(dump_path)?;
    if !actual.eq_ignore_ascii_case(expected) {
        return Err(AppError::IntegrityError(format!(
            "checksum mismatch: expected {}, got {}",
            expected, actual
        )));
    }
    Ok(())
}

/// Post-restore sanity check. Lists the public tables of the restored database;
/// problems are logged, never turned into a job failure.
pub async fn log_restored_tables(credentials: &DatabaseCredentials) {
    let url = match credentials.connection_url() {
        Ok(url) => url,
        Err(e) => {
            warn!(database = %credentials.name, error = %e, "Skipping post-restore verification");
            return;
        }
    };
    let pool = match PgPoolOptions::new()
        .max_connections(1)
        .acquire_timeout(Duration::from_secs(10))
        .connect(&url)
        .await
    {
        Ok(pool) => pool,
        Err(e) => {
            warn!(database = %credentials.name, error = %e, "Could not connect for post-restore verification");
            return;
        }
    };

    let tables: std::result::Result<Vec<(String,)>, sqlx::Error> = sqlx::query_as(
        "SELECT tablename FROM pg_catalog.pg_tables WHERE schemaname = 'public'",
    )
    .fetch_all(&pool)
    .await;
    match tables {
        Ok(tables) if tables.is_empty() => warn!(
            database = %credentials.name,
            "No tables found in the public schema of the restored database"
        ),
        Ok(tables) => info!(
            database = %credentials.name,
            tables = tables.len(),
            "✓ Restored database has tables in the public schema"
        ),
        Err(e) => warn!(database = %credentials.name, error = %e, "Post-restore table listing failed"),
    }
    pool.close().await;
}
