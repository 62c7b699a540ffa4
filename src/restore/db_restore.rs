// dbguardian/src/restore/db_restore.rs
use async_trait::async_trait;
use std::ffi::OsString;
use std::path::Path;
use tokio::process::Command;
use tracing::{debug, info};

use super::verification::log_restored_tables;
use crate::credentials::DatabaseCredentials;
use crate::errors::{AppError, Result};
use crate::utils::find_pg_executable;

/// Applies a dump produced by the matching dump tool to a live database.
#[async_trait]
pub trait RestoreTool: Send + Sync {
    /// Applies the verified dump file at `dump_path`.
    async fn restore(&self, credentials: &DatabaseCredentials, dump_path: &Path) -> Result<()>;
}

/// `pg_restore` replacing existing objects in the target database.
#[derive(Debug, Default, Clone)]
pub struct PgRestore;

fn restore_args(credentials: &DatabaseCredentials, dump_path: &Path) -> Vec<OsString> {
    vec![
        "--host".into(),
        credentials.host.clone().into(),
        "--port".into(),
        credentials.port.to_string().into(),
        "--username".into(),
        credentials.username.clone().into(),
        "--dbname".into(),
        credentials.database.clone().into(),
        "--clean".into(),
        "--if-exists".into(),
        "--no-owner".into(),
        "--no-password".into(),
        dump_path.as_os_str().to_owned(),
    ]
}

#[async_trait]
impl RestoreTool for PgRestore {
    async fn restore(&self, credentials: &DatabaseCredentials, dump_path: &Path) -> Result<()> {
        let pg_restore_path =
            find_pg_executable("pg_restore").map_err(|e| AppError::RestoreFailed(e.to_string()))?;
        debug!(path = %pg_restore_path.display(), "Found pg_restore executable");

        info!(database = %credentials.name, host = %credentials.host, "Running pg_restore");
        let output = Command::new(&pg_restore_path)
            .args(restore_args(credentials, dump_path))
            .env("PGPASSWORD", &credentials.password)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| AppError::RestoreFailed(format!("failed to execute pg_restore: {}", e)))?;

        if !output.status.success() {
            return Err(AppError::RestoreFailed(format!(
                "pg_restore into database {} failed with status: {}\nStderr: {}",
                credentials.name,
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        info!(database = %credentials.name, "✓ pg_restore finished");

        log_restored_tables(credentials).await;
        Ok(())
    }
}
