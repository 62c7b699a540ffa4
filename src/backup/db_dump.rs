// dbguardian/src/backup/db_dump.rs
use async_trait::async_trait;
use std::ffi::OsString;
use std::path::Path;
use tokio::process::Command;
use tracing::{debug, info};

use crate::credentials::DatabaseCredentials;
use crate::errors::{AppError, Result};
use crate::utils::find_pg_executable;

/// Produces a restorable dump of one database.
#[async_trait]
pub trait DumpTool: Send + Sync {
    /// Writes the dump to `dest`, a path inside a job-private work directory.
    async fn dump(&self, credentials: &DatabaseCredentials, dest: &Path) -> Result<()>;
}

/// `pg_dump` in custom format. The password travels through `PGPASSWORD` only.
#[derive(Debug, Default, Clone)]
pub struct PgDump;

fn dump_args(credentials: &DatabaseCredentials, dump_path: &Path) -> Vec<OsString> {
    vec![
        "--host".into(),
        credentials.host.clone().into(),
        "--port".into(),
        credentials.port.to_string().into(),
        "--username".into(),
        credentials.username.clone().into(),
        "--dbname".into(),
        credentials.database.clone().into(),
        "--format=custom".into(),
        "--compress=9".into(),
        "--no-password".into(),
        "--file".into(),
        dump_path.as_os_str().to_owned(),
    ]
}

#[async_trait]
impl DumpTool for PgDump {
    async fn dump(&self, credentials: &DatabaseCredentials, dump_path: &Path) -> Result<()> {
        let pg_dump_path =
            find_pg_executable("pg_dump").map_err(|e| AppError::DumpFailed(e.to_string()))?;
        debug!(path = %pg_dump_path.display(), "Found pg_dump executable");

        info!(database = %credentials.name, host = %credentials.host, "Running pg_dump");
        let output = Command::new(&pg_dump_path)
            .args(dump_args(credentials, dump_path))
            .env("PGPASSWORD", &credentials.password)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| AppError::DumpFailed(format!("failed to execute pg_dump: {}", e)))?;

        if !output.status.success() {
            return Err(AppError::DumpFailed(format!(
                "pg_dump for database {} failed with status: {}\nStderr: {}",
                credentials.name,
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        let size_bytes = tokio::fs::metadata(dump_path)
            .await
            .map_err(|e| {
                AppError::DumpFailed(format!("pg_dump did not write its output file: {}", e))
            })?
            .len();
        if size_bytes == 0 {
            return Err(AppError::DumpFailed(format!(
                "pg_dump produced an empty dump for database {}",
                credentials.name
            )));
        }
        info!(database = %credentials.name, size_bytes, "✓ Database dump created");
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::sync::Mutex;

    /// Writes canned dump bytes, or fails with `DumpFailed` for databases listed in `failing`.
    #[derive(Default)]
    pub struct FakeDump {
        pub failing: Vec<String>,
        pub dumped: Mutex<Vec<String>>,
        /// Writes this many generated bytes instead of [`dump_bytes`].
        pub dump_len: Option<usize>,
    }

    pub fn dump_bytes(database_name: &str) -> Vec<u8> {
        format!("PGDMP custom dump of {}", database_name).into_bytes()
    }

    #[async_trait]
    impl DumpTool for FakeDump {
        async fn dump(&self, credentials: &DatabaseCredentials, dest: &Path) -> Result<()> {
            self.dumped.lock().unwrap().push(credentials.name.clone());
            if self.failing.contains(&credentials.name) {
                return Err(AppError::DumpFailed(
                    "pg_dump: error: connection to server failed".to_string(),
                ));
            }
            let bytes = match self.dump_len {
                Some(len) => (0..len).map(|i| (i % 253) as u8).collect(),
                None => dump_bytes(&credentials.name),
            };
            tokio::fs::write(dest, bytes)
                .await
                .map_err(|e| AppError::DumpFailed(e.to_string()))
        }
    }
}
