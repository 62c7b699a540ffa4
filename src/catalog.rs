// dbguardian/src/catalog.rs
//! Durable metadata for every backup attempt.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::Row;
use sqlx::sqlite::{SqlitePool, SqliteRow};
use tracing::{info, warn};
use uuid::Uuid;

use crate::errors::{AppError, Result};
use crate::jobs::TaskId;
use crate::storage::{StorageType, StoredArtifact};
use crate::utils::state_db::{apply_schema, decode_error};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackupStatus {
    Pending,
    Progress,
    Success,
    Failure,
}

impl BackupStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            BackupStatus::Pending => "pending",
            BackupStatus::Progress => "progress",
            BackupStatus::Success => "success",
            BackupStatus::Failure => "failure",
        }
    }

    fn from_db(value: &str) -> Result<Self> {
        match value {
            "pending" => Ok(BackupStatus::Pending),
            "progress" => Ok(BackupStatus::Progress),
            "success" => Ok(BackupStatus::Success),
            "failure" => Ok(BackupStatus::Failure),
            other => Err(decode_error(format!("unknown backup status '{}'", other))),
        }
    }

    pub fn is_in_flight(self) -> bool {
        matches!(self, BackupStatus::Pending | BackupStatus::Progress)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupRecord {
    pub id: u64,
    pub task_id: TaskId,
    pub database_name: String,
    pub backup_name: String,
    pub storage_type: Option<StorageType>,
    pub storage_location: Option<String>,
    pub created_at: DateTime<Utc>,
    pub size_bytes: Option<u64>,
    pub status: BackupStatus,
    /// SHA-256 of the plaintext dump.
    pub checksum: Option<String>,
    pub encrypted: bool,
    pub failure_reason: Option<String>,
}

impl BackupRecord {
    /// The artifact, if this backup got as far as storing one.
    pub fn artifact(&self) -> Option<(StorageType, &str)> {
        match (self.storage_type, self.storage_location.as_deref()) {
            (Some(storage_type), Some(location)) => Some((storage_type, location)),
            _ => None,
        }
    }
}

/// Everything the executor knows once the artifact is stored.
#[derive(Debug, Clone)]
pub struct CompletedBackup {
    pub artifact: StoredArtifact,
    pub checksum: String,
    pub encrypted: bool,
}

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS backups (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        task_id TEXT NOT NULL,
        database_name TEXT NOT NULL,
        backup_name TEXT NOT NULL,
        storage_type TEXT,
        storage_location TEXT,
        created_at TEXT NOT NULL,
        size_bytes INTEGER,
        status TEXT NOT NULL,
        checksum TEXT,
        encrypted INTEGER NOT NULL,
        failure_reason TEXT
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_backups_database ON backups (database_name, created_at)",
];

const SELECT_BACKUP: &str = r#"
    SELECT
        id, task_id, database_name, backup_name, storage_type, storage_location,
        created_at, size_bytes, status, checksum, encrypted, failure_reason
    FROM backups
"#;

/// Backup records, one row per attempt. Ids come from the table and are never reused.
pub struct BackupCatalog {
    pool: SqlitePool,
}

impl BackupCatalog {
    /// Opens the catalog; attempts a previous process left in flight become failures.
    pub async fn open(pool: SqlitePool) -> Result<Self> {
        apply_schema(&pool, SCHEMA).await?;

        let interrupted = sqlx::query(
            "UPDATE backups SET status = ?, failure_reason = ? WHERE status IN (?, ?)",
        )
        .bind(BackupStatus::Failure.as_str())
        .bind("Interrupted by process restart")
        .bind(BackupStatus::Pending.as_str())
        .bind(BackupStatus::Progress.as_str())
        .execute(&pool)
        .await?
        .rows_affected();
        if interrupted > 0 {
            warn!(count = interrupted, "Marked interrupted backups as failed");
        }
        info!("Backup catalog opened");

        Ok(Self { pool })
    }

    /// Registers a new pending attempt. The name embeds the timestamp and the id.
    pub async fn create(
        &self,
        task_id: TaskId,
        database_name: &str,
        encrypted: bool,
    ) -> Result<BackupRecord> {
        let created_at = Utc::now();
        let mut tx = self.pool.begin().await?;

        let row_id = sqlx::query(
            r#"
            INSERT INTO backups (task_id, database_name, backup_name, created_at, status, encrypted)
            VALUES (?, ?, '', ?, ?, ?)
            "#,
        )
        .bind(task_id.to_string())
        .bind(database_name)
        .bind(created_at)
        .bind(BackupStatus::Pending.as_str())
        .bind(encrypted)
        .execute(&mut *tx)
        .await?
        .last_insert_rowid();
        let id = u64::try_from(row_id)
            .map_err(|_| decode_error(format!("negative backup id {}", row_id)))?;

        let name = backup_name(database_name, created_at, id, encrypted);
        sqlx::query("UPDATE backups SET backup_name = ? WHERE id = ?")
            .bind(&name)
            .bind(row_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        Ok(BackupRecord {
            id,
            task_id,
            database_name: database_name.to_string(),
            backup_name: name,
            storage_type: None,
            storage_location: None,
            created_at,
            size_bytes: None,
            status: BackupStatus::Pending,
            checksum: None,
            encrypted,
            failure_reason: None,
        })
    }

    pub async fn mark_progress(&self, id: u64) -> Result<BackupRecord> {
        let updated = sqlx::query("UPDATE backups SET status = ? WHERE id = ?")
            .bind(BackupStatus::Progress.as_str())
            .bind(id as i64)
            .execute(&self.pool)
            .await?
            .rows_affected();
        self.updated(id, updated).await
    }

    pub async fn mark_succeeded(&self, id: u64, completed: CompletedBackup) -> Result<BackupRecord> {
        let updated = sqlx::query(
            r#"
            UPDATE backups
            SET status = ?, storage_type = ?, storage_location = ?, size_bytes = ?,
                checksum = ?, encrypted = ?
            WHERE id = ?
            "#,
        )
        .bind(BackupStatus::Success.as_str())
        .bind(completed.artifact.storage_type.as_str())
        .bind(&completed.artifact.location)
        .bind(completed.artifact.size_bytes as i64)
        .bind(&completed.checksum)
        .bind(completed.encrypted)
        .bind(id as i64)
        .execute(&self.pool)
        .await?
        .rows_affected();
        self.updated(id, updated).await
    }

    pub async fn mark_failed(&self, id: u64, reason: &str) -> Result<BackupRecord> {
        let updated = sqlx::query("UPDATE backups SET status = ?, failure_reason = ? WHERE id = ?")
            .bind(BackupStatus::Failure.as_str())
            .bind(reason)
            .bind(id as i64)
            .execute(&self.pool)
            .await?
            .rows_affected();
        self.updated(id, updated).await
    }

    async fn updated(&self, id: u64, rows_affected: u64) -> Result<BackupRecord> {
        if rows_affected == 0 {
            return Err(AppError::NotFound(format!("backup {}", id)));
        }
        self.get(id).await
    }

    pub async fn get(&self, id: u64) -> Result<BackupRecord> {
        let row = sqlx::query(&format!("{} WHERE id = ?", SELECT_BACKUP))
            .bind(id as i64)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => row_to_record(&row),
            None => Err(AppError::NotFound(format!("backup {}", id))),
        }
    }

    /// Newest first, optionally restricted to one database.
    pub async fn list(&self, database_name: Option<&str>) -> Result<Vec<BackupRecord>> {
        let rows = sqlx::query(&format!(
            "{} WHERE (? IS NULL OR database_name = ?) ORDER BY created_at DESC, id DESC",
            SELECT_BACKUP
        ))
        .bind(database_name)
        .bind(database_name)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_record).collect()
    }

    pub async fn remove(&self, id: u64) -> Result<BackupRecord> {
        let record = self.get(id).await?;
        let deleted = sqlx::query("DELETE FROM backups WHERE id = ?")
            .bind(id as i64)
            .execute(&self.pool)
            .await?
            .rows_affected();
        if deleted == 0 {
            return Err(AppError::NotFound(format!("backup {}", id)));
        }
        Ok(record)
    }
}

fn row_to_record(row: &SqliteRow) -> Result<BackupRecord> {
    let id: i64 = row.try_get("id")?;
    let task_id: String = row.try_get("task_id")?;
    let storage_type: Option<String> = row.try_get("storage_type")?;
    let size_bytes: Option<i64> = row.try_get("size_bytes")?;

    Ok(BackupRecord {
        id: id as u64,
        task_id: Uuid::parse_str(&task_id)
            .map_err(|e| decode_error(format!("task id '{}': {}", task_id, e)))?,
        database_name: row.try_get("database_name")?,
        backup_name: row.try_get("backup_name")?,
        storage_type: storage_type
            .as_deref()
            .map(StorageType::from_db)
            .transpose()?,
        storage_location: row.try_get("storage_location")?,
        created_at: row.try_get("created_at")?,
        size_bytes: size_bytes.map(|size| size as u64),
        status: BackupStatus::from_db(&row.try_get::<String, _>("status")?)?,
        checksum: row.try_get("checksum")?,
        encrypted: row.try_get("encrypted")?,
        failure_reason: row.try_get("failure_reason")?,
    })
}

/// `backup_<db>_<YYYYmmdd_HHMMSS>_<id>.dump`, with `.enc` appended for sealed artifacts.
pub fn backup_name(database_name: &str, at: DateTime<Utc>, id: u64, encrypted: bool) -> String {
    let mut name = format!(
        "backup_{}_{}_{}.dump",
        database_name,
        at.format("%Y%m%d_%H%M%S"),
        id
    );
    if encrypted {
        name.push_str(".enc");
    }
    name
}
