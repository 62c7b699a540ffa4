// dbguardian/src/jobs/store.rs
use chrono::{DateTime, Utc};
use sqlx::sqlite::{Sqlite, SqlitePool, SqliteRow};
use sqlx::{QueryBuilder, Row};
use tracing::{info, warn};
use uuid::Uuid;

use super::{JobError, JobKind, JobOutput, JobState, TaskId, TaskStatus};
use crate::errors::{AppError, ErrorKind, Result};
use crate::utils::state_db::{apply_schema, decode_error};

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS tasks (
        task_id TEXT PRIMARY KEY,
        kind TEXT NOT NULL,
        database_name TEXT NOT NULL,
        status TEXT NOT NULL,
        message TEXT NOT NULL,
        result TEXT,
        error TEXT,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_tasks_status_updated ON tasks (status, updated_at)",
];

/// Durable task id -> status table.
///
/// Every write touches a single row and is committed before the call returns.
/// Writes for a given task only ever come from the worker that owns it.
pub struct JobStatusStore {
    pool: SqlitePool,
}

impl JobStatusStore {
    /// Creates the table if needed and fails any task a previous process left unfinished.
    pub async fn open(pool: SqlitePool) -> Result<Self> {
        apply_schema(&pool, SCHEMA).await?;

        let error = serde_json::to_string(&JobError {
            kind: ErrorKind::Cancelled,
            detail: "the process stopped before the job finished".to_string(),
        })?;
        let interrupted = sqlx::query(
            r#"
            UPDATE tasks
            SET status = ?, message = ?, error = ?, updated_at = ?
            WHERE status IN (?, ?)
            "#,
        )
        .bind(JobState::Failure.as_str())
        .bind("Interrupted by process restart")
        .bind(error)
        .bind(Utc::now())
        .bind(JobState::Pending.as_str())
        .bind(JobState::Progress.as_str())
        .execute(&pool)
        .await?
        .rows_affected();
        if interrupted > 0 {
            warn!(count = interrupted, "Marked unfinished tasks from a previous run as failed");
        }
        info!("Job status store opened");

        Ok(Self { pool })
    }

    pub async fn insert(&self, status: TaskStatus) -> Result<()> {
        let result = status.result.as_ref().map(serde_json::to_string).transpose()?;
        let error = status.error.as_ref().map(serde_json::to_string).transpose()?;
        let inserted = sqlx::query(
            r#"
            INSERT INTO tasks (
                task_id, kind, database_name, status, message, result, error, created_at, updated_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(status.task_id.to_string())
        .bind(status.kind.as_str())
        .bind(&status.database_name)
        .bind(status.status.as_str())
        .bind(&status.message)
        .bind(result)
        .bind(error)
        .bind(status.created_at)
        .bind(status.updated_at)
        .execute(&self.pool)
        .await;

        match inserted {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(e)) if e.is_unique_violation() => Err(AppError::Validation(
                format!("task {} already exists", status.task_id),
            )),
            Err(e) => Err(e.into()),
        }
    }

    /// Moves a task forward. The state check and the write are one statement, so a
    /// terminal status can never be overwritten.
    pub async fn transition(
        &self,
        task_id: TaskId,
        next: JobState,
        message: &str,
        result: Option<JobOutput>,
        error: Option<JobError>,
    ) -> Result<TaskStatus> {
        let movable_from: Vec<JobState> = [JobState::Pending, JobState::Progress]
            .into_iter()
            .filter(|from| from.can_move_to(next))
            .collect();

        if !movable_from.is_empty() {
            let result = result.as_ref().map(serde_json::to_string).transpose()?;
            let error = error.as_ref().map(serde_json::to_string).transpose()?;

            let mut qb = QueryBuilder::<Sqlite>::new("UPDATE tasks SET status = ");
            qb.push_bind(next.as_str())
                .push(", message = ")
                .push_bind(message.to_string())
                .push(", result = ")
                .push_bind(result)
                .push(", error = ")
                .push_bind(error)
                .push(", updated_at = ")
                .push_bind(Utc::now())
                .push(" WHERE task_id = ")
                .push_bind(task_id.to_string())
                .push(" AND status IN (");
            let mut states = qb.separated(", ");
            for from in &movable_from {
                states.push_bind(from.as_str());
            }
            states.push_unseparated(")");

            let updated = qb.build().execute(&self.pool).await?.rows_affected();
            if updated == 1 {
                return self.get(task_id).await;
            }
        }

        let current = self.get(task_id).await?;
        Err(AppError::Validation(format!(
            "task {} cannot move from {:?} to {:?}",
            task_id, current.status, next
        )))
    }

    pub async fn get(&self, task_id: TaskId) -> Result<TaskStatus> {
        let row = sqlx::query(
            r#"
            SELECT task_id, kind, database_name, status, message, result, error, created_at, updated_at
            FROM tasks
            WHERE task_id = ?
            "#,
        )
        .bind(task_id.to_string())
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => row_to_status(&row),
            None => Err(AppError::NotFound(format!("task {}", task_id))),
        }
    }

    /// Deletes finished tasks last updated before `cutoff`. Pending and running
    /// tasks are never pruned.
    pub async fn prune_finished(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let deleted = sqlx::query("DELETE FROM tasks WHERE status IN (?, ?) AND updated_at < ?")
            .bind(JobState::Success.as_str())
            .bind(JobState::Failure.as_str())
            .bind(cutoff)
            .execute(&self.pool)
            .await?
            .rows_affected();
        if deleted > 0 {
            info!(deleted, cutoff = %cutoff, "Pruned finished tasks");
        }
        Ok(deleted)
    }
}

fn row_to_status(row: &SqliteRow) -> Result<TaskStatus> {
    let task_id: String = row.try_get("task_id")?;
    let result: Option<String> = row.try_get("result")?;
    let error: Option<String> = row.try_get("error")?;

    Ok(TaskStatus {
        task_id: Uuid::parse_str(&task_id)
            .map_err(|e| decode_error(format!("task id '{}': {}", task_id, e)))?,
        kind: JobKind::from_db(&row.try_get::<String, _>("kind")?)?,
        database_name: row.try_get("database_name")?,
        status: JobState::from_db(&row.try_get::<String, _>("status")?)?,
        message: row.try_get("message")?,
        result: result
            .as_deref()
            .map(serde_json::from_str::<JobOutput>)
            .transpose()?,
        error: error
            .as_deref()
            .map(serde_json::from_str::<JobError>)
            .transpose()?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::JobSpec;
    use crate::storage::StorageType;
    use crate::utils::state_db;
    use chrono::Duration;

    fn spec() -> JobSpec {
        JobSpec::Backup {
            database_name: "sales".to_string(),
        }
    }

    #[tokio::test]
    async fn test_status_survives_reopen() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("state.db");
        let task_id = Uuid::new_v4();
        let output = JobOutput::Backup {
            backup_id: 4,
            backup_name: "backup_sales_20240601_120000_4.dump.enc".to_string(),
            storage_type: StorageType::Primary,
            storage_location: "s3://backups/sales/backup_sales_20240601_120000_4.dump.enc".to_string(),
            size_bytes: 2048,
        };

        let pool = state_db::open(&path).await?;
        let store = JobStatusStore::open(pool.clone()).await?;
        store.insert(TaskStatus::pending(task_id, &spec())).await?;
        store.transition(task_id, JobState::Progress, "Creating database dump", None, None).await?;
        store
            .transition(task_id, JobState::Success, "done", Some(output.clone()), None)
            .await?;
        pool.close().await;

        let reopened = JobStatusStore::open(state_db::open(&path).await?).await?;
        let status = reopened.get(task_id).await?;
        assert_eq!(status.status, JobState::Success);
        assert_eq!(status.message, "done");
        assert_eq!(status.result, Some(output));
        Ok(())
    }

    #[tokio::test]
    async fn test_unfinished_tasks_fail_on_reopen() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("state.db");
        let task_id = Uuid::new_v4();

        let pool = state_db::open(&path).await?;
        let store = JobStatusStore::open(pool.clone()).await?;
        store.insert(TaskStatus::pending(task_id, &spec())).await?;
        store.transition(task_id, JobState::Progress, "Uploading", None, None).await?;
        pool.close().await;

        let reopened = JobStatusStore::open(state_db::open(&path).await?).await?;
        let status = reopened.get(task_id).await?;
        assert_eq!(status.status, JobState::Failure);
        assert_eq!(status.error.map(|e| e.kind), Some(ErrorKind::Cancelled));
        Ok(())
    }

    #[tokio::test]
    async fn test_terminal_status_is_final() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let store = JobStatusStore::open(state_db::open(&dir.path().join("state.db")).await?).await?;
        let task_id = Uuid::new_v4();
        store.insert(TaskStatus::pending(task_id, &spec())).await?;
        store.transition(task_id, JobState::Failure, "boom", None, None).await?;

        assert!(matches!(
            store.transition(task_id, JobState::Progress, "again", None, None).await,
            Err(AppError::Validation(_))
        ));
        assert!(store.transition(task_id, JobState::Success, "again", None, None).await.is_err());
        assert_eq!(store.get(task_id).await?.message, "boom");
        assert!(matches!(
            store.transition(Uuid::new_v4(), JobState::Progress, "x", None, None).await,
            Err(AppError::NotFound(_))
        ));
        assert!(matches!(
            store.get(Uuid::new_v4()).await,
            Err(AppError::NotFound(_))
        ));
        Ok(())
    }

    #[tokio::test]
    async fn test_duplicate_task_id_is_rejected() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let store = JobStatusStore::open(state_db::open(&dir.path().join("state.db")).await?).await?;
        let status = TaskStatus::pending(Uuid::new_v4(), &spec());
        store.insert(status.clone()).await?;
        assert!(matches!(
            store.insert(status).await,
            Err(AppError::Validation(_))
        ));
        Ok(())
    }

    #[tokio::test]
    async fn test_prune_drops_only_old_finished_tasks() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let store = JobStatusStore::open(state_db::open(&dir.path().join("state.db")).await?).await?;

        let finished = Uuid::new_v4();
        let failed = Uuid::new_v4();
        let waiting = Uuid::new_v4();
        for task_id in [finished, failed, waiting] {
            store.insert(TaskStatus::pending(task_id, &spec())).await?;
        }
        store.transition(finished, JobState::Success, "done", None, None).await?;
        store.transition(failed, JobState::Failure, "boom", None, None).await?;

        let past = Utc::now() - Duration::hours(1);
        assert_eq!(store.prune_finished(past).await?, 0);

        let future = Utc::now() + Duration::hours(1);
        assert_eq!(store.prune_finished(future).await?, 2);
        assert!(matches!(store.get(finished).await, Err(AppError::NotFound(_))));
        assert!(matches!(store.get(failed).await, Err(AppError::NotFound(_))));
        assert_eq!(store.get(waiting).await?.status, JobState::Pending);
        Ok(())
    }
}
