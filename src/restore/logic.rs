// dbguardian/src/restore/logic.rs
use tracing::{error, info};

use super::verification::verify_checksum;
use crate::backup::BackupExecutor;
use crate::catalog::BackupStatus;
use crate::errors::{AppError, Result};
use crate::jobs::{JobContext, JobOutput};

/// Fetch, decrypt and verify a stored backup, then apply it to `target_database`.
/// The live database is only touched after the artifact passed its integrity check.
pub(crate) async fn perform_restore(
    executor: &BackupExecutor,
    backup_id: u64,
    target_database: &str,
    ctx: &JobContext,
) -> Result<JobOutput> {
    info!(backup_id, database = %target_database, task_id = %ctx.task_id, "🚀 Starting restore");
    match run_steps(executor, backup_id, target_database, ctx).await {
        Ok(output) => {
            info!(backup_id, database = %target_database, "✅ Restore completed");
            Ok(output)
        }
        Err(e) => {
            error!(backup_id, database = %target_database, error = %e, "❌ Restore failed");
            Err(e)
        }
    }
}

async fn run_steps(
    executor: &BackupExecutor,
    backup_id: u64,
    target_database: &str,
    ctx: &JobContext,
) -> Result<JobOutput> {
    let cipher = executor.cipher()?.clone();

    ctx.progress("Loading backup metadata").await;
    let record = executor.catalog.get(backup_id).await?;
    if record.status != BackupStatus::Success {
        return Err(AppError::Validation(format!(
            "backup {} is not restorable, its status is {:?}",
            backup_id, record.status
        )));
    }
    let (storage_type, location) = record
        .artifact()
        .ok_or_else(|| AppError::NotFound(format!("artifact of backup {}", backup_id)))?;

    ctx.progress("Resolving target credentials").await;
    let credentials = executor.resolver.resolve(target_database).await?;

    // downloaded artifact and recovered dump never leave this directory
    let work_dir = tempfile::tempdir()
        .map_err(|e| AppError::RestoreFailed(format!("could not create work directory: {}", e)))?;
    let artifact_path = work_dir.path().join("artifact");

    ctx.progress("Downloading backup").await;
    executor
        .storage
        .get(storage_type, location, &artifact_path)
        .await
        .map_err(|e| e.io_as(AppError::RestoreFailed))?;

    ctx.progress("Decrypting and verifying backup").await;
    let encrypted = record.encrypted;
    let checksum = record.checksum.clone();
    let opening_dir = work_dir.path().to_path_buf();
    let dump_path = tokio::task::spawn_blocking(move || {
        let dump_path = cipher.open_file(&artifact_path, encrypted, &opening_dir)?;
        verify_checksum(&dump_path, checksum.as_deref())?;
        Ok::<_, AppError>(dump_path)
    })
    .await
    .map_err(|e| AppError::DecryptionError(format!("decryption task aborted: {}", e)))?
    .map_err(|e| e.io_as(AppError::RestoreFailed))?;

    ctx.progress("Restoring database").await;
    executor
        .restore_tool
        .restore(&credentials, &dump_path)
        .await
        .map_err(|e| e.io_as(AppError::RestoreFailed))?;

    Ok(JobOutput::Restore {
        backup_id,
        database_name: target_database.to_string(),
    })
}
