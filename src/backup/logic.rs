// dbguardian/src/backup/logic.rs
use tracing::{error, info, warn};

use super::BackupExecutor;
use crate::catalog::{BackupRecord, CompletedBackup};
use crate::crypto::{ArtifactCipher, sha256_file};
use crate::errors::{AppError, Result};
use crate::jobs::{JobContext, JobOutput};
use crate::storage::artifact_key;

/// Dump, checksum, encrypt and store one database.
///
/// The attempt is recorded in the catalog up front so a failure stays visible with
/// its reason. A stored artifact whose record cannot be finalized is deleted again.
pub(crate) async fn perform_backup(
    executor: &BackupExecutor,
    database_name: &str,
    ctx: &JobContext,
) -> Result<JobOutput> {
    let cipher = executor.cipher()?.clone();
    let record = executor
        .catalog
        .create(ctx.task_id, database_name, cipher.is_encrypted())
        .await?;
    info!(
        database = %database_name,
        backup_id = record.id,
        task_id = %ctx.task_id,
        "🚀 Starting backup"
    );

    let completed = match run_steps(executor, &cipher, &record, ctx).await {
        Ok(completed) => completed,
        Err(e) => {
            error!(database = %database_name, backup_id = record.id, error = %e, "❌ Backup failed");
            if let Err(mark_err) = executor.catalog.mark_failed(record.id, &e.to_string()).await {
                error!(backup_id = record.id, error = %mark_err, "Failed to record backup failure");
            }
            return Err(e);
        }
    };

    let artifact = completed.artifact.clone();
    match executor.catalog.mark_succeeded(record.id, completed).await {
        Ok(done) => {
            info!(
                database = %database_name,
                backup_id = done.id,
                storage_type = %artifact.storage_type,
                size_bytes = artifact.size_bytes,
                "✅ Backup completed"
            );
            Ok(JobOutput::Backup {
                backup_id: done.id,
                backup_name: done.backup_name,
                storage_type: artifact.storage_type,
                storage_location: artifact.location,
                size_bytes: artifact.size_bytes,
            })
        }
        Err(e) => {
            warn!(backup_id = record.id, error = %e, "Could not finalize backup record, removing orphan artifact");
            if let Err(del_err) = executor
                .storage
                .delete(artifact.storage_type, &artifact.location)
                .await
            {
                error!(location = %artifact.location, error = %del_err, "Failed to remove orphan artifact");
            }
            let _ = executor.catalog.mark_failed(record.id, &e.to_string()).await;
            Err(e)
        }
    }
}

async fn run_steps(
    executor: &BackupExecutor,
    cipher: &ArtifactCipher,
    record: &BackupRecord,
    ctx: &JobContext,
) -> Result<CompletedBackup> {
    ctx.progress("Resolving database credentials").await;
    let credentials = executor.resolver.resolve(&record.database_name).await?;
    executor.catalog.mark_progress(record.id).await?;

    // dump and sealed artifact live here until the upload finishes
    let work_dir = tempfile::tempdir()
        .map_err(|e| AppError::DumpFailed(format!("could not create work directory: {}", e)))?;
    let dump_path = work_dir.path().join("database.dump");

    ctx.progress("Creating database dump").await;
    executor
        .dump_tool
        .dump(&credentials, &dump_path)
        .await
        .map_err(|e| e.io_as(AppError::DumpFailed))?;

    ctx.progress("Encrypting backup").await;
    let sealing_cipher = cipher.clone();
    let sealing_dir = work_dir.path().to_path_buf();
    let (checksum, artifact_path) = tokio::task::spawn_blocking(move || {
        let checksum = sha256_file(&dump_path).map_err(|e| e.io_as(AppError::DumpFailed))?;
        let artifact_path = sealing_cipher
            .seal_file(&dump_path, &sealing_dir)
            .map_err(|e| e.io_as(AppError::EncryptionFailed))?;
        Ok::<_, AppError>((checksum, artifact_path))
    })
    .await
    .map_err(|e| AppError::EncryptionFailed(format!("encryption task aborted: {}", e)))??;

    ctx.progress("Uploading backup to storage").await;
    let key = artifact_key(&record.database_name, &record.backup_name);
    let stored = executor.storage.put(&key, &artifact_path).await?;

    Ok(CompletedBackup {
        artifact: stored,
        checksum,
        encrypted: cipher.is_encrypted(),
    })
}

#[cfg(test)]
mod tests {
    use super::super::testing::{Harness, HarnessOptions, TEST_KEY, harness};
    use super::*;
    use crate::catalog::BackupStatus;
    use crate::config::EncryptionSettings;
    use crate::crypto;
    use crate::jobs::{JobSpec, TaskStatus};
    use crate::storage::StorageType;
    use uuid::Uuid;

    async fn context(h: &Harness, database_name: &str) -> anyhow::Result<JobContext> {
        let task_id = Uuid::new_v4();
        let spec = JobSpec::Backup {
            database_name: database_name.to_string(),
        };
        h.tasks.insert(TaskStatus::pending(task_id, &spec)).await?;
        Ok(JobContext::new(task_id, h.tasks.clone()))
    }

    #[tokio::test]
    async fn test_backup_writes_encrypted_artifact_to_primary() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let h = harness(dir.path(), HarnessOptions::default()).await?;
        let ctx = context(&h, "sales").await?;

        let output = perform_backup(&h.executor, "sales", &ctx).await?;
        let JobOutput::Backup { backup_id, backup_name, storage_type, .. } = output else {
            panic!("expected backup output");
        };
        assert_eq!(storage_type, StorageType::Primary);
        assert!(backup_name.starts_with("backup_sales_") && backup_name.ends_with(".dump.enc"));

        let record = h.catalog.get(backup_id).await?;
        assert_eq!(record.status, BackupStatus::Success);
        assert!(record.encrypted);
        let stored = h.primary.objects.lock().unwrap().get(&format!("sales/{}", backup_name)).cloned();
        let stored = stored.expect("artifact on primary");
        let plaintext = crypto::decrypt(&stored, &TEST_KEY)?;
        assert_eq!(record.checksum, Some(crypto::sha256_hex(&plaintext)));
        Ok(())
    }

    #[tokio::test]
    async fn test_unreachable_primary_records_fallback_storage() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let h = harness(
            dir.path(),
            HarnessOptions {
                primary_unreachable: true,
                ..Default::default()
            },
        )
        .await?;
        let ctx = context(&h, "sales").await?;

        let output = perform_backup(&h.executor, "sales", &ctx).await?;
        let JobOutput::Backup { backup_id, storage_location, .. } = output else {
            panic!("expected backup output");
        };
        let record = h.catalog.get(backup_id).await?;
        assert_eq!(record.storage_type, Some(StorageType::Fallback));
        assert!(std::path::Path::new(&storage_location).is_file());
        Ok(())
    }

    #[tokio::test]
    async fn test_dump_failure_leaves_failed_record_and_no_artifact() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let h = harness(
            dir.path(),
            HarnessOptions {
                failing_dumps: vec!["sales".to_string()],
                ..Default::default()
            },
        )
        .await?;
        let ctx = context(&h, "sales").await?;

        let err = perform_backup(&h.executor, "sales", &ctx).await.unwrap_err();
        assert!(matches!(err, AppError::DumpFailed(_)));
        let records = h.catalog.list(Some("sales")).await?;
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].status, BackupStatus::Failure);
        assert!(records[0].failure_reason.as_deref().unwrap_or("").contains("pg_dump"));
        assert_eq!(h.primary.len(), 0);
        Ok(())
    }

    #[tokio::test]
    async fn test_unknown_database_is_credential_not_found() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let h = harness(dir.path(), HarnessOptions::default()).await?;
        let ctx = context(&h, "ghost").await?;

        let err = perform_backup(&h.executor, "ghost", &ctx).await.unwrap_err();
        assert!(matches!(err, AppError::CredentialNotFound(_)));
        assert!(h.dump.dumped.lock().unwrap().is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_artifact_checksum_covers_whole_multi_segment_dump() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let h = harness(
            dir.path(),
            HarnessOptions {
                dump_len: Some(3 * crypto::SEGMENT_LEN + 17),
                ..Default::default()
            },
        )
        .await?;
        let ctx = context(&h, "sales").await?;

        let output = perform_backup(&h.executor, "sales", &ctx).await?;
        let JobOutput::Backup { backup_id, backup_name, size_bytes, .. } = output else {
            panic!("expected backup output");
        };
        let stored = h.primary.objects.lock().unwrap().get(&format!("sales/{}", backup_name)).cloned();
        let stored = stored.expect("artifact on primary");
        assert_eq!(size_bytes, stored.len() as u64);

        let plaintext = crypto::decrypt(&stored, &TEST_KEY)?;
        assert_eq!(plaintext.len(), 3 * crypto::SEGMENT_LEN + 17);
        assert_eq!(h.catalog.get(backup_id).await?.checksum, Some(crypto::sha256_hex(&plaintext)));
        Ok(())
    }

    #[tokio::test]
    async fn test_plaintext_mode_stores_raw_dump() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let h = harness(
            dir.path(),
            HarnessOptions {
                encryption: EncryptionSettings {
                    key: None,
                    allow_plaintext: true,
                },
                ..Default::default()
            },
        )
        .await?;
        let ctx = context(&h, "hr").await?;

        let output = perform_backup(&h.executor, "hr", &ctx).await?;
        let JobOutput::Backup { backup_id, backup_name, .. } = output else {
            panic!("expected backup output");
        };
        assert!(backup_name.ends_with(".dump"));
        assert!(!h.catalog.get(backup_id).await?.encrypted);
        let stored = h.primary.objects.lock().unwrap().get(&format!("hr/{}", backup_name)).cloned();
        assert_eq!(stored, Some(crate::backup::db_dump::testing::dump_bytes("hr")));
        Ok(())
    }
}
