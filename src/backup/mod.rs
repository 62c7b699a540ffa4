// dbguardian/src/backup/mod.rs
//! The executor behind every job the worker pool runs.

pub mod db_dump;
mod logic;

use async_trait::async_trait;
use std::sync::Arc;

use crate::catalog::BackupCatalog;
use crate::credentials::CredentialResolver;
use crate::crypto::ArtifactCipher;
use crate::errors::{AppError, Result};
use crate::jobs::{JobContext, JobHandler, JobOutput, JobSpec};
use crate::restore::{self, RestoreTool};
use crate::storage::Storage;

pub use db_dump::{DumpTool, PgDump};

/// Runs backup and restore pipelines. Built once at startup and shared by the pool.
pub struct BackupExecutor {
    pub(crate) catalog: Arc<BackupCatalog>,
    pub(crate) storage: Storage,
    pub(crate) resolver: CredentialResolver,
    pub(crate) cipher: Option<ArtifactCipher>,
    pub(crate) dump_tool: Arc<dyn DumpTool>,
    pub(crate) restore_tool: Arc<dyn RestoreTool>,
}

impl BackupExecutor {
    pub fn new(
        catalog: Arc<BackupCatalog>,
        storage: Storage,
        resolver: CredentialResolver,
        cipher: Option<ArtifactCipher>,
        dump_tool: Arc<dyn DumpTool>,
        restore_tool: Arc<dyn RestoreTool>,
    ) -> Self {
        Self {
            catalog,
            storage,
            resolver,
            cipher,
            dump_tool,
            restore_tool,
        }
    }

    pub(crate) fn cipher(&self) -> Result<&ArtifactCipher> {
        self.cipher.as_ref().ok_or_else(|| {
            AppError::Configuration(
                "no encryption key configured and plaintext backups are not allowed".to_string(),
            )
        })
    }
}

#[async_trait]
impl JobHandler for BackupExecutor {
    fn admit(&self, _spec: &JobSpec) -> Result<()> {
        self.cipher().map(|_| ())
    }

    async fn run(&self, spec: &JobSpec, ctx: &JobContext) -> Result<JobOutput> {
        match spec {
            JobSpec::Backup { database_name } => {
                logic::perform_backup(self, database_name, ctx).await
            }
            JobSpec::Restore {
                backup_id,
                database_name,
            } => restore::perform_restore(self, *backup_id, database_name, ctx).await,
        }
    }
}
