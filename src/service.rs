// dbguardian/src/service.rs
//! The operations exposed to the outside: backups, restores, task polling,
//! schedule management and status introspection.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::backup::{BackupExecutor, DumpTool, PgDump};
use crate::catalog::{BackupCatalog, BackupRecord, BackupStatus};
use crate::config::AppConfig;
use crate::credentials::{CredentialResolver, CredentialStore, JsonCredentialStore};
use crate::crypto::ArtifactCipher;
use crate::errors::{AppError, Result};
use crate::jobs::{JobSpec, JobStatusStore, TaskId, TaskStatus, WorkerPool};
use crate::restore::{PgRestore, RestoreTool};
use crate::scheduler::{ScheduleFilter, ScheduleRecord, ScheduleRequest, ScheduleStore, Scheduler};
use crate::storage::Storage;
use crate::utils::state_db::{self, STATE_DB_FILE};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Health {
    Healthy,
    Degraded,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComponentHealth {
    pub status: Health,
    pub detail: Option<String>,
}

impl ComponentHealth {
    fn healthy() -> Self {
        Self {
            status: Health::Healthy,
            detail: None,
        }
    }

    fn degraded(detail: impl Into<String>) -> Self {
        Self {
            status: Health::Degraded,
            detail: Some(detail.into()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SystemStatus {
    pub credential_store: ComponentHealth,
    pub workers: ComponentHealth,
    pub storage: ComponentHealth,
    pub overall: Health,
}

/// What is configured, never the secrets themselves.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigInfo {
    pub encryption_enabled: bool,
    pub plaintext_allowed: bool,
    pub primary_storage_configured: bool,
    pub fallback_storage_dir: String,
    pub scheduling_enabled: bool,
    pub worker_pool_width: usize,
    pub scheduler_tick_seconds: u64,
    pub task_retention_hours: u64,
}

pub struct BackupService {
    config: Arc<AppConfig>,
    resolver: CredentialResolver,
    catalog: Arc<BackupCatalog>,
    storage: Storage,
    tasks: Arc<JobStatusStore>,
    pool: WorkerPool,
    schedules: Arc<ScheduleStore>,
    scheduler: Arc<Scheduler>,
    scheduler_started: AtomicBool,
}

impl BackupService {
    /// Production wiring: S3 + local fallback, JSON credential file, pg_dump/pg_restore.
    pub async fn from_config(config: Arc<AppConfig>) -> Result<Self> {
        let storage = Storage::from_config(&config).await;
        let credentials = Arc::new(JsonCredentialStore::new(config.credentials_file.clone()));
        Self::build(config, storage, credentials, Arc::new(PgDump), Arc::new(PgRestore)).await
    }

    /// Opens the durable state under `state_dir` and starts the worker pool.
    pub async fn build(
        config: Arc<AppConfig>,
        storage: Storage,
        credential_store: Arc<dyn CredentialStore>,
        dump_tool: Arc<dyn DumpTool>,
        restore_tool: Arc<dyn RestoreTool>,
    ) -> Result<Self> {
        let db = state_db::open(&config.state_dir.join(STATE_DB_FILE)).await?;
        let tasks = Arc::new(JobStatusStore::open(db.clone()).await?);
        let catalog = Arc::new(BackupCatalog::open(db.clone()).await?);
        let schedules = Arc::new(ScheduleStore::open(db).await?);

        let resolver = CredentialResolver::new(credential_store);
        let executor = Arc::new(BackupExecutor::new(
            catalog.clone(),
            storage.clone(),
            resolver.clone(),
            ArtifactCipher::from_settings(&config.encryption),
            dump_tool,
            restore_tool,
        ));
        let pool = WorkerPool::start(config.worker_pool_width, tasks.clone(), executor);
        let scheduler = Arc::new(Scheduler::new(
            schedules.clone(),
            tasks.clone(),
            pool.clone(),
            config.scheduler_tick,
            config.task_retention,
        ));

        Ok(Self {
            config,
            resolver,
            catalog,
            storage,
            tasks,
            pool,
            schedules,
            scheduler,
            scheduler_started: AtomicBool::new(false),
        })
    }

    /// Spawns the scheduler loop unless scheduling is disabled in configuration.
    pub fn start_scheduler(&self, shutdown: CancellationToken) -> Option<JoinHandle<()>> {
        if !self.config.scheduler_enabled {
            info!("Scheduling disabled by configuration");
            return None;
        }
        self.scheduler_started.store(true, Ordering::SeqCst);
        Some(tokio::spawn(self.scheduler.clone().run(shutdown)))
    }

    /// One backup job per database; `None` means every registered database.
    ///
    /// In the fan-out case databases that already have an active job are skipped.
    pub async fn create_backup(&self, database_name: Option<&str>) -> Result<Vec<TaskStatus>> {
        if let Some(database_name) = database_name {
            let status = self.submit(JobSpec::Backup {
                database_name: database_name.to_string(),
            })
            .await?;
            return Ok(vec![status]);
        }

        let names = self.resolver.database_names().await?;
        if names.is_empty() {
            return Err(AppError::Validation("no databases are registered".to_string()));
        }
        let mut submitted = Vec::new();
        for name in &names {
            match self
                .submit(JobSpec::Backup {
                    database_name: name.clone(),
                })
                .await
            {
                Ok(status) => submitted.push(status),
                Err(AppError::AlreadyRunning(db)) => {
                    info!(database = %db, "Skipping database with an active job");
                }
                Err(e) => return Err(e),
            }
        }
        if submitted.is_empty() {
            return Err(AppError::AlreadyRunning(names.join(", ")));
        }
        Ok(submitted)
    }

    pub async fn task_status(&self, task_id: TaskId) -> Result<TaskStatus> {
        self.tasks.get(task_id).await
    }

    pub async fn cancel_task(&self, task_id: TaskId) -> Result<()> {
        self.tasks.get(task_id).await?;
        self.pool.cancel(task_id)
    }

    /// Newest first.
    pub async fn list_backups(&self, database_name: Option<&str>) -> Result<Vec<BackupRecord>> {
        self.catalog.list(database_name).await
    }

    pub async fn get_backup(&self, backup_id: u64) -> Result<BackupRecord> {
        self.catalog.get(backup_id).await
    }

    /// Removes the artifact, then the record. An artifact that is already gone
    /// does not block removing the record.
    pub async fn delete_backup(&self, backup_id: u64) -> Result<BackupRecord> {
        let record = self.catalog.get(backup_id).await?;
        if record.status.is_in_flight() {
            return Err(AppError::AlreadyRunning(record.database_name));
        }
        if let Some((storage_type, location)) = record.artifact() {
            match self.storage.delete(storage_type, location).await {
                Ok(()) => {}
                Err(AppError::NotFound(_)) => {
                    warn!(backup_id, location, "Artifact already missing, removing record only");
                }
                Err(e) => return Err(e),
            }
        }
        let removed = self.catalog.remove(backup_id).await?;
        info!(backup_id, database = %removed.database_name, "Backup deleted");
        Ok(removed)
    }

    /// Restores a successful backup into its own database, or into `target_database`.
    pub async fn restore_backup(
        &self,
        backup_id: u64,
        target_database: Option<&str>,
    ) -> Result<TaskStatus> {
        let record = self.catalog.get(backup_id).await?;
        if record.status != BackupStatus::Success {
            return Err(AppError::Validation(format!(
                "backup {} is not restorable, its status is {:?}",
                backup_id, record.status
            )));
        }
        let database_name = target_database
            .map(str::to_string)
            .unwrap_or(record.database_name);
        self.submit(JobSpec::Restore {
            backup_id,
            database_name,
        })
        .await
    }

    async fn submit(&self, spec: JobSpec) -> Result<TaskStatus> {
        self.pool.submit(spec).await
    }

    pub async fn create_schedule(&self, request: ScheduleRequest) -> Result<ScheduleRecord> {
        self.schedules.create(request, Utc::now()).await
    }

    pub async fn list_schedules(&self, filter: &ScheduleFilter) -> Result<Vec<ScheduleRecord>> {
        self.schedules.list(filter).await
    }

    pub async fn get_schedule(&self, schedule_id: u64) -> Result<ScheduleRecord> {
        self.schedules.get(schedule_id).await
    }

    pub async fn update_schedule(
        &self,
        schedule_id: u64,
        request: ScheduleRequest,
    ) -> Result<ScheduleRecord> {
        self.schedules.update(schedule_id, request, Utc::now()).await
    }

    pub async fn delete_schedule(&self, schedule_id: u64) -> Result<ScheduleRecord> {
        self.schedules.delete(schedule_id).await
    }

    pub async fn trigger_schedule(&self, schedule_id: u64) -> Result<TaskStatus> {
        self.scheduler.trigger(schedule_id, Utc::now()).await
    }

    pub async fn system_status(&self) -> SystemStatus {
        let credential_store = match self.resolver.check().await {
            Ok(()) => ComponentHealth::healthy(),
            Err(e) => ComponentHealth::degraded(e.to_string()),
        };

        let workers = if !self.pool.is_dispatching() {
            ComponentHealth::degraded("worker pool dispatcher is not running")
        } else if self.scheduler_started.load(Ordering::SeqCst)
            && !self.scheduler.is_healthy(Utc::now())
        {
            ComponentHealth::degraded("scheduler has not ticked recently")
        } else {
            ComponentHealth::healthy()
        };

        let storage = match self.storage.check_primary().await {
            Ok(()) => ComponentHealth::healthy(),
            Err(primary_err) => match self.storage.check_fallback().await {
                Ok(()) => ComponentHealth::degraded(format!(
                    "writing to fallback storage: {}",
                    primary_err
                )),
                Err(fallback_err) => ComponentHealth::degraded(format!(
                    "primary: {}; fallback: {}",
                    primary_err, fallback_err
                )),
            },
        };

        let overall = if [&credential_store, &workers, &storage]
            .iter()
            .all(|c| c.status == Health::Healthy)
        {
            Health::Healthy
        } else {
            Health::Degraded
        };
        SystemStatus {
            credential_store,
            workers,
            storage,
            overall,
        }
    }

    pub fn config_info(&self) -> ConfigInfo {
        ConfigInfo {
            encryption_enabled: self.config.encryption.key.is_some(),
            plaintext_allowed: self.config.encryption.allow_plaintext,
            primary_storage_configured: self.storage.primary_configured(),
            fallback_storage_dir: self.config.fallback_storage_dir.display().to_string(),
            scheduling_enabled: self.config.scheduler_enabled,
            worker_pool_width: self.pool.width(),
            scheduler_tick_seconds: self.scheduler.tick_period().as_secs(),
            task_retention_hours: self.config.task_retention.as_secs() / 3600,
        }
    }
}
