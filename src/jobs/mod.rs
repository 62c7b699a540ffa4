// dbguardian/src/jobs/mod.rs
//! Task status model, its durable store, and the worker pool that runs jobs.

pub mod pool;
pub mod store;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::warn;
use uuid::Uuid;

use crate::errors::{AppError, ErrorKind, Result};
use crate::storage::StorageType;
use crate::utils::state_db::decode_error;

pub use pool::WorkerPool;
pub use store::JobStatusStore;

pub type TaskId = Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Pending,
    Progress,
    Success,
    Failure,
}

impl JobState {
    pub fn as_str(self) -> &'static str {
        match self {
            JobState::Pending => "pending",
            JobState::Progress => "progress",
            JobState::Success => "success",
            JobState::Failure => "failure",
        }
    }

    pub(crate) fn from_db(value: &str) -> Result<Self> {
        match value {
            "pending" => Ok(JobState::Pending),
            "progress" => Ok(JobState::Progress),
            "success" => Ok(JobState::Success),
            "failure" => Ok(JobState::Failure),
            other => Err(decode_error(format!("unknown job state '{}'", other))),
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, JobState::Success | JobState::Failure)
    }

    fn rank(self) -> u8 {
        match self {
            JobState::Pending => 0,
            JobState::Progress => 1,
            JobState::Success | JobState::Failure => 2,
        }
    }

    /// Transitions only move forward; `progress -> progress` refreshes the message.
    pub fn can_move_to(self, next: JobState) -> bool {
        !self.is_terminal()
            && (next.rank() > self.rank() || (self == JobState::Progress && next == JobState::Progress))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobKind {
    Backup,
    Restore,
}

impl JobKind {
    pub fn as_str(self) -> &'static str {
        match self {
            JobKind::Backup => "backup",
            JobKind::Restore => "restore",
        }
    }

    pub(crate) fn from_db(value: &str) -> Result<Self> {
        match value {
            "backup" => Ok(JobKind::Backup),
            "restore" => Ok(JobKind::Restore),
            other => Err(decode_error(format!("unknown job kind '{}'", other))),
        }
    }
}

/// What a job was asked to do. `database_name` is the admission key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum JobSpec {
    Backup {
        database_name: String,
    },
    Restore {
        backup_id: u64,
        database_name: String,
    },
}

impl JobSpec {
    pub fn database_name(&self) -> &str {
        match self {
            JobSpec::Backup { database_name } | JobSpec::Restore { database_name, .. } => {
                database_name
            }
        }
    }

    pub fn kind(&self) -> JobKind {
        match self {
            JobSpec::Backup { .. } => JobKind::Backup,
            JobSpec::Restore { .. } => JobKind::Restore,
        }
    }
}

/// Result payload of a successful job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum JobOutput {
    Backup {
        backup_id: u64,
        backup_name: String,
        storage_type: StorageType,
        storage_location: String,
        size_bytes: u64,
    },
    Restore {
        backup_id: u64,
        database_name: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobError {
    pub kind: ErrorKind,
    pub detail: String,
}

impl From<&AppError> for JobError {
    fn from(err: &AppError) -> Self {
        JobError {
            kind: err.kind(),
            detail: err.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskStatus {
    pub task_id: TaskId,
    pub kind: JobKind,
    pub database_name: String,
    pub status: JobState,
    pub message: String,
    pub result: Option<JobOutput>,
    pub error: Option<JobError>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TaskStatus {
    pub fn pending(task_id: TaskId, spec: &JobSpec) -> Self {
        let now = Utc::now();
        TaskStatus {
            task_id,
            kind: spec.kind(),
            database_name: spec.database_name().to_string(),
            status: JobState::Pending,
            message: "Task is pending".to_string(),
            result: None,
            error: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Handle a running job uses to publish progress messages.
#[derive(Clone)]
pub struct JobContext {
    pub task_id: TaskId,
    store: Arc<JobStatusStore>,
}

impl JobContext {
    pub fn new(task_id: TaskId, store: Arc<JobStatusStore>) -> Self {
        Self { task_id, store }
    }

    /// Best effort: a failed progress write must not fail the job itself.
    pub async fn progress(&self, message: &str) {
        if let Err(e) = self
            .store
            .transition(self.task_id, JobState::Progress, message, None, None)
            .await
        {
            warn!(task_id = %self.task_id, error = %e, "Failed to record job progress");
        }
    }
}

/// Executes the jobs the pool admits.
#[async_trait]
pub trait JobHandler: Send + Sync {
    /// Synchronous admission checks, surfaced to the submitter.
    fn admit(&self, spec: &JobSpec) -> Result<()>;

    async fn run(&self, spec: &JobSpec, ctx: &JobContext) -> Result<JobOutput>;
}
