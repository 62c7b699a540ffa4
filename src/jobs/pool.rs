// dbguardian/src/jobs/pool.rs
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{OwnedSemaphorePermit, Semaphore, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::{
    JobContext, JobError, JobHandler, JobSpec, JobState, JobStatusStore, TaskId, TaskStatus,
};
use crate::errors::{AppError, Result};

struct QueuedJob {
    task_id: TaskId,
    spec: JobSpec,
    cancel: CancellationToken,
    slot: ActiveSlot,
}

struct PoolInner {
    width: usize,
    semaphore: Arc<Semaphore>,
    /// database -> task currently holding it (pending or in progress)
    active: Mutex<HashMap<String, TaskId>>,
    /// cancellation handles of jobs that have not started yet
    pending: Mutex<HashMap<TaskId, CancellationToken>>,
    store: Arc<JobStatusStore>,
    handler: Arc<dyn JobHandler>,
    dispatching: AtomicBool,
}

impl PoolInner {
    fn active(&self) -> MutexGuard<'_, HashMap<String, TaskId>> {
        self.active.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn pending(&self) -> MutexGuard<'_, HashMap<TaskId, CancellationToken>> {
        self.pending.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Releases the database for new jobs when the owning job is done, however it ends.
struct ActiveSlot {
    inner: Arc<PoolInner>,
    database_name: String,
}

impl Drop for ActiveSlot {
    fn drop(&mut self) {
        self.inner.active().remove(&self.database_name);
    }
}

/// Bounded executor with per-database admission.
///
/// At most one job per database is pending or running; a second submission for the
/// same database is rejected with `AlreadyRunning`. Admitted jobs wait in arrival
/// order for one of `width` execution slots.
#[derive(Clone)]
pub struct WorkerPool {
    inner: Arc<PoolInner>,
    queue: mpsc::UnboundedSender<QueuedJob>,
}

impl WorkerPool {
    /// Spawns the dispatcher; must be called inside a tokio runtime.
    pub fn start(width: usize, store: Arc<JobStatusStore>, handler: Arc<dyn JobHandler>) -> Self {
        let width = width.max(1);
        let inner = Arc::new(PoolInner {
            width,
            semaphore: Arc::new(Semaphore::new(width)),
            active: Mutex::new(HashMap::new()),
            pending: Mutex::new(HashMap::new()),
            store,
            handler,
            dispatching: AtomicBool::new(true),
        });
        let (queue, receiver) = mpsc::unbounded_channel();
        tokio::spawn(dispatch(inner.clone(), receiver));
        info!(width, "Worker pool started");
        Self { inner, queue }
    }

    pub fn width(&self) -> usize {
        self.inner.width
    }

    pub fn active_jobs(&self) -> usize {
        self.inner.active().len()
    }

    pub fn is_busy(&self, database_name: &str) -> bool {
        self.inner.active().contains_key(database_name)
    }

    pub fn is_dispatching(&self) -> bool {
        self.inner.dispatching.load(Ordering::SeqCst)
    }

    /// Admits a job and returns its pending status. The pending status is durable
    /// before this returns, so the task id can be polled right away.
    pub async fn submit(&self, spec: JobSpec) -> Result<TaskStatus> {
        self.inner.handler.admit(&spec)?;

        let task_id = Uuid::new_v4();
        let database_name = spec.database_name().to_string();
        let slot = {
            let mut active = self.inner.active();
            if let Some(running) = active.get(&database_name) {
                debug!(database = %database_name, running = %running, "Rejecting job, database busy");
                return Err(AppError::AlreadyRunning(database_name));
            }
            active.insert(database_name.clone(), task_id);
            ActiveSlot {
                inner: self.inner.clone(),
                database_name: database_name.clone(),
            }
        };

        let status = TaskStatus::pending(task_id, &spec);
        // the slot is dropped (released) if anything below fails
        self.inner.store.insert(status.clone()).await?;

        let cancel = CancellationToken::new();
        self.inner.pending().insert(task_id, cancel.clone());
        let queued = QueuedJob {
            task_id,
            spec,
            cancel,
            slot,
        };
        if let Err(mpsc::error::SendError(job)) = self.queue.send(queued) {
            self.inner.pending().remove(&task_id);
            let err = AppError::Cancelled("worker pool is shut down".to_string());
            finish(&self.inner, job.task_id, Err(err)).await;
            return Err(AppError::Cancelled("worker pool is shut down".to_string()));
        }

        info!(task_id = %task_id, database = %database_name, "Job admitted");
        Ok(status)
    }

    /// Cancels a job that has not left `pending`. Started jobs cannot be preempted.
    pub fn cancel(&self, task_id: TaskId) -> Result<()> {
        match self.inner.pending().get(&task_id) {
            Some(token) => {
                token.cancel();
                info!(task_id = %task_id, "Pending job marked for cancellation");
                Ok(())
            }
            None => Err(AppError::Validation(format!(
                "task {} is not pending and cannot be cancelled",
                task_id
            ))),
        }
    }
}

async fn dispatch(inner: Arc<PoolInner>, mut receiver: mpsc::UnboundedReceiver<QueuedJob>) {
    while let Some(job) = receiver.recv().await {
        let permit = tokio::select! {
            acquired = inner.semaphore.clone().acquire_owned() => match acquired {
                Ok(permit) => Some(permit),
                Err(_) => break,
            },
            _ = job.cancel.cancelled() => None,
        };
        tokio::spawn(run_job(inner.clone(), job, permit));
    }
    inner.dispatching.store(false, Ordering::SeqCst);
    warn!("Worker pool dispatcher stopped");
}

async fn run_job(inner: Arc<PoolInner>, job: QueuedJob, _permit: Option<OwnedSemaphorePermit>) {
    let QueuedJob {
        task_id,
        spec,
        cancel,
        slot,
    } = job;

    // leaving `pending` and the cancellation check are one step under the lock
    let cancelled = {
        let mut pending = inner.pending();
        pending.remove(&task_id);
        cancel.is_cancelled()
    };
    if cancelled {
        finish(
            &inner,
            task_id,
            Err(AppError::Cancelled("cancelled before it started".to_string())),
        )
        .await;
        drop(slot);
        return;
    }

    if let Err(e) = inner
        .store
        .transition(task_id, JobState::Progress, "Job started", None, None)
        .await
    {
        error!(task_id = %task_id, error = %e, "Failed to record job start");
    }

    let ctx = JobContext::new(task_id, inner.store.clone());
    let outcome = inner.handler.run(&spec, &ctx).await;
    finish(&inner, task_id, outcome).await;
    drop(slot);
}

async fn finish(inner: &PoolInner, task_id: TaskId, outcome: Result<super::JobOutput>) {
    let written = match &outcome {
        Ok(output) => {
            info!(task_id = %task_id, "✅ Job completed successfully");
            inner
                .store
                .transition(
                    task_id,
                    JobState::Success,
                    "Job completed successfully",
                    Some(output.clone()),
                    None,
                )
                .await
        }
        Err(e) => {
            warn!(task_id = %task_id, error = %e, "❌ Job failed");
            inner
                .store
                .transition(
                    task_id,
                    JobState::Failure,
                    &e.to_string(),
                    None,
                    Some(JobError::from(e)),
                )
                .await
        }
    };
    if let Err(e) = written {
        error!(task_id = %task_id, error = %e, "Failed to record terminal job status");
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::jobs::JobOutput;
    use crate::storage::StorageType;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;

    /// Handler whose jobs block until the test adds gate permits.
    pub struct GateHandler {
        pub gate: Semaphore,
        pub running: AtomicUsize,
        pub peak: AtomicUsize,
        pub started: Mutex<Vec<String>>,
        pub reject_admission: bool,
    }

    impl Default for GateHandler {
        fn default() -> Self {
            Self {
                gate: Semaphore::new(0),
                running: AtomicUsize::new(0),
                peak: AtomicUsize::new(0),
                started: Mutex::new(Vec::new()),
                reject_admission: false,
            }
        }
    }

    #[async_trait]
    impl JobHandler for GateHandler {
        fn admit(&self, _spec: &JobSpec) -> Result<()> {
            if self.reject_admission {
                return Err(AppError::Configuration("no encryption key".to_string()));
            }
            Ok(())
        }

        async fn run(&self, spec: &JobSpec, ctx: &JobContext) -> Result<JobOutput> {
            self.started.lock().unwrap().push(spec.database_name().to_string());
            let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            ctx.progress("working").await;
            if let Ok(permit) = self.gate.acquire().await {
                permit.forget();
            }
            self.running.fetch_sub(1, Ordering::SeqCst);
            if spec.database_name() == "broken" {
                return Err(AppError::DumpFailed("pg_dump exited with status 1".to_string()));
            }
            Ok(JobOutput::Backup {
                backup_id: 1,
                backup_name: "b".to_string(),
                storage_type: StorageType::Primary,
                storage_location: "s3://bucket/b".to_string(),
                size_bytes: 1,
            })
        }
    }
}
