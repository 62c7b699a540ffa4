// dbguardian/src/scheduler/mod.rs
//! Periodic evaluation of backup schedules.

pub mod cron;
pub mod schedule;

pub use cron::{CronExpr, CronField, CronParseError};
pub use schedule::{ScheduleFilter, ScheduleKind, ScheduleRecord, ScheduleRequest, ScheduleStore};

use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::errors::{AppError, Result};
use crate::jobs::{JobSpec, JobStatusStore, TaskId, TaskStatus, WorkerPool};

/// Outcome of one tick, mostly for logging and tests.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TickReport {
    pub submitted: Vec<(u64, TaskId)>,
    /// Left due because admission was refused; retried next tick.
    pub deferred: Vec<u64>,
    /// Finished task statuses dropped by the retention rule.
    pub pruned_tasks: u64,
}

pub struct Scheduler {
    schedules: Arc<ScheduleStore>,
    tasks: Arc<JobStatusStore>,
    pool: WorkerPool,
    tick: Duration,
    task_retention: Duration,
    /// One tick evaluation at a time.
    tick_lock: tokio::sync::Mutex<()>,
    heartbeat: Mutex<Option<DateTime<Utc>>>,
    ticks: AtomicU64,
}

impl Scheduler {
    pub fn new(
        schedules: Arc<ScheduleStore>,
        tasks: Arc<JobStatusStore>,
        pool: WorkerPool,
        tick: Duration,
        task_retention: Duration,
    ) -> Self {
        Self {
            schedules,
            tasks,
            pool,
            tick,
            task_retention,
            tick_lock: tokio::sync::Mutex::new(()),
            heartbeat: Mutex::new(None),
            ticks: AtomicU64::new(0),
        }
    }

    pub fn tick_period(&self) -> Duration {
        self.tick
    }

    /// Ticks until `shutdown` is cancelled. Missed ticks are skipped, not replayed.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        info!(tick_seconds = self.tick.as_secs(), "Scheduler started");
        let mut interval = tokio::time::interval(self.tick);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => {
                    self.tick_at(Utc::now()).await;
                }
            }
        }
        info!(ticks = self.tick_count(), "Scheduler stopped");
    }

    /// Submits a backup for every enabled schedule due at `now`, then drops
    /// finished task statuses older than the retention window.
    pub async fn tick_at(&self, now: DateTime<Utc>) -> TickReport {
        let _guard = self.tick_lock.lock().await;
        self.beat(now);

        let mut report = TickReport::default();
        let due = match self.schedules.due(now).await {
            Ok(due) => due,
            Err(e) => {
                error!(error = %e, "Could not load due schedules");
                Vec::new()
            }
        };
        for schedule in due {
            match self.submit(&schedule, now).await {
                Ok(status) => report.submitted.push((schedule.id, status.task_id)),
                Err(AppError::AlreadyRunning(db)) => {
                    debug!(schedule_id = schedule.id, database = %db, "Database busy, schedule stays due");
                    report.deferred.push(schedule.id);
                }
                Err(e) => {
                    warn!(schedule_id = schedule.id, database = %schedule.database_name, error = %e, "Scheduled backup not submitted");
                    report.deferred.push(schedule.id);
                }
            }
        }
        if !report.submitted.is_empty() || !report.deferred.is_empty() {
            info!(
                submitted = report.submitted.len(),
                deferred = report.deferred.len(),
                "Scheduler tick processed due schedules"
            );
        }
        report.pruned_tasks = self.prune_tasks(now).await;
        report
    }

    async fn prune_tasks(&self, now: DateTime<Utc>) -> u64 {
        let Ok(retention) = chrono::Duration::from_std(self.task_retention) else {
            return 0;
        };
        let Some(cutoff) = now.checked_sub_signed(retention) else {
            return 0;
        };
        match self.tasks.prune_finished(cutoff).await {
            Ok(pruned) => pruned,
            Err(e) => {
                error!(error = %e, "Failed to prune finished tasks");
                0
            }
        }
    }

    /// Runs an enabled schedule right away, as if it had come due.
    pub async fn trigger(&self, schedule_id: u64, now: DateTime<Utc>) -> Result<TaskStatus> {
        let _guard = self.tick_lock.lock().await;
        let schedule = self.schedules.get(schedule_id).await?;
        if !schedule.enabled {
            return Err(AppError::Validation(format!(
                "schedule {} is disabled",
                schedule_id
            )));
        }
        let status = self.submit(&schedule, now).await?;
        info!(schedule_id, task_id = %status.task_id, "Schedule triggered manually");
        Ok(status)
    }

    async fn submit(&self, schedule: &ScheduleRecord, now: DateTime<Utc>) -> Result<TaskStatus> {
        let status = self
            .pool
            .submit(JobSpec::Backup {
                database_name: schedule.database_name.clone(),
            })
            .await?;
        // the job is already admitted, a failed bookkeeping write must not hide it
        if let Err(e) = self.schedules.record_run(schedule.id, now).await {
            error!(schedule_id = schedule.id, error = %e, "Failed to record schedule run");
        }
        Ok(status)
    }

    fn beat(&self, now: DateTime<Utc>) {
        let mut heartbeat = self.heartbeat.lock().unwrap_or_else(|p| p.into_inner());
        *heartbeat = Some(now);
        self.ticks.fetch_add(1, Ordering::SeqCst);
    }

    /// Tick evaluations since start.
    pub fn tick_count(&self) -> u64 {
        self.ticks.load(Ordering::SeqCst)
    }

    pub fn last_tick(&self) -> Option<DateTime<Utc>> {
        *self.heartbeat.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Healthy while the loop has ticked within the last two periods.
    pub fn is_healthy(&self, now: DateTime<Utc>) -> bool {
        let Ok(window) = chrono::Duration::from_std(self.tick * 2) else {
            return false;
        };
        self.last_tick().is_some_and(|last| now - last <= window)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::pool::testing::GateHandler;
    use crate::jobs::{JobState, TaskStatus};
    use crate::utils::state_db;
    use chrono::TimeZone;
    use uuid::Uuid;

    const RETENTION: Duration = Duration::from_secs(24 * 3600);

    struct Fixture {
        scheduler: Scheduler,
        schedules: Arc<ScheduleStore>,
        tasks: Arc<JobStatusStore>,
        handler: Arc<GateHandler>,
        pool: WorkerPool,
        _dir: tempfile::TempDir,
    }

    async fn fixture() -> anyhow::Result<Fixture> {
        let dir = tempfile::tempdir()?;
        let db = state_db::open(&dir.path().join("state.db")).await?;
        let schedules = Arc::new(ScheduleStore::open(db.clone()).await?);
        let tasks = Arc::new(JobStatusStore::open(db).await?);
        let handler = Arc::new(GateHandler::default());
        let pool = WorkerPool::start(2, tasks.clone(), handler.clone());
        let scheduler = Scheduler::new(
            schedules.clone(),
            tasks.clone(),
            pool.clone(),
            Duration::from_secs(60),
            RETENTION,
        );
        Ok(Fixture {
            scheduler,
            schedules,
            tasks,
            handler,
            pool,
            _dir: dir,
        })
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap()
    }

    fn hourly(db: &str) -> ScheduleRequest {
        ScheduleRequest {
            database_name: db.to_string(),
            kind: ScheduleKind::Interval,
            interval_minutes: Some(60),
            cron_expression: None,
            enabled: true,
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_due_schedule_is_submitted_and_rescheduled() -> anyhow::Result<()> {
        let f = fixture().await?;
        let created = f.schedules.create(hourly("sales"), t0()).await?;

        assert!(f.scheduler.tick_at(t0()).await.submitted.is_empty());

        let due_at = t0() + chrono::Duration::minutes(60);
        let report = f.scheduler.tick_at(due_at).await;
        assert_eq!(report.submitted.len(), 1);
        assert_eq!(report.submitted[0].0, created.id);

        let after = f.schedules.get(created.id).await?;
        assert_eq!(after.last_run, Some(due_at));
        assert_eq!(after.next_run, Some(due_at + chrono::Duration::minutes(60)));
        f.handler.gate.add_permits(1);
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_busy_database_leaves_schedule_due() -> anyhow::Result<()> {
        let f = fixture().await?;
        let created = f.schedules.create(hourly("sales"), t0()).await?;
        f.pool
            .submit(JobSpec::Backup {
                database_name: "sales".to_string(),
            })
            .await?;

        let due_at = t0() + chrono::Duration::minutes(60);
        let report = f.scheduler.tick_at(due_at).await;
        assert_eq!(report.deferred, vec![created.id]);
        let untouched = f.schedules.get(created.id).await?;
        assert_eq!(untouched.last_run, None);
        assert_eq!(untouched.next_run, Some(due_at));

        f.handler.gate.add_permits(1);
        for _ in 0..1000 {
            if !f.pool.is_busy("sales") {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        let retried = f.scheduler.tick_at(due_at + chrono::Duration::minutes(1)).await;
        assert_eq!(retried.submitted.len(), 1);
        f.handler.gate.add_permits(1);
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_manual_trigger_requires_enabled_schedule() -> anyhow::Result<()> {
        let f = fixture().await?;
        let mut request = hourly("hr");
        request.enabled = false;
        let disabled = f.schedules.create(request, t0()).await?;
        assert!(matches!(
            f.scheduler.trigger(disabled.id, t0()).await,
            Err(AppError::Validation(_))
        ));
        assert!(matches!(
            f.scheduler.trigger(999, t0()).await,
            Err(AppError::NotFound(_))
        ));

        let enabled = f.schedules.create(hourly("sales"), t0()).await?;
        let status = f.scheduler.trigger(enabled.id, t0()).await?;
        assert_eq!(status.database_name, "sales");
        assert_eq!(f.schedules.get(enabled.id).await?.last_run, Some(t0()));
        f.handler.gate.add_permits(1);
        Ok(())
    }

    #[tokio::test]
    async fn test_health_tracks_heartbeat() -> anyhow::Result<()> {
        let f = fixture().await?;
        assert!(!f.scheduler.is_healthy(t0()));
        f.scheduler.tick_at(t0()).await;
        assert!(f.scheduler.is_healthy(t0() + chrono::Duration::seconds(90)));
        assert!(!f.scheduler.is_healthy(t0() + chrono::Duration::seconds(121)));
        Ok(())
    }

    #[tokio::test]
    async fn test_tick_prunes_finished_tasks_past_retention() -> anyhow::Result<()> {
        let f = fixture().await?;
        let spec = JobSpec::Backup {
            database_name: "sales".to_string(),
        };
        let finished = Uuid::new_v4();
        let waiting = Uuid::new_v4();
        f.tasks.insert(TaskStatus::pending(finished, &spec)).await?;
        f.tasks.insert(TaskStatus::pending(waiting, &spec)).await?;
        f.tasks.transition(finished, JobState::Success, "done", None, None).await?;

        // within the window nothing goes
        let report = f.scheduler.tick_at(Utc::now()).await;
        assert_eq!(report.pruned_tasks, 0);
        assert_eq!(f.tasks.get(finished).await?.status, JobState::Success);

        let later = Utc::now() + chrono::Duration::from_std(RETENTION)? + chrono::Duration::hours(1);
        let report = f.scheduler.tick_at(later).await;
        assert_eq!(report.pruned_tasks, 1);
        assert!(matches!(f.tasks.get(finished).await, Err(AppError::NotFound(_))));
        assert_eq!(f.tasks.get(waiting).await?.status, JobState::Pending);
        Ok(())
    }

    #[tokio::test]
    async fn test_run_ticks_each_period_until_cancelled() -> anyhow::Result<()> {
        let Fixture { scheduler, _dir, .. } = fixture().await?;
        let scheduler = Arc::new(scheduler);
        tokio::time::pause();

        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(scheduler.clone().run(shutdown.clone()));

        // the first tick fires immediately
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(scheduler.tick_count(), 1);
        assert!(scheduler.last_tick().is_some());

        tokio::time::sleep(scheduler.tick_period()).await;
        assert!(scheduler.tick_count() >= 2);

        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(5), handle).await??;
        let stopped_at = scheduler.tick_count();
        tokio::time::sleep(scheduler.tick_period() * 3).await;
        assert_eq!(scheduler.tick_count(), stopped_at);
        Ok(())
    }
}
