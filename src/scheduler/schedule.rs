// dbguardian/src/scheduler/schedule.rs
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sqlx::Row;
use sqlx::sqlite::{SqlitePool, SqliteRow};
use tracing::{debug, info};

use super::cron::CronExpr;
use crate::errors::{AppError, Result};
use crate::utils::state_db::{apply_schema, decode_error};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScheduleKind {
    Interval,
    #[serde(alias = "crontab")]
    Cron,
}

impl ScheduleKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ScheduleKind::Interval => "interval",
            ScheduleKind::Cron => "cron",
        }
    }

    fn from_db(value: &str) -> Result<Self> {
        match value {
            "interval" => Ok(ScheduleKind::Interval),
            "cron" | "crontab" => Ok(ScheduleKind::Cron),
            other => Err(decode_error(format!("unknown schedule kind '{}'", other))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleRecord {
    pub id: u64,
    pub database_name: String,
    pub kind: ScheduleKind,
    pub interval_minutes: Option<u32>,
    pub cron_expression: Option<String>,
    pub enabled: bool,
    pub created_at: DateTime<Utc>,
    pub last_run: Option<DateTime<Utc>>,
    /// Absent while disabled.
    pub next_run: Option<DateTime<Utc>>,
}

fn default_enabled() -> bool {
    true
}

/// User-editable fields of a schedule, as submitted on create and update.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleRequest {
    pub database_name: String,
    pub kind: ScheduleKind,
    #[serde(default)]
    pub interval_minutes: Option<u32>,
    #[serde(default)]
    pub cron_expression: Option<String>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

/// Parsed and validated cadence of a schedule.
#[derive(Debug, Clone)]
enum Cadence {
    Interval(Duration),
    Cron(CronExpr),
}

impl Cadence {
    fn next_after(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            Cadence::Interval(interval) => Some(now + *interval),
            Cadence::Cron(expr) => expr.next_after(now),
        }
    }
}

impl ScheduleRequest {
    /// Exactly one of interval/cron populated, matching `kind`; cron must parse and
    /// be able to fire.
    fn validate(&self, now: DateTime<Utc>) -> Result<Cadence> {
        if self.database_name.trim().is_empty() {
            return Err(AppError::Validation("database_name must not be empty".to_string()));
        }
        match (self.kind, self.interval_minutes, self.cron_expression.as_deref()) {
            (ScheduleKind::Interval, Some(minutes), None) => {
                if minutes == 0 {
                    return Err(AppError::Validation(
                        "interval_minutes must be greater than zero".to_string(),
                    ));
                }
                Ok(Cadence::Interval(Duration::minutes(i64::from(minutes))))
            }
            (ScheduleKind::Cron, None, Some(expression)) => {
                let expr: CronExpr = expression.parse().map_err(|e| {
                    AppError::Validation(format!("invalid cron expression '{}': {}", expression, e))
                })?;
                if expr.next_after(now).is_none() {
                    return Err(AppError::Validation(format!(
                        "cron expression '{}' never fires",
                        expression
                    )));
                }
                Ok(Cadence::Cron(expr))
            }
            (ScheduleKind::Interval, _, _) => Err(AppError::Validation(
                "interval schedules need interval_minutes and no cron_expression".to_string(),
            )),
            (ScheduleKind::Cron, _, _) => Err(AppError::Validation(
                "cron schedules need cron_expression and no interval_minutes".to_string(),
            )),
        }
    }
}

impl ScheduleRecord {
    fn cadence(&self) -> Result<Cadence> {
        ScheduleRequest {
            database_name: self.database_name.clone(),
            kind: self.kind,
            interval_minutes: self.interval_minutes,
            cron_expression: self.cron_expression.clone(),
            enabled: self.enabled,
        }
        .validate(Utc::now())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleFilter {
    pub database_name: Option<String>,
    #[serde(default)]
    pub enabled_only: bool,
}

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS backup_schedules (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        database_name TEXT NOT NULL,
        kind TEXT NOT NULL,
        interval_minutes INTEGER,
        cron_expression TEXT,
        enabled INTEGER NOT NULL,
        created_at TEXT NOT NULL,
        last_run TEXT,
        next_run TEXT
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_backup_schedules_next_run ON backup_schedules (enabled, next_run)",
];

const SELECT_SCHEDULE: &str = r#"
    SELECT
        id, database_name, kind, interval_minutes, cron_expression, enabled,
        created_at, last_run, next_run
    FROM backup_schedules
"#;

pub struct ScheduleStore {
    pool: SqlitePool,
}

impl ScheduleStore {
    pub async fn open(pool: SqlitePool) -> Result<Self> {
        apply_schema(&pool, SCHEMA).await?;
        info!("Schedule store opened");
        Ok(Self { pool })
    }

    pub async fn create(&self, request: ScheduleRequest, now: DateTime<Utc>) -> Result<ScheduleRecord> {
        let cadence = request.validate(now)?;
        let next_run = if request.enabled { cadence.next_after(now) } else { None };

        let row_id = sqlx::query(
            r#"
            INSERT INTO backup_schedules (
                database_name, kind, interval_minutes, cron_expression, enabled, created_at, next_run
            )
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&request.database_name)
        .bind(request.kind.as_str())
        .bind(request.interval_minutes.map(i64::from))
        .bind(&request.cron_expression)
        .bind(request.enabled)
        .bind(now)
        .bind(next_run)
        .execute(&self.pool)
        .await?
        .last_insert_rowid();

        let record = ScheduleRecord {
            id: row_id as u64,
            database_name: request.database_name,
            kind: request.kind,
            interval_minutes: request.interval_minutes,
            cron_expression: request.cron_expression,
            enabled: request.enabled,
            created_at: now,
            last_run: None,
            next_run,
        };
        info!(schedule_id = record.id, database = %record.database_name, next_run = ?record.next_run, "Schedule created");
        Ok(record)
    }

    pub async fn get(&self, id: u64) -> Result<ScheduleRecord> {
        let row = sqlx::query(&format!("{} WHERE id = ?", SELECT_SCHEDULE))
            .bind(id as i64)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => row_to_schedule(&row),
            None => Err(AppError::NotFound(format!("schedule {}", id))),
        }
    }

    /// Newest first.
    pub async fn list(&self, filter: &ScheduleFilter) -> Result<Vec<ScheduleRecord>> {
        let rows = sqlx::query(&format!(
            r#"{}
            WHERE (? IS NULL OR database_name = ?) AND (? = 0 OR enabled = 1)
            ORDER BY created_at DESC, id DESC
            "#,
            SELECT_SCHEDULE
        ))
        .bind(filter.database_name.as_deref())
        .bind(filter.database_name.as_deref())
        .bind(filter.enabled_only)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_schedule).collect()
    }

    /// Replaces the user-editable fields. `next_run` is recomputed from `now` while
    /// enabled and cleared when disabled; `last_run` is kept.
    pub async fn update(
        &self,
        id: u64,
        request: ScheduleRequest,
        now: DateTime<Utc>,
    ) -> Result<ScheduleRecord> {
        let cadence = request.validate(now)?;
        let next_run = if request.enabled { cadence.next_after(now) } else { None };

        let updated = sqlx::query(
            r#"
            UPDATE backup_schedules
            SET database_name = ?, kind = ?, interval_minutes = ?, cron_expression = ?,
                enabled = ?, next_run = ?
            WHERE id = ?
            "#,
        )
        .bind(&request.database_name)
        .bind(request.kind.as_str())
        .bind(request.interval_minutes.map(i64::from))
        .bind(&request.cron_expression)
        .bind(request.enabled)
        .bind(next_run)
        .bind(id as i64)
        .execute(&self.pool)
        .await?
        .rows_affected();
        if updated == 0 {
            return Err(AppError::NotFound(format!("schedule {}", id)));
        }

        let record = self.get(id).await?;
        info!(schedule_id = id, enabled = record.enabled, next_run = ?record.next_run, "Schedule updated");
        Ok(record)
    }

    pub async fn delete(&self, id: u64) -> Result<ScheduleRecord> {
        let record = self.get(id).await?;
        let deleted = sqlx::query("DELETE FROM backup_schedules WHERE id = ?")
            .bind(id as i64)
            .execute(&self.pool)
            .await?
            .rows_affected();
        if deleted == 0 {
            return Err(AppError::NotFound(format!("schedule {}", id)));
        }
        info!(schedule_id = id, "Schedule deleted");
        Ok(record)
    }

    /// Enabled schedules whose `next_run` is at or before `now`.
    pub async fn due(&self, now: DateTime<Utc>) -> Result<Vec<ScheduleRecord>> {
        let rows = sqlx::query(&format!(
            "{} WHERE enabled = 1 AND next_run IS NOT NULL AND next_run <= ? ORDER BY next_run, id",
            SELECT_SCHEDULE
        ))
        .bind(now)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_schedule).collect()
    }

    /// Records a submitted run: `last_run = now` and `next_run` strictly after it.
    pub async fn record_run(&self, id: u64, now: DateTime<Utc>) -> Result<ScheduleRecord> {
        let mut record = self.get(id).await?;
        let next_run = if record.enabled {
            record.cadence()?.next_after(now)
        } else {
            None
        };

        let updated = sqlx::query("UPDATE backup_schedules SET last_run = ?, next_run = ? WHERE id = ?")
            .bind(now)
            .bind(next_run)
            .bind(id as i64)
            .execute(&self.pool)
            .await?
            .rows_affected();
        if updated == 0 {
            return Err(AppError::NotFound(format!("schedule {}", id)));
        }

        record.last_run = Some(now);
        record.next_run = next_run;
        debug!(schedule_id = id, next_run = ?record.next_run, "Schedule run recorded");
        Ok(record)
    }
}

fn row_to_schedule(row: &SqliteRow) -> Result<ScheduleRecord> {
    let id: i64 = row.try_get("id")?;
    let interval_minutes: Option<i64> = row.try_get("interval_minutes")?;

    Ok(ScheduleRecord {
        id: id as u64,
        database_name: row.try_get("database_name")?,
        kind: ScheduleKind::from_db(&row.try_get::<String, _>("kind")?)?,
        interval_minutes: interval_minutes
            .map(|minutes| {
                u32::try_from(minutes)
                    .map_err(|_| decode_error(format!("interval of {} minutes", minutes)))
            })
            .transpose()?,
        cron_expression: row.try_get("cron_expression")?,
        enabled: row.try_get("enabled")?,
        created_at: row.try_get("created_at")?,
        last_run: row.try_get("last_run")?,
        next_run: row.try_get("next_run")?,
    })
}
