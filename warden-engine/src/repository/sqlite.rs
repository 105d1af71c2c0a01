//! SQLite job store

use super::{JobStore, StoreError};
use async_trait::async_trait;
use sqlx::SqlitePool;
use std::collections::HashMap;
use uuid::Uuid;
use warden_core::domain::event::{EventType, JobEvent};
use warden_core::domain::job::{Job, JobKind, JobStatus};
use warden_core::dto::job::{JobFilter, JobPatch};

#[derive(Debug, Clone)]
pub struct SqliteJobStore {
    pool: SqlitePool,
}

impl SqliteJobStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

#[async_trait]
impl JobStore for SqliteJobStore {
    async fn insert(&self, job: &Job) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO jobs (job_id, project_id, kind, cmd, args, env, status,
                              progress, exit_code, started_at, finished_at, pid)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(job.job_id.to_string())
        .bind(&job.project_id)
        .bind(job.kind.as_str())
        .bind(&job.cmd)
        .bind(serde_json::to_string(&job.args)?)
        .bind(serde_json::to_string(&job.env)?)
        .bind(job.status.as_str())
        .bind(job.progress.clamp(0.0, 1.0))
        .bind(job.exit_code)
        .bind(job.started_at)
        .bind(job.finished_at)
        .bind(job.pid.map(i64::from))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn update(&self, job_id: Uuid, patch: &JobPatch) -> Result<bool, StoreError> {
        // Status changes only leave `running`, which makes terminal states
        // absorbing. An errored job still running `on_error: continue` steps
        // takes bookkeeping patches.
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET status = COALESCE(?, status),
                progress = COALESCE(?, progress),
                exit_code = COALESCE(?, exit_code),
                finished_at = COALESCE(?, finished_at),
                pid = COALESCE(?, pid)
            WHERE job_id = ?
              AND (status = 'running' OR (? IS NULL AND status = 'error'))
            "#,
        )
        .bind(patch.status.map(|s| s.as_str()))
        .bind(patch.progress.map(|p| p.clamp(0.0, 1.0)))
        .bind(patch.exit_code)
        .bind(patch.finished_at)
        .bind(patch.pid.map(i64::from))
        .bind(job_id.to_string())
        .bind(patch.status.map(|s| s.as_str()))
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn get(&self, job_id: Uuid) -> Result<Option<Job>, StoreError> {
        let row = sqlx::query_as::<_, JobRow>(
            r#"
            SELECT job_id, project_id, kind, cmd, args, env, status, progress,
                   exit_code, started_at, finished_at, pid
            FROM jobs
            WHERE job_id = ?
            "#,
        )
        .bind(job_id.to_string())
        .fetch_optional(&self.pool)
        .await?;

        row.map(Job::try_from).transpose()
    }

    async fn list(&self, filter: &JobFilter) -> Result<Vec<Job>, StoreError> {
        // LIMIT -1 means no limit in SQLite
        let limit = filter.limit.map(i64::from).unwrap_or(-1);

        let rows = sqlx::query_as::<_, JobRow>(
            r#"
            SELECT job_id, project_id, kind, cmd, args, env, status, progress,
                   exit_code, started_at, finished_at, pid
            FROM jobs
            WHERE (? IS NULL OR project_id = ?)
            ORDER BY started_at DESC, rowid DESC
            LIMIT ?
            "#,
        )
        .bind(filter.project_id.as_deref())
        .bind(filter.project_id.as_deref())
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Job::try_from).collect()
    }

    async fn append_event(
        &self,
        job_id: Uuid,
        event_type: EventType,
        data: &serde_json::Value,
    ) -> Result<JobEvent, StoreError> {
        let ts = chrono::Utc::now();

        // Sequence assignment and insert happen in one statement, so
        // concurrent appends to the same job cannot share a seq
        let seq: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO job_events (job_id, seq, ts, type, data)
            SELECT ?, COALESCE(MAX(seq), 0) + 1, ?, ?, ?
            FROM job_events
            WHERE job_id = ?
            RETURNING seq
            "#,
        )
        .bind(job_id.to_string())
        .bind(ts)
        .bind(event_type.as_str())
        .bind(serde_json::to_string(data)?)
        .bind(job_id.to_string())
        .fetch_one(&self.pool)
        .await?;

        Ok(JobEvent {
            job_id,
            seq: seq as u64,
            ts,
            event_type,
            data: data.clone(),
        })
    }

    async fn list_events(&self, job_id: Uuid, after_seq: u64) -> Result<Vec<JobEvent>, StoreError> {
        let rows = sqlx::query_as::<_, EventRow>(
            r#"
            SELECT job_id, seq, ts, type, data
            FROM job_events
            WHERE job_id = ? AND seq > ?
            ORDER BY seq ASC
            "#,
        )
        .bind(job_id.to_string())
        .bind(after_seq as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(JobEvent::try_from).collect()
    }
}

#[derive(sqlx::FromRow)]
struct JobRow {
    job_id: String,
    project_id: String,
    kind: String,
    cmd: String,
    args: String,
    env: String,
    status: String,
    progress: f64,
    exit_code: Option<i32>,
    started_at: chrono::DateTime<chrono::Utc>,
    finished_at: Option<chrono::DateTime<chrono::Utc>>,
    pid: Option<i64>,
}

impl TryFrom<JobRow> for Job {
    type Error = StoreError;

    fn try_from(row: JobRow) -> Result<Self, Self::Error> {
        let kind = JobKind::parse(&row.kind)
            .ok_or_else(|| StoreError::Corrupt(format!("unknown job kind '{}'", row.kind)))?;
        let status = JobStatus::parse(&row.status)
            .ok_or_else(|| StoreError::Corrupt(format!("unknown job status '{}'", row.status)))?;
        let args: Vec<String> = serde_json::from_str(&row.args)?;
        let env: HashMap<String, String> = serde_json::from_str(&row.env)?;

        Ok(Job {
            job_id: parse_id(&row.job_id)?,
            project_id: row.project_id,
            kind,
            cmd: row.cmd,
            args,
            env,
            status,
            progress: row.progress,
            exit_code: row.exit_code,
            started_at: row.started_at,
            finished_at: row.finished_at,
            pid: row.pid.and_then(|p| u32::try_from(p).ok()),
        })
    }
}

#[derive(sqlx::FromRow)]
struct EventRow {
    job_id: String,
    seq: i64,
    ts: chrono::DateTime<chrono::Utc>,
    #[sqlx(rename = "type")]
    event_type: String,
    data: String,
}

impl TryFrom<EventRow> for JobEvent {
    type Error = StoreError;

    fn try_from(row: EventRow) -> Result<Self, Self::Error> {
        let event_type = EventType::parse(&row.event_type).ok_or_else(|| {
            StoreError::Corrupt(format!("unknown event type '{}'", row.event_type))
        })?;

        Ok(JobEvent {
            job_id: parse_id(&row.job_id)?,
            seq: row.seq as u64,
            ts: row.ts,
            event_type,
            data: serde_json::from_str(&row.data)?,
        })
    }
}

fn parse_id(raw: &str) -> Result<Uuid, StoreError> {
    Uuid::parse_str(raw).map_err(|e| StoreError::Corrupt(format!("invalid job id '{}': {}", raw, e)))
}
