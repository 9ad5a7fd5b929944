use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, NaiveDateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};
use serde::Serialize;
use thiserror::Error;
use uuid::Uuid;

use crate::sqlite::SqliteTarget;
use crate::VideoId;

use super::retry::RetryPolicy;

const BROKER_SCHEMA: &str = include_str!("../../../sql/broker.sql");

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("failed to open broker database {path}: {source}")]
    Open {
        source: rusqlite::Error,
        path: PathBuf,
    },
    #[error("failed to execute statement on broker database: {0}")]
    Execute(#[from] rusqlite::Error),
    #[error("broker path not configured")]
    MissingStore,
    #[error("invalid job status: {0}")]
    InvalidStatus(String),
    #[error("job payload could not be encoded: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("job not found: {0}")]
    NotFound(String),
}

pub type BrokerResult<T> = Result<T, BrokerError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Started,
    Finished,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Started => "started",
            JobStatus::Finished => "finished",
            JobStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = BrokerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(Self::Queued),
            "started" => Ok(Self::Started),
            "finished" => Ok(Self::Finished),
            "failed" => Ok(Self::Failed),
            other => Err(BrokerError::InvalidStatus(other.to_string())),
        }
    }
}

/// Payload of a transcode job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobRequest {
    pub video_id: VideoId,
    pub resolutions: Vec<String>,
}

/// Execution envelope attached to a job at submit time.
#[derive(Debug, Clone)]
pub struct JobOptions {
    pub queue: String,
    pub job_name: String,
    pub timeout: Duration,
    pub result_ttl: Duration,
    pub retry: RetryPolicy,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JobHandle {
    pub id: String,
    pub queue: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct JobRecord {
    pub id: String,
    pub queue: String,
    pub job_name: String,
    pub video_id: VideoId,
    pub resolutions: Vec<String>,
    pub status: JobStatus,
    pub timeout_s: u64,
    pub result_ttl_s: u64,
    pub retry_max: usize,
    pub retry_intervals_s: Vec<u64>,
    pub enqueued_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

impl JobRecord {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        let resolutions: String = row.get("resolutions")?;
        let intervals: String = row.get("retry_intervals_s")?;
        Ok(Self {
            id: row.get("id")?,
            queue: row.get("queue")?,
            job_name: row.get("job_name")?,
            video_id: row.get("video_id")?,
            resolutions: serde_json::from_str(&resolutions).unwrap_or_default(),
            status: row
                .get::<_, String>("status")?
                .parse()
                .unwrap_or(JobStatus::Failed),
            timeout_s: row.get::<_, i64>("timeout_s")?.max(0) as u64,
            result_ttl_s: row.get::<_, i64>("result_ttl_s")?.max(0) as u64,
            retry_max: row.get::<_, i64>("retry_max")?.max(1) as usize,
            retry_intervals_s: serde_json::from_str(&intervals).unwrap_or_default(),
            enqueued_at: parse_timestamp(row.get("enqueued_at")?),
            started_at: parse_timestamp(row.get("started_at")?),
            ended_at: parse_timestamp(row.get("ended_at")?),
            error: row.get("error")?,
        })
    }

    pub fn request(&self) -> JobRequest {
        JobRequest {
            video_id: self.video_id,
            resolutions: self.resolutions.clone(),
        }
    }

    pub fn retry_policy(&self, fast_mode: bool) -> RetryPolicy {
        RetryPolicy::from_parts(self.retry_max, &self.retry_intervals_s, fast_mode)
    }
}

/// Minimal queue contract the dispatcher needs. Implementations may be
/// remote; every error is treated as "broker unavailable".
pub trait Broker: Send + Sync + fmt::Debug {
    fn enqueue(&self, request: &JobRequest, options: &JobOptions) -> BrokerResult<JobHandle>;

    /// True when a queued or running job exists for the video.
    fn has_active_job(&self, video_id: VideoId) -> BrokerResult<bool>;

    fn ping(&self) -> BrokerResult<()>;
}

/// Worker side of the queue: claim a job and record how it ended.
pub trait JobQueue: Send + Sync + fmt::Debug {
    fn claim_next(&self, queue: &str) -> BrokerResult<Option<JobRecord>>;

    fn complete(&self, id: &str) -> BrokerResult<()>;

    fn fail(&self, id: &str, error: &str) -> BrokerResult<()>;

    fn cleanup_finished(&self) -> BrokerResult<usize>;
}

#[derive(Debug, Clone)]
pub struct SqliteBrokerBuilder {
    path: Option<PathBuf>,
    create_if_missing: bool,
}

impl Default for SqliteBrokerBuilder {
    fn default() -> Self {
        Self {
            path: None,
            create_if_missing: true,
        }
    }
}

impl SqliteBrokerBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn path(mut self, path: impl AsRef<Path>) -> Self {
        self.path = Some(path.as_ref().to_path_buf());
        self
    }

    pub fn create_if_missing(mut self, value: bool) -> Self {
        self.create_if_missing = value;
        self
    }

    pub fn build(self) -> BrokerResult<SqliteBroker> {
        let path = self.path.ok_or(BrokerError::MissingStore)?;
        Ok(SqliteBroker {
            target: SqliteTarget::new(path, false, self.create_if_missing),
        })
    }
}

/// Job queue in a SQLite file, drained by `TranscodeWorker`.
#[derive(Debug, Clone)]
pub struct SqliteBroker {
    target: SqliteTarget,
}

impl SqliteBroker {
    pub fn builder() -> SqliteBrokerBuilder {
        SqliteBrokerBuilder::new()
    }

    pub fn new(path: impl AsRef<Path>) -> BrokerResult<Self> {
        SqliteBrokerBuilder::new().path(path).build()
    }

    fn open(&self) -> BrokerResult<Connection> {
        self.target.open().map_err(|source| BrokerError::Open {
            source,
            path: self.target.path().to_path_buf(),
        })
    }

    pub fn initialize(&self) -> BrokerResult<()> {
        let conn = self.open()?;
        conn.execute_batch(BROKER_SCHEMA)?;
        Ok(())
    }

    /// Moves the oldest queued job of `queue` to `started` and returns it.
    pub fn claim_next(&self, queue: &str) -> BrokerResult<Option<JobRecord>> {
        let mut conn = self.open()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let id = tx
            .query_row(
                "SELECT id FROM transcode_jobs WHERE queue = ?1 AND status = 'queued'
                 ORDER BY enqueued_at ASC, rowid ASC LIMIT 1",
                params![queue],
                |row| row.get::<_, String>(0),
            )
            .optional()?;
        let Some(id) = id else {
            return Ok(None);
        };
        tx.execute(
            "UPDATE transcode_jobs SET status = 'started', started_at = ?1 WHERE id = ?2",
            params![Utc::now().naive_utc(), id],
        )?;
        let job = tx.query_row(
            "SELECT * FROM transcode_jobs WHERE id = ?1",
            params![id],
            JobRecord::from_row,
        )?;
        tx.commit()?;
        Ok(Some(job))
    }

    pub fn complete(&self, id: &str) -> BrokerResult<()> {
        self.finish(id, JobStatus::Finished, None)
    }

    pub fn fail(&self, id: &str, error: &str) -> BrokerResult<()> {
        self.finish(id, JobStatus::Failed, Some(error))
    }

    fn finish(&self, id: &str, status: JobStatus, error: Option<&str>) -> BrokerResult<()> {
        let conn = self.open()?;
        let updated = conn.execute(
            "UPDATE transcode_jobs SET status = ?1, ended_at = ?2, error = ?3 WHERE id = ?4",
            params![status.as_str(), Utc::now().naive_utc(), error, id],
        )?;
        if updated == 0 {
            return Err(BrokerError::NotFound(id.to_string()));
        }
        Ok(())
    }

    pub fn get(&self, id: &str) -> BrokerResult<Option<JobRecord>> {
        let conn = self.open()?;
        let job = conn
            .query_row(
                "SELECT * FROM transcode_jobs WHERE id = ?1",
                params![id],
                JobRecord::from_row,
            )
            .optional()?;
        Ok(job)
    }

    pub fn list(&self, status: Option<JobStatus>, limit: usize) -> BrokerResult<Vec<JobRecord>> {
        let conn = self.open()?;
        let limit = limit as i64;
        let mut stmt = conn.prepare(
            "SELECT * FROM transcode_jobs
             WHERE (?1 IS NULL OR status = ?1)
             ORDER BY enqueued_at DESC, rowid DESC LIMIT ?2",
        )?;
        let rows = stmt.query_map(
            params![status.map(|s| s.as_str()), limit],
            JobRecord::from_row,
        )?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// Deletes finished and failed jobs whose result TTL has elapsed.
    pub fn cleanup_finished(&self) -> BrokerResult<usize> {
        let conn = self.open()?;
        let removed = conn.execute(
            "DELETE FROM transcode_jobs
             WHERE status IN ('finished', 'failed')
               AND ended_at IS NOT NULL
               AND datetime(ended_at, '+' || result_ttl_s || ' seconds') < datetime(?1)",
            params![Utc::now().naive_utc()],
        )?;
        Ok(removed)
    }
}

impl Broker for SqliteBroker {
    fn enqueue(&self, request: &JobRequest, options: &JobOptions) -> BrokerResult<JobHandle> {
        let conn = self.open()?;
        let id = Uuid::new_v4().to_string();
        conn.execute(
            "INSERT INTO transcode_jobs (
                id, queue, job_name, video_id, resolutions, status, timeout_s, result_ttl_s,
                retry_max, retry_intervals_s, enqueued_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, 'queued', ?6, ?7, ?8, ?9, ?10)",
            params![
                id,
                options.queue,
                options.job_name,
                request.video_id,
                serde_json::to_string(&request.resolutions)?,
                options.timeout.as_secs() as i64,
                options.result_ttl.as_secs() as i64,
                options.retry.max_attempts() as i64,
                serde_json::to_string(&options.retry.schedule_seconds())?,
                Utc::now().naive_utc()
            ],
        )?;
        Ok(JobHandle {
            id,
            queue: options.queue.clone(),
        })
    }

    /// A started job past its timeout no longer counts; its worker is gone.
    fn has_active_job(&self, video_id: VideoId) -> BrokerResult<bool> {
        let conn = self.open()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM transcode_jobs
             WHERE video_id = ?1
               AND (status = 'queued'
                    OR (status = 'started'
                        AND datetime(started_at, '+' || timeout_s || ' seconds') > datetime(?2)))",
            params![video_id, Utc::now().naive_utc()],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    fn ping(&self) -> BrokerResult<()> {
        let conn = self.open()?;
        conn.query_row("SELECT 1", [], |_| Ok(()))?;
        Ok(())
    }
}

impl JobQueue for SqliteBroker {
    fn claim_next(&self, queue: &str) -> BrokerResult<Option<JobRecord>> {
        SqliteBroker::claim_next(self, queue)
    }

    fn complete(&self, id: &str) -> BrokerResult<()> {
        SqliteBroker::complete(self, id)
    }

    fn fail(&self, id: &str, error: &str) -> BrokerResult<()> {
        SqliteBroker::fail(self, id, error)
    }

    fn cleanup_finished(&self) -> BrokerResult<usize> {
        SqliteBroker::cleanup_finished(self)
    }
}

fn parse_timestamp(value: Option<NaiveDateTime>) -> Option<DateTime<Utc>> {
    value.map(|dt| DateTime::<Utc>::from_naive_utc_and_offset(dt, Utc))
}
