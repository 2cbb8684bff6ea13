//! Job and event types marshaled to and from `procrastinate_jobs` /
//! `procrastinate_events` rows.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Serialize};

use crate::error::JobManagerError;

/// Arguments are stored and read to and from a JSONB column, so we accept
/// anything that fits `sqlx::types::Json`.
pub type JobArgs<J> = sqlx::types::Json<J>;

/// Enumeration of possible statuses for a job. Must stay in lock-step with
/// the database enum `procrastinate_job_status` (see the `enum_parity` test
/// in `tests/job_manager.rs`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, sqlx::Type)]
#[sqlx(type_name = "procrastinate_job_status")]
#[sqlx(rename_all = "lowercase")]
pub enum JobStatus {
    /// Waiting in the queue, eligible once `scheduled_at` has passed.
    Todo,
    /// Claimed by a worker and currently being executed.
    Doing,
    /// Terminal: completed without error.
    Succeeded,
    /// Terminal: completed with error, or cancelled before being run.
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Todo => "todo",
            JobStatus::Doing => "doing",
            JobStatus::Succeeded => "succeeded",
            JobStatus::Failed => "failed",
        }
    }

    /// The full set of labels, checked against the database enum at startup
    /// by `JobManager::verify_enum_parity`.
    pub fn all() -> &'static [JobStatus] {
        &[
            JobStatus::Todo,
            JobStatus::Doing,
            JobStatus::Succeeded,
            JobStatus::Failed,
        ]
    }
}

impl FromStr for JobStatus {
    type Err = JobManagerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "todo" => Ok(JobStatus::Todo),
            "doing" => Ok(JobStatus::Doing),
            "succeeded" => Ok(JobStatus::Succeeded),
            "failed" => Ok(JobStatus::Failed),
            invalid => Err(JobManagerError::ParseJobStatusError(invalid.to_owned())),
        }
    }
}

/// Enumeration of event types appended to `procrastinate_events`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, sqlx::Type)]
#[sqlx(type_name = "procrastinate_job_event_type")]
#[sqlx(rename_all = "lowercase")]
pub enum EventType {
    Deferred,
    Started,
    DeferredForRetry,
    Failed,
    Succeeded,
    Cancelled,
    Scheduled,
    AbortRequested,
    Aborted,
}

/// An append-only audit row for a job's status transitions.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Event {
    pub id: i64,
    pub job_id: i64,
    #[sqlx(rename = "type")]
    pub event_type: EventType,
    pub at: DateTime<Utc>,
}

/// A job row as fetched from `procrastinate_jobs`, parameterized over the
/// shape of its (opaque to the core) JSON arguments.
#[derive(Debug, sqlx::FromRow)]
pub struct Job<J> {
    pub id: i64,
    pub queue_name: String,
    pub task_name: String,
    pub lock: Option<String>,
    pub queueing_lock: Option<String>,
    pub args: JobArgs<J>,
    pub status: JobStatus,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub attempts: i32,
}

/// A job to be deferred into the queue. Takes ownership of its arguments so
/// that `defer_job` can only ever be called once per value.
pub struct NewJob<J> {
    pub queue_name: String,
    pub task_name: String,
    pub lock: Option<String>,
    pub queueing_lock: Option<String>,
    pub args: JobArgs<J>,
    pub scheduled_at: Option<DateTime<Utc>>,
}

impl<J: Serialize> NewJob<J> {
    pub fn new(queue_name: impl Into<String>, task_name: impl Into<String>, args: J) -> Self {
        Self {
            queue_name: queue_name.into(),
            task_name: task_name.into(),
            lock: None,
            queueing_lock: None,
            args: sqlx::types::Json(args),
            scheduled_at: None,
        }
    }

    pub fn with_lock(mut self, lock: impl Into<String>) -> Self {
        self.lock = Some(lock.into());
        self
    }

    pub fn with_queueing_lock(mut self, queueing_lock: impl Into<String>) -> Self {
        self.queueing_lock = Some(queueing_lock.into());
        self
    }

    pub fn with_scheduled_at(mut self, scheduled_at: DateTime<Utc>) -> Self {
        self.scheduled_at = Some(scheduled_at);
        self
    }
}

impl<J> Job<J>
where
    J: DeserializeOwned + Send + Unpin + 'static,
{
    /// True once the job has reached a terminal status.
    pub fn is_terminal(&self) -> bool {
        matches!(self.status, JobStatus::Succeeded | JobStatus::Failed)
    }
}
