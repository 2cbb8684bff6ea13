//! `JobManager`: the public façade over the stored procedures. Validates
//! arguments, translates procedure/database errors into
//! [`crate::error::JobManagerError`], and marshals rows into [`Job`] values.

use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Serialize};

use crate::connector::Connector;
use crate::error::{map_sqlx_error, JobManagerResult};
use crate::job::{Job, JobStatus, NewJob};
use crate::reporting::{QueueStats, TaskStats};

/// End status accepted by `finish_job`. A distinct type (rather than
/// reusing the full `JobStatus`) makes "succeeded or failed, nothing else"
/// a compile-time guarantee instead of a runtime check alone. The
/// procedure still rejects anything else itself, since clients in other
/// languages share the same database contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndStatus {
    Succeeded,
    Failed,
}

impl EndStatus {
    fn as_job_status(self) -> JobStatus {
        match self {
            EndStatus::Succeeded => JobStatus::Succeeded,
            EndStatus::Failed => JobStatus::Failed,
        }
    }
}

/// Optional filters accepted by `list_jobs`. Every field left `None` is
/// unfiltered.
#[derive(Debug, Clone, Default)]
pub struct ListJobsFilter {
    pub id: Option<i64>,
    pub lock: Option<String>,
    pub queueing_lock: Option<String>,
    pub queue_name: Option<String>,
    pub task_name: Option<String>,
    pub status: Option<JobStatus>,
}

/// The job manager: the contract between worker processes and the
/// database-backed queue.
#[derive(Clone)]
pub struct JobManager {
    connector: Connector,
}

impl JobManager {
    pub fn new(connector: Connector) -> Self {
        Self { connector }
    }

    pub fn connector(&self) -> &Connector {
        &self.connector
    }

    /// `SELECT 1` against the pool: confirms the database is reachable
    /// without touching any job-manager table.
    pub async fn check_connection(&self) -> JobManagerResult<()> {
        self.connector.check_connection().await
    }

    /// Insert `job` in status `todo`, returning its assigned id.
    ///
    /// A non-null `queueing_lock` that collides with an existing `todo` row
    /// surfaces as [`crate::error::JobManagerError::AlreadyEnqueued`].
    pub async fn defer_job_async<J>(&self, job: NewJob<J>) -> JobManagerResult<i64>
    where
        J: Serialize + Send + Sync,
    {
        let id: i64 = sqlx::query_scalar(
            r#"SELECT procrastinate_defer_job($1, $2, $3, $4, $5, $6)"#,
        )
        .bind(&job.queue_name)
        .bind(&job.task_name)
        .bind(&job.lock)
        .bind(&job.queueing_lock)
        .bind(&job.args)
        .bind(job.scheduled_at)
        .fetch_one(self.connector.pool())
        .await
        .map_err(map_sqlx_error)?;

        Ok(id)
    }

    /// Claim and return the oldest eligible `todo` job among `queues`
    /// (`None` or an empty slice meaning any queue), or `None` if no job
    /// is currently eligible.
    pub async fn fetch_job<J>(&self, queues: Option<&[String]>) -> JobManagerResult<Option<Job<J>>>
    where
        J: DeserializeOwned + Send + Unpin + 'static,
    {
        // An empty slice must mean "any queue", same as `None`: bound as a
        // Postgres array, `queue_name = ANY('{}')` is always false, so it
        // has to be normalized to NULL before it reaches the procedure.
        let queues = queues.filter(|q| !q.is_empty());

        let job: Option<Job<J>> = sqlx::query_as(r#"SELECT * FROM procrastinate_fetch_job($1)"#)
            .bind(queues)
            .fetch_optional(self.connector.pool())
            .await
            .map_err(map_sqlx_error)?;

        Ok(job)
    }

    /// Transition `job_id` to a terminal status, optionally deleting the
    /// row outright instead of leaving a `succeeded`/`failed` record
    /// behind.
    ///
    /// `job_id` must currently be `doing` or `todo` (a job that was never
    /// fetched can still be finished directly, matching the procedure's
    /// own status check); any other current status raises
    /// [`crate::error::JobManagerError::ConnectorException`] wrapping the
    /// procedure's raised message.
    pub async fn finish_job(
        &self,
        job_id: i64,
        end_status: EndStatus,
        delete: bool,
    ) -> JobManagerResult<()> {
        sqlx::query(r#"SELECT procrastinate_finish_job($1, $2, $3)"#)
            .bind(job_id)
            .bind(end_status.as_job_status())
            .bind(delete)
            .execute(self.connector.pool())
            .await
            .map_err(map_sqlx_error)?;

        Ok(())
    }

    /// Move a `doing` job back to `todo`, incrementing `attempts` and
    /// rescheduling it for `retry_at`. Requires `job_id` currently be
    /// `doing`.
    pub async fn retry_job(&self, job_id: i64, retry_at: DateTime<Utc>) -> JobManagerResult<()> {
        sqlx::query(r#"SELECT procrastinate_retry_job($1, $2)"#)
            .bind(job_id)
            .bind(retry_at)
            .execute(self.connector.pool())
            .await
            .map_err(map_sqlx_error)?;

        Ok(())
    }

    /// Cancel a job still waiting in `todo`, moving it to `failed` with a
    /// `cancelled` event. Returns `true` if the job was cancelled, `false`
    /// if it was not in `todo` (e.g. already fetched or already terminal).
    pub async fn cancel_job(&self, job_id: i64) -> JobManagerResult<bool> {
        let cancelled: bool = sqlx::query_scalar(r#"SELECT procrastinate_cancel_job($1)"#)
            .bind(job_id)
            .fetch_one(self.connector.pool())
            .await
            .map_err(map_sqlx_error)?;

        Ok(cancelled)
    }

    /// Every job in status `doing` whose most recent `started` event is
    /// older than `nb_seconds`. Detection only; retry/fail policy for the
    /// result is left to the caller.
    pub async fn get_stalled_jobs<J>(
        &self,
        nb_seconds: f64,
        queue_name: Option<&str>,
        task_name: Option<&str>,
    ) -> JobManagerResult<Vec<Job<J>>>
    where
        J: DeserializeOwned + Send + Unpin + 'static,
    {
        let jobs: Vec<Job<J>> = sqlx::query_as(
            r#"SELECT * FROM procrastinate_get_stalled_jobs($1, $2, $3)"#,
        )
        .bind(nb_seconds)
        .bind(queue_name)
        .bind(task_name)
        .fetch_all(self.connector.pool())
        .await
        .map_err(map_sqlx_error)?;

        Ok(jobs)
    }

    /// Delete every terminal job (optionally restricted to `queue_name`,
    /// optionally including `failed` jobs when `include_error`) whose
    /// latest event is older than `nb_hours`. Returns the number of rows
    /// deleted.
    pub async fn delete_old_jobs(
        &self,
        nb_hours: f64,
        queue_name: Option<&str>,
        include_error: bool,
    ) -> JobManagerResult<i64> {
        let deleted: i64 = sqlx::query_scalar(
            r#"SELECT procrastinate_delete_old_jobs($1, $2, $3)"#,
        )
        .bind(nb_hours)
        .bind(queue_name)
        .bind(include_error)
        .fetch_one(self.connector.pool())
        .await
        .map_err(map_sqlx_error)?;

        Ok(deleted)
    }

    /// Filtered, read-only listing of jobs. Arguments are decoded as
    /// `serde_json::Value` since `list_jobs` is a reporting view, not a
    /// typed consumer of a specific task's argument shape.
    pub async fn list_jobs(
        &self,
        filter: &ListJobsFilter,
    ) -> JobManagerResult<Vec<Job<serde_json::Value>>> {
        let jobs: Vec<Job<serde_json::Value>> = sqlx::query_as(
            r#"
            SELECT * FROM procrastinate_jobs
            WHERE ($1::bigint IS NULL OR id = $1)
                AND ($2::text IS NULL OR lock = $2)
                AND ($3::text IS NULL OR queueing_lock = $3)
                AND ($4::text IS NULL OR queue_name = $4)
                AND ($5::text IS NULL OR task_name = $5)
                AND ($6::procrastinate_job_status IS NULL OR status = $6)
            ORDER BY id ASC
            "#,
        )
        .bind(filter.id)
        .bind(&filter.lock)
        .bind(&filter.queueing_lock)
        .bind(&filter.queue_name)
        .bind(&filter.task_name)
        .bind(filter.status)
        .fetch_all(self.connector.pool())
        .await
        .map_err(map_sqlx_error)?;

        Ok(jobs)
    }

    /// Per-queue job counts broken down by status, plus a total. Every
    /// filter left `None` is unfiltered; non-`None` filters narrow the
    /// underlying jobs counted before grouping by `queue_name`.
    pub async fn list_queues(
        &self,
        queue_name: Option<&str>,
        task_name: Option<&str>,
        status: Option<JobStatus>,
        lock: Option<&str>,
    ) -> JobManagerResult<Vec<QueueStats>> {
        let rows: Vec<QueueStats> = sqlx::query_as(
            r#"
            SELECT
                queue_name,
                COUNT(*) FILTER (WHERE status = 'todo') AS todo,
                COUNT(*) FILTER (WHERE status = 'doing') AS doing,
                COUNT(*) FILTER (WHERE status = 'succeeded') AS succeeded,
                COUNT(*) FILTER (WHERE status = 'failed') AS failed,
                COUNT(*) AS total
            FROM procrastinate_jobs
            WHERE ($1::text IS NULL OR queue_name = $1)
                AND ($2::text IS NULL OR task_name = $2)
                AND ($3::procrastinate_job_status IS NULL OR status = $3)
                AND ($4::text IS NULL OR lock = $4)
            GROUP BY queue_name
            ORDER BY queue_name ASC
            "#,
        )
        .bind(queue_name)
        .bind(task_name)
        .bind(status)
        .bind(lock)
        .fetch_all(self.connector.pool())
        .await
        .map_err(map_sqlx_error)?;

        Ok(rows)
    }

    /// Compares the database enum `procrastinate_job_status`'s labels
    /// against [`JobStatus::all`], failing loudly if they have drifted
    /// apart. Intended to be called once, early in an embedding process's
    /// startup.
    pub async fn verify_enum_parity(&self) -> JobManagerResult<()> {
        let db_labels: Vec<String> = sqlx::query_scalar(
            r#"SELECT unnest(enum_range(NULL::procrastinate_job_status))::text"#,
        )
        .fetch_all(self.connector.pool())
        .await
        .map_err(map_sqlx_error)?;

        let mut db_labels = db_labels;
        db_labels.sort();

        let mut client_labels: Vec<&'static str> =
            JobStatus::all().iter().map(JobStatus::as_str).collect();
        client_labels.sort_unstable();

        if db_labels.iter().map(String::as_str).ne(client_labels.iter().copied()) {
            tracing::error!(
                "procrastinate_job_status enum parity check failed: database has {db_labels:?}, client has {client_labels:?}"
            );
            return Err(map_sqlx_error(sqlx::Error::Protocol(format!(
                "procrastinate_job_status enum parity check failed: database has {db_labels:?}, client has {client_labels:?}"
            ))));
        }

        Ok(())
    }

    /// Per-task-name job counts broken down by status, plus a total. Every
    /// filter left `None` is unfiltered; non-`None` filters narrow the
    /// underlying jobs counted before grouping by `task_name`.
    pub async fn list_tasks(
        &self,
        queue_name: Option<&str>,
        task_name: Option<&str>,
        status: Option<JobStatus>,
        lock: Option<&str>,
    ) -> JobManagerResult<Vec<TaskStats>> {
        let rows: Vec<TaskStats> = sqlx::query_as(
            r#"
            SELECT
                task_name,
                COUNT(*) FILTER (WHERE status = 'todo') AS todo,
                COUNT(*) FILTER (WHERE status = 'doing') AS doing,
                COUNT(*) FILTER (WHERE status = 'succeeded') AS succeeded,
                COUNT(*) FILTER (WHERE status = 'failed') AS failed,
                COUNT(*) AS total
            FROM procrastinate_jobs
            WHERE ($1::text IS NULL OR queue_name = $1)
                AND ($2::text IS NULL OR task_name = $2)
                AND ($3::procrastinate_job_status IS NULL OR status = $3)
                AND ($4::text IS NULL OR lock = $4)
            GROUP BY task_name
            ORDER BY task_name ASC
            "#,
        )
        .bind(queue_name)
        .bind(task_name)
        .bind(status)
        .bind(lock)
        .fetch_all(self.connector.pool())
        .await
        .map_err(map_sqlx_error)?;

        Ok(rows)
    }
}
