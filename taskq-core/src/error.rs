//! Error taxonomy for the job manager.
//!
//! Procedure-raised conditions are inspected by SQLSTATE and constraint
//! name, never swallowed: anything the `QueueNotFound` / `AlreadyEnqueued`
//! / `UniqueViolation` variants don't specifically recognize is wrapped in
//! `ConnectorException` with the original `sqlx::Error` kept as its source.

use thiserror::Error;

/// Enumeration of errors raised by the job manager and its connector.
#[derive(Error, Debug)]
pub enum JobManagerError {
    /// A queue referenced by a legacy caller has no matching row. The
    /// current schema auto-creates queues on first use, so this variant
    /// only exists for callers translating from a system that pre-declared
    /// queues explicitly.
    #[error("queue {0} not found")]
    QueueNotFound(String),

    /// `defer_job` failed because `queueing_lock` collided with an
    /// existing `todo` row, i.e. a unique-violation on
    /// `procrastinate_jobs_queueing_lock_idx`.
    #[error("job with queueing lock already enqueued (constraint: {constraint_name})")]
    AlreadyEnqueued { constraint_name: String },

    /// Any other unique-violation raised by the database.
    #[error("unique constraint violated: {constraint_name}")]
    UniqueViolation { constraint_name: String },

    /// Any database error that isn't one of the above, including conditions
    /// raised from within a stored procedure (e.g. "End status should be
    /// either...", "Job with id ... was not found..."). The original error
    /// is preserved as the source.
    #[error("connector error: {source}")]
    ConnectorException {
        #[source]
        source: sqlx::Error,
    },

    /// Surfaced by external collaborators (stall-recovery policy) when a
    /// job detected as stalled could not be retried or failed. Not raised
    /// by this crate itself.
    #[error("job {0} is stalled")]
    StalledJobError(i64),

    /// Surfaced by external collaborators when a running task observes an
    /// abort request. Not raised by this crate itself.
    #[error("job {0} was aborted")]
    JobAborted(i64),

    /// Surfaced by external collaborators (task dispatch) when a task name
    /// has no registered handler. Not raised by this crate itself.
    #[error("task {0} not found")]
    TaskNotFound(String),

    #[error("{0} is not a valid JobStatus")]
    ParseJobStatusError(String),
}

pub type JobManagerResult<T> = std::result::Result<T, JobManagerError>;

/// Maps a raw `sqlx::Error` from a procedure call into the typed hierarchy
/// above. `AlreadyEnqueued` is distinguished from a generic
/// `UniqueViolation` purely by constraint name.
pub(crate) fn map_sqlx_error(error: sqlx::Error) -> JobManagerError {
    if let sqlx::Error::Database(ref db_error) = error {
        if db_error.is_unique_violation() {
            let constraint_name = db_error
                .constraint()
                .unwrap_or("<unknown constraint>")
                .to_owned();

            return if constraint_name == "procrastinate_jobs_queueing_lock_idx" {
                JobManagerError::AlreadyEnqueued { constraint_name }
            } else {
                JobManagerError::UniqueViolation { constraint_name }
            };
        }
    }

    JobManagerError::ConnectorException { source: error }
}
