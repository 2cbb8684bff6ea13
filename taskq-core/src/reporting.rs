//! Read-only reporting aggregates backing `list_queues` / `list_tasks`.
//! Thin `GROUP BY` views on top of `procrastinate_jobs`; no state of their
//! own.

/// Job counts for a single queue, broken down by status.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct QueueStats {
    pub queue_name: String,
    pub todo: i64,
    pub doing: i64,
    pub succeeded: i64,
    pub failed: i64,
    pub total: i64,
}

/// Job counts for a single task name, broken down by status.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct TaskStats {
    pub task_name: String,
    pub todo: i64,
    pub doing: i64,
    pub succeeded: i64,
    pub failed: i64,
    pub total: i64,
}
