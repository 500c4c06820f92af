use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use dbqueue_core::{
    ConfigError, DatabaseDialect, EnqueueParams, PickTaskSettings, QueueLocation, TaskId,
    TaskRecord,
};

use crate::database::DatabaseError;

/// Failure of a queue storage operation.
///
/// Not-found outcomes are values (`Ok(false)`, `Ok(None)`), never errors.
#[derive(Debug, Error)]
pub enum QueueDaoError {
    /// The queue, schema or shard is set up wrong. Not worth retrying.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// The database refused or failed the statement. Propagated unchanged.
    #[error(transparent)]
    Database(#[from] DatabaseError),
}

/// Enqueue, delete and reenqueue for one dialect.
#[async_trait]
pub trait QueueDao: Send + Sync {
    fn dialect(&self) -> DatabaseDialect;

    /// Insert a new task and return its id.
    ///
    /// The task becomes eligible after `params.execution_delay()` (whole
    /// seconds) and starts with every counter at zero.
    async fn enqueue(
        &self,
        location: &QueueLocation,
        params: &EnqueueParams,
    ) -> Result<TaskId, QueueDaoError>;

    /// Remove a task. Returns `false` if no such task exists in the queue.
    async fn delete_task(
        &self,
        location: &QueueLocation,
        task_id: TaskId,
    ) -> Result<bool, QueueDaoError>;

    /// Postpone a task by `execution_delay`, resetting its attempt count and
    /// counting one more explicit reenqueue. Returns `false` if no such task
    /// exists in the queue.
    async fn reenqueue(
        &self,
        location: &QueueLocation,
        task_id: TaskId,
        execution_delay: Duration,
    ) -> Result<bool, QueueDaoError>;
}

/// Atomic "claim next task" for one dialect.
#[async_trait]
pub trait QueuePickTaskDao: Send + Sync {
    fn dialect(&self) -> DatabaseDialect;

    /// Claim the oldest due task of the queue, if any.
    ///
    /// The claimed row gets its next processing time pushed out by the retry
    /// backoff and its attempt counters incremented in the same statement.
    /// Rows locked by concurrent claimants are skipped, never waited on.
    async fn pick_task(
        &self,
        location: &QueueLocation,
        settings: &PickTaskSettings,
    ) -> Result<Option<TaskRecord>, QueueDaoError>;
}
