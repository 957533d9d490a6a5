//! Scheduler error types.

use dolmetscher_core::TaskStatus;
use dolmetscher_store::StoreError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SchedulerError {
    /// Admission ceiling reached. Distinct from every other failure so the
    /// API layer can answer with backpressure instead of a server error.
    #[error("queue full: {active} active tasks at capacity {capacity}")]
    QueueFull { active: i64, capacity: u64 },

    #[error("validation error: {0}")]
    Validation(String),

    /// The task exists but its current status does not permit the
    /// requested operation.
    #[error("task {task_id} is {status}, cannot {action}")]
    IllegalState {
        task_id: String,
        status: TaskStatus,
        action: &'static str,
    },

    #[error("retry limit reached for task {task_id}: {retries} of {max}")]
    RetryExhausted {
        task_id: String,
        retries: i64,
        max: i64,
    },

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl SchedulerError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, SchedulerError::Store(StoreError::NotFound(_)))
    }
}
