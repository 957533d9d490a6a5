//! Pool error types.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum PoolError {
    /// The worker exists but is currently running a job.
    #[error("worker busy: {0}")]
    Busy(String),

    #[error("unknown worker: {0}")]
    UnknownWorker(String),
}
