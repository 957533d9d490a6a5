//! Store error types.

use dolmetscher_core::TaskStatus;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    /// Illegal state transition attempted; the row is left unchanged.
    #[error("conflict on task {task_id}: {from} -> {to} is not a legal transition")]
    Conflict {
        task_id: String,
        from: TaskStatus,
        to: TaskStatus,
    },

    #[error("task not found: {0}")]
    NotFound(String),

    /// Admission ceiling reached; no row was written.
    #[error("at capacity: {active} active tasks of {capacity}")]
    Capacity { active: i64, capacity: i64 },

    /// Caller violated the store contract (e.g. `processing` without a
    /// worker assignment).
    #[error("invalid update: {0}")]
    Invalid(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
}

impl StoreError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, StoreError::Conflict { .. })
    }
}
