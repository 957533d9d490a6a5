//! Task lifecycle types.
//!
//! A [`Task`] is one translation job tracked from submission to a terminal
//! state. [`TaskStatus`] is the single fixed status enum — serialized as a
//! lowercase string at every boundary (store, API, logs), never as a nested
//! object.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Priority tiers used by the admission queue. Higher value = more urgent.
/// Any integer is accepted; these are the named conventions.
pub mod priority {
    pub const LOW: i64 = 1;
    pub const NORMAL: i64 = 2;
    pub const HIGH: i64 = 3;
    pub const URGENT: i64 = 4;
}

/// Lifecycle state of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Cancelled,
    Timeout,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Processing => "processing",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
            TaskStatus::Timeout => "timeout",
        }
    }

    /// Terminal states never transition forward on their own; only an
    /// explicit retry produces a fresh `pending` state.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled | TaskStatus::Timeout
        )
    }

    /// Whether a retry from this state is allowed. Cancelled is final.
    pub fn is_retryable(&self) -> bool {
        self.is_terminal() && *self != TaskStatus::Cancelled
    }

    /// The legal transition table. Everything not listed here is a conflict.
    pub fn can_transition_to(&self, next: TaskStatus) -> bool {
        use TaskStatus::*;
        match (self, next) {
            (Pending, Processing) | (Pending, Cancelled) => true,
            (Processing, Completed)
            | (Processing, Failed)
            | (Processing, Timeout)
            | (Processing, Cancelled) => true,
            // Retry path: any terminal state except cancelled back to pending.
            (from, Pending) if from.is_retryable() => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(TaskStatus::Pending),
            "processing" => Ok(TaskStatus::Processing),
            "completed" => Ok(TaskStatus::Completed),
            "failed" => Ok(TaskStatus::Failed),
            "cancelled" => Ok(TaskStatus::Cancelled),
            "timeout" => Ok(TaskStatus::Timeout),
            other => Err(format!("unknown task status: {other}")),
        }
    }
}

/// One translation job, as persisted in the `tasks` table.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Task {
    pub task_id: String,
    pub status: TaskStatus,
    pub priority: i64,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    /// 0–100, monotonically non-decreasing while processing.
    pub progress: f64,
    pub error_message: Option<String>,
    pub retry_count: i64,
    pub max_retries: i64,
    /// Per-task processing deadline enforced by the watchdog.
    pub timeout_secs: i64,
    /// Opaque request metadata, stored verbatim.
    pub metadata: Option<String>,
    /// Opaque client identifier of the submitter.
    pub requester: Option<String>,
    pub source_lang: String,
    pub target_lang: String,
    pub via_intermediate: bool,
    pub file_count: i64,
    pub total_size_bytes: i64,
    /// Set exactly once per processing attempt; non-nil iff `processing`.
    pub assigned_worker: Option<String>,
}

/// The fields a caller supplies at submission; everything else is assigned
/// by the store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskDraft {
    pub priority: i64,
    pub source_lang: String,
    pub target_lang: String,
    #[serde(default)]
    pub via_intermediate: bool,
    #[serde(default)]
    pub file_count: i64,
    #[serde(default)]
    pub total_size_bytes: i64,
    pub requester: Option<String>,
    pub metadata: Option<serde_json::Value>,
    pub timeout_secs: Option<i64>,
    pub max_retries: Option<i64>,
}

/// A pending task's place in line, as persisted in `task_queue`.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct QueueEntry {
    pub task_id: String,
    pub priority: i64,
    pub enqueued_at: DateTime<Utc>,
    pub assigned_worker: Option<String>,
    pub assigned_at: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_roundtrips_as_lowercase_string() {
        for status in [
            TaskStatus::Pending,
            TaskStatus::Processing,
            TaskStatus::Completed,
            TaskStatus::Failed,
            TaskStatus::Cancelled,
            TaskStatus::Timeout,
        ] {
            let json = serde_json::to_string(&status).unwrap();
            assert_eq!(json, format!("\"{}\"", status.as_str()));
            let back: TaskStatus = serde_json::from_str(&json).unwrap();
            assert_eq!(back, status);
            assert_eq!(status.as_str().parse::<TaskStatus>().unwrap(), status);
        }
    }

    #[test]
    fn test_legal_transitions() {
        use TaskStatus::*;
        assert!(Pending.can_transition_to(Processing));
        assert!(Pending.can_transition_to(Cancelled));
        assert!(Processing.can_transition_to(Completed));
        assert!(Processing.can_transition_to(Failed));
        assert!(Processing.can_transition_to(Timeout));
        assert!(Processing.can_transition_to(Cancelled));
        // Retry paths.
        assert!(Failed.can_transition_to(Pending));
        assert!(Timeout.can_transition_to(Pending));
        assert!(Completed.can_transition_to(Pending));
    }

    #[test]
    fn test_illegal_transitions() {
        use TaskStatus::*;
        assert!(!Completed.can_transition_to(Processing));
        assert!(!Cancelled.can_transition_to(Pending));
        assert!(!Pending.can_transition_to(Completed));
        assert!(!Pending.can_transition_to(Failed));
        assert!(!Failed.can_transition_to(Completed));
    }

    #[test]
    fn test_cancelled_is_not_retryable() {
        assert!(!TaskStatus::Cancelled.is_retryable());
        assert!(TaskStatus::Failed.is_retryable());
        assert!(TaskStatus::Timeout.is_retryable());
        assert!(!TaskStatus::Processing.is_retryable());
    }
}
