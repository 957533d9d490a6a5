//! SQLite-backed task store.
//!
//! All multi-row transitions run inside one transaction: a crash mid-write
//! can never leave a task `processing` without an `assigned_worker`, a
//! claimed queue row without its task, or a worker row pointing at a task
//! that no longer holds it.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::SqlitePool;
use tracing::{info, warn};
use uuid::Uuid;

use dolmetscher_core::{QueueEntry, Task, TaskDraft, TaskStatus, WorkerKind, WorkerStatus};

use crate::error::StoreError;

static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("../../migrations");

const TASK_COLUMNS: &str = "task_id, status, priority, created_at, started_at, completed_at, \
     progress, error_message, retry_count, max_retries, timeout_secs, metadata, requester, \
     source_lang, target_lang, via_intermediate, file_count, total_size_bytes, assigned_worker";

const WORKER_COLUMNS: &str = "worker_id, kind, device_name, memory_total, memory_used, \
     memory_free, utilization_pct, temperature, is_available, current_task_id, last_updated";

/// Write attempts against a briefly-locked database before giving up.
const WRITE_ATTEMPTS: u32 = 3;
const WRITE_BACKOFF: Duration = Duration::from_millis(50);

/// Optional fields accompanying a status transition.
#[derive(Debug, Clone, Default)]
pub struct StatusUpdate {
    /// Required when transitioning to `processing`; ignored otherwise.
    pub assigned_worker: Option<String>,
    /// Recorded verbatim on `failed`/`timeout`; never stored for any
    /// other target status.
    pub error_message: Option<String>,
}

impl StatusUpdate {
    pub fn worker(worker_id: impl Into<String>) -> Self {
        Self {
            assigned_worker: Some(worker_id.into()),
            error_message: None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            assigned_worker: None,
            error_message: Some(message.into()),
        }
    }
}

#[derive(Clone)]
pub struct TaskStore {
    pool: SqlitePool,
}

impl TaskStore {
    /// Open (creating if needed) the database file and apply migrations.
    pub async fn open(path: &Path) -> Result<Self, StoreError> {
        let opts = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5));
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(opts)
            .await?;
        MIGRATOR.run(&pool).await?;
        info!("Task store ready: {}", path.display());
        Ok(Self { pool })
    }

    /// In-memory store for tests and demos. Single connection — an
    /// in-memory SQLite database exists per connection.
    pub async fn open_in_memory() -> Result<Self, StoreError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;
        MIGRATOR.run(&pool).await?;
        Ok(Self { pool })
    }

    // ── Task CRUD ─────────────────────────────────────────────────

    /// Persist a new task as `pending` together with its queue row, in one
    /// transaction. Returns the assigned task ID.
    ///
    /// The admission ceiling is checked inside the same transaction as the
    /// insert: the count of pending and processing rows and the new row
    /// commit together, so racing submissions cannot overshoot
    /// `max_active`.
    pub async fn create(
        &self,
        draft: &TaskDraft,
        default_timeout_secs: i64,
        default_max_retries: i64,
        max_active: i64,
    ) -> Result<String, StoreError> {
        let task_id = Uuid::new_v4().to_string();
        let now = Utc::now();
        let metadata = draft
            .metadata
            .as_ref()
            .map(|v| serde_json::to_string(v).unwrap_or_default());

        let mut tx = self.pool.begin().await?;
        let (active,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM tasks WHERE status IN ('pending', 'processing')",
        )
        .fetch_one(&mut *tx)
        .await?;
        if active >= max_active {
            return Err(StoreError::Capacity {
                active,
                capacity: max_active,
            });
        }
        sqlx::query(
            "INSERT INTO tasks (task_id, status, priority, created_at, progress, retry_count, \
                 max_retries, timeout_secs, metadata, requester, source_lang, target_lang, \
                 via_intermediate, file_count, total_size_bytes) \
             VALUES (?, ?, ?, ?, 0.0, 0, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&task_id)
        .bind(TaskStatus::Pending)
        .bind(draft.priority)
        .bind(now)
        .bind(draft.max_retries.unwrap_or(default_max_retries))
        .bind(draft.timeout_secs.unwrap_or(default_timeout_secs))
        .bind(metadata)
        .bind(&draft.requester)
        .bind(&draft.source_lang)
        .bind(&draft.target_lang)
        .bind(draft.via_intermediate)
        .bind(draft.file_count)
        .bind(draft.total_size_bytes)
        .execute(&mut *tx)
        .await?;

        sqlx::query("INSERT INTO task_queue (task_id, priority, enqueued_at) VALUES (?, ?, ?)")
            .bind(&task_id)
            .bind(draft.priority)
            .bind(now)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        Ok(task_id)
    }

    pub async fn get(&self, task_id: &str) -> Result<Task, StoreError> {
        sqlx::query_as::<_, Task>(&format!(
            "SELECT {TASK_COLUMNS} FROM tasks WHERE task_id = ?"
        ))
        .bind(task_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| StoreError::NotFound(task_id.to_string()))
    }

    pub async fn list(
        &self,
        status: Option<TaskStatus>,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<Task>, StoreError> {
        let rows = match status {
            Some(status) => {
                sqlx::query_as::<_, Task>(&format!(
                    "SELECT {TASK_COLUMNS} FROM tasks WHERE status = ? \
                     ORDER BY created_at DESC LIMIT ? OFFSET ?"
                ))
                .bind(status)
                .bind(limit)
                .bind(offset)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query_as::<_, Task>(&format!(
                    "SELECT {TASK_COLUMNS} FROM tasks \
                     ORDER BY created_at DESC LIMIT ? OFFSET ?"
                ))
                .bind(limit)
                .bind(offset)
                .fetch_all(&self.pool)
                .await?
            }
        };
        Ok(rows)
    }

    /// Tasks currently occupying queue capacity: pending + processing.
    pub async fn count_active(&self) -> Result<i64, StoreError> {
        let (count,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM tasks WHERE status IN ('pending', 'processing')",
        )
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }

    /// Per-status task counts for the metrics projection.
    pub async fn status_counts(&self) -> Result<HashMap<String, i64>, StoreError> {
        let rows: Vec<(String, i64)> =
            sqlx::query_as("SELECT status, COUNT(*) FROM tasks GROUP BY status")
                .fetch_all(&self.pool)
                .await?;
        Ok(rows.into_iter().collect())
    }

    // ── Status transitions ────────────────────────────────────────

    /// Compare-and-set status transition.
    ///
    /// Verifies the current status allows the transition, then applies the
    /// full effect of the new state in one transaction: timestamps,
    /// `assigned_worker`, the queue row, and the worker row. A repeated
    /// write of the same terminal status is an idempotent no-op; anything
    /// else illegal returns [`StoreError::Conflict`] and changes nothing.
    pub async fn update_status(
        &self,
        task_id: &str,
        new_status: TaskStatus,
        update: StatusUpdate,
    ) -> Result<(), StoreError> {
        let mut attempt = 0;
        loop {
            match self.try_update_status(task_id, new_status, &update).await {
                Err(StoreError::Database(e)) if is_transient(&e) && attempt + 1 < WRITE_ATTEMPTS => {
                    attempt += 1;
                    warn!(task_id, attempt, "transient store error, retrying: {}", e);
                    tokio::time::sleep(WRITE_BACKOFF * 2u32.pow(attempt)).await;
                }
                other => return other,
            }
        }
    }

    async fn try_update_status(
        &self,
        task_id: &str,
        new_status: TaskStatus,
        update: &StatusUpdate,
    ) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;

        let current: Option<(TaskStatus,)> =
            sqlx::query_as("SELECT status FROM tasks WHERE task_id = ?")
                .bind(task_id)
                .fetch_optional(&mut *tx)
                .await?;
        let (current,) = current.ok_or_else(|| StoreError::NotFound(task_id.to_string()))?;

        // Duplicate terminal signal (e.g. a completion reported twice)
        // collapses to a single accepted transition.
        if current == new_status && new_status.is_terminal() {
            return Ok(());
        }
        if !current.can_transition_to(new_status) {
            return Err(StoreError::Conflict {
                task_id: task_id.to_string(),
                from: current,
                to: new_status,
            });
        }

        let now = Utc::now();
        match new_status {
            TaskStatus::Processing => {
                let worker = update.assigned_worker.as_deref().ok_or_else(|| {
                    StoreError::Invalid("processing requires an assigned worker".into())
                })?;
                sqlx::query(
                    "UPDATE tasks SET status = ?, started_at = ?, assigned_worker = ? \
                     WHERE task_id = ?",
                )
                .bind(new_status)
                .bind(now)
                .bind(worker)
                .bind(task_id)
                .execute(&mut *tx)
                .await?;
                sqlx::query(
                    "UPDATE task_queue SET assigned_worker = ?, assigned_at = ? WHERE task_id = ?",
                )
                .bind(worker)
                .bind(now)
                .bind(task_id)
                .execute(&mut *tx)
                .await?;
                sqlx::query(
                    "UPDATE worker_status SET current_task_id = ?, is_available = 0 \
                     WHERE worker_id = ?",
                )
                .bind(task_id)
                .bind(worker)
                .execute(&mut *tx)
                .await?;
            }
            TaskStatus::Completed => {
                sqlx::query(
                    "UPDATE tasks SET status = ?, progress = 100.0, completed_at = ?, \
                         assigned_worker = NULL \
                     WHERE task_id = ?",
                )
                .bind(new_status)
                .bind(now)
                .bind(task_id)
                .execute(&mut *tx)
                .await?;
                Self::finish_in_tx(&mut tx, task_id).await?;
            }
            TaskStatus::Failed | TaskStatus::Timeout => {
                sqlx::query(
                    "UPDATE tasks SET status = ?, completed_at = ?, error_message = ?, \
                         assigned_worker = NULL \
                     WHERE task_id = ?",
                )
                .bind(new_status)
                .bind(now)
                .bind(&update.error_message)
                .bind(task_id)
                .execute(&mut *tx)
                .await?;
                Self::finish_in_tx(&mut tx, task_id).await?;
            }
            TaskStatus::Cancelled => {
                // Cancellation is not an error; error_message stays nil.
                sqlx::query(
                    "UPDATE tasks SET status = ?, completed_at = ?, error_message = NULL, \
                         assigned_worker = NULL \
                     WHERE task_id = ?",
                )
                .bind(new_status)
                .bind(now)
                .bind(task_id)
                .execute(&mut *tx)
                .await?;
                Self::finish_in_tx(&mut tx, task_id).await?;
            }
            TaskStatus::Pending => {
                // Retry path: a fresh attempt with a bumped retry counter.
                sqlx::query(
                    "UPDATE tasks SET status = ?, retry_count = retry_count + 1, \
                         error_message = NULL, started_at = NULL, completed_at = NULL, \
                         progress = 0.0, assigned_worker = NULL \
                     WHERE task_id = ?",
                )
                .bind(new_status)
                .bind(task_id)
                .execute(&mut *tx)
                .await?;
                let (priority,): (i64,) =
                    sqlx::query_as("SELECT priority FROM tasks WHERE task_id = ?")
                        .bind(task_id)
                        .fetch_one(&mut *tx)
                        .await?;
                sqlx::query(
                    "INSERT OR IGNORE INTO task_queue (task_id, priority, enqueued_at) \
                     VALUES (?, ?, ?)",
                )
                .bind(task_id)
                .bind(priority)
                .bind(now)
                .execute(&mut *tx)
                .await?;
            }
        }

        tx.commit().await?;
        Ok(())
    }

    /// Common tail of every terminal transition: drop the queue row and
    /// release whichever worker row still points at this task.
    async fn finish_in_tx(
        tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
        task_id: &str,
    ) -> Result<(), sqlx::Error> {
        sqlx::query("DELETE FROM task_queue WHERE task_id = ?")
            .bind(task_id)
            .execute(&mut **tx)
            .await?;
        sqlx::query(
            "UPDATE worker_status SET current_task_id = NULL, is_available = 1 \
             WHERE current_task_id = ?",
        )
        .bind(task_id)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    /// Record progress for a processing task. Monotonic: a lower value than
    /// the current one is ignored.
    pub async fn update_progress(&self, task_id: &str, progress: f64) -> Result<(), StoreError> {
        let progress = progress.clamp(0.0, 100.0);
        let result = sqlx::query(
            "UPDATE tasks SET progress = MAX(progress, ?) \
             WHERE task_id = ? AND status = 'processing'",
        )
        .bind(progress)
        .bind(task_id)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            // Not an error: the task may have finished between the report
            // and this write.
            tracing::debug!(task_id, progress, "progress update skipped (not processing)");
        }
        Ok(())
    }

    // ── Recovery ──────────────────────────────────────────────────

    /// Reclassify `processing` rows whose worker holds no live lock back to
    /// `pending`, clearing the assignment. Returns the reclaimed tasks in
    /// queue order so the caller can re-enqueue them.
    ///
    /// This bypasses the CAS transition table on purpose: processing ->
    /// pending only exists for crash recovery, never for normal flow.
    pub async fn reclaim_orphaned(
        &self,
        live_workers: &[String],
    ) -> Result<Vec<Task>, StoreError> {
        let processing = self.list(Some(TaskStatus::Processing), i64::MAX, 0).await?;
        let mut reclaimed = Vec::new();

        for task in processing {
            let orphaned = match &task.assigned_worker {
                Some(worker) => !live_workers.iter().any(|w| w == worker),
                // processing with no worker should be impossible; reclaim it too.
                None => true,
            };
            if !orphaned {
                continue;
            }

            let mut tx = self.pool.begin().await?;
            sqlx::query(
                "UPDATE tasks SET status = 'pending', assigned_worker = NULL, \
                     started_at = NULL, progress = 0.0 \
                 WHERE task_id = ? AND status = 'processing'",
            )
            .bind(&task.task_id)
            .execute(&mut *tx)
            .await?;
            sqlx::query(
                "INSERT OR IGNORE INTO task_queue (task_id, priority, enqueued_at) \
                 VALUES (?, ?, ?)",
            )
            .bind(&task.task_id)
            .bind(task.priority)
            .bind(Utc::now())
            .execute(&mut *tx)
            .await?;
            sqlx::query(
                "UPDATE task_queue SET assigned_worker = NULL, assigned_at = NULL \
                 WHERE task_id = ?",
            )
            .bind(&task.task_id)
            .execute(&mut *tx)
            .await?;
            sqlx::query(
                "UPDATE worker_status SET current_task_id = NULL, is_available = 1 \
                 WHERE current_task_id = ?",
            )
            .bind(&task.task_id)
            .execute(&mut *tx)
            .await?;
            tx.commit().await?;

            warn!(
                task_id = %task.task_id,
                worker = task.assigned_worker.as_deref().unwrap_or("(none)"),
                "reclaimed orphaned processing task"
            );
            reclaimed.push(task);
        }

        Ok(reclaimed)
    }

    /// Queue rows whose task is still `pending`, in dispatch order. Used to
    /// rebuild the in-memory admission queue after a restart.
    pub async fn pending_queue_rows(&self) -> Result<Vec<QueueEntry>, StoreError> {
        let rows = sqlx::query_as::<_, QueueEntry>(
            "SELECT q.task_id, q.priority, q.enqueued_at, q.assigned_worker, q.assigned_at \
             FROM task_queue q JOIN tasks t ON t.task_id = q.task_id \
             WHERE t.status = 'pending' \
             ORDER BY q.priority DESC, q.enqueued_at ASC, q.id ASC",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    /// Drop a pending task's queue row (cancel path).
    pub async fn remove_queue_row(&self, task_id: &str) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM task_queue WHERE task_id = ?")
            .bind(task_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // ── Worker status ─────────────────────────────────────────────

    /// Write probe metrics for one device. Inserts the row on first sight;
    /// never touches `current_task_id` or `is_available` — those belong to
    /// the scheduler loop.
    pub async fn upsert_worker_status(
        &self,
        worker_id: &str,
        kind: WorkerKind,
        metrics: &dolmetscher_core::DeviceMetrics,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO worker_status (worker_id, kind, device_name, memory_total, \
                 memory_used, memory_free, utilization_pct, temperature, last_updated) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?) \
             ON CONFLICT(worker_id) DO UPDATE SET \
                 device_name = excluded.device_name, \
                 memory_total = excluded.memory_total, \
                 memory_used = excluded.memory_used, \
                 memory_free = excluded.memory_free, \
                 utilization_pct = excluded.utilization_pct, \
                 temperature = excluded.temperature, \
                 last_updated = excluded.last_updated",
        )
        .bind(worker_id)
        .bind(kind)
        .bind(&metrics.device_name)
        .bind(metrics.memory_total)
        .bind(metrics.memory_used)
        .bind(metrics.memory_free)
        .bind(metrics.utilization_pct)
        .bind(metrics.temperature)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn list_workers(&self) -> Result<Vec<WorkerStatus>, StoreError> {
        let rows = sqlx::query_as::<_, WorkerStatus>(&format!(
            "SELECT {WORKER_COLUMNS} FROM worker_status ORDER BY worker_id"
        ))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    // ── Retention ─────────────────────────────────────────────────

    /// Purge terminal tasks created before the cutoff. Returns the number
    /// of rows deleted.
    pub async fn purge_terminal_before(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        let result = sqlx::query(
            "DELETE FROM tasks \
             WHERE status IN ('completed', 'failed', 'cancelled', 'timeout') \
               AND created_at < ?",
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}

fn is_transient(e: &sqlx::Error) -> bool {
    match e {
        sqlx::Error::Database(db) => {
            let msg = db.message().to_ascii_lowercase();
            msg.contains("locked") || msg.contains("busy")
        }
        _ => false,
    }
}
