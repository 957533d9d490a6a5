//! The scheduler facade: admission, dispatch, cancellation, retry,
//! recovery, and the watchdog sweep.

use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info, warn};

use dolmetscher_core::{
    SchedulerConfig, Task, TaskDraft, TaskStatus, TranslatorConfig, WorkerKind,
};
use dolmetscher_pool::WorkerPool;
use dolmetscher_store::{StatusUpdate, StoreError, TaskStore};

use crate::allocator;
use crate::dispatch::{run_task, CancelRegistry, TaskContext};
use crate::error::SchedulerError;
use crate::queue::AdmissionQueue;

/// What a cancel request achieved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    /// The task was still pending; it left the queue and is now cancelled.
    Cancelled,
    /// The task is mid-flight; it was flagged and will become cancelled
    /// when the current translation call returns.
    CancelRequested,
}

pub struct Scheduler {
    store: TaskStore,
    pool: Arc<WorkerPool>,
    queue: AdmissionQueue,
    cancels: CancelRegistry,
    cfg: SchedulerConfig,
    translator_cfg: TranslatorConfig,
}

impl Scheduler {
    pub fn new(
        store: TaskStore,
        pool: Arc<WorkerPool>,
        cfg: SchedulerConfig,
        translator_cfg: TranslatorConfig,
    ) -> Self {
        let queue = AdmissionQueue::new(cfg.max_queue_size as usize);
        Self {
            store,
            pool,
            queue,
            cancels: CancelRegistry::default(),
            cfg,
            translator_cfg,
        }
    }

    pub fn store(&self) -> &TaskStore {
        &self.store
    }

    pub fn pool(&self) -> &Arc<WorkerPool> {
        &self.pool
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.cfg
    }

    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    // ── Admission ─────────────────────────────────────────────────

    /// Validate and admit a new task. The admission ceiling counts every
    /// pending and processing task against `max_queue_size`; the store
    /// enforces it inside the creation transaction, so concurrent
    /// submissions cannot overshoot it. At capacity the caller gets
    /// [`SchedulerError::QueueFull`], a backpressure signal, not a
    /// failure.
    pub async fn submit(&self, draft: TaskDraft) -> Result<String, SchedulerError> {
        self.validate(&draft)?;

        let task_id = match self
            .store
            .create(
                &draft,
                self.cfg.default_timeout_secs as i64,
                self.cfg.max_retries as i64,
                self.cfg.max_queue_size as i64,
            )
            .await
        {
            Ok(task_id) => task_id,
            Err(StoreError::Capacity { active, capacity }) => {
                return Err(SchedulerError::QueueFull {
                    active,
                    capacity: capacity as u64,
                });
            }
            Err(e) => return Err(e.into()),
        };
        let task = self.store.get(&task_id).await?;
        if self
            .queue
            .enqueue(&task_id, task.priority, task.created_at)
            .is_err()
        {
            // Lost an admission race after the capacity check passed. The
            // row is already durable, so it keeps its place in line.
            self.queue.restore(&task_id, task.priority, task.created_at);
        }

        info!(
            task_id = %task_id,
            priority = task.priority,
            source = %task.source_lang,
            target = %task.target_lang,
            queued = self.queue.len(),
            "task admitted"
        );
        Ok(task_id)
    }

    fn validate(&self, draft: &TaskDraft) -> Result<(), SchedulerError> {
        for lang in [&draft.source_lang, &draft.target_lang] {
            if !self.translator_cfg.is_language_supported(lang) {
                return Err(SchedulerError::Validation(format!(
                    "unsupported language: {lang}"
                )));
            }
        }
        if draft.source_lang == draft.target_lang {
            return Err(SchedulerError::Validation(
                "source and target language are identical".into(),
            ));
        }
        let has_text = draft
            .metadata
            .as_ref()
            .and_then(|m| m.get("text"))
            .and_then(|t| t.as_str())
            .map(|t| !t.is_empty())
            .unwrap_or(false);
        if !has_text && draft.file_count == 0 {
            return Err(SchedulerError::Validation(
                "nothing to translate: no text and no files".into(),
            ));
        }
        Ok(())
    }

    // ── Lifecycle operations ──────────────────────────────────────

    pub async fn status(&self, task_id: &str) -> Result<Task, SchedulerError> {
        Ok(self.store.get(task_id).await?)
    }

    /// Cancel a task. Pending tasks leave the queue immediately; a
    /// processing task is flagged and finishes cancelling when its current
    /// attempt returns. Terminal tasks cannot be cancelled.
    pub async fn cancel(&self, task_id: &str) -> Result<CancelOutcome, SchedulerError> {
        let task = self.store.get(task_id).await?;
        match task.status {
            TaskStatus::Pending => {
                self.store
                    .update_status(task_id, TaskStatus::Cancelled, StatusUpdate::default())
                    .await?;
                self.queue.remove(task_id);
                info!(task_id, "pending task cancelled");
                Ok(CancelOutcome::Cancelled)
            }
            TaskStatus::Processing => {
                self.cancels.request(task_id);
                info!(task_id, "cancellation requested for in-flight task");
                Ok(CancelOutcome::CancelRequested)
            }
            status => Err(SchedulerError::IllegalState {
                task_id: task_id.to_string(),
                status,
                action: "cancel",
            }),
        }
    }

    /// Re-admit a failed or timed-out task as a fresh pending attempt.
    /// Cancelled tasks stay cancelled; the per-task retry ceiling is hard.
    pub async fn retry(&self, task_id: &str) -> Result<(), SchedulerError> {
        let task = self.store.get(task_id).await?;
        if !task.status.is_retryable() {
            return Err(SchedulerError::IllegalState {
                task_id: task_id.to_string(),
                status: task.status,
                action: "retry",
            });
        }
        if task.retry_count >= task.max_retries {
            return Err(SchedulerError::RetryExhausted {
                task_id: task_id.to_string(),
                retries: task.retry_count,
                max: task.max_retries,
            });
        }

        let active = self.store.count_active().await?;
        if active >= self.cfg.max_queue_size as i64 {
            return Err(SchedulerError::QueueFull {
                active,
                capacity: self.cfg.max_queue_size,
            });
        }

        self.store
            .update_status(task_id, TaskStatus::Pending, StatusUpdate::default())
            .await?;
        self.queue.restore(task_id, task.priority, Utc::now());
        info!(
            task_id,
            attempt = task.retry_count + 1,
            max = task.max_retries,
            "task re-admitted for retry"
        );
        Ok(())
    }

    // ── Recovery ──────────────────────────────────────────────────

    /// Startup pass: reclassify orphaned `processing` rows back to pending
    /// and rebuild the in-memory queue from the persisted queue relation.
    /// Returns the number of reclaimed tasks.
    pub async fn recover(&self) -> Result<usize, SchedulerError> {
        let live = self.pool.busy_workers();
        let reclaimed = self.store.reclaim_orphaned(&live).await?;

        self.queue.clear();
        for row in self.store.pending_queue_rows().await? {
            self.queue.restore(&row.task_id, row.priority, row.enqueued_at);
        }

        info!(
            reclaimed = reclaimed.len(),
            queued = self.queue.len(),
            "recovery pass complete"
        );
        Ok(reclaimed.len())
    }

    // ── Dispatch ──────────────────────────────────────────────────

    /// One scheduling round: dispatch queued tasks head-first until the
    /// head cannot be placed. A head that fits no worker blocks the line;
    /// lower-priority tasks never overtake it.
    pub async fn tick(&self) -> Result<usize, SchedulerError> {
        let mut dispatched = 0;

        loop {
            let Some(task_id) = self.queue.peek() else {
                break;
            };

            let task = match self.store.get(&task_id).await {
                Ok(task) => task,
                Err(StoreError::NotFound(_)) => {
                    self.queue.remove(&task_id);
                    continue;
                }
                Err(e) => return Err(e.into()),
            };
            if task.status != TaskStatus::Pending {
                // Cancelled or already picked up elsewhere; drop the stale entry.
                self.queue.remove(&task_id);
                continue;
            }

            let mut kind = allocator::preferred_kind(&task);
            if !self.pool.has_kind(kind) {
                kind = match kind {
                    WorkerKind::Gpu => WorkerKind::Cpu,
                    WorkerKind::Cpu => WorkerKind::Gpu,
                };
            }
            let idle = self.pool.idle_workers(Some(kind));
            if idle.is_empty() {
                break;
            }
            let statuses = self.store.list_workers().await?;
            let Some(worker_id) = allocator::pick_worker(
                &idle,
                &statuses,
                kind,
                self.cfg.utilization_threshold_pct,
                self.cfg.memory_threshold_pct,
            ) else {
                break;
            };

            let handle = match self.pool.acquire(&worker_id) {
                Ok(handle) => handle,
                // Another tick won the slot between listing and acquiring.
                Err(_) => break,
            };

            let ctx = match TaskContext::from_task(&task, &self.translator_cfg) {
                Ok(ctx) => ctx,
                Err(e) => {
                    // Unrunnable payload that slipped past admission. Park
                    // it as cancelled so it stops blocking the line.
                    warn!(task_id = %task_id, "undispatchable task: {e}");
                    self.queue.remove(&task_id);
                    let _ = self
                        .store
                        .update_status(&task_id, TaskStatus::Cancelled, StatusUpdate::default())
                        .await;
                    continue;
                }
            };

            match self
                .store
                .update_status(
                    &task_id,
                    TaskStatus::Processing,
                    StatusUpdate::worker(&worker_id),
                )
                .await
            {
                Ok(()) => {}
                Err(e) if e.is_conflict() => {
                    debug!(task_id = %task_id, "dispatch lost a race: {e}");
                    self.queue.remove(&task_id);
                    continue;
                }
                Err(e) => return Err(e.into()),
            }

            self.queue.remove(&task_id);
            dispatched += 1;
            tokio::spawn(run_task(
                self.store.clone(),
                handle,
                ctx,
                self.cancels.clone(),
            ));
        }

        Ok(dispatched)
    }

    // ── Watchdog ──────────────────────────────────────────────────

    /// Backstop for jobs whose future never reports back: any processing
    /// task past its deadline is forced to `timeout`. The dispatch future
    /// enforces the same deadline in-line; conflicts here just mean it
    /// already did its job.
    pub async fn watchdog_sweep(&self) -> Result<usize, SchedulerError> {
        let processing = self
            .store
            .list(Some(TaskStatus::Processing), i64::MAX, 0)
            .await?;
        let now = Utc::now();
        let mut expired = 0;

        for task in processing {
            let Some(started_at) = task.started_at else {
                continue;
            };
            if now < started_at + chrono::Duration::seconds(task.timeout_secs) {
                continue;
            }
            match self
                .store
                .update_status(
                    &task.task_id,
                    TaskStatus::Timeout,
                    StatusUpdate::error(format!(
                        "processing exceeded {}s deadline",
                        task.timeout_secs
                    )),
                )
                .await
            {
                Ok(()) => {
                    warn!(
                        task_id = %task.task_id,
                        timeout_secs = task.timeout_secs,
                        "watchdog expired overdue task"
                    );
                    expired += 1;
                }
                Err(e) if e.is_conflict() => {}
                Err(e) => return Err(e.into()),
            }
        }

        Ok(expired)
    }
}
