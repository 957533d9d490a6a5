//! Job execution.
//!
//! One dispatched task runs as one spawned future holding a worker handle
//! for its whole lifetime. The future owns the full terminal transition:
//! completed, failed, timeout, or cancelled. The watchdog is only a
//! backstop for futures that never return.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::{debug, error, info, warn};

use dolmetscher_core::{Task, TranslatorConfig};
use dolmetscher_pool::WorkerHandle;
use dolmetscher_store::{StatusUpdate, TaskStore};

use crate::error::SchedulerError;

/// Everything a worker needs to run one job, resolved up front. Replaces
/// any re-reading of the task row mid-flight: the context is fixed at
/// dispatch time.
#[derive(Debug, Clone)]
pub struct TaskContext {
    pub task_id: String,
    /// Text to translate, from the submission's `metadata.text` field.
    pub text: String,
    pub source_lang: String,
    pub target_lang: String,
    pub via_intermediate: bool,
    pub intermediate_lang: String,
    pub timeout_secs: i64,
}

impl TaskContext {
    pub fn from_task(task: &Task, translator: &TranslatorConfig) -> Result<Self, SchedulerError> {
        let text = task
            .metadata
            .as_deref()
            .and_then(|raw| serde_json::from_str::<serde_json::Value>(raw).ok())
            .and_then(|v| v.get("text").and_then(|t| t.as_str()).map(String::from))
            .unwrap_or_default();
        if text.is_empty() && task.file_count == 0 {
            return Err(SchedulerError::Validation(format!(
                "task {} has no translatable content",
                task.task_id
            )));
        }
        Ok(Self {
            task_id: task.task_id.clone(),
            text,
            source_lang: task.source_lang.clone(),
            target_lang: task.target_lang.clone(),
            via_intermediate: task.via_intermediate,
            intermediate_lang: translator.intermediate_lang.clone(),
            timeout_secs: task.timeout_secs,
        })
    }
}

/// Cooperative cancellation flags for in-flight tasks. Cancelling a
/// processing task raises its flag; the running future applies it when the
/// current translation call returns.
#[derive(Clone, Default)]
pub struct CancelRegistry {
    inner: Arc<Mutex<HashSet<String>>>,
}

impl CancelRegistry {
    pub fn request(&self, task_id: &str) -> bool {
        self.lock().insert(task_id.to_string())
    }

    pub fn is_requested(&self, task_id: &str) -> bool {
        self.lock().contains(task_id)
    }

    /// Consume the flag, if raised.
    pub fn take(&self, task_id: &str) -> bool {
        self.lock().remove(task_id)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashSet<String>> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

/// Run one job to a terminal state. Consumes the worker handle; the worker
/// slot frees when this future ends, whatever the outcome.
pub async fn run_task(
    store: TaskStore,
    handle: WorkerHandle,
    ctx: TaskContext,
    cancels: CancelRegistry,
) {
    let worker_id = handle.worker_id().to_string();
    info!(
        task_id = %ctx.task_id,
        worker = %worker_id,
        source = %ctx.source_lang,
        target = %ctx.target_lang,
        via_intermediate = ctx.via_intermediate,
        "task started"
    );

    let translator = handle.translator();
    let deadline = Duration::from_secs(ctx.timeout_secs.max(1) as u64);
    let work = async {
        if ctx.via_intermediate {
            let pivoted = translator
                .translate(&ctx.text, &ctx.source_lang, &ctx.intermediate_lang)
                .await?;
            if let Err(e) = store.update_progress(&ctx.task_id, 50.0).await {
                debug!(task_id = %ctx.task_id, "progress update failed: {e}");
            }
            translator
                .translate(&pivoted, &ctx.intermediate_lang, &ctx.target_lang)
                .await
        } else {
            translator
                .translate(&ctx.text, &ctx.source_lang, &ctx.target_lang)
                .await
        }
    };
    let outcome = tokio::time::timeout(deadline, work).await;

    // A cancel that arrived mid-flight wins over whatever the model
    // produced: the caller already saw the task as going away.
    if cancels.take(&ctx.task_id) {
        finish(
            &store,
            &ctx.task_id,
            dolmetscher_core::TaskStatus::Cancelled,
            StatusUpdate::default(),
        )
        .await;
        return;
    }

    match outcome {
        Ok(Ok(translated)) => {
            info!(
                task_id = %ctx.task_id,
                worker = %worker_id,
                output_chars = translated.chars().count(),
                "task completed"
            );
            finish(
                &store,
                &ctx.task_id,
                dolmetscher_core::TaskStatus::Completed,
                StatusUpdate::default(),
            )
            .await;
        }
        Ok(Err(e)) => {
            warn!(task_id = %ctx.task_id, worker = %worker_id, "task failed: {e}");
            finish(
                &store,
                &ctx.task_id,
                dolmetscher_core::TaskStatus::Failed,
                StatusUpdate::error(e.to_string()),
            )
            .await;
        }
        Err(_elapsed) => {
            warn!(
                task_id = %ctx.task_id,
                worker = %worker_id,
                timeout_secs = ctx.timeout_secs,
                "task timed out"
            );
            finish(
                &store,
                &ctx.task_id,
                dolmetscher_core::TaskStatus::Timeout,
                StatusUpdate::error(format!(
                    "processing exceeded {}s deadline",
                    ctx.timeout_secs
                )),
            )
            .await;
        }
    }
}

/// Apply a terminal transition, tolerating a race with the watchdog or a
/// concurrent cancel: a conflict here means someone else already finished
/// the task, which is fine.
async fn finish(
    store: &TaskStore,
    task_id: &str,
    status: dolmetscher_core::TaskStatus,
    update: StatusUpdate,
) {
    match store.update_status(task_id, status, update).await {
        Ok(()) => {}
        Err(e) if e.is_conflict() => {
            debug!(task_id, %status, "terminal transition lost a race: {e}");
        }
        Err(e) => {
            error!(task_id, %status, "failed to record terminal status: {e}");
        }
    }
}
