//! End-to-end scheduler scenarios against an in-memory store and scripted
//! translator backends.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;

use dolmetscher_core::{
    task::priority, SchedulerConfig, Task, TaskDraft, TaskStatus, TranslatorConfig,
};
use dolmetscher_pool::{TranslateError, Translator, WorkerPool};
use dolmetscher_scheduler::{CancelOutcome, Scheduler, SchedulerError};
use dolmetscher_store::{StatusUpdate, TaskStore};

struct InstantTranslator;

#[async_trait]
impl Translator for InstantTranslator {
    async fn translate(
        &self,
        text: &str,
        _source_lang: &str,
        target_lang: &str,
    ) -> Result<String, TranslateError> {
        Ok(format!("{text} [{target_lang}]"))
    }
}

struct FailingTranslator;

#[async_trait]
impl Translator for FailingTranslator {
    async fn translate(
        &self,
        _text: &str,
        _source_lang: &str,
        _target_lang: &str,
    ) -> Result<String, TranslateError> {
        Err(TranslateError::Parse("model produced no output".into()))
    }
}

/// Holds every translation until `release` is notified, one per call.
struct GatedTranslator {
    release: Notify,
}

#[async_trait]
impl Translator for GatedTranslator {
    async fn translate(
        &self,
        text: &str,
        _source_lang: &str,
        _target_lang: &str,
    ) -> Result<String, TranslateError> {
        self.release.notified().await;
        Ok(text.to_string())
    }
}

fn config(max_queue_size: u64) -> SchedulerConfig {
    SchedulerConfig {
        gpu_workers: 0,
        cpu_workers: 1,
        max_queue_size,
        tick_interval_ms: 10,
        watchdog_interval_secs: 1,
        default_timeout_secs: 3600,
        max_retries: 3,
        utilization_threshold_pct: 85.0,
        memory_threshold_pct: 85.0,
        probe_interval_secs: 1,
    }
}

fn translator_config() -> TranslatorConfig {
    TranslatorConfig {
        endpoint: String::new(),
        intermediate_lang: "eng_Latn".into(),
        supported_languages: vec![],
    }
}

fn draft(prio: i64, text: &str) -> TaskDraft {
    TaskDraft {
        priority: prio,
        source_lang: "cmn_Hans".into(),
        target_lang: "eng_Latn".into(),
        via_intermediate: false,
        file_count: 0,
        total_size_bytes: 0,
        requester: Some("tests".into()),
        metadata: Some(serde_json::json!({ "text": text })),
        timeout_secs: None,
        max_retries: None,
    }
}

async fn scheduler_with(
    translator: Arc<dyn Translator>,
    cfg: SchedulerConfig,
) -> Arc<Scheduler> {
    let store = TaskStore::open_in_memory().await.unwrap();
    let pool = Arc::new(WorkerPool::new(cfg.gpu_workers, cfg.cpu_workers, translator));
    Arc::new(Scheduler::new(store, pool, cfg, translator_config()))
}

async fn wait_for(scheduler: &Scheduler, task_id: &str, status: TaskStatus) -> Task {
    for _ in 0..500 {
        let task = scheduler.status(task_id).await.unwrap();
        if task.status == status {
            return task;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("task {task_id} never reached {status}");
}

#[tokio::test]
async fn test_submit_dispatch_complete() {
    let scheduler = scheduler_with(Arc::new(InstantTranslator), config(10)).await;

    let id = scheduler.submit(draft(priority::NORMAL, "你好")).await.unwrap();
    assert_eq!(
        scheduler.status(&id).await.unwrap().status,
        TaskStatus::Pending
    );
    assert_eq!(scheduler.queue_len(), 1);

    assert_eq!(scheduler.tick().await.unwrap(), 1);
    let done = wait_for(&scheduler, &id, TaskStatus::Completed).await;
    assert_eq!(done.progress, 100.0);
    assert!(done.completed_at.is_some());
    assert!(done.assigned_worker.is_none());
    assert_eq!(scheduler.queue_len(), 0);
    assert!(scheduler.pool().busy_workers().is_empty());
}

#[tokio::test]
async fn test_single_worker_runs_tasks_in_priority_order() {
    let gate = Arc::new(GatedTranslator {
        release: Notify::new(),
    });
    let scheduler = scheduler_with(gate.clone(), config(10)).await;

    let normal = scheduler.submit(draft(priority::NORMAL, "a")).await.unwrap();
    let low = scheduler.submit(draft(priority::LOW, "b")).await.unwrap();
    let urgent = scheduler.submit(draft(priority::URGENT, "c")).await.unwrap();

    // One worker: each tick places exactly the head of the line.
    for expected in [&urgent, &normal, &low] {
        assert_eq!(scheduler.tick().await.unwrap(), 1);
        wait_for(&scheduler, expected, TaskStatus::Processing).await;
        // Everything else still waits its turn.
        assert_eq!(scheduler.tick().await.unwrap(), 0);
        gate.release.notify_one();
        wait_for(&scheduler, expected, TaskStatus::Completed).await;
    }
}

#[tokio::test]
async fn test_queue_full_is_backpressure_not_failure() {
    let scheduler = scheduler_with(Arc::new(InstantTranslator), config(2)).await;

    let first = scheduler.submit(draft(priority::NORMAL, "a")).await.unwrap();
    scheduler.submit(draft(priority::NORMAL, "b")).await.unwrap();

    let err = scheduler
        .submit(draft(priority::NORMAL, "c"))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        SchedulerError::QueueFull {
            active: 2,
            capacity: 2
        }
    ));

    // Capacity frees as tasks reach a terminal state.
    scheduler.tick().await.unwrap();
    wait_for(&scheduler, &first, TaskStatus::Completed).await;
    scheduler.submit(draft(priority::NORMAL, "c")).await.unwrap();
}

#[tokio::test]
async fn test_cancelling_pending_task_frees_queue_capacity() {
    let scheduler = scheduler_with(Arc::new(InstantTranslator), config(2)).await;

    scheduler.submit(draft(priority::NORMAL, "a")).await.unwrap();
    let waiting = scheduler.submit(draft(priority::LOW, "b")).await.unwrap();
    assert!(matches!(
        scheduler.submit(draft(priority::NORMAL, "c")).await.unwrap_err(),
        SchedulerError::QueueFull { .. }
    ));

    // Cancelling a still-pending task opens a slot with no dispatch round.
    assert_eq!(
        scheduler.cancel(&waiting).await.unwrap(),
        CancelOutcome::Cancelled
    );
    let admitted = scheduler.submit(draft(priority::NORMAL, "c")).await.unwrap();
    assert_eq!(
        scheduler.status(&admitted).await.unwrap().status,
        TaskStatus::Pending
    );
    assert_eq!(scheduler.queue_len(), 2);
}

#[tokio::test]
async fn test_cancel_pending_and_in_flight() {
    let gate = Arc::new(GatedTranslator {
        release: Notify::new(),
    });
    let scheduler = scheduler_with(gate.clone(), config(10)).await;

    let running = scheduler.submit(draft(priority::HIGH, "a")).await.unwrap();
    let waiting = scheduler.submit(draft(priority::LOW, "b")).await.unwrap();
    scheduler.tick().await.unwrap();
    wait_for(&scheduler, &running, TaskStatus::Processing).await;

    // Pending task: gone immediately.
    assert_eq!(
        scheduler.cancel(&waiting).await.unwrap(),
        CancelOutcome::Cancelled
    );
    assert_eq!(
        scheduler.status(&waiting).await.unwrap().status,
        TaskStatus::Cancelled
    );
    assert_eq!(scheduler.queue_len(), 0);

    // In-flight task: flagged now, cancelled when the attempt returns.
    assert_eq!(
        scheduler.cancel(&running).await.unwrap(),
        CancelOutcome::CancelRequested
    );
    assert_eq!(
        scheduler.status(&running).await.unwrap().status,
        TaskStatus::Processing
    );
    gate.release.notify_one();
    let cancelled = wait_for(&scheduler, &running, TaskStatus::Cancelled).await;
    // Cancellation is a clean outcome, not a failure.
    assert!(cancelled.error_message.is_none());
    assert!(scheduler.pool().busy_workers().is_empty());

    // Cancelling a finished task is a conflict.
    assert!(matches!(
        scheduler.cancel(&running).await.unwrap_err(),
        SchedulerError::IllegalState { .. }
    ));
}

#[tokio::test]
async fn test_retry_until_ceiling() {
    let scheduler = scheduler_with(Arc::new(FailingTranslator), config(10)).await;
    let id = scheduler.submit(draft(priority::NORMAL, "a")).await.unwrap();

    scheduler.tick().await.unwrap();
    let failed = wait_for(&scheduler, &id, TaskStatus::Failed).await;
    assert!(failed.error_message.is_some());

    for attempt in 1..=3 {
        scheduler.retry(&id).await.unwrap();
        let pending = scheduler.status(&id).await.unwrap();
        assert_eq!(pending.status, TaskStatus::Pending);
        assert_eq!(pending.retry_count, attempt);
        scheduler.tick().await.unwrap();
        wait_for(&scheduler, &id, TaskStatus::Failed).await;
    }

    assert!(matches!(
        scheduler.retry(&id).await.unwrap_err(),
        SchedulerError::RetryExhausted { retries: 3, max: 3, .. }
    ));
}

#[tokio::test]
async fn test_cancelled_task_is_never_retried() {
    let scheduler = scheduler_with(Arc::new(InstantTranslator), config(10)).await;
    let id = scheduler.submit(draft(priority::NORMAL, "a")).await.unwrap();
    scheduler.cancel(&id).await.unwrap();

    assert!(matches!(
        scheduler.retry(&id).await.unwrap_err(),
        SchedulerError::IllegalState { .. }
    ));
}

#[tokio::test]
async fn test_watchdog_expires_overdue_task() {
    let scheduler = scheduler_with(Arc::new(InstantTranslator), config(10)).await;

    // A processing row with a zero-second deadline is overdue immediately.
    let mut d = draft(priority::NORMAL, "a");
    d.timeout_secs = Some(0);
    let id = scheduler.submit(d).await.unwrap();
    scheduler
        .store()
        .update_status(&id, TaskStatus::Processing, StatusUpdate::worker("cpu-0"))
        .await
        .unwrap();

    assert_eq!(scheduler.watchdog_sweep().await.unwrap(), 1);
    let task = scheduler.status(&id).await.unwrap();
    assert_eq!(task.status, TaskStatus::Timeout);
    assert!(task.error_message.unwrap().contains("deadline"));

    // Timeout is retryable.
    scheduler.retry(&id).await.unwrap();
    assert_eq!(
        scheduler.status(&id).await.unwrap().status,
        TaskStatus::Pending
    );
}

#[tokio::test]
async fn test_recovery_requeues_orphaned_tasks() {
    let store = TaskStore::open_in_memory().await.unwrap();
    let cfg = config(10);

    // First process: a task goes into processing and the process dies.
    let first = Scheduler::new(
        store.clone(),
        Arc::new(WorkerPool::new(0, 1, Arc::new(InstantTranslator))),
        cfg.clone(),
        translator_config(),
    );
    let id = first.submit(draft(priority::NORMAL, "a")).await.unwrap();
    store
        .update_status(&id, TaskStatus::Processing, StatusUpdate::worker("cpu-0"))
        .await
        .unwrap();

    // Second process: fresh pool, nothing holds cpu-0.
    let second = Scheduler::new(
        store.clone(),
        Arc::new(WorkerPool::new(0, 1, Arc::new(InstantTranslator))),
        cfg,
        translator_config(),
    );
    assert_eq!(second.recover().await.unwrap(), 1);

    let task = second.status(&id).await.unwrap();
    assert_eq!(task.status, TaskStatus::Pending);
    assert!(task.assigned_worker.is_none());
    assert_eq!(second.queue_len(), 1);

    // And it runs to completion on the new process.
    assert_eq!(second.tick().await.unwrap(), 1);
    wait_for(&second, &id, TaskStatus::Completed).await;
}

#[tokio::test]
async fn test_submit_validation() {
    let scheduler = scheduler_with(Arc::new(InstantTranslator), config(10)).await;

    let mut same_langs = draft(priority::NORMAL, "a");
    same_langs.target_lang = same_langs.source_lang.clone();
    assert!(matches!(
        scheduler.submit(same_langs).await.unwrap_err(),
        SchedulerError::Validation(_)
    ));

    let empty = draft(priority::NORMAL, "");
    assert!(matches!(
        scheduler.submit(empty).await.unwrap_err(),
        SchedulerError::Validation(_)
    ));
}
