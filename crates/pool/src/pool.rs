//! Fixed worker pool with exclusive handles.
//!
//! Workers are created once at startup and never resized. Each worker owns
//! a one-permit slot; acquiring it yields a [`WorkerHandle`] that is the
//! only way to run a job on that worker. Dropping the handle releases the
//! slot, so a worker can never be double-booked even if the holder panics.

use std::sync::Arc;

use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::info;

use dolmetscher_core::WorkerKind;

use crate::error::PoolError;
use crate::translator::Translator;

struct Worker {
    worker_id: String,
    kind: WorkerKind,
    slot: Arc<Mutex<()>>,
}

pub struct WorkerPool {
    workers: Vec<Worker>,
    translator: Arc<dyn Translator>,
}

impl WorkerPool {
    /// Build the fixed worker set: `gpu-0..n` then `cpu-0..n`. All workers
    /// share the translator client.
    pub fn new(gpu_workers: u64, cpu_workers: u64, translator: Arc<dyn Translator>) -> Self {
        let mut workers = Vec::new();
        for i in 0..gpu_workers {
            workers.push(Worker {
                worker_id: format!("gpu-{i}"),
                kind: WorkerKind::Gpu,
                slot: Arc::new(Mutex::new(())),
            });
        }
        for i in 0..cpu_workers {
            workers.push(Worker {
                worker_id: format!("cpu-{i}"),
                kind: WorkerKind::Cpu,
                slot: Arc::new(Mutex::new(())),
            });
        }
        info!(
            gpu = gpu_workers,
            cpu = cpu_workers,
            "worker pool initialized"
        );
        Self {
            workers,
            translator,
        }
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    pub fn worker_ids(&self) -> Vec<String> {
        self.workers.iter().map(|w| w.worker_id.clone()).collect()
    }

    pub fn kind_of(&self, worker_id: &str) -> Option<WorkerKind> {
        self.workers
            .iter()
            .find(|w| w.worker_id == worker_id)
            .map(|w| w.kind)
    }

    pub fn has_kind(&self, kind: WorkerKind) -> bool {
        self.workers.iter().any(|w| w.kind == kind)
    }

    /// Workers whose slot is currently free, optionally filtered by kind.
    pub fn idle_workers(&self, kind: Option<WorkerKind>) -> Vec<String> {
        self.workers
            .iter()
            .filter(|w| kind.map_or(true, |k| w.kind == k))
            .filter(|w| w.slot.try_lock().is_ok())
            .map(|w| w.worker_id.clone())
            .collect()
    }

    /// Workers currently running a job. This is the live-lock set the
    /// store's recovery pass checks orphaned rows against.
    pub fn busy_workers(&self) -> Vec<String> {
        self.workers
            .iter()
            .filter(|w| w.slot.try_lock().is_err())
            .map(|w| w.worker_id.clone())
            .collect()
    }

    /// Drain the pool for shutdown: wait until every worker has released
    /// its slot, in reverse registration order, so dependent resources are
    /// torn down last-created first. No new handles should be issued once
    /// this is called.
    pub async fn shutdown(&self) {
        for worker in self.workers.iter().rev() {
            let _guard = worker.slot.lock().await;
            info!(worker_id = %worker.worker_id, "worker drained");
        }
        info!("worker pool shut down");
    }

    /// Claim a specific worker. Non-blocking: a held slot is an error, the
    /// scheduler picks another worker or waits a tick.
    pub fn acquire(&self, worker_id: &str) -> Result<WorkerHandle, PoolError> {
        let worker = self
            .workers
            .iter()
            .find(|w| w.worker_id == worker_id)
            .ok_or_else(|| PoolError::UnknownWorker(worker_id.to_string()))?;
        let guard = worker
            .slot
            .clone()
            .try_lock_owned()
            .map_err(|_| PoolError::Busy(worker_id.to_string()))?;
        Ok(WorkerHandle {
            worker_id: worker.worker_id.clone(),
            kind: worker.kind,
            translator: self.translator.clone(),
            _guard: guard,
        })
    }
}

/// Exclusive claim on one worker for the duration of one job. The slot is
/// released on drop.
pub struct WorkerHandle {
    worker_id: String,
    kind: WorkerKind,
    translator: Arc<dyn Translator>,
    _guard: OwnedMutexGuard<()>,
}

impl WorkerHandle {
    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    pub fn kind(&self) -> WorkerKind {
        self.kind
    }

    pub fn translator(&self) -> &Arc<dyn Translator> {
        &self.translator
    }
}
