//! Background loops driving the scheduler.
//!
//! Every loop is spawn-and-forget: errors are logged and the loop keeps
//! ticking. A tokio interval fires immediately on its first tick, so the
//! probe publishes worker metrics before the first dispatch round runs.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use dolmetscher_pool::DeviceProbe;

use crate::scheduler::Scheduler;

const RETENTION_SWEEP_SECS: u64 = 3600;

/// Spawn the full set of loops: dispatch, watchdog, probe, and (when
/// retention is enabled) the terminal-task purge.
pub fn spawn_all(
    scheduler: Arc<Scheduler>,
    probe: Arc<dyn DeviceProbe>,
    retention_hours: u64,
) -> Vec<JoinHandle<()>> {
    let mut handles = vec![
        spawn_probe_loop(scheduler.clone(), probe),
        spawn_dispatch_loop(scheduler.clone()),
        spawn_watchdog_loop(scheduler.clone()),
    ];
    if retention_hours > 0 {
        handles.push(spawn_retention_loop(scheduler, retention_hours));
    } else {
        info!("task retention disabled, no purge loop");
    }
    handles
}

pub fn spawn_dispatch_loop(scheduler: Arc<Scheduler>) -> JoinHandle<()> {
    let period = Duration::from_millis(scheduler.config().tick_interval_ms.max(1));
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        loop {
            interval.tick().await;
            match scheduler.tick().await {
                Ok(0) => {}
                Ok(n) => debug!(dispatched = n, "dispatch round"),
                Err(e) => error!("dispatch round failed: {e}"),
            }
        }
    })
}

pub fn spawn_watchdog_loop(scheduler: Arc<Scheduler>) -> JoinHandle<()> {
    let period = Duration::from_secs(scheduler.config().watchdog_interval_secs.max(1));
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        loop {
            interval.tick().await;
            match scheduler.watchdog_sweep().await {
                Ok(0) => {}
                Ok(n) => info!(expired = n, "watchdog sweep"),
                Err(e) => error!("watchdog sweep failed: {e}"),
            }
        }
    })
}

/// Read device metrics and publish one status row per worker. With fewer
/// metric entries than workers the last entry covers the remainder; a
/// host-level probe reports one entry for everything.
pub fn spawn_probe_loop(scheduler: Arc<Scheduler>, probe: Arc<dyn DeviceProbe>) -> JoinHandle<()> {
    let period = Duration::from_secs(scheduler.config().probe_interval_secs.max(1));
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        loop {
            interval.tick().await;
            let metrics = probe.read_metrics().await;
            if metrics.is_empty() {
                continue;
            }
            for (i, worker_id) in scheduler.pool().worker_ids().iter().enumerate() {
                let Some(kind) = scheduler.pool().kind_of(worker_id) else {
                    continue;
                };
                let m = metrics.get(i).unwrap_or(&metrics[metrics.len() - 1]);
                if let Err(e) = scheduler
                    .store()
                    .upsert_worker_status(worker_id, kind, m)
                    .await
                {
                    error!(worker_id = %worker_id, "failed to publish worker metrics: {e}");
                }
            }
        }
    })
}

pub fn spawn_retention_loop(scheduler: Arc<Scheduler>, retention_hours: u64) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(RETENTION_SWEEP_SECS));
        loop {
            interval.tick().await;
            let cutoff = chrono::Utc::now() - chrono::Duration::hours(retention_hours as i64);
            match scheduler.store().purge_terminal_before(cutoff).await {
                Ok(0) => {}
                Ok(n) => info!(purged = n, retention_hours, "retention sweep"),
                Err(e) => error!("retention sweep failed: {e}"),
            }
        }
    })
}
