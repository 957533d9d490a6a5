//! Metrics-driven worker selection.
//!
//! Pure functions over the persisted worker status rows and the pool's
//! live idle set, so allocation policy is testable without a database.

use std::collections::HashMap;

use dolmetscher_core::{Task, WorkerKind, WorkerStatus};

/// Which worker class a task wants. File-bearing jobs go to the GPU tier;
/// plain text fits on CPU workers.
pub fn preferred_kind(task: &Task) -> WorkerKind {
    if task.file_count > 0 {
        WorkerKind::Gpu
    } else {
        WorkerKind::Cpu
    }
}

/// Pick the best worker for a job among `idle` workers of one kind.
///
/// A worker with a status row qualifies only when it is unclaimed and under
/// both load thresholds; among qualifiers the least utilized one wins, ties
/// going to the most free memory. Idle workers the probe has not reported
/// yet are taken as a last resort, so a fresh process can dispatch before
/// the first probe sweep lands.
pub fn pick_worker(
    idle: &[String],
    statuses: &[WorkerStatus],
    kind: WorkerKind,
    utilization_threshold: f64,
    memory_threshold: f64,
) -> Option<String> {
    let by_id: HashMap<&str, &WorkerStatus> = statuses
        .iter()
        .map(|s| (s.worker_id.as_str(), s))
        .collect();

    let mut reported: Vec<&WorkerStatus> = Vec::new();
    let mut unreported: Vec<&String> = Vec::new();
    for worker_id in idle {
        match by_id.get(worker_id.as_str()) {
            Some(status) => {
                if status.kind == kind
                    && status.current_task_id.is_none()
                    && status.within_thresholds(utilization_threshold, memory_threshold)
                {
                    reported.push(status);
                }
            }
            None => unreported.push(worker_id),
        }
    }

    reported.sort_by(|a, b| {
        a.utilization_pct
            .partial_cmp(&b.utilization_pct)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| b.memory_free.cmp(&a.memory_free))
            .then_with(|| a.worker_id.cmp(&b.worker_id))
    });

    reported
        .first()
        .map(|s| s.worker_id.clone())
        .or_else(|| unreported.first().map(|id| (*id).clone()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn status(worker_id: &str, kind: WorkerKind, free: i64, utilization: f64) -> WorkerStatus {
        WorkerStatus {
            worker_id: worker_id.into(),
            kind,
            device_name: None,
            memory_total: 16_000,
            memory_used: 16_000 - free,
            memory_free: free,
            utilization_pct: utilization,
            temperature: 40.0,
            is_available: true,
            current_task_id: None,
            last_updated: Some(Utc::now()),
        }
    }

    fn task_with_files(file_count: i64) -> Task {
        Task {
            task_id: "t".into(),
            status: dolmetscher_core::TaskStatus::Pending,
            priority: 2,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            progress: 0.0,
            error_message: None,
            retry_count: 0,
            max_retries: 3,
            timeout_secs: 3600,
            metadata: None,
            requester: None,
            source_lang: "cmn_Hans".into(),
            target_lang: "eng_Latn".into(),
            via_intermediate: false,
            file_count,
            total_size_bytes: 0,
            assigned_worker: None,
        }
    }

    #[test]
    fn test_preferred_kind_by_payload_shape() {
        assert_eq!(preferred_kind(&task_with_files(3)), WorkerKind::Gpu);
        assert_eq!(preferred_kind(&task_with_files(0)), WorkerKind::Cpu);
    }

    #[test]
    fn test_picks_least_utilized_worker() {
        // gpu-1 has far more memory headroom, but gpu-0 is less busy.
        let idle = vec!["gpu-0".to_string(), "gpu-1".to_string()];
        let statuses = vec![
            status("gpu-0", WorkerKind::Gpu, 4_000, 10.0),
            status("gpu-1", WorkerKind::Gpu, 12_000, 30.0),
        ];
        let pick = pick_worker(&idle, &statuses, WorkerKind::Gpu, 85.0, 85.0);
        assert_eq!(pick.as_deref(), Some("gpu-0"));
    }

    #[test]
    fn test_utilization_tie_breaks_on_free_memory() {
        let idle = vec!["gpu-0".to_string(), "gpu-1".to_string()];
        let statuses = vec![
            status("gpu-0", WorkerKind::Gpu, 4_000, 20.0),
            status("gpu-1", WorkerKind::Gpu, 12_000, 20.0),
        ];
        let pick = pick_worker(&idle, &statuses, WorkerKind::Gpu, 85.0, 85.0);
        assert_eq!(pick.as_deref(), Some("gpu-1"));
    }

    #[test]
    fn test_skips_workers_over_threshold() {
        let idle = vec!["gpu-0".to_string(), "gpu-1".to_string()];
        let statuses = vec![
            status("gpu-0", WorkerKind::Gpu, 12_000, 95.0),
            status("gpu-1", WorkerKind::Gpu, 4_000, 20.0),
        ];
        let pick = pick_worker(&idle, &statuses, WorkerKind::Gpu, 85.0, 85.0);
        assert_eq!(pick.as_deref(), Some("gpu-1"));
    }

    #[test]
    fn test_no_worker_when_all_saturated() {
        let idle = vec!["gpu-0".to_string()];
        // 15 of 16 GB used is over an 85% memory ceiling.
        let statuses = vec![status("gpu-0", WorkerKind::Gpu, 1_000, 10.0)];
        assert!(pick_worker(&idle, &statuses, WorkerKind::Gpu, 85.0, 85.0).is_none());
    }

    #[test]
    fn test_skips_claimed_worker_rows() {
        let idle = vec!["gpu-0".to_string()];
        let mut s = status("gpu-0", WorkerKind::Gpu, 12_000, 10.0);
        s.current_task_id = Some("other-task".into());
        assert!(pick_worker(&idle, &[s], WorkerKind::Gpu, 85.0, 85.0).is_none());
    }

    #[test]
    fn test_unreported_idle_worker_is_last_resort() {
        let idle = vec!["gpu-0".to_string(), "gpu-1".to_string()];
        let statuses = vec![status("gpu-0", WorkerKind::Gpu, 8_000, 10.0)];
        let pick = pick_worker(&idle, &statuses, WorkerKind::Gpu, 85.0, 85.0);
        assert_eq!(pick.as_deref(), Some("gpu-0"));

        // No rows at all: still dispatchable.
        let pick = pick_worker(&idle, &[], WorkerKind::Gpu, 85.0, 85.0);
        assert_eq!(pick.as_deref(), Some("gpu-0"));
    }
}
