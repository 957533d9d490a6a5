//! Worker and device-metric types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The resource class backing a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum WorkerKind {
    Gpu,
    Cpu,
}

impl WorkerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkerKind::Gpu => "gpu",
            WorkerKind::Cpu => "cpu",
        }
    }
}

impl std::fmt::Display for WorkerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Raw per-device metrics as reported by a probe. The probe is the only
/// writer of these fields; availability is derived, never reported.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceMetrics {
    pub device_id: String,
    pub device_name: String,
    pub memory_total: i64,
    pub memory_used: i64,
    pub memory_free: i64,
    pub utilization_pct: f64,
    pub temperature: f64,
}

/// One compute worker's persisted status row (`worker_status` table).
///
/// Metric fields come from the probe loop; `current_task_id` and
/// `is_available` are owned by the scheduler loop.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct WorkerStatus {
    pub worker_id: String,
    pub kind: WorkerKind,
    pub device_name: Option<String>,
    pub memory_total: i64,
    pub memory_used: i64,
    pub memory_free: i64,
    pub utilization_pct: f64,
    pub temperature: f64,
    pub is_available: bool,
    pub current_task_id: Option<String>,
    pub last_updated: Option<DateTime<Utc>>,
}

impl WorkerStatus {
    /// Memory pressure as a percentage of total; 0 when total is unknown.
    pub fn memory_used_pct(&self) -> f64 {
        if self.memory_total <= 0 {
            return 0.0;
        }
        self.memory_used as f64 * 100.0 / self.memory_total as f64
    }

    /// Whether this worker is safe to allocate under the configured
    /// utilization and memory thresholds. Idleness is checked separately
    /// against the live pool.
    pub fn within_thresholds(&self, utilization_threshold: f64, memory_threshold: f64) -> bool {
        self.utilization_pct <= utilization_threshold
            && self.memory_used_pct() <= memory_threshold
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status(utilization: f64, used: i64, total: i64) -> WorkerStatus {
        WorkerStatus {
            worker_id: "gpu-0".into(),
            kind: WorkerKind::Gpu,
            device_name: Some("Test GPU".into()),
            memory_total: total,
            memory_used: used,
            memory_free: total - used,
            utilization_pct: utilization,
            temperature: 40.0,
            is_available: true,
            current_task_id: None,
            last_updated: None,
        }
    }

    #[test]
    fn test_within_thresholds() {
        assert!(status(50.0, 4_000, 16_000).within_thresholds(85.0, 85.0));
        assert!(!status(90.0, 4_000, 16_000).within_thresholds(85.0, 85.0));
        // 15/16 GB used is above an 85% memory ceiling.
        assert!(!status(10.0, 15_000, 16_000).within_thresholds(85.0, 85.0));
    }

    #[test]
    fn test_memory_pct_with_unknown_total() {
        assert_eq!(status(0.0, 100, 0).memory_used_pct(), 0.0);
    }
}
