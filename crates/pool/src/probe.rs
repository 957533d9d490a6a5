//! Device metric probes.
//!
//! The scheduler periodically reads metrics through [`DeviceProbe`] and
//! persists them to the worker status table; the allocator then filters on
//! them. [`HostProbe`] reads host CPU and memory via sysinfo. Deployments
//! with dedicated accelerators plug in their own probe behind the trait.

use std::sync::Mutex;

use async_trait::async_trait;
use sysinfo::{CpuExt, System, SystemExt};

use dolmetscher_core::DeviceMetrics;

#[async_trait]
pub trait DeviceProbe: Send + Sync {
    /// Current metrics for every device this probe can see. An empty vec
    /// means the probe has nothing to report this round, not an error.
    async fn read_metrics(&self) -> Vec<DeviceMetrics>;
}

/// Host-level probe: one metrics entry covering the machine's CPU and RAM.
pub struct HostProbe {
    sys: Mutex<System>,
}

impl HostProbe {
    pub fn new() -> Self {
        Self {
            sys: Mutex::new(System::new_all()),
        }
    }
}

impl Default for HostProbe {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DeviceProbe for HostProbe {
    async fn read_metrics(&self) -> Vec<DeviceMetrics> {
        let mut sys = match self.sys.lock() {
            Ok(sys) => sys,
            // A panicked holder only ever touched refresh state.
            Err(poisoned) => poisoned.into_inner(),
        };
        sys.refresh_cpu();
        sys.refresh_memory();

        let to_mb = |bytes: u64| (bytes / 1024 / 1024) as i64;
        let total = to_mb(sys.total_memory());
        let used = to_mb(sys.used_memory());

        vec![DeviceMetrics {
            device_id: "host-0".to_string(),
            device_name: sys.global_cpu_info().brand().to_string(),
            memory_total: total,
            memory_used: used,
            memory_free: total - used,
            utilization_pct: sys.global_cpu_info().cpu_usage() as f64,
            temperature: 0.0,
        }]
    }
}
