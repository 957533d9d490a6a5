use std::env;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Load .env file (silently ignores if missing).
pub fn load_dotenv() {
    dotenvy::dotenv().ok();
}

fn env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_opt(key: &str) -> Option<String> {
    env::var(key).ok().filter(|s| !s.is_empty())
}

fn env_u64(key: &str, default: u64) -> u64 {
    env_opt(key).and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn env_u16(key: &str, default: u16) -> u16 {
    env_opt(key).and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn env_f64(key: &str, default: f64) -> f64 {
    env_opt(key).and_then(|v| v.parse().ok()).unwrap_or(default)
}

// ── Top-level config ──────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub storage: StorageConfig,
    pub scheduler: SchedulerConfig,
    pub translator: TranslatorConfig,
}

impl Config {
    /// Build config from environment variables (call `load_dotenv()` first).
    pub fn from_env() -> Self {
        Self {
            server: ServerConfig::from_env(),
            storage: StorageConfig::from_env(),
            scheduler: SchedulerConfig::from_env(),
            translator: TranslatorConfig::from_env(),
        }
    }

    /// Print a redacted summary for startup logs.
    pub fn log_summary(&self) {
        tracing::info!("Config loaded:");
        tracing::info!("  server:     {}:{}", self.server.host, self.server.port);
        tracing::info!("  storage:    db={}, retention_hours={}", self.storage.db_path.display(), self.storage.retention_hours);
        tracing::info!(
            "  scheduler:  gpu_workers={}, cpu_workers={}, max_queue_size={}, tick={}ms",
            self.scheduler.gpu_workers,
            self.scheduler.cpu_workers,
            self.scheduler.max_queue_size,
            self.scheduler.tick_interval_ms
        );
        tracing::info!(
            "  thresholds: utilization={}%, memory={}%, task_timeout={}s",
            self.scheduler.utilization_threshold_pct,
            self.scheduler.memory_threshold_pct,
            self.scheduler.default_timeout_secs
        );
        tracing::info!("  translator: endpoint={}", self.translator.endpoint);
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl ServerConfig {
    pub fn from_env() -> Self {
        Self {
            host: env_or("HTTP_HOST", "0.0.0.0"),
            port: env_u16("HTTP_PORT", 8000),
        }
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// SQLite database file holding tasks, the queue relation, and
    /// worker status.
    pub db_path: PathBuf,
    /// Terminal tasks older than this are purged by the retention loop.
    /// Zero disables the sweep.
    pub retention_hours: u64,
}

impl StorageConfig {
    pub fn from_env() -> Self {
        Self {
            db_path: PathBuf::from(env_or("DB_PATH", "tasks.db")),
            retention_hours: env_u64("TASK_RETENTION_HOURS", 24),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Number of GPU-bound model instances loaded at startup.
    pub gpu_workers: u64,
    /// Number of CPU-bound model instances loaded at startup.
    pub cpu_workers: u64,
    /// Admission ceiling: pending + processing tasks beyond this are
    /// rejected with a queue-full signal.
    pub max_queue_size: u64,
    pub tick_interval_ms: u64,
    pub watchdog_interval_secs: u64,
    /// Default per-task processing deadline; overridable per task.
    pub default_timeout_secs: u64,
    pub max_retries: u64,
    /// Workers above either threshold are excluded from allocation.
    pub utilization_threshold_pct: f64,
    pub memory_threshold_pct: f64,
    pub probe_interval_secs: u64,
}

impl SchedulerConfig {
    pub fn from_env() -> Self {
        Self {
            gpu_workers: env_u64("GPU_WORKERS", 1),
            cpu_workers: env_u64("CPU_WORKERS", 1),
            max_queue_size: env_u64("MAX_TASK_QUEUE_SIZE", 50),
            tick_interval_ms: env_u64("SCHED_TICK_MS", 1000),
            watchdog_interval_secs: env_u64("WATCHDOG_INTERVAL_SECS", 10),
            default_timeout_secs: env_u64("TASK_TIMEOUT_SECS", 3600),
            max_retries: env_u64("TASK_MAX_RETRIES", 3),
            utilization_threshold_pct: env_f64("WORKER_UTILIZATION_THRESHOLD", 85.0),
            memory_threshold_pct: env_f64("WORKER_MEMORY_THRESHOLD", 85.0),
            probe_interval_secs: env_u64("PROBE_INTERVAL_SECS", 10),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranslatorConfig {
    /// Base URL of the inference sidecar serving the translation model.
    pub endpoint: String,
    /// Pivot language for two-hop translation.
    pub intermediate_lang: String,
    /// Accepted language codes; empty list accepts anything.
    pub supported_languages: Vec<String>,
}

impl TranslatorConfig {
    pub fn from_env() -> Self {
        let supported = env_or(
            "SUPPORTED_LANGUAGES",
            "eng_Latn,cmn_Hans,cmn_Hant,mon_Cyrl,mon_Mong",
        );
        Self {
            endpoint: env_or("TRANSLATOR_URL", "http://127.0.0.1:9000"),
            intermediate_lang: env_or("INTERMEDIATE_LANG", "eng_Latn"),
            supported_languages: supported
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect(),
        }
    }

    pub fn is_language_supported(&self, lang: &str) -> bool {
        self.supported_languages.is_empty()
            || self.supported_languages.iter().any(|l| l == lang)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_language_support_with_empty_list_accepts_all() {
        let cfg = TranslatorConfig {
            endpoint: String::new(),
            intermediate_lang: "eng_Latn".into(),
            supported_languages: vec![],
        };
        assert!(cfg.is_language_supported("anything"));
    }

    #[test]
    fn test_language_support_with_explicit_list() {
        let cfg = TranslatorConfig {
            endpoint: String::new(),
            intermediate_lang: "eng_Latn".into(),
            supported_languages: vec!["eng_Latn".into(), "cmn_Hans".into()],
        };
        assert!(cfg.is_language_supported("cmn_Hans"));
        assert!(!cfg.is_language_supported("deu_Latn"));
    }
}
