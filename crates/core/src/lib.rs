//! Shared domain types and configuration for the translation scheduler.

pub mod config;
pub mod task;
pub mod worker;

pub use config::{Config, SchedulerConfig, ServerConfig, StorageConfig, TranslatorConfig};
pub use task::*;
pub use worker::*;
