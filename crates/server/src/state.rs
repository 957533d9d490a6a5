//! Shared application state for HTTP handlers.

use std::sync::Arc;

use dolmetscher_scheduler::Scheduler;

pub struct AppState {
    pub scheduler: Arc<Scheduler>,
}
