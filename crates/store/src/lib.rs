//! Durable task store — the single source of truth for every job ever
//! submitted, its queue entry, and the worker status table.

pub mod error;
pub mod store;

pub use error::StoreError;
pub use store::{StatusUpdate, TaskStore};
