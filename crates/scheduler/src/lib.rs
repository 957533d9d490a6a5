//! Scheduling core: admission queue, worker allocation, job dispatch,
//! and the background loops that drive them.

pub mod allocator;
pub mod dispatch;
pub mod error;
pub mod loops;
pub mod queue;
pub mod scheduler;

pub use dispatch::{CancelRegistry, TaskContext};
pub use error::SchedulerError;
pub use queue::AdmissionQueue;
pub use scheduler::{CancelOutcome, Scheduler};
