//! Worker pool: a fixed set of translation workers over GPU/CPU devices,
//! each guarding at most one running job, plus the translator client and
//! the device probe they depend on.

pub mod error;
pub mod pool;
pub mod probe;
pub mod translator;

pub use error::PoolError;
pub use pool::{WorkerHandle, WorkerPool};
pub use probe::{DeviceProbe, HostProbe};
pub use translator::{HttpTranslator, TranslateError, Translator};
