//! `tickwork-core`: configuration, shared errors and the observability sink
//! used by the scheduler and defer crates.

pub mod config;
pub mod error;
pub mod report;

pub use config::{DeferConfig, SchedulerConfig, StoreConfig, TickworkConfig};
pub use error::{Result, TickworkError};
pub use report::{CollectingReporter, ReportEvent, Reporter, TracingReporter};
