//! Narrow observability sink for job failures and scheduling anomalies.
//!
//! The scheduler and defer crates never talk to a logging or alerting stack
//! directly for these events; they hand a [`ReportEvent`] to whatever
//! [`Reporter`] the host installed. [`TracingReporter`] is the default.

use std::sync::Mutex;
use std::time::Duration;

use tracing::{error, warn};

/// Something an operator may want to hear about.
#[derive(Debug, Clone, PartialEq)]
pub enum ReportEvent {
    /// A periodic job body returned an error or panicked.
    JobFailed { job: String, error: String },
    /// A stored `next_run` was missing or implausible and was re-derived.
    InvalidSchedule { job: String, next_run: Option<String> },
    /// The shared store could not be reached for `operation`.
    StoreUnavailable { operation: String, error: String },
    /// A job left in the running state by a vanished manager was requeued.
    OrphanRescheduled { job: String, owner: Option<String> },
    /// A deferred task returned an error or panicked.
    DeferredTaskFailed { label: String, error: String },
    /// The defer queue was full and the task was dropped.
    DeferQueueFull { label: String, capacity: usize },
    /// A deferred task ran longer than the configured threshold.
    SlowDeferredTask { label: String, elapsed: Duration },
}

impl ReportEvent {
    /// Stable event name, suitable as a metric or alert key.
    pub fn name(&self) -> &'static str {
        match self {
            ReportEvent::JobFailed { .. } => "job_failed",
            ReportEvent::InvalidSchedule { .. } => "invalid_schedule",
            ReportEvent::StoreUnavailable { .. } => "store_unavailable",
            ReportEvent::OrphanRescheduled { .. } => "orphan_rescheduled",
            ReportEvent::DeferredTaskFailed { .. } => "deferred_task_failed",
            ReportEvent::DeferQueueFull { .. } => "defer_queue_full",
            ReportEvent::SlowDeferredTask { .. } => "slow_deferred_task",
        }
    }
}

/// Receives failure and anomaly reports. Must never panic or block for long.
pub trait Reporter: Send + Sync {
    fn report(&self, event: &ReportEvent);
}

/// Default sink: forwards every event to `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingReporter;

impl Reporter for TracingReporter {
    fn report(&self, event: &ReportEvent) {
        let name = event.name();
        match event {
            ReportEvent::JobFailed { job, error } => {
                error!(event = name, %job, %error, "scheduled job failed");
            }
            ReportEvent::InvalidSchedule { job, next_run } => {
                warn!(event = name, %job, ?next_run, "invalid schedule re-derived");
            }
            ReportEvent::StoreUnavailable { operation, error } => {
                warn!(event = name, %operation, %error, "coordination store unavailable");
            }
            ReportEvent::OrphanRescheduled { job, owner } => {
                warn!(event = name, %job, ?owner, "orphaned job rescheduled");
            }
            ReportEvent::DeferredTaskFailed { label, error } => {
                error!(event = name, %label, %error, "deferred task failed");
            }
            ReportEvent::DeferQueueFull { label, capacity } => {
                warn!(event = name, %label, capacity, "defer queue full, task dropped");
            }
            ReportEvent::SlowDeferredTask { label, elapsed } => {
                warn!(
                    event = name,
                    %label,
                    elapsed_ms = elapsed.as_millis() as u64,
                    "deferred task ran too long"
                );
            }
        }
    }
}

/// Keeps every event in memory. Handy for tests and for hosts that batch
/// reports themselves.
#[derive(Debug, Default)]
pub struct CollectingReporter {
    events: Mutex<Vec<ReportEvent>>,
}

impl CollectingReporter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of everything reported so far.
    pub fn events(&self) -> Vec<ReportEvent> {
        self.events
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Number of reported events with the given [`ReportEvent::name`].
    pub fn count(&self, name: &str) -> usize {
        self.events().iter().filter(|e| e.name() == name).count()
    }
}

impl Reporter for CollectingReporter {
    fn report(&self, event: &ReportEvent) {
        self.events
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(event.clone());
    }
}
