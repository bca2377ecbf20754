use std::sync::Arc;

use tracing::info;

use crate::error::{Result, SchedulerError};
use crate::types::ScheduleSpec;

/// A periodic job the manager can run.
///
/// `perform` is called from a blocking context (`spawn_blocking`). It may be
/// called again while a previous call on another host is still running if
/// the job outlives its claim, so it should tolerate the rare double run.
pub trait ScheduledJob: Send + Sync {
    /// Stable name, used as the storage key. Renaming a job orphans its
    /// stored schedule until [`crate::Manager::reconcile`] cleans it up.
    fn name(&self) -> &str;

    /// Cadence and claim settings.
    fn schedule(&self) -> ScheduleSpec;

    /// Do the work.
    fn perform(&self) -> anyhow::Result<()>;
}

/// Ordered set of every job this process knows about, built once at startup.
#[derive(Default, Clone)]
pub struct JobRegistry {
    jobs: Vec<Arc<dyn ScheduledJob>>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a job. Rejects invalid schedules and duplicate names.
    pub fn register(&mut self, job: Arc<dyn ScheduledJob>) -> Result<()> {
        let name = job.name().to_string();
        if name.is_empty() || name.contains('@') {
            return Err(SchedulerError::InvalidSchedule {
                job: name,
                reason: "job name must be non-empty and must not contain '@'".to_string(),
            });
        }
        job.schedule().validate(&name)?;
        if self.get(&name).is_some() {
            return Err(SchedulerError::DuplicateJob { name });
        }
        info!(job = %name, cadence = %job.schedule().cadence(), "job registered");
        self.jobs.push(job);
        Ok(())
    }

    /// Builder form of [`register`](Self::register).
    pub fn with(mut self, job: Arc<dyn ScheduledJob>) -> Result<Self> {
        self.register(job)?;
        Ok(self)
    }

    /// Every registered job in registration order.
    pub fn discover_schedules(&self) -> impl Iterator<Item = &Arc<dyn ScheduledJob>> {
        self.jobs.iter()
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn ScheduledJob>> {
        self.jobs.iter().find(|job| job.name() == name)
    }

    pub fn names(&self) -> Vec<&str> {
        self.jobs.iter().map(|job| job.name()).collect()
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }
}
