//! Built-in housekeeping jobs registered by the worker.

use std::sync::Arc;
use std::time::Duration;

use tickwork_scheduler::{CoordinationStore, JobRegistry, ScheduleSpec, ScheduledJob};
use tracing::info;

/// Deletes expired claim and keep-alive keys so the shared store does not
/// accumulate entries from managers that exited without cleaning up.
pub struct PurgeExpiredKeys {
    store: Arc<dyn CoordinationStore>,
}

impl PurgeExpiredKeys {
    pub fn new(store: Arc<dyn CoordinationStore>) -> Self {
        Self { store }
    }
}

impl ScheduledJob for PurgeExpiredKeys {
    fn name(&self) -> &str {
        "purge_expired_keys"
    }

    fn schedule(&self) -> ScheduleSpec {
        ScheduleSpec::every(Duration::from_secs(3600))
    }

    fn perform(&self) -> anyhow::Result<()> {
        let removed = self.store.purge_expired()?;
        info!(removed, "purged expired coordination keys");
        Ok(())
    }
}

/// Every job this worker knows about.
pub fn registry(store: &Arc<dyn CoordinationStore>) -> tickwork_scheduler::Result<JobRegistry> {
    JobRegistry::new().with(Arc::new(PurgeExpiredKeys::new(Arc::clone(store))))
}
