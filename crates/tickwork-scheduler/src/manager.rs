use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tickwork_core::{ReportEvent, Reporter, SchedulerConfig};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    error::{Result, SchedulerError},
    registry::{JobRegistry, ScheduledJob},
    schedule::Planner,
    store::CoordinationStore,
    types::{Cadence, RunResult, ScheduleInfo},
};

/// What one pass over the registry did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickSummary {
    /// Jobs inspected.
    pub checked: usize,
    /// Jobs this manager claimed and ran (or handed to a worker).
    pub claimed: usize,
    /// Jobs skipped because the store could not be used.
    pub store_errors: usize,
}

/// Result of [`Manager::reconcile`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileSummary {
    /// Stored schedule keys that belonged to no registered job.
    pub removed: Vec<String>,
    /// Registered jobs whose schedule was checked or created.
    pub ensured: usize,
}

/// Point-in-time view of one registered job.
#[derive(Debug, Clone)]
pub struct JobSnapshot {
    pub name: String,
    pub key: String,
    pub cadence: Cadence,
    pub per_host: bool,
    pub info: Option<ScheduleInfo>,
}

/// A due job this manager holds the claim for.
struct Claim {
    job: Arc<dyn ScheduledJob>,
    key: String,
    claim_key: String,
    info: ScheduleInfo,
    started: DateTime<Utc>,
}

struct Inner {
    store: Arc<dyn CoordinationStore>,
    registry: JobRegistry,
    config: SchedulerConfig,
    planner: Planner,
    reporter: Arc<dyn Reporter>,
    identity: String,
    workers: Arc<Semaphore>,
    running: Mutex<JoinSet<()>>,
    /// Run results the store refused; retried at the start of every pass.
    pending: Mutex<HashMap<String, ScheduleInfo>>,
    shutdown: CancellationToken,
}

/// Fleet-wide periodic job coordinator.
///
/// Every process runs its own `Manager` against the same
/// [`CoordinationStore`]. On each tick the manager walks the registry, loads
/// each job's [`ScheduleInfo`], and for every due job tries to create the
/// job's claim key. Only the process that creates the key runs the job; the
/// rest skip it until their next tick. There is no leader and no lock
/// ownership beyond the claim's TTL.
///
/// Cheap to clone; clones share state.
#[derive(Clone)]
pub struct Manager {
    inner: Arc<Inner>,
}

impl Manager {
    pub fn new(
        store: Arc<dyn CoordinationStore>,
        registry: JobRegistry,
        config: SchedulerConfig,
        reporter: Arc<dyn Reporter>,
    ) -> Self {
        let identity = format!(
            "tickwork:{}:{}:{}",
            config.hostname,
            std::process::id(),
            Uuid::new_v4()
        );
        let planner = Planner::new(config.random_ratio, config.first_run_window());
        let workers = Arc::new(Semaphore::new(config.workers.max(1)));
        Self {
            inner: Arc::new(Inner {
                store,
                registry,
                config,
                planner,
                reporter,
                identity,
                workers,
                running: Mutex::new(JoinSet::new()),
                pending: Mutex::new(HashMap::new()),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    /// Unique name of this manager in the fleet; also its keep-alive key.
    pub fn identity(&self) -> &str {
        &self.inner.identity
    }

    pub fn registry(&self) -> &JobRegistry {
        &self.inner.registry
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.shutdown.is_cancelled()
    }

    /// One pass over every job. Claimed jobs are handed to the worker pool,
    /// so this returns without waiting for job bodies.
    pub async fn tick(&self) -> TickSummary {
        let mut summary = self.begin_pass();
        for job in self.inner.registry.discover_schedules() {
            summary.checked += 1;
            match self.claim_if_due(job) {
                Ok(Some(claim)) => {
                    summary.claimed += 1;
                    self.spawn(claim);
                }
                Ok(None) => {}
                Err(e) => {
                    summary.store_errors += 1;
                    self.report_store_error("tick", &e);
                }
            }
        }
        summary
    }

    /// One pass over every job, running each claimed job to completion
    /// before moving on.
    pub async fn blocking_tick(&self) -> TickSummary {
        let mut summary = self.begin_pass();
        for job in self.inner.registry.discover_schedules() {
            summary.checked += 1;
            match self.claim_if_due(job) {
                Ok(Some(claim)) => {
                    summary.claimed += 1;
                    self.execute(claim).await;
                }
                Ok(None) => {}
                Err(e) => {
                    summary.store_errors += 1;
                    self.report_store_error("blocking_tick", &e);
                }
            }
        }
        summary
    }

    /// Poll until [`stop`](Self::stop) is called, then wait for in-flight
    /// jobs to finish.
    pub async fn run(&self) {
        let period = self.inner.config.tick_interval();
        info!(
            identity = %self.inner.identity,
            jobs = self.inner.registry.len(),
            period_secs = period.as_secs(),
            "scheduler manager started"
        );

        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let summary = self.tick().await;
                    if summary.claimed > 0 {
                        debug!(claimed = summary.claimed, "tick dispatched jobs");
                    }
                }
                _ = self.inner.shutdown.cancelled() => {
                    info!("scheduler manager shutting down");
                    break;
                }
            }
        }

        self.drain().await;
        info!("scheduler manager stopped");
    }

    /// Stop the polling loop.
    ///
    /// The keep-alive is dropped right away when nothing is in flight,
    /// otherwise once [`drain`](Self::drain) has waited for the running jobs.
    /// Safe to call repeatedly, and on a manager that never ran.
    pub fn stop(&self) {
        if self.inner.shutdown.is_cancelled() {
            return;
        }
        self.inner.shutdown.cancel();
        let idle = self
            .inner
            .running
            .lock()
            .map(|mut running| {
                while running.try_join_next().is_some() {}
                running.is_empty()
            })
            .unwrap_or(true);
        if idle {
            self.release_keep_alive();
        }
    }

    /// Wait for every job handed off by [`tick`](Self::tick) to finish.
    pub async fn drain(&self) {
        let mut running = {
            let mut guard = self
                .inner
                .running
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            std::mem::take(&mut *guard)
        };
        while running.join_next().await.is_some() {}
        if self.is_stopped() {
            self.release_keep_alive();
        }
    }

    /// When `job` is next expected to run.
    ///
    /// Falls back to a freshly computed (unsaved) time if nothing valid is
    /// stored yet.
    pub fn next_run(&self, job: &str) -> Result<DateTime<Utc>> {
        let job = self.job(job)?;
        let key = self.storage_key(job.as_ref());
        let cadence = job.schedule().cadence();
        let now = Utc::now();
        let mut info = self.inner.store.load_info(&key)?.unwrap_or_default();
        self.inner
            .planner
            .ensure(&mut info, &cadence, now, &mut rand::rng());
        info.next_run
            .ok_or_else(|| SchedulerError::InvalidSchedule {
                job: job.name().to_string(),
                reason: "no next run could be derived".to_string(),
            })
    }

    /// Stored schedule record for `job`, if any.
    pub fn schedule_info(&self, job: &str) -> Result<Option<ScheduleInfo>> {
        let job = self.job(job)?;
        self.inner.store.load_info(&self.storage_key(job.as_ref()))
    }

    /// Create or repair the stored schedule for `job`.
    pub fn ensure_schedule(&self, job: &str) -> Result<ScheduleInfo> {
        let job = Arc::clone(self.job(job)?);
        let key = self.storage_key(job.as_ref());
        let stored = self.inner.store.load_info(&key)?;
        self.ensure_info(job.as_ref(), &key, stored, Utc::now())
    }

    /// Drop the stored schedule for a job.
    ///
    /// Accepts either a registered job name or a raw storage key, so records
    /// left behind by renamed jobs can be removed too.
    pub fn remove(&self, job: &str) -> Result<bool> {
        let key = match self.inner.registry.get(job) {
            Some(job) => self.storage_key(job.as_ref()),
            None => job.to_string(),
        };
        self.pending().remove(&key);
        let removed = self.inner.store.delete_info(&key)?;
        if removed {
            info!(%key, "schedule removed");
        }
        Ok(removed)
    }

    /// Bring the store in line with the registry: delete schedules of jobs
    /// that no longer exist, then ensure every registered job has one.
    pub fn reconcile(&self) -> Result<ReconcileSummary> {
        let mut summary = ReconcileSummary::default();
        for key in self.inner.store.info_keys()? {
            let name = key.split('@').next().unwrap_or(&key);
            if self.inner.registry.get(name).is_none() && self.inner.store.delete_info(&key)? {
                info!(%key, "removed schedule of unregistered job");
                summary.removed.push(key);
            }
        }
        for job in self.inner.registry.discover_schedules() {
            self.ensure_schedule(job.name())?;
            summary.ensured += 1;
        }
        Ok(summary)
    }

    /// Requeue jobs left in the running state by managers whose keep-alive
    /// has expired. Returns how many were rescheduled.
    pub fn reschedule_orphans(&self) -> Result<usize> {
        let now = Utc::now();
        let mut count = 0;
        for job in self.inner.registry.discover_schedules() {
            let key = self.storage_key(job.as_ref());
            if let Some(info) = self.inner.store.load_info(&key)? {
                if self.requeue_if_orphaned(job.as_ref(), &key, info, now)?.1 {
                    count += 1;
                }
            }
        }
        Ok(count)
    }

    /// Every registered job with its stored schedule.
    pub fn schedules(&self) -> Result<Vec<JobSnapshot>> {
        self.inner
            .registry
            .discover_schedules()
            .map(|job| -> Result<JobSnapshot> {
                let spec = job.schedule();
                let key = self.storage_key(job.as_ref());
                let info = self.inner.store.load_info(&key)?;
                Ok(JobSnapshot {
                    name: job.name().to_string(),
                    key,
                    cadence: spec.cadence(),
                    per_host: spec.is_per_host(),
                    info,
                })
            })
            .collect()
    }

    // --- private helpers ---------------------------------------------------

    fn job(&self, name: &str) -> Result<&Arc<dyn ScheduledJob>> {
        self.inner
            .registry
            .get(name)
            .ok_or_else(|| SchedulerError::JobNotFound {
                name: name.to_string(),
            })
    }

    fn storage_key(&self, job: &dyn ScheduledJob) -> String {
        if job.schedule().is_per_host() {
            format!("{}@{}", job.name(), self.inner.config.hostname)
        } else {
            job.name().to_string()
        }
    }

    fn claim_ttl(&self, job: &dyn ScheduledJob) -> Duration {
        job.schedule()
            .ttl()
            .unwrap_or_else(|| self.inner.config.default_claim_ttl())
    }

    /// Refresh the keep-alive and retry run results that could not be
    /// written earlier.
    fn begin_pass(&self) -> TickSummary {
        self.refresh_keep_alive();
        self.flush_pending();
        TickSummary::default()
    }

    /// Keeps other managers from treating our running jobs as orphans.
    fn refresh_keep_alive(&self) {
        if let Err(e) = self.inner.store.set_with_expiry(
            &self.inner.identity,
            &self.inner.identity,
            self.inner.config.keep_alive(),
        ) {
            self.report_store_error("keep_alive", &e);
        }
    }

    fn pending(&self) -> std::sync::MutexGuard<'_, HashMap<String, ScheduleInfo>> {
        self.inner
            .pending
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn flush_pending(&self) {
        let mut pending = self.pending();
        pending.retain(|key, info| match self.inner.store.save_info(key, info) {
            Ok(()) => {
                info!(%key, "recorded deferred run result");
                false
            }
            Err(e) => {
                self.report_store_error("save_info", &e);
                true
            }
        });
    }

    fn release_keep_alive(&self) {
        let identity = &self.inner.identity;
        if let Err(e) = self.inner.store.release(identity, identity) {
            debug!("keep-alive release failed: {e}");
        }
    }

    fn report_store_error(&self, operation: &str, error: &SchedulerError) {
        self.inner.reporter.report(&ReportEvent::StoreUnavailable {
            operation: operation.to_string(),
            error: error.to_string(),
        });
    }

    /// Persist a valid schedule for `job` if `stored` lacks one.
    fn ensure_info(
        &self,
        job: &dyn ScheduledJob,
        key: &str,
        stored: Option<ScheduleInfo>,
        now: DateTime<Utc>,
    ) -> Result<ScheduleInfo> {
        let cadence = job.schedule().cadence();
        let existed = stored.is_some();
        let mut info = stored.unwrap_or_default();
        let previous = info.next_run;
        if !self
            .inner
            .planner
            .ensure(&mut info, &cadence, now, &mut rand::rng())
        {
            return Ok(info);
        }
        if existed {
            self.inner.reporter.report(&ReportEvent::InvalidSchedule {
                job: job.name().to_string(),
                next_run: previous.map(|t| t.to_rfc3339()),
            });
        }
        self.inner.store.save_info(key, &info)?;
        debug!(job = job.name(), next_run = ?info.next_run, "schedule written");
        Ok(info)
    }

    /// Returns the (possibly updated) info and whether it was requeued.
    fn requeue_if_orphaned(
        &self,
        job: &dyn ScheduledJob,
        key: &str,
        mut info: ScheduleInfo,
        now: DateTime<Utc>,
    ) -> Result<(ScheduleInfo, bool)> {
        if info.prev_result != Some(RunResult::Running) {
            return Ok((info, false));
        }
        let owner = info.current_owner.clone();
        if let Some(owner) = &owner {
            if self.inner.store.exists(owner)? {
                return Ok((info, false));
            }
        }
        // Until the claim expires the run may still be going; the claim TTL
        // is the only exclusion bound.
        if self.inner.store.exists(&claim_key(key))? {
            return Ok((info, false));
        }

        self.inner.reporter.report(&ReportEvent::OrphanRescheduled {
            job: job.name().to_string(),
            owner,
        });
        info.prev_result = Some(RunResult::Orphan);
        info.current_owner = None;
        info.next_run = Some(now);
        self.inner.store.save_info(key, &info)?;
        Ok((info, true))
    }

    /// Load, repair and, if due, claim `job`.
    fn claim_if_due(&self, job: &Arc<dyn ScheduledJob>) -> Result<Option<Claim>> {
        let store = &self.inner.store;
        let key = self.storage_key(job.as_ref());
        let now = Utc::now();

        let stored = match store.load_info(&key)? {
            Some(info) => Some(self.requeue_if_orphaned(job.as_ref(), &key, info, now)?.0),
            None => None,
        };
        let info = self.ensure_info(job.as_ref(), &key, stored, now)?;
        if !info.is_due(now) {
            return Ok(None);
        }

        let claim_key = claim_key(&key);
        let identity = &self.inner.identity;
        if !store.set_if_absent(&claim_key, identity, self.claim_ttl(job.as_ref()))? {
            debug!(job = job.name(), "claim held by another manager");
            return Ok(None);
        }

        // Another manager may have finished this run between our read and
        // our claim; only the record read under the claim counts.
        let mut info = match store.load_info(&key) {
            Ok(Some(fresh)) => fresh,
            Ok(None) => info,
            Err(e) => {
                self.release(&claim_key);
                return Err(e);
            }
        };
        if !info.is_due(now) || info.prev_result == Some(RunResult::Running) {
            self.release(&claim_key);
            return Ok(None);
        }

        let started = Utc::now();
        let cadence = job.schedule().cadence();
        info.prev_result = Some(RunResult::Running);
        info.current_owner = Some(identity.clone());
        // Provisional: keeps the job from looking due if the claim expires
        // before the run completes.
        info.next_run = Some(
            self.inner
                .planner
                .next_run_after(&cadence, started, &mut rand::rng()),
        );
        if let Err(e) = store.save_info(&key, &info) {
            self.release(&claim_key);
            return Err(e);
        }

        Ok(Some(Claim {
            job: Arc::clone(job),
            key,
            claim_key,
            info,
            started,
        }))
    }

    fn release(&self, claim_key: &str) {
        if let Err(e) = self.inner.store.release(claim_key, &self.inner.identity) {
            self.report_store_error("release", &e);
        }
    }

    fn spawn(&self, claim: Claim) {
        let this = self.clone();
        let workers = Arc::clone(&self.inner.workers);
        let mut running = self
            .inner
            .running
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        // reap finished runs so the set does not grow without bound
        while running.try_join_next().is_some() {}
        running.spawn(async move {
            let _permit = workers.acquire_owned().await;
            this.execute(claim).await;
        });
    }

    /// Run a claimed job and record the outcome. Never fails: job errors are
    /// recorded, store errors are reported.
    async fn execute(&self, claim: Claim) {
        let Claim {
            job,
            key,
            claim_key,
            mut info,
            started,
        } = claim;
        let name = job.name().to_string();
        let cadence = job.schedule().cadence();

        info!(job = %name, "running scheduled job");
        let clock = Instant::now();
        let body = Arc::clone(&job);
        let mut handle = tokio::task::spawn_blocking(move || body.perform());
        let mut heartbeat = tokio::time::interval(self.heartbeat_period());
        heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let outcome = loop {
            tokio::select! {
                outcome = &mut handle => break outcome,
                _ = heartbeat.tick() => self.refresh_keep_alive(),
            }
        };
        let elapsed = clock.elapsed();

        let result = match outcome {
            Ok(Ok(())) => {
                info!(job = %name, duration_ms = elapsed.as_millis() as u64, "job completed");
                RunResult::Ok
            }
            Ok(Err(e)) => {
                self.inner.reporter.report(&ReportEvent::JobFailed {
                    job: name.clone(),
                    error: format!("{e:#}"),
                });
                RunResult::Failed
            }
            Err(e) => {
                self.inner.reporter.report(&ReportEvent::JobFailed {
                    job: name.clone(),
                    error: format!("job panicked: {e}"),
                });
                RunResult::Failed
            }
        };

        let finished = Utc::now();
        info.prev_run = Some(started);
        info.prev_duration = Some(elapsed.as_secs_f64());
        info.prev_result = Some(result);
        info.current_owner = None;
        info.next_run = Some(
            self.inner
                .planner
                .next_run_after(&cadence, finished, &mut rand::rng()),
        );

        if let Err(e) = self.inner.store.save_info(&key, &info) {
            warn!(job = %name, "failed to record run result, will retry: {e}");
            self.report_store_error("save_info", &e);
            self.pending().insert(key, info);
        }
        self.release(&claim_key);
    }

    fn heartbeat_period(&self) -> Duration {
        (self.inner.config.keep_alive() / 3).max(Duration::from_millis(100))
    }
}

fn claim_key(key: &str) -> String {
    format!("claim:{key}")
}
