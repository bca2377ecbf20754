use std::collections::{BTreeMap, VecDeque};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tickwork_core::{DeferConfig, ReportEvent, Reporter};
use tracing::{debug, info, warn};

const ANONYMOUS: &str = "anonymous";

type TaskFn = Box<dyn FnOnce() -> anyhow::Result<()> + Send + 'static>;

struct Task {
    label: String,
    run: TaskFn,
}

/// Counters for one task label.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct TaskStats {
    pub runs: u64,
    pub failures: u64,
    pub total: Duration,
}

#[derive(Default)]
struct State {
    queue: VecDeque<Task>,
    paused: bool,
    /// Bumped by `stop`; a worker exits once it no longer matches.
    generation: u64,
    stats: BTreeMap<String, TaskStats>,
}

struct Shared {
    state: Mutex<State>,
    wake: Condvar,
    config: DeferConfig,
    reporter: Arc<dyn Reporter>,
}

struct Worker {
    handle: JoinHandle<()>,
    generation: u64,
    pid: u32,
}

/// Fire-and-forget background work.
///
/// [`later`](Self::later) queues a closure for a dedicated worker thread and
/// returns immediately. Failures and panics are reported and counted, never
/// handed back to the caller.
///
/// The worker is started lazily. Before every enqueue the handle is checked:
/// a worker that has exited, was stopped, or was inherited from a parent
/// process is replaced with a fresh one, so callers never restart it
/// themselves.
pub struct Deferrable {
    shared: Arc<Shared>,
    worker: Mutex<Option<Worker>>,
}

impl Deferrable {
    pub fn new(config: DeferConfig, reporter: Arc<dyn Reporter>) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(State::default()),
                wake: Condvar::new(),
                config,
                reporter,
            }),
            worker: Mutex::new(None),
        }
    }

    /// Run `task` in the background.
    ///
    /// With `async_mode` off the task runs inline before this returns.
    /// Returns `false` if the queue was full and the task was dropped.
    pub fn later<F>(&self, task: F) -> bool
    where
        F: FnOnce() -> anyhow::Result<()> + Send + 'static,
    {
        self.enqueue(ANONYMOUS.to_string(), Box::new(task))
    }

    /// [`later`](Self::later) with a label used in logs and [`stats`](Self::stats).
    pub fn later_labeled<F>(&self, label: impl Into<String>, task: F) -> bool
    where
        F: FnOnce() -> anyhow::Result<()> + Send + 'static,
    {
        self.enqueue(label.into(), Box::new(task))
    }

    fn enqueue(&self, label: String, run: TaskFn) -> bool {
        if !self.shared.config.async_mode {
            self.shared.execute(Task { label, run });
            return true;
        }

        {
            let mut state = self.shared.lock();
            if state.queue.len() >= self.shared.config.max_queue {
                drop(state);
                self.shared.reporter.report(&ReportEvent::DeferQueueFull {
                    label,
                    capacity: self.shared.config.max_queue,
                });
                return false;
            }
            state.queue.push_back(Task { label, run });
        }
        self.ensure_worker();
        self.shared.wake.notify_all();
        true
    }

    /// Start a worker unless a live one belonging to this process exists.
    fn ensure_worker(&self) {
        let mut worker = self.worker_slot();
        let pid = std::process::id();
        let generation = {
            let mut state = self.shared.lock();
            let healthy = worker.as_ref().is_some_and(|w| {
                !w.handle.is_finished() && w.generation == state.generation && w.pid == pid
            });
            if healthy {
                return;
            }
            if worker.is_some() {
                // retire whatever is left of the old worker
                state.generation += 1;
                info!("deferred worker not running, starting a new one");
            }
            state.generation
        };

        let shared = Arc::clone(&self.shared);
        match thread::Builder::new()
            .name("tickwork-defer".to_string())
            .spawn(move || shared.work(generation))
        {
            Ok(handle) => {
                *worker = Some(Worker {
                    handle,
                    generation,
                    pid,
                })
            }
            Err(e) => {
                // Tasks stay queued; the next enqueue tries again.
                warn!("failed to start deferred worker: {e}");
                *worker = None;
            }
        }
    }

    /// Ask the worker to exit after its current task.
    ///
    /// Queued tasks are kept and picked up by the worker the next
    /// [`later`](Self::later) call starts.
    pub fn stop(&self) {
        let mut state = self.shared.lock();
        state.generation += 1;
        drop(state);
        self.shared.wake.notify_all();
        debug!("deferred worker stop requested");
    }

    /// Whether no worker is currently serving the queue.
    pub fn is_stopped(&self) -> bool {
        let generation = self.shared.lock().generation;
        !self
            .worker_slot()
            .as_ref()
            .is_some_and(|w| !w.handle.is_finished() && w.generation == generation)
    }

    /// Hold queued tasks until [`resume`](Self::resume).
    pub fn pause(&self) {
        self.shared.lock().paused = true;
    }

    pub fn resume(&self) {
        self.shared.lock().paused = false;
        self.shared.wake.notify_all();
    }

    pub fn is_paused(&self) -> bool {
        self.shared.lock().paused
    }

    /// Tasks waiting to run.
    pub fn len(&self) -> usize {
        self.shared.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Run every queued task on the calling thread, ignoring pause.
    /// Returns how many ran.
    pub fn do_all_work(&self) -> usize {
        let mut count = 0;
        loop {
            let next = self.shared.lock().queue.pop_front();
            let Some(task) = next else {
                return count;
            };
            self.shared.execute(task);
            count += 1;
        }
    }

    /// Per-label run counters.
    pub fn stats(&self) -> BTreeMap<String, TaskStats> {
        self.shared.lock().stats.clone()
    }

    fn worker_slot(&self) -> MutexGuard<'_, Option<Worker>> {
        self.worker
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Drop for Deferrable {
    fn drop(&mut self) {
        self.stop();
    }
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn work(&self, generation: u64) {
        debug!(generation, "deferred worker started");
        loop {
            let task = {
                let mut state = self.lock();
                loop {
                    if state.generation != generation {
                        debug!(generation, "deferred worker exiting");
                        return;
                    }
                    if !state.paused {
                        if let Some(task) = state.queue.pop_front() {
                            break task;
                        }
                    }
                    state = self
                        .wake
                        .wait(state)
                        .unwrap_or_else(|poisoned| poisoned.into_inner());
                }
            };
            self.execute(task);
        }
    }

    fn execute(&self, task: Task) {
        let Task { label, run } = task;
        let clock = Instant::now();
        let outcome = catch_unwind(AssertUnwindSafe(run));
        let elapsed = clock.elapsed();

        let error = match outcome {
            Ok(Ok(())) => None,
            Ok(Err(e)) => Some(format!("{e:#}")),
            Err(panic) => Some(panic_message(panic.as_ref())),
        };

        {
            let mut state = self.lock();
            let stats = state.stats.entry(label.clone()).or_default();
            stats.runs += 1;
            stats.total += elapsed;
            if error.is_some() {
                stats.failures += 1;
            }
        }

        if elapsed > self.config.slow_task_threshold() {
            self.reporter.report(&ReportEvent::SlowDeferredTask {
                label: label.clone(),
                elapsed,
            });
        }
        match error {
            Some(error) => self
                .reporter
                .report(&ReportEvent::DeferredTaskFailed { label, error }),
            None => debug!(%label, duration_ms = elapsed.as_millis() as u64, "deferred task done"),
        }
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        format!("panicked: {s}")
    } else if let Some(s) = panic.downcast_ref::<String>() {
        format!("panicked: {s}")
    } else {
        "panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::mpsc;
    use tickwork_core::CollectingReporter;

    const WAIT: Duration = Duration::from_secs(5);

    fn deferrable(async_mode: bool) -> (Deferrable, Arc<CollectingReporter>) {
        let reporter = Arc::new(CollectingReporter::new());
        let config = DeferConfig {
            async_mode,
            ..DeferConfig::default()
        };
        (Deferrable::new(config, reporter.clone()), reporter)
    }

    fn wait_until(cond: impl Fn() -> bool) {
        let deadline = Instant::now() + WAIT;
        while !cond() {
            assert!(Instant::now() < deadline, "condition not met in time");
            thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn later_runs_in_background() {
        let (defer, _) = deferrable(true);
        let (tx, rx) = mpsc::channel();
        let caller = thread::current().id();
        defer.later(move || {
            tx.send(thread::current().id()).unwrap();
            Ok(())
        });
        let ran_on = rx.recv_timeout(WAIT).unwrap();
        assert_ne!(ran_on, caller);
        assert!(!defer.is_stopped());
    }

    #[test]
    fn sync_mode_runs_inline() {
        let (defer, _) = deferrable(false);
        let ran = Arc::new(AtomicUsize::new(0));
        let r = ran.clone();
        defer.later(move || {
            r.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        assert_eq!(ran.load(Ordering::SeqCst), 1);
        // no worker needed
        assert!(defer.is_stopped());
    }

    #[test]
    fn tasks_run_in_fifo_order() {
        let (defer, _) = deferrable(true);
        let (tx, rx) = mpsc::channel();
        for i in 0..20 {
            let tx = tx.clone();
            defer.later(move || {
                tx.send(i).unwrap();
                Ok(())
            });
        }
        let order: Vec<i32> = (0..20).map(|_| rx.recv_timeout(WAIT).unwrap()).collect();
        assert_eq!(order, (0..20).collect::<Vec<_>>());
    }

    #[test]
    fn failures_and_panics_do_not_kill_worker() {
        let (defer, reporter) = deferrable(true);
        defer.later_labeled("broken", || anyhow::bail!("nope"));
        defer.later_labeled("explodes", || panic!("boom"));
        let (tx, rx) = mpsc::channel();
        defer.later(move || {
            tx.send(()).unwrap();
            Ok(())
        });
        rx.recv_timeout(WAIT).unwrap();

        wait_until(|| reporter.count("deferred_task_failed") == 2);
        wait_until(|| defer.stats().get(ANONYMOUS).is_some_and(|s| s.runs == 1));
        let stats = defer.stats();
        assert_eq!(stats["broken"].failures, 1);
        assert_eq!(stats["explodes"].failures, 1);
        assert!(!defer.is_stopped());
    }

    #[test]
    fn stopped_worker_is_restarted_by_later() {
        let (defer, _) = deferrable(true);
        let (tx, rx) = mpsc::channel();
        let first = tx.clone();
        defer.later(move || {
            first.send(1).unwrap();
            Ok(())
        });
        assert_eq!(rx.recv_timeout(WAIT).unwrap(), 1);

        defer.stop();
        assert!(defer.is_stopped());

        defer.later(move || {
            tx.send(2).unwrap();
            Ok(())
        });
        assert_eq!(rx.recv_timeout(WAIT).unwrap(), 2);
        assert!(!defer.is_stopped());
    }

    #[test]
    fn worker_inherited_from_parent_process_is_replaced() {
        let (defer, _) = deferrable(true);
        let (tx, rx) = mpsc::channel();
        let first = tx.clone();
        defer.later(move || {
            first.send(thread::current().id()).unwrap();
            Ok(())
        });
        let parent_worker = rx.recv_timeout(WAIT).unwrap();

        // as seen from a forked child: the handle belongs to another pid
        if let Some(worker) = defer.worker_slot().as_mut() {
            worker.pid = worker.pid.wrapping_add(1);
        }

        defer.later(move || {
            tx.send(thread::current().id()).unwrap();
            Ok(())
        });
        let child_worker = rx.recv_timeout(WAIT).unwrap();
        assert_ne!(child_worker, parent_worker);
        assert!(!defer.is_stopped());
        assert_eq!(defer.worker_slot().as_ref().map(|w| w.pid), Some(std::process::id()));
    }

    #[test]
    fn pause_holds_tasks_until_resume() {
        let (defer, _) = deferrable(true);
        let ran = Arc::new(AtomicUsize::new(0));
        defer.pause();
        for _ in 0..3 {
            let r = ran.clone();
            defer.later(move || {
                r.fetch_add(1, Ordering::SeqCst);
                Ok(())
            });
        }
        thread::sleep(Duration::from_millis(50));
        assert_eq!(ran.load(Ordering::SeqCst), 0);
        assert_eq!(defer.len(), 3);

        defer.resume();
        wait_until(|| ran.load(Ordering::SeqCst) == 3);
        assert!(defer.is_empty());
    }

    #[test]
    fn do_all_work_drains_on_caller() {
        let (defer, _) = deferrable(true);
        defer.pause();
        let (tx, rx) = mpsc::channel();
        for _ in 0..4 {
            let tx = tx.clone();
            defer.later(move || {
                tx.send(thread::current().id()).unwrap();
                Ok(())
            });
        }
        assert_eq!(defer.do_all_work(), 4);
        let me = thread::current().id();
        assert!(rx.try_iter().all(|id| id == me));
        assert_eq!(defer.do_all_work(), 0);
    }

    #[test]
    fn full_queue_drops_and_reports() {
        let reporter = Arc::new(CollectingReporter::new());
        let config = DeferConfig {
            async_mode: true,
            max_queue: 2,
            ..DeferConfig::default()
        };
        let defer = Deferrable::new(config, reporter.clone());
        defer.pause();
        assert!(defer.later(|| Ok(())));
        assert!(defer.later(|| Ok(())));
        assert!(!defer.later_labeled("overflow", || Ok(())));
        assert_eq!(defer.len(), 2);
        assert_eq!(reporter.count("defer_queue_full"), 1);
    }

    #[test]
    fn slow_task_is_reported() {
        let reporter = Arc::new(CollectingReporter::new());
        let config = DeferConfig {
            async_mode: false,
            slow_task_secs: 0,
            ..DeferConfig::default()
        };
        let defer = Deferrable::new(config, reporter.clone());
        defer.later_labeled("sleepy", || {
            thread::sleep(Duration::from_millis(5));
            Ok(())
        });
        assert_eq!(reporter.count("slow_deferred_task"), 1);
        assert_eq!(reporter.count("deferred_task_failed"), 0);
    }
}
