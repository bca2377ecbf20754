use std::time::Duration;

use chrono::{DateTime, TimeDelta, Timelike, Utc};
use rand::Rng;

use crate::types::{Cadence, ScheduleInfo};

fn one_day() -> TimeDelta {
    TimeDelta::days(1)
}

/// `from + d`, saturating instead of overflowing.
fn add(from: DateTime<Utc>, d: Duration) -> DateTime<Utc> {
    TimeDelta::from_std(d)
        .ok()
        .and_then(|delta| from.checked_add_signed(delta))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

fn scaled(d: Duration, factor: f64) -> Duration {
    Duration::try_from_secs_f64((d.as_secs_f64() * factor).max(0.0)).unwrap_or(Duration::MAX)
}

/// Next instant strictly after `now` whose UTC time of day equals `at`.
pub fn next_daily_run(at: Duration, now: DateTime<Utc>) -> DateTime<Utc> {
    let midnight = now
        - TimeDelta::seconds(now.num_seconds_from_midnight() as i64)
        - TimeDelta::nanoseconds(now.nanosecond() as i64);
    let candidate = add(midnight, at);
    if candidate > now {
        candidate
    } else {
        // today's slot has passed
        candidate + one_day()
    }
}

impl ScheduleInfo {
    /// Whether `next_run` can be trusted.
    ///
    /// A missing `next_run`, or one further out than the cadence could ever
    /// produce (clock jump, manual tampering, leftover test data), is invalid.
    pub fn is_valid(&self, cadence: &Cadence, now: DateTime<Utc>) -> bool {
        let Some(next_run) = self.next_run else {
            return false;
        };
        match cadence {
            Cadence::Every(interval) => next_run <= add(now, interval.saturating_mul(2)),
            Cadence::Daily { .. } => next_run <= now + one_day(),
        }
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.next_run.is_some_and(|next_run| next_run <= now)
    }
}

/// Computes `next_run` values, applying jitter so a fleet sharing one
/// schedule does not hit the store at the same instant.
#[derive(Debug, Clone, Copy)]
pub struct Planner {
    random_ratio: f64,
    first_run_window: Duration,
}

impl Planner {
    pub fn new(random_ratio: f64, first_run_window: Duration) -> Self {
        Self {
            random_ratio: random_ratio.clamp(0.0, 0.99),
            first_run_window,
        }
    }

    pub fn random_ratio(&self) -> f64 {
        self.random_ratio
    }

    /// Schedule for a job that has never run: somewhere within the next
    /// interval, capped by the first-run window.
    pub fn first_run<R: Rng + ?Sized>(
        &self,
        cadence: &Cadence,
        now: DateTime<Utc>,
        rng: &mut R,
    ) -> DateTime<Utc> {
        match cadence {
            Cadence::Every(interval) => {
                let window = (*interval).min(self.first_run_window);
                add(now, scaled(window, rng.random::<f64>()))
            }
            Cadence::Daily { at } => next_daily_run(*at, now),
        }
    }

    /// Schedule after a run that finished at `finished_at`.
    ///
    /// EVERY jobs land at `finished_at + interval × (1 + jitter)` with jitter
    /// uniform in `[-ratio/2, ratio/2]`; the previous `next_run` plays no part.
    pub fn next_run_after<R: Rng + ?Sized>(
        &self,
        cadence: &Cadence,
        finished_at: DateTime<Utc>,
        rng: &mut R,
    ) -> DateTime<Utc> {
        match cadence {
            Cadence::Every(interval) => {
                let jitter = self.random_ratio * (rng.random::<f64>() - 0.5);
                add(finished_at, scaled(*interval, 1.0 + jitter))
            }
            Cadence::Daily { at } => next_daily_run(*at, finished_at),
        }
    }

    /// Make sure `info` carries a valid `next_run`, deriving one if not.
    ///
    /// Returns `true` when `info` was changed and needs persisting.
    pub fn ensure<R: Rng + ?Sized>(
        &self,
        info: &mut ScheduleInfo,
        cadence: &Cadence,
        now: DateTime<Utc>,
        rng: &mut R,
    ) -> bool {
        if info.is_valid(cadence, now) {
            return false;
        }

        if let (Cadence::Every(_), Some(prev_run)) = (cadence, info.prev_run) {
            info.next_run = Some(self.next_run_after(cadence, prev_run, rng));
            if info.is_valid(cadence, now) {
                return true;
            }
        }

        info.next_run = Some(self.first_run(cadence, now, rng));
        true
    }
}
