//! `tickwork-scheduler`: recurring jobs coordinated across a fleet.
//!
//! # Overview
//!
//! Every process registers the same [`ScheduledJob`]s and runs a [`Manager`].
//! Managers share one [`CoordinationStore`] holding a [`ScheduleInfo`] record
//! per job. On each tick a manager loads the record, repairs it if its
//! `next_run` cannot be trusted, and, when the job is due, races the other
//! managers for the job's claim key. The winner runs the job and writes the
//! outcome plus a jittered `next_run` back to the store.
//!
//! # Cadences
//!
//! | Cadence  | Next run                                              |
//! |----------|-------------------------------------------------------|
//! | `Every`  | Finish time + interval, jittered by `random_ratio`    |
//! | `Daily`  | Next UTC occurrence of the time of day, no jitter     |
//!
//! # Stores
//!
//! [`MemoryStore`] serves tests and single-process setups. [`SqliteStore`]
//! shares a SQLite file between every process on a host.

pub mod db;
pub mod error;
pub mod manager;
pub mod registry;
pub mod schedule;
pub mod sqlite;
pub mod store;
pub mod types;

pub use error::{Result, SchedulerError};
pub use manager::{JobSnapshot, Manager, ReconcileSummary, TickSummary};
pub use registry::{JobRegistry, ScheduledJob};
pub use schedule::{next_daily_run, Planner};
pub use sqlite::SqliteStore;
pub use store::{CoordinationStore, MemoryStore};
pub use types::{Cadence, CadenceKind, RunResult, ScheduleInfo, ScheduleSpec};
