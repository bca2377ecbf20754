//! `tickwork-defer`: run work off the caller's path.
//!
//! A [`Deferrable`] owns one background thread draining a FIFO queue of
//! closures. Tasks have no identity and no retry; if the process exits with
//! tasks queued they are lost.

pub mod deferrable;

pub use deferrable::{Deferrable, TaskStats};
