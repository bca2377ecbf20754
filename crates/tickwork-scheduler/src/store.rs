//! The shared coordination store.
//!
//! Every process in the fleet talks to the same store. It holds two kinds of
//! data: one [`ScheduleInfo`] record per job, and short-lived string keys with
//! an expiry (claims and manager keep-alives). Mutual exclusion rests entirely
//! on [`CoordinationStore::set_if_absent`] being atomic.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use crate::error::{Result, SchedulerError};
use crate::types::ScheduleInfo;

pub trait CoordinationStore: Send + Sync {
    fn load_info(&self, key: &str) -> Result<Option<ScheduleInfo>>;

    fn save_info(&self, key: &str, info: &ScheduleInfo) -> Result<()>;

    /// Returns `false` if there was nothing to delete.
    fn delete_info(&self, key: &str) -> Result<bool>;

    /// Keys of every stored schedule record.
    fn info_keys(&self) -> Result<Vec<String>>;

    /// Create `key` with `value` unless a live (unexpired) entry exists.
    ///
    /// Exactly one of any number of concurrent callers gets `true`.
    fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<bool>;

    /// Create or overwrite `key`, expiring after `ttl`.
    fn set_with_expiry(&self, key: &str, value: &str, ttl: Duration) -> Result<()>;

    /// Whether a live entry exists for `key`.
    fn exists(&self, key: &str) -> Result<bool>;

    /// Delete `key` only if it still holds `value`.
    fn release(&self, key: &str, value: &str) -> Result<bool>;

    /// Drop expired keys. Returns how many were removed.
    fn purge_expired(&self) -> Result<usize>;
}

struct Entry {
    value: String,
    expires_at: Instant,
}

#[derive(Default)]
struct MemoryState {
    infos: HashMap<String, ScheduleInfo>,
    keys: HashMap<String, Entry>,
}

/// Process-local store. Suitable for tests and single-process deployments;
/// managers sharing one `Arc<MemoryStore>` coordinate exactly like a fleet.
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, MemoryState>> {
        self.state
            .lock()
            .map_err(|_| SchedulerError::StoreUnavailable("memory store mutex poisoned".to_string()))
    }
}

impl CoordinationStore for MemoryStore {
    fn load_info(&self, key: &str) -> Result<Option<ScheduleInfo>> {
        Ok(self.lock()?.infos.get(key).cloned())
    }

    fn save_info(&self, key: &str, info: &ScheduleInfo) -> Result<()> {
        self.lock()?.infos.insert(key.to_string(), info.clone());
        Ok(())
    }

    fn delete_info(&self, key: &str) -> Result<bool> {
        Ok(self.lock()?.infos.remove(key).is_some())
    }

    fn info_keys(&self) -> Result<Vec<String>> {
        let mut keys: Vec<String> = self.lock()?.infos.keys().cloned().collect();
        keys.sort();
        Ok(keys)
    }

    fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<bool> {
        let mut state = self.lock()?;
        let now = Instant::now();
        if state.keys.get(key).is_some_and(|e| e.expires_at > now) {
            return Ok(false);
        }
        state.keys.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: now + ttl,
            },
        );
        Ok(true)
    }

    fn set_with_expiry(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        self.lock()?.keys.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: Instant::now() + ttl,
            },
        );
        Ok(())
    }

    fn exists(&self, key: &str) -> Result<bool> {
        let now = Instant::now();
        Ok(self
            .lock()?
            .keys
            .get(key)
            .is_some_and(|e| e.expires_at > now))
    }

    fn release(&self, key: &str, value: &str) -> Result<bool> {
        let mut state = self.lock()?;
        if state.keys.get(key).is_some_and(|e| e.value == value) {
            state.keys.remove(key);
            return Ok(true);
        }
        Ok(false)
    }

    fn purge_expired(&self) -> Result<usize> {
        let mut state = self.lock()?;
        let now = Instant::now();
        let before = state.keys.len();
        state.keys.retain(|_, e| e.expires_at > now);
        Ok(before - state.keys.len())
    }
}
