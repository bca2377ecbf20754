use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use chrono::Utc;
use rusqlite::{Connection, OptionalExtension, TransactionBehavior};
use tracing::{debug, warn};

use crate::db::init_db;
use crate::error::{Result, SchedulerError};
use crate::store::CoordinationStore;
use crate::types::ScheduleInfo;

/// How long a writer waits on a locked database before giving up.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Coordination store backed by a SQLite file shared by every process on
/// the host.
///
/// Each process opens its own connection. Claims run inside a
/// `BEGIN IMMEDIATE` transaction, so SQLite's write lock makes
/// check-and-insert a single atomic step across processes.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

fn expiry_millis(ttl: Duration) -> i64 {
    let ttl = i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX);
    now_millis().saturating_add(ttl)
}

impl SqliteStore {
    /// Open (or create) the store at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        Self::new(conn)
    }

    /// Wrap an already-open connection, initialising the schema if needed.
    pub fn new(conn: Connection) -> Result<Self> {
        conn.busy_timeout(BUSY_TIMEOUT)?;
        init_db(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| SchedulerError::StoreUnavailable("sqlite connection mutex poisoned".to_string()))
    }
}

impl CoordinationStore for SqliteStore {
    fn load_info(&self, key: &str) -> Result<Option<ScheduleInfo>> {
        let conn = self.lock()?;
        let raw: Option<String> = conn
            .query_row(
                "SELECT info FROM schedule_info WHERE key = ?1",
                [key],
                |row| row.get(0),
            )
            .optional()?;

        let Some(raw) = raw else {
            return Ok(None);
        };
        match serde_json::from_str(&raw) {
            Ok(info) => Ok(Some(info)),
            Err(e) => {
                // Treated as absent so the manager derives a fresh schedule.
                warn!(%key, "unreadable schedule record: {e}");
                Ok(None)
            }
        }
    }

    fn save_info(&self, key: &str, info: &ScheduleInfo) -> Result<()> {
        let json = serde_json::to_string(info)?;
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO schedule_info (key, info, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(key) DO UPDATE SET info = excluded.info, updated_at = excluded.updated_at",
            rusqlite::params![key, json, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    fn delete_info(&self, key: &str) -> Result<bool> {
        let conn = self.lock()?;
        let n = conn.execute("DELETE FROM schedule_info WHERE key = ?1", [key])?;
        Ok(n > 0)
    }

    fn info_keys(&self) -> Result<Vec<String>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare("SELECT key FROM schedule_info ORDER BY key")?;
        let keys = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(keys)
    }

    fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<bool> {
        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        tx.execute(
            "DELETE FROM coordination_keys WHERE key = ?1 AND expires_at <= ?2",
            rusqlite::params![key, now_millis()],
        )?;
        let inserted = tx.execute(
            "INSERT OR IGNORE INTO coordination_keys (key, value, expires_at) VALUES (?1, ?2, ?3)",
            rusqlite::params![key, value, expiry_millis(ttl)],
        )?;
        tx.commit()?;
        debug!(%key, acquired = inserted == 1, "set_if_absent");
        Ok(inserted == 1)
    }

    fn set_with_expiry(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO coordination_keys (key, value, expires_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, expires_at = excluded.expires_at",
            rusqlite::params![key, value, expiry_millis(ttl)],
        )?;
        Ok(())
    }

    fn exists(&self, key: &str) -> Result<bool> {
        let conn = self.lock()?;
        let found: Option<i64> = conn
            .query_row(
                "SELECT 1 FROM coordination_keys WHERE key = ?1 AND expires_at > ?2",
                rusqlite::params![key, now_millis()],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    fn release(&self, key: &str, value: &str) -> Result<bool> {
        let conn = self.lock()?;
        let n = conn.execute(
            "DELETE FROM coordination_keys WHERE key = ?1 AND value = ?2",
            rusqlite::params![key, value],
        )?;
        Ok(n > 0)
    }

    fn purge_expired(&self) -> Result<usize> {
        let conn = self.lock()?;
        let n = conn.execute(
            "DELETE FROM coordination_keys WHERE expires_at <= ?1",
            [now_millis()],
        )?;
        Ok(n)
    }
}
