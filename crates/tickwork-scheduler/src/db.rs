use rusqlite::Connection;

use crate::error::Result;

/// Initialise the coordination schema in `conn`.
///
/// Creates the `schedule_info` and `coordination_keys` tables (idempotent)
/// plus an index on `expires_at` so purging expired keys stays cheap.
pub fn init_db(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS schedule_info (
            key         TEXT    NOT NULL PRIMARY KEY,
            info        TEXT    NOT NULL,   -- JSON-encoded ScheduleInfo
            updated_at  TEXT    NOT NULL
        ) STRICT;

        CREATE TABLE IF NOT EXISTS coordination_keys (
            key         TEXT    NOT NULL PRIMARY KEY,
            value       TEXT    NOT NULL,
            expires_at  INTEGER NOT NULL    -- unix epoch milliseconds
        ) STRICT;

        CREATE INDEX IF NOT EXISTS idx_coordination_keys_expires_at
            ON coordination_keys (expires_at);
        ",
    )?;
    Ok(())
}
