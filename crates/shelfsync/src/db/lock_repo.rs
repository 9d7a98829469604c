//! Lock repository: the single-row `locks` table.

use rusqlite::{params, OptionalExtension};

use super::{Database, DatabaseError};

/// The current holder of the writer lock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockRow {
    pub instance_id: String,
    pub acquired_at: String,
    /// Unix seconds of the holder's last heartbeat.
    pub heartbeat_at: i64,
}

/// Claims the lock row for `instance_id` in one statement.
///
/// Succeeds if the row is free, or if the current holder's heartbeat is
/// older than `stale_before` (a lease left behind by a crashed process).
/// Returns `false` while a live holder exists.
pub fn try_acquire(
    db: &Database,
    instance_id: &str,
    acquired_at: &str,
    now_ts: i64,
    stale_before: i64,
) -> Result<bool, DatabaseError> {
    db.with_conn(|conn| {
        let changed = conn.execute(
            "INSERT INTO locks (lock_id, instance_id, acquired_at, heartbeat_at)
             VALUES (1, ?1, ?2, ?3)
             ON CONFLICT(lock_id) DO UPDATE SET
                instance_id = excluded.instance_id,
                acquired_at = excluded.acquired_at,
                heartbeat_at = excluded.heartbeat_at
             WHERE locks.heartbeat_at < ?4",
            params![instance_id, acquired_at, now_ts, stale_before],
        )?;
        Ok(changed == 1)
    })
}

/// Refreshes the lease of the current holder. Returns `false` if
/// `instance_id` no longer holds the lock.
pub fn heartbeat(db: &Database, instance_id: &str, now_ts: i64) -> Result<bool, DatabaseError> {
    db.with_conn(|conn| {
        let changed = conn.execute(
            "UPDATE locks SET heartbeat_at = ?2 WHERE lock_id = 1 AND instance_id = ?1",
            params![instance_id, now_ts],
        )?;
        Ok(changed == 1)
    })
}

/// Releases the lock if `instance_id` holds it.
pub fn release(db: &Database, instance_id: &str) -> Result<bool, DatabaseError> {
    db.with_conn(|conn| {
        let changed = conn.execute(
            "DELETE FROM locks WHERE lock_id = 1 AND instance_id = ?1",
            params![instance_id],
        )?;
        Ok(changed == 1)
    })
}

/// Returns the current holder, if any.
pub fn current(db: &Database) -> Result<Option<LockRow>, DatabaseError> {
    db.with_conn(|conn| {
        let row = conn
            .query_row(
                "SELECT instance_id, acquired_at, heartbeat_at FROM locks WHERE lock_id = 1",
                [],
                |r| {
                    Ok(LockRow {
                        instance_id: r.get(0)?,
                        acquired_at: r.get(1)?,
                        heartbeat_at: r.get(2)?,
                    })
                },
            )
            .optional()?;
        Ok(row)
    })
}
