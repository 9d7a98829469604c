//! Batch repository: bookkeeping rows for the `batches` table.

use rusqlite::params;

use super::{Database, DatabaseError};

/// A raw batch row from the database.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchRow {
    pub id: i64,
    pub run_id: String,
    pub number: u32,
    pub size: u32,
    pub succeeded: u32,
    pub failed: u32,
    pub status: String,
    pub started_at: String,
    pub completed_at: Option<String>,
}

/// Inserts a running batch and returns its id.
pub fn insert_started(
    db: &Database,
    run_id: &str,
    number: u32,
    size: u32,
    started_at: &str,
) -> Result<i64, DatabaseError> {
    db.with_conn(|conn| {
        conn.execute(
            "INSERT INTO batches (run_id, number, size, status, started_at)
             VALUES (?1, ?2, ?3, 'running', ?4)",
            params![run_id, number, size, started_at],
        )?;
        Ok(conn.last_insert_rowid())
    })
}

/// Records the final counts and status of a batch.
pub fn finish(
    db: &Database,
    id: i64,
    succeeded: u32,
    failed: u32,
    status: &str,
    completed_at: &str,
) -> Result<(), DatabaseError> {
    db.with_conn(|conn| {
        conn.execute(
            "UPDATE batches SET succeeded = ?2, failed = ?3, status = ?4, completed_at = ?5
             WHERE id = ?1",
            params![id, succeeded, failed, status, completed_at],
        )?;
        Ok(())
    })
}

/// Lists the batches of one run in order.
pub fn find_by_run(db: &Database, run_id: &str) -> Result<Vec<BatchRow>, DatabaseError> {
    db.with_conn(|conn| {
        let mut stmt = conn.prepare(
            "SELECT id, run_id, number, size, succeeded, failed, status, started_at, completed_at
             FROM batches WHERE run_id = ?1 ORDER BY number",
        )?;
        let rows = stmt
            .query_map(params![run_id], |r| {
                Ok(BatchRow {
                    id: r.get(0)?,
                    run_id: r.get(1)?,
                    number: r.get(2)?,
                    size: r.get(3)?,
                    succeeded: r.get(4)?,
                    failed: r.get(5)?,
                    status: r.get(6)?,
                    started_at: r.get(7)?,
                    completed_at: r.get(8)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    })
}
