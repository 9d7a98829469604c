//! File repository: rows of the `files` and `file_transitions` tables.
//!
//! Functions take a `&Connection` rather than a `&Database` so the state
//! manager can compose them inside a single transaction.

use rusqlite::{params, Connection, OptionalExtension, Row};

use super::DatabaseError;

/// A raw file row from the database.
#[derive(Debug, Clone, PartialEq)]
pub struct FileRow {
    pub path: String,
    pub filename: String,
    pub size_bytes: i64,
    pub mime_type: Option<String>,
    pub content_fingerprint: Option<String>,
    pub lifecycle_state: String,
    pub remote_file_id: Option<String>,
    pub remote_uri: Option<String>,
    pub remote_doc_id: Option<String>,
    pub remote_expiration_ts: Option<i64>,
    pub last_error: Option<String>,
    pub upload_attempts: u32,
    pub permanent_failures: u32,
    pub version: i64,
    pub created_at: String,
    pub updated_at: String,
}

impl FileRow {
    fn from_row(row: &Row<'_>) -> Result<Self, rusqlite::Error> {
        Ok(Self {
            path: row.get("path")?,
            filename: row.get("filename")?,
            size_bytes: row.get("size_bytes")?,
            mime_type: row.get("mime_type")?,
            content_fingerprint: row.get("content_fingerprint")?,
            lifecycle_state: row.get("lifecycle_state")?,
            remote_file_id: row.get("remote_file_id")?,
            remote_uri: row.get("remote_uri")?,
            remote_doc_id: row.get("remote_doc_id")?,
            remote_expiration_ts: row.get("remote_expiration_ts")?,
            last_error: row.get("last_error")?,
            upload_attempts: row.get("upload_attempts")?,
            permanent_failures: row.get("permanent_failures")?,
            version: row.get("version")?,
            created_at: row.get("created_at")?,
            updated_at: row.get("updated_at")?,
        })
    }

    /// Clears every identifier that points at a remote resource.
    pub fn clear_remote(&mut self) {
        self.remote_file_id = None;
        self.remote_uri = None;
        self.remote_doc_id = None;
        self.remote_expiration_ts = None;
    }
}

/// A single recorded lifecycle edge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransitionRow {
    pub file_path: String,
    pub from_state: String,
    pub to_state: String,
    pub event: String,
    pub at: String,
}

/// Inserts a new file row.
pub fn insert(conn: &Connection, file: &FileRow) -> Result<(), DatabaseError> {
    conn.execute(
        "INSERT INTO files (path, filename, size_bytes, mime_type, content_fingerprint,
         lifecycle_state, remote_file_id, remote_uri, remote_doc_id, remote_expiration_ts,
         last_error, upload_attempts, permanent_failures, version, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)",
        params![
            file.path,
            file.filename,
            file.size_bytes,
            file.mime_type,
            file.content_fingerprint,
            file.lifecycle_state,
            file.remote_file_id,
            file.remote_uri,
            file.remote_doc_id,
            file.remote_expiration_ts,
            file.last_error,
            file.upload_attempts,
            file.permanent_failures,
            file.version,
            file.created_at,
            file.updated_at,
        ],
    )?;
    Ok(())
}

/// Overwrites every mutable column of `file` if the stored version still
/// equals `expected_version`, bumping the version by one.
///
/// Returns `false` when another writer got there first.
pub fn update_checked(
    conn: &Connection,
    file: &FileRow,
    expected_version: i64,
) -> Result<bool, DatabaseError> {
    let changed = conn.execute(
        "UPDATE files SET filename=?2, size_bytes=?3, mime_type=?4, content_fingerprint=?5,
         lifecycle_state=?6, remote_file_id=?7, remote_uri=?8, remote_doc_id=?9,
         remote_expiration_ts=?10, last_error=?11, upload_attempts=?12,
         permanent_failures=?13, updated_at=?14, version = version + 1
         WHERE path=?1 AND version=?15",
        params![
            file.path,
            file.filename,
            file.size_bytes,
            file.mime_type,
            file.content_fingerprint,
            file.lifecycle_state,
            file.remote_file_id,
            file.remote_uri,
            file.remote_doc_id,
            file.remote_expiration_ts,
            file.last_error,
            file.upload_attempts,
            file.permanent_failures,
            file.updated_at,
            expected_version,
        ],
    )?;
    Ok(changed == 1)
}

/// Finds a file by its path.
pub fn find_by_path(conn: &Connection, path: &str) -> Result<Option<FileRow>, DatabaseError> {
    let row = conn
        .query_row(
            "SELECT * FROM files WHERE path = ?1",
            params![path],
            FileRow::from_row,
        )
        .optional()?;
    Ok(row)
}

/// Returns every file currently in `state`, oldest first.
pub fn find_by_state(conn: &Connection, state: &str) -> Result<Vec<FileRow>, DatabaseError> {
    let mut stmt = conn.prepare(
        "SELECT * FROM files WHERE lifecycle_state = ?1 ORDER BY created_at, path",
    )?;
    let rows = stmt
        .query_map(params![state], FileRow::from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Returns up to `limit` files eligible for upload: never attempted or
/// failed, and below the permanent-failure quarantine threshold.
pub fn find_pending(
    conn: &Connection,
    limit: u64,
    quarantine_after: u32,
) -> Result<Vec<FileRow>, DatabaseError> {
    let mut stmt = conn.prepare(
        "SELECT * FROM files
         WHERE lifecycle_state IN ('untracked', 'failed') AND permanent_failures < ?1
         ORDER BY created_at, path
         LIMIT ?2",
    )?;
    let rows = stmt
        .query_map(params![quarantine_after, limit as i64], FileRow::from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Returns files that still hold a time-limited remote upload handle.
pub fn find_with_expiration(conn: &Connection) -> Result<Vec<FileRow>, DatabaseError> {
    let mut stmt = conn.prepare(
        "SELECT * FROM files
         WHERE remote_file_id IS NOT NULL
           AND remote_expiration_ts IS NOT NULL
           AND lifecycle_state IN ('uploading', 'processing')
         ORDER BY remote_expiration_ts",
    )?;
    let rows = stmt
        .query_map([], FileRow::from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Counts files per lifecycle state.
pub fn count_by_state(conn: &Connection) -> Result<Vec<(String, u64)>, DatabaseError> {
    let mut stmt = conn.prepare(
        "SELECT lifecycle_state, COUNT(*) FROM files GROUP BY lifecycle_state ORDER BY 1",
    )?;
    let rows = stmt
        .query_map([], |r| Ok((r.get::<_, String>(0)?, r.get::<_, u64>(1)?)))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Counts files excluded from uploads after repeated permanent failures.
pub fn count_quarantined(conn: &Connection, quarantine_after: u32) -> Result<u64, DatabaseError> {
    let count = conn.query_row(
        "SELECT COUNT(*) FROM files
         WHERE lifecycle_state = 'failed' AND permanent_failures >= ?1",
        params![quarantine_after],
        |r| r.get(0),
    )?;
    Ok(count)
}

/// Appends one lifecycle edge to the audit table.
pub fn insert_transition(conn: &Connection, row: &TransitionRow) -> Result<(), DatabaseError> {
    conn.execute(
        "INSERT INTO file_transitions (file_path, from_state, to_state, event, at)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![row.file_path, row.from_state, row.to_state, row.event, row.at],
    )?;
    Ok(())
}

/// Returns the lifecycle edges recorded for a file, in the order applied.
pub fn find_transitions(
    conn: &Connection,
    path: &str,
) -> Result<Vec<TransitionRow>, DatabaseError> {
    let mut stmt = conn.prepare(
        "SELECT file_path, from_state, to_state, event, at FROM file_transitions
         WHERE file_path = ?1 ORDER BY id",
    )?;
    let rows = stmt
        .query_map(params![path], |r| {
            Ok(TransitionRow {
                file_path: r.get(0)?,
                from_state: r.get(1)?,
                to_state: r.get(2)?,
                event: r.get(3)?,
                at: r.get(4)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}
