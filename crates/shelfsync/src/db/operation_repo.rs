//! Operation repository: CRUD for the `operations` table.

use rusqlite::{params, Connection, OptionalExtension, Row};

use super::DatabaseError;

/// A raw operation row from the database.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperationRow {
    pub name: String,
    pub file_path: String,
    pub state: String,
    pub error: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

impl OperationRow {
    fn from_row(row: &Row<'_>) -> Result<Self, rusqlite::Error> {
        Ok(Self {
            name: row.get("name")?,
            file_path: row.get("file_path")?,
            state: row.get("state")?,
            error: row.get("error")?,
            created_at: row.get("created_at")?,
            updated_at: row.get("updated_at")?,
        })
    }
}

/// Inserts an operation, replacing any row with the same name.
///
/// Remote operation names are unique per submission, so a replace only
/// happens when the same submission is recorded twice.
pub fn upsert(conn: &Connection, op: &OperationRow) -> Result<(), DatabaseError> {
    conn.execute(
        "INSERT INTO operations (name, file_path, state, error, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)
         ON CONFLICT(name) DO UPDATE SET
            file_path = excluded.file_path,
            state = excluded.state,
            error = excluded.error,
            updated_at = excluded.updated_at",
        params![
            op.name,
            op.file_path,
            op.state,
            op.error,
            op.created_at,
            op.updated_at,
        ],
    )?;
    Ok(())
}

/// Updates the state and error of an operation. Returns `false` if no
/// operation with that name exists.
pub fn update_state(
    conn: &Connection,
    name: &str,
    state: &str,
    error: Option<&str>,
    updated_at: &str,
) -> Result<bool, DatabaseError> {
    let changed = conn.execute(
        "UPDATE operations SET state = ?2, error = ?3, updated_at = ?4 WHERE name = ?1",
        params![name, state, error, updated_at],
    )?;
    Ok(changed == 1)
}

/// Finds an operation by name.
pub fn find_by_name(conn: &Connection, name: &str) -> Result<Option<OperationRow>, DatabaseError> {
    let row = conn
        .query_row(
            "SELECT * FROM operations WHERE name = ?1",
            params![name],
            OperationRow::from_row,
        )
        .optional()?;
    Ok(row)
}

/// Returns operations that have not reached a final outcome: still
/// pending, or abandoned by a poll that timed out.
pub fn find_unresolved(conn: &Connection) -> Result<Vec<OperationRow>, DatabaseError> {
    let mut stmt = conn.prepare(
        "SELECT * FROM operations WHERE state IN ('pending', 'timeout') ORDER BY created_at, name",
    )?;
    let rows = stmt
        .query_map([], OperationRow::from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Whether a file has any unresolved operation.
pub fn has_unresolved_for_file(conn: &Connection, file_path: &str) -> Result<bool, DatabaseError> {
    let count: u64 = conn.query_row(
        "SELECT COUNT(*) FROM operations
         WHERE file_path = ?1 AND state IN ('pending', 'timeout')",
        params![file_path],
        |r| r.get(0),
    )?;
    Ok(count > 0)
}

/// Marks every unresolved operation of a file with `state`.
pub fn resolve_all_for_file(
    conn: &Connection,
    file_path: &str,
    state: &str,
    error: Option<&str>,
    updated_at: &str,
) -> Result<usize, DatabaseError> {
    let changed = conn.execute(
        "UPDATE operations SET state = ?2, error = ?3, updated_at = ?4
         WHERE file_path = ?1 AND state IN ('pending', 'timeout')",
        params![file_path, state, error, updated_at],
    )?;
    Ok(changed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;

    fn test_db() -> Database {
        let db = Database::open_in_memory().expect("Failed to create test database");
        db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO files (path, filename, created_at, updated_at)
                 VALUES ('/docs/a.pdf', 'a.pdf', '2026-01-01', '2026-01-01')",
                [],
            )?;
            Ok::<_, DatabaseError>(())
        })
        .unwrap();
        db
    }

    fn sample_op(name: &str, state: &str) -> OperationRow {
        OperationRow {
            name: name.to_string(),
            file_path: "/docs/a.pdf".to_string(),
            state: state.to_string(),
            error: None,
            created_at: "2026-01-01T00:00:00Z".to_string(),
            updated_at: "2026-01-01T00:00:00Z".to_string(),
        }
    }

    #[test]
    fn test_upsert_and_find() {
        let db = test_db();
        db.with_conn(|conn| {
            upsert(conn, &sample_op("operations/1", "pending"))?;
            upsert(conn, &sample_op("operations/1", "done_success"))?;
            let found = find_by_name(conn, "operations/1")?.unwrap();
            assert_eq!(found.state, "done_success");
            Ok::<_, DatabaseError>(())
        })
        .unwrap();
    }

    #[test]
    fn test_operation_requires_known_file() {
        let db = test_db();
        let result = db.with_conn(|conn| {
            let mut op = sample_op("operations/orphan", "pending");
            op.file_path = "/docs/unknown.pdf".to_string();
            upsert(conn, &op)
        });
        assert!(result.is_err());
    }

    #[test]
    fn test_find_unresolved_includes_timeouts() {
        let db = test_db();
        db.with_conn(|conn| {
            upsert(conn, &sample_op("operations/1", "pending"))?;
            upsert(conn, &sample_op("operations/2", "timeout"))?;
            upsert(conn, &sample_op("operations/3", "done_success"))?;
            upsert(conn, &sample_op("operations/4", "done_error"))?;

            let names: Vec<_> = find_unresolved(conn)?.into_iter().map(|o| o.name).collect();
            assert_eq!(names, vec!["operations/1", "operations/2"]);
            assert!(has_unresolved_for_file(conn, "/docs/a.pdf")?);
            Ok::<_, DatabaseError>(())
        })
        .unwrap();
    }

    #[test]
    fn test_update_state_and_resolve_all() {
        let db = test_db();
        db.with_conn(|conn| {
            upsert(conn, &sample_op("operations/1", "pending"))?;
            upsert(conn, &sample_op("operations/2", "pending"))?;

            assert!(update_state(conn, "operations/1", "done_error", Some("boom"), "t")?);
            assert!(!update_state(conn, "operations/404", "done_error", None, "t")?);

            let resolved = resolve_all_for_file(conn, "/docs/a.pdf", "done_error", None, "t")?;
            assert_eq!(resolved, 1);
            assert!(!has_unresolved_for_file(conn, "/docs/a.pdf")?);
            assert_eq!(
                find_by_name(conn, "operations/1")?.unwrap().error.as_deref(),
                Some("boom")
            );
            Ok::<_, DatabaseError>(())
        })
        .unwrap();
    }
}
