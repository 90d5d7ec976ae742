//! Job repository: the `jobs` table.
//!
//! Status changes are conditional updates so that a terminal status is
//! written exactly once no matter how many workers race to set it.

use rusqlite::{params, Connection, OptionalExtension, Row};

use super::DatabaseError;

/// A raw job row from the database.
#[derive(Debug, Clone, PartialEq)]
pub struct JobRow {
    pub id: String,
    pub project_id: String,
    pub old_drawing_version_id: Option<String>,
    pub new_drawing_version_id: String,
    pub status: String,
    pub error: Option<String>,
    pub created_at: String,
    pub updated_at: String,
    pub started_at: Option<String>,
    pub completed_at: Option<String>,
    pub cancelled_at: Option<String>,
}

impl JobRow {
    fn from_row(row: &Row<'_>) -> Result<Self, rusqlite::Error> {
        Ok(Self {
            id: row.get("id")?,
            project_id: row.get("project_id")?,
            old_drawing_version_id: row.get("old_drawing_version_id")?,
            new_drawing_version_id: row.get("new_drawing_version_id")?,
            status: row.get("status")?,
            error: row.get("error")?,
            created_at: row.get("created_at")?,
            updated_at: row.get("updated_at")?,
            started_at: row.get("started_at")?,
            completed_at: row.get("completed_at")?,
            cancelled_at: row.get("cancelled_at")?,
        })
    }
}

/// Inserts a new job row.
pub fn insert(conn: &Connection, job: &JobRow) -> Result<(), DatabaseError> {
    conn.execute(
        "INSERT INTO jobs (id, project_id, old_drawing_version_id, new_drawing_version_id, status,
         error, created_at, updated_at, started_at, completed_at, cancelled_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
        params![
            job.id,
            job.project_id,
            job.old_drawing_version_id,
            job.new_drawing_version_id,
            job.status,
            job.error,
            job.created_at,
            job.updated_at,
            job.started_at,
            job.completed_at,
            job.cancelled_at,
        ],
    )?;
    Ok(())
}

/// Finds a job by its ID.
pub fn find_by_id(conn: &Connection, id: &str) -> Result<Option<JobRow>, DatabaseError> {
    Ok(conn
        .query_row(
            "SELECT * FROM jobs WHERE id = ?1",
            params![id],
            JobRow::from_row,
        )
        .optional()?)
}

/// `created` -> `running`. Returns false if the job was not `created`.
pub fn mark_running(conn: &Connection, id: &str, now: &str) -> Result<bool, DatabaseError> {
    let changed = conn.execute(
        "UPDATE jobs SET status = 'running', started_at = COALESCE(started_at, ?2), updated_at = ?2
         WHERE id = ?1 AND status = 'created'",
        params![id, now],
    )?;
    Ok(changed > 0)
}

/// Sets a terminal `completed`/`failed` status if the job is still active.
pub fn finish(
    conn: &Connection,
    id: &str,
    status: &str,
    error: Option<&str>,
    now: &str,
) -> Result<bool, DatabaseError> {
    let changed = conn.execute(
        "UPDATE jobs SET status = ?2, error = ?3, completed_at = ?4, updated_at = ?4
         WHERE id = ?1 AND status IN ('created', 'running')",
        params![id, status, error, now],
    )?;
    Ok(changed > 0)
}

/// `created`/`running` -> `cancelled`.
pub fn cancel(conn: &Connection, id: &str, now: &str) -> Result<bool, DatabaseError> {
    let changed = conn.execute(
        "UPDATE jobs SET status = 'cancelled', cancelled_at = ?2, updated_at = ?2
         WHERE id = ?1 AND status IN ('created', 'running')",
        params![id, now],
    )?;
    Ok(changed > 0)
}

/// Deletes a job; stages, diff results and manual overlays cascade.
pub fn delete(conn: &Connection, id: &str) -> Result<bool, DatabaseError> {
    let changed = conn.execute("DELETE FROM jobs WHERE id = ?1", params![id])?;
    Ok(changed > 0)
}
