//! JobStage repository: the `job_stages` table.
//!
//! Every transition is a single conditional `UPDATE`; callers learn from the
//! affected row count (or the `RETURNING` row) whether they won the race.

use rusqlite::{params, Connection, OptionalExtension, Row};

use super::DatabaseError;

#[derive(Debug, Clone, PartialEq)]
pub struct StageRow {
    pub id: String,
    pub job_id: String,
    pub kind: String,
    pub drawing_version_id: Option<String>,
    pub status: String,
    pub retry_count: u32,
    pub max_retries: u32,
    pub owner: Option<String>,
    /// Lease expiry in milliseconds since the Unix epoch.
    pub claimed_until: Option<i64>,
    pub dispatched_at: Option<String>,
    pub result_ref: Option<String>,
    pub error: Option<String>,
    pub created_at: String,
    pub updated_at: String,
    pub started_at: Option<String>,
    pub completed_at: Option<String>,
}

impl StageRow {
    fn from_row(row: &Row<'_>) -> Result<Self, rusqlite::Error> {
        Ok(Self {
            id: row.get("id")?,
            job_id: row.get("job_id")?,
            kind: row.get("kind")?,
            drawing_version_id: row.get("drawing_version_id")?,
            status: row.get("status")?,
            retry_count: row.get("retry_count")?,
            max_retries: row.get("max_retries")?,
            owner: row.get("owner")?,
            claimed_until: row.get("claimed_until")?,
            dispatched_at: row.get("dispatched_at")?,
            result_ref: row.get("result_ref")?,
            error: row.get("error")?,
            created_at: row.get("created_at")?,
            updated_at: row.get("updated_at")?,
            started_at: row.get("started_at")?,
            completed_at: row.get("completed_at")?,
        })
    }
}

/// Inserts a stage unless one already exists for the same
/// `(job, kind, drawing version)` scope. Returns the stored stage and
/// whether it was newly created.
pub fn insert_or_get(conn: &Connection, stage: &StageRow) -> Result<(StageRow, bool), DatabaseError> {
    let inserted = conn.execute(
        "INSERT INTO job_stages (id, job_id, kind, drawing_version_id, status, retry_count,
         max_retries, owner, claimed_until, dispatched_at, result_ref, error, created_at,
         updated_at, started_at, completed_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)
         ON CONFLICT DO NOTHING",
        params![
            stage.id,
            stage.job_id,
            stage.kind,
            stage.drawing_version_id,
            stage.status,
            stage.retry_count,
            stage.max_retries,
            stage.owner,
            stage.claimed_until,
            stage.dispatched_at,
            stage.result_ref,
            stage.error,
            stage.created_at,
            stage.updated_at,
            stage.started_at,
            stage.completed_at,
        ],
    )?;

    let stored = conn
        .query_row(
            "SELECT * FROM job_stages
             WHERE job_id = ?1 AND kind = ?2 AND IFNULL(drawing_version_id, '') = IFNULL(?3, '')",
            params![stage.job_id, stage.kind, stage.drawing_version_id],
            StageRow::from_row,
        )
        .optional()?
        .ok_or_else(|| DatabaseError::Corrupt {
            entity: "job_stage",
            id: stage.id.clone(),
            reason: "row vanished after insert".to_string(),
        })?;
    Ok((stored, inserted == 1))
}

pub fn find_by_id(conn: &Connection, id: &str) -> Result<Option<StageRow>, DatabaseError> {
    Ok(conn
        .query_row(
            "SELECT * FROM job_stages WHERE id = ?1",
            params![id],
            StageRow::from_row,
        )
        .optional()?)
}

/// Stages of a job in creation order.
pub fn list_for_job(conn: &Connection, job_id: &str) -> Result<Vec<StageRow>, DatabaseError> {
    let mut stmt = conn.prepare("SELECT * FROM job_stages WHERE job_id = ?1 ORDER BY rowid")?;
    let rows = stmt
        .query_map(params![job_id], StageRow::from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Takes ownership of a stage. Succeeds for a `pending` stage, a stage this
/// owner already holds, or an `in_progress` stage whose lease has expired.
pub fn claim(
    conn: &Connection,
    id: &str,
    owner: &str,
    now_ms: i64,
    lease_until_ms: i64,
    now: &str,
) -> Result<bool, DatabaseError> {
    let changed = conn.execute(
        "UPDATE job_stages
         SET status = 'in_progress', owner = ?2, claimed_until = ?4,
             started_at = COALESCE(started_at, ?5), updated_at = ?5
         WHERE id = ?1
           AND (status = 'pending'
                OR (status = 'in_progress'
                    AND (owner = ?2 OR claimed_until IS NULL OR claimed_until < ?3)))",
        params![id, owner, now_ms, lease_until_ms, now],
    )?;
    Ok(changed > 0)
}

pub fn complete(
    conn: &Connection,
    id: &str,
    owner: &str,
    result_ref: Option<&str>,
    now: &str,
) -> Result<bool, DatabaseError> {
    let changed = conn.execute(
        "UPDATE job_stages
         SET status = 'completed', result_ref = ?3, error = NULL, claimed_until = NULL,
             completed_at = ?4, updated_at = ?4
         WHERE id = ?1 AND status = 'in_progress' AND owner = ?2",
        params![id, owner, result_ref, now],
    )?;
    Ok(changed > 0)
}

/// Records a failure. A retryable failure with retries left sends the stage
/// back to `pending`; anything else makes it terminally `failed`. Returns the
/// new `(status, retry_count)`, or `None` if `owner` does not hold the stage.
pub fn fail(
    conn: &Connection,
    id: &str,
    owner: &str,
    error: &str,
    retryable: bool,
    now: &str,
) -> Result<Option<(String, u32)>, DatabaseError> {
    Ok(conn
        .query_row(
            "UPDATE job_stages
             SET status = CASE WHEN ?4 AND retry_count < max_retries THEN 'pending' ELSE 'failed' END,
                 retry_count = CASE WHEN ?4 AND retry_count < max_retries
                                    THEN retry_count + 1 ELSE retry_count END,
                 completed_at = CASE WHEN ?4 AND retry_count < max_retries THEN NULL ELSE ?5 END,
                 owner = NULL, claimed_until = NULL, error = ?3, updated_at = ?5
             WHERE id = ?1 AND status = 'in_progress' AND owner = ?2
             RETURNING status, retry_count",
            params![id, owner, error, retryable, now],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .optional()?)
}

/// `in_progress` (held by `owner`) -> `skipped`.
pub fn skip_owned(
    conn: &Connection,
    id: &str,
    owner: &str,
    reason: &str,
    now: &str,
) -> Result<bool, DatabaseError> {
    let changed = conn.execute(
        "UPDATE job_stages
         SET status = 'skipped', error = ?3, claimed_until = NULL, completed_at = ?4, updated_at = ?4
         WHERE id = ?1 AND status = 'in_progress' AND owner = ?2",
        params![id, owner, reason, now],
    )?;
    Ok(changed > 0)
}

/// Skips every not-yet-started stage of a job. Returns how many were skipped.
pub fn skip_pending(
    conn: &Connection,
    job_id: &str,
    reason: &str,
    now: &str,
) -> Result<usize, DatabaseError> {
    let changed = conn.execute(
        "UPDATE job_stages
         SET status = 'skipped', error = ?2, completed_at = ?3, updated_at = ?3
         WHERE job_id = ?1 AND status = 'pending'",
        params![job_id, reason, now],
    )?;
    Ok(changed)
}

/// Records that the stage's task was enqueued. Returns false if it already was.
pub fn mark_dispatched(conn: &Connection, id: &str, now: &str) -> Result<bool, DatabaseError> {
    let changed = conn.execute(
        "UPDATE job_stages SET dispatched_at = ?2, updated_at = ?2
         WHERE id = ?1 AND status = 'pending' AND dispatched_at IS NULL",
        params![id, now],
    )?;
    Ok(changed > 0)
}
