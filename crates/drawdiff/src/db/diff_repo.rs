//! DiffResult repository: the `diff_results` table. Rows are immutable.

use rusqlite::{params, Connection, OptionalExtension, Row};

use super::DatabaseError;

#[derive(Debug, Clone, PartialEq)]
pub struct DiffResultRow {
    pub id: String,
    pub job_id: String,
    pub old_drawing_version_id: String,
    pub new_drawing_version_id: String,
    pub overlay_ref: String,
    pub aligned_ref: String,
    pub confidence: f64,
    pub inlier_ratio: f64,
    pub changes_detected: bool,
    pub change_count: u32,
    /// `DiffStats` as JSON.
    pub region_stats: String,
    /// `Transform2D` as JSON.
    pub transform: String,
    pub created_at: String,
}

impl DiffResultRow {
    fn from_row(row: &Row<'_>) -> Result<Self, rusqlite::Error> {
        Ok(Self {
            id: row.get("id")?,
            job_id: row.get("job_id")?,
            old_drawing_version_id: row.get("old_drawing_version_id")?,
            new_drawing_version_id: row.get("new_drawing_version_id")?,
            overlay_ref: row.get("overlay_ref")?,
            aligned_ref: row.get("aligned_ref")?,
            confidence: row.get("confidence")?,
            inlier_ratio: row.get("inlier_ratio")?,
            changes_detected: row.get("changes_detected")?,
            change_count: row.get("change_count")?,
            region_stats: row.get("region_stats")?,
            transform: row.get("transform")?,
            created_at: row.get("created_at")?,
        })
    }
}

/// Inserts the diff result of a job, or returns the one already stored for
/// it. A redelivered stage therefore never creates a second result.
pub fn insert_or_get(
    conn: &Connection,
    diff: &DiffResultRow,
) -> Result<(DiffResultRow, bool), DatabaseError> {
    let inserted = conn.execute(
        "INSERT INTO diff_results (id, job_id, old_drawing_version_id, new_drawing_version_id,
         overlay_ref, aligned_ref, confidence, inlier_ratio, changes_detected, change_count,
         region_stats, transform, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
         ON CONFLICT (job_id) DO NOTHING",
        params![
            diff.id,
            diff.job_id,
            diff.old_drawing_version_id,
            diff.new_drawing_version_id,
            diff.overlay_ref,
            diff.aligned_ref,
            diff.confidence,
            diff.inlier_ratio,
            diff.changes_detected,
            diff.change_count,
            diff.region_stats,
            diff.transform,
            diff.created_at,
        ],
    )?;

    let stored = find_by_job(conn, &diff.job_id)?.ok_or_else(|| DatabaseError::Corrupt {
        entity: "diff_result",
        id: diff.id.clone(),
        reason: "row vanished after insert".to_string(),
    })?;
    Ok((stored, inserted == 1))
}

pub fn find_by_id(conn: &Connection, id: &str) -> Result<Option<DiffResultRow>, DatabaseError> {
    Ok(conn
        .query_row(
            "SELECT * FROM diff_results WHERE id = ?1",
            params![id],
            DiffResultRow::from_row,
        )
        .optional()?)
}

pub fn find_by_job(conn: &Connection, job_id: &str) -> Result<Option<DiffResultRow>, DatabaseError> {
    Ok(conn
        .query_row(
            "SELECT * FROM diff_results WHERE job_id = ?1",
            params![job_id],
            DiffResultRow::from_row,
        )
        .optional()?)
}
