//! ManualOverlay repository: the `manual_overlays` table.

use rusqlite::{params, Connection, OptionalExtension, Row};

use super::DatabaseError;

#[derive(Debug, Clone, PartialEq)]
pub struct ManualOverlayRow {
    pub id: String,
    pub diff_result_id: String,
    pub version: u32,
    pub overlay_ref: String,
    pub is_active: bool,
    pub parent_overlay_id: Option<String>,
    pub created_by: Option<String>,
    pub created_at: String,
}

impl ManualOverlayRow {
    fn from_row(row: &Row<'_>) -> Result<Self, rusqlite::Error> {
        Ok(Self {
            id: row.get("id")?,
            diff_result_id: row.get("diff_result_id")?,
            version: row.get("version")?,
            overlay_ref: row.get("overlay_ref")?,
            is_active: row.get("is_active")?,
            parent_overlay_id: row.get("parent_overlay_id")?,
            created_by: row.get("created_by")?,
            created_at: row.get("created_at")?,
        })
    }
}

pub fn insert(conn: &Connection, overlay: &ManualOverlayRow) -> Result<(), DatabaseError> {
    conn.execute(
        "INSERT INTO manual_overlays (id, diff_result_id, version, overlay_ref, is_active,
         parent_overlay_id, created_by, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![
            overlay.id,
            overlay.diff_result_id,
            overlay.version,
            overlay.overlay_ref,
            overlay.is_active,
            overlay.parent_overlay_id,
            overlay.created_by,
            overlay.created_at,
        ],
    )?;
    Ok(())
}

pub fn find_active(
    conn: &Connection,
    diff_result_id: &str,
) -> Result<Option<ManualOverlayRow>, DatabaseError> {
    Ok(conn
        .query_row(
            "SELECT * FROM manual_overlays WHERE diff_result_id = ?1 AND is_active = 1",
            params![diff_result_id],
            ManualOverlayRow::from_row,
        )
        .optional()?)
}

pub fn next_version(conn: &Connection, diff_result_id: &str) -> Result<u32, DatabaseError> {
    let version: u32 = conn.query_row(
        "SELECT COALESCE(MAX(version), 0) + 1 FROM manual_overlays WHERE diff_result_id = ?1",
        params![diff_result_id],
        |r| r.get(0),
    )?;
    Ok(version)
}

pub fn deactivate(conn: &Connection, id: &str) -> Result<bool, DatabaseError> {
    let changed = conn.execute(
        "UPDATE manual_overlays SET is_active = 0 WHERE id = ?1 AND is_active = 1",
        params![id],
    )?;
    Ok(changed > 0)
}

/// All versions for a diff result, newest first.
pub fn history(
    conn: &Connection,
    diff_result_id: &str,
) -> Result<Vec<ManualOverlayRow>, DatabaseError> {
    let mut stmt = conn.prepare(
        "SELECT * FROM manual_overlays WHERE diff_result_id = ?1 ORDER BY version DESC",
    )?;
    let rows = stmt
        .query_map(params![diff_result_id], ManualOverlayRow::from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}
