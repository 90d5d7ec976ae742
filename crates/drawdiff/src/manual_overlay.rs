//! Manual overlay corrections.
//!
//! A DiffResult is never edited. Reviewers layer corrected overlays on top
//! of it instead; each correction is a new version that deactivates the
//! previous one and links back to it.

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;

use crate::db::overlay_repo::{self, ManualOverlayRow};
use crate::db::{diff_repo, parse_timestamp, timestamp, Database, DatabaseError};
use crate::error::{DecodeError, StorageError};
use crate::imaging::decode_page;
use crate::storage::{manual_overlay_key, ObjectStore};

#[derive(Error, Debug)]
pub enum OverlayError {
    #[error("Diff result '{0}' does not exist")]
    DiffResultNotFound(String),

    #[error("Invalid overlay image: {0}")]
    Decode(#[from] DecodeError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ManualOverlay {
    pub id: String,
    pub diff_result_id: String,
    pub version: u32,
    pub overlay_ref: String,
    pub is_active: bool,
    pub parent_overlay_id: Option<String>,
    pub created_by: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl TryFrom<ManualOverlayRow> for ManualOverlay {
    type Error = DatabaseError;

    fn try_from(row: ManualOverlayRow) -> Result<Self, Self::Error> {
        Ok(ManualOverlay {
            created_at: parse_timestamp("manual_overlay", &row.id, &row.created_at)?,
            id: row.id,
            diff_result_id: row.diff_result_id,
            version: row.version,
            overlay_ref: row.overlay_ref,
            is_active: row.is_active,
            parent_overlay_id: row.parent_overlay_id,
            created_by: row.created_by,
        })
    }
}

/// Stores `png` as the next overlay version of a diff result and makes it
/// the active one.
pub fn create_version(
    db: &Database,
    store: &dyn ObjectStore,
    diff_result_id: &str,
    png: &[u8],
    created_by: Option<&str>,
) -> Result<ManualOverlay, OverlayError> {
    let now = Utc::now();
    let row = db.with_tx(|tx| {
        if diff_repo::find_by_id(tx, diff_result_id)?.is_none() {
            return Ok(Err(OverlayError::DiffResultNotFound(
                diff_result_id.to_string(),
            )));
        }

        let version = overlay_repo::next_version(tx, diff_result_id)?;
        let key = manual_overlay_key(diff_result_id, version);
        if let Err(e) = decode_page(png, &key) {
            return Ok(Err(e.into()));
        }
        if let Err(e) = store.put(&key, png) {
            return Ok(Err(e.into()));
        }

        let parent = overlay_repo::find_active(tx, diff_result_id)?;
        if let Some(parent) = &parent {
            overlay_repo::deactivate(tx, &parent.id)?;
        }

        let row = ManualOverlayRow {
            id: uuid::Uuid::new_v4().to_string(),
            diff_result_id: diff_result_id.to_string(),
            version,
            overlay_ref: key,
            is_active: true,
            parent_overlay_id: parent.map(|p| p.id),
            created_by: created_by.map(str::to_string),
            created_at: timestamp(now),
        };
        overlay_repo::insert(tx, &row)?;
        Ok(Ok(row))
    })??;

    tracing::info!(
        diff_result_id = %diff_result_id,
        version = row.version,
        "Created manual overlay version"
    );
    Ok(ManualOverlay::try_from(row)?)
}

/// The overlay to show for a diff result: the active manual correction if
/// there is one, otherwise the generated overlay.
pub fn active_overlay_ref(db: &Database, diff_result_id: &str) -> Result<String, OverlayError> {
    let found = db.with_conn(|conn| {
        if let Some(active) = overlay_repo::find_active(conn, diff_result_id)? {
            return Ok(Some(active.overlay_ref));
        }
        Ok(diff_repo::find_by_id(conn, diff_result_id)?.map(|d| d.overlay_ref))
    })?;
    found.ok_or_else(|| OverlayError::DiffResultNotFound(diff_result_id.to_string()))
}

/// All manual versions of a diff result, newest first.
pub fn history(db: &Database, diff_result_id: &str) -> Result<Vec<ManualOverlay>, OverlayError> {
    let rows = db.with_conn(|conn| overlay_repo::history(conn, diff_result_id))?;
    Ok(rows
        .into_iter()
        .map(ManualOverlay::try_from)
        .collect::<Result<Vec<_>, _>>()?)
}
