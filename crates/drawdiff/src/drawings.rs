//! DrawingVersion registration.
//!
//! Pages arrive already rasterized. Registration stores the raster and
//! records a DrawingVersion; re-uploading an identical page of the same
//! document returns the existing version. OCR fields are owned by the
//! external OCR collaborator and only updated through `set_ocr_status`.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::db::drawing_repo::{self, DrawingVersionRow};
use crate::db::{parse_timestamp, timestamp, Database, DatabaseError};
use crate::error::Result;
use crate::imaging::loader::{check_media_type, decode_page};
use crate::storage::{page_key, ObjectStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OcrStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
}

impl OcrStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OcrStatus::Pending => "pending",
            OcrStatus::InProgress => "in_progress",
            OcrStatus::Completed => "completed",
            OcrStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(OcrStatus::Pending),
            "in_progress" => Some(OcrStatus::InProgress),
            "completed" => Some(OcrStatus::Completed),
            "failed" => Some(OcrStatus::Failed),
            _ => None,
        }
    }
}

impl fmt::Display for OcrStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DrawingVersion {
    pub id: String,
    pub document_id: String,
    pub page_number: u32,
    pub storage_ref: String,
    pub ocr_status: OcrStatus,
    pub ocr_result_ref: Option<String>,
    pub content_hash: String,
    pub file_size: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TryFrom<DrawingVersionRow> for DrawingVersion {
    type Error = DatabaseError;

    fn try_from(row: DrawingVersionRow) -> std::result::Result<Self, Self::Error> {
        let ocr_status = OcrStatus::parse(&row.ocr_status).ok_or_else(|| DatabaseError::Corrupt {
            entity: "drawing_version",
            id: row.id.clone(),
            reason: format!("unknown OCR status '{}'", row.ocr_status),
        })?;
        Ok(DrawingVersion {
            ocr_status,
            file_size: row.file_size.max(0) as u64,
            created_at: parse_timestamp("drawing_version", &row.id, &row.created_at)?,
            updated_at: parse_timestamp("drawing_version", &row.id, &row.updated_at)?,
            id: row.id,
            document_id: row.document_id,
            page_number: row.page_number,
            storage_ref: row.storage_ref,
            ocr_result_ref: row.ocr_result_ref,
            content_hash: row.content_hash,
        })
    }
}

/// A rasterized page to register.
#[derive(Debug, Clone)]
pub struct NewPage<'a> {
    pub document_id: &'a str,
    pub page_number: u32,
    pub bytes: &'a [u8],
    /// File extension of the raster, e.g. `png`.
    pub extension: &'a str,
}

pub fn content_hash(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}

/// Stores a page and records its DrawingVersion. Returns the version and
/// whether it was newly created.
pub fn register_page(
    db: &Database,
    store: &dyn ObjectStore,
    page: &NewPage<'_>,
) -> Result<(DrawingVersion, bool)> {
    let hash = content_hash(page.bytes);
    if let Some(existing) =
        db.with_conn(|conn| drawing_repo::find_by_hash(conn, page.document_id, &hash))?
    {
        log::debug!(
            "Page {} of document {} already registered as {}",
            page.page_number,
            page.document_id,
            existing.id
        );
        return Ok((DrawingVersion::try_from(existing)?, false));
    }

    let id = uuid::Uuid::new_v4().to_string();
    let key = page_key(&id, &page.extension.to_ascii_lowercase());
    check_media_type(&key)?;
    decode_page(page.bytes, &key)?;
    store.put(&key, page.bytes)?;

    let now = timestamp(Utc::now());
    let row = DrawingVersionRow {
        id,
        document_id: page.document_id.to_string(),
        page_number: page.page_number,
        storage_ref: key,
        ocr_status: OcrStatus::Pending.as_str().to_string(),
        ocr_result_ref: None,
        content_hash: hash,
        file_size: page.bytes.len() as i64,
        created_at: now.clone(),
        updated_at: now,
    };
    let (stored, created) = db.with_conn(|conn| drawing_repo::insert_or_get(conn, &row))?;
    if created {
        tracing::info!(
            drawing_version_id = %stored.id,
            document_id = %stored.document_id,
            page_number = stored.page_number,
            "Registered page"
        );
    } else {
        // A concurrent upload of the same page won; our copy is unreferenced.
        log::debug!("Lost registration race for {}; orphaned {}", stored.id, row.storage_ref);
    }
    Ok((DrawingVersion::try_from(stored)?, created))
}

pub fn drawing_version(db: &Database, id: &str) -> Result<Option<DrawingVersion>> {
    let row = db.with_conn(|conn| drawing_repo::find_by_id(conn, id))?;
    Ok(row.map(DrawingVersion::try_from).transpose()?)
}

/// Records OCR progress reported by the OCR collaborator. A `None` result
/// reference keeps the stored one. Returns `None` for unknown versions.
pub fn set_ocr_status(
    db: &Database,
    id: &str,
    status: OcrStatus,
    result_ref: Option<&str>,
) -> Result<Option<DrawingVersion>> {
    let now = timestamp(Utc::now());
    let updated =
        db.with_conn(|conn| drawing_repo::update_ocr(conn, id, status.as_str(), result_ref, &now))?;
    if !updated {
        return Ok(None);
    }
    drawing_version(db, id)
}

pub fn document_pages(db: &Database, document_id: &str) -> Result<Vec<DrawingVersion>> {
    let rows = db.with_conn(|conn| drawing_repo::list_for_document(conn, document_id))?;
    Ok(rows
        .into_iter()
        .map(DrawingVersion::try_from)
        .collect::<std::result::Result<Vec<_>, _>>()?)
}
