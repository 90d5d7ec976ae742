//! DrawingVersion repository: the `drawing_versions` table.

use rusqlite::{params, Connection, OptionalExtension, Row};

use super::DatabaseError;

#[derive(Debug, Clone, PartialEq)]
pub struct DrawingVersionRow {
    pub id: String,
    pub document_id: String,
    pub page_number: u32,
    pub storage_ref: String,
    pub ocr_status: String,
    pub ocr_result_ref: Option<String>,
    pub content_hash: String,
    pub file_size: i64,
    pub created_at: String,
    pub updated_at: String,
}

impl DrawingVersionRow {
    fn from_row(row: &Row<'_>) -> Result<Self, rusqlite::Error> {
        Ok(Self {
            id: row.get("id")?,
            document_id: row.get("document_id")?,
            page_number: row.get("page_number")?,
            storage_ref: row.get("storage_ref")?,
            ocr_status: row.get("ocr_status")?,
            ocr_result_ref: row.get("ocr_result_ref")?,
            content_hash: row.get("content_hash")?,
            file_size: row.get("file_size")?,
            created_at: row.get("created_at")?,
            updated_at: row.get("updated_at")?,
        })
    }
}

/// Inserts a drawing version unless the same content already exists for the
/// document. Returns the stored row and whether it was newly created.
pub fn insert_or_get(
    conn: &Connection,
    row: &DrawingVersionRow,
) -> Result<(DrawingVersionRow, bool), DatabaseError> {
    let inserted = conn.execute(
        "INSERT INTO drawing_versions (id, document_id, page_number, storage_ref, ocr_status,
         ocr_result_ref, content_hash, file_size, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
         ON CONFLICT (document_id, content_hash) DO NOTHING",
        params![
            row.id,
            row.document_id,
            row.page_number,
            row.storage_ref,
            row.ocr_status,
            row.ocr_result_ref,
            row.content_hash,
            row.file_size,
            row.created_at,
            row.updated_at,
        ],
    )?;

    let stored = find_by_hash(conn, &row.document_id, &row.content_hash)?.ok_or_else(|| {
        DatabaseError::Corrupt {
            entity: "drawing_version",
            id: row.id.clone(),
            reason: "row vanished after insert".to_string(),
        }
    })?;
    Ok((stored, inserted == 1))
}

pub fn find_by_id(conn: &Connection, id: &str) -> Result<Option<DrawingVersionRow>, DatabaseError> {
    Ok(conn
        .query_row(
            "SELECT * FROM drawing_versions WHERE id = ?1",
            params![id],
            DrawingVersionRow::from_row,
        )
        .optional()?)
}

pub fn find_by_hash(
    conn: &Connection,
    document_id: &str,
    content_hash: &str,
) -> Result<Option<DrawingVersionRow>, DatabaseError> {
    Ok(conn
        .query_row(
            "SELECT * FROM drawing_versions WHERE document_id = ?1 AND content_hash = ?2",
            params![document_id, content_hash],
            DrawingVersionRow::from_row,
        )
        .optional()?)
}

/// Pages of a document, in page order.
pub fn list_for_document(
    conn: &Connection,
    document_id: &str,
) -> Result<Vec<DrawingVersionRow>, DatabaseError> {
    let mut stmt = conn.prepare(
        "SELECT * FROM drawing_versions WHERE document_id = ?1 ORDER BY page_number, created_at",
    )?;
    let rows = stmt
        .query_map(params![document_id], DrawingVersionRow::from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Updates the OCR fields. Returns false when the drawing version does not exist.
pub fn update_ocr(
    conn: &Connection,
    id: &str,
    ocr_status: &str,
    ocr_result_ref: Option<&str>,
    updated_at: &str,
) -> Result<bool, DatabaseError> {
    let changed = conn.execute(
        "UPDATE drawing_versions
         SET ocr_status = ?2, ocr_result_ref = COALESCE(?3, ocr_result_ref), updated_at = ?4
         WHERE id = ?1",
        params![id, ocr_status, ocr_result_ref, updated_at],
    )?;
    Ok(changed > 0)
}


#[cfg(test)]
mod tests {
    use super::fixtures::sample;
    use super::*;
    use crate::db::Database;

    #[test]
    fn test_insert_and_find() {
        let db = Database::open_in_memory().unwrap();
        db.with_conn(|conn| {
            let (row, created) = insert_or_get(conn, &sample("dv1", "doc", "h1"))?;
            assert!(created);
            assert_eq!(row.id, "dv1");

            let found = find_by_id(conn, "dv1")?.unwrap();
            assert_eq!(found, row);
            assert!(find_by_id(conn, "nope")?.is_none());
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn test_same_content_is_deduplicated_per_document() {
        let db = Database::open_in_memory().unwrap();
        db.with_conn(|conn| {
            insert_or_get(conn, &sample("dv1", "doc", "h1"))?;
            let (row, created) = insert_or_get(conn, &sample("dv2", "doc", "h1"))?;
            assert!(!created);
            assert_eq!(row.id, "dv1");

            let (other, created) = insert_or_get(conn, &sample("dv3", "other-doc", "h1"))?;
            assert!(created);
            assert_eq!(other.id, "dv3");
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn test_update_ocr() {
        let db = Database::open_in_memory().unwrap();
        db.with_conn(|conn| {
            insert_or_get(conn, &sample("dv1", "doc", "h1"))?;
            assert!(update_ocr(conn, "dv1", "completed", Some("ocr/dv1.json"), "t2")?);
            assert!(!update_ocr(conn, "missing", "completed", None, "t2")?);

            let row = find_by_id(conn, "dv1")?.unwrap();
            assert_eq!(row.ocr_status, "completed");
            assert_eq!(row.ocr_result_ref.as_deref(), Some("ocr/dv1.json"));
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn test_list_for_document_in_page_order() {
        let db = Database::open_in_memory().unwrap();
        db.with_conn(|conn| {
            let mut second = sample("dv2", "doc", "h2");
            second.page_number = 2;
            insert_or_get(conn, &second)?;
            insert_or_get(conn, &sample("dv1", "doc", "h1"))?;

            let pages = list_for_document(conn, "doc")?;
            let ids: Vec<&str> = pages.iter().map(|p| p.id.as_str()).collect();
            assert_eq!(ids, vec!["dv1", "dv2"]);
            Ok(())
        })
        .unwrap();
    }
}
