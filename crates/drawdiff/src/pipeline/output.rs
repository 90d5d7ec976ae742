//! Typed results handed from one stage to the next.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::db::diff_repo::DiffResultRow;
use crate::db::{parse_timestamp, timestamp, DatabaseError};
use crate::imaging::{AlignmentResult, DiffStats, Transform2D};
use crate::summary::SummaryResult;

/// The persisted outcome of an alignment+diff stage. Immutable once stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiffResult {
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
    pub stats: DiffStats,
    pub transform: Transform2D,
    pub created_at: DateTime<Utc>,
}

impl DiffResult {
    /// Diff result ids are derived from the job so that every delivery of
    /// the same stage writes to the same keys.
    pub fn id_for_job(job_id: &str) -> String {
        uuid::Uuid::new_v5(&uuid::Uuid::NAMESPACE_OID, format!("diff:{}", job_id).as_bytes())
            .to_string()
    }

    pub(crate) fn to_row(&self) -> Result<DiffResultRow, DatabaseError> {
        Ok(DiffResultRow {
            id: self.id.clone(),
            job_id: self.job_id.clone(),
            old_drawing_version_id: self.old_drawing_version_id.clone(),
            new_drawing_version_id: self.new_drawing_version_id.clone(),
            overlay_ref: self.overlay_ref.clone(),
            aligned_ref: self.aligned_ref.clone(),
            confidence: self.confidence,
            inlier_ratio: self.inlier_ratio,
            changes_detected: self.changes_detected,
            change_count: self.change_count,
            region_stats: serde_json::to_string(&self.stats)?,
            transform: serde_json::to_string(&self.transform)?,
            created_at: timestamp(self.created_at),
        })
    }
}

impl TryFrom<DiffResultRow> for DiffResult {
    type Error = DatabaseError;

    fn try_from(row: DiffResultRow) -> Result<Self, Self::Error> {
        Ok(DiffResult {
            stats: serde_json::from_str(&row.region_stats)?,
            transform: serde_json::from_str(&row.transform)?,
            created_at: parse_timestamp("diff_result", &row.id, &row.created_at)?,
            id: row.id,
            job_id: row.job_id,
            old_drawing_version_id: row.old_drawing_version_id,
            new_drawing_version_id: row.new_drawing_version_id,
            overlay_ref: row.overlay_ref,
            aligned_ref: row.aligned_ref,
            confidence: row.confidence,
            inlier_ratio: row.inlier_ratio,
            changes_detected: row.changes_detected,
            change_count: row.change_count,
        })
    }
}

/// What a stage handler produced.
#[derive(Debug, Clone, PartialEq)]
pub enum StageOutput {
    AlignmentDiff {
        alignment: AlignmentResult,
        diff: DiffResult,
    },
    Summary {
        result_ref: String,
        summary: SummaryResult,
    },
}

impl StageOutput {
    /// Storage key recorded as the stage's `result_ref`.
    pub fn result_ref(&self) -> &str {
        match self {
            StageOutput::AlignmentDiff { diff, .. } => &diff.overlay_ref,
            StageOutput::Summary { result_ref, .. } => result_ref,
        }
    }
}
