//! Summarization collaborator.
//!
//! The summary stage hands the diff of a job to a `Summarizer` and stores
//! what comes back. Deployments plug in an external model behind the trait;
//! `StatsSummarizer` describes the diff statistics without one.

use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;

use crate::imaging::{ChangeRegion, Quadrant};
use crate::pipeline::DiffResult;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum SummaryError {
    /// The summarizer could not be reached or timed out. Retried.
    #[error("Summarizer unavailable: {0}")]
    Unavailable(String),

    /// The summarizer refused or returned something unusable. Not retried.
    #[error("Summarizer rejected the request: {0}")]
    Rejected(String),
}

impl SummaryError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, SummaryError::Unavailable(_))
    }
}

/// Input to one summary call.
#[derive(Debug, Clone, Serialize)]
pub struct SummaryRequest {
    pub job_id: String,
    pub project_id: String,
    pub old_drawing_version_id: Option<String>,
    pub new_drawing_version_id: String,
    /// Absent for the first version of a drawing.
    pub diff: Option<DiffResult>,
    /// OCR output of the new page, if the OCR collaborator finished in time.
    pub ocr_result_ref: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SummaryResult {
    pub text: String,
    pub structured: serde_json::Value,
}

pub trait Summarizer: Send + Sync {
    fn summarize(&self, request: &SummaryRequest) -> Result<SummaryResult, SummaryError>;
}

/// Describes the change regions of a diff in plain text.
#[derive(Debug, Clone, Copy, Default)]
pub struct StatsSummarizer;

impl StatsSummarizer {
    fn describe(region: &ChangeRegion) -> &'static str {
        match (region.added_pixels > 0, region.removed_pixels > 0) {
            (true, true) => "modified",
            (true, false) => "added",
            _ => "removed",
        }
    }

    fn area(quadrant: Quadrant) -> &'static str {
        match quadrant {
            Quadrant::NorthWest => "upper left",
            Quadrant::NorthEast => "upper right",
            Quadrant::SouthWest => "lower left",
            Quadrant::SouthEast => "lower right",
        }
    }
}

impl Summarizer for StatsSummarizer {
    fn summarize(&self, request: &SummaryRequest) -> Result<SummaryResult, SummaryError> {
        let Some(diff) = &request.diff else {
            return Ok(SummaryResult {
                text: "First version of this drawing; there is no earlier revision to compare against."
                    .to_string(),
                structured: json!({ "first_version": true, "change_count": 0 }),
            });
        };

        let stats = &diff.stats;
        let regions: Vec<serde_json::Value> = stats
            .regions
            .iter()
            .map(|r| {
                json!({
                    "change": Self::describe(r),
                    "quadrant": r.quadrant,
                    "bbox": r.bbox,
                    "added_pixels": r.added_pixels,
                    "removed_pixels": r.removed_pixels,
                })
            })
            .collect();

        let mut text = if stats.changes_detected {
            format!(
                "{} change region{} detected ({} pixels added, {} removed). Alignment confidence {:.2}.",
                stats.change_count,
                if stats.change_count == 1 { "" } else { "s" },
                stats.totals.added_pixels,
                stats.totals.removed_pixels,
                diff.confidence
            )
        } else {
            format!(
                "No changes detected. Alignment confidence {:.2}.",
                diff.confidence
            )
        };
        for (i, region) in stats.regions.iter().enumerate() {
            text.push_str(&format!(
                "\nRegion {}: {} in the {} quadrant, {}x{} px at ({}, {}).",
                i + 1,
                Self::describe(region),
                Self::area(region.quadrant),
                region.bbox.width,
                region.bbox.height,
                region.bbox.x,
                region.bbox.y
            ));
        }

        Ok(SummaryResult {
            text,
            structured: json!({
                "first_version": false,
                "change_count": stats.change_count,
                "changes_detected": stats.changes_detected,
                "confidence": diff.confidence,
                "regions": regions,
            }),
        })
    }
}
