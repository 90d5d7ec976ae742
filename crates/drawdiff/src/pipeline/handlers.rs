//! Stage handlers.
//!
//! A handler loads everything it needs from storage, computes, and persists
//! everything downstream stages need before returning. Persisting is keyed
//! by the job, so running a handler twice for the same task rewrites the
//! same objects and finds the already-stored records.

use std::sync::Arc;

use chrono::Utc;
use tracing::info_span;

use crate::config::{AlignmentConfig, OverlayConfig};
use crate::db::{diff_repo, drawing_repo, job_repo, Database};
use crate::error::AlignError;
use crate::imaging::{compare_pages, load_page, Comparison, LoadedPage};
use crate::storage::{aligned_key, overlay_key, put_png, summary_key, ObjectStore};
use crate::summary::{SummaryRequest, Summarizer};

use super::error::PipelineError;
use super::output::{DiffResult, StageOutput};
use super::progress::{ProgressEvent, ProgressReporter, StagePhase};
use super::task::StageTask;

/// Aligns and diffs two decoded pages.
pub trait PageComparator: Send + Sync {
    fn compare(&self, old: &LoadedPage, new: &LoadedPage) -> Result<Comparison, AlignError>;
}

/// Keypoint alignment followed by threshold diffing.
pub struct KeypointComparator {
    alignment: AlignmentConfig,
    overlay: OverlayConfig,
}

impl KeypointComparator {
    pub fn new(alignment: AlignmentConfig, overlay: OverlayConfig) -> Self {
        Self { alignment, overlay }
    }
}

impl PageComparator for KeypointComparator {
    fn compare(&self, old: &LoadedPage, new: &LoadedPage) -> Result<Comparison, AlignError> {
        compare_pages(old, new, &self.alignment, &self.overlay)
    }
}

/// Shared collaborators of the stage handlers.
#[derive(Clone)]
pub struct StageContext {
    pub db: Database,
    pub store: Arc<dyn ObjectStore>,
    pub comparator: Arc<dyn PageComparator>,
    pub summarizer: Arc<dyn Summarizer>,
}

impl StageContext {
    fn phase(&self, progress: &dyn ProgressReporter, task: &StageTask, phase: StagePhase) {
        progress.report(ProgressEvent::new(
            &task.job_id,
            &task.stage_id,
            task.stage_kind,
            phase,
            &phase.to_string(),
        ));
    }

    fn load_version(&self, id: &str) -> Result<LoadedPage, PipelineError> {
        let row = self
            .db
            .with_conn(|conn| drawing_repo::find_by_id(conn, id))?
            .ok_or_else(|| PipelineError::MissingInput(format!("drawing version '{}'", id)))?;
        Ok(load_page(self.store.as_ref(), &row.storage_ref)?)
    }

    pub fn alignment_diff(
        &self,
        task: &StageTask,
        progress: &dyn ProgressReporter,
    ) -> Result<StageOutput, PipelineError> {
        let old_id = task.old_drawing_version_id.as_deref().ok_or_else(|| {
            PipelineError::MissingInput("alignment task has no old drawing version".to_string())
        })?;

        let (old, new) = {
            let _step = info_span!("load_pages").entered();
            self.phase(progress, task, StagePhase::LoadingPages);
            (
                self.load_version(old_id)?,
                self.load_version(&task.new_drawing_version_id)?,
            )
        };

        self.phase(progress, task, StagePhase::Aligning);
        let comparison = self.comparator.compare(&old, &new)?;

        let _step = info_span!("persist").entered();
        self.phase(progress, task, StagePhase::Persisting);

        let diff_id = DiffResult::id_for_job(&task.job_id);
        let overlay_ref = overlay_key(&diff_id);
        let aligned_ref = aligned_key(&diff_id);
        put_png(self.store.as_ref(), &overlay_ref, &comparison.overlay.composite)?;
        put_png(self.store.as_ref(), &aligned_ref, &comparison.aligned_old)?;

        let stats = comparison.overlay.stats;
        let alignment = comparison.alignment;
        let diff = DiffResult {
            id: diff_id,
            job_id: task.job_id.clone(),
            old_drawing_version_id: old_id.to_string(),
            new_drawing_version_id: task.new_drawing_version_id.clone(),
            overlay_ref,
            aligned_ref,
            confidence: alignment.confidence,
            inlier_ratio: alignment.inlier_ratio,
            changes_detected: stats.changes_detected,
            change_count: stats.change_count as u32,
            stats,
            transform: alignment.transform,
            created_at: Utc::now(),
        };

        let row = diff.to_row()?;
        let (stored, created) = self.db.with_conn(|conn| diff_repo::insert_or_get(conn, &row))?;
        if !created {
            tracing::debug!(diff_result_id = %stored.id, "Diff result already stored");
        }

        Ok(StageOutput::AlignmentDiff {
            alignment,
            diff: DiffResult::try_from(stored)?,
        })
    }

    pub fn summary(
        &self,
        task: &StageTask,
        progress: &dyn ProgressReporter,
    ) -> Result<StageOutput, PipelineError> {
        let request = {
            let _step = info_span!("load_inputs").entered();
            self.db.with_conn(|conn| {
                let job = job_repo::find_by_id(conn, &task.job_id)?;
                let diff = diff_repo::find_by_job(conn, &task.job_id)?;
                let new = drawing_repo::find_by_id(conn, &task.new_drawing_version_id)?;
                Ok((job, diff, new))
            })?
        };
        let (job, diff, new) = request;
        let job = job.ok_or_else(|| PipelineError::MissingInput(format!("job '{}'", task.job_id)))?;
        if task.old_drawing_version_id.is_some() && diff.is_none() {
            return Err(PipelineError::MissingInput(format!(
                "diff result of job '{}'",
                task.job_id
            )));
        }

        let request = SummaryRequest {
            job_id: task.job_id.clone(),
            project_id: job.project_id,
            old_drawing_version_id: task.old_drawing_version_id.clone(),
            new_drawing_version_id: task.new_drawing_version_id.clone(),
            diff: diff.map(DiffResult::try_from).transpose()?,
            // OCR never blocks the pipeline; use it only if it is already there.
            ocr_result_ref: new
                .filter(|dv| dv.ocr_status == "completed")
                .and_then(|dv| dv.ocr_result_ref),
        };

        let summary = {
            let _step = info_span!("summarize").entered();
            self.phase(progress, task, StagePhase::Summarizing);
            self.summarizer.summarize(&request)?
        };

        let _step = info_span!("persist").entered();
        self.phase(progress, task, StagePhase::Persisting);
        let result_ref = summary_key(&task.job_id);
        self.store
            .put(&result_ref, &serde_json::to_vec_pretty(&summary)?)?;

        Ok(StageOutput::Summary {
            result_ref,
            summary,
        })
    }
}
