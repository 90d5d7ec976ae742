//! End-to-end runs of the stage pipeline against a real database and
//! object store.

mod common;

use std::sync::Arc;
use std::thread;

use common::*;
use drawdiff::imaging::Quadrant;
use drawdiff::manual_overlay;
use drawdiff::pipeline::StageTask;
use drawdiff::storage::summary_key;
use drawdiff::{JobStatus, ObjectStore, StageKind, StageStatus, TaskOutcome};

fn completed(outcomes: &[(StageKind, TaskOutcome)], kind: StageKind) -> usize {
    outcomes
        .iter()
        .filter(|(k, o)| *k == kind && matches!(o, TaskOutcome::Completed { .. }))
        .count()
}

#[test]
fn test_added_block_is_detected_and_summarized() {
    let harness = TestHarness::new();
    let old = harness.register("doc", &base_drawing());
    let new = harness.register("doc", &revised_drawing());
    let job = harness.create_job(Some(&old), &new);

    let outcomes = harness.drain();
    assert_eq!(completed(&outcomes, StageKind::AlignmentDiff), 1);
    assert_eq!(completed(&outcomes, StageKind::Summary), 1);

    let view = harness.runner.orchestrator().job_view(&job.id).unwrap();
    assert_eq!(view.job.status, JobStatus::Completed);
    assert!(view
        .stages
        .iter()
        .all(|s| s.status == StageStatus::Completed));

    let diff = view.diff.expect("diff result persisted");
    assert!(diff.confidence > 0.9, "confidence = {}", diff.confidence);
    assert!(diff.changes_detected);
    assert_eq!(diff.change_count, 1);
    assert_eq!(diff.stats.totals.removed_pixels, 0);
    assert!(diff.stats.totals.unchanged_pixels > 0);

    let region = &diff.stats.regions[0];
    assert_eq!(region.quadrant, Quadrant::NorthEast);
    assert_eq!(region.removed_pixels, 0);
    assert!(region.added_pixels > 12_000);
    let (x0, y0, x1, y1) = ADDITION;
    assert!(region.bbox.contains(x0 + 1, y0 + 1));
    assert!(region.bbox.contains(x1 - 2, y1 - 2));
    let (dx0, dy0, dx1, dy1) = DETAIL;
    assert!(!region.bbox.contains((dx0 + dx1) / 2, (dy0 + dy1) / 2));

    let overlay = image::load_from_memory(&harness.object(&diff.overlay_ref)).unwrap();
    assert_eq!((overlay.width(), overlay.height()), (PAGE_WIDTH, PAGE_HEIGHT));
    assert!(harness.store.exists(&diff.aligned_ref).unwrap());

    let summary: serde_json::Value =
        serde_json::from_slice(&harness.object(&summary_key(&job.id))).unwrap();
    assert_eq!(summary["structured"]["change_count"], 1);
    assert_eq!(summary["structured"]["first_version"], false);
    assert!(summary["text"].as_str().unwrap().contains("upper right"));
}

#[test]
fn test_sparse_rectangles_compare_with_full_confidence() {
    let harness = TestHarness::new();
    let old = harness.register("sheet", &sparse_drawing());
    let new = harness.register("sheet", &sparse_revision());
    let job = harness.create_job(Some(&old), &new);

    harness.drain();

    let view = harness.runner.orchestrator().job_view(&job.id).unwrap();
    assert_eq!(view.job.status, JobStatus::Completed);

    let diff = view.diff.expect("diff result persisted");
    assert!(diff.confidence > 0.99, "confidence = {}", diff.confidence);
    assert!(diff.changes_detected);
    assert_eq!(diff.change_count, 1);
    assert_eq!(diff.stats.totals.removed_pixels, 0);

    let region = &diff.stats.regions[0];
    let (x0, y0, x1, y1) = ANNEX;
    assert_eq!(region.added_pixels, u64::from((x1 - x0) * (y1 - y0)));
    assert!(region.bbox.contains(x0, y0));
    assert!(region.bbox.contains(x1 - 1, y1 - 1));
    let (fx0, fy0, fx1, fy1) = FRAME;
    assert!(!region.bbox.contains((fx0 + fx1) / 2, (fy0 + fy1) / 2));
}

#[test]
fn test_first_version_skips_alignment() {
    let harness = TestHarness::new();
    let new = harness.register("doc", &base_drawing());
    let job = harness.create_job(None, &new);

    let outcomes = harness.drain();
    assert_eq!(outcomes.len(), 1);
    assert_eq!(completed(&outcomes, StageKind::Summary), 1);

    let view = harness.runner.orchestrator().job_view(&job.id).unwrap();
    assert_eq!(view.job.status, JobStatus::Completed);
    assert!(view.diff.is_none());
    let alignment = view
        .stages
        .iter()
        .find(|s| s.kind == StageKind::AlignmentDiff)
        .unwrap();
    assert_eq!(alignment.status, StageStatus::Skipped);

    let summary: serde_json::Value =
        serde_json::from_slice(&harness.object(&summary_key(&job.id))).unwrap();
    assert_eq!(summary["structured"]["first_version"], true);
}

#[test]
fn test_blank_pages_fail_the_job() {
    let harness = TestHarness::new();
    let old = harness.register("doc", &blank_drawing());
    let mut blank = blank_drawing();
    fill_rect(&mut blank, (10, 10, 12, 12), 0);
    let new = harness.register("doc", &blank);
    let job = harness.create_job(Some(&old), &new);

    let outcomes = harness.drain();
    let retries = outcomes
        .iter()
        .filter(|(_, o)| matches!(o, TaskOutcome::Retrying { .. }))
        .count();
    assert_eq!(retries as u32, harness.config.retry.max_retries);
    assert!(matches!(
        outcomes.last(),
        Some((StageKind::AlignmentDiff, TaskOutcome::Failed { .. }))
    ));

    let view = harness.runner.orchestrator().job_view(&job.id).unwrap();
    assert_eq!(view.job.status, JobStatus::Failed);
    assert!(view.job.error.unwrap().contains("Insufficient features"));
    let summary = view
        .stages
        .iter()
        .find(|s| s.kind == StageKind::Summary)
        .unwrap();
    assert_eq!(summary.status, StageStatus::Skipped);
    assert_eq!(
        harness
            .runner
            .queue()
            .dead_letters(StageKind::AlignmentDiff)
            .unwrap()
            .len(),
        1
    );
}

#[test]
fn test_cancelled_job_does_not_run() {
    let harness = TestHarness::new();
    let old = harness.register("doc", &base_drawing());
    let new = harness.register("doc", &revised_drawing());
    let job = harness.create_job(Some(&old), &new);

    let cancelled = harness.runner.orchestrator().cancel(&job.id).unwrap();
    assert_eq!(cancelled.status, JobStatus::Cancelled);

    let outcomes = harness.drain();
    assert_eq!(outcomes, vec![(StageKind::AlignmentDiff, TaskOutcome::Noop)]);

    let view = harness.runner.orchestrator().job_view(&job.id).unwrap();
    assert_eq!(view.job.status, JobStatus::Cancelled);
    assert!(view.diff.is_none());
    assert!(view
        .stages
        .iter()
        .all(|s| s.status == StageStatus::Skipped));
}

#[test]
fn test_duplicate_delivery_runs_stage_once() {
    let harness = Arc::new(TestHarness::new());
    let old = harness.register("doc", &base_drawing());
    let new = harness.register("doc", &revised_drawing());
    let job = harness.create_job(Some(&old), &new);

    let view = harness.runner.orchestrator().job_view(&job.id).unwrap();
    let stage = view
        .stages
        .iter()
        .find(|s| s.kind == StageKind::AlignmentDiff)
        .unwrap();
    let duplicate = StageTask {
        job_id: job.id.clone(),
        stage_id: stage.id.clone(),
        stage_kind: StageKind::AlignmentDiff,
        old_drawing_version_id: Some(old.id.clone()),
        new_drawing_version_id: new.id.clone(),
    };
    harness
        .runner
        .queue()
        .enqueue(&duplicate, chrono::Utc::now())
        .unwrap();

    let handles: Vec<_> = (0..2)
        .map(|n| {
            let harness = Arc::clone(&harness);
            thread::spawn(move || {
                harness
                    .runner
                    .poll(StageKind::AlignmentDiff, &format!("worker-{}", n))
                    .unwrap()
                    .unwrap()
            })
        })
        .collect();
    let outcomes: Vec<TaskOutcome> = handles.into_iter().map(|h| h.join().unwrap()).collect();

    let done = outcomes
        .iter()
        .filter(|o| matches!(o, TaskOutcome::Completed { .. }))
        .count();
    assert_eq!(done, 1, "outcomes: {:?}", outcomes);
    assert!(outcomes.contains(&TaskOutcome::Noop));

    // The summary still runs exactly once.
    let rest = harness.drain();
    assert_eq!(completed(&rest, StageKind::Summary), 1);
    assert_eq!(completed(&rest, StageKind::AlignmentDiff), 0);

    let view = harness.runner.orchestrator().job_view(&job.id).unwrap();
    assert_eq!(view.job.status, JobStatus::Completed);
}

#[test]
fn test_manual_overlay_replaces_generated_overlay() {
    let harness = TestHarness::new();
    let old = harness.register("doc", &base_drawing());
    let new = harness.register("doc", &revised_drawing());
    let job = harness.create_job(Some(&old), &new);
    harness.drain();

    let diff = harness
        .runner
        .orchestrator()
        .job_view(&job.id)
        .unwrap()
        .diff
        .unwrap();
    assert_eq!(
        manual_overlay::active_overlay_ref(&harness.db, &diff.id).unwrap(),
        diff.overlay_ref
    );

    let edited = png_bytes(&revised_drawing());
    let first = manual_overlay::create_version(
        &harness.db,
        harness.store.as_ref(),
        &diff.id,
        &edited,
        Some("reviewer"),
    )
    .unwrap();
    let second = manual_overlay::create_version(
        &harness.db,
        harness.store.as_ref(),
        &diff.id,
        &edited,
        Some("reviewer"),
    )
    .unwrap();

    assert_eq!(second.version, first.version + 1);
    assert_eq!(second.parent_overlay_id.as_deref(), Some(first.id.as_str()));
    assert_eq!(
        manual_overlay::active_overlay_ref(&harness.db, &diff.id).unwrap(),
        second.overlay_ref
    );
    let history = manual_overlay::history(&harness.db, &diff.id).unwrap();
    assert_eq!(history.len(), 2);
    assert!(history.iter().filter(|o| o.is_active).count() == 1);
}
