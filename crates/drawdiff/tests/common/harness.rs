//! Test harness for isolated pipeline runs.

#![allow(dead_code)]

use std::sync::Arc;

use image::GrayImage;
use tempfile::TempDir;

use drawdiff::config::Config;
use drawdiff::drawings::{register_page, DrawingVersion, NewPage};
use drawdiff::pipeline::{KeypointComparator, PageComparator};
use drawdiff::summary::StatsSummarizer;
use drawdiff::{
    Database, FileStorage, Job, NewJob, ObjectStore, StageKind, StageRunner, TaskOutcome,
};

use super::builders::png_bytes;

pub struct TestHarness {
    temp_dir: TempDir,
    pub config: Config,
    pub db: Database,
    pub store: Arc<FileStorage>,
    pub runner: StageRunner,
}

impl TestHarness {
    pub fn new() -> Self {
        let config = Self::test_config();
        let comparator = Arc::new(KeypointComparator::new(
            config.alignment.clone(),
            config.overlay.clone(),
        ));
        Self::with_comparator(config, comparator)
    }

    pub fn with_comparator(config: Config, comparator: Arc<dyn PageComparator>) -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let db = Database::open(&temp_dir.path().join("drawdiff.db"))
            .expect("Failed to open database");
        let store = Arc::new(FileStorage::new(temp_dir.path().join("objects")));
        let runner = StageRunner::new(
            &config,
            db.clone(),
            store.clone() as Arc<dyn ObjectStore>,
            comparator,
            Arc::new(StatsSummarizer),
        );
        Self {
            temp_dir,
            config,
            db,
            store,
            runner,
        }
    }

    /// Defaults with immediate retries.
    pub fn test_config() -> Config {
        let mut config = Config::default();
        config.retry.retry_backoff_secs = 0;
        config
    }

    pub fn register(&self, document_id: &str, page: &GrayImage) -> DrawingVersion {
        let bytes = png_bytes(page);
        let (version, _) = register_page(
            &self.db,
            self.store.as_ref(),
            &NewPage {
                document_id,
                page_number: 1,
                bytes: &bytes,
                extension: "png",
            },
        )
        .expect("Failed to register page");
        version
    }

    pub fn create_job(&self, old: Option<&DrawingVersion>, new: &DrawingVersion) -> Job {
        self.runner
            .orchestrator()
            .create_job(&NewJob {
                project_id: "project".to_string(),
                old_drawing_version_id: old.map(|v| v.id.clone()),
                new_drawing_version_id: new.id.clone(),
            })
            .expect("Failed to create job")
    }

    /// Polls every stage kind until all queues are empty.
    pub fn drain(&self) -> Vec<(StageKind, TaskOutcome)> {
        let mut outcomes = Vec::new();
        loop {
            let mut idle = true;
            for kind in StageKind::ALL {
                if let Some(outcome) = self.runner.poll(kind, "test-worker").expect("poll failed") {
                    outcomes.push((kind, outcome));
                    idle = false;
                }
            }
            if idle {
                return outcomes;
            }
        }
    }

    pub fn object(&self, key: &str) -> Vec<u8> {
        self.store.get(key).expect("Missing stored object")
    }
}
