use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;

use crate::stage::StageKind;

/// Phase of a stage task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StagePhase {
    Claimed,
    LoadingPages,
    Aligning,
    Summarizing,
    Persisting,
    Completed,
    Retrying,
    Failed,
    Skipped,
}

impl std::fmt::Display for StagePhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StagePhase::Claimed => write!(f, "Claimed"),
            StagePhase::LoadingPages => write!(f, "Loading pages"),
            StagePhase::Aligning => write!(f, "Aligning pages"),
            StagePhase::Summarizing => write!(f, "Summarizing changes"),
            StagePhase::Persisting => write!(f, "Persisting results"),
            StagePhase::Completed => write!(f, "Completed"),
            StagePhase::Retrying => write!(f, "Retrying"),
            StagePhase::Failed => write!(f, "Failed"),
            StagePhase::Skipped => write!(f, "Skipped"),
        }
    }
}

/// Emitted while a stage task runs.
#[derive(Debug, Clone, Serialize)]
pub struct ProgressEvent {
    pub job_id: String,
    pub stage_id: String,
    pub kind: StageKind,
    pub phase: StagePhase,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

impl ProgressEvent {
    pub fn new(job_id: &str, stage_id: &str, kind: StageKind, phase: StagePhase, message: &str) -> Self {
        Self {
            job_id: job_id.to_string(),
            stage_id: stage_id.to_string(),
            kind,
            phase,
            message: message.to_string(),
            timestamp: Utc::now(),
        }
    }
}

pub trait ProgressReporter: Send + Sync {
    fn report(&self, event: ProgressEvent);
}

/// No-op reporter for workers without subscribers and for tests.
pub struct NoopProgress;

impl ProgressReporter for NoopProgress {
    fn report(&self, _event: ProgressEvent) {}
}

/// Fans progress events out to any number of subscribers.
#[derive(Clone)]
pub struct BroadcastProgress {
    sender: Arc<broadcast::Sender<ProgressEvent>>,
}

impl BroadcastProgress {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender: Arc::new(sender),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ProgressEvent> {
        self.sender.subscribe()
    }
}

impl ProgressReporter for BroadcastProgress {
    fn report(&self, event: ProgressEvent) {
        // No active receivers is fine
        let _ = self.sender.send(event);
    }
}
