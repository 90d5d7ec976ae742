//! Job orchestrator.
//!
//! Creates jobs with their stages, dispatches stage tasks once their
//! prerequisites are met, and folds stage outcomes into the job status.
//! The orchestrator holds no state of its own: every decision is taken
//! inside a transaction over the persisted Job and JobStage rows, so any
//! worker process may call it.

use std::fmt;

use chrono::{DateTime, Utc};
use rusqlite::Connection;
use serde::Serialize;
use thiserror::Error;

use crate::db::job_repo::{self, JobRow};
use crate::db::{diff_repo, drawing_repo, parse_timestamp, queue_repo, timestamp};
use crate::db::{Database, DatabaseError};
use crate::pipeline::{DiffResult, StageTask};
use crate::queue::StageQueue;
use crate::stage::{NewStage, Stage, StageKind, StageMachine, StageStatus};

pub const NO_PRIOR_VERSION: &str = "no prior drawing version";

#[derive(Error, Debug)]
pub enum JobError {
    #[error("Drawing version '{0}' does not exist")]
    DrawingVersionNotFound(String),

    #[error("Job '{0}' does not exist")]
    JobNotFound(String),

    #[error("Job '{job_id}' cannot be cancelled while {status}")]
    NotCancellable { job_id: String, status: JobStatus },

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Created,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Created => "created",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "created" => Some(JobStatus::Created),
            "running" => Some(JobStatus::Running),
            "completed" => Some(JobStatus::Completed),
            "failed" => Some(JobStatus::Failed),
            "cancelled" => Some(JobStatus::Cancelled),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Job {
    pub id: String,
    pub project_id: String,
    pub old_drawing_version_id: Option<String>,
    pub new_drawing_version_id: String,
    pub status: JobStatus,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub cancelled_at: Option<DateTime<Utc>>,
}

impl TryFrom<JobRow> for Job {
    type Error = DatabaseError;

    fn try_from(row: JobRow) -> Result<Self, Self::Error> {
        let status = JobStatus::parse(&row.status).ok_or_else(|| DatabaseError::Corrupt {
            entity: "job",
            id: row.id.clone(),
            reason: format!("unknown job status '{}'", row.status),
        })?;
        let optional = |value: &Option<String>| {
            value
                .as_deref()
                .map(|v| parse_timestamp("job", &row.id, v))
                .transpose()
        };

        Ok(Job {
            status,
            created_at: parse_timestamp("job", &row.id, &row.created_at)?,
            updated_at: parse_timestamp("job", &row.id, &row.updated_at)?,
            started_at: optional(&row.started_at)?,
            completed_at: optional(&row.completed_at)?,
            cancelled_at: optional(&row.cancelled_at)?,
            id: row.id,
            project_id: row.project_id,
            old_drawing_version_id: row.old_drawing_version_id,
            new_drawing_version_id: row.new_drawing_version_id,
            error: row.error,
        })
    }
}

/// A comparison request.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub project_id: String,
    /// `None` for the first version of a drawing.
    pub old_drawing_version_id: Option<String>,
    pub new_drawing_version_id: String,
}

/// A job with everything recorded for it.
#[derive(Debug, Clone, Serialize)]
pub struct JobView {
    pub job: Job,
    pub stages: Vec<Stage>,
    pub diff: Option<DiffResult>,
}

#[derive(Clone)]
pub struct Orchestrator {
    db: Database,
    machine: StageMachine,
}

impl Orchestrator {
    pub fn new(db: Database, machine: StageMachine) -> Self {
        Self { db, machine }
    }

    /// Persists the job and its stages and enqueues the first runnable stage,
    /// all in one transaction.
    pub fn create_job(&self, request: &NewJob) -> Result<Job, JobError> {
        let now = Utc::now();
        let job = self.db.with_tx(|tx| {
            let versions = request
                .old_drawing_version_id
                .iter()
                .chain(std::iter::once(&request.new_drawing_version_id));
            for id in versions {
                if drawing_repo::find_by_id(tx, id)?.is_none() {
                    return Ok(Err(JobError::DrawingVersionNotFound(id.clone())));
                }
            }

            let stamp = timestamp(now);
            let row = JobRow {
                id: uuid::Uuid::new_v4().to_string(),
                project_id: request.project_id.clone(),
                old_drawing_version_id: request.old_drawing_version_id.clone(),
                new_drawing_version_id: request.new_drawing_version_id.clone(),
                status: JobStatus::Created.as_str().to_string(),
                error: None,
                created_at: stamp.clone(),
                updated_at: stamp,
                started_at: None,
                completed_at: None,
                cancelled_at: None,
            };
            job_repo::insert(tx, &row)?;

            let skip_alignment = request
                .old_drawing_version_id
                .is_none()
                .then(|| NO_PRIOR_VERSION.to_string());
            for (kind, skip_reason) in [
                (StageKind::AlignmentDiff, skip_alignment),
                (StageKind::Summary, None),
            ] {
                let stage = NewStage {
                    job_id: row.id.clone(),
                    kind,
                    drawing_version_id: Some(request.new_drawing_version_id.clone()),
                    skip_reason,
                };
                self.machine.create(tx, &stage, now)?;
            }

            let job = Job::try_from(row)?;
            self.dispatch_runnable(tx, &job, now)?;
            Ok(Ok(job))
        })??;

        tracing::info!(
            job_id = %job.id,
            project_id = %job.project_id,
            has_old = job.old_drawing_version_id.is_some(),
            "Created job"
        );
        Ok(job)
    }

    /// Enqueues every pending, undispatched stage whose prerequisites are
    /// done. Returns how many tasks were enqueued.
    fn dispatch_runnable(
        &self,
        conn: &Connection,
        job: &Job,
        now: DateTime<Utc>,
    ) -> Result<usize, DatabaseError> {
        if job.status.is_terminal() {
            return Ok(0);
        }

        let stages = self.machine.list_for_job(conn, &job.id)?;
        let finished = |kind: StageKind| {
            stages.iter().any(|s| {
                s.kind == kind
                    && matches!(s.status, StageStatus::Completed | StageStatus::Skipped)
            })
        };

        let mut dispatched = 0;
        for stage in &stages {
            if stage.status != StageStatus::Pending || stage.dispatched {
                continue;
            }
            let ready = match stage.kind {
                StageKind::AlignmentDiff => true,
                StageKind::Summary => finished(StageKind::AlignmentDiff),
            };
            if !ready || !self.machine.mark_dispatched(conn, &stage.id, now)? {
                continue;
            }

            let task = StageTask {
                job_id: job.id.clone(),
                stage_id: stage.id.clone(),
                stage_kind: stage.kind,
                old_drawing_version_id: job.old_drawing_version_id.clone(),
                new_drawing_version_id: job.new_drawing_version_id.clone(),
            };
            StageQueue::enqueue_in(conn, &task, now)?;
            dispatched += 1;
        }
        Ok(dispatched)
    }

    /// Moves the job from `created` to `running`. No-op otherwise.
    pub fn mark_running(&self, job_id: &str) -> Result<bool, JobError> {
        let now = timestamp(Utc::now());
        Ok(self.db.with_conn(|conn| job_repo::mark_running(conn, job_id, &now))?)
    }

    /// Re-evaluates the job after one of its stages changed state. Returns
    /// the job's status afterwards.
    pub fn on_stage_finished(&self, job_id: &str) -> Result<JobStatus, JobError> {
        let now = Utc::now();
        let status = self.db.with_tx(|tx| {
            let Some(row) = job_repo::find_by_id(tx, job_id)? else {
                return Ok(Err(JobError::JobNotFound(job_id.to_string())));
            };
            let job = Job::try_from(row)?;
            if job.status.is_terminal() {
                return Ok(Ok(job.status));
            }

            let stages = self.machine.list_for_job(tx, job_id)?;
            let stamp = timestamp(now);

            if let Some(failed) = stages.iter().find(|s| s.status == StageStatus::Failed) {
                let error = format!(
                    "{} stage failed: {}",
                    failed.kind,
                    failed.error.as_deref().unwrap_or("unknown error")
                );
                job_repo::finish(tx, job_id, JobStatus::Failed.as_str(), Some(&error), &stamp)?;
                self.machine.skip_pending(tx, job_id, "job failed", now)?;
                return Ok(Ok(JobStatus::Failed));
            }

            let done = stages
                .iter()
                .all(|s| matches!(s.status, StageStatus::Completed | StageStatus::Skipped));
            if done {
                job_repo::finish(tx, job_id, JobStatus::Completed.as_str(), None, &stamp)?;
                return Ok(Ok(JobStatus::Completed));
            }

            self.dispatch_runnable(tx, &job, now)?;
            Ok(Ok(job.status))
        })??;

        if status.is_terminal() {
            tracing::info!(job_id = %job_id, status = %status, "Job finished");
        }
        Ok(status)
    }

    /// Cancels a `created` or `running` job and skips its unstarted stages.
    /// Stages already in progress run to completion without advancing the job.
    pub fn cancel(&self, job_id: &str) -> Result<Job, JobError> {
        let now = Utc::now();
        let job = self.db.with_tx(|tx| {
            let Some(row) = job_repo::find_by_id(tx, job_id)? else {
                return Ok(Err(JobError::JobNotFound(job_id.to_string())));
            };
            if !job_repo::cancel(tx, job_id, &timestamp(now))? {
                let job = Job::try_from(row)?;
                return Ok(Err(JobError::NotCancellable {
                    job_id: job.id,
                    status: job.status,
                }));
            }
            let skipped = self.machine.skip_pending(tx, job_id, "job cancelled", now)?;
            log::debug!("Skipped {} pending stages of cancelled job {}", skipped, job_id);

            match job_repo::find_by_id(tx, job_id)? {
                Some(row) => Ok(Ok(Job::try_from(row)?)),
                None => Ok(Err(JobError::JobNotFound(job_id.to_string()))),
            }
        })??;

        tracing::info!(job_id = %job_id, "Cancelled job");
        Ok(job)
    }

    pub fn job(&self, job_id: &str) -> Result<Job, JobError> {
        self.db
            .with_conn(|conn| job_repo::find_by_id(conn, job_id)?.map(Job::try_from).transpose())?
            .ok_or_else(|| JobError::JobNotFound(job_id.to_string()))
    }

    pub fn is_cancelled(&self, job_id: &str) -> Result<bool, JobError> {
        Ok(self.job(job_id)?.status == JobStatus::Cancelled)
    }

    pub fn job_view(&self, job_id: &str) -> Result<JobView, JobError> {
        let view = self.db.with_conn(|conn| {
            let Some(row) = job_repo::find_by_id(conn, job_id)? else {
                return Ok(None);
            };
            let job = Job::try_from(row)?;
            let stages = self.machine.list_for_job(conn, job_id)?;
            let diff = diff_repo::find_by_job(conn, job_id)?
                .map(DiffResult::try_from)
                .transpose()?;
            Ok(Some(JobView { job, stages, diff }))
        })?;
        view.ok_or_else(|| JobError::JobNotFound(job_id.to_string()))
    }

    /// Deletes a job with its stages, diff result, manual overlays and queued
    /// messages. Stored objects are left in place.
    pub fn delete_job(&self, job_id: &str) -> Result<bool, JobError> {
        let deleted = self.db.with_tx(|tx| {
            let purged = queue_repo::delete_for_job(tx, job_id)?;
            if purged > 0 {
                log::debug!("Purged {} queued messages of job {}", purged, job_id);
            }
            job_repo::delete(tx, job_id)
        })?;
        if deleted {
            tracing::info!(job_id = %job_id, "Deleted job");
        }
        Ok(deleted)
    }
}
