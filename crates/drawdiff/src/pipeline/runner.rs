use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, info, info_span, warn};

use crate::config::Config;
use crate::db::Database;
use crate::orchestrator::{JobError, Orchestrator};
use crate::queue::{DeadLetter, Delivery, Received, StageQueue};
use crate::stage::{ClaimOutcome, FailOutcome, RetryPolicy, StageKind, StageMachine};
use crate::storage::{FileStorage, ObjectStore};
use crate::summary::{StatsSummarizer, Summarizer};

use super::error::PipelineError;
use super::handlers::{KeypointComparator, PageComparator, StageContext};
use super::progress::{NoopProgress, ProgressEvent, ProgressReporter, StagePhase};
use super::task::StageTask;

/// What happened to one delivery.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskOutcome {
    Completed { result_ref: String },
    /// The stage failed and will be attempted again.
    Retrying { retry_count: u32, error: String },
    /// The stage failed terminally; its message went to the dead-letter table.
    Failed { error: String },
    /// The job was cancelled before the stage started.
    Skipped,
    /// A duplicate delivery, or the worker lost the stage to another one.
    Noop,
    /// The queue gave up on the message before it reached a handler.
    DeadLettered { reason: String },
}

/// Executes stage deliveries end to end: claim, run, persist, acknowledge,
/// and fold the result into the job.
#[derive(Clone)]
pub struct StageRunner {
    queue: StageQueue,
    machine: StageMachine,
    orchestrator: Orchestrator,
    context: StageContext,
    progress: Arc<dyn ProgressReporter>,
}

impl StageRunner {
    /// Production constructor: filesystem storage, keypoint comparator and
    /// the statistics summarizer.
    pub fn from_config(config: &Config, db: Database) -> Self {
        let store: Arc<dyn ObjectStore> = Arc::new(FileStorage::new(&config.storage_root));
        let comparator = Arc::new(KeypointComparator::new(
            config.alignment.clone(),
            config.overlay.clone(),
        ));
        Self::new(config, db, store, comparator, Arc::new(StatsSummarizer))
    }

    /// Constructor with injected collaborators.
    pub fn new(
        config: &Config,
        db: Database,
        store: Arc<dyn ObjectStore>,
        comparator: Arc<dyn PageComparator>,
        summarizer: Arc<dyn Summarizer>,
    ) -> Self {
        let ack_deadline = Duration::from_secs(config.retry.ack_deadline_secs);
        let machine = StageMachine::new(ack_deadline, RetryPolicy::from_config(&config.retry));
        Self {
            queue: StageQueue::new(db.clone(), ack_deadline, config.retry.max_delivery_attempts),
            orchestrator: Orchestrator::new(db.clone(), machine.clone()),
            machine,
            context: StageContext {
                db,
                store,
                comparator,
                summarizer,
            },
            progress: Arc::new(NoopProgress),
        }
    }

    pub fn with_progress(mut self, progress: Arc<dyn ProgressReporter>) -> Self {
        self.progress = progress;
        self
    }

    pub fn queue(&self) -> &StageQueue {
        &self.queue
    }

    pub fn orchestrator(&self) -> &Orchestrator {
        &self.orchestrator
    }

    /// Receives and runs at most one task of `kind`. `None` when the queue
    /// had nothing visible.
    pub fn poll(&self, kind: StageKind, worker_id: &str) -> Result<Option<TaskOutcome>, PipelineError> {
        match self.queue.receive(kind, Utc::now())? {
            Received::Empty => Ok(None),
            Received::Message(delivery) => self.handle(&delivery, worker_id).map(Some),
            Received::DeadLettered(letter) => self.handle_dead_letter(&letter, worker_id).map(Some),
        }
    }

    /// Runs one delivery. Errors are infrastructure failures; the message is
    /// left in flight and comes back after the ack deadline. The job is
    /// always re-evaluated before a message is acked or dead-lettered.
    pub fn handle(&self, delivery: &Delivery, worker_id: &str) -> Result<TaskOutcome, PipelineError> {
        let task = &delivery.task;
        let _span = info_span!("stage",
            job_id = %task.job_id,
            stage_id = %task.stage_id,
            kind = %task.stage_kind,
            delivery = delivery.delivery_count
        )
        .entered();

        let claimed = self.context.db.with_conn(|conn| {
            self.machine.claim(conn, &task.stage_id, worker_id, Utc::now())
        })?;

        match claimed {
            ClaimOutcome::Missing => {
                debug!("Stage no longer exists; dropping message");
                self.queue.ack(delivery)?;
                return Ok(TaskOutcome::Noop);
            }
            ClaimOutcome::RedeliveryNoop { status } if status.is_terminal() => {
                // The previous owner may have died between finishing the
                // stage and updating the job.
                debug!(status = %status, "Duplicate delivery of a finished stage");
                self.recompute(&task.job_id)?;
                self.queue.ack(delivery)?;
                return Ok(TaskOutcome::Noop);
            }
            ClaimOutcome::RedeliveryNoop { status } => {
                // Another worker holds the stage. Look again once its lease
                // has run out, in case it died.
                debug!(status = %status, "Stage is held by another worker");
                self.queue.nack(delivery, self.machine.lease(), Utc::now())?;
                return Ok(TaskOutcome::Noop);
            }
            ClaimOutcome::Claimed(_) => {}
        }

        self.orchestrator.mark_running(&task.job_id).map_err(job_error)?;
        self.report(task, StagePhase::Claimed, "Stage claimed");

        if self.orchestrator.is_cancelled(&task.job_id).map_err(job_error)? {
            let skipped = self.context.db.with_conn(|conn| {
                self.machine
                    .skip_owned(conn, &task.stage_id, worker_id, "job cancelled", Utc::now())
            })?;
            self.recompute(&task.job_id)?;
            self.queue.ack(delivery)?;
            self.report(task, StagePhase::Skipped, "Job was cancelled");
            return Ok(if skipped {
                TaskOutcome::Skipped
            } else {
                TaskOutcome::Noop
            });
        }

        let result = match task.stage_kind {
            StageKind::AlignmentDiff => self.context.alignment_diff(task, self.progress.as_ref()),
            StageKind::Summary => self.context.summary(task, self.progress.as_ref()),
        };

        match result {
            Ok(output) => {
                let result_ref = output.result_ref().to_string();
                let completed = self.context.db.with_conn(|conn| {
                    self.machine
                        .complete(conn, &task.stage_id, worker_id, Some(&result_ref), Utc::now())
                })?;
                if !completed {
                    warn!("Lost the stage before completing it; output is left for the new owner");
                    return Ok(TaskOutcome::Noop);
                }
                self.recompute(&task.job_id)?;
                self.queue.ack(delivery)?;
                info!(result_ref = %result_ref, "Stage completed");
                self.report(task, StagePhase::Completed, &result_ref);
                Ok(TaskOutcome::Completed { result_ref })
            }
            Err(e) => self.handle_failure(delivery, worker_id, e),
        }
    }

    fn handle_failure(
        &self,
        delivery: &Delivery,
        worker_id: &str,
        failure: PipelineError,
    ) -> Result<TaskOutcome, PipelineError> {
        let task = &delivery.task;
        let error = failure.to_string();
        let retryable = failure.is_retryable();

        let outcome = self.context.db.with_conn(|conn| {
            self.machine
                .fail(conn, &task.stage_id, worker_id, &error, retryable, Utc::now())
        })?;

        match outcome {
            FailOutcome::Retrying { retry_count } => {
                warn!(retry_count, error = %error, "Stage failed; retrying");
                let backoff = self.machine.policy().backoff;
                if !self.queue.nack(delivery, backoff, Utc::now())? {
                    // The message was taken away from us; put the retry back.
                    self.queue.enqueue(task, Utc::now() + chrono_duration(backoff))?;
                }
                self.report(task, StagePhase::Retrying, &error);
                Ok(TaskOutcome::Retrying { retry_count, error })
            }
            FailOutcome::Exhausted { retry_count } => {
                warn!(retry_count, retryable, error = %error, "Stage failed terminally");
                self.recompute(&task.job_id)?;
                self.queue.dead_letter(delivery, &error, Utc::now())?;
                self.report(task, StagePhase::Failed, &error);
                Ok(TaskOutcome::Failed { error })
            }
            FailOutcome::Noop => {
                warn!(error = %error, "Lost the stage before recording its failure");
                Ok(TaskOutcome::Noop)
            }
        }
    }

    /// Terminally fails the stage of a message the queue gave up on.
    pub fn handle_dead_letter(
        &self,
        letter: &DeadLetter,
        worker_id: &str,
    ) -> Result<TaskOutcome, PipelineError> {
        let Some(task) = &letter.task else {
            warn!(message_id = %letter.message_id, "Dead-lettered message has no readable task");
            return Ok(TaskOutcome::DeadLettered {
                reason: letter.reason.clone(),
            });
        };

        let abandoned = self.context.db.with_conn(|conn| {
            self.machine
                .abandon(conn, &task.stage_id, worker_id, &letter.reason, Utc::now())
        })?;
        // The stage may already have been finished by an earlier owner.
        self.recompute(&task.job_id)?;
        if abandoned {
            self.report(task, StagePhase::Failed, &letter.reason);
        }
        Ok(TaskOutcome::DeadLettered {
            reason: letter.reason.clone(),
        })
    }

    /// Folds stage state into the job. Runs before the message is acked so
    /// that a failure here leaves the message to be redelivered.
    fn recompute(&self, job_id: &str) -> Result<(), PipelineError> {
        match self.orchestrator.on_stage_finished(job_id) {
            Ok(_) => Ok(()),
            Err(JobError::JobNotFound(_)) => {
                debug!(job_id = %job_id, "Job was deleted");
                Ok(())
            }
            Err(e) => Err(job_error(e)),
        }
    }

    fn report(&self, task: &StageTask, phase: StagePhase, message: &str) {
        self.progress.report(ProgressEvent::new(
            &task.job_id,
            &task.stage_id,
            task.stage_kind,
            phase,
            message,
        ));
    }
}

fn job_error(e: JobError) -> PipelineError {
    match e {
        JobError::Database(db) => PipelineError::Database(db),
        other => PipelineError::MissingInput(other.to_string()),
    }
}

fn chrono_duration(d: Duration) -> chrono::Duration {
    chrono::Duration::milliseconds(d.as_millis() as i64)
}
