//! Stage state machine.
//!
//! ```text
//! pending ──claim──▶ in_progress ──▶ completed
//!    │                   │ ├───────▶ skipped
//!    │                   │ └───────▶ failed (terminal)
//!    │                   └─ retryable failure, retries left ─▶ pending
//!    └──────────────skip────────────▶ skipped
//! ```
//!
//! Every transition is a compare-and-set on the persisted row. Workers hold
//! a stage through an ownership lease equal to the queue's ack deadline; a
//! redelivered message finds the stage owned by someone else (or already
//! finished) and becomes a no-op.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rusqlite::Connection;
use serde::{Deserialize, Serialize};

use crate::config::RetryConfig;
use crate::db::stage_repo::{self, StageRow};
use crate::db::{parse_timestamp, timestamp, DatabaseError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageKind {
    AlignmentDiff,
    Summary,
}

impl StageKind {
    pub const ALL: [StageKind; 2] = [StageKind::AlignmentDiff, StageKind::Summary];

    pub fn as_str(&self) -> &'static str {
        match self {
            StageKind::AlignmentDiff => "alignment_diff",
            StageKind::Summary => "summary",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "alignment_diff" => Some(StageKind::AlignmentDiff),
            "summary" => Some(StageKind::Summary),
            _ => None,
        }
    }
}

impl fmt::Display for StageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
    Skipped,
}

impl StageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            StageStatus::Pending => "pending",
            StageStatus::InProgress => "in_progress",
            StageStatus::Completed => "completed",
            StageStatus::Failed => "failed",
            StageStatus::Skipped => "skipped",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(StageStatus::Pending),
            "in_progress" => Some(StageStatus::InProgress),
            "completed" => Some(StageStatus::Completed),
            "failed" => Some(StageStatus::Failed),
            "skipped" => Some(StageStatus::Skipped),
            _ => None,
        }
    }

    /// Whether the state machine allows moving from `self` to `next`.
    ///
    /// A stored `failed` status is always terminal: a retryable failure with
    /// retries left passes through `failed` and lands on `pending` in the
    /// same write.
    pub fn can_transition_to(&self, next: StageStatus) -> bool {
        use StageStatus::*;
        matches!(
            (self, next),
            (Pending, InProgress)
                | (Pending, Skipped)
                | (InProgress, InProgress)
                | (InProgress, Completed)
                | (InProgress, Failed)
                | (InProgress, Skipped)
                | (Failed, Pending)
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            StageStatus::Completed | StageStatus::Failed | StageStatus::Skipped
        )
    }
}

impl fmt::Display for StageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A persisted JobStage.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Stage {
    pub id: String,
    pub job_id: String,
    pub kind: StageKind,
    pub drawing_version_id: Option<String>,
    pub status: StageStatus,
    pub retry_count: u32,
    pub max_retries: u32,
    pub owner: Option<String>,
    pub result_ref: Option<String>,
    pub error: Option<String>,
    pub dispatched: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl TryFrom<StageRow> for Stage {
    type Error = DatabaseError;

    fn try_from(row: StageRow) -> Result<Self, Self::Error> {
        let corrupt = |reason: String| DatabaseError::Corrupt {
            entity: "job_stage",
            id: row.id.clone(),
            reason,
        };
        let kind = StageKind::parse(&row.kind)
            .ok_or_else(|| corrupt(format!("unknown stage kind '{}'", row.kind)))?;
        let status = StageStatus::parse(&row.status)
            .ok_or_else(|| corrupt(format!("unknown stage status '{}'", row.status)))?;
        let optional = |value: &Option<String>| {
            value
                .as_deref()
                .map(|v| parse_timestamp("job_stage", &row.id, v))
                .transpose()
        };

        Ok(Stage {
            kind,
            status,
            retry_count: row.retry_count,
            max_retries: row.max_retries,
            dispatched: row.dispatched_at.is_some(),
            created_at: parse_timestamp("job_stage", &row.id, &row.created_at)?,
            updated_at: parse_timestamp("job_stage", &row.id, &row.updated_at)?,
            started_at: optional(&row.started_at)?,
            completed_at: optional(&row.completed_at)?,
            id: row.id,
            job_id: row.job_id,
            drawing_version_id: row.drawing_version_id,
            owner: row.owner,
            result_ref: row.result_ref,
            error: row.error,
        })
    }
}

/// How often a failing stage is retried and how long to wait in between.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub backoff: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &RetryConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            backoff: Duration::from_secs(config.retry_backoff_secs),
        }
    }
}

/// A stage to create for a job.
#[derive(Debug, Clone)]
pub struct NewStage {
    pub job_id: String,
    pub kind: StageKind,
    pub drawing_version_id: Option<String>,
    /// Create the stage already `skipped` with this reason.
    pub skip_reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ClaimOutcome {
    Claimed(Stage),
    /// The stage is finished or held by a live owner. The delivery is a duplicate.
    RedeliveryNoop { status: StageStatus },
    /// The stage no longer exists (its job was deleted).
    Missing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailOutcome {
    /// Back to `pending` for another attempt.
    Retrying { retry_count: u32 },
    /// Terminally `failed`.
    Exhausted { retry_count: u32 },
    /// The caller does not hold the stage; nothing changed.
    Noop,
}

/// Compare-and-set transitions over `job_stages`.
#[derive(Debug, Clone)]
pub struct StageMachine {
    lease: Duration,
    policy: RetryPolicy,
}

impl StageMachine {
    pub fn new(lease: Duration, policy: RetryPolicy) -> Self {
        Self { lease, policy }
    }

    pub fn lease(&self) -> Duration {
        self.lease
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    /// Creates a stage, or returns the existing one for the same
    /// `(job, kind, drawing version)` scope. The flag reports creation.
    pub fn create(
        &self,
        conn: &Connection,
        stage: &NewStage,
        now: DateTime<Utc>,
    ) -> Result<(Stage, bool), DatabaseError> {
        let now = timestamp(now);
        let skipped = stage.skip_reason.is_some();
        let row = StageRow {
            id: uuid::Uuid::new_v4().to_string(),
            job_id: stage.job_id.clone(),
            kind: stage.kind.as_str().to_string(),
            drawing_version_id: stage.drawing_version_id.clone(),
            status: if skipped {
                StageStatus::Skipped
            } else {
                StageStatus::Pending
            }
            .as_str()
            .to_string(),
            retry_count: 0,
            max_retries: self.policy.max_retries,
            owner: None,
            claimed_until: None,
            dispatched_at: None,
            result_ref: None,
            error: stage.skip_reason.clone(),
            created_at: now.clone(),
            updated_at: now.clone(),
            started_at: None,
            completed_at: if skipped { Some(now) } else { None },
        };

        let (stored, created) = stage_repo::insert_or_get(conn, &row)?;
        if !created {
            log::debug!(
                "Stage {} for job {} already exists as {}",
                stage.kind,
                stage.job_id,
                stored.id
            );
        }
        Ok((Stage::try_from(stored)?, created))
    }

    pub fn get(&self, conn: &Connection, stage_id: &str) -> Result<Option<Stage>, DatabaseError> {
        stage_repo::find_by_id(conn, stage_id)?
            .map(Stage::try_from)
            .transpose()
    }

    pub fn list_for_job(&self, conn: &Connection, job_id: &str) -> Result<Vec<Stage>, DatabaseError> {
        stage_repo::list_for_job(conn, job_id)?
            .into_iter()
            .map(Stage::try_from)
            .collect()
    }

    /// Takes ownership of a stage for `worker` until `now + lease`.
    pub fn claim(
        &self,
        conn: &Connection,
        stage_id: &str,
        worker: &str,
        now: DateTime<Utc>,
    ) -> Result<ClaimOutcome, DatabaseError> {
        let Some(current) = self.get(conn, stage_id)? else {
            return Ok(ClaimOutcome::Missing);
        };
        if !current.status.can_transition_to(StageStatus::InProgress) {
            return Ok(ClaimOutcome::RedeliveryNoop {
                status: current.status,
            });
        }

        let now_ms = now.timestamp_millis();
        let lease_until = now_ms + self.lease.as_millis() as i64;
        if !stage_repo::claim(conn, stage_id, worker, now_ms, lease_until, &timestamp(now))? {
            return Ok(ClaimOutcome::RedeliveryNoop {
                status: current.status,
            });
        }

        match self.get(conn, stage_id)? {
            Some(stage) => Ok(ClaimOutcome::Claimed(stage)),
            None => Ok(ClaimOutcome::Missing),
        }
    }

    pub fn complete(
        &self,
        conn: &Connection,
        stage_id: &str,
        worker: &str,
        result_ref: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<bool, DatabaseError> {
        stage_repo::complete(conn, stage_id, worker, result_ref, &timestamp(now))
    }

    pub fn fail(
        &self,
        conn: &Connection,
        stage_id: &str,
        worker: &str,
        error: &str,
        retryable: bool,
        now: DateTime<Utc>,
    ) -> Result<FailOutcome, DatabaseError> {
        let Some((status, retry_count)) =
            stage_repo::fail(conn, stage_id, worker, error, retryable, &timestamp(now))?
        else {
            return Ok(FailOutcome::Noop);
        };

        match StageStatus::parse(&status) {
            Some(StageStatus::Pending) => Ok(FailOutcome::Retrying { retry_count }),
            Some(StageStatus::Failed) => Ok(FailOutcome::Exhausted { retry_count }),
            _ => Err(DatabaseError::Corrupt {
                entity: "job_stage",
                id: stage_id.to_string(),
                reason: format!("unexpected status '{}' after failure", status),
            }),
        }
    }

    pub fn skip_owned(
        &self,
        conn: &Connection,
        stage_id: &str,
        worker: &str,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, DatabaseError> {
        stage_repo::skip_owned(conn, stage_id, worker, reason, &timestamp(now))
    }

    pub fn skip_pending(
        &self,
        conn: &Connection,
        job_id: &str,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<usize, DatabaseError> {
        stage_repo::skip_pending(conn, job_id, reason, &timestamp(now))
    }

    /// Terminally fails a stage whose message will never be delivered again.
    /// The stage is claimed first, so a live owner keeps it.
    pub fn abandon(
        &self,
        conn: &Connection,
        stage_id: &str,
        worker: &str,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, DatabaseError> {
        match self.claim(conn, stage_id, worker, now)? {
            ClaimOutcome::Claimed(_) => Ok(matches!(
                self.fail(conn, stage_id, worker, reason, false, now)?,
                FailOutcome::Exhausted { .. }
            )),
            ClaimOutcome::RedeliveryNoop { .. } | ClaimOutcome::Missing => Ok(false),
        }
    }

    pub fn mark_dispatched(
        &self,
        conn: &Connection,
        stage_id: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, DatabaseError> {
        stage_repo::mark_dispatched(conn, stage_id, &timestamp(now))
    }
}
