//! Per-stage-kind task queue with at-least-once delivery.
//!
//! Messages live in the relational store next to the records they refer to,
//! so enqueueing can share a transaction with the stage it dispatches.
//! A received message stays invisible for the ack deadline; if it is not
//! acked by then it is delivered again. A message received more than
//! `max_delivery_attempts` times goes to the dead-letter table instead.

use std::time::Duration;

use chrono::{DateTime, Utc};
use rusqlite::Connection;

use crate::db::queue_repo::{self, DeadLetterRow, MessageRow};
use crate::db::{parse_timestamp, timestamp, Database, DatabaseError};
use crate::pipeline::StageTask;
use crate::stage::StageKind;

/// One delivery of a message. Acks and nacks are only honoured while
/// `receipt` is the message's current receipt.
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    pub message_id: String,
    pub receipt: String,
    pub delivery_count: u32,
    pub task: StageTask,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DeadLetter {
    pub message_id: String,
    pub kind: String,
    pub job_id: String,
    /// `None` when the payload could not be decoded.
    pub task: Option<StageTask>,
    pub delivery_count: u32,
    pub reason: String,
    pub dead_lettered_at: DateTime<Utc>,
}

impl TryFrom<DeadLetterRow> for DeadLetter {
    type Error = DatabaseError;

    fn try_from(row: DeadLetterRow) -> Result<Self, Self::Error> {
        Ok(DeadLetter {
            task: serde_json::from_str(&row.payload).ok(),
            dead_lettered_at: parse_timestamp("dead_letter", &row.id, &row.dead_lettered_at)?,
            message_id: row.id,
            kind: row.queue,
            job_id: row.job_id,
            delivery_count: row.delivery_count,
            reason: row.reason,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Received {
    Message(Delivery),
    /// The message exceeded its delivery limit (or was unreadable) and was
    /// moved to the dead-letter table instead of being delivered.
    DeadLettered(DeadLetter),
    Empty,
}

#[derive(Clone)]
pub struct StageQueue {
    db: Database,
    ack_deadline: Duration,
    max_delivery_attempts: u32,
}

impl StageQueue {
    pub fn new(db: Database, ack_deadline: Duration, max_delivery_attempts: u32) -> Self {
        Self {
            db,
            ack_deadline,
            max_delivery_attempts,
        }
    }

    pub fn ack_deadline(&self) -> Duration {
        self.ack_deadline
    }

    pub fn enqueue(&self, task: &StageTask, now: DateTime<Utc>) -> Result<String, DatabaseError> {
        self.db.with_conn(|conn| Self::enqueue_in(conn, task, now))
    }

    /// Enqueues on an existing connection, typically inside the transaction
    /// that created or retried the stage.
    pub fn enqueue_in(
        conn: &Connection,
        task: &StageTask,
        now: DateTime<Utc>,
    ) -> Result<String, DatabaseError> {
        let message = MessageRow {
            id: uuid::Uuid::new_v4().to_string(),
            queue: task.stage_kind.as_str().to_string(),
            job_id: task.job_id.clone(),
            payload: serde_json::to_string(task)?,
            delivery_count: 0,
            visible_at: now.timestamp_millis(),
            receipt: None,
            enqueued_at: timestamp(now),
        };
        queue_repo::insert(conn, &message)?;
        log::debug!(
            "Enqueued {} task for stage {} as message {}",
            task.stage_kind,
            task.stage_id,
            message.id
        );
        Ok(message.id)
    }

    /// Takes the next visible message of `kind`.
    pub fn receive(&self, kind: StageKind, now: DateTime<Utc>) -> Result<Received, DatabaseError> {
        let now_ms = now.timestamp_millis();
        let visible_until = now_ms + self.ack_deadline.as_millis() as i64;
        let receipt = uuid::Uuid::new_v4().to_string();

        self.db.with_tx(|tx| {
            let Some(row) = queue_repo::receive(tx, kind.as_str(), now_ms, visible_until, &receipt)?
            else {
                return Ok(Received::Empty);
            };

            let reason = match serde_json::from_str::<StageTask>(&row.payload) {
                Ok(task) if row.delivery_count <= self.max_delivery_attempts => {
                    return Ok(Received::Message(Delivery {
                        message_id: row.id,
                        receipt,
                        delivery_count: row.delivery_count,
                        task,
                    }));
                }
                Ok(_) => format!(
                    "exceeded {} delivery attempts",
                    self.max_delivery_attempts
                ),
                Err(e) => format!("unreadable payload: {}", e),
            };

            let letter = Self::bury(tx, &row, &receipt, &reason, now)?;
            Ok(Received::DeadLettered(letter))
        })
    }

    fn bury(
        conn: &Connection,
        row: &MessageRow,
        receipt: &str,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<DeadLetter, DatabaseError> {
        queue_repo::move_to_dead_letter(conn, &row.id, receipt, reason, &timestamp(now))?;
        log::warn!(
            "Dead-lettered {} message {} for job {} after {} deliveries: {}",
            row.queue,
            row.id,
            row.job_id,
            row.delivery_count,
            reason
        );
        Ok(DeadLetter {
            message_id: row.id.clone(),
            kind: row.queue.clone(),
            job_id: row.job_id.clone(),
            task: serde_json::from_str(&row.payload).ok(),
            delivery_count: row.delivery_count,
            reason: reason.to_string(),
            dead_lettered_at: now,
        })
    }

    /// Removes the message. Returns false if the delivery is stale.
    pub fn ack(&self, delivery: &Delivery) -> Result<bool, DatabaseError> {
        self.db
            .with_conn(|conn| queue_repo::delete_with_receipt(conn, &delivery.message_id, &delivery.receipt))
    }

    /// Returns the message to the queue after `delay`. Returns false if the
    /// delivery is stale.
    pub fn nack(
        &self,
        delivery: &Delivery,
        delay: Duration,
        now: DateTime<Utc>,
    ) -> Result<bool, DatabaseError> {
        let visible_at = now.timestamp_millis() + delay.as_millis() as i64;
        self.db.with_conn(|conn| {
            queue_repo::set_visible_at(conn, &delivery.message_id, &delivery.receipt, visible_at)
        })
    }

    /// Moves a delivered message to the dead-letter table.
    pub fn dead_letter(
        &self,
        delivery: &Delivery,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, DatabaseError> {
        let moved = self.db.with_conn(|conn| {
            queue_repo::move_to_dead_letter(
                conn,
                &delivery.message_id,
                &delivery.receipt,
                reason,
                &timestamp(now),
            )
        })?;
        if moved {
            log::warn!(
                "Dead-lettered {} message {} for job {}: {}",
                delivery.task.stage_kind,
                delivery.message_id,
                delivery.task.job_id,
                reason
            );
        }
        Ok(moved)
    }

    pub fn dead_letters(&self, kind: StageKind) -> Result<Vec<DeadLetter>, DatabaseError> {
        self.db.with_conn(|conn| {
            queue_repo::list_dead_letters(conn, kind.as_str())?
                .into_iter()
                .map(DeadLetter::try_from)
                .collect()
        })
    }

    /// Messages of `kind` not yet acked, including in-flight ones.
    pub fn depth(&self, kind: StageKind) -> Result<usize, DatabaseError> {
        self.db.with_conn(|conn| queue_repo::count(conn, kind.as_str()))
    }
}
