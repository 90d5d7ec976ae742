//! Queue repository: the `stage_messages` and `dead_letters` tables.
//!
//! A message is invisible while `visible_at` lies in the future. Receiving a
//! message pushes `visible_at` out by the ack deadline and stamps a fresh
//! receipt; only the holder of the current receipt may ack or nack it.

use rusqlite::{params, Connection, OptionalExtension, Row};

use super::DatabaseError;

#[derive(Debug, Clone, PartialEq)]
pub struct MessageRow {
    pub id: String,
    pub queue: String,
    pub job_id: String,
    pub payload: String,
    pub delivery_count: u32,
    /// Milliseconds since the Unix epoch.
    pub visible_at: i64,
    pub receipt: Option<String>,
    pub enqueued_at: String,
}

impl MessageRow {
    fn from_row(row: &Row<'_>) -> Result<Self, rusqlite::Error> {
        Ok(Self {
            id: row.get("id")?,
            queue: row.get("queue")?,
            job_id: row.get("job_id")?,
            payload: row.get("payload")?,
            delivery_count: row.get("delivery_count")?,
            visible_at: row.get("visible_at")?,
            receipt: row.get("receipt")?,
            enqueued_at: row.get("enqueued_at")?,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DeadLetterRow {
    pub id: String,
    pub queue: String,
    pub job_id: String,
    pub payload: String,
    pub delivery_count: u32,
    pub reason: String,
    pub dead_lettered_at: String,
}

impl DeadLetterRow {
    fn from_row(row: &Row<'_>) -> Result<Self, rusqlite::Error> {
        Ok(Self {
            id: row.get("id")?,
            queue: row.get("queue")?,
            job_id: row.get("job_id")?,
            payload: row.get("payload")?,
            delivery_count: row.get("delivery_count")?,
            reason: row.get("reason")?,
            dead_lettered_at: row.get("dead_lettered_at")?,
        })
    }
}

pub fn insert(conn: &Connection, message: &MessageRow) -> Result<(), DatabaseError> {
    conn.execute(
        "INSERT INTO stage_messages (id, queue, job_id, payload, delivery_count, visible_at,
         receipt, enqueued_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![
            message.id,
            message.queue,
            message.job_id,
            message.payload,
            message.delivery_count,
            message.visible_at,
            message.receipt,
            message.enqueued_at,
        ],
    )?;
    Ok(())
}

/// Atomically takes the oldest visible message of `queue`, hiding it until
/// `visible_until_ms` and bumping its delivery count.
pub fn receive(
    conn: &Connection,
    queue: &str,
    now_ms: i64,
    visible_until_ms: i64,
    receipt: &str,
) -> Result<Option<MessageRow>, DatabaseError> {
    Ok(conn
        .query_row(
            "UPDATE stage_messages
             SET delivery_count = delivery_count + 1, visible_at = ?3, receipt = ?4
             WHERE id = (SELECT id FROM stage_messages
                         WHERE queue = ?1 AND visible_at <= ?2
                         ORDER BY visible_at, rowid LIMIT 1)
             RETURNING *",
            params![queue, now_ms, visible_until_ms, receipt],
            MessageRow::from_row,
        )
        .optional()?)
}

pub fn delete_with_receipt(conn: &Connection, id: &str, receipt: &str) -> Result<bool, DatabaseError> {
    let changed = conn.execute(
        "DELETE FROM stage_messages WHERE id = ?1 AND receipt = ?2",
        params![id, receipt],
    )?;
    Ok(changed > 0)
}

/// Makes a held message visible again at `visible_at`. The receipt is
/// invalidated so the previous holder can no longer ack it.
pub fn set_visible_at(
    conn: &Connection,
    id: &str,
    receipt: &str,
    visible_at: i64,
) -> Result<bool, DatabaseError> {
    let changed = conn.execute(
        "UPDATE stage_messages SET visible_at = ?3, receipt = NULL
         WHERE id = ?1 AND receipt = ?2",
        params![id, receipt, visible_at],
    )?;
    Ok(changed > 0)
}

/// Moves a message held under `receipt` into `dead_letters`.
pub fn move_to_dead_letter(
    conn: &Connection,
    id: &str,
    receipt: &str,
    reason: &str,
    now: &str,
) -> Result<bool, DatabaseError> {
    let moved = conn.execute(
        "INSERT INTO dead_letters (id, queue, job_id, payload, delivery_count, reason,
         dead_lettered_at)
         SELECT id, queue, job_id, payload, delivery_count, ?3, ?4
         FROM stage_messages WHERE id = ?1 AND receipt = ?2",
        params![id, receipt, reason, now],
    )?;
    if moved == 0 {
        return Ok(false);
    }
    conn.execute("DELETE FROM stage_messages WHERE id = ?1", params![id])?;
    Ok(true)
}

pub fn list_dead_letters(conn: &Connection, queue: &str) -> Result<Vec<DeadLetterRow>, DatabaseError> {
    let mut stmt =
        conn.prepare("SELECT * FROM dead_letters WHERE queue = ?1 ORDER BY dead_lettered_at, rowid")?;
    let rows = stmt
        .query_map(params![queue], DeadLetterRow::from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Removes pending messages and dead letters of a job. Returns how many
/// pending messages were removed.
pub fn delete_for_job(conn: &Connection, job_id: &str) -> Result<usize, DatabaseError> {
    let removed = conn.execute("DELETE FROM stage_messages WHERE job_id = ?1", params![job_id])?;
    conn.execute("DELETE FROM dead_letters WHERE job_id = ?1", params![job_id])?;
    Ok(removed)
}

/// Messages in `queue`, visible or not.
pub fn count(conn: &Connection, queue: &str) -> Result<usize, DatabaseError> {
    let n: i64 = conn.query_row(
        "SELECT COUNT(*) FROM stage_messages WHERE queue = ?1",
        params![queue],
        |r| r.get(0),
    )?;
    Ok(n as usize)
}
