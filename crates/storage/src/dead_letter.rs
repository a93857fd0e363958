use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::{Row, SqlitePool};
use thiserror::Error;
use uuid::Uuid;

use crate::to_rfc3339;

/// Broad category of a recorded delivery failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Network/timeout/5xx; eligible for blind replay.
    Transient,
    /// Downstream rejected the payload; replayed only on explicit request.
    Permanent,
    /// Event type the normalizer could not classify; parked for operator
    /// inspection, never auto-replayed.
    Unclassified,
}

impl FailureKind {
    pub fn is_permanent(self) -> bool {
        !matches!(self, Self::Transient)
    }
}

/// Durable record of an event the forwarder could not deliver.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeadLetterEntry {
    pub id: String,
    pub subject_id: String,
    pub event_type: String,
    /// Canonical wire projection, or the raw payload when normalization
    /// itself is what failed.
    pub payload_json: String,
    pub failure_reason: String,
    pub permanent: bool,
    pub attempt_count: u32,
    pub first_failed_at: DateTime<Utc>,
    pub last_attempt_at: DateTime<Utc>,
}

/// Data required to record a new dead-letter entry.
pub struct NewDeadLetter<'a> {
    pub subject_id: &'a str,
    pub event_type: &'a str,
    pub payload_json: String,
    pub failure_reason: String,
    pub kind: FailureKind,
    pub failed_at: DateTime<Utc>,
}

/// Errors produced by the dead-letter repository.
#[derive(Debug, Error)]
pub enum DeadLetterError {
    #[error("dead-letter entry not found")]
    NotFound,
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Repository over the `dead_letters` table.
#[derive(Clone)]
pub struct DeadLetterRepository {
    pub(crate) pool: SqlitePool,
}

impl DeadLetterRepository {
    /// Records a fresh failure. The entry starts at attempt count 1.
    pub async fn record(
        &self,
        record: NewDeadLetter<'_>,
    ) -> Result<DeadLetterEntry, DeadLetterError> {
        let id = Uuid::new_v4().to_string();
        let permanent = if record.kind.is_permanent() { 1 } else { 0 };
        sqlx::query(
            "INSERT INTO dead_letters \
             (id, subject_id, event_type, payload_json, failure_reason, permanent, \
              attempt_count, first_failed_at, last_attempt_at) \
             VALUES (?, ?, ?, ?, ?, ?, 1, ?, ?)",
        )
        .bind(&id)
        .bind(record.subject_id)
        .bind(record.event_type)
        .bind(&record.payload_json)
        .bind(&record.failure_reason)
        .bind(permanent)
        .bind(to_rfc3339(record.failed_at))
        .bind(to_rfc3339(record.failed_at))
        .execute(&self.pool)
        .await?;

        Ok(DeadLetterEntry {
            id,
            subject_id: record.subject_id.to_string(),
            event_type: record.event_type.to_string(),
            payload_json: record.payload_json,
            failure_reason: record.failure_reason,
            permanent: permanent == 1,
            attempt_count: 1,
            first_failed_at: record.failed_at,
            last_attempt_at: record.failed_at,
        })
    }

    /// Lists entries awaiting delivery, oldest failure first.
    pub async fn list_pending(&self) -> Result<Vec<DeadLetterEntry>, DeadLetterError> {
        let rows = sqlx::query_as::<_, DeadLetterRow>(
            "SELECT id, subject_id, event_type, payload_json, failure_reason, permanent, \
                    attempt_count, first_failed_at, last_attempt_at \
               FROM dead_letters \
              ORDER BY first_failed_at ASC, id ASC",
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(DeadLetterRow::into_domain).collect())
    }

    /// Bumps the attempt counter before a replay attempt, returning the new
    /// count. Recording the attempt first means a crash mid-replay leaves an
    /// honest history rather than an undercounted one.
    pub async fn record_attempt(
        &self,
        id: &str,
        at: DateTime<Utc>,
    ) -> Result<u32, DeadLetterError> {
        let row = sqlx::query(
            "UPDATE dead_letters \
                SET attempt_count = attempt_count + 1, last_attempt_at = ? \
              WHERE id = ? \
              RETURNING attempt_count",
        )
        .bind(to_rfc3339(at))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or(DeadLetterError::NotFound)?;

        let count: i64 = row.get("attempt_count");
        Ok(count as u32)
    }

    /// Removes an entry after successful delivery.
    ///
    /// The delete is keyed by row id and reports whether this caller removed
    /// it, so two concurrent replays of the same entry cannot both claim the
    /// delivery.
    pub async fn mark_delivered(&self, id: &str) -> Result<bool, DeadLetterError> {
        let result = sqlx::query("DELETE FROM dead_letters WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() == 1)
    }

    /// Operator purge; identical mechanics to [`mark_delivered`] but named
    /// for intent.
    ///
    /// [`mark_delivered`]: DeadLetterRepository::mark_delivered
    pub async fn purge(&self, id: &str) -> Result<bool, DeadLetterError> {
        self.mark_delivered(id).await
    }
}

#[derive(Debug, sqlx::FromRow)]
struct DeadLetterRow {
    id: String,
    subject_id: String,
    event_type: String,
    payload_json: String,
    failure_reason: String,
    permanent: i64,
    attempt_count: i64,
    first_failed_at: DateTime<Utc>,
    last_attempt_at: DateTime<Utc>,
}

impl DeadLetterRow {
    fn into_domain(self) -> DeadLetterEntry {
        DeadLetterEntry {
            id: self.id,
            subject_id: self.subject_id,
            event_type: self.event_type,
            payload_json: self.payload_json,
            failure_reason: self.failure_reason,
            permanent: self.permanent != 0,
            attempt_count: self.attempt_count as u32,
            first_failed_at: self.first_failed_at,
            last_attempt_at: self.last_attempt_at,
        }
    }
}
