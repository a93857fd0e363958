pub mod cache;
pub mod dead_letter;

use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::{migrate::MigrateError, sqlite::SqlitePoolOptions, SqlitePool};
use thiserror::Error;
use uuid::Uuid;

pub use cache::StatusCache;
pub use dead_letter::{
    DeadLetterEntry, DeadLetterError, DeadLetterRepository, FailureKind, NewDeadLetter,
};

/// Top-level database handle that owns the SQLite connection pool.
#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Establishes a new SQLite connection pool for the provided connection string.
    pub async fn connect(database_url: &str) -> Result<Self, StorageError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await
            .map_err(StorageError::Connect)?;

        apply_pragmas(&pool).await?;

        Ok(Self { pool })
    }

    /// Applies migrations located under `migrations/`.
    pub async fn run_migrations(&self) -> Result<(), StorageError> {
        sqlx::migrate!("../../migrations")
            .run(&self.pool)
            .await
            .map_err(StorageError::Migration)?;
        Ok(())
    }

    /// Returns a handle for the dead-letter repository.
    pub fn dead_letters(&self) -> DeadLetterRepository {
        DeadLetterRepository {
            pool: self.pool.clone(),
        }
    }

    /// Returns a handle for the raw-event audit repository.
    pub fn event_audit(&self) -> EventAuditRepository {
        EventAuditRepository {
            pool: self.pool.clone(),
        }
    }

    /// Exposes the inner pool when lower level access is required.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

async fn apply_pragmas(pool: &SqlitePool) -> Result<(), StorageError> {
    sqlx::query("PRAGMA foreign_keys = ON;")
        .execute(pool)
        .await
        .map_err(StorageError::Pragma)?;

    sqlx::query("PRAGMA journal_mode = WAL;")
        .fetch_one(pool)
        .await
        .map_err(StorageError::Pragma)?;

    sqlx::query("PRAGMA synchronous = NORMAL;")
        .execute(pool)
        .await
        .map_err(StorageError::Pragma)?;

    sqlx::query("PRAGMA busy_timeout = 5000;")
        .execute(pool)
        .await
        .map_err(StorageError::Pragma)?;

    Ok(())
}

/// General storage level errors.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("failed to connect to sqlite: {0}")]
    Connect(sqlx::Error),
    #[error("failed to apply pragma: {0}")]
    Pragma(sqlx::Error),
    #[error("failed to run database migrations: {0}")]
    Migration(MigrateError),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Repository keeping an audit copy of every authenticated raw payload.
///
/// Rows here are the durable side of the canonical event's raw
/// back-reference; nothing in the pipeline reads them back for control
/// decisions.
#[derive(Clone)]
pub struct EventAuditRepository {
    pool: SqlitePool,
}

impl EventAuditRepository {
    pub async fn insert(&self, record: NewEventAudit<'_>) -> Result<String, StorageError> {
        let id = Uuid::new_v4().to_string();
        sqlx::query(
            "INSERT INTO event_audit (id, subject_id, event_type, payload, received_at) \
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&id)
        .bind(record.subject_id)
        .bind(record.event_type)
        .bind(record.payload)
        .bind(to_rfc3339(record.received_at))
        .execute(&self.pool)
        .await?;
        Ok(id)
    }
}

/// Data required to create an audit row.
pub struct NewEventAudit<'a> {
    pub subject_id: &'a str,
    pub event_type: &'a str,
    /// Exact wire bytes, stored as received.
    pub payload: &'a str,
    pub received_at: DateTime<Utc>,
}

pub(crate) fn to_rfc3339(value: DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Millis, true)
}
