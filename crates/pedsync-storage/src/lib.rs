//! Canonical target persistence, upsert discipline and checkpoint storage for pedsync.

use std::time::Duration;

use thiserror::Error;

mod checkpoint;
mod memory;
mod postgres;
mod target;

pub use checkpoint::{CheckpointError, CheckpointStore, FileCheckpointStore};
pub use memory::MemoryTargetStore;
pub use postgres::PgTargetStore;
pub use target::{OrphanReference, TargetStore, UpsertEngine, WriteMode, WriteOutcome};

pub const CRATE_NAME: &str = "pedsync-storage";

/// Connection pool sizing shared by the target store and legacy sources.
#[derive(Debug, Clone, Copy)]
pub struct PoolSettings {
    pub max_connections: u32,
    pub connect_timeout: Duration,
    pub idle_timeout: Duration,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            max_connections: 5,
            connect_timeout: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConstraintKind {
    Unique,
    NotNull,
    ForeignKey,
    Check,
}

impl std::fmt::Display for ConstraintKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            ConstraintKind::Unique => "unique",
            ConstraintKind::NotNull => "not-null",
            ConstraintKind::ForeignKey => "foreign-key",
            ConstraintKind::Check => "check",
        })
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{kind} constraint violated on {table}: {message}")]
    Constraint {
        kind: ConstraintKind,
        table: String,
        message: String,
    },
    #[error("target store unavailable: {0}")]
    Unavailable(String),
    #[error("target query failed: {0}")]
    Database(#[source] sqlx::Error),
    #[error("record could not be merged into the existing row: {0}")]
    Merge(#[from] serde_json::Error),
}

/// SQLSTATE classes meaning the target itself is unusable rather than one row:
/// connection, authorization, catalog, schema or privilege, resources, and
/// operator intervention.
const FATAL_SQLSTATE_CLASSES: &[&str] = &["08", "28", "3D", "42", "53", "57"];

fn is_fatal_sqlstate(code: &str) -> bool {
    code.get(..2)
        .is_some_and(|class| FATAL_SQLSTATE_CLASSES.contains(&class))
}

impl StoreError {
    /// Row-level errors are confined to one record; anything else ends the run.
    pub fn is_row_level(&self) -> bool {
        !matches!(self, StoreError::Unavailable(_))
    }
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        if let sqlx::Error::Database(db) = &err {
            let kind = match db.code().as_deref() {
                Some("23505") => Some(ConstraintKind::Unique),
                Some("23502") => Some(ConstraintKind::NotNull),
                Some("23503") => Some(ConstraintKind::ForeignKey),
                Some("23514") => Some(ConstraintKind::Check),
                _ => None,
            };
            if let Some(kind) = kind {
                return StoreError::Constraint {
                    kind,
                    table: db.table().unwrap_or("unknown").to_string(),
                    message: db.message().to_string(),
                };
            }
            if let Some(code) = db.code().filter(|code| is_fatal_sqlstate(code)) {
                return StoreError::Unavailable(format!("{} (SQLSTATE {code})", db.message()));
            }
        }
        match err {
            sqlx::Error::Io(_)
            | sqlx::Error::Tls(_)
            | sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::WorkerCrashed => StoreError::Unavailable(err.to_string()),
            other => StoreError::Database(other),
        }
    }
}
