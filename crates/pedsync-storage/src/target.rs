use async_trait::async_trait;
use pedsync_core::{CanonicalRecord, EntityKind, MappedRecord};
use serde::Serialize;

use crate::StoreError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WriteMode {
    /// Backfill: existing keys are left untouched.
    InsertIfAbsent,
    /// Recurring sync: existing keys are updated in place.
    Upsert,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WriteOutcome {
    Inserted,
    Updated,
    Skipped,
}

/// An enrollment or attendance row pointing at a key the target does not hold.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OrphanReference {
    pub kind: EntityKind,
    pub natural_key: String,
    pub column: String,
    pub missing_key: String,
}

/// Canonical store holding the four entity tables.
///
/// Implementations must enforce uniqueness of each natural key themselves;
/// [`UpsertEngine`]'s existence check is only a shortcut.
#[async_trait]
pub trait TargetStore: Send + Sync {
    async fn ping(&self) -> Result<(), StoreError>;

    async fn contains(&self, kind: EntityKind, natural_key: &str) -> Result<bool, StoreError>;

    /// Returns `false` when the natural key already exists.
    async fn insert(&self, record: &CanonicalRecord) -> Result<bool, StoreError>;

    /// Inserts the full record, or overwrites only the supplied columns of an
    /// existing row. Creation audit fields are never overwritten.
    async fn upsert(&self, mapped: &MappedRecord) -> Result<WriteOutcome, StoreError>;

    async fn count(&self, kind: EntityKind) -> Result<u64, StoreError>;

    async fn orphans(&self) -> Result<Vec<OrphanReference>, StoreError>;

    /// Recomputes `current_participants` from non-dropped enrollments.
    async fn recount_participants(&self) -> Result<u64, StoreError>;

    async fn close(&self);
}

/// Applies one of the two write disciplines to normalized records.
pub struct UpsertEngine<'a> {
    store: &'a dyn TargetStore,
    mode: WriteMode,
}

impl<'a> UpsertEngine<'a> {
    pub fn new(store: &'a dyn TargetStore, mode: WriteMode) -> Self {
        Self { store, mode }
    }

    pub fn mode(&self) -> WriteMode {
        self.mode
    }

    pub async fn apply(&self, mapped: &MappedRecord) -> Result<WriteOutcome, StoreError> {
        let record = &mapped.record;
        match self.mode {
            WriteMode::InsertIfAbsent => {
                if self
                    .store
                    .contains(record.kind(), record.natural_key())
                    .await?
                {
                    return Ok(WriteOutcome::Skipped);
                }
                // A concurrent writer may win between the check and the insert.
                if self.store.insert(record).await? {
                    Ok(WriteOutcome::Inserted)
                } else {
                    Ok(WriteOutcome::Skipped)
                }
            }
            WriteMode::Upsert => self.store.upsert(mapped).await,
        }
    }
}
