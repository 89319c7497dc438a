use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use pedsync_core::{AttendanceStatus, CanonicalRecord, EntityKind, MappedRecord};
use serde_json::Value;
use tokio::sync::Mutex;

use crate::{ConstraintKind, OrphanReference, StoreError, TargetStore, WriteOutcome};

type Tables = BTreeMap<EntityKind, BTreeMap<String, CanonicalRecord>>;

/// In-process target mirroring the constraints of the canonical Postgres schema.
#[derive(Debug, Default)]
pub struct MemoryTargetStore {
    tables: Mutex<Tables>,
    unavailable: AtomicBool,
    closed: AtomicBool,
}

impl MemoryTargetStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every subsequent call fail as if the connection dropped.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub async fn get(&self, kind: EntityKind, natural_key: &str) -> Option<CanonicalRecord> {
        self.tables
            .lock()
            .await
            .get(&kind)
            .and_then(|t| t.get(natural_key))
            .cloned()
    }

    pub async fn records(&self, kind: EntityKind) -> Vec<CanonicalRecord> {
        self.tables
            .lock()
            .await
            .get(&kind)
            .map(|t| t.values().cloned().collect())
            .unwrap_or_default()
    }

    fn check_available(&self) -> Result<(), StoreError> {
        if self.unavailable.load(Ordering::SeqCst) || self.is_closed() {
            return Err(StoreError::Unavailable("memory target offline".to_string()));
        }
        Ok(())
    }
}

fn check_constraints(record: &CanonicalRecord) -> Result<(), StoreError> {
    let not_null = |column: &str| StoreError::Constraint {
        kind: ConstraintKind::NotNull,
        table: record.kind().table().to_string(),
        message: format!("null value in column \"{column}\""),
    };
    if record.natural_key().is_empty() {
        return Err(not_null(record.kind().key_column()));
    }
    if let Some((beneficiary, training)) = record.references() {
        if beneficiary.is_none() {
            return Err(not_null("beneficiary_id"));
        }
        if training.is_none() {
            return Err(not_null("training_id"));
        }
    }
    Ok(())
}

/// Copies the update columns of `mapped` onto `existing`, leaving every other
/// column as stored. Field names match the canonical column names.
fn merge_supplied(existing: &CanonicalRecord, mapped: &MappedRecord) -> Result<CanonicalRecord, StoreError> {
    let mut merged = serde_json::to_value(existing)?;
    let incoming = serde_json::to_value(&mapped.record)?;
    if let (Some(Value::Object(target)), Some(Value::Object(source))) =
        (merged.get_mut("record"), incoming.get("record"))
    {
        for column in mapped.update_columns() {
            if let Some(value) = source.get(column) {
                target.insert(column.to_string(), value.clone());
            }
        }
    }
    Ok(serde_json::from_value(merged)?)
}

#[async_trait]
impl TargetStore for MemoryTargetStore {
    async fn ping(&self) -> Result<(), StoreError> {
        self.check_available()
    }

    async fn contains(&self, kind: EntityKind, natural_key: &str) -> Result<bool, StoreError> {
        self.check_available()?;
        Ok(self
            .tables
            .lock()
            .await
            .get(&kind)
            .is_some_and(|t| t.contains_key(natural_key)))
    }

    async fn insert(&self, record: &CanonicalRecord) -> Result<bool, StoreError> {
        self.check_available()?;
        check_constraints(record)?;
        let mut tables = self.tables.lock().await;
        let table = tables.entry(record.kind()).or_default();
        if table.contains_key(record.natural_key()) {
            return Ok(false);
        }
        table.insert(record.natural_key().to_string(), record.clone());
        Ok(true)
    }

    async fn upsert(&self, mapped: &MappedRecord) -> Result<WriteOutcome, StoreError> {
        self.check_available()?;
        check_constraints(&mapped.record)?;
        let mut tables = self.tables.lock().await;
        let table = tables.entry(mapped.kind()).or_default();
        match table.get_mut(mapped.natural_key()) {
            Some(existing) => {
                *existing = merge_supplied(existing, mapped)?;
                Ok(WriteOutcome::Updated)
            }
            None => {
                table.insert(mapped.natural_key().to_string(), mapped.record.clone());
                Ok(WriteOutcome::Inserted)
            }
        }
    }

    async fn count(&self, kind: EntityKind) -> Result<u64, StoreError> {
        self.check_available()?;
        Ok(self
            .tables
            .lock()
            .await
            .get(&kind)
            .map(|t| t.len() as u64)
            .unwrap_or(0))
    }

    async fn orphans(&self) -> Result<Vec<OrphanReference>, StoreError> {
        self.check_available()?;
        let tables = self.tables.lock().await;
        let has = |kind: EntityKind, key: &str| {
            tables.get(&kind).is_some_and(|t| t.contains_key(key))
        };
        let mut out = Vec::new();
        for kind in [EntityKind::Enrollment, EntityKind::Attendance] {
            let Some(table) = tables.get(&kind) else {
                continue;
            };
            for (key, record) in table {
                let Some((beneficiary, training)) = record.references() else {
                    continue;
                };
                let refs = [
                    ("beneficiary_id", EntityKind::Beneficiary, beneficiary),
                    ("training_id", EntityKind::Training, training),
                ];
                for (column, referenced, value) in refs {
                    if let Some(value) = value {
                        if !has(referenced, value) {
                            out.push(OrphanReference {
                                kind,
                                natural_key: key.clone(),
                                column: column.to_string(),
                                missing_key: value.to_string(),
                            });
                        }
                    }
                }
            }
        }
        Ok(out)
    }

    async fn recount_participants(&self) -> Result<u64, StoreError> {
        self.check_available()?;
        let mut tables = self.tables.lock().await;
        let mut counts: BTreeMap<String, i32> = BTreeMap::new();
        if let Some(enrollments) = tables.get(&EntityKind::Enrollment) {
            for record in enrollments.values() {
                if let CanonicalRecord::Enrollment(e) = record {
                    if e.attendance_status == AttendanceStatus::Dropped {
                        continue;
                    }
                    if let Some(training_id) = &e.training_id {
                        *counts.entry(training_id.clone()).or_default() += 1;
                    }
                }
            }
        }
        let mut updated = 0u64;
        if let Some(trainings) = tables.get_mut(&EntityKind::Training) {
            for (code, record) in trainings.iter_mut() {
                if let CanonicalRecord::Training(t) = record {
                    t.current_participants = counts.get(code).copied().unwrap_or(0);
                    updated += 1;
                }
            }
        }
        Ok(updated)
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}
