use chrono::{DateTime, Utc};
use futures::StreamExt;
use pedsync_adapters::LegacySource;
use pedsync_core::EntityKind;
use pedsync_storage::{UpsertEngine, WriteOutcome};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, info_span, Instrument};

use crate::mapping::RowMapper;
use crate::SyncError;

/// Row counts for one entity from one source.
#[derive(Debug, Clone, Serialize)]
pub struct EntityStats {
    pub entity: EntityKind,
    /// Table size reported by the source before extraction, when probed.
    pub source_rows: Option<u64>,
    pub extracted: u64,
    pub inserted: u64,
    pub updated: u64,
    pub skipped: u64,
    pub failed: u64,
    pub coerced: u64,
    pub synthesized_keys: u64,
}

impl EntityStats {
    pub fn new(entity: EntityKind) -> Self {
        Self {
            entity,
            source_rows: None,
            extracted: 0,
            inserted: 0,
            updated: 0,
            skipped: 0,
            failed: 0,
            coerced: 0,
            synthesized_keys: 0,
        }
    }

    pub fn succeeded(&self) -> u64 {
        self.inserted + self.updated + self.skipped
    }

    pub fn absorb(&mut self, other: &EntityStats) {
        self.source_rows = match (self.source_rows, other.source_rows) {
            (None, None) => None,
            (a, b) => Some(a.unwrap_or(0) + b.unwrap_or(0)),
        };
        self.extracted += other.extracted;
        self.inserted += other.inserted;
        self.updated += other.updated;
        self.skipped += other.skipped;
        self.failed += other.failed;
        self.coerced += other.coerced;
        self.synthesized_keys += other.synthesized_keys;
    }

    fn record(&mut self, outcome: WriteOutcome) {
        match outcome {
            WriteOutcome::Inserted => self.inserted += 1,
            WriteOutcome::Updated => self.updated += 1,
            WriteOutcome::Skipped => self.skipped += 1,
        }
    }
}

#[derive(Debug)]
pub enum MigrationEnd {
    Completed,
    Cancelled,
    /// The source or target failed in a way no further row can recover from.
    Aborted(SyncError),
}

#[derive(Debug)]
pub struct MigrationOutcome {
    pub stats: EntityStats,
    pub end: MigrationEnd,
}

/// Streams one legacy table through the mapper into the upsert engine.
///
/// Rows are handled one at a time. A row that fails to write is logged and
/// counted; only source or target outages end the migration early.
pub struct Migrator<'a> {
    source: &'a dyn LegacySource,
    engine: &'a UpsertEngine<'a>,
    cancel: &'a CancellationToken,
}

impl<'a> Migrator<'a> {
    pub fn new(
        source: &'a dyn LegacySource,
        engine: &'a UpsertEngine<'a>,
        cancel: &'a CancellationToken,
    ) -> Self {
        Self {
            source,
            engine,
            cancel,
        }
    }

    pub async fn run(
        &self,
        kind: EntityKind,
        since: Option<DateTime<Utc>>,
        mapper: &mut RowMapper,
    ) -> MigrationOutcome {
        let span = info_span!("migrate", source_id = %self.source.source_id(), entity = %kind);
        self.run_inner(kind, since, mapper).instrument(span).await
    }

    async fn run_inner(
        &self,
        kind: EntityKind,
        since: Option<DateTime<Utc>>,
        mapper: &mut RowMapper,
    ) -> MigrationOutcome {
        let mut stats = EntityStats::new(kind);
        let coerced_before = mapper.coerced();
        let synthesized_before = mapper.synthesized_keys();
        let mut rows = self.source.extract(kind, since);
        info!(mode = ?self.engine.mode(), since = ?since, "migrating {kind}");

        let end = loop {
            if self.cancel.is_cancelled() {
                break MigrationEnd::Cancelled;
            }
            let next = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break MigrationEnd::Cancelled,
                next = rows.next() => next,
            };
            let Some(item) = next else {
                break MigrationEnd::Completed;
            };

            let item = match item {
                Err(err) if err.is_fatal() => break MigrationEnd::Aborted(err.into()),
                other => other,
            };
            stats.extracted += 1;
            match item {
                Ok(row) => {
                    let mapped = mapper.map(kind, &row);
                    match self.engine.apply(&mapped).await {
                        Ok(outcome) => stats.record(outcome),
                        Err(err) if err.is_row_level() => {
                            stats.failed += 1;
                            error!(natural_key = mapped.natural_key(), error = %err, "failed to write {kind} row");
                        }
                        Err(err) => break MigrationEnd::Aborted(err.into()),
                    }
                }
                Err(err) => {
                    stats.failed += 1;
                    error!(error = %err, "skipping unreadable {kind} row");
                }
            }

            if stats.extracted % kind.progress_every() == 0 {
                info!(processed = stats.extracted, "migrated {} {kind}", stats.extracted);
            }
        };

        stats.coerced = mapper.coerced() - coerced_before;
        stats.synthesized_keys = mapper.synthesized_keys() - synthesized_before;
        match &end {
            MigrationEnd::Completed => info!(
                succeeded = stats.succeeded(),
                extracted = stats.extracted,
                failed = stats.failed,
                "{} of {} {kind} rows succeeded",
                stats.succeeded(),
                stats.extracted
            ),
            MigrationEnd::Cancelled => info!(extracted = stats.extracted, "{kind} migration cancelled"),
            MigrationEnd::Aborted(err) => error!(error = %err, "{kind} migration aborted"),
        }
        MigrationOutcome { stats, end }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use pedsync_adapters::{FixtureBundle, FixtureSource};
    use pedsync_core::LegacyRow;
    use pedsync_storage::{MemoryTargetStore, TargetStore, WriteMode};
    use serde_json::json;

    fn started() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, 2, 0, 0).unwrap()
    }

    fn enrollments(rows: Vec<serde_json::Value>) -> FixtureBundle {
        FixtureBundle {
            fixture_id: "unit".to_string(),
            source_id: "legacy-a".to_string(),
            beneficiary_trainings: Some(
                rows.into_iter()
                    .map(|v| LegacyRow::from_value(v).expect("object"))
                    .collect(),
            ),
            ..FixtureBundle::default()
        }
    }

    #[tokio::test]
    async fn failing_row_does_not_stop_the_batch() {
        let source = FixtureSource::new(enrollments(vec![
            json!({"beneficiary_training_id": "E1", "beneficiary_id": "T1", "training_id": "TR1"}),
            json!({"beneficiary_training_id": "E2", "training_id": "TR1"}),
            json!({"beneficiary_training_id": "E3", "beneficiary_id": "T3", "training_id": "TR1"}),
        ]));
        let store = MemoryTargetStore::new();
        let engine = UpsertEngine::new(&store, WriteMode::InsertIfAbsent);
        let cancel = CancellationToken::new();
        let mut mapper = RowMapper::new("legacy-a", started(), false);

        let outcome = Migrator::new(&source, &engine, &cancel)
            .run(EntityKind::Enrollment, None, &mut mapper)
            .await;

        assert!(matches!(outcome.end, MigrationEnd::Completed));
        assert_eq!(outcome.stats.extracted, 3);
        assert_eq!(outcome.stats.inserted, 2);
        assert_eq!(outcome.stats.failed, 1);
        assert_eq!(store.count(EntityKind::Enrollment).await.unwrap(), 2);
        assert!(store.get(EntityKind::Enrollment, "E2").await.is_none());
    }

    #[tokio::test]
    async fn target_outage_aborts() {
        let source = FixtureSource::new(enrollments(vec![
            json!({"beneficiary_training_id": "E1", "beneficiary_id": "T1", "training_id": "TR1"}),
        ]));
        let store = MemoryTargetStore::new();
        store.set_unavailable(true);
        let engine = UpsertEngine::new(&store, WriteMode::Upsert);
        let cancel = CancellationToken::new();
        let mut mapper = RowMapper::new("legacy-a", started(), false);

        let outcome = Migrator::new(&source, &engine, &cancel)
            .run(EntityKind::Enrollment, None, &mut mapper)
            .await;

        assert!(matches!(outcome.end, MigrationEnd::Aborted(_)));
    }

    #[tokio::test]
    async fn cancelled_token_stops_before_reading() {
        let source = FixtureSource::new(enrollments(vec![
            json!({"beneficiary_training_id": "E1", "beneficiary_id": "T1", "training_id": "TR1"}),
        ]));
        let store = MemoryTargetStore::new();
        let engine = UpsertEngine::new(&store, WriteMode::Upsert);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let mut mapper = RowMapper::new("legacy-a", started(), false);

        let outcome = Migrator::new(&source, &engine, &cancel)
            .run(EntityKind::Enrollment, None, &mut mapper)
            .await;

        assert!(matches!(outcome.end, MigrationEnd::Cancelled));
        assert_eq!(outcome.stats.extracted, 0);
        assert_eq!(store.count(EntityKind::Enrollment).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn broken_cursor_aborts_after_partial_progress() {
        let source = FixtureSource::new(enrollments(vec![
            json!({"beneficiary_training_id": "E1", "beneficiary_id": "T1", "training_id": "TR1"}),
            json!({"beneficiary_training_id": "E2", "beneficiary_id": "T2", "training_id": "TR1"}),
        ]))
        .failing_on(EntityKind::Enrollment);
        let store = MemoryTargetStore::new();
        let engine = UpsertEngine::new(&store, WriteMode::Upsert);
        let cancel = CancellationToken::new();
        let mut mapper = RowMapper::new("legacy-a", started(), false);

        let outcome = Migrator::new(&source, &engine, &cancel)
            .run(EntityKind::Enrollment, None, &mut mapper)
            .await;

        assert!(matches!(outcome.end, MigrationEnd::Aborted(SyncError::Source(_))));
        assert_eq!(outcome.stats.extracted, 1);
        assert_eq!(outcome.stats.inserted, 1);
    }
}
