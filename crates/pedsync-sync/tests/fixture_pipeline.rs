use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use futures::StreamExt;
use pedsync_adapters::{
    load_fixture_bundle, FixtureBundle, FixtureSource, LegacySource, RowStream, SourceError,
};
use pedsync_core::{CanonicalRecord, EntityKind, LegacyRow};
use pedsync_storage::{CheckpointStore, FileCheckpointStore, MemoryTargetStore, TargetStore};
use pedsync_sync::{
    open_source, run_consolidation, run_incremental, write_reports, PipelineOptions, RunStatus,
    SourceConfig, SourceStatus, SyncConfig, SyncError,
};
use serde_json::json;
use tokio_util::sync::CancellationToken;

fn workspace_root() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("../..")
}

fn fixture(source_id: &str) -> FixtureSource {
    let path = workspace_root()
        .join("fixtures")
        .join(source_id)
        .join("sample/bundle.json");
    FixtureSource::new(load_fixture_bundle(&path).expect("fixture bundle"))
}

fn boxed(source: FixtureSource) -> Result<Box<dyn LegacySource>, SourceError> {
    Ok(Box::new(source))
}

fn beneficiaries_only(source_id: &str, rows: Vec<serde_json::Value>) -> FixtureSource {
    let mut bundle = FixtureBundle {
        fixture_id: "inline".to_string(),
        source_id: source_id.to_string(),
        ..FixtureBundle::default()
    };
    *bundle.rows_mut(EntityKind::Beneficiary) = rows
        .into_iter()
        .map(|row| LegacyRow::from_value(row).expect("object"))
        .collect();
    FixtureSource::new(bundle)
}

/// Fixture source that cancels the run once it has handed out `rows` rows.
struct CancelAfterRows {
    inner: FixtureSource,
    rows: usize,
    cancel: CancellationToken,
    yielded: AtomicUsize,
}

#[async_trait]
impl LegacySource for CancelAfterRows {
    fn source_id(&self) -> &str {
        self.inner.source_id()
    }

    async fn probe(&self) -> Result<(), SourceError> {
        self.inner.probe().await
    }

    async fn table_rows(&self, kind: EntityKind) -> Result<Option<u64>, SourceError> {
        self.inner.table_rows(kind).await
    }

    fn extract(&self, kind: EntityKind, since: Option<DateTime<Utc>>) -> RowStream<'_> {
        self.inner
            .extract(kind, since)
            .inspect(move |_| {
                if self.yielded.fetch_add(1, Ordering::SeqCst) + 1 == self.rows {
                    self.cancel.cancel();
                }
            })
            .boxed()
    }

    async fn close(&self) {
        self.inner.close().await
    }
}

async fn beneficiary_name(store: &MemoryTargetStore, key: &str) -> String {
    match store.get(EntityKind::Beneficiary, key).await {
        Some(CanonicalRecord::Beneficiary(b)) => b.name,
        other => panic!("expected beneficiary {key}, got {other:?}"),
    }
}

#[tokio::test]
async fn consolidation_merges_sources_first_writer_wins() {
    let target = MemoryTargetStore::new();
    let sources = vec![boxed(fixture("legacy-main")), boxed(fixture("legacy-province"))];

    let summary = run_consolidation(&target, &sources, PipelineOptions::default())
        .await
        .expect("consolidation");

    assert_eq!(summary.status, RunStatus::Completed);
    assert!(summary
        .sources
        .iter()
        .all(|s| s.status == SourceStatus::Completed));
    assert_eq!(target.count(EntityKind::Beneficiary).await.unwrap(), 4);
    assert_eq!(target.count(EntityKind::Training).await.unwrap(), 2);
    assert_eq!(target.count(EntityKind::Enrollment).await.unwrap(), 2);
    assert_eq!(target.count(EntityKind::Attendance).await.unwrap(), 2);
    assert_eq!(beneficiary_name(&target, "T1").await, "Sok Dara");
    assert_eq!(beneficiary_name(&target, "T3").await, "Unknown");

    let totals = summary.totals();
    let beneficiaries = &totals[0];
    assert_eq!(beneficiaries.extracted, 5);
    assert_eq!(beneficiaries.inserted, 4);
    assert_eq!(beneficiaries.skipped, 1);
    let enrollments = &totals[2];
    assert_eq!(enrollments.failed, 1);
    assert_eq!(summary.failed_rows(), 1);
    assert_eq!(summary.target_counts.get("beneficiaries"), Some(&4));
    assert!(summary.orphans.is_empty());
}

#[tokio::test]
async fn consolidation_is_idempotent_for_keyed_rows() {
    let target = MemoryTargetStore::new();
    let first = vec![boxed(fixture("legacy-main"))];
    run_consolidation(&target, &first, PipelineOptions::default())
        .await
        .expect("first run");

    let second = vec![boxed(fixture("legacy-main"))];
    let summary = run_consolidation(&target, &second, PipelineOptions::default())
        .await
        .expect("second run");

    assert_eq!(target.count(EntityKind::Beneficiary).await.unwrap(), 3);
    assert_eq!(target.count(EntityKind::Training).await.unwrap(), 2);
    assert_eq!(target.count(EntityKind::Enrollment).await.unwrap(), 2);
    let totals = summary.totals();
    assert_eq!(totals[0].inserted, 0);
    assert_eq!(totals[0].skipped, 3);
}

#[tokio::test]
async fn broken_source_does_not_stop_the_next_one() {
    let target = MemoryTargetStore::new();
    let sources = vec![
        Err(SourceError::Unreachable {
            source_id: "legacy-offline".to_string(),
            message: "connection refused".to_string(),
        }),
        boxed(fixture("legacy-main").failing_on(EntityKind::Enrollment)),
        boxed(fixture("legacy-province")),
    ];

    let summary = run_consolidation(&target, &sources, PipelineOptions::default())
        .await
        .expect("consolidation");

    assert_eq!(summary.status, RunStatus::Completed);
    let statuses: Vec<_> = summary.sources.iter().map(|s| s.status).collect();
    assert_eq!(
        statuses,
        vec![
            SourceStatus::Skipped,
            SourceStatus::Failed,
            SourceStatus::Completed
        ]
    );
    assert_eq!(target.count(EntityKind::Enrollment).await.unwrap(), 1);
    assert_eq!(target.count(EntityKind::Attendance).await.unwrap(), 0);
    assert!(target.get(EntityKind::Beneficiary, "T4").await.is_some());
}

#[tokio::test]
async fn every_source_unreachable_fails_the_run() {
    let target = MemoryTargetStore::new();
    let sources = vec![
        boxed(fixture("legacy-main").unreachable()),
        boxed(fixture("legacy-province").unreachable()),
    ];

    let summary = run_consolidation(&target, &sources, PipelineOptions::default())
        .await
        .expect("summary");

    assert_eq!(summary.status, RunStatus::Failed);
    assert_eq!(target.count(EntityKind::Beneficiary).await.unwrap(), 0);
}

#[tokio::test]
async fn incremental_reads_only_rows_after_checkpoint() {
    let dir = tempfile::tempdir().expect("tempdir");
    let checkpoints = FileCheckpointStore::new(dir.path().join(".last-sync-timestamp"));
    let previous = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
    checkpoints.write(previous).await.expect("seed checkpoint");
    let target = MemoryTargetStore::new();
    let source = fixture("legacy-main");

    let summary = run_incremental(&target, &source, &checkpoints, PipelineOptions::default())
        .await
        .expect("incremental");

    assert_eq!(summary.status, RunStatus::Completed);
    assert_eq!(summary.since, Some(previous));
    let totals = summary.totals();
    assert_eq!(totals[0].extracted, 2);
    assert_eq!(totals[1].extracted, 1);
    assert_eq!(totals[2].extracted, 2);
    assert_eq!(totals[2].failed, 1);
    assert_eq!(totals[3].extracted, 1);
    assert!(target.get(EntityKind::Beneficiary, "T1").await.is_none());

    let advanced = checkpoints.read().await.expect("read").expect("checkpoint");
    assert_eq!(advanced, summary.started_at);
    assert!(advanced > previous);
    assert_eq!(summary.checkpoint_written, Some(advanced));
    assert!(source.is_closed());
}

#[tokio::test]
async fn incremental_upsert_overwrites_but_keeps_creation_audit() {
    let target = MemoryTargetStore::new();
    let province = vec![boxed(fixture("legacy-province"))];
    run_consolidation(&target, &province, PipelineOptions::default())
        .await
        .expect("backfill");
    assert_eq!(beneficiary_name(&target, "T1").await, "Sok Dara (province)");

    let dir = tempfile::tempdir().expect("tempdir");
    let checkpoints = FileCheckpointStore::new(dir.path().join("checkpoint"));
    let summary = run_incremental(
        &target,
        &fixture("legacy-main"),
        &checkpoints,
        PipelineOptions::default(),
    )
    .await
    .expect("incremental");

    assert_eq!(summary.since, None);
    assert_eq!(summary.totals()[0].updated, 1);
    let Some(CanonicalRecord::Beneficiary(t1)) = target.get(EntityKind::Beneficiary, "T1").await
    else {
        panic!("T1 missing");
    };
    assert_eq!(t1.name, "Sok Dara");
    assert_eq!(t1.created_at, Utc.with_ymd_and_hms(2023, 1, 15, 8, 0, 0).unwrap());
}

#[tokio::test]
async fn incremental_upsert_keeps_columns_the_source_left_out() {
    let target = MemoryTargetStore::new();
    let backfill = vec![boxed(beneficiaries_only(
        "legacy-full",
        vec![json!({
            "teacher_id": "T1",
            "name": "Sok Dara",
            "phone": "012345678",
            "school": "Batheay",
            "position": "Teacher",
            "created_at": "2023-01-15T08:00:00Z",
            "updated_at": "2023-02-01T00:00:00Z",
            "created_by": "admin",
            "updated_by": "admin"
        })],
    ))];
    run_consolidation(&target, &backfill, PipelineOptions::default())
        .await
        .expect("backfill");

    let dir = tempfile::tempdir().expect("tempdir");
    let checkpoints = FileCheckpointStore::new(dir.path().join("checkpoint"));
    let sparse = beneficiaries_only(
        "legacy-sparse",
        vec![json!({
            "teacher_id": "T1",
            "name": "Sok Dara Renamed",
            "updated_at": "2024-04-01T00:00:00Z"
        })],
    );
    let summary = run_incremental(&target, &sparse, &checkpoints, PipelineOptions::default())
        .await
        .expect("incremental");

    assert_eq!(summary.status, RunStatus::Completed);
    assert_eq!(summary.totals()[0].updated, 1);
    let Some(CanonicalRecord::Beneficiary(t1)) = target.get(EntityKind::Beneficiary, "T1").await
    else {
        panic!("T1 missing");
    };
    assert_eq!(t1.name, "Sok Dara Renamed");
    assert_eq!(t1.phone, "012345678");
    assert_eq!(t1.school, "Batheay");
    assert_eq!(t1.position, "Teacher");
    assert_eq!(t1.created_by, "admin");
    assert_eq!(t1.updated_by, "admin");
    assert_eq!(t1.created_at, Utc.with_ymd_and_hms(2023, 1, 15, 8, 0, 0).unwrap());
    assert_eq!(t1.updated_at, Utc.with_ymd_and_hms(2024, 4, 1, 0, 0, 0).unwrap());
}

#[tokio::test]
async fn unreachable_source_leaves_checkpoint_untouched() {
    let dir = tempfile::tempdir().expect("tempdir");
    let checkpoints = FileCheckpointStore::new(dir.path().join("checkpoint"));
    let target = MemoryTargetStore::new();
    let source = fixture("legacy-main").unreachable();

    let err = run_incremental(&target, &source, &checkpoints, PipelineOptions::default())
        .await
        .expect_err("source is down");

    assert!(matches!(err, SyncError::Source(SourceError::Unreachable { .. })));
    assert_eq!(checkpoints.read().await.expect("read"), None);
    assert!(source.is_closed());
}

#[tokio::test]
async fn target_outage_aborts_incremental_without_checkpoint() {
    let dir = tempfile::tempdir().expect("tempdir");
    let checkpoints = FileCheckpointStore::new(dir.path().join("checkpoint"));
    let target = MemoryTargetStore::new();
    target.set_unavailable(true);

    let err = run_incremental(
        &target,
        &fixture("legacy-main"),
        &checkpoints,
        PipelineOptions::default(),
    )
    .await
    .expect_err("target is down");

    assert!(err.is_target_outage());
    assert_eq!(checkpoints.read().await.expect("read"), None);
}

#[tokio::test]
async fn cancelled_run_reports_partial_state_and_keeps_checkpoint() {
    let dir = tempfile::tempdir().expect("tempdir");
    let checkpoints = FileCheckpointStore::new(dir.path().join("checkpoint"));
    let previous = Utc.with_ymd_and_hms(2023, 1, 1, 0, 0, 0).unwrap();
    checkpoints.write(previous).await.expect("seed checkpoint");
    let target = MemoryTargetStore::new();
    let options = PipelineOptions::default();
    options.cancel.cancel();

    let summary = run_incremental(&target, &fixture("legacy-main"), &checkpoints, options)
        .await
        .expect("summary");

    assert_eq!(summary.status, RunStatus::Cancelled);
    assert_eq!(summary.checkpoint_written, None);
    assert_eq!(checkpoints.read().await.expect("read"), Some(previous));
    assert_eq!(target.count(EntityKind::Beneficiary).await.unwrap(), 0);
}

#[tokio::test]
async fn cancellation_mid_stream_stops_after_the_rows_already_read() {
    let dir = tempfile::tempdir().expect("tempdir");
    let checkpoints = FileCheckpointStore::new(dir.path().join("checkpoint"));
    let previous = Utc.with_ymd_and_hms(2023, 1, 1, 0, 0, 0).unwrap();
    checkpoints.write(previous).await.expect("seed checkpoint");
    let target = MemoryTargetStore::new();
    let options = PipelineOptions::default();
    let source = CancelAfterRows {
        inner: fixture("legacy-main"),
        rows: 2,
        cancel: options.cancel.clone(),
        yielded: AtomicUsize::new(0),
    };

    let summary = run_incremental(&target, &source, &checkpoints, options)
        .await
        .expect("summary");

    assert_eq!(summary.status, RunStatus::Cancelled);
    assert_eq!(summary.sources[0].status, SourceStatus::Cancelled);
    let totals = summary.totals();
    assert_eq!(totals[0].extracted, 2);
    assert_eq!(totals[0].inserted, 2);
    assert_eq!(totals[1].extracted, 0);
    assert_eq!(target.count(EntityKind::Beneficiary).await.unwrap(), 2);
    assert_eq!(summary.checkpoint_written, None);
    assert_eq!(checkpoints.read().await.expect("read"), Some(previous));
    assert!(source.inner.is_closed());
}

#[tokio::test]
async fn reports_are_written_per_run() {
    let target = MemoryTargetStore::new();
    let sources = vec![boxed(fixture("legacy-main"))];
    let summary = run_consolidation(&target, &sources, PipelineOptions::default())
        .await
        .expect("consolidation");

    let dir = tempfile::tempdir().expect("tempdir");
    let reports_dir = write_reports(dir.path(), &summary).await.expect("reports");

    assert_eq!(reports_dir, dir.path().join(summary.run_id.to_string()));
    let json = std::fs::read_to_string(reports_dir.join("run_summary.json")).expect("json");
    let parsed: serde_json::Value = serde_json::from_str(&json).expect("valid json");
    assert_eq!(parsed["status"], "completed");
    let markdown = std::fs::read_to_string(reports_dir.join("summary.md")).expect("markdown");
    assert!(markdown.contains("enrollments: 2 of 3 rows succeeded"));
}

#[tokio::test]
async fn registry_fixture_entries_open_as_sources() {
    let config = SyncConfig {
        workspace_root: workspace_root(),
        ..SyncConfig::from_lookup(|_| None)
    };
    let entry = SourceConfig {
        source_id: "legacy-replay".to_string(),
        display_name: "Replay of the main capture".to_string(),
        enabled: true,
        url: None,
        url_env: None,
        fixture: Some(PathBuf::from("fixtures/legacy-main/sample/bundle.json")),
        primary: false,
        notes: None,
    };
    let source = open_source(&config, &entry).expect("fixture source");
    assert_eq!(source.source_id(), "legacy-replay");
    assert_eq!(
        source.table_rows(EntityKind::Beneficiary).await.expect("rows"),
        Some(3)
    );

    let missing = SourceConfig {
        url_env: Some("PEDSYNC_TEST_URL_THAT_IS_NEVER_SET".to_string()),
        fixture: None,
        ..entry
    };
    assert!(matches!(
        open_source(&config, &missing),
        Err(SourceError::Unreachable { .. })
    ));
}
