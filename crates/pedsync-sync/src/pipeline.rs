use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use pedsync_adapters::{LegacySource, SourceError};
use pedsync_core::EntityKind;
use pedsync_storage::{CheckpointStore, OrphanReference, TargetStore, UpsertEngine, WriteMode};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::mapping::RowMapper;
use crate::migrator::{EntityStats, MigrationEnd, Migrator};
use crate::SyncError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunMode {
    Consolidate,
    Incremental,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Completed,
    Cancelled,
    /// No source could be processed.
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceStatus {
    Completed,
    /// Not reachable or not configured; nothing was read.
    Skipped,
    /// Extraction broke part way; rows written before the break are kept.
    Failed,
    Cancelled,
}

#[derive(Debug, Clone, Serialize)]
pub struct SourceSummary {
    pub source_id: String,
    pub status: SourceStatus,
    pub message: Option<String>,
    pub entities: Vec<EntityStats>,
}

impl SourceSummary {
    fn new(source_id: &str) -> Self {
        Self {
            source_id: source_id.to_string(),
            status: SourceStatus::Completed,
            message: None,
            entities: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub mode: RunMode,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub status: RunStatus,
    /// Lower bound of an incremental extraction; `None` means everything.
    pub since: Option<DateTime<Utc>>,
    pub checkpoint_written: Option<DateTime<Utc>>,
    pub sources: Vec<SourceSummary>,
    /// Canonical table sizes after the run, keyed by table name.
    pub target_counts: BTreeMap<String, u64>,
    pub orphans: Vec<OrphanReference>,
}

impl RunSummary {
    fn new(mode: RunMode, started_at: DateTime<Utc>) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            mode,
            started_at,
            finished_at: started_at,
            status: RunStatus::Completed,
            since: None,
            checkpoint_written: None,
            sources: Vec::new(),
            target_counts: BTreeMap::new(),
            orphans: Vec::new(),
        }
    }

    /// Per-entity totals across every source, in migration order.
    pub fn totals(&self) -> Vec<EntityStats> {
        EntityKind::ALL
            .into_iter()
            .map(|kind| {
                let mut total = EntityStats::new(kind);
                for stats in self.sources.iter().flat_map(|s| &s.entities) {
                    if stats.entity == kind {
                        total.absorb(stats);
                    }
                }
                total
            })
            .collect()
    }

    pub fn failed_rows(&self) -> u64 {
        self.totals().iter().map(|t| t.failed).sum()
    }
}

#[derive(Debug, Clone, Default)]
pub struct PipelineOptions {
    pub strict_audit: bool,
    pub cancel: CancellationToken,
}

/// Drives the entity migrators across legacy sources into one target.
pub struct SyncPipeline<'a> {
    target: &'a dyn TargetStore,
    options: PipelineOptions,
}

impl<'a> SyncPipeline<'a> {
    pub fn new(target: &'a dyn TargetStore, options: PipelineOptions) -> Self {
        Self { target, options }
    }

    /// Backfills every source with insert-if-absent semantics.
    ///
    /// Sources that cannot be opened or probed are skipped; a source whose
    /// extraction breaks is marked failed and the next one still runs. Only a
    /// target outage aborts the whole pass.
    pub async fn consolidate(
        &self,
        sources: &[Result<Box<dyn LegacySource>, SourceError>],
    ) -> Result<RunSummary, SyncError> {
        let mut summary = RunSummary::new(RunMode::Consolidate, Utc::now());
        let span = info_span!("consolidate", run_id = %summary.run_id);
        async {
            self.target.ping().await?;
            let engine = UpsertEngine::new(self.target, WriteMode::InsertIfAbsent);

            for source in sources {
                if self.options.cancel.is_cancelled() {
                    summary.status = RunStatus::Cancelled;
                    break;
                }
                let source = match source {
                    Ok(source) => &**source,
                    Err(err) => {
                        warn!(error = %err, "skipping source");
                        let mut skipped = SourceSummary::new(source_id_of(err));
                        skipped.status = SourceStatus::Skipped;
                        skipped.message = Some(err.to_string());
                        summary.sources.push(skipped);
                        continue;
                    }
                };
                let source_summary = self
                    .consolidate_source(source, &engine, summary.started_at)
                    .await?;
                let cancelled = source_summary.status == SourceStatus::Cancelled;
                summary.sources.push(source_summary);
                if cancelled {
                    summary.status = RunStatus::Cancelled;
                    break;
                }
            }

            if summary.status == RunStatus::Completed
                && !summary.sources.is_empty()
                && summary
                    .sources
                    .iter()
                    .all(|s| s.status == SourceStatus::Skipped)
            {
                error!("no legacy source could be reached");
                summary.status = RunStatus::Failed;
            }

            summary.target_counts = self.recount().await;
            summary.orphans = self.orphan_pass().await;
            Ok::<_, SyncError>(())
        }
        .instrument(span)
        .await?;

        summary.finished_at = Utc::now();
        Ok(summary)
    }

    async fn consolidate_source(
        &self,
        source: &dyn LegacySource,
        engine: &UpsertEngine<'_>,
        started_at: DateTime<Utc>,
    ) -> Result<SourceSummary, SyncError> {
        let source_id = source.source_id();
        let mut out = SourceSummary::new(source_id);

        if let Err(err) = source.probe().await {
            warn!(source_id, error = %err, "source unreachable, skipping");
            out.status = SourceStatus::Skipped;
            out.message = Some(err.to_string());
            return Ok(out);
        }
        info!(source_id, "source reachable");

        let mut mapper = RowMapper::new(source_id, started_at, self.options.strict_audit);
        let migrator = Migrator::new(source, engine, &self.options.cancel);
        for kind in EntityKind::ALL {
            let source_rows = match source.table_rows(kind).await {
                Ok(Some(rows)) => rows,
                Ok(None) => {
                    info!(source_id, entity = %kind, "table {} not found, skipping", kind.table());
                    out.entities.push(EntityStats::new(kind));
                    continue;
                }
                Err(err) => {
                    error!(source_id, entity = %kind, error = %err, "cannot inspect source table");
                    out.status = SourceStatus::Failed;
                    out.message = Some(err.to_string());
                    return Ok(out);
                }
            };
            if source_rows == 0 {
                info!(source_id, entity = %kind, "no {kind} to migrate");
                let mut stats = EntityStats::new(kind);
                stats.source_rows = Some(0);
                out.entities.push(stats);
                continue;
            }
            info!(source_id, entity = %kind, source_rows, "found {source_rows} {kind}");

            let outcome = migrator.run(kind, None, &mut mapper).await;
            let mut stats = outcome.stats;
            stats.source_rows = Some(source_rows);
            out.entities.push(stats);
            match outcome.end {
                MigrationEnd::Completed => {}
                MigrationEnd::Cancelled => {
                    out.status = SourceStatus::Cancelled;
                    return Ok(out);
                }
                MigrationEnd::Aborted(err) if err.is_target_outage() => return Err(err),
                MigrationEnd::Aborted(err) => {
                    out.status = SourceStatus::Failed;
                    out.message = Some(err.to_string());
                    return Ok(out);
                }
            }
        }
        Ok(out)
    }

    /// Upserts rows modified after the stored checkpoint and advances it.
    ///
    /// The checkpoint moves to the run's start time only when every entity
    /// completed; any fatal error or a cancellation leaves it untouched.
    pub async fn incremental(
        &self,
        source: &dyn LegacySource,
        checkpoints: &dyn CheckpointStore,
    ) -> Result<RunSummary, SyncError> {
        let mut summary = RunSummary::new(RunMode::Incremental, Utc::now());
        let span = info_span!("incremental", run_id = %summary.run_id, source_id = %source.source_id());
        async {
            let since = checkpoints.read().await?;
            match since {
                Some(at) => info!(checkpoint = %at, "syncing rows modified since last run"),
                None => info!("no checkpoint found, syncing every row"),
            }
            summary.since = since;

            self.target.ping().await?;
            source.probe().await?;

            let engine = UpsertEngine::new(self.target, WriteMode::Upsert);
            let migrator = Migrator::new(source, &engine, &self.options.cancel);
            let mut mapper =
                RowMapper::new(source.source_id(), summary.started_at, self.options.strict_audit);
            let mut out = SourceSummary::new(source.source_id());

            for kind in EntityKind::ALL {
                let outcome = migrator.run(kind, since, &mut mapper).await;
                out.entities.push(outcome.stats);
                match outcome.end {
                    MigrationEnd::Completed => {}
                    MigrationEnd::Cancelled => {
                        out.status = SourceStatus::Cancelled;
                        summary.status = RunStatus::Cancelled;
                        break;
                    }
                    MigrationEnd::Aborted(err) => return Err(err),
                }
            }
            summary.sources.push(out);

            if summary.status == RunStatus::Completed {
                checkpoints.write(summary.started_at).await?;
                summary.checkpoint_written = Some(summary.started_at);
                info!(checkpoint = %summary.started_at, "checkpoint advanced");
            } else {
                warn!("run cancelled, checkpoint left unchanged");
            }

            summary.orphans = self.orphan_pass().await;
            Ok::<_, SyncError>(())
        }
        .instrument(span)
        .await?;

        summary.finished_at = Utc::now();
        Ok(summary)
    }

    /// Canonical table sizes; failures are logged and leave the map partial.
    pub async fn recount(&self) -> BTreeMap<String, u64> {
        let mut counts = BTreeMap::new();
        for kind in EntityKind::ALL {
            match self.target.count(kind).await {
                Ok(count) => {
                    info!(table = kind.table(), count, "canonical table size");
                    counts.insert(kind.table().to_string(), count);
                }
                Err(err) => warn!(table = kind.table(), error = %err, "recount failed"),
            }
        }
        counts
    }

    /// Lists dangling references without blocking the run on failure.
    pub async fn orphan_pass(&self) -> Vec<OrphanReference> {
        match self.target.orphans().await {
            Ok(orphans) => {
                if !orphans.is_empty() {
                    warn!(count = orphans.len(), "rows reference keys missing from the target");
                }
                orphans
            }
            Err(err) => {
                warn!(error = %err, "orphan check failed");
                Vec::new()
            }
        }
    }
}

pub(crate) fn source_id_of(err: &SourceError) -> &str {
    match err {
        SourceError::Unreachable { source_id, .. }
        | SourceError::Query { source_id, .. }
        | SourceError::MalformedRow { source_id, .. } => source_id,
    }
}
