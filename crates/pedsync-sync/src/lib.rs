//! Legacy-to-canonical replication: configuration, migrators, orchestration and scheduling.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use pedsync_adapters::{
    load_fixture_bundle, FixtureSource, LegacySource, PgLegacySource, SourceError,
};
use pedsync_core::EntityKind;
use pedsync_storage::{
    CheckpointError, CheckpointStore, FileCheckpointStore, OrphanReference, PgTargetStore,
    PoolSettings, StoreError, TargetStore,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::fs;
use tokio::sync::Mutex;
use tokio_cron_scheduler::{Job, JobScheduler};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

pub mod mapping;
pub mod migrator;
pub mod pipeline;
pub mod report;

pub use mapping::RowMapper;
pub use migrator::{EntityStats, MigrationEnd, MigrationOutcome, Migrator};
pub use pipeline::{
    PipelineOptions, RunMode, RunStatus, RunSummary, SourceStatus, SourceSummary, SyncPipeline,
};
pub use report::{render_markdown, render_text, write_reports};

pub const CRATE_NAME: &str = "pedsync-sync";

/// Run-level failure. Row-level problems never surface here.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    Source(#[from] SourceError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),
}

impl SyncError {
    pub fn is_target_outage(&self) -> bool {
        matches!(self, SyncError::Store(_))
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SourceRegistry {
    pub sources: Vec<SourceConfig>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SourceConfig {
    pub source_id: String,
    pub display_name: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Literal connection string. Prefer `url_env` for anything with credentials.
    #[serde(default)]
    pub url: Option<String>,
    /// Name of the environment variable holding the connection string.
    #[serde(default)]
    pub url_env: Option<String>,
    /// Fixture bundle replayed instead of a live database, relative to the workspace root.
    #[serde(default)]
    pub fixture: Option<PathBuf>,
    /// Source read by incremental runs.
    #[serde(default)]
    pub primary: bool,
    #[serde(default)]
    pub notes: Option<String>,
}

fn default_enabled() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceLocation {
    Database(String),
    Fixture(PathBuf),
}

impl SourceConfig {
    pub fn location(
        &self,
        workspace_root: &Path,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<SourceLocation> {
        if let Some(fixture) = &self.fixture {
            return Ok(SourceLocation::Fixture(workspace_root.join(fixture)));
        }
        if let Some(var) = &self.url_env {
            return match lookup(var) {
                Some(url) if !url.trim().is_empty() => Ok(SourceLocation::Database(url)),
                _ => bail!("environment variable {var} is not set"),
            };
        }
        match &self.url {
            Some(url) => Ok(SourceLocation::Database(url.clone())),
            None => bail!("source {} has no url, url_env or fixture", self.source_id),
        }
    }
}

impl SourceRegistry {
    pub fn parse(text: &str) -> Result<Self> {
        let registry: SourceRegistry = serde_yaml::from_str(text)?;
        let mut seen = BTreeSet::new();
        for source in &registry.sources {
            if !seen.insert(source.source_id.as_str()) {
                bail!("source {} is listed twice", source.source_id);
            }
        }
        Ok(registry)
    }

    pub fn enabled(&self) -> impl Iterator<Item = &SourceConfig> {
        self.sources.iter().filter(|s| s.enabled)
    }

    /// The source an incremental run reads: the requested one, else the single
    /// primary, else the only enabled source.
    pub fn incremental_source(&self, requested: Option<&str>) -> Result<&SourceConfig> {
        if let Some(id) = requested {
            return self
                .sources
                .iter()
                .find(|s| s.source_id == id)
                .with_context(|| format!("source {id} is not in the registry"));
        }
        let primaries: Vec<_> = self.enabled().filter(|s| s.primary).collect();
        match primaries.as_slice() {
            [one] => return Ok(one),
            [] => {}
            _ => bail!("more than one enabled source is marked primary"),
        }
        let enabled: Vec<_> = self.enabled().collect();
        match enabled.as_slice() {
            [one] => Ok(one),
            _ => bail!("no primary source configured; pass --source"),
        }
    }
}

pub async fn load_source_registry(path: &Path) -> Result<SourceRegistry> {
    let text = fs::read_to_string(path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;
    SourceRegistry::parse(&text).with_context(|| format!("parsing {}", path.display()))
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub database_url: Option<String>,
    pub sources_file: PathBuf,
    pub checkpoint_path: PathBuf,
    pub reports_dir: PathBuf,
    pub pool: PoolSettings,
    pub strict_audit: bool,
    pub scheduler_enabled: bool,
    pub sync_cron: String,
    pub workspace_root: PathBuf,
}

impl SyncConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let flag = |key: &str| {
            lookup(key)
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(false)
        };
        let number = |key: &str, default: u64| {
            lookup(key)
                .and_then(|v| v.trim().parse::<u64>().ok())
                .unwrap_or(default)
        };
        let defaults = PoolSettings::default();
        Self {
            database_url: lookup("DATABASE_URL").filter(|v| !v.trim().is_empty()),
            sources_file: lookup("PEDSYNC_SOURCES_FILE")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("sources.yaml")),
            checkpoint_path: lookup("PEDSYNC_CHECKPOINT_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(".last-sync-timestamp")),
            reports_dir: lookup("PEDSYNC_REPORTS_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("reports")),
            pool: PoolSettings {
                max_connections: number("PEDSYNC_POOL_SIZE", defaults.max_connections as u64)
                    .clamp(1, u32::MAX as u64) as u32,
                connect_timeout: Duration::from_secs(number(
                    "PEDSYNC_CONNECT_TIMEOUT_SECS",
                    defaults.connect_timeout.as_secs(),
                )),
                idle_timeout: Duration::from_secs(number(
                    "PEDSYNC_IDLE_TIMEOUT_SECS",
                    defaults.idle_timeout.as_secs(),
                )),
            },
            strict_audit: flag("PEDSYNC_STRICT_AUDIT"),
            scheduler_enabled: flag("PEDSYNC_SCHEDULER_ENABLED"),
            sync_cron: lookup("PEDSYNC_SYNC_CRON").unwrap_or_else(|| "0 0 2 * * Sun".to_string()),
            workspace_root: PathBuf::from("."),
        }
    }

    pub fn require_database_url(&self) -> Result<&str> {
        self.database_url
            .as_deref()
            .context("DATABASE_URL environment variable is not set")
    }

    fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.workspace_root.join(path)
        }
    }

    pub fn sources_file_path(&self) -> PathBuf {
        self.resolve(&self.sources_file)
    }

    pub fn checkpoint_file_path(&self) -> PathBuf {
        self.resolve(&self.checkpoint_path)
    }

    pub fn reports_root(&self) -> PathBuf {
        self.resolve(&self.reports_dir)
    }

    fn pipeline_options(&self, cancel: CancellationToken) -> PipelineOptions {
        PipelineOptions {
            strict_audit: self.strict_audit,
            cancel,
        }
    }
}

/// Opens a registry entry; failures become an unreachable-source error.
pub fn open_source(
    config: &SyncConfig,
    source: &SourceConfig,
) -> Result<Box<dyn LegacySource>, SourceError> {
    let unreachable = |err: anyhow::Error| SourceError::Unreachable {
        source_id: source.source_id.clone(),
        message: format!("{err:#}"),
    };
    let location = source
        .location(&config.workspace_root, |key| std::env::var(key).ok())
        .map_err(unreachable)?;
    match location {
        SourceLocation::Database(url) => {
            let pg = PgLegacySource::connect_lazy(&source.source_id, &url, config.pool)?;
            Ok(Box::new(pg))
        }
        SourceLocation::Fixture(path) => {
            let mut bundle = load_fixture_bundle(&path).map_err(unreachable)?;
            bundle.source_id = source.source_id.clone();
            Ok(Box::new(FixtureSource::new(bundle)))
        }
    }
}

async fn close_sources(sources: &[Result<Box<dyn LegacySource>, SourceError>]) {
    for source in sources.iter().flatten() {
        source.close().await;
    }
}

/// One consolidation pass; every opened source is closed before returning.
pub async fn run_consolidation(
    target: &dyn TargetStore,
    sources: &[Result<Box<dyn LegacySource>, SourceError>],
    options: PipelineOptions,
) -> Result<RunSummary, SyncError> {
    let result = SyncPipeline::new(target, options).consolidate(sources).await;
    close_sources(sources).await;
    result
}

/// One incremental pass; the source is closed before returning.
pub async fn run_incremental(
    target: &dyn TargetStore,
    source: &dyn LegacySource,
    checkpoints: &dyn CheckpointStore,
    options: PipelineOptions,
) -> Result<RunSummary, SyncError> {
    let result = SyncPipeline::new(target, options)
        .incremental(source, checkpoints)
        .await;
    source.close().await;
    result
}

async fn connect_target(config: &SyncConfig) -> Result<PgTargetStore> {
    let url = config.require_database_url()?;
    PgTargetStore::connect(url, config.pool)
        .await
        .context("connecting to the canonical database")
}

pub async fn run_consolidation_from_env(cancel: CancellationToken) -> Result<(RunSummary, PathBuf)> {
    let config = SyncConfig::from_env();
    let registry = load_source_registry(&config.sources_file_path()).await?;
    let target = connect_target(&config).await?;
    let sources: Vec<_> = registry
        .enabled()
        .map(|source| open_source(&config, source))
        .collect();
    info!(sources = sources.len(), "starting consolidation");

    let result = run_consolidation(&target, &sources, config.pipeline_options(cancel)).await;
    target.close().await;
    let summary = result.context("consolidation aborted")?;

    let reports_dir = write_reports(&config.reports_root(), &summary).await?;
    Ok((summary, reports_dir))
}

pub async fn run_incremental_from_env(
    source_id: Option<&str>,
    cancel: CancellationToken,
) -> Result<(RunSummary, PathBuf)> {
    let config = SyncConfig::from_env();
    let registry = load_source_registry(&config.sources_file_path()).await?;
    let source_config = registry.incremental_source(source_id)?;
    let source = open_source(&config, source_config)
        .with_context(|| format!("opening source {}", source_config.source_id))?;
    let target = match connect_target(&config).await {
        Ok(target) => target,
        Err(err) => {
            source.close().await;
            return Err(err);
        }
    };
    let checkpoints = FileCheckpointStore::new(config.checkpoint_file_path());

    let result = run_incremental(
        &target,
        source.as_ref(),
        &checkpoints,
        config.pipeline_options(cancel),
    )
    .await;
    target.close().await;
    let summary = result.context("incremental sync aborted")?;

    let reports_dir = write_reports(&config.reports_root(), &summary).await?;
    Ok((summary, reports_dir))
}

#[derive(Debug, Clone, Serialize)]
pub struct EndpointCheck {
    pub name: String,
    pub reachable: bool,
    pub message: Option<String>,
    /// Row counts by table; `None` marks a table missing from a source.
    pub tables: BTreeMap<String, Option<u64>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct VerifyReport {
    pub target: EndpointCheck,
    pub sources: Vec<EndpointCheck>,
}

impl VerifyReport {
    pub fn healthy(&self) -> bool {
        self.target.reachable && self.sources.iter().any(|s| s.reachable)
    }
}

/// Probes the target and every source and reads their table sizes.
pub async fn verify(
    target: Result<&dyn TargetStore, String>,
    sources: &[Result<Box<dyn LegacySource>, SourceError>],
) -> VerifyReport {
    let target_check = match target {
        Ok(target) => {
            let mut check = EndpointCheck {
                name: "target".to_string(),
                reachable: true,
                message: None,
                tables: BTreeMap::new(),
            };
            match target.ping().await {
                Ok(()) => {
                    for kind in EntityKind::ALL {
                        match target.count(kind).await {
                            Ok(count) => {
                                check.tables.insert(kind.table().to_string(), Some(count));
                            }
                            Err(err) => {
                                check.message = Some(err.to_string());
                            }
                        }
                    }
                }
                Err(err) => {
                    check.reachable = false;
                    check.message = Some(err.to_string());
                }
            }
            check
        }
        Err(message) => EndpointCheck {
            name: "target".to_string(),
            reachable: false,
            message: Some(message),
            tables: BTreeMap::new(),
        },
    };

    let mut checks = Vec::new();
    for source in sources {
        let source = match source {
            Ok(source) => source,
            Err(err) => {
                checks.push(EndpointCheck {
                    name: pipeline::source_id_of(err).to_string(),
                    reachable: false,
                    message: Some(err.to_string()),
                    tables: BTreeMap::new(),
                });
                continue;
            }
        };
        let mut check = EndpointCheck {
            name: source.source_id().to_string(),
            reachable: true,
            message: None,
            tables: BTreeMap::new(),
        };
        if let Err(err) = source.probe().await {
            warn!(source_id = source.source_id(), error = %err, "source unreachable");
            check.reachable = false;
            check.message = Some(err.to_string());
        } else {
            for kind in EntityKind::ALL {
                match source.table_rows(kind).await {
                    Ok(rows) => {
                        check.tables.insert(kind.table().to_string(), rows);
                    }
                    Err(err) => check.message = Some(err.to_string()),
                }
            }
        }
        checks.push(check);
    }

    VerifyReport {
        target: target_check,
        sources: checks,
    }
}

pub async fn verify_from_env() -> Result<VerifyReport> {
    let config = SyncConfig::from_env();
    let registry = load_source_registry(&config.sources_file_path()).await?;
    let target = connect_target(&config).await;
    let sources: Vec<_> = registry
        .enabled()
        .map(|source| open_source(&config, source))
        .collect();

    let report = match &target {
        Ok(target) => verify(Ok(target as &dyn TargetStore), &sources).await,
        Err(err) => verify(Err(format!("{err:#}")), &sources).await,
    };
    close_sources(&sources).await;
    if let Ok(target) = &target {
        target.close().await;
    }
    Ok(report)
}

pub async fn migrate_schema_from_env() -> Result<()> {
    let config = SyncConfig::from_env();
    let target = connect_target(&config).await?;
    let result = target.migrate().await;
    target.close().await;
    result
}

pub async fn orphans_from_env() -> Result<Vec<OrphanReference>> {
    let config = SyncConfig::from_env();
    let target = connect_target(&config).await?;
    let result = target.orphans().await;
    target.close().await;
    Ok(result?)
}

pub async fn recount_participants_from_env() -> Result<u64> {
    let config = SyncConfig::from_env();
    let target = connect_target(&config).await?;
    let result = target.recount_participants().await;
    target.close().await;
    let updated = result?;
    info!(trainings = updated, "participant counts recomputed");
    Ok(updated)
}

/// Scheduler running the incremental sync on `cron`; overlapping ticks are skipped.
pub async fn build_scheduler(cron: &str, cancel: CancellationToken) -> Result<JobScheduler> {
    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let running = Arc::new(Mutex::new(()));
    let job = Job::new_async(cron, move |_uuid, _lock| {
        let running = running.clone();
        let cancel = cancel.clone();
        Box::pin(async move {
            let Ok(_guard) = running.try_lock() else {
                warn!("previous sync still running, skipping this tick");
                return;
            };
            match run_incremental_from_env(None, cancel.child_token()).await {
                Ok((summary, reports_dir)) => info!(
                    run_id = %summary.run_id,
                    status = ?summary.status,
                    reports_dir = %reports_dir.display(),
                    "scheduled sync finished"
                ),
                Err(err) => error!(error = %format!("{err:#}"), "scheduled sync failed"),
            }
        })
    })
    .with_context(|| format!("creating scheduler job for cron {cron}"))?;
    sched.add(job).await.context("adding scheduler job")?;
    Ok(sched)
}

pub async fn maybe_build_scheduler(
    config: &SyncConfig,
    cancel: CancellationToken,
) -> Result<Option<JobScheduler>> {
    if !config.scheduler_enabled {
        return Ok(None);
    }
    build_scheduler(&config.sync_cron, cancel).await.map(Some)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    const REGISTRY: &str = r#"
sources:
  - source_id: legacy-main
    display_name: Main legacy database
    url_env: LEGACY_MAIN_URL
    primary: true
  - source_id: legacy-province
    display_name: Provincial office copy
    url_env: LEGACY_PROVINCE_URL
  - source_id: legacy-archive
    display_name: Archived 2022 snapshot
    enabled: false
    fixture: fixtures/archive.json
"#;

    #[test]
    fn registry_parses_and_picks_primary() {
        let registry = SourceRegistry::parse(REGISTRY).expect("parse");
        assert_eq!(registry.enabled().count(), 2);
        let primary = registry.incremental_source(None).expect("primary");
        assert_eq!(primary.source_id, "legacy-main");
        let explicit = registry
            .incremental_source(Some("legacy-province"))
            .expect("explicit");
        assert_eq!(explicit.source_id, "legacy-province");
        assert!(registry.incremental_source(Some("nope")).is_err());
    }

    #[test]
    fn duplicate_source_ids_are_rejected() {
        let text = r#"
sources:
  - { source_id: a, display_name: A, url: "postgres://x" }
  - { source_id: a, display_name: A again, url: "postgres://y" }
"#;
        assert!(SourceRegistry::parse(text).is_err());
    }

    #[test]
    fn url_env_is_resolved_from_lookup() {
        let registry = SourceRegistry::parse(REGISTRY).expect("parse");
        let env: HashMap<&str, &str> = [("LEGACY_MAIN_URL", "postgres://legacy/main")].into();
        let lookup = |k: &str| env.get(k).map(|v| v.to_string());

        let main = registry.sources[0].location(Path::new("."), lookup).expect("main");
        assert_eq!(main, SourceLocation::Database("postgres://legacy/main".to_string()));

        let province = registry.sources[1].location(Path::new("."), lookup);
        assert!(province.is_err());

        let archive = registry.sources[2].location(Path::new("/srv"), lookup).expect("archive");
        assert_eq!(archive, SourceLocation::Fixture(PathBuf::from("/srv/fixtures/archive.json")));
    }

    #[test]
    fn config_defaults_match_weekly_schedule() {
        let config = SyncConfig::from_lookup(|_| None);
        assert_eq!(config.database_url, None);
        assert_eq!(config.checkpoint_path, PathBuf::from(".last-sync-timestamp"));
        assert_eq!(config.pool.max_connections, 5);
        assert_eq!(config.pool.connect_timeout, Duration::from_secs(30));
        assert_eq!(config.sync_cron, "0 0 2 * * Sun");
        assert!(!config.strict_audit);
        assert!(config.require_database_url().is_err());
    }

    #[test]
    fn config_reads_overrides() {
        let env: HashMap<&str, &str> = [
            ("DATABASE_URL", "postgres://target/db"),
            ("PEDSYNC_POOL_SIZE", "2"),
            ("PEDSYNC_STRICT_AUDIT", "true"),
            ("PEDSYNC_CHECKPOINT_PATH", "/var/lib/pedsync/checkpoint"),
        ]
        .into();
        let config = SyncConfig::from_lookup(|k| env.get(k).map(|v| v.to_string()));
        assert_eq!(config.require_database_url().unwrap(), "postgres://target/db");
        assert_eq!(config.pool.max_connections, 2);
        assert!(config.strict_audit);
        assert_eq!(
            config.checkpoint_file_path(),
            PathBuf::from("/var/lib/pedsync/checkpoint")
        );
    }
}
