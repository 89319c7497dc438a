use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use pedsync_sync::{render_text, RunStatus, RunSummary, SyncConfig};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "pedsync")]
#[command(about = "Replicates legacy training-management databases into the canonical schema")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Backfill every enabled source, keeping rows already in the target.
    Consolidate,
    /// Upsert rows changed since the last checkpoint from one source.
    Sync {
        /// Registry id of the source; defaults to the primary one.
        #[arg(long)]
        source: Option<String>,
    },
    /// Run the incremental sync on a cron schedule until interrupted.
    Schedule {
        /// Six-field cron expression; overrides PEDSYNC_SYNC_CRON.
        #[arg(long)]
        cron: Option<String>,
    },
    /// Check connectivity and table sizes of the target and every source.
    Verify,
    /// Apply the canonical schema migrations.
    Migrate,
    /// List enrollments and attendance records pointing at missing rows.
    Orphans,
    /// Recompute each training's participant count from its enrollments.
    RecountParticipants,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "pedsync_cli=info,pedsync_sync=info,pedsync_adapters=info,pedsync_storage=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let cancel = CancellationToken::new();
    spawn_interrupt_handler(cancel.clone());

    match cli
        .command
        .unwrap_or(Commands::Sync { source: None })
    {
        Commands::Consolidate => {
            let (summary, reports_dir) =
                pedsync_sync::run_consolidation_from_env(cancel.clone()).await?;
            finish(&summary, &reports_dir.display().to_string())?;
        }
        Commands::Sync { source } => {
            let (summary, reports_dir) =
                pedsync_sync::run_incremental_from_env(source.as_deref(), cancel.clone()).await?;
            finish(&summary, &reports_dir.display().to_string())?;

            let config = SyncConfig::from_env();
            if let Some(sched) = pedsync_sync::maybe_build_scheduler(&config, cancel.clone()).await? {
                run_until_cancelled(sched, &config.sync_cron, cancel).await?;
            }
        }
        Commands::Schedule { cron } => {
            let config = SyncConfig::from_env();
            let cron = cron.unwrap_or(config.sync_cron);
            let sched = pedsync_sync::build_scheduler(&cron, cancel.clone()).await?;
            run_until_cancelled(sched, &cron, cancel).await?;
        }
        Commands::Verify => {
            let report = pedsync_sync::verify_from_env().await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            if !report.healthy() {
                bail!("target or every source is unreachable");
            }
        }
        Commands::Migrate => {
            pedsync_sync::migrate_schema_from_env().await?;
            println!("canonical schema is up to date");
        }
        Commands::Orphans => {
            let orphans = pedsync_sync::orphans_from_env().await?;
            for orphan in &orphans {
                println!(
                    "{} {}: {} {} not found",
                    orphan.kind, orphan.natural_key, orphan.column, orphan.missing_key
                );
            }
            println!("{} orphaned references", orphans.len());
        }
        Commands::RecountParticipants => {
            let updated = pedsync_sync::recount_participants_from_env().await?;
            println!("participant counts recomputed for {updated} trainings");
        }
    }

    Ok(())
}

fn spawn_interrupt_handler(cancel: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, stopping after the current row");
            cancel.cancel();
        }
    });
}

fn finish(summary: &RunSummary, reports_dir: &str) -> Result<()> {
    print!("{}", render_text(summary));
    println!("reports: {reports_dir}");
    match summary.status {
        RunStatus::Completed => Ok(()),
        RunStatus::Cancelled => bail!("run {} was cancelled", summary.run_id),
        RunStatus::Failed => bail!("run {} failed: no source could be reached", summary.run_id),
    }
}

async fn run_until_cancelled(
    mut sched: tokio_cron_scheduler::JobScheduler,
    cron: &str,
    cancel: CancellationToken,
) -> Result<()> {
    sched.start().await?;
    info!(cron, "scheduler started");
    cancel.cancelled().await;
    sched.shutdown().await?;
    info!("scheduler stopped");
    Ok(())
}
