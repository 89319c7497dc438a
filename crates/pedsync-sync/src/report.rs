use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tokio::fs;

use crate::pipeline::{RunMode, RunSummary};

/// Writes `run_summary.json` and `summary.md` under `<reports_root>/<run_id>/`.
pub async fn write_reports(reports_root: &Path, summary: &RunSummary) -> Result<PathBuf> {
    let reports_dir = reports_root.join(summary.run_id.to_string());
    fs::create_dir_all(&reports_dir)
        .await
        .with_context(|| format!("creating {}", reports_dir.display()))?;

    let json = serde_json::to_vec_pretty(summary).context("serializing run summary")?;
    fs::write(reports_dir.join("run_summary.json"), json)
        .await
        .context("writing run_summary.json")?;

    fs::write(reports_dir.join("summary.md"), render_markdown(summary))
        .await
        .context("writing summary.md")?;

    Ok(reports_dir)
}

pub fn render_markdown(summary: &RunSummary) -> String {
    let mode = match summary.mode {
        RunMode::Consolidate => "Consolidation",
        RunMode::Incremental => "Incremental sync",
    };
    let mut out = format!(
        "# {mode} run\n\n- Run ID: `{}`\n- Status: {:?}\n- Started: {}\n- Finished: {}\n",
        summary.run_id, summary.status, summary.started_at, summary.finished_at
    );
    if summary.mode == RunMode::Incremental {
        let since = summary
            .since
            .map(|at| at.to_rfc3339())
            .unwrap_or_else(|| "beginning".to_string());
        let _ = writeln!(out, "- Since: {since}");
        match summary.checkpoint_written {
            Some(at) => {
                let _ = writeln!(out, "- Checkpoint advanced to: {}", at.to_rfc3339());
            }
            None => out.push_str("- Checkpoint unchanged\n"),
        }
    }

    out.push_str("\n## Totals\n\n| entity | extracted | inserted | updated | skipped | failed | coerced |\n|---|---|---|---|---|---|---|\n");
    for t in summary.totals() {
        let _ = writeln!(
            out,
            "| {} | {} | {} | {} | {} | {} | {} |",
            t.entity, t.extracted, t.inserted, t.updated, t.skipped, t.failed, t.coerced
        );
    }

    out.push_str("\n## Sources\n");
    for source in &summary.sources {
        let _ = write!(out, "\n### {} ({:?})\n", source.source_id, source.status);
        if let Some(message) = &source.message {
            let _ = writeln!(out, "\n> {message}");
        }
        for stats in &source.entities {
            let _ = writeln!(
                out,
                "- {}: {} of {} rows succeeded",
                stats.entity,
                stats.succeeded(),
                stats.extracted
            );
        }
    }

    if !summary.target_counts.is_empty() {
        out.push_str("\n## Canonical tables\n");
        for (table, count) in &summary.target_counts {
            let _ = writeln!(out, "- {table}: {count}");
        }
    }

    if !summary.orphans.is_empty() {
        let _ = write!(out, "\n## Orphaned references ({})\n", summary.orphans.len());
        for orphan in &summary.orphans {
            let _ = writeln!(
                out,
                "- {} `{}`: {} `{}` not found",
                orphan.kind, orphan.natural_key, orphan.column, orphan.missing_key
            );
        }
    }
    out
}

/// Short end-of-run lines for the terminal.
pub fn render_text(summary: &RunSummary) -> String {
    let mut out = format!("run {} {:?}\n", summary.run_id, summary.status);
    for t in summary.totals() {
        let _ = writeln!(
            out,
            "  {}: {} of {} rows succeeded ({} inserted, {} updated, {} skipped, {} failed)",
            t.entity,
            t.succeeded(),
            t.extracted,
            t.inserted,
            t.updated,
            t.skipped,
            t.failed
        );
    }
    for source in &summary.sources {
        if let Some(message) = &source.message {
            let _ = writeln!(out, "  {} {:?}: {message}", source.source_id, source.status);
        }
    }
    if !summary.orphans.is_empty() {
        let _ = writeln!(out, "  {} orphaned references", summary.orphans.len());
    }
    out
}
