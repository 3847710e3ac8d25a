use std::sync::Arc;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use clap::{Parser, Subcommand};
use tillsync_core::{CadenceTier, EntityKind};
use tillsync_storage::PgStore;
use tillsync_sync::{ops, pipeline_from_env, scheduler, JobOutcome, SyncConfig};
use tracing::info;

#[derive(Debug, Parser)]
#[command(name = "tillsync-cli")]
#[command(about = "Point-of-sale ledger sync operator tools")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Apply database migrations.
    Migrate,
    /// Run one tier's jobs once.
    Tick {
        /// Tier cadence in minutes: 2, 5, 30, 60 or 1440.
        #[arg(long, value_parser = parse_tier)]
        tier: CadenceTier,
    },
    /// Fire every tier on its cron schedule until Ctrl-C.
    Schedule,
    /// Re-fetch and reconcile an explicit range, one day at a time.
    Resync {
        #[arg(long, value_parser = parse_instant)]
        from: DateTime<Utc>,
        #[arg(long, value_parser = parse_instant)]
        to: DateTime<Utc>,
        #[arg(long)]
        scope: Option<String>,
        #[arg(long = "kind", value_parser = parse_kind)]
        kinds: Vec<EntityKind>,
    },
    /// Report rows sharing a business key.
    Duplicates {
        #[arg(long, value_parser = parse_kind)]
        kind: EntityKind,
        #[arg(long, value_parser = parse_instant)]
        from: DateTime<Utc>,
        #[arg(long, value_parser = parse_instant)]
        to: DateTime<Utc>,
    },
    /// Delete local rows in a range.
    Purge {
        #[arg(long, value_parser = parse_instant)]
        from: DateTime<Utc>,
        #[arg(long, value_parser = parse_instant)]
        to: DateTime<Utc>,
        #[arg(long, value_parser = parse_kind)]
        kind: Option<EntityKind>,
        #[arg(long)]
        yes: bool,
    },
    /// Count rows still pending for a derived field, e.g. `receipt.total_minor`.
    Pending {
        #[arg(long)]
        field: String,
    },
    /// Backfill one derived field now.
    Recompute {
        #[arg(long)]
        field: String,
        #[arg(long, value_delimiter = ',')]
        ids: Vec<i64>,
    },
}

fn parse_tier(raw: &str) -> Result<CadenceTier, String> {
    let minutes: u32 = raw
        .trim_end_matches('m')
        .parse()
        .map_err(|_| format!("`{raw}` is not a number of minutes"))?;
    CadenceTier::from_minutes(minutes).ok_or_else(|| format!("no tier runs every {minutes} minutes"))
}

fn parse_kind(raw: &str) -> Result<EntityKind, String> {
    raw.parse()
}

/// RFC 3339 instant, or a bare date meaning UTC midnight.
fn parse_instant(raw: &str) -> Result<DateTime<Utc>, String> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Ok(ts.with_timezone(&Utc));
    }
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|dt| dt.and_utc())
        .ok_or_else(|| format!("`{raw}` is neither RFC 3339 nor YYYY-MM-DD"))
}

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    match cli.command {
        Commands::Migrate => {
            let config = SyncConfig::from_env();
            let Some(url) = config.database_url.as_deref() else {
                bail!("DATABASE_URL must be set to run migrations");
            };
            let store = PgStore::connect(url, config.db_max_connections).await?;
            store.migrate().await?;
            println!("migrations applied");
        }
        Commands::Tick { tier } => {
            let pipeline = pipeline_from_env().await?;
            let orchestrator = pipeline.orchestrator()?;
            let report = orchestrator.run_tier(tier).await;
            println!(
                "tier {} run_id={} jobs={} failed={} skipped={}",
                report.tier,
                report.run_id,
                report.jobs.len(),
                report.failed(),
                report.skipped
            );
            for job in &report.jobs {
                match &job.result {
                    Ok(JobOutcome::Synced {
                        windows,
                        failed_windows,
                        fetched,
                        reconcile,
                    }) => println!(
                        "  {}: windows={windows} failed_windows={failed_windows} fetched={fetched} created={} updated={} unchanged={} stale={} failures={}",
                        job.job,
                        reconcile.created,
                        reconcile.updated,
                        reconcile.unchanged,
                        reconcile.stale,
                        reconcile.failures.len()
                    ),
                    Ok(JobOutcome::Recomputed {
                        reports,
                        failed_fields,
                    }) => {
                        println!("  {}: fields={} failed_fields={failed_fields}", job.job, reports.len());
                        for r in reports {
                            println!(
                                "    {}: pending={} written={} unresolved={} failed_rows={}",
                                r.field, r.pending, r.written, r.unresolved, r.failed_rows
                            );
                        }
                    }
                    Err(err) => println!("  {}: FAILED {err}", job.job),
                }
            }
        }
        Commands::Schedule => {
            let pipeline = pipeline_from_env().await?;
            let orchestrator = Arc::new(pipeline.orchestrator()?);
            let Some(mut sched) = scheduler::maybe_build_scheduler(orchestrator, true).await? else {
                bail!("scheduler could not be built");
            };
            sched.start().await.context("starting scheduler")?;
            info!("scheduler running; Ctrl-C to stop");
            tokio::signal::ctrl_c()
                .await
                .context("waiting for Ctrl-C")?;
            sched.shutdown().await.context("stopping scheduler")?;
            info!("scheduler stopped");
        }
        Commands::Resync {
            from,
            to,
            scope,
            kinds,
        } => {
            let pipeline = pipeline_from_env().await?;
            let report =
                ops::resync_range(&pipeline.sync_step(), from, to, scope, &kinds).await?;
            println!(
                "resync run_id={} windows={} failed_windows={} fetched={} created={} updated={} failures={}",
                report.run_id,
                report.windows,
                report.failed_windows.len(),
                report.fetched,
                report.reconcile.created,
                report.reconcile.updated,
                report.reconcile.failures.len()
            );
            for (min, max, reason) in &report.failed_windows {
                println!("  [{min}, {max}): {reason}");
            }
        }
        Commands::Duplicates { kind, from, to } => {
            let pipeline = pipeline_from_env().await?;
            let report = ops::duplicate_report(pipeline.store().as_ref(), kind, from, to).await?;
            print!("{}", report.render());
        }
        Commands::Purge {
            from,
            to,
            kind,
            yes,
        } => {
            if !yes {
                bail!("purge deletes local rows; re-run with --yes to confirm");
            }
            let pipeline = pipeline_from_env().await?;
            let removed = ops::purge_range(pipeline.store().as_ref(), kind, from, to).await?;
            println!("purged {removed} rows");
        }
        Commands::Pending { field } => {
            let pipeline = pipeline_from_env().await?;
            let count = ops::pending_count(pipeline.store().as_ref(), &field).await?;
            println!("{field}: {count} pending");
        }
        Commands::Recompute { field, ids } => {
            let pipeline = pipeline_from_env().await?;
            let only_ids = (!ids.is_empty()).then_some(ids.as_slice());
            let engine = pipeline.recompute_engine();
            let report = ops::recompute_field(&engine, &field, only_ids).await?;
            println!(
                "{}: pending={} chunks={} written={} unresolved={} skipped={} failed_rows={} failed_chunks={}",
                report.field,
                report.pending,
                report.chunks,
                report.written,
                report.unresolved,
                report.skipped,
                report.failed_rows,
                report.failed_chunks
            );
        }
    }

    Ok(())
}
