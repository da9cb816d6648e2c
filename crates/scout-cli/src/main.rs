use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use scout_core::{SyncOutcome, SyncScope, SyncStatus};
use scout_sync::{connect_database, maybe_build_scheduler, run_migrations, SyncConfig, SyncPipeline};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "scout-cli")]
#[command(about = "Multi-source player reconciliation")]
struct Cli {
    /// Print outcomes as JSON instead of a summary line.
    #[arg(long, global = true)]
    json: bool,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Sync one league from every configured source.
    Sync {
        #[arg(long, default_value = "MLS")]
        league: String,
    },
    /// Sync each league in SCOUT_LEAGUES in turn.
    SyncAll,
    Migrate,
    /// Show recent sync attempts.
    History {
        #[arg(long, default_value_t = 10)]
        limit: usize,
    },
    /// Run the cron scheduler until interrupted.
    Schedule,
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
}

fn print_outcome(outcome: &SyncOutcome, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(outcome).context("serializing outcome")?);
        return Ok(());
    }
    let sync_id = outcome
        .sync_id
        .map(|id| id.to_string())
        .unwrap_or_else(|| "-".to_string());
    println!(
        "sync {}: league={} status={} players={} persisted={} failed_upserts={} duration={:.1}s",
        sync_id,
        outcome.league,
        outcome.status,
        outcome.total_canonical_records,
        outcome.persisted_records,
        outcome.persistence_failures,
        outcome.duration_seconds
    );
    for (source, count) in &outcome.per_source_counts {
        println!("  {source}: {count} records");
    }
    for error in &outcome.errors {
        println!("  error: {error}");
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    init_tracing();
    let cli = Cli::parse();
    let config = SyncConfig::from_env();

    match cli.command.unwrap_or(Commands::Sync {
        league: "MLS".to_string(),
    }) {
        Commands::Sync { league } => {
            let pipeline = SyncPipeline::from_config(&config).await?;
            let mut log_progress =
                |fraction: f64, message: &str| info!(progress = fraction, "{message}");
            let outcome = pipeline.run(&SyncScope::new(league), &mut log_progress).await;
            print_outcome(&outcome, cli.json)?;
            if outcome.status == SyncStatus::Failed {
                bail!("sync failed");
            }
        }
        Commands::SyncAll => {
            let pipeline = SyncPipeline::from_config(&config).await?;
            let mut log_progress =
                |fraction: f64, message: &str| info!(progress = fraction, "{message}");
            let outcomes = pipeline.run_all(&config.leagues, &mut log_progress).await;
            for outcome in &outcomes {
                print_outcome(outcome, cli.json)?;
            }
            let failed = outcomes
                .iter()
                .filter(|o| o.status == SyncStatus::Failed)
                .count();
            if failed > 0 {
                bail!("{failed} of {} league syncs failed", outcomes.len());
            }
        }
        Commands::Migrate => {
            let Some(url) = config.database_url.as_deref() else {
                bail!("DATABASE_URL must be set to run migrations");
            };
            let pool = connect_database(url).await?;
            run_migrations(&pool).await?;
            println!("migrations applied");
        }
        Commands::History { limit } => {
            let pipeline = SyncPipeline::from_config(&config).await?;
            let records = pipeline.ledger().recent(limit).await?;
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&records)?);
                return Ok(());
            }
            if records.is_empty() {
                println!("no syncs recorded");
            }
            for record in &records {
                println!(
                    "{:>6}  {:<20} {:<9} records={:<5} started={} {}",
                    record.id.to_string(),
                    record.league,
                    record.status.as_str(),
                    record.records_synced,
                    record.started_at.format("%Y-%m-%d %H:%M:%S"),
                    record.error.as_deref().unwrap_or("")
                );
            }
        }
        Commands::Schedule => {
            let pipeline = Arc::new(SyncPipeline::from_config(&config).await?);
            let Some(sched) = maybe_build_scheduler(pipeline, &config).await? else {
                bail!("scheduler disabled; set SCOUT_SCHEDULER_ENABLED=true");
            };
            sched.start().await.context("starting scheduler")?;
            info!(cron = %config.sync_cron, leagues = ?config.leagues, "scheduler running");
            tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
            info!("shutting down scheduler");
        }
    }

    Ok(())
}
