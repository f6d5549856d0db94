use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::EnvFilter;
use uslt_core::{Clock, SystemClock};
use uslt_storage::PgSponsorStore;
use uslt_sync::{open_store, pipeline_from_config, run_scheduler_until_shutdown, SyncConfig};

#[derive(Debug, Parser)]
#[command(name = "uslt-cli")]
#[command(about = "UK sponsor licence register tracker")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Fetch today's register and reconcile it against the store.
    Sync {
        /// Ingest a local register CSV instead of downloading it.
        #[arg(long)]
        csv: Option<PathBuf>,
        /// Reconcile and print counts without committing.
        #[arg(long)]
        dry_run: bool,
    },
    /// Apply database migrations.
    Migrate,
    /// Serve the JSON API.
    Serve,
    /// Run the sync on the configured cron schedule until ctrl-c.
    Schedule,
    /// Print register statistics as JSON.
    Stats,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .from_env_lossy(),
        )
        .init();

    let cli = Cli::parse();
    let command = cli.command.unwrap_or(Commands::Sync {
        csv: None,
        dry_run: false,
    });

    match command {
        Commands::Sync { csv, dry_run } => {
            let config = SyncConfig {
                dry_run,
                ..SyncConfig::from_env()
            };
            let pipeline = pipeline_from_config(config, csv).await?;
            let outcome = pipeline.run_once().await.context("sync run failed")?;
            println!(
                "sync complete: run_id={} date={} new={} removed={} retained={} lapsed={} dry_run={}",
                outcome.run_id,
                outcome.date,
                outcome.new_entries,
                outcome.removed_entries,
                outcome.retained_entries,
                outcome.lapsed_entries,
                outcome.dry_run
            );
        }
        Commands::Migrate => {
            let url = std::env::var("DATABASE_URL").context("DATABASE_URL must be set")?;
            let store = PgSponsorStore::connect(&url)
                .await
                .context("connecting to postgres")?;
            store.migrate().await.context("applying migrations")?;
            info!("migrations applied");
        }
        Commands::Serve => uslt_web::serve_from_env().await?,
        Commands::Schedule => {
            let pipeline = pipeline_from_config(SyncConfig::from_env(), None).await?;
            run_scheduler_until_shutdown(Arc::new(pipeline)).await?;
        }
        Commands::Stats => {
            let store = open_store(&SyncConfig::from_env()).await?;
            let stats = store
                .aggregate_counts(SystemClock.today(), 10)
                .await
                .context("reading register statistics")?;
            println!("{}", serde_json::to_string_pretty(&stats)?);
        }
    }

    Ok(())
}
