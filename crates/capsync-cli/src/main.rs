use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use capsync_core::EntityCounts;
use capsync_feed::{FixtureFeed, MarketFeed};
use capsync_storage::{EntityStore, MemoryStore, PgStore};
use capsync_sync::{
    build_live_feed, connect_store, PhaseSummary, SyncConfig, SyncPipeline, SyncRunSummary,
};
use clap::{Args, Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "capsync")]
#[command(about = "Coin directory and metadata sync")]
struct Cli {
    /// YAML file layered over the environment configuration.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one sync pass.
    Sync(SyncArgs),
    /// Apply pending schema migrations.
    Migrate,
    /// Print row counts per table.
    Status {
        #[arg(long)]
        json: bool,
    },
    /// Run sync passes on the configured cron schedule until interrupted.
    Schedule,
}

#[derive(Debug, Default, Args)]
struct SyncArgs {
    /// Replay recorded responses from this directory instead of the live API.
    #[arg(long)]
    fixtures: Option<PathBuf>,
    /// Replay a raw response archive written by a previous live run.
    #[arg(long, conflicts_with = "fixtures")]
    replay_archive: Option<PathBuf>,
    /// Write to an in-memory store instead of PostgreSQL.
    #[arg(long)]
    dry_run: bool,
    #[arg(long)]
    batch_size: Option<usize>,
    #[arg(long)]
    page_size: Option<usize>,
    #[arg(long)]
    request_delay_ms: Option<u64>,
    #[arg(long)]
    max_retries: Option<usize>,
    #[arg(long)]
    skip_directory: bool,
    #[arg(long)]
    skip_metadata: bool,
    #[arg(long)]
    skip_listings: bool,
    /// Print the run summary as JSON.
    #[arg(long)]
    json: bool,
}

impl SyncArgs {
    fn apply(&self, mut config: SyncConfig) -> SyncConfig {
        if let Some(batch_size) = self.batch_size {
            config.batch_size = batch_size;
        }
        if let Some(page_size) = self.page_size {
            config.page_size = page_size;
        }
        if let Some(delay) = self.request_delay_ms {
            config.request_delay = Duration::from_millis(delay);
        }
        if let Some(max_retries) = self.max_retries {
            config.retry.max_retries = max_retries;
        }
        config.phases.directory &= !self.skip_directory;
        config.phases.metadata &= !self.skip_metadata;
        config.phases.listings &= !self.skip_listings;
        config
    }
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,sqlx=warn")),
        )
        .with_writer(std::io::stderr)
        .init();
}

fn load_config(path: Option<&PathBuf>) -> Result<SyncConfig> {
    let config = SyncConfig::from_env();
    match path {
        Some(path) => config.with_yaml_overlay(path),
        None => Ok(config),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let config = load_config(cli.config.as_ref())?;

    match cli.command.unwrap_or(Commands::Sync(SyncArgs::default())) {
        Commands::Sync(args) => {
            let config = args.apply(config);
            let pipeline = assemble(config, &args).await?;
            let summary = pipeline.run_once().await?;
            print_summary(&summary, args.json)?;
        }
        Commands::Migrate => {
            connect_store(&config).await?;
            println!("migrations applied");
        }
        Commands::Status { json } => {
            let store = PgStore::connect(&config.database_url, 1).await?;
            let counts = store.counts().await.context("counting rows")?;
            print_counts(&counts, json)?;
        }
        Commands::Schedule => {
            let config = SyncConfig {
                scheduler_enabled: true,
                ..config
            };
            let cron = config.sync_cron.clone();
            let pipeline = Arc::new(assemble(config, &SyncArgs::default()).await?);
            let mut scheduler = pipeline
                .maybe_build_scheduler()
                .await?
                .context("scheduler is disabled")?;
            scheduler.start().await.context("starting scheduler")?;
            info!(%cron, "scheduler started; waiting for ctrl-c");

            tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
            scheduler.shutdown().await.context("stopping scheduler")?;
        }
    }

    Ok(())
}

async fn assemble(config: SyncConfig, args: &SyncArgs) -> Result<SyncPipeline> {
    let feed: Arc<dyn MarketFeed> = match (&args.fixtures, &args.replay_archive) {
        (Some(dir), _) => Arc::new(
            FixtureFeed::open(dir).with_context(|| format!("opening fixtures {}", dir.display()))?,
        ),
        (None, Some(dir)) => Arc::new(
            FixtureFeed::from_archive(dir)
                .with_context(|| format!("opening archive {}", dir.display()))?,
        ),
        (None, None) => Arc::new(build_live_feed(&config)?),
    };
    let store: Arc<dyn EntityStore> = if args.dry_run {
        Arc::new(MemoryStore::new())
    } else {
        Arc::new(connect_store(&config).await?)
    };
    info!(feed = feed.feed_id(), store = store.backend(), "pipeline assembled");
    SyncPipeline::new(config, store, feed)
}

fn print_summary(summary: &SyncRunSummary, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(summary)?);
        return Ok(());
    }

    let phase = |phase: &PhaseSummary| {
        if phase.skipped {
            "skipped".to_string()
        } else {
            format!(
                "{} ok/{} retried/{} abandoned",
                phase.records.succeeded, phase.records.retried, phase.records.abandoned
            )
        }
    };
    println!(
        "sync complete: run_id={} directory=[{}] metadata=[{}] listings=[{}] coins={}",
        summary.run_id,
        phase(&summary.directory),
        phase(&summary.metadata),
        phase(&summary.listings),
        summary.entities.coins
    );
    for unit in &summary.abandoned {
        let source = match (&unit.source, unit.cap_id) {
            (Some(source), Some(_)) => format!(" ({source})"),
            _ => String::new(),
        };
        println!(
            "  abandoned {} {}{} at {}: {}",
            unit.phase,
            unit.unit,
            source,
            unit.stage.map_or("fetch", |stage| stage.as_str()),
            unit.error
        );
    }
    Ok(())
}

fn print_counts(counts: &EntityCounts, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(counts)?);
        return Ok(());
    }
    for (table, rows) in [
        ("coin", counts.coins),
        ("platform", counts.platforms),
        ("contract_address", counts.contract_addresses),
        ("tag", counts.tags),
        ("url", counts.urls),
        ("coin_tag", counts.coin_tags),
        ("coin_url", counts.coin_urls),
        ("coin_contract_address", counts.coin_contract_addresses),
    ] {
        println!("{table:<24}{rows}");
    }
    Ok(())
}
