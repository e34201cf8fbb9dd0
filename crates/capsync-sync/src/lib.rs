//! Sync pipeline: batch planning, per-record stage orchestration, retry
//! supervision and relation linking on top of a [`MarketFeed`] and an
//! [`EntityStore`].

use std::sync::Arc;

use anyhow::{Context, Result};
use capsync_feed::{CoinMarketCapFeed, API_KEY_HEADER};
use capsync_storage::{ArtifactStore, HttpClientConfig, HttpFetcher, PgStore};

mod config;
mod linker;
mod orchestrator;
mod pipeline;
mod planner;
mod summary;
mod supervisor;

pub use config::{ConfigOverlay, PhaseOverlay, PhaseSelection, SyncConfig};
pub use linker::{pair_tags, PairedTags};
pub use orchestrator::SyncPipeline;
pub use pipeline::{plan_metadata, Lane, RecordOutcome, RecordPipeline, RecordResult, RecordSource};
pub use planner::{plan_id_batches, IdBatch, PageCursor, RequestPacer, MAX_CONSECUTIVE_PAGE_FAILURES};
pub use summary::{AbandonedUnit, PhaseSummary, SyncPhase, SyncRunSummary, UnitCounts};
pub use supervisor::{RetryPolicy, Supervised, Supervisor, Verdict};

pub const CRATE_NAME: &str = "capsync-sync";

/// Live provider client configured from `config`. Fails without an API key.
pub fn build_live_feed(config: &SyncConfig) -> Result<CoinMarketCapFeed> {
    let api_key = config
        .api_key
        .as_deref()
        .context("CMC_PRO_API_KEY is required for live runs")?;
    let http = HttpClientConfig {
        timeout: config.http_timeout,
        user_agent: Some(config.user_agent.clone()),
        global_concurrency: config.light_workers + config.heavy_workers,
        per_family_concurrency: config.heavy_workers,
        ..Default::default()
    }
    .with_secret_header(API_KEY_HEADER, api_key)?;

    let fetcher = HttpFetcher::new(http)?;
    let mut feed = CoinMarketCapFeed::new(Arc::new(fetcher), config.api_base_url.clone());
    if let Some(dir) = &config.archive_dir {
        feed = feed.with_archive(ArtifactStore::new(dir.clone()));
    }
    Ok(feed)
}

/// Connects to PostgreSQL and applies pending migrations.
pub async fn connect_store(config: &SyncConfig) -> Result<PgStore> {
    let pool_size = (config.light_workers + config.heavy_workers + 2) as u32;
    let store = PgStore::connect(&config.database_url, pool_size).await?;
    store.migrate().await?;
    Ok(store)
}
