use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use capsync_core::{EndpointFamily, PageWindow, PipelineStage, SyncError};
use capsync_feed::MarketFeed;
use capsync_storage::EntityStore;
use chrono::Utc;
use serde_json::Value;
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::config::SyncConfig;
use crate::pipeline::{drive, Lanes, RecordOutcome, RecordPipeline, RecordSource, StageContext};
use crate::planner::{plan_id_batches, PageCursor, RequestPacer};
use crate::summary::{PhaseLedger, SyncPhase, SyncRunSummary};
use crate::supervisor::{Supervised, Supervisor};

#[derive(Debug, Clone, Copy)]
enum PagedEndpoint {
    Directory,
    Listings,
}

impl PagedEndpoint {
    fn phase(self) -> SyncPhase {
        match self {
            Self::Directory => SyncPhase::Directory,
            Self::Listings => SyncPhase::Listings,
        }
    }

    fn family(self) -> EndpointFamily {
        match self {
            Self::Directory => EndpointFamily::Directory,
            Self::Listings => EndpointFamily::Listings,
        }
    }

    fn pipeline(self, raw: Value, page: usize) -> RecordPipeline {
        match self {
            Self::Directory => RecordPipeline::directory(raw, page),
            Self::Listings => RecordPipeline::listing(raw, page),
        }
    }
}

/// Runs sync passes: directory, then metadata, then listings. Each phase
/// finishes (every record pipeline settled) before the next starts.
pub struct SyncPipeline {
    config: SyncConfig,
    ctx: Arc<StageContext>,
    running: Mutex<()>,
}

impl SyncPipeline {
    pub fn new(
        config: SyncConfig,
        store: Arc<dyn EntityStore>,
        feed: Arc<dyn MarketFeed>,
    ) -> Result<Self> {
        config.validate().context("invalid sync configuration")?;
        let ctx = StageContext {
            store,
            feed,
            pacer: Arc::new(RequestPacer::new(config.request_delay)),
            supervisor: Supervisor::new(config.retry),
            lanes: Lanes::new(config.light_workers, config.heavy_workers),
        };
        Ok(Self {
            config,
            ctx: Arc::new(ctx),
            running: Mutex::new(()),
        })
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn store(&self) -> Arc<dyn EntityStore> {
        Arc::clone(&self.ctx.store)
    }

    /// True while a run holds the pipeline.
    pub fn is_running(&self) -> bool {
        self.running.try_lock().is_err()
    }

    /// One full pass. Unit failures are counted in the summary; only setup
    /// problems (store unreachable for key reads or counts) fail the run.
    pub async fn run_once(&self) -> Result<SyncRunSummary> {
        let run_id = Uuid::new_v4();
        let span = info_span!(
            "sync_run",
            %run_id,
            feed = self.ctx.feed.feed_id(),
            store = self.ctx.store.backend()
        );
        self.run_phases(run_id).instrument(span).await
    }

    async fn run_phases(&self, run_id: Uuid) -> Result<SyncRunSummary> {
        let _running = self.running.lock().await;
        let started_at = Utc::now();
        let phases = self.config.phases;
        info!(?phases, "sync run started");

        let directory = if phases.directory {
            self.paged_phase(PagedEndpoint::Directory, PageCursor::open_ended(self.config.page_size))
                .instrument(info_span!("phase", phase = %SyncPhase::Directory))
                .await
        } else {
            PhaseLedger::skipped(SyncPhase::Directory)
        };

        let metadata = if phases.metadata {
            self.metadata_phase()
                .instrument(info_span!("phase", phase = %SyncPhase::Metadata))
                .await?
        } else {
            PhaseLedger::skipped(SyncPhase::Metadata)
        };

        let listings = if phases.listings {
            let known = self
                .ctx
                .store
                .counts()
                .await
                .context("counting known coins")?
                .coins as usize;
            self.paged_phase(PagedEndpoint::Listings, PageCursor::bounded(self.config.page_size, known))
                .instrument(info_span!("phase", phase = %SyncPhase::Listings))
                .await
        } else {
            PhaseLedger::skipped(SyncPhase::Listings)
        };

        let entities = self.ctx.store.counts().await.context("counting entities")?;

        let mut abandoned = Vec::new();
        let (directory, mut lost) = directory.finish();
        abandoned.append(&mut lost);
        let (metadata, mut lost) = metadata.finish();
        abandoned.append(&mut lost);
        let (listings, mut lost) = listings.finish();
        abandoned.append(&mut lost);

        let summary = SyncRunSummary {
            run_id,
            feed: self.ctx.feed.feed_id(),
            store: self.ctx.store.backend(),
            started_at,
            finished_at: Utc::now(),
            directory,
            metadata,
            listings,
            abandoned,
            entities,
        };
        info!(
            records = summary.records_succeeded(),
            abandoned = summary.units_abandoned(),
            coins = entities.coins,
            "sync run finished"
        );
        Ok(summary)
    }

    async fn paged_phase(&self, endpoint: PagedEndpoint, mut cursor: PageCursor) -> PhaseLedger {
        let mut ledger = PhaseLedger::new(endpoint.phase());
        let mut records = JoinSet::new();

        while let Some(window) = cursor.next_window() {
            match self.ctx.supervisor.run(|_| self.fetch_page(endpoint, window)).await {
                Supervised::Done { value, attempts } => {
                    debug!(page = window.index, start = window.start, records = value.len(), "page fetched");
                    ledger.request_done(attempts);
                    cursor.record_page(value.len());
                    for raw in value {
                        let pipeline = endpoint.pipeline(raw, window.index);
                        records.spawn(drive(pipeline, Arc::clone(&self.ctx)).in_current_span());
                    }
                }
                Supervised::Abandoned {
                    error,
                    attempts,
                    exhausted,
                } => {
                    warn!(page = window.index, start = window.start, error = %error, "page abandoned");
                    ledger.request_abandoned(RecordSource::Page(window.index), &error, attempts, exhausted);
                    cursor.record_failure();
                }
            }
        }

        settle(records, &mut ledger).await;
        ledger
    }

    async fn metadata_phase(&self) -> Result<PhaseLedger> {
        let mut ledger = PhaseLedger::new(SyncPhase::Metadata);
        let mut records = JoinSet::new();

        let keys = self
            .ctx
            .store
            .coin_keys()
            .await
            .context("reading known coin ids")?;
        let batches = plan_id_batches(&keys, self.config.batch_size);
        info!(coins = keys.len(), batches = batches.len(), "metadata batches planned");

        for batch in &batches {
            match self.ctx.supervisor.run(|_| self.fetch_metadata(&batch.ids)).await {
                Supervised::Done { mut value, attempts } => {
                    debug!(batch = batch.index, ids = batch.ids.len(), returned = value.len(), "metadata batch fetched");
                    ledger.request_done(attempts);
                    for &cap_id in &batch.ids {
                        match value.remove(&cap_id.to_string()) {
                            Some(raw) => {
                                let pipeline = RecordPipeline::metadata(cap_id, raw, batch.index);
                                records.spawn(drive(pipeline, Arc::clone(&self.ctx)).in_current_span());
                            }
                            None => {
                                warn!(batch = batch.index, cap_id, "id missing from metadata response");
                                ledger.record_dropped(
                                    cap_id,
                                    RecordSource::Batch(batch.index),
                                    PipelineStage::MetadataFetched,
                                    &SyncError::MissingField(format!("data.{cap_id}")),
                                );
                            }
                        }
                    }
                    if !value.is_empty() {
                        debug!(batch = batch.index, unrequested = value.len(), "ignoring unrequested metadata entries");
                    }
                }
                Supervised::Abandoned {
                    error,
                    attempts,
                    exhausted,
                } => {
                    warn!(batch = batch.index, ids = batch.ids.len(), error = %error, "metadata batch abandoned");
                    ledger.request_abandoned(RecordSource::Batch(batch.index), &error, attempts, exhausted);
                }
            }
        }

        settle(records, &mut ledger).await;
        Ok(ledger)
    }

    async fn fetch_page(
        &self,
        endpoint: PagedEndpoint,
        window: PageWindow,
    ) -> Result<Vec<Value>, SyncError> {
        self.ctx.pacer.wait_turn(endpoint.family()).await;
        let page = match endpoint {
            PagedEndpoint::Directory => self.ctx.feed.directory_page(window).await?,
            PagedEndpoint::Listings => self.ctx.feed.listings_page(window).await?,
        };
        Ok(page)
    }

    async fn fetch_metadata(&self, ids: &[i64]) -> Result<BTreeMap<String, Value>, SyncError> {
        self.ctx.pacer.wait_turn(EndpointFamily::Metadata).await;
        Ok(self.ctx.feed.metadata_batch(ids).await?)
    }

    /// A cron job that runs [`SyncPipeline::run_once`], or `None` when the
    /// scheduler is disabled. Ticks that fire while a run is in progress are
    /// skipped.
    pub async fn maybe_build_scheduler(self: &Arc<Self>) -> Result<Option<JobScheduler>> {
        if !self.config.scheduler_enabled {
            return Ok(None);
        }

        let sched = JobScheduler::new().await.context("creating scheduler")?;
        let cron = self.config.sync_cron.clone();
        let pipeline = Arc::clone(self);
        let job = Job::new_async(cron.as_str(), move |_uuid, _l| {
            let pipeline = Arc::clone(&pipeline);
            Box::pin(async move {
                if pipeline.is_running() {
                    warn!("previous sync run still in progress; skipping tick");
                    return;
                }
                match pipeline.run_once().await {
                    Ok(summary) => info!(
                        run_id = %summary.run_id,
                        records = summary.records_succeeded(),
                        abandoned = summary.units_abandoned(),
                        "scheduled sync finished"
                    ),
                    Err(err) => error!(error = %format!("{err:#}"), "scheduled sync failed"),
                }
            })
        })
        .with_context(|| format!("creating scheduler job for cron {cron}"))?;
        sched.add(job).await.context("adding scheduler job")?;
        Ok(Some(sched))
    }
}

async fn settle(mut records: JoinSet<RecordOutcome>, ledger: &mut PhaseLedger) {
    while let Some(joined) = records.join_next().await {
        match joined {
            Ok(outcome) => ledger.record(outcome),
            Err(err) => {
                error!(error = %err, "record task failed");
                ledger.record_lost(err.to_string());
            }
        }
    }
}
