//! Per-record stage machine. Each record carries its own state value holding
//! the output of the last committed stage; the driver moves it forward one
//! stage at a time on its lane and consults the supervisor on failure.

use std::fmt;
use std::sync::Arc;

use capsync_core::{
    decode_record, CoinDirectoryFields, CoinId, DirectoryRecord, EndpointFamily, LinkReport,
    ListingRecord, MetadataPlan, MetadataRecord, MetadataRelations, PipelineStage, SyncError,
};
use capsync_feed::MarketFeed;
use capsync_storage::EntityStore;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::Semaphore;
use tracing::{debug, debug_span, warn, Instrument};

use crate::linker::{self, pair_tags};
use crate::planner::RequestPacer;
use crate::supervisor::{Supervisor, Verdict};

/// Worker lane a stage runs on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lane {
    /// Date normalization, base upserts and quote upserts.
    Light,
    /// Asset fetch, metadata upsert and linking.
    Heavy,
}

#[derive(Debug)]
pub(crate) struct Lanes {
    light: Semaphore,
    heavy: Semaphore,
}

impl Lanes {
    pub(crate) fn new(light: usize, heavy: usize) -> Self {
        Self {
            light: Semaphore::new(light.max(1)),
            heavy: Semaphore::new(heavy.max(1)),
        }
    }

    fn semaphore(&self, lane: Lane) -> &Semaphore {
        match lane {
            Lane::Light => &self.light,
            Lane::Heavy => &self.heavy,
        }
    }
}

/// Collaborators shared by every record pipeline of a run.
pub(crate) struct StageContext {
    pub(crate) store: Arc<dyn EntityStore>,
    pub(crate) feed: Arc<dyn MarketFeed>,
    pub(crate) pacer: Arc<RequestPacer>,
    pub(crate) supervisor: Supervisor,
    pub(crate) lanes: Lanes,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Branch {
    Directory,
    Metadata,
    Listing,
}

#[derive(Debug, Clone)]
enum RecordState {
    Fetched(Value),
    DatesNormalized(CoinDirectoryFields),
    BaseUpserted(CoinId),
    MetadataFetched(Value),
    AssetFetched {
        record: Box<MetadataRecord>,
        logo: Option<Vec<u8>>,
    },
    MetadataUpserted(MetadataRelations),
    Linked(LinkReport),
    QuoteUpserted(CoinId),
}

impl RecordState {
    fn stage(&self) -> PipelineStage {
        match self {
            Self::Fetched(_) => PipelineStage::Fetched,
            Self::DatesNormalized(_) => PipelineStage::DatesNormalized,
            Self::BaseUpserted(_) => PipelineStage::BaseUpserted,
            Self::MetadataFetched(_) => PipelineStage::MetadataFetched,
            Self::AssetFetched { .. } => PipelineStage::AssetFetched,
            Self::MetadataUpserted(_) => PipelineStage::MetadataUpserted,
            Self::Linked(_) => PipelineStage::Linked,
            Self::QuoteUpserted(_) => PipelineStage::QuoteUpserted,
        }
    }
}

/// The page or id batch a record arrived in, by planner index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordSource {
    Page(usize),
    Batch(usize),
}

impl fmt::Display for RecordSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Page(index) => write!(f, "page {index}"),
            Self::Batch(index) => write!(f, "batch {index}"),
        }
    }
}

/// One record's journey through its branch:
///
/// ```text
/// directory: FETCHED -> DATES_NORMALIZED -> BASE_UPSERTED
/// metadata:  METADATA_FETCHED -> ASSET_FETCHED -> METADATA_UPSERTED -> LINKED
/// listings:  FETCHED -> QUOTE_UPSERTED
/// ```
#[derive(Debug, Clone)]
pub struct RecordPipeline {
    branch: Branch,
    cap_id: Option<i64>,
    source: RecordSource,
    state: RecordState,
}

impl RecordPipeline {
    pub fn directory(raw: Value, page: usize) -> Self {
        Self {
            branch: Branch::Directory,
            cap_id: raw_cap_id(&raw),
            source: RecordSource::Page(page),
            state: RecordState::Fetched(raw),
        }
    }

    pub fn metadata(cap_id: i64, raw: Value, batch: usize) -> Self {
        Self {
            branch: Branch::Metadata,
            cap_id: Some(cap_id),
            source: RecordSource::Batch(batch),
            state: RecordState::MetadataFetched(raw),
        }
    }

    pub fn listing(raw: Value, page: usize) -> Self {
        Self {
            branch: Branch::Listing,
            cap_id: raw_cap_id(&raw),
            source: RecordSource::Page(page),
            state: RecordState::Fetched(raw),
        }
    }

    pub fn cap_id(&self) -> Option<i64> {
        self.cap_id
    }

    pub fn source(&self) -> RecordSource {
        self.source
    }

    pub fn stage(&self) -> PipelineStage {
        self.state.stage()
    }

    pub fn goal(&self) -> PipelineStage {
        match self.branch {
            Branch::Directory => PipelineStage::BaseUpserted,
            Branch::Metadata => PipelineStage::Linked,
            Branch::Listing => PipelineStage::QuoteUpserted,
        }
    }

    pub fn is_complete(&self) -> bool {
        self.stage() == self.goal()
    }

    pub fn lane(&self) -> Lane {
        match self.branch {
            Branch::Directory | Branch::Listing => Lane::Light,
            Branch::Metadata => Lane::Heavy,
        }
    }

    /// The stage the next `advance` attempts; the goal once complete.
    pub fn next_stage(&self) -> PipelineStage {
        match (self.branch, &self.state) {
            (Branch::Directory, RecordState::Fetched(_)) => PipelineStage::DatesNormalized,
            (Branch::Directory, RecordState::DatesNormalized(_)) => PipelineStage::BaseUpserted,
            (Branch::Metadata, RecordState::MetadataFetched(_)) => PipelineStage::AssetFetched,
            (Branch::Metadata, RecordState::AssetFetched { .. }) => PipelineStage::MetadataUpserted,
            (Branch::Metadata, RecordState::MetadataUpserted(_)) => PipelineStage::Linked,
            (Branch::Listing, RecordState::Fetched(_)) => PipelineStage::QuoteUpserted,
            _ => self.goal(),
        }
    }

    /// Provider family the next stage calls, if any. Only the asset fetch of a
    /// record with a logo URL calls out from inside a pipeline.
    pub fn pending_request(&self) -> Option<EndpointFamily> {
        match &self.state {
            RecordState::MetadataFetched(raw) => raw
                .get("logo")
                .and_then(Value::as_str)
                .filter(|url| !url.trim().is_empty())
                .map(|_| EndpointFamily::Asset),
            _ => None,
        }
    }

    /// Runs the next stage. The state only moves when the stage succeeds, so
    /// a failed stage can be retried from the same input.
    pub(crate) async fn advance(&mut self, ctx: &StageContext) -> Result<(), SyncError> {
        let next = match (self.branch, &self.state) {
            (Branch::Directory, RecordState::Fetched(raw)) => {
                let record: DirectoryRecord = decode_record(raw)?;
                RecordState::DatesNormalized(record.normalize()?)
            }
            (_, RecordState::DatesNormalized(fields)) => {
                RecordState::BaseUpserted(ctx.store.upsert_coin_directory(fields).await?)
            }
            (_, RecordState::MetadataFetched(raw)) => {
                let record: MetadataRecord = decode_record(raw)?;
                let logo = fetch_logo(ctx, &record).await?;
                RecordState::AssetFetched {
                    record: Box::new(record),
                    logo,
                }
            }
            (_, RecordState::AssetFetched { record, logo }) => {
                let plan = plan_metadata(record, logo.clone())?;
                RecordState::MetadataUpserted(ctx.store.apply_metadata(&plan).await?)
            }
            (_, RecordState::MetadataUpserted(relations)) => {
                RecordState::Linked(linker::link(ctx.store.as_ref(), relations).await?)
            }
            (Branch::Listing, RecordState::Fetched(raw)) => {
                let listing: ListingRecord = decode_record(raw)?;
                let quote = listing.coerce_quote()?;
                RecordState::QuoteUpserted(ctx.store.apply_quote(&listing.stub(), &quote).await?)
            }
            _ => return Ok(()),
        };
        self.state = next;
        Ok(())
    }
}

fn raw_cap_id(raw: &Value) -> Option<i64> {
    match raw.get("id")? {
        Value::Number(number) => number.as_i64(),
        Value::String(text) => text.trim().parse().ok(),
        _ => None,
    }
}

/// Builds everything the metadata upsert writes. Coercion happens here, before
/// any write, so a bad field leaves the stored coin untouched.
pub fn plan_metadata(
    record: &MetadataRecord,
    logo: Option<Vec<u8>>,
) -> Result<MetadataPlan, SyncError> {
    let update = record.coerce_update(logo)?;
    let tags = pair_tags(record.tags.as_deref(), record.tag_groups.as_deref()).keys;

    let mut contracts = record.contract_refs();
    contracts.sort_by(|a, b| (&a.platform, &a.address).cmp(&(&b.platform, &b.address)));
    contracts.dedup_by(|a, b| a.platform == b.platform && a.address == b.address);

    Ok(MetadataPlan {
        cap_id: record.id,
        update,
        contracts,
        tags,
        urls: record.url_keys(),
    })
}

/// Downloads the logo. A terminal failure keeps the URL without bytes; a
/// retryable one fails the stage. The caller has already taken the asset
/// pacing turn.
async fn fetch_logo(
    ctx: &StageContext,
    record: &MetadataRecord,
) -> Result<Option<Vec<u8>>, SyncError> {
    let Some(url) = record.logo_url() else {
        return Ok(None);
    };

    match ctx.feed.fetch_asset(url).await {
        Ok(bytes) => Ok(Some(bytes)),
        Err(err) => {
            let err = SyncError::from(err);
            if err.is_retryable() {
                return Err(err);
            }
            warn!(cap_id = record.id, url, error = %err, "logo unavailable, keeping url only");
            Ok(None)
        }
    }
}

#[derive(Debug)]
pub enum RecordResult {
    Completed(PipelineStage),
    Abandoned {
        /// The stage that failed.
        stage: PipelineStage,
        error: SyncError,
        attempts: usize,
        exhausted: bool,
    },
}

#[derive(Debug)]
pub struct RecordOutcome {
    pub cap_id: Option<i64>,
    pub source: RecordSource,
    /// At least one stage needed a retry.
    pub retried: bool,
    pub result: RecordResult,
}

/// Drives a record to its goal stage. Lane slots are held only while a stage
/// runs; retry delays and pacing turns are waited out without one.
pub(crate) async fn drive(pipeline: RecordPipeline, ctx: Arc<StageContext>) -> RecordOutcome {
    let span = debug_span!(
        "record",
        cap_id = ?pipeline.cap_id(),
        source = %pipeline.source(),
        goal = %pipeline.goal()
    );
    drive_inner(pipeline, ctx).instrument(span).await
}

async fn drive_inner(mut pipeline: RecordPipeline, ctx: Arc<StageContext>) -> RecordOutcome {
    let mut attempt = 0;
    let mut retried = false;

    while !pipeline.is_complete() {
        let stage = pipeline.next_stage();
        if let Some(family) = pipeline.pending_request() {
            ctx.pacer.wait_turn(family).await;
        }
        let result = match ctx.lanes.semaphore(pipeline.lane()).acquire().await {
            Ok(_slot) => pipeline.advance(&ctx).await,
            Err(_) => Err(SyncError::Store("worker lane closed".into())),
        };

        let error = match result {
            Ok(()) => {
                debug!(%stage, "stage committed");
                attempt = 0;
                continue;
            }
            Err(error) => error,
        };

        match ctx.supervisor.judge(&error, attempt) {
            Verdict::Retry { after } => {
                warn!(
                    %stage,
                    attempt,
                    kind = error.kind(),
                    error = %error,
                    retry_in_ms = after.as_millis() as u64,
                    "stage failed, requeueing"
                );
                retried = true;
                attempt += 1;
                tokio::time::sleep(after).await;
            }
            Verdict::Abandon { exhausted } => {
                warn!(
                    cap_id = ?pipeline.cap_id(),
                    source = %pipeline.source(),
                    %stage,
                    attempt,
                    kind = error.kind(),
                    error = %error,
                    exhausted,
                    "record abandoned"
                );
                return RecordOutcome {
                    cap_id: pipeline.cap_id(),
                    source: pipeline.source(),
                    retried,
                    result: RecordResult::Abandoned {
                        stage,
                        error,
                        attempts: attempt + 1,
                        exhausted,
                    },
                };
            }
        }
    }

    RecordOutcome {
        cap_id: pipeline.cap_id(),
        source: pipeline.source(),
        retried,
        result: RecordResult::Completed(pipeline.stage()),
    }
}
