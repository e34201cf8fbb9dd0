#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use capsync_core::{
    CoinDirectoryFields, CoinId, CoinQuoteUpdate, CoinRow, CoinStub, EndpointFamily, EntityCounts,
    LinkReport, MetadataPlan, MetadataRelations, PageWindow,
};
use capsync_feed::{FeedError, MarketFeed};
use capsync_storage::{EntityStore, FetchError, MemoryStore, StoreError, StoreResult};
use capsync_sync::{RetryPolicy, SyncConfig};
use serde_json::{json, Value};
use tokio::time::Instant;

/// In-memory provider double. Requests are recorded so tests can assert on
/// batching and pacing.
#[derive(Debug, Default)]
pub struct ScriptedFeed {
    pub directory: Vec<Value>,
    pub metadata: BTreeMap<i64, Value>,
    pub listings: Vec<Value>,
    pub assets: HashMap<String, Vec<u8>>,
    /// Asset URLs that always answer 503.
    pub failing_assets: HashSet<String>,
    /// Directory page starts that answer with a terminal provider error.
    pub failing_pages: HashSet<usize>,
    pub metadata_requests: Mutex<Vec<Vec<i64>>>,
    pub request_log: Mutex<Vec<(EndpointFamily, Instant)>>,
    pub asset_calls: AtomicUsize,
}

impl ScriptedFeed {
    fn log(&self, family: EndpointFamily) {
        self.request_log.lock().unwrap().push((family, Instant::now()));
    }

    pub fn requests_for(&self, family: EndpointFamily) -> Vec<Instant> {
        self.request_log
            .lock()
            .unwrap()
            .iter()
            .filter(|(logged, _)| *logged == family)
            .map(|(_, at)| *at)
            .collect()
    }

    pub fn metadata_request_sizes(&self) -> Vec<usize> {
        self.metadata_requests
            .lock()
            .unwrap()
            .iter()
            .map(Vec::len)
            .collect()
    }
}

fn window_slice(records: &[Value], window: PageWindow) -> Vec<Value> {
    let from = window.start.saturating_sub(1).min(records.len());
    let to = (from + window.limit).min(records.len());
    records[from..to].to_vec()
}

#[async_trait]
impl MarketFeed for ScriptedFeed {
    fn feed_id(&self) -> &'static str {
        "scripted"
    }

    async fn directory_page(&self, window: PageWindow) -> Result<Vec<Value>, FeedError> {
        self.log(EndpointFamily::Directory);
        if self.failing_pages.contains(&window.start) {
            return Err(FeedError::Status {
                code: 1002,
                message: "API key missing.".into(),
            });
        }
        Ok(window_slice(&self.directory, window))
    }

    async fn metadata_batch(&self, ids: &[i64]) -> Result<BTreeMap<String, Value>, FeedError> {
        self.log(EndpointFamily::Metadata);
        self.metadata_requests.lock().unwrap().push(ids.to_vec());
        Ok(ids
            .iter()
            .filter_map(|id| self.metadata.get(id).map(|raw| (id.to_string(), raw.clone())))
            .collect())
    }

    async fn listings_page(&self, window: PageWindow) -> Result<Vec<Value>, FeedError> {
        self.log(EndpointFamily::Listings);
        Ok(window_slice(&self.listings, window))
    }

    async fn fetch_asset(&self, url: &str) -> Result<Vec<u8>, FeedError> {
        self.log(EndpointFamily::Asset);
        self.asset_calls.fetch_add(1, Ordering::SeqCst);
        if self.failing_assets.contains(url) {
            return Err(FeedError::Fetch(FetchError::HttpStatus {
                status: 503,
                url: url.to_string(),
            }));
        }
        self.assets
            .get(url)
            .cloned()
            .ok_or_else(|| FeedError::AssetNotFound(url.to_string()))
    }
}

/// Zero delays everywhere so runs finish instantly.
pub fn fast_config() -> SyncConfig {
    SyncConfig {
        request_delay: Duration::ZERO,
        retry: RetryPolicy {
            max_retries: 2,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        },
        light_workers: 4,
        heavy_workers: 2,
        ..SyncConfig::default()
    }
}

pub fn directory_entry(id: i64) -> Value {
    json!({
        "id": id,
        "name": format!("Coin {id}"),
        "symbol": format!("C{id}"),
        "slug": format!("coin-{id}"),
        "rank": id,
        "is_active": 1,
        "first_historical_data": "2020-01-01T00:00:00.000Z",
        "last_historical_data": null,
    })
}

pub fn metadata_entry(id: i64, tags: &[&str], groups: &[&str]) -> Value {
    json!({
        "id": id,
        "name": format!("Coin {id}"),
        "symbol": format!("C{id}"),
        "slug": format!("coin-{id}"),
        "category": "coin",
        "description": format!("about coin {id}"),
        "logo": logo_url(id),
        "urls": {"website": [format!("https://coin{id}.example")], "chat": null},
        "tags": tags,
        "tag-groups": groups,
        "date_launched": null,
        "is_hidden": 0,
        "self_reported_market_cap": null,
    })
}

pub fn listing_entry(id: i64) -> Value {
    json!({
        "id": id,
        "name": format!("Coin {id}"),
        "symbol": format!("C{id}"),
        "slug": format!("coin-{id}"),
        "num_market_pairs": 10,
        "max_supply": null,
        "circulating_supply": 1000.0,
        "total_supply": 1000.0,
        "quote": {"USD": {
            "price": 1.25,
            "volume_24h": 50.0,
            "market_cap": 1250.0,
            "market_cap_dominance": 0.01
        }}
    })
}

pub fn logo_url(id: i64) -> String {
    format!("https://assets.example/{id}.png")
}

/// Contract entry on a platform whose coin may not exist yet.
pub fn contract_on(platform_coin: i64, platform: &str, address: &str) -> Value {
    json!({
        "contract_address": address,
        "platform": {
            "name": platform,
            "coin": {
                "id": platform_coin.to_string(),
                "name": platform,
                "symbol": platform.to_uppercase(),
                "slug": platform.to_lowercase(),
            }
        }
    })
}

/// Fails the first `failures` metadata upserts with write contention, then
/// delegates to a [`MemoryStore`].
#[derive(Debug, Default)]
pub struct FlakyStore {
    pub inner: MemoryStore,
    pub failures: AtomicUsize,
}

impl FlakyStore {
    pub fn failing(failures: usize) -> Self {
        Self {
            inner: MemoryStore::new(),
            failures: AtomicUsize::new(failures),
        }
    }
}

#[async_trait]
impl EntityStore for FlakyStore {
    fn backend(&self) -> &'static str {
        "flaky-memory"
    }

    async fn ensure_coin_stub(&self, stub: &CoinStub) -> StoreResult<CoinId> {
        self.inner.ensure_coin_stub(stub).await
    }

    async fn upsert_coin_directory(&self, fields: &CoinDirectoryFields) -> StoreResult<CoinId> {
        self.inner.upsert_coin_directory(fields).await
    }

    async fn apply_metadata(&self, plan: &MetadataPlan) -> StoreResult<MetadataRelations> {
        let remaining = self.failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failures.store(remaining - 1, Ordering::SeqCst);
            return Err(StoreError::Contention("could not serialize access".into()));
        }
        self.inner.apply_metadata(plan).await
    }

    async fn link_relations(&self, relations: &MetadataRelations) -> StoreResult<LinkReport> {
        self.inner.link_relations(relations).await
    }

    async fn apply_quote(&self, stub: &CoinStub, quote: &CoinQuoteUpdate) -> StoreResult<CoinId> {
        self.inner.apply_quote(stub, quote).await
    }

    async fn coin_keys(&self) -> StoreResult<Vec<i64>> {
        self.inner.coin_keys().await
    }

    async fn coin(&self, cap_id: i64) -> StoreResult<Option<CoinRow>> {
        self.inner.coin(cap_id).await
    }

    async fn counts(&self) -> StoreResult<EntityCounts> {
        self.inner.counts().await
    }
}
