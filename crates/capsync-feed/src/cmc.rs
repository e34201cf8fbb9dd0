use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use capsync_core::{EndpointFamily, PageWindow};
use capsync_storage::{ArtifactStore, HttpFetcher};
use chrono::Utc;
use serde_json::Value;
use tracing::{debug, warn};

use crate::envelope::{into_keyed_records, into_records, parse_envelope};
use crate::{FeedError, MarketFeed};

pub const DEFAULT_BASE_URL: &str = "https://pro-api.coinmarketcap.com";
pub const API_KEY_HEADER: &str = "X-CMC_PRO_API_KEY";

const MAP_PATH: &str = "/v1/cryptocurrency/map";
const INFO_PATH: &str = "/v2/cryptocurrency/info";
const LISTINGS_PATH: &str = "/v1/cryptocurrency/listings/latest";

/// Live client for the CoinMarketCap pro API. The API key travels as a
/// default header configured on the shared [`HttpFetcher`].
#[derive(Debug, Clone)]
pub struct CoinMarketCapFeed {
    http: Arc<HttpFetcher>,
    base_url: String,
    archive: Option<ArtifactStore>,
}

impl CoinMarketCapFeed {
    pub fn new(http: Arc<HttpFetcher>, base_url: impl Into<String>) -> Self {
        Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            archive: None,
        }
    }

    /// Keeps a copy of every response body under `archive`.
    pub fn with_archive(mut self, archive: ArtifactStore) -> Self {
        self.archive = Some(archive);
        self
    }

    async fn call(
        &self,
        family: EndpointFamily,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<Value, FeedError> {
        let url = format!("{}{path}", self.base_url);
        let response = self.http.get(family, &url, query).await?;
        self.keep(family, "json", &response.body).await;
        parse_envelope(family, &response.body)
    }

    async fn keep(&self, family: EndpointFamily, extension: &str, body: &[u8]) {
        let Some(archive) = &self.archive else {
            return;
        };
        match archive.archive(Utc::now(), family, extension, body).await {
            Ok(stored) => debug!(
                family = family.as_str(),
                path = %stored.relative_path.display(),
                deduplicated = stored.deduplicated,
                "archived response"
            ),
            Err(err) => warn!(family = family.as_str(), error = %err, "failed to archive response"),
        }
    }
}

fn window_query(window: PageWindow) -> Vec<(&'static str, String)> {
    vec![
        ("start", window.start.to_string()),
        ("limit", window.limit.to_string()),
    ]
}

fn id_list(ids: &[i64]) -> String {
    ids.iter()
        .map(i64::to_string)
        .collect::<Vec<_>>()
        .join(",")
}

/// Extension for an asset URL's final path segment, `bin` when there is none.
fn asset_extension(url: &str) -> &str {
    let path = url.split(['?', '#']).next().unwrap_or(url);
    let segment = path.rsplit('/').next().unwrap_or(path);
    match segment.rsplit_once('.') {
        Some((_, ext)) if !ext.is_empty() && ext.len() <= 5 && ext.chars().all(|c| c.is_ascii_alphanumeric()) => ext,
        _ => "bin",
    }
}

#[async_trait]
impl MarketFeed for CoinMarketCapFeed {
    fn feed_id(&self) -> &'static str {
        "coinmarketcap"
    }

    async fn directory_page(&self, window: PageWindow) -> Result<Vec<Value>, FeedError> {
        let mut query = window_query(window);
        query.push(("sort", "id".to_string()));
        let data = self.call(EndpointFamily::Directory, MAP_PATH, &query).await?;
        into_records(EndpointFamily::Directory, data)
    }

    async fn metadata_batch(&self, ids: &[i64]) -> Result<BTreeMap<String, Value>, FeedError> {
        if ids.is_empty() {
            return Ok(BTreeMap::new());
        }
        let query = [("id", id_list(ids))];
        let data = self.call(EndpointFamily::Metadata, INFO_PATH, &query).await?;
        into_keyed_records(EndpointFamily::Metadata, data)
    }

    async fn listings_page(&self, window: PageWindow) -> Result<Vec<Value>, FeedError> {
        let mut query = window_query(window);
        query.push(("convert", "USD".to_string()));
        let data = self.call(EndpointFamily::Listings, LISTINGS_PATH, &query).await?;
        into_records(EndpointFamily::Listings, data)
    }

    async fn fetch_asset(&self, url: &str) -> Result<Vec<u8>, FeedError> {
        let response = self.http.get(EndpointFamily::Asset, url, &[]).await?;
        self.keep(EndpointFamily::Asset, asset_extension(url), &response.body)
            .await;
        Ok(response.body)
    }
}
