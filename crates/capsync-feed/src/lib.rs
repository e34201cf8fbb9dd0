//! Market feed contract plus the live provider client and the fixture-backed
//! replay feed.

use std::collections::BTreeMap;
use std::path::PathBuf;

use async_trait::async_trait;
use capsync_core::{EndpointFamily, PageWindow, SyncError};
use capsync_storage::FetchError;
use serde_json::Value;
use thiserror::Error;

mod cmc;
mod envelope;
mod fixture;

pub use cmc::{CoinMarketCapFeed, API_KEY_HEADER, DEFAULT_BASE_URL};
pub use envelope::parse_envelope;
pub use fixture::FixtureFeed;

pub const CRATE_NAME: &str = "capsync-feed";

/// Provider status codes that mean "slow down" rather than "you are wrong".
pub const RATE_LIMIT_CODES: [i64; 4] = [1008, 1009, 1010, 1011];

#[derive(Debug, Error)]
pub enum FeedError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("provider status {code}: {message}")]
    Status { code: i64, message: String },
    #[error("malformed {family} response: {reason}")]
    Malformed {
        family: EndpointFamily,
        reason: String,
    },
    #[error("asset not available: {0}")]
    AssetNotFound(String),
    #[error("fixture {}: {reason}", path.display())]
    Fixture { path: PathBuf, reason: String },
}

impl From<FeedError> for SyncError {
    fn from(err: FeedError) -> Self {
        match err {
            FeedError::Fetch(err) => err.into(),
            FeedError::Status { code, message } if RATE_LIMIT_CODES.contains(&code) => {
                SyncError::RateLimitExceeded(format!("status {code}: {message}"))
            }
            err @ (FeedError::Status { .. } | FeedError::AssetNotFound(_)) => {
                SyncError::Api(err.to_string())
            }
            err @ (FeedError::Malformed { .. } | FeedError::Fixture { .. }) => {
                SyncError::MalformedPayload(err.to_string())
            }
        }
    }
}

/// The three provider call families plus raw asset download. Records are
/// handed back undecoded; decoding is a pipeline stage so a bad record only
/// fails its own unit.
#[async_trait]
pub trait MarketFeed: Send + Sync {
    fn feed_id(&self) -> &'static str;

    async fn directory_page(&self, window: PageWindow) -> Result<Vec<Value>, FeedError>;

    /// Metadata keyed by the provider id as a string. Ids the provider does not
    /// know are simply absent.
    async fn metadata_batch(&self, ids: &[i64]) -> Result<BTreeMap<String, Value>, FeedError>;

    async fn listings_page(&self, window: PageWindow) -> Result<Vec<Value>, FeedError>;

    async fn fetch_asset(&self, url: &str) -> Result<Vec<u8>, FeedError>;
}
