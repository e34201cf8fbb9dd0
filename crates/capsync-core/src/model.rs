use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

macro_rules! row_id {
    ($($(#[$meta:meta])* $name:ident),+ $(,)?) => {
        $(
            $(#[$meta])*
            #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
            #[serde(transparent)]
            pub struct $name(pub i64);
        )+
    };
}

row_id!(
    /// Surrogate key of a `coin` row. Distinct from the provider's `cap_id`.
    CoinId,
    PlatformId,
    ContractAddressId,
    TagId,
    UrlId,
);

/// Minimal coin identity, as carried by forward references and listings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoinStub {
    pub cap_id: i64,
    pub name: String,
    pub symbol: Option<String>,
    pub slug: Option<String>,
}

/// Directory fields after date normalization, ready for the base upsert.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoinDirectoryFields {
    pub cap_id: i64,
    pub name: String,
    pub symbol: String,
    pub slug: String,
    pub rank: Option<i32>,
    pub is_active: bool,
    pub first_historical_date: Option<NaiveDate>,
    pub last_historical_date: Option<NaiveDate>,
}

impl CoinDirectoryFields {
    pub fn stub(&self) -> CoinStub {
        CoinStub {
            cap_id: self.cap_id,
            name: self.name.clone(),
            symbol: Some(self.symbol.clone()),
            slug: Some(self.slug.clone()),
        }
    }
}

/// Fully coerced metadata columns, written in one statement.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct CoinMetadataUpdate {
    pub category: Option<String>,
    pub description: Option<String>,
    /// `None` keeps whatever logo bytes are already stored.
    pub logo: Option<Vec<u8>>,
    pub logo_url: Option<String>,
    pub subreddit: Option<String>,
    pub notice: Option<String>,
    pub platform: Option<String>,
    pub twitter_username: Option<String>,
    pub is_hidden: bool,
    pub date_launched: Option<NaiveDate>,
    pub self_reported_circulating_supply: bool,
    pub self_reported_tags: Option<String>,
    pub self_reported_market_cap: Option<f64>,
    pub infinite_supply: bool,
}

/// Fully coerced market quote columns (USD).
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct CoinQuoteUpdate {
    pub price: Option<f64>,
    pub volume_24h: Option<f64>,
    pub market_cap: Option<f64>,
    pub market_cap_dominance: Option<f64>,
    pub max_supply: Option<f64>,
    pub circulating_supply: Option<f64>,
    pub total_supply: Option<f64>,
    pub num_market_pairs: Option<i32>,
}

/// A persisted coin as read back from a store.
#[derive(Debug, Clone, PartialEq)]
pub struct CoinRow {
    pub id: CoinId,
    pub cap_id: i64,
    pub name: String,
    pub symbol: Option<String>,
    pub slug: Option<String>,
    pub rank: Option<i32>,
    pub is_active: Option<bool>,
    pub first_historical_date: Option<NaiveDate>,
    pub last_historical_date: Option<NaiveDate>,
    /// Present once a metadata update has been applied.
    pub metadata: Option<CoinMetadataUpdate>,
    /// Present once a listings quote has been applied.
    pub quote: Option<CoinQuoteUpdate>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl CoinRow {
    /// True while only the forward-reference identity fields are known.
    pub fn is_placeholder(&self) -> bool {
        self.rank.is_none() && self.is_active.is_none() && self.metadata.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TagKey {
    pub name: String,
    pub category: String,
}

/// A link owned by one coin; `name` is the link category (website, explorer, ...).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct UrlKey {
    pub name: String,
    pub url: String,
}

/// A contract address together with the platform (and platform coin) it lives on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContractRef {
    pub address: String,
    pub platform: String,
    pub platform_coin: CoinStub,
}

/// Everything the metadata-upsert stage writes for one coin.
#[derive(Debug, Clone, PartialEq)]
pub struct MetadataPlan {
    pub cap_id: i64,
    pub update: CoinMetadataUpdate,
    pub contracts: Vec<ContractRef>,
    pub tags: Vec<TagKey>,
    pub urls: Vec<UrlKey>,
}

/// Entity ids materialized by the metadata-upsert stage, consumed by the linker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MetadataRelations {
    pub cap_id: i64,
    pub coin: CoinId,
    pub tags: Vec<TagId>,
    pub urls: Vec<UrlId>,
    pub contract_addresses: Vec<ContractAddressId>,
}

impl MetadataRelations {
    pub fn len(&self) -> usize {
        self.tags.len() + self.urls.len() + self.contract_addresses.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct LinkReport {
    pub inserted: usize,
    pub existing: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct EntityCounts {
    pub coins: u64,
    pub platforms: u64,
    pub contract_addresses: u64,
    pub tags: u64,
    pub urls: u64,
    pub coin_tags: u64,
    pub coin_urls: u64,
    pub coin_contract_addresses: u64,
}
