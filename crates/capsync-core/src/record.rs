//! Decoded shapes of the three provider payloads and their conversion into
//! store-ready values.

use std::collections::{BTreeMap, BTreeSet};

use serde::de::{self, DeserializeOwned, Deserializer};
use serde::Deserialize;
use serde_json::Value;

use crate::coerce::{
    coerce_f64, coerce_flag, coerce_i32, coerce_text, join_list, normalize_iso_date,
};
use crate::model::{
    CoinDirectoryFields, CoinMetadataUpdate, CoinQuoteUpdate, CoinStub, ContractRef, UrlKey,
};
use crate::SyncError;

/// Decodes one raw record, mapping serde failures onto the error taxonomy.
pub fn decode_record<T: DeserializeOwned>(raw: &Value) -> Result<T, SyncError> {
    T::deserialize(raw).map_err(|err| SyncError::from_decode(&err))
}

/// Provider ids arrive as numbers in most payloads and as strings in a few.
fn loose_id<'de, D>(deserializer: D) -> Result<i64, D::Error>
where
    D: Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        Value::Number(number) => number
            .as_i64()
            .ok_or_else(|| de::Error::custom(format!("invalid id {number}"))),
        Value::String(text) => text
            .trim()
            .parse()
            .map_err(|_| de::Error::custom(format!("invalid id {text:?}"))),
        other => Err(de::Error::custom(format!("invalid id {other}"))),
    }
}

/// One entry of the directory (`/v1/cryptocurrency/map`) listing.
#[derive(Debug, Clone, Deserialize)]
pub struct DirectoryRecord {
    #[serde(deserialize_with = "loose_id")]
    pub id: i64,
    pub name: String,
    pub symbol: String,
    pub slug: String,
    #[serde(default)]
    pub rank: Value,
    #[serde(default)]
    pub is_active: Value,
    #[serde(default)]
    pub first_historical_data: Option<String>,
    #[serde(default)]
    pub last_historical_data: Option<String>,
}

impl DirectoryRecord {
    pub fn normalize(&self) -> Result<CoinDirectoryFields, SyncError> {
        Ok(CoinDirectoryFields {
            cap_id: self.id,
            name: self.name.clone(),
            symbol: self.symbol.clone(),
            slug: self.slug.clone(),
            rank: coerce_i32("rank", &self.rank)?,
            is_active: coerce_flag("is_active", &self.is_active)?,
            first_historical_date: normalize_iso_date(
                "first_historical_data",
                self.first_historical_data.as_deref(),
            )?,
            last_historical_date: normalize_iso_date(
                "last_historical_data",
                self.last_historical_data.as_deref(),
            )?,
        })
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CoinRefRecord {
    #[serde(deserialize_with = "loose_id")]
    pub id: i64,
    pub name: String,
    #[serde(default)]
    pub symbol: Option<String>,
    #[serde(default)]
    pub slug: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PlatformRecord {
    pub name: String,
    pub coin: CoinRefRecord,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ContractAddressRecord {
    pub contract_address: String,
    pub platform: PlatformRecord,
}

/// One value of the bulk metadata (`/v2/cryptocurrency/info`) mapping.
#[derive(Debug, Clone, Deserialize)]
pub struct MetadataRecord {
    #[serde(deserialize_with = "loose_id")]
    pub id: i64,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub symbol: Option<String>,
    #[serde(default)]
    pub slug: Option<String>,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub logo: Option<String>,
    #[serde(default)]
    pub subreddit: Option<String>,
    #[serde(default)]
    pub notice: Option<String>,
    #[serde(default)]
    pub platform: Value,
    #[serde(default)]
    pub twitter_username: Option<String>,
    #[serde(default)]
    pub is_hidden: Value,
    #[serde(default)]
    pub date_launched: Option<String>,
    #[serde(default)]
    pub self_reported_circulating_supply: Value,
    #[serde(default)]
    pub self_reported_tags: Option<Vec<String>>,
    #[serde(default)]
    pub self_reported_market_cap: Value,
    #[serde(default)]
    pub infinite_supply: Value,
    #[serde(default)]
    pub urls: Option<BTreeMap<String, Option<Vec<String>>>>,
    #[serde(default)]
    pub tags: Option<Vec<String>>,
    #[serde(default, rename = "tag-groups")]
    pub tag_groups: Option<Vec<String>>,
    #[serde(default)]
    pub contract_address: Option<Vec<ContractAddressRecord>>,
}

impl MetadataRecord {
    pub fn logo_url(&self) -> Option<&str> {
        self.logo
            .as_deref()
            .map(str::trim)
            .filter(|url| !url.is_empty())
    }

    /// Coerces every metadata column. Fails before anything is written.
    pub fn coerce_update(&self, logo: Option<Vec<u8>>) -> Result<CoinMetadataUpdate, SyncError> {
        Ok(CoinMetadataUpdate {
            category: self.category.clone(),
            description: self.description.clone(),
            logo,
            logo_url: self.logo_url().map(str::to_string),
            subreddit: self.subreddit.clone(),
            notice: self.notice.clone(),
            platform: coerce_text(&self.platform),
            twitter_username: self.twitter_username.clone(),
            is_hidden: coerce_flag("is_hidden", &self.is_hidden)?,
            date_launched: normalize_iso_date("date_launched", self.date_launched.as_deref())?,
            self_reported_circulating_supply: coerce_flag(
                "self_reported_circulating_supply",
                &self.self_reported_circulating_supply,
            )?,
            self_reported_tags: join_list(self.self_reported_tags.as_deref()),
            self_reported_market_cap: coerce_f64(
                "self_reported_market_cap",
                &self.self_reported_market_cap,
            )?,
            infinite_supply: coerce_flag("infinite_supply", &self.infinite_supply)?,
        })
    }

    pub fn contract_refs(&self) -> Vec<ContractRef> {
        self.contract_address
            .iter()
            .flatten()
            .map(|entry| ContractRef {
                address: entry.contract_address.clone(),
                platform: entry.platform.name.clone(),
                platform_coin: CoinStub {
                    cap_id: entry.platform.coin.id,
                    name: entry.platform.coin.name.clone(),
                    symbol: entry.platform.coin.symbol.clone(),
                    slug: entry.platform.coin.slug.clone(),
                },
            })
            .collect()
    }

    /// Flattens the `urls` mapping, skipping blank values. Sorted and unique.
    pub fn url_keys(&self) -> Vec<UrlKey> {
        let mut keys = BTreeSet::new();
        for (name, values) in self.urls.iter().flatten() {
            for url in values.iter().flatten() {
                let url = url.trim();
                if !url.is_empty() {
                    keys.insert(UrlKey {
                        name: name.clone(),
                        url: url.to_string(),
                    });
                }
            }
        }
        keys.into_iter().collect()
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct QuoteRecord {
    #[serde(default)]
    pub price: Value,
    #[serde(default)]
    pub volume_24h: Value,
    #[serde(default)]
    pub market_cap: Value,
    #[serde(default)]
    pub market_cap_dominance: Value,
}

/// One entry of `/v1/cryptocurrency/listings/latest`.
#[derive(Debug, Clone, Deserialize)]
pub struct ListingRecord {
    #[serde(deserialize_with = "loose_id")]
    pub id: i64,
    pub name: String,
    #[serde(default)]
    pub symbol: Option<String>,
    #[serde(default)]
    pub slug: Option<String>,
    #[serde(default)]
    pub max_supply: Value,
    #[serde(default)]
    pub circulating_supply: Value,
    #[serde(default)]
    pub total_supply: Value,
    #[serde(default)]
    pub num_market_pairs: Value,
    pub quote: BTreeMap<String, QuoteRecord>,
}

impl ListingRecord {
    pub const QUOTE_CURRENCY: &'static str = "USD";

    pub fn stub(&self) -> CoinStub {
        CoinStub {
            cap_id: self.id,
            name: self.name.clone(),
            symbol: self.symbol.clone(),
            slug: self.slug.clone(),
        }
    }

    pub fn coerce_quote(&self) -> Result<CoinQuoteUpdate, SyncError> {
        let usd = self
            .quote
            .get(Self::QUOTE_CURRENCY)
            .ok_or_else(|| SyncError::MissingField(format!("quote.{}", Self::QUOTE_CURRENCY)))?;

        Ok(CoinQuoteUpdate {
            price: coerce_f64("price", &usd.price)?,
            volume_24h: coerce_f64("volume_24h", &usd.volume_24h)?,
            market_cap: coerce_f64("market_cap", &usd.market_cap)?,
            market_cap_dominance: coerce_f64("market_cap_dominance", &usd.market_cap_dominance)?,
            max_supply: coerce_f64("max_supply", &self.max_supply)?,
            circulating_supply: coerce_f64("circulating_supply", &self.circulating_supply)?,
            total_supply: coerce_f64("total_supply", &self.total_supply)?,
            num_market_pairs: coerce_i32("num_market_pairs", &self.num_market_pairs)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use serde_json::json;

    fn tether() -> Value {
        json!({
            "id": 825,
            "name": "Tether USDt",
            "symbol": "USDT",
            "slug": "tether",
            "category": "token",
            "description": "Tether is a stablecoin.",
            "logo": "https://s2.coinmarketcap.com/static/img/coins/64x64/825.png",
            "urls": {
                "website": ["https://tether.to"],
                "explorer": ["https://etherscan.io/token/0xdac17f958d2ee523a2206206994597c13d831ec7", ""],
                "reddit": [],
                "chat": null
            },
            "tags": ["stablecoin", "asset-backed-stablecoin"],
            "tag-groups": ["CATEGORY", "CATEGORY"],
            "platform": {"id": "1027", "name": "Ethereum"},
            "date_launched": null,
            "is_hidden": 0,
            "self_reported_circulating_supply": null,
            "self_reported_tags": null,
            "self_reported_market_cap": null,
            "infinite_supply": true,
            "contract_address": [{
                "contract_address": "0xdac17f958d2ee523a2206206994597c13d831ec7",
                "platform": {
                    "name": "Ethereum",
                    "coin": {"id": "1027", "name": "Ethereum", "symbol": "ETH", "slug": "ethereum"}
                }
            }]
        })
    }

    #[test]
    fn directory_entry_normalizes_dates_and_flags() {
        let record: DirectoryRecord = decode_record(&json!({
            "id": 1,
            "name": "Bitcoin",
            "symbol": "BTC",
            "slug": "bitcoin",
            "rank": 1,
            "is_active": 1,
            "first_historical_data": "2013-04-28T18:47:21.000Z",
            "last_historical_data": null
        }))
        .unwrap();

        let fields = record.normalize().unwrap();
        assert_eq!(fields.cap_id, 1);
        assert_eq!(fields.rank, Some(1));
        assert!(fields.is_active);
        assert_eq!(fields.first_historical_date, NaiveDate::from_ymd_opt(2013, 4, 28));
        assert_eq!(fields.last_historical_date, None);
    }

    #[test]
    fn directory_entry_without_slug_is_missing_field() {
        let err = decode_record::<DirectoryRecord>(&json!({"id": 1, "name": "Bitcoin", "symbol": "BTC"}))
            .unwrap_err();
        assert_eq!(err, SyncError::MissingField("slug".into()));
    }

    #[test]
    fn metadata_record_coerces_and_flattens_relations() {
        let record: MetadataRecord = decode_record(&tether()).unwrap();
        let update = record.coerce_update(None).unwrap();

        assert_eq!(update.platform.as_deref(), Some(r#"{"id":"1027","name":"Ethereum"}"#));
        assert!(update.infinite_supply);
        assert!(!update.is_hidden);
        assert_eq!(update.date_launched, None);
        assert_eq!(
            update.logo_url.as_deref(),
            Some("https://s2.coinmarketcap.com/static/img/coins/64x64/825.png")
        );

        let contracts = record.contract_refs();
        assert_eq!(contracts.len(), 1);
        assert_eq!(contracts[0].platform_coin.cap_id, 1027);
        assert_eq!(contracts[0].platform_coin.symbol.as_deref(), Some("ETH"));

        let urls = record.url_keys();
        assert_eq!(urls.len(), 2);
        assert!(urls.iter().all(|url| !url.url.is_empty()));
    }

    #[test]
    fn non_numeric_market_cap_fails_coercion() {
        let mut raw = tether();
        raw["self_reported_market_cap"] = json!("n/a");
        let record: MetadataRecord = decode_record(&raw).unwrap();

        let err = record.coerce_update(Some(vec![1, 2, 3])).unwrap_err();
        assert!(matches!(
            err,
            SyncError::FieldCoercion { field: "self_reported_market_cap", .. }
        ));
    }

    #[test]
    fn listing_quote_requires_usd() {
        let listing: ListingRecord = decode_record(&json!({
            "id": 1,
            "name": "Bitcoin",
            "symbol": "BTC",
            "slug": "bitcoin",
            "num_market_pairs": 11000,
            "max_supply": 21000000,
            "circulating_supply": "19700000",
            "total_supply": 19700000,
            "quote": {"USD": {"price": 64000.5, "volume_24h": 1.2e10, "market_cap": 1.26e12, "market_cap_dominance": 52.1}}
        }))
        .unwrap();

        let quote = listing.coerce_quote().unwrap();
        assert_eq!(quote.price, Some(64000.5));
        assert_eq!(quote.circulating_supply, Some(19_700_000.0));
        assert_eq!(quote.num_market_pairs, Some(11000));

        let eur_only: ListingRecord = decode_record(&json!({
            "id": 2, "name": "Litecoin", "quote": {"EUR": {"price": 70.0}}
        }))
        .unwrap();
        assert_eq!(
            eur_only.coerce_quote().unwrap_err(),
            SyncError::MissingField("quote.USD".into())
        );
    }
}
