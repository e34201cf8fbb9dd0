use std::fmt;

use serde::{Deserialize, Serialize};

/// Provider call families. Request pacing is tracked per family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndpointFamily {
    Directory,
    Metadata,
    Listings,
    Asset,
}

impl EndpointFamily {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Directory => "directory",
            Self::Metadata => "metadata",
            Self::Listings => "listings",
            Self::Asset => "asset",
        }
    }
}

impl fmt::Display for EndpointFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One `(start, limit)` request window; `start` is 1-based.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PageWindow {
    pub index: usize,
    pub start: usize,
    pub limit: usize,
}

/// Per-record pipeline position. Records only ever move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PipelineStage {
    Fetched,
    DatesNormalized,
    BaseUpserted,
    MetadataFetched,
    AssetFetched,
    MetadataUpserted,
    Linked,
    QuoteUpserted,
}

impl PipelineStage {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Fetched => "FETCHED",
            Self::DatesNormalized => "DATES_NORMALIZED",
            Self::BaseUpserted => "BASE_UPSERTED",
            Self::MetadataFetched => "METADATA_FETCHED",
            Self::AssetFetched => "ASSET_FETCHED",
            Self::MetadataUpserted => "METADATA_UPSERTED",
            Self::Linked => "LINKED",
            Self::QuoteUpserted => "QUOTE_UPSERTED",
        }
    }
}

impl fmt::Display for PipelineStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
