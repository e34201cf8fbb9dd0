//! Core domain model, feed record decoding and error taxonomy for capsync.

pub mod coerce;
mod error;
mod model;
pub mod record;
mod stage;

pub use error::{RetryDisposition, SyncError};
pub use model::{
    CoinDirectoryFields, CoinId, CoinMetadataUpdate, CoinQuoteUpdate, CoinRow, CoinStub,
    ContractAddressId, ContractRef, EntityCounts, LinkReport, MetadataPlan, MetadataRelations,
    PlatformId, TagId, TagKey, UrlId, UrlKey,
};
pub use record::{decode_record, DirectoryRecord, ListingRecord, MetadataRecord};
pub use stage::{EndpointFamily, PageWindow, PipelineStage};

pub const CRATE_NAME: &str = "capsync-core";
