//! Entity persistence behind one trait, with a PostgreSQL and an in-process
//! implementation.
//!
//! Every creating operation is a get-or-create keyed on the entity's natural
//! key and is safe to call concurrently for the same key. Platforms, contract
//! addresses, tags and urls are only ever created inside the composite
//! operations (`apply_metadata`, `link_relations`, `apply_quote`), each of
//! which commits as one unit.

mod memory;
mod postgres;

use async_trait::async_trait;
use capsync_core::{
    CoinDirectoryFields, CoinId, CoinQuoteUpdate, CoinRow, CoinStub, EntityCounts, LinkReport,
    MetadataPlan, MetadataRelations, SyncError,
};
use thiserror::Error;

pub use memory::MemoryStore;
pub use postgres::PgStore;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum StoreError {
    #[error("{entity} {key} not found")]
    NotFound { entity: &'static str, key: String },
    #[error("unresolved conflict inserting {entity}")]
    Conflict { entity: &'static str },
    #[error("contention: {0}")]
    Contention(String),
    #[error("database error: {0}")]
    Database(String),
}

impl StoreError {
    pub fn coin_not_found(cap_id: i64) -> Self {
        Self::NotFound {
            entity: "coin",
            key: format!("cap_id={cap_id}"),
        }
    }
}

impl From<StoreError> for SyncError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound { entity, key } => {
                SyncError::MissingField(format!("{entity} {key} not found"))
            }
            StoreError::Conflict { entity } => SyncError::DuplicateKeyConflict { entity },
            StoreError::Contention(message) => SyncError::Contention(message),
            StoreError::Database(message) => SyncError::Store(message),
        }
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

#[async_trait]
pub trait EntityStore: Send + Sync {
    fn backend(&self) -> &'static str;

    /// Get-or-create by `cap_id`; an existing row is never modified.
    async fn ensure_coin_stub(&self, stub: &CoinStub) -> StoreResult<CoinId>;

    /// Insert-or-update of the directory columns by `cap_id`.
    async fn upsert_coin_directory(&self, fields: &CoinDirectoryFields) -> StoreResult<CoinId>;

    /// Materializes every entity the plan references (placeholder coins,
    /// platforms, contract addresses, tags, urls) and applies the metadata
    /// update, all in one unit.
    async fn apply_metadata(&self, plan: &MetadataPlan) -> StoreResult<MetadataRelations>;

    /// Inserts the coin's join rows; pairs that already exist are counted, not
    /// duplicated.
    async fn link_relations(&self, relations: &MetadataRelations) -> StoreResult<LinkReport>;

    /// Ensures the coin exists, then applies the quote columns.
    async fn apply_quote(&self, stub: &CoinStub, quote: &CoinQuoteUpdate) -> StoreResult<CoinId>;

    /// Every known `cap_id`, ascending.
    async fn coin_keys(&self) -> StoreResult<Vec<i64>>;

    async fn coin(&self, cap_id: i64) -> StoreResult<Option<CoinRow>>;

    async fn counts(&self) -> StoreResult<EntityCounts>;
}
