//! Persistence and transport for capsync: the raw response archive, the HTTP
//! fetcher and the entity stores.

mod archive;
mod http;
mod store;

pub use archive::{ArtifactStore, StoredArtifact};
pub use http::{
    classify_reqwest_error, classify_status, FetchError, FetchedResponse, HttpClientConfig,
    HttpFetcher,
};
pub use store::{EntityStore, MemoryStore, PgStore, StoreError, StoreResult};

pub const CRATE_NAME: &str = "capsync-storage";
