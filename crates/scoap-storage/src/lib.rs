//! Canonical catalog stores, bulk record storage and HTTP fetch utilities.

mod catalog;
mod fetch;
mod memory;
mod postgres;
mod records;

pub use catalog::{CatalogStore, CatalogTx, MergePolicy, StoreError, StoreResult};
pub use fetch::{
    classify_reqwest_error, classify_status, BackoffPolicy, FetchError, FetchedResponse,
    HttpClientConfig, HttpFetcher, RetryDisposition,
};
pub use memory::{MemoryCatalog, TableCounts};
pub use postgres::PgCatalog;
pub use records::{FsRecordStore, RecordStore, StoredObject};

pub const CRATE_NAME: &str = "scoap-storage";
