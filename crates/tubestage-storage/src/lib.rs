//! Document staging store + HTTP fetch utilities for tubestage.

pub mod documents;
pub mod http;

pub use documents::{
    open_document_store, read_records, write_records, DocumentStore, JsonlDocumentStore,
    MemoryDocumentStore, StoreError,
};
pub use http::{
    classify_reqwest_error, classify_status, BackoffPolicy, FetchError, FetchedResponse,
    HttpClientConfig, HttpFetcher, RetryDisposition,
};

pub const CRATE_NAME: &str = "tubestage-storage";
