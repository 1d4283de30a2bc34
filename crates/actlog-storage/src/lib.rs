//! Event persistence, the durable staging queue and outbound HTTP for actlog.

pub mod http;
pub mod postgres;
pub mod queue;
pub mod store;

pub use http::{
    classify_reqwest_error, classify_status, ApiRequest, BackoffPolicy, FetchError,
    FetchedResponse, HttpClientConfig, HttpFetcher, RetryDisposition, SimpleTokenBucket,
    TokenBucketConfig,
};
pub use postgres::PgEventStore;
pub use queue::{DurableQueue, MemoryQueue, PgQueue, QueueError};
pub use store::{BulkInsertOutcome, EventFilter, EventStore, MemoryEventStore, StoreError};

pub const CRATE_NAME: &str = "actlog-storage";
