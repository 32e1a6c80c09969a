//! Durable search-index job queue.
//!
//! - `types`: job rows, actions, statuses and the index document
//! - `store`: atomic claim/transition storage (`JobStore`), in-memory impl
//! - `postgres`: `FOR UPDATE SKIP LOCKED` store on Postgres
//! - `retry`: exponential backoff and dead-letter decisions
//! - `processor`: runs claimed jobs against the record source and index
//! - `poller`: fixed-interval loop with cooperative stop

pub mod poller;
pub mod postgres;
pub mod processor;
pub mod retry;
pub mod store;
pub mod types;

pub use poller::{JobPoller, JobPollerHandle, PollerStats};
pub use postgres::PostgresJobStore;
pub use processor::{BatchReport, JobError, JobOutcome, JobProcessor, ProcessorConfig};
pub use retry::{RetryDecision, RetryPolicy};
pub use store::{InMemoryJobStore, JobStore, JobStoreError};
pub use types::{IndexDocument, Job, JobAction, JobStatus};
