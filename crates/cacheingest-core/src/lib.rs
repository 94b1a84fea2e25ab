//! Concurrent ingestion engine: drains a hosted message queue of
//! record-change events and materializes each record into a keyed cache
//! store, acknowledging the source message only after the mutation has
//! been durably committed.
//!
//! `queue → dispatcher → process-channel → worker (accumulator) →
//! cache backend → delete-channel → deleter → queue.ack`

pub mod accumulator;
pub mod backend;
pub mod config;
pub mod deleter;
pub mod dispatcher;
pub mod envelope;
pub mod meter;
pub mod queue;
pub mod worker;

pub use accumulator::Accumulator;
pub use backend::{BackendError, CacheBackend, DuplicatePolicy, OrderingPolicy};
pub use config::{BackendKind, Config, ConfigError};
pub use deleter::run_deleter;
pub use dispatcher::Dispatcher;
pub use envelope::{Envelope, RecordOperation};
pub use meter::RateMeter;
pub use queue::{PartialAckResult, QueueClient, QueueError, RawMessage};
pub use worker::run_worker;
