//! The cache backend contract (§4.2): an opaque, transactional `apply`
//! call that the batch accumulator drives. Three concrete backends
//! (hash store, relational table, document table) live in their own
//! crates and implement this trait; the batching and ordering semantics
//! that make those backends safe to drive concurrently live here.

use crate::envelope::Envelope;
use async_trait::async_trait;
use std::fmt;

#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("backend apply failed: {0}")]
    ApplyFailed(String),
    #[error("backend connection failed: {0}")]
    ConnectionFailed(String),
}

/// How a backend wants the accumulator to treat a duplicate `record-id`
/// seen twice within one flush cycle (§4.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DuplicatePolicy {
    /// The backend's batch call cannot contain the same key twice
    /// (e.g. a vendor batch-write API). Flush the pending batch first,
    /// then start a new one with the duplicate as its first entry.
    FlushFirst,
    /// The backend's apply is an idempotent per-key upsert; duplicates
    /// within a batch just collapse to the last value. Log a warning
    /// and keep accumulating.
    LogAndKeep,
}

/// Whether the accumulator must present `pending` sorted by `record-id`
/// before calling `apply` (relational backends, to reduce deadlock
/// probability across concurrent workers).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderingPolicy {
    ReceiveOrder,
    SortByRecordId,
}

#[async_trait]
pub trait CacheBackend: Send + Sync {
    type AckToken: Send + Sync + Clone + fmt::Debug;

    /// Advisory size trigger for the accumulator. Backends with a vendor
    /// batch-call cap (e.g. 25 items) report it here; the accumulator
    /// never exceeds it.
    fn max_batch_size(&self) -> usize;

    fn duplicate_policy(&self) -> DuplicatePolicy {
        DuplicatePolicy::LogAndKeep
    }

    fn ordering_policy(&self) -> OrderingPolicy {
        OrderingPolicy::ReceiveOrder
    }

    /// Atomically apply every envelope in `batch`, in order. All-or-nothing:
    /// on error the store must be left unchanged.
    async fn apply(&mut self, batch: &[Envelope<Self::AckToken>]) -> Result<(), BackendError>;
}
