//! The message queue contract (§4.7): a thin trait over whatever hosted
//! queue the deployment uses. The core never speaks the queue's wire
//! protocol directly — it only receives raw messages and hands ack
//! tokens back. Grounded on the original's `awssqs.AwsSqs` helper
//! surface (`BatchMessageGet` / `BatchMessageDelete` / `GetAttribute`).

use async_trait::async_trait;
use std::collections::HashMap;
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("queue receive failed: {0}")]
    ReceiveFailed(String),
    #[error("queue ack transport failed: {0}")]
    AckFailed(String),
}

/// A message as returned by the queue driver, before it becomes an
/// [`crate::envelope::Envelope`].
#[derive(Debug, Clone)]
pub struct RawMessage<A> {
    pub payload: bytes::Bytes,
    pub attributes: HashMap<String, String>,
    pub ack_token: A,
}

/// Outcome of one `batch_delete` call: for every ack token submitted,
/// whether it was actually removed from the queue.
#[derive(Debug, Default)]
pub struct PartialAckResult {
    pub failed_indices: Vec<usize>,
}

impl PartialAckResult {
    pub fn all_ok() -> Self {
        PartialAckResult::default()
    }

    pub fn is_fully_ok(&self) -> bool {
        self.failed_indices.is_empty()
    }
}

#[async_trait]
pub trait QueueClient: Send + Sync {
    type AckToken: Send + Sync + Clone + std::fmt::Debug;

    /// The driver's per-call delete limit (§4.5), e.g. SQS's 10.
    fn block_limit(&self) -> usize;

    /// The driver's per-call receive limit (§4.6).
    fn receive_limit(&self) -> usize;

    async fn receive(
        &self,
        max: usize,
        wait: Duration,
    ) -> Result<Vec<RawMessage<Self::AckToken>>, QueueError>;

    /// Delete up to [`block_limit`](Self::block_limit) messages in one
    /// call. The caller (the deleter) is responsible for chunking.
    async fn batch_delete(
        &self,
        tokens: &[Self::AckToken],
    ) -> Result<PartialAckResult, QueueError>;
}
