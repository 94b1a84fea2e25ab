//! The batch accumulator (§4.3): per-worker buffering of inbound
//! envelopes, flushed on a size trigger or by the worker's idle timer,
//! committed through the backend, then handed to the delete stage.

use crate::backend::{BackendError, CacheBackend, DuplicatePolicy, OrderingPolicy};
use crate::envelope::Envelope;
use crate::meter::RateMeter;
use std::collections::HashSet;
use tokio::sync::mpsc::Sender;

pub struct Accumulator<B: CacheBackend> {
    backend: B,
    worker_id: usize,
    pending: Vec<Envelope<B::AckToken>>,
    seen_ids: HashSet<String>,
    flush_sink: Sender<Vec<Envelope<B::AckToken>>>,
}

impl<B: CacheBackend> Accumulator<B> {
    pub fn new(worker_id: usize, backend: B, flush_sink: Sender<Vec<Envelope<B::AckToken>>>) -> Self {
        Accumulator {
            backend,
            worker_id,
            pending: Vec::new(),
            seen_ids: HashSet::new(),
            flush_sink,
        }
    }

    pub fn queued(&self) -> usize {
        self.pending.len()
    }

    /// Queue one envelope, flushing first if a duplicate id forces it and
    /// flushing after if the size trigger was reached.
    pub async fn queue(&mut self, envelope: Envelope<B::AckToken>) -> Result<(), BackendError> {
        let id = envelope.record_id().to_string();

        if self.seen_ids.contains(&id) {
            match self.backend.duplicate_policy() {
                DuplicatePolicy::FlushFirst => {
                    self.flush().await?;
                }
                DuplicatePolicy::LogAndKeep => {
                    log::warn!(
                        "[cache] worker {}: WARNING: received duplicate key: [{}]",
                        self.worker_id,
                        id
                    );
                }
            }
        }

        self.seen_ids.insert(id);
        self.pending.push(envelope);

        if self.pending.len() >= self.backend.max_batch_size() {
            self.flush().await?;
        }

        Ok(())
    }

    /// Commit whatever is pending. A no-op when nothing is queued.
    ///
    /// On backend error this is fatal: the caller must abort the process
    /// rather than retry, since the queue's redelivery is what recovers
    /// the in-flight records.
    pub async fn flush(&mut self) -> Result<(), BackendError> {
        if self.pending.is_empty() {
            return Ok(());
        }

        let mut meter = RateMeter::new();
        meter.set_count(self.pending.len() as i64);

        if self.backend.ordering_policy() == OrderingPolicy::SortByRecordId {
            self.pending
                .sort_by(|a, b| a.record_id().cmp(b.record_id()));
        }

        if let Err(e) = self.backend.apply(&self.pending).await {
            log::error!(
                "[cache] worker {}: backend.apply-failed on batch of {} messages: {e}",
                self.worker_id,
                self.pending.len()
            );
            return Err(e);
        }

        let committed = std::mem::take(&mut self.pending);
        self.seen_ids.clear();
        let count = committed.len();

        // Backpressure is intentional: a full delete-channel slows this
        // worker down rather than letting commits race ahead of acks.
        if self.flush_sink.send(committed).await.is_err() {
            log::warn!(
                "[cache] worker {}: delete channel closed, committed batch of {} will not be acked",
                self.worker_id,
                count
            );
        }

        log::info!(
            "[cache] worker {}: flushed {} messages ({:.2} mps)",
            self.worker_id,
            count,
            meter.current_rate()
        );

        Ok(())
    }
}
