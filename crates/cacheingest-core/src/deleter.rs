//! The deleter (§4.5): drains committed batches from the delete-channel
//! and acknowledges them against the queue, chunked to the driver's
//! per-call block limit, with slow-message surveillance so head-of-line
//! blocking shows up in the logs without per-message spam.

use crate::envelope::Envelope;
use crate::meter::RateMeter;
use crate::queue::{QueueClient, QueueError};
use std::time::{Duration, Instant};
use tokio::sync::mpsc::Receiver;

const SLOW_THRESHOLD: Duration = Duration::from_secs(60);
const SLOW_BUCKET: Duration = Duration::from_secs(10);

/// Buckets slow envelopes by age: `>60s`, `>70s`, `>80s`, ... Returns
/// `None` when nothing crossed the threshold, so the caller can skip
/// logging entirely on the common path.
fn slow_message_summary<A>(batch: &[Envelope<A>], now: Instant) -> Option<String> {
    let mut buckets: Vec<(u64, usize)> = Vec::new();

    for envelope in batch {
        let age = now.saturating_duration_since(envelope.received_at);
        if age < SLOW_THRESHOLD {
            continue;
        }
        let extra_buckets = (age - SLOW_THRESHOLD).as_secs() / SLOW_BUCKET.as_secs();
        let threshold_secs = SLOW_THRESHOLD.as_secs() + extra_buckets * SLOW_BUCKET.as_secs();
        match buckets.iter_mut().find(|(t, _)| *t == threshold_secs) {
            Some((_, count)) => *count += 1,
            None => buckets.push((threshold_secs, 1)),
        }
    }

    if buckets.is_empty() {
        return None;
    }

    buckets.sort_by_key(|(t, _)| *t);
    let parts: Vec<String> = buckets
        .iter()
        .map(|(t, count)| format!(">{t}s: {count}"))
        .collect();
    Some(parts.join(", "))
}

pub async fn run_deleter<Q: QueueClient>(
    deleter_id: usize,
    queue: Q,
    mut inbox: Receiver<Vec<Envelope<Q::AckToken>>>,
) -> Result<(), QueueError> {
    let mut overall = RateMeter::new();
    let mut groups_processed: u64 = 0;

    while let Some(batch) = inbox.recv().await {
        if batch.is_empty() {
            continue;
        }

        if let Some(summary) = slow_message_summary(&batch, Instant::now()) {
            log::warn!("[delete] deleter {deleter_id}: slow messages: {summary}");
        }

        let block_limit = queue.block_limit().max(1);
        let mut batch_meter = RateMeter::new();
        batch_meter.set_count(batch.len() as i64);

        for chunk in batch.chunks(block_limit) {
            let tokens: Vec<Q::AckToken> = chunk.iter().map(|e| e.ack_token.clone()).collect();
            let result = queue.batch_delete(&tokens).await?;
            if !result.is_fully_ok() {
                for idx in &result.failed_indices {
                    log::warn!(
                        "[delete] deleter {deleter_id}: message {idx} failed to delete, will be redelivered"
                    );
                }
            }
        }

        groups_processed += 1;
        overall.add_count(batch.len() as i64);

        log::info!(
            "[delete] deleter {deleter_id}: acked {} messages ({:.2} mps), {} groups / {} total",
            batch.len(),
            batch_meter.current_rate(),
            groups_processed,
            overall.count()
        );
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::{ATTR_RECORD_ID, ATTR_RECORD_OPERATION};
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::{Arc, Mutex};
    use tokio::sync::mpsc;

    fn envelope(id: &str, token: u64, age: Duration) -> Envelope<u64> {
        let mut attributes = HashMap::new();
        attributes.insert(ATTR_RECORD_ID.to_string(), id.to_string());
        attributes.insert(ATTR_RECORD_OPERATION.to_string(), "update".to_string());
        Envelope {
            payload: bytes::Bytes::new(),
            attributes,
            received_at: Instant::now() - age,
            batch_id: "b1".to_string(),
            ack_token: token,
        }
    }

    #[test]
    fn slow_summary_buckets_by_ten_seconds() {
        let batch = vec![
            envelope("a", 1, Duration::from_secs(5)),
            envelope("b", 2, Duration::from_secs(61)),
            envelope("c", 3, Duration::from_secs(75)),
            envelope("d", 4, Duration::from_secs(76)),
        ];
        let summary = slow_message_summary(&batch, Instant::now()).unwrap();
        assert_eq!(summary, ">60s: 1, >70s: 2");
    }

    #[test]
    fn no_slow_messages_returns_none() {
        let batch = vec![envelope("a", 1, Duration::from_secs(1))];
        assert!(slow_message_summary(&batch, Instant::now()).is_none());
    }

    #[derive(Clone)]
    struct FakeQueue {
        block_limit: usize,
        calls: Arc<Mutex<Vec<usize>>>,
    }

    #[async_trait]
    impl QueueClient for FakeQueue {
        type AckToken = u64;

        fn block_limit(&self) -> usize {
            self.block_limit
        }

        fn receive_limit(&self) -> usize {
            10
        }

        async fn receive(
            &self,
            _max: usize,
            _wait: Duration,
        ) -> Result<Vec<crate::queue::RawMessage<u64>>, QueueError> {
            Ok(vec![])
        }

        async fn batch_delete(
            &self,
            tokens: &[u64],
        ) -> Result<crate::queue::PartialAckResult, QueueError> {
            self.calls.lock().unwrap().push(tokens.len());
            Ok(crate::queue::PartialAckResult::all_ok())
        }
    }

    #[tokio::test]
    async fn chunks_full_blocks_plus_remainder() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let queue = FakeQueue {
            block_limit: 10,
            calls: calls.clone(),
        };
        let (tx, rx) = mpsc::channel(1);

        let batch: Vec<Envelope<u64>> = (0..23)
            .map(|i| envelope(&i.to_string(), i, Duration::ZERO))
            .collect();
        tx.send(batch).await.unwrap();
        drop(tx);

        run_deleter(0, queue, rx).await.unwrap();

        assert_eq!(*calls.lock().unwrap(), vec![10, 10, 3]);
    }
}
