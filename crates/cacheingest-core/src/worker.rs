//! The worker (§4.4): owns exactly one accumulator, multiplexing between
//! new envelopes arriving on the process-channel and its own idle-flush
//! timer. Closing the process-channel drains it: one last flush, then
//! the worker returns.

use crate::accumulator::Accumulator;
use crate::backend::{BackendError, CacheBackend};
use crate::envelope::Envelope;
use std::time::Duration;
use tokio::sync::mpsc::Receiver;
use tokio::time::{interval, MissedTickBehavior};

pub async fn run_worker<B: CacheBackend>(
    worker_id: usize,
    mut accumulator: Accumulator<B>,
    mut inbox: Receiver<Envelope<B::AckToken>>,
    flush_interval: Duration,
) -> Result<(), BackendError> {
    let mut ticker = interval(flush_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await; // the first tick fires immediately; consume it

    loop {
        tokio::select! {
            maybe_envelope = inbox.recv() => {
                match maybe_envelope {
                    Some(envelope) => {
                        accumulator.queue(envelope).await?;
                    }
                    None => {
                        log::info!("[process] worker {worker_id}: process channel closed, flushing and exiting");
                        accumulator.flush().await?;
                        return Ok(());
                    }
                }
            }
            _ = ticker.tick() => {
                accumulator.flush().await?;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{DuplicatePolicy, OrderingPolicy};
    use crate::envelope::{ATTR_RECORD_ID, ATTR_RECORD_OPERATION};
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::{Arc, Mutex};
    use std::time::Instant;
    use tokio::sync::mpsc;

    #[derive(Clone)]
    struct CountingBackend {
        max_batch_size: usize,
        applies: Arc<Mutex<usize>>,
    }

    #[async_trait]
    impl CacheBackend for CountingBackend {
        type AckToken = u64;

        fn max_batch_size(&self) -> usize {
            self.max_batch_size
        }

        fn duplicate_policy(&self) -> DuplicatePolicy {
            DuplicatePolicy::LogAndKeep
        }

        fn ordering_policy(&self) -> OrderingPolicy {
            OrderingPolicy::ReceiveOrder
        }

        async fn apply(&mut self, _batch: &[Envelope<u64>]) -> Result<(), BackendError> {
            *self.applies.lock().unwrap() += 1;
            Ok(())
        }
    }

    fn envelope(id: &str) -> Envelope<u64> {
        let mut attributes = HashMap::new();
        attributes.insert(ATTR_RECORD_ID.to_string(), id.to_string());
        attributes.insert(ATTR_RECORD_OPERATION.to_string(), "update".to_string());
        Envelope {
            payload: bytes::Bytes::new(),
            attributes,
            received_at: Instant::now(),
            batch_id: "b1".to_string(),
            ack_token: 0,
        }
    }

    #[tokio::test]
    async fn closing_inbox_triggers_final_flush_and_exit() {
        let applies = Arc::new(Mutex::new(0));
        let backend = CountingBackend {
            max_batch_size: 100,
            applies: applies.clone(),
        };
        let (flush_tx, _flush_rx) = mpsc::channel(8);
        let accumulator = Accumulator::new(0, backend, flush_tx);
        let (inbox_tx, inbox_rx) = mpsc::channel(8);

        inbox_tx.send(envelope("a")).await.unwrap();
        drop(inbox_tx);

        run_worker(0, accumulator, inbox_rx, Duration::from_secs(3600))
            .await
            .unwrap();

        assert_eq!(*applies.lock().unwrap(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn idle_timer_flushes_without_reaching_size_trigger() {
        let applies = Arc::new(Mutex::new(0));
        let backend = CountingBackend {
            max_batch_size: 100,
            applies: applies.clone(),
        };
        let (flush_tx, _flush_rx) = mpsc::channel(8);
        let accumulator = Accumulator::new(0, backend, flush_tx);
        let (inbox_tx, inbox_rx) = mpsc::channel(8);

        let handle = tokio::spawn(run_worker(
            0,
            accumulator,
            inbox_rx,
            Duration::from_secs(5),
        ));

        inbox_tx.send(envelope("a")).await.unwrap();
        tokio::time::advance(Duration::from_secs(6)).await;
        tokio::task::yield_now().await;

        assert_eq!(*applies.lock().unwrap(), 1);

        drop(inbox_tx);
        handle.await.unwrap().unwrap();
    }
}
