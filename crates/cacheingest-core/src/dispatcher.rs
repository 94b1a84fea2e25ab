//! The dispatcher / main poll loop (§4.6): long-polls the queue, tags
//! each message with a batch id and receive time, and fans them out onto
//! the process-channel. A burst is a contiguous run of non-empty polls;
//! `batch-id` changes on every idle-to-active transition.

use crate::envelope::Envelope;
use crate::meter::RateMeter;
use crate::queue::{QueueClient, QueueError};
use rand::Rng;
use std::time::{Duration, Instant};
use tokio::sync::mpsc::Sender;
use tokio::sync::watch;

const TELEMETRY_STRIDE: i64 = 1000;

fn new_batch_id() -> String {
    let millis = chrono::Utc::now().timestamp_millis();
    let suffix: u32 = rand::thread_rng().gen();
    format!("{millis:013x}-{suffix:08x}")
}

pub struct Dispatcher<Q: QueueClient> {
    queue: Q,
    process_tx: Sender<Envelope<Q::AckToken>>,
    process_capacity: usize,
    poll_wait: Duration,
}

impl<Q: QueueClient> Dispatcher<Q> {
    pub fn new(
        queue: Q,
        process_tx: Sender<Envelope<Q::AckToken>>,
        process_capacity: usize,
        poll_wait: Duration,
    ) -> Self {
        Dispatcher {
            queue,
            process_tx,
            process_capacity,
            poll_wait,
        }
    }

    /// Runs until the queue reports a fatal receive error, the
    /// process-channel's receivers all drop, or `shutdown` fires.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> Result<(), QueueError> {
        let mut batch = RateMeter::new();
        batch.set_count(0);
        let mut overall = RateMeter::new();
        let mut batch_id = new_batch_id();
        let mut show_backlog = false;

        loop {
            if *shutdown.borrow() {
                log::info!("[main] shutdown requested, dispatcher exiting");
                return Ok(());
            }

            if show_backlog {
                let depth = self.process_capacity.saturating_sub(self.process_tx.capacity());
                if depth > 0 {
                    log::info!(
                        "[main] backlog: process-channel depth {depth}/{}",
                        self.process_capacity
                    );
                }
                show_backlog = false;
            }

            let messages = tokio::select! {
                result = self.queue.receive(self.queue.receive_limit(), self.poll_wait) => result?,
                _ = shutdown.changed() => {
                    log::info!("[main] shutdown requested, dispatcher exiting");
                    return Ok(());
                }
            };
            let received_at = Instant::now();

            if messages.is_empty() {
                if batch.count() > 0 && batch.count() % TELEMETRY_STRIDE != 0 {
                    log::info!(
                        "[main] burst {batch_id}: final {} messages ({:.2} mps)",
                        batch.count(),
                        batch.current_rate()
                    );
                }
                log::info!("[main] no messages received...");
                batch = RateMeter::new();
                show_backlog = true;
                continue;
            }

            if batch.count() == 0 {
                batch.set_start_now();
                batch_id = new_batch_id();
            }

            for message in messages {
                let envelope = Envelope {
                    payload: message.payload,
                    attributes: message.attributes,
                    received_at,
                    batch_id: batch_id.clone(),
                    ack_token: message.ack_token,
                };

                if self.process_tx.send(envelope).await.is_err() {
                    log::info!("[process] process channel closed, dispatcher exiting");
                    return Ok(());
                }

                batch.increment();
                overall.increment();

                if batch.count() % TELEMETRY_STRIDE == 0 {
                    log::info!(
                        "[main] burst {batch_id}: {} messages ({:.2} mps)",
                        batch.count(),
                        batch.current_rate()
                    );
                }
                if overall.count() % TELEMETRY_STRIDE == 0 {
                    log::info!(
                        "[main] overall: {} messages ({:.2} mps)",
                        overall.count(),
                        overall.current_rate()
                    );
                    show_backlog = true;
                }
            }

            batch.set_stop_now();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::{PartialAckResult, RawMessage};
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tokio::sync::mpsc;

    struct ScriptedQueue {
        bursts: Mutex<std::vec::IntoIter<Vec<RawMessage<u64>>>>,
        calls: Arc<AtomicUsize>,
    }
    use std::sync::Mutex;

    #[async_trait]
    impl QueueClient for ScriptedQueue {
        type AckToken = u64;

        fn block_limit(&self) -> usize {
            10
        }

        fn receive_limit(&self) -> usize {
            10
        }

        async fn receive(
            &self,
            _max: usize,
            _wait: Duration,
        ) -> Result<Vec<RawMessage<u64>>, QueueError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.bursts.lock().unwrap().next().unwrap_or_default())
        }

        async fn batch_delete(
            &self,
            _tokens: &[u64],
        ) -> Result<PartialAckResult, QueueError> {
            Ok(PartialAckResult::all_ok())
        }
    }

    fn message(id: &str, token: u64) -> RawMessage<u64> {
        let mut attributes = HashMap::new();
        attributes.insert("record-id".to_string(), id.to_string());
        attributes.insert("record-operation".to_string(), "update".to_string());
        RawMessage {
            payload: bytes::Bytes::new(),
            attributes,
            ack_token: token,
        }
    }

    #[tokio::test]
    async fn dispatches_one_burst_then_exits_on_channel_close() {
        let calls = Arc::new(AtomicUsize::new(0));
        let queue = ScriptedQueue {
            bursts: Mutex::new(vec![vec![message("a", 1), message("b", 2)], vec![]].into_iter()),
            calls: calls.clone(),
        };
        let (tx, mut rx) = mpsc::channel(8);
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let dispatcher = Dispatcher::new(queue, tx, 8, Duration::from_millis(1));

        let handle = tokio::spawn(dispatcher.run(shutdown_rx));

        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        assert_eq!(first.record_id(), "a");
        assert_eq!(second.record_id(), "b");
        assert_eq!(first.batch_id, second.batch_id);

        rx.close();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn shutdown_signal_stops_the_loop() {
        let calls = Arc::new(AtomicUsize::new(0));
        let queue = ScriptedQueue {
            bursts: Mutex::new(std::iter::repeat(vec![]).take(1000).collect::<Vec<_>>().into_iter()),
            calls: calls.clone(),
        };
        let (tx, _rx) = mpsc::channel(8);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let dispatcher = Dispatcher::new(queue, tx, 8, Duration::from_millis(1));

        let handle = tokio::spawn(dispatcher.run(shutdown_rx));
        shutdown_tx.send(true).unwrap();
        handle.await.unwrap().unwrap();
    }
}
