//! Binary entry point: wires configuration, the chosen cache backend, the
//! queue client, and the dispatcher/worker/deleter pipeline together, then
//! runs until a shutdown signal drains the pipeline cleanly.
//!
//! Grounded on the original `main.go`: load config, construct the queue
//! helper, get the queue handle, then loop `BatchMessageGet` →
//! `BatchMessageDelete`. The structure here is the same shape turned into
//! a concurrent pipeline instead of one synchronous loop.

use anyhow::Context;
use cacheingest_core::backend::{BackendError, CacheBackend};
use cacheingest_core::config::{BackendKind, Config};
use cacheingest_core::envelope::Envelope;
use cacheingest_core::{run_deleter, run_worker, Accumulator, Dispatcher};
use cacheingest_sqs::{SqsConfig, SqsQueueClient};
use std::future::Future;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;

#[cfg(not(target_env = "msvc"))]
#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();

    let config = Config::from_env().context("loading configuration")?;
    let sqs_config = SqsConfig::from_env().context("loading queue configuration")?;
    let queue = SqsQueueClient::connect(&sqs_config)
        .await
        .context("connecting to queue")?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        log::info!("[main] ctrl-c received, requesting shutdown");
        let _ = shutdown_tx.send(true);
    });

    match config.backend_kind {
        #[cfg(feature = "hash")]
        BackendKind::Hash => {
            let redis_config =
                cacheingest_redis::RedisConfig::from_env(config.backend_max_batch_size)
                    .context("loading hash backend configuration")?;
            run_pipeline(&config, queue, shutdown_rx, move || {
                let redis_config = redis_config.clone();
                async move { cacheingest_redis::RedisBackend::connect(&redis_config).await }
            })
            .await
        }
        #[cfg(not(feature = "hash"))]
        BackendKind::Hash => anyhow::bail!("backend 'hash' selected but the hash feature is not compiled in"),

        #[cfg(feature = "relational")]
        BackendKind::Relational => {
            let pg_config =
                cacheingest_postgres::PostgresConfig::from_env(config.backend_max_batch_size)
                    .context("loading relational backend configuration")?;
            run_pipeline(&config, queue, shutdown_rx, move || {
                let pg_config = pg_config.clone();
                async move { cacheingest_postgres::PostgresBackend::connect(&pg_config).await }
            })
            .await
        }
        #[cfg(not(feature = "relational"))]
        BackendKind::Relational => {
            anyhow::bail!("backend 'relational' selected but the relational feature is not compiled in")
        }

        #[cfg(feature = "document")]
        BackendKind::Document => {
            let doc_config =
                cacheingest_dynamodb::DynamoConfig::from_env(config.backend_max_batch_size)
                    .context("loading document backend configuration")?;
            run_pipeline(&config, queue, shutdown_rx, move || {
                let doc_config = doc_config.clone();
                async move { cacheingest_dynamodb::DynamoBackend::connect(&doc_config).await }
            })
            .await
        }
        #[cfg(not(feature = "document"))]
        BackendKind::Document => {
            anyhow::bail!("backend 'document' selected but the document feature is not compiled in")
        }
    }
}

/// Round-robins everything received on `inbox` across `outboxes` until
/// `inbox` closes, then drops every outbox so downstream consumers see
/// their own channel close in turn. This is what lets one dispatcher (or
/// one pool of workers) fan out to N workers (or N deleters) without
/// every consumer fighting over a single shared receiver.
async fn round_robin<T: Send + 'static>(
    mut inbox: mpsc::Receiver<T>,
    outboxes: Vec<mpsc::Sender<T>>,
) {
    let mut next = 0usize;
    while let Some(item) = inbox.recv().await {
        if outboxes[next].send(item).await.is_err() {
            log::warn!("[main] fan-out target {next} closed early, dropping item");
        }
        next = (next + 1) % outboxes.len();
    }
}

/// Spawns one dispatcher, `config.workers` workers, and `config.deleters`
/// deleters, wired through the process- and delete-channels, and waits for
/// all of them to exit. Generic over the concrete backend so each of the
/// three backend crates reuses the exact same assembly.
async fn run_pipeline<B, F, Fut>(
    config: &Config,
    queue: SqsQueueClient,
    shutdown_rx: watch::Receiver<bool>,
    backend_factory: F,
) -> anyhow::Result<()>
where
    B: CacheBackend<AckToken = String> + 'static,
    F: Fn() -> Fut,
    Fut: Future<Output = Result<B, BackendError>>,
{
    let mut tasks: JoinSet<anyhow::Result<()>> = JoinSet::new();

    // dispatcher -> process_rx -> (round-robin) -> one inbox per worker
    let (process_tx, process_rx) = mpsc::channel::<Envelope<String>>(config.worker_queue_size);
    let dispatcher = Dispatcher::new(
        queue.clone(),
        process_tx,
        config.worker_queue_size,
        config.poll_timeout,
    );
    tasks.spawn(async move {
        dispatcher.run(shutdown_rx).await.map_err(anyhow::Error::from)
    });

    let mut worker_inboxes = Vec::with_capacity(config.workers);
    let mut worker_outboxes = Vec::with_capacity(config.workers);
    for _ in 0..config.workers {
        let (tx, rx) = mpsc::channel::<Envelope<String>>(config.worker_queue_size);
        worker_outboxes.push(tx);
        worker_inboxes.push(rx);
    }
    tasks.spawn(async move {
        round_robin(process_rx, worker_outboxes).await;
        Ok(())
    });

    // every worker's accumulator commits onto this shared delete_tx ->
    // delete_rx -> (round-robin) -> one inbox per deleter
    let (delete_tx, delete_rx) = mpsc::channel::<Vec<Envelope<String>>>(config.delete_queue_size);

    for (worker_id, inbox) in worker_inboxes.into_iter().enumerate() {
        let backend = backend_factory()
            .await
            .with_context(|| format!("worker {worker_id}: connecting to backend"))?;
        let accumulator = Accumulator::new(worker_id, backend, delete_tx.clone());
        let flush_interval = config.worker_flush_time;
        tasks.spawn(async move {
            run_worker(worker_id, accumulator, inbox, flush_interval)
                .await
                .map_err(anyhow::Error::from)
        });
    }
    drop(delete_tx);

    let mut deleter_inboxes = Vec::with_capacity(config.deleters);
    let mut deleter_outboxes = Vec::with_capacity(config.deleters);
    for _ in 0..config.deleters {
        let (tx, rx) = mpsc::channel::<Vec<Envelope<String>>>(config.delete_queue_size);
        deleter_outboxes.push(tx);
        deleter_inboxes.push(rx);
    }
    tasks.spawn(async move {
        round_robin(delete_rx, deleter_outboxes).await;
        Ok(())
    });

    for (deleter_id, inbox) in deleter_inboxes.into_iter().enumerate() {
        let queue = queue.clone();
        tasks.spawn(async move {
            run_deleter(deleter_id, queue, inbox)
                .await
                .map_err(anyhow::Error::from)
        });
    }

    // Every task normally runs until its upstream channel closes during a
    // graceful drain, so a clean `Ok(())` from one task must not short-circuit
    // the others. A fatal error (§4.3/§7) must: any task panicking or
    // returning `Err` aborts every remaining task and propagates immediately,
    // which is what gives a `backend.apply-failed` a non-zero process exit
    // instead of quietly waiting on a dispatcher that never returns.
    while let Some(result) = tasks.join_next().await {
        match result {
            Ok(Ok(())) => continue,
            Ok(Err(e)) => {
                tasks.abort_all();
                return Err(e).context("pipeline task failed");
            }
            Err(join_err) => {
                tasks.abort_all();
                return Err(join_err).context("pipeline task panicked");
            }
        }
    }

    Ok(())
}
