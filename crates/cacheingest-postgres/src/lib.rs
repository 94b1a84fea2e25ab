//! The relational cache backend (§4.2): a single table
//! `(id PK, type, source, payload, created_at, updated_at)`, upserted
//! with `ON CONFLICT (id) DO UPDATE`. Batches commit inside one
//! transaction; the accumulator sorts by `record-id` first to cut
//! deadlock probability across concurrent workers (§9).
//!
//! Grounded on the original `batch.go`/`db-cache.go`.

use async_trait::async_trait;
use cacheingest_core::backend::{BackendError, CacheBackend, DuplicatePolicy, OrderingPolicy};
use cacheingest_core::envelope::{Envelope, RecordOperation};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use std::env;
use std::fmt;
use std::marker::PhantomData;
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum PostgresConfigError {
    #[error("environment variable not set: [{0}]")]
    NotSet(String),
    #[error("environment variable [{0}] could not be parsed: {1}")]
    Invalid(String, String),
}

#[derive(Debug, Clone)]
pub struct PostgresConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub pass: String,
    pub database: String,
    pub table: String,
    pub max_batch_size: usize,
}

impl PostgresConfig {
    pub fn from_env(max_batch_size: usize) -> Result<Self, PostgresConfigError> {
        let get = |name: &'static str| {
            env::var(name).map_err(|_| PostgresConfigError::NotSet(name.to_string()))
        };

        let host = get("CACHE_INGEST_PG_HOST")?;
        let port = get("CACHE_INGEST_PG_PORT")?
            .parse()
            .map_err(|e: std::num::ParseIntError| {
                PostgresConfigError::Invalid("CACHE_INGEST_PG_PORT".to_string(), e.to_string())
            })?;
        let user = get("CACHE_INGEST_PG_USER")?;
        let pass = get("CACHE_INGEST_PG_PASS")?;
        let database = get("CACHE_INGEST_PG_DATABASE")?;
        let table = get("CACHE_INGEST_PG_TABLE")?;

        log::info!("[config] pg_host     = [{host}]");
        log::info!("[config] pg_port     = [{port}]");
        log::info!("[config] pg_user     = [{user}]");
        log::info!("[config] pg_pass     = [REDACTED]");
        log::info!("[config] pg_database = [{database}]");
        log::info!("[config] pg_table    = [{table}]");

        Ok(PostgresConfig {
            host,
            port,
            user,
            pass,
            database,
            table,
            max_batch_size,
        })
    }

    fn connect_options_url(&self) -> String {
        format!(
            "postgres://{}:{}@{}:{}/{}",
            self.user, self.pass, self.host, self.port, self.database
        )
    }
}

pub struct PostgresBackend<A> {
    pool: PgPool,
    table: String,
    max_batch_size: usize,
    _ack_token: PhantomData<A>,
}

impl<A> PostgresBackend<A> {
    pub async fn connect(config: &PostgresConfig) -> Result<Self, BackendError> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .acquire_timeout(Duration::from_secs(30))
            .connect(&config.connect_options_url())
            .await
            .map_err(|e| BackendError::ConnectionFailed(e.to_string()))?;
        Ok(PostgresBackend {
            pool,
            table: config.table.clone(),
            max_batch_size: config.max_batch_size,
            _ack_token: PhantomData,
        })
    }

    fn upsert_sql(&self) -> String {
        format!(
            "INSERT INTO {table} (id, type, source, payload, created_at, updated_at) \
             VALUES ($1, $2, $3, $4, now(), now()) \
             ON CONFLICT (id) DO UPDATE SET type = EXCLUDED.type, source = EXCLUDED.source, \
             payload = EXCLUDED.payload, updated_at = EXCLUDED.updated_at",
            table = self.table
        )
    }

    fn delete_sql(&self) -> String {
        format!("DELETE FROM {table} WHERE id = $1", table = self.table)
    }
}

#[async_trait]
impl<A: Send + Sync + Clone + fmt::Debug> CacheBackend for PostgresBackend<A> {
    type AckToken = A;

    fn max_batch_size(&self) -> usize {
        self.max_batch_size
    }

    fn duplicate_policy(&self) -> DuplicatePolicy {
        DuplicatePolicy::LogAndKeep
    }

    fn ordering_policy(&self) -> OrderingPolicy {
        OrderingPolicy::SortByRecordId
    }

    async fn apply(&mut self, batch: &[Envelope<A>]) -> Result<(), BackendError> {
        let upsert_sql = self.upsert_sql();
        let delete_sql = self.delete_sql();

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| BackendError::ApplyFailed(e.to_string()))?;

        for envelope in batch {
            match envelope.operation() {
                RecordOperation::Update => {
                    sqlx::query(&upsert_sql)
                        .bind(envelope.record_id())
                        .bind(envelope.record_type())
                        .bind(envelope.record_source())
                        .bind(envelope.payload.as_ref())
                        .execute(&mut *tx)
                        .await
                        .map_err(|e| BackendError::ApplyFailed(e.to_string()))?;
                }
                RecordOperation::Delete => {
                    sqlx::query(&delete_sql)
                        .bind(envelope.record_id())
                        .execute(&mut *tx)
                        .await
                        .map_err(|e| BackendError::ApplyFailed(e.to_string()))?;
                }
                RecordOperation::Unknown => {}
            }
        }

        tx.commit()
            .await
            .map_err(|e| BackendError::ApplyFailed(e.to_string()))
    }
}
