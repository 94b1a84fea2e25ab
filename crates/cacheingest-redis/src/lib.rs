//! The hash-store cache backend (§4.2): one Redis hash per `record-id`
//! with fields `type`, `source`, `payload`. Batches are applied through
//! a single `MULTI`/`EXEC` pipeline so a flush is all-or-nothing.
//!
//! Grounded on the original `redis.go`/`worker.go`: a pipeline of
//! `HMSET` (here, `HSET` with multiple field/value pairs) commands,
//! flushed together.

use async_trait::async_trait;
use cacheingest_core::backend::{BackendError, CacheBackend, DuplicatePolicy, OrderingPolicy};
use cacheingest_core::envelope::{Envelope, RecordOperation};
use redis::aio::ConnectionManager;
use redis::Client;
use std::env;
use std::fmt;
use std::marker::PhantomData;
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum RedisConfigError {
    #[error("environment variable not set: [{0}]")]
    NotSet(String),
    #[error("environment variable [{0}] could not be parsed: {1}")]
    Invalid(String, String),
}

#[derive(Debug, Clone)]
pub struct RedisConfig {
    pub host: String,
    pub port: u16,
    pub pass: String,
    pub db: i64,
    pub timeout: Duration,
    pub max_batch_size: usize,
    /// Max commands per `MULTI`/`EXEC` pipeline call — its own limit,
    /// separate from (but bounded by) the accumulator's `max_batch_size`.
    pub pipeline_size: usize,
}

impl RedisConfig {
    pub fn from_env(max_batch_size: usize) -> Result<Self, RedisConfigError> {
        let host = env::var("CACHE_INGEST_REDIS_HOST")
            .map_err(|_| RedisConfigError::NotSet("CACHE_INGEST_REDIS_HOST".to_string()))?;
        let port = env::var("CACHE_INGEST_REDIS_PORT")
            .map_err(|_| RedisConfigError::NotSet("CACHE_INGEST_REDIS_PORT".to_string()))?
            .parse()
            .map_err(|e: std::num::ParseIntError| {
                RedisConfigError::Invalid("CACHE_INGEST_REDIS_PORT".to_string(), e.to_string())
            })?;
        // password may legitimately be empty (unauthenticated instances)
        let pass = env::var("CACHE_INGEST_REDIS_PASS").unwrap_or_default();
        let db = env::var("CACHE_INGEST_REDIS_DB")
            .map_err(|_| RedisConfigError::NotSet("CACHE_INGEST_REDIS_DB".to_string()))?
            .parse()
            .map_err(|e: std::num::ParseIntError| {
                RedisConfigError::Invalid("CACHE_INGEST_REDIS_DB".to_string(), e.to_string())
            })?;
        let timeout_secs: u64 = env::var("CACHE_INGEST_REDIS_TIMEOUT")
            .map_err(|_| RedisConfigError::NotSet("CACHE_INGEST_REDIS_TIMEOUT".to_string()))?
            .parse()
            .map_err(|e: std::num::ParseIntError| {
                RedisConfigError::Invalid("CACHE_INGEST_REDIS_TIMEOUT".to_string(), e.to_string())
            })?;
        let pipeline_size: usize = env::var("CACHE_INGEST_REDIS_PIPELINE_SIZE")
            .map_err(|_| RedisConfigError::NotSet("CACHE_INGEST_REDIS_PIPELINE_SIZE".to_string()))?
            .parse()
            .map_err(|e: std::num::ParseIntError| {
                RedisConfigError::Invalid(
                    "CACHE_INGEST_REDIS_PIPELINE_SIZE".to_string(),
                    e.to_string(),
                )
            })?;

        log::info!("[config] redis_host          = [{host}]");
        log::info!("[config] redis_port          = [{port}]");
        log::info!("[config] redis_pass          = [REDACTED]");
        log::info!("[config] redis_db            = [{db}]");
        log::info!("[config] redis_timeout       = [{timeout_secs}]");
        log::info!("[config] redis_pipeline_size = [{pipeline_size}]");

        Ok(RedisConfig {
            host,
            port,
            pass,
            db,
            timeout: Duration::from_secs(timeout_secs),
            max_batch_size,
            pipeline_size,
        })
    }

    fn connection_url(&self) -> String {
        if self.pass.is_empty() {
            format!("redis://{}:{}/{}", self.host, self.port, self.db)
        } else {
            format!("redis://:{}@{}:{}/{}", self.pass, self.host, self.port, self.db)
        }
    }
}

pub struct RedisBackend<A> {
    conn: ConnectionManager,
    max_batch_size: usize,
    pipeline_size: usize,
    _ack_token: PhantomData<A>,
}

impl<A> RedisBackend<A> {
    pub async fn connect(config: &RedisConfig) -> Result<Self, BackendError> {
        let client = Client::open(config.connection_url())
            .map_err(|e| BackendError::ConnectionFailed(e.to_string()))?;
        let conn = client
            .get_connection_manager()
            .await
            .map_err(|e| BackendError::ConnectionFailed(e.to_string()))?;
        Ok(RedisBackend {
            conn,
            max_batch_size: config.max_batch_size,
            pipeline_size: config.pipeline_size.max(1),
            _ack_token: PhantomData,
        })
    }
}

#[async_trait]
impl<A: Send + Sync + Clone + fmt::Debug> CacheBackend for RedisBackend<A> {
    type AckToken = A;

    fn max_batch_size(&self) -> usize {
        self.max_batch_size
    }

    fn duplicate_policy(&self) -> DuplicatePolicy {
        DuplicatePolicy::LogAndKeep
    }

    fn ordering_policy(&self) -> OrderingPolicy {
        OrderingPolicy::ReceiveOrder
    }

    async fn apply(&mut self, batch: &[Envelope<A>]) -> Result<(), BackendError> {
        for chunk in batch.chunks(self.pipeline_size) {
            let mut pipe = redis::pipe();
            pipe.atomic();

            for envelope in chunk {
                let id = envelope.record_id();
                match envelope.operation() {
                    RecordOperation::Update => {
                        pipe.cmd("HSET")
                            .arg(id)
                            .arg("type")
                            .arg(envelope.record_type())
                            .arg("source")
                            .arg(envelope.record_source())
                            .arg("payload")
                            .arg(envelope.payload.as_ref())
                            .ignore();
                    }
                    RecordOperation::Delete => {
                        pipe.cmd("DEL").arg(id).ignore();
                    }
                    RecordOperation::Unknown => {}
                }
            }

            pipe.query_async::<_, ()>(&mut self.conn)
                .await
                .map_err(|e| BackendError::ApplyFailed(e.to_string()))?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(pass: &str) -> RedisConfig {
        RedisConfig {
            host: "cache.example.internal".to_string(),
            port: 6379,
            pass: pass.to_string(),
            db: 2,
            timeout: Duration::from_secs(5),
            max_batch_size: 500,
            pipeline_size: 100,
        }
    }

    #[test]
    fn unauthenticated_instances_omit_credentials_from_the_url() {
        let url = config("").connection_url();
        assert_eq!(url, "redis://cache.example.internal:6379/2");
    }

    #[test]
    fn a_configured_password_is_embedded_in_the_url() {
        let url = config("s3cr3t").connection_url();
        assert_eq!(url, "redis://:s3cr3t@cache.example.internal:6379/2");
        assert!(!config("s3cr3t").connection_url().is_empty());
    }
}
