//! The configuration surface (§6): every knob the core pipeline (workers,
//! deleters, channel sizes, backend selection) reads from the environment.
//! Backend-specific credentials (Redis/Postgres/DynamoDB) and queue-specific
//! knobs (queue name, overflow bucket) are loaded by their own crates using
//! the same `ensure_set` pattern, so this module doesn't duplicate them.
//!
//! Grounded on the original `LoadConfiguration`: every required value is
//! fetched with an "ensure set" helper, missing or unparseable values are
//! logged and abort startup before any task is spawned.

use std::env;
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("environment variable not set: [{0}]")]
    NotSet(String),
    #[error("environment variable [{0}] could not be parsed: {1}")]
    Invalid(String, String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    Hash,
    Relational,
    Document,
}

impl BackendKind {
    fn parse(raw: &str) -> Result<Self, ConfigError> {
        match raw {
            "hash" => Ok(BackendKind::Hash),
            "relational" => Ok(BackendKind::Relational),
            "document" => Ok(BackendKind::Document),
            other => Err(ConfigError::Invalid(
                "CACHE_INGEST_BACKEND".to_string(),
                format!("unknown backend kind [{other}], expected hash|relational|document"),
            )),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub poll_timeout: Duration,
    pub workers: usize,
    pub worker_queue_size: usize,
    pub worker_flush_time: Duration,
    pub deleters: usize,
    pub delete_queue_size: usize,
    pub backend_kind: BackendKind,
    pub backend_max_batch_size: usize,
}

pub fn ensure_set(name: &str) -> Result<String, ConfigError> {
    env::var(name).map_err(|_| ConfigError::NotSet(name.to_string()))
}

pub fn ensure_set_and_non_empty(name: &str) -> Result<String, ConfigError> {
    let val = ensure_set(name)?;
    if val.is_empty() {
        return Err(ConfigError::NotSet(name.to_string()));
    }
    Ok(val)
}

pub fn env_to_usize(name: &str) -> Result<usize, ConfigError> {
    let raw = ensure_set_and_non_empty(name)?;
    raw.parse()
        .map_err(|e: std::num::ParseIntError| ConfigError::Invalid(name.to_string(), e.to_string()))
}

pub fn env_to_u64(name: &str) -> Result<u64, ConfigError> {
    let raw = ensure_set_and_non_empty(name)?;
    raw.parse()
        .map_err(|e: std::num::ParseIntError| ConfigError::Invalid(name.to_string(), e.to_string()))
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        log::info!("[main] loading configuration...");

        let poll_timeout = Duration::from_secs(env_to_u64("CACHE_INGEST_POLL_TIMEOUT")?);
        let workers = env_to_usize("CACHE_INGEST_WORKERS")?;
        let worker_queue_size = env_to_usize("CACHE_INGEST_WORKER_QUEUE_SIZE")?;
        let worker_flush_time = Duration::from_secs(env_to_u64("CACHE_INGEST_WORKER_FLUSH_TIME")?);
        let deleters = env_to_usize("CACHE_INGEST_DELETERS")?;
        let delete_queue_size = env_to_usize("CACHE_INGEST_DELETE_QUEUE_SIZE")?;
        let backend_kind = BackendKind::parse(&ensure_set_and_non_empty("CACHE_INGEST_BACKEND")?)?;
        let backend_max_batch_size = env_to_usize("CACHE_INGEST_BACKEND_MAX_BATCH_SIZE")?;

        let config = Config {
            poll_timeout,
            workers,
            worker_queue_size,
            worker_flush_time,
            deleters,
            delete_queue_size,
            backend_kind,
            backend_max_batch_size,
        };

        log::info!("[config] poll_timeout         = [{:?}]", config.poll_timeout);
        log::info!("[config] workers              = [{}]", config.workers);
        log::info!("[config] worker_queue_size    = [{}]", config.worker_queue_size);
        log::info!("[config] worker_flush_time    = [{:?}]", config.worker_flush_time);
        log::info!("[config] deleters             = [{}]", config.deleters);
        log::info!("[config] delete_queue_size    = [{}]", config.delete_queue_size);
        log::info!("[config] backend_kind         = [{:?}]", config.backend_kind);
        log::info!(
            "[config] backend_max_batch_size = [{}]",
            config.backend_max_batch_size
        );

        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backend_kind_rejects_unknown_values() {
        assert!(BackendKind::parse("carrier-pigeon").is_err());
        assert_eq!(BackendKind::parse("hash").unwrap(), BackendKind::Hash);
    }
}
