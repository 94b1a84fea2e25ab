//! The document-table cache backend (§4.2): an item keyed on `id` with
//! attributes `datatype`, `datasource`, `payload`. A flush becomes one
//! `TransactWriteItems` call so the all-or-nothing guarantee the
//! accumulator relies on is real rather than assumed — plain
//! `BatchWriteItem` only ever offers best-effort per-item delivery, which
//! is not what §4.2 asks for. The vendor cap on a single transact call is
//! 25 items, which is also where the original's own batch-write ceiling
//! for this backend came from; `max_batch_size` never reports higher.
//!
//! This backend cannot collapse a duplicate `id` within one call (a
//! transact call touching the same key twice is rejected outright), so
//! it reports [`DuplicatePolicy::FlushFirst`].

use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_dynamodb::types::{AttributeValue, Delete, Put, TransactWriteItem};
use aws_sdk_dynamodb::Client;
use cacheingest_core::backend::{BackendError, CacheBackend, DuplicatePolicy, OrderingPolicy};
use cacheingest_core::envelope::{Envelope, RecordOperation};
use std::env;
use std::fmt;
use std::marker::PhantomData;

/// Hard vendor ceiling on a single `TransactWriteItems` call.
const VENDOR_MAX_BATCH_SIZE: usize = 25;

#[derive(Debug, thiserror::Error)]
pub enum DynamoConfigError {
    #[error("environment variable not set: [{0}]")]
    NotSet(String),
}

#[derive(Debug, Clone)]
pub struct DynamoConfig {
    pub table: String,
    pub region: String,
    pub max_batch_size: usize,
}

impl DynamoConfig {
    pub fn from_env(requested_max_batch_size: usize) -> Result<Self, DynamoConfigError> {
        let table = env::var("CACHE_INGEST_DOC_TABLE")
            .map_err(|_| DynamoConfigError::NotSet("CACHE_INGEST_DOC_TABLE".to_string()))?;
        let region = env::var("CACHE_INGEST_DOC_REGION")
            .map_err(|_| DynamoConfigError::NotSet("CACHE_INGEST_DOC_REGION".to_string()))?;
        let max_batch_size = requested_max_batch_size.min(VENDOR_MAX_BATCH_SIZE);

        log::info!("[config] doc_table       = [{table}]");
        log::info!("[config] doc_region      = [{region}]");
        log::info!("[config] doc_max_batch   = [{max_batch_size}]");

        Ok(DynamoConfig {
            table,
            region,
            max_batch_size,
        })
    }
}

pub struct DynamoBackend<A> {
    client: Client,
    table: String,
    max_batch_size: usize,
    _ack_token: PhantomData<A>,
}

impl<A> DynamoBackend<A> {
    pub async fn connect(config: &DynamoConfig) -> Result<Self, BackendError> {
        let aws_config = aws_config::defaults(BehaviorVersion::latest())
            .region(aws_sdk_dynamodb::config::Region::new(config.region.clone()))
            .load()
            .await;
        let client = Client::new(&aws_config);
        Ok(DynamoBackend {
            client,
            table: config.table.clone(),
            max_batch_size: config.max_batch_size,
            _ack_token: PhantomData,
        })
    }

    fn transact_item(&self, envelope: &Envelope<A>) -> Option<TransactWriteItem> {
        let id = envelope.record_id().to_string();
        match envelope.operation() {
            RecordOperation::Update => {
                let item = [
                    ("id".to_string(), AttributeValue::S(id)),
                    (
                        "datatype".to_string(),
                        AttributeValue::S(envelope.record_type().to_string()),
                    ),
                    (
                        "datasource".to_string(),
                        AttributeValue::S(envelope.record_source().to_string()),
                    ),
                    (
                        "payload".to_string(),
                        AttributeValue::B(aws_sdk_dynamodb::primitives::Blob::new(
                            envelope.payload.to_vec(),
                        )),
                    ),
                ]
                .into_iter()
                .collect();
                let put = Put::builder()
                    .table_name(&self.table)
                    .set_item(Some(item))
                    .build()
                    .expect("table_name and item are always set");
                Some(TransactWriteItem::builder().put(put).build())
            }
            RecordOperation::Delete => {
                let key = [("id".to_string(), AttributeValue::S(id))]
                    .into_iter()
                    .collect();
                let delete = Delete::builder()
                    .table_name(&self.table)
                    .set_key(Some(key))
                    .build()
                    .expect("table_name and key are always set");
                Some(TransactWriteItem::builder().delete(delete).build())
            }
            RecordOperation::Unknown => None,
        }
    }
}

#[async_trait]
impl<A: Send + Sync + Clone + fmt::Debug> CacheBackend for DynamoBackend<A> {
    type AckToken = A;

    fn max_batch_size(&self) -> usize {
        self.max_batch_size
    }

    fn duplicate_policy(&self) -> DuplicatePolicy {
        DuplicatePolicy::FlushFirst
    }

    fn ordering_policy(&self) -> OrderingPolicy {
        OrderingPolicy::ReceiveOrder
    }

    async fn apply(&mut self, batch: &[Envelope<A>]) -> Result<(), BackendError> {
        let items: Vec<TransactWriteItem> = batch
            .iter()
            .filter_map(|envelope| self.transact_item(envelope))
            .collect();

        if items.is_empty() {
            return Ok(());
        }

        self.client
            .transact_write_items()
            .set_transact_items(Some(items))
            .send()
            .await
            .map_err(|e| BackendError::ApplyFailed(e.to_string()))?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cacheingest_core::envelope::{ATTR_RECORD_ID, ATTR_RECORD_OPERATION};
    use std::collections::HashMap;
    use std::time::Instant;

    fn envelope(id: &str, op: &str) -> Envelope<u64> {
        let mut attributes = HashMap::new();
        attributes.insert(ATTR_RECORD_ID.to_string(), id.to_string());
        attributes.insert(ATTR_RECORD_OPERATION.to_string(), op.to_string());
        Envelope {
            payload: bytes::Bytes::from_static(b"payload"),
            attributes,
            received_at: Instant::now(),
            batch_id: "b1".to_string(),
            ack_token: 1,
        }
    }

    fn backend_with_max(max_batch_size: usize) -> DynamoBackend<u64> {
        // SDK clients cannot be constructed without an async config load,
        // so these tests only exercise the pure item-shaping logic.
        DynamoBackend {
            client: unreachable_client(),
            table: "ingest_documents".to_string(),
            max_batch_size,
            _ack_token: PhantomData,
        }
    }

    fn unreachable_client() -> Client {
        let shared_config = aws_config::SdkConfig::builder()
            .region(aws_sdk_dynamodb::config::Region::new("us-east-1"))
            .behavior_version(BehaviorVersion::latest())
            .build();
        Client::new(&shared_config)
    }

    #[test]
    fn requested_max_batch_size_is_clamped_to_vendor_ceiling() {
        let config = DynamoConfig {
            table: "t".to_string(),
            region: "us-east-1".to_string(),
            max_batch_size: 500.min(VENDOR_MAX_BATCH_SIZE),
        };
        assert_eq!(config.max_batch_size, VENDOR_MAX_BATCH_SIZE);
    }

    #[test]
    fn update_envelope_becomes_a_put_transact_item() {
        let backend = backend_with_max(25);
        let item = backend.transact_item(&envelope("abc", "update"));
        assert!(item.is_some());
    }

    #[test]
    fn delete_envelope_becomes_a_delete_transact_item() {
        let backend = backend_with_max(25);
        let item = backend.transact_item(&envelope("abc", "delete"));
        assert!(item.is_some());
    }

    #[test]
    fn unknown_operation_produces_no_transact_item() {
        let backend = backend_with_max(25);
        let item = backend.transact_item(&envelope("abc", "frobnicate"));
        assert!(item.is_none());
    }
}
