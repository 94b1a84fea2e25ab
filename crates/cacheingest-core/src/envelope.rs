//! The record envelope: the unit of work flowing end to end through the
//! pipeline, from the dispatcher's receive call to the deleter's ack call.

use std::collections::HashMap;
use std::time::Instant;

/// Attribute name the backend keys a row/hash/item on.
pub const ATTR_RECORD_ID: &str = "record-id";
pub const ATTR_RECORD_TYPE: &str = "record-type";
pub const ATTR_RECORD_SOURCE: &str = "record-source";
pub const ATTR_RECORD_OPERATION: &str = "record-operation";

/// The operation a record envelope asks the backend to perform.
///
/// Any attribute value other than `update` or `delete` parses as
/// [`RecordOperation::Unknown`] — per spec this is skipped silently by the
/// backend but the envelope still rides along to be acknowledged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordOperation {
    Update,
    Delete,
    Unknown,
}

impl From<&str> for RecordOperation {
    fn from(s: &str) -> Self {
        match s {
            "update" => RecordOperation::Update,
            "delete" => RecordOperation::Delete,
            _ => RecordOperation::Unknown,
        }
    }
}

/// An inbound message wrapped with receive-time bookkeeping.
///
/// `ack_token` is opaque to the core: the dispatcher copies it straight from
/// the queue client's raw message and the deleter hands it back unexamined.
#[derive(Debug, Clone)]
pub struct Envelope<A> {
    pub payload: bytes::Bytes,
    pub attributes: HashMap<String, String>,
    pub received_at: Instant,
    pub batch_id: String,
    pub ack_token: A,
}

impl<A> Envelope<A> {
    pub fn attr(&self, name: &str) -> &str {
        self.attributes.get(name).map(String::as_str).unwrap_or("")
    }

    pub fn record_id(&self) -> &str {
        self.attr(ATTR_RECORD_ID)
    }

    pub fn record_type(&self) -> &str {
        self.attr(ATTR_RECORD_TYPE)
    }

    pub fn record_source(&self) -> &str {
        self.attr(ATTR_RECORD_SOURCE)
    }

    pub fn operation(&self) -> RecordOperation {
        RecordOperation::from(self.attr(ATTR_RECORD_OPERATION))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn envelope(id: &str, op: &str) -> Envelope<()> {
        let mut attributes = HashMap::new();
        attributes.insert(ATTR_RECORD_ID.to_string(), id.to_string());
        attributes.insert(ATTR_RECORD_OPERATION.to_string(), op.to_string());
        Envelope {
            payload: bytes::Bytes::new(),
            attributes,
            received_at: Instant::now(),
            batch_id: "b1".to_string(),
            ack_token: (),
        }
    }

    #[test]
    fn missing_attribute_is_empty_not_an_error() {
        let e = envelope("a", "update");
        assert_eq!(e.record_type(), "");
        assert_eq!(e.record_source(), "");
    }

    #[test]
    fn unknown_operation_parses_without_error() {
        let e = envelope("a", "frobnicate");
        assert_eq!(e.operation(), RecordOperation::Unknown);
    }

    #[test]
    fn known_operations_parse() {
        assert_eq!(envelope("a", "update").operation(), RecordOperation::Update);
        assert_eq!(envelope("a", "delete").operation(), RecordOperation::Delete);
    }
}
