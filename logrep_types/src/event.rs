//! Change events received from the source cluster and the checkpoints emitted after they have
//! been applied.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::{Key, Result, Span, Timestamp};

/// Bytes accounted for the timestamp of every value.
const TIMESTAMP_SIZE: usize = size_of::<i64>() + size_of::<i32>();

/// The payload of a mutation along with the source timestamp it was written at. Empty raw bytes
/// denote a deletion.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Value {
    pub raw_bytes: Bytes,
    pub timestamp: Timestamp,
}

impl Value {
    pub fn new(raw_bytes: impl Into<Bytes>, timestamp: Timestamp) -> Self {
        Self {
            raw_bytes: raw_bytes.into(),
            timestamp,
        }
    }

    pub fn is_tombstone(&self) -> bool {
        self.raw_bytes.is_empty()
    }
}

/// A single key-value mutation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyValue {
    pub key: Key,
    pub value: Value,
}

impl KeyValue {
    pub fn new(key: impl Into<Key>, raw_bytes: impl Into<Bytes>, timestamp: Timestamp) -> Self {
        Self {
            key: key.into(),
            value: Value::new(raw_bytes, timestamp),
        }
    }

    /// Size used for all buffer and batch byte accounting.
    pub fn size(&self) -> usize {
        self.key.len() + self.value.raw_bytes.len() + TIMESTAMP_SIZE
    }

    pub fn timestamp(&self) -> Timestamp {
        self.value.timestamp
    }
}

/// An event yielded by a replication subscription.
///
/// Only [`StreamEvent::Kv`] and [`StreamEvent::Checkpoint`] carry state for a logical
/// replication consumer. New variants may be added, consumers must treat variants they do not
/// know as fatal.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum StreamEvent {
    /// A batch of point mutations.
    Kv(Vec<KeyValue>),
    /// Notice that every change in the given spans at or below the paired timestamps has been
    /// emitted.
    Checkpoint(Vec<ResolvedSpan>),
    /// A range split at the given key on the source.
    Split(Key),
    /// A bulk ingested SST covering `span`.
    SsTable { data: Bytes, span: Span },
    /// A range deletion.
    DeleteRange { span: Span, timestamp: Timestamp },
}

impl StreamEvent {
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Kv(_) => "kv",
            Self::Checkpoint(_) => "checkpoint",
            Self::Split(_) => "split",
            Self::SsTable { .. } => "sstable",
            Self::DeleteRange { .. } => "delete_range",
        }
    }
}

/// A span that has been resolved up to `timestamp`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedSpan {
    pub span: Span,
    pub timestamp: Timestamp,
}

impl ResolvedSpan {
    pub fn new(span: Span, timestamp: Timestamp) -> Self {
        Self { span, timestamp }
    }
}

/// A resumable checkpoint: every span in the list has had all of its changes at or below the
/// paired timestamp applied.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedSpans {
    pub resolved_spans: Vec<ResolvedSpan>,
}

impl ResolvedSpans {
    pub fn new(resolved_spans: Vec<ResolvedSpan>) -> Self {
        Self { resolved_spans }
    }

    pub fn is_empty(&self) -> bool {
        self.resolved_spans.is_empty()
    }

    pub fn len(&self) -> usize {
        self.resolved_spans.len()
    }

    pub fn encode(&self) -> Result<Bytes> {
        Ok(Bytes::from(serde_json::to_vec(self)?))
    }

    pub fn decode(b: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(b)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kv_size_accounts_for_timestamp() {
        let kv = KeyValue::new("abc", Bytes::from_static(b"hello"), Timestamp::from_wall(1));
        assert_eq!(kv.size(), 3 + 5 + 12);
        assert!(!kv.value.is_tombstone());
        assert!(KeyValue::new("abc", Bytes::new(), Timestamp::EMPTY).value.is_tombstone());
    }

    #[test]
    fn resolved_spans_decode_encoded() {
        let spans = ResolvedSpans::new(vec![
            ResolvedSpan::new(Span::new("a", "m"), Timestamp::new(10, 1)),
            ResolvedSpan::new(Span::new("m", "z"), Timestamp::new(20, 0)),
        ]);
        let decoded = ResolvedSpans::decode(&spans.encode().unwrap()).unwrap();
        assert_eq!(decoded, spans);
        assert!(ResolvedSpans::decode(b"not json").is_err());
    }
}
