//! Shared data types for the logical replication write path.
//!
//! This crate holds the vocabulary that the frontier and writer crates speak: keys and spans of
//! the replicated keyspace, hybrid-logical-clock [`Timestamp`]s, the key-value mutations that
//! arrive from a source cluster, the [`StreamEvent`]s that carry them, and the
//! [`ResolvedSpans`] checkpoint that is emitted once a flush has been applied.

pub mod event;
pub mod key;
pub mod timestamp;

pub use event::{KeyValue, ResolvedSpan, ResolvedSpans, StreamEvent, Value};
pub use key::{Key, Span, encode_family_key};
pub use timestamp::Timestamp;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("cannot derive a split key from an empty key")]
    EmptyKey,

    #[error("malformed column family suffix in key {key:?}")]
    MalformedFamilySuffix { key: Key },

    #[error("error serializing resolved spans: {0}")]
    Serde(#[from] serde_json::Error),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
