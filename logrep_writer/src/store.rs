//! The boundary to the local transactional key-value store and the row codec that applies
//! replicated mutations to it.

use std::fmt::Debug;

use async_trait::async_trait;
use logrep_types::{Key, KeyValue, Value};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("transaction commit failed: {0}")]
    CommitFailed(String),

    #[error("failed to apply row for key {key}: {message}")]
    RowApplication { key: Key, message: String },
}

/// Opens transactions against the local store.
#[async_trait]
pub trait KvStore: Debug + Send + Sync + 'static {
    async fn begin(&self) -> Result<Box<dyn Transaction>, StoreError>;
}

/// A single transaction. Dropping it without committing discards its writes.
#[async_trait]
pub trait Transaction: Debug + Send {
    /// Exclude this transaction's writes from change feeds on the local keyspace, so replicated
    /// rows are not streamed back to their source.
    fn set_omit_in_rangefeeds(&mut self);

    async fn get(&mut self, key: &Key) -> Result<Option<Value>, StoreError>;

    async fn put(&mut self, key: Key, value: Value) -> Result<(), StoreError>;

    /// Remove `key` outright, leaving no tombstone behind.
    async fn delete(&mut self, key: &Key) -> Result<(), StoreError>;

    async fn commit(self: Box<Self>) -> Result<(), StoreError>;

    async fn rollback(self: Box<Self>);
}

/// Applies one replicated mutation to local tables.
#[async_trait]
pub trait RowProcessor: Debug + Send + Sync + 'static {
    async fn process_row(&self, txn: &mut dyn Transaction, kv: &KeyValue)
    -> Result<(), StoreError>;
}
