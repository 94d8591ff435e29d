//! Parallel, transactional application of a flushed buffer.
//!
//! A flush is sorted by `(split-safe key, timestamp)` and cut into one contiguous chunk per
//! worker. Chunk boundaries never fall inside a run of equal split-safe keys, so every mutation
//! to a row is applied by the same worker, in timestamp order. Each worker applies its chunk in
//! fixed size transactions, one after another. Chunks run concurrently.

use std::fmt::Debug;
use std::ops::Range;
use std::sync::Arc;

use async_trait::async_trait;
use logrep_types::{Key, KeyValue};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::debug;

use crate::buffer::IngestionBuffer;
use crate::metrics::WriterMetrics;
use crate::status::ConsumerStatus;
use crate::store::{KvStore, RowProcessor};
use crate::{Error, Result};

/// The outcome of applying a single transaction batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchStats {
    pub byte_size: usize,
}

/// The outcome of applying a whole flush.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushStats {
    pub rows: usize,
    pub byte_size: usize,
}

/// Applies a batch of mutations atomically.
#[async_trait]
pub trait BatchHandler: Debug + Send + Sync + 'static {
    async fn handle_batch(&self, batch: &[KeyValue]) -> Result<BatchStats>;
}

/// A [`BatchHandler`] that applies each batch in its own transaction, excluded from change feeds
/// on the local keyspace.
#[derive(Debug)]
pub struct TxnBatch {
    store: Arc<dyn KvStore>,
    processor: Arc<dyn RowProcessor>,
}

impl TxnBatch {
    pub fn new(store: Arc<dyn KvStore>, processor: Arc<dyn RowProcessor>) -> Self {
        Self { store, processor }
    }
}

#[async_trait]
impl BatchHandler for TxnBatch {
    async fn handle_batch(&self, batch: &[KeyValue]) -> Result<BatchStats> {
        let mut txn = self.store.begin().await?;
        txn.set_omit_in_rangefeeds();
        let mut stats = BatchStats::default();
        for kv in batch {
            if let Err(e) = self.processor.process_row(txn.as_mut(), kv).await {
                txn.rollback().await;
                return Err(e.into());
            }
            stats.byte_size += kv.size();
        }
        txn.commit().await?;
        Ok(stats)
    }
}

/// Sort mutations by split-safe key, then source timestamp.
pub fn sort_for_apply(kvs: &mut [KeyValue]) {
    kvs.sort_by_cached_key(|kv| (kv.key.split_safe_or_raw(), kv.timestamp()));
}

/// Cut `split_keys` (sorted) into at most `workers` contiguous ranges of roughly
/// `len / workers + 1` elements, extending each range past any run of equal keys.
///
/// # Panics
///
/// If the ranges do not cover every key.
pub fn plan_chunks(split_keys: &[Key], workers: usize) -> Vec<Range<usize>> {
    let workers = workers.max(1);
    let len = split_keys.len();
    let chunk_size = len / workers + 1;

    let mut chunks = Vec::with_capacity(workers);
    let mut start = 0;
    while start < len && chunks.len() < workers {
        let mut end = (start + chunk_size).min(len);
        while end < len && split_keys[end - 1] == split_keys[end] {
            end += 1;
        }
        chunks.push(start..end);
        start = end;
    }
    assert_eq!(
        start, len,
        "batch chunks covered {start} of {len} mutations across {workers} workers"
    );
    chunks
}

/// Applies flushed buffers through a fixed set of [`BatchHandler`]s, one per worker.
#[derive(Debug)]
pub struct BatchApplier {
    handlers: Vec<Arc<dyn BatchHandler>>,
    metrics: Arc<WriterMetrics>,
    status: Arc<ConsumerStatus>,
}

impl BatchApplier {
    /// # Panics
    ///
    /// If `handlers` is empty.
    pub fn new(
        handlers: Vec<Arc<dyn BatchHandler>>,
        metrics: Arc<WriterMetrics>,
        status: Arc<ConsumerStatus>,
    ) -> Self {
        assert!(!handlers.is_empty(), "batch applier needs at least one handler");
        Self {
            handlers,
            metrics,
            status,
        }
    }

    pub fn workers(&self) -> usize {
        self.handlers.len()
    }

    /// Apply every mutation in `buffer`, `batch_size` mutations per transaction. The buffer is
    /// left empty on success. The first failing batch aborts the remaining workers.
    pub async fn apply(
        &self,
        buffer: &mut IngestionBuffer,
        batch_size: usize,
    ) -> Result<FlushStats> {
        if buffer.is_empty() {
            return Ok(FlushStats::default());
        }
        let batch_size = batch_size.max(1);

        sort_for_apply(buffer.kvs_mut());
        let kvs = Arc::new(buffer.take_kvs());
        let split_keys: Vec<Key> = kvs.iter().map(|kv| kv.key.split_safe_or_raw()).collect();
        let chunks = plan_chunks(&split_keys, self.workers());
        debug!(
            rows = kvs.len(),
            chunks = chunks.len(),
            batch_size,
            "applying flush"
        );

        let mut workers = JoinSet::new();
        for (range, handler) in chunks.into_iter().zip(&self.handlers) {
            let kvs = Arc::clone(&kvs);
            let handler = Arc::clone(handler);
            let metrics = Arc::clone(&self.metrics);
            let status = Arc::clone(&self.status);
            workers.spawn(async move {
                let mut byte_size = 0;
                for batch in kvs[range].chunks(batch_size) {
                    let start = Instant::now();
                    let stats = handler.handle_batch(batch).await?;
                    let elapsed = start.elapsed();
                    metrics.batch_duration.observe(elapsed.as_secs_f64());
                    metrics.batch_bytes.observe(stats.byte_size as f64);
                    status.record_batch_applied(elapsed, batch.len());
                    byte_size += stats.byte_size;
                }
                Ok::<_, Error>(byte_size)
            });
        }

        let mut byte_size = 0;
        while let Some(res) = workers.join_next().await {
            match res {
                Ok(Ok(n)) => byte_size += n,
                Ok(Err(e)) => {
                    workers.shutdown().await;
                    return Err(e);
                }
                Err(e) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
                Err(_) => return Err(Error::WorkerCancelled),
            }
        }

        let rows = kvs.len();
        if let Ok(kvs) = Arc::try_unwrap(kvs) {
            buffer.recycle_storage(kvs);
        }
        Ok(FlushStats { rows, byte_size })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{InMemoryKvStore, LastWriteWinsProcessor};
    use crate::store::StoreError;
    use bytes::Bytes;
    use logrep_types::{Timestamp, encode_family_key};
    use parking_lot::Mutex;
    use proptest::prelude::*;
    use prometheus::Registry;

    /// Records every batch it is handed.
    #[derive(Debug, Default)]
    struct RecordingHandler {
        batches: Mutex<Vec<Vec<KeyValue>>>,
        fail_on: Option<Key>,
    }

    #[async_trait]
    impl BatchHandler for RecordingHandler {
        async fn handle_batch(&self, batch: &[KeyValue]) -> Result<BatchStats> {
            if let Some(key) = &self.fail_on {
                if batch.iter().any(|kv| &kv.key == key) {
                    return Err(StoreError::CommitFailed("injected".to_string()).into());
                }
            }
            self.batches.lock().push(batch.to_vec());
            Ok(BatchStats {
                byte_size: batch.iter().map(KeyValue::size).sum(),
            })
        }
    }

    fn applier(handlers: Vec<Arc<dyn BatchHandler>>) -> BatchApplier {
        let metrics = Arc::new(WriterMetrics::new(&Registry::new()).unwrap());
        BatchApplier::new(handlers, metrics, Arc::new(ConsumerStatus::new(1, 0)))
    }

    fn row_kv(row: u8, family: u64, wall: i64) -> KeyValue {
        KeyValue::new(
            encode_family_key(&[b'r', row], family),
            Bytes::from(format!("{row}/{family}@{wall}")),
            Timestamp::from_wall(wall),
        )
    }

    #[test]
    fn chunks_extend_over_equal_keys() {
        let keys: Vec<Key> = ["a", "a", "a", "b", "c", "c", "c", "c", "d"]
            .into_iter()
            .map(Key::from)
            .collect();
        // 9 / 4 + 1 = 3 per chunk
        assert_eq!(plan_chunks(&keys, 4), vec![0..3, 3..8, 8..9]);
        assert_eq!(plan_chunks(&keys, 1), vec![0..9]);
        assert!(plan_chunks(&[], 4).is_empty());
    }

    #[test]
    fn sort_groups_rows_across_families() {
        let mut kvs = vec![
            row_kv(2, 0, 5),
            row_kv(1, 1, 9),
            row_kv(1, 0, 7),
            row_kv(2, 0, 1),
        ];
        sort_for_apply(&mut kvs);
        let order: Vec<_> = kvs.iter().map(|kv| kv.value.raw_bytes.clone()).collect();
        assert_eq!(order, vec!["1/0@7", "1/1@9", "2/0@1", "2/0@5"]);
    }

    #[tokio::test]
    async fn txn_batch_commits_excluded_from_rangefeeds() {
        let store = Arc::new(InMemoryKvStore::new());
        let batch = TxnBatch::new(
            Arc::clone(&store) as _,
            Arc::new(LastWriteWinsProcessor),
        );
        let kvs = vec![row_kv(1, 0, 1), row_kv(2, 0, 1)];
        let stats = batch.handle_batch(&kvs).await.unwrap();
        assert_eq!(stats.byte_size, kvs.iter().map(KeyValue::size).sum::<usize>());
        assert_eq!(store.len(), 2);
        assert_eq!(store.commits(), 1);
        assert_eq!(store.omitted_commits(), 1);

        store.fail_next_commit("conflict");
        let err = batch.handle_batch(&[row_kv(3, 0, 1)]).await.unwrap_err();
        assert!(matches!(err, Error::Store(StoreError::CommitFailed(_))));
        assert_eq!(store.len(), 2);
    }

    #[test_log::test(tokio::test)]
    async fn apply_keeps_rows_on_one_worker_in_order() {
        let handlers: Vec<Arc<RecordingHandler>> =
            (0..4).map(|_| Arc::new(RecordingHandler::default())).collect();
        let applier = applier(
            handlers
                .iter()
                .map(|h| Arc::clone(h) as Arc<dyn BatchHandler>)
                .collect(),
        );

        let mut buffer = IngestionBuffer::new();
        for wall in (0..10).rev() {
            for row in 0..5 {
                buffer.add_kv(row_kv(row, u64::from(row % 2), wall));
            }
        }
        let expected_bytes = buffer.byte_size();

        let stats = applier.apply(&mut buffer, 3).await.unwrap();
        assert_eq!(stats.rows, 50);
        assert_eq!(stats.byte_size, expected_bytes);
        assert!(buffer.is_empty());
        assert_eq!(buffer.byte_size(), 0);

        let mut seen = 0;
        let mut owner = std::collections::HashMap::new();
        for (worker, handler) in handlers.iter().enumerate() {
            let applied: Vec<KeyValue> = handler.batches.lock().concat();
            for batch in handler.batches.lock().iter() {
                assert!(batch.len() <= 3);
            }
            for pair in applied.windows(2) {
                if pair[0].key == pair[1].key {
                    assert!(pair[0].timestamp() <= pair[1].timestamp());
                }
            }
            for kv in &applied {
                let prev = owner.insert(kv.key.split_safe_or_raw(), worker);
                assert!(prev.is_none_or(|w| w == worker));
            }
            seen += applied.len();
        }
        assert_eq!(seen, 50);
    }

    #[tokio::test]
    async fn first_error_fails_the_flush() {
        let failing = Arc::new(RecordingHandler {
            fail_on: Some(row_kv(0, 0, 0).key),
            ..Default::default()
        });
        let applier = applier(vec![
            failing as Arc<dyn BatchHandler>,
            Arc::new(RecordingHandler::default()),
        ]);
        let mut buffer = IngestionBuffer::new();
        for row in 0..6 {
            buffer.add_kv(row_kv(row, 0, 0));
        }
        let err = applier.apply(&mut buffer, 2).await.unwrap_err();
        assert!(matches!(err, Error::Store(_)));
    }

    #[tokio::test]
    async fn empty_buffer_is_a_no_op() {
        let handler = Arc::new(RecordingHandler::default());
        let applier = applier(vec![Arc::clone(&handler) as Arc<dyn BatchHandler>]);
        let stats = applier.apply(&mut IngestionBuffer::new(), 8).await.unwrap();
        assert_eq!(stats, FlushStats::default());
        assert!(handler.batches.lock().is_empty());
    }

    proptest! {
        #[test]
        fn chunking_keeps_equal_keys_together(
            mut keys in proptest::collection::vec(0u8..8, 0..200),
            workers in 1usize..40,
        ) {
            keys.sort_unstable();
            let keys: Vec<Key> = keys.into_iter().map(|k| Key::from(vec![k])).collect();
            let chunks = plan_chunks(&keys, workers);
            prop_assert!(chunks.len() <= workers);

            let mut next = 0;
            for chunk in &chunks {
                prop_assert_eq!(chunk.start, next);
                prop_assert!(chunk.start < chunk.end);
                next = chunk.end;
            }
            prop_assert_eq!(next, keys.len());

            for pair in chunks.windows(2) {
                let boundary = pair[1].start;
                prop_assert_ne!(&keys[boundary - 1], &keys[boundary]);
            }
        }
    }
}
