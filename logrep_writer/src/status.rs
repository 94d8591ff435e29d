//! Live status of running consumers, for debugging tools.

use std::sync::Arc;
use std::time::{Duration, SystemTime};

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;

/// Mutable status of a single consumer.
#[derive(Debug)]
pub struct ConsumerStatus {
    stream_id: u64,
    processor_id: i32,
    inner: Mutex<StatusInner>,
}

#[derive(Debug, Default, Clone, Copy)]
struct StatusInner {
    last_recv: Option<SystemTime>,
    flushing_since: Option<SystemTime>,
    current_flush_rows: usize,
    current_flush_bytes: usize,
    current_flush_rows_applied: usize,
    batches_applied: u64,
    last_batch_rows: usize,
    last_batch_duration: Option<Duration>,
    last_flush_rows: usize,
    last_flush_bytes: usize,
    last_flush_duration: Option<Duration>,
    flushes: u64,
}

/// A point in time copy of a [`ConsumerStatus`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ConsumerStatusSnapshot {
    pub stream_id: u64,
    pub processor_id: i32,
    pub last_recv: Option<SystemTime>,
    /// Set while a flush is being applied.
    pub flushing_since: Option<SystemTime>,
    pub current_flush_rows: usize,
    pub current_flush_bytes: usize,
    /// Rows of the current flush committed so far.
    pub current_flush_rows_applied: usize,
    pub batches_applied: u64,
    pub last_batch_rows: usize,
    pub last_batch_duration: Option<Duration>,
    pub last_flush_rows: usize,
    pub last_flush_bytes: usize,
    pub last_flush_duration: Option<Duration>,
    pub flushes: u64,
}

impl ConsumerStatus {
    pub fn new(stream_id: u64, processor_id: i32) -> Self {
        Self {
            stream_id,
            processor_id,
            inner: Default::default(),
        }
    }

    pub fn record_recv(&self) {
        self.inner.lock().last_recv = Some(SystemTime::now());
    }

    pub fn record_flush_start(&self, rows: usize, bytes: usize) {
        let mut inner = self.inner.lock();
        inner.flushing_since = Some(SystemTime::now());
        inner.current_flush_rows = rows;
        inner.current_flush_bytes = bytes;
        inner.current_flush_rows_applied = 0;
    }

    /// Record a committed transaction batch of `rows` rows that took `duration` to apply.
    pub fn record_batch_applied(&self, duration: Duration, rows: usize) {
        let mut inner = self.inner.lock();
        inner.batches_applied += 1;
        inner.current_flush_rows_applied += rows;
        inner.last_batch_rows = rows;
        inner.last_batch_duration = Some(duration);
    }

    pub fn record_flush_complete(&self, rows: usize, bytes: usize, duration: Duration) {
        let mut inner = self.inner.lock();
        inner.flushing_since = None;
        inner.current_flush_rows = 0;
        inner.current_flush_bytes = 0;
        inner.current_flush_rows_applied = 0;
        inner.last_flush_rows = rows;
        inner.last_flush_bytes = bytes;
        inner.last_flush_duration = Some(duration);
        inner.flushes += 1;
    }

    pub fn snapshot(&self) -> ConsumerStatusSnapshot {
        let inner = *self.inner.lock();
        ConsumerStatusSnapshot {
            stream_id: self.stream_id,
            processor_id: self.processor_id,
            last_recv: inner.last_recv,
            flushing_since: inner.flushing_since,
            current_flush_rows: inner.current_flush_rows,
            current_flush_bytes: inner.current_flush_bytes,
            current_flush_rows_applied: inner.current_flush_rows_applied,
            batches_applied: inner.batches_applied,
            last_batch_rows: inner.last_batch_rows,
            last_batch_duration: inner.last_batch_duration,
            last_flush_rows: inner.last_flush_rows,
            last_flush_bytes: inner.last_flush_bytes,
            last_flush_duration: inner.last_flush_duration,
            flushes: inner.flushes,
        }
    }
}

/// The statuses of every consumer currently running, keyed by stream and processor id.
#[derive(Debug, Default)]
pub struct StatusRegistry {
    statuses: DashMap<(u64, i32), Arc<ConsumerStatus>>,
}

impl StatusRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a new status, replacing any left behind by an earlier consumer with the same ids.
    pub fn register(&self, stream_id: u64, processor_id: i32) -> Arc<ConsumerStatus> {
        let status = Arc::new(ConsumerStatus::new(stream_id, processor_id));
        self.statuses
            .insert((stream_id, processor_id), Arc::clone(&status));
        status
    }

    pub fn unregister(&self, stream_id: u64, processor_id: i32) {
        self.statuses.remove(&(stream_id, processor_id));
    }

    /// Snapshots of every registered consumer, ordered by stream and processor id.
    pub fn snapshot_all(&self) -> Vec<ConsumerStatusSnapshot> {
        let mut snapshots: Vec<_> = self.statuses.iter().map(|s| s.value().snapshot()).collect();
        snapshots.sort_by_key(|s| (s.stream_id, s.processor_id));
        snapshots
    }
}
