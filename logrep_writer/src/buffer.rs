//! Buffering of incoming mutations between flushes.

use logrep_types::{KeyValue, Timestamp};
use parking_lot::Mutex;
use tracing::debug;

/// Number of released buffers kept around for reuse.
const DEFAULT_POOL_CAPACITY: usize = 4;

/// The outcome of checking a buffer against the configured size thresholds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SizeCheck {
    /// Below both thresholds.
    Below,
    /// The target length was reached, a flush should happen if one is not already running.
    ShouldFlush,
    /// The byte size limit was reached, a flush must happen.
    MustFlush,
}

/// Mutations accumulated since the last flush.
///
/// The byte size and minimum timestamp always describe exactly the mutations held.
#[derive(Debug)]
pub struct IngestionBuffer {
    kvs: Vec<KeyValue>,
    byte_size: usize,
    /// Minimum source timestamp in the buffer, used for commit latency.
    min_timestamp: Timestamp,
}

impl Default for IngestionBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl IngestionBuffer {
    pub fn new() -> Self {
        Self {
            kvs: Vec::new(),
            byte_size: 0,
            min_timestamp: Timestamp::MAX,
        }
    }

    pub fn add_kv(&mut self, kv: KeyValue) {
        self.byte_size += kv.size();
        if kv.timestamp() < self.min_timestamp {
            self.min_timestamp = kv.timestamp();
        }
        self.kvs.push(kv);
    }

    pub fn len(&self) -> usize {
        self.kvs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.kvs.is_empty()
    }

    pub fn byte_size(&self) -> usize {
        self.byte_size
    }

    /// Minimum timestamp of the buffered mutations, [`Timestamp::MAX`] when empty.
    pub fn min_timestamp(&self) -> Timestamp {
        self.min_timestamp
    }

    pub fn kvs(&self) -> &[KeyValue] {
        &self.kvs
    }

    /// Reordering the mutations leaves the accounting untouched, so a mutable slice is safe to
    /// hand out.
    pub(crate) fn kvs_mut(&mut self) -> &mut [KeyValue] {
        &mut self.kvs
    }

    /// Move the mutations out, leaving the buffer empty.
    pub(crate) fn take_kvs(&mut self) -> Vec<KeyValue> {
        let kvs = std::mem::take(&mut self.kvs);
        self.reset();
        kvs
    }

    /// Hand back storage previously obtained from [`Self::take_kvs`] so its allocation can be
    /// reused. Anything still in it is discarded.
    pub(crate) fn recycle_storage(&mut self, mut kvs: Vec<KeyValue>) {
        if self.kvs.is_empty() && kvs.capacity() > self.kvs.capacity() {
            kvs.clear();
            self.kvs = kvs;
        }
    }

    pub fn reset(&mut self) {
        self.kvs.clear();
        self.byte_size = 0;
        self.min_timestamp = Timestamp::MAX;
    }

    /// Check the buffer against the target length and the maximum byte size. A zero
    /// `max_size` disables the byte size limit.
    pub fn should_flush_on_kv_size(&self, target_len: usize, max_size: u64) -> SizeCheck {
        if max_size > 0 && self.byte_size as u64 >= max_size {
            debug!(
                byte_size = self.byte_size,
                max_size, "flushing because current KV batch reached the size limit"
            );
            SizeCheck::MustFlush
        } else if self.kvs.len() >= target_len {
            SizeCheck::ShouldFlush
        } else {
            SizeCheck::Below
        }
    }
}

/// A free list of [`IngestionBuffer`]s, so the allocation behind a flushed buffer is reused for
/// a later one.
#[derive(Debug)]
pub struct BufferPool {
    free: Mutex<Vec<IngestionBuffer>>,
    capacity: usize,
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new(DEFAULT_POOL_CAPACITY)
    }
}

impl BufferPool {
    pub fn new(capacity: usize) -> Self {
        Self {
            free: Mutex::new(Vec::with_capacity(capacity)),
            capacity,
        }
    }

    /// An empty buffer, recycled if one is available.
    pub fn get(&self) -> IngestionBuffer {
        self.free.lock().pop().unwrap_or_default()
    }

    /// Reset `buffer` and keep it for reuse, or drop it if the pool is full.
    pub fn release(&self, mut buffer: IngestionBuffer) {
        buffer.reset();
        let mut free = self.free.lock();
        if free.len() < self.capacity {
            free.push(buffer);
        }
    }

    /// Number of buffers waiting for reuse.
    pub fn available(&self) -> usize {
        self.free.lock().len()
    }

    /// Drop every pooled buffer.
    pub fn clear(&self) {
        self.free.lock().clear();
    }
}
