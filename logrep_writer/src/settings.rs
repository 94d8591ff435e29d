//! Dynamically adjustable consumer settings.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;

/// Default number of concurrent batch workers used to apply a flush.
pub const MAX_WRITER_WORKERS: usize = 32;

/// Tunables read by the consumer and flush loops.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConsumerSettings {
    /// The minimum time between flushes triggered by the flush timer. Flushes may still occur
    /// more often if the buffer fills up.
    pub minimum_flush_interval: Duration,
    /// The number of buffered mutations at which a flush is requested.
    pub kv_buffer_target_length: usize,
    /// The buffered byte size at which a flush is forced. Zero disables the limit.
    pub kv_buffer_size: u64,
    /// The number of mutations applied in a single transaction.
    pub batch_size: usize,
    /// Granularity that resolved timestamps are rounded down to before entering the frontier.
    /// Zero disables quantization.
    pub timestamp_granularity: Duration,
}

impl Default for ConsumerSettings {
    fn default() -> Self {
        Self {
            minimum_flush_interval: Duration::from_secs(5),
            kv_buffer_target_length: 32,
            kv_buffer_size: 128 << 20,
            batch_size: 32,
            timestamp_granularity: Duration::from_secs(5),
        }
    }
}

/// A handle to [`ConsumerSettings`] that can be updated while the consumer runs. Every read
/// observes the latest update.
#[derive(Debug, Clone, Default)]
pub struct SharedSettings(Arc<RwLock<ConsumerSettings>>);

impl SharedSettings {
    pub fn new(settings: ConsumerSettings) -> Self {
        Self(Arc::new(RwLock::new(settings)))
    }

    pub fn get(&self) -> ConsumerSettings {
        *self.0.read()
    }

    pub fn update(&self, f: impl FnOnce(&mut ConsumerSettings)) {
        f(&mut self.0.write());
    }
}
