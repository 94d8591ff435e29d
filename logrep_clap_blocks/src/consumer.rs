//! Config for the logical replication consumer.

use std::num::NonZeroUsize;

use logrep_writer::ConsumerSettings;

use crate::byte_size::ByteSize;

/// CLI config for the logical replication consumer.
#[derive(Debug, Clone, clap::Parser)]
#[allow(missing_copy_implementations)]
pub struct ConsumerConfig {
    /// The minimum time between flushes triggered by the flush timer. Flushes still happen more
    /// often when the buffer fills up.
    #[clap(
        long = "consumer-minimum-flush-interval",
        env = "LOGREP_CONSUMER_MINIMUM_FLUSH_INTERVAL",
        default_value = "5s",
        action
    )]
    pub minimum_flush_interval: humantime::Duration,

    /// The number of buffered mutations at which a flush is requested.
    #[clap(
        long = "consumer-kv-buffer-target-length",
        env = "LOGREP_CONSUMER_KV_BUFFER_TARGET_LENGTH",
        default_value = "32",
        action
    )]
    pub kv_buffer_target_length: usize,

    /// The buffered byte size at which a flush is forced, e.g. `128MiB`. Zero disables the limit.
    #[clap(
        long = "consumer-kv-buffer-size",
        env = "LOGREP_CONSUMER_KV_BUFFER_SIZE",
        default_value = "128MiB",
        action
    )]
    pub kv_buffer_size: ByteSize,

    /// The number of mutations applied in a single transaction.
    #[clap(
        long = "consumer-batch-size",
        env = "LOGREP_CONSUMER_BATCH_SIZE",
        default_value = "32",
        action
    )]
    pub batch_size: usize,

    /// Granularity resolved timestamps are rounded down to before they are recorded. Zero
    /// disables rounding.
    #[clap(
        long = "consumer-timestamp-granularity",
        env = "LOGREP_CONSUMER_TIMESTAMP_GRANULARITY",
        default_value = "5s",
        action
    )]
    pub timestamp_granularity: humantime::Duration,

    /// Number of concurrent workers applying a flush.
    #[clap(
        long = "consumer-max-writer-workers",
        env = "LOGREP_CONSUMER_MAX_WRITER_WORKERS",
        default_value = "32",
        action
    )]
    pub max_writer_workers: NonZeroUsize,
}

impl ConsumerConfig {
    /// The dynamically adjustable part of this config.
    pub fn settings(&self) -> ConsumerSettings {
        ConsumerSettings {
            minimum_flush_interval: *self.minimum_flush_interval,
            kv_buffer_target_length: self.kv_buffer_target_length,
            kv_buffer_size: self.kv_buffer_size.bytes(),
            batch_size: self.batch_size,
            timestamp_granularity: *self.timestamp_granularity,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::time::Duration;

    use clap::Parser;

    #[test]
    fn test_defaults_match_settings() {
        let config = ConsumerConfig::try_parse_from(["my_binary"]).unwrap();
        assert_eq!(config.settings(), ConsumerSettings::default());
        assert_eq!(
            config.max_writer_workers.get(),
            logrep_writer::MAX_WRITER_WORKERS
        );
    }

    #[test]
    fn test_overrides() {
        let config = ConsumerConfig::try_parse_from([
            "my_binary",
            "--consumer-minimum-flush-interval",
            "250ms",
            "--consumer-kv-buffer-size",
            "64KB",
            "--consumer-timestamp-granularity",
            "0s",
            "--consumer-max-writer-workers",
            "4",
        ])
        .unwrap();
        let settings = config.settings();
        assert_eq!(settings.minimum_flush_interval, Duration::from_millis(250));
        assert_eq!(settings.kv_buffer_size, 64_000);
        assert_eq!(settings.timestamp_granularity, Duration::ZERO);
        assert_eq!(config.max_writer_workers.get(), 4);
    }

    #[test]
    fn test_invalid_values() {
        assert!(
            ConsumerConfig::try_parse_from(["my_binary", "--consumer-max-writer-workers", "0"])
                .is_err()
        );
        assert!(
            ConsumerConfig::try_parse_from(["my_binary", "--consumer-kv-buffer-size", "lots"])
                .is_err()
        );
    }
}
