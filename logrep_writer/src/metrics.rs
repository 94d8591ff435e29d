use prometheus::{
    Histogram, HistogramOpts, IntCounter, IntCounterVec, Opts, Registry, exponential_buckets,
};

use crate::coordinator::FlushReason;

pub(crate) const FLUSHES_BY_REASON_METRIC_NAME: &str = "logical_replication_flushes_requested_total";
pub(crate) const FLUSHES_METRIC_NAME: &str = "logical_replication_flushes_total";
pub(crate) const CHECKPOINT_EVENTS_METRIC_NAME: &str = "logical_replication_checkpoint_events_total";
pub(crate) const INGESTED_EVENTS_METRIC_NAME: &str = "logical_replication_events_ingested_total";
pub(crate) const INGESTED_BYTES_METRIC_NAME: &str = "logical_replication_logical_bytes_total";

/// Metrics shared by every writer in the process.
#[derive(Debug, Clone)]
pub struct WriterMetrics {
    pub(crate) flushes_by_reason: IntCounterVec,
    pub(crate) flushes: IntCounter,
    pub(crate) checkpoint_events: IntCounter,
    pub(crate) ingested_events: IntCounter,
    pub(crate) ingested_logical_bytes: IntCounter,
    pub(crate) admit_latency: Histogram,
    pub(crate) commit_latency: Histogram,
    /// Time a retired buffer waits to be queued for the flush loop. The handoff channel holds one
    /// buffer, so this stays near zero unless a second buffer is retired while one is queued.
    pub(crate) flush_wait: Histogram,
    pub(crate) flush_duration: Histogram,
    pub(crate) flush_row_count: Histogram,
    pub(crate) flush_bytes: Histogram,
    pub(crate) batch_duration: Histogram,
    pub(crate) batch_bytes: Histogram,
}

impl WriterMetrics {
    pub fn new(registry: &Registry) -> Result<Self, prometheus::Error> {
        let flushes_by_reason = IntCounterVec::new(
            Opts::new(
                FLUSHES_BY_REASON_METRIC_NAME,
                "flushes requested, by the trigger that requested them",
            ),
            &["reason"],
        )?;
        let metrics = Self {
            flushes_by_reason,
            flushes: IntCounter::new(FLUSHES_METRIC_NAME, "flushes applied to the local store")?,
            checkpoint_events: IntCounter::new(
                CHECKPOINT_EVENTS_METRIC_NAME,
                "checkpoint notices received from the source",
            )?,
            ingested_events: IntCounter::new(
                INGESTED_EVENTS_METRIC_NAME,
                "mutations applied to the local store",
            )?,
            ingested_logical_bytes: IntCounter::new(
                INGESTED_BYTES_METRIC_NAME,
                "logical bytes of mutations applied to the local store",
            )?,
            admit_latency: latency(
                "logical_replication_admit_latency_seconds",
                "time between a mutation's source timestamp and its receipt",
            )?,
            commit_latency: latency(
                "logical_replication_commit_latency_seconds",
                "time between the oldest source timestamp of a flush and its completion",
            )?,
            flush_wait: latency(
                "logical_replication_flush_wait_seconds",
                "time spent waiting to queue a buffer for the flush loop",
            )?,
            flush_duration: latency(
                "logical_replication_flush_duration_seconds",
                "time spent applying a flush",
            )?,
            flush_row_count: sized("logical_replication_flush_row_count", "rows per flush")?,
            flush_bytes: sized("logical_replication_flush_bytes", "bytes per flush")?,
            batch_duration: latency(
                "logical_replication_batch_duration_seconds",
                "time spent applying a single transaction batch",
            )?,
            batch_bytes: sized("logical_replication_batch_bytes", "bytes per transaction batch")?,
        };

        registry.register(Box::new(metrics.flushes_by_reason.clone()))?;
        registry.register(Box::new(metrics.flushes.clone()))?;
        registry.register(Box::new(metrics.checkpoint_events.clone()))?;
        registry.register(Box::new(metrics.ingested_events.clone()))?;
        registry.register(Box::new(metrics.ingested_logical_bytes.clone()))?;
        for h in [
            &metrics.admit_latency,
            &metrics.commit_latency,
            &metrics.flush_wait,
            &metrics.flush_duration,
            &metrics.flush_row_count,
            &metrics.flush_bytes,
            &metrics.batch_duration,
            &metrics.batch_bytes,
        ] {
            registry.register(Box::new(h.clone()))?;
        }
        Ok(metrics)
    }

    pub(crate) fn record_flush_requested(&self, reason: FlushReason) {
        self.flushes_by_reason
            .with_label_values(&[reason.as_str()])
            .inc();
    }

    #[cfg(test)]
    pub(crate) fn flushes_requested(&self, reason: FlushReason) -> u64 {
        self.flushes_by_reason
            .with_label_values(&[reason.as_str()])
            .get()
    }
}

fn latency(name: &str, help: &str) -> Result<Histogram, prometheus::Error> {
    Histogram::with_opts(
        HistogramOpts::new(name, help).buckets(exponential_buckets(0.001, 2.0, 18)?),
    )
}

fn sized(name: &str, help: &str) -> Result<Histogram, prometheus::Error> {
    Histogram::with_opts(HistogramOpts::new(name, help).buckets(exponential_buckets(1.0, 4.0, 16)?))
}
