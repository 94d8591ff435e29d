//! The flush loop: applies retired buffers one at a time and forwards their checkpoints.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use logrep_types::{ResolvedSpans, Timestamp};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::Result;
use crate::batch::BatchApplier;
use crate::buffer::BufferPool;
use crate::coordinator::Flushable;
use crate::metrics::WriterMetrics;
use crate::settings::SharedSettings;
use crate::status::ConsumerStatus;

#[derive(Debug)]
pub(crate) struct FlushLoop {
    flush_rx: mpsc::Receiver<Flushable>,
    checkpoint_tx: mpsc::Sender<ResolvedSpans>,
    applier: BatchApplier,
    pool: Arc<BufferPool>,
    settings: SharedSettings,
    flush_in_progress: Arc<AtomicBool>,
    stop: CancellationToken,
    metrics: Arc<WriterMetrics>,
    status: Arc<ConsumerStatus>,
}

impl FlushLoop {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        flush_rx: mpsc::Receiver<Flushable>,
        checkpoint_tx: mpsc::Sender<ResolvedSpans>,
        applier: BatchApplier,
        pool: Arc<BufferPool>,
        settings: SharedSettings,
        flush_in_progress: Arc<AtomicBool>,
        stop: CancellationToken,
        metrics: Arc<WriterMetrics>,
        status: Arc<ConsumerStatus>,
    ) -> Self {
        Self {
            flush_rx,
            checkpoint_tx,
            applier,
            pool,
            settings,
            flush_in_progress,
            stop,
            metrics,
            status,
        }
    }

    /// Apply handed off buffers until the consumer loop goes away or shutdown begins. A failed
    /// flush ends the loop without emitting its checkpoint.
    pub(crate) async fn run(&mut self) -> Result<()> {
        while let Some(unit) = self.flush_rx.recv().await {
            let checkpoint = self.flush_buffer(unit).await?;
            tokio::select! {
                biased;
                _ = self.stop.cancelled() => return Ok(()),
                res = self.checkpoint_tx.send(checkpoint) => {
                    if res.is_err() {
                        debug!("checkpoint receiver dropped, stopping flush loop");
                        return Ok(());
                    }
                }
            }
            self.flush_in_progress.store(false, Ordering::Relaxed);
        }
        Ok(())
    }

    async fn flush_buffer(&self, unit: Flushable) -> Result<ResolvedSpans> {
        let Flushable {
            mut buffer,
            checkpoint,
        } = unit;
        if buffer.is_empty() {
            self.pool.release(buffer);
            return Ok(checkpoint);
        }

        let rows = buffer.len();
        let min_timestamp = buffer.min_timestamp();
        self.status.record_flush_start(rows, buffer.byte_size());
        let start = Instant::now();

        let stats = self
            .applier
            .apply(&mut buffer, self.settings.get().batch_size)
            .await?;

        let elapsed = start.elapsed();
        self.status
            .record_flush_complete(stats.rows, stats.byte_size, elapsed);
        self.metrics.flushes.inc();
        self.metrics.flush_duration.observe(elapsed.as_secs_f64());
        self.metrics.flush_row_count.observe(stats.rows as f64);
        self.metrics.flush_bytes.observe(stats.byte_size as f64);
        self.metrics.ingested_events.inc_by(stats.rows as u64);
        self.metrics
            .ingested_logical_bytes
            .inc_by(stats.byte_size as u64);
        self.metrics.commit_latency.observe(
            min_timestamp
                .elapsed_at(Timestamp::now())
                .as_secs_f64(),
        );
        debug!(
            rows,
            bytes = stats.byte_size,
            elapsed_ms = elapsed.as_millis(),
            spans = checkpoint.len(),
            "flush applied"
        );

        self.pool.release(buffer);
        Ok(checkpoint)
    }
}
