//! Retires the current buffer and hands it to the flush loop.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use logrep_frontier::SpanFrontier;
use logrep_types::{ResolvedSpans, Timestamp};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::buffer::{BufferPool, IngestionBuffer};
use crate::metrics::WriterMetrics;
use crate::{Error, Result};

/// What triggered a flush.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FlushReason {
    /// The buffer reached its target length or byte size limit.
    Size,
    /// The minimum flush interval elapsed.
    Time,
    /// The event stream ended.
    Close,
}

impl FlushReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Size => "size",
            Self::Time => "time",
            Self::Close => "close",
        }
    }
}

impl fmt::Display for FlushReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A retired buffer along with the checkpoint taken when it was retired. The checkpoint may only
/// be emitted once the buffer has been applied.
#[derive(Debug)]
pub struct Flushable {
    pub buffer: IngestionBuffer,
    pub checkpoint: ResolvedSpans,
}

/// Owns the buffer being filled and the frontier, on behalf of the event consumer loop.
#[derive(Debug)]
pub(crate) struct FlushCoordinator {
    buffer: IngestionBuffer,
    frontier: SpanFrontier,
    pool: Arc<BufferPool>,
    flush_tx: mpsc::Sender<Flushable>,
    stop: CancellationToken,
    /// Set once a buffer is handed off, cleared by the flush loop once its checkpoint has been
    /// delivered.
    flush_in_progress: Arc<AtomicBool>,
    last_flush_frontier: Timestamp,
    last_flush_time: Instant,
    metrics: Arc<WriterMetrics>,
}

impl FlushCoordinator {
    pub(crate) fn new(
        frontier: SpanFrontier,
        pool: Arc<BufferPool>,
        flush_tx: mpsc::Sender<Flushable>,
        stop: CancellationToken,
        flush_in_progress: Arc<AtomicBool>,
        metrics: Arc<WriterMetrics>,
    ) -> Self {
        Self {
            buffer: pool.get(),
            last_flush_frontier: frontier.frontier(),
            frontier,
            pool,
            flush_tx,
            stop,
            flush_in_progress,
            last_flush_time: Instant::now(),
            metrics,
        }
    }

    pub(crate) fn buffer(&self) -> &IngestionBuffer {
        &self.buffer
    }

    pub(crate) fn buffer_mut(&mut self) -> &mut IngestionBuffer {
        &mut self.buffer
    }

    pub(crate) fn frontier(&self) -> &SpanFrontier {
        &self.frontier
    }

    pub(crate) fn frontier_mut(&mut self) -> &mut SpanFrontier {
        &mut self.frontier
    }

    pub(crate) fn since_last_flush(&self) -> Duration {
        self.last_flush_time.elapsed()
    }

    /// Flush unless a flush is already in flight, or there is nothing to flush: no buffered
    /// mutations and no frontier progress since the last flush.
    pub(crate) async fn maybe_flush(&mut self, reason: FlushReason) -> Result<()> {
        if self.flush_in_progress.load(Ordering::Relaxed) {
            debug!(%reason, "flush already in progress, skipping");
            return Ok(());
        }
        if self.buffer.is_empty() && self.frontier.frontier() <= self.last_flush_frontier {
            debug!(%reason, "nothing to flush, skipping");
            return Ok(());
        }
        self.flush(reason).await
    }

    /// Retire the current buffer with a checkpoint of the frontier and wait for the flush loop to
    /// take it. The flush is dropped if shutdown begins first, and fails if the flush loop is gone.
    pub(crate) async fn flush(&mut self, reason: FlushReason) -> Result<()> {
        self.metrics.record_flush_requested(reason);
        let frontier = self.frontier.frontier();
        let unit = Flushable {
            buffer: std::mem::replace(&mut self.buffer, self.pool.get()),
            checkpoint: self.frontier.checkpoint(),
        };
        debug!(
            %reason,
            rows = unit.buffer.len(),
            bytes = unit.buffer.byte_size(),
            spans = unit.checkpoint.len(),
            %frontier,
            "flushing buffer"
        );

        self.flush_in_progress.store(true, Ordering::Relaxed);
        let start = Instant::now();
        tokio::select! {
            biased;
            _ = self.stop.cancelled() => {
                debug!(%reason, "shutting down, abandoning flush");
                return Ok(());
            }
            res = self.flush_tx.send(unit) => {
                if res.is_err() {
                    return Err(Error::FlushLoopExited);
                }
            }
        }
        self.metrics
            .flush_wait
            .observe(start.elapsed().as_secs_f64());
        self.last_flush_frontier = frontier;
        self.last_flush_time = Instant::now();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use logrep_types::{KeyValue, Span};
    use prometheus::Registry;

    fn setup(
        capacity: usize,
    ) -> (
        FlushCoordinator,
        mpsc::Receiver<Flushable>,
        Arc<AtomicBool>,
        CancellationToken,
        Arc<WriterMetrics>,
    ) {
        let frontier = SpanFrontier::new_at(Timestamp::EMPTY, [Span::new("a", "z")]).unwrap();
        let (tx, rx) = mpsc::channel(capacity);
        let in_progress = Arc::new(AtomicBool::new(false));
        let stop = CancellationToken::new();
        let metrics = Arc::new(WriterMetrics::new(&Registry::new()).unwrap());
        let coordinator = FlushCoordinator::new(
            frontier,
            Arc::new(BufferPool::default()),
            tx,
            stop.clone(),
            Arc::clone(&in_progress),
            Arc::clone(&metrics),
        );
        (coordinator, rx, in_progress, stop, metrics)
    }

    fn kv(key: &'static str) -> KeyValue {
        KeyValue::new(key, Bytes::from_static(b"v"), Timestamp::from_wall(1))
    }

    #[tokio::test]
    async fn maybe_flush_skips_when_nothing_changed() {
        let (mut c, mut rx, _, _, metrics) = setup(1);
        c.maybe_flush(FlushReason::Time).await.unwrap();
        assert!(rx.try_recv().is_err());
        assert_eq!(metrics.flushes_requested(FlushReason::Time), 0);
    }

    #[tokio::test]
    async fn frontier_progress_flushes_empty_buffer() {
        let (mut c, mut rx, in_progress, _, _) = setup(1);
        c.frontier_mut()
            .forward(&Span::new("a", "z"), Timestamp::from_wall(10))
            .unwrap();
        c.maybe_flush(FlushReason::Time).await.unwrap();

        let unit = rx.try_recv().unwrap();
        assert!(unit.buffer.is_empty());
        assert_eq!(unit.checkpoint.len(), 1);
        assert_eq!(
            unit.checkpoint.resolved_spans[0].timestamp,
            Timestamp::from_wall(10)
        );
        assert!(in_progress.load(Ordering::Relaxed));

        // unchanged since the last flush
        in_progress.store(false, Ordering::Relaxed);
        c.maybe_flush(FlushReason::Time).await.unwrap();
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn maybe_flush_skips_while_in_flight() {
        let (mut c, mut rx, in_progress, _, _) = setup(1);
        c.buffer_mut().add_kv(kv("b"));
        in_progress.store(true, Ordering::Relaxed);
        c.maybe_flush(FlushReason::Size).await.unwrap();
        assert!(rx.try_recv().is_err());
        assert_eq!(c.buffer().len(), 1);

        // a forced flush goes ahead regardless
        c.flush(FlushReason::Size).await.unwrap();
        let unit = rx.try_recv().unwrap();
        assert_eq!(unit.buffer.len(), 1);
        assert!(c.buffer().is_empty());
    }

    #[tokio::test]
    async fn stop_abandons_blocked_handoff() {
        let (mut c, _rx, _, stop, _) = setup(1);
        c.buffer_mut().add_kv(kv("b"));
        c.flush(FlushReason::Size).await.unwrap();
        // the single slot is taken, the next handoff blocks until stopped
        c.buffer_mut().add_kv(kv("c"));
        let stopper = tokio::spawn(async move { stop.cancel() });
        c.flush(FlushReason::Close).await.unwrap();
        stopper.await.unwrap();
        assert!(c.buffer().is_empty());
    }

    #[tokio::test]
    async fn handoff_fails_once_flush_loop_is_gone() {
        let (mut c, rx, in_progress, _, _) = setup(1);
        drop(rx);
        c.buffer_mut().add_kv(kv("b"));
        let err = c.flush(FlushReason::Size).await.unwrap_err();
        assert!(matches!(err, Error::FlushLoopExited));
        assert!(in_progress.load(Ordering::Relaxed));

        // the latch is never cleared, so a timed flush is skipped rather than failing again
        c.maybe_flush(FlushReason::Time).await.unwrap();
    }
}
