//! Lifecycle of a logical replication writer and the pull interface its checkpoints are read
//! from.

use std::sync::Arc;
use std::sync::atomic::AtomicBool;

use bytes::Bytes;
use logrep_frontier::SpanFrontier;
use logrep_types::{ResolvedSpan, ResolvedSpans, Span, Timestamp};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::batch::{BatchApplier, BatchHandler, TxnBatch};
use crate::buffer::BufferPool;
use crate::client::{StreamClient, SubscribeRequest};
use crate::consumer::EventConsumer;
use crate::coordinator::FlushCoordinator;
use crate::flush::FlushLoop;
use crate::metrics::WriterMetrics;
use crate::settings::SharedSettings;
use crate::status::{ConsumerStatus, ConsumerStatusSnapshot, StatusRegistry};
use crate::store::{KvStore, RowProcessor};
use crate::{Error, Result};

/// Everything needed to start a [`LogicalReplicationWriter`].
#[derive(Debug)]
pub struct WriterArgs {
    pub stream_id: u64,
    pub processor_id: i32,
    pub consumer_id: i32,
    pub job_id: i64,
    /// The spans of the source keyspace this writer is responsible for.
    pub partition_spans: Vec<Span>,
    /// Progress already replicated across every partition span.
    pub previous_replicated_timestamp: Timestamp,
    pub initial_scan_timestamp: Timestamp,
    /// Finer grained progress from the last checkpoint, forwarded on top of
    /// `previous_replicated_timestamp`.
    pub checkpoint: ResolvedSpans,
    pub client: Arc<dyn StreamClient>,
    pub store: Arc<dyn KvStore>,
    pub row_processor: Arc<dyn RowProcessor>,
    /// Number of concurrent batch workers, see [`crate::MAX_WRITER_WORKERS`].
    pub max_workers: usize,
    pub settings: SharedSettings,
    pub metrics: Arc<WriterMetrics>,
    pub status_registry: Arc<StatusRegistry>,
}

/// A running writer. Checkpoints are pulled with [`Self::next`], and [`Self::close`] must be
/// called to shut it down cleanly.
#[derive(Debug)]
pub struct LogicalReplicationWriter {
    stream_id: u64,
    processor_id: i32,
    client: Arc<dyn StreamClient>,
    status_registry: Arc<StatusRegistry>,
    status: Arc<ConsumerStatus>,
    pool: Arc<BufferPool>,
    checkpoint_rx: mpsc::Receiver<ResolvedSpans>,
    err_rx: mpsc::Receiver<Error>,
    stop: CancellationToken,
    subscription_cancel: CancellationToken,
    tasks: JoinSet<()>,
    draining: bool,
    closed: bool,
}

impl LogicalReplicationWriter {
    /// Build the frontier, subscribe to the stream and start the subscription, event consumer and
    /// flush tasks.
    pub async fn start(args: WriterArgs) -> Result<Self> {
        let WriterArgs {
            stream_id,
            processor_id,
            consumer_id,
            job_id,
            partition_spans,
            previous_replicated_timestamp,
            initial_scan_timestamp,
            checkpoint,
            client,
            store,
            row_processor,
            max_workers,
            settings,
            metrics,
            status_registry,
        } = args;

        let mut frontier = SpanFrontier::new_at(previous_replicated_timestamp, partition_spans)?;
        for resolved in &checkpoint.resolved_spans {
            frontier.forward(&resolved.span, resolved.timestamp)?;
        }

        let status = status_registry.register(stream_id, processor_id);
        let request = SubscribeRequest {
            stream_id,
            consumer_id,
            processor_id,
            initial_scan_timestamp,
            frontier: ResolvedSpans::new(
                frontier
                    .entries()
                    .map(|(span, ts)| ResolvedSpan::new(span, ts))
                    .collect(),
            ),
        };
        let (subscription, events) = match client.subscribe(request).await {
            Ok(subscribed) => subscribed,
            Err(e) => {
                status_registry.unregister(stream_id, processor_id);
                return Err(Error::from(e).context("subscription"));
            }
        };
        info!(
            stream_id,
            processor_id,
            consumer_id,
            job_id,
            spans = frontier.len(),
            frontier = %frontier.frontier(),
            %initial_scan_timestamp,
            "subscribed to replication stream"
        );

        // one retired buffer may wait here while another is applied
        let (flush_tx, flush_rx) = mpsc::channel(1);
        let (checkpoint_tx, checkpoint_rx) = mpsc::channel(1);
        let (err_tx, err_rx) = mpsc::channel(1);
        let stop = CancellationToken::new();
        let subscription_cancel = CancellationToken::new();
        let flush_in_progress = Arc::new(AtomicBool::new(false));
        let pool = Arc::new(BufferPool::default());

        let handlers: Vec<Arc<dyn BatchHandler>> = (0..max_workers.max(1))
            .map(|_| {
                Arc::new(TxnBatch::new(
                    Arc::clone(&store),
                    Arc::clone(&row_processor),
                )) as Arc<dyn BatchHandler>
            })
            .collect();
        let applier = BatchApplier::new(handlers, Arc::clone(&metrics), Arc::clone(&status));

        let coordinator = FlushCoordinator::new(
            frontier,
            Arc::clone(&pool),
            flush_tx,
            stop.clone(),
            Arc::clone(&flush_in_progress),
            Arc::clone(&metrics),
        );
        let mut consumer = EventConsumer::new(
            events,
            coordinator,
            settings.clone(),
            initial_scan_timestamp,
            stop.clone(),
            Arc::clone(&metrics),
            Arc::clone(&status),
        );
        let mut flush_loop = FlushLoop::new(
            flush_rx,
            checkpoint_tx,
            applier,
            Arc::clone(&pool),
            settings,
            flush_in_progress,
            stop.clone(),
            metrics,
            Arc::clone(&status),
        );

        // Every task holds an error sender until it exits, and a failing task cancels the others
        // so the pipeline stops taking events.
        let mut tasks = JoinSet::new();
        let abort = Abort {
            errors: err_tx,
            stop: stop.clone(),
            subscription_cancel: subscription_cancel.clone(),
        };
        let on_error = abort.clone();
        let cancel = subscription_cancel.clone();
        tasks.spawn(async move {
            if let Err(e) = subscription.run(cancel).await {
                on_error.fail(Error::from(e).context("subscription"));
            }
        });
        let on_error = abort.clone();
        tasks.spawn(async move {
            if let Err(e) = consumer.run().await {
                on_error.fail(e.context("consume events"));
            }
            drop(consumer);
        });
        tasks.spawn(async move {
            if let Err(e) = flush_loop.run().await {
                abort.fail(e.context("flush loop"));
            }
            drop(flush_loop);
        });

        Ok(Self {
            stream_id,
            processor_id,
            client,
            status_registry,
            status,
            pool,
            checkpoint_rx,
            err_rx,
            stop,
            subscription_cancel,
            tasks,
            draining: false,
            closed: false,
        })
    }

    /// The next serialized checkpoint.
    ///
    /// Returns `Ok(None)` once the writer has drained, and the first error raised by any of its
    /// tasks exactly once, after which the writer is drained.
    pub async fn next(&mut self) -> Result<Option<Bytes>> {
        if self.draining {
            return Ok(None);
        }
        tokio::select! {
            checkpoint = self.checkpoint_rx.recv() => {
                if let Some(checkpoint) = checkpoint {
                    return Ok(Some(checkpoint.encode()?));
                }
            }
            Some(e) = self.err_rx.recv() => {
                self.draining = true;
                return Err(e);
            }
        }

        // wait for the remaining tasks, one of them may still be reporting its error
        self.draining = true;
        if let Some(e) = self.err_rx.recv().await {
            return Err(e);
        }
        info!(
            stream_id = self.stream_id,
            processor_id = self.processor_id,
            "checkpoint stream closed, draining"
        );
        Ok(None)
    }

    /// Live status of this writer.
    pub fn status(&self) -> ConsumerStatusSnapshot {
        self.status.snapshot()
    }

    /// Stop every task and wait for them to finish. Calling this more than once is a no-op.
    ///
    /// # Panics
    ///
    /// Re-raises the panic of any task that panicked.
    pub async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.status_registry
            .unregister(self.stream_id, self.processor_id);

        if let Err(e) = self.client.close().await {
            warn!(%e, "error closing stream client");
        }
        self.stop.cancel();
        self.subscription_cancel.cancel();

        while let Some(res) = self.tasks.join_next().await {
            if let Err(e) = res {
                if e.is_panic() {
                    std::panic::resume_unwind(e.into_panic());
                }
                error!(%e, "error joining writer task");
            }
        }
        self.pool.clear();
        info!(
            stream_id = self.stream_id,
            processor_id = self.processor_id,
            "logical replication writer closed"
        );
    }
}

impl Drop for LogicalReplicationWriter {
    fn drop(&mut self) {
        self.stop.cancel();
        self.subscription_cancel.cancel();
    }
}

/// Held by each writer task to report a fatal error and shut the others down.
#[derive(Debug, Clone)]
struct Abort {
    errors: mpsc::Sender<Error>,
    stop: CancellationToken,
    subscription_cancel: CancellationToken,
}

impl Abort {
    /// Report `e` unless an error is already pending, then stop taking events.
    fn fail(&self, e: Error) {
        if let Err(e) = self.errors.try_send(e) {
            debug!(e = %e.into_inner(), "dropping additional error");
        }
        self.subscription_cancel.cancel();
        self.stop.cancel();
    }
}
