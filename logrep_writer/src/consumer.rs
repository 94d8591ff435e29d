//! The event consumer loop: drains the subscription into the buffer and frontier and decides when
//! to flush.

use std::sync::Arc;
use std::time::Duration;

use logrep_types::{KeyValue, ResolvedSpan, StreamEvent, Timestamp};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::buffer::SizeCheck;
use crate::client::EventReceiver;
use crate::coordinator::{FlushCoordinator, FlushReason};
use crate::metrics::WriterMetrics;
use crate::settings::SharedSettings;
use crate::status::ConsumerStatus;
use crate::{Error, Result};

/// How often the current buffer size is logged.
const BUFFER_LOG_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Debug)]
pub(crate) struct EventConsumer {
    events: EventReceiver,
    coordinator: FlushCoordinator,
    settings: SharedSettings,
    /// Checkpoints at or below this timestamp are forwarded without quantization.
    initial_scan_timestamp: Timestamp,
    stop: CancellationToken,
    metrics: Arc<WriterMetrics>,
    status: Arc<ConsumerStatus>,
    last_size_log: Option<Instant>,
}

impl EventConsumer {
    pub(crate) fn new(
        events: EventReceiver,
        coordinator: FlushCoordinator,
        settings: SharedSettings,
        initial_scan_timestamp: Timestamp,
        stop: CancellationToken,
        metrics: Arc<WriterMetrics>,
        status: Arc<ConsumerStatus>,
    ) -> Self {
        Self {
            events,
            coordinator,
            settings,
            initial_scan_timestamp,
            stop,
            metrics,
            status,
            last_size_log: None,
        }
    }

    /// Consume events until the subscription closes, flushing one last time when it does, or
    /// until stopped.
    pub(crate) async fn run(&mut self) -> Result<()> {
        let timer = tokio::time::sleep(self.settings.get().minimum_flush_interval);
        tokio::pin!(timer);

        loop {
            tokio::select! {
                biased;
                _ = self.stop.cancelled() => return Ok(()),
                event = self.events.recv() => match event {
                    Some(event) => {
                        self.status.record_recv();
                        self.handle_event(event).await?;
                    }
                    None => {
                        debug!("event stream closed");
                        self.coordinator.flush(FlushReason::Close).await?;
                        return Ok(());
                    }
                },
                () = &mut timer => {
                    let interval = self.settings.get().minimum_flush_interval;
                    if self.coordinator.since_last_flush() >= interval {
                        self.coordinator.maybe_flush(FlushReason::Time).await?;
                    }
                    timer.as_mut().reset(Instant::now() + interval);
                }
            }
        }
    }

    async fn handle_event(&mut self, event: StreamEvent) -> Result<()> {
        match event {
            StreamEvent::Kv(kvs) => self.handle_kvs(kvs)?,
            StreamEvent::Checkpoint(resolved) => self.handle_checkpoint(resolved)?,
            StreamEvent::Split(key) => info!(%key, "received split event"),
            e @ (StreamEvent::SsTable { .. } | StreamEvent::DeleteRange { .. }) => {
                return Err(Error::UnexpectedEvent {
                    event_type: e.type_name(),
                });
            }
            e => {
                return Err(Error::UnknownEvent {
                    event_type: e.type_name(),
                });
            }
        }

        self.log_buffer_size();

        let settings = self.settings.get();
        match self
            .coordinator
            .buffer()
            .should_flush_on_kv_size(settings.kv_buffer_target_length, settings.kv_buffer_size)
        {
            SizeCheck::MustFlush => self.coordinator.flush(FlushReason::Size).await?,
            SizeCheck::ShouldFlush => self.coordinator.maybe_flush(FlushReason::Size).await?,
            SizeCheck::Below => {}
        }
        Ok(())
    }

    fn handle_kvs(&mut self, kvs: Vec<KeyValue>) -> Result<()> {
        let Some(first) = kvs.first() else {
            return Err(Error::MissingKvs);
        };
        self.metrics
            .admit_latency
            .observe(first.timestamp().elapsed_at(Timestamp::now()).as_secs_f64());
        let buffer = self.coordinator.buffer_mut();
        for kv in kvs {
            buffer.add_kv(kv);
        }
        Ok(())
    }

    fn handle_checkpoint(&mut self, resolved: Vec<ResolvedSpan>) -> Result<()> {
        if resolved.is_empty() {
            return Err(Error::MissingResolvedSpans);
        }
        let granularity = self.settings.get().timestamp_granularity;
        for span in &resolved {
            self.coordinator.frontier_mut().forward_quantized(
                &span.span,
                span.timestamp,
                granularity,
                self.initial_scan_timestamp,
            )?;
        }
        self.metrics.checkpoint_events.inc();
        Ok(())
    }

    fn log_buffer_size(&mut self) {
        if self
            .last_size_log
            .is_some_and(|t| t.elapsed() < BUFFER_LOG_INTERVAL)
        {
            return;
        }
        let buffer = self.coordinator.buffer();
        info!(
            rows = buffer.len(),
            bytes = buffer.byte_size(),
            "current KV batch size"
        );
        self.last_size_log = Some(Instant::now());
    }
}
