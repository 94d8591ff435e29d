//! The boundary to the subscription transport that yields change events from the source.

use std::fmt::Debug;

use async_trait::async_trait;
use logrep_types::{ResolvedSpans, StreamEvent, Timestamp};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("stream client is closed")]
    Closed,

    #[error("partition is already subscribed")]
    AlreadySubscribed,

    #[error("transport error: {0}")]
    Transport(String),
}

/// Receiving half of a subscription's event channel. It closes once the paired
/// [`Subscription`] stops running.
pub type EventReceiver = mpsc::Receiver<StreamEvent>;

/// Where a subscription should start from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscribeRequest {
    pub stream_id: u64,
    pub consumer_id: i32,
    pub processor_id: i32,
    /// Timestamp of the initial scan. Spans that have not been resolved past it are scanned from
    /// this time.
    pub initial_scan_timestamp: Timestamp,
    /// Per-span progress to resume from, including spans with nothing resolved yet.
    pub frontier: ResolvedSpans,
}

/// A client for a replication stream on a source cluster.
#[async_trait]
pub trait StreamClient: Debug + Send + Sync + 'static {
    /// Subscribe to a partition of the stream. Nothing is received until the returned
    /// [`Subscription`] is run.
    async fn subscribe(
        &self,
        request: SubscribeRequest,
    ) -> Result<(Box<dyn Subscription>, EventReceiver), ClientError>;

    /// Stop the client. Running subscriptions wind down and close their event channels.
    async fn close(&self) -> Result<(), ClientError>;
}

/// The pump behind a subscription's event channel.
#[async_trait]
pub trait Subscription: Debug + Send + 'static {
    /// Deliver events until the source is exhausted, the transport fails, or `cancel` fires.
    async fn run(self: Box<Self>, cancel: CancellationToken) -> Result<(), ClientError>;
}
