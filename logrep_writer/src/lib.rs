//! The write path of a logical replication consumer.
//!
//! A [`LogicalReplicationWriter`] subscribes to a partition of a replication stream, buffers the
//! key-value mutations it receives, and periodically flushes the buffer to the local store through
//! a pool of concurrent transactional batch workers. Progress is tracked per span in a
//! [`logrep_frontier::SpanFrontier`], and the checkpoint taken when a buffer was retired is handed
//! back to the caller of [`LogicalReplicationWriter::next`] once that buffer has been applied.
//!
//! Three tasks run for the lifetime of a writer:
//!
//! * the subscription pump, feeding change events into a bounded channel,
//! * the event consumer loop, which owns the buffer and the frontier and decides when to flush,
//! * the flush loop, which applies retired buffers one at a time and forwards their checkpoints.
//!
//! They only communicate through single slot channels, so at most one buffer is being applied
//! while the next one fills.

pub mod batch;
pub mod buffer;
pub mod client;
pub mod consumer;
pub mod coordinator;
pub mod flush;
pub mod memory;
pub mod metrics;
pub mod processor;
pub mod settings;
pub mod status;
pub mod store;

pub use batch::{BatchApplier, BatchHandler, BatchStats, TxnBatch};
pub use buffer::{BufferPool, IngestionBuffer, SizeCheck};
pub use client::{ClientError, StreamClient, SubscribeRequest, Subscription};
pub use coordinator::FlushReason;
pub use metrics::WriterMetrics;
pub use processor::{LogicalReplicationWriter, WriterArgs};
pub use settings::{ConsumerSettings, MAX_WRITER_WORKERS, SharedSettings};
pub use status::{ConsumerStatus, ConsumerStatusSnapshot, StatusRegistry};
pub use store::{KvStore, RowProcessor, StoreError, Transaction};

use logrep_frontier::FrontierError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("kv event expected to have kv")]
    MissingKvs,

    #[error("checkpoint event expected to have resolved spans")]
    MissingResolvedSpans,

    #[error("unexpected event for online stream: {event_type}")]
    UnexpectedEvent { event_type: &'static str },

    #[error("unknown streaming event type {event_type}")]
    UnknownEvent { event_type: &'static str },

    #[error("unable to forward checkpoint frontier: {0}")]
    Frontier(#[from] FrontierError),

    #[error("error applying replicated rows: {0}")]
    Store(#[from] StoreError),

    #[error("stream client error: {0}")]
    Client(#[from] ClientError),

    #[error("error encoding checkpoint: {0}")]
    Encode(#[from] logrep_types::Error),

    #[error("batch worker was cancelled before finishing")]
    WorkerCancelled,

    #[error("flush loop exited before taking the buffer")]
    FlushLoopExited,

    #[error("{context}: {source}")]
    Context {
        context: &'static str,
        #[source]
        source: Box<Error>,
    },
}

impl Error {
    pub(crate) fn context(self, context: &'static str) -> Self {
        Self::Context {
            context,
            source: Box::new(self),
        }
    }

    /// The innermost error, skipping any [`Error::Context`] wrappers.
    pub fn root(&self) -> &Self {
        match self {
            Self::Context { source, .. } => source.root(),
            e => e,
        }
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
