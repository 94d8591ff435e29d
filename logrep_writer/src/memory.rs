//! In-memory implementations of the stream client, the key-value store and a last-write-wins row
//! processor. They back the tests of this crate and are handy for wiring up a writer without a
//! cluster on either side.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use logrep_types::{Key, KeyValue, StreamEvent, Value};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::client::{ClientError, EventReceiver, StreamClient, SubscribeRequest, Subscription};
use crate::store::{KvStore, RowProcessor, StoreError, Transaction};

type SourceItem = Result<StreamEvent, ClientError>;

/// A [`StreamClient`] whose single subscription replays events pushed through a
/// [`SourceHandle`].
#[derive(Debug)]
pub struct InMemoryStreamClient {
    source: Mutex<Option<mpsc::UnboundedReceiver<SourceItem>>>,
    requests: Mutex<Vec<SubscribeRequest>>,
    closed: AtomicBool,
}

/// The sending side of an [`InMemoryStreamClient`]. Dropping it ends the stream.
#[derive(Debug, Clone)]
pub struct SourceHandle {
    tx: mpsc::UnboundedSender<SourceItem>,
}

impl SourceHandle {
    /// Queue an event, returns false if the subscription has gone away.
    pub fn send(&self, event: StreamEvent) -> bool {
        self.tx.send(Ok(event)).is_ok()
    }

    /// Fail the subscription with `error` once the events queued before it are delivered.
    pub fn fail(&self, error: ClientError) -> bool {
        self.tx.send(Err(error)).is_ok()
    }

    /// End the stream once queued events are delivered.
    pub fn finish(self) {}
}

impl InMemoryStreamClient {
    pub fn new() -> (Self, SourceHandle) {
        let (tx, rx) = mpsc::unbounded_channel();
        let client = Self {
            source: Mutex::new(Some(rx)),
            requests: Default::default(),
            closed: AtomicBool::new(false),
        };
        (client, SourceHandle { tx })
    }

    /// Every request the client has been subscribed with.
    pub fn requests(&self) -> Vec<SubscribeRequest> {
        self.requests.lock().clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl StreamClient for InMemoryStreamClient {
    async fn subscribe(
        &self,
        request: SubscribeRequest,
    ) -> Result<(Box<dyn Subscription>, EventReceiver), ClientError> {
        if self.is_closed() {
            return Err(ClientError::Closed);
        }
        let source = self
            .source
            .lock()
            .take()
            .ok_or(ClientError::AlreadySubscribed)?;
        self.requests.lock().push(request);
        let (events, rx) = mpsc::channel(1);
        Ok((Box::new(InMemorySubscription { source, events }), rx))
    }

    async fn close(&self) -> Result<(), ClientError> {
        self.closed.store(true, Ordering::Relaxed);
        Ok(())
    }
}

#[derive(Debug)]
struct InMemorySubscription {
    source: mpsc::UnboundedReceiver<SourceItem>,
    events: mpsc::Sender<StreamEvent>,
}

#[async_trait]
impl Subscription for InMemorySubscription {
    async fn run(self: Box<Self>, cancel: CancellationToken) -> Result<(), ClientError> {
        let Self { mut source, events } = *self;
        loop {
            let item = tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                item = source.recv() => item,
            };
            let event = match item {
                None => return Ok(()),
                Some(item) => item?,
            };
            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                res = events.send(event) => if res.is_err() {
                    return Ok(());
                }
            }
        }
    }
}

#[derive(Debug, Default)]
struct StoreState {
    rows: BTreeMap<Key, Value>,
    commits: u64,
    omitted_commits: u64,
    fail_next_commit: Option<String>,
}

/// A transactional map. Writes are buffered per transaction and applied atomically on commit.
#[derive(Debug, Default, Clone)]
pub struct InMemoryKvStore {
    state: Arc<Mutex<StoreState>>,
}

impl InMemoryKvStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &Key) -> Option<Value> {
        self.state.lock().rows.get(key).cloned()
    }

    /// Committed rows, including tombstones.
    pub fn rows(&self) -> BTreeMap<Key, Value> {
        self.state.lock().rows.clone()
    }

    pub fn len(&self) -> usize {
        self.state.lock().rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().rows.is_empty()
    }

    pub fn commits(&self) -> u64 {
        self.state.lock().commits
    }

    /// Commits made by transactions excluded from change feeds.
    pub fn omitted_commits(&self) -> u64 {
        self.state.lock().omitted_commits
    }

    /// Make the next commit fail with `message`.
    pub fn fail_next_commit(&self, message: impl Into<String>) {
        self.state.lock().fail_next_commit = Some(message.into());
    }
}

#[async_trait]
impl KvStore for InMemoryKvStore {
    async fn begin(&self) -> Result<Box<dyn Transaction>, StoreError> {
        Ok(Box::new(InMemoryTxn {
            state: Arc::clone(&self.state),
            writes: BTreeMap::new(),
            omit_in_rangefeeds: false,
        }))
    }
}

#[derive(Debug)]
struct InMemoryTxn {
    state: Arc<Mutex<StoreState>>,
    /// `None` marks a deletion.
    writes: BTreeMap<Key, Option<Value>>,
    omit_in_rangefeeds: bool,
}

#[async_trait]
impl Transaction for InMemoryTxn {
    fn set_omit_in_rangefeeds(&mut self) {
        self.omit_in_rangefeeds = true;
    }

    async fn get(&mut self, key: &Key) -> Result<Option<Value>, StoreError> {
        if let Some(write) = self.writes.get(key) {
            return Ok(write.clone());
        }
        Ok(self.state.lock().rows.get(key).cloned())
    }

    async fn put(&mut self, key: Key, value: Value) -> Result<(), StoreError> {
        self.writes.insert(key, Some(value));
        Ok(())
    }

    async fn delete(&mut self, key: &Key) -> Result<(), StoreError> {
        self.writes.insert(key.clone(), None);
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        let Self {
            state,
            writes,
            omit_in_rangefeeds,
        } = *self;
        let mut state = state.lock();
        if let Some(message) = state.fail_next_commit.take() {
            return Err(StoreError::CommitFailed(message));
        }
        for (key, write) in writes {
            match write {
                Some(value) => {
                    state.rows.insert(key, value);
                }
                None => {
                    state.rows.remove(&key);
                }
            }
        }
        state.commits += 1;
        if omit_in_rangefeeds {
            state.omitted_commits += 1;
        }
        Ok(())
    }

    async fn rollback(self: Box<Self>) {}
}

/// Applies a mutation only if it is newer than the stored row. Deletions are stored as empty
/// values so their timestamp keeps older writes from resurrecting the row.
#[derive(Debug, Default, Clone, Copy)]
pub struct LastWriteWinsProcessor;

#[async_trait]
impl RowProcessor for LastWriteWinsProcessor {
    async fn process_row(
        &self,
        txn: &mut dyn Transaction,
        kv: &KeyValue,
    ) -> Result<(), StoreError> {
        if let Some(existing) = txn.get(&kv.key).await? {
            if existing.timestamp >= kv.timestamp() {
                return Ok(());
            }
        }
        txn.put(kv.key.clone(), kv.value.clone()).await
    }
}
