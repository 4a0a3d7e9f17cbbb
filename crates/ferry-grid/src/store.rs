//! Store abstraction consumed by the queue engine.
//!
//! A [`DataGrid`] is one member's view of a partitioned cluster store. It hands
//! out one [`QueueStore`] per destination. Any backend offering per-key locks,
//! owner-local change notifications and partition events can sit behind these
//! traits.

use crate::event::{EntryEvent, PartitionEvent};
use crate::partition::{NodeId, PartitionId};
use async_trait::async_trait;
use ferry_core::{Record, RecordKey, Result};
use std::fmt;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

/// Identifier of a local entry listener
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(pub u64);

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

/// Stream of changes to entries owned by the subscribing member
#[derive(Debug)]
pub struct Subscription {
    id: SubscriptionId,
    events: mpsc::UnboundedReceiver<EntryEvent>,
}

impl Subscription {
    pub fn new(id: SubscriptionId, events: mpsc::UnboundedReceiver<EntryEvent>) -> Self {
        Self { id, events }
    }

    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    /// Next event; `None` once the store dropped the listener
    pub async fn recv(&mut self) -> Option<EntryEvent> {
        self.events.recv().await
    }
}

/// Cluster-wide lock on a single key, released on drop or [`KeyLock::unlock`]
pub struct KeyLock {
    key: RecordKey,
    release: Option<Box<dyn FnOnce() + Send>>,
}

impl KeyLock {
    pub fn new(key: RecordKey, release: impl FnOnce() + Send + 'static) -> Self {
        Self {
            key,
            release: Some(Box::new(release)),
        }
    }

    pub fn key(&self) -> RecordKey {
        self.key
    }

    pub fn unlock(mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

impl Drop for KeyLock {
    fn drop(&mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

impl fmt::Debug for KeyLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyLock")
            .field("key", &self.key)
            .field("held", &self.release.is_some())
            .finish()
    }
}

/// Per-destination keyed store
#[async_trait]
pub trait QueueStore: Send + Sync + 'static {
    /// Destination this store backs
    fn name(&self) -> &str;

    fn partition_of(&self, key: RecordKey) -> PartitionId;

    async fn get(&self, key: RecordKey) -> Result<Option<Record>>;

    /// Insert or replace, returning the previous value
    async fn put(&self, key: RecordKey, record: Record) -> Result<Option<Record>>;

    /// Insert unless present, returning the existing value if there was one
    async fn put_if_absent(&self, key: RecordKey, record: Record) -> Result<Option<Record>>;

    async fn remove(&self, key: RecordKey) -> Result<Option<Record>>;

    /// Fire-and-forget removal
    fn remove_async(&self, key: RecordKey) -> JoinHandle<Result<Option<Record>>>;

    /// Wait for the cluster-wide lock on `key`
    async fn lock(&self, key: RecordKey) -> Result<KeyLock>;

    /// Keys in partitions owned by the local member
    async fn local_keys(&self) -> Result<Vec<RecordKey>>;

    async fn all_keys(&self) -> Result<Vec<RecordKey>>;

    async fn len(&self) -> Result<usize>;

    /// Listen for changes to locally owned entries
    async fn subscribe_local(&self) -> Result<Subscription>;

    /// Returns whether the listener existed
    async fn unsubscribe(&self, id: SubscriptionId) -> Result<bool>;
}

/// One member's view of the cluster store
#[async_trait]
pub trait DataGrid: Send + Sync + 'static {
    fn local_node(&self) -> &NodeId;

    fn is_running(&self) -> bool;

    /// Store backing a destination, created on first use
    async fn store(&self, destination: &str) -> Result<Arc<dyn QueueStore>>;

    fn partition_events(&self) -> broadcast::Receiver<PartitionEvent>;

    /// Next value of a cluster-wide monotonically increasing sequence
    async fn next_id(&self, sequence: &str) -> Result<u64>;
}
