//! In-process partitioned grid.
//!
//! [`InMemoryGrid`] simulates a cluster of named members sharing the same
//! maps. Each member sees the grid through a [`GridMember`], which reports
//! local keys and delivers change notifications only for the partitions it
//! owns. Migrations, partition loss and store outages can be triggered
//! explicitly, which makes the grid suitable for tests and single-process
//! deployments.

use crate::event::{EntryEvent, EntryEventKind, PartitionEvent};
use crate::partition::{partition_for, NodeId, PartitionId, PartitionTable};
use crate::store::{DataGrid, KeyLock, QueueStore, Subscription, SubscriptionId};
use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use ferry_core::{Error, Record, RecordKey, Result};
use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const EVENT_CHANNEL_CAPACITY: usize = 1024;

struct GridState {
    partition_count: u32,
    members: Vec<NodeId>,
    table: RwLock<PartitionTable>,
    maps: DashMap<String, Arc<MapState>>,
    sequences: DashMap<String, AtomicU64>,
    events: broadcast::Sender<PartitionEvent>,
    running: AtomicBool,
    next_subscription: AtomicU64,
}

impl GridState {
    fn ensure_running(&self) -> Result<()> {
        if self.running.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(Error::StoreUnavailable("grid is not running".into()))
        }
    }

    fn owner_of(&self, key: RecordKey) -> Option<NodeId> {
        self.table.read().owner_of(key).cloned()
    }

    fn map(&self, name: &str) -> Arc<MapState> {
        self.maps
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(MapState::new(name)))
            .clone()
    }

    fn publish(&self, event: PartitionEvent) {
        // no receivers is fine
        let _ = self.events.send(event);
    }
}

struct Listener {
    node: NodeId,
    events: mpsc::UnboundedSender<EntryEvent>,
}

struct MapState {
    name: String,
    entries: DashMap<RecordKey, Record>,
    locks: DashMap<RecordKey, Arc<Mutex<()>>>,
    listeners: DashMap<SubscriptionId, Listener>,
}

impl MapState {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            entries: DashMap::new(),
            locks: DashMap::new(),
            listeners: DashMap::new(),
        }
    }
}

/// Shared state of an in-process cluster
#[derive(Clone)]
pub struct InMemoryGrid {
    state: Arc<GridState>,
}

impl InMemoryGrid {
    pub fn new(partition_count: u32, members: &[&str]) -> Result<Self> {
        let members: Vec<NodeId> = members.iter().map(|m| m.to_string()).collect();
        let table = PartitionTable::new(partition_count, &members)?;
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        info!(
            partitions = partition_count,
            members = members.len(),
            "Created in-memory grid"
        );

        Ok(Self {
            state: Arc::new(GridState {
                partition_count,
                members,
                table: RwLock::new(table),
                maps: DashMap::new(),
                sequences: DashMap::new(),
                events,
                running: AtomicBool::new(true),
                next_subscription: AtomicU64::new(1),
            }),
        })
    }

    /// Single-member grid
    pub fn standalone(partition_count: u32) -> Result<Self> {
        Self::new(partition_count, &["local"])
    }

    /// View of the grid from one member
    pub fn member(&self, node: &str) -> Result<GridMember> {
        if !self.state.members.iter().any(|m| m == node) {
            return Err(Error::InvalidConfig(format!("unknown grid member: {node}")));
        }
        Ok(GridMember {
            node: node.to_string(),
            state: self.state.clone(),
        })
    }

    pub fn members(&self) -> &[NodeId] {
        &self.state.members
    }

    pub fn partition_table(&self) -> PartitionTable {
        self.state.table.read().clone()
    }

    pub fn is_running(&self) -> bool {
        self.state.running.load(Ordering::Acquire)
    }

    /// Make every store operation fail with `StoreUnavailable`
    pub fn shutdown(&self) {
        self.state.running.store(false, Ordering::Release);
        warn!("In-memory grid shut down");
    }

    pub fn recover(&self) {
        self.state.running.store(true, Ordering::Release);
        info!("In-memory grid recovered");
    }

    pub fn partition_events(&self) -> broadcast::Receiver<PartitionEvent> {
        self.state.events.subscribe()
    }

    /// Move a partition to a new owner, publishing started/completed events
    pub fn migrate(&self, partition: PartitionId, to: &str) -> Result<()> {
        self.state.ensure_running()?;
        self.ensure_member(to)?;

        let from = {
            let table = self.state.table.read();
            table.owner(partition).cloned().ok_or_else(|| {
                Error::InvalidConfig(format!("partition {partition} does not exist"))
            })?
        };
        if from == to {
            debug!(partition = %partition, node = %to, "Partition already owned");
            return Ok(());
        }

        self.state.publish(PartitionEvent::MigrationStarted {
            partition,
            from: from.clone(),
            to: to.to_string(),
        });
        self.state.table.write().assign(partition, to.to_string())?;
        info!(partition = %partition, from = %from, to = %to, "Partition migrated");
        self.state.publish(PartitionEvent::MigrationCompleted {
            partition,
            from,
            to: to.to_string(),
        });
        Ok(())
    }

    /// Move every partition owned by `from` to `to`
    pub fn migrate_all(&self, from: &str, to: &str) -> Result<Vec<PartitionId>> {
        let partitions = self.state.table.read().partitions_owned_by(from);
        for partition in &partitions {
            self.migrate(*partition, to)?;
        }
        Ok(partitions)
    }

    /// Publish a migration that fails without changing ownership
    pub fn fail_migration(&self, partition: PartitionId, to: &str, reason: &str) -> Result<()> {
        self.ensure_member(to)?;
        let from = self
            .state
            .table
            .read()
            .owner(partition)
            .cloned()
            .ok_or_else(|| Error::InvalidConfig(format!("partition {partition} does not exist")))?;

        self.state.publish(PartitionEvent::MigrationStarted {
            partition,
            from: from.clone(),
            to: to.to_string(),
        });
        self.state.publish(PartitionEvent::MigrationFailed {
            partition,
            from,
            to: to.to_string(),
            reason: reason.to_string(),
        });
        Ok(())
    }

    /// Drop all data held in a partition, as if every replica was lost
    pub fn lose_partition(&self, partition: PartitionId) -> Result<usize> {
        let owner = self
            .state
            .table
            .read()
            .owner(partition)
            .cloned()
            .ok_or_else(|| Error::InvalidConfig(format!("partition {partition} does not exist")))?;

        let count = self.state.partition_count;
        let mut dropped = 0;
        for map in self.state.maps.iter() {
            let before = map.entries.len();
            map.entries
                .retain(|key, _| partition_for(*key, count) != partition);
            dropped += before - map.entries.len();
        }

        warn!(partition = %partition, owner = %owner, dropped, "Partition lost");
        self.state.publish(PartitionEvent::Lost { partition, owner });
        Ok(dropped)
    }

    fn ensure_member(&self, node: &str) -> Result<()> {
        if self.state.members.iter().any(|m| m == node) {
            Ok(())
        } else {
            Err(Error::InvalidConfig(format!("unknown grid member: {node}")))
        }
    }
}

/// One member of an [`InMemoryGrid`]
#[derive(Clone)]
pub struct GridMember {
    node: NodeId,
    state: Arc<GridState>,
}

impl GridMember {
    /// Concrete store handle, bypassing the trait object
    pub fn memory_store(&self, destination: &str) -> MemoryStore {
        MemoryStore {
            node: self.node.clone(),
            map: self.state.map(destination),
            state: self.state.clone(),
        }
    }
}

#[async_trait]
impl DataGrid for GridMember {
    fn local_node(&self) -> &NodeId {
        &self.node
    }

    fn is_running(&self) -> bool {
        self.state.running.load(Ordering::Acquire)
    }

    async fn store(&self, destination: &str) -> Result<Arc<dyn QueueStore>> {
        self.state.ensure_running()?;
        Ok(Arc::new(self.memory_store(destination)))
    }

    fn partition_events(&self) -> broadcast::Receiver<PartitionEvent> {
        self.state.events.subscribe()
    }

    async fn next_id(&self, sequence: &str) -> Result<u64> {
        self.state.ensure_running()?;
        let counter = self
            .state
            .sequences
            .entry(sequence.to_string())
            .or_insert_with(|| AtomicU64::new(0));
        Ok(counter.fetch_add(1, Ordering::SeqCst) + 1)
    }
}

/// A destination map as seen from one member
#[derive(Clone)]
pub struct MemoryStore {
    node: NodeId,
    map: Arc<MapState>,
    state: Arc<GridState>,
}

impl MemoryStore {
    /// Deliver an entry event to listeners on the member owning the key
    fn notify(&self, key: RecordKey, record: Record, kind: EntryEventKind) {
        let Some(owner) = self.state.owner_of(key) else {
            return;
        };
        self.map.listeners.retain(|_, listener| {
            if listener.node != owner {
                return true;
            }
            listener
                .events
                .send(EntryEvent::new(key, record.clone(), kind))
                .is_ok()
        });
    }

    fn is_local(&self, key: RecordKey) -> bool {
        self.state.owner_of(key).is_some_and(|owner| owner == self.node)
    }
}

#[async_trait]
impl QueueStore for MemoryStore {
    fn name(&self) -> &str {
        &self.map.name
    }

    fn partition_of(&self, key: RecordKey) -> PartitionId {
        partition_for(key, self.state.partition_count)
    }

    async fn get(&self, key: RecordKey) -> Result<Option<Record>> {
        self.state.ensure_running()?;
        Ok(self.map.entries.get(&key).map(|entry| entry.value().clone()))
    }

    async fn put(&self, key: RecordKey, record: Record) -> Result<Option<Record>> {
        self.state.ensure_running()?;
        let previous = self.map.entries.insert(key, record.clone());
        let kind = if previous.is_some() {
            EntryEventKind::Updated
        } else {
            EntryEventKind::Added
        };
        self.notify(key, record, kind);
        Ok(previous)
    }

    async fn put_if_absent(&self, key: RecordKey, record: Record) -> Result<Option<Record>> {
        self.state.ensure_running()?;
        let inserted = match self.map.entries.entry(key) {
            Entry::Occupied(existing) => return Ok(Some(existing.get().clone())),
            Entry::Vacant(slot) => {
                slot.insert(record.clone());
                record
            }
        };
        self.notify(key, inserted, EntryEventKind::Added);
        Ok(None)
    }

    async fn remove(&self, key: RecordKey) -> Result<Option<Record>> {
        self.state.ensure_running()?;
        let removed = self.map.entries.remove(&key).map(|(_, record)| record);
        if let Some(record) = &removed {
            self.map.locks.remove(&key);
            self.notify(key, record.clone(), EntryEventKind::Removed);
        }
        Ok(removed)
    }

    fn remove_async(&self, key: RecordKey) -> JoinHandle<Result<Option<Record>>> {
        let store = self.clone();
        tokio::spawn(async move { store.remove(key).await })
    }

    async fn lock(&self, key: RecordKey) -> Result<KeyLock> {
        self.state.ensure_running()?;
        let mutex = self
            .map
            .locks
            .entry(key)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let guard = mutex.lock_owned().await;
        Ok(KeyLock::new(key, move || drop(guard)))
    }

    async fn local_keys(&self) -> Result<Vec<RecordKey>> {
        self.state.ensure_running()?;
        let mut keys: Vec<RecordKey> = self
            .map
            .entries
            .iter()
            .map(|entry| *entry.key())
            .filter(|key| self.is_local(*key))
            .collect();
        keys.sort_unstable();
        Ok(keys)
    }

    async fn all_keys(&self) -> Result<Vec<RecordKey>> {
        self.state.ensure_running()?;
        let mut keys: Vec<RecordKey> = self.map.entries.iter().map(|entry| *entry.key()).collect();
        keys.sort_unstable();
        Ok(keys)
    }

    async fn len(&self) -> Result<usize> {
        self.state.ensure_running()?;
        Ok(self.map.entries.len())
    }

    async fn subscribe_local(&self) -> Result<Subscription> {
        self.state.ensure_running()?;
        let id = SubscriptionId(self.state.next_subscription.fetch_add(1, Ordering::Relaxed));
        let (tx, rx) = mpsc::unbounded_channel();
        self.map.listeners.insert(
            id,
            Listener {
                node: self.node.clone(),
                events: tx,
            },
        );
        debug!(
            map = %self.map.name,
            node = %self.node,
            subscription = %id,
            "Added local entry listener"
        );
        Ok(Subscription::new(id, rx))
    }

    async fn unsubscribe(&self, id: SubscriptionId) -> Result<bool> {
        let removed = self.map.listeners.remove(&id).is_some();
        debug!(map = %self.map.name, subscription = %id, removed, "Removed local entry listener");
        Ok(removed)
    }
}
