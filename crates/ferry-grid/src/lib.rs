//! Partitioned data grid abstraction for Ferry.
//!
//! The queue engine never talks to a concrete store. It consumes the
//! [`DataGrid`] and [`QueueStore`] traits defined here, which model a
//! partitioned in-memory data grid:
//!
//! ```text
//! ┌──────────────────────────── DataGrid (one member) ───────────────────────────┐
//! │                                                                              │
//! │  store("orders") ──► QueueStore                                              │
//! │                       ├─ get / put / put_if_absent / remove / remove_async   │
//! │                       ├─ lock(key) ──► KeyLock (released on drop)            │
//! │                       ├─ local_keys / all_keys                               │
//! │                       └─ subscribe_local ──► Subscription (EntryEvent)       │
//! │                                                                              │
//! │  partition_events ──► broadcast of PartitionEvent (migrations, loss)         │
//! │  next_id(sequence) ──► cluster-wide monotonically increasing counter         │
//! └──────────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! [`InMemoryGrid`] is an in-process implementation that simulates several
//! members, partition migrations and outages.

pub mod event;
pub mod memory;
pub mod partition;
pub mod store;

pub use event::{EntryEvent, EntryEventKind, PartitionEvent};
pub use memory::{GridMember, InMemoryGrid, MemoryStore};
pub use partition::{partition_for, NodeId, PartitionId, PartitionTable};
pub use store::{DataGrid, KeyLock, QueueStore, Subscription, SubscriptionId};
