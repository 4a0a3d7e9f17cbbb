//! # Ferry Queue
//!
//! Clustered at-least-once consumption of named destinations on top of a
//! partitioned data grid:
//! - **Container**: registry of destinations consumed on this member
//! - **Supervisor**: one per destination; turns store notifications, backlog
//!   replay and migrations into deliveries
//! - **Exclusive claims**: per-key lock plus `Open -> Locked` transition so a
//!   record is delivered once even when several sources request it
//! - **Dead letters**: failed attempts are retried or dropped by policy
//!
//! ## Architecture
//!
//! ```text
//!  Publisher ──put(key, record)──► QueueStore (owned partition)
//!                                        │ local notification
//!                                        ▼
//! ┌──────────────────────────── QueueContainer ─────────────────────────────┐
//! │                                                                          │
//! │  MigrationReconciler ──Deliver──►  DestinationSupervisor (per dest)      │
//! │   (partition events)               ├─ backlog replay on start           │
//! │                                    ├─ exclusive claim (lock, Open→Locked)│
//! │                                    ├─ worker pool (pull, N workers)     │
//! │                                    │     └─ Consumer::on_message        │
//! │                                    └─ commit → remove                   │
//! │                                       fail   → DeadLetterPolicy         │
//! │                                                  ├─ retry → redeliver   │
//! │                                                  └─ drop  → remove      │
//! └──────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Example Usage
//!
//! ```rust,ignore
//! use ferry_queue::prelude::*;
//! use std::sync::Arc;
//!
//! let grid = InMemoryGrid::standalone(16)?;
//! let member: Arc<dyn DataGrid> = Arc::new(grid.member("local")?);
//!
//! let container = QueueContainer::new(member.clone(), ContainerConfig::default())?
//!     .with_dead_letter(MaxRedeliveries::new(3));
//! container
//!     .register(
//!         Registration::new("orders", consumer_fn(|record: Record| async move {
//!             println!("{:?}", record.payload);
//!             Ok(())
//!         }))
//!         .parallelism(4)
//!         .exclusive(true),
//!     )
//!     .await?;
//! container.start().await?;
//!
//! Publisher::new(member).offer(Record::text("orders", "hello")).await?;
//!
//! container.stop(Duration::from_secs(5)).await;
//! ```

pub mod config;
pub mod consumer;
pub mod container;
pub mod dead_letter;
mod delivery;
mod exclusive;
pub mod metrics;
pub mod publisher;
mod reconciler;
pub mod registration;
mod supervisor;
mod worker;

pub use config::{ContainerConfig, ContainerConfigBuilder, RestartConfig};
pub use consumer::{consumer_fn, ConsumeError, Consumer, FnConsumer};
pub use container::{DestinationStatus, QueueContainer};
pub use dead_letter::{
    policy_fn, DeadLetterPolicy, DropPolicy, FnPolicy, MaxRedeliveries, RetryBackoff,
};
pub use metrics::{DestinationStats, DestinationStatsSnapshot, QueueMetrics};
pub use publisher::Publisher;
pub use registration::{DestinationSettings, Registration};

pub mod prelude {
    pub use crate::{
        consumer_fn, policy_fn, ConsumeError, Consumer, ContainerConfig, DeadLetterPolicy,
        DestinationStatus, DropPolicy, MaxRedeliveries, Publisher, QueueContainer, Registration,
        RetryBackoff,
    };
    pub use ferry_core::{Envelope, Error, Payload, ProcessState, Record, RecordKey, Result};
    pub use ferry_grid::{DataGrid, InMemoryGrid, QueueStore};
    pub use std::time::Duration;
}
