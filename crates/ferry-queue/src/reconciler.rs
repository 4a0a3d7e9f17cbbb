//! Migration reconciliation.
//!
//! Live notifications only reach the member that owns a key at write time.
//! When a partition moves to this member, records written before the move
//! never produced a notification here, so the reconciler submits every local
//! record of that partition to each managed destination's supervisor.

use crate::metrics::QueueMetrics;
use crate::supervisor::Command;
use dashmap::DashMap;
use ferry_core::{Envelope, Result};
use ferry_grid::{DataGrid, NodeId, PartitionEvent, PartitionId, QueueStore};
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

#[derive(Clone)]
struct Managed {
    store: Arc<dyn QueueStore>,
    mailbox: mpsc::UnboundedSender<Command>,
}

pub(crate) struct MigrationReconciler {
    local_node: NodeId,
    grid: Arc<dyn DataGrid>,
    destinations: DashMap<String, Managed>,
}

impl MigrationReconciler {
    pub(crate) fn new(grid: Arc<dyn DataGrid>) -> Self {
        Self {
            local_node: grid.local_node().clone(),
            grid,
            destinations: DashMap::new(),
        }
    }

    pub(crate) fn manage(
        &self,
        destination: &str,
        store: Arc<dyn QueueStore>,
        mailbox: mpsc::UnboundedSender<Command>,
    ) {
        self.destinations
            .insert(destination.to_string(), Managed { store, mailbox });
    }

    pub(crate) fn release(&self, destination: &str) {
        self.destinations.remove(destination);
    }

    /// Listen for partition events until `shutdown` flips
    pub(crate) fn spawn(self: Arc<Self>, shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let events = self.grid.partition_events();
        tokio::spawn(async move { self.run(events, shutdown).await })
    }

    async fn run(
        &self,
        mut events: broadcast::Receiver<PartitionEvent>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        debug!(node = %self.local_node, "Migration reconciler started");
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                event = events.recv() => match event {
                    Ok(event) => self.on_partition_event(event).await,
                    Err(RecvError::Lagged(missed)) => {
                        warn!(
                            node = %self.local_node,
                            missed,
                            "Missed partition events, reconciling all local records"
                        );
                        self.reconcile(|_| true).await;
                    }
                    Err(RecvError::Closed) => break,
                },
            }
        }
        debug!(node = %self.local_node, "Migration reconciler stopped");
    }

    pub(crate) async fn on_partition_event(&self, event: PartitionEvent) {
        match &event {
            PartitionEvent::MigrationStarted { partition, from, to } => {
                debug!(
                    partition = %partition,
                    from = %from,
                    to = %to,
                    "Partition migration started"
                );
            }
            PartitionEvent::MigrationCompleted { partition, from, .. }
                if event.became_local(&self.local_node) =>
            {
                info!(
                    partition = %partition,
                    from = %from,
                    node = %self.local_node,
                    "Partition migrated to this member"
                );
                let partition = *partition;
                self.reconcile(move |p| p == partition).await;
            }
            PartitionEvent::MigrationCompleted { partition, to, .. } => {
                debug!(partition = %partition, to = %to, "Partition migrated elsewhere");
            }
            PartitionEvent::MigrationFailed {
                partition,
                from,
                to,
                reason,
            } => {
                warn!(
                    partition = %partition,
                    from = %from,
                    to = %to,
                    reason = %reason,
                    "Partition migration failed"
                );
            }
            PartitionEvent::Lost { partition, owner } => {
                warn!(
                    partition = %partition,
                    owner = %owner,
                    "Partition lost, its pending records are gone"
                );
            }
        }
    }

    /// Submit local records in matching partitions; returns how many
    async fn reconcile<F>(&self, include: F) -> usize
    where
        F: Fn(PartitionId) -> bool + Send + Sync,
    {
        let managed: Vec<(String, Managed)> = self
            .destinations
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();

        let mut submitted = 0;
        for (destination, managed) in managed {
            match reconcile_destination(&destination, &managed, &include).await {
                Ok(count) => submitted += count,
                Err(err) => {
                    warn!(
                        destination = %destination,
                        error = %err,
                        "Failed to reconcile migrated records"
                    )
                }
            }
        }
        QueueMetrics::increment_migrated_entries(submitted as u64);
        submitted
    }
}

async fn reconcile_destination<F>(
    destination: &str,
    managed: &Managed,
    include: &F,
) -> Result<usize>
where
    F: Fn(PartitionId) -> bool + Send + Sync,
{
    let keys = managed.store.local_keys().await?;
    let mut submitted = 0;
    for key in keys {
        if !include(managed.store.partition_of(key)) {
            continue;
        }
        let Some(record) = managed.store.get(key).await? else {
            continue;
        };
        if managed
            .mailbox
            .send(Command::Deliver(Envelope::new(key, record)))
            .is_err()
        {
            debug!(destination = %destination, "Destination stopped, skipping migrated records");
            break;
        }
        submitted += 1;
    }
    if submitted > 0 {
        info!(destination = %destination, submitted, "Submitted migrated records for delivery");
    }
    Ok(submitted)
}
