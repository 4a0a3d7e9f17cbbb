//! Queue container: the registry of consumed destinations on this member.
//!
//! Registration is idempotent per destination name. `start` launches one
//! supervisor per registered destination and the migration reconciler;
//! destinations registered afterwards launch immediately. `stop` drains every
//! supervisor against a shared deadline and reports whether all of them made
//! it.

use crate::config::ContainerConfig;
use crate::dead_letter::{DeadLetterPolicy, DropPolicy};
use crate::metrics::{DestinationStatsSnapshot, QueueMetrics};
use crate::reconciler::MigrationReconciler;
use crate::registration::{Destination, Registration};
use crate::supervisor::{self, SupervisorHandle};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use ferry_core::{Error, Result};
use ferry_grid::DataGrid;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Lifecycle state of a destination
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DestinationStatus {
    /// Accepted, waiting for the container to start
    Registered,
    Running,
    /// Stopped on its own, e.g. after losing the store. Register again to
    /// resume.
    Stopped,
}

enum Slot {
    Registered(Destination),
    Running(SupervisorHandle),
}

impl Slot {
    fn is_live(&self) -> bool {
        match self {
            Slot::Registered(_) => true,
            Slot::Running(handle) => !handle.is_finished(),
        }
    }

    fn status(&self) -> DestinationStatus {
        match self {
            Slot::Registered(_) => DestinationStatus::Registered,
            Slot::Running(handle) if handle.is_finished() => DestinationStatus::Stopped,
            Slot::Running(_) => DestinationStatus::Running,
        }
    }
}

#[derive(Default)]
struct Lifecycle {
    reconciler: Option<(watch::Sender<bool>, JoinHandle<()>)>,
}

/// Registry and lifecycle owner of destination supervisors
pub struct QueueContainer {
    grid: Arc<dyn DataGrid>,
    config: ContainerConfig,
    default_dead_letter: Arc<dyn DeadLetterPolicy>,
    slots: DashMap<String, Slot>,
    reconciler: Arc<MigrationReconciler>,
    running: AtomicBool,
    lifecycle: Mutex<Lifecycle>,
}

impl QueueContainer {
    pub fn new(grid: Arc<dyn DataGrid>, config: ContainerConfig) -> Result<Self> {
        config.validate()?;
        if config.clear_all_pending {
            warn!("clear_all_pending is enabled by default; not advisable in production");
        }
        Ok(Self {
            reconciler: Arc::new(MigrationReconciler::new(grid.clone())),
            grid,
            config,
            default_dead_letter: Arc::new(DropPolicy),
            slots: DashMap::new(),
            running: AtomicBool::new(false),
            lifecycle: Mutex::new(Lifecycle::default()),
        })
    }

    /// Policy for registrations that do not bring their own
    pub fn with_dead_letter(mut self, policy: impl DeadLetterPolicy) -> Self {
        self.default_dead_letter = Arc::new(policy);
        self
    }

    pub fn config(&self) -> &ContainerConfig {
        &self.config
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Register a destination. Returns `false` if it already has a live
    /// registration, which is left untouched.
    pub async fn register(&self, registration: Registration) -> Result<bool> {
        registration.validate()?;
        let name = registration.destination().to_string();

        let _lifecycle = self.lifecycle.lock().await;
        match self.slots.entry(name.clone()) {
            Entry::Occupied(mut slot) => {
                if slot.get().is_live() {
                    debug!(destination = %name, "Destination already registered");
                    return Ok(false);
                }
                info!(destination = %name, "Replacing stopped destination");
                slot.insert(Slot::Registered(
                    registration.resolve(&self.config, &self.default_dead_letter),
                ));
            }
            Entry::Vacant(slot) => {
                slot.insert(Slot::Registered(
                    registration.resolve(&self.config, &self.default_dead_letter),
                ));
            }
        }

        if self.is_running() {
            if let Err(err) = self.launch(&name).await {
                self.slots.remove(&name);
                return Err(err);
            }
        }
        info!(destination = %name, "Registered destination");
        Ok(true)
    }

    /// Launch every registered destination. Runs once; later calls return
    /// immediately while the container is running.
    pub async fn start(&self) -> Result<()> {
        let mut lifecycle = self.lifecycle.lock().await;
        if self.is_running() {
            debug!("Queue container already running");
            return Ok(());
        }
        if !self.grid.is_running() {
            return Err(Error::StoreUnavailable(
                "cannot start queue container, grid is not running".into(),
            ));
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = self.reconciler.clone().spawn(shutdown_rx);
        lifecycle.reconciler = Some((shutdown_tx, task));
        self.running.store(true, Ordering::Release);

        let names: Vec<String> = self
            .slots
            .iter()
            .filter(|slot| matches!(slot.value(), Slot::Registered(_)))
            .map(|slot| slot.key().clone())
            .collect();
        for name in &names {
            if let Err(err) = self.launch(name).await {
                error!(destination = %name, error = %err, "Failed to start destination");
                self.stop_locked(&mut lifecycle, self.config.stop_timeout).await;
                return Err(err);
            }
        }

        info!(
            node = %self.grid.local_node(),
            destinations = names.len(),
            "Queue container started"
        );
        Ok(())
    }

    /// Stop all destinations, waiting up to `timeout` for them to drain.
    /// Returns whether every destination stopped gracefully in time. Safe to
    /// call when never started.
    pub async fn stop(&self, timeout: Duration) -> bool {
        let mut lifecycle = self.lifecycle.lock().await;
        self.stop_locked(&mut lifecycle, timeout).await
    }

    /// Stop with the configured timeout
    pub async fn stop_default(&self) -> bool {
        self.stop(self.config.stop_timeout).await
    }

    pub fn status(&self, destination: &str) -> Option<DestinationStatus> {
        self.slots.get(destination).map(|slot| slot.status())
    }

    /// Registered destination names, sorted
    pub fn destinations(&self) -> Vec<String> {
        let mut names: Vec<String> = self.slots.iter().map(|slot| slot.key().clone()).collect();
        names.sort();
        names
    }

    /// Counters of a destination that has been launched
    pub fn stats(&self, destination: &str) -> Option<DestinationStatsSnapshot> {
        self.slots.get(destination).and_then(|slot| match slot.value() {
            Slot::Running(handle) => Some(handle.stats().snapshot()),
            Slot::Registered(_) => None,
        })
    }

    async fn launch(&self, name: &str) -> Result<()> {
        let destination = self.slots.get(name).and_then(|slot| match slot.value() {
            Slot::Registered(destination) => Some(destination.clone()),
            Slot::Running(_) => None,
        });
        let Some(destination) = destination else {
            return Ok(());
        };

        let handle = supervisor::launch(destination, self.grid.as_ref()).await?;
        self.reconciler.manage(name, handle.store(), handle.mailbox());
        self.slots.insert(name.to_string(), Slot::Running(handle));
        QueueMetrics::set_active_destinations(self.running_count());
        Ok(())
    }

    fn running_count(&self) -> usize {
        self.slots
            .iter()
            .filter(|slot| slot.status() == DestinationStatus::Running)
            .count()
    }

    async fn stop_locked(&self, lifecycle: &mut Lifecycle, timeout: Duration) -> bool {
        if !self.running.swap(false, Ordering::AcqRel) {
            return true;
        }
        let deadline = Instant::now() + timeout;

        if let Some((shutdown, mut task)) = lifecycle.reconciler.take() {
            let _ = shutdown.send(true);
            if tokio::time::timeout_at(deadline, &mut task).await.is_err() {
                task.abort();
            }
        }

        let names: Vec<String> = self
            .slots
            .iter()
            .filter(|slot| matches!(slot.value(), Slot::Running(_)))
            .map(|slot| slot.key().clone())
            .collect();

        let mut handles = Vec::with_capacity(names.len());
        for name in names {
            match self.slots.remove(&name) {
                Some((name, Slot::Running(handle))) => {
                    self.reconciler.release(&name);
                    handle.signal_stop(deadline);
                    self.slots
                        .insert(name, Slot::Registered(handle.destination().clone()));
                    handles.push(handle);
                }
                Some((name, slot)) => {
                    self.slots.insert(name, slot);
                }
                None => {}
            }
        }

        let mut graceful = true;
        for handle in handles {
            graceful &= handle.join(deadline).await;
        }
        QueueMetrics::set_active_destinations(0);

        if graceful {
            info!("Queue container stopped");
        } else {
            warn!(timeout = ?timeout, "Queue container stopped, some destinations were forced");
        }
        graceful
    }
}
