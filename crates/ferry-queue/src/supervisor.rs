//! Destination supervisor.
//!
//! One supervisor task owns a destination on this member. It turns store
//! notifications, backlog replay and migration requests into deliveries,
//! runs the exclusivity claim when enabled, feeds the worker pool and finishes
//! attempts reported by workers.
//!
//! Supervision follows a small restart tree: a worker that panics is
//! restarted; too many worker restarts restart the supervisor's incarnation
//! (unsubscribe, stop workers, subscribe again, replay backlog); too many of
//! those stop the destination. An unreachable store stops the destination
//! immediately.
//!
//! On start the supervisor subscribes to local notifications before it
//! replays the backlog, so a record written during the replay is never
//! missed. Such a record can be seen by both the replay and its notification:
//! with exclusive claims the second one finds it `Locked` and skips it,
//! without them it is delivered twice.

use crate::config::RestartBudget;
use crate::consumer::Consumer;
use crate::delivery::DeliveryPath;
use crate::exclusive::{self, Claim};
use crate::metrics::DestinationStats;
use crate::registration::{Destination, DestinationSettings};
use crate::worker::{ExitReason, WorkerPool};
use ferry_core::{Envelope, Error, Result};
use ferry_grid::{DataGrid, EntryEvent, EntryEventKind, QueueStore};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, trace, warn};

/// Time a stopping supervisor gets past its deadline to tear down
const TEARDOWN_GRACE: Duration = Duration::from_millis(250);

/// Supervisor mailbox
#[derive(Debug)]
pub(crate) enum Command {
    /// Deliver through the exclusivity claim
    Deliver(Envelope),
    /// Redelivery of a record this supervisor already claimed
    Redeliver(Envelope),
    /// A worker finished an attempt
    Completed(Envelope),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SupervisorExit {
    Stopped { graceful: bool },
    StoreUnavailable,
    Failed,
}

enum Incarnation {
    Stopped { graceful: bool },
    Restart,
    StoreUnavailable,
    StartFailed(Error),
}

enum LoopExit {
    Stop(Instant),
    Restart,
    StoreUnavailable,
}

/// Container-side handle of a running supervisor
pub(crate) struct SupervisorHandle {
    destination: Destination,
    store: Arc<dyn QueueStore>,
    mailbox: mpsc::UnboundedSender<Command>,
    shutdown: watch::Sender<Option<Instant>>,
    task: JoinHandle<SupervisorExit>,
    stats: Arc<DestinationStats>,
}

impl SupervisorHandle {
    pub(crate) fn destination(&self) -> &Destination {
        &self.destination
    }

    pub(crate) fn store(&self) -> Arc<dyn QueueStore> {
        self.store.clone()
    }

    pub(crate) fn mailbox(&self) -> mpsc::UnboundedSender<Command> {
        self.mailbox.clone()
    }

    pub(crate) fn stats(&self) -> &Arc<DestinationStats> {
        &self.stats
    }

    pub(crate) fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Ask the supervisor to drain and stop by `deadline`
    pub(crate) fn signal_stop(&self, deadline: Instant) {
        let _ = self.shutdown.send(Some(deadline));
    }

    /// Wait for the supervisor, aborting it past the deadline. Returns whether
    /// it stopped gracefully.
    pub(crate) async fn join(self, deadline: Instant) -> bool {
        let name = self.destination.settings.destination.clone();
        let mut task = self.task;
        match tokio::time::timeout_at(deadline + TEARDOWN_GRACE, &mut task).await {
            Ok(Ok(SupervisorExit::Stopped { graceful })) => graceful,
            // stopped on its own before
            Ok(Ok(_)) => true,
            Ok(Err(err)) => {
                error!(destination = %name, error = %err, "Supervisor task failed");
                false
            }
            Err(_) => {
                warn!(destination = %name, "Supervisor did not stop in time, aborting");
                task.abort();
                let _ = task.await;
                self.destination.consumer.destroy().await;
                false
            }
        }
    }
}

/// Start a supervisor and wait for its startup handshake
pub(crate) async fn launch(
    destination: Destination,
    grid: &dyn DataGrid,
) -> Result<SupervisorHandle> {
    let settings = destination.settings.clone();
    let store = grid.store(&settings.destination).await?;
    let stats = Arc::new(DestinationStats::default());
    let (mailbox_tx, mailbox_rx) = mpsc::unbounded_channel();
    let (shutdown_tx, shutdown_rx) = watch::channel(None);
    let (ready_tx, ready_rx) = oneshot::channel();

    let delivery = Arc::new(DeliveryPath::new(
        settings.clone(),
        store.clone(),
        destination.dead_letter.clone(),
        mailbox_tx.clone(),
        stats.clone(),
    ));
    let supervisor = DestinationSupervisor {
        settings: settings.clone(),
        consumer: destination.consumer.clone(),
        store: store.clone(),
        delivery,
        mailbox: mailbox_rx,
        shutdown: shutdown_rx,
        stats: stats.clone(),
    };
    let task = tokio::spawn(supervisor.run(ready_tx));

    let handle = SupervisorHandle {
        destination,
        store,
        mailbox: mailbox_tx,
        shutdown: shutdown_tx,
        task,
        stats,
    };

    match tokio::time::timeout(settings.startup_timeout, ready_rx).await {
        Ok(Ok(Ok(()))) => Ok(handle),
        Ok(Ok(Err(err))) => {
            let _ = handle.task.await;
            Err(err)
        }
        Ok(Err(_)) => Err(Error::Other(format!(
            "supervisor for {} exited during startup",
            settings.destination
        ))),
        Err(_) => {
            handle.task.abort();
            handle.destination.consumer.destroy().await;
            Err(Error::Timeout(settings.startup_timeout))
        }
    }
}

struct DestinationSupervisor {
    settings: Arc<DestinationSettings>,
    consumer: Arc<dyn Consumer>,
    store: Arc<dyn QueueStore>,
    delivery: Arc<DeliveryPath>,
    mailbox: mpsc::UnboundedReceiver<Command>,
    shutdown: watch::Receiver<Option<Instant>>,
    stats: Arc<DestinationStats>,
}

impl DestinationSupervisor {
    fn name(&self) -> &str {
        &self.settings.destination
    }

    async fn run(mut self, ready: oneshot::Sender<Result<()>>) -> SupervisorExit {
        if let Err(err) = self.consumer.init().await {
            error!(destination = %self.name(), error = %err, "Consumer initialisation failed");
            let _ = ready.send(Err(err));
            return SupervisorExit::Failed;
        }

        let mut ready = Some(ready);
        let mut restarts = RestartBudget::new(self.settings.restart);
        let exit = loop {
            match self.incarnation(&mut ready).await {
                Incarnation::Stopped { graceful } => break SupervisorExit::Stopped { graceful },
                Incarnation::StoreUnavailable => {
                    error!(destination = %self.name(), "Store unavailable, stopping destination");
                    break SupervisorExit::StoreUnavailable;
                }
                Incarnation::StartFailed(err) => {
                    let unavailable = err.is_store_unavailable();
                    if let Some(ready) = ready.take() {
                        let _ = ready.send(Err(err));
                        break SupervisorExit::Failed;
                    }
                    error!(destination = %self.name(), error = %err, "Supervisor restart failed");
                    if unavailable {
                        break SupervisorExit::StoreUnavailable;
                    }
                    if !restarts.try_restart() {
                        break SupervisorExit::Failed;
                    }
                }
                Incarnation::Restart => {
                    if !restarts.try_restart() {
                        error!(
                            destination = %self.name(),
                            "Restart budget exhausted, stopping destination"
                        );
                        break SupervisorExit::Failed;
                    }
                    warn!(destination = %self.name(), "Restarting destination supervisor");
                }
            }
        };

        self.consumer.destroy().await;
        info!(destination = %self.name(), exit = ?exit, "Destination supervisor stopped");
        exit
    }

    /// Subscribe, replay the backlog and serve until stopped or escalated
    async fn incarnation(
        &mut self,
        ready: &mut Option<oneshot::Sender<Result<()>>>,
    ) -> Incarnation {
        // subscribe first so nothing published during the replay is missed;
        // events buffer until the replay is done
        let mut subscription = match self.store.subscribe_local().await {
            Ok(subscription) => subscription,
            Err(err) => return Incarnation::StartFailed(err),
        };
        let mut pool = WorkerPool::start(
            &self.settings.destination,
            self.settings.parallelism,
            self.consumer.clone(),
            self.delivery.clone(),
            self.stats.clone(),
        );

        if let Err(err) = self.replay_backlog(&pool).await {
            let _ = self.store.unsubscribe(subscription.id()).await;
            pool.shutdown().await;
            return Incarnation::StartFailed(err);
        }
        if let Some(ready) = ready.take() {
            let _ = ready.send(Ok(()));
        }
        info!(
            destination = %self.name(),
            parallelism = self.settings.parallelism,
            exclusive = self.settings.exclusive,
            remove_immediate = self.settings.remove_immediate,
            "Destination supervisor running"
        );

        let mut worker_restarts = RestartBudget::new(self.settings.restart);
        let exit = loop {
            tokio::select! {
                changed = self.shutdown.changed() => {
                    let deadline = match changed {
                        Ok(()) => *self.shutdown.borrow(),
                        Err(_) => Some(Instant::now()),
                    };
                    if let Some(deadline) = deadline {
                        break LoopExit::Stop(deadline);
                    }
                }
                Some(exit) = pool.join_next() => {
                    if let ExitReason::StoreUnavailable(reason) = &exit.reason {
                        error!(
                            destination = %self.name(),
                            reason = %reason,
                            "Worker lost the store"
                        );
                        break LoopExit::StoreUnavailable;
                    }
                    if !worker_restarts.try_restart() {
                        error!(
                            destination = %self.name(),
                            "Worker restart budget exhausted, escalating"
                        );
                        break LoopExit::Restart;
                    }
                    debug!(
                        destination = %self.name(),
                        worker = ?exit.worker,
                        reason = ?exit.reason,
                        "Restarting worker"
                    );
                    self.stats.record_worker_restart(self.name());
                    pool.spawn_worker();
                }
                event = subscription.recv() => {
                    let Some(event) = event else {
                        warn!(destination = %self.name(), "Entry listener closed by the store");
                        break LoopExit::Restart;
                    };
                    if let Err(err) = self.on_entry_event(event, &pool).await {
                        if err.is_store_unavailable() {
                            break LoopExit::StoreUnavailable;
                        }
                        warn!(
                            destination = %self.name(),
                            error = %err,
                            "Failed to handle entry event"
                        );
                    }
                }
                Some(command) = self.mailbox.recv() => {
                    if let Err(err) = self.on_command(command, &pool).await {
                        if err.is_store_unavailable() {
                            break LoopExit::StoreUnavailable;
                        }
                        warn!(destination = %self.name(), error = %err, "Failed to handle command");
                    }
                }
            }
        };

        if let Err(err) = self.store.unsubscribe(subscription.id()).await {
            debug!(destination = %self.name(), error = %err, "Failed to remove entry listener");
        }
        drop(subscription);

        match exit {
            LoopExit::Stop(deadline) => {
                let graceful = self.drain(pool, deadline).await;
                Incarnation::Stopped { graceful }
            }
            LoopExit::Restart => {
                let pending = pool.shutdown().await;
                self.release_all(pending).await;
                Incarnation::Restart
            }
            LoopExit::StoreUnavailable => {
                pool.shutdown().await;
                Incarnation::StoreUnavailable
            }
        }
    }

    async fn replay_backlog(&self, pool: &WorkerPool) -> Result<usize> {
        let keys = if self.settings.clear_all_pending {
            self.store.all_keys().await?
        } else {
            self.store.local_keys().await?
        };

        let mut replayed = 0;
        for key in keys {
            let Some(record) = self.store.get(key).await? else {
                continue;
            };
            self.deliver(Envelope::new(key, record), pool).await?;
            replayed += 1;
        }
        info!(destination = %self.name(), replayed, "Replayed pending records");
        Ok(replayed)
    }

    async fn on_entry_event(&self, event: EntryEvent, pool: &WorkerPool) -> Result<()> {
        match event.kind {
            EntryEventKind::Added | EntryEventKind::Merged => {
                self.deliver(Envelope::new(event.key, event.record), pool).await
            }
            // claims and tombstones update records too; only a reopened
            // record is new work
            EntryEventKind::Updated if event.record.is_open() => {
                self.deliver(Envelope::new(event.key, event.record), pool).await
            }
            EntryEventKind::Updated | EntryEventKind::Removed => Ok(()),
        }
    }

    async fn on_command(&self, command: Command, pool: &WorkerPool) -> Result<()> {
        match command {
            Command::Deliver(envelope) => self.deliver(envelope, pool).await,
            Command::Redeliver(envelope) => {
                self.submit(envelope, pool);
                Ok(())
            }
            Command::Completed(envelope) => self.delivery.end_transaction(envelope).await,
        }
    }

    /// Claim (when exclusive) and hand to the worker pool
    async fn deliver(&self, envelope: Envelope, pool: &WorkerPool) -> Result<()> {
        let envelope = if self.settings.exclusive {
            match exclusive::claim(self.store.as_ref(), envelope.key(), self.settings.lock_lease)
                .await?
            {
                Claim::Acquired(envelope) => envelope,
                Claim::Missing => {
                    trace!(
                        destination = %self.name(),
                        key = %envelope.key(),
                        "Record already gone"
                    );
                    return Ok(());
                }
                Claim::Held { state, reclaim_in } => {
                    debug!(
                        destination = %self.name(),
                        key = %envelope.key(),
                        state = ?state,
                        reclaim_in = ?reclaim_in,
                        "Record not open, skipping"
                    );
                    self.stats.record_contended(self.name());
                    if let Some(delay) = reclaim_in {
                        self.delivery.schedule_reclaim(envelope, delay);
                    }
                    return Ok(());
                }
                Claim::Expired(envelope) => return self.expire(envelope).await,
            }
        } else if envelope.record().is_expired() {
            return self.expire(envelope).await;
        } else {
            envelope
        };

        self.submit(envelope, pool);
        Ok(())
    }

    fn submit(&self, envelope: Envelope, pool: &WorkerPool) {
        let key = envelope.key();
        if !pool.submit(envelope.with_remove_immediate(self.settings.remove_immediate)) {
            debug!(destination = %self.name(), key = %key, "Worker pool closed, delivery skipped");
        }
    }

    async fn expire(&self, envelope: Envelope) -> Result<()> {
        info!(
            destination = %self.name(),
            key = %envelope.key(),
            correlation_id = %envelope.record().correlation_id,
            "Record expired before delivery"
        );
        self.stats.record_expired();
        self.delivery.remove(envelope.key()).await
    }

    /// Let workers finish queued work, finishing their attempts as they
    /// report, until the deadline
    async fn drain(&mut self, mut pool: WorkerPool, deadline: Instant) -> bool {
        pool.close();
        let graceful = loop {
            tokio::select! {
                exit = pool.join_next() => {
                    if exit.is_none() {
                        break true;
                    }
                }
                Some(command) = self.mailbox.recv() => self.on_drain_command(command).await,
                _ = tokio::time::sleep_until(deadline) => break false,
            }
        };

        if !graceful {
            warn!(destination = %self.name(), "Drain deadline passed, aborting workers");
        }
        // work left behind by aborted or crashed workers
        let pending = pool.shutdown().await;
        self.release_all(pending).await;
        while let Ok(command) = self.mailbox.try_recv() {
            self.on_drain_command(command).await;
        }
        graceful
    }

    async fn on_drain_command(&self, command: Command) {
        let result = match command {
            Command::Completed(envelope) => self.delivery.end_transaction(envelope).await,
            Command::Redeliver(envelope) => self.release(envelope).await,
            // nothing was claimed yet
            Command::Deliver(_) => Ok(()),
        };
        if let Err(err) = result {
            warn!(
                destination = %self.name(),
                error = %err,
                "Failed to finish attempt while stopping"
            );
        }
    }

    async fn release_all(&self, pending: Vec<Envelope>) {
        for envelope in pending {
            if let Err(err) = self.release(envelope).await {
                warn!(destination = %self.name(), error = %err, "Failed to release claim");
            }
        }
    }

    /// Give up a claim this supervisor will not deliver
    async fn release(&self, envelope: Envelope) -> Result<()> {
        if self.settings.exclusive {
            exclusive::release(self.store.as_ref(), envelope.key()).await?;
        }
        Ok(())
    }
}
