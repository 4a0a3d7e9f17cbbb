//! Worker pool of a destination.
//!
//! Workers pull envelopes from a shared queue, so an idle worker takes the
//! next job and a busy one never accumulates a backlog of its own.

use crate::consumer::Consumer;
use crate::delivery::DeliveryPath;
use crate::metrics::DestinationStats;
use dashmap::DashMap;
use ferry_core::Envelope;
use futures::FutureExt;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinSet;
use tracing::{debug, error, warn};

/// Why a worker task ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum ExitReason {
    /// The queue was closed and is empty
    Drained,
    /// The callback panicked; the attempt was already reported as failed
    Panicked,
    /// The store could not be reached
    StoreUnavailable(String),
}

#[derive(Debug)]
pub(crate) struct WorkerExit {
    pub(crate) worker: Option<usize>,
    pub(crate) reason: ExitReason,
}

struct WorkerContext {
    destination: String,
    consumer: Arc<dyn Consumer>,
    delivery: Arc<DeliveryPath>,
    stats: Arc<DestinationStats>,
    queue: Mutex<mpsc::UnboundedReceiver<Envelope>>,
    /// Envelope each busy worker is processing
    in_flight: DashMap<usize, Envelope>,
}

pub(crate) struct WorkerPool {
    jobs: Option<mpsc::UnboundedSender<Envelope>>,
    context: Arc<WorkerContext>,
    workers: JoinSet<WorkerExit>,
    next_worker: usize,
}

impl WorkerPool {
    pub(crate) fn start(
        destination: &str,
        parallelism: usize,
        consumer: Arc<dyn Consumer>,
        delivery: Arc<DeliveryPath>,
        stats: Arc<DestinationStats>,
    ) -> Self {
        let (jobs, queue) = mpsc::unbounded_channel();
        let mut pool = Self {
            jobs: Some(jobs),
            context: Arc::new(WorkerContext {
                destination: destination.to_string(),
                consumer,
                delivery,
                stats,
                queue: Mutex::new(queue),
                in_flight: DashMap::new(),
            }),
            workers: JoinSet::new(),
            next_worker: 0,
        };
        for _ in 0..parallelism {
            pool.spawn_worker();
        }
        pool
    }

    pub(crate) fn spawn_worker(&mut self) {
        let id = self.next_worker;
        self.next_worker += 1;
        let context = self.context.clone();
        self.workers.spawn(run_worker(id, context));
    }

    /// Queue an envelope; false once the pool is closed
    pub(crate) fn submit(&self, envelope: Envelope) -> bool {
        match &self.jobs {
            Some(jobs) => jobs.send(envelope).is_ok(),
            None => false,
        }
    }

    /// Stop accepting work; workers exit once the queue is empty
    pub(crate) fn close(&mut self) {
        self.jobs = None;
    }

    pub(crate) async fn join_next(&mut self) -> Option<WorkerExit> {
        let joined = self.workers.join_next().await?;
        Some(joined.unwrap_or_else(|err| {
            if err.is_panic() {
                error!(destination = %self.context.destination, "Worker task panicked");
            }
            WorkerExit {
                worker: None,
                reason: ExitReason::Panicked,
            }
        }))
    }

    /// Abort all workers and return the envelopes they did not finish
    pub(crate) async fn shutdown(mut self) -> Vec<Envelope> {
        self.jobs = None;
        self.workers.shutdown().await;

        let mut pending: Vec<Envelope> = self
            .context
            .in_flight
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        self.context.in_flight.clear();

        let mut queue = self.context.queue.lock().await;
        while let Ok(envelope) = queue.try_recv() {
            pending.push(envelope);
        }
        pending
    }
}

async fn run_worker(id: usize, context: Arc<WorkerContext>) -> WorkerExit {
    debug!(destination = %context.destination, worker = id, "Worker started");
    loop {
        let next = context.queue.lock().await.recv().await;
        let Some(envelope) = next else {
            debug!(destination = %context.destination, worker = id, "Worker drained");
            return WorkerExit {
                worker: Some(id),
                reason: ExitReason::Drained,
            };
        };
        if let Some(reason) = context.process(id, envelope).await {
            return WorkerExit {
                worker: Some(id),
                reason,
            };
        }
    }
}

impl WorkerContext {
    /// Run the callback for one envelope and route its outcome
    async fn process(&self, worker: usize, envelope: Envelope) -> Option<ExitReason> {
        self.in_flight.insert(worker, envelope.clone());
        let exit = self.attempt(worker, envelope).await;
        self.in_flight.remove(&worker);
        exit
    }

    async fn attempt(&self, worker: usize, envelope: Envelope) -> Option<ExitReason> {
        let started = Instant::now();
        let outcome = AssertUnwindSafe(self.consumer.on_message(envelope.record()))
            .catch_unwind()
            .await;
        self.stats.record_delivery(&self.destination, started.elapsed());

        let (commit, mut exit) = match outcome {
            Ok(Ok(())) => (true, None),
            Ok(Err(err)) if err.is_store_unavailable() => {
                error!(
                    destination = %self.destination,
                    key = %envelope.key(),
                    error = %err,
                    "Store unavailable during delivery"
                );
                (false, Some(ExitReason::StoreUnavailable(err.to_string())))
            }
            Ok(Err(err)) => {
                warn!(
                    destination = %self.destination,
                    key = %envelope.key(),
                    redelivery = envelope.redelivery_count(),
                    error = %err,
                    "Message processing failed"
                );
                (false, None)
            }
            Err(panic) => {
                error!(
                    destination = %self.destination,
                    worker,
                    key = %envelope.key(),
                    panic = panic_message(panic.as_ref()),
                    "Consumer panicked, restarting worker"
                );
                (false, Some(ExitReason::Panicked))
            }
        };

        let completed = envelope.completed(commit);
        if completed.is_remove_immediate() {
            if let Err(err) = self.delivery.end_transaction(completed).await {
                if err.is_store_unavailable() {
                    exit.get_or_insert(ExitReason::StoreUnavailable(err.to_string()));
                } else {
                    warn!(
                        destination = %self.destination,
                        error = %err,
                        "Failed to finish delivery"
                    );
                }
            }
        } else if self.delivery.report(completed).is_err() {
            debug!(destination = %self.destination, "Supervisor gone, outcome discarded");
        }
        exit
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message
    } else {
        "non-string panic payload"
    }
}
