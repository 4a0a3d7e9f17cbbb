//! End of a delivery attempt: commit or dead-letter

use crate::dead_letter::{decide, DeadLetterPolicy};
use crate::exclusive;
use crate::metrics::DestinationStats;
use crate::registration::DestinationSettings;
use crate::supervisor::Command;
use ferry_core::{Envelope, RecordKey, Result};
use ferry_grid::QueueStore;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Margin past lease expiry before a held record is claimed again
const RECLAIM_SLACK: Duration = Duration::from_millis(10);

/// State shared by a destination's supervisor and its workers to finish
/// attempts. Workers use it directly in immediate-removal mode; otherwise
/// they report to the supervisor, which uses it.
pub(crate) struct DeliveryPath {
    settings: Arc<DestinationSettings>,
    store: Arc<dyn QueueStore>,
    dead_letter: Arc<dyn DeadLetterPolicy>,
    mailbox: mpsc::UnboundedSender<Command>,
    stats: Arc<DestinationStats>,
}

impl DeliveryPath {
    pub(crate) fn new(
        settings: Arc<DestinationSettings>,
        store: Arc<dyn QueueStore>,
        dead_letter: Arc<dyn DeadLetterPolicy>,
        mailbox: mpsc::UnboundedSender<Command>,
        stats: Arc<DestinationStats>,
    ) -> Self {
        Self {
            settings,
            store,
            dead_letter,
            mailbox,
            stats,
        }
    }

    fn destination(&self) -> &str {
        &self.settings.destination
    }

    /// Hand a finished attempt to the supervisor
    pub(crate) fn report(&self, envelope: Envelope) -> Result<()> {
        self.mailbox.send(Command::Completed(envelope))?;
        Ok(())
    }

    pub(crate) async fn end_transaction(&self, envelope: Envelope) -> Result<()> {
        if envelope.is_committed() {
            self.stats.record_commit(self.destination());
            self.remove(envelope.key()).await
        } else {
            self.stats.record_failure(self.destination());
            self.dead_letter(envelope).await
        }
    }

    async fn dead_letter(&self, envelope: Envelope) -> Result<()> {
        let delivery_count = envelope.redelivery_count();
        if decide(self.dead_letter.as_ref(), envelope.record(), delivery_count) {
            let next = envelope.redeliver();
            if self.settings.exclusive {
                exclusive::record_redelivery(
                    self.store.as_ref(),
                    next.key(),
                    next.redelivery_count(),
                )
                .await?;
            }
            debug!(
                destination = %self.destination(),
                key = %next.key(),
                redelivery = next.redelivery_count(),
                "Scheduling redelivery"
            );
            self.stats.record_redelivery(self.destination());
            self.schedule_redelivery(next);
            Ok(())
        } else {
            warn!(
                destination = %self.destination(),
                key = %envelope.key(),
                correlation_id = %envelope.record().correlation_id,
                delivery_count,
                "Dropping undeliverable record"
            );
            self.stats.record_drop(self.destination());
            self.remove(envelope.key()).await
        }
    }

    fn schedule_redelivery(&self, envelope: Envelope) {
        let delay = self
            .settings
            .retry_backoff
            .delay_for(envelope.redelivery_count());
        if delay.is_zero() {
            if self.mailbox.send(Command::Redeliver(envelope)).is_err() {
                debug!(destination = %self.destination(), "Supervisor gone, redelivery discarded");
            }
            return;
        }

        let mailbox = self.mailbox.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            // a stopped supervisor leaves the record for the next owner
            let _ = mailbox.send(Command::Redeliver(envelope));
        });
    }

    /// Try the claim again once the current holder's lease ran out. A record
    /// finished by its holder in the meantime is simply gone by then.
    pub(crate) fn schedule_reclaim(&self, envelope: Envelope, delay: Duration) {
        let mailbox = self.mailbox.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay + RECLAIM_SLACK).await;
            let _ = mailbox.send(Command::Deliver(envelope));
        });
    }

    /// Remove a finished record, synchronously in immediate-removal mode
    pub(crate) async fn remove(&self, key: RecordKey) -> Result<()> {
        if self.settings.remove_immediate {
            self.store.remove(key).await?;
            return Ok(());
        }

        let removal = self.store.remove_async(key);
        let destination = self.settings.destination.clone();
        tokio::spawn(async move {
            match removal.await {
                Ok(Ok(_)) => {}
                Ok(Err(err)) => {
                    warn!(
                        destination = %destination,
                        key = %key,
                        error = %err,
                        "Asynchronous removal failed"
                    )
                }
                Err(err) => {
                    warn!(
                        destination = %destination,
                        key = %key,
                        error = %err,
                        "Asynchronous removal task failed"
                    )
                }
            }
        });
        Ok(())
    }
}
