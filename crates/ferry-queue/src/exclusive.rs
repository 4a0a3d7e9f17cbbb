//! Exclusive claiming of records.
//!
//! Several sources may ask for the same record to be delivered: live
//! notifications, backlog replay on start and migration reconciliation. A
//! claim takes the per-key lock, re-reads the record and moves it from `Open`
//! to `Locked`. Only the source that performed that transition delivers the
//! record; the lock is held across the read-modify-write and nothing else.
//!
//! A `Locked` record whose claimant died stays `Locked`. With a lease
//! configured, a refused claim reports when the lease runs out so the caller
//! can try again then; the retry reclaims the record if it is still held.

use chrono::{DateTime, Utc};
use ferry_core::{Envelope, ProcessState, Record, RecordKey, Result};
use ferry_grid::QueueStore;
use std::time::Duration;
use tracing::{debug, warn};

/// Outcome of a claim attempt
#[derive(Debug)]
pub(crate) enum Claim {
    /// The caller owns the delivery
    Acquired(Envelope),
    /// Already removed
    Missing,
    /// Claimed by someone else or finished. `reclaim_in` is set when the
    /// claim can be taken over once its lease runs out.
    Held {
        state: ProcessState,
        reclaim_in: Option<Duration>,
    },
    /// Expired before delivery, now `Terminal`; the caller removes it
    Expired(Envelope),
}

pub(crate) async fn claim(
    store: &dyn QueueStore,
    key: RecordKey,
    lease: Option<Duration>,
) -> Result<Claim> {
    let lock = store.lock(key).await?;

    let claim = match store.get(key).await? {
        None => Claim::Missing,
        Some(mut record) => {
            let now = Utc::now();
            let stale = lease.is_some_and(|lease| record.lock_expired(lease, now));

            if !record.is_open() && !stale {
                Claim::Held {
                    state: record.process_state,
                    reclaim_in: lease.and_then(|lease| lease_remaining(&record, lease, now)),
                }
            } else if record.is_expired_at(now) {
                record.process_state = ProcessState::Terminal;
                store.put(key, record.clone()).await?;
                Claim::Expired(Envelope::new(key, record))
            } else {
                if stale {
                    warn!(
                        destination = %store.name(),
                        key = %key,
                        locked_at = ?record.locked_at,
                        "Reclaiming record with an expired lock lease"
                    );
                }
                record.lock(now);
                store.put(key, record.clone()).await?;
                Claim::Acquired(Envelope::new(key, record))
            }
        }
    };

    lock.unlock();
    Ok(claim)
}

/// Time until the claim on a `Locked` record can be reclaimed
fn lease_remaining(record: &Record, lease: Duration, now: DateTime<Utc>) -> Option<Duration> {
    if record.process_state != ProcessState::Locked {
        return None;
    }
    let locked_at = record.locked_at?;
    let held = now.signed_duration_since(locked_at).to_std().unwrap_or_default();
    Some(lease.saturating_sub(held))
}

/// Persist the delivery count of a claimed record so it survives handoffs
/// and renew its lease
pub(crate) async fn record_redelivery(
    store: &dyn QueueStore,
    key: RecordKey,
    redelivery_count: u16,
) -> Result<bool> {
    let lock = store.lock(key).await?;
    let updated = match store.get(key).await? {
        Some(mut record) if record.process_state == ProcessState::Locked => {
            record.redelivery_count = redelivery_count;
            record.redelivered = true;
            // the claim stays ours across the retry delay
            record.lock(Utc::now());
            store.put(key, record).await?;
            true
        }
        _ => false,
    };
    lock.unlock();
    Ok(updated)
}

/// Reopen a claimed record that will not be delivered by its claimant
pub(crate) async fn release(store: &dyn QueueStore, key: RecordKey) -> Result<bool> {
    let lock = store.lock(key).await?;
    let released = match store.get(key).await? {
        Some(mut record) if record.process_state == ProcessState::Locked => {
            record.reopen();
            store.put(key, record).await?;
            true
        }
        _ => false,
    };
    lock.unlock();
    debug!(destination = %store.name(), key = %key, released, "Released claim");
    Ok(released)
}
