//! Dead-letter policies and redelivery backoff.
//!
//! A failed attempt (`commit == false`) is handed to the destination's
//! [`DeadLetterPolicy`]. Returning `true` schedules a redelivery with the
//! redelivery count incremented; returning `false` drops the record from the
//! store for good.

use ferry_core::{Error, Record, Result};
use serde::{Deserialize, Serialize};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::time::Duration;
use tracing::{error, info};

/// Decides what happens to a record whose delivery failed
pub trait DeadLetterPolicy: Send + Sync + 'static {
    /// `true` to redeliver, `false` to drop permanently
    fn on_dead_letter(&self, record: &Record, delivery_count: u16) -> bool;
}

/// Drop every failed record. Used when no policy is configured.
#[derive(Debug, Clone, Copy, Default)]
pub struct DropPolicy;

impl DeadLetterPolicy for DropPolicy {
    fn on_dead_letter(&self, record: &Record, delivery_count: u16) -> bool {
        info!(
            destination = %record.destination,
            correlation_id = %record.correlation_id,
            delivery_count,
            "No dead-letter handling configured, dropping record"
        );
        false
    }
}

/// Redeliver until a record has been redelivered `max` times
#[derive(Debug, Clone, Copy)]
pub struct MaxRedeliveries {
    max: u16,
}

impl MaxRedeliveries {
    pub fn new(max: u16) -> Self {
        Self { max }
    }
}

impl DeadLetterPolicy for MaxRedeliveries {
    fn on_dead_letter(&self, _record: &Record, delivery_count: u16) -> bool {
        delivery_count < self.max
    }
}

/// Policy backed by a closure
pub struct FnPolicy<F> {
    f: F,
}

/// Build a [`DeadLetterPolicy`] from a closure
pub fn policy_fn<F>(f: F) -> FnPolicy<F>
where
    F: Fn(&Record, u16) -> bool + Send + Sync + 'static,
{
    FnPolicy { f }
}

impl<F> DeadLetterPolicy for FnPolicy<F>
where
    F: Fn(&Record, u16) -> bool + Send + Sync + 'static,
{
    fn on_dead_letter(&self, record: &Record, delivery_count: u16) -> bool {
        (self.f)(record, delivery_count)
    }
}

/// Ask the policy, treating a panic as a drop
pub(crate) fn decide(policy: &dyn DeadLetterPolicy, record: &Record, delivery_count: u16) -> bool {
    match catch_unwind(AssertUnwindSafe(|| policy.on_dead_letter(record, delivery_count))) {
        Ok(retry) => retry,
        Err(_) => {
            error!(
                destination = %record.destination,
                correlation_id = %record.correlation_id,
                delivery_count,
                "Dead-letter policy panicked, dropping record"
            );
            false
        }
    }
}

/// Exponential delay before redeliveries
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryBackoff {
    /// Delay before the first redelivery; zero redelivers immediately
    pub initial_delay: Duration,
    /// Upper bound for any delay
    pub max_delay: Duration,
    /// Growth factor per redelivery
    pub multiplier: f64,
}

impl Default for RetryBackoff {
    fn default() -> Self {
        Self::immediate()
    }
}

impl RetryBackoff {
    pub fn immediate() -> Self {
        Self {
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            multiplier: 1.0,
        }
    }

    pub fn fixed(delay: Duration) -> Self {
        Self {
            initial_delay: delay,
            max_delay: delay,
            multiplier: 1.0,
        }
    }

    pub fn exponential(initial_delay: Duration, max_delay: Duration) -> Self {
        Self {
            initial_delay,
            max_delay,
            multiplier: 2.0,
        }
    }

    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if !self.multiplier.is_finite() || self.multiplier < 1.0 {
            return Err(Error::InvalidConfig(format!(
                "retry multiplier must be a finite value >= 1.0, got {}",
                self.multiplier
            )));
        }
        if self.max_delay < self.initial_delay {
            return Err(Error::InvalidConfig(
                "retry max_delay must not be below initial_delay".into(),
            ));
        }
        Ok(())
    }

    /// Delay before redelivery number `redelivery` (1-based)
    pub fn delay_for(&self, redelivery: u16) -> Duration {
        if redelivery == 0 || self.initial_delay.is_zero() {
            return Duration::ZERO;
        }
        let exponent = i32::from(redelivery - 1);
        let secs = self.initial_delay.as_secs_f64() * self.multiplier.powi(exponent);
        if !secs.is_finite() || secs >= self.max_delay.as_secs_f64() {
            return self.max_delay;
        }
        Duration::from_secs_f64(secs)
    }
}
