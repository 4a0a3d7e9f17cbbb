//! Destination registrations

use crate::config::{ContainerConfig, RestartConfig};
use crate::consumer::Consumer;
use crate::dead_letter::{DeadLetterPolicy, RetryBackoff};
use ferry_core::{Error, Result};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

/// Request to consume a destination.
///
/// Unset flags fall back to the container defaults when the registration is
/// accepted.
pub struct Registration {
    destination: String,
    parallelism: usize,
    exclusive: Option<bool>,
    clear_all_pending: Option<bool>,
    remove_immediate: Option<bool>,
    consumer: Arc<dyn Consumer>,
    dead_letter: Option<Arc<dyn DeadLetterPolicy>>,
}

impl Registration {
    pub fn new(destination: impl Into<String>, consumer: impl Consumer) -> Self {
        Self::with_consumer(destination, Arc::new(consumer))
    }

    pub fn with_consumer(destination: impl Into<String>, consumer: Arc<dyn Consumer>) -> Self {
        Self {
            destination: destination.into(),
            parallelism: 1,
            exclusive: None,
            clear_all_pending: None,
            remove_immediate: None,
            consumer,
            dead_letter: None,
        }
    }

    /// Number of concurrent workers
    pub fn parallelism(mut self, parallelism: usize) -> Self {
        self.parallelism = parallelism;
        self
    }

    pub fn exclusive(mut self, enabled: bool) -> Self {
        self.exclusive = Some(enabled);
        self
    }

    pub fn clear_all_pending(mut self, enabled: bool) -> Self {
        self.clear_all_pending = Some(enabled);
        self
    }

    pub fn remove_immediate(mut self, enabled: bool) -> Self {
        self.remove_immediate = Some(enabled);
        self
    }

    /// Override the container's dead-letter policy
    pub fn dead_letter(mut self, policy: impl DeadLetterPolicy) -> Self {
        self.dead_letter = Some(Arc::new(policy));
        self
    }

    pub fn destination(&self) -> &str {
        &self.destination
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.destination.trim().is_empty() {
            return Err(Error::InvalidConfig("destination name is empty".into()));
        }
        if self.parallelism == 0 {
            return Err(Error::InvalidConfig(format!(
                "parallelism for {} must be at least 1",
                self.destination
            )));
        }
        Ok(())
    }

    /// Apply container defaults
    pub(crate) fn resolve(
        self,
        config: &ContainerConfig,
        default_dead_letter: &Arc<dyn DeadLetterPolicy>,
    ) -> Destination {
        let settings = DestinationSettings {
            clear_all_pending: self.clear_all_pending.unwrap_or(config.clear_all_pending),
            remove_immediate: self.remove_immediate.unwrap_or(config.remove_immediate),
            exclusive: self.exclusive.unwrap_or(config.exclusive),
            parallelism: self.parallelism,
            lock_lease: config.lock_lease,
            retry_backoff: config.retry_backoff.clone(),
            restart: config.restart,
            startup_timeout: config.startup_timeout,
            destination: self.destination,
        };
        if settings.clear_all_pending {
            warn!(
                destination = %settings.destination,
                "Replaying all pending records on start; not advisable in production"
            );
        }
        Destination {
            settings: Arc::new(settings),
            consumer: self.consumer,
            dead_letter: self
                .dead_letter
                .unwrap_or_else(|| default_dead_letter.clone()),
        }
    }
}

impl fmt::Debug for Registration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registration")
            .field("destination", &self.destination)
            .field("parallelism", &self.parallelism)
            .field("exclusive", &self.exclusive)
            .field("clear_all_pending", &self.clear_all_pending)
            .field("remove_immediate", &self.remove_immediate)
            .field("dead_letter", &self.dead_letter.is_some())
            .finish()
    }
}

/// Effective, immutable settings of a registered destination
#[derive(Debug, Clone, PartialEq)]
pub struct DestinationSettings {
    pub destination: String,
    pub parallelism: usize,
    pub exclusive: bool,
    pub clear_all_pending: bool,
    pub remove_immediate: bool,
    pub lock_lease: Option<Duration>,
    pub retry_backoff: RetryBackoff,
    pub restart: RestartConfig,
    pub startup_timeout: Duration,
}

/// An accepted registration
#[derive(Clone)]
pub(crate) struct Destination {
    pub(crate) settings: Arc<DestinationSettings>,
    pub(crate) consumer: Arc<dyn Consumer>,
    pub(crate) dead_letter: Arc<dyn DeadLetterPolicy>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consumer::consumer_fn;
    use crate::dead_letter::{DropPolicy, MaxRedeliveries};
    use ferry_core::Record;

    fn noop() -> impl Consumer {
        consumer_fn(|_record: Record| async { Ok(()) })
    }

    #[test]
    fn test_validation() {
        assert!(Registration::new("orders", noop()).validate().is_ok());
        assert!(Registration::new("  ", noop()).validate().is_err());
        assert!(Registration::new("orders", noop())
            .parallelism(0)
            .validate()
            .is_err());
    }

    #[test]
    fn test_resolve_uses_container_defaults() {
        let config = ContainerConfig::builder()
            .exclusive(true)
            .remove_immediate(true)
            .build()
            .unwrap();
        let fallback: Arc<dyn DeadLetterPolicy> = Arc::new(DropPolicy);

        let destination = Registration::new("orders", noop())
            .parallelism(4)
            .resolve(&config, &fallback);
        assert_eq!(destination.settings.destination, "orders");
        assert_eq!(destination.settings.parallelism, 4);
        assert!(destination.settings.exclusive);
        assert!(destination.settings.remove_immediate);
        assert!(!destination.settings.clear_all_pending);
        assert!(Arc::ptr_eq(&destination.dead_letter, &fallback));
    }

    #[test]
    fn test_resolve_overrides() {
        let config = ContainerConfig::builder().exclusive(true).build().unwrap();
        let fallback: Arc<dyn DeadLetterPolicy> = Arc::new(DropPolicy);

        let destination = Registration::new("orders", noop())
            .exclusive(false)
            .clear_all_pending(true)
            .dead_letter(MaxRedeliveries::new(3))
            .resolve(&config, &fallback);
        assert!(!destination.settings.exclusive);
        assert!(destination.settings.clear_all_pending);
        assert!(!Arc::ptr_eq(&destination.dead_letter, &fallback));
    }
}
