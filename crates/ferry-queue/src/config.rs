//! Container configuration

use crate::dead_letter::RetryBackoff;
use ferry_core::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::time::Duration;
use tokio::time::Instant;

/// Container-wide settings and per-destination defaults
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContainerConfig {
    /// Replay every pending record on start, not only locally owned ones
    pub clear_all_pending: bool,

    /// Commit on the worker as soon as the callback returns
    pub remove_immediate: bool,

    /// Claim records under the per-key lock before delivery
    pub exclusive: bool,

    /// Age after which a `Locked` record may be claimed again (None = never)
    pub lock_lease: Option<Duration>,

    /// Bound on a destination's startup handshake
    pub startup_timeout: Duration,

    /// Default bound for a graceful stop
    pub stop_timeout: Duration,

    /// Restart budget for workers and supervisors
    pub restart: RestartConfig,

    /// Delay before a redelivery
    pub retry_backoff: RetryBackoff,
}

impl Default for ContainerConfig {
    fn default() -> Self {
        Self {
            clear_all_pending: false,
            remove_immediate: false,
            exclusive: false,
            lock_lease: Some(Duration::from_secs(300)),
            startup_timeout: Duration::from_secs(10),
            stop_timeout: Duration::from_secs(30),
            restart: RestartConfig::default(),
            retry_backoff: RetryBackoff::default(),
        }
    }
}

impl ContainerConfig {
    pub fn builder() -> ContainerConfigBuilder {
        ContainerConfigBuilder::new()
    }

    /// Parse from YAML, filling unset fields with defaults
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(yaml)
            .map_err(|e| Error::InvalidConfig(format!("failed to parse container config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.startup_timeout.is_zero() {
            return Err(Error::InvalidConfig(
                "startup_timeout must be greater than zero".into(),
            ));
        }
        if self.stop_timeout.is_zero() {
            return Err(Error::InvalidConfig(
                "stop_timeout must be greater than zero".into(),
            ));
        }
        if self.lock_lease.is_some_and(|lease| lease.is_zero()) {
            return Err(Error::InvalidConfig(
                "lock_lease must be greater than zero when set".into(),
            ));
        }
        self.restart.validate()?;
        self.retry_backoff.validate()
    }
}

/// Builder for [`ContainerConfig`]
#[derive(Debug, Default)]
pub struct ContainerConfigBuilder {
    config: ContainerConfig,
}

impl ContainerConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn clear_all_pending(mut self, enabled: bool) -> Self {
        self.config.clear_all_pending = enabled;
        self
    }

    pub fn remove_immediate(mut self, enabled: bool) -> Self {
        self.config.remove_immediate = enabled;
        self
    }

    pub fn exclusive(mut self, enabled: bool) -> Self {
        self.config.exclusive = enabled;
        self
    }

    pub fn lock_lease(mut self, lease: Option<Duration>) -> Self {
        self.config.lock_lease = lease;
        self
    }

    pub fn startup_timeout(mut self, timeout: Duration) -> Self {
        self.config.startup_timeout = timeout;
        self
    }

    pub fn stop_timeout(mut self, timeout: Duration) -> Self {
        self.config.stop_timeout = timeout;
        self
    }

    pub fn restart(mut self, restart: RestartConfig) -> Self {
        self.config.restart = restart;
        self
    }

    pub fn retry_backoff(mut self, backoff: RetryBackoff) -> Self {
        self.config.retry_backoff = backoff;
        self
    }

    pub fn build(self) -> Result<ContainerConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

/// At most `max_restarts` restarts within `within`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RestartConfig {
    pub max_restarts: u32,
    pub within: Duration,
}

impl Default for RestartConfig {
    fn default() -> Self {
        Self {
            max_restarts: 10,
            within: Duration::from_secs(60),
        }
    }
}

impl RestartConfig {
    pub fn validate(&self) -> Result<()> {
        if self.within.is_zero() {
            return Err(Error::InvalidConfig(
                "restart window must be greater than zero".into(),
            ));
        }
        Ok(())
    }
}

/// Sliding-window restart counter
#[derive(Debug)]
pub(crate) struct RestartBudget {
    config: RestartConfig,
    history: VecDeque<Instant>,
}

impl RestartBudget {
    pub(crate) fn new(config: RestartConfig) -> Self {
        Self {
            config,
            history: VecDeque::new(),
        }
    }

    /// Record a restart if the window still allows one
    pub(crate) fn try_restart(&mut self) -> bool {
        let now = Instant::now();
        while let Some(oldest) = self.history.front() {
            if now.duration_since(*oldest) >= self.config.within {
                self.history.pop_front();
            } else {
                break;
            }
        }
        if self.history.len() >= self.config.max_restarts as usize {
            return false;
        }
        self.history.push_back(now);
        true
    }
}
