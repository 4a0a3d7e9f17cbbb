use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;
use uuid::Uuid;

/// Processing state of a stored record.
///
/// `Open` records are eligible for delivery. A delivery source moves a record
/// to `Locked` under the per-key lock before handing it to a worker; a record
/// that reached a final outcome but is still present in the store is
/// `Terminal`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessState {
    #[default]
    Open,
    Locked,
    Terminal,
}

/// Record body
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Payload {
    Text(String),
    Bytes(Bytes),
    /// Sorted string map
    Map(BTreeMap<String, String>),
}

impl Payload {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Payload::Text(text) => Some(text),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Payload::Bytes(bytes) => Some(bytes),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&BTreeMap<String, String>> {
        match self {
            Payload::Map(map) => Some(map),
            _ => None,
        }
    }
}

/// A queued record and its delivery metadata
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Record {
    /// Correlation identifier, a random UUID unless set by the publisher
    pub correlation_id: String,

    /// Destination (queue) name
    pub destination: String,

    /// Optional destination for replies
    pub reply_to: Option<String>,

    /// Creation time
    pub timestamp: DateTime<Utc>,

    /// Time to live in milliseconds after `timestamp`; 0 never expires
    pub expiry_ms: u64,

    /// Number of redeliveries before the current attempt
    pub redelivery_count: u16,

    /// Set once the record has been delivered more than once
    pub redelivered: bool,

    pub process_state: ProcessState,

    /// When the record entered `Locked`
    pub locked_at: Option<DateTime<Utc>>,

    /// Publish asynchronously; not persisted
    #[serde(skip)]
    pub add_async: bool,

    pub payload: Payload,
}

impl Record {
    /// Create a new open record for a destination
    pub fn new(destination: impl Into<String>, payload: Payload) -> Self {
        Self {
            correlation_id: Uuid::new_v4().to_string(),
            destination: destination.into(),
            reply_to: None,
            timestamp: Utc::now(),
            expiry_ms: 0,
            redelivery_count: 0,
            redelivered: false,
            process_state: ProcessState::Open,
            locked_at: None,
            add_async: false,
            payload,
        }
    }

    pub fn text(destination: impl Into<String>, text: impl Into<String>) -> Self {
        Self::new(destination, Payload::Text(text.into()))
    }

    pub fn bytes(destination: impl Into<String>, bytes: impl Into<Bytes>) -> Self {
        Self::new(destination, Payload::Bytes(bytes.into()))
    }

    pub fn map(destination: impl Into<String>, map: BTreeMap<String, String>) -> Self {
        Self::new(destination, Payload::Map(map))
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = correlation_id.into();
        self
    }

    pub fn with_reply_to(mut self, reply_to: impl Into<String>) -> Self {
        self.reply_to = Some(reply_to.into());
        self
    }

    pub fn with_expiry(mut self, ttl: Duration) -> Self {
        self.expiry_ms = u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX);
        self
    }

    /// Publish through the asynchronous ingest path
    pub fn asynchronous(mut self) -> Self {
        self.add_async = true;
        self
    }

    pub fn is_open(&self) -> bool {
        self.process_state == ProcessState::Open
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        if self.expiry_ms == 0 {
            return false;
        }
        let age = now.signed_duration_since(self.timestamp).num_milliseconds();
        age >= i64::try_from(self.expiry_ms).unwrap_or(i64::MAX)
    }

    /// Mark the record as claimed for delivery
    pub fn lock(&mut self, now: DateTime<Utc>) {
        self.process_state = ProcessState::Locked;
        self.locked_at = Some(now);
    }

    /// Return a claimed record to the open state
    pub fn reopen(&mut self) {
        self.process_state = ProcessState::Open;
        self.locked_at = None;
    }

    /// Whether a `Locked` record has held its claim for at least `lease`.
    ///
    /// Records locked without a timestamp are treated as stale.
    pub fn lock_expired(&self, lease: Duration, now: DateTime<Utc>) -> bool {
        if self.process_state != ProcessState::Locked {
            return false;
        }
        match self.locked_at {
            Some(locked_at) => {
                let held = now.signed_duration_since(locked_at).num_milliseconds();
                held >= i64::try_from(lease.as_millis()).unwrap_or(i64::MAX)
            }
            None => true,
        }
    }

    /// Serialize to bytes
    pub fn to_bytes(&self) -> crate::Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    /// Deserialize from bytes
    pub fn from_bytes(data: &[u8]) -> crate::Result<Self> {
        Ok(bincode::deserialize(data)?)
    }
}
