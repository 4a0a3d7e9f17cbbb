use crate::{Record, RecordKey};

/// One delivery attempt of a record.
///
/// Envelopes are immutable per attempt: completing or redelivering produces a
/// new envelope rather than mutating the one a worker received.
#[derive(Debug, Clone)]
pub struct Envelope {
    key: RecordKey,
    record: Record,
    commit: bool,
    redelivery_count: u16,
    remove_immediate: bool,
}

impl Envelope {
    pub fn new(key: RecordKey, record: Record) -> Self {
        Self {
            key,
            redelivery_count: record.redelivery_count,
            record,
            commit: false,
            remove_immediate: false,
        }
    }

    /// Commit path runs on the worker instead of the supervisor
    pub fn with_remove_immediate(mut self, remove_immediate: bool) -> Self {
        self.remove_immediate = remove_immediate;
        self
    }

    pub fn key(&self) -> RecordKey {
        self.key
    }

    pub fn record(&self) -> &Record {
        &self.record
    }

    pub fn is_committed(&self) -> bool {
        self.commit
    }

    pub fn redelivery_count(&self) -> u16 {
        self.redelivery_count
    }

    pub fn is_remove_immediate(&self) -> bool {
        self.remove_immediate
    }

    /// The outcome of this attempt
    pub fn completed(self, commit: bool) -> Self {
        Self { commit, ..self }
    }

    /// The next attempt after a failed one
    pub fn redeliver(&self) -> Self {
        let redelivery_count = self.redelivery_count.saturating_add(1);
        let mut record = self.record.clone();
        record.redelivery_count = redelivery_count;
        record.redelivered = true;
        Self {
            key: self.key,
            record,
            commit: false,
            redelivery_count,
            remove_immediate: self.remove_immediate,
        }
    }
}
