//! Store change notifications and partition lifecycle events

use crate::partition::{NodeId, PartitionId};
use ferry_core::{Record, RecordKey};

/// Kind of change observed on a store entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntryEventKind {
    Added,
    Updated,
    /// Carries the removed value
    Removed,
    /// Entry restored after a cluster split healed
    Merged,
}

/// Change to an entry owned by the local member
#[derive(Debug, Clone)]
pub struct EntryEvent {
    pub key: RecordKey,
    pub record: Record,
    pub kind: EntryEventKind,
}

impl EntryEvent {
    pub fn new(key: RecordKey, record: Record, kind: EntryEventKind) -> Self {
        Self { key, record, kind }
    }
}

/// Partition lifecycle events published to every member
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PartitionEvent {
    MigrationStarted {
        partition: PartitionId,
        from: NodeId,
        to: NodeId,
    },
    MigrationCompleted {
        partition: PartitionId,
        from: NodeId,
        to: NodeId,
    },
    MigrationFailed {
        partition: PartitionId,
        from: NodeId,
        to: NodeId,
        reason: String,
    },
    /// All replicas of the partition are gone
    Lost {
        partition: PartitionId,
        owner: NodeId,
    },
}

impl PartitionEvent {
    pub fn partition(&self) -> PartitionId {
        match self {
            PartitionEvent::MigrationStarted { partition, .. }
            | PartitionEvent::MigrationCompleted { partition, .. }
            | PartitionEvent::MigrationFailed { partition, .. }
            | PartitionEvent::Lost { partition, .. } => *partition,
        }
    }

    /// A completed migration whose new owner is `node`
    pub fn became_local(&self, node: &str) -> bool {
        matches!(self, PartitionEvent::MigrationCompleted { to, .. } if to == node)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_became_local() {
        let completed = PartitionEvent::MigrationCompleted {
            partition: PartitionId(3),
            from: "a".into(),
            to: "b".into(),
        };
        assert!(completed.became_local("b"));
        assert!(!completed.became_local("a"));
        assert_eq!(completed.partition(), PartitionId(3));

        let started = PartitionEvent::MigrationStarted {
            partition: PartitionId(3),
            from: "a".into(),
            to: "b".into(),
        };
        assert!(!started.became_local("b"));
    }
}
