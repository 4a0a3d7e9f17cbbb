//! Partition ownership and key hashing

use ferry_core::{Error, RecordKey, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Unique identifier of a cluster member
pub type NodeId = String;

/// Grid partition identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PartitionId(pub u32);

impl PartitionId {
    pub const fn new(id: u32) -> Self {
        Self(id)
    }

    pub const fn value(self) -> u32 {
        self.0
    }
}

impl fmt::Display for PartitionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "p{}", self.0)
    }
}

/// Partition a key hashes to. Same key, same partition count, same result.
pub fn partition_for(key: RecordKey, partition_count: u32) -> PartitionId {
    let hash = murmur2_hash(&key.to_bytes());
    PartitionId(((hash as i32).unsigned_abs()) % partition_count.max(1))
}

/// Partition ownership table.
///
/// Every partition has exactly one owner. Ownership changes only through
/// [`PartitionTable::assign`], which the grid calls while migrating.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionTable {
    owners: Vec<NodeId>,
}

impl PartitionTable {
    /// Spread `partition_count` partitions round-robin over `members`
    pub fn new(partition_count: u32, members: &[NodeId]) -> Result<Self> {
        if partition_count == 0 {
            return Err(Error::InvalidConfig(
                "partition count must be at least 1".into(),
            ));
        }
        if members.is_empty() {
            return Err(Error::InvalidConfig(
                "a grid needs at least one member".into(),
            ));
        }
        let owners = (0..partition_count as usize)
            .map(|p| members[p % members.len()].clone())
            .collect();
        Ok(Self { owners })
    }

    pub fn partition_count(&self) -> u32 {
        self.owners.len() as u32
    }

    pub fn owner(&self, partition: PartitionId) -> Option<&NodeId> {
        self.owners.get(partition.0 as usize)
    }

    pub fn partition_of(&self, key: RecordKey) -> PartitionId {
        partition_for(key, self.partition_count())
    }

    pub fn owner_of(&self, key: RecordKey) -> Option<&NodeId> {
        self.owner(self.partition_of(key))
    }

    pub fn is_local(&self, key: RecordKey, node: &str) -> bool {
        self.owner_of(key).is_some_and(|owner| owner == node)
    }

    pub fn partitions_owned_by(&self, node: &str) -> Vec<PartitionId> {
        self.owners
            .iter()
            .enumerate()
            .filter(|(_, owner)| owner.as_str() == node)
            .map(|(p, _)| PartitionId(p as u32))
            .collect()
    }

    /// Hand a partition to a new owner, returning the previous one
    pub fn assign(&mut self, partition: PartitionId, node: NodeId) -> Result<NodeId> {
        let slot = self.owners.get_mut(partition.0 as usize).ok_or_else(|| {
            Error::InvalidConfig(format!("partition {} does not exist", partition))
        })?;
        Ok(std::mem::replace(slot, node))
    }
}

/// Kafka-compatible murmur2
fn murmur2_hash(data: &[u8]) -> u32 {
    const SEED: i32 = 0x9747b28c_u32 as i32;
    const M: i32 = 0x5bd1e995;
    const R: i32 = 24;

    let mut h: i32 = SEED ^ data.len() as i32;

    let mut chunks = data.chunks_exact(4);
    for chunk in &mut chunks {
        let mut k = i32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        k = k.wrapping_mul(M);
        k ^= ((k as u32) >> R) as i32;
        k = k.wrapping_mul(M);
        h = h.wrapping_mul(M);
        h ^= k;
    }

    let tail = chunks.remainder();
    if tail.len() >= 3 {
        h ^= (tail[2] as i32) << 16;
    }
    if tail.len() >= 2 {
        h ^= (tail[1] as i32) << 8;
    }
    if !tail.is_empty() {
        h ^= tail[0] as i32;
        h = h.wrapping_mul(M);
    }

    h ^= ((h as u32) >> 13) as i32;
    h = h.wrapping_mul(M);
    h ^= ((h as u32) >> 15) as i32;

    h as u32
}
