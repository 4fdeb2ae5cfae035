//! Fast membership lookup mirrored by the vnodes
//!
//! Every write a vnode applies is copied here under (group, partition).
//! Nothing in the replicated path reads it back: it can lag, miss writes
//! or be rebuilt from partition state at any time.

use crate::common::{MemberId, PartitionId, Result};
use std::collections::{BTreeSet, HashMap};
use std::sync::RwLock;

pub trait FastLookup: Send + Sync {
    /// Best-effort mirror of a materialized value
    fn write(&self, group: &str, partition: PartitionId, value: &BTreeSet<MemberId>)
        -> Result<()>;

    /// Union of the values mirrored for `group` by every partition
    fn read(&self, group: &str) -> BTreeSet<MemberId>;

    /// Forget everything mirrored by `partition`
    fn clear_partition(&self, partition: PartitionId);
}

/// In-process lookup table
#[derive(Debug, Default)]
pub struct InMemoryLookup {
    map: RwLock<HashMap<String, HashMap<PartitionId, BTreeSet<MemberId>>>>,
}

impl InMemoryLookup {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of groups with at least one mirrored partition
    pub fn len(&self) -> usize {
        self.map.read().map(|m| m.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl FastLookup for InMemoryLookup {
    fn write(
        &self,
        group: &str,
        partition: PartitionId,
        value: &BTreeSet<MemberId>,
    ) -> Result<()> {
        let mut map = self
            .map
            .write()
            .map_err(|_| crate::Error::Internal("lookup lock poisoned".into()))?;
        map.entry(group.to_string())
            .or_default()
            .insert(partition, value.clone());
        Ok(())
    }

    fn read(&self, group: &str) -> BTreeSet<MemberId> {
        let Ok(map) = self.map.read() else {
            return BTreeSet::new();
        };
        map.get(group)
            .map(|parts| parts.values().flatten().cloned().collect())
            .unwrap_or_default()
    }

    fn clear_partition(&self, partition: PartitionId) {
        let mut map = self.map.write().unwrap_or_else(|e| e.into_inner());
        map.retain(|_, parts| {
            parts.remove(&partition);
            !parts.is_empty()
        });
    }
}

/// Lookup that drops every write
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopLookup;

impl FastLookup for NoopLookup {
    fn write(&self, _: &str, _: PartitionId, _: &BTreeSet<MemberId>) -> Result<()> {
        Ok(())
    }

    fn read(&self, _: &str) -> BTreeSet<MemberId> {
        BTreeSet::new()
    }

    fn clear_partition(&self, _: PartitionId) {}
}
