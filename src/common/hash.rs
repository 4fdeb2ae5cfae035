//! Hashing and ring routing for minipg
//!
//! - BLAKE3 maps routing keys onto a fixed number of partitions
//! - HRW (Highest Random Weight) picks the owner node of each partition
//! - A preference list is N consecutive partitions starting at the key's
//!   partition, each paired with its current owner

use crate::common::types::{NodeId, PartitionId, VnodeId};
use crate::common::Result;
use std::collections::HashSet;
use std::sync::RwLock;

/// Compute partition for a routing key
pub fn partition_for(key: &str, num_partitions: u64) -> PartitionId {
    let hash = blake3::hash(key.as_bytes());
    let mut first = [0u8; 8];
    first.copy_from_slice(&hash.as_bytes()[0..8]);
    u64::from_le_bytes(first) % num_partitions
}

/// HRW (Highest Random Weight) hashing for partition ownership
///
/// Given a key and a set of nodes, returns nodes sorted by their weight
/// (deterministic based on key). Removing a node only moves the keys it
/// was heaviest for.
pub fn hrw_hash(key: &str, nodes: &[NodeId]) -> Vec<NodeId> {
    let mut weights: Vec<(NodeId, u64)> = nodes
        .iter()
        .map(|node| {
            let combined = format!("{}{}", key, node);
            let hash = blake3::hash(combined.as_bytes());
            let mut first = [0u8; 8];
            first.copy_from_slice(&hash.as_bytes()[0..8]);
            (node.clone(), u64::from_le_bytes(first))
        })
        .collect();

    // Sort by weight (descending), ties broken by name for determinism
    weights.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));

    weights.into_iter().map(|(node, _)| node).collect()
}

/// Resolves the replicas responsible for a routing key.
///
/// Implementations must be deterministic for a stable ring: a coordinator
/// may resolve the same key several times during one request.
pub trait PreferenceList: Send + Sync {
    fn resolve(&self, key: &str, count: usize) -> Result<Vec<VnodeId>>;
}

/// Consistent hash ring over a fixed partition count
pub struct HashRing {
    num_partitions: u64,
    nodes: Vec<NodeId>,
    down: RwLock<HashSet<NodeId>>,
}

impl HashRing {
    pub fn new(num_partitions: u64, nodes: Vec<NodeId>) -> Self {
        Self {
            num_partitions,
            nodes,
            down: RwLock::new(HashSet::new()),
        }
    }

    pub fn num_partitions(&self) -> u64 {
        self.num_partitions
    }

    /// Nodes currently eligible to own partitions
    pub fn live_nodes(&self) -> Vec<NodeId> {
        let down = self.down.read().unwrap_or_else(|e| e.into_inner());
        self.nodes
            .iter()
            .filter(|n| !down.contains(*n))
            .cloned()
            .collect()
    }

    /// Take a node out of ownership; its partitions fall back to the next
    /// heaviest live node.
    pub fn mark_down(&self, node: &str) {
        let mut down = self.down.write().unwrap_or_else(|e| e.into_inner());
        if down.insert(node.to_string()) {
            tracing::info!(node = %node, "Node marked down");
        }
    }

    pub fn mark_up(&self, node: &str) {
        let mut down = self.down.write().unwrap_or_else(|e| e.into_inner());
        if down.remove(node) {
            tracing::info!(node = %node, "Node marked up");
        }
    }

    /// Current owner of a partition
    pub fn owner(&self, partition: PartitionId) -> Option<NodeId> {
        let live = self.live_nodes();
        hrw_hash(&format!("partition-{}", partition), &live)
            .into_iter()
            .next()
    }

    /// All partitions currently owned by a node
    pub fn partitions_for_node(&self, node: &str) -> Vec<PartitionId> {
        (0..self.num_partitions)
            .filter(|p| self.owner(*p).as_deref() == Some(node))
            .collect()
    }
}

impl PreferenceList for HashRing {
    fn resolve(&self, key: &str, count: usize) -> Result<Vec<VnodeId>> {
        if count == 0 {
            return Err(crate::Error::RoutingFailure(
                "preference list of length 0 requested".into(),
            ));
        }
        if count as u64 > self.num_partitions {
            return Err(crate::Error::InsufficientReplicas {
                needed: count,
                available: self.num_partitions as usize,
            });
        }

        let live = self.live_nodes();
        if live.is_empty() {
            return Err(crate::Error::RoutingFailure(format!(
                "no live nodes for key {}",
                key
            )));
        }

        let start = partition_for(key, self.num_partitions);
        let preflist = (0..count as u64)
            .map(|i| {
                let partition = (start + i) % self.num_partitions;
                let owner = hrw_hash(&format!("partition-{}", partition), &live)
                    .into_iter()
                    .next()
                    .unwrap_or_else(|| live[0].clone());
                VnodeId::new(partition, owner)
            })
            .collect();

        Ok(preflist)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn nodes() -> Vec<NodeId> {
        vec!["node1".to_string(), "node2".to_string(), "node3".to_string()]
    }

    #[test]
    fn test_partition_for_deterministic() {
        let key = "lobby";
        assert_eq!(partition_for(key, 64), partition_for(key, 64));
        assert!(partition_for(key, 64) < 64);
    }

    #[test]
    fn test_hrw_hash_consistent() {
        let sorted1 = hrw_hash("my-key", &nodes());
        let sorted2 = hrw_hash("my-key", &nodes());
        assert_eq!(sorted1, sorted2);
        assert_eq!(sorted1.len(), 3);
    }

    #[test]
    fn test_preference_list_is_consecutive_and_stable() {
        let ring = HashRing::new(16, nodes());
        let first = ring.resolve("lobby", 3).unwrap();
        let second = ring.resolve("lobby", 3).unwrap();
        assert_eq!(first, second);
        assert_eq!(first.len(), 3);

        let start = partition_for("lobby", 16);
        for (i, vnode) in first.iter().enumerate() {
            assert_eq!(vnode.partition, (start + i as u64) % 16);
            assert_eq!(Some(vnode.node.clone()), ring.owner(vnode.partition));
        }
    }

    #[test]
    fn test_down_node_is_skipped() {
        let ring = HashRing::new(16, nodes());
        let preflist = ring.resolve("lobby", 3).unwrap();
        let victim = preflist[0].node.clone();

        ring.mark_down(&victim);
        let fallback = ring.resolve("lobby", 3).unwrap();
        assert!(fallback.iter().all(|v| v.node != victim));
        // Same partitions, different hosts
        let partitions: Vec<_> = fallback.iter().map(|v| v.partition).collect();
        let original: Vec<_> = preflist.iter().map(|v| v.partition).collect();
        assert_eq!(partitions, original);

        ring.mark_up(&victim);
        assert_eq!(ring.resolve("lobby", 3).unwrap(), preflist);
    }

    #[test]
    fn test_no_live_nodes_is_routing_failure() {
        let ring = HashRing::new(8, vec!["solo".to_string()]);
        ring.mark_down("solo");
        assert!(matches!(
            ring.resolve("lobby", 1),
            Err(crate::Error::RoutingFailure(_))
        ));
    }

    #[test]
    fn test_count_larger_than_ring_rejected() {
        let ring = HashRing::new(2, nodes());
        assert!(matches!(
            ring.resolve("lobby", 3),
            Err(crate::Error::InsufficientReplicas { .. })
        ));
    }

    #[test]
    fn test_partitions_for_node_cover_ring() {
        let ring = HashRing::new(32, nodes());
        let total: usize = nodes()
            .iter()
            .map(|n| ring.partitions_for_node(n).len())
            .sum();
        assert_eq!(total, 32);
    }
}
