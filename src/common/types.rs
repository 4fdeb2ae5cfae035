//! Identifiers shared by the ring, the vnodes and the coordinators

use serde::{Deserialize, Serialize};
use std::fmt;

/// Ring partition index
pub type PartitionId = u64;

/// Node name as it appears in the ring
pub type NodeId = String;

/// Correlates replica replies with the request that caused them
pub type RequestId = uuid::Uuid;

/// Opaque handle to a group member or channel subscriber.
///
/// The registry never looks inside it: it is only compared, hashed for
/// routing and serialized.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MemberId(String);

impl MemberId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for MemberId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for MemberId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl fmt::Display for MemberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One replica of a ring partition, hosted by a node
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct VnodeId {
    pub partition: PartitionId,
    pub node: NodeId,
}

impl VnodeId {
    pub fn new(partition: PartitionId, node: impl Into<NodeId>) -> Self {
        Self {
            partition,
            node: node.into(),
        }
    }
}

impl fmt::Display for VnodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.partition, self.node)
    }
}
