//! Common utilities and types shared across minipg

pub mod config;
pub mod error;
pub mod hash;
pub mod tracing_middleware;
pub mod types;
pub mod utils;

pub use config::{ClusterConfig, Config};
pub use error::{Error, Result};
pub use hash::{hrw_hash, partition_for, HashRing, PreferenceList};
pub use types::{MemberId, NodeId, PartitionId, RequestId, VnodeId};
pub use utils::{encode_segment, parse_duration, timestamp_now};
