//! Configuration for minipg nodes

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Global configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Node ID (unique identifier)
    pub node_id: String,

    /// Bind address for the HTTP API
    pub bind_addr: SocketAddr,

    /// Logging level
    pub log_level: String,

    /// Ring and quorum settings
    pub cluster: ClusterConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            node_id: "node-1".to_string(),
            bind_addr: default_bind_addr(),
            log_level: default_log_level(),
            cluster: ClusterConfig::default(),
        }
    }
}

fn default_bind_addr() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 7000))
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Ring, replication and quorum configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// Node names sharing the ring
    #[serde(default = "default_nodes")]
    pub nodes: Vec<String>,

    /// Number of ring partitions
    #[serde(default = "default_num_partitions")]
    pub num_partitions: u64,

    /// Replication factor (N)
    #[serde(default = "default_n_val")]
    pub n_val: usize,

    /// Replies required before answering the caller (R)
    #[serde(default = "default_r_val")]
    pub r_val: usize,

    /// Deadline for reaching quorum
    #[serde(default = "default_request_timeout")]
    pub request_timeout_ms: u64,

    /// Extra wait for straggling replicas once quorum is reached
    #[serde(default = "default_remainder_timeout")]
    pub remainder_timeout_ms: u64,

    /// Snapshot directory for vnode state (in-memory only if unset)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_dir: Option<PathBuf>,

    /// Largest accepted publish payload
    #[serde(default = "default_max_message_bytes")]
    pub max_message_bytes: usize,
}

fn default_nodes() -> Vec<String> {
    vec!["node-1".to_string()]
}
fn default_num_partitions() -> u64 {
    64
}
fn default_n_val() -> usize {
    3
}
fn default_r_val() -> usize {
    2
}
fn default_request_timeout() -> u64 {
    5_000
}
fn default_remainder_timeout() -> u64 {
    1_000
}
fn default_max_message_bytes() -> usize {
    1024 * 1024
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            nodes: default_nodes(),
            num_partitions: default_num_partitions(),
            n_val: default_n_val(),
            r_val: default_r_val(),
            request_timeout_ms: default_request_timeout(),
            remainder_timeout_ms: default_remainder_timeout(),
            data_dir: None,
            max_message_bytes: default_max_message_bytes(),
        }
    }
}

impl ClusterConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn remainder_timeout(&self) -> Duration {
        Duration::from_millis(self.remainder_timeout_ms)
    }

    /// Check the quorum arithmetic and ring sizing
    pub fn validate(&self) -> crate::Result<()> {
        if self.nodes.is_empty() {
            return Err(crate::Error::InvalidConfig("no nodes configured".into()));
        }
        if self.num_partitions == 0 {
            return Err(crate::Error::InvalidConfig(
                "num_partitions must be positive".into(),
            ));
        }
        if self.n_val == 0 || self.r_val == 0 {
            return Err(crate::Error::InvalidConfig(
                "n_val and r_val must be positive".into(),
            ));
        }
        if self.r_val > self.n_val {
            return Err(crate::Error::InvalidConfig(format!(
                "r_val ({}) exceeds n_val ({})",
                self.r_val, self.n_val
            )));
        }
        if self.n_val as u64 > self.num_partitions {
            return Err(crate::Error::InvalidConfig(format!(
                "n_val ({}) exceeds num_partitions ({})",
                self.n_val, self.num_partitions
            )));
        }
        if self.request_timeout_ms == 0 || self.remainder_timeout_ms == 0 {
            return Err(crate::Error::InvalidConfig(
                "timeouts must be positive".into(),
            ));
        }
        Ok(())
    }
}

impl Config {
    /// Load configuration from `minipg.toml` (optional) and `MINIPG__*`
    /// environment variables, falling back to defaults.
    pub fn load() -> crate::Result<Self> {
        Self::load_from("minipg")
    }

    pub fn load_from(file_stem: &str) -> crate::Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::with_name(file_stem).required(false))
            .add_source(
                config::Environment::with_prefix("MINIPG")
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("cluster.nodes")
                    .try_parsing(true),
            )
            .build()
            .map_err(|e| crate::Error::InvalidConfig(e.to_string()))?;

        let config: Config = settings
            .try_deserialize()
            .map_err(|e| crate::Error::InvalidConfig(e.to_string()))?;
        config.cluster.validate()?;
        Ok(config)
    }
}
