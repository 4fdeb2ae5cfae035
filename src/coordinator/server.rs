//! Registry node server

use crate::common::{Config, HashRing, Result};
use crate::coordinator::http::{create_router, RegistryState};
use crate::coordinator::request::QuorumConfig;
use crate::coordinator::supervisor::Supervisor;
use crate::coordinator::transport::LocalCluster;
use crate::vnode::{InMemoryLookup, LocalMailboxes};
use std::sync::Arc;

pub struct RegistryNode {
    config: Config,
}

impl RegistryNode {
    pub fn new(config: Config) -> Self {
        Self { config }
    }

    /// Build the ring, the local cluster and the supervisor. Vnode
    /// snapshots found in `data_dir` are restored before any request runs.
    pub fn build_state(&self) -> Result<RegistryState> {
        let cluster_config = &self.config.cluster;
        cluster_config.validate()?;

        let ring = Arc::new(HashRing::new(
            cluster_config.num_partitions,
            cluster_config.nodes.clone(),
        ));

        if let Some(dir) = &cluster_config.data_dir {
            std::fs::create_dir_all(dir)?;
        }
        let cluster = Arc::new(LocalCluster::new(
            Arc::new(InMemoryLookup::new()),
            Arc::new(LocalMailboxes::new()),
            cluster_config.data_dir.clone(),
        ));
        let restored = cluster.restore()?;
        if restored > 0 {
            tracing::info!("Restored {} vnodes from snapshots", restored);
        }

        let supervisor = Arc::new(Supervisor::new(
            ring.clone(),
            cluster.clone(),
            QuorumConfig::from(cluster_config),
        ));

        Ok(RegistryState {
            node_id: self.config.node_id.clone(),
            ring,
            cluster,
            supervisor,
        })
    }

    pub async fn serve(self) -> Result<()> {
        let cluster_config = &self.config.cluster;
        tracing::info!(
            "Starting registry node: {} (minipg {})",
            self.config.node_id,
            crate::BUILD_INFO
        );
        tracing::info!("  HTTP API: {}", self.config.bind_addr);
        tracing::info!("  Ring nodes: {}", cluster_config.nodes.join(","));
        tracing::info!("  Partitions: {}", cluster_config.num_partitions);
        tracing::info!("  N/R: {}/{}", cluster_config.n_val, cluster_config.r_val);
        tracing::info!("  Request timeout: {:?}", cluster_config.request_timeout());
        match &cluster_config.data_dir {
            Some(dir) => tracing::info!("  Data dir: {}", dir.display()),
            None => tracing::info!("  Data dir: none (in-memory)"),
        }

        let state = self.build_state()?;
        let router = create_router(state, cluster_config.max_message_bytes);

        let listener = tokio::net::TcpListener::bind(self.config.bind_addr).await?;
        tracing::info!("✓ Registry node ready");

        axum::serve(listener, router)
            .with_graceful_shutdown(shutdown_signal())
            .await?;

        tracing::info!("Registry node stopped");
        Ok(())
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::MemberId;
    use crate::coordinator::request::Outcome;
    use tempfile::TempDir;

    fn config(dir: &TempDir) -> Config {
        let mut config = Config::default();
        config.cluster.nodes = vec!["n1".into(), "n2".into(), "n3".into()];
        config.cluster.num_partitions = 8;
        config.cluster.data_dir = Some(dir.path().join("vnodes"));
        config
    }

    #[tokio::test]
    async fn test_state_survives_restart() {
        let dir = TempDir::new().unwrap();

        let state = RegistryNode::new(config(&dir)).build_state().unwrap();
        let mut pending = state.supervisor.join("lobby", MemberId::from("alice"));
        pending.wait().await.unwrap();
        pending.finished().await.unwrap();
        drop(state);

        let state = RegistryNode::new(config(&dir)).build_state().unwrap();
        assert!(!state.cluster.running().is_empty());
        let mut pending = state.supervisor.join("lobby", MemberId::from("bob"));
        let outcome = pending.wait().await.unwrap();
        assert_eq!(
            outcome,
            Outcome::Members([MemberId::from("alice"), MemberId::from("bob")].into())
        );
    }

    #[test]
    fn test_invalid_quorum_rejected() {
        let dir = TempDir::new().unwrap();
        let mut config = config(&dir);
        config.cluster.r_val = 5;
        assert!(RegistryNode::new(config).build_state().is_err());
    }
}
