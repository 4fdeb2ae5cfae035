//! Command dispatch to partition replicas
//!
//! `Dispatcher` is the seam between coordinators and vnodes. `LocalCluster`
//! hosts every vnode of the ring in this process, starting them lazily the
//! first time a command targets them.

use crate::common::{NodeId, PartitionId, Result, VnodeId};
use crate::vnode::{
    spawn_vnode, Envelope, FastLookup, InMemoryLookup, LocalMailboxes, PartitionStore,
    VnodeHandle,
};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};

/// At-most-once delivery of a command to one replica.
///
/// An `Ok` only means the command was handed to the transport; the
/// coordinator learns about processing from the reply.
pub trait Dispatcher: Send + Sync {
    fn send(&self, target: &VnodeId, envelope: Envelope) -> Result<()>;
}

/// All vnodes of the ring, hosted in one process
pub struct LocalCluster {
    vnodes: Mutex<HashMap<VnodeId, VnodeHandle>>,
    isolated: RwLock<HashSet<NodeId>>,
    lookup: Arc<dyn FastLookup>,
    mailboxes: Arc<LocalMailboxes>,
    data_dir: Option<PathBuf>,
}

impl LocalCluster {
    pub fn new(
        lookup: Arc<dyn FastLookup>,
        mailboxes: Arc<LocalMailboxes>,
        data_dir: Option<PathBuf>,
    ) -> Self {
        Self {
            vnodes: Mutex::new(HashMap::new()),
            isolated: RwLock::new(HashSet::new()),
            lookup,
            mailboxes,
            data_dir,
        }
    }

    /// Cluster with an in-memory lookup and no persistence
    pub fn in_memory() -> Self {
        Self::new(
            Arc::new(InMemoryLookup::new()),
            Arc::new(LocalMailboxes::new()),
            None,
        )
    }

    pub fn lookup(&self) -> &Arc<dyn FastLookup> {
        &self.lookup
    }

    pub fn mailboxes(&self) -> &Arc<LocalMailboxes> {
        &self.mailboxes
    }

    fn snapshot_path(&self, id: &VnodeId) -> Option<PathBuf> {
        self.data_dir
            .as_ref()
            .map(|dir| dir.join(format!("{}@{}.snap", id.partition, id.node)))
    }

    fn start(&self, id: &VnodeId) -> VnodeHandle {
        let snapshot_path = self.snapshot_path(id);
        let store = match snapshot_path.as_deref().filter(|p| p.exists()) {
            Some(path) => {
                match PartitionStore::load_snapshot(path, id.partition, self.lookup.clone()) {
                    Ok(store) => {
                        tracing::info!(vnode = %id, groups = store.len(), "Vnode restored from snapshot");
                        store
                    }
                    Err(e) => {
                        tracing::warn!(vnode = %id, error = %e, "Ignoring unreadable snapshot");
                        PartitionStore::new(id.partition, self.lookup.clone())
                    }
                }
            }
            None => PartitionStore::new(id.partition, self.lookup.clone()),
        };
        spawn_vnode(id.clone(), store, self.mailboxes.clone(), snapshot_path)
    }

    /// Handle to a vnode, starting it if needed.
    ///
    /// A vnode whose task died is started again from its snapshot.
    pub fn vnode(&self, id: &VnodeId) -> VnodeHandle {
        let mut vnodes = self.vnodes.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(handle) = vnodes.get(id) {
            if handle.is_alive() {
                return handle.clone();
            }
            tracing::warn!(vnode = %id, "Vnode task gone, restarting");
        }
        let handle = self.start(id);
        vnodes.insert(id.clone(), handle.clone());
        handle
    }

    /// Forget a vnode. Its task exits once in-flight handles are dropped.
    pub fn retire(&self, id: &VnodeId) -> Option<VnodeHandle> {
        let mut vnodes = self.vnodes.lock().unwrap_or_else(|e| e.into_inner());
        vnodes.remove(id)
    }

    /// Vnodes started so far, ordered by id
    pub fn running(&self) -> Vec<VnodeHandle> {
        let vnodes = self.vnodes.lock().unwrap_or_else(|e| e.into_inner());
        let mut handles: Vec<VnodeHandle> = vnodes.values().cloned().collect();
        handles.sort_by(|a, b| a.id().cmp(b.id()));
        handles
    }

    /// Make every vnode hosted by `node` unreachable
    pub fn isolate(&self, node: &str) {
        let mut isolated = self.isolated.write().unwrap_or_else(|e| e.into_inner());
        isolated.insert(node.to_string());
        tracing::info!(node = %node, "Node isolated");
    }

    pub fn heal(&self, node: &str) {
        let mut isolated = self.isolated.write().unwrap_or_else(|e| e.into_inner());
        isolated.remove(node);
        tracing::info!(node = %node, "Node healed");
    }

    fn is_isolated(&self, node: &str) -> bool {
        let isolated = self.isolated.read().unwrap_or_else(|e| e.into_inner());
        isolated.contains(node)
    }

    /// Start every vnode that has a snapshot under the data directory.
    pub fn restore(&self) -> Result<usize> {
        let Some(dir) = &self.data_dir else {
            return Ok(0);
        };
        if !dir.exists() {
            std::fs::create_dir_all(dir)?;
            return Ok(0);
        }

        let mut restored = 0;
        for entry in std::fs::read_dir(dir)? {
            let path = entry?.path();
            if let Some(id) = parse_snapshot_name(&path) {
                self.vnode(&id);
                restored += 1;
            }
        }
        Ok(restored)
    }
}

fn parse_snapshot_name(path: &Path) -> Option<VnodeId> {
    if path.extension()?.to_str()? != "snap" {
        return None;
    }
    let stem = path.file_stem()?.to_str()?;
    let (partition, node) = stem.split_once('@')?;
    let partition: PartitionId = partition.parse().ok()?;
    Some(VnodeId::new(partition, node))
}

impl Dispatcher for LocalCluster {
    fn send(&self, target: &VnodeId, envelope: Envelope) -> Result<()> {
        if self.is_isolated(&target.node) {
            return Err(crate::Error::ReplicaUnreachable(target.to_string()));
        }
        self.vnode(target).send(envelope)
    }
}
