//! Vnode task
//!
//! Each vnode runs as one tokio task draining an unbounded mailbox. All
//! messages against a partition replica are processed one at a time, in
//! arrival order. A handoff fold runs inside a single message, so writes
//! queue up behind it and every fold sees a coherent partition. Writes
//! that land between a fold and the finish bump the store version, and
//! the finish is refused until they have been shipped too.

use crate::common::{MemberId, Result, VnodeId};
use crate::crdt::OrSet;
use crate::vnode::command::{Command, Envelope, HandoffItem, ReplicaReply};
use crate::vnode::mailbox::Mailbox;
use crate::vnode::store::{Lifecycle, PartitionStore};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};

/// Messages accepted by a vnode task
#[derive(Debug)]
pub enum VnodeMessage {
    Command(Envelope),
    BeginHandoff {
        reply: oneshot::Sender<Result<()>>,
    },
    /// Every group, or only those changed after `since`
    Fold {
        since: Option<u64>,
        reply: oneshot::Sender<HandoffBatch>,
    },
    /// One bincode-encoded `HandoffItem`
    Ingest {
        bytes: Vec<u8>,
        reply: oneshot::Sender<Result<()>>,
    },
    CancelHandoff,
    FinishHandoff {
        version: u64,
        reply: oneshot::Sender<Result<bool>>,
    },
    IsEmpty {
        reply: oneshot::Sender<bool>,
    },
    Status {
        reply: oneshot::Sender<Lifecycle>,
    },
    Get {
        group: String,
        reply: oneshot::Sender<Option<OrSet<MemberId>>>,
    },
}

/// Items folded out of a handing-off vnode and the store version they
/// reflect
#[derive(Debug)]
pub struct HandoffBatch {
    pub items: Vec<HandoffItem>,
    pub version: u64,
}

/// Cloneable address of a running vnode
#[derive(Debug, Clone)]
pub struct VnodeHandle {
    id: VnodeId,
    tx: mpsc::UnboundedSender<VnodeMessage>,
}

impl VnodeHandle {
    pub fn id(&self) -> &VnodeId {
        &self.id
    }

    pub fn is_alive(&self) -> bool {
        !self.tx.is_closed()
    }

    /// Queue a command. Fails only if the task is gone.
    pub fn send(&self, envelope: Envelope) -> Result<()> {
        self.tx
            .send(VnodeMessage::Command(envelope))
            .map_err(|_| crate::Error::ReplicaUnreachable(self.id.to_string()))
    }

    async fn call<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> VnodeMessage) -> Result<T> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(make(reply))
            .map_err(|_| crate::Error::ReplicaUnreachable(self.id.to_string()))?;
        rx.await
            .map_err(|_| crate::Error::ReplicaUnreachable(self.id.to_string()))
    }

    pub async fn begin_handoff(&self) -> Result<()> {
        self.call(|reply| VnodeMessage::BeginHandoff { reply }).await?
    }

    /// Fold every group, or with `since` only those changed after it.
    pub async fn fold(&self, since: Option<u64>) -> Result<HandoffBatch> {
        self.call(|reply| VnodeMessage::Fold { since, reply }).await
    }

    pub async fn ingest(&self, item: &HandoffItem) -> Result<()> {
        let bytes = item.encode()?;
        self.call(|reply| VnodeMessage::Ingest { bytes, reply }).await?
    }

    pub fn cancel_handoff(&self) {
        let _ = self.tx.send(VnodeMessage::CancelHandoff);
    }

    /// Vacate the source if it is still at `version`. `Ok(false)` means
    /// writes arrived after the fold that produced `version`.
    pub async fn finish_handoff(&self, version: u64) -> Result<bool> {
        self.call(|reply| VnodeMessage::FinishHandoff { version, reply })
            .await?
    }

    pub async fn is_empty(&self) -> Result<bool> {
        self.call(|reply| VnodeMessage::IsEmpty { reply }).await
    }

    pub async fn lifecycle(&self) -> Result<Lifecycle> {
        self.call(|reply| VnodeMessage::Status { reply }).await
    }

    /// Raw set held for `group`, if any
    pub async fn get(&self, group: &str) -> Result<Option<OrSet<MemberId>>> {
        let group = group.to_string();
        self.call(|reply| VnodeMessage::Get { group, reply }).await
    }
}

struct Vnode {
    id: VnodeId,
    store: PartitionStore,
    mailbox: Arc<dyn Mailbox>,
    snapshot_path: Option<PathBuf>,
}

/// Start a vnode task around `store`.
pub fn spawn_vnode(
    id: VnodeId,
    store: PartitionStore,
    mailbox: Arc<dyn Mailbox>,
    snapshot_path: Option<PathBuf>,
) -> VnodeHandle {
    let (tx, rx) = mpsc::unbounded_channel();
    let vnode = Vnode {
        id: id.clone(),
        store,
        mailbox,
        snapshot_path,
    };
    tokio::spawn(vnode.run(rx));
    VnodeHandle { id, tx }
}

impl Vnode {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<VnodeMessage>) {
        tracing::debug!(vnode = %self.id, "Vnode started");
        while let Some(message) = rx.recv().await {
            self.handle(message);
        }
        tracing::debug!(vnode = %self.id, "Vnode stopped");
    }

    fn handle(&mut self, message: VnodeMessage) {
        match message {
            VnodeMessage::Command(envelope) => {
                let request_id = envelope.request_id;
                let name = envelope.command.name();
                if let Err(e) = self.handle_command(envelope) {
                    // Dropped without reply; the coordinator treats this
                    // replica as unreachable.
                    tracing::warn!(
                        vnode = %self.id,
                        request_id = %request_id,
                        command = name,
                        error = %e,
                        "Command not serviced"
                    );
                }
            }
            VnodeMessage::BeginHandoff { reply } => {
                let result = self.store.begin_handoff();
                if result.is_ok() {
                    tracing::info!(vnode = %self.id, groups = self.store.len(), "Handoff started");
                }
                let _ = reply.send(result);
            }
            VnodeMessage::Fold { since, reply } => {
                let collect = |mut acc: Vec<HandoffItem>, group: &str, set: &OrSet<MemberId>| {
                    acc.push(HandoffItem {
                        group: group.to_string(),
                        set: set.clone(),
                    });
                    acc
                };
                let items = match since {
                    Some(since) => self.store.fold_changed(since, collect, Vec::new()),
                    None => self.store.fold(collect, Vec::new()),
                };
                let _ = reply.send(HandoffBatch {
                    items,
                    version: self.store.version(),
                });
            }
            VnodeMessage::Ingest { bytes, reply } => {
                let result = HandoffItem::decode(&bytes)
                    .and_then(|item| self.store.ingest_handoff_item(&item.group, &item.set));
                if result.is_ok() {
                    self.persist();
                }
                let _ = reply.send(result);
            }
            VnodeMessage::CancelHandoff => {
                self.store.cancel_handoff();
                tracing::info!(vnode = %self.id, "Handoff cancelled");
            }
            VnodeMessage::FinishHandoff { version, reply } => {
                let result = self.store.finish_handoff(version);
                match result {
                    Ok(true) => {
                        self.remove_snapshot();
                        tracing::info!(vnode = %self.id, "Partition vacated");
                    }
                    Ok(false) => {
                        tracing::debug!(
                            vnode = %self.id,
                            folded = version,
                            current = self.store.version(),
                            "Writes since fold, handoff continues"
                        );
                    }
                    Err(_) => {}
                }
                let _ = reply.send(result);
            }
            VnodeMessage::IsEmpty { reply } => {
                let _ = reply.send(self.store.is_empty());
            }
            VnodeMessage::Status { reply } => {
                let _ = reply.send(self.store.lifecycle());
            }
            VnodeMessage::Get { group, reply } => {
                let _ = reply.send(self.store.get(&group).cloned());
            }
        }
    }

    fn handle_command(&mut self, envelope: Envelope) -> Result<()> {
        let Envelope {
            request_id,
            command,
            reply_to,
        } = envelope;

        let (group, set) = match command {
            Command::Join { group, member } => {
                let set = self.store.apply_join(&group, member)?;
                self.persist();
                (group, set)
            }
            Command::Leave { group, member } => {
                let set = self.store.apply_leave(&group, &member)?;
                self.persist();
                (group, set)
            }
            Command::Publish { channel } => {
                let set = self.store.subscribers(&channel)?;
                (channel, set)
            }
            Command::Repair { group, set } => {
                tracing::debug!(vnode = %self.id, group = %group, "Applying repair");
                self.store.apply_repair(&group, set)?;
                self.persist();
                return Ok(());
            }
            Command::Accept { member, message } => {
                if !self.mailbox.deliver(&member, message) {
                    tracing::debug!(vnode = %self.id, member = %member, "No local inbox, message dropped");
                }
                return Ok(());
            }
        };

        if let Some(reply_to) = reply_to {
            let reply = ReplicaReply {
                request_id,
                replica: self.id.clone(),
                group,
                set,
            };
            if reply_to.send(reply).is_err() {
                tracing::debug!(vnode = %self.id, request_id = %request_id, "Coordinator gone, reply dropped");
            }
        }
        Ok(())
    }

    fn persist(&self) {
        let Some(path) = &self.snapshot_path else {
            return;
        };
        if let Err(e) = self.store.save_snapshot(path) {
            tracing::warn!(vnode = %self.id, error = %e, "Snapshot write failed");
        }
    }

    fn remove_snapshot(&self) {
        let Some(path) = &self.snapshot_path else {
            return;
        };
        if let Err(e) = std::fs::remove_file(path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(vnode = %self.id, error = %e, "Snapshot removal failed");
            }
        }
    }
}
