//! Commands understood by a vnode and the replies it sends back

use crate::common::{MemberId, RequestId, VnodeId};
use crate::crdt::OrSet;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

/// Operation applied by one partition replica
#[derive(Debug, Clone)]
pub enum Command {
    Join { group: String, member: MemberId },
    Leave { group: String, member: MemberId },
    /// Read the subscriber set of a channel
    Publish { channel: String },
    /// Overwrite a group with an already merged value
    Repair { group: String, set: OrSet<MemberId> },
    /// Hand a published message to a locally subscribed member
    Accept { member: MemberId, message: Bytes },
}

impl Command {
    pub fn name(&self) -> &'static str {
        match self {
            Command::Join { .. } => "join",
            Command::Leave { .. } => "leave",
            Command::Publish { .. } => "publish",
            Command::Repair { .. } => "repair",
            Command::Accept { .. } => "accept",
        }
    }
}

/// A command in flight, tagged with the request that issued it
#[derive(Debug)]
pub struct Envelope {
    pub request_id: RequestId,
    pub command: Command,
    /// Where to send the post-operation set; `None` for fire-and-forget
    pub reply_to: Option<mpsc::UnboundedSender<ReplicaReply>>,
}

impl Envelope {
    pub fn new(
        request_id: RequestId,
        command: Command,
        reply_to: mpsc::UnboundedSender<ReplicaReply>,
    ) -> Self {
        Self {
            request_id,
            command,
            reply_to: Some(reply_to),
        }
    }

    pub fn fire_and_forget(request_id: RequestId, command: Command) -> Self {
        Self {
            request_id,
            command,
            reply_to: None,
        }
    }
}

/// A replica's view of one group after applying a command
#[derive(Debug, Clone)]
pub struct ReplicaReply {
    pub request_id: RequestId,
    pub replica: VnodeId,
    pub group: String,
    pub set: OrSet<MemberId>,
}

/// One (group, raw set) pair streamed from a handoff source to its target
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandoffItem {
    pub group: String,
    pub set: OrSet<MemberId>,
}

impl HandoffItem {
    pub fn encode(&self) -> crate::Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn decode(bytes: &[u8]) -> crate::Result<Self> {
        Ok(bincode::deserialize(bytes)?)
    }
}
