//! Local delivery of published messages to subscribed members

use crate::common::MemberId;
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::Mutex;
use tokio::sync::mpsc;

/// Sink for messages accepted by a vnode on behalf of a member
pub trait Mailbox: Send + Sync {
    /// Returns false when nobody is listening for `member`.
    fn deliver(&self, member: &MemberId, message: Bytes) -> bool;
}

/// Per-member unbounded inboxes living in this process
#[derive(Debug, Default)]
pub struct LocalMailboxes {
    inboxes: Mutex<HashMap<MemberId, Vec<mpsc::UnboundedSender<Bytes>>>>,
}

impl LocalMailboxes {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open an inbox for `member`. Several receivers may share a member.
    pub fn subscribe(&self, member: &MemberId) -> mpsc::UnboundedReceiver<Bytes> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut inboxes = self.inboxes.lock().unwrap_or_else(|e| e.into_inner());
        inboxes.entry(member.clone()).or_default().push(tx);
        rx
    }

    pub fn subscriber_count(&self, member: &MemberId) -> usize {
        let inboxes = self.inboxes.lock().unwrap_or_else(|e| e.into_inner());
        inboxes
            .get(member)
            .map(|senders| senders.iter().filter(|s| !s.is_closed()).count())
            .unwrap_or(0)
    }
}

impl Mailbox for LocalMailboxes {
    fn deliver(&self, member: &MemberId, message: Bytes) -> bool {
        let mut inboxes = self.inboxes.lock().unwrap_or_else(|e| e.into_inner());
        let Some(senders) = inboxes.get_mut(member) else {
            return false;
        };

        senders.retain(|tx| tx.send(message.clone()).is_ok());
        let delivered = !senders.is_empty();
        if !delivered {
            inboxes.remove(member);
        }
        delivered
    }
}
