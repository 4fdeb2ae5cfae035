//! Partition replicas (vnodes)
//!
//! A vnode owns the membership state of one ring partition:
//! - OR-set per group, mutated only by the owning task
//! - Write-through mirror into a fast lookup
//! - Handoff fold/ingest during rebalancing
//! - Optional snapshot persistence
//! - Local inbox delivery for published messages

pub mod command;
pub mod lookup;
pub mod mailbox;
pub mod server;
pub mod store;

pub use command::{Command, Envelope, HandoffItem, ReplicaReply};
pub use lookup::{FastLookup, InMemoryLookup, NoopLookup};
pub use mailbox::{LocalMailboxes, Mailbox};
pub use server::{spawn_vnode, HandoffBatch, VnodeHandle};
pub use store::{Lifecycle, PartitionStore};
