//! # minipg
//!
//! A replicated process-group and pub/sub registry:
//! - Group membership stored as OR-set CRDTs, so concurrent joins and
//!   leaves converge without coordination
//! - Keys placed on a ring of partitions, each replicated on N vnodes
//! - One quorum coordinator per request, answering after R replies
//! - Read repair of divergent replicas once every replica has answered
//! - Partition handoff when ring ownership changes
//!
//! ## Architecture
//!
//! ```text
//!         HTTP API (join / leave / publish / inbox)
//!                       │
//!               ┌───────▼────────┐
//!               │   Supervisor   │  one task per request
//!               └───────┬────────┘
//!                       │ RequestCoordinator (N/R quorum)
//!        ┌──────────────┼──────────────┐
//!        │              │              │
//!  ┌─────▼─────┐  ┌─────▼─────┐  ┌─────▼─────┐
//!  │ vnode p@a │  │ vnode p+1 │  │ vnode p+2 │
//!  │  OR-sets  │  │  OR-sets  │  │  OR-sets  │
//!  └─────┬─────┘  └─────┬─────┘  └─────┬─────┘
//!        └──────── fast lookup ────────┘
//! ```
//!
//! ## Usage
//!
//! ### Start a node
//! ```bash
//! minipg-node serve \
//!   --id node-1 \
//!   --bind 0.0.0.0:7000 \
//!   --nodes node-1,node-2,node-3 \
//!   --n 3 --r 2 \
//!   --data-dir ./minipg-data
//! ```
//!
//! ### Use the CLI
//! ```bash
//! minipg join lobby alice
//! minipg members lobby
//! minipg publish lobby "hello"
//! minipg leave lobby alice
//! ```

#![allow(clippy::result_large_err)]

pub mod common;
pub mod coordinator;
pub mod crdt;
pub mod ops;
pub mod vnode;

// Re-export commonly used types
pub use common::{Config, Error, MemberId, Result};
pub use coordinator::{RegistryNode, Supervisor};
pub use crdt::OrSet;

/// Current version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Build info
pub const BUILD_INFO: &str = concat!(env!("CARGO_PKG_VERSION"), " (", env!("CARGO_PKG_NAME"), ")");
