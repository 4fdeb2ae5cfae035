//! Request coordination
//!
//! - Preference-list resolution and command dispatch to vnodes
//! - One quorum state machine per client request
//! - A supervisor spawning and tracking those state machines
//! - The HTTP API and node server on top

pub mod http;
pub mod request;
pub mod server;
pub mod supervisor;
pub mod transport;

pub use request::{Operation, Outcome, Phase, QuorumConfig, Report, RequestCoordinator};
pub use server::RegistryNode;
pub use supervisor::{PendingReply, Supervisor};
pub use transport::{Dispatcher, LocalCluster};
