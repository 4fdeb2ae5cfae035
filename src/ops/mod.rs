//! Ops commands for cluster management

pub mod handoff;

pub use handoff::{handoff, rebalance, HandoffReport};
