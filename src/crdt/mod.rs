//! Replicated data types used by the registry

pub mod orset;

pub use orset::{OrSet, Tag};
