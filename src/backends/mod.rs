//! Storage cluster adapters
//!
//! Implementations of the ports in [`crate::domain::ports`].

pub mod memory;

pub use memory::{InMemoryCluster, Op};
