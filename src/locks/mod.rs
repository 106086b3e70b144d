//! In-memory operation locks
//!
//! Volumes and snapshots each get their own [`LockRegistry`], keyed by
//! request name and by handle.

mod registry;

pub use registry::{LockGuard, LockRegistry};
