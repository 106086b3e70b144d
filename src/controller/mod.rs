//! Provisioning Controller
//!
//! - [`server`]: the operation orchestrator and volume calls
//! - `clone`: clone-from-snapshot and clone-from-volume
//! - `snapshot`: snapshot calls
//! - [`rollback`]: compensating actions for partially completed calls
//! - [`metrics`]: per-operation counters and latencies
//! - [`options`] and [`types`]: configuration and request/response shapes

mod clone;
pub mod metrics;
pub mod options;
pub mod rollback;
pub mod server;
mod snapshot;
pub mod types;

pub use metrics::ControllerMetrics;
pub use options::{round_off_bytes, ControllerConfig, VolumeOptions, DEFAULT_VOLUME_SIZE, GIB, MIB};
pub use rollback::Rollback;
pub use server::{ControllerServer, CONTEXT_SUBVOLUME_NAME};
pub use types::*;
