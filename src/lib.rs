//! CephFS Provisioner - Controller Side
//!
//! Idempotent provisioning of CephFS subvolumes and snapshots for a
//! container-storage controller. Every call may be replayed any number of
//! times; a replay returns the object an earlier attempt created instead of
//! creating another one.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │                        Controller Server                             │
//! │   CreateVolume / DeleteVolume / Expand / Validate / Snapshots        │
//! ├──────────────────┬──────────────────┬────────────────────────────────┤
//! │  Lock Registry   │ Reservation      │  Cluster Mapping Resolver      │
//! │  (name + handle) │ Journal (omaps)  │  (DR failover lookups)         │
//! ├──────────────────┴──────────────────┴────────────────────────────────┤
//! │           Metadata Store port    │    Subvolume Backend port         │
//! └──────────────────────────────────┴───────────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - [`controller`]: operation orchestrator, clone paths, rollback, metrics
//! - [`journal`]: handle codec and the reservation journal
//! - [`locks`]: non-blocking per-key operation locks
//! - [`mapping`]: disaster-recovery cluster/pool mapping
//! - [`domain`]: ports to the storage cluster
//! - [`backends`]: in-memory cluster implementing the ports
//! - [`api`]: REST operations plus health, readiness and metrics
//! - [`error`]: error types and status codes

pub mod api;
pub mod backends;
pub mod controller;
pub mod domain;
pub mod error;
pub mod journal;
pub mod locks;
pub mod mapping;

// Re-export commonly used types
pub use api::{ApiServer, ApiServerConfig};
pub use backends::InMemoryCluster;
pub use controller::{ControllerConfig, ControllerMetrics, ControllerServer, RequestContext};
pub use domain::ports::{
    CloneState, FsRef, MetadataStore, MetadataStoreRef, PoolRef, StorageKind, SubvolumeBackend,
    SubvolumeBackendRef,
};
pub use error::{Code, Error, Result};
pub use journal::{Journal, JournalConfig, ObjectIdentifier};
pub use locks::{LockGuard, LockRegistry};
pub use mapping::{ClusterMapping, MappingResolver, MappingSource};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
