//! Domain Ports - Core trait definitions for the provisioner
//!
//! These traits define the boundaries between the controller logic and the
//! storage cluster. Adapters implement these traits to provide concrete
//! functionality (librados/libcephfs bindings, or the in-memory cluster).

use crate::error::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

// =============================================================================
// Storage Kinds
// =============================================================================

/// Kind of backing store a handle belongs to
///
/// Pool IDs are only meaningful within one kind: the same number names an RBD
/// pool for block volumes and a filesystem ID for CephFS volumes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StorageKind {
    #[serde(rename = "RBD")]
    Rbd,
    #[serde(rename = "CephFS")]
    CephFs,
}

impl std::fmt::Display for StorageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StorageKind::Rbd => write!(f, "RBD"),
            StorageKind::CephFs => write!(f, "CephFS"),
        }
    }
}

// =============================================================================
// Metadata Store Port
// =============================================================================

/// Location of omap-bearing objects: a pool and rados namespace in one cluster
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PoolRef {
    pub cluster_id: String,
    pub pool: String,
    pub namespace: String,
}

impl PoolRef {
    pub fn new(
        cluster_id: impl Into<String>,
        pool: impl Into<String>,
        namespace: impl Into<String>,
    ) -> Self {
        Self {
            cluster_id: cluster_id.into(),
            pool: pool.into(),
            namespace: namespace.into(),
        }
    }
}

impl std::fmt::Display for PoolRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.namespace.is_empty() {
            write!(f, "{}/{}", self.cluster_id, self.pool)
        } else {
            write!(f, "{}/{}/{}", self.cluster_id, self.pool, self.namespace)
        }
    }
}

/// Port for the storage cluster's key/value metadata facility (rados omaps)
#[async_trait]
pub trait MetadataStore: Send + Sync {
    /// Resolve a pool name to its numeric ID
    ///
    /// Fails with `PoolNotFound` when the pool does not exist.
    async fn pool_id(&self, cluster_id: &str, pool: &str) -> Result<i64>;

    /// Resolve a numeric pool ID to its name
    ///
    /// Fails with `PoolNotFound` when no pool carries the ID.
    async fn pool_name(&self, cluster_id: &str, pool_id: i64) -> Result<String>;

    /// Create an empty object, failing with `ObjectExists` if present
    async fn create_object(&self, pool: &PoolRef, object: &str) -> Result<()>;

    /// Remove an object and all of its keys, failing with `ObjectNotFound` if absent
    async fn remove_object(&self, pool: &PoolRef, object: &str) -> Result<()>;

    /// Set keys on an object, creating the object if needed
    async fn set_omap(
        &self,
        pool: &PoolRef,
        object: &str,
        pairs: &BTreeMap<String, String>,
    ) -> Result<()>;

    /// Read one key; a missing key or object fails with `KeyNotFound`
    async fn get_omap_value(&self, pool: &PoolRef, object: &str, key: &str) -> Result<String>;

    /// Read a set of keys; absent keys are omitted, a missing object fails
    /// with `KeyNotFound`
    async fn get_omap_values(
        &self,
        pool: &PoolRef,
        object: &str,
        keys: &[&str],
    ) -> Result<BTreeMap<String, String>>;

    /// Remove a key; removing a missing key succeeds, a missing object fails
    /// with `ObjectNotFound`
    async fn remove_omap_key(&self, pool: &PoolRef, object: &str, key: &str) -> Result<()>;
}

// =============================================================================
// Subvolume Backend Port
// =============================================================================

/// A filesystem and subvolume group in one cluster
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FsRef {
    pub cluster_id: String,
    pub fs_name: String,
    pub subvolume_group: String,
}

impl FsRef {
    pub fn new(
        cluster_id: impl Into<String>,
        fs_name: impl Into<String>,
        subvolume_group: impl Into<String>,
    ) -> Self {
        Self {
            cluster_id: cluster_id.into(),
            fs_name: fs_name.into(),
            subvolume_group: subvolume_group.into(),
        }
    }
}

/// Subvolume details reported by the cluster
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubvolumeInfo {
    /// Quota in bytes
    pub bytes_quota: u64,
    /// Absolute path inside the filesystem
    pub path: String,
}

/// Snapshot details reported by the cluster
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotInfo {
    pub created_at: DateTime<Utc>,
    pub protected: bool,
}

/// Progress of an asynchronous subvolume clone
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CloneState {
    Pending,
    InProgress,
    Complete,
    Failed,
}

impl std::fmt::Display for CloneState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CloneState::Pending => write!(f, "pending"),
            CloneState::InProgress => write!(f, "in-progress"),
            CloneState::Complete => write!(f, "complete"),
            CloneState::Failed => write!(f, "failed"),
        }
    }
}

impl std::str::FromStr for CloneState {
    type Err = crate::error::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(CloneState::Pending),
            "in-progress" => Ok(CloneState::InProgress),
            "complete" => Ok(CloneState::Complete),
            "failed" => Ok(CloneState::Failed),
            other => Err(crate::error::Error::Internal(format!(
                "unknown clone state {:?}",
                other
            ))),
        }
    }
}

/// Port for the backing-object primitives (CephFS subvolumes and snapshots)
#[async_trait]
pub trait SubvolumeBackend: Send + Sync {
    /// Name of the metadata pool backing a filesystem; `PoolNotFound` if the
    /// filesystem is unknown
    async fn metadata_pool(&self, cluster_id: &str, fs_name: &str) -> Result<String>;

    /// Create a subvolume with the given quota
    async fn create_subvolume(
        &self,
        fs: &FsRef,
        name: &str,
        size_bytes: u64,
        data_pool: Option<&str>,
    ) -> Result<()>;

    /// Inspect a subvolume; `VolumeNotFound` if absent, `InvalidCommand` if the
    /// cluster cannot report subvolume info
    async fn subvolume_info(&self, fs: &FsRef, name: &str) -> Result<SubvolumeInfo>;

    /// Set the subvolume quota
    async fn resize_subvolume(&self, fs: &FsRef, name: &str, size_bytes: u64) -> Result<()>;

    /// Remove a subvolume; `VolumeNotFound` if absent
    async fn purge_subvolume(&self, fs: &FsRef, name: &str) -> Result<()>;

    /// Snapshot a subvolume
    async fn create_snapshot(&self, fs: &FsRef, subvolume: &str, snapshot: &str) -> Result<()>;

    /// Inspect a snapshot; `SnapNotFound` if absent
    async fn snapshot_info(&self, fs: &FsRef, subvolume: &str, snapshot: &str)
        -> Result<SnapshotInfo>;

    /// Protect a snapshot so it may be cloned from
    async fn protect_snapshot(&self, fs: &FsRef, subvolume: &str, snapshot: &str) -> Result<()>;

    /// Undo [`SubvolumeBackend::protect_snapshot`]
    async fn unprotect_snapshot(&self, fs: &FsRef, subvolume: &str, snapshot: &str)
        -> Result<()>;

    /// Delete a snapshot; `SnapNotFound` if absent
    async fn delete_snapshot(&self, fs: &FsRef, subvolume: &str, snapshot: &str) -> Result<()>;

    /// Start cloning a snapshot into a new subvolume
    async fn clone_snapshot(
        &self,
        fs: &FsRef,
        subvolume: &str,
        snapshot: &str,
        clone: &str,
        data_pool: Option<&str>,
    ) -> Result<()>;

    /// Poll the state of a clone; `VolumeNotFound` if no such clone
    async fn clone_state(&self, fs: &FsRef, clone: &str) -> Result<CloneState>;
}

// =============================================================================
// Type Aliases for Arc'd Traits
// =============================================================================

pub type MetadataStoreRef = Arc<dyn MetadataStore>;
pub type SubvolumeBackendRef = Arc<dyn SubvolumeBackend>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_storage_kind_display() {
        assert_eq!(format!("{}", StorageKind::Rbd), "RBD");
        assert_eq!(format!("{}", StorageKind::CephFs), "CephFS");
    }

    #[test]
    fn test_clone_state_parse() {
        assert_eq!("in-progress".parse::<CloneState>().unwrap(), CloneState::InProgress);
        assert_eq!("complete".parse::<CloneState>().unwrap(), CloneState::Complete);
        assert!("done".parse::<CloneState>().is_err());
        assert_eq!(CloneState::Pending.to_string(), "pending");
    }

    #[test]
    fn test_pool_ref_display() {
        assert_eq!(PoolRef::new("ceph", "meta", "csi").to_string(), "ceph/meta/csi");
        assert_eq!(PoolRef::new("ceph", "meta", "").to_string(), "ceph/meta");
    }
}
