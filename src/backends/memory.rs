//! In-Memory Storage Cluster
//!
//! Implements both cluster ports entirely in process memory. Used for the
//! standalone binary and as the test double for the controller, so it also
//! carries failure injection, clone-state control and call counters.

use crate::domain::ports::{
    CloneState, FsRef, MetadataStore, PoolRef, SnapshotInfo, SubvolumeBackend, SubvolumeInfo,
};
use crate::error::{Error, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::{DashMap, DashSet};
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

// =============================================================================
// Operations
// =============================================================================

/// Backend primitives that can be counted and made to fail
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Op {
    CreateSubvolume,
    SubvolumeInfo,
    ResizeSubvolume,
    PurgeSubvolume,
    CreateSnapshot,
    ProtectSnapshot,
    UnprotectSnapshot,
    DeleteSnapshot,
    CloneSnapshot,
}

impl std::fmt::Display for Op {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Op::CreateSubvolume => "create_subvolume",
            Op::SubvolumeInfo => "subvolume_info",
            Op::ResizeSubvolume => "resize_subvolume",
            Op::PurgeSubvolume => "purge_subvolume",
            Op::CreateSnapshot => "create_snapshot",
            Op::ProtectSnapshot => "protect_snapshot",
            Op::UnprotectSnapshot => "unprotect_snapshot",
            Op::DeleteSnapshot => "delete_snapshot",
            Op::CloneSnapshot => "clone_snapshot",
        };
        f.write_str(name)
    }
}

// =============================================================================
// Cluster State
// =============================================================================

type PoolKey = (String, String, String);
type FsKey = (String, String);
type SubvolumeKey = (String, String, String, String);

#[derive(Debug, Clone)]
struct SnapshotRecord {
    created_at: DateTime<Utc>,
    protected: bool,
}

#[derive(Debug, Clone)]
struct SubvolumeRecord {
    bytes_quota: u64,
    data_pool: Option<String>,
    /// Set for subvolumes created by `clone_snapshot`
    clone_state: Option<CloneState>,
    snapshots: BTreeMap<String, SnapshotRecord>,
}

#[derive(Debug, Default)]
struct ClusterState {
    /// cluster -> pool name -> pool ID
    pools: HashMap<String, BTreeMap<String, i64>>,
    /// (cluster, pool, namespace) -> object -> omap
    objects: HashMap<PoolKey, BTreeMap<String, BTreeMap<String, String>>>,
    /// (cluster, fs) -> metadata pool
    filesystems: HashMap<FsKey, String>,
    subvolumes: HashMap<SubvolumeKey, SubvolumeRecord>,
}

impl ClusterState {
    fn require_pool(&self, cluster_id: &str, pool: &str) -> Result<()> {
        match self.pools.get(cluster_id) {
            Some(pools) if pools.contains_key(pool) => Ok(()),
            _ => Err(Error::PoolNotFound {
                cluster_id: cluster_id.to_string(),
                pool: pool.to_string(),
            }),
        }
    }

    fn require_fs(&self, fs: &FsRef) -> Result<()> {
        if self
            .filesystems
            .contains_key(&(fs.cluster_id.clone(), fs.fs_name.clone()))
        {
            Ok(())
        } else {
            Err(Error::Internal(format!(
                "filesystem {} not found in cluster {}",
                fs.fs_name, fs.cluster_id
            )))
        }
    }

    fn subvolume(&self, fs: &FsRef, name: &str) -> Result<&SubvolumeRecord> {
        self.subvolumes
            .get(&subvolume_key(fs, name))
            .ok_or_else(|| Error::VolumeNotFound {
                volume: name.to_string(),
            })
    }

    fn subvolume_mut(&mut self, fs: &FsRef, name: &str) -> Result<&mut SubvolumeRecord> {
        self.subvolumes
            .get_mut(&subvolume_key(fs, name))
            .ok_or_else(|| Error::VolumeNotFound {
                volume: name.to_string(),
            })
    }

    fn snapshot_mut(
        &mut self,
        fs: &FsRef,
        subvolume: &str,
        snapshot: &str,
    ) -> Result<&mut SnapshotRecord> {
        self.subvolume_mut(fs, subvolume)?
            .snapshots
            .get_mut(snapshot)
            .ok_or_else(|| Error::SnapNotFound {
                snapshot: snapshot.to_string(),
            })
    }
}

fn pool_key(pool: &PoolRef) -> PoolKey {
    (
        pool.cluster_id.clone(),
        pool.pool.clone(),
        pool.namespace.clone(),
    )
}

fn subvolume_key(fs: &FsRef, name: &str) -> SubvolumeKey {
    (
        fs.cluster_id.clone(),
        fs.fs_name.clone(),
        fs.subvolume_group.clone(),
        name.to_string(),
    )
}

// =============================================================================
// In-Memory Cluster
// =============================================================================

/// A set of storage clusters held in memory
pub struct InMemoryCluster {
    state: RwLock<ClusterState>,
    /// Primitives that fail with `Internal` until cleared
    faults: DashSet<Op>,
    /// Objects whose omap writes fail with `Internal`
    omap_write_faults: DashSet<String>,
    /// Calls made per primitive
    calls: DashMap<Op, u64>,
    /// State reported by newly started clones
    new_clone_state: RwLock<CloneState>,
    /// Report `InvalidCommand` from `subvolume_info`
    info_unsupported: RwLock<bool>,
    /// Delay before `create_subvolume` takes effect
    create_latency: RwLock<Option<Duration>>,
}

impl InMemoryCluster {
    /// Create an empty cluster set
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: RwLock::new(ClusterState::default()),
            faults: DashSet::new(),
            omap_write_faults: DashSet::new(),
            calls: DashMap::new(),
            new_clone_state: RwLock::new(CloneState::Complete),
            info_unsupported: RwLock::new(false),
            create_latency: RwLock::new(None),
        })
    }

    /// Add a pool to a cluster, replacing any pool of the same name
    pub fn add_pool(&self, cluster_id: &str, pool: &str, pool_id: i64) {
        self.state
            .write()
            .pools
            .entry(cluster_id.to_string())
            .or_default()
            .insert(pool.to_string(), pool_id);
        debug!("Added pool {}/{} with ID {}", cluster_id, pool, pool_id);
    }

    /// Remove a pool and every object stored in it
    pub fn remove_pool(&self, cluster_id: &str, pool: &str) {
        let mut state = self.state.write();
        if let Some(pools) = state.pools.get_mut(cluster_id) {
            pools.remove(pool);
        }
        state
            .objects
            .retain(|(cluster, name, _), _| !(cluster == cluster_id && name == pool));
        info!("Removed pool {}/{}", cluster_id, pool);
    }

    /// Add a filesystem with its metadata pool
    pub fn add_filesystem(&self, cluster_id: &str, fs_name: &str, metadata_pool: &str, pool_id: i64) {
        self.add_pool(cluster_id, metadata_pool, pool_id);
        self.state.write().filesystems.insert(
            (cluster_id.to_string(), fs_name.to_string()),
            metadata_pool.to_string(),
        );
        info!(
            "Added filesystem {}/{} with metadata pool {}",
            cluster_id, fs_name, metadata_pool
        );
    }

    // =========================================================================
    // Fault Injection
    // =========================================================================

    /// Make a primitive fail until [`InMemoryCluster::clear_faults`]
    pub fn fail_operation(&self, op: Op) {
        self.faults.insert(op);
    }

    /// Make omap writes to `object` fail; the object is not created
    pub fn fail_omap_writes_to(&self, object: &str) {
        self.omap_write_faults.insert(object.to_string());
    }

    pub fn clear_faults(&self) {
        self.faults.clear();
        self.omap_write_faults.clear();
    }

    /// State that clones started from now on report
    pub fn set_new_clone_state(&self, state: CloneState) {
        *self.new_clone_state.write() = state;
    }

    /// Override the state of an existing clone
    pub fn set_clone_state(&self, fs: &FsRef, clone: &str, clone_state: CloneState) -> Result<()> {
        self.state.write().subvolume_mut(fs, clone)?.clone_state = Some(clone_state);
        Ok(())
    }

    /// Have `subvolume_info` report the command as unsupported
    pub fn set_subvolume_info_unsupported(&self, unsupported: bool) {
        *self.info_unsupported.write() = unsupported;
    }

    /// Hold `create_subvolume` for `latency` so callers can race it
    pub fn set_create_latency(&self, latency: Option<Duration>) {
        *self.create_latency.write() = latency;
    }

    fn enter(&self, op: Op) -> Result<()> {
        *self.calls.entry(op).or_insert(0) += 1;
        if self.faults.contains(&op) {
            return Err(Error::Internal(format!("injected {} failure", op)));
        }
        Ok(())
    }

    // =========================================================================
    // Inspection
    // =========================================================================

    /// Number of calls made to a primitive
    pub fn calls(&self, op: Op) -> u64 {
        self.calls.get(&op).map(|c| *c).unwrap_or(0)
    }

    /// Number of objects in a pool namespace
    pub fn object_count(&self, pool: &PoolRef) -> usize {
        self.state
            .read()
            .objects
            .get(&pool_key(pool))
            .map(|objects| objects.len())
            .unwrap_or(0)
    }

    pub fn subvolume_exists(&self, fs: &FsRef, name: &str) -> bool {
        self.state.read().subvolume(fs, name).is_ok()
    }

    pub fn subvolume_count(&self) -> usize {
        self.state.read().subvolumes.len()
    }

    /// Quota of a subvolume, if it exists
    pub fn subvolume_quota(&self, fs: &FsRef, name: &str) -> Option<u64> {
        self.state
            .read()
            .subvolume(fs, name)
            .ok()
            .map(|s| s.bytes_quota)
    }

    /// Data pool a subvolume was placed in
    pub fn subvolume_data_pool(&self, fs: &FsRef, name: &str) -> Option<String> {
        self.state
            .read()
            .subvolume(fs, name)
            .ok()
            .and_then(|s| s.data_pool.clone())
    }

    pub fn snapshot_exists(&self, fs: &FsRef, subvolume: &str, snapshot: &str) -> bool {
        self.state
            .read()
            .subvolume(fs, subvolume)
            .map(|s| s.snapshots.contains_key(snapshot))
            .unwrap_or(false)
    }

    /// Protection flag of a snapshot, if it exists
    pub fn snapshot_protected(&self, fs: &FsRef, subvolume: &str, snapshot: &str) -> Option<bool> {
        self.state
            .read()
            .subvolume(fs, subvolume)
            .ok()
            .and_then(|s| s.snapshots.get(snapshot).map(|snap| snap.protected))
    }
}

// =============================================================================
// Metadata Store
// =============================================================================

#[async_trait]
impl MetadataStore for InMemoryCluster {
    async fn pool_id(&self, cluster_id: &str, pool: &str) -> Result<i64> {
        self.state
            .read()
            .pools
            .get(cluster_id)
            .and_then(|pools| pools.get(pool).copied())
            .ok_or_else(|| Error::PoolNotFound {
                cluster_id: cluster_id.to_string(),
                pool: pool.to_string(),
            })
    }

    async fn pool_name(&self, cluster_id: &str, pool_id: i64) -> Result<String> {
        self.state
            .read()
            .pools
            .get(cluster_id)
            .and_then(|pools| {
                pools
                    .iter()
                    .find(|(_, id)| **id == pool_id)
                    .map(|(name, _)| name.clone())
            })
            .ok_or_else(|| Error::PoolNotFound {
                cluster_id: cluster_id.to_string(),
                pool: pool_id.to_string(),
            })
    }

    async fn create_object(&self, pool: &PoolRef, object: &str) -> Result<()> {
        let mut state = self.state.write();
        state.require_pool(&pool.cluster_id, &pool.pool)?;

        let objects = state.objects.entry(pool_key(pool)).or_default();
        if objects.contains_key(object) {
            return Err(Error::ObjectExists {
                object: object.to_string(),
            });
        }
        objects.insert(object.to_string(), BTreeMap::new());
        Ok(())
    }

    async fn remove_object(&self, pool: &PoolRef, object: &str) -> Result<()> {
        let mut state = self.state.write();
        state.require_pool(&pool.cluster_id, &pool.pool)?;

        state
            .objects
            .get_mut(&pool_key(pool))
            .and_then(|objects| objects.remove(object))
            .map(|_| ())
            .ok_or_else(|| Error::ObjectNotFound {
                object: object.to_string(),
            })
    }

    async fn set_omap(
        &self,
        pool: &PoolRef,
        object: &str,
        pairs: &BTreeMap<String, String>,
    ) -> Result<()> {
        if self.omap_write_faults.contains(object) {
            return Err(Error::Internal(format!(
                "injected omap write failure on {}",
                object
            )));
        }

        let mut state = self.state.write();
        state.require_pool(&pool.cluster_id, &pool.pool)?;

        let omap = state
            .objects
            .entry(pool_key(pool))
            .or_default()
            .entry(object.to_string())
            .or_default();
        omap.extend(pairs.iter().map(|(k, v)| (k.clone(), v.clone())));
        Ok(())
    }

    async fn get_omap_value(&self, pool: &PoolRef, object: &str, key: &str) -> Result<String> {
        let state = self.state.read();
        state.require_pool(&pool.cluster_id, &pool.pool)?;

        state
            .objects
            .get(&pool_key(pool))
            .and_then(|objects| objects.get(object))
            .and_then(|omap| omap.get(key).cloned())
            .ok_or_else(|| Error::KeyNotFound {
                object: object.to_string(),
                key: key.to_string(),
            })
    }

    async fn get_omap_values(
        &self,
        pool: &PoolRef,
        object: &str,
        keys: &[&str],
    ) -> Result<BTreeMap<String, String>> {
        let state = self.state.read();
        state.require_pool(&pool.cluster_id, &pool.pool)?;

        let omap = state
            .objects
            .get(&pool_key(pool))
            .and_then(|objects| objects.get(object))
            .ok_or_else(|| Error::KeyNotFound {
                object: object.to_string(),
                key: keys.join(","),
            })?;

        Ok(keys
            .iter()
            .filter_map(|k| omap.get(*k).map(|v| (k.to_string(), v.clone())))
            .collect())
    }

    async fn remove_omap_key(&self, pool: &PoolRef, object: &str, key: &str) -> Result<()> {
        let mut state = self.state.write();
        state.require_pool(&pool.cluster_id, &pool.pool)?;

        let omap = state
            .objects
            .get_mut(&pool_key(pool))
            .and_then(|objects| objects.get_mut(object))
            .ok_or_else(|| Error::ObjectNotFound {
                object: object.to_string(),
            })?;
        omap.remove(key);
        Ok(())
    }
}

// =============================================================================
// Subvolume Backend
// =============================================================================

#[async_trait]
impl SubvolumeBackend for InMemoryCluster {
    async fn metadata_pool(&self, cluster_id: &str, fs_name: &str) -> Result<String> {
        self.state
            .read()
            .filesystems
            .get(&(cluster_id.to_string(), fs_name.to_string()))
            .cloned()
            .ok_or_else(|| Error::PoolNotFound {
                cluster_id: cluster_id.to_string(),
                pool: format!("metadata pool of {}", fs_name),
            })
    }

    async fn create_subvolume(
        &self,
        fs: &FsRef,
        name: &str,
        size_bytes: u64,
        data_pool: Option<&str>,
    ) -> Result<()> {
        self.enter(Op::CreateSubvolume)?;
        let latency = *self.create_latency.read();
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }

        let mut state = self.state.write();
        state.require_fs(fs)?;
        if let Some(pool) = data_pool {
            state.require_pool(&fs.cluster_id, pool)?;
        }

        // Creating an existing subvolume only updates its quota
        let record = state
            .subvolumes
            .entry(subvolume_key(fs, name))
            .or_insert_with(|| SubvolumeRecord {
                bytes_quota: size_bytes,
                data_pool: data_pool.map(str::to_string),
                clone_state: None,
                snapshots: BTreeMap::new(),
            });
        record.bytes_quota = size_bytes;

        info!("Created subvolume {}/{} ({} bytes)", fs.fs_name, name, size_bytes);
        Ok(())
    }

    async fn subvolume_info(&self, fs: &FsRef, name: &str) -> Result<SubvolumeInfo> {
        self.enter(Op::SubvolumeInfo)?;
        if *self.info_unsupported.read() {
            return Err(Error::InvalidCommand("fs subvolume info".to_string()));
        }

        let state = self.state.read();
        let record = state.subvolume(fs, name)?;
        Ok(SubvolumeInfo {
            bytes_quota: record.bytes_quota,
            path: format!("/volumes/{}/{}", fs.subvolume_group, name),
        })
    }

    async fn resize_subvolume(&self, fs: &FsRef, name: &str, size_bytes: u64) -> Result<()> {
        self.enter(Op::ResizeSubvolume)?;
        self.state.write().subvolume_mut(fs, name)?.bytes_quota = size_bytes;
        debug!("Resized subvolume {}/{} to {} bytes", fs.fs_name, name, size_bytes);
        Ok(())
    }

    async fn purge_subvolume(&self, fs: &FsRef, name: &str) -> Result<()> {
        self.enter(Op::PurgeSubvolume)?;
        let mut state = self.state.write();
        let record = state.subvolume(fs, name)?;
        if !record.snapshots.is_empty() {
            return Err(Error::Internal(format!(
                "subvolume {} has {} snapshots",
                name,
                record.snapshots.len()
            )));
        }

        state.subvolumes.remove(&subvolume_key(fs, name));
        info!("Purged subvolume {}/{}", fs.fs_name, name);
        Ok(())
    }

    async fn create_snapshot(&self, fs: &FsRef, subvolume: &str, snapshot: &str) -> Result<()> {
        self.enter(Op::CreateSnapshot)?;
        let mut state = self.state.write();
        let record = state.subvolume_mut(fs, subvolume)?;
        if record.snapshots.contains_key(snapshot) {
            return Err(Error::ObjectExists {
                object: snapshot.to_string(),
            });
        }

        record.snapshots.insert(
            snapshot.to_string(),
            SnapshotRecord {
                created_at: Utc::now(),
                protected: false,
            },
        );
        info!("Created snapshot {}@{}", subvolume, snapshot);
        Ok(())
    }

    async fn snapshot_info(
        &self,
        fs: &FsRef,
        subvolume: &str,
        snapshot: &str,
    ) -> Result<SnapshotInfo> {
        let state = self.state.read();
        let record = state
            .subvolume(fs, subvolume)
            .map_err(|_| Error::SnapNotFound {
                snapshot: snapshot.to_string(),
            })?
            .snapshots
            .get(snapshot)
            .ok_or_else(|| Error::SnapNotFound {
                snapshot: snapshot.to_string(),
            })?;

        Ok(SnapshotInfo {
            created_at: record.created_at,
            protected: record.protected,
        })
    }

    async fn protect_snapshot(&self, fs: &FsRef, subvolume: &str, snapshot: &str) -> Result<()> {
        self.enter(Op::ProtectSnapshot)?;
        self.state
            .write()
            .snapshot_mut(fs, subvolume, snapshot)?
            .protected = true;
        Ok(())
    }

    async fn unprotect_snapshot(
        &self,
        fs: &FsRef,
        subvolume: &str,
        snapshot: &str,
    ) -> Result<()> {
        self.enter(Op::UnprotectSnapshot)?;
        self.state
            .write()
            .snapshot_mut(fs, subvolume, snapshot)?
            .protected = false;
        Ok(())
    }

    async fn delete_snapshot(&self, fs: &FsRef, subvolume: &str, snapshot: &str) -> Result<()> {
        self.enter(Op::DeleteSnapshot)?;
        let mut state = self.state.write();
        let record = state
            .subvolume_mut(fs, subvolume)
            .map_err(|_| Error::SnapNotFound {
                snapshot: snapshot.to_string(),
            })?;

        match record.snapshots.get(snapshot).map(|snap| snap.protected) {
            None => Err(Error::SnapNotFound {
                snapshot: snapshot.to_string(),
            }),
            Some(true) => Err(Error::Internal(format!(
                "snapshot {}@{} is protected",
                subvolume, snapshot
            ))),
            Some(false) => {
                record.snapshots.remove(snapshot);
                info!("Deleted snapshot {}@{}", subvolume, snapshot);
                Ok(())
            }
        }
    }

    async fn clone_snapshot(
        &self,
        fs: &FsRef,
        subvolume: &str,
        snapshot: &str,
        clone: &str,
        data_pool: Option<&str>,
    ) -> Result<()> {
        self.enter(Op::CloneSnapshot)?;
        let initial_state = *self.new_clone_state.read();
        let mut state = self.state.write();

        let source = state.subvolume(fs, subvolume)?;
        if !source.snapshots.contains_key(snapshot) {
            return Err(Error::SnapNotFound {
                snapshot: snapshot.to_string(),
            });
        }
        let bytes_quota = source.bytes_quota;
        let data_pool = data_pool
            .map(str::to_string)
            .or_else(|| source.data_pool.clone());

        let key = subvolume_key(fs, clone);
        if state.subvolumes.contains_key(&key) {
            return Err(Error::ObjectExists {
                object: clone.to_string(),
            });
        }
        state.subvolumes.insert(
            key,
            SubvolumeRecord {
                bytes_quota,
                data_pool,
                clone_state: Some(initial_state),
                snapshots: BTreeMap::new(),
            },
        );

        info!(
            "Started clone {}@{} -> {} ({})",
            subvolume, snapshot, clone, initial_state
        );
        Ok(())
    }

    async fn clone_state(&self, fs: &FsRef, clone: &str) -> Result<CloneState> {
        let state = self.state.read();
        // Subvolumes that were never cloned are fully materialized
        Ok(state
            .subvolume(fs, clone)?
            .clone_state
            .unwrap_or(CloneState::Complete))
    }
}
