//! Cluster/Pool Mapping Resolver
//!
//! After a failover, handles minted on the peer cluster still carry the peer's
//! clusterID and pool ID. The mapping table translates them to the IDs valid
//! on this cluster. It is consulted only after a direct journal lookup misses.
//!
//! The table is owned by whoever performs the failover and may be rewritten at
//! any time, so a file source is re-read on every resolve.

use crate::domain::ports::StorageKind;
use crate::error::{Error, Result};
use crate::journal::ObjectIdentifier;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use tracing::{debug, info};

// =============================================================================
// Mapping Entries
// =============================================================================

/// One cluster pair and its per-kind pool ID translations
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterMapping {
    #[serde(rename = "localClusterID")]
    pub local_cluster_id: String,
    #[serde(rename = "remoteClusterID")]
    pub remote_cluster_id: String,
    #[serde(rename = "RBD", default)]
    pub rbd: Vec<BTreeMap<String, String>>,
    #[serde(rename = "CephFS", default)]
    pub cephfs: Vec<BTreeMap<String, String>>,
}

impl ClusterMapping {
    /// Pool ID table for a storage kind
    pub fn pool_table(&self, kind: StorageKind) -> &[BTreeMap<String, String>] {
        match kind {
            StorageKind::Rbd => &self.rbd,
            StorageKind::CephFs => &self.cephfs,
        }
    }

    /// Translate a pool ID, if this entry maps it
    pub fn map_pool(&self, kind: StorageKind, pool_id: i64) -> Result<Option<i64>> {
        let key = pool_id.to_string();
        let mapped = self
            .pool_table(kind)
            .iter()
            .find_map(|table| table.get(&key));

        match mapped {
            None => Ok(None),
            Some(value) => value.trim().parse().map(Some).map_err(|_| {
                Error::Configuration(format!(
                    "{} pool mapping {} -> {:?} for cluster {} is not a pool ID",
                    kind, pool_id, value, self.local_cluster_id
                ))
            }),
        }
    }
}

/// Where the mapping table comes from
#[derive(Debug, Clone)]
pub enum MappingSource {
    /// JSON file, re-read on every resolve; a missing file means no mappings
    File(PathBuf),
    /// Fixed table
    Static(Vec<ClusterMapping>),
}

impl Default for MappingSource {
    fn default() -> Self {
        MappingSource::Static(Vec::new())
    }
}

// =============================================================================
// Resolver
// =============================================================================

/// Read-only translator from foreign handles to local ones
#[derive(Debug, Clone, Default)]
pub struct MappingResolver {
    source: MappingSource,
}

impl MappingResolver {
    pub fn new(source: MappingSource) -> Self {
        Self { source }
    }

    /// Load the current table
    pub async fn load(&self) -> Result<Vec<ClusterMapping>> {
        match &self.source {
            MappingSource::Static(mappings) => Ok(mappings.clone()),
            MappingSource::File(path) => match tokio::fs::read(path).await {
                Ok(raw) => Ok(serde_json::from_slice(&raw)?),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    debug!("Cluster mapping file {} not present", path.display());
                    Ok(Vec::new())
                }
                Err(e) => Err(e.into()),
            },
        }
    }

    /// Translate a handle's cluster and pool
    ///
    /// Returns `None` when the table has no entry for the handle's cluster, or
    /// the entry does not map its pool.
    pub async fn resolve(
        &self,
        id: &ObjectIdentifier,
        kind: StorageKind,
    ) -> Result<Option<ObjectIdentifier>> {
        let mappings = self.load().await?;

        let Some(entry) = mappings
            .iter()
            .find(|m| m.local_cluster_id == id.cluster_id())
        else {
            debug!("No cluster mapping for cluster {}", id.cluster_id());
            return Ok(None);
        };

        let Some(pool_id) = entry.map_pool(kind, id.pool_id())? else {
            debug!(
                "Cluster {} is mapped to {} but {} pool {} is not",
                entry.local_cluster_id,
                entry.remote_cluster_id,
                kind,
                id.pool_id()
            );
            return Ok(None);
        };

        let mapped = id.relocate(entry.remote_cluster_id.clone(), pool_id)?;
        info!(
            "Mapped {} {}/{} to {}/{}",
            kind,
            id.cluster_id(),
            id.pool_id(),
            mapped.cluster_id(),
            mapped.pool_id()
        );
        Ok(Some(mapped))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use std::io::Write;
    use uuid::Uuid;

    const SAMPLE: &str = r#"[
        {
            "localClusterID": "A",
            "remoteClusterID": "B",
            "RBD": [{"2": "3"}],
            "CephFS": [{"7": "9"}, {"8": "10"}]
        }
    ]"#;

    fn handle(cluster: &str, pool: i64) -> ObjectIdentifier {
        ObjectIdentifier::new(cluster, pool, Uuid::new_v4()).unwrap()
    }

    fn sample_resolver() -> MappingResolver {
        let mappings: Vec<ClusterMapping> = serde_json::from_str(SAMPLE).unwrap();
        MappingResolver::new(MappingSource::Static(mappings))
    }

    #[tokio::test]
    async fn test_resolve_rbd_mapping() {
        let resolver = sample_resolver();
        let id = handle("A", 2);

        let mapped = resolver.resolve(&id, StorageKind::Rbd).await.unwrap().unwrap();
        assert_eq!(mapped.cluster_id(), "B");
        assert_eq!(mapped.pool_id(), 3);
        assert_eq!(mapped.object_uuid(), id.object_uuid());
    }

    #[tokio::test]
    async fn test_pool_tables_are_per_kind() {
        let resolver = sample_resolver();

        assert!(resolver
            .resolve(&handle("A", 2), StorageKind::CephFs)
            .await
            .unwrap()
            .is_none());
        let mapped = resolver
            .resolve(&handle("A", 8), StorageKind::CephFs)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(mapped.pool_id(), 10);
    }

    #[tokio::test]
    async fn test_unmapped_cluster() {
        let resolver = sample_resolver();
        assert!(resolver
            .resolve(&handle("C", 2), StorageKind::Rbd)
            .await
            .unwrap()
            .is_none());
        // Mapping is keyed by the handle's cluster only
        assert!(resolver
            .resolve(&handle("B", 3), StorageKind::Rbd)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_file_source_is_reread() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"[]").unwrap();
        let resolver = MappingResolver::new(MappingSource::File(file.path().to_path_buf()));

        assert!(resolver
            .resolve(&handle("A", 2), StorageKind::Rbd)
            .await
            .unwrap()
            .is_none());

        std::fs::write(file.path(), SAMPLE).unwrap();
        assert!(resolver
            .resolve(&handle("A", 2), StorageKind::Rbd)
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn test_missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let resolver =
            MappingResolver::new(MappingSource::File(dir.path().join("cluster-mapping.json")));
        assert!(resolver.load().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_malformed_pool_id() {
        let mappings = vec![ClusterMapping {
            local_cluster_id: "A".into(),
            remote_cluster_id: "B".into(),
            rbd: vec![BTreeMap::from([("2".to_string(), "three".to_string())])],
            cephfs: vec![],
        }];
        let resolver = MappingResolver::new(MappingSource::Static(mappings));
        assert_matches!(
            resolver.resolve(&handle("A", 2), StorageKind::Rbd).await,
            Err(Error::Configuration(_))
        );
    }
}
