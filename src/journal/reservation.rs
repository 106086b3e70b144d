//! Reservation Journal
//!
//! Durable two-way index between caller-chosen request names and generated
//! backing objects, kept as omap records inside the storage cluster:
//!
//! - the *directory* object (`csi.volumes.<instance>`) maps
//!   `csi.volume.<request name>` to a UUID (forward entry)
//! - one object per UUID (`csi.volume.<uuid>`) holds the full attribute set
//!   (reverse entry)
//!
//! `reserve` writes the reverse entry before the forward entry. A crash
//! between the two leaves an orphaned reverse entry that is unreachable by
//! name, never a forward pointer to a missing record.

use super::identifier::ObjectIdentifier;
use crate::domain::ports::{MetadataStoreRef, PoolRef};
use crate::error::{Error, Result};
use std::collections::BTreeMap;
use tracing::{debug, info, warn};
use uuid::Uuid;

// =============================================================================
// Reverse Entry Keys
// =============================================================================

const KEY_BACKING_NAME: &str = "csi.imagename";
const KEY_FS_NAME: &str = "csi.fsname";
const KEY_SUBVOLUME_GROUP: &str = "csi.subvolumegroup";
const KEY_DATA_POOL: &str = "csi.datapool";
const KEY_SIZE: &str = "csi.size";
const KEY_OWNER: &str = "csi.volume.owner";
const KEY_SOURCE_KIND: &str = "csi.source.kind";
const KEY_SOURCE_SUBVOLUME: &str = "csi.source.subvolume";
const KEY_SOURCE_SNAPSHOT: &str = "csi.source.snapshot";

/// Attempts at finding an unused UUID before giving up
const MAX_UUID_ATTEMPTS: usize = 5;

// =============================================================================
// Journal Configuration
// =============================================================================

/// Object and key naming for one kind of journaled entity
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JournalConfig {
    /// Directory object holding the forward entries
    pub directory: String,
    /// Prefix of forward keys inside the directory
    pub name_key_prefix: String,
    /// Prefix of the per-UUID reverse objects
    pub uuid_object_prefix: String,
    /// Reverse key storing the request name
    pub name_key: String,
    /// Prefix of generated backing object names
    pub naming_prefix: String,
    /// Rados namespace the journal objects live in
    pub namespace: String,
}

impl JournalConfig {
    /// Naming for volume reservations
    pub fn volumes(instance_id: &str, naming_prefix: &str, namespace: &str) -> Self {
        Self {
            directory: format!("csi.volumes.{}", instance_id),
            name_key_prefix: "csi.volume.".to_string(),
            uuid_object_prefix: "csi.volume.".to_string(),
            name_key: "csi.volname".to_string(),
            naming_prefix: naming_prefix.to_string(),
            namespace: namespace.to_string(),
        }
    }

    /// Naming for snapshot reservations
    pub fn snapshots(instance_id: &str, naming_prefix: &str, namespace: &str) -> Self {
        Self {
            directory: format!("csi.snaps.{}", instance_id),
            name_key_prefix: "csi.snap.".to_string(),
            uuid_object_prefix: "csi.snap.".to_string(),
            name_key: "csi.snapname".to_string(),
            naming_prefix: naming_prefix.to_string(),
            namespace: namespace.to_string(),
        }
    }
}

// =============================================================================
// Reservation Records
// =============================================================================

/// Where a backing object came from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Lineage {
    /// Snapshot of, or temporary-snapshot clone of, a subvolume
    Volume { subvolume: String },
    /// Clone of an existing snapshot
    Snapshot { subvolume: String, snapshot: String },
}

impl Lineage {
    /// Subvolume the lineage starts from
    pub fn subvolume(&self) -> &str {
        match self {
            Lineage::Volume { subvolume } | Lineage::Snapshot { subvolume, .. } => subvolume,
        }
    }
}

/// Attribute set stored in the reverse entry
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ReservationAttrs {
    pub request_name: String,
    pub fs_name: String,
    pub subvolume_group: String,
    pub data_pool: Option<String>,
    pub size_bytes: u64,
    pub source: Option<Lineage>,
    pub owner: Option<String>,
}

/// A complete journal record, resolved to its handle
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reservation {
    pub id: ObjectIdentifier,
    /// Encoded form of `id`, handed to the caller
    pub handle: String,
    /// Name of the backing subvolume or snapshot
    pub backing_name: String,
    /// Pool and namespace holding the journal records
    pub pool: PoolRef,
    pub attrs: ReservationAttrs,
}

// =============================================================================
// Journal
// =============================================================================

/// Reservation journal for one kind of entity
pub struct Journal {
    config: JournalConfig,
    store: MetadataStoreRef,
}

impl Journal {
    pub fn new(config: JournalConfig, store: MetadataStoreRef) -> Self {
        Self { config, store }
    }

    /// Pool reference for the journal inside a given pool
    pub fn pool_ref(&self, cluster_id: &str, pool: &str) -> PoolRef {
        PoolRef::new(cluster_id, pool, self.config.namespace.clone())
    }

    fn forward_key(&self, request_name: &str) -> String {
        format!("{}{}", self.config.name_key_prefix, request_name)
    }

    fn reverse_object(&self, uuid: &Uuid) -> String {
        format!("{}{}", self.config.uuid_object_prefix, uuid)
    }

    fn backing_name(&self, uuid: &Uuid) -> String {
        format!("{}{}", self.config.naming_prefix, uuid)
    }

    /// Find an existing reservation by request name
    ///
    /// A forward entry whose reverse record is gone is removed and reported
    /// as not reserved. When `source` is given, a reservation made from a
    /// different source fails with `AlreadyExists`.
    pub async fn check_reservation(
        &self,
        pool: &PoolRef,
        request_name: &str,
        source: Option<&Lineage>,
    ) -> Result<Option<Reservation>> {
        let forward_key = self.forward_key(request_name);
        let uuid = match self
            .store
            .get_omap_value(pool, &self.config.directory, &forward_key)
            .await
        {
            Ok(value) => parse_uuid(&value)?,
            Err(Error::KeyNotFound { .. }) => return Ok(None),
            Err(e) => return Err(e),
        };

        let attrs = match self.read_attrs(pool, &uuid).await {
            Ok(attrs) => attrs,
            Err(Error::KeyNotFound { .. }) => {
                warn!(
                    "Removing stale journal entry {} -> {} in {}",
                    request_name, uuid, pool
                );
                self.remove_forward(pool, request_name, &uuid).await?;
                return Ok(None);
            }
            Err(e) => return Err(e),
        };

        if attrs.request_name != request_name {
            return Err(Error::Internal(format!(
                "internal state inconsistent: {} points to {} owned by request {}",
                request_name, uuid, attrs.request_name
            )));
        }

        if let Some(source) = source {
            if attrs.source.as_ref() != Some(source) {
                return Err(Error::AlreadyExists(format!(
                    "{} is already reserved for source {:?}, not {:?}",
                    request_name, attrs.source, source
                )));
            }
        }

        let pool_id = self.store.pool_id(&pool.cluster_id, &pool.pool).await?;
        let reservation = self.assemble(pool.clone(), pool_id, uuid, attrs)?;
        debug!(
            "Found reservation {} -> {}",
            request_name, reservation.backing_name
        );
        Ok(Some(reservation))
    }

    /// Reserve a backing object name for a request
    ///
    /// Replaying a request that is already reserved returns the existing
    /// reservation unchanged.
    pub async fn reserve(&self, pool: &PoolRef, attrs: ReservationAttrs) -> Result<Reservation> {
        if let Some(existing) = self
            .check_reservation(pool, &attrs.request_name, attrs.source.as_ref())
            .await?
        {
            return Ok(existing);
        }

        let pool_id = self.store.pool_id(&pool.cluster_id, &pool.pool).await?;
        let uuid = self.create_reverse_object(pool).await?;
        let reverse_object = self.reverse_object(&uuid);

        // Reverse entry first
        let pairs = self.attrs_to_omap(&uuid, &attrs);
        if let Err(e) = self.store.set_omap(pool, &reverse_object, &pairs).await {
            self.discard_reverse(pool, &reverse_object).await;
            return Err(e);
        }

        // Forward entry second
        let mut forward = BTreeMap::new();
        forward.insert(self.forward_key(&attrs.request_name), uuid.to_string());
        if let Err(e) = self
            .store
            .set_omap(pool, &self.config.directory, &forward)
            .await
        {
            self.discard_reverse(pool, &reverse_object).await;
            return Err(e);
        }

        let reservation = self.assemble(pool.clone(), pool_id, uuid, attrs)?;
        info!(
            "Reserved {} for request {} in {}",
            reservation.backing_name, reservation.attrs.request_name, pool
        );
        Ok(reservation)
    }

    /// Remove a reservation: reverse entry first, then the forward entry
    ///
    /// The request name is taken from the reverse entry when it still exists,
    /// otherwise `request_name` is used. Missing records are not an error.
    pub async fn unreserve(&self, pool: &PoolRef, uuid: &Uuid, request_name: &str) -> Result<()> {
        let reverse_object = self.reverse_object(uuid);

        let saved_name = match self
            .store
            .get_omap_value(pool, &reverse_object, &self.config.name_key)
            .await
        {
            Ok(name) => name,
            Err(Error::KeyNotFound { .. }) => request_name.to_string(),
            Err(e) => return Err(e),
        };

        match self.store.remove_object(pool, &reverse_object).await {
            Ok(()) | Err(Error::ObjectNotFound { .. }) => {}
            Err(e) => return Err(e),
        }

        self.remove_forward(pool, &saved_name, uuid).await?;

        info!("Released reservation {} for request {}", uuid, saved_name);
        Ok(())
    }

    /// Read a reservation through its handle
    ///
    /// Fails with `PoolNotFound` if the embedded pool is gone and with
    /// `KeyNotFound` if the pool exists but the reverse entry does not.
    pub async fn lookup(&self, id: &ObjectIdentifier) -> Result<Reservation> {
        let pool_name = self.store.pool_name(id.cluster_id(), id.pool_id()).await?;
        let pool = self.pool_ref(id.cluster_id(), &pool_name);
        let uuid = id.object_uuid();
        let attrs = self.read_attrs(&pool, &uuid).await?;

        self.assemble(pool, id.pool_id(), uuid, attrs)
    }

    // =========================================================================
    // Internals
    // =========================================================================

    async fn create_reverse_object(&self, pool: &PoolRef) -> Result<Uuid> {
        for _ in 0..MAX_UUID_ATTEMPTS {
            let uuid = Uuid::new_v4();
            match self
                .store
                .create_object(pool, &self.reverse_object(&uuid))
                .await
            {
                Ok(()) => return Ok(uuid),
                Err(Error::ObjectExists { object }) => {
                    debug!("UUID object {} already exists, generating a new UUID", object);
                }
                Err(e) => return Err(e),
            }
        }

        Err(Error::Internal(format!(
            "could not find an unused UUID in {} after {} attempts",
            pool, MAX_UUID_ATTEMPTS
        )))
    }

    async fn discard_reverse(&self, pool: &PoolRef, reverse_object: &str) {
        match self.store.remove_object(pool, reverse_object).await {
            Ok(()) | Err(Error::ObjectNotFound { .. }) => {}
            Err(e) => warn!(
                "Failed to remove partial reservation {} in {}: {}",
                reverse_object, pool, e
            ),
        }
    }

    /// Remove the forward entry if it still points at `uuid`
    async fn remove_forward(&self, pool: &PoolRef, request_name: &str, uuid: &Uuid) -> Result<()> {
        let forward_key = self.forward_key(request_name);
        match self
            .store
            .get_omap_value(pool, &self.config.directory, &forward_key)
            .await
        {
            Ok(value) if value != uuid.to_string() => {
                debug!(
                    "Forward entry for {} now points to {}, leaving it",
                    request_name, value
                );
                return Ok(());
            }
            Ok(_) => {}
            Err(Error::KeyNotFound { .. }) => return Ok(()),
            Err(e) => return Err(e),
        }

        match self
            .store
            .remove_omap_key(pool, &self.config.directory, &forward_key)
            .await
        {
            Ok(()) | Err(Error::ObjectNotFound { .. }) => Ok(()),
            Err(e) => Err(e),
        }
    }

    fn attrs_to_omap(&self, uuid: &Uuid, attrs: &ReservationAttrs) -> BTreeMap<String, String> {
        let mut pairs = BTreeMap::new();
        pairs.insert(self.config.name_key.clone(), attrs.request_name.clone());
        pairs.insert(KEY_BACKING_NAME.to_string(), self.backing_name(uuid));
        pairs.insert(KEY_FS_NAME.to_string(), attrs.fs_name.clone());
        pairs.insert(KEY_SUBVOLUME_GROUP.to_string(), attrs.subvolume_group.clone());
        pairs.insert(KEY_SIZE.to_string(), attrs.size_bytes.to_string());
        if let Some(pool) = &attrs.data_pool {
            pairs.insert(KEY_DATA_POOL.to_string(), pool.clone());
        }
        if let Some(owner) = &attrs.owner {
            pairs.insert(KEY_OWNER.to_string(), owner.clone());
        }
        match &attrs.source {
            Some(Lineage::Volume { subvolume }) => {
                pairs.insert(KEY_SOURCE_KIND.to_string(), "volume".to_string());
                pairs.insert(KEY_SOURCE_SUBVOLUME.to_string(), subvolume.clone());
            }
            Some(Lineage::Snapshot {
                subvolume,
                snapshot,
            }) => {
                pairs.insert(KEY_SOURCE_KIND.to_string(), "snapshot".to_string());
                pairs.insert(KEY_SOURCE_SUBVOLUME.to_string(), subvolume.clone());
                pairs.insert(KEY_SOURCE_SNAPSHOT.to_string(), snapshot.clone());
            }
            None => {}
        }
        pairs
    }

    async fn read_attrs(&self, pool: &PoolRef, uuid: &Uuid) -> Result<ReservationAttrs> {
        let object = self.reverse_object(uuid);
        let keys = [
            self.config.name_key.as_str(),
            KEY_FS_NAME,
            KEY_SUBVOLUME_GROUP,
            KEY_DATA_POOL,
            KEY_SIZE,
            KEY_OWNER,
            KEY_SOURCE_KIND,
            KEY_SOURCE_SUBVOLUME,
            KEY_SOURCE_SNAPSHOT,
        ];
        let mut values = self.store.get_omap_values(pool, &object, &keys).await?;

        // An object without a request name is a reservation that never committed
        let request_name =
            values
                .remove(&self.config.name_key)
                .ok_or_else(|| Error::KeyNotFound {
                    object: object.clone(),
                    key: self.config.name_key.clone(),
                })?;

        let size_bytes = match values.remove(KEY_SIZE) {
            Some(size) => size.parse().map_err(|_| {
                Error::Internal(format!("invalid size {:?} stored in {}", size, object))
            })?,
            None => 0,
        };

        let source = match values.remove(KEY_SOURCE_KIND).as_deref() {
            None => None,
            Some("volume") => Some(Lineage::Volume {
                subvolume: values.remove(KEY_SOURCE_SUBVOLUME).unwrap_or_default(),
            }),
            Some("snapshot") => Some(Lineage::Snapshot {
                subvolume: values.remove(KEY_SOURCE_SUBVOLUME).unwrap_or_default(),
                snapshot: values.remove(KEY_SOURCE_SNAPSHOT).unwrap_or_default(),
            }),
            Some(other) => {
                return Err(Error::Internal(format!(
                    "unknown source kind {:?} stored in {}",
                    other, object
                )))
            }
        };

        Ok(ReservationAttrs {
            request_name,
            fs_name: values.remove(KEY_FS_NAME).unwrap_or_default(),
            subvolume_group: values.remove(KEY_SUBVOLUME_GROUP).unwrap_or_default(),
            data_pool: values.remove(KEY_DATA_POOL),
            size_bytes,
            source,
            owner: values.remove(KEY_OWNER),
        })
    }

    fn assemble(
        &self,
        pool: PoolRef,
        pool_id: i64,
        uuid: Uuid,
        attrs: ReservationAttrs,
    ) -> Result<Reservation> {
        let id = ObjectIdentifier::new(pool.cluster_id.clone(), pool_id, uuid)?;
        Ok(Reservation {
            handle: id.encode(),
            id,
            backing_name: self.backing_name(&uuid),
            pool,
            attrs,
        })
    }
}

fn parse_uuid(value: &str) -> Result<Uuid> {
    Uuid::parse_str(value)
        .map_err(|e| Error::Internal(format!("journal holds malformed UUID {:?}: {}", value, e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::memory::InMemoryCluster;
    use crate::domain::ports::MetadataStore;
    use assert_matches::assert_matches;
    use std::sync::Arc;

    fn setup() -> (Arc<InMemoryCluster>, Journal, PoolRef) {
        let cluster = InMemoryCluster::new();
        cluster.add_pool("ceph", "cephfs.meta", 2);
        let journal = Journal::new(
            JournalConfig::volumes("default", "csi-vol-", "csi"),
            cluster.clone(),
        );
        let pool = journal.pool_ref("ceph", "cephfs.meta");
        (cluster, journal, pool)
    }

    fn attrs(name: &str) -> ReservationAttrs {
        ReservationAttrs {
            request_name: name.to_string(),
            fs_name: "cephfs".into(),
            subvolume_group: "csi".into(),
            size_bytes: 1 << 30,
            ..Default::default()
        }
    }

    fn volume(subvolume: &str) -> Lineage {
        Lineage::Volume {
            subvolume: subvolume.to_string(),
        }
    }

    #[tokio::test]
    async fn test_reserve_is_idempotent() {
        let (cluster, journal, pool) = setup();

        let first = journal.reserve(&pool, attrs("pvc-1")).await.unwrap();
        let second = journal.reserve(&pool, attrs("pvc-1")).await.unwrap();

        assert_eq!(first.handle, second.handle);
        assert_eq!(first.backing_name, second.backing_name);
        assert_eq!(first.id.pool_id(), 2);
        assert_eq!(cluster.object_count(&pool), 2);
    }

    #[tokio::test]
    async fn test_lookup_round_trip() {
        let (_cluster, journal, pool) = setup();

        let mut wanted = attrs("pvc-2");
        wanted.data_pool = Some("cephfs.data".into());
        wanted.source = Some(Lineage::Snapshot {
            subvolume: "csi-vol-src".into(),
            snapshot: "csi-snap-src".into(),
        });
        let reserved = journal.reserve(&pool, wanted.clone()).await.unwrap();

        let found = journal.lookup(&reserved.id).await.unwrap();
        assert_eq!(found.attrs, wanted);
        assert_eq!(found.handle, reserved.handle);
        assert!(found.backing_name.starts_with("csi-vol-"));
    }

    #[tokio::test]
    async fn test_lookup_classifies_misses() {
        let (cluster, journal, pool) = setup();
        let reserved = journal.reserve(&pool, attrs("pvc-3")).await.unwrap();

        let unknown = reserved.id.relocate("ceph", 99).unwrap();
        assert_matches!(journal.lookup(&unknown).await, Err(Error::PoolNotFound { .. }));

        journal
            .unreserve(&pool, &reserved.id.object_uuid(), "pvc-3")
            .await
            .unwrap();
        assert_matches!(journal.lookup(&reserved.id).await, Err(Error::KeyNotFound { .. }));

        cluster.remove_pool("ceph", "cephfs.meta");
        assert_matches!(journal.lookup(&reserved.id).await, Err(Error::PoolNotFound { .. }));
    }

    #[tokio::test]
    async fn test_unreserve_twice_is_noop() {
        let (cluster, journal, pool) = setup();
        let reserved = journal.reserve(&pool, attrs("pvc-4")).await.unwrap();
        let uuid = reserved.id.object_uuid();

        journal.unreserve(&pool, &uuid, "pvc-4").await.unwrap();
        journal.unreserve(&pool, &uuid, "pvc-4").await.unwrap();

        assert!(journal.check_reservation(&pool, "pvc-4", None).await.unwrap().is_none());
        assert_eq!(cluster.object_count(&pool), 1);
    }

    #[tokio::test]
    async fn test_stale_forward_entry_is_dropped() {
        let (cluster, journal, pool) = setup();
        let reserved = journal.reserve(&pool, attrs("pvc-5")).await.unwrap();

        let reverse = format!("csi.volume.{}", reserved.id.object_uuid());
        cluster.remove_object(&pool, &reverse).await.unwrap();

        assert!(journal.check_reservation(&pool, "pvc-5", None).await.unwrap().is_none());
        let again = journal.reserve(&pool, attrs("pvc-5")).await.unwrap();
        assert_ne!(again.handle, reserved.handle);
    }

    #[tokio::test]
    async fn test_forward_write_failure_rolls_back_reverse() {
        let (cluster, journal, pool) = setup();
        cluster.fail_omap_writes_to("csi.volumes.default");

        assert_matches!(journal.reserve(&pool, attrs("pvc-6")).await, Err(Error::Internal(_)));
        assert_eq!(cluster.object_count(&pool), 0);
    }

    #[tokio::test]
    async fn test_parent_mismatch() {
        let (_cluster, journal, pool) = setup();
        let mut snap = attrs("snap-1");
        snap.source = Some(Lineage::Volume {
            subvolume: "csi-vol-a".into(),
        });
        journal.reserve(&pool, snap).await.unwrap();

        assert_matches!(
            journal.check_reservation(&pool, "snap-1", Some(&volume("csi-vol-b"))).await,
            Err(Error::AlreadyExists(_))
        );
        assert!(journal
            .check_reservation(&pool, "snap-1", Some(&volume("csi-vol-a")))
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn test_snapshot_lineage_must_match_exactly() {
        let (_cluster, journal, pool) = setup();
        let mut clone = attrs("pvc-clone");
        clone.source = Some(Lineage::Snapshot {
            subvolume: "csi-vol-a".into(),
            snapshot: "csi-snap-1".into(),
        });
        journal.reserve(&pool, clone).await.unwrap();

        let other_snapshot = Lineage::Snapshot {
            subvolume: "csi-vol-a".into(),
            snapshot: "csi-snap-2".into(),
        };
        assert_matches!(
            journal.check_reservation(&pool, "pvc-clone", Some(&other_snapshot)).await,
            Err(Error::AlreadyExists(_))
        );
        assert_matches!(
            journal.check_reservation(&pool, "pvc-clone", Some(&volume("csi-vol-a"))).await,
            Err(Error::AlreadyExists(_))
        );

        let same = Lineage::Snapshot {
            subvolume: "csi-vol-a".into(),
            snapshot: "csi-snap-1".into(),
        };
        assert!(journal
            .check_reservation(&pool, "pvc-clone", Some(&same))
            .await
            .unwrap()
            .is_some());
    }
}
