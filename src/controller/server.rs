//! Controller Operation Orchestrator
//!
//! Composes the lock registry, the reservation journals and the mapping
//! resolver with the cluster primitives to make every provisioning call
//! idempotent under replay:
//!
//! - Volume calls (create, delete, expand, validate) live here
//! - Clone paths and the create-replay checks live in `clone.rs`
//! - Snapshot calls live in `snapshot.rs`
//!
//! Every call takes its locks up front and fails with a retryable
//! `OperationPending` instead of waiting when another call holds them.

use super::metrics::ControllerMetrics;
use super::options::{requested_size, ControllerConfig, VolumeOptions};
use super::rollback::Rollback;
use super::types::{
    ControllerExpandVolumeRequest, ControllerExpandVolumeResponse, CreateVolumeRequest,
    DeleteVolumeRequest, RequestContext, ValidateVolumeCapabilitiesRequest,
    ValidateVolumeCapabilitiesResponse, Volume,
};
use crate::domain::ports::{FsRef, MetadataStoreRef, StorageKind, SubvolumeBackendRef};
use crate::error::{Error, Result};
use crate::journal::{Journal, JournalConfig, Lineage, ObjectIdentifier, Reservation, ReservationAttrs};
use crate::locks::LockRegistry;
use crate::mapping::MappingResolver;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, instrument, warn};

/// Volume context key naming the backing subvolume
pub const CONTEXT_SUBVOLUME_NAME: &str = "subvolumeName";

// =============================================================================
// Handle Resolution
// =============================================================================

/// Outcome of resolving a handle through the journal
#[derive(Debug)]
pub(super) enum Resolved {
    /// Journal record and backing object both exist
    Present(Reservation),
    /// Journal record exists, backing object is gone
    BackingMissing(Reservation),
}

/// Filesystem and group a reservation's backing object lives in
pub(super) fn fs_ref(reservation: &Reservation) -> FsRef {
    FsRef::new(
        reservation.id.cluster_id(),
        reservation.attrs.fs_name.as_str(),
        reservation.attrs.subvolume_group.as_str(),
    )
}

pub(super) fn ensure_active(ctx: &RequestContext) -> Result<()> {
    if ctx.is_cancelled() {
        return Err(Error::Cancelled);
    }
    Ok(())
}

// =============================================================================
// Controller Server
// =============================================================================

/// Provisioning controller for CephFS subvolumes and snapshots
pub struct ControllerServer {
    pub(super) config: ControllerConfig,
    /// Volume request names and volume handles
    pub(super) volume_locks: Arc<LockRegistry>,
    /// Snapshot request names and snapshot handles
    pub(super) snapshot_locks: Arc<LockRegistry>,
    pub(super) volume_journal: Arc<Journal>,
    pub(super) snapshot_journal: Arc<Journal>,
    pub(super) backend: SubvolumeBackendRef,
    pub(super) resolver: MappingResolver,
    pub(super) metrics: ControllerMetrics,
}

impl ControllerServer {
    /// Create a controller over a cluster's metadata store and subvolume backend
    pub fn new(
        config: ControllerConfig,
        store: MetadataStoreRef,
        backend: SubvolumeBackendRef,
    ) -> Result<Self> {
        let volume_journal = Journal::new(
            JournalConfig::volumes(
                &config.instance_id,
                &config.volume_name_prefix,
                &config.journal_namespace,
            ),
            store.clone(),
        );
        let snapshot_journal = Journal::new(
            JournalConfig::snapshots(
                &config.instance_id,
                &config.snapshot_name_prefix,
                &config.journal_namespace,
            ),
            store,
        );

        info!(
            "Controller instance {} (journal namespace {})",
            config.instance_id, config.journal_namespace
        );

        Ok(Self {
            resolver: MappingResolver::new(config.mapping.clone()),
            config,
            volume_locks: LockRegistry::new(),
            snapshot_locks: LockRegistry::new(),
            volume_journal: Arc::new(volume_journal),
            snapshot_journal: Arc::new(snapshot_journal),
            backend,
            metrics: ControllerMetrics::new()?,
        })
    }

    pub fn config(&self) -> &ControllerConfig {
        &self.config
    }

    pub fn volume_locks(&self) -> &Arc<LockRegistry> {
        &self.volume_locks
    }

    pub fn snapshot_locks(&self) -> &Arc<LockRegistry> {
        &self.snapshot_locks
    }

    pub fn metrics(&self) -> &ControllerMetrics {
        &self.metrics
    }

    // =========================================================================
    // Lookup
    // =========================================================================

    /// Journal lookup, retried once through the cluster mapping on a miss
    pub(super) async fn lookup(&self, journal: &Journal, handle: &str) -> Result<Reservation> {
        let id = ObjectIdentifier::decode(handle)?;

        match journal.lookup(&id).await {
            Err(e) if e.is_not_found() => {
                match self.resolver.resolve(&id, StorageKind::CephFs).await? {
                    Some(mapped) => {
                        debug!("Retrying lookup of {} as {}", handle, mapped);
                        journal.lookup(&mapped).await
                    }
                    None => Err(e),
                }
            }
            other => other,
        }
    }

    /// Resolve a volume handle and check its subvolume
    pub(super) async fn resolve_volume(&self, handle: &str) -> Result<Resolved> {
        let reservation = self.lookup(&self.volume_journal, handle).await?;
        let fs = fs_ref(&reservation);

        match self
            .backend
            .subvolume_info(&fs, &reservation.backing_name)
            .await
        {
            // Clusters without `subvolume info` cannot tell; assume present
            Ok(_) | Err(Error::InvalidCommand(_)) => Ok(Resolved::Present(reservation)),
            Err(Error::VolumeNotFound { .. }) => Ok(Resolved::BackingMissing(reservation)),
            Err(e) => Err(e),
        }
    }

    /// Resolve a volume handle that must exist, for calls other than delete
    pub(super) async fn existing_volume(&self, handle: &str) -> Result<Reservation> {
        match self.resolve_volume(handle).await {
            Ok(Resolved::Present(reservation)) => Ok(reservation),
            Ok(Resolved::BackingMissing(reservation)) => Err(Error::VolumeNotFound {
                volume: reservation.backing_name,
            }),
            Err(e) if e.is_not_found() => Err(Error::VolumeNotFound {
                volume: handle.to_string(),
            }),
            Err(e) => Err(e),
        }
    }

    pub(super) fn finish<T>(&self, operation: &str, started: Instant, result: Result<T>) -> Result<T> {
        self.metrics.observe(operation, &result, started.elapsed());
        match &result {
            Ok(_) => debug!("{} succeeded in {:?}", operation, started.elapsed()),
            Err(e) if e.is_retryable() => info!("{} will be retried: {}", operation, e),
            Err(e) => error!("{} failed: {}", operation, e),
        }
        result
    }

    // =========================================================================
    // CreateVolume
    // =========================================================================

    /// Create a subvolume, or return the one already created for this name
    #[instrument(skip_all, fields(request_id = %ctx.request_id, name = %req.name))]
    pub async fn create_volume(
        &self,
        ctx: &RequestContext,
        req: CreateVolumeRequest,
    ) -> Result<Volume> {
        let started = Instant::now();
        let result = self.create_volume_inner(ctx, &req).await;
        self.finish("create_volume", started, result)
    }

    async fn create_volume_inner(
        &self,
        ctx: &RequestContext,
        req: &CreateVolumeRequest,
    ) -> Result<Volume> {
        ensure_active(ctx)?;
        validate_create_volume(req)?;
        let mut opts = VolumeOptions::from_request(req, &self.config)?;

        let _name_guard = self.volume_locks.lock(&opts.request_name)?;

        let metadata_pool = self
            .backend
            .metadata_pool(&opts.cluster_id, &opts.fs_name)
            .await
            .map_err(|e| match e {
                Error::PoolNotFound { .. } => Error::InvalidArgument(format!(
                    "filesystem {} not found in cluster {}",
                    opts.fs_name, opts.cluster_id
                )),
                e => e,
            })?;
        let pool = self
            .volume_journal
            .pool_ref(&opts.cluster_id, &metadata_pool);

        let source = self
            .resolve_content_source(req.volume_content_source.as_ref(), &mut opts)
            .await?;

        if let Some(existing) = self
            .check_volume_exists(&pool, &opts, source.as_ref())
            .await?
        {
            info!(
                "Volume {} already exists as {}",
                opts.request_name, existing.backing_name
            );
            return Ok(volume_response(&existing, &opts, req));
        }

        let attrs = ReservationAttrs {
            request_name: opts.request_name.clone(),
            fs_name: opts.fs_name.clone(),
            subvolume_group: opts.subvolume_group.clone(),
            data_pool: opts.data_pool.clone(),
            size_bytes: opts.size_bytes,
            source: source.as_ref().map(|s| s.lineage()),
            owner: None,
        };
        let reservation = self.volume_journal.reserve(&pool, attrs).await?;
        let _id_guard = self.volume_locks.lock(&reservation.handle)?;

        let mut rollback = Rollback::new();
        {
            let journal = self.volume_journal.clone();
            let pool = pool.clone();
            let uuid = reservation.id.object_uuid();
            let name = opts.request_name.clone();
            rollback.push(format!("unreserve volume {}", name), async move {
                journal.unreserve(&pool, &uuid, &name).await
            });
        }

        let fs = fs_ref(&reservation);
        let created = self
            .create_backing(&fs, &reservation, &opts, source.as_ref(), &mut rollback)
            .await;
        rollback.settle(created).await?;

        info!(
            "Created subvolume {} for request {}",
            reservation.backing_name, opts.request_name
        );
        Ok(volume_response(&reservation, &opts, req))
    }

    // =========================================================================
    // DeleteVolume
    // =========================================================================

    /// Delete a volume and its reservation; deleting a missing volume succeeds
    #[instrument(skip_all, fields(request_id = %ctx.request_id, volume_id = %req.volume_id))]
    pub async fn delete_volume(&self, ctx: &RequestContext, req: DeleteVolumeRequest) -> Result<()> {
        let started = Instant::now();
        let result = self.delete_volume_inner(ctx, &req).await;
        self.finish("delete_volume", started, result)
    }

    async fn delete_volume_inner(&self, ctx: &RequestContext, req: &DeleteVolumeRequest) -> Result<()> {
        ensure_active(ctx)?;
        if req.volume_id.is_empty() {
            return Err(Error::InvalidArgument("volume ID cannot be empty".into()));
        }

        let _id_guard = self.volume_locks.lock(&req.volume_id)?;

        let (reservation, backing_present) = match self.resolve_volume(&req.volume_id).await {
            Ok(Resolved::Present(reservation)) => (reservation, true),
            Ok(Resolved::BackingMissing(reservation)) => (reservation, false),
            Err(e) if e.is_not_found() => {
                warn!(
                    "Volume {} not found in the journal, assuming it is already deleted: {}",
                    req.volume_id, e
                );
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        let _name_guard = self.volume_locks.lock(&reservation.attrs.request_name)?;
        let fs = fs_ref(&reservation);

        if backing_present {
            match self
                .backend
                .purge_subvolume(&fs, &reservation.backing_name)
                .await
            {
                Ok(()) | Err(Error::VolumeNotFound { .. }) => {}
                Err(e) => return Err(e),
            }
        } else {
            warn!(
                "Subvolume {} is already gone, removing its reservation",
                reservation.backing_name
            );
        }

        if let Some(Lineage::Volume { subvolume }) = &reservation.attrs.source {
            if let Err(e) = self
                .remove_temp_snapshot(&fs, subvolume, &reservation.backing_name)
                .await
            {
                warn!(
                    "Failed to remove temporary snapshot {}@{}: {}",
                    subvolume, reservation.backing_name, e
                );
            }
        }

        self.volume_journal
            .unreserve(
                &reservation.pool,
                &reservation.id.object_uuid(),
                &reservation.attrs.request_name,
            )
            .await?;

        info!(
            "Deleted volume {} ({})",
            req.volume_id, reservation.backing_name
        );
        Ok(())
    }

    // =========================================================================
    // ControllerExpandVolume
    // =========================================================================

    /// Grow a volume's quota to the rounded requested size
    #[instrument(skip_all, fields(request_id = %ctx.request_id, volume_id = %req.volume_id))]
    pub async fn expand_volume(
        &self,
        ctx: &RequestContext,
        req: ControllerExpandVolumeRequest,
    ) -> Result<ControllerExpandVolumeResponse> {
        let started = Instant::now();
        let result = self.expand_volume_inner(ctx, &req).await;
        self.finish("expand_volume", started, result)
    }

    async fn expand_volume_inner(
        &self,
        ctx: &RequestContext,
        req: &ControllerExpandVolumeRequest,
    ) -> Result<ControllerExpandVolumeResponse> {
        ensure_active(ctx)?;
        if req.volume_id.is_empty() {
            return Err(Error::InvalidArgument("volume ID cannot be empty".into()));
        }
        let range = req
            .capacity_range
            .filter(|r| r.required_bytes > 0)
            .ok_or_else(|| Error::InvalidArgument("capacity range cannot be empty".into()))?;
        let size_bytes = requested_size(Some(&range))?;

        let _id_guard = self.volume_locks.lock(&req.volume_id)?;
        let reservation = self.existing_volume(&req.volume_id).await?;
        let _name_guard = self.volume_locks.lock(&reservation.attrs.request_name)?;

        self.backend
            .resize_subvolume(&fs_ref(&reservation), &reservation.backing_name, size_bytes)
            .await?;

        info!(
            "Expanded {} to {} bytes",
            reservation.backing_name, size_bytes
        );
        Ok(ControllerExpandVolumeResponse {
            capacity_bytes: size_bytes,
            node_expansion_required: false,
        })
    }

    // =========================================================================
    // ValidateVolumeCapabilities
    // =========================================================================

    /// Confirm the capabilities unless any of them asks for block access
    #[instrument(skip_all, fields(request_id = %ctx.request_id, volume_id = %req.volume_id))]
    pub async fn validate_volume_capabilities(
        &self,
        ctx: &RequestContext,
        req: ValidateVolumeCapabilitiesRequest,
    ) -> Result<ValidateVolumeCapabilitiesResponse> {
        let started = Instant::now();
        let result = self.validate_volume_capabilities_inner(ctx, &req).await;
        self.finish("validate_volume_capabilities", started, result)
    }

    async fn validate_volume_capabilities_inner(
        &self,
        ctx: &RequestContext,
        req: &ValidateVolumeCapabilitiesRequest,
    ) -> Result<ValidateVolumeCapabilitiesResponse> {
        ensure_active(ctx)?;
        if req.volume_id.is_empty() {
            return Err(Error::InvalidArgument("volume ID cannot be empty".into()));
        }
        if req.volume_capabilities.is_empty() {
            return Err(Error::InvalidArgument(
                "volume capabilities cannot be empty".into(),
            ));
        }

        let _id_guard = self.volume_locks.lock(&req.volume_id)?;
        self.existing_volume(&req.volume_id).await?;

        if req.volume_capabilities.iter().any(|c| c.is_block()) {
            return Ok(ValidateVolumeCapabilitiesResponse {
                confirmed: None,
                message: "block access is not supported by CephFS volumes".to_string(),
            });
        }

        Ok(ValidateVolumeCapabilitiesResponse {
            confirmed: Some(req.volume_capabilities.clone()),
            message: String::new(),
        })
    }
}

fn validate_create_volume(req: &CreateVolumeRequest) -> Result<()> {
    if req.name.is_empty() {
        return Err(Error::InvalidArgument("volume name cannot be empty".into()));
    }
    if req.volume_capabilities.is_empty() {
        return Err(Error::InvalidArgument(
            "volume capabilities cannot be empty".into(),
        ));
    }
    if req.volume_capabilities.iter().any(|c| c.is_block()) {
        return Err(Error::InvalidArgument(
            "block access is not supported by CephFS volumes".into(),
        ));
    }
    Ok(())
}

fn volume_response(reservation: &Reservation, opts: &VolumeOptions, req: &CreateVolumeRequest) -> Volume {
    let mut volume_context = req.parameters.clone();
    volume_context.insert(
        CONTEXT_SUBVOLUME_NAME.to_string(),
        reservation.backing_name.clone(),
    );

    Volume {
        volume_id: reservation.handle.clone(),
        capacity_bytes: opts.size_bytes,
        volume_context,
        content_source: req.volume_content_source.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::{InMemoryCluster, Op};
    use crate::controller::types::{AccessMode, CapacityRange, VolumeCapability};
    use crate::controller::options::GIB;
    use assert_matches::assert_matches;

    fn setup() -> (Arc<InMemoryCluster>, ControllerServer) {
        let cluster = InMemoryCluster::new();
        cluster.add_filesystem("ceph", "cephfs", "cephfs.meta", 1);
        let server =
            ControllerServer::new(ControllerConfig::default(), cluster.clone(), cluster.clone())
                .unwrap();
        (cluster, server)
    }

    fn create_request(name: &str) -> CreateVolumeRequest {
        CreateVolumeRequest {
            name: name.to_string(),
            capacity_range: Some(CapacityRange::required(GIB)),
            volume_capabilities: vec![VolumeCapability::mount(AccessMode::MultiNodeMultiWriter)],
            parameters: [("clusterID", "ceph"), ("fsName", "cephfs")]
                .into_iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            volume_content_source: None,
        }
    }

    #[tokio::test]
    async fn test_create_volume_is_idempotent() {
        let (cluster, server) = setup();
        let ctx = RequestContext::new();

        let first = server.create_volume(&ctx, create_request("pvc-1")).await.unwrap();
        let second = server.create_volume(&ctx, create_request("pvc-1")).await.unwrap();

        assert_eq!(first.volume_id, second.volume_id);
        assert_eq!(first.capacity_bytes, GIB);
        assert!(first.volume_context[CONTEXT_SUBVOLUME_NAME].starts_with("csi-vol-"));
        assert_eq!(cluster.calls(Op::CreateSubvolume), 1);
        assert!(server.volume_locks().is_empty());
    }

    #[tokio::test]
    async fn test_create_volume_validation() {
        let (_cluster, server) = setup();
        let ctx = RequestContext::new();

        assert_matches!(
            server.create_volume(&ctx, create_request("")).await,
            Err(Error::InvalidArgument(_))
        );

        let mut no_caps = create_request("pvc-1");
        no_caps.volume_capabilities.clear();
        assert_matches!(server.create_volume(&ctx, no_caps).await, Err(Error::InvalidArgument(_)));

        let mut block = create_request("pvc-1");
        block.volume_capabilities = vec![VolumeCapability::block(AccessMode::SingleNodeWriter)];
        assert_matches!(server.create_volume(&ctx, block).await, Err(Error::InvalidArgument(_)));

        let mut unknown_fs = create_request("pvc-1");
        unknown_fs.parameters.insert("fsName".into(), "nofs".into());
        assert_matches!(server.create_volume(&ctx, unknown_fs).await, Err(Error::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn test_cancelled_request_is_rejected_at_entry() {
        let (cluster, server) = setup();
        let ctx = RequestContext::new();
        ctx.cancel.cancel();

        assert_matches!(
            server.create_volume(&ctx, create_request("pvc-1")).await,
            Err(Error::Cancelled)
        );
        assert_eq!(cluster.calls(Op::CreateSubvolume), 0);
    }

    #[tokio::test]
    async fn test_create_failure_unreserves() {
        let (cluster, server) = setup();
        let ctx = RequestContext::new();
        cluster.fail_operation(Op::CreateSubvolume);

        assert_matches!(
            server.create_volume(&ctx, create_request("pvc-1")).await,
            Err(Error::Internal(_))
        );
        let pool = server.volume_journal.pool_ref("ceph", "cephfs.meta");
        assert!(server
            .volume_journal
            .check_reservation(&pool, "pvc-1", None)
            .await
            .unwrap()
            .is_none());

        cluster.clear_faults();
        server.create_volume(&ctx, create_request("pvc-1")).await.unwrap();
    }

    #[tokio::test]
    async fn test_replay_recreates_missing_subvolume() {
        let (cluster, server) = setup();
        let ctx = RequestContext::new();

        let first = server.create_volume(&ctx, create_request("pvc-1")).await.unwrap();
        let fs = FsRef::new("ceph", "cephfs", "csi");
        let backing = first.volume_context[CONTEXT_SUBVOLUME_NAME].clone();
        crate::domain::ports::SubvolumeBackend::purge_subvolume(cluster.as_ref(), &fs, &backing)
            .await
            .unwrap();

        let second = server.create_volume(&ctx, create_request("pvc-1")).await.unwrap();
        assert_ne!(first.volume_id, second.volume_id);
        assert!(cluster.subvolume_exists(&fs, &second.volume_context[CONTEXT_SUBVOLUME_NAME]));
    }

    #[tokio::test]
    async fn test_delete_volume() {
        let (cluster, server) = setup();
        let ctx = RequestContext::new();
        let volume = server.create_volume(&ctx, create_request("pvc-1")).await.unwrap();

        let delete = DeleteVolumeRequest {
            volume_id: volume.volume_id.clone(),
        };
        server.delete_volume(&ctx, delete.clone()).await.unwrap();
        assert_eq!(cluster.subvolume_count(), 0);

        // Replays succeed without touching the cluster again
        server.delete_volume(&ctx, delete).await.unwrap();
        assert_eq!(cluster.calls(Op::PurgeSubvolume), 1);
    }

    #[tokio::test]
    async fn test_delete_volume_rejects_bad_handles() {
        let (_cluster, server) = setup();
        let ctx = RequestContext::new();

        assert_matches!(
            server.delete_volume(&ctx, DeleteVolumeRequest::default()).await,
            Err(Error::InvalidArgument(_))
        );
        assert_matches!(
            server
                .delete_volume(&ctx, DeleteVolumeRequest { volume_id: "not-a-handle".into() })
                .await,
            Err(Error::InvalidVolumeId(_))
        );
    }

    #[tokio::test]
    async fn test_expand_volume() {
        let (cluster, server) = setup();
        let ctx = RequestContext::new();
        let volume = server.create_volume(&ctx, create_request("pvc-1")).await.unwrap();

        let response = server
            .expand_volume(
                &ctx,
                ControllerExpandVolumeRequest {
                    volume_id: volume.volume_id.clone(),
                    capacity_range: Some(CapacityRange::required(2 * GIB + 1)),
                },
            )
            .await
            .unwrap();
        assert_eq!(response.capacity_bytes, 3 * GIB);
        assert!(!response.node_expansion_required);

        let fs = FsRef::new("ceph", "cephfs", "csi");
        assert_eq!(
            cluster.subvolume_quota(&fs, &volume.volume_context[CONTEXT_SUBVOLUME_NAME]),
            Some(3 * GIB)
        );

        assert_matches!(
            server
                .expand_volume(
                    &ctx,
                    ControllerExpandVolumeRequest {
                        volume_id: volume.volume_id,
                        capacity_range: None,
                    },
                )
                .await,
            Err(Error::InvalidArgument(_))
        );
    }

    #[tokio::test]
    async fn test_validate_volume_capabilities() {
        let (_cluster, server) = setup();
        let ctx = RequestContext::new();
        let volume = server.create_volume(&ctx, create_request("pvc-1")).await.unwrap();

        let mut req = ValidateVolumeCapabilitiesRequest {
            volume_id: volume.volume_id.clone(),
            volume_capabilities: vec![VolumeCapability::mount(AccessMode::SingleNodeWriter)],
            ..Default::default()
        };
        let confirmed = server.validate_volume_capabilities(&ctx, req.clone()).await.unwrap();
        assert_eq!(confirmed.confirmed, Some(req.volume_capabilities.clone()));

        req.volume_capabilities
            .push(VolumeCapability::block(AccessMode::SingleNodeWriter));
        let rejected = server.validate_volume_capabilities(&ctx, req).await.unwrap();
        assert!(rejected.confirmed.is_none());

        server
            .delete_volume(&ctx, DeleteVolumeRequest { volume_id: volume.volume_id.clone() })
            .await
            .unwrap();
        let missing = ValidateVolumeCapabilitiesRequest {
            volume_id: volume.volume_id,
            volume_capabilities: vec![VolumeCapability::mount(AccessMode::SingleNodeWriter)],
            ..Default::default()
        };
        assert_matches!(
            server.validate_volume_capabilities(&ctx, missing).await,
            Err(Error::VolumeNotFound { .. })
        );
    }

    #[tokio::test]
    async fn test_metrics_record_outcomes() {
        let (_cluster, server) = setup();
        let ctx = RequestContext::new();
        server.create_volume(&ctx, create_request("pvc-1")).await.unwrap();

        let _held = server.volume_locks().lock("pvc-2").unwrap();
        assert_matches!(
            server.create_volume(&ctx, create_request("pvc-2")).await,
            Err(Error::OperationPending { .. })
        );

        assert_eq!(server.metrics().count("create_volume", "success"), 1);
        assert_eq!(server.metrics().count("create_volume", "aborted"), 1);
    }
}
