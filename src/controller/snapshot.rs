//! CreateSnapshot and DeleteSnapshot
//!
//! Snapshots are journaled in the same pool as their source volume, with the
//! source subvolume recorded as the parent. Replaying a create with the same
//! name against a different source fails with `AlreadyExists`.

use super::rollback::Rollback;
use super::server::{ensure_active, fs_ref, ControllerServer, Resolved};
use super::types::{CreateSnapshotRequest, DeleteSnapshotRequest, RequestContext, Snapshot};
use crate::domain::ports::FsRef;
use crate::error::{Error, Result};
use crate::journal::{Lineage, Reservation, ReservationAttrs};
use chrono::{DateTime, Utc};
use std::time::Instant;
use tracing::{info, instrument, warn};

/// Subvolume a snapshot reservation was taken of
pub(super) fn snapshot_parent(reservation: &Reservation) -> Result<&str> {
    reservation
        .attrs
        .source
        .as_ref()
        .map(Lineage::subvolume)
        .ok_or_else(|| {
            Error::Internal(format!(
                "snapshot {} has no parent subvolume recorded",
                reservation.backing_name
            ))
        })
}

impl ControllerServer {
    /// Resolve a snapshot handle and check the snapshot on its parent
    pub(super) async fn resolve_snapshot(&self, handle: &str) -> Result<Resolved> {
        let reservation = self.lookup(&self.snapshot_journal, handle).await?;
        let info = self
            .backend
            .snapshot_info(
                &fs_ref(&reservation),
                snapshot_parent(&reservation)?,
                &reservation.backing_name,
            )
            .await;

        match info {
            Ok(_) => Ok(Resolved::Present(reservation)),
            Err(Error::SnapNotFound { .. } | Error::VolumeNotFound { .. }) => {
                Ok(Resolved::BackingMissing(reservation))
            }
            Err(e) => Err(e),
        }
    }

    // =========================================================================
    // CreateSnapshot
    // =========================================================================

    /// Snapshot a volume, or return the snapshot already taken for this name
    #[instrument(skip_all, fields(request_id = %ctx.request_id, name = %req.name))]
    pub async fn create_snapshot(
        &self,
        ctx: &RequestContext,
        req: CreateSnapshotRequest,
    ) -> Result<Snapshot> {
        let started = Instant::now();
        let result = self.create_snapshot_inner(ctx, &req).await;
        self.finish("create_snapshot", started, result)
    }

    async fn create_snapshot_inner(
        &self,
        ctx: &RequestContext,
        req: &CreateSnapshotRequest,
    ) -> Result<Snapshot> {
        ensure_active(ctx)?;
        if req.name.is_empty() {
            return Err(Error::InvalidArgument("snapshot name cannot be empty".into()));
        }
        if req.source_volume_id.is_empty() {
            return Err(Error::InvalidArgument(
                "source volume ID cannot be empty".into(),
            ));
        }

        let _name_guard = self.snapshot_locks.lock(&req.name)?;
        let _source_guard = self.volume_locks.lock(&req.source_volume_id)?;

        let source = self.existing_volume(&req.source_volume_id).await?;
        let fs = fs_ref(&source);
        let pool = self
            .snapshot_journal
            .pool_ref(&source.pool.cluster_id, &source.pool.pool);

        let lineage = Lineage::Volume {
            subvolume: source.backing_name.clone(),
        };
        if let Some(existing) = self
            .snapshot_journal
            .check_reservation(&pool, &req.name, Some(&lineage))
            .await?
        {
            match self
                .backend
                .snapshot_info(&fs, &source.backing_name, &existing.backing_name)
                .await
            {
                Ok(info) => {
                    if !info.protected {
                        info!(
                            "Snapshot {} of request {} was left unprotected, protecting it",
                            existing.backing_name, req.name
                        );
                        self.backend
                            .protect_snapshot(&fs, &source.backing_name, &existing.backing_name)
                            .await?;
                    }
                    info!(
                        "Snapshot {} already exists as {}",
                        req.name, existing.backing_name
                    );
                    return Ok(snapshot_response(&existing, req, info.created_at));
                }
                Err(Error::SnapNotFound { .. }) => {
                    warn!(
                        "Snapshot {} of request {} is gone, reserving again",
                        existing.backing_name, req.name
                    );
                    self.snapshot_journal
                        .unreserve(&pool, &existing.id.object_uuid(), &req.name)
                        .await?;
                }
                Err(e) => return Err(e),
            }
        }

        let source_info = self
            .backend
            .subvolume_info(&fs, &source.backing_name)
            .await?;

        let attrs = ReservationAttrs {
            request_name: req.name.clone(),
            fs_name: source.attrs.fs_name.clone(),
            subvolume_group: source.attrs.subvolume_group.clone(),
            data_pool: None,
            size_bytes: source_info.bytes_quota,
            source: Some(lineage),
            owner: None,
        };
        let reservation = self.snapshot_journal.reserve(&pool, attrs).await?;

        let mut rollback = Rollback::new();
        {
            let journal = self.snapshot_journal.clone();
            let pool = pool.clone();
            let uuid = reservation.id.object_uuid();
            let name = req.name.clone();
            rollback.push(format!("unreserve snapshot {}", name), async move {
                journal.unreserve(&pool, &uuid, &name).await
            });
        }

        let created = self
            .create_snapshot_backing(&fs, &source.backing_name, &reservation, &mut rollback)
            .await;
        let created_at = rollback.settle(created).await?;

        info!(
            "Created snapshot {} of {} for request {}",
            reservation.backing_name, source.backing_name, req.name
        );
        Ok(snapshot_response(&reservation, req, created_at))
    }

    async fn create_snapshot_backing(
        &self,
        fs: &FsRef,
        subvolume: &str,
        reservation: &Reservation,
        rollback: &mut Rollback,
    ) -> Result<DateTime<Utc>> {
        let snapshot = reservation.backing_name.as_str();

        self.backend.create_snapshot(fs, subvolume, snapshot).await?;
        {
            let backend = self.backend.clone();
            let fs = fs.clone();
            let subvolume = subvolume.to_string();
            let snapshot = snapshot.to_string();
            rollback.push(
                format!("delete snapshot {}@{}", subvolume, snapshot),
                async move {
                    match backend.delete_snapshot(&fs, &subvolume, &snapshot).await {
                        Ok(()) | Err(Error::SnapNotFound { .. }) => Ok(()),
                        Err(e) => Err(e),
                    }
                },
            );
        }

        let info = self.backend.snapshot_info(fs, subvolume, snapshot).await?;
        self.backend.protect_snapshot(fs, subvolume, snapshot).await?;

        Ok(info.created_at)
    }

    // =========================================================================
    // DeleteSnapshot
    // =========================================================================

    /// Delete a snapshot and its reservation; deleting a missing snapshot succeeds
    #[instrument(skip_all, fields(request_id = %ctx.request_id, snapshot_id = %req.snapshot_id))]
    pub async fn delete_snapshot(
        &self,
        ctx: &RequestContext,
        req: DeleteSnapshotRequest,
    ) -> Result<()> {
        let started = Instant::now();
        let result = self.delete_snapshot_inner(ctx, &req).await;
        self.finish("delete_snapshot", started, result)
    }

    async fn delete_snapshot_inner(
        &self,
        ctx: &RequestContext,
        req: &DeleteSnapshotRequest,
    ) -> Result<()> {
        ensure_active(ctx)?;
        if req.snapshot_id.is_empty() {
            return Err(Error::InvalidArgument("snapshot ID cannot be empty".into()));
        }

        let _id_guard = self.snapshot_locks.lock(&req.snapshot_id)?;

        let (reservation, backing_present) = match self.resolve_snapshot(&req.snapshot_id).await {
            Ok(Resolved::Present(reservation)) => (reservation, true),
            Ok(Resolved::BackingMissing(reservation)) => (reservation, false),
            Err(e) if e.is_not_found() => {
                warn!(
                    "Snapshot {} not found in the journal, assuming it is already deleted: {}",
                    req.snapshot_id, e
                );
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        let _name_guard = self.snapshot_locks.lock(&reservation.attrs.request_name)?;

        if backing_present {
            let fs = fs_ref(&reservation);
            let parent = snapshot_parent(&reservation)?;

            match self
                .backend
                .unprotect_snapshot(&fs, parent, &reservation.backing_name)
                .await
            {
                Ok(()) | Err(Error::SnapNotFound { .. } | Error::VolumeNotFound { .. }) => {}
                Err(e) => return Err(e),
            }
            match self
                .backend
                .delete_snapshot(&fs, parent, &reservation.backing_name)
                .await
            {
                Ok(()) | Err(Error::SnapNotFound { .. }) => {}
                Err(e) => return Err(e),
            }
        }

        self.snapshot_journal
            .unreserve(
                &reservation.pool,
                &reservation.id.object_uuid(),
                &reservation.attrs.request_name,
            )
            .await?;

        info!(
            "Deleted snapshot {} ({})",
            req.snapshot_id, reservation.backing_name
        );
        Ok(())
    }
}

fn snapshot_response(
    reservation: &Reservation,
    req: &CreateSnapshotRequest,
    creation_time: DateTime<Utc>,
) -> Snapshot {
    Snapshot {
        snapshot_id: reservation.handle.clone(),
        source_volume_id: req.source_volume_id.clone(),
        size_bytes: reservation.attrs.size_bytes,
        creation_time,
        ready_to_use: true,
    }
}
