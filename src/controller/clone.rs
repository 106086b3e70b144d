//! Volume content sources
//!
//! A new volume can be populated from a snapshot or from another volume.
//! Cloning from a volume goes through a temporary snapshot of the source,
//! named after the clone's own subvolume, which is removed once the clone
//! has fully materialized.
//!
//! CephFS clones complete asynchronously. While a clone is pending the
//! create call fails with the retryable `CloneInProgress` and keeps its
//! reservation, so the caller's replay picks the same clone up again.

use super::options::VolumeOptions;
use super::rollback::Rollback;
use super::server::{fs_ref, ControllerServer, Resolved};
use super::snapshot::snapshot_parent;
use super::types::VolumeContentSource;
use crate::domain::ports::{CloneState, FsRef, PoolRef, SubvolumeBackendRef};
use crate::error::{Error, Result};
use crate::journal::{Lineage, Reservation};
use crate::locks::LockGuard;
use tracing::{debug, info, warn};

// =============================================================================
// Resolved Content Source
// =============================================================================

/// A content source that exists, held locked for the rest of the call
pub(super) enum CloneSource<'a> {
    Snapshot {
        reservation: Reservation,
        /// Subvolume the snapshot was taken of
        parent: String,
        _guard: LockGuard<'a>,
    },
    Volume {
        reservation: Reservation,
        _guard: LockGuard<'a>,
    },
}

impl CloneSource<'_> {
    /// Lineage recorded in the new volume's reservation
    pub(super) fn lineage(&self) -> Lineage {
        match self {
            CloneSource::Snapshot {
                reservation,
                parent,
                ..
            } => Lineage::Snapshot {
                subvolume: parent.clone(),
                snapshot: reservation.backing_name.clone(),
            },
            CloneSource::Volume { reservation, .. } => Lineage::Volume {
                subvolume: reservation.backing_name.clone(),
            },
        }
    }

    /// Subvolume the clone's data comes from
    pub(super) fn parent_subvolume(&self) -> &str {
        match self {
            CloneSource::Snapshot { parent, .. } => parent,
            CloneSource::Volume { reservation, .. } => &reservation.backing_name,
        }
    }

    /// Filesystem and group the source lives in
    pub(super) fn fs(&self) -> FsRef {
        match self {
            CloneSource::Snapshot { reservation, .. } | CloneSource::Volume { reservation, .. } => {
                fs_ref(reservation)
            }
        }
    }

    fn reservation(&self) -> &Reservation {
        match self {
            CloneSource::Snapshot { reservation, .. } | CloneSource::Volume { reservation, .. } => {
                reservation
            }
        }
    }
}

impl ControllerServer {
    // =========================================================================
    // Source Resolution
    // =========================================================================

    /// Lock and resolve the content source of a create request
    ///
    /// The clone is placed in the source's subvolume group, so `opts` is
    /// updated to match.
    pub(super) async fn resolve_content_source<'a>(
        &'a self,
        source: Option<&VolumeContentSource>,
        opts: &mut VolumeOptions,
    ) -> Result<Option<CloneSource<'a>>> {
        let source = match source {
            None => return Ok(None),
            Some(VolumeContentSource::Snapshot(handle)) => {
                if handle.is_empty() {
                    return Err(Error::InvalidArgument("snapshot ID cannot be empty".into()));
                }
                let guard = self.snapshot_locks.lock(handle)?;
                let reservation = match self.resolve_snapshot(handle).await {
                    Ok(Resolved::Present(reservation)) => reservation,
                    Ok(Resolved::BackingMissing(reservation)) => {
                        return Err(Error::SnapNotFound {
                            snapshot: reservation.backing_name,
                        })
                    }
                    Err(e) if e.is_not_found() => {
                        return Err(Error::SnapNotFound {
                            snapshot: handle.clone(),
                        })
                    }
                    Err(e) => return Err(e),
                };
                let parent = snapshot_parent(&reservation)?.to_string();
                CloneSource::Snapshot {
                    reservation,
                    parent,
                    _guard: guard,
                }
            }
            Some(VolumeContentSource::Volume(handle)) => {
                if handle.is_empty() {
                    return Err(Error::InvalidArgument("volume ID cannot be empty".into()));
                }
                let guard = self.volume_locks.lock(handle)?;
                let reservation = self.existing_volume(handle).await?;
                CloneSource::Volume {
                    reservation,
                    _guard: guard,
                }
            }
        };

        let origin = source.reservation();
        if origin.id.cluster_id() != opts.cluster_id || origin.attrs.fs_name != opts.fs_name {
            return Err(Error::InvalidArgument(format!(
                "content source {} lives in {}/{}, not {}/{}",
                origin.handle,
                origin.id.cluster_id(),
                origin.attrs.fs_name,
                opts.cluster_id,
                opts.fs_name
            )));
        }
        opts.subvolume_group = origin.attrs.subvolume_group.clone();

        debug!(
            "Volume {} will be cloned from {}",
            opts.request_name,
            source.parent_subvolume()
        );
        Ok(Some(source))
    }

    // =========================================================================
    // Replay Detection
    // =========================================================================

    /// Find the subvolume an earlier attempt of this request created
    ///
    /// Returns `None` when there is nothing usable, after clearing out any
    /// stale reservation. A clone that has not finished yet fails with
    /// `CloneInProgress`.
    pub(super) async fn check_volume_exists(
        &self,
        pool: &PoolRef,
        opts: &VolumeOptions,
        source: Option<&CloneSource<'_>>,
    ) -> Result<Option<Reservation>> {
        let lineage = source.map(|s| s.lineage());
        let Some(reservation) = self
            .volume_journal
            .check_reservation(pool, &opts.request_name, lineage.as_ref())
            .await?
        else {
            return Ok(None);
        };
        let fs = fs_ref(&reservation);
        let _id_guard = self.volume_locks.lock(&reservation.handle)?;

        let Some(source) = source else {
            match self
                .backend
                .subvolume_info(&fs, &reservation.backing_name)
                .await
            {
                Ok(_) | Err(Error::InvalidCommand(_)) => return Ok(Some(reservation)),
                Err(Error::VolumeNotFound { .. }) => {
                    warn!(
                        "Subvolume {} of request {} is gone, reserving again",
                        reservation.backing_name, opts.request_name
                    );
                    self.release(&reservation).await?;
                    return Ok(None);
                }
                Err(e) => return Err(e),
            }
        };

        match self
            .backend
            .clone_state(&fs, &reservation.backing_name)
            .await
        {
            Ok(CloneState::Complete) => {}
            Ok(CloneState::Pending | CloneState::InProgress) => {
                return Err(Error::CloneInProgress {
                    volume_id: reservation.handle,
                })
            }
            Ok(CloneState::Failed) => {
                warn!(
                    "Clone {} of request {} failed, cleaning up",
                    reservation.backing_name, opts.request_name
                );
                match self
                    .backend
                    .purge_subvolume(&fs, &reservation.backing_name)
                    .await
                {
                    Ok(()) | Err(Error::VolumeNotFound { .. }) => {}
                    Err(e) => return Err(e),
                }
                self.discard_temp_snapshot(source, &reservation).await;
                self.release(&reservation).await?;
                return Err(Error::Internal(format!(
                    "clone {} failed",
                    reservation.backing_name
                )));
            }
            Err(Error::VolumeNotFound { .. }) => {
                warn!(
                    "Clone {} of request {} is gone, reserving again",
                    reservation.backing_name, opts.request_name
                );
                self.discard_temp_snapshot(source, &reservation).await;
                self.release(&reservation).await?;
                return Ok(None);
            }
            Err(e) => return Err(e),
        }

        // Finish what the interrupted attempt left undone
        self.backend
            .resize_subvolume(&fs, &reservation.backing_name, opts.size_bytes)
            .await?;
        if let CloneSource::Volume { .. } = source {
            self.remove_temp_snapshot(
                &source.fs(),
                source.parent_subvolume(),
                &reservation.backing_name,
            )
            .await?;
        }

        Ok(Some(reservation))
    }

    async fn release(&self, reservation: &Reservation) -> Result<()> {
        self.volume_journal
            .unreserve(
                &reservation.pool,
                &reservation.id.object_uuid(),
                &reservation.attrs.request_name,
            )
            .await
    }

    async fn discard_temp_snapshot(&self, source: &CloneSource<'_>, clone: &Reservation) {
        if let CloneSource::Volume { .. } = source {
            if let Err(e) = self
                .remove_temp_snapshot(&source.fs(), source.parent_subvolume(), &clone.backing_name)
                .await
            {
                warn!(
                    "Failed to remove temporary snapshot {}@{}: {}",
                    source.parent_subvolume(),
                    clone.backing_name,
                    e
                );
            }
        }
    }

    /// Unprotect and delete a snapshot if it is still there
    pub(super) async fn remove_temp_snapshot(
        &self,
        fs: &FsRef,
        subvolume: &str,
        snapshot: &str,
    ) -> Result<()> {
        let info = match self.backend.snapshot_info(fs, subvolume, snapshot).await {
            Ok(info) => info,
            Err(Error::SnapNotFound { .. } | Error::VolumeNotFound { .. }) => return Ok(()),
            Err(e) => return Err(e),
        };

        if info.protected {
            match self
                .backend
                .unprotect_snapshot(fs, subvolume, snapshot)
                .await
            {
                Ok(()) | Err(Error::SnapNotFound { .. }) => {}
                Err(e) => return Err(e),
            }
        }

        match self.backend.delete_snapshot(fs, subvolume, snapshot).await {
            Ok(()) | Err(Error::SnapNotFound { .. }) => {
                debug!("Removed temporary snapshot {}@{}", subvolume, snapshot);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    // =========================================================================
    // Backing Creation
    // =========================================================================

    /// Create the subvolume for a fresh reservation
    ///
    /// Every allocation is registered on `rollback`; the caller settles it.
    pub(super) async fn create_backing(
        &self,
        fs: &FsRef,
        reservation: &Reservation,
        opts: &VolumeOptions,
        source: Option<&CloneSource<'_>>,
        rollback: &mut Rollback,
    ) -> Result<()> {
        match source {
            None => {
                self.backend
                    .create_subvolume(
                        fs,
                        &reservation.backing_name,
                        opts.size_bytes,
                        opts.data_pool.as_deref(),
                    )
                    .await
            }
            Some(CloneSource::Snapshot {
                reservation: snapshot,
                parent,
                ..
            }) => {
                self.clone_from_snapshot(
                    fs,
                    reservation,
                    opts,
                    &fs_ref(snapshot),
                    parent,
                    &snapshot.backing_name,
                    rollback,
                )
                .await
            }
            Some(CloneSource::Volume {
                reservation: volume,
                ..
            }) => {
                self.clone_from_volume(
                    fs,
                    reservation,
                    opts,
                    &fs_ref(volume),
                    &volume.backing_name,
                    rollback,
                )
                .await
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn clone_from_snapshot(
        &self,
        fs: &FsRef,
        clone: &Reservation,
        opts: &VolumeOptions,
        source_fs: &FsRef,
        parent: &str,
        snapshot: &str,
        rollback: &mut Rollback,
    ) -> Result<()> {
        self.backend
            .snapshot_info(source_fs, parent, snapshot)
            .await?;

        self.backend
            .clone_snapshot(
                source_fs,
                parent,
                snapshot,
                &clone.backing_name,
                opts.data_pool.as_deref(),
            )
            .await?;
        rollback.push(
            format!("purge clone {}", clone.backing_name),
            purge_subvolume(self.backend.clone(), fs.clone(), clone.backing_name.clone()),
        );

        self.ensure_clone_complete(fs, clone).await?;
        self.backend
            .resize_subvolume(fs, &clone.backing_name, opts.size_bytes)
            .await?;

        info!(
            "Cloned {}@{} into {}",
            parent, snapshot, clone.backing_name
        );
        Ok(())
    }

    async fn clone_from_volume(
        &self,
        fs: &FsRef,
        clone: &Reservation,
        opts: &VolumeOptions,
        source_fs: &FsRef,
        parent: &str,
        rollback: &mut Rollback,
    ) -> Result<()> {
        // Temporary snapshot named after the clone
        let snapshot = clone.backing_name.as_str();

        self.backend
            .create_snapshot(source_fs, parent, snapshot)
            .await?;
        rollback.push(
            format!("delete temporary snapshot {}@{}", parent, snapshot),
            delete_snapshot(
                self.backend.clone(),
                source_fs.clone(),
                parent.to_string(),
                snapshot.to_string(),
            ),
        );

        self.backend
            .protect_snapshot(source_fs, parent, snapshot)
            .await?;
        rollback.push(
            format!("unprotect temporary snapshot {}@{}", parent, snapshot),
            unprotect_snapshot(
                self.backend.clone(),
                source_fs.clone(),
                parent.to_string(),
                snapshot.to_string(),
            ),
        );

        self.backend
            .clone_snapshot(
                source_fs,
                parent,
                snapshot,
                &clone.backing_name,
                opts.data_pool.as_deref(),
            )
            .await?;
        rollback.push(
            format!("purge clone {}", clone.backing_name),
            purge_subvolume(self.backend.clone(), fs.clone(), clone.backing_name.clone()),
        );

        self.ensure_clone_complete(fs, clone).await?;
        self.backend
            .resize_subvolume(fs, &clone.backing_name, opts.size_bytes)
            .await?;

        self.backend
            .unprotect_snapshot(source_fs, parent, snapshot)
            .await?;
        self.backend
            .delete_snapshot(source_fs, parent, snapshot)
            .await?;

        info!("Cloned {} into {}", parent, clone.backing_name);
        Ok(())
    }

    async fn ensure_clone_complete(&self, fs: &FsRef, clone: &Reservation) -> Result<()> {
        match self.backend.clone_state(fs, &clone.backing_name).await? {
            CloneState::Complete => Ok(()),
            CloneState::Pending | CloneState::InProgress => {
                info!("Clone {} has not completed yet", clone.backing_name);
                Err(Error::CloneInProgress {
                    volume_id: clone.handle.clone(),
                })
            }
            CloneState::Failed => Err(Error::Internal(format!(
                "clone {} failed",
                clone.backing_name
            ))),
        }
    }
}

// =============================================================================
// Compensating Actions
// =============================================================================

async fn purge_subvolume(backend: SubvolumeBackendRef, fs: FsRef, name: String) -> Result<()> {
    match backend.purge_subvolume(&fs, &name).await {
        Ok(()) | Err(Error::VolumeNotFound { .. }) => Ok(()),
        Err(e) => Err(e),
    }
}

async fn unprotect_snapshot(
    backend: SubvolumeBackendRef,
    fs: FsRef,
    subvolume: String,
    snapshot: String,
) -> Result<()> {
    match backend.unprotect_snapshot(&fs, &subvolume, &snapshot).await {
        Ok(()) | Err(Error::SnapNotFound { .. }) => Ok(()),
        Err(e) => Err(e),
    }
}

async fn delete_snapshot(
    backend: SubvolumeBackendRef,
    fs: FsRef,
    subvolume: String,
    snapshot: String,
) -> Result<()> {
    match backend.delete_snapshot(&fs, &subvolume, &snapshot).await {
        Ok(()) | Err(Error::SnapNotFound { .. }) => Ok(()),
        Err(e) => Err(e),
    }
}
