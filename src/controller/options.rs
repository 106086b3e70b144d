//! Controller configuration and per-request volume options

use super::types::{CapacityRange, CreateVolumeRequest};
use crate::error::{Error, Result};
use crate::journal::MAX_CLUSTER_ID_LEN;
use crate::mapping::MappingSource;

// =============================================================================
// Sizes
// =============================================================================

pub const MIB: u64 = 1024 * 1024;
pub const GIB: u64 = 1024 * MIB;

/// Size used when the caller does not ask for one
pub const DEFAULT_VOLUME_SIZE: u64 = GIB;

/// Round a size up to whole MiB below 1 GiB, and to whole GiB from there on
pub fn round_off_bytes(bytes: u64) -> u64 {
    let unit = if bytes < GIB { MIB } else { GIB };
    bytes.div_ceil(unit).saturating_mul(unit)
}

/// Resolve a capacity range to the size to provision
pub fn requested_size(range: Option<&CapacityRange>) -> Result<u64> {
    let Some(range) = range else {
        return Ok(DEFAULT_VOLUME_SIZE);
    };
    if range.required_bytes == 0 {
        return Ok(DEFAULT_VOLUME_SIZE);
    }

    let size = round_off_bytes(range.required_bytes);
    if range.limit_bytes != 0 && size > range.limit_bytes {
        return Err(Error::InvalidArgument(format!(
            "rounded size {} exceeds the limit of {} bytes",
            size, range.limit_bytes
        )));
    }
    Ok(size)
}

// =============================================================================
// Controller Configuration
// =============================================================================

/// Configuration for the controller
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Suffix of the journal directory objects, one per controller instance
    pub instance_id: String,
    /// Prefix of generated subvolume names
    pub volume_name_prefix: String,
    /// Prefix of generated snapshot names
    pub snapshot_name_prefix: String,
    /// Rados namespace holding the journal
    pub journal_namespace: String,
    /// Subvolume group used when the request does not name one
    pub default_subvolume_group: String,
    /// Disaster-recovery cluster mapping
    pub mapping: MappingSource,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            instance_id: "default".to_string(),
            volume_name_prefix: "csi-vol-".to_string(),
            snapshot_name_prefix: "csi-snap-".to_string(),
            journal_namespace: "csi".to_string(),
            default_subvolume_group: "csi".to_string(),
            mapping: MappingSource::default(),
        }
    }
}

// =============================================================================
// Volume Options
// =============================================================================

pub const PARAM_CLUSTER_ID: &str = "clusterID";
pub const PARAM_FS_NAME: &str = "fsName";
pub const PARAM_POOL: &str = "pool";
pub const PARAM_SUBVOLUME_GROUP: &str = "subvolumeGroup";

/// Everything CreateVolume needs from the request, validated
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeOptions {
    pub request_name: String,
    pub cluster_id: String,
    pub fs_name: String,
    pub data_pool: Option<String>,
    pub subvolume_group: String,
    pub size_bytes: u64,
}

impl VolumeOptions {
    pub fn from_request(req: &CreateVolumeRequest, config: &ControllerConfig) -> Result<Self> {
        let cluster_id = required_param(req, PARAM_CLUSTER_ID)?;
        if cluster_id.len() > MAX_CLUSTER_ID_LEN {
            return Err(Error::InvalidArgument(format!(
                "{} {:?} is longer than {} bytes",
                PARAM_CLUSTER_ID, cluster_id, MAX_CLUSTER_ID_LEN
            )));
        }
        let fs_name = required_param(req, PARAM_FS_NAME)?;

        let data_pool = optional_param(req, PARAM_POOL);
        let subvolume_group = optional_param(req, PARAM_SUBVOLUME_GROUP)
            .unwrap_or_else(|| config.default_subvolume_group.clone());

        Ok(Self {
            request_name: req.name.clone(),
            cluster_id,
            fs_name,
            data_pool,
            subvolume_group,
            size_bytes: requested_size(req.capacity_range.as_ref())?,
        })
    }
}

fn required_param(req: &CreateVolumeRequest, key: &str) -> Result<String> {
    optional_param(req, key)
        .ok_or_else(|| Error::InvalidArgument(format!("missing required parameter {}", key)))
}

fn optional_param(req: &CreateVolumeRequest, key: &str) -> Option<String> {
    req.parameters
        .get(key)
        .filter(|v| !v.is_empty())
        .cloned()
}
