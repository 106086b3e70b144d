//! Controller request and response types
//!
//! Transport-neutral shapes of the provisioning calls. A gRPC or REST front
//! end converts its wire messages into these before calling the controller.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

// =============================================================================
// Request Context
// =============================================================================

/// Per-call context: correlation ID and cancellation
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub request_id: Uuid,
    pub cancel: CancellationToken,
}

impl RequestContext {
    pub fn new() -> Self {
        Self {
            request_id: Uuid::new_v4(),
            cancel: CancellationToken::new(),
        }
    }

    /// Context tied to an existing cancellation token
    pub fn with_cancel(cancel: CancellationToken) -> Self {
        Self {
            request_id: Uuid::new_v4(),
            cancel,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

impl Default for RequestContext {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Volume Capabilities
// =============================================================================

/// How a volume will be published on a node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccessMode {
    Unknown,
    /// Read/write on a single node
    SingleNodeWriter,
    /// Read-only on a single node
    SingleNodeReaderOnly,
    /// Read-only on many nodes
    MultiNodeReaderOnly,
    /// Many nodes, one of them read/write
    MultiNodeSingleWriter,
    /// Read/write on many nodes
    MultiNodeMultiWriter,
}

/// Block device or mounted filesystem access
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccessType {
    Block,
    Mount {
        fs_type: Option<String>,
        mount_flags: Vec<String>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeCapability {
    pub access_type: AccessType,
    pub access_mode: AccessMode,
}

impl VolumeCapability {
    /// Filesystem access with no particular fs type or flags
    pub fn mount(access_mode: AccessMode) -> Self {
        Self {
            access_type: AccessType::Mount {
                fs_type: None,
                mount_flags: Vec::new(),
            },
            access_mode,
        }
    }

    /// Raw block access
    pub fn block(access_mode: AccessMode) -> Self {
        Self {
            access_type: AccessType::Block,
            access_mode,
        }
    }

    pub fn is_block(&self) -> bool {
        matches!(self.access_type, AccessType::Block)
    }
}

// =============================================================================
// Volumes
// =============================================================================

/// Requested size bounds; zero means unset
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapacityRange {
    pub required_bytes: u64,
    pub limit_bytes: u64,
}

impl CapacityRange {
    pub fn required(required_bytes: u64) -> Self {
        Self {
            required_bytes,
            limit_bytes: 0,
        }
    }
}

/// What a new volume is populated from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VolumeContentSource {
    /// Snapshot handle
    Snapshot(String),
    /// Volume handle
    Volume(String),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateVolumeRequest {
    /// Caller-chosen name; replays with the same name are idempotent
    pub name: String,
    pub capacity_range: Option<CapacityRange>,
    pub volume_capabilities: Vec<VolumeCapability>,
    /// Provisioner parameters (`clusterID`, `fsName`, `pool`, `subvolumeGroup`)
    pub parameters: BTreeMap<String, String>,
    pub volume_content_source: Option<VolumeContentSource>,
}

/// A provisioned volume as returned to the caller
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Volume {
    pub volume_id: String,
    pub capacity_bytes: u64,
    pub volume_context: BTreeMap<String, String>,
    pub content_source: Option<VolumeContentSource>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeleteVolumeRequest {
    pub volume_id: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControllerExpandVolumeRequest {
    pub volume_id: String,
    pub capacity_range: Option<CapacityRange>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControllerExpandVolumeResponse {
    pub capacity_bytes: u64,
    pub node_expansion_required: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidateVolumeCapabilitiesRequest {
    pub volume_id: String,
    pub volume_capabilities: Vec<VolumeCapability>,
    pub volume_context: BTreeMap<String, String>,
    pub parameters: BTreeMap<String, String>,
}

/// `confirmed` is `None` when the capabilities are not supported
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidateVolumeCapabilitiesResponse {
    pub confirmed: Option<Vec<VolumeCapability>>,
    pub message: String,
}

// =============================================================================
// Snapshots
// =============================================================================

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateSnapshotRequest {
    pub name: String,
    pub source_volume_id: String,
    pub parameters: BTreeMap<String, String>,
}

/// A snapshot as returned to the caller
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    pub snapshot_id: String,
    pub source_volume_id: String,
    /// Quota of the source volume when the snapshot was taken
    pub size_bytes: u64,
    pub creation_time: DateTime<Utc>,
    pub ready_to_use: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeleteSnapshotRequest {
    pub snapshot_id: String,
}
