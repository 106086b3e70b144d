//! Volume and snapshot handle codec
//!
//! A handle carries everything needed to locate its journal entry after a
//! restart, without any cache:
//!
//! ```text
//! <version:4 hex>-<len(clusterID):4 hex>-<clusterID>-<poolID:16 hex>-<objectUUID:36>
//! ```
//!
//! The clusterID may itself contain `-`, so fields are located by position
//! and length, never by splitting on the separator.

use crate::error::{Error, Result};
use std::str::FromStr;
use uuid::Uuid;

// =============================================================================
// Constants
// =============================================================================

/// Only encoding version this controller reads and writes
pub const ID_VERSION: u16 = 1;

/// Longest clusterID that fits in a handle, in bytes
pub const MAX_CLUSTER_ID_LEN: usize = 36;

/// Length of a hyphenated UUID
const UUID_LEN: usize = 36;

/// Fixed overhead: version, length, separators, poolID and UUID
pub const FIXED_ID_LEN: usize = 4 + 1 + 4 + 1 + 1 + 16 + 1 + UUID_LEN;

// =============================================================================
// Object Identifier
// =============================================================================

/// Decoded form of a volume or snapshot handle
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ObjectIdentifier {
    version: u16,
    cluster_id: String,
    pool_id: i64,
    object_uuid: Uuid,
}

impl ObjectIdentifier {
    /// Build an identifier at the current encoding version
    pub fn new(cluster_id: impl Into<String>, pool_id: i64, object_uuid: Uuid) -> Result<Self> {
        let cluster_id = cluster_id.into();
        if cluster_id.len() > MAX_CLUSTER_ID_LEN {
            return Err(Error::InvalidVolumeId(format!(
                "cluster ID {:?} is longer than {} bytes",
                cluster_id, MAX_CLUSTER_ID_LEN
            )));
        }

        Ok(Self {
            version: ID_VERSION,
            cluster_id,
            pool_id,
            object_uuid,
        })
    }

    pub fn version(&self) -> u16 {
        self.version
    }

    pub fn cluster_id(&self) -> &str {
        &self.cluster_id
    }

    pub fn pool_id(&self) -> i64 {
        self.pool_id
    }

    pub fn object_uuid(&self) -> Uuid {
        self.object_uuid
    }

    /// Same object, relocated to another cluster and pool
    pub fn relocate(&self, cluster_id: impl Into<String>, pool_id: i64) -> Result<Self> {
        let mut relocated = Self::new(cluster_id, pool_id, self.object_uuid)?;
        relocated.version = self.version;
        Ok(relocated)
    }

    /// Render the handle string
    pub fn encode(&self) -> String {
        format!(
            "{:04x}-{:04x}-{}-{:016x}-{}",
            self.version,
            self.cluster_id.len(),
            self.cluster_id,
            self.pool_id as u64,
            self.object_uuid.hyphenated()
        )
    }

    /// Parse a handle string
    pub fn decode(handle: &str) -> Result<Self> {
        if handle.len() < FIXED_ID_LEN {
            return Err(invalid(handle, "too short"));
        }

        let version = hex_field(handle, 0, 4, "version")? as u16;
        separator(handle, 4)?;

        let cluster_len = hex_field(handle, 5, 4, "cluster ID length")? as usize;
        separator(handle, 9)?;
        if cluster_len > MAX_CLUSTER_ID_LEN {
            return Err(invalid(handle, "cluster ID too long"));
        }
        if handle.len() != FIXED_ID_LEN + cluster_len {
            return Err(invalid(handle, "unexpected length"));
        }

        let cluster_id = handle
            .get(10..10 + cluster_len)
            .ok_or_else(|| invalid(handle, "cluster ID is not valid UTF-8"))?;

        let pool_start = 10 + cluster_len + 1;
        separator(handle, pool_start - 1)?;
        let pool_id = hex_field(handle, pool_start, 16, "pool ID")? as i64;
        separator(handle, pool_start + 16)?;

        let uuid_field = handle
            .get(pool_start + 17..)
            .ok_or_else(|| invalid(handle, "object UUID is not valid UTF-8"))?;
        if uuid_field.len() != UUID_LEN {
            return Err(invalid(handle, "object UUID has the wrong length"));
        }
        let object_uuid =
            Uuid::parse_str(uuid_field).map_err(|_| invalid(handle, "malformed object UUID"))?;

        if version != ID_VERSION {
            return Err(invalid(handle, "unsupported encoding version"));
        }

        Ok(Self {
            version,
            cluster_id: cluster_id.to_string(),
            pool_id,
            object_uuid,
        })
    }
}

impl std::fmt::Display for ObjectIdentifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.encode())
    }
}

impl FromStr for ObjectIdentifier {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::decode(s)
    }
}

fn invalid(handle: &str, reason: &str) -> Error {
    Error::InvalidVolumeId(format!("{:?}: {}", handle, reason))
}

fn separator(handle: &str, at: usize) -> Result<()> {
    match handle.as_bytes().get(at) {
        Some(b'-') => Ok(()),
        _ => Err(invalid(handle, "missing field separator")),
    }
}

/// Parse a fixed-width hex field; `from_str_radix` alone would accept a sign
fn hex_field(handle: &str, start: usize, width: usize, name: &str) -> Result<u64> {
    let field = handle
        .get(start..start + width)
        .filter(|f| f.bytes().all(|b| b.is_ascii_hexdigit()))
        .ok_or_else(|| invalid(handle, &format!("{} is not {} hex digits", name, width)))?;

    u64::from_str_radix(field, 16).map_err(|_| invalid(handle, name))
}
