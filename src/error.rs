//! Error taxonomy for the LVM metadata cache.
//!
//! Mirrors the kinds vdsm's `storage/exception.py` gives to `lvm.py`:
//! NotFound, ToolFailure, Mutation, Validation and Invariant errors. Each
//! mutation wrapper in [`crate::mutation`] raises exactly one `Mutation`
//! variant, constructed from the underlying [`LvmCommandError`] the same
//! way vdsm's `se.X.from_lvmerror(e)` classmethods do.

use thiserror::Error;

/// Output + exit status of a failed `lvm`-family command invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LvmCommandError {
    pub cmd: Vec<String>,
    pub rc: i32,
    pub stdout: Vec<String>,
    pub stderr: String,
}

impl std::fmt::Display for LvmCommandError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "command {:?} exited with rc={}: {}",
            self.cmd, self.rc, self.stderr
        )
    }
}

impl std::error::Error for LvmCommandError {}

impl LvmCommandError {
    /// Sub-classification of "the device/LV is currently open elsewhere",
    /// used to downgrade a deactivate failure to a warning instead of a
    /// hard error.
    pub fn lv_in_use(&self) -> bool {
        let stderr = self.stderr.to_lowercase();
        stderr.contains("in use") || stderr.contains("busy")
    }
}

/// All errors the cache's public API can return.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("physical device {0} is inaccessible")]
    InaccessiblePhysDev(String, #[source] Option<LvmCommandError>),

    #[error("volume group {0:?} does not exist")]
    VolumeGroupDoesNotExist(VgRef, #[source] Option<LvmCommandError>),

    #[error("logical volume {vg}/{lv} does not exist")]
    LogicalVolumeDoesNotExist {
        vg: String,
        lv: String,
        #[source]
        source: Option<LvmCommandError>,
    },

    #[error("lvm command failed")]
    ToolFailure(#[from] LvmCommandError),

    #[error(transparent)]
    Mutation(#[from] MutationError),

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Invariant(#[from] InvariantError),
}

/// Identifies a VG either by name or by uuid, matching vdsm's
/// `VolumeGroupDoesNotExist(vg_name=...)` / `(vg_uuid=...)` dual constructors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VgRef {
    Name(String),
    Uuid(String),
}

impl CacheError {
    pub fn inaccessible_phys_dev(name: impl Into<String>) -> Self {
        CacheError::InaccessiblePhysDev(name.into(), None)
    }

    pub fn inaccessible_phys_dev_from(name: impl Into<String>, source: LvmCommandError) -> Self {
        CacheError::InaccessiblePhysDev(name.into(), Some(source))
    }

    pub fn vg_does_not_exist(name: impl Into<String>) -> Self {
        CacheError::VolumeGroupDoesNotExist(VgRef::Name(name.into()), None)
    }

    pub fn vg_does_not_exist_from(name: impl Into<String>, source: LvmCommandError) -> Self {
        CacheError::VolumeGroupDoesNotExist(VgRef::Name(name.into()), Some(source))
    }

    pub fn vg_does_not_exist_by_uuid(uuid: impl Into<String>) -> Self {
        CacheError::VolumeGroupDoesNotExist(VgRef::Uuid(uuid.into()), None)
    }

    pub fn lv_does_not_exist(vg: impl Into<String>, lv: impl Into<String>) -> Self {
        CacheError::LogicalVolumeDoesNotExist {
            vg: vg.into(),
            lv: lv.into(),
            source: None,
        }
    }

    pub fn lv_does_not_exist_from(
        vg: impl Into<String>,
        lv: impl Into<String>,
        source: LvmCommandError,
    ) -> Self {
        CacheError::LogicalVolumeDoesNotExist {
            vg: vg.into(),
            lv: lv.into(),
            source: Some(source),
        }
    }

    /// True if this error (or the tool error it wraps) indicates the
    /// target was simply busy rather than a real failure.
    pub fn lv_in_use(&self) -> bool {
        match self {
            CacheError::ToolFailure(e) => e.lv_in_use(),
            CacheError::Mutation(MutationError::CannotDeactivateLogicalVolume { source, .. }) => {
                source.lv_in_use()
            }
            _ => false,
        }
    }
}

/// Write-path errors, one variant per mutation operation.
#[derive(Debug, Error)]
pub enum MutationError {
    #[error("failed to create volume group {vg}")]
    VolumeGroupCreate { vg: String, #[source] source: LvmCommandError },

    #[error("failed to extend volume group {vg}")]
    VolumeGroupExtend { vg: String, #[source] source: LvmCommandError },

    #[error("failed to reduce volume group {vg}")]
    VolumeGroupReduce { vg: String, #[source] source: LvmCommandError },

    #[error("failed to remove volume group {vg}")]
    VolumeGroupRemove { vg: String, #[source] source: LvmCommandError },

    #[error("failed to replace tags on volume group {vg}")]
    VolumeGroupReplaceTag { vg: String, #[source] source: LvmCommandError },

    #[error("failed to create logical volume {vg}/{lv}")]
    LogicalVolumeCreate {
        vg: String,
        lv: String,
        #[source]
        source: LvmCommandError,
    },

    #[error("failed to remove logical volumes {vg}/{lvs:?}")]
    LogicalVolumeRemove {
        vg: String,
        lvs: Vec<String>,
        #[source]
        source: LvmCommandError,
    },

    #[error("failed to extend logical volume {vg}/{lv}")]
    LogicalVolumeExtend {
        vg: String,
        lv: String,
        #[source]
        source: LvmCommandError,
    },

    #[error("failed to refresh logical volumes {vg}/{lvs:?}")]
    LogicalVolumeRefresh {
        vg: String,
        lvs: Vec<String>,
        #[source]
        source: LvmCommandError,
    },

    #[error("failed to replace tags on logical volumes {vg}/{lvs:?}")]
    LogicalVolumeReplaceTag {
        vg: String,
        lvs: Vec<String>,
        #[source]
        source: LvmCommandError,
    },

    #[error("cannot activate logical volumes {vg}/{lvs:?}")]
    CannotActivateLogicalVolumes {
        vg: String,
        lvs: Vec<String>,
        #[source]
        source: LvmCommandError,
    },

    #[error("cannot deactivate logical volume {vg}/{lvs:?}")]
    CannotDeactivateLogicalVolume {
        vg: String,
        lvs: Vec<String>,
        #[source]
        source: LvmCommandError,
    },

    #[error("could not resize physical volume {pv}")]
    CouldNotResizePhysicalVolume { pv: String, #[source] source: LvmCommandError },

    #[error("could not move data off physical volume {pv}")]
    CouldNotMovePVData { pv: String, #[source] source: LvmCommandError },

    #[error("failed to initialize physical device(s) {devices:?}")]
    PhysDevInitializationError {
        devices: Vec<String>,
        #[source]
        source: LvmCommandError,
    },

    #[error("cannot set read/write state on logical volume {vg}/{lv}")]
    CannotSetRWLogicalVolume {
        vg: String,
        lv: String,
        #[source]
        source: LvmCommandError,
    },

    #[error("not enough free extents for extending {vg}/{lv} (free={free}, needed={needed})")]
    VolumeGroupSizeError {
        vg: String,
        lv: String,
        free: u64,
        needed: u64,
    },
}

/// Input-validation errors.
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("cannot add and delete the same tag(s) {tags:?} on {target}")]
    DuplicateTag { target: String, tags: Vec<String> },

    #[error("invalid availability value {0:?}, expected \"y\" or \"n\"")]
    InvalidAvailability(String),

    #[error("device {device} has unsupported logical block size {logical} (physical {physical})")]
    DeviceBlockSizeMismatch {
        device: String,
        logical: u64,
        physical: u64,
    },

    #[error(
        "device {device} block size ({device_size}) does not match volume group block size ({vg_size})"
    )]
    VolumeGroupBlockSizeMismatch {
        device: String,
        device_size: u64,
        vg_size: u64,
    },
}

/// Parse/consistency errors that indicate a toolchain incompatibility
/// These must never be silently dropped.
#[derive(Debug, Error)]
pub enum InvariantError {
    #[error("invalid {command} command output line: {line:?}")]
    InvalidOutputLine { command: &'static str, line: String },

    #[error("expected exactly one metadata pv in vg {vg}, found {found}")]
    UnexpectedVolumeGroupMetadata { vg: String, found: usize },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lv_in_use_detects_common_lvm_phrasing() {
        let e = LvmCommandError {
            cmd: vec!["lvchange".into()],
            rc: 5,
            stdout: vec![],
            stderr: "Logical volume vg/lv in use.".into(),
        };
        assert!(e.lv_in_use());
    }

    #[test]
    fn lv_in_use_false_for_unrelated_failure() {
        let e = LvmCommandError {
            cmd: vec!["lvchange".into()],
            rc: 5,
            stdout: vec![],
            stderr: "Volume group \"vg\" not found".into(),
        };
        assert!(!e.lv_in_use());
    }
}
