//! Type definitions for VM inventory, power state, and attached storage.

use serde::{Deserialize, Serialize};

// =============================================================================
// VM STATUS
// =============================================================================

/// Basic VM information.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VmInfo {
    /// VM UUID
    pub id: String,
    /// VM name (the identifier backups are keyed on)
    pub name: String,
    /// Current power state
    pub state: VmState,
}

/// VM power state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum VmState {
    Running,
    /// Shut off
    Stopped,
    Paused,
    Suspended,
    Crashed,
    #[default]
    Unknown,
}

impl VmState {
    /// Parse the state string printed by `virsh domstate`.
    pub fn from_virsh(state: &str) -> Self {
        match state.trim() {
            "running" | "idle" | "in shutdown" => Self::Running,
            "shut off" => Self::Stopped,
            "paused" => Self::Paused,
            "pmsuspended" => Self::Suspended,
            "crashed" => Self::Crashed,
            _ => Self::Unknown,
        }
    }
    
    /// Human-readable state name, matching virsh wording.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Stopped => "shut off",
            Self::Paused => "paused",
            Self::Suspended => "pmsuspended",
            Self::Crashed => "crashed",
            Self::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for VmState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// ATTACHED STORAGE
// =============================================================================

/// Device role of a disk element in the domain definition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DiskDevice {
    Disk,
    Cdrom,
    Floppy,
    Lun,
}

impl DiskDevice {
    /// Parse the `device` attribute of a `<disk>` element.
    pub fn from_attr(value: &str) -> Self {
        match value {
            "cdrom" => Self::Cdrom,
            "floppy" => Self::Floppy,
            "lun" => Self::Lun,
            _ => Self::Disk,
        }
    }
}

/// One block-oriented storage target attached to a VM.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockTarget {
    /// Guest-visible target name (e.g. "vda", "sdb")
    pub target: String,
    /// Device role
    pub device: DiskDevice,
    /// Host path backing the target: an image file or a `/dev` node.
    /// `None` for empty drives and network-backed volumes.
    pub source: Option<String>,
}

impl BlockTarget {
    /// Create a target backed by a host path.
    pub fn new(target: impl Into<String>, source: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            device: DiskDevice::Disk,
            source: Some(source.into()),
        }
    }
}
