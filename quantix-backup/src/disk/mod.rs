//! Host disk inspection.
//!
//! Wraps the low-level utilities used on pass-through block devices:
//! partition enumeration, filesystem probing, free-space zeroing, and
//! NTFS cloning. Implementations:
//!
//! - [`HostDiskTools`] - runs `lsblk`, `blkid`, `zerofree`, `ntfsclone`
//! - [`MockDiskInspector`] - in-memory layout for tests and `--dev` runs

mod host;
mod mock;

use std::fmt;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::process::{ToolCommand, ToolError};

pub use host::HostDiskTools;
pub use mock::MockDiskInspector;

/// Errors from disk utilities.
#[derive(Error, Debug)]
pub enum DiskError {
    /// The underlying tool failed.
    #[error(transparent)]
    Tool(#[from] ToolError),

    /// The tool ran but its output could not be understood.
    #[error("unexpected output from {tool}: {detail}")]
    Parse { tool: &'static str, detail: String },
}

/// Filesystem found on a partition or whole disk.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FilesystemType {
    Ntfs,
    Ext2,
    Ext3,
    Ext4,
    /// Any other filesystem the probe recognised (xfs, vfat, swap, ...)
    Other(String),
    /// Probe failed or found no signature
    Unknown,
}

impl FilesystemType {
    /// Parse a filesystem name as printed by `blkid`/`lsblk`.
    pub fn from_probe(name: &str) -> Self {
        match name.trim().to_ascii_lowercase().as_str() {
            "" => Self::Unknown,
            "ntfs" | "ntfs3" => Self::Ntfs,
            "ext2" => Self::Ext2,
            "ext3" => Self::Ext3,
            "ext4" => Self::Ext4,
            other => Self::Other(other.to_string()),
        }
    }
}

impl fmt::Display for FilesystemType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ntfs => f.write_str("ntfs"),
            Self::Ext2 => f.write_str("ext2"),
            Self::Ext3 => f.write_str("ext3"),
            Self::Ext4 => f.write_str("ext4"),
            Self::Other(name) => f.write_str(name),
            Self::Unknown => f.write_str("unknown"),
        }
    }
}

/// Disk inspection collaborator.
#[async_trait]
pub trait DiskInspector: Send + Sync {
    /// List the partition device nodes of a block device, in table order.
    /// An empty list means the device is used whole.
    async fn list_partitions(&self, device: &Path) -> Result<Vec<PathBuf>, DiskError>;

    /// Identify the filesystem on a partition or unpartitioned device.
    async fn probe_filesystem(&self, device: &Path) -> Result<FilesystemType, DiskError>;

    /// Overwrite unused blocks of an unmounted ext filesystem with zeros.
    async fn zero_free_space(&self, device: &Path) -> Result<(), DiskError>;

    /// Command that writes a sparse NTFS image of `device` to stdout.
    fn ntfs_clone_command(&self, device: &Path) -> ToolCommand;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_probe() {
        assert_eq!(FilesystemType::from_probe("ntfs"), FilesystemType::Ntfs);
        assert_eq!(FilesystemType::from_probe("EXT4\n"), FilesystemType::Ext4);
        assert_eq!(FilesystemType::from_probe(""), FilesystemType::Unknown);
        assert_eq!(
            FilesystemType::from_probe("xfs"),
            FilesystemType::Other("xfs".to_string())
        );
    }
}
