//! In-memory disk inspector for tests and development runs.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use quantix_backup_hypervisor::{record, CallJournal};

use super::{DiskError, DiskInspector, FilesystemType};
use crate::process::{ToolCommand, ToolError};

/// Simulated host block devices.
pub struct MockDiskInspector {
    partitions: HashMap<PathBuf, Vec<PathBuf>>,
    filesystems: HashMap<PathBuf, FilesystemType>,
    failing: HashSet<PathBuf>,
    failing_zero_free: HashSet<PathBuf>,
    journal: CallJournal,
}

impl MockDiskInspector {
    /// Create an inspector that knows no devices.
    pub fn new() -> Self {
        Self {
            partitions: HashMap::new(),
            filesystems: HashMap::new(),
            failing: HashSet::new(),
            failing_zero_free: HashSet::new(),
            journal: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Record calls into a journal shared with other mocks.
    pub fn with_journal(mut self, journal: CallJournal) -> Self {
        self.journal = journal;
        self
    }

    /// Declare a partition of `device` carrying `filesystem`.
    pub fn with_partition(
        mut self,
        device: impl Into<PathBuf>,
        partition: impl Into<PathBuf>,
        filesystem: FilesystemType,
    ) -> Self {
        let partition = partition.into();
        self.partitions.entry(device.into()).or_default().push(partition.clone());
        self.filesystems.insert(partition, filesystem);
        self
    }

    /// Declare an unpartitioned device carrying `filesystem`.
    pub fn with_whole_disk(mut self, device: impl Into<PathBuf>, filesystem: FilesystemType) -> Self {
        self.filesystems.insert(device.into(), filesystem);
        self
    }

    /// Make every operation on `device` fail.
    pub fn with_failing(mut self, device: impl Into<PathBuf>) -> Self {
        self.failing.insert(device.into());
        self
    }

    /// Make only the zerofree pass on `device` fail.
    pub fn with_failing_zero_free(mut self, device: impl Into<PathBuf>) -> Self {
        self.failing_zero_free.insert(device.into());
        self
    }

    fn check(&self, tool: &str, device: &Path) -> Result<(), DiskError> {
        if self.failing.contains(device)
            || (tool == "zerofree" && self.failing_zero_free.contains(device))
        {
            return Err(DiskError::Tool(ToolError::Failed {
                program: tool.to_string(),
                status: "exit status: 1".to_string(),
                code: Some(1),
                stderr: format!("{}: mock failure", device.display()),
            }));
        }
        Ok(())
    }
}

impl Default for MockDiskInspector {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DiskInspector for MockDiskInspector {
    async fn list_partitions(&self, device: &Path) -> Result<Vec<PathBuf>, DiskError> {
        record(&self.journal, format!("list_partitions {}", device.display()));
        self.check("lsblk", device)?;
        Ok(self.partitions.get(device).cloned().unwrap_or_default())
    }

    async fn probe_filesystem(&self, device: &Path) -> Result<FilesystemType, DiskError> {
        record(&self.journal, format!("probe {}", device.display()));
        self.check("blkid", device)?;
        Ok(self.filesystems.get(device).cloned().unwrap_or(FilesystemType::Unknown))
    }

    async fn zero_free_space(&self, device: &Path) -> Result<(), DiskError> {
        record(&self.journal, format!("zerofree {}", device.display()));
        self.check("zerofree", device)
    }

    fn ntfs_clone_command(&self, device: &Path) -> ToolCommand {
        ToolCommand::new("ntfsclone")
            .args(["--save-image", "--output", "-"])
            .arg(device)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_declared_layout() {
        let disks = MockDiskInspector::new()
            .with_partition("/dev/sdb", "/dev/sdb1", FilesystemType::Ntfs)
            .with_partition("/dev/sdb", "/dev/sdb2", FilesystemType::Ext4)
            .with_whole_disk("/dev/sdc", FilesystemType::Ext4);

        let parts = disks.list_partitions(Path::new("/dev/sdb")).await.unwrap();
        assert_eq!(parts, vec![PathBuf::from("/dev/sdb1"), PathBuf::from("/dev/sdb2")]);
        assert!(disks.list_partitions(Path::new("/dev/sdc")).await.unwrap().is_empty());
        assert_eq!(
            disks.probe_filesystem(Path::new("/dev/sdb1")).await.unwrap(),
            FilesystemType::Ntfs
        );
        assert_eq!(
            disks.probe_filesystem(Path::new("/dev/sdz")).await.unwrap(),
            FilesystemType::Unknown
        );
    }

    #[tokio::test]
    async fn test_failing_device() {
        let disks = MockDiskInspector::new().with_failing("/dev/sdb");
        assert!(disks.list_partitions(Path::new("/dev/sdb")).await.is_err());
        assert!(disks.zero_free_space(Path::new("/dev/sdb")).await.is_err());
    }

    #[tokio::test]
    async fn test_failing_zero_free_only() {
        let disks = MockDiskInspector::new()
            .with_partition("/dev/sdb", "/dev/sdb1", FilesystemType::Ext4)
            .with_failing_zero_free("/dev/sdb1");

        assert_eq!(
            disks.probe_filesystem(Path::new("/dev/sdb1")).await.unwrap(),
            FilesystemType::Ext4
        );
        assert!(disks.zero_free_space(Path::new("/dev/sdb1")).await.is_err());
    }
}
