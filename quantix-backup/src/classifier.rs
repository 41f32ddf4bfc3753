//! Storage classification.
//!
//! Turns a machine's attached storage into archivable items: virtual disk
//! files, whole pass-through block devices, and the partitions of
//! partitioned block devices.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, info, instrument, warn};

use quantix_backup_hypervisor::Hypervisor;

use crate::disk::{DiskInspector, FilesystemType};
use crate::error::{BackupError, Result};
use crate::repository::ArchiveKind;

/// Host device namespace.
const DEVICE_ROOT: &str = "/dev";

/// What kind of storage an item is.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageCategory {
    /// Image file on a host filesystem
    VirtualDiskFile,
    /// Pass-through device with no partition table, archived whole
    BlockDevice,
    /// One partition of a pass-through device
    Partition { parent: PathBuf },
}

/// One archivable piece of a machine's storage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageItem {
    pub path: PathBuf,
    pub category: StorageCategory,
    /// Probed filesystem; always `None` for virtual disk files
    pub filesystem: Option<FilesystemType>,
}

impl StorageItem {
    pub fn virtual_disk(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            category: StorageCategory::VirtualDiskFile,
            filesystem: None,
        }
    }

    pub fn block_device(path: impl Into<PathBuf>, filesystem: FilesystemType) -> Self {
        Self {
            path: path.into(),
            category: StorageCategory::BlockDevice,
            filesystem: Some(filesystem),
        }
    }

    pub fn partition(
        path: impl Into<PathBuf>,
        parent: impl Into<PathBuf>,
        filesystem: FilesystemType,
    ) -> Self {
        Self {
            path: path.into(),
            category: StorageCategory::Partition {
                parent: parent.into(),
            },
            filesystem: Some(filesystem),
        }
    }

    pub fn is_block(&self) -> bool {
        !matches!(self.category, StorageCategory::VirtualDiskFile)
    }

    /// Archive set an item of this category belongs to.
    pub fn archive_kind(&self) -> ArchiveKind {
        match self.category {
            StorageCategory::VirtualDiskFile => ArchiveKind::Bundle,
            StorageCategory::BlockDevice => ArchiveKind::Disk,
            StorageCategory::Partition { .. } => ArchiveKind::Partition,
        }
    }

    /// Short name used in archive names (`sdb1`, `ata-WDC_...-part1`).
    pub fn subject(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.path.display().to_string())
    }
}

/// Classifies a machine's storage using the hypervisor and host disk tools.
pub struct StorageClassifier {
    hypervisor: Arc<dyn Hypervisor>,
    disks: Arc<dyn DiskInspector>,
}

impl StorageClassifier {
    pub fn new(hypervisor: Arc<dyn Hypervisor>, disks: Arc<dyn DiskInspector>) -> Self {
        Self { hypervisor, disks }
    }

    /// Classify every backed storage target of `vm`, in attachment order.
    #[instrument(skip(self))]
    pub async fn classify(&self, vm: &str) -> Result<Vec<StorageItem>> {
        let targets = self
            .hypervisor
            .list_block_targets(vm)
            .await
            .map_err(|source| BackupError::Discovery {
                vm: vm.to_string(),
                source,
            })?;

        let mut seen = HashSet::new();
        let mut items = Vec::new();

        for target in targets {
            let Some(source) = target.source else {
                debug!(target = %target.target, "Skipping target without a backing source");
                continue;
            };
            let path = PathBuf::from(source);
            if !seen.insert(path.clone()) {
                continue;
            }

            if path.starts_with(DEVICE_ROOT) {
                items.extend(self.classify_device(&path).await);
            } else {
                items.push(StorageItem::virtual_disk(path));
            }
        }

        info!(items = items.len(), "Classified storage");
        Ok(items)
    }

    async fn classify_device(&self, device: &Path) -> Vec<StorageItem> {
        let partitions = match self.disks.list_partitions(device).await {
            Ok(partitions) => partitions,
            Err(e) => {
                warn!(
                    device = %device.display(),
                    error = %e,
                    "Partition listing failed, archiving the whole device"
                );
                Vec::new()
            }
        };

        if partitions.is_empty() {
            let filesystem = self.probe(device).await;
            return vec![StorageItem::block_device(device, filesystem)];
        }

        let mut items = Vec::with_capacity(partitions.len());
        for partition in partitions {
            let filesystem = self.probe(&partition).await;
            items.push(StorageItem::partition(partition, device, filesystem));
        }
        items
    }

    async fn probe(&self, device: &Path) -> FilesystemType {
        match self.disks.probe_filesystem(device).await {
            Ok(filesystem) => {
                debug!(device = %device.display(), filesystem = %filesystem, "Probed filesystem");
                filesystem
            }
            Err(e) => {
                warn!(device = %device.display(), error = %e, "Filesystem probe failed");
                FilesystemType::Unknown
            }
        }
    }
}
