//! Archive strategy selection.
//!
//! | category      | filesystem     | strategy                               |
//! |---------------|----------------|----------------------------------------|
//! | disk file     | -              | `PlainFiles`, bundled with the config  |
//! | block / part. | ntfs           | `NtfsClone`, streamed into the archive |
//! | block / part. | ext2/3/4       | `RawSpecial`, zerofree pre-pass        |
//! | block / part. | other, unknown | `RawSpecial`                           |

use std::fmt;
use std::path::Path;
use std::sync::Arc;

use tracing::{info, instrument};

use crate::classifier::{StorageCategory, StorageItem};
use crate::disk::{DiskError, DiskInspector, FilesystemType};
use crate::repository::ArchiveSource;

/// How a storage item becomes archive input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    /// Archive files by content.
    PlainFiles,
    /// Read the device node as a file, optionally zeroing free space first.
    RawSpecial { zero_free_space: bool },
    /// Stream a sparse `ntfsclone` image.
    NtfsClone,
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PlainFiles => f.write_str("plain-files"),
            Self::RawSpecial { .. } => f.write_str("raw-special"),
            Self::NtfsClone => f.write_str("ntfs-clone"),
        }
    }
}

/// Pick the strategy for an item. Pure and total.
pub fn select_strategy(item: &StorageItem) -> Strategy {
    match (&item.category, &item.filesystem) {
        (StorageCategory::VirtualDiskFile, _) => Strategy::PlainFiles,
        (StorageCategory::BlockDevice | StorageCategory::Partition { .. }, filesystem) => {
            match filesystem {
                Some(FilesystemType::Ntfs) => Strategy::NtfsClone,
                Some(FilesystemType::Ext2 | FilesystemType::Ext3 | FilesystemType::Ext4) => {
                    Strategy::RawSpecial { zero_free_space: true }
                }
                Some(FilesystemType::Other(_) | FilesystemType::Unknown) | None => {
                    Strategy::RawSpecial { zero_free_space: false }
                }
            }
        }
    }
}

/// Carries out strategies against the host disk tools.
pub struct ArchiveStrategySelector {
    disks: Arc<dyn DiskInspector>,
}

impl ArchiveStrategySelector {
    pub fn new(disks: Arc<dyn DiskInspector>) -> Self {
        Self { disks }
    }

    pub fn select(&self, item: &StorageItem) -> Strategy {
        select_strategy(item)
    }

    /// Run the strategy's preparation step, if any. Returns whether a step ran.
    #[instrument(skip(self, item), fields(device = %item.path.display()))]
    pub async fn pre_pass(&self, item: &StorageItem, strategy: Strategy) -> Result<bool, DiskError> {
        match strategy {
            Strategy::RawSpecial { zero_free_space: true } => {
                info!("Zeroing free space");
                self.disks.zero_free_space(&item.path).await?;
                Ok(true)
            }
            Strategy::RawSpecial { zero_free_space: false }
            | Strategy::PlainFiles
            | Strategy::NtfsClone => Ok(false),
        }
    }

    /// Archive input for a block item.
    pub fn block_source(&self, item: &StorageItem, strategy: Strategy) -> ArchiveSource {
        match strategy {
            Strategy::NtfsClone => ArchiveSource::Stream {
                producer: self.disks.ntfs_clone_command(&item.path),
                stdin_name: format!("{}.ntfsclone", item.subject()),
            },
            Strategy::RawSpecial { .. } => ArchiveSource::Special(item.path.clone()),
            Strategy::PlainFiles => ArchiveSource::Files(vec![item.path.clone()]),
        }
    }

    /// Archive input for the configuration plus virtual disk bundle.
    pub fn bundle_source<'a>(
        &self,
        config: Option<&Path>,
        disks: impl IntoIterator<Item = &'a StorageItem>,
    ) -> ArchiveSource {
        let mut paths: Vec<_> = config.map(Path::to_path_buf).into_iter().collect();
        paths.extend(disks.into_iter().map(|item| item.path.clone()));
        ArchiveSource::Files(paths)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::disk::MockDiskInspector;
    use quantix_backup_hypervisor::CallJournal;
    use std::path::PathBuf;
    use std::sync::Mutex;

    #[test]
    fn test_strategy_table() {
        let cases = [
            (StorageItem::virtual_disk("/images/a.qcow2"), Strategy::PlainFiles),
            (StorageItem::partition("/dev/sdb1", "/dev/sdb", FilesystemType::Ntfs), Strategy::NtfsClone),
            (StorageItem::block_device("/dev/sdc", FilesystemType::Ntfs), Strategy::NtfsClone),
            (
                StorageItem::partition("/dev/sdb2", "/dev/sdb", FilesystemType::Ext3),
                Strategy::RawSpecial { zero_free_space: true },
            ),
            (
                StorageItem::block_device("/dev/sdd", FilesystemType::Ext4),
                Strategy::RawSpecial { zero_free_space: true },
            ),
            (
                StorageItem::block_device("/dev/sde", FilesystemType::Other("xfs".to_string())),
                Strategy::RawSpecial { zero_free_space: false },
            ),
            (
                StorageItem::partition("/dev/sdb3", "/dev/sdb", FilesystemType::Unknown),
                Strategy::RawSpecial { zero_free_space: false },
            ),
        ];

        for (item, expected) in cases {
            assert_eq!(select_strategy(&item), expected, "{}", item.path.display());
            // Deterministic
            assert_eq!(select_strategy(&item), select_strategy(&item));
        }
    }

    #[tokio::test]
    async fn test_pre_pass_only_for_ext() {
        let journal: CallJournal = Arc::new(Mutex::new(Vec::new()));
        let selector = ArchiveStrategySelector::new(Arc::new(
            MockDiskInspector::new().with_journal(journal.clone()),
        ));

        let ext = StorageItem::partition("/dev/sdb2", "/dev/sdb", FilesystemType::Ext4);
        let ntfs = StorageItem::partition("/dev/sdb1", "/dev/sdb", FilesystemType::Ntfs);

        assert!(selector.pre_pass(&ext, selector.select(&ext)).await.unwrap());
        assert!(!selector.pre_pass(&ntfs, selector.select(&ntfs)).await.unwrap());
        assert_eq!(journal.lock().unwrap().as_slice(), ["zerofree /dev/sdb2"]);
    }

    #[test]
    fn test_sources() {
        let selector = ArchiveStrategySelector::new(Arc::new(MockDiskInspector::new()));

        let ntfs = StorageItem::partition("/dev/sdb1", "/dev/sdb", FilesystemType::Ntfs);
        match selector.block_source(&ntfs, Strategy::NtfsClone) {
            ArchiveSource::Stream { producer, stdin_name } => {
                assert_eq!(producer.program(), "ntfsclone");
                assert_eq!(stdin_name, "sdb1.ntfsclone");
            }
            other => panic!("unexpected source: {:?}", other),
        }

        let disks = [StorageItem::virtual_disk("/images/a.qcow2")];
        match selector.bundle_source(Some(Path::new("/tmp/w/db1.xml")), &disks) {
            ArchiveSource::Files(paths) => assert_eq!(paths, vec![
                PathBuf::from("/tmp/w/db1.xml"),
                PathBuf::from("/images/a.qcow2"),
            ]),
            other => panic!("unexpected source: {:?}", other),
        }
    }
}
