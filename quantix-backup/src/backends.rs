//! Collaborator construction.

use std::sync::{Arc, Mutex};

use anyhow::Result;
use tracing::{info, warn};

use quantix_backup_hypervisor::{
    BlockTarget, CallJournal, Hypervisor, MockBackend, MockVm, VirshBackend, VmState,
};

use crate::config::{Config, HypervisorBackend};
use crate::disk::{DiskInspector, FilesystemType, HostDiskTools, MockDiskInspector};
use crate::repository::{BorgRepository, MockRepository, Repository};

/// The external systems a backup run talks to.
#[derive(Clone)]
pub struct Backends {
    pub hypervisor: Arc<dyn Hypervisor>,
    pub disks: Arc<dyn DiskInspector>,
    pub repository: Arc<dyn Repository>,
}

impl Backends {
    /// Build the backends selected by the configuration.
    pub async fn from_config(config: &Config) -> Result<Self> {
        let hypervisor: Arc<dyn Hypervisor> = match config.hypervisor.backend {
            HypervisorBackend::Mock => {
                info!("Using mock backends");
                return Ok(Self::demo(Arc::new(Mutex::new(Vec::new()))));
            }
            HypervisorBackend::Libvirt => {
                #[cfg(feature = "libvirt")]
                {
                    info!(uri = %config.hypervisor.uri, "Connecting to libvirt");
                    Arc::new(quantix_backup_hypervisor::LibvirtBackend::new(&config.hypervisor.uri).await?)
                }
                #[cfg(not(feature = "libvirt"))]
                {
                    warn!("Libvirt backend requested but not compiled in, falling back to virsh");
                    Arc::new(VirshBackend::new(config.hypervisor.uri.clone()))
                }
            }
            HypervisorBackend::Virsh => {
                info!(uri = %config.hypervisor.uri, "Using virsh backend");
                Arc::new(VirshBackend::new(config.hypervisor.uri.clone()))
            }
        };

        match hypervisor.health_check().await {
            Ok(true) => {
                if let Ok(caps) = hypervisor.capabilities().await {
                    info!(name = %caps.name, version = %caps.version, "Hypervisor connected");
                }
            }
            Ok(false) => warn!("Hypervisor health check failed"),
            Err(e) => warn!(error = %e, "Hypervisor health check errored"),
        }

        Ok(Self {
            hypervisor,
            disks: Arc::new(HostDiskTools::new(config.tools.clone())),
            repository: Arc::new(BorgRepository::new(
                config.tools.borg.clone(),
                config.repository.passphrase.clone(),
            )),
        })
    }

    /// Seeded mocks for `--dev` runs.
    ///
    /// `db1` is running with a disk image and a partitioned pass-through
    /// disk; `web` is shut off with one ext4 pass-through disk.
    pub fn demo(journal: CallJournal) -> Self {
        let hypervisor = MockBackend::new()
            .with_journal(journal.clone())
            .with_vm(
                MockVm::new("db1", VmState::Running)
                    .with_target(BlockTarget::new("vda", "/var/lib/libvirt/images/db1.qcow2"))
                    .with_target(BlockTarget::new("vdb", "/dev/sdb"))
                    .with_shutdown_polls(Some(2)),
            )
            .with_vm(
                MockVm::new("web", VmState::Stopped)
                    .with_target(BlockTarget::new("vda", "/dev/sdc")),
            );

        let disks = MockDiskInspector::new()
            .with_journal(journal.clone())
            .with_partition("/dev/sdb", "/dev/sdb1", FilesystemType::Ntfs)
            .with_partition("/dev/sdb", "/dev/sdb2", FilesystemType::Ext4)
            .with_whole_disk("/dev/sdc", FilesystemType::Ext4);

        Self {
            hypervisor: Arc::new(hypervisor),
            disks: Arc::new(disks),
            repository: Arc::new(MockRepository::new().with_journal(journal)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mock_backend_selects_demo() {
        let mut config = Config::default();
        config.hypervisor.backend = HypervisorBackend::Mock;

        let backends = Backends::from_config(&config).await.unwrap();
        let names: Vec<String> = backends
            .hypervisor
            .list_vms()
            .await
            .unwrap()
            .into_iter()
            .map(|vm| vm.name)
            .collect();
        assert_eq!(names, vec!["db1", "web"]);
    }
}
