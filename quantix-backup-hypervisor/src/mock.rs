//! Mock hypervisor backend for testing and development.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use tracing::{debug, info, instrument};

use crate::error::{HypervisorError, Result};
use crate::traits::{Hypervisor, HypervisorCapabilities};
use crate::types::*;

/// Ordered record of collaborator calls, shared between mocks so tests can
/// assert the interleaving of hypervisor, disk, and repository operations.
pub type CallJournal = Arc<Mutex<Vec<String>>>;

/// Append an entry to a journal, ignoring a poisoned lock.
pub fn record(journal: &CallJournal, entry: impl Into<String>) {
    if let Ok(mut calls) = journal.lock() {
        calls.push(entry.into());
    }
}

/// Mock hypervisor backend.
///
/// This backend simulates VM inventory and power control in memory without
/// requiring libvirt. Useful for:
/// - Unit and integration testing of the backup orchestrator
/// - Dry runs of the backup pipeline with `--dev`
pub struct MockBackend {
    vms: RwLock<Vec<MockVm>>,
    journal: CallJournal,
    /// Fail every `list_vms` call (simulates a dead hypervisor)
    fail_listing: bool,
}

/// A simulated VM definition.
#[derive(Debug, Clone)]
pub struct MockVm {
    pub id: String,
    pub name: String,
    pub state: VmState,
    pub targets: Vec<BlockTarget>,
    /// Number of state polls a requested shutdown takes to complete.
    /// `None` means the guest ignores ACPI and never powers off.
    pub shutdown_polls: Option<u32>,
    /// Fail state and storage queries for this VM
    pub broken: bool,
    /// Fail `start_vm` for this VM
    pub start_fails: bool,
    /// Fail `dump_xml` for this VM
    pub export_fails: bool,
    pending_shutdown: Option<u32>,
}

impl MockVm {
    /// Create a simulated VM in the given state with no disks.
    pub fn new(name: impl Into<String>, state: VmState) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.into(),
            state,
            targets: Vec::new(),
            shutdown_polls: Some(1),
            broken: false,
            start_fails: false,
            export_fails: false,
            pending_shutdown: None,
        }
    }
    
    /// Attach a disk target.
    pub fn with_target(mut self, target: BlockTarget) -> Self {
        self.targets.push(target);
        self
    }
    
    /// Set how many polls a shutdown takes (`None` = never completes).
    pub fn with_shutdown_polls(mut self, polls: Option<u32>) -> Self {
        self.shutdown_polls = polls;
        self
    }
    
    /// Make state and storage queries fail.
    pub fn broken(mut self) -> Self {
        self.broken = true;
        self
    }
    
    /// Make `start_vm` fail.
    pub fn failing_start(mut self) -> Self {
        self.start_fails = true;
        self
    }
    
    /// Make `dump_xml` fail.
    pub fn failing_export(mut self) -> Self {
        self.export_fails = true;
        self
    }
    
    fn domain_xml(&self) -> String {
        let mut xml = format!(
            "<domain type='kvm'>\n  <name>{}</name>\n  <uuid>{}</uuid>\n  <devices>\n",
            self.name, self.id
        );
        for target in &self.targets {
            let source = match target.source.as_deref() {
                Some(path) if path.starts_with("/dev/") => format!("<source dev='{}'/>", path),
                Some(path) => format!("<source file='{}'/>", path),
                None => String::new(),
            };
            xml.push_str(&format!(
                "    <disk type='file' device='disk'>{}<target dev='{}'/></disk>\n",
                source, target.target
            ));
        }
        xml.push_str("  </devices>\n</domain>\n");
        xml
    }
}

impl MockBackend {
    /// Create a new mock backend with no VMs.
    pub fn new() -> Self {
        info!("Creating mock hypervisor backend");
        Self {
            vms: RwLock::new(Vec::new()),
            journal: Arc::new(Mutex::new(Vec::new())),
            fail_listing: false,
        }
    }
    
    /// Record calls into a journal shared with other mocks.
    pub fn with_journal(mut self, journal: CallJournal) -> Self {
        self.journal = journal;
        self
    }
    
    /// Add a VM definition. Listing order follows insertion order.
    pub fn with_vm(self, vm: MockVm) -> Self {
        if let Ok(mut vms) = self.vms.write() {
            vms.push(vm);
        }
        self
    }
    
    /// Make `list_vms` fail.
    pub fn with_failing_listing(mut self) -> Self {
        self.fail_listing = true;
        self
    }
    
    /// Snapshot of all recorded calls.
    pub fn calls(&self) -> Vec<String> {
        self.journal.lock().map(|c| c.clone()).unwrap_or_default()
    }
    
    /// Current simulated state of a VM, without recording a call.
    pub fn peek_state(&self, name: &str) -> Option<VmState> {
        let vms = self.vms.read().ok()?;
        vms.iter().find(|vm| vm.name == name).map(|vm| vm.state)
    }
    
    fn with_vm_mut<T>(&self, name: &str, f: impl FnOnce(&mut MockVm) -> Result<T>) -> Result<T> {
        let mut vms = self.vms.write().map_err(|_| {
            HypervisorError::Internal("Lock poisoned".to_string())
        })?;
        
        let vm = vms.iter_mut()
            .find(|vm| vm.name == name)
            .ok_or_else(|| HypervisorError::VmNotFound(name.to_string()))?;
        
        f(vm)
    }
}

impl Default for MockBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Hypervisor for MockBackend {
    async fn capabilities(&self) -> Result<HypervisorCapabilities> {
        Ok(HypervisorCapabilities {
            name: "mock".to_string(),
            version: "1.0.0".to_string(),
        })
    }
    
    async fn health_check(&self) -> Result<bool> {
        Ok(!self.fail_listing)
    }
    
    async fn list_vms(&self) -> Result<Vec<VmInfo>> {
        record(&self.journal, "list_vms");
        
        if self.fail_listing {
            return Err(HypervisorError::ConnectionFailed("mock listing failure".to_string()));
        }
        
        let vms = self.vms.read().map_err(|_| {
            HypervisorError::Internal("Lock poisoned".to_string())
        })?;
        
        Ok(vms.iter()
            .map(|vm| VmInfo {
                id: vm.id.clone(),
                name: vm.name.clone(),
                state: vm.state,
            })
            .collect())
    }
    
    #[instrument(skip(self), fields(vm = %name))]
    async fn get_vm_state(&self, name: &str) -> Result<VmState> {
        record(&self.journal, format!("state {}", name));
        
        self.with_vm_mut(name, |vm| {
            if vm.broken {
                return Err(HypervisorError::QueryFailed(format!("{}: mock query failure", name)));
            }
            
            if let Some(remaining) = vm.pending_shutdown {
                if remaining <= 1 {
                    vm.pending_shutdown = None;
                    vm.state = VmState::Stopped;
                } else {
                    vm.pending_shutdown = Some(remaining - 1);
                }
            }
            
            debug!(state = %vm.state, "Mock VM state");
            Ok(vm.state)
        })
    }
    
    #[instrument(skip(self), fields(vm = %name))]
    async fn shutdown_vm(&self, name: &str) -> Result<()> {
        record(&self.journal, format!("shutdown {}", name));
        
        self.with_vm_mut(name, |vm| {
            if vm.state != VmState::Running {
                return Err(HypervisorError::InvalidState("VM is not running".to_string()));
            }
            vm.pending_shutdown = vm.shutdown_polls;
            info!("Mock VM shutdown requested");
            Ok(())
        })
    }
    
    #[instrument(skip(self), fields(vm = %name))]
    async fn start_vm(&self, name: &str) -> Result<()> {
        record(&self.journal, format!("start {}", name));
        
        self.with_vm_mut(name, |vm| {
            if vm.start_fails {
                return Err(HypervisorError::StartFailed(format!("{}: mock start failure", name)));
            }
            if vm.state == VmState::Running {
                return Err(HypervisorError::InvalidState("VM is already running".to_string()));
            }
            vm.state = VmState::Running;
            info!("Mock VM started");
            Ok(())
        })
    }
    
    async fn dump_xml(&self, name: &str) -> Result<String> {
        record(&self.journal, format!("dump_xml {}", name));
        self.with_vm_mut(name, |vm| {
            if vm.export_fails {
                return Err(HypervisorError::QueryFailed(format!("{}: mock dumpxml failure", name)));
            }
            Ok(vm.domain_xml())
        })
    }
    
    async fn list_block_targets(&self, name: &str) -> Result<Vec<BlockTarget>> {
        record(&self.journal, format!("list_block_targets {}", name));
        
        self.with_vm_mut(name, |vm| {
            if vm.broken {
                return Err(HypervisorError::QueryFailed(format!("{}: mock query failure", name)));
            }
            Ok(vm.targets.clone())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::xml::parse_block_targets;
    
    #[tokio::test]
    async fn test_list_preserves_insertion_order() {
        let backend = MockBackend::new()
            .with_vm(MockVm::new("web", VmState::Running))
            .with_vm(MockVm::new("db", VmState::Stopped));
        
        let names: Vec<String> = backend.list_vms().await.unwrap()
            .into_iter()
            .map(|vm| vm.name)
            .collect();
        assert_eq!(names, vec!["web", "db"]);
    }
    
    #[tokio::test]
    async fn test_shutdown_completes_after_polls() {
        let backend = MockBackend::new()
            .with_vm(MockVm::new("web", VmState::Running).with_shutdown_polls(Some(3)));
        
        backend.shutdown_vm("web").await.unwrap();
        assert_eq!(backend.get_vm_state("web").await.unwrap(), VmState::Running);
        assert_eq!(backend.get_vm_state("web").await.unwrap(), VmState::Running);
        assert_eq!(backend.get_vm_state("web").await.unwrap(), VmState::Stopped);
        
        backend.start_vm("web").await.unwrap();
        assert_eq!(backend.peek_state("web"), Some(VmState::Running));
    }
    
    #[tokio::test]
    async fn test_unknown_vm() {
        let backend = MockBackend::new();
        let result = backend.get_vm_state("ghost").await;
        assert!(matches!(result, Err(HypervisorError::VmNotFound(_))));
    }
    
    #[tokio::test]
    async fn test_dump_xml_roundtrips_targets() {
        let backend = MockBackend::new().with_vm(
            MockVm::new("db1", VmState::Stopped)
                .with_target(BlockTarget::new("vda", "/images/db1.qcow2"))
                .with_target(BlockTarget::new("sdb", "/dev/sdb")),
        );
        
        let xml = backend.dump_xml("db1").await.unwrap();
        let parsed = parse_block_targets(&xml).unwrap();
        assert_eq!(parsed, backend.list_block_targets("db1").await.unwrap());
    }
    
    #[tokio::test]
    async fn test_failing_export() {
        let backend = MockBackend::new()
            .with_vm(MockVm::new("db1", VmState::Stopped).failing_export());
        
        assert!(matches!(backend.dump_xml("db1").await, Err(HypervisorError::QueryFailed(_))));
        assert!(backend.list_block_targets("db1").await.is_ok());
    }
    
    #[tokio::test]
    async fn test_journal_records_calls() {
        let journal: CallJournal = Arc::new(Mutex::new(Vec::new()));
        let backend = MockBackend::new()
            .with_journal(journal.clone())
            .with_vm(MockVm::new("web", VmState::Stopped));
        
        backend.start_vm("web").await.unwrap();
        assert_eq!(journal.lock().unwrap().as_slice(), ["start web"]);
    }
}
