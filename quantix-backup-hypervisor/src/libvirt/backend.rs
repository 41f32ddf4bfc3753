//! Libvirt C API backend.

use async_trait::async_trait;
use tracing::{debug, info, instrument};
use virt::connect::Connect;
use virt::domain::Domain;
use virt::sys;

use crate::error::{HypervisorError, Result};
use crate::traits::{Hypervisor, HypervisorCapabilities};
use crate::types::*;
use crate::xml::parse_block_targets;

/// Hypervisor backend holding one libvirt connection for the whole run.
pub struct LibvirtBackend {
    uri: String,
    connection: Connect,
}

impl LibvirtBackend {
    /// Open a connection, e.g. `qemu:///system` or `qemu+ssh://root@kvm1/system`.
    pub async fn new(uri: &str) -> Result<Self> {
        let connection = Connect::open(Some(uri))
            .map_err(|e| HypervisorError::ConnectionFailed(format!("{}: {}", uri, e)))?;
        
        info!(uri = %uri, "Opened libvirt connection");
        Ok(Self {
            uri: uri.to_string(),
            connection,
        })
    }
    
    fn domain(&self, name: &str) -> Result<Domain> {
        Domain::lookup_by_name(&self.connection, name)
            .map_err(|e| HypervisorError::VmNotFound(format!("{}: {}", name, e)))
    }
    
    fn power_state(domain: &Domain) -> Result<VmState> {
        let (state, _reason) = domain.get_state()
            .map_err(|e| HypervisorError::QueryFailed(e.to_string()))?;
        
        // An in-progress shutdown still counts as running until it finishes
        Ok(match state {
            sys::VIR_DOMAIN_SHUTOFF => VmState::Stopped,
            sys::VIR_DOMAIN_RUNNING | sys::VIR_DOMAIN_BLOCKED | sys::VIR_DOMAIN_SHUTDOWN => {
                VmState::Running
            }
            sys::VIR_DOMAIN_PAUSED => VmState::Paused,
            sys::VIR_DOMAIN_PMSUSPENDED => VmState::Suspended,
            sys::VIR_DOMAIN_CRASHED => VmState::Crashed,
            _ => VmState::Unknown,
        })
    }
    
    fn describe(domain: &Domain) -> Result<VmInfo> {
        let name = domain.get_name()
            .map_err(|e| HypervisorError::QueryFailed(e.to_string()))?;
        let id = domain.get_uuid_string()
            .map_err(|e| HypervisorError::QueryFailed(format!("{}: {}", name, e)))?;
        let state = Self::power_state(domain)?;
        
        Ok(VmInfo { id, name, state })
    }
}

#[async_trait]
impl Hypervisor for LibvirtBackend {
    async fn capabilities(&self) -> Result<HypervisorCapabilities> {
        // libvirt encodes versions as major * 1_000_000 + minor * 1_000 + release
        let encoded = self.connection.get_lib_version()
            .map_err(|e| HypervisorError::QueryFailed(e.to_string()))?;
        
        Ok(HypervisorCapabilities {
            name: format!("libvirt ({})", self.uri),
            version: format!(
                "{}.{}.{}",
                encoded / 1_000_000,
                encoded / 1_000 % 1_000,
                encoded % 1_000
            ),
        })
    }
    
    async fn health_check(&self) -> Result<bool> {
        Ok(self.connection.is_alive().unwrap_or(false))
    }
    
    #[instrument(skip(self))]
    async fn list_vms(&self) -> Result<Vec<VmInfo>> {
        let domains = self.connection
            .list_all_domains(sys::VIR_CONNECT_LIST_DOMAINS_PERSISTENT)
            .map_err(|e| HypervisorError::QueryFailed(e.to_string()))?;
        
        let vms = domains.iter()
            .map(Self::describe)
            .collect::<Result<Vec<_>>>()?;
        
        debug!(count = vms.len(), "Listed defined domains");
        Ok(vms)
    }
    
    #[instrument(skip(self), fields(vm = %name))]
    async fn get_vm_state(&self, name: &str) -> Result<VmState> {
        Self::power_state(&self.domain(name)?)
    }
    
    #[instrument(skip(self), fields(vm = %name))]
    async fn shutdown_vm(&self, name: &str) -> Result<()> {
        self.domain(name)?
            .shutdown()
            .map_err(|e| HypervisorError::StopFailed(format!("{}: {}", name, e)))?;
        
        info!("ACPI shutdown requested");
        Ok(())
    }
    
    #[instrument(skip(self), fields(vm = %name))]
    async fn start_vm(&self, name: &str) -> Result<()> {
        self.domain(name)?
            .create()
            .map_err(|e| HypervisorError::StartFailed(format!("{}: {}", name, e)))?;
        
        info!("Domain started");
        Ok(())
    }
    
    #[instrument(skip(self), fields(vm = %name))]
    async fn dump_xml(&self, name: &str) -> Result<String> {
        self.domain(name)?
            .get_xml_desc(sys::VIR_DOMAIN_XML_INACTIVE)
            .map_err(|e| HypervisorError::QueryFailed(format!("{}: {}", name, e)))
    }
    
    #[instrument(skip(self), fields(vm = %name))]
    async fn list_block_targets(&self, name: &str) -> Result<Vec<BlockTarget>> {
        let xml = self.dump_xml(name).await?;
        parse_block_targets(&xml)
    }
}
