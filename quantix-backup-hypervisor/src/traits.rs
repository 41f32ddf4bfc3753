//! Core hypervisor abstraction trait.

use async_trait::async_trait;

use crate::error::Result;
use crate::types::*;

/// Capabilities reported by a hypervisor backend.
#[derive(Debug, Clone)]
pub struct HypervisorCapabilities {
    /// Name of the backend (e.g., "libvirt", "virsh", "mock")
    pub name: String,
    /// Version string
    pub version: String,
}

/// Core hypervisor abstraction trait.
///
/// The backup orchestrator only needs inventory, power control, and the
/// domain definition, so this is the narrow slice of VM management it
/// consumes. VMs are addressed by name.
#[async_trait]
pub trait Hypervisor: Send + Sync {
    // =========================================================================
    // Capabilities & Health
    // =========================================================================
    
    /// Get hypervisor capabilities.
    async fn capabilities(&self) -> Result<HypervisorCapabilities>;
    
    /// Check if the hypervisor connection is healthy.
    async fn health_check(&self) -> Result<bool>;
    
    // =========================================================================
    // Inventory
    // =========================================================================
    
    /// List persistent VMs (running and shut off), in hypervisor order.
    /// Transient domains are omitted: they cannot be restarted once stopped.
    async fn list_vms(&self) -> Result<Vec<VmInfo>>;
    
    /// Get the current power state of a VM.
    async fn get_vm_state(&self, name: &str) -> Result<VmState>;
    
    // =========================================================================
    // Power Control
    // =========================================================================
    
    /// Request a graceful (ACPI) shutdown. Does not wait for completion.
    async fn shutdown_vm(&self, name: &str) -> Result<()>;
    
    /// Start a defined VM.
    async fn start_vm(&self, name: &str) -> Result<()>;
    
    // =========================================================================
    // Definition & Storage
    // =========================================================================
    
    /// Export the persistent domain definition as XML.
    async fn dump_xml(&self, name: &str) -> Result<String>;
    
    /// Enumerate the block-oriented storage targets attached to a VM.
    async fn list_block_targets(&self, name: &str) -> Result<Vec<BlockTarget>>;
}
