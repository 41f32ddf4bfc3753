//! Hypervisor backend driving the `virsh` command-line client.
//!
//! This is the default backend: it needs nothing beyond the libvirt client
//! tools on the host, which every KVM host running backups already has.

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, error, info, instrument};

use crate::error::{HypervisorError, Result};
use crate::traits::{Hypervisor, HypervisorCapabilities};
use crate::types::*;
use crate::xml::parse_block_targets;

/// Hypervisor backend that shells out to `virsh`.
pub struct VirshBackend {
    /// Libvirt connection URI passed with `--connect`
    uri: String,
    /// virsh binary path
    virsh_path: String,
}

impl VirshBackend {
    /// Create a backend for the given libvirt URI (e.g. `qemu:///system`).
    pub fn new(uri: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            virsh_path: "virsh".to_string(),
        }
    }
    
    /// Set the virsh binary path.
    pub fn with_virsh(mut self, path: impl Into<String>) -> Self {
        self.virsh_path = path.into();
        self
    }
    
    /// Run a virsh subcommand and return its stdout.
    async fn run_virsh(&self, args: &[&str]) -> std::result::Result<String, String> {
        debug!(command = %self.virsh_path, args = ?args, "Executing virsh");
        
        let output = Command::new(&self.virsh_path)
            .arg("--connect")
            .arg(&self.uri)
            .args(args)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| format!("Failed to execute {}: {}", self.virsh_path, e))?;
        
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            error!(args = ?args, stderr = %stderr.trim(), "virsh command failed");
            return Err(stderr.trim().to_string());
        }
        
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }
    
    /// Map a virsh failure for a named domain to the right error variant.
    fn domain_error(name: &str, stderr: String, fallback: fn(String) -> HypervisorError) -> HypervisorError {
        if stderr.contains("failed to get domain") || stderr.contains("Domain not found") {
            HypervisorError::VmNotFound(name.to_string())
        } else {
            fallback(format!("{}: {}", name, stderr))
        }
    }
}

/// Parse `virsh list --all --persistent --name` output: one name per line, blank-terminated.
fn parse_name_list(stdout: &str) -> Vec<String> {
    stdout
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect()
}

#[async_trait]
impl Hypervisor for VirshBackend {
    #[instrument(skip(self))]
    async fn capabilities(&self) -> Result<HypervisorCapabilities> {
        let version = self.run_virsh(&["--version"]).await
            .map_err(HypervisorError::ConnectionFailed)?;
        
        Ok(HypervisorCapabilities {
            name: "virsh".to_string(),
            version: version.trim().to_string(),
        })
    }
    
    #[instrument(skip(self))]
    async fn health_check(&self) -> Result<bool> {
        Ok(self.run_virsh(&["uri"]).await.is_ok())
    }
    
    #[instrument(skip(self))]
    async fn list_vms(&self) -> Result<Vec<VmInfo>> {
        let stdout = self.run_virsh(&["list", "--all", "--persistent", "--name"]).await
            .map_err(HypervisorError::QueryFailed)?;
        
        let mut vms = Vec::new();
        for name in parse_name_list(&stdout) {
            let id = self.run_virsh(&["domuuid", &name]).await
                .map_err(|e| Self::domain_error(&name, e, HypervisorError::QueryFailed))?;
            let state = self.get_vm_state(&name).await?;
            vms.push(VmInfo {
                id: id.trim().to_string(),
                name,
                state,
            });
        }
        
        debug!(count = vms.len(), "Listed VMs");
        Ok(vms)
    }
    
    #[instrument(skip(self), fields(vm = %name))]
    async fn get_vm_state(&self, name: &str) -> Result<VmState> {
        let stdout = self.run_virsh(&["domstate", name]).await
            .map_err(|e| Self::domain_error(name, e, HypervisorError::QueryFailed))?;
        
        Ok(VmState::from_virsh(&stdout))
    }
    
    #[instrument(skip(self), fields(vm = %name))]
    async fn shutdown_vm(&self, name: &str) -> Result<()> {
        info!("Requesting graceful shutdown");
        
        self.run_virsh(&["shutdown", name]).await
            .map_err(|e| Self::domain_error(name, e, HypervisorError::StopFailed))?;
        
        Ok(())
    }
    
    #[instrument(skip(self), fields(vm = %name))]
    async fn start_vm(&self, name: &str) -> Result<()> {
        info!("Starting VM");
        
        self.run_virsh(&["start", name]).await
            .map_err(|e| Self::domain_error(name, e, HypervisorError::StartFailed))?;
        
        info!("VM started");
        Ok(())
    }
    
    #[instrument(skip(self), fields(vm = %name))]
    async fn dump_xml(&self, name: &str) -> Result<String> {
        // --inactive exports the persistent definition rather than live state
        self.run_virsh(&["dumpxml", "--inactive", name]).await
            .map_err(|e| Self::domain_error(name, e, HypervisorError::QueryFailed))
    }
    
    #[instrument(skip(self), fields(vm = %name))]
    async fn list_block_targets(&self, name: &str) -> Result<Vec<BlockTarget>> {
        let xml = self.dump_xml(name).await?;
        parse_block_targets(&xml)
    }
}
