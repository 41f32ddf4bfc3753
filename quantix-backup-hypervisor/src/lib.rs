//! # quantix-backup Hypervisor
//!
//! Hypervisor abstraction layer used by the backup orchestrator to list
//! machines, drive their power state, and read their disk layout.
//!
//! ## Backends
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │          Hypervisor Trait               │
//! │ (list_vms, shutdown_vm, start_vm, ...)  │
//! └─────────────────────┬───────────────────┘
//!                       │
//!         ┌─────────────┼─────────────┐
//!         ▼             ▼             ▼
//! ┌──────────────┐ ┌───────────┐ ┌───────────┐
//! │ VirshBackend │ │  Libvirt  │ │   Mock    │
//! │ (virsh CLI)  │ │ (C API)   │ │ (memory)  │
//! └──────────────┘ └───────────┘ └───────────┘
//! ```
//!
//! ## Usage
//!
//! ```rust,ignore
//! use quantix_backup_hypervisor::{Hypervisor, VirshBackend};
//!
//! let backend = VirshBackend::new("qemu:///system");
//! for vm in backend.list_vms().await? {
//!     println!("{} is {}", vm.name, vm.state);
//! }
//! ```

pub mod error;
pub mod traits;
pub mod types;
pub mod mock;
pub mod libvirt;
pub mod virsh;
pub mod xml;

pub use error::HypervisorError;
pub use traits::{Hypervisor, HypervisorCapabilities};
pub use types::*;
pub use mock::{record, CallJournal, MockBackend, MockVm};
pub use virsh::VirshBackend;

// Re-export libvirt backend when available
#[cfg(feature = "libvirt")]
pub use libvirt::LibvirtBackend;
