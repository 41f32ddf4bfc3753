//! Libvirt hypervisor backend.
//!
//! This module talks to libvirtd through the C API instead of spawning
//! `virsh`. It requires the `libvirt` feature to be enabled and the system
//! to have libvirt installed.

#[cfg(feature = "libvirt")]
mod backend;

#[cfg(feature = "libvirt")]
pub use backend::LibvirtBackend;
