//! Hypervisor error types.

use thiserror::Error;

/// Errors from hypervisor backends.
#[derive(Error, Debug)]
pub enum HypervisorError {
    /// The hypervisor could not be reached.
    #[error("Hypervisor connection failed: {0}")]
    ConnectionFailed(String),
    
    /// No domain with the given name is defined.
    #[error("VM not found: {0}")]
    VmNotFound(String),
    
    /// The domain could not be started.
    #[error("Failed to start VM: {0}")]
    StartFailed(String),
    
    /// The shutdown request was rejected.
    #[error("Shutdown request failed: {0}")]
    StopFailed(String),
    
    /// A state, inventory, or definition query failed.
    #[error("Hypervisor query failed: {0}")]
    QueryFailed(String),
    
    /// The domain is not in a state that allows the operation.
    #[error("Operation not allowed in current VM state: {0}")]
    InvalidState(String),
    
    /// The domain XML could not be parsed.
    #[error("Malformed domain XML: {0}")]
    XmlError(String),
    
    /// Unexpected backend failure.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type alias for hypervisor operations.
pub type Result<T> = std::result::Result<T, HypervisorError>;
