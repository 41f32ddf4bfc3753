//! Error taxonomy for a backup run.
//!
//! Errors are scoped to the narrowest unit they affect:
//!
//! | Error              | Scope                        |
//! |--------------------|------------------------------|
//! | `Precondition`     | whole run, nothing touched   |
//! | `Discovery`        | one machine                  |
//! | `PowerTransition`  | one machine                  |
//! | `Repository`       | one storage item             |

use thiserror::Error;

use quantix_backup_hypervisor::HypervisorError;

use crate::lock::LockError;
use crate::repository::RepositoryError;

/// Errors raised by the backup orchestrator.
#[derive(Error, Debug)]
pub enum BackupError {
    /// A run-level precondition failed; no machine was touched.
    #[error("Precondition failed: {0}")]
    Precondition(#[from] PreconditionError),
    
    /// A machine's power state or storage could not be discovered.
    #[error("Discovery failed for {vm}: {source}")]
    Discovery {
        vm: String,
        #[source]
        source: HypervisorError,
    },
    
    /// A shutdown or start request failed, or the machine never powered off.
    #[error("Power transition failed for {vm}: {reason}")]
    PowerTransition { vm: String, reason: String },
    
    /// An archive or prune call failed.
    #[error(transparent)]
    Repository(#[from] RepositoryError),
}

/// Fatal run-level failures.
#[derive(Error, Debug)]
pub enum PreconditionError {
    /// The repository could not be opened or queried.
    #[error("repository {repository} is not usable: {source}")]
    InvalidRepository {
        repository: String,
        #[source]
        source: RepositoryError,
    },
    
    /// The machine named on the command line is not defined.
    #[error("machine {0} is not known to the hypervisor")]
    UnknownMachine(String),
    
    /// The hypervisor could not list machines.
    #[error("cannot enumerate machines: {0}")]
    Inventory(#[source] HypervisorError),
    
    /// Another backup run holds the lock.
    #[error(transparent)]
    Lock(#[from] LockError),
}

impl BackupError {
    /// Whether this error aborts the entire run.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Precondition(_))
    }
}

/// Result type alias for orchestrator operations.
pub type Result<T> = std::result::Result<T, BackupError>;
