//! # quantix-backup
//!
//! Backs up the virtual machines of a Quantix-KVM host into a borg
//! repository. Each running machine is shut down, its configuration and
//! storage are archived, and it is started again.
//!
//! ## Storage handling
//!
//! | Storage                       | Archive                                  |
//! |-------------------------------|------------------------------------------|
//! | Disk image files              | bundled with the exported domain XML     |
//! | NTFS partition / disk         | `ntfsclone` stream                       |
//! | ext2/3/4 partition / disk     | raw device after `zerofree`              |
//! | anything else                 | raw device                               |
//!
//! Each archive set is pruned with the configured retention policy after the
//! machine's archives are created.

pub mod backends;
pub mod classifier;
pub mod cli;
pub mod config;
pub mod disk;
pub mod error;
pub mod lock;
pub mod orchestrator;
pub mod power;
pub mod process;
pub mod report;
pub mod repository;
pub mod strategy;

pub use backends::Backends;
pub use config::Config;
pub use error::{BackupError, PreconditionError};
pub use orchestrator::BackupOrchestrator;
pub use report::{MachineOutcome, MachineReport, RunReport};
