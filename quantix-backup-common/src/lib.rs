//! # quantix-backup Common
//!
//! Shared utilities for the quantix-backup components.
//!
//! ## Logging
//!
//! ```rust,no_run
//! use quantix_backup_common::init_logging;
//!
//! init_logging("info").unwrap();
//! tracing::info!(vm = "db1", "Backing up machine");
//! ```

pub mod logging;

pub use logging::{init_logging, init_logging_json, LogFormat};
