//! # quantix-backup
//!
//! Shut down, archive, and restart the VMs of a Quantix-KVM host.
//!
//! ## Usage
//! ```bash
//! BORG_PASSPHRASE=... quantix-backup ssh://backup@nas/./vms
//! quantix-backup /srv/borg db1 --strict
//! ```
//!
//! ## Exit status
//! - `0` run completed (per-item failures are logged)
//! - `1` precondition failure (repository, unknown machine, lock held)
//! - `3` `--strict` and at least one machine did not fully succeed
//! - `130` / `143` interrupted by SIGINT / SIGTERM

use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tracing::{error, info, warn};

use quantix_backup::cli::Args;
use quantix_backup::config::{Config, DEFAULT_CONFIG_PATH};
use quantix_backup::repository::RepositoryRef;
use quantix_backup::{Backends, BackupOrchestrator, RunReport};
use quantix_backup_common::LogFormat;

/// Exit code for a strict run with failures.
const EXIT_PARTIAL: u8 = 3;

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    // Parse CLI arguments
    let args = Args::parse();
    
    // Initialize logging
    let format = if args.log_json { LogFormat::Json } else { LogFormat::Pretty };
    if let Err(e) = format.init(&args.log_level) {
        eprintln!("Failed to initialize logging: {:#}", e);
        return ExitCode::FAILURE;
    }
    
    info!(
        version = env!("CARGO_PKG_VERSION"),
        "Starting quantix-backup"
    );
    
    let config = match load_config(&args) {
        Ok(config) => Arc::new(config),
        Err(e) => {
            error!(error = %format!("{:#}", e), "Failed to load configuration");
            return ExitCode::FAILURE;
        }
    };
    
    let repository = match RepositoryRef::parse(&args.repository) {
        Ok(repository) => repository,
        Err(e) => {
            error!(error = %e, "Invalid repository");
            return ExitCode::FAILURE;
        }
    };
    
    if config.repository.passphrase.is_none() {
        warn!("No repository passphrase configured; encrypted repositories will fail");
    }
    
    let backends = match Backends::from_config(&config).await {
        Ok(backends) => backends,
        Err(e) => {
            error!(error = %format!("{:#}", e), "Failed to initialize backends");
            return ExitCode::FAILURE;
        }
    };
    
    info!(
        repository = %repository,
        hypervisor = ?config.hypervisor.backend,
        machine = ?args.machine,
        "Backup configured"
    );
    
    let strict = config.strict;
    let orchestrator = BackupOrchestrator::new(config, repository, backends);
    
    let interrupted = async {
        match wait_for_shutdown_signal().await {
            Ok(signal) => signal,
            Err(e) => {
                error!(error = %e, "Shutdown signal handler failed");
                std::future::pending().await
            }
        }
    };
    
    // Dropping the run future on a signal releases the lock
    tokio::select! {
        result = orchestrator.run(args.machine.as_deref()) => match result {
            Ok(report) => exit_status(&report, strict),
            Err(e) => {
                error!(error = %e, "Backup run aborted");
                ExitCode::FAILURE
            }
        },
        signal = interrupted => {
            warn!(signal = signal.name(), "Backup run interrupted");
            ExitCode::from(signal.exit_code())
        }
    }
}

/// Load configuration from `--config`, the default path, or defaults.
fn load_config(args: &Args) -> Result<Config> {
    match &args.config {
        Some(config_path) => {
            let config = Config::load(config_path)?;
            info!(config_path = %config_path, "Configuration loaded");
            Ok(config.with_cli_overrides(args))
        }
        None => match Config::load_optional(DEFAULT_CONFIG_PATH)? {
            Some(config) => {
                info!(config_path = %DEFAULT_CONFIG_PATH, "Configuration loaded from default location");
                Ok(config.with_cli_overrides(args))
            }
            None => {
                info!("No config file found, using CLI arguments and defaults");
                Ok(Config::default_with_cli(args))
            }
        },
    }
}

fn exit_status(report: &RunReport, strict: bool) -> ExitCode {
    if strict && !report.all_succeeded() {
        ExitCode::from(EXIT_PARTIAL)
    } else {
        ExitCode::SUCCESS
    }
}

/// Termination request received while a run was in progress.
#[derive(Debug, Clone, Copy)]
enum ShutdownSignal {
    Interrupt,
    Terminate,
}

impl ShutdownSignal {
    fn name(&self) -> &'static str {
        match self {
            Self::Interrupt => "SIGINT",
            Self::Terminate => "SIGTERM",
        }
    }
    
    /// Conventional 128 + signal number.
    fn exit_code(&self) -> u8 {
        match self {
            Self::Interrupt => 130,
            Self::Terminate => 143,
        }
    }
}

/// Wait for SIGTERM or SIGINT (Ctrl+C elsewhere).
async fn wait_for_shutdown_signal() -> Result<ShutdownSignal> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        
        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sigint = signal(SignalKind::interrupt())?;
        
        tokio::select! {
            _ = sigterm.recv() => Ok(ShutdownSignal::Terminate),
            _ = sigint.recv() => Ok(ShutdownSignal::Interrupt),
        }
    }
    
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        Ok(ShutdownSignal::Interrupt)
    }
}
