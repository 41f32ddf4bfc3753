//! Backup orchestration.
//!
//! One run validates the repository, resolves the target machines, takes the
//! single-instance lock, and then backs up each machine in turn:
//!
//! ```text
//! Discovered ──(running)──▶ Stopping ──▶ Stopped ──▶ BackingUp ──▶ Starting ──▶ Done
//!     │                                                  ▲
//!     └──────────────(not running)───────────────────────┘──────────────────▶ Done
//! ```
//!
//! Failures are scoped: a precondition failure aborts the run before any
//! machine is touched, a discovery or power failure ends that machine, and a
//! repository failure ends that archive only.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tempfile::TempDir;
use tracing::{error, info, instrument, warn};

use quantix_backup_hypervisor::{Hypervisor, VmState};

use crate::backends::Backends;
use crate::classifier::{StorageClassifier, StorageItem};
use crate::config::Config;
use crate::error::{BackupError, PreconditionError, Result};
use crate::lock::SingleInstanceLock;
use crate::power::{PowerController, PowerError};
use crate::repository::{ArchiveJob, ArchiveKind, ArchiveNamer, RepositoryClient, RepositoryRef};
use crate::report::{ItemReport, MachineReport, RunReport};
use crate::strategy::{ArchiveStrategySelector, Strategy};

/// Subject of the configuration plus virtual disk archive set.
const BUNDLE_SUBJECT: &str = "files";

/// Drives a backup run.
pub struct BackupOrchestrator {
    config: Arc<Config>,
    hypervisor: Arc<dyn Hypervisor>,
    power: PowerController,
    classifier: StorageClassifier,
    selector: ArchiveStrategySelector,
    repository: RepositoryClient,
    lock: SingleInstanceLock,
}

impl BackupOrchestrator {
    pub fn new(config: Arc<Config>, repository: RepositoryRef, backends: Backends) -> Self {
        Self {
            power: PowerController::new(backends.hypervisor.clone(), config.power.shutdown_timeout()),
            classifier: StorageClassifier::new(backends.hypervisor.clone(), backends.disks.clone()),
            selector: ArchiveStrategySelector::new(backends.disks),
            repository: RepositoryClient::new(
                backends.repository,
                repository,
                config.repository.compression.clone(),
                config.retention.clone(),
            ),
            lock: SingleInstanceLock::new(&config.lock_path),
            hypervisor: backends.hypervisor,
            config,
        }
    }

    /// Replace the archive namer.
    pub fn with_namer(mut self, namer: ArchiveNamer) -> Self {
        self.repository = self.repository.with_namer(namer);
        self
    }

    /// Back up `machine`, or every machine not excluded when `None`.
    ///
    /// Returns an error only for run-level precondition failures; per-machine
    /// and per-archive failures are reported in the [`RunReport`].
    #[instrument(skip(self), fields(repository = %self.repository.repository()))]
    pub async fn run(&self, machine: Option<&str>) -> Result<RunReport> {
        info!("Starting backup run");

        self.repository
            .validate()
            .await
            .map_err(|source| PreconditionError::InvalidRepository {
                repository: self.repository.repository().to_string(),
                source,
            })?;

        let targets = self.resolve_targets(machine).await?;

        let _guard = self.lock.acquire().map_err(PreconditionError::from)?;

        let mut report = RunReport::default();
        for vm in &targets {
            report.machines.push(self.back_up_machine(vm).await);
        }

        report.log_summary();
        Ok(report)
    }

    async fn resolve_targets(&self, machine: Option<&str>) -> Result<Vec<String>> {
        let vms = self
            .hypervisor
            .list_vms()
            .await
            .map_err(PreconditionError::Inventory)?;

        let targets: Vec<String> = match machine {
            Some(name) => {
                if !vms.iter().any(|vm| vm.name == name) {
                    return Err(PreconditionError::UnknownMachine(name.to_string()).into());
                }
                if self.config.is_excluded(name) {
                    info!(vm = %name, "Machine is excluded but was named explicitly");
                }
                vec![name.to_string()]
            }
            None => vms
                .into_iter()
                .map(|vm| vm.name)
                .filter(|name| {
                    let excluded = self.config.is_excluded(name);
                    if excluded {
                        info!(vm = %name, "Skipping excluded machine");
                    }
                    !excluded
                })
                .collect(),
        };

        info!(machines = ?targets, "Resolved backup targets");
        Ok(targets)
    }

    #[instrument(skip(self))]
    async fn back_up_machine(&self, vm: &str) -> MachineReport {
        let mut report = MachineReport::new(vm);

        let state = match self.power.state(vm).await {
            Ok(state) => state,
            Err(e) => {
                let e = discovery_error(vm, e);
                error!(error = %e, "Cannot determine power state, skipping machine");
                report.errors.push(e.to_string());
                report.log();
                return report;
            }
        };
        report.was_running = state == VmState::Running;

        if report.was_running {
            if let Err(e) = self.stop(vm).await {
                error!(error = %e, "Machine did not stop, skipping");
                report.errors.push(e.to_string());
                self.restore_after_failed_stop(vm, &mut report).await;
                report.log();
                return report;
            }
        } else {
            info!(state = %state, "Machine is not running, backing up in place");
        }

        if let Err(e) = self.back_up_storage(vm, &mut report).await {
            error!(error = %e, "Backup of machine storage failed");
            report.errors.push(e.to_string());
        }

        if report.was_running {
            self.restart(vm, &mut report).await;
        }

        report.log();
        report
    }

    async fn restart(&self, vm: &str, report: &mut MachineReport) {
        match self.power.start(vm).await {
            Ok(()) => report.restarted = Some(true),
            Err(e) => {
                let e = power_error(vm, e);
                error!(error = %e, "Failed to restart machine");
                report.restarted = Some(false);
                report.errors.push(e.to_string());
            }
        }
    }

    /// A guest may finish powering off after the wait gave up. Look once
    /// more and bring it back up if it did.
    async fn restore_after_failed_stop(&self, vm: &str, report: &mut MachineReport) {
        match self.power.state(vm).await {
            Ok(VmState::Stopped) => {
                info!("Machine powered off after the wait, restarting");
                self.restart(vm, report).await;
            }
            Ok(state) => {
                warn!(state = %state, "Shutdown still pending, machine may stay off once it completes");
            }
            Err(e) => {
                warn!(error = %e, "Cannot determine power state after failed shutdown");
            }
        }
    }

    async fn stop(&self, vm: &str) -> Result<()> {
        self.power
            .shutdown(vm)
            .await
            .map_err(|e| power_error(vm, e))?;
        self.power
            .wait_until_off(vm, self.config.power.poll_interval())
            .await
            .map_err(|e| power_error(vm, e))
    }

    /// Archive a stopped (or never running) machine's storage.
    async fn back_up_storage(&self, vm: &str, report: &mut MachineReport) -> Result<()> {
        let items = self.classifier.classify(vm).await?;
        let (disk_files, block_items): (Vec<&StorageItem>, Vec<&StorageItem>) =
            items.iter().partition(|item| !item.is_block());

        // Removed when dropped at the end of this machine
        let workdir = self.work_dir(vm).await;
        let config_path = match &workdir {
            Ok(dir) => match self.export_config(vm, dir.path()).await {
                Ok(path) => Some(path),
                Err(e) => {
                    error!(error = %e, "Configuration export failed, archiving disks without it");
                    report.errors.push(format!("configuration export failed: {}", e));
                    None
                }
            },
            Err(e) => {
                error!(error = %e, "Cannot create working directory");
                report.errors.push(format!("working directory unavailable: {}", e));
                None
            }
        };

        let mut planned = Vec::with_capacity(block_items.len());
        for item in block_items {
            let strategy = self.selector.select(item);
            let mut warnings = Vec::new();
            if let Err(e) = self.selector.pre_pass(item, strategy).await {
                warn!(device = %item.path.display(), error = %e, "Pre-pass failed, archiving as is");
                warnings.push(format!("pre-pass failed: {}", e));
            }
            planned.push((item, strategy, warnings));
        }

        let mut sets = Vec::new();

        if config_path.is_some() || !disk_files.is_empty() {
            let source = self
                .selector
                .bundle_source(config_path.as_deref(), disk_files.iter().copied());
            let job = self.repository.job(
                vm,
                ArchiveKind::Bundle,
                BUNDLE_SUBJECT,
                Strategy::PlainFiles,
                source,
            );
            self.archive(&job, Vec::new(), report, &mut sets).await;
        }

        for (item, strategy, warnings) in planned {
            let source = self.selector.block_source(item, strategy);
            let job = self
                .repository
                .job(vm, item.archive_kind(), &item.subject(), strategy, source);
            self.archive(&job, warnings, report, &mut sets).await;
        }

        for glob in sets {
            if let Err(e) = self.repository.prune(&glob).await {
                report.errors.push(BackupError::from(e).to_string());
            }
        }

        Ok(())
    }

    /// Submit one job, recording its outcome and, on success, its set.
    async fn archive(
        &self,
        job: &ArchiveJob,
        mut warnings: Vec<String>,
        report: &mut MachineReport,
        sets: &mut Vec<String>,
    ) {
        let error = match self.repository.archive(job).await {
            Ok(result) => {
                warnings.extend(result.warning);
                if !sets.contains(&job.set_glob) {
                    sets.push(job.set_glob.clone());
                }
                None
            }
            Err(e) => Some(BackupError::from(e).to_string()),
        };

        report.items.push(ItemReport {
            archive: job.name.clone(),
            strategy: job.strategy,
            error,
            warnings,
        });
    }

    async fn work_dir(&self, vm: &str) -> std::io::Result<TempDir> {
        tokio::fs::create_dir_all(&self.config.work_dir).await?;
        tempfile::Builder::new()
            .prefix(&format!("{}-", vm))
            .tempdir_in(&self.config.work_dir)
    }

    async fn export_config(&self, vm: &str, dir: &Path) -> std::result::Result<PathBuf, String> {
        let xml = self.hypervisor.dump_xml(vm).await.map_err(|e| e.to_string())?;
        let path = dir.join(format!("{}.xml", vm));
        tokio::fs::write(&path, xml).await.map_err(|e| e.to_string())?;
        info!(path = %path.display(), "Exported machine configuration");
        Ok(path)
    }
}

/// A failed power-state query: the machine's condition is unknown.
fn discovery_error(vm: &str, error: PowerError) -> BackupError {
    match error {
        PowerError::Hypervisor(source) => BackupError::Discovery {
            vm: vm.to_string(),
            source,
        },
        PowerError::Timeout { .. } => power_error(vm, error),
    }
}

/// A failed shutdown, wait, or start.
fn power_error(vm: &str, error: PowerError) -> BackupError {
    BackupError::PowerTransition {
        vm: vm.to_string(),
        reason: error.to_string(),
    }
}
