//! Per-machine and per-run outcomes.

use tracing::{error, info, warn};

use crate::strategy::Strategy;

/// Result of archiving one item or bundle.
#[derive(Debug, Clone)]
pub struct ItemReport {
    /// Archive name
    pub archive: String,
    pub strategy: Strategy,
    /// Error text when the archive was not created
    pub error: Option<String>,
    /// Non-fatal problems (tool warnings, failed pre-pass)
    pub warnings: Vec<String>,
}

impl ItemReport {
    pub fn succeeded(&self) -> bool {
        self.error.is_none()
    }
}

/// Overall result for one machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MachineOutcome {
    /// Every archive, prune, and power transition succeeded
    Succeeded,
    /// Some archives were created but something failed
    Partial,
    /// Nothing was archived
    Failed,
}

/// What happened to one machine.
#[derive(Debug, Clone)]
pub struct MachineReport {
    pub name: String,
    /// Power state snapshot said running before the backup
    pub was_running: bool,
    /// Restart outcome; `None` when no restart was due
    pub restarted: Option<bool>,
    pub items: Vec<ItemReport>,
    /// Machine-level and prune errors
    pub errors: Vec<String>,
}

impl MachineReport {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            was_running: false,
            restarted: None,
            items: Vec::new(),
            errors: Vec::new(),
        }
    }

    pub fn outcome(&self) -> MachineOutcome {
        let archived = self.items.iter().filter(|i| i.succeeded()).count();
        let clean = self.errors.is_empty() && archived == self.items.len();

        if archived == 0 && !(clean && self.items.is_empty()) {
            MachineOutcome::Failed
        } else if clean {
            MachineOutcome::Succeeded
        } else {
            MachineOutcome::Partial
        }
    }

    /// Names of archives created for this machine.
    pub fn archives(&self) -> impl Iterator<Item = &str> {
        self.items
            .iter()
            .filter(|i| i.succeeded())
            .map(|i| i.archive.as_str())
    }

    pub(crate) fn log(&self) {
        let archived = self.archives().count();
        let failed = self.items.len() - archived;
        match self.outcome() {
            MachineOutcome::Succeeded => info!(
                vm = %self.name,
                archived,
                restarted = ?self.restarted,
                "Machine backup complete"
            ),
            MachineOutcome::Partial => warn!(
                vm = %self.name,
                archived,
                failed,
                errors = ?self.errors,
                restarted = ?self.restarted,
                "Machine backup partially failed"
            ),
            MachineOutcome::Failed => error!(
                vm = %self.name,
                failed,
                errors = ?self.errors,
                restarted = ?self.restarted,
                "Machine backup failed"
            ),
        }
    }
}

/// Outcome of a whole run.
#[derive(Debug, Clone, Default)]
pub struct RunReport {
    pub machines: Vec<MachineReport>,
}

impl RunReport {
    /// True when every machine fully succeeded.
    pub fn all_succeeded(&self) -> bool {
        self.machines
            .iter()
            .all(|m| m.outcome() == MachineOutcome::Succeeded)
    }

    pub fn count(&self, outcome: MachineOutcome) -> usize {
        self.machines.iter().filter(|m| m.outcome() == outcome).count()
    }

    pub fn machine(&self, name: &str) -> Option<&MachineReport> {
        self.machines.iter().find(|m| m.name == name)
    }

    /// Emit the final summary line.
    pub fn log_summary(&self) {
        let archives: usize = self.machines.iter().map(|m| m.archives().count()).sum();
        info!(
            machines = self.machines.len(),
            succeeded = self.count(MachineOutcome::Succeeded),
            partial = self.count(MachineOutcome::Partial),
            failed = self.count(MachineOutcome::Failed),
            archives,
            "Backup run finished"
        );
    }
}
