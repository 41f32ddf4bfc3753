//! Machine power control.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::time::{sleep, Instant};
use tracing::{debug, info, instrument, warn};

use quantix_backup_hypervisor::{Hypervisor, HypervisorError, VmState};

/// Power transition failures.
#[derive(Error, Debug)]
pub enum PowerError {
    /// The hypervisor rejected the request.
    #[error(transparent)]
    Hypervisor(#[from] HypervisorError),

    /// The machine did not power off within the configured bound.
    #[error("still not powered off after {}s", .waited.as_secs())]
    Timeout { waited: Duration },
}

/// Wraps the hypervisor's power operations.
pub struct PowerController {
    hypervisor: Arc<dyn Hypervisor>,
    shutdown_timeout: Option<Duration>,
}

impl PowerController {
    /// `shutdown_timeout` bounds [`wait_until_off`](Self::wait_until_off);
    /// `None` waits indefinitely.
    pub fn new(hypervisor: Arc<dyn Hypervisor>, shutdown_timeout: Option<Duration>) -> Self {
        Self {
            hypervisor,
            shutdown_timeout,
        }
    }

    pub async fn state(&self, vm: &str) -> Result<VmState, PowerError> {
        Ok(self.hypervisor.get_vm_state(vm).await?)
    }

    /// Request a graceful shutdown without waiting for it.
    #[instrument(skip(self))]
    pub async fn shutdown(&self, vm: &str) -> Result<(), PowerError> {
        info!("Requesting shutdown");
        Ok(self.hypervisor.shutdown_vm(vm).await?)
    }

    /// Poll until the machine reports shut-off.
    ///
    /// Query errors while waiting are logged and polling continues.
    #[instrument(skip(self))]
    pub async fn wait_until_off(&self, vm: &str, poll_interval: Duration) -> Result<(), PowerError> {
        let started = Instant::now();

        loop {
            match self.hypervisor.get_vm_state(vm).await {
                Ok(VmState::Stopped) => {
                    info!(waited_ms = started.elapsed().as_millis() as u64, "Machine is off");
                    return Ok(());
                }
                Ok(state) => debug!(state = %state, "Waiting for power-off"),
                Err(e) => warn!(error = %e, "State query failed while waiting for power-off"),
            }

            if let Some(limit) = self.shutdown_timeout {
                if started.elapsed() >= limit {
                    return Err(PowerError::Timeout {
                        waited: started.elapsed(),
                    });
                }
            }

            sleep(poll_interval).await;
        }
    }

    #[instrument(skip(self))]
    pub async fn start(&self, vm: &str) -> Result<(), PowerError> {
        info!("Starting machine");
        Ok(self.hypervisor.start_vm(vm).await?)
    }
}
