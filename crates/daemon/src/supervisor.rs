//! Process Supervisor (spec §4.J) — manages the auxiliary child process
//! that speaks the external tool protocol.
//!
//! New relative to `codescope`. Generalizes `codescope::main.rs`'s graceful
//! shutdown (`tokio::select!` over `ctrl_c`/`sigterm`) into a full state
//! machine over a `tokio::process::Child`, reusing the `delay · 2^attempts`
//! backoff shape from the indexing pipeline (§4.D) for consistency within
//! the codebase.

use std::time::Duration;

use tokio::process::{Child, Command};
use tokio::time::timeout;
use tracing::{info, warn};

use crate::error::SupervisorError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorStatus {
    Stopped,
    Starting,
    Running,
    Stopping,
    Restarting,
    Failed,
}

#[derive(Debug, Clone)]
pub struct AutoRestartPolicy {
    pub enabled: bool,
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for AutoRestartPolicy {
    fn default() -> Self {
        Self { enabled: true, max_retries: 5, base_delay: Duration::from_secs(1), max_delay: Duration::from_secs(30) }
    }
}

impl AutoRestartPolicy {
    /// `delay · 2^attempts`, capped at `maxDelay` (§4.J restart policy).
    pub fn backoff(&self, attempts: u32) -> Duration {
        let scaled = self.base_delay.saturating_mul(2u32.saturating_pow(attempts));
        scaled.min(self.max_delay)
    }
}

/// Supervises one child process through start/stop/restart with crash
/// backoff.
pub struct ProcessSupervisor {
    program: String,
    args: Vec<String>,
    policy: AutoRestartPolicy,
    shutdown_timeout: Duration,
    status: SupervisorStatus,
    attempts: u32,
    child: Option<Child>,
}

impl ProcessSupervisor {
    pub fn new(program: impl Into<String>, args: Vec<String>, policy: AutoRestartPolicy, shutdown_timeout: Duration) -> Self {
        Self { program: program.into(), args, policy, shutdown_timeout, status: SupervisorStatus::Stopped, attempts: 0, child: None }
    }

    pub fn status(&self) -> SupervisorStatus {
        self.status
    }

    pub async fn start(&mut self) -> Result<(), SupervisorError> {
        self.status = SupervisorStatus::Starting;
        let child = Command::new(&self.program)
            .args(&self.args)
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| SupervisorError::StartFailed(e.to_string()))?;
        self.child = Some(child);
        self.status = SupervisorStatus::Running;
        self.attempts = 0;
        info!(program = %self.program, "supervised child started");
        Ok(())
    }

    /// Graceful stop: wait up to `shutdownTimeout` for the child to exit,
    /// then force-kill (§4.J: "stop/restart always wait for graceful exit
    /// up to shutdownTimeout; on timeout, force-kill").
    pub async fn stop(&mut self) -> Result<(), SupervisorError> {
        self.status = SupervisorStatus::Stopping;
        if let Some(mut child) = self.child.take() {
            match timeout(self.shutdown_timeout, child.wait()).await {
                Ok(_) => {}
                Err(_) => {
                    warn!(program = %self.program, "child did not exit in time, killing");
                    let _ = child.start_kill();
                    let _ = child.wait().await;
                    self.status = SupervisorStatus::Stopped;
                    return Err(SupervisorError::ShutdownTimeout(self.shutdown_timeout));
                }
            }
        }
        self.status = SupervisorStatus::Stopped;
        Ok(())
    }

    pub async fn restart(&mut self) -> Result<(), SupervisorError> {
        self.status = SupervisorStatus::Restarting;
        let _ = self.stop().await;
        self.start().await
    }

    pub async fn kill(&mut self) -> Result<(), SupervisorError> {
        if let Some(mut child) = self.child.take() {
            let _ = child.start_kill();
            let _ = child.wait().await;
        }
        self.status = SupervisorStatus::Stopped;
        Ok(())
    }

    /// Considered responsive iff the process is alive (§4.J: "the child is
    /// considered responsive iff its process is alive").
    pub fn is_responsive(&mut self) -> bool {
        match &mut self.child {
            Some(child) => matches!(child.try_wait(), Ok(None)),
            None => false,
        }
    }

    /// Called when the supervised child has been observed to crash. Returns
    /// `true` if a restart was scheduled, `false` if the restart budget is
    /// exhausted and the supervisor has moved to `failed`.
    pub fn on_crash(&mut self) -> Option<Duration> {
        if !self.policy.enabled || self.attempts >= self.policy.max_retries {
            self.status = SupervisorStatus::Failed;
            return None;
        }
        let delay = self.policy.backoff(self.attempts);
        self.attempts += 1;
        Some(delay)
    }
}
