//! Restarts the GPU driver service so a new token is picked up.
//!
//! Restarts are best effort. Each command's outcome is recorded in a
//! [`RestartReport`] and logged, but nothing escalates a failed restart.

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{info, warn};

/// Result of one external command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandOutcome {
    /// Exited with status 0
    Succeeded,
    /// Ran but exited non-zero (`None` if killed by a signal)
    Failed { code: Option<i32> },
    /// Could not be started at all
    LaunchFailed(String),
}

impl CommandOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, CommandOutcome::Succeeded)
    }
}

/// What happened when the driver service was bounced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestartReport {
    pub service: String,
    pub stop: CommandOutcome,
    pub start: CommandOutcome,
}

impl RestartReport {
    /// True when the service was started again.
    ///
    /// A failed stop is tolerated, the service may simply not have been
    /// running.
    pub fn succeeded(&self) -> bool {
        self.start.is_success()
    }
}

/// Stops and starts a named OS service.
#[async_trait]
pub trait ServiceController: Send + Sync {
    async fn restart(&self, service: &str) -> RestartReport;
}

/// Uses the platform's service manager.
///
/// - Windows: `net stop` / `net start`
/// - Elsewhere: `systemctl stop` / `systemctl start`
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemServiceController;

impl SystemServiceController {
    #[cfg(target_os = "windows")]
    fn command(action: &str, service: &str) -> Command {
        let mut cmd = Command::new("net");
        cmd.args([action, service]);
        cmd
    }

    #[cfg(not(target_os = "windows"))]
    fn command(action: &str, service: &str) -> Command {
        let mut cmd = Command::new("systemctl");
        cmd.args([action, service]);
        cmd
    }
}

#[async_trait]
impl ServiceController for SystemServiceController {
    async fn restart(&self, service: &str) -> RestartReport {
        info!(service, "Restarting driver service");

        let stop = run_best_effort(&mut Self::command("stop", service)).await;
        if !stop.is_success() {
            warn!(service, outcome = ?stop, "Stopping driver service failed");
        }

        let start = run_best_effort(&mut Self::command("start", service)).await;
        if !start.is_success() {
            warn!(service, outcome = ?start, "Starting driver service failed");
        }

        RestartReport {
            service: service.to_string(),
            stop,
            start,
        }
    }
}

/// Run a command to completion and classify how it ended.
pub async fn run_best_effort(cmd: &mut Command) -> CommandOutcome {
    match cmd.kill_on_drop(true).output().await {
        Ok(output) if output.status.success() => CommandOutcome::Succeeded,
        Ok(output) => CommandOutcome::Failed {
            code: output.status.code(),
        },
        Err(e) => CommandOutcome::LaunchFailed(e.to_string()),
    }
}
