//! Runs the GPU diagnostic tool and captures its XML report.
//!
//! The reader never fails. If the tool cannot be launched or its output
//! cannot be captured, an empty report is returned and the rest of the cycle
//! treats the GPU as unlicensed.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, warn};

/// Arguments asking `nvidia-smi` for a full query in XML form.
pub const SMI_ARGS: [&str; 2] = ["-q", "-x"];

/// Raw standard output of one diagnostic run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DiagnosticOutput(String);

impl DiagnosticOutput {
    pub fn new(text: impl Into<String>) -> Self {
        Self(text.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.trim().is_empty()
    }
}

/// Something that can produce a diagnostic report.
#[async_trait]
pub trait DiagnosticSource: Send + Sync {
    async fn read(&self) -> DiagnosticOutput;
}

/// Reads diagnostics by spawning `nvidia-smi`.
#[derive(Debug, Clone)]
pub struct NvidiaSmi {
    tool_path: PathBuf,
}

impl NvidiaSmi {
    pub fn new(tool_path: impl Into<PathBuf>) -> Self {
        Self {
            tool_path: tool_path.into(),
        }
    }
}

#[async_trait]
impl DiagnosticSource for NvidiaSmi {
    async fn read(&self) -> DiagnosticOutput {
        read_diagnostics(&self.tool_path).await
    }
}

/// Spawn the diagnostic tool once and return whatever it printed.
///
/// A non-zero exit status is logged but the captured stdout is still used.
pub async fn read_diagnostics(tool_path: &Path) -> DiagnosticOutput {
    let output = match Command::new(tool_path)
        .args(SMI_ARGS)
        .kill_on_drop(true)
        .output()
        .await
    {
        Ok(output) => output,
        Err(e) => {
            warn!(path = %tool_path.display(), error = %e, "Failed to run diagnostic tool");
            return DiagnosticOutput::default();
        }
    };

    if !output.status.success() {
        warn!(
            path = %tool_path.display(),
            status = %output.status,
            "Diagnostic tool exited unsuccessfully"
        );
    }

    let text = String::from_utf8_lossy(&output.stdout).into_owned();
    debug!(bytes = text.len(), "Captured diagnostic output");
    DiagnosticOutput(text)
}
