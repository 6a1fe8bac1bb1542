//! Adapters for the external tools a run depends on.
//!
//! Image building and provisioning sit behind traits so scenarios can be
//! driven without packer or terraform installed.

mod gcloud;
mod keygen;
mod packer;
mod terraform;

pub use gcloud::Gcloud;
pub use keygen::generate_key_pair;
pub use packer::{parse_artifact_id, ImageBuildRequest, PackerCli};
pub use terraform::{format_var, TerraformCli, TerraformOptions, TerraformOutputs};

use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;

use crate::error::{HarnessError, Result};

/// Builds machine images.
#[async_trait]
pub trait ImageBuilder: Send + Sync {
    /// Build one image and return its identifier.
    async fn build(&self, request: &ImageBuildRequest) -> Result<String>;
}

/// Creates and destroys infrastructure.
#[async_trait]
pub trait Provisioner: Send + Sync {
    /// Initialize the working directory and apply the configuration.
    async fn apply(&self, options: &TerraformOptions) -> Result<TerraformOutputs>;

    /// Read the current outputs.
    async fn outputs(&self, options: &TerraformOptions) -> Result<TerraformOutputs>;

    /// Destroy everything the configuration created.
    async fn destroy(&self, options: &TerraformOptions) -> Result<()>;
}

/// Run a prepared command and return its stdout.
///
/// Non-zero exit becomes [`HarnessError::Tool`] carrying stderr.
pub(crate) async fn run_tool(tool: &'static str, command: &mut Command) -> Result<String> {
    debug!(tool, "Running {:?}", command.as_std().get_args().collect::<Vec<_>>());

    let output = command
        .stdin(Stdio::null())
        .kill_on_drop(true)
        .output()
        .await
        .map_err(|e| HarnessError::Tool {
            tool,
            message: format!("failed to start: {e}"),
        })?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(HarnessError::Tool {
            tool,
            message: format!("exited with {}: {}", output.status, stderr.trim()),
        });
    }

    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}


#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_run_tool_reports_stderr() {
        let err = run_tool("sh", Command::new("sh").args(["-c", "echo boom >&2; exit 3"]))
            .await
            .unwrap_err();

        match err {
            HarnessError::Tool { tool, message } => {
                assert_eq!(tool, "sh");
                assert!(message.contains("boom"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_run_tool_missing_binary() {
        let err = run_tool("packer", &mut Command::new("/nonexistent/packer"))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("failed to start"));
    }
}
