//! `gcloud` adapter for credentials and defaults.

use tokio::process::Command;

use super::run_tool;
use crate::config::Secret;
use crate::error::{HarnessError, Result};

/// The gcloud CLI.
#[derive(Debug, Clone)]
pub struct Gcloud {
    program: String,
}

impl Gcloud {
    /// Use the given gcloud binary.
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }

    /// `gcloud auth print-access-token`.
    ///
    /// # Errors
    /// Fails if gcloud fails or prints nothing.
    pub async fn access_token(&self) -> Result<Secret> {
        let token = run_tool(
            "gcloud",
            Command::new(&self.program).args(["auth", "print-access-token"]),
        )
        .await?;

        let token = token.trim();
        if token.is_empty() {
            return Err(HarnessError::Tool {
                tool: "gcloud",
                message: "empty access token".to_string(),
            });
        }
        Ok(Secret::new(token))
    }

    /// `gcloud config get-value <key>`, `None` when unset.
    ///
    /// # Errors
    /// Fails if gcloud fails.
    pub async fn config_value(&self, key: &str) -> Result<Option<String>> {
        let value = run_tool(
            "gcloud",
            Command::new(&self.program).args(["config", "get-value", key, "--quiet"]),
        )
        .await?;

        let value = value.trim();
        Ok((!value.is_empty() && value != "(unset)").then(|| value.to_string()))
    }
}

impl Default for Gcloud {
    fn default() -> Self {
        Self::new("gcloud")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::testing::fake_tool;

    #[tokio::test]
    async fn test_access_token_is_trimmed_and_redacted() {
        let dir = tempfile::tempdir().unwrap();
        let gcloud = Gcloud::new(fake_tool(dir.path(), "gcloud", "echo ya29.token"));

        let token = gcloud.access_token().await.unwrap();
        assert_eq!(token.expose(), "ya29.token");
        assert!(!format!("{token:?}").contains("ya29"));
    }

    #[tokio::test]
    async fn test_unset_config_value() {
        let dir = tempfile::tempdir().unwrap();
        let gcloud = Gcloud::new(fake_tool(dir.path(), "gcloud", "echo '(unset)'"));
        assert_eq!(gcloud.config_value("compute/region").await.unwrap(), None);

        let gcloud = Gcloud::new(fake_tool(dir.path(), "gcloud2", "echo us-east1"));
        assert_eq!(
            gcloud.config_value("compute/region").await.unwrap().as_deref(),
            Some("us-east1")
        );
    }
}
