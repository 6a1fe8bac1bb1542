//! Harness configuration.
//!
//! Everything has a default; a TOML file can override any subset.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{HarnessError, Result};
use crate::gateway::SshOptions;
use crate::retry::RetryPolicies;

/// A value that must never be logged.
#[derive(Clone, PartialEq, Eq, Deserialize)]
#[serde(transparent)]
pub struct Secret(String);

impl Secret {
    /// Wrap a value.
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// The wrapped value.
    #[must_use]
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Debug for Secret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Secret(<redacted>)")
    }
}

/// Paths to the external binaries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolPaths {
    pub ssh: String,
    pub ssh_keygen: String,
    pub packer: String,
    pub terraform: String,
    pub gcloud: String,
}

impl Default for ToolPaths {
    fn default() -> Self {
        Self {
            ssh: "ssh".to_string(),
            ssh_keygen: "ssh-keygen".to_string(),
            packer: "packer".to_string(),
            terraform: "terraform".to_string(),
            gcloud: "gcloud".to_string(),
        }
    }
}

/// TLS material baked into the image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TlsPaths {
    pub ca_public_key_path: PathBuf,
    pub tls_public_key_path: PathBuf,
    pub tls_private_key_path: PathBuf,
}

impl Default for TlsPaths {
    fn default() -> Self {
        let dir = PathBuf::from("tls");
        Self {
            ca_public_key_path: dir.join("ca.crt.pem"),
            tls_public_key_path: dir.join("vault.crt.pem"),
            tls_private_key_path: dir.join("vault.key.pem"),
        }
    }
}

/// Full configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HarnessConfig {
    /// Root of the module repository (holds `examples/`).
    pub repo_root: PathBuf,
    /// Packer template, relative to `repo_root`.
    pub packer_template: PathBuf,
    /// Packer `-only` build.
    pub packer_build_name: String,
    /// TLS files for the image.
    pub tls: TlsPaths,
    /// Machine type for Vault and Consul servers.
    pub machine_type: String,
    /// Cloud KMS key ring for Enterprise auto-unseal, `<location>/<ring>`.
    pub auto_unseal_key_ring: String,
    /// Cloud KMS crypto key for Enterprise auto-unseal.
    pub auto_unseal_crypto_key: String,
    /// ssh logon user added to instance metadata.
    pub ssh_user: String,
    /// ssh connect timeout, in seconds.
    pub ssh_connect_timeout: u64,
    /// Directory for saved stage values.
    pub work_dir: PathBuf,
    /// Directory collected logs are written to.
    pub logs_dir: PathBuf,
    /// Tool binaries.
    pub tools: ToolPaths,
    /// Retry policy per call site.
    pub retry: RetryPolicies,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            repo_root: PathBuf::from("."),
            packer_template: PathBuf::from("examples/vault-consul-image/vault-consul.json"),
            packer_build_name: "ubuntu-16".to_string(),
            tls: TlsPaths::default(),
            machine_type: "g1-small".to_string(),
            auto_unseal_key_ring: "global/gruntwork-test".to_string(),
            auto_unseal_crypto_key: "vault-test".to_string(),
            ssh_user: "terratest".to_string(),
            ssh_connect_timeout: 10,
            work_dir: PathBuf::from(".test-data"),
            logs_dir: PathBuf::from("/tmp/logs"),
            tools: ToolPaths::default(),
            retry: RetryPolicies::default(),
        }
    }
}

impl HarnessConfig {
    /// Load from `path`, or defaults when `None`.
    ///
    /// # Errors
    /// Returns [`HarnessError::Config`] if the file cannot be read or parsed.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let Some(path) = path else {
            info!("No config file given, using defaults");
            return Ok(Self::default());
        };

        let content = std::fs::read_to_string(path)
            .map_err(|e| HarnessError::Config(format!("cannot read {}: {e}", path.display())))?;
        let config: Self = toml::from_str(&content)
            .map_err(|e| HarnessError::Config(format!("invalid {}: {e}", path.display())))?;

        info!(path = %path.display(), "Loaded harness config");
        Ok(config)
    }

    /// Packer template path.
    #[must_use]
    pub fn template_path(&self) -> PathBuf {
        self.repo_root.join(&self.packer_template)
    }

    /// Directory of an example module.
    #[must_use]
    pub fn example_dir(&self, example: &str) -> PathBuf {
        if example.is_empty() || example == "." {
            self.repo_root.clone()
        } else {
            self.repo_root.join("examples").join(example)
        }
    }

    /// ssh client options.
    #[must_use]
    pub fn ssh_options(&self) -> SshOptions {
        SshOptions {
            program: self.tools.ssh.clone(),
            connect_timeout: Duration::from_secs(self.ssh_connect_timeout),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retry::RetryPolicy;

    #[test]
    fn test_defaults() {
        let config = HarnessConfig::load(None).unwrap();
        assert_eq!(config.machine_type, "g1-small");
        assert_eq!(config.ssh_user, "terratest");
        assert_eq!(config.retry, RetryPolicies::default());
        assert_eq!(
            config.example_dir("vault-cluster-private"),
            PathBuf::from("./examples/vault-cluster-private")
        );
        assert_eq!(config.example_dir("."), PathBuf::from("."));
    }

    #[test]
    fn test_partial_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("harness.toml");
        std::fs::write(
            &path,
            r#"
repo_root = "/src/terraform-google-vault"
ssh_connect_timeout = 30

[tools]
terraform = "/usr/local/bin/terraform"

[retry.node_status]
max_attempts = 60
interval = 5
"#,
        )
        .unwrap();

        let config = HarnessConfig::load(Some(&path)).unwrap();
        assert_eq!(config.tools.terraform, "/usr/local/bin/terraform");
        assert_eq!(config.tools.packer, "packer");
        assert_eq!(config.retry.node_status, RetryPolicy::secs(60, 5));
        assert_eq!(config.retry.unseal, RetryPolicies::default().unseal);
        assert_eq!(config.ssh_options().connect_timeout, Duration::from_secs(30));
        assert_eq!(
            config.template_path(),
            PathBuf::from("/src/terraform-google-vault/examples/vault-consul-image/vault-consul.json")
        );
    }

    #[test]
    fn test_invalid_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.toml");
        std::fs::write(&path, "machine_type = 3").unwrap();
        assert!(matches!(
            HarnessConfig::load(Some(&path)),
            Err(HarnessError::Config(_))
        ));
    }

    #[test]
    fn test_secret_is_redacted() {
        let secret = Secret::new("https://releases.example.com/vault+ent.zip");
        assert_eq!(format!("{secret:?}"), "Secret(<redacted>)");
        assert!(secret.expose().ends_with("+ent.zip"));
    }
}
