//! `packer build` adapter.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::LazyLock;

use async_trait::async_trait;
use regex::Regex;
use tokio::process::Command;
use tracing::info;

use super::{run_tool, ImageBuilder};
use crate::config::Secret;
use crate::error::{HarnessError, Result};

/// `<timestamp>,<target>,artifact,<n>,id,<id>` in `-machine-readable` output.
static ARTIFACT_ID_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^\d+,[^,]*,artifact,\d+,id,(.+?)\r?$").expect("valid artifact pattern")
});

/// One image build.
#[derive(Debug, Clone)]
pub struct ImageBuildRequest {
    /// Path to the packer template.
    pub template: PathBuf,
    /// Value for `-only`.
    pub build_name: String,
    /// Template variables, passed as `-var`.
    pub vars: BTreeMap<String, String>,
    /// Environment for the packer process. Values never appear in argv or
    /// logs.
    pub env: BTreeMap<String, Secret>,
}

impl ImageBuildRequest {
    /// Arguments for `packer`.
    #[must_use]
    pub fn args(&self) -> Vec<String> {
        let mut args = vec![
            "build".to_string(),
            "-machine-readable".to_string(),
            format!("-only={}", self.build_name),
        ];
        for (key, value) in &self.vars {
            args.push("-var".to_string());
            args.push(format!("{key}={value}"));
        }
        args.push(self.template.to_string_lossy().into_owned());
        args
    }
}

/// Extract the image identifier from `packer build -machine-readable`
/// output.
///
/// # Errors
/// Returns [`HarnessError::Tool`] if no artifact line is present.
pub fn parse_artifact_id(output: &str) -> Result<String> {
    ARTIFACT_ID_LINE
        .captures(output)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string())
        .ok_or_else(|| HarnessError::Tool {
            tool: "packer",
            message: "no artifact id in build output".to_string(),
        })
}

/// [`ImageBuilder`] that runs the packer CLI.
#[derive(Debug, Clone)]
pub struct PackerCli {
    program: String,
}

impl PackerCli {
    /// Use the given packer binary.
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

impl Default for PackerCli {
    fn default() -> Self {
        Self::new("packer")
    }
}

#[async_trait]
impl ImageBuilder for PackerCli {
    async fn build(&self, request: &ImageBuildRequest) -> Result<String> {
        info!(
            template = %request.template.display(),
            build = %request.build_name,
            "Building image"
        );

        // Templates resolve relative paths from their own directory.
        let mut args = request.args();
        let mut command = Command::new(&self.program);
        if let (Some(dir), Some(name)) = (
            request.template.parent().filter(|d| !d.as_os_str().is_empty()),
            request.template.file_name(),
        ) {
            args.pop();
            args.push(name.to_string_lossy().into_owned());
            command.current_dir(dir);
        }
        command.args(args);
        for (key, value) in &request.env {
            command.env(key, value.expose());
        }

        let output = run_tool("packer", &mut command).await?;
        let image = parse_artifact_id(&output)?;
        info!(image = %image, build = %request.build_name, "Image built");
        Ok(image)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::testing::fake_tool;

    fn request() -> ImageBuildRequest {
        ImageBuildRequest {
            template: PathBuf::from("vault-consul.json"),
            build_name: "ubuntu-16".to_string(),
            vars: BTreeMap::from([
                ("project_id".to_string(), "my-project".to_string()),
                ("zone".to_string(), "us-east1-b".to_string()),
            ]),
            env: BTreeMap::from([(
                "VAULT_DOWNLOAD_URL".to_string(),
                Secret::new("https://example.com/vault+ent.zip"),
            )]),
        }
    }

    #[test]
    fn test_args_keep_secrets_out() {
        let args = request().args();
        assert_eq!(
            args,
            [
                "build",
                "-machine-readable",
                "-only=ubuntu-16",
                "-var",
                "project_id=my-project",
                "-var",
                "zone=us-east1-b",
                "vault-consul.json",
            ]
        );
        assert!(!args.iter().any(|a| a.contains("example.com")));
        assert!(!format!("{:?}", request()).contains("example.com"));
    }

    #[test]
    fn test_parse_artifact_id() {
        let output = "\
1600000000,,ui,say,==> ubuntu-16: Creating image...
1600000001,ubuntu-16,artifact-count,1
1600000001,ubuntu-16,artifact,0,builder-id,packer.googlecompute
1600000001,ubuntu-16,artifact,0,id,vault-consul-ubuntu-1600000000
1600000001,ubuntu-16,artifact,0,end
";
        assert_eq!(parse_artifact_id(output).unwrap(), "vault-consul-ubuntu-1600000000");
        assert!(parse_artifact_id("1600000000,,ui,error,Build failed").is_err());
    }

    #[tokio::test]
    async fn test_build_passes_secret_through_environment() {
        let dir = tempfile::tempdir().unwrap();
        let packer = fake_tool(
            dir.path(),
            "packer",
            r#"echo "1,ubuntu-16,artifact,0,id,img-$VAULT_DOWNLOAD_URL""#,
        );

        let mut req = request();
        req.env.insert("VAULT_DOWNLOAD_URL".to_string(), Secret::new("ent"));
        let image = PackerCli::new(packer).build(&req).await.unwrap();
        assert_eq!(image, "img-ent");
    }
}
