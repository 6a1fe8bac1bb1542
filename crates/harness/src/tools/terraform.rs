//! `terraform` adapter.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::process::Command;
use tracing::info;

use super::{run_tool, Provisioner};
use crate::error::{HarnessError, Result};

/// Where to run terraform and with which variables.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TerraformOptions {
    /// Module directory.
    pub dir: PathBuf,
    /// Input variables.
    #[serde(default)]
    pub vars: BTreeMap<String, Value>,
}

impl TerraformOptions {
    /// Options for `dir` with no variables.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            vars: BTreeMap::new(),
        }
    }

    /// Add a variable.
    #[must_use]
    pub fn var(mut self, name: &str, value: impl Into<Value>) -> Self {
        self.vars.insert(name.to_string(), value.into());
        self
    }

    fn var_args(&self) -> Vec<String> {
        self.vars
            .iter()
            .flat_map(|(name, value)| ["-var".to_string(), format_var(name, value)])
            .collect()
    }
}

/// `name=value` for `-var`. Strings are passed raw, everything else as
/// JSON, which terraform parses as HCL.
#[must_use]
pub fn format_var(name: &str, value: &Value) -> String {
    match value {
        Value::String(s) => format!("{name}={s}"),
        other => format!("{name}={other}"),
    }
}

#[derive(Debug, Deserialize)]
struct OutputEntry {
    value: Value,
}

/// Outputs of an applied configuration.
#[derive(Debug, Clone, Default)]
pub struct TerraformOutputs(HashMap<String, Value>);

impl TerraformOutputs {
    /// Parse `terraform output -json`.
    ///
    /// # Errors
    /// Returns [`HarnessError::Tool`] if the JSON is malformed.
    pub fn from_json(json: &str) -> Result<Self> {
        let entries: HashMap<String, OutputEntry> =
            serde_json::from_str(json).map_err(|e| HarnessError::Tool {
                tool: "terraform",
                message: format!("unparseable output -json: {e}"),
            })?;
        Ok(Self(
            entries.into_iter().map(|(k, v)| (k, v.value)).collect(),
        ))
    }

    /// A string output that must be present and non-empty.
    ///
    /// # Errors
    /// Returns [`HarnessError::MissingOutput`] otherwise.
    pub fn required(&self, name: &str) -> Result<String> {
        match self.0.get(name) {
            Some(Value::String(s)) if !s.is_empty() => Ok(s.clone()),
            Some(Value::Null | Value::String(_)) | None => {
                Err(HarnessError::MissingOutput(name.to_string()))
            }
            Some(other) => Ok(other.to_string()),
        }
    }
}

impl FromIterator<(String, Value)> for TerraformOutputs {
    fn from_iter<I: IntoIterator<Item = (String, Value)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// [`Provisioner`] that runs the terraform CLI.
#[derive(Debug, Clone)]
pub struct TerraformCli {
    program: String,
}

impl TerraformCli {
    /// Use the given terraform binary.
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }

    fn command(&self, options: &TerraformOptions) -> Command {
        let mut command = Command::new(&self.program);
        command.current_dir(&options.dir).env("TF_IN_AUTOMATION", "1");
        command
    }
}

impl Default for TerraformCli {
    fn default() -> Self {
        Self::new("terraform")
    }
}

#[async_trait]
impl Provisioner for TerraformCli {
    async fn apply(&self, options: &TerraformOptions) -> Result<TerraformOutputs> {
        info!(dir = %options.dir.display(), "Running terraform init and apply");

        run_tool(
            "terraform",
            self.command(options)
                .args(["init", "-input=false", "-no-color"]),
        )
        .await?;

        run_tool(
            "terraform",
            self.command(options)
                .args(["apply", "-input=false", "-auto-approve", "-lock=false", "-no-color"])
                .args(options.var_args()),
        )
        .await?;

        self.outputs(options).await
    }

    async fn outputs(&self, options: &TerraformOptions) -> Result<TerraformOutputs> {
        let json = run_tool(
            "terraform",
            self.command(options).args(["output", "-no-color", "-json"]),
        )
        .await?;
        TerraformOutputs::from_json(&json)
    }

    async fn destroy(&self, options: &TerraformOptions) -> Result<()> {
        info!(dir = %options.dir.display(), "Running terraform destroy");

        run_tool(
            "terraform",
            self.command(options)
                .args(["destroy", "-input=false", "-auto-approve", "-lock=false", "-no-color"])
                .args(options.var_args()),
        )
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::tools::testing::fake_tool;

    #[test]
    fn test_format_var() {
        assert_eq!(format_var("gcp_region", &json!("us-east1")), "gcp_region=us-east1");
        assert_eq!(format_var("create", &json!(false)), "create=false");
        assert_eq!(
            format_var("cidrs", &json!(["0.0.0.0/0"])),
            r#"cidrs=["0.0.0.0/0"]"#
        );
    }

    #[test]
    fn test_var_args_are_sorted() {
        let options = TerraformOptions::new("/tmp/x")
            .var("vault_cluster_name", "vault-test-abc")
            .var("gcp_project_id", "proj");
        assert_eq!(
            options.var_args(),
            ["-var", "gcp_project_id=proj", "-var", "vault_cluster_name=vault-test-abc"]
        );
    }

    #[test]
    fn test_outputs() {
        let outputs = TerraformOutputs::from_json(
            r#"{
                "instance_group_name": {"sensitive": false, "type": "string", "value": "vault-test-abc"},
                "web_client_public_ip": {"sensitive": false, "type": "string", "value": ""}
            }"#,
        )
        .unwrap();

        assert_eq!(outputs.required("instance_group_name").unwrap(), "vault-test-abc");
        assert!(matches!(
            outputs.required("web_client_public_ip"),
            Err(HarnessError::MissingOutput(ref n)) if n == "web_client_public_ip"
        ));
        assert!(outputs.required("nope").is_err());
    }

    #[tokio::test]
    async fn test_apply_runs_in_module_dir_and_reads_outputs() {
        let bin = tempfile::tempdir().unwrap();
        let module = tempfile::tempdir().unwrap();
        let terraform = fake_tool(
            bin.path(),
            "terraform",
            r#"echo "$@" >> calls.log
if [ "$1" = output ]; then
  echo '{"instance_group_name": {"value": "vault-test-xyz"}}'
fi"#,
        );

        let options = TerraformOptions::new(module.path()).var("gcp_region", "us-east1");
        let outputs = TerraformCli::new(terraform).apply(&options).await.unwrap();

        assert_eq!(outputs.required("instance_group_name").unwrap(), "vault-test-xyz");
        let calls = std::fs::read_to_string(module.path().join("calls.log")).unwrap();
        let calls: Vec<_> = calls.lines().collect();
        assert_eq!(calls.len(), 3);
        assert!(calls[0].starts_with("init"));
        assert!(calls[1].starts_with("apply") && calls[1].ends_with("-var gcp_region=us-east1"));
        assert!(calls[2].starts_with("output"));
    }
}
