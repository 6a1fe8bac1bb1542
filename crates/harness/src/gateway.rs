//! Remote command execution over ssh.
//!
//! Nodes are reached either directly or through a bastion; which one is
//! decided once per scenario by the [`Connector`] the gateway is built with.

use std::borrow::Cow;
use std::io::Write;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tempfile::NamedTempFile;
use tokio::process::Command;
use tracing::debug;

use crate::error::TransportError;
use crate::host::{Connector, Host, Reachability};

/// Exit status ssh uses for its own failures.
const SSH_ERROR_STATUS: i32 = 255;

/// Run a shell command on a host.
#[async_trait]
pub trait RemoteExecutor: Send + Sync {
    /// Run `command` on `target` and return its stdout.
    ///
    /// Success means exit status 0. Trailing whitespace is trimmed.
    async fn run(&self, target: &Host, command: &str) -> Result<String, TransportError>;
}

/// ssh client options.
#[derive(Debug, Clone)]
pub struct SshOptions {
    /// ssh binary.
    pub program: String,
    /// `ConnectTimeout`.
    pub connect_timeout: Duration,
}

impl Default for SshOptions {
    fn default() -> Self {
        Self {
            program: "ssh".to_string(),
            connect_timeout: Duration::from_secs(10),
        }
    }
}

/// [`RemoteExecutor`] backed by the OpenSSH client.
#[derive(Debug, Clone)]
pub struct SshGateway {
    connector: Connector,
    options: SshOptions,
}

impl SshGateway {
    /// Create a gateway for the given connector.
    #[must_use]
    pub fn new(connector: Connector) -> Self {
        Self::with_options(connector, SshOptions::default())
    }

    /// Create a gateway with explicit client options.
    #[must_use]
    pub fn with_options(connector: Connector, options: SshOptions) -> Self {
        Self { connector, options }
    }

    fn common_args(&self, identity: &str) -> Vec<String> {
        vec![
            "-i".to_string(),
            identity.to_string(),
            "-o".to_string(),
            "StrictHostKeyChecking=no".to_string(),
            "-o".to_string(),
            "UserKnownHostsFile=/dev/null".to_string(),
            "-o".to_string(),
            "BatchMode=yes".to_string(),
            "-o".to_string(),
            format!("ConnectTimeout={}", self.options.connect_timeout.as_secs()),
            "-o".to_string(),
            "LogLevel=ERROR".to_string(),
        ]
    }

    /// Argument vector for one invocation.
    ///
    /// `bastion_identity` must be `Some` when the connector relays.
    fn build_args(
        &self,
        target: &Host,
        command: &str,
        target_identity: &str,
        bastion_identity: Option<&str>,
    ) -> Vec<String> {
        let mut args = self.common_args(target_identity);

        if let (Connector::Relayed { bastion }, Some(identity)) = (&self.connector, bastion_identity) {
            // ssh hands ProxyCommand to the shell.
            let proxy = format!(
                "{} {} -W %h:%p {}",
                shell_quote(&self.options.program),
                self.common_args(identity)
                    .iter()
                    .map(|arg| shell_quote(arg))
                    .collect::<Vec<_>>()
                    .join(" "),
                shell_quote(&bastion.destination())
            );
            args.push("-o".to_string());
            args.push(format!("ProxyCommand={proxy}"));
        }

        args.push(target.destination());
        args.push(command.to_string());
        args
    }
}

/// Single-quote `arg` for `sh` unless it is made of safe characters only.
fn shell_quote(arg: &str) -> Cow<'_, str> {
    let safe = |c: char| c.is_ascii_alphanumeric() || "-_./:=@%+,".contains(c);
    if !arg.is_empty() && arg.chars().all(safe) {
        Cow::Borrowed(arg)
    } else {
        Cow::Owned(format!("'{}'", arg.replace('\'', r"'\''")))
    }
}

/// Write a private key to a file only the current user can read.
fn stage_identity(host: &Host) -> Result<NamedTempFile, TransportError> {
    let identity_error = |source| TransportError::Identity {
        host: host.hostname.clone(),
        source,
    };

    let mut file = tempfile::Builder::new()
        .prefix("vault-harness-key-")
        .tempfile()
        .map_err(identity_error)?;
    file.write_all(host.key_pair.private_key.as_bytes())
        .map_err(identity_error)?;
    if !host.key_pair.private_key.ends_with('\n') {
        file.write_all(b"\n").map_err(identity_error)?;
    }
    file.flush().map_err(identity_error)?;
    Ok(file)
}

#[async_trait]
impl RemoteExecutor for SshGateway {
    async fn run(&self, target: &Host, command: &str) -> Result<String, TransportError> {
        if target.reach == Reachability::ViaBastion && self.connector.bastion().is_none() {
            return Err(TransportError::RelayRequired {
                host: target.hostname.clone(),
            });
        }

        let target_identity = stage_identity(target)?;
        let bastion_identity = match self.connector.bastion() {
            Some(bastion) => Some(stage_identity(bastion)?),
            None => None,
        };

        let args = self.build_args(
            target,
            command,
            &target_identity.path().to_string_lossy(),
            bastion_identity
                .as_ref()
                .map(|f| f.path().to_string_lossy().into_owned())
                .as_deref(),
        );

        debug!(
            host = %target.hostname,
            relayed = bastion_identity.is_some(),
            "Running remote command"
        );

        let output = Command::new(&self.options.program)
            .args(&args)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|source| TransportError::Spawn {
                host: target.hostname.clone(),
                source,
            })?;

        let stdout = String::from_utf8_lossy(&output.stdout).trim_end().to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();

        match output.status.code() {
            Some(0) => Ok(stdout),
            Some(SSH_ERROR_STATUS) => Err(TransportError::Connection {
                host: target.hostname.clone(),
                stderr,
            }),
            status => Err(TransportError::CommandFailed {
                host: target.hostname.clone(),
                status: status.unwrap_or(-1),
                stdout,
                stderr,
            }),
        }
    }
}
