//! Error types for the harness.
//!
//! Transport failures (could not reach or run on a node) are kept apart from
//! verification failures (node answered, but not the way we expected) so
//! that a failed run says which of the two went wrong.

use thiserror::Error;
use vault_cloud::CloudProviderError;

use crate::status::NodeStatus;

/// Failures of the remote command transport.
#[derive(Error, Debug)]
pub enum TransportError {
    /// The ssh client could not be started.
    #[error("failed to launch ssh for {host}: {source}")]
    Spawn {
        host: String,
        #[source]
        source: std::io::Error,
    },

    /// The identity file could not be written for the ssh client.
    #[error("failed to stage ssh identity for {host}: {source}")]
    Identity {
        host: String,
        #[source]
        source: std::io::Error,
    },

    /// ssh itself failed (exit status 255): connection, auth or relay.
    #[error("ssh connection to {host} failed: {stderr}")]
    Connection { host: String, stderr: String },

    /// The remote command ran and exited non-zero.
    #[error("command on {host} exited with status {status}: {stderr}")]
    CommandFailed {
        host: String,
        status: i32,
        stdout: String,
        stderr: String,
    },

    /// The host can only be reached through a bastion but none is configured.
    #[error("host {host} is only reachable through a bastion, but the connector is direct")]
    RelayRequired { host: String },
}

/// Errors surfaced by every harness component.
#[derive(Error, Debug)]
pub enum HarnessError {
    /// Could not reach the fleet.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// The deployed instance group does not have the expected size.
    #[error("expected {expected} cluster members, found {found}: {members:?}")]
    TopologyCardinality {
        expected: usize,
        found: usize,
        members: Vec<String>,
    },

    /// `vault operator init` output did not have the expected shape.
    #[error("unexpected key share output: {0}")]
    UnsealKeyParse(String),

    /// A node's health probe returned a different status than required.
    #[error("expected status {expected} ({}) on {host}, got HTTP {actual}", .expected.code())]
    StatusMismatch {
        host: String,
        expected: NodeStatus,
        actual: u16,
    },

    /// The health probe output was not an HTTP status code.
    #[error("health probe on {host} returned unparseable output {output:?}")]
    ProbeOutput { host: String, output: String },

    /// The fleet is reachable but misbehaving.
    #[error("verification failed ({check}): {message}")]
    Verification { check: String, message: String },

    /// A bounded retry ran out of attempts.
    #[error("{description}: gave up after {attempts} attempts: {source}")]
    RetryExhausted {
        description: String,
        attempts: u32,
        #[source]
        source: Box<HarnessError>,
    },

    /// Compute Engine API failure.
    #[error("cloud API error: {0}")]
    Cloud(#[from] CloudProviderError),

    /// An external tool (packer, terraform, gcloud) failed.
    #[error("{tool} failed: {message}")]
    Tool { tool: &'static str, message: String },

    /// A provisioning output the scenario depends on is missing.
    #[error("missing provisioning output {0}")]
    MissingOutput(String),

    /// Saved stage state could not be read or written.
    #[error("stage store error: {0}")]
    Stage(String),

    /// HTTP client failure.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Invalid configuration.
    #[error("configuration error: {0}")]
    Config(String),
}

impl HarnessError {
    /// Build a verification failure.
    pub fn verification(check: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Verification {
            check: check.into(),
            message: message.into(),
        }
    }

    /// The innermost error once retry wrappers are peeled off.
    #[must_use]
    pub fn root(&self) -> &Self {
        match self {
            Self::RetryExhausted { source, .. } => source.root(),
            other => other,
        }
    }
}

/// Result alias used throughout the crate.
pub type Result<T, E = HarnessError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_exhausted_message_carries_description_and_cause() {
        let err = HarnessError::RetryExhausted {
            description: "Checking vault.service.consul on 10.0.0.2".to_string(),
            attempts: 10,
            source: Box::new(HarnessError::verification("consul-dns", "no such host")),
        };

        let msg = err.to_string();
        assert!(msg.starts_with("Checking vault.service.consul on 10.0.0.2"));
        assert!(msg.contains("10 attempts"));
        assert!(msg.contains("verification failed (consul-dns): no such host"));
        assert!(matches!(err.root(), HarnessError::Verification { .. }));
    }

    #[test]
    fn test_transport_and_verification_are_distinguishable() {
        let transport: HarnessError = TransportError::Connection {
            host: "10.0.0.3".to_string(),
            stderr: "Connection timed out".to_string(),
        }
        .into();
        let verification = HarnessError::verification("enterprise-version", "missing +ent");

        assert!(transport.to_string().starts_with("transport error"));
        assert!(verification.to_string().starts_with("verification failed"));
    }
}
