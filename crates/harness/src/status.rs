//! Vault node status as reported by `/v1/sys/health`.
//!
//! The health endpoint encodes node state in the HTTP status code. This is
//! the only place those numbers appear.

use serde::{Deserialize, Serialize};

/// Health endpoint polled on every node, over loopback.
pub const HEALTH_URL: &str = "https://127.0.0.1:8200/v1/sys/health";

/// Vault API port.
pub const VAULT_PORT: u16 = 8200;

/// State of a single Vault node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    /// Booted, `vault operator init` not yet run.
    Uninitialized,
    /// Initialized, waiting for unseal shares.
    Sealed,
    /// Unsealed active node.
    Leader,
    /// Unsealed standby node.
    Standby,
}

/// Variant to wire-code table.
const STATUS_CODES: [(NodeStatus, u16); 4] = [
    (NodeStatus::Leader, 200),
    (NodeStatus::Standby, 429),
    (NodeStatus::Uninitialized, 501),
    (NodeStatus::Sealed, 503),
];

impl NodeStatus {
    /// HTTP status code the health endpoint returns in this state.
    #[must_use]
    pub fn code(self) -> u16 {
        STATUS_CODES
            .iter()
            .find(|(status, _)| *status == self)
            .map_or(0, |(_, code)| *code)
    }

    /// Map an HTTP status code back to a node state.
    ///
    /// Codes outside the table (e.g. 500, 472 for DR secondaries) are `None`
    /// and never satisfy an expected status.
    #[must_use]
    pub fn from_code(code: u16) -> Option<Self> {
        STATUS_CODES
            .iter()
            .find(|(_, c)| *c == code)
            .map(|(status, _)| *status)
    }

    /// Whether the node has been unsealed.
    #[must_use]
    pub fn is_unsealed(self) -> bool {
        matches!(self, Self::Leader | Self::Standby)
    }
}

impl std::fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Uninitialized => write!(f, "uninitialized"),
            Self::Sealed => write!(f, "sealed"),
            Self::Leader => write!(f, "leader"),
            Self::Standby => write!(f, "standby"),
        }
    }
}

/// Shell command that prints the local health status code.
///
/// Uses curl from the node itself so the node's own CA trust is exercised,
/// not only the orchestrator's view of it.
#[must_use]
pub fn health_probe_command() -> String {
    format!("curl -s -o /dev/null -w '%{{http_code}}' {HEALTH_URL}")
}
