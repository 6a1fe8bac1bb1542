//! Vault initialization and unsealing over the remote command gateway.
//!
//! Each node moves through
//!
//! ```text
//! Uninitialized --init (leader only)--> Sealed --unseal x3--> Leader | Standby
//! Standby --restart (auto-unseal)--> Sealed --> Standby
//! ```
//!
//! and every transition is confirmed through the node's own health probe.

use std::sync::{Arc, LazyLock};

use regex::Regex;
use tracing::{info, warn};

use crate::error::{HarnessError, Result};
use crate::gateway::RemoteExecutor;
use crate::host::Host;
use crate::retry::{do_with_retry, RetryPolicies};
use crate::status::{health_probe_command, NodeStatus};
use crate::topology::ClusterTopology;

/// Shares required to unseal (Vault's default threshold of 3 out of 5).
pub const UNSEAL_THRESHOLD: usize = 3;

const INIT_COMMAND: &str = "vault operator init";
const VERSION_COMMAND: &str = "vault --version";
const RESTART_COMMAND: &str = "sudo systemctl restart vault";
const ENTERPRISE_MARKER: &str = "+ent";

static UNSEAL_KEY_LINE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^Unseal Key \d+: (.+)$").expect("valid unseal key pattern"));
static RECOVERY_KEY_LINE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^Recovery Key \d+: (.+)$").expect("valid recovery key pattern"));

/// Which kind of key share `vault operator init` printed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyShareKind {
    /// Shamir unseal keys.
    Unseal,
    /// Recovery keys of an auto-unsealed cluster.
    Recovery,
}

impl KeyShareKind {
    fn pattern(self) -> &'static Regex {
        match self {
            Self::Unseal => &UNSEAL_KEY_LINE,
            Self::Recovery => &RECOVERY_KEY_LINE,
        }
    }
}

/// The first three key shares of an init run.
///
/// Lives in memory only; `Debug` never prints the shares.
#[derive(Clone, PartialEq, Eq)]
pub struct UnsealMaterial {
    kind: KeyShareKind,
    keys: Vec<String>,
}

impl UnsealMaterial {
    /// Key shares in output order.
    #[must_use]
    pub fn keys(&self) -> &[String] {
        &self.keys
    }

    /// `vault operator unseal K1 && vault operator unseal K2 && ...`
    #[must_use]
    pub fn unseal_command(&self) -> String {
        self.keys
            .iter()
            .map(|key| format!("vault operator unseal {key}"))
            .collect::<Vec<_>>()
            .join(" && ")
    }
}

impl std::fmt::Debug for UnsealMaterial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UnsealMaterial")
            .field("kind", &self.kind)
            .field("keys", &format_args!("[{} redacted]", self.keys.len()))
            .finish()
    }
}

/// Parse the Shamir unseal keys from `vault operator init` output.
///
/// # Errors
/// See [`parse_key_shares`].
pub fn parse_unseal_keys(output: &str) -> Result<UnsealMaterial> {
    parse_key_shares(output, KeyShareKind::Unseal)
}

/// Parse the first three key shares from `vault operator init` output.
///
/// The output must start with at least three lines of the form
/// `Unseal Key N: <share>` (or `Recovery Key N: <share>`).
///
/// # Errors
/// Returns [`HarnessError::UnsealKeyParse`] if there are fewer than three
/// lines or one of the first three does not match. Nothing is returned in
/// that case, not even the shares that did parse.
pub fn parse_key_shares(output: &str, kind: KeyShareKind) -> Result<UnsealMaterial> {
    let lines: Vec<&str> = output.lines().collect();
    if lines.len() < UNSEAL_THRESHOLD {
        return Err(HarnessError::UnsealKeyParse(format!(
            "expected at least {UNSEAL_THRESHOLD} lines of init output, got {}",
            lines.len()
        )));
    }

    let keys = lines[..UNSEAL_THRESHOLD]
        .iter()
        .map(|line| {
            kind.pattern()
                .captures(line.trim_end())
                .and_then(|c| c.get(1))
                .map(|m| m.as_str().to_string())
                .ok_or_else(|| {
                    HarnessError::UnsealKeyParse(format!("unexpected format for key share line {line:?}"))
                })
        })
        .collect::<Result<Vec<_>>>()?;

    Ok(UnsealMaterial { kind, keys })
}

/// Drives a cluster from freshly booted to fully unsealed.
#[derive(Clone)]
pub struct LifecycleController {
    executor: Arc<dyn RemoteExecutor>,
    policies: RetryPolicies,
}

impl LifecycleController {
    /// Create a controller.
    pub fn new(executor: Arc<dyn RemoteExecutor>, policies: RetryPolicies) -> Self {
        Self { executor, policies }
    }

    /// Gateway used for every remote command.
    #[must_use]
    pub fn executor(&self) -> &Arc<dyn RemoteExecutor> {
        &self.executor
    }

    /// Retry policies in use.
    #[must_use]
    pub fn policies(&self) -> &RetryPolicies {
        &self.policies
    }

    /// Wait until every member accepts an ssh session.
    ///
    /// # Errors
    /// Returns the last transport error once the attempts are used up.
    pub async fn verify_reachable(&self, topology: &ClusterTopology) -> Result<()> {
        for host in topology.members() {
            if host.hostname.is_empty() {
                continue;
            }
            let description = format!("Attempting SSH connection to {}", host.hostname);
            do_with_retry(&description, self.policies.ssh_reachable, || async {
                self.executor.run(host, "exit").await?;
                Ok(())
            })
            .await?;
        }
        Ok(())
    }

    /// Wait until Vault has booted on every member for the first time.
    ///
    /// # Errors
    /// Fails if a member never reports `Uninitialized`.
    pub async fn wait_for_boot(&self, topology: &ClusterTopology) -> Result<()> {
        for host in topology.members() {
            if host.hostname.is_empty() {
                continue;
            }
            info!(
                host = %host.hostname,
                "Waiting for Vault to boot the first time. Expecting it to be in uninitialized status ({}).",
                NodeStatus::Uninitialized.code()
            );
            self.assert_status(host, NodeStatus::Uninitialized).await?;
        }
        Ok(())
    }

    /// Run `vault operator init` on `leader` exactly once.
    ///
    /// # Errors
    /// Returns the transport error, or [`HarnessError::UnsealKeyParse`] if
    /// the output does not hold three key shares.
    pub async fn initialize(&self, leader: &Host, kind: KeyShareKind) -> Result<UnsealMaterial> {
        info!(host = %leader.hostname, "Initializing the cluster");
        let output = self.executor.run(leader, INIT_COMMAND).await?;
        let material = parse_key_shares(&output, kind)?;
        info!(host = %leader.hostname, shares = material.keys().len(), "Cluster initialized");
        Ok(material)
    }

    /// Unseal `node` with all shares in one remote command, then wait for it
    /// to leave `Sealed`.
    ///
    /// # Errors
    /// Fails if the unseal command never succeeds or the node stays sealed.
    pub async fn unseal(&self, node: &Host, material: &UnsealMaterial) -> Result<()> {
        let command = material.unseal_command();
        let description = format!("Unsealing Vault on host {}", node.hostname);

        do_with_retry(&description, self.policies.unseal, || async {
            self.executor.run(node, &command).await?;
            Ok(())
        })
        .await?;

        let description = format!("Waiting for Vault node {} to leave sealed status", node.hostname);
        do_with_retry(&description, self.policies.node_status, || async {
            let code = self.probe_status(node).await?;
            match NodeStatus::from_code(code) {
                Some(status) if status.is_unsealed() => Ok(status),
                _ => Err(HarnessError::verification(
                    "unseal",
                    format!("{} still reports HTTP {code}", node.hostname),
                )),
            }
        })
        .await?;

        Ok(())
    }

    /// Run the health probe on `node` once and return the HTTP status code.
    ///
    /// # Errors
    /// Returns the transport error or [`HarnessError::ProbeOutput`] if curl
    /// printed something other than a status code.
    pub async fn probe_status(&self, node: &Host) -> Result<u16> {
        let output = self.executor.run(node, &health_probe_command()).await?;
        output
            .trim()
            .parse::<u16>()
            .map_err(|_| HarnessError::ProbeOutput {
                host: node.hostname.clone(),
                output,
            })
    }

    /// Wait until `node` reports `expected`.
    ///
    /// # Errors
    /// Returns [`HarnessError::StatusMismatch`] (wrapped in the retry error)
    /// if the node never does.
    pub async fn assert_status(&self, node: &Host, expected: NodeStatus) -> Result<()> {
        let description = format!(
            "Check that the Vault node {} has status {}",
            node.hostname,
            expected.code()
        );

        do_with_retry(&description, self.policies.node_status, || async {
            let actual = self.probe_status(node).await?;
            if NodeStatus::from_code(actual) == Some(expected) {
                info!(host = %node.hostname, status = actual, "Got expected status code");
                Ok(())
            } else {
                Err(HarnessError::StatusMismatch {
                    host: node.hostname.clone(),
                    expected,
                    actual,
                })
            }
        })
        .await
    }

    /// Probe every member once and return the index of the one reporting
    /// `Leader`.
    ///
    /// # Errors
    /// Returns a verification error if no member is the active node.
    pub async fn identify_leader(&self, topology: &ClusterTopology) -> Result<usize> {
        for (index, host) in topology.members().into_iter().enumerate() {
            match self.probe_status(host).await {
                Ok(code) if NodeStatus::from_code(code) == Some(NodeStatus::Leader) => {
                    return Ok(index);
                }
                Ok(_) => {}
                Err(e) => warn!(host = %host.hostname, error = %e, "Health probe failed"),
            }
        }

        Err(HarnessError::verification(
            "leader",
            "no cluster member reports active status",
        ))
    }

    /// Re-derive the leader from the cluster and mark it confirmed.
    ///
    /// # Errors
    /// See [`identify_leader`](Self::identify_leader).
    pub async fn confirm_leadership(&self, topology: &mut ClusterTopology) -> Result<()> {
        let index = self.identify_leader(topology).await?;
        topology.confirm_leader(index);
        info!(leader = %topology.leader.hostname, "Leadership confirmed");
        Ok(())
    }

    /// Initialize and Shamir-unseal the whole cluster.
    ///
    /// The leader is unsealed and confirmed active before any standby is
    /// touched.
    ///
    /// # Errors
    /// Propagates the first failing step.
    pub async fn initialize_and_unseal(&self, topology: &mut ClusterTopology) -> Result<UnsealMaterial> {
        self.verify_reachable(topology).await?;
        self.wait_for_boot(topology).await?;
        let material = self.initialize(&topology.leader, KeyShareKind::Unseal).await?;

        self.unseal_and_expect(&topology.leader, &material, NodeStatus::Leader)
            .await?;
        for standby in topology.standbys() {
            self.unseal_and_expect(standby, &material, NodeStatus::Standby)
                .await?;
        }

        self.confirm_leadership(topology).await?;
        Ok(material)
    }

    /// Initialize an auto-unsealing cluster and wait for every member to
    /// unseal on its own.
    ///
    /// # Errors
    /// Propagates the first failing step.
    pub async fn initialize_auto_unseal(&self, topology: &mut ClusterTopology) -> Result<UnsealMaterial> {
        self.verify_reachable(topology).await?;
        self.wait_for_boot(topology).await?;
        let material = self
            .initialize(&topology.leader, KeyShareKind::Recovery)
            .await?;

        self.assert_status(&topology.leader, NodeStatus::Leader).await?;
        for standby in topology.standbys() {
            self.assert_status(standby, NodeStatus::Standby).await?;
        }

        self.confirm_leadership(topology).await?;
        Ok(material)
    }

    async fn unseal_and_expect(
        &self,
        node: &Host,
        material: &UnsealMaterial,
        expected: NodeStatus,
    ) -> Result<()> {
        self.assert_status(node, NodeStatus::Sealed).await?;
        self.unseal(node, material).await?;
        self.assert_status(node, expected).await
    }

    /// Check that `node` runs an enterprise build.
    ///
    /// # Errors
    /// Returns a verification error if `vault --version` never mentions the
    /// enterprise marker.
    pub async fn assert_version_is_enterprise(&self, node: &Host) -> Result<()> {
        let description = format!("Checking Vault version on {}", node.hostname);

        do_with_retry(&description, self.policies.enterprise_version, || async {
            let output = self.executor.run(node, VERSION_COMMAND).await?;
            if output.contains(ENTERPRISE_MARKER) {
                Ok(())
            } else {
                Err(HarnessError::verification(
                    "enterprise-version",
                    format!("expected {ENTERPRISE_MARKER} in {output:?}"),
                ))
            }
        })
        .await
    }

    /// Restart Vault on a standby and wait for it to unseal itself.
    ///
    /// # Errors
    /// Fails if the restart command fails or the node does not come back as
    /// a standby.
    pub async fn restart_and_expect_auto_unseal(&self, node: &Host) -> Result<()> {
        info!(host = %node.hostname, "Restarting Vault");
        self.executor.run(node, RESTART_COMMAND).await?;
        self.assert_status(node, NodeStatus::Standby).await
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::Mutex;

    use async_trait::async_trait;

    use super::*;
    use crate::error::TransportError;
    use crate::host::KeyPair;

    const INIT_OUTPUT: &str = "Unseal Key 1: Gi9xAX9rFfmHtSi68mYOh0H3H2eu8E77nvRm/0fsuwQB
Unseal Key 2: ecQjHmaXc79GtwJN/hYWd/N2skhoNgyCmgCfGqRMTPIC
Unseal Key 3: LEOa/DdZDgLHBqK0JoxbviKByUAgxfm2dwK4y1PX6qED
Unseal Key 4: ZY87ijsj9/f5fO7ufgr4yhPWU/2ZZM3BGuSQRDFZpwoE
Unseal Key 5: MAiCaGrtikp4zU4XppC1A8IhKPXRlzj19+a3lcbCAVkF

Initial Root Token: s.abc";

    #[test]
    fn test_parses_first_three_keys_only() {
        let material = parse_unseal_keys(INIT_OUTPUT).unwrap();
        assert_eq!(
            material.keys(),
            [
                "Gi9xAX9rFfmHtSi68mYOh0H3H2eu8E77nvRm/0fsuwQB",
                "ecQjHmaXc79GtwJN/hYWd/N2skhoNgyCmgCfGqRMTPIC",
                "LEOa/DdZDgLHBqK0JoxbviKByUAgxfm2dwK4y1PX6qED",
            ]
        );
        assert_eq!(parse_unseal_keys(INIT_OUTPUT).unwrap(), material);
    }

    #[test]
    fn test_malformed_output_yields_no_keys() {
        let too_short = "Unseal Key 1: a\nUnseal Key 2: b";
        assert!(matches!(
            parse_unseal_keys(too_short),
            Err(HarnessError::UnsealKeyParse(_))
        ));

        let bad_second = "Unseal Key 1: a\nError initializing\nUnseal Key 3: c";
        assert!(matches!(
            parse_unseal_keys(bad_second),
            Err(HarnessError::UnsealKeyParse(_))
        ));

        assert!(parse_unseal_keys("").is_err());
    }

    #[test]
    fn test_recovery_keys() {
        let output = "Recovery Key 1: r1\nRecovery Key 2: r2\nRecovery Key 3: r3\n";
        let material = parse_key_shares(output, KeyShareKind::Recovery).unwrap();
        assert_eq!(material.keys(), ["r1", "r2", "r3"]);
        assert!(parse_key_shares(output, KeyShareKind::Unseal).is_err());
    }

    #[test]
    fn test_unseal_command_and_redaction() {
        let material = parse_unseal_keys("Unseal Key 1: a\nUnseal Key 2: b\nUnseal Key 3: c").unwrap();
        assert_eq!(
            material.unseal_command(),
            "vault operator unseal a && vault operator unseal b && vault operator unseal c"
        );
        let debug = format!("{material:?}");
        assert!(debug.contains("3 redacted"));
        assert!(!debug.contains("vault operator unseal a"));
    }

    /// Replies per (host, command prefix); the last reply repeats.
    #[derive(Default)]
    struct Scripted {
        replies: Mutex<HashMap<(String, String), Vec<Result<String, i32>>>>,
        calls: Mutex<Vec<(String, String)>>,
    }

    impl Scripted {
        fn on(&self, host: &str, prefix: &str, replies: Vec<Result<&str, i32>>) {
            self.replies.lock().unwrap().insert(
                (host.to_string(), prefix.to_string()),
                replies.into_iter().map(|r| r.map(str::to_string)).collect(),
            );
        }

        fn calls(&self, host: &str, prefix: &str) -> usize {
            self.calls
                .lock()
                .unwrap()
                .iter()
                .filter(|(h, c)| h == host && c.starts_with(prefix))
                .count()
        }
    }

    #[async_trait]
    impl RemoteExecutor for Scripted {
        async fn run(&self, target: &Host, command: &str) -> Result<String, TransportError> {
            self.calls
                .lock()
                .unwrap()
                .push((target.hostname.clone(), command.to_string()));

            let mut replies = self.replies.lock().unwrap();
            let queue = replies
                .iter_mut()
                .find(|((h, p), _)| *h == target.hostname && command.starts_with(p.as_str()))
                .map(|(_, q)| q)
                .unwrap_or_else(|| panic!("unexpected command {command:?} on {}", target.hostname));

            let reply = if queue.len() > 1 { queue.remove(0) } else { queue[0].clone() };
            reply.map_err(|status| TransportError::CommandFailed {
                host: target.hostname.clone(),
                status,
                stdout: String::new(),
                stderr: "failed".to_string(),
            })
        }
    }

    fn host(name: &str) -> Host {
        Host::direct(
            name,
            "terratest",
            Arc::new(KeyPair {
                public_key: String::new(),
                private_key: String::new(),
            }),
        )
    }

    fn controller(script: &Arc<Scripted>) -> LifecycleController {
        LifecycleController::new(Arc::clone(script) as Arc<dyn RemoteExecutor>, RetryPolicies::immediate(5))
    }

    #[tokio::test]
    async fn test_initialize_runs_exactly_once_on_failure() {
        let script = Arc::new(Scripted::default());
        script.on("leader", INIT_COMMAND, vec![Err(2)]);

        let err = controller(&script)
            .initialize(&host("leader"), KeyShareKind::Unseal)
            .await
            .unwrap_err();

        assert!(matches!(err, HarnessError::Transport(TransportError::CommandFailed { .. })));
        assert_eq!(script.calls("leader", INIT_COMMAND), 1);
    }

    #[tokio::test]
    async fn test_unrecognized_status_never_matches() {
        let script = Arc::new(Scripted::default());
        script.on("node", "curl", vec![Ok("500")]);

        let err = controller(&script)
            .assert_status(&host("node"), NodeStatus::Leader)
            .await
            .unwrap_err();

        assert!(matches!(
            err.root(),
            HarnessError::StatusMismatch { actual: 500, .. }
        ));
        assert_eq!(script.calls("node", "curl"), 5);
    }

    #[tokio::test]
    async fn test_garbage_probe_output_is_reported() {
        let script = Arc::new(Scripted::default());
        script.on("node", "curl", vec![Ok("000curl: (7) refused")]);

        let err = controller(&script)
            .assert_status(&host("node"), NodeStatus::Sealed)
            .await
            .unwrap_err();
        assert!(matches!(err.root(), HarnessError::ProbeOutput { .. }));
    }

    #[tokio::test]
    async fn test_unseal_retries_then_waits_for_unsealed() {
        let script = Arc::new(Scripted::default());
        script.on("node", "vault operator unseal", vec![Err(2), Ok("Sealed false")]);
        script.on("node", "curl", vec![Ok("503"), Ok("429")]);
        let material = parse_unseal_keys("Unseal Key 1: a\nUnseal Key 2: b\nUnseal Key 3: c").unwrap();

        controller(&script)
            .unseal(&host("node"), &material)
            .await
            .unwrap();

        assert_eq!(script.calls("node", "vault operator unseal"), 2);
        assert_eq!(script.calls("node", "curl"), 2);
    }

    #[tokio::test]
    async fn test_identify_leader_skips_failed_probes() {
        let script = Arc::new(Scripted::default());
        script.on("a", "curl", vec![Err(7)]);
        script.on("b", "curl", vec![Ok("429")]);
        script.on("c", "curl", vec![Ok("200")]);

        let mut topology = ClusterTopology::from_hosts([host("a"), host("b"), host("c")]);
        let ctl = controller(&script);
        assert_eq!(ctl.identify_leader(&topology).await.unwrap(), 2);

        ctl.confirm_leadership(&mut topology).await.unwrap();
        assert_eq!(topology.leader.hostname, "c");
    }

    #[tokio::test]
    async fn test_enterprise_version_check() {
        let script = Arc::new(Scripted::default());
        script.on("ent", VERSION_COMMAND, vec![Ok("Vault v1.5.4+ent (abc)")]);
        script.on("oss", VERSION_COMMAND, vec![Ok("Vault v1.5.4 (abc)")]);

        let ctl = controller(&script);
        ctl.assert_version_is_enterprise(&host("ent")).await.unwrap();

        let err = ctl.assert_version_is_enterprise(&host("oss")).await.unwrap_err();
        assert!(matches!(err.root(), HarnessError::Verification { ref check, .. } if check == "enterprise-version"));
    }

    #[tokio::test]
    async fn test_restart_expects_standby_without_unseal() {
        let script = Arc::new(Scripted::default());
        script.on("node", RESTART_COMMAND, vec![Ok("")]);
        script.on("node", "curl", vec![Ok("503"), Ok("429")]);

        controller(&script)
            .restart_and_expect_auto_unseal(&host("node"))
            .await
            .unwrap();

        assert_eq!(script.calls("node", "vault operator unseal"), 0);
    }
}
