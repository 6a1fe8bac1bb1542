//! Cross-node checks run once the cluster is unsealed.

use std::time::Duration;

use reqwest::{Client, StatusCode};
use serde::Deserialize;
use tracing::{debug, info};

use crate::error::{HarnessError, Result, TransportError};
use crate::lifecycle::LifecycleController;
use crate::retry::do_with_retry;
use crate::status::VAULT_PORT;
use crate::topology::{ClusterTopology, Leadership};

/// Consul-registered name of the Vault service.
pub const CONSUL_DNS_NAME: &str = "vault.service.consul";

const HTTP_TIMEOUT: Duration = Duration::from_secs(10);

/// `GET /v1/sys/init` body.
#[derive(Debug, Deserialize)]
struct InitStatus {
    initialized: bool,
}

/// `vault status` against the Consul DNS name.
#[must_use]
pub fn consul_dns_status_command() -> String {
    format!("vault status -address=https://{CONSUL_DNS_NAME}:{VAULT_PORT}")
}

/// Base URL of the Vault API behind `domain`.
#[must_use]
pub fn vault_endpoint(domain: &str) -> String {
    format!("https://{domain}:{VAULT_PORT}")
}

/// Verification checks against an unsealed cluster.
pub struct VerificationSuite {
    lifecycle: LifecycleController,
    vault_client: Client,
    http_client: Client,
}

impl VerificationSuite {
    /// Build the suite.
    ///
    /// The Vault client skips certificate validation: the test certificate
    /// does not carry the load balancer's name.
    ///
    /// # Errors
    /// Returns an error if an HTTP client cannot be built.
    pub fn new(lifecycle: LifecycleController) -> Result<Self> {
        let vault_client = Client::builder()
            .danger_accept_invalid_certs(true)
            .timeout(HTTP_TIMEOUT)
            .build()?;
        let http_client = Client::builder().timeout(HTTP_TIMEOUT).build()?;

        Ok(Self {
            lifecycle,
            vault_client,
            http_client,
        })
    }

    /// Check that a node resolves `vault.service.consul` through Consul and
    /// reaches Vault there without TLS errors.
    ///
    /// Runs on a standby; the active node is re-derived from the cluster
    /// if leadership has not been confirmed yet.
    ///
    /// # Errors
    /// A verification error if the command kept failing on the node, a
    /// transport error if the node could not be reached.
    pub async fn verify_service_discovery_dns(&self, topology: &ClusterTopology) -> Result<()> {
        let host = match topology.leadership() {
            Leadership::Confirmed => &topology.standby1,
            Leadership::Provisional => {
                let leader = self.lifecycle.identify_leader(topology).await?;
                topology.members()[if leader == 1 { 2 } else { 1 }]
            }
        };

        let command = consul_dns_status_command();
        let description = format!(
            "Checking that the Vault server at {} is properly configured to use Consul for DNS: {command}",
            host.hostname
        );
        info!("{description}");

        let executor = self.lifecycle.executor();
        do_with_retry(&description, self.lifecycle.policies().consul_dns, || async {
            match executor.run(host, &command).await {
                Ok(output) => {
                    debug!(host = %host.hostname, %output, "vault status via Consul DNS");
                    Ok(())
                }
                Err(TransportError::CommandFailed { stdout, stderr, .. }) => Err(
                    HarnessError::verification("consul-dns", format!("{stderr} {stdout}").trim().to_string()),
                ),
                Err(e) => Err(e.into()),
            }
        })
        .await
    }

    /// Poll the init status through the public endpoint until the cluster
    /// reports itself initialized.
    ///
    /// `base_url` is e.g. `https://vault.example.com:8200`; see
    /// [`vault_endpoint`].
    ///
    /// # Errors
    /// Fails if the endpoint never reports `initialized: true`.
    pub async fn verify_external_endpoint(&self, base_url: &str) -> Result<()> {
        let url = format!("{}/v1/sys/init", base_url.trim_end_matches('/'));
        let description = format!("Testing Vault at {base_url}");

        do_with_retry(&description, self.lifecycle.policies().external_endpoint, || async {
            let status: InitStatus = self
                .vault_client
                .get(&url)
                .send()
                .await?
                .error_for_status()?
                .json()
                .await?;

            if status.initialized {
                Ok(())
            } else {
                Err(HarnessError::verification(
                    "external-endpoint",
                    "expected Vault cluster to be initialized, but it is not",
                ))
            }
        })
        .await?;

        info!(endpoint = %base_url, "Successfully verified that Vault cluster is initialized");
        Ok(())
    }

    /// Poll the example web client until it answers 200 with `expected`.
    ///
    /// # Errors
    /// Fails if the client never serves the expected secret.
    pub async fn verify_web_client_secret(&self, url: &str, expected: &str) -> Result<()> {
        let description = format!("HTTP GET to URL {url}");

        do_with_retry(&description, self.lifecycle.policies().web_client, || async {
            let response = self.http_client.get(url).send().await?;
            let status = response.status();
            let body = response.text().await?;

            if status == StatusCode::OK && body.trim() == expected {
                Ok(())
            } else {
                Err(HarnessError::verification(
                    "web-client",
                    format!("expected HTTP 200 with body {expected:?}, got {status} with body {:?}", body.trim()),
                ))
            }
        })
        .await
    }
}
