//! Scenario drivers.
//!
//! Each scenario deploys one example module and walks it through
//! `deploy -> validate -> log -> teardown`. Teardown always runs. Run-wide
//! values live in a shared, read-only [`RunContext`].

mod auth;
mod cluster;
mod run;

pub use run::{Harness, RunReport, RunSettings, ScenarioOutcome};

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::ValueEnum;
use tracing::{error, info, warn};
use vault_cloud::ComputeProvider;

use crate::config::HarnessConfig;
use crate::gateway::{RemoteExecutor, SshGateway};
use crate::host::{Connector, Host, KeyPair};
use crate::logs::collect_logs;
use crate::stage::{self, run_stage, StageStore};
use crate::tools::{generate_key_pair, Provisioner, TerraformOptions};

// Saved stage values.
pub(crate) const SAVED_TERRAFORM_OPTIONS: &str = "TerraformOptions";
pub(crate) const SAVED_KEY_PAIR: &str = "KeyPair";
pub(crate) const SAVED_CLUSTER_HOSTS: &str = "ClusterHosts";
pub(crate) const SAVED_BASTION_HOST: &str = "BastionHost";

// Terraform input variables.
pub(crate) const TFVAR_GCP_PROJECT_ID: &str = "gcp_project_id";
pub(crate) const TFVAR_GCP_REGION: &str = "gcp_region";
pub(crate) const TFVAR_GCP_ZONE: &str = "gcp_zone";
pub(crate) const TFVAR_VAULT_CLUSTER_NAME: &str = "vault_cluster_name";
pub(crate) const TFVAR_VAULT_SOURCE_IMAGE: &str = "vault_source_image";
pub(crate) const TFVAR_VAULT_MACHINE_TYPE: &str = "vault_cluster_machine_type";
pub(crate) const TFVAR_CONSUL_CLUSTER_NAME: &str = "consul_server_cluster_name";
pub(crate) const TFVAR_CONSUL_SOURCE_IMAGE: &str = "consul_server_source_image";
pub(crate) const TFVAR_CONSUL_MACHINE_TYPE: &str = "consul_server_machine_type";
pub(crate) const TFVAR_BASTION_NAME: &str = "bastion_server_name";
pub(crate) const TFVAR_CLIENT_NAME: &str = "web_client_name";
pub(crate) const TFVAR_AUTO_UNSEAL_PROJECT: &str = "vault_auto_unseal_project_id";
pub(crate) const TFVAR_AUTO_UNSEAL_REGION: &str = "vault_auto_unseal_region";
pub(crate) const TFVAR_AUTO_UNSEAL_KEY_RING: &str = "vault_auto_unseal_key_ring";
pub(crate) const TFVAR_AUTO_UNSEAL_CRYPTO_KEY: &str = "vault_auto_unseal_crypto_key";

// Terraform outputs.
pub(crate) const TFOUT_INSTANCE_GROUP_NAME: &str = "instance_group_name";
pub(crate) const TFOUT_BASTION_NAME: &str = "bastion_server_name";
pub(crate) const TFOUT_WEB_CLIENT_PUBLIC_IP: &str = "web_client_public_ip";

/// Builds the remote executor for a scenario once its connector is known.
pub type GatewayFactory = Arc<dyn Fn(Connector) -> Arc<dyn RemoteExecutor> + Send + Sync>;

/// Gateway factory backed by the OpenSSH client.
#[must_use]
pub fn ssh_gateways(config: &HarnessConfig) -> GatewayFactory {
    let options = config.ssh_options();
    Arc::new(move |connector| -> Arc<dyn RemoteExecutor> {
        Arc::new(SshGateway::with_options(connector, options.clone()))
    })
}

/// A deployment exercised by the harness.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, ValueEnum)]
pub enum Scenario {
    /// Vault servers with public addresses.
    PublicCluster,
    /// Vault servers without public addresses, reached through a bastion.
    PrivateCluster,
    /// Vault Enterprise with Cloud KMS auto-unseal.
    EnterpriseCluster,
    /// Web client authenticating with the IAM method.
    IamAuth,
    /// Web client authenticating with the GCE method.
    GceAuth,
}

/// Which image a scenario deploys.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageKind {
    OpenSource,
    Enterprise,
}

impl Scenario {
    /// Every scenario.
    pub const ALL: [Self; 5] = [
        Self::PrivateCluster,
        Self::PublicCluster,
        Self::EnterpriseCluster,
        Self::IamAuth,
        Self::GceAuth,
    ];

    /// Short name, used for stage directories and log paths.
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::PublicCluster => "public-cluster",
            Self::PrivateCluster => "private-cluster",
            Self::EnterpriseCluster => "enterprise-cluster",
            Self::IamAuth => "iam-auth",
            Self::GceAuth => "gce-auth",
        }
    }

    /// Example module the scenario deploys (`.` is the repository root).
    #[must_use]
    pub fn example(self) -> &'static str {
        match self {
            Self::PublicCluster => ".",
            Self::PrivateCluster => "vault-cluster-private",
            Self::EnterpriseCluster => "vault-cluster-enterprise",
            Self::IamAuth => "vault-cluster-authentication-iam",
            Self::GceAuth => "vault-cluster-authentication-gce",
        }
    }

    /// Image the scenario deploys.
    #[must_use]
    pub fn image(self) -> ImageKind {
        match self {
            Self::EnterpriseCluster => ImageKind::Enterprise,
            _ => ImageKind::OpenSource,
        }
    }

    /// Whether the Vault nodes are private and reached through a bastion.
    #[must_use]
    pub fn uses_bastion(self) -> bool {
        matches!(self, Self::PrivateCluster)
    }

    /// Whether the scenario drives the cluster lifecycle itself.
    #[must_use]
    pub fn is_cluster(self) -> bool {
        matches!(
            self,
            Self::PublicCluster | Self::PrivateCluster | Self::EnterpriseCluster
        )
    }
}

impl std::fmt::Display for Scenario {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Images built for the run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Images {
    pub open_source: String,
    pub enterprise: Option<String>,
}

impl Images {
    /// Image for `kind`.
    ///
    /// # Errors
    /// Fails if that image was not built for this run.
    pub fn get(&self, kind: ImageKind) -> Result<&str> {
        match kind {
            ImageKind::OpenSource => Ok(&self.open_source),
            ImageKind::Enterprise => self
                .enterprise
                .as_deref()
                .context("no enterprise image was built for this run"),
        }
    }
}

/// Run-wide values, computed once and shared read-only by all scenarios.
pub struct RunContext {
    pub project_id: String,
    pub region: String,
    pub zone: String,
    pub config: HarnessConfig,
    pub images: Images,
    pub compute: Arc<dyn ComputeProvider>,
    pub provisioner: Arc<dyn Provisioner>,
    pub gateways: GatewayFactory,
}

/// Lowercase six-character id; GCP only accepts lowercase names for some
/// resources.
#[must_use]
pub fn unique_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()[..6].to_string()
}

/// Run one scenario to completion, always tearing down what it deployed.
///
/// # Errors
/// Returns the first failing stage's error. A teardown failure is logged;
/// it is returned only if everything before it passed.
pub async fn run_scenario(
    ctx: Arc<RunContext>,
    scenario: Scenario,
    store: Arc<dyn StageStore>,
) -> Result<()> {
    let store = store.as_ref();

    let outcome = async {
        run_stage("deploy", || deploy(&ctx, scenario, store)).await?;
        run_stage("validate", || async {
            if scenario.is_cluster() {
                cluster::validate(&ctx, scenario, store).await
            } else {
                auth::validate(&ctx, store).await
            }
        })
        .await
    }
    .await;

    if let Err(e) = &outcome {
        error!(scenario = %scenario, error = format!("{e:#}"), "Scenario failed");
    }

    run_stage("log", || async {
        write_logs(&ctx, scenario, store).await;
        Ok::<_, anyhow::Error>(())
    })
    .await?;

    let teardown = run_stage("teardown", || teardown(&ctx, store)).await;

    match (outcome, teardown) {
        (Err(e), Err(t)) => {
            error!(scenario = %scenario, error = format!("{t:#}"), "Teardown failed");
            Err(e)
        }
        (Err(e), Ok(())) | (Ok(()), Err(e)) => Err(e),
        (Ok(()), Ok(())) => Ok(()),
    }
}

/// Terraform variables every example takes.
fn base_options(ctx: &RunContext, scenario: Scenario, id: &str) -> Result<TerraformOptions> {
    let image = ctx.images.get(scenario.image())?;
    let machine_type = ctx.config.machine_type.as_str();

    Ok(TerraformOptions::new(ctx.config.example_dir(scenario.example()))
        .var(TFVAR_GCP_PROJECT_ID, ctx.project_id.as_str())
        .var(TFVAR_GCP_REGION, ctx.region.as_str())
        .var(TFVAR_VAULT_CLUSTER_NAME, format!("vault-test-{id}"))
        .var(TFVAR_VAULT_SOURCE_IMAGE, image)
        .var(TFVAR_VAULT_MACHINE_TYPE, machine_type)
        .var(TFVAR_CONSUL_CLUSTER_NAME, format!("consul-test-{id}"))
        .var(TFVAR_CONSUL_SOURCE_IMAGE, image)
        .var(TFVAR_CONSUL_MACHINE_TYPE, machine_type))
}

/// Terraform options for a scenario.
fn scenario_options(ctx: &RunContext, scenario: Scenario, id: &str) -> Result<TerraformOptions> {
    let options = base_options(ctx, scenario, id)?;

    Ok(match scenario {
        Scenario::PublicCluster => options,
        Scenario::PrivateCluster => options
            .var(TFVAR_GCP_ZONE, ctx.zone.as_str())
            .var(TFVAR_BASTION_NAME, format!("vault-bastion-test-{id}")),
        Scenario::EnterpriseCluster => options
            .var(TFVAR_AUTO_UNSEAL_PROJECT, ctx.project_id.as_str())
            .var(TFVAR_AUTO_UNSEAL_REGION, ctx.region.as_str())
            .var(TFVAR_AUTO_UNSEAL_KEY_RING, ctx.config.auto_unseal_key_ring.as_str())
            .var(TFVAR_AUTO_UNSEAL_CRYPTO_KEY, ctx.config.auto_unseal_crypto_key.as_str()),
        Scenario::IamAuth | Scenario::GceAuth => {
            options.var(TFVAR_CLIENT_NAME, format!("vault-client-test-{id}"))
        }
    })
}

async fn deploy(ctx: &RunContext, scenario: Scenario, store: &dyn StageStore) -> Result<()> {
    // Hosts recorded by an earlier deployment must not outlive it.
    stage::clear(store, &[SAVED_CLUSTER_HOSTS, SAVED_BASTION_HOST])?;

    let id = unique_id();
    let options = scenario_options(ctx, scenario, &id)?;
    stage::save(store, SAVED_TERRAFORM_OPTIONS, &options)?;

    if scenario.is_cluster() && stage::load::<KeyPair>(store, SAVED_KEY_PAIR).is_err() {
        let dir = tempfile::tempdir().context("Failed to create key directory")?;
        let key_pair = generate_key_pair(&ctx.config.tools.ssh_keygen, dir.path(), &ctx.config.ssh_user)
            .await
            .context("Failed to generate ssh key pair")?;
        stage::save(store, SAVED_KEY_PAIR, &key_pair)?;
    }

    info!(scenario = %scenario, id = %id, "Deploying");
    ctx.provisioner
        .apply(&options)
        .await
        .with_context(|| format!("Failed to deploy {}", scenario.example()))?;
    Ok(())
}

async fn teardown(ctx: &RunContext, store: &dyn StageStore) -> Result<()> {
    let options: TerraformOptions = match stage::load(store, SAVED_TERRAFORM_OPTIONS) {
        Ok(options) => options,
        Err(e) => {
            warn!(error = %e, "Nothing to tear down");
            return Ok(());
        }
    };

    ctx.provisioner
        .destroy(&options)
        .await
        .context("Failed to destroy deployment")
}

/// Fetch node logs through the scenario's gateway. Never fails.
async fn write_logs(ctx: &RunContext, scenario: Scenario, store: &dyn StageStore) {
    let (Ok(hostnames), Ok(key_pair)) = (
        stage::load::<Vec<String>>(store, SAVED_CLUSTER_HOSTS),
        stage::load::<KeyPair>(store, SAVED_KEY_PAIR),
    ) else {
        warn!(scenario = %scenario, "No cluster members recorded, skipping log collection");
        return;
    };

    let key_pair = Arc::new(key_pair);
    let user = ctx.config.ssh_user.as_str();
    let connector = match stage::load::<String>(store, SAVED_BASTION_HOST) {
        Ok(bastion) => Connector::Relayed {
            bastion: Host::direct(bastion, user, Arc::clone(&key_pair)),
        },
        Err(_) => Connector::Direct,
    };
    let reach = connector.node_reach();

    let hosts: Vec<Host> = hostnames
        .into_iter()
        .map(|hostname| Host {
            hostname,
            user: user.to_string(),
            key_pair: Arc::clone(&key_pair),
            reach,
        })
        .collect();

    let executor = (ctx.gateways)(connector);
    let refs: Vec<&Host> = hosts.iter().collect();
    collect_logs(executor.as_ref(), &refs, &ctx.config.logs_dir, scenario.name()).await;
}
