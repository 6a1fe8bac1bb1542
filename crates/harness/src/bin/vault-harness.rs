//! Vault harness CLI - provision and verify Vault clusters on Google Cloud.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use vault_cloud::{ComputeProvider, Gcp};
use vault_harness::config::{HarnessConfig, Secret};
use vault_harness::host::{Connector, Host, KeyPair};
use vault_harness::lifecycle::LifecycleController;
use vault_harness::scenario::{ssh_gateways, Harness, RunSettings, Scenario};
use vault_harness::stage::FileStageStore;
use vault_harness::tools::{Gcloud, PackerCli, TerraformCli};
use vault_harness::topology::{GceInstanceGroupLister, TopologyResolver};
use vault_harness::ui;
use vault_harness::verify::VerificationSuite;

/// Vault harness - integration tests for Vault clusters on Google Cloud.
#[derive(Parser)]
#[command(name = "vault-harness")]
#[command(about = "Provision, initialize, unseal and verify Vault clusters on Google Cloud")]
struct Cli {
    /// GCP project (or set `GOOGLE_CLOUD_PROJECT`; falls back to gcloud's default).
    #[arg(long, env = "GOOGLE_CLOUD_PROJECT")]
    project: Option<String>,

    /// GCP region.
    #[arg(long, env = "GOOGLE_CLOUD_REGION", default_value = "us-east1")]
    region: String,

    /// GCP zone, used for image builds and the bastion.
    #[arg(long, env = "GOOGLE_CLOUD_ZONE", default_value = "us-east1-b")]
    zone: String,

    /// `OAuth2` access token (falls back to `gcloud auth print-access-token`).
    #[arg(long, env = "GOOGLE_OAUTH_ACCESS_TOKEN", hide_env_values = true)]
    access_token: Option<String>,

    /// Harness configuration file (TOML).
    #[arg(short, long, env = "VAULT_HARNESS_CONFIG")]
    config: Option<PathBuf>,

    /// Enable verbose logging.
    #[arg(short, long, default_value = "false")]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Build images, run scenarios concurrently, clean up.
    Run {
        /// Scenarios to run (comma-separated, default: all).
        #[arg(long, value_enum, value_delimiter = ',')]
        scenario: Vec<Scenario>,

        /// Download URL of the Vault Enterprise package.
        #[arg(long, env = "VAULT_ENTERPRISE_DOWNLOAD_URL", hide_env_values = true)]
        enterprise_download_url: Option<String>,
    },

    /// Initialize and unseal an already deployed cluster.
    Lifecycle {
        /// Instance group of the Vault servers.
        #[arg(long)]
        group: String,

        /// Private key authorized on the members (`<path>.pub` must exist).
        #[arg(long)]
        key: PathBuf,

        /// External address of a bastion, for private clusters.
        #[arg(long)]
        bastion: Option<String>,

        /// The cluster auto-unseals with Cloud KMS.
        #[arg(long, default_value = "false")]
        auto_unseal: bool,
    },

    /// Wait until a Vault endpoint reports itself initialized.
    VerifyEndpoint {
        /// Base URL, e.g. `https://vault.example.com:8200`.
        #[arg(long)]
        url: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = HarnessConfig::load(cli.config.as_deref()).context("Failed to load config")?;

    match &cli.command {
        Commands::Run {
            scenario,
            enterprise_download_url,
        } => {
            let scenarios = if scenario.is_empty() {
                Scenario::ALL.to_vec()
            } else {
                scenario.clone()
            };

            let project_id = project_id(&cli, &config).await?;
            let compute = compute(&cli, &config, &project_id).await?;

            let settings = RunSettings {
                project_id,
                region: cli.region.clone(),
                zone: cli.zone.clone(),
                enterprise_download_url: enterprise_download_url.clone().map(Secret::new),
                scenarios,
            };

            let harness = Harness::new(
                config.clone(),
                compute,
                Arc::new(PackerCli::new(&config.tools.packer)),
                Arc::new(TerraformCli::new(&config.tools.terraform)),
                ssh_gateways(&config),
                FileStageStore::new(&config.work_dir),
            );

            let report = harness.run(&settings).await?;

            ui::print_section("Summary");
            for outcome in &report.outcomes {
                ui::print_outcome(
                    outcome.scenario.name(),
                    outcome.passed(),
                    outcome.error.as_deref().unwrap_or_default(),
                );
            }
            if let Some(e) = &report.cleanup_error {
                ui::print_warning(&format!("Image cleanup failed: {e}"));
            }

            let failed = report.outcomes.iter().filter(|o| !o.passed()).count();
            if failed > 0 {
                bail!("{failed} of {} scenarios failed", report.outcomes.len());
            }
            ui::print_success("All scenarios passed");
        }

        Commands::Lifecycle {
            group,
            key,
            bastion,
            auto_unseal,
        } => {
            let project_id = project_id(&cli, &config).await?;
            let compute = compute(&cli, &config, &project_id).await?;
            let key_pair = Arc::new(
                KeyPair::from_files(key)
                    .with_context(|| format!("Failed to read key pair {}", key.display()))?,
            );

            let connector = match bastion {
                Some(address) => Connector::Relayed {
                    bastion: Host::direct(address, &config.ssh_user, Arc::clone(&key_pair)),
                },
                None => Connector::Direct,
            };

            ui::print_step(&format!("Resolving instance group {group}"));
            let lister = Arc::new(GceInstanceGroupLister::new(compute, &cli.region));
            let resolver = TopologyResolver::new(lister, config.retry.clone());
            let mut topology = resolver
                .resolve(group, &config.ssh_user, key_pair, &connector)
                .await?;

            let lifecycle = LifecycleController::new(ssh_gateways(&config)(connector), config.retry.clone());
            ui::print_step("Initializing and unsealing");
            if *auto_unseal {
                lifecycle.initialize_auto_unseal(&mut topology).await?;
            } else {
                lifecycle.initialize_and_unseal(&mut topology).await?;
            }

            VerificationSuite::new(lifecycle)?
                .verify_service_discovery_dns(&topology)
                .await?;
            ui::print_success(&format!("Cluster is unsealed, leader is {}", topology.leader.hostname));
        }

        Commands::VerifyEndpoint { url } => {
            let lifecycle = LifecycleController::new(ssh_gateways(&config)(Connector::Direct), config.retry.clone());
            VerificationSuite::new(lifecycle)?
                .verify_external_endpoint(url)
                .await?;
            ui::print_success(&format!("{url} is initialized"));
        }
    }

    Ok(())
}

/// Project from the command line, or gcloud's configured default.
async fn project_id(cli: &Cli, config: &HarnessConfig) -> Result<String> {
    if let Some(project) = &cli.project {
        return Ok(project.clone());
    }

    Gcloud::new(&config.tools.gcloud)
        .config_value("project")
        .await?
        .context("No project given: set GOOGLE_CLOUD_PROJECT or a gcloud default project")
}

async fn compute(cli: &Cli, config: &HarnessConfig, project_id: &str) -> Result<Arc<dyn ComputeProvider>> {
    let token = match &cli.access_token {
        Some(token) => Secret::new(token.as_str()),
        None => {
            info!("No access token given, asking gcloud");
            Gcloud::new(&config.tools.gcloud).access_token().await?
        }
    };

    let gcp = Gcp::new(project_id, token.expose()).context("Failed to create Compute Engine client")?;
    Ok(Arc::new(gcp))
}
