//! Validation for the IAM and GCE authentication examples.

use anyhow::{Context, Result};

use super::{RunContext, SAVED_TERRAFORM_OPTIONS, TFOUT_WEB_CLIENT_PUBLIC_IP};
use crate::host::Connector;
use crate::lifecycle::LifecycleController;
use crate::stage::{self, StageStore};
use crate::tools::TerraformOptions;
use crate::verify::VerificationSuite;

/// Secret the example web client reads from Vault and serves back.
pub(crate) const EXAMPLE_SECRET: &str = "42";

/// Port the example web client listens on.
pub(crate) const WEB_CLIENT_PORT: u16 = 8080;

pub(super) async fn validate(ctx: &RunContext, store: &dyn StageStore) -> Result<()> {
    let options: TerraformOptions = stage::load(store, SAVED_TERRAFORM_OPTIONS)?;
    let outputs = ctx
        .provisioner
        .outputs(&options)
        .await
        .context("Failed to read terraform outputs")?;
    let ip = outputs.required(TFOUT_WEB_CLIENT_PUBLIC_IP)?;

    let lifecycle = LifecycleController::new((ctx.gateways)(Connector::Direct), ctx.config.retry.clone());
    VerificationSuite::new(lifecycle)?
        .verify_web_client_secret(&format!("http://{ip}:{WEB_CLIENT_PORT}"), EXAMPLE_SECRET)
        .await?;
    Ok(())
}
