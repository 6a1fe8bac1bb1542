//! Validation for the scenarios that drive a Vault cluster directly.

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::info;

use super::{
    RunContext, Scenario, SAVED_BASTION_HOST, SAVED_CLUSTER_HOSTS, SAVED_KEY_PAIR,
    SAVED_TERRAFORM_OPTIONS, TFOUT_BASTION_NAME, TFOUT_INSTANCE_GROUP_NAME,
};
use crate::host::{Connector, Host, KeyPair};
use crate::lifecycle::LifecycleController;
use crate::stage::{self, StageStore};
use crate::tools::{TerraformOptions, TerraformOutputs};
use crate::topology::{GceInstanceGroupLister, TopologyResolver, CLUSTER_SIZE};
use crate::verify::{vault_endpoint, VerificationSuite};

pub(super) async fn validate(ctx: &RunContext, scenario: Scenario, store: &dyn StageStore) -> Result<()> {
    let options: TerraformOptions = stage::load(store, SAVED_TERRAFORM_OPTIONS)?;
    let key_pair = Arc::new(stage::load::<KeyPair>(store, SAVED_KEY_PAIR)?);
    let outputs = ctx
        .provisioner
        .outputs(&options)
        .await
        .context("Failed to read terraform outputs")?;
    let group = outputs.required(TFOUT_INSTANCE_GROUP_NAME)?;
    let user = ctx.config.ssh_user.as_str();

    let lister = GceInstanceGroupLister::new(Arc::clone(&ctx.compute), ctx.region.as_str());
    lister
        .authorize_ssh_key(
            &group,
            user,
            &key_pair.public_key,
            CLUSTER_SIZE,
            ctx.config.retry.list_instances,
        )
        .await
        .with_context(|| format!("Failed to authorize ssh key on {group}"))?;

    let connector = if scenario.uses_bastion() {
        bastion_connector(ctx, &outputs, store, &key_pair).await?
    } else {
        Connector::Direct
    };

    let resolver = TopologyResolver::new(Arc::new(lister), ctx.config.retry.clone());
    let mut topology = resolver
        .resolve(&group, user, Arc::clone(&key_pair), &connector)
        .await?;
    stage::save(
        store,
        SAVED_CLUSTER_HOSTS,
        &topology.members().map(|host| host.hostname.as_str()),
    )?;

    let lifecycle = LifecycleController::new((ctx.gateways)(connector), ctx.config.retry.clone());

    if scenario == Scenario::EnterpriseCluster {
        lifecycle.initialize_auto_unseal(&mut topology).await?;
        for node in topology.members() {
            lifecycle.assert_version_is_enterprise(node).await?;
        }
        lifecycle
            .restart_and_expect_auto_unseal(&topology.standby1)
            .await?;
    } else {
        lifecycle.initialize_and_unseal(&mut topology).await?;
    }

    let suite = VerificationSuite::new(lifecycle)?;
    suite.verify_service_discovery_dns(&topology).await?;

    if scenario == Scenario::PublicCluster {
        suite
            .verify_external_endpoint(&vault_endpoint(&topology.leader.hostname))
            .await?;
    }

    info!(scenario = %scenario, leader = %topology.leader.hostname, "Cluster validated");
    Ok(())
}

/// Authorize the key on the bastion and build the relaying connector.
async fn bastion_connector(
    ctx: &RunContext,
    outputs: &TerraformOutputs,
    store: &dyn StageStore,
    key_pair: &Arc<KeyPair>,
) -> Result<Connector> {
    let name = outputs.required(TFOUT_BASTION_NAME)?;
    let user = ctx.config.ssh_user.as_str();

    ctx.compute
        .add_ssh_key(&ctx.zone, &name, user, &key_pair.public_key)
        .await
        .with_context(|| format!("Failed to authorize ssh key on bastion {name}"))?;

    let instance = ctx
        .compute
        .get_instance(&ctx.zone, &name)
        .await
        .with_context(|| format!("Failed to look up bastion {name}"))?;
    let address = instance
        .public_ip
        .with_context(|| format!("Bastion {name} has no external address"))?;

    stage::save(store, SAVED_BASTION_HOST, &address)?;
    info!(bastion = %address, "Relaying through bastion");

    Ok(Connector::Relayed {
        bastion: Host::direct(address, user, Arc::clone(key_pair)),
    })
}
