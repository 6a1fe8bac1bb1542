//! Resolve a deployed instance group into a three-node cluster topology.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{info, warn};
use vault_cloud::ComputeProvider;

use crate::error::{HarnessError, Result};
use crate::host::{Connector, Host, KeyPair, Reachability};
use crate::retry::{do_with_retry, RetryPolicies, RetryPolicy};

/// Number of Vault servers every example deploys.
pub const CLUSTER_SIZE: usize = 3;

/// Read access to the membership of an instance group.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait InstanceGroupLister: Send + Sync {
    /// External addresses of the group members, in listing order.
    async fn list_addresses(&self, group: &str) -> Result<Vec<String>>;

    /// Instance names of the group members, in listing order.
    async fn list_member_names(&self, group: &str) -> Result<Vec<String>>;
}

/// [`InstanceGroupLister`] for a regional managed instance group.
#[derive(Clone)]
pub struct GceInstanceGroupLister {
    provider: Arc<dyn ComputeProvider>,
    region: String,
}

impl GceInstanceGroupLister {
    /// Create a lister for groups in `region`.
    pub fn new(provider: Arc<dyn ComputeProvider>, region: impl Into<String>) -> Self {
        Self {
            provider,
            region: region.into(),
        }
    }

    /// Authorize `public_key` for `user` on every member of the group.
    ///
    /// Waits for the group to reach `expected` members first.
    ///
    /// # Errors
    /// Returns an error if the group never reaches the expected size or a
    /// metadata update fails.
    pub async fn authorize_ssh_key(
        &self,
        group: &str,
        user: &str,
        public_key: &str,
        expected: usize,
        policy: RetryPolicy,
    ) -> Result<Vec<String>> {
        let instances = do_with_retry("Getting instances", policy, || async {
            let instances = self.provider.list_group_instances(&self.region, group).await?;
            if instances.len() == expected {
                Ok(instances)
            } else {
                Err(HarnessError::TopologyCardinality {
                    expected,
                    found: instances.len(),
                    members: instances.into_iter().map(|i| i.name).collect(),
                })
            }
        })
        .await?;

        for instance in &instances {
            self.provider
                .add_ssh_key(&instance.zone, &instance.name, user, public_key)
                .await?;
        }

        Ok(instances.into_iter().map(|i| i.name).collect())
    }
}

#[async_trait]
impl InstanceGroupLister for GceInstanceGroupLister {
    async fn list_addresses(&self, group: &str) -> Result<Vec<String>> {
        let instances = self.provider.list_group_instances(&self.region, group).await?;

        Ok(instances
            .into_iter()
            .filter_map(|instance| {
                if instance.public_ip.is_none() {
                    warn!(instance = %instance.name, "Instance has no external address");
                }
                instance.public_ip
            })
            .collect())
    }

    async fn list_member_names(&self, group: &str) -> Result<Vec<String>> {
        let instances = self.provider.list_group_instances(&self.region, group).await?;
        Ok(instances.into_iter().map(|i| i.name).collect())
    }
}

/// Whether the leader role has been checked against the cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Leadership {
    /// Roles assigned by discovery order only.
    Provisional,
    /// The leader reported `Leader` on its health probe.
    Confirmed,
}

/// The three Vault servers of a cluster.
#[derive(Debug, Clone)]
pub struct ClusterTopology {
    /// Node initialized first and expected to become active.
    pub leader: Host,
    /// First standby.
    pub standby1: Host,
    /// Second standby.
    pub standby2: Host,
    leadership: Leadership,
}

impl ClusterTopology {
    /// Assign roles by position: leader, standby 1, standby 2.
    #[must_use]
    pub fn from_hosts([leader, standby1, standby2]: [Host; CLUSTER_SIZE]) -> Self {
        Self {
            leader,
            standby1,
            standby2,
            leadership: Leadership::Provisional,
        }
    }

    /// Members in role order.
    #[must_use]
    pub fn members(&self) -> [&Host; CLUSTER_SIZE] {
        [&self.leader, &self.standby1, &self.standby2]
    }

    /// Standbys in role order.
    #[must_use]
    pub fn standbys(&self) -> [&Host; 2] {
        [&self.standby1, &self.standby2]
    }

    /// Current leadership state.
    #[must_use]
    pub fn leadership(&self) -> Leadership {
        self.leadership
    }

    /// Mark the member at `index` (in [`members`](Self::members) order) as
    /// the confirmed leader, swapping roles if needed. Out-of-range indexes
    /// leave the topology untouched.
    pub fn confirm_leader(&mut self, index: usize) {
        match index {
            1 => std::mem::swap(&mut self.leader, &mut self.standby1),
            2 => std::mem::swap(&mut self.leader, &mut self.standby2),
            _ => {}
        }
        if index < CLUSTER_SIZE {
            self.leadership = Leadership::Confirmed;
        }
    }
}

/// Turns an instance group reference into a [`ClusterTopology`].
pub struct TopologyResolver {
    lister: Arc<dyn InstanceGroupLister>,
    policies: RetryPolicies,
}

impl TopologyResolver {
    /// Create a resolver.
    pub fn new(lister: Arc<dyn InstanceGroupLister>, policies: RetryPolicies) -> Self {
        Self { lister, policies }
    }

    /// Poll the group until it has exactly three members and assign roles
    /// from that listing.
    ///
    /// Direct connectors address nodes by external IP; relayed connectors
    /// address them by instance name, resolved inside the VPC.
    ///
    /// # Errors
    /// Returns [`HarnessError::RetryExhausted`] once the policy runs out. Its
    /// root is [`HarnessError::TopologyCardinality`] with the last listing if
    /// the group never had exactly three members, or the listing error.
    pub async fn resolve(
        &self,
        group: &str,
        ssh_user: &str,
        key_pair: Arc<KeyPair>,
        connector: &Connector,
    ) -> Result<ClusterTopology> {
        let reach = connector.node_reach();
        let (description, policy) = match reach {
            Reachability::Direct => (
                "Getting public ips of instances in instance group",
                self.policies.list_addresses,
            ),
            Reachability::ViaBastion => ("Getting instances", self.policies.list_instances),
        };

        let hostnames = do_with_retry(description, policy, || async {
            let hostnames = match reach {
                Reachability::Direct => self.lister.list_addresses(group).await?,
                Reachability::ViaBastion => self.lister.list_member_names(group).await?,
            };
            <[String; CLUSTER_SIZE]>::try_from(hostnames).map_err(|members| {
                HarnessError::TopologyCardinality {
                    expected: CLUSTER_SIZE,
                    found: members.len(),
                    members,
                }
            })
        })
        .await?;

        info!(group = %group, members = ?hostnames, "Resolved cluster topology");

        let hosts = hostnames.map(|hostname| Host {
            hostname,
            user: ssh_user.to_string(),
            key_pair: Arc::clone(&key_pair),
            reach,
        });
        Ok(ClusterTopology::from_hosts(hosts))
    }
}
