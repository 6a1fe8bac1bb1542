//! Integration-test harness for Vault clusters on Google Cloud.
//!
//! A run builds the Vault images, deploys each example module, and drives the
//! resulting cluster through its lifecycle over ssh:
//!
//! - **Topology** - find the three members of the deployed instance group
//! - **Lifecycle** - wait for boot, initialize, unseal, confirm the leader
//! - **Verification** - Consul DNS, external endpoint, example web clients
//!
//! Everything that touches the outside world (ssh, packer, terraform, the
//! Compute Engine API) sits behind a trait so scenarios run against fakes in
//! tests.

pub mod config;
pub mod error;
pub mod gateway;
pub mod host;
pub mod lifecycle;
pub mod logs;
pub mod retry;
pub mod scenario;
pub mod stage;
pub mod status;
pub mod tools;
pub mod topology;
pub mod ui;
pub mod verify;

pub use config::{HarnessConfig, Secret};
pub use error::{HarnessError, Result, TransportError};
pub use gateway::{RemoteExecutor, SshGateway};
pub use host::{Connector, Host, KeyPair, Reachability};
pub use lifecycle::{LifecycleController, UnsealMaterial};
pub use retry::{do_with_retry, RetryPolicies, RetryPolicy};
pub use scenario::{Harness, RunReport, RunSettings, Scenario};
pub use status::NodeStatus;
pub use topology::{ClusterTopology, InstanceGroupLister, TopologyResolver};
pub use verify::VerificationSuite;
