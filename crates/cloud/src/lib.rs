//! Google Cloud integration for the Vault cluster harness.
//!
//! The harness only needs a narrow slice of Compute Engine:
//!
//! - **Instance groups** - which instances belong to a deployed cluster,
//!   in listing order
//! - **Instances** - external address and zone of each member
//! - **Images** - removal of the images built for a test run

pub mod providers;

pub use providers::{gcp, CloudProviderError, ComputeProvider, Gcp, Instance};
