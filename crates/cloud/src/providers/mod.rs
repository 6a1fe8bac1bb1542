//! Compute provider abstractions.
//!
//! This module defines the common trait and types for compute providers.

pub mod gcp;
mod traits;

pub use traits::{CloudProviderError, ComputeProvider, Instance};

pub use gcp::Gcp;
