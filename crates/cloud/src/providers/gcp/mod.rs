//! GCP (Google Cloud Platform) provider.
//!
//! Implements the [`ComputeProvider`](crate::ComputeProvider) trait for
//! Compute Engine: regional managed instance groups, instances and images.

mod client;
mod models;

pub use client::{Gcp, COMPUTE_API_BASE};
pub use models::*;
