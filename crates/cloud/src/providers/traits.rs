//! Compute provider trait and common types.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors that can occur during compute provider operations.
#[derive(Error, Debug)]
pub enum CloudProviderError {
    /// HTTP request failed.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// API returned an error response.
    #[error("API error: {status} - {message}")]
    Api { status: u16, message: String },

    /// Resource not found.
    #[error("Resource not found: {0}")]
    NotFound(String),

    /// Invalid configuration.
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Authentication error.
    #[error("Authentication error: {0}")]
    Auth(String),
}

/// A virtual machine instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Instance {
    /// Instance name (resolvable inside the VPC).
    pub name: String,
    /// Zone the instance lives in.
    pub zone: String,
    /// External NAT address, if the instance has one.
    pub public_ip: Option<String>,
}

/// Trait for compute providers.
///
/// Only the calls the harness needs are modelled: reading the membership of
/// a managed instance group, authorizing ssh keys on its members and
/// cleaning up images built for a test run.
#[async_trait]
pub trait ComputeProvider: Send + Sync {
    /// List the members of a regional managed instance group.
    ///
    /// Members are returned in the order the API lists them.
    async fn list_group_instances(
        &self,
        region: &str,
        group: &str,
    ) -> Result<Vec<Instance>, CloudProviderError>;

    /// Get an instance by zone and name.
    async fn get_instance(&self, zone: &str, name: &str) -> Result<Instance, CloudProviderError>;

    /// Authorize `public_key` for `user` on an instance through its
    /// `ssh-keys` metadata.
    async fn add_ssh_key(
        &self,
        zone: &str,
        name: &str,
        user: &str,
        public_key: &str,
    ) -> Result<(), CloudProviderError>;

    /// Delete a global image. Deleting an image that no longer exists succeeds.
    async fn delete_image(&self, image: &str) -> Result<(), CloudProviderError>;
}
