//! Compute Engine API request and response models.

use serde::{Deserialize, Serialize};

// ============================================================================
// Compute Engine (Instance) types
// ============================================================================

/// Compute Engine instance.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GceInstance {
    /// Instance name.
    pub name: String,
    /// Zone (URL).
    pub zone: String,
    /// Network interfaces.
    #[serde(default)]
    pub network_interfaces: Vec<NetworkInterface>,
    /// Instance metadata.
    #[serde(default)]
    pub metadata: Metadata,
}

/// Instance metadata, also the body of `instances.setMetadata`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Metadata {
    /// Optimistic locking token; must be echoed back on update.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fingerprint: Option<String>,
    /// Key/value entries.
    #[serde(default)]
    pub items: Vec<MetadataItem>,
}

/// A single metadata entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetadataItem {
    /// Key.
    pub key: String,
    /// Value.
    #[serde(default)]
    pub value: String,
}

/// Metadata key holding `user:key` lines.
pub const SSH_KEYS_METADATA_KEY: &str = "ssh-keys";

impl Metadata {
    /// Append an `user:public_key` line to the `ssh-keys` entry.
    ///
    /// Returns `false` if that exact line is already present.
    pub fn add_ssh_key(&mut self, user: &str, public_key: &str) -> bool {
        let line = format!("{user}:{}", public_key.trim());

        if let Some(item) = self.items.iter_mut().find(|i| i.key == SSH_KEYS_METADATA_KEY) {
            if item.value.lines().any(|l| l == line) {
                return false;
            }
            if !item.value.is_empty() && !item.value.ends_with('\n') {
                item.value.push('\n');
            }
            item.value.push_str(&line);
        } else {
            self.items.push(MetadataItem {
                key: SSH_KEYS_METADATA_KEY.to_string(),
                value: line,
            });
        }
        true
    }
}

/// Network interface.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkInterface {
    /// Access configs (for external IP).
    #[serde(default)]
    pub access_configs: Vec<AccessConfig>,
}

/// Access configuration (external IP).
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccessConfig {
    /// External NAT IP.
    #[serde(rename = "natIP")]
    pub nat_ip: Option<String>,
}

// ============================================================================
// Instance group types
// ============================================================================

/// Body of `regionInstanceGroups.listInstances`.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ListInstancesRequest {
    /// `ALL` or `RUNNING`.
    pub instance_state: String,
}

/// One page of `regionInstanceGroups.listInstances`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceGroupInstancesResponse {
    /// Group members on this page.
    #[serde(default)]
    pub items: Vec<InstanceWithNamedPorts>,
    /// Token for the next page, if any.
    pub next_page_token: Option<String>,
}

/// A group member reference.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceWithNamedPorts {
    /// Instance self link.
    pub instance: String,
    /// Instance status.
    pub status: Option<String>,
}

impl InstanceWithNamedPorts {
    /// Split the self link into `(zone, name)`.
    ///
    /// Self links look like
    /// `https://www.googleapis.com/compute/v1/projects/p/zones/us-east1-b/instances/vault-abc`.
    #[must_use]
    pub fn zone_and_name(&self) -> Option<(&str, &str)> {
        let mut parts = self.instance.rsplit('/');
        let name = parts.next()?;
        if parts.next()? != "instances" {
            return None;
        }
        let zone = parts.next()?;
        if parts.next()? != "zones" {
            return None;
        }
        Some((zone, name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_ssh_key_appends_to_existing_entry() {
        let mut md = Metadata {
            fingerprint: Some("abc".to_string()),
            items: vec![
                MetadataItem {
                    key: "startup-script".to_string(),
                    value: "#!/bin/bash".to_string(),
                },
                MetadataItem {
                    key: SSH_KEYS_METADATA_KEY.to_string(),
                    value: "alice:ssh-rsa AAA".to_string(),
                },
            ],
        };

        assert!(md.add_ssh_key("terratest", "ssh-rsa BBB\n"));
        assert_eq!(md.items[1].value, "alice:ssh-rsa AAA\nterratest:ssh-rsa BBB");
        assert!(!md.add_ssh_key("terratest", "ssh-rsa BBB"));
    }

    #[test]
    fn test_add_ssh_key_creates_entry() {
        let mut md = Metadata::default();
        assert!(md.add_ssh_key("terratest", "ssh-rsa BBB"));
        assert_eq!(
            md.items,
            [MetadataItem {
                key: SSH_KEYS_METADATA_KEY.to_string(),
                value: "terratest:ssh-rsa BBB".to_string(),
            }]
        );
    }
}
