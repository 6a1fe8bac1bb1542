//! Compute Engine API client implementation.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use tracing::{debug, info, warn};
use url::Url;

use super::models::{GceInstance, InstanceGroupInstancesResponse, ListInstancesRequest};
use crate::providers::traits::{CloudProviderError, ComputeProvider, Instance};

/// Default timeout for API requests.
const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// Public Compute Engine endpoint.
pub const COMPUTE_API_BASE: &str = "https://compute.googleapis.com/compute/v1/";

/// GCP compute provider.
#[derive(Clone)]
pub struct Gcp {
    /// HTTP client.
    client: Client,
    /// API base, always ending in `/`.
    base_url: Url,
    /// Project ID.
    project_id: String,
    /// Access token (from service account or user).
    access_token: String,
}

impl Gcp {
    /// Create a new GCP provider against the public Compute Engine API.
    ///
    /// # Arguments
    /// * `project_id` - GCP project ID
    /// * `access_token` - `OAuth2` access token
    ///
    /// # Errors
    /// Returns error if HTTP client cannot be created.
    pub fn new(
        project_id: impl Into<String>,
        access_token: impl Into<String>,
    ) -> Result<Self, CloudProviderError> {
        Self::with_base_url(COMPUTE_API_BASE, project_id, access_token)
    }

    /// Create a provider that talks to a different API base (used by tests).
    ///
    /// # Errors
    /// Returns error if the URL is invalid or the HTTP client cannot be created.
    pub fn with_base_url(
        base_url: &str,
        project_id: impl Into<String>,
        access_token: impl Into<String>,
    ) -> Result<Self, CloudProviderError> {
        let normalized = if base_url.ends_with('/') {
            base_url.to_string()
        } else {
            format!("{base_url}/")
        };
        let base_url = Url::parse(&normalized)
            .map_err(|e| CloudProviderError::Config(format!("invalid API base {base_url}: {e}")))?;

        let client = Client::builder()
            .timeout(Duration::from_secs(DEFAULT_TIMEOUT_SECS))
            .build()
            .map_err(CloudProviderError::Http)?;

        Ok(Self {
            client,
            base_url,
            project_id: project_id.into(),
            access_token: access_token.into(),
        })
    }

    /// Build a project-scoped URL.
    fn url(&self, path: &str) -> Result<Url, CloudProviderError> {
        self.base_url
            .join(&format!("projects/{}/{path}", self.project_id))
            .map_err(|e| CloudProviderError::Config(format!("invalid resource path {path}: {e}")))
    }

    /// Make an authenticated GET request.
    async fn get<T: serde::de::DeserializeOwned>(&self, url: Url) -> Result<T, CloudProviderError> {
        debug!(url = %url, "GET request");

        let response = self
            .client
            .get(url)
            .bearer_auth(&self.access_token)
            .send()
            .await?;

        Self::handle_response(response).await
    }

    /// Make an authenticated POST request.
    async fn post<T, B>(&self, url: Url, body: &B) -> Result<T, CloudProviderError>
    where
        T: serde::de::DeserializeOwned,
        B: serde::Serialize + Sync,
    {
        debug!(url = %url, "POST request");

        let response = self
            .client
            .post(url)
            .bearer_auth(&self.access_token)
            .json(body)
            .send()
            .await?;

        Self::handle_response(response).await
    }

    /// Make an authenticated DELETE request.
    async fn delete(&self, url: Url) -> Result<(), CloudProviderError> {
        debug!(url = %url, "DELETE request");

        let response = self
            .client
            .delete(url)
            .bearer_auth(&self.access_token)
            .send()
            .await?;

        let status = response.status();
        if status.is_success() || status == StatusCode::NOT_FOUND {
            Ok(())
        } else {
            let text = response.text().await.unwrap_or_default();
            Err(CloudProviderError::Api {
                status: status.as_u16(),
                message: text,
            })
        }
    }

    /// Handle API response.
    async fn handle_response<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T, CloudProviderError> {
        let status = response.status();
        let text = response.text().await?;

        if status.is_success() {
            serde_json::from_str(&text).map_err(|e| {
                warn!(error = %e, body = %text, "Failed to parse response");
                CloudProviderError::Serialization(e)
            })
        } else if status == StatusCode::NOT_FOUND {
            Err(CloudProviderError::NotFound(text))
        } else if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            Err(CloudProviderError::Auth(text))
        } else {
            Err(CloudProviderError::Api {
                status: status.as_u16(),
                message: text,
            })
        }
    }

    /// Convert GCE instance to our type.
    fn to_instance(instance: &GceInstance) -> Instance {
        let public_ip = instance
            .network_interfaces
            .first()
            .and_then(|ni| ni.access_configs.first())
            .and_then(|ac| ac.nat_ip.clone());

        // Extract zone from URL
        let zone = instance
            .zone
            .rsplit('/')
            .next()
            .unwrap_or(&instance.zone)
            .to_string();

        Instance {
            name: instance.name.clone(),
            zone,
            public_ip,
        }
    }
}

#[async_trait]
impl ComputeProvider for Gcp {
    async fn list_group_instances(
        &self,
        region: &str,
        group: &str,
    ) -> Result<Vec<Instance>, CloudProviderError> {
        let body = ListInstancesRequest {
            instance_state: "ALL".to_string(),
        };

        let mut members = Vec::new();
        let mut page_token: Option<String> = None;

        loop {
            let mut url = self.url(&format!(
                "regions/{region}/instanceGroups/{group}/listInstances"
            ))?;
            if let Some(token) = &page_token {
                url.query_pairs_mut().append_pair("pageToken", token);
            }

            let page: InstanceGroupInstancesResponse = self.post(url, &body).await?;
            members.extend(page.items);

            match page.next_page_token {
                Some(token) if !token.is_empty() => page_token = Some(token),
                _ => break,
            }
        }

        debug!(
            group = %group,
            region = %region,
            count = members.len(),
            "Listed instance group members"
        );

        let mut instances = Vec::with_capacity(members.len());
        for member in &members {
            let (zone, name) = member.zone_and_name().ok_or_else(|| {
                CloudProviderError::Config(format!(
                    "unexpected instance link in group {group}: {}",
                    member.instance
                ))
            })?;
            instances.push(self.get_instance(zone, name).await?);
        }

        Ok(instances)
    }

    async fn get_instance(&self, zone: &str, name: &str) -> Result<Instance, CloudProviderError> {
        let url = self.url(&format!("zones/{zone}/instances/{name}"))?;
        let instance: GceInstance = self.get(url).await?;
        Ok(Self::to_instance(&instance))
    }

    async fn add_ssh_key(
        &self,
        zone: &str,
        name: &str,
        user: &str,
        public_key: &str,
    ) -> Result<(), CloudProviderError> {
        let url = self.url(&format!("zones/{zone}/instances/{name}"))?;
        let instance: GceInstance = self.get(url).await?;

        let mut metadata = instance.metadata;
        if !metadata.add_ssh_key(user, public_key) {
            debug!(instance = %name, user = %user, "ssh key already present");
            return Ok(());
        }

        let url = self.url(&format!("zones/{zone}/instances/{name}/setMetadata"))?;
        let _operation: serde_json::Value = self.post(url, &metadata).await?;

        info!(instance = %name, user = %user, "Added ssh key to instance metadata");
        Ok(())
    }

    async fn delete_image(&self, image: &str) -> Result<(), CloudProviderError> {
        info!(image = %image, project = %self.project_id, "Deleting image");

        let url = self.url(&format!("global/images/{image}"))?;
        self.delete(url).await?;

        info!(image = %image, "Image deletion initiated");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::gcp::models::InstanceWithNamedPorts;
    use wiremock::matchers::{body_json, header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn instance_json(name: &str, zone: &str, nat_ip: &str) -> serde_json::Value {
        serde_json::json!({
            "id": format!("id-{name}"),
            "name": name,
            "zone": format!("https://www.googleapis.com/compute/v1/projects/test-project/zones/{zone}"),
            "status": "RUNNING",
            "networkInterfaces": [{
                "networkIP": "10.0.0.2",
                "accessConfigs": [{ "type": "ONE_TO_ONE_NAT", "natIP": nat_ip, "name": "External NAT" }]
            }],
            "creationTimestamp": "2024-05-01T10:00:00.000-07:00"
        })
    }

    fn member(zone: &str, name: &str) -> serde_json::Value {
        serde_json::json!({
            "instance": format!(
                "https://www.googleapis.com/compute/v1/projects/test-project/zones/{zone}/instances/{name}"
            ),
            "status": "RUNNING"
        })
    }

    #[test]
    fn test_instance_conversion() {
        let gce: GceInstance =
            serde_json::from_value(instance_json("vault-a", "us-east1-b", "34.1.1.1")).unwrap();

        let converted = Gcp::to_instance(&gce);
        assert_eq!(converted.name, "vault-a");
        assert_eq!(converted.zone, "us-east1-b");
        assert_eq!(converted.public_ip.as_deref(), Some("34.1.1.1"));
    }

    #[test]
    fn test_zone_and_name_from_self_link() {
        let m: InstanceWithNamedPorts =
            serde_json::from_value(member("us-east1-c", "vault-xyz")).unwrap();
        assert_eq!(m.zone_and_name(), Some(("us-east1-c", "vault-xyz")));

        let bad = InstanceWithNamedPorts {
            instance: "vault-xyz".to_string(),
            status: None,
        };
        assert_eq!(bad.zone_and_name(), None);
    }

    #[tokio::test]
    async fn test_list_group_instances_preserves_order_across_pages() {
        let server = MockServer::start().await;
        let list_path =
            "/projects/test-project/regions/us-east1/instanceGroups/vault-group/listInstances";

        Mock::given(method("POST"))
            .and(path(list_path))
            .and(query_param("pageToken", "p2"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "items": [member("us-east1-d", "vault-c")]
            })))
            .mount(&server)
            .await;

        Mock::given(method("POST"))
            .and(path(list_path))
            .and(header("authorization", "Bearer token"))
            .and(body_json(serde_json::json!({ "instanceState": "ALL" })))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "items": [member("us-east1-b", "vault-a"), member("us-east1-c", "vault-b")],
                "nextPageToken": "p2"
            })))
            .up_to_n_times(1)
            .mount(&server)
            .await;

        for (zone, name, ip) in [
            ("us-east1-b", "vault-a", "34.0.0.1"),
            ("us-east1-c", "vault-b", "34.0.0.2"),
            ("us-east1-d", "vault-c", "34.0.0.3"),
        ] {
            Mock::given(method("GET"))
                .and(path(format!(
                    "/projects/test-project/zones/{zone}/instances/{name}"
                )))
                .respond_with(ResponseTemplate::new(200).set_body_json(instance_json(name, zone, ip)))
                .mount(&server)
                .await;
        }

        let gcp = Gcp::with_base_url(&server.uri(), "test-project", "token").unwrap();
        let instances = gcp
            .list_group_instances("us-east1", "vault-group")
            .await
            .unwrap();

        let names: Vec<_> = instances.iter().map(|i| i.name.as_str()).collect();
        assert_eq!(names, ["vault-a", "vault-b", "vault-c"]);
        let ips: Vec<_> = instances
            .iter()
            .map(|i| i.public_ip.clone().unwrap_or_default())
            .collect();
        assert_eq!(ips, ["34.0.0.1", "34.0.0.2", "34.0.0.3"]);
    }

    #[tokio::test]
    async fn test_add_ssh_key_echoes_fingerprint() {
        let server = MockServer::start().await;
        let instance_path = "/projects/test-project/zones/us-east1-b/instances/vault-a";

        let mut body = instance_json("vault-a", "us-east1-b", "34.0.0.1");
        body["metadata"] = serde_json::json!({
            "fingerprint": "fp-1",
            "items": [{ "key": "ssh-keys", "value": "alice:ssh-rsa AAA" }]
        });
        Mock::given(method("GET"))
            .and(path(instance_path))
            .respond_with(ResponseTemplate::new(200).set_body_json(body))
            .mount(&server)
            .await;

        Mock::given(method("POST"))
            .and(path(format!("{instance_path}/setMetadata")))
            .and(body_json(serde_json::json!({
                "fingerprint": "fp-1",
                "items": [{ "key": "ssh-keys", "value": "alice:ssh-rsa AAA\nterratest:ssh-rsa BBB" }]
            })))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(serde_json::json!({ "kind": "compute#operation" })),
            )
            .expect(1)
            .mount(&server)
            .await;

        let gcp = Gcp::with_base_url(&server.uri(), "test-project", "token").unwrap();
        gcp.add_ssh_key("us-east1-b", "vault-a", "terratest", "ssh-rsa BBB")
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_auth_failure_is_reported() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(403).set_body_string("denied"))
            .mount(&server)
            .await;

        let gcp = Gcp::with_base_url(&server.uri(), "test-project", "bad").unwrap();
        let err = gcp.get_instance("us-east1-b", "vault-a").await.unwrap_err();
        assert!(matches!(err, CloudProviderError::Auth(ref m) if m == "denied"));
    }

    #[tokio::test]
    async fn test_delete_missing_image_is_ok() {
        let server = MockServer::start().await;
        Mock::given(method("DELETE"))
            .and(path("/projects/test-project/global/images/vault-consul-abc"))
            .respond_with(ResponseTemplate::new(404))
            .expect(1)
            .mount(&server)
            .await;

        let gcp = Gcp::with_base_url(&server.uri(), "test-project", "token").unwrap();
        gcp.delete_image("vault-consul-abc").await.unwrap();
    }
}
