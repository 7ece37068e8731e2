//! OpenStack compute adapter
//!
//! Authenticates against Keystone v2 (`POST {auth_url}/tokens` with password
//! credentials), takes the compute endpoint from the service catalog and
//! drives the Nova `/servers` resource with the issued token.
//!
//! A client is built per task from the task's provider fields and never
//! shared across tasks.

use crate::error::{ProvisionerError, Result};
use crate::models::Fields;
use crate::providers::{
    ComputeApi, ComputeConnector, CreatedNode, NodeAddress, NodeInfo, NodeSpec, NodeState,
};
use async_trait::async_trait;
use reqwest::{Client, Method, RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::OnceCell;
use tracing::debug;

/// Credentials and endpoint taken from the task's provider fields
#[derive(Clone, Deserialize)]
pub struct OpenStackContext {
    pub openstack_username: String,
    pub openstack_password: String,
    pub openstack_tenant: String,
    pub openstack_auth_url: String,
    #[serde(default = "default_verify_peer")]
    pub openstack_ssl_verify_peer: bool,
}

fn default_verify_peer() -> bool {
    true
}

impl std::fmt::Debug for OpenStackContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenStackContext")
            .field("openstack_username", &self.openstack_username)
            .field("openstack_password", &"<redacted>")
            .field("openstack_tenant", &self.openstack_tenant)
            .field("openstack_auth_url", &self.openstack_auth_url)
            .field("openstack_ssl_verify_peer", &self.openstack_ssl_verify_peer)
            .finish()
    }
}

impl OpenStackContext {
    pub fn from_fields(fields: &Fields) -> Result<Self> {
        let ctx: Self = serde_json::from_value(Value::Object(fields.clone()))
            .map_err(|e| ProvisionerError::Validation(format!("Invalid OpenStack fields: {}", e)))?;

        let url = url::Url::parse(&ctx.openstack_auth_url).map_err(|e| {
            ProvisionerError::Validation(format!(
                "Invalid openstack_auth_url '{}': {}",
                ctx.openstack_auth_url, e
            ))
        })?;
        if url.scheme() != "http" && url.scheme() != "https" {
            return Err(ProvisionerError::Validation(format!(
                "Invalid openstack_auth_url scheme '{}': only http and https are allowed",
                url.scheme()
            )));
        }

        Ok(ctx)
    }
}

/// Token and compute endpoint obtained from Keystone
#[derive(Debug, Clone)]
struct AuthSession {
    token: String,
    compute_url: String,
}

#[derive(Deserialize)]
struct TokenResponse {
    access: Access,
}

#[derive(Deserialize)]
struct Access {
    token: Token,
    #[serde(rename = "serviceCatalog", default)]
    service_catalog: Vec<CatalogEntry>,
}

#[derive(Deserialize)]
struct Token {
    id: String,
}

#[derive(Deserialize)]
struct CatalogEntry {
    #[serde(rename = "type")]
    service_type: String,
    #[serde(default)]
    endpoints: Vec<Endpoint>,
}

#[derive(Deserialize)]
struct Endpoint {
    #[serde(rename = "publicURL")]
    public_url: String,
}

#[derive(Deserialize)]
struct ServerEnvelope {
    server: Server,
}

#[derive(Deserialize)]
struct Server {
    id: String,
    #[serde(default)]
    name: String,
    #[serde(default)]
    status: String,
    #[serde(default)]
    addresses: HashMap<String, Vec<NodeAddress>>,
    #[serde(rename = "adminPass", default)]
    admin_pass: Option<String>,
}

/// [`ComputeApi`] over the OpenStack REST API
pub struct OpenStackClient {
    client: Client,
    context: OpenStackContext,
    session: OnceCell<AuthSession>,
}

impl OpenStackClient {
    pub fn new(context: OpenStackContext, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .user_agent(format!("provisioner/{}", env!("CARGO_PKG_VERSION")))
            .danger_accept_invalid_certs(!context.openstack_ssl_verify_peer)
            .timeout(timeout)
            .build()?;

        Ok(Self {
            client,
            context,
            session: OnceCell::new(),
        })
    }

    async fn authenticate(&self) -> Result<AuthSession> {
        debug!("Connection options for OpenStack:");
        debug!("- openstack_username {}", self.context.openstack_username);
        debug!("- openstack_tenant {}", self.context.openstack_tenant);
        debug!("- openstack_auth_url {}", self.context.openstack_auth_url);
        debug!(
            "- openstack_ssl_verify_peer {}",
            self.context.openstack_ssl_verify_peer
        );

        let url = format!(
            "{}/tokens",
            self.context.openstack_auth_url.trim_end_matches('/')
        );
        let response = self
            .client
            .post(&url)
            .json(&json!({
                "auth": {
                    "passwordCredentials": {
                        "username": self.context.openstack_username,
                        "password": self.context.openstack_password,
                    },
                    "tenantName": self.context.openstack_tenant,
                }
            }))
            .send()
            .await?;
        let response = check_status(response, "POST", &url).await?;
        let body: TokenResponse = response.json().await?;

        let compute_url = body
            .access
            .service_catalog
            .into_iter()
            .find(|entry| entry.service_type == "compute")
            .and_then(|entry| entry.endpoints.into_iter().next())
            .map(|endpoint| endpoint.public_url.trim_end_matches('/').to_string())
            .ok_or_else(|| {
                ProvisionerError::ProviderApi(
                    "No compute endpoint in the service catalog".to_string(),
                )
            })?;

        debug!("Authenticated; compute endpoint {}", compute_url);
        Ok(AuthSession {
            token: body.access.token.id,
            compute_url,
        })
    }

    async fn request(&self, method: Method, path: &str) -> Result<(RequestBuilder, String)> {
        let session = self
            .session
            .get_or_try_init(|| self.authenticate())
            .await?;
        let url = format!("{}{}", session.compute_url, path);
        let builder = self
            .client
            .request(method, &url)
            .header("X-Auth-Token", &session.token)
            .header("Accept", "application/json");
        Ok((builder, url))
    }
}

/// Map non-2xx responses to `ProviderApi`
async fn check_status(response: Response, method: &str, url: &str) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(ProvisionerError::ProviderApi(format!(
        "{} {} returned {}: {}",
        method,
        url,
        status,
        body.trim()
    )))
}

#[async_trait]
impl ComputeApi for OpenStackClient {
    async fn create_node(&self, spec: &NodeSpec) -> Result<CreatedNode> {
        let mut server = json!({
            "name": spec.name,
            "flavorRef": spec.flavor,
            "imageRef": spec.image,
        });
        if !spec.security_groups.is_empty() {
            server["security_groups"] = spec
                .security_groups
                .iter()
                .map(|name| json!({ "name": name }))
                .collect();
        }
        if let Some(key_name) = &spec.key_name {
            server["key_name"] = json!(key_name);
        }
        if !spec.metadata.is_empty() {
            server["metadata"] = json!(spec.metadata);
        }
        if spec.config_drive {
            server["config_drive"] = json!(true);
        }

        debug!("Invoking server create for {}", spec.name);
        let (builder, url) = self.request(Method::POST, "/servers").await?;
        let response = builder.json(&json!({ "server": server })).send().await?;
        let response = check_status(response, "POST", &url).await?;
        let created: ServerEnvelope = response.json().await?;

        Ok(CreatedNode {
            id: created.server.id,
            admin_password: created.server.admin_pass,
        })
    }

    async fn get_node(&self, id: &str) -> Result<Option<NodeInfo>> {
        let (builder, url) = self.request(Method::GET, &format!("/servers/{}", id)).await?;
        let response = builder.send().await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let response = check_status(response, "GET", &url).await?;
        let ServerEnvelope { server } = response.json().await?;

        Ok(Some(NodeInfo {
            state: NodeState::from_status(&server.status),
            id: server.id,
            name: server.name,
            addresses: server.addresses,
        }))
    }

    async fn destroy_node(&self, id: &str) -> Result<()> {
        let (builder, url) = self
            .request(Method::DELETE, &format!("/servers/{}", id))
            .await?;
        let response = builder.send().await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Err(ProvisionerError::ResourceNotFound(id.to_string()));
        }
        check_status(response, "DELETE", &url).await?;
        Ok(())
    }
}

/// Builds an [`OpenStackClient`] from each task's provider fields
#[derive(Debug, Clone)]
pub struct OpenStackConnector {
    timeout: Duration,
}

impl OpenStackConnector {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl Default for OpenStackConnector {
    fn default() -> Self {
        Self::new(Duration::from_secs(60))
    }
}

impl ComputeConnector for OpenStackConnector {
    fn name(&self) -> &str {
        "openstack"
    }

    fn connect(&self, fields: &Fields) -> Result<Arc<dyn ComputeApi>> {
        let context = OpenStackContext::from_fields(fields)?;
        Ok(Arc::new(OpenStackClient::new(context, self.timeout)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fields(value: Value) -> Fields {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_context_from_fields() {
        let ctx = OpenStackContext::from_fields(&fields(json!({
            "openstack_username": "admin",
            "openstack_password": "s3cret",
            "openstack_tenant": "dev",
            "openstack_auth_url": "https://keystone.example.com:5000/v2.0",
            "security_groups": "default"
        })))
        .unwrap();
        assert_eq!(ctx.openstack_tenant, "dev");
        assert!(ctx.openstack_ssl_verify_peer);
        assert!(!format!("{:?}", ctx).contains("s3cret"));
    }

    #[test]
    fn test_context_missing_credentials() {
        let err = OpenStackContext::from_fields(&fields(json!({
            "openstack_username": "admin"
        })))
        .unwrap_err();
        assert_eq!(err.kind(), "validation");
    }

    #[test]
    fn test_context_rejects_bad_auth_url() {
        let err = OpenStackContext::from_fields(&fields(json!({
            "openstack_username": "admin",
            "openstack_password": "pw",
            "openstack_tenant": "dev",
            "openstack_auth_url": "ftp://keystone"
        })))
        .unwrap_err();
        assert!(err.to_string().contains("scheme"));
    }

    #[test]
    fn test_connector_name() {
        assert_eq!(OpenStackConnector::default().name(), "openstack");
    }
}
