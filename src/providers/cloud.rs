//! Generic node lifecycle over a [`ComputeApi`]
//!
//! `confirm` is the long one:
//! 1. look the node up; an `ERROR` state fails right away
//! 2. poll until the node is ready, bounded by `ready_timeout`
//! 3. pick the first IPv4 address on the requested network
//! 4. wait for sshd, then log in and run the verification command(s)
//! 5. write the address back as both access and bind address

use crate::error::{ProvisionerError, Result};
use crate::models::{
    Fields, IpAddresses, Outcome, ResultPayload, SshAuth, DEFAULT_SSH_PORT, DEFAULT_SSH_USER,
};
use crate::providers::{
    ComputeApi, ComputeConnector, ConfirmRequest, CreateRequest, DeleteRequest, NodeInfo,
    NodeSpec, NodeState, ProviderPlugin,
};
use crate::remote::access::ShellAccess;
use crate::remote::exec::RemoteCommand;
use crate::remote::SshTarget;
use async_trait::async_trait;
use serde::{Deserialize, Deserializer};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Tunables for the confirm stage
#[derive(Debug, Clone, PartialEq)]
pub struct ConfirmSettings {
    pub ready_timeout: Duration,
    pub poll_interval: Duration,
    pub ssh_port: u16,
    pub verify_command: String,
    /// Host to `ping -c1` from the node; `None` skips the check
    pub connectivity_check_host: Option<String>,
}

impl Default for ConfirmSettings {
    fn default() -> Self {
        Self {
            ready_timeout: Duration::from_secs(600),
            poll_interval: Duration::from_secs(5),
            ssh_port: DEFAULT_SSH_PORT,
            verify_command: "uname -a".to_string(),
            connectivity_check_host: None,
        }
    }
}

/// Per-call view of the node-related provider fields. Unknown keys are ignored.
#[derive(Debug, Clone, Default, Deserialize)]
struct NodeContext {
    #[serde(default, deserialize_with = "string_or_list")]
    security_groups: Vec<String>,
    #[serde(default, alias = "openstack_keyname")]
    key_name: Option<String>,
    #[serde(default, alias = "openstack_keyfile")]
    key_file: Option<String>,
    #[serde(default = "default_network")]
    network: String,
    #[serde(default)]
    metadata: HashMap<String, String>,
    #[serde(default)]
    config_drive: bool,
}

fn default_network() -> String {
    "public".to_string()
}

impl NodeContext {
    fn from_fields(fields: &Fields) -> Result<Self> {
        serde_json::from_value(serde_json::Value::Object(fields.clone()))
            .map_err(|e| ProvisionerError::Validation(format!("Invalid provider fields: {}", e)))
    }
}

/// Accepts `["a", "b"]`, `"a,b"` or null
fn string_or_list<'de, D>(deserializer: D) -> std::result::Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum StringOrList {
        One(String),
        Many(Vec<String>),
    }

    Ok(match Option::<StringOrList>::deserialize(deserializer)? {
        None => Vec::new(),
        Some(StringOrList::One(s)) => s
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(String::from)
            .collect(),
        Some(StringOrList::Many(list)) => list,
    })
}

fn require<'a>(value: Option<&'a str>, name: &str) -> Result<&'a str> {
    value
        .filter(|v| !v.is_empty())
        .ok_or_else(|| ProvisionerError::Validation(format!("Missing required field: {}", name)))
}

/// [`ProviderPlugin`] for any cloud reachable through a [`ComputeConnector`]
pub struct CloudProvider {
    connector: Arc<dyn ComputeConnector>,
    shell: ShellAccess,
    settings: ConfirmSettings,
}

impl CloudProvider {
    pub fn new(
        connector: Arc<dyn ComputeConnector>,
        shell: ShellAccess,
        settings: ConfirmSettings,
    ) -> Self {
        Self {
            connector,
            shell,
            settings,
        }
    }

    pub fn settings(&self) -> &ConfirmSettings {
        &self.settings
    }

    async fn poll_until_ready(&self, compute: &dyn ComputeApi, id: &str) -> Result<NodeInfo> {
        loop {
            tokio::time::sleep(self.settings.poll_interval).await;
            match compute.get_node(id).await? {
                None => return Err(ProvisionerError::ResourceNotFound(id.to_string())),
                Some(node) => match node.state {
                    NodeState::Ready => return Ok(node),
                    NodeState::Error => return Err(node_error(&node)),
                    ref state => debug!("Node {} is {}", id, state),
                },
            }
        }
    }

    async fn wait_until_ready(&self, compute: &dyn ComputeApi, id: &str) -> Result<NodeInfo> {
        debug!("Waiting for node to come up: {}", id);
        let timeout = self.settings.ready_timeout;

        tokio::time::timeout(timeout, self.poll_until_ready(compute, id)).await.map_err(|_| {
            warn!("Timed out waiting for node {} to become ready", id);
            ProvisionerError::ProviderTimeout {
                node: id.to_string(),
                timeout_secs: timeout.as_secs(),
            }
        })?
    }

    fn verification_commands(&self) -> Vec<RemoteCommand> {
        let mut commands = vec![RemoteCommand::new(self.settings.verify_command.as_str())
            .message("Validating remote shell access")];
        if let Some(host) = &self.settings.connectivity_check_host {
            commands.push(
                RemoteCommand::new(format!("ping -c1 {}", host))
                    .message("Validating external connectivity and DNS resolution via ping"),
            );
        }
        commands
    }
}

fn node_error(node: &NodeInfo) -> ProvisionerError {
    ProvisionerError::NodeError {
        node: if node.name.is_empty() {
            node.id.clone()
        } else {
            node.name.clone()
        },
        state: node.state.to_string(),
    }
}

#[async_trait]
impl ProviderPlugin for CloudProvider {
    fn name(&self) -> &str {
        self.connector.name()
    }

    async fn create(&self, request: &CreateRequest) -> Result<Outcome> {
        let hostname = require(request.hostname.as_deref(), "hostname")?;
        let flavor = require(request.flavor.as_deref(), "flavor")?;
        let image = require(request.image.as_deref(), "image")?;
        let ctx = NodeContext::from_fields(&request.fields)?;
        let compute = self.connector.connect(&request.fields)?;

        debug!(
            "Creating {} on {} using flavor: {}, image: {}",
            hostname,
            self.name(),
            flavor,
            image
        );
        let node = compute
            .create_node(&NodeSpec {
                name: hostname.to_string(),
                flavor: flavor.to_string(),
                image: image.to_string(),
                security_groups: ctx.security_groups,
                key_name: ctx.key_name,
                metadata: ctx.metadata,
                config_drive: ctx.config_drive,
            })
            .await?;
        info!("Submitted node {} as {}", hostname, node.id);

        Ok(Outcome::with_payload(ResultPayload {
            providerid: Some(node.id),
            ssh_auth: Some(SshAuth {
                user: Some(
                    request
                        .ssh_user
                        .clone()
                        .unwrap_or_else(|| DEFAULT_SSH_USER.to_string()),
                ),
                password: node.admin_password,
                identityfile: ctx.key_file,
            }),
            ..ResultPayload::default()
        }))
    }

    async fn confirm(&self, request: &ConfirmRequest) -> Result<Outcome> {
        let providerid = require(request.providerid.as_deref(), "providerid")?;
        let ctx = NodeContext::from_fields(&request.fields)?;
        let compute = self.connector.connect(&request.fields)?;

        debug!("Invoking node confirm for id: {}", providerid);
        let node = compute
            .get_node(providerid)
            .await?
            .ok_or_else(|| ProvisionerError::ResourceNotFound(providerid.to_string()))?;

        let node = match node.state {
            NodeState::Error => return Err(node_error(&node)),
            NodeState::Ready => node,
            _ => self.wait_until_ready(compute.as_ref(), providerid).await?,
        };

        let address = node
            .ipv4_address(&ctx.network)
            .filter(|a| !a.is_empty())
            .map(str::to_string)
            .ok_or_else(|| {
                warn!("No IP address available for bootstrapping {}", providerid);
                ProvisionerError::NoIpAddress(providerid.to_string())
            })?;
        debug!("Bootstrap IP address {}", address);

        let port = self.settings.ssh_port;
        self.shell.wait_for_sshd(&address, port).await?;
        debug!("Node {} sshd is up", node.name);

        let target = SshTarget::from_auth(address.as_str(), port, &request.ssh_auth);
        self.shell.run(target, self.verification_commands()).await?;

        info!("Node {} confirmed at {}", providerid, address);
        Ok(Outcome::with_payload(ResultPayload {
            ipaddresses: Some(IpAddresses::single(address)),
            ..ResultPayload::default()
        }))
    }

    async fn delete(&self, request: &DeleteRequest) -> Result<Outcome> {
        let providerid = require(request.providerid.as_deref(), "providerid")?;
        let compute = self.connector.connect(&request.fields)?;

        debug!("Invoking node delete for id: {}", providerid);
        let destroyed = match compute.get_node(providerid).await? {
            None => Err(ProvisionerError::ResourceNotFound(providerid.to_string())),
            Some(_) => compute.destroy_node(providerid).await,
        };

        match destroyed {
            Ok(()) => info!("Deleted node {}", providerid),
            Err(ProvisionerError::ResourceNotFound(_)) => {
                warn!("Could not locate node '{}'... skipping", providerid)
            }
            Err(e) => return Err(e),
        }

        Ok(Outcome::default())
    }
}
