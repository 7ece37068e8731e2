//! Provider plugins: the create / confirm / delete node lifecycle
//!
//! A [`ProviderPlugin`] owns one vendor's node lifecycle. [`CloudProvider`]
//! implements it generically over the [`ComputeApi`] capability, and vendor
//! adapters such as [`openstack`] only supply that capability.

pub mod cloud;
pub mod openstack;

pub use cloud::{CloudProvider, ConfirmSettings};

use crate::error::{ProvisionerError, Result};
use crate::models::{Fields, Outcome, SshAuth};
use async_trait::async_trait;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;

/// Inputs to [`ProviderPlugin::create`]
#[derive(Debug, Clone, Default)]
pub struct CreateRequest {
    pub hostname: Option<String>,
    pub flavor: Option<String>,
    pub image: Option<String>,
    /// Login user requested by the task (`config.sshuser`)
    pub ssh_user: Option<String>,
    pub fields: Fields,
}

/// Inputs to [`ProviderPlugin::confirm`]
#[derive(Debug, Clone, Default)]
pub struct ConfirmRequest {
    pub providerid: Option<String>,
    pub ssh_auth: SshAuth,
    pub fields: Fields,
}

/// Inputs to [`ProviderPlugin::delete`]
#[derive(Debug, Clone, Default)]
pub struct DeleteRequest {
    pub providerid: Option<String>,
    pub fields: Fields,
}

/// Node lifecycle operations of a cloud provider.
///
/// Operations a variant does not support fail with
/// [`ProvisionerError::Unimplemented`].
#[async_trait]
pub trait ProviderPlugin: Send + Sync {
    /// Plugin name used in logs and failure messages
    fn name(&self) -> &str;

    /// Submit a node creation request. Not idempotent.
    async fn create(&self, _request: &CreateRequest) -> Result<Outcome> {
        Err(unimplemented_op("create", self.name()))
    }

    /// Wait for a created node to become ready and reachable
    async fn confirm(&self, _request: &ConfirmRequest) -> Result<Outcome> {
        Err(unimplemented_op("confirm", self.name()))
    }

    /// Destroy a node; a node that is already gone counts as deleted
    async fn delete(&self, _request: &DeleteRequest) -> Result<Outcome> {
        Err(unimplemented_op("delete", self.name()))
    }
}

pub(crate) fn unimplemented_op(operation: &str, plugin: &str) -> ProvisionerError {
    ProvisionerError::Unimplemented {
        operation: operation.to_string(),
        plugin: plugin.to_string(),
    }
}

/// Node creation parameters handed to the cloud API
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NodeSpec {
    pub name: String,
    pub flavor: String,
    pub image: String,
    pub security_groups: Vec<String>,
    pub key_name: Option<String>,
    /// Boot configuration passed through to the node
    pub metadata: HashMap<String, String>,
    pub config_drive: bool,
}

/// Response to a successful creation request
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CreatedNode {
    pub id: String,
    /// Provider-issued initial secret, if any
    pub admin_password: Option<String>,
}

/// Provisioning state reported by the cloud API
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeState {
    Building,
    Ready,
    Error,
    Other(String),
}

impl NodeState {
    /// Map a vendor status string (e.g. `ACTIVE`, `BUILD`, `ERROR`)
    pub fn from_status(status: &str) -> Self {
        match status.to_uppercase().as_str() {
            "ACTIVE" | "READY" | "RUNNING" => NodeState::Ready,
            "BUILD" | "BUILDING" | "PENDING" | "REBUILD" => NodeState::Building,
            "ERROR" => NodeState::Error,
            other => NodeState::Other(other.to_string()),
        }
    }
}

impl std::fmt::Display for NodeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NodeState::Building => write!(f, "BUILD"),
            NodeState::Ready => write!(f, "ACTIVE"),
            NodeState::Error => write!(f, "ERROR"),
            NodeState::Other(s) => write!(f, "{}", s),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct NodeAddress {
    pub addr: String,
    pub version: u8,
}

/// Node state and addresses as reported by the cloud API
#[derive(Debug, Clone, PartialEq)]
pub struct NodeInfo {
    pub id: String,
    pub name: String,
    pub state: NodeState,
    /// Addresses keyed by network class (`public`, `private`, ...)
    pub addresses: HashMap<String, Vec<NodeAddress>>,
}

impl NodeInfo {
    /// First IPv4 address on `network`
    pub fn ipv4_address(&self, network: &str) -> Option<&str> {
        self.addresses
            .get(network)?
            .iter()
            .find(|a| a.version == 4)
            .map(|a| a.addr.as_str())
    }
}

/// Abstract cloud compute capability
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ComputeApi: Send + Sync {
    async fn create_node(&self, spec: &NodeSpec) -> Result<CreatedNode>;

    /// `None` when the id is unknown to the provider
    async fn get_node(&self, id: &str) -> Result<Option<NodeInfo>>;

    /// Fails with [`ProvisionerError::ResourceNotFound`] when the id is unknown
    async fn destroy_node(&self, id: &str) -> Result<()>;
}

/// Builds a [`ComputeApi`] client from one task's provider fields
pub trait ComputeConnector: Send + Sync {
    /// Vendor name, used as the plugin name
    fn name(&self) -> &str;

    fn connect(&self, fields: &Fields) -> Result<Arc<dyn ComputeApi>>;
}
