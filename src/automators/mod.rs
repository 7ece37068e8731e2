//! Automator plugins: software lifecycle on a provisioned node
//!
//! An [`AutomatorPlugin`] exposes the seven service actions. Actions a
//! variant does not support fail with
//! [`ProvisionerError::Unimplemented`](crate::error::ProvisionerError::Unimplemented).

pub mod shell;

pub use shell::ShellAutomator;

use crate::error::Result;
use crate::models::{Fields, Outcome, SshAuth};
use crate::providers::unimplemented_op;
use async_trait::async_trait;

/// Normalized inputs shared by every automator action
#[derive(Debug, Clone, Default)]
pub struct AutomatorInput {
    pub hostname: Option<String>,
    /// Reachable address (`ipaddresses.access_v4`)
    pub ipaddress: Option<String>,
    pub ssh_auth: SshAuth,
    /// `service.action.fields`; empty when the task carries none
    pub fields: Fields,
}

#[async_trait]
pub trait AutomatorPlugin: Send + Sync {
    fn name(&self) -> &str;

    async fn bootstrap(&self, _input: &AutomatorInput) -> Result<Outcome> {
        Err(unimplemented_op("bootstrap", self.name()))
    }

    async fn install(&self, _input: &AutomatorInput) -> Result<Outcome> {
        Err(unimplemented_op("install", self.name()))
    }

    async fn configure(&self, _input: &AutomatorInput) -> Result<Outcome> {
        Err(unimplemented_op("configure", self.name()))
    }

    async fn initialize(&self, _input: &AutomatorInput) -> Result<Outcome> {
        Err(unimplemented_op("initialize", self.name()))
    }

    async fn start(&self, _input: &AutomatorInput) -> Result<Outcome> {
        Err(unimplemented_op("start", self.name()))
    }

    async fn stop(&self, _input: &AutomatorInput) -> Result<Outcome> {
        Err(unimplemented_op("stop", self.name()))
    }

    async fn remove(&self, _input: &AutomatorInput) -> Result<Outcome> {
        Err(unimplemented_op("remove", self.name()))
    }
}
