//! Error types for the provisioner worker

use crate::remote::exec::CommandExecutionError;
use thiserror::Error;

/// Errors raised by plugin operations and the layers beneath them.
///
/// None of these ever escape the dispatcher: they are folded into a
/// [`TaskResult`](crate::models::TaskResult) with `status: 1`.
#[derive(Error, Debug)]
pub enum ProvisionerError {
    /// The plugin variant does not support this lifecycle operation
    #[error("Unimplemented task {operation} in plugin {plugin}")]
    Unimplemented { operation: String, plugin: String },

    /// Node did not become ready in time
    #[error("Timed out after {timeout_secs}s waiting for node {node} to become ready")]
    ProviderTimeout { node: String, timeout_secs: u64 },

    /// Node reported an explicit error state
    #[error("Node {node} is in {state} state")]
    NodeError { node: String, state: String },

    /// Cloud API rejected a request
    #[error("Provider API error: {0}")]
    ProviderApi(String),

    /// Remote shell credentials were rejected
    #[error("SSH authentication failure for {user}@{host}: {message}")]
    AuthenticationFailure {
        user: String,
        host: String,
        message: String,
    },

    /// Remote command ran but exited non-zero or via a signal
    #[error(transparent)]
    CommandExecution(Box<CommandExecutionError>),

    /// Resource lookup came back empty
    #[error("Node {0} not found")]
    ResourceNotFound(String),

    /// Node has no IPv4 address on the requested network
    #[error("No IP address available for bootstrapping node {0}")]
    NoIpAddress(String),

    /// sshd never accepted connections within the retry budget
    #[error("Timed out waiting for sshd on {address} after {attempts} attempts")]
    SshdUnavailable { address: String, attempts: u32 },

    /// SSH transport/channel errors
    #[error("SSH error on {host}: {message}")]
    Ssh { host: String, message: String },

    /// Task input validation errors
    #[error("Validation error: {0}")]
    Validation(String),

    /// Worker configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// YAML parsing errors
    #[error("YAML parse error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// HTTP transport errors
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl ProvisionerError {
    /// Stable label used in logs and metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            ProvisionerError::Unimplemented { .. } => "unimplemented",
            ProvisionerError::ProviderTimeout { .. } => "provider_timeout",
            ProvisionerError::NodeError { .. } => "provider_error",
            ProvisionerError::ProviderApi(_) => "provider_api",
            ProvisionerError::AuthenticationFailure { .. } => "authentication_failure",
            ProvisionerError::CommandExecution(_) => "command_execution",
            ProvisionerError::ResourceNotFound(_) => "resource_not_found",
            ProvisionerError::NoIpAddress(_) => "no_ip_address",
            ProvisionerError::SshdUnavailable { .. } => "sshd_unavailable",
            ProvisionerError::Ssh { .. } => "ssh",
            ProvisionerError::Validation(_) => "validation",
            ProvisionerError::Config(_) => "config",
            ProvisionerError::Io(_)
            | ProvisionerError::Json(_)
            | ProvisionerError::Yaml(_)
            | ProvisionerError::Http(_)
            | ProvisionerError::Other(_) => "unexpected",
        }
    }

    /// True for the catch-all kinds that carry no provisioning meaning.
    pub fn is_unexpected(&self) -> bool {
        self.kind() == "unexpected"
    }
}

impl From<CommandExecutionError> for ProvisionerError {
    fn from(err: CommandExecutionError) -> Self {
        ProvisionerError::CommandExecution(Box::new(err))
    }
}

impl From<config::ConfigError> for ProvisionerError {
    fn from(err: config::ConfigError) -> Self {
        ProvisionerError::Config(err.to_string())
    }
}

/// Raised when a task cannot be attempted at all.
///
/// Distinct from [`ProvisionerError`]: the caller sent something the worker
/// has no operation for, so no result envelope is produced.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DispatchError {
    #[error("unhandled task type: {0}")]
    UnhandledTask(String),
}

/// Result type alias using ProvisionerError
pub type Result<T> = std::result::Result<T, ProvisionerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_labels() {
        let err = ProvisionerError::ProviderTimeout {
            node: "abc".to_string(),
            timeout_secs: 600,
        };
        assert_eq!(err.kind(), "provider_timeout");
        assert!(!err.is_unexpected());

        let err = ProvisionerError::Other("boom".to_string());
        assert!(err.is_unexpected());
    }

    #[test]
    fn test_dispatch_error_message() {
        let err = DispatchError::UnhandledTask("reboot".to_string());
        assert_eq!(err.to_string(), "unhandled task type: reboot");
    }

    #[test]
    fn test_command_execution_conversion() {
        let err: ProvisionerError = CommandExecutionError {
            message: None,
            command: "false".to_string(),
            stdout: String::new(),
            stderr: String::new(),
            exit_code: Some(1),
            exit_signal: None,
        }
        .into();
        assert_eq!(err.kind(), "command_execution");
        assert!(err.to_string().contains("false"));
    }
}
