//! Core data models for the provisioner worker

use crate::error::DispatchError;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

pub const DEFAULT_SSH_PORT: u16 = 22;
pub const DEFAULT_SSH_USER: &str = "root";
pub const MAX_OUTPUT_SIZE: usize = 10_485_760; // 10 MB

/// Free-form plugin fields carried by a task
pub type Fields = serde_json::Map<String, serde_json::Value>;

/// Lifecycle operations a task can name
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskName {
    Create,
    Confirm,
    Delete,
    Bootstrap,
    Install,
    Configure,
    Initialize,
    Start,
    Stop,
    Remove,
}

/// Which plugin family handles a task
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PluginKind {
    Provider,
    Automator,
}

impl TaskName {
    pub const ALL: [TaskName; 10] = [
        TaskName::Create,
        TaskName::Confirm,
        TaskName::Delete,
        TaskName::Bootstrap,
        TaskName::Install,
        TaskName::Configure,
        TaskName::Initialize,
        TaskName::Start,
        TaskName::Stop,
        TaskName::Remove,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskName::Create => "create",
            TaskName::Confirm => "confirm",
            TaskName::Delete => "delete",
            TaskName::Bootstrap => "bootstrap",
            TaskName::Install => "install",
            TaskName::Configure => "configure",
            TaskName::Initialize => "initialize",
            TaskName::Start => "start",
            TaskName::Stop => "stop",
            TaskName::Remove => "remove",
        }
    }

    pub fn plugin_kind(&self) -> PluginKind {
        match self {
            TaskName::Create | TaskName::Confirm | TaskName::Delete => PluginKind::Provider,
            _ => PluginKind::Automator,
        }
    }
}

impl fmt::Display for TaskName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskName {
    type Err = DispatchError;

    /// Case-insensitive; anything outside the fixed set is a dispatch error.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lowered = s.to_lowercase();
        TaskName::ALL
            .into_iter()
            .find(|name| name.as_str() == lowered)
            .ok_or_else(|| DispatchError::UnhandledTask(s.to_string()))
    }
}

/// Task envelope received from the task queue
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    #[serde(rename = "taskName")]
    pub task_name: String,
    #[serde(rename = "taskId", default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    #[serde(default)]
    pub config: TaskConfig,
}

impl Task {
    pub fn new(task_name: impl Into<String>, config: TaskConfig) -> Self {
        Self {
            task_name: task_name.into(),
            task_id: None,
            config,
        }
    }
}

/// Task configuration block
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub providerid: Option<String>,
    #[serde(default)]
    pub ipaddresses: IpAddresses,
    #[serde(rename = "ssh-auth", default)]
    pub ssh_auth: SshAuth,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sshuser: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service: Option<ServiceSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<ProviderSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub flavor: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
}

impl TaskConfig {
    /// `service.action.fields`, empty when any part of the path is absent
    pub fn service_fields(&self) -> Fields {
        self.service
            .as_ref()
            .and_then(|s| s.action.as_ref())
            .and_then(|a| a.fields.clone())
            .unwrap_or_default()
    }

    /// `provider.provisioner`, empty when absent
    pub fn provider_fields(&self) -> Fields {
        self.provider
            .as_ref()
            .and_then(|p| p.provisioner.clone())
            .unwrap_or_default()
    }
}

/// Node addresses keyed by role
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IpAddresses {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_v4: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bind_v4: Option<String>,
    #[serde(flatten)]
    pub other: Fields,
}

impl IpAddresses {
    /// Same address for access and bind
    pub fn single(address: impl Into<String>) -> Self {
        let address = address.into();
        Self {
            access_v4: Some(address.clone()),
            bind_v4: Some(address),
            other: Fields::new(),
        }
    }
}

/// Remote shell credentials
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SshAuth {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identityfile: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServiceSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<ServiceAction>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServiceAction {
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub action_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fields: Option<Fields>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProviderSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provisioner: Option<Fields>,
}

/// Task outcome status. Serialized as `0` (success) or `1` (failure).
///
/// There is no unset state; anything not explicitly successful is a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Status {
    Success,
    #[default]
    Failure,
}

impl Status {
    pub fn code(self) -> u8 {
        match self {
            Status::Success => 0,
            Status::Failure => 1,
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Status::Success => write!(f, "success"),
            Status::Failure => write!(f, "failure"),
        }
    }
}

impl Serialize for Status {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u8(self.code())
    }
}

impl<'de> Deserialize<'de> for Status {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        match u8::deserialize(deserializer)? {
            0 => Ok(Status::Success),
            1 => Ok(Status::Failure),
            other => Err(serde::de::Error::custom(format!(
                "invalid status {other}, expected 0 or 1"
            ))),
        }
    }
}

/// Data written back by a successful operation
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResultPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub providerid: Option<String>,
    #[serde(rename = "ssh-auth", default, skip_serializing_if = "Option::is_none")]
    pub ssh_auth: Option<SshAuth>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ipaddresses: Option<IpAddresses>,
    #[serde(flatten)]
    pub extra: Fields,
}

/// Successful return value of a plugin operation
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Outcome {
    pub payload: ResultPayload,
    pub stdout: Option<String>,
    pub stderr: Option<String>,
}

impl Outcome {
    pub fn with_payload(payload: ResultPayload) -> Self {
        Self {
            payload,
            ..Self::default()
        }
    }

    pub fn with_output(stdout: String, stderr: String) -> Self {
        Self {
            payload: ResultPayload::default(),
            stdout: Some(stdout),
            stderr: Some(stderr),
        }
    }
}

/// Result envelope returned to the task queue
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskResult {
    #[serde(default)]
    pub status: Status,
    #[serde(default)]
    pub result: ResultPayload,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stdout: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stderr: Option<String>,
}

impl TaskResult {
    pub fn success(outcome: Outcome) -> Self {
        Self {
            status: Status::Success,
            result: outcome.payload,
            stdout: outcome.stdout,
            stderr: outcome.stderr,
        }
    }

    pub fn failure(stderr: impl Into<String>) -> Self {
        Self {
            status: Status::Failure,
            result: ResultPayload::default(),
            stdout: None,
            stderr: Some(stderr.into()),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == Status::Success
    }
}
