//! Runs a service action script on the node over SSH
//!
//! The action's fields name the script and its arguments:
//!
//! ```yaml
//! fields:
//!   script: /opt/recipes/hadoop/install.sh
//!   args: ["--role", "namenode"]
//!   pty: false
//! ```
//!
//! The script is treated as a black box. It runs from the remote cache
//! directory with `PROVISIONER_ACTION` and `PROVISIONER_HOSTNAME` set.

use crate::automators::{AutomatorInput, AutomatorPlugin};
use crate::error::{ProvisionerError, Result};
use crate::models::{Fields, Outcome};
use crate::remote::access::ShellAccess;
use crate::remote::exec::{CommandOutput, RemoteCommand};
use crate::remote::SshTarget;
use async_trait::async_trait;
use serde::{Deserialize, Deserializer};
use tracing::{debug, info};

#[derive(Debug, Clone, Default, Deserialize)]
struct ShellContext {
    script: Option<String>,
    #[serde(default, deserialize_with = "args_string_or_list")]
    args: Vec<String>,
    #[serde(default)]
    pty: bool,
}

impl ShellContext {
    fn from_fields(fields: &Fields) -> Result<Self> {
        serde_json::from_value(serde_json::Value::Object(fields.clone()))
            .map_err(|e| ProvisionerError::Validation(format!("Invalid shell fields: {}", e)))
    }
}

/// A single string is split on whitespace; a list is taken as-is
fn args_string_or_list<'de, D>(deserializer: D) -> std::result::Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Args {
        Line(String),
        List(Vec<String>),
    }

    Ok(match Option::<Args>::deserialize(deserializer)? {
        None => Vec::new(),
        Some(Args::Line(line)) => line.split_whitespace().map(String::from).collect(),
        Some(Args::List(list)) => list,
    })
}

/// Single-quote `value` for a POSIX shell
fn shell_quote(value: &str) -> String {
    if !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./=:,@%+".contains(c))
    {
        return value.to_string();
    }
    format!("'{}'", value.replace('\'', r"'\''"))
}

pub struct ShellAutomator {
    shell: ShellAccess,
    remote_cache_dir: String,
    ssh_port: u16,
}

impl ShellAutomator {
    pub fn new(shell: ShellAccess, remote_cache_dir: impl Into<String>, ssh_port: u16) -> Self {
        Self {
            shell,
            remote_cache_dir: remote_cache_dir.into(),
            ssh_port,
        }
    }

    fn target(&self, input: &AutomatorInput) -> Result<SshTarget> {
        let address = input
            .ipaddress
            .as_deref()
            .filter(|a| !a.is_empty())
            .ok_or_else(|| {
                ProvisionerError::Validation(
                    "Missing required field: ipaddresses.access_v4".to_string(),
                )
            })?;
        Ok(SshTarget::from_auth(address, self.ssh_port, &input.ssh_auth))
    }

    fn action_command(&self, action: &str, input: &AutomatorInput) -> Result<RemoteCommand> {
        let ctx = ShellContext::from_fields(&input.fields)?;
        let script = ctx
            .script
            .filter(|s| !s.trim().is_empty())
            .ok_or_else(|| {
                ProvisionerError::Validation(format!(
                    "Missing required field for {}: script",
                    action
                ))
            })?;

        let mut command = format!(
            "cd {} && PROVISIONER_ACTION={} PROVISIONER_HOSTNAME={} {}",
            shell_quote(&self.remote_cache_dir),
            action,
            shell_quote(input.hostname.as_deref().unwrap_or_default()),
            shell_quote(&script)
        );
        for arg in &ctx.args {
            command.push(' ');
            command.push_str(&shell_quote(arg));
        }

        Ok(RemoteCommand::new(command)
            .message(format!("Running {} script {}", action, script))
            .pty(ctx.pty))
    }

    async fn run_action(&self, action: &str, input: &AutomatorInput) -> Result<Outcome> {
        let target = self.target(input)?;
        let command = self.action_command(action, input)?;
        debug!("{} on {}: {}", action, target.address(), command.command());

        let outputs = self.shell.run(target, vec![command]).await?;
        info!("{} finished on {}", action, input.hostname.as_deref().unwrap_or("-"));
        Ok(collect_output(outputs))
    }
}

fn collect_output(outputs: Vec<CommandOutput>) -> Outcome {
    let (stdout, stderr) = outputs.into_iter().fold(
        (String::new(), String::new()),
        |(mut out, mut err), output| {
            out.push_str(&output.stdout);
            err.push_str(&output.stderr);
            (out, err)
        },
    );
    Outcome::with_output(stdout, stderr)
}

#[async_trait]
impl AutomatorPlugin for ShellAutomator {
    fn name(&self) -> &str {
        "shell"
    }

    async fn bootstrap(&self, input: &AutomatorInput) -> Result<Outcome> {
        let target = self.target(input)?;
        let commands = vec![RemoteCommand::new(format!(
            "mkdir -p {}",
            shell_quote(&self.remote_cache_dir)
        ))
        .message("Preparing remote cache directory")];

        let outputs = self.shell.run(target, commands).await?;
        info!("Bootstrapped {}", input.hostname.as_deref().unwrap_or("-"));
        Ok(collect_output(outputs))
    }

    async fn install(&self, input: &AutomatorInput) -> Result<Outcome> {
        self.run_action("install", input).await
    }

    async fn configure(&self, input: &AutomatorInput) -> Result<Outcome> {
        self.run_action("configure", input).await
    }

    async fn initialize(&self, input: &AutomatorInput) -> Result<Outcome> {
        self.run_action("initialize", input).await
    }

    async fn start(&self, input: &AutomatorInput) -> Result<Outcome> {
        self.run_action("start", input).await
    }

    async fn stop(&self, input: &AutomatorInput) -> Result<Outcome> {
        self.run_action("stop", input).await
    }

    async fn remove(&self, input: &AutomatorInput) -> Result<Outcome> {
        self.run_action("remove", input).await
    }
}
