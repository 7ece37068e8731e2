//! Worker configuration
//!
//! Layered with the `config` crate: built-in defaults, then an optional YAML
//! file, then `PROVISIONER__<SECTION>__<KEY>` environment variables, e.g.
//! `PROVISIONER__WORKER__CONCURRENCY=8`.

use crate::error::{ProvisionerError, Result};
use crate::logging::{LogConfig, LogDestination, LogFormat, LogLevel};
use crate::providers::ConfirmSettings;
use crate::retry::RetryConfig;
use crate::signals::parse_signal;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

pub const ENV_PREFIX: &str = "PROVISIONER";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    pub logging: LoggingSection,
    pub provider: ProviderSection,
    pub automator: AutomatorSection,
    pub ssh: SshSection,
    pub worker: WorkerSection,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSection {
    pub level: String,
    pub format: String,
    /// `stdout`, `stderr` or a file path
    pub destination: String,
    pub process_name: Option<String>,
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
            destination: "stderr".to_string(),
            process_name: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderSection {
    pub kind: String,
    pub ready_timeout_secs: u64,
    pub poll_interval_secs: u64,
    pub ssh_port: u16,
    pub verify_command: String,
    /// Host pinged from the node during confirm; unset disables the check
    pub connectivity_check_host: Option<String>,
    pub api_timeout_secs: u64,
}

impl Default for ProviderSection {
    fn default() -> Self {
        Self {
            kind: "openstack".to_string(),
            ready_timeout_secs: 600,
            poll_interval_secs: 5,
            ssh_port: 22,
            verify_command: "uname -a".to_string(),
            connectivity_check_host: None,
            api_timeout_secs: 60,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AutomatorSection {
    pub kind: String,
    pub remote_cache_dir: String,
}

impl Default for AutomatorSection {
    fn default() -> Self {
        Self {
            kind: "shell".to_string(),
            remote_cache_dir: "/var/cache/provisioner".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SshSection {
    pub connect_timeout_secs: u64,
    pub session_timeout_secs: u64,
    pub sshd_retries: u32,
    pub sshd_base_delay_ms: u64,
    pub sshd_max_delay_ms: u64,
}

impl Default for SshSection {
    fn default() -> Self {
        Self {
            connect_timeout_secs: 10,
            session_timeout_secs: 300,
            sshd_retries: 8,
            sshd_base_delay_ms: 1000,
            sshd_max_delay_ms: 30_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerSection {
    /// Tasks dispatched at the same time in worker mode
    pub concurrency: usize,
    pub shutdown_signal: String,
    pub metrics_port: Option<u16>,
}

impl Default for WorkerSection {
    fn default() -> Self {
        Self {
            concurrency: 4,
            shutdown_signal: "TERM".to_string(),
            metrics_port: None,
        }
    }
}

impl WorkerConfig {
    /// Load from an optional YAML file and the process environment
    pub fn load(path: Option<&Path>) -> Result<Self> {
        Self::load_with_env(path, None)
    }

    /// Like [`load`](Self::load) but reads variables from `env` instead of
    /// the process environment when given.
    pub fn load_with_env(
        path: Option<&Path>,
        env: Option<config::Map<String, String>>,
    ) -> Result<Self> {
        let mut builder = config::Config::builder();

        if let Some(path) = path {
            if !path.exists() {
                return Err(ProvisionerError::Config(format!(
                    "Config file not found: {}",
                    path.display()
                )));
            }
            builder = builder.add_source(
                config::File::from(path)
                    .format(config::FileFormat::Yaml)
                    .required(true),
            );
        }

        builder = builder.add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true)
                .source(env),
        );

        let config: WorkerConfig = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.provider.kind != "openstack" {
            return Err(ProvisionerError::Config(format!(
                "Unsupported provider kind: {}",
                self.provider.kind
            )));
        }
        if self.automator.kind != "shell" {
            return Err(ProvisionerError::Config(format!(
                "Unsupported automator kind: {}",
                self.automator.kind
            )));
        }
        if self.worker.concurrency == 0 {
            return Err(ProvisionerError::Config(
                "worker.concurrency must be at least 1".to_string(),
            ));
        }
        if self.provider.poll_interval_secs == 0 || self.provider.ready_timeout_secs == 0 {
            return Err(ProvisionerError::Config(
                "provider poll interval and ready timeout must be positive".to_string(),
            ));
        }
        parse_signal(&self.worker.shutdown_signal)?;
        Ok(())
    }

    pub fn log_config(&self) -> LogConfig {
        LogConfig {
            level: LogLevel::from(self.logging.level.as_str()),
            format: LogFormat::from(self.logging.format.as_str()),
            destination: LogDestination::from(self.logging.destination.as_str()),
        }
    }

    pub fn confirm_settings(&self) -> ConfirmSettings {
        ConfirmSettings {
            ready_timeout: Duration::from_secs(self.provider.ready_timeout_secs),
            poll_interval: Duration::from_secs(self.provider.poll_interval_secs),
            ssh_port: self.provider.ssh_port,
            verify_command: self.provider.verify_command.clone(),
            connectivity_check_host: self
                .provider
                .connectivity_check_host
                .clone()
                .filter(|h| !h.is_empty()),
        }
    }

    pub fn sshd_retry(&self) -> RetryConfig {
        RetryConfig::new(
            self.ssh.sshd_retries,
            Duration::from_millis(self.ssh.sshd_base_delay_ms),
            Duration::from_millis(self.ssh.sshd_max_delay_ms),
        )
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.ssh.connect_timeout_secs)
    }

    pub fn session_timeout(&self) -> Duration {
        Duration::from_secs(self.ssh.session_timeout_secs)
    }
}
