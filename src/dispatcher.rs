//! Task dispatch: from a task envelope to a finalized result
//!
//! [`Dispatcher::dispatch`] parses the task name, normalizes the common
//! inputs once and calls exactly one plugin operation. The operation runs
//! inside a guarded section and under `catch_unwind`; whatever it does, the
//! caller gets back a [`TaskResult`] whose status is `0` only if the
//! operation returned `Ok`. An unknown task name is the one case that does not
//! produce a result.

use crate::automators::{AutomatorInput, AutomatorPlugin};
use crate::error::{DispatchError, ProvisionerError, Result};
use crate::metrics::WorkerMetrics;
use crate::models::{Outcome, PluginKind, SshAuth, Task, TaskConfig, TaskName, TaskResult};
use crate::providers::{ConfirmRequest, CreateRequest, DeleteRequest, ProviderPlugin};
use crate::signals::SignalCoordinator;
use futures::FutureExt;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info_span, Instrument};

pub struct Dispatcher {
    provider: Arc<dyn ProviderPlugin>,
    automator: Arc<dyn AutomatorPlugin>,
    signals: Arc<SignalCoordinator>,
    metrics: Option<WorkerMetrics>,
}

impl Dispatcher {
    pub fn new(
        provider: Arc<dyn ProviderPlugin>,
        automator: Arc<dyn AutomatorPlugin>,
        signals: Arc<SignalCoordinator>,
    ) -> Self {
        Self {
            provider,
            automator,
            signals,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: WorkerMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn signals(&self) -> &Arc<SignalCoordinator> {
        &self.signals
    }

    /// Run one task to completion.
    ///
    /// # Errors
    ///
    /// Only [`DispatchError::UnhandledTask`]; every plugin failure is folded
    /// into the returned [`TaskResult`].
    pub async fn dispatch(&self, task: &Task) -> std::result::Result<TaskResult, DispatchError> {
        let name: TaskName = match task.task_name.parse() {
            Ok(name) => name,
            Err(e) => {
                error!("{}", e);
                if let Some(metrics) = &self.metrics {
                    metrics.record_rejected();
                }
                return Err(e);
            }
        };

        let span = info_span!(
            "task",
            task = name.as_str(),
            id = task.task_id.as_deref().unwrap_or("-")
        );
        Ok(self.execute(name, &task.config).instrument(span).await)
    }

    async fn execute(&self, name: TaskName, config: &TaskConfig) -> TaskResult {
        let plugin = match name.plugin_kind() {
            PluginKind::Provider => self.provider.name(),
            PluginKind::Automator => self.automator.name(),
        };
        debug!("Dispatching {} to plugin {}", name, plugin);

        if let Some(metrics) = &self.metrics {
            metrics.inc_active_tasks();
        }
        let started = Instant::now();

        let operation = AssertUnwindSafe(self.run_operation(name, config)).catch_unwind();
        let outcome = self.signals.guard(operation).await;
        let (result, failure_kind) = finalize(name, plugin, outcome);

        if let Some(metrics) = &self.metrics {
            metrics.dec_active_tasks();
            let status = if result.is_success() { "success" } else { "failure" };
            metrics.record_task(name.as_str(), status, started.elapsed().as_secs_f64());
            if let Some(kind) = failure_kind {
                metrics.record_failure(name.as_str(), kind);
            }
        }

        result
    }

    async fn run_operation(&self, name: TaskName, config: &TaskConfig) -> Result<Outcome> {
        let ssh_auth = normalized_ssh_auth(config);

        match name.plugin_kind() {
            PluginKind::Provider => {
                let fields = config.provider_fields();
                match name {
                    TaskName::Create => {
                        self.provider
                            .create(&CreateRequest {
                                hostname: config.hostname.clone(),
                                flavor: config.flavor.clone(),
                                image: config.image.clone(),
                                ssh_user: config.sshuser.clone(),
                                fields,
                            })
                            .await
                    }
                    TaskName::Confirm => {
                        self.provider
                            .confirm(&ConfirmRequest {
                                providerid: config.providerid.clone(),
                                ssh_auth,
                                fields,
                            })
                            .await
                    }
                    _ => {
                        self.provider
                            .delete(&DeleteRequest {
                                providerid: config.providerid.clone(),
                                fields,
                            })
                            .await
                    }
                }
            }
            PluginKind::Automator => {
                let input = AutomatorInput {
                    hostname: config.hostname.clone(),
                    ipaddress: config.ipaddresses.access_v4.clone(),
                    ssh_auth,
                    fields: config.service_fields(),
                };
                let automator = &self.automator;
                match name {
                    TaskName::Bootstrap => automator.bootstrap(&input).await,
                    TaskName::Install => automator.install(&input).await,
                    TaskName::Configure => automator.configure(&input).await,
                    TaskName::Initialize => automator.initialize(&input).await,
                    TaskName::Start => automator.start(&input).await,
                    TaskName::Stop => automator.stop(&input).await,
                    _ => automator.remove(&input).await,
                }
            }
        }
    }
}

/// `ssh-auth` with the login user falling back to `sshuser`
fn normalized_ssh_auth(config: &TaskConfig) -> SshAuth {
    let mut auth = config.ssh_auth.clone();
    if auth.user.is_none() {
        auth.user = config.sshuser.clone();
    }
    auth
}

/// Fold an operation outcome into the result envelope.
///
/// Returns the failure kind alongside the result for metrics.
fn finalize(
    name: TaskName,
    plugin: &str,
    outcome: std::thread::Result<Result<Outcome>>,
) -> (TaskResult, Option<&'static str>) {
    match outcome {
        Ok(Ok(outcome)) => {
            debug!("{} finished successfully", name);
            (TaskResult::success(outcome), None)
        }
        Ok(Err(err)) => {
            let stderr = if err.is_unexpected() {
                format!("Unexpected error in {}.{}: {}", plugin, name, err)
            } else {
                err.to_string()
            };
            error!(kind = err.kind(), "{}", stderr);

            let mut result = TaskResult::failure(stderr);
            if let ProvisionerError::CommandExecution(e) = &err {
                result.stdout = Some(e.stdout.clone());
            }
            (result, Some(err.kind()))
        }
        Err(panic) => {
            let stderr = format!(
                "Unexpected error in {}.{}: panicked: {}",
                plugin,
                name,
                panic_message(panic.as_ref())
            );
            error!(kind = "panic", "{}", stderr);
            (TaskResult::failure(stderr), Some("panic"))
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&'static str>() {
        *s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.as_str()
    } else {
        "unknown panic"
    }
}
