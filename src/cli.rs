//! CLI interface for the provisioner worker

use crate::config::WorkerConfig;
use crate::dispatcher::Dispatcher;
use crate::logging::{init_logging, set_process_name};
use crate::metrics::WorkerMetrics;
use crate::models::{PluginKind, Task, TaskConfig, TaskName};
use crate::signals::{parse_signal, SignalCoordinator};
use crate::templates;
use crate::worker::{build_dispatcher, Worker};
use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{error, info};

/// Provisioner - cluster node lifecycle worker
#[derive(Parser, Debug)]
#[command(name = "provisioner")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(
    about = "Runs node lifecycle tasks against cloud providers and over SSH",
    long_about = None
)]
pub struct Cli {
    /// Worker configuration file (YAML)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Log level (debug, info, warn, error, fatal); overrides the config file
    #[arg(short, long, global = true)]
    pub log_level: Option<String>,

    /// Log format (json or pretty); overrides the config file
    #[arg(long, global = true)]
    pub log_format: Option<String>,

    /// Append logs to this file instead of stderr
    #[arg(long, global = true)]
    pub log_file: Option<PathBuf>,

    /// Name stamped on every log line
    #[arg(long, global = true)]
    pub process_name: Option<String>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Execute one task and print its result
    Run {
        /// Path to a task envelope (JSON), or `-` for stdin
        task: String,
    },

    /// Read tasks as newline-delimited JSON on stdin, write results on stdout
    Worker,

    /// Check a task envelope without executing it
    Validate {
        /// Path to a task envelope (JSON), or `-` for stdin
        task: String,
    },

    /// Print sample configuration and task envelopes
    Template {
        /// Template type (omit to list available templates)
        #[arg(short = 't', long = "type")]
        template_type: Option<TemplateType>,

        /// Write output to a file instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

/// Available template types for the `template` subcommand.
#[derive(Debug, Clone, ValueEnum)]
pub enum TemplateType {
    /// Worker configuration file
    Worker,
    /// Node creation task
    Create,
    /// Node confirmation task
    Confirm,
    /// Node deletion task
    Delete,
    /// Service install task
    Install,
}

impl Cli {
    /// Load the worker configuration named by `--config`
    pub fn load_config(&self) -> anyhow::Result<WorkerConfig> {
        let mut config = WorkerConfig::load(self.config.as_deref())?;

        if let Some(level) = &self.log_level {
            config.logging.level = level.clone();
        }
        if let Some(format) = &self.log_format {
            config.logging.format = format.clone();
        }
        if let Some(path) = &self.log_file {
            config.logging.destination = path.display().to_string();
        }
        if let Some(name) = &self.process_name {
            config.logging.process_name = Some(name.clone());
        }

        Ok(config)
    }

    /// Initialize logging from the merged configuration
    pub fn init_logging(&self, config: &WorkerConfig) -> anyhow::Result<()> {
        if let Some(name) = &config.logging.process_name {
            set_process_name(name.as_str());
        }
        init_logging(&config.log_config())
    }

    /// Execute the CLI command
    pub async fn execute(&self, config: WorkerConfig) -> anyhow::Result<()> {
        match &self.command {
            Commands::Run { task } => self.run_task(&config, task).await,
            Commands::Worker => self.run_worker(&config).await,
            Commands::Validate { task } => self.validate_task(task),
            Commands::Template {
                template_type,
                output,
            } => self.handle_template(template_type.as_ref(), output.as_deref()),
        }
    }

    fn start_signals(&self, config: &WorkerConfig) -> anyhow::Result<Arc<SignalCoordinator>> {
        let signals = Arc::new(SignalCoordinator::with_default_shutdown());
        let signum = parse_signal(&config.worker.shutdown_signal)?;
        signals.listen(signum)?;
        Ok(signals)
    }

    /// Run a single task
    async fn run_task(&self, config: &WorkerConfig, source: &str) -> anyhow::Result<()> {
        let task = read_task(source)?;
        let signals = self.start_signals(config)?;
        let dispatcher = build_dispatcher(config, Arc::clone(&signals));

        // Held until the result is printed, so a shutdown cannot drop it.
        let section = signals.enter();
        let result = dispatcher.dispatch(&task).await?;
        println!("{}", serde_json::to_string_pretty(&result)?);
        drop(section);

        if result.is_success() {
            info!("Task {} completed successfully", task.task_name);
            Ok(())
        } else {
            error!("Task {} failed", task.task_name);
            std::process::exit(1);
        }
    }

    /// Serve tasks from stdin until EOF
    async fn run_worker(&self, config: &WorkerConfig) -> anyhow::Result<()> {
        let mut dispatcher: Dispatcher = build_dispatcher(config, self.start_signals(config)?);

        if let Some(port) = config.worker.metrics_port {
            let metrics = WorkerMetrics::new()?;
            metrics.start(port).await?;
            dispatcher = dispatcher.with_metrics(metrics);
        }

        let worker = Worker::new(Arc::new(dispatcher), config.worker.concurrency);
        worker
            .run(
                tokio::io::BufReader::new(tokio::io::stdin()),
                tokio::io::stdout(),
            )
            .await?;
        Ok(())
    }

    /// Validate a task envelope without executing it
    fn validate_task(&self, source: &str) -> anyhow::Result<()> {
        let task = read_task(source)?;
        let name: TaskName = task.task_name.parse()?;

        let missing = missing_fields(name, &task.config);
        if !missing.is_empty() {
            anyhow::bail!(
                "Task '{}' is missing required fields: {}",
                name,
                missing.join(", ")
            );
        }

        let plugin = match name.plugin_kind() {
            PluginKind::Provider => "provider",
            PluginKind::Automator => "automator",
        };
        info!("Task validation successful");
        println!("Task '{}' is valid", name);
        println!("Handled by: {} plugin", plugin);
        if let Some(id) = &task.task_id {
            println!("Task id: {}", id);
        }

        Ok(())
    }

    /// Handle the `template` subcommand.
    fn handle_template(
        &self,
        template_type: Option<&TemplateType>,
        output: Option<&Path>,
    ) -> anyhow::Result<()> {
        let Some(tt) = template_type else {
            println!("Available templates:\n");
            let header_type = "TYPE";
            let header_desc = "DESCRIPTION";
            println!("{header_type:<12} {header_desc}");
            println!("{}", "-".repeat(60));
            for info in templates::list_templates() {
                println!("{:<12} {}", info.name, info.description);
            }
            println!();
            println!("Usage: provisioner template --type <TYPE> [-o <FILE>]");
            return Ok(());
        };

        let type_name = match tt {
            TemplateType::Worker => "worker",
            TemplateType::Create => "create",
            TemplateType::Confirm => "confirm",
            TemplateType::Delete => "delete",
            TemplateType::Install => "install",
        };

        let content = templates::get_template(type_name)
            .ok_or_else(|| anyhow::anyhow!("Unknown template type: {}", type_name))?;

        if let Some(path) = output {
            use std::fs::OpenOptions;
            use std::io::Write as _;
            let mut file = OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(path)
                .map_err(|e| {
                    if e.kind() == std::io::ErrorKind::AlreadyExists {
                        anyhow::anyhow!(
                            "File '{}' already exists. Remove it first or choose a different name.",
                            path.display()
                        )
                    } else {
                        e.into()
                    }
                })?;
            file.write_all(content.as_bytes())?;
            println!("Template written to {}", path.display());
        } else {
            print!("{content}");
        }

        Ok(())
    }
}

/// Read a task envelope from a file, or stdin for `-`
fn read_task(source: &str) -> anyhow::Result<Task> {
    let content = if source == "-" {
        let mut buf = String::new();
        std::io::stdin().read_to_string(&mut buf)?;
        buf
    } else {
        std::fs::read_to_string(source)
            .with_context(|| format!("Failed to read task file {}", source))?
    };
    serde_json::from_str(&content).context("Invalid task envelope")
}

/// Fields an operation cannot run without
fn missing_fields(name: TaskName, config: &TaskConfig) -> Vec<&'static str> {
    let blank = |v: &Option<String>| v.as_deref().map_or(true, str::is_empty);
    let mut missing = Vec::new();

    match name {
        TaskName::Create => {
            if blank(&config.hostname) {
                missing.push("hostname");
            }
            if blank(&config.flavor) {
                missing.push("flavor");
            }
            if blank(&config.image) {
                missing.push("image");
            }
        }
        TaskName::Confirm | TaskName::Delete => {
            if blank(&config.providerid) {
                missing.push("providerid");
            }
        }
        TaskName::Bootstrap => {
            if blank(&config.ipaddresses.access_v4) {
                missing.push("ipaddresses.access_v4");
            }
        }
        _ => {
            if blank(&config.ipaddresses.access_v4) {
                missing.push("ipaddresses.access_v4");
            }
            if !config.service_fields().contains_key("script") {
                missing.push("service.action.fields.script");
            }
        }
    }

    missing
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logging::{LogDestination, LogFormat, LogLevel};
    use serde_json::json;

    #[test]
    fn test_cli_run_command() {
        let cli = Cli::parse_from(["provisioner", "run", "task.json"]);
        assert!(matches!(cli.command, Commands::Run { ref task } if task == "task.json"));
    }

    #[test]
    fn test_cli_worker_command() {
        let cli = Cli::parse_from(["provisioner", "--config", "/etc/provisioner.yaml", "worker"]);
        assert!(matches!(cli.command, Commands::Worker));
        assert_eq!(cli.config, Some(PathBuf::from("/etc/provisioner.yaml")));
    }

    #[test]
    fn test_cli_global_flags_after_subcommand() {
        let cli = Cli::parse_from([
            "provisioner",
            "validate",
            "-",
            "--log-level",
            "debug",
            "--process-name",
            "worker-07",
        ]);
        assert_eq!(cli.log_level.as_deref(), Some("debug"));
        assert_eq!(cli.process_name.as_deref(), Some("worker-07"));
    }

    #[test]
    fn test_cli_overrides_config() {
        let cli = Cli::parse_from([
            "provisioner",
            "--log-level",
            "warn",
            "--log-format",
            "json",
            "--log-file",
            "/tmp/provisioner.log",
            "worker",
        ]);
        let config = cli.load_config().unwrap();
        let log = config.log_config();
        assert_eq!(log.level, LogLevel::Warn);
        assert_eq!(log.format, LogFormat::Json);
        assert_eq!(
            log.destination,
            LogDestination::File(PathBuf::from("/tmp/provisioner.log"))
        );
    }

    #[test]
    fn test_cli_template_with_type() {
        let cli = Cli::parse_from(["provisioner", "template", "--type", "confirm"]);
        if let Commands::Template {
            template_type,
            output,
        } = &cli.command
        {
            assert!(matches!(template_type, Some(TemplateType::Confirm)));
            assert!(output.is_none());
        } else {
            panic!("Expected Template command");
        }
    }

    #[test]
    fn test_template_refuses_to_overwrite() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("worker.yaml");
        std::fs::write(&path, "existing").unwrap();

        let cli = Cli::parse_from(["provisioner", "template"]);
        let err = cli
            .handle_template(Some(&TemplateType::Worker), Some(&path))
            .unwrap_err();
        assert!(err.to_string().contains("already exists"));
    }

    #[test]
    fn test_missing_fields() {
        let config: TaskConfig = serde_json::from_value(json!({ "hostname": "node1" })).unwrap();
        assert_eq!(missing_fields(TaskName::Create, &config), vec!["flavor", "image"]);
        assert_eq!(missing_fields(TaskName::Delete, &config), vec!["providerid"]);
        assert_eq!(
            missing_fields(TaskName::Install, &config),
            vec!["ipaddresses.access_v4", "service.action.fields.script"]
        );

        let config: TaskConfig =
            serde_json::from_value(json!({ "ipaddresses": { "access_v4": "10.0.0.5" } })).unwrap();
        assert!(missing_fields(TaskName::Bootstrap, &config).is_empty());
    }

    #[test]
    fn test_read_task_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("task.json");
        std::fs::write(&path, templates::get_template("delete").unwrap()).unwrap();

        let task = read_task(path.to_str().unwrap()).unwrap();
        assert_eq!(task.task_name, "delete");
    }
}
