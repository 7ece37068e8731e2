//! Structured logging configuration using tracing
//!
//! The sink is process-wide: configure it with [`init_logging`] before the
//! first log call. Once installed it stays fixed for the rest of the process
//! and a second call fails. Every line carries the process name registered
//! with [`set_process_name`].

use chrono::Utc;
use std::fmt;
use std::io::IsTerminal;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use tracing::field::{Field, Visit};
use tracing::{Event, Level, Subscriber};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::fmt::format::{JsonFields, Writer};
use tracing_subscriber::fmt::{FmtContext, FormatEvent, FormatFields, FormattedFields, MakeWriter};
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::FmtSubscriber;

static PROCESS_NAME: OnceLock<String> = OnceLock::new();

/// Register the process name stamped on every log line.
///
/// Only the first call has any effect; returns `false` if a name was already set.
pub fn set_process_name(name: impl Into<String>) -> bool {
    PROCESS_NAME.set(name.into()).is_ok()
}

/// Process name for log lines (`-` until one is registered)
pub fn process_name() -> &'static str {
    PROCESS_NAME.get().map(String::as_str).unwrap_or("-")
}

/// Log level configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
    Fatal,
}

impl From<LogLevel> for Level {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Debug => Level::DEBUG,
            LogLevel::Info => Level::INFO,
            LogLevel::Warn => Level::WARN,
            LogLevel::Error | LogLevel::Fatal => Level::ERROR,
        }
    }
}

impl From<&str> for LogLevel {
    fn from(s: &str) -> Self {
        let s = s.to_lowercase();
        if s.contains("debug") {
            LogLevel::Debug
        } else if s.contains("info") {
            LogLevel::Info
        } else if s.contains("warn") {
            LogLevel::Warn
        } else if s.contains("error") {
            LogLevel::Error
        } else if s.contains("fatal") {
            LogLevel::Fatal
        } else {
            LogLevel::Info
        }
    }
}

/// Log format configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Json,
    Pretty,
}

impl From<&str> for LogFormat {
    fn from(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "json" => LogFormat::Json,
            _ => LogFormat::Pretty,
        }
    }
}

/// Where log lines go
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogDestination {
    Stdout,
    Stderr,
    /// Rotated daily: lines go to `<path>.<YYYY-MM-DD>`
    File(PathBuf),
}

impl From<&str> for LogDestination {
    fn from(s: &str) -> Self {
        match s {
            "STDOUT" | "stdout" => LogDestination::Stdout,
            "" | "STDERR" | "stderr" => LogDestination::Stderr,
            path => LogDestination::File(PathBuf::from(path)),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone)]
pub struct LogConfig {
    pub level: LogLevel,
    pub format: LogFormat,
    pub destination: LogDestination,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: LogLevel::Info,
            format: LogFormat::Pretty,
            // stdout carries result envelopes
            destination: LogDestination::Stderr,
        }
    }
}

/// Event formatter that prefixes every line with timestamp, process name and level.
#[derive(Debug, Clone, Copy)]
pub struct ProcessFormat {
    format: LogFormat,
}

impl ProcessFormat {
    pub fn new(format: LogFormat) -> Self {
        Self { format }
    }
}

impl<S, N> FormatEvent<S, N> for ProcessFormat
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &Event<'_>,
    ) -> fmt::Result {
        let now = Utc::now();
        let meta = event.metadata();

        match self.format {
            LogFormat::Json => {
                let mut fields = serde_json::Map::new();
                event.record(&mut JsonVisitor(&mut fields));
                let spans: Vec<serde_json::Value> = ctx
                    .event_scope()
                    .map(|scope| {
                        scope
                            .from_root()
                            .map(|span| span_json::<S, N>(&span))
                            .collect()
                    })
                    .unwrap_or_default();
                let line = serde_json::json!({
                    "timestamp": now.to_rfc3339(),
                    "process": process_name(),
                    "level": meta.level().as_str(),
                    "target": meta.target(),
                    "spans": spans,
                    "fields": fields,
                });
                writeln!(writer, "{}", line)
            }
            LogFormat::Pretty => {
                write!(
                    writer,
                    "{} {} {}: ",
                    now.format("%Y-%m-%dT%H:%M:%S%.3f%:z"),
                    process_name(),
                    meta.level()
                )?;
                if let Some(scope) = ctx.event_scope() {
                    for span in scope.from_root() {
                        write!(writer, "{}", span.name())?;
                        let extensions = span.extensions();
                        if let Some(fields) = extensions.get::<FormattedFields<N>>() {
                            if !fields.is_empty() {
                                write!(writer, "{{{}}}", fields)?;
                            }
                        }
                        write!(writer, ": ")?;
                    }
                }
                ctx.field_format().format_fields(writer.by_ref(), event)?;
                writeln!(writer)
            }
        }
    }
}

/// Span name plus its recorded fields.
///
/// Fields are formatted by [`JsonFields`] in JSON mode; anything else is kept
/// as the raw formatted text.
fn span_json<S, N>(span: &tracing_subscriber::registry::SpanRef<'_, S>) -> serde_json::Value
where
    S: for<'a> LookupSpan<'a>,
    N: 'static,
{
    let mut object = serde_json::Map::new();
    object.insert("name".to_string(), span.name().into());

    let extensions = span.extensions();
    if let Some(formatted) = extensions.get::<FormattedFields<N>>() {
        match serde_json::from_str::<serde_json::Map<String, serde_json::Value>>(formatted) {
            Ok(fields) => object.extend(fields),
            Err(_) if !formatted.is_empty() => {
                object.insert("fields".to_string(), formatted.as_str().into());
            }
            Err(_) => {}
        }
    }

    serde_json::Value::Object(object)
}

struct JsonVisitor<'a>(&'a mut serde_json::Map<String, serde_json::Value>);

impl Visit for JsonVisitor<'_> {
    fn record_str(&mut self, field: &Field, value: &str) {
        self.0.insert(field.name().to_string(), value.into());
    }

    fn record_i64(&mut self, field: &Field, value: i64) {
        self.0.insert(field.name().to_string(), value.into());
    }

    fn record_u64(&mut self, field: &Field, value: u64) {
        self.0.insert(field.name().to_string(), value.into());
    }

    fn record_bool(&mut self, field: &Field, value: bool) {
        self.0.insert(field.name().to_string(), value.into());
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        self.0
            .insert(field.name().to_string(), format!("{:?}", value).into());
    }
}

/// Daily rolling appender writing next to `path`
pub fn daily_appender(path: &Path) -> anyhow::Result<RollingFileAppender> {
    let file_name = path
        .file_name()
        .ok_or_else(|| anyhow::anyhow!("Log file path has no file name: {}", path.display()))?;
    let dir = path
        .parent()
        .filter(|dir| !dir.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(dir)?;

    let appender = RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix(file_name.to_string_lossy())
        .build(dir)?;
    Ok(appender)
}

fn install<W>(config: &LogConfig, writer: W, ansi: bool) -> anyhow::Result<()>
where
    W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
{
    let builder = FmtSubscriber::builder()
        .with_max_level(Level::from(config.level))
        .with_ansi(ansi)
        .with_writer(writer);
    let format = ProcessFormat::new(config.format);

    match config.format {
        LogFormat::Json => {
            let subscriber = builder
                .fmt_fields(JsonFields::new())
                .event_format(format)
                .finish();
            tracing::subscriber::set_global_default(subscriber)?;
        }
        LogFormat::Pretty => {
            let subscriber = builder.event_format(format).finish();
            tracing::subscriber::set_global_default(subscriber)?;
        }
    }

    Ok(())
}

/// ANSI styling only for a console sink that is a terminal
fn use_ansi(destination: &LogDestination) -> bool {
    match destination {
        LogDestination::Stdout => std::io::stdout().is_terminal(),
        LogDestination::Stderr => std::io::stderr().is_terminal(),
        LogDestination::File(_) => false,
    }
}

/// Initialize logging with the given configuration
pub fn init_logging(config: &LogConfig) -> anyhow::Result<()> {
    let ansi = use_ansi(&config.destination);
    match &config.destination {
        LogDestination::Stdout => install(config, std::io::stdout, ansi),
        LogDestination::Stderr => install(config, std::io::stderr, ansi),
        LogDestination::File(path) => install(config, daily_appender(path)?, ansi),
    }
}
