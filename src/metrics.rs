//! Prometheus metrics collection and HTTP endpoint
//!
//! In worker mode the metrics are exposed on `/metrics` when a port is
//! configured.
//!
//! # Available Metrics
//!
//! - `provisioner_tasks_total{task, status}` - Counter of dispatched tasks
//! - `provisioner_task_duration_seconds{task}` - Histogram of task durations
//! - `provisioner_active_tasks` - Gauge of tasks currently executing
//! - `provisioner_task_failures_total{task, kind}` - Counter of failures by error kind
//! - `provisioner_memory_bytes` - Gauge of process memory usage (RSS)
//!
//! # Example
//!
//! ```no_run
//! use provisioner::metrics::WorkerMetrics;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let metrics = WorkerMetrics::new()?;
//! metrics.start(9090).await?;
//!
//! metrics.record_task("confirm", "success", 42.0);
//! # Ok(())
//! # }
//! ```

use prometheus::{
    CounterVec, Encoder, Gauge, HistogramOpts, HistogramVec, Opts, Registry, TextEncoder,
};
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{error, info};

/// Histogram bucket boundaries for task duration metrics (in seconds).
/// Node confirmation routinely takes minutes.
const TASK_DURATION_BUCKETS: &[f64] = &[
    0.5, 1.0, 5.0, 15.0, 30.0, 60.0, 120.0, 300.0, 600.0, 1200.0,
];

/// Prometheus metrics for the worker
#[derive(Clone)]
pub struct WorkerMetrics {
    registry: Arc<Registry>,
    tasks: CounterVec,
    task_duration: HistogramVec,
    active_tasks: Gauge,
    task_failures: CounterVec,
    memory_bytes: Gauge,
}

impl WorkerMetrics {
    pub fn new() -> prometheus::Result<Self> {
        let registry = Registry::new();

        let tasks = CounterVec::new(
            Opts::new("provisioner_tasks_total", "Total number of dispatched tasks"),
            &["task", "status"],
        )?;

        let task_duration = HistogramVec::new(
            HistogramOpts::new(
                "provisioner_task_duration_seconds",
                "Task execution duration in seconds",
            )
            .buckets(TASK_DURATION_BUCKETS.to_vec()),
            &["task"],
        )?;

        let active_tasks = Gauge::with_opts(Opts::new(
            "provisioner_active_tasks",
            "Tasks currently executing",
        ))?;

        let task_failures = CounterVec::new(
            Opts::new(
                "provisioner_task_failures_total",
                "Failed tasks by error kind",
            ),
            &["task", "kind"],
        )?;

        let memory_bytes = Gauge::with_opts(Opts::new(
            "provisioner_memory_bytes",
            "Process memory usage in bytes (RSS)",
        ))?;

        registry.register(Box::new(tasks.clone()))?;
        registry.register(Box::new(task_duration.clone()))?;
        registry.register(Box::new(active_tasks.clone()))?;
        registry.register(Box::new(task_failures.clone()))?;
        registry.register(Box::new(memory_bytes.clone()))?;

        Ok(Self {
            registry: Arc::new(registry),
            tasks,
            task_duration,
            active_tasks,
            task_failures,
            memory_bytes,
        })
    }

    /// Start the HTTP metrics server on the specified port
    ///
    /// The server exposes `/metrics` in Prometheus text format and answers
    /// 404 for anything else.
    pub async fn start(&self, port: u16) -> anyhow::Result<()> {
        let addr = format!("127.0.0.1:{}", port);
        let listener = TcpListener::bind(&addr).await?;
        info!("Metrics server listening on http://{}/metrics", addr);

        let metrics = self.clone();

        tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, _addr)) => {
                        let metrics = metrics.clone();
                        tokio::spawn(async move {
                            if let Err(e) = metrics.handle_request(stream).await {
                                error!("Error handling metrics request: {}", e);
                            }
                        });
                    }
                    Err(e) => {
                        error!("Error accepting connection: {}", e);
                    }
                }
            }
        });

        Ok(())
    }

    async fn handle_request(&self, mut stream: tokio::net::TcpStream) -> anyhow::Result<()> {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let mut buffer = [0; 1024];
        let n = stream.read(&mut buffer).await?;
        let request = String::from_utf8_lossy(&buffer[..n]);

        if request.starts_with("GET /metrics") {
            let body = self.render()?;
            let response = format!(
                "HTTP/1.1 200 OK\r\n\
                 Content-Type: text/plain; version=0.0.4\r\n\
                 Content-Length: {}\r\n\r\n{}",
                body.len(),
                body
            );
            stream.write_all(response.as_bytes()).await?;
        } else {
            let response = "HTTP/1.1 404 Not Found\r\nContent-Length: 9\r\n\r\nNot Found";
            stream.write_all(response.as_bytes()).await?;
        }

        Ok(())
    }

    /// Encode all metrics in Prometheus text format
    pub fn render(&self) -> anyhow::Result<String> {
        if let Ok(memory) = Self::get_memory_usage() {
            self.memory_bytes.set(memory as f64);
        }

        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        Ok(String::from_utf8(buffer)?)
    }

    /// Get process memory usage in bytes (RSS)
    #[cfg(target_os = "macos")]
    fn get_memory_usage() -> anyhow::Result<u64> {
        // SAFETY: getrusage only writes into the zeroed struct we own.
        unsafe {
            let mut info: libc::rusage = std::mem::zeroed();
            if libc::getrusage(libc::RUSAGE_SELF, &mut info) == 0 {
                // ru_maxrss is in bytes on macOS
                Ok(info.ru_maxrss as u64)
            } else {
                Err(anyhow::anyhow!("Failed to get memory usage"))
            }
        }
    }

    /// Get process memory usage in bytes (RSS)
    #[cfg(target_os = "linux")]
    fn get_memory_usage() -> anyhow::Result<u64> {
        // SAFETY: getrusage only writes into the zeroed struct we own.
        unsafe {
            let mut info: libc::rusage = std::mem::zeroed();
            if libc::getrusage(libc::RUSAGE_SELF, &mut info) == 0 {
                // ru_maxrss is in kilobytes on Linux
                Ok((info.ru_maxrss as u64) * 1024)
            } else {
                Err(anyhow::anyhow!("Failed to get memory usage"))
            }
        }
    }

    #[cfg(not(any(target_os = "linux", target_os = "macos")))]
    fn get_memory_usage() -> anyhow::Result<u64> {
        Err(anyhow::anyhow!(
            "Memory usage tracking not supported on this platform"
        ))
    }

    /// Record a finished task
    ///
    /// * `task` - Task name (`create`, `install`, ...)
    /// * `status` - `success`, `failure` or `rejected`
    /// * `duration_secs` - Wall time spent in the operation
    pub fn record_task(&self, task: &str, status: &str, duration_secs: f64) {
        self.tasks.with_label_values(&[task, status]).inc();
        self.task_duration
            .with_label_values(&[task])
            .observe(duration_secs);
    }

    /// Record why a task failed
    pub fn record_failure(&self, task: &str, kind: &str) {
        self.task_failures.with_label_values(&[task, kind]).inc();
    }

    /// Record a task the dispatcher refused to run
    pub fn record_rejected(&self) {
        self.tasks.with_label_values(&["unknown", "rejected"]).inc();
    }

    pub fn inc_active_tasks(&self) {
        self.active_tasks.inc();
    }

    pub fn dec_active_tasks(&self) {
        self.active_tasks.dec();
    }
}
