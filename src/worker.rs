//! Long-running worker over newline-delimited JSON
//!
//! Each input line is one task envelope. Up to `concurrency` tasks run at
//! once; every task produces exactly one reply line, written as soon as the
//! task finishes (so replies may come back out of order; `taskId`
//! correlates them):
//!
//! ```text
//! {"taskId":"42-1-3","taskName":"confirm","status":0,"result":{...}}
//! {"taskId":"42-1-4","taskName":"reboot","error":"unhandled task type: reboot"}
//! ```
//!
//! Each accepted task holds a guarded section from admission until its reply
//! has been flushed, so a shutdown signal never loses a finished result. Once
//! a signal is pending the worker stops reading input, answers the line it
//! was handed with an error and drains the tasks already running.

use crate::automators::ShellAutomator;
use crate::config::WorkerConfig;
use crate::dispatcher::Dispatcher;
use crate::models::{Task, TaskResult};
use crate::providers::openstack::OpenStackConnector;
use crate::providers::CloudProvider;
use crate::remote::access::ShellAccess;
use crate::remote::ssh::Ssh2Connector;
use crate::signals::{GuardedSection, SignalCoordinator};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::Semaphore;
use tokio::task::{JoinError, JoinSet};
use tracing::{debug, error, info, warn};

/// Wire the production plugins described by `config`
pub fn build_dispatcher(config: &WorkerConfig, signals: Arc<SignalCoordinator>) -> Dispatcher {
    let shell = ShellAccess::new(
        Arc::new(Ssh2Connector::new(config.connect_timeout(), config.session_timeout())),
        config.sshd_retry(),
        config.connect_timeout(),
    );
    let provider = CloudProvider::new(
        Arc::new(OpenStackConnector::new(Duration::from_secs(
            config.provider.api_timeout_secs,
        ))),
        shell.clone(),
        config.confirm_settings(),
    );
    let automator = ShellAutomator::new(
        shell,
        config.automator.remote_cache_dir.clone(),
        config.provider.ssh_port,
    );

    Dispatcher::new(Arc::new(provider), Arc::new(automator), signals)
}

/// One output line
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Reply {
    #[serde(rename = "taskId", skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    #[serde(rename = "taskName", skip_serializing_if = "Option::is_none")]
    pub task_name: Option<String>,
    #[serde(flatten)]
    pub body: ReplyBody,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ReplyBody {
    Result(TaskResult),
    Error { error: String },
}

/// Counters reported when the input is exhausted
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkerStats {
    pub succeeded: usize,
    pub failed: usize,
    pub rejected: usize,
}

impl WorkerStats {
    fn count(&mut self, reply: &Reply) {
        match &reply.body {
            ReplyBody::Result(result) if result.is_success() => self.succeeded += 1,
            ReplyBody::Result(_) => self.failed += 1,
            ReplyBody::Error { .. } => self.rejected += 1,
        }
    }
}

pub struct Worker {
    dispatcher: Arc<Dispatcher>,
    concurrency: usize,
}

impl Worker {
    pub fn new(dispatcher: Arc<Dispatcher>, concurrency: usize) -> Self {
        Self {
            dispatcher,
            concurrency: concurrency.max(1),
        }
    }

    /// Process tasks from `input` until EOF, then wait for in-flight tasks.
    pub async fn run<R, W>(&self, input: R, mut output: W) -> anyhow::Result<WorkerStats>
    where
        R: AsyncBufRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        let signals = Arc::clone(self.dispatcher.signals());
        let mut in_flight: JoinSet<(Reply, GuardedSection)> = JoinSet::new();
        let mut stats = WorkerStats::default();
        let mut lines = input.lines();

        info!(
            "Worker ready, waiting for tasks (concurrency {})",
            self.concurrency
        );

        loop {
            tokio::select! {
                line = lines.next_line() => {
                    let Some(line) = line? else { break };
                    let line = line.trim();
                    if line.is_empty() {
                        continue;
                    }

                    let mut task: Task = match serde_json::from_str(line) {
                        Ok(task) => task,
                        Err(e) => {
                            warn!("Discarding malformed task: {}", e);
                            let reply = Reply {
                                task_id: None,
                                task_name: None,
                                body: ReplyBody::Error {
                                    error: format!("invalid task envelope: {}", e),
                                },
                            };
                            stats.count(&reply);
                            write_reply(&mut output, &reply).await?;
                            continue;
                        }
                    };
                    if task.task_id.is_none() {
                        task.task_id = Some(uuid::Uuid::new_v4().to_string());
                    }

                    let Some(section) = signals.try_enter() else {
                        warn!("Shutdown pending, refusing task {:?}", task.task_id);
                        let reply = Reply {
                            task_id: task.task_id,
                            task_name: Some(task.task_name),
                            body: ReplyBody::Error {
                                error: "worker is shutting down; task not accepted".to_string(),
                            },
                        };
                        stats.count(&reply);
                        write_reply(&mut output, &reply).await?;
                        break;
                    };

                    let permit = Arc::clone(&semaphore).acquire_owned().await?;
                    let dispatcher = Arc::clone(&self.dispatcher);
                    debug!("Accepted task {:?} ({})", task.task_id, task.task_name);
                    in_flight.spawn(async move {
                        let _permit = permit;
                        (run_task(&dispatcher, task).await, section)
                    });
                }
                Some(joined) = in_flight.join_next(), if !in_flight.is_empty() => {
                    finish(joined, &mut stats, &mut output).await?;
                }
            }
        }

        debug!("Input done, draining {} in-flight task(s)", in_flight.len());
        while let Some(joined) = in_flight.join_next().await {
            finish(joined, &mut stats, &mut output).await?;
        }

        info!(
            "Worker finished: {} succeeded, {} failed, {} rejected",
            stats.succeeded, stats.failed, stats.rejected
        );
        Ok(stats)
    }
}

async fn run_task(dispatcher: &Dispatcher, task: Task) -> Reply {
    let body = match dispatcher.dispatch(&task).await {
        Ok(result) => ReplyBody::Result(result),
        Err(e) => ReplyBody::Error {
            error: e.to_string(),
        },
    };
    Reply {
        task_id: task.task_id,
        task_name: Some(task.task_name),
        body,
    }
}

/// Write a finished task's reply, then release its guarded section
async fn finish<W: AsyncWrite + Unpin>(
    joined: Result<(Reply, GuardedSection), JoinError>,
    stats: &mut WorkerStats,
    output: &mut W,
) -> anyhow::Result<()> {
    match joined {
        Ok((reply, section)) => {
            stats.count(&reply);
            let written = write_reply(output, &reply).await;
            drop(section);
            written
        }
        Err(e) => {
            // The dispatcher catches plugin panics; this is a runtime failure.
            error!("Task join error: {}", e);
            Ok(())
        }
    }
}

async fn write_reply<W: AsyncWrite + Unpin>(
    output: &mut W,
    reply: &Reply,
) -> anyhow::Result<()> {
    let mut line = serde_json::to_vec(reply)?;
    line.push(b'\n');
    output.write_all(&line).await?;
    output.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::automators::{AutomatorInput, AutomatorPlugin};
    use crate::error::Result;
    use crate::models::Outcome;
    use crate::providers::{DeleteRequest, ProviderPlugin};
    use async_trait::async_trait;
    use serde_json::Value;
    use std::pin::Pin;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::task::{Context, Poll};

    #[derive(Default)]
    struct SlowProvider {
        running: AtomicUsize,
        peak: AtomicUsize,
    }

    #[async_trait]
    impl ProviderPlugin for SlowProvider {
        fn name(&self) -> &str {
            "slow"
        }

        async fn delete(&self, _request: &DeleteRequest) -> Result<Outcome> {
            let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            self.running.fetch_sub(1, Ordering::SeqCst);
            Ok(Outcome::default())
        }
    }

    struct NoAutomator;

    #[async_trait]
    impl AutomatorPlugin for NoAutomator {
        fn name(&self) -> &str {
            "none"
        }

        async fn start(&self, _input: &AutomatorInput) -> Result<Outcome> {
            Ok(Outcome::with_output("started\n".to_string(), String::new()))
        }
    }

    fn worker(provider: Arc<SlowProvider>, concurrency: usize) -> Worker {
        let signals = Arc::new(SignalCoordinator::new(|_| {}));
        let dispatcher = Dispatcher::new(provider, Arc::new(NoAutomator), signals);
        Worker::new(Arc::new(dispatcher), concurrency)
    }

    fn replies(output: &[u8]) -> Vec<Value> {
        String::from_utf8_lossy(output)
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect()
    }

    #[tokio::test]
    async fn test_one_reply_per_task() {
        let input = concat!(
            r#"{"taskId":"1","taskName":"start","config":{}}"#,
            "\n\n",
            r#"{"taskId":"2","taskName":"reboot","config":{}}"#,
            "\n",
            r#"{"taskId":"3","taskName":"install","config":{}}"#,
            "\n",
            "not json\n",
        );
        let mut output = Vec::new();

        let stats = worker(Arc::default(), 2)
            .run(input.as_bytes(), &mut output)
            .await
            .unwrap();

        assert_eq!(
            stats,
            WorkerStats {
                succeeded: 1,
                failed: 1,
                rejected: 2
            }
        );

        let replies = replies(&output);
        assert_eq!(replies.len(), 4);
        let by_id = |id: &str| {
            replies
                .iter()
                .find(|r| r["taskId"] == id)
                .cloned()
                .unwrap()
        };
        assert_eq!(by_id("1")["status"], 0);
        assert_eq!(by_id("1")["stdout"], "started\n");
        assert_eq!(by_id("2")["error"], "unhandled task type: reboot");
        assert!(by_id("2").get("status").is_none());
        assert_eq!(by_id("3")["status"], 1);
        assert!(replies
            .iter()
            .any(|r| r["error"].as_str().unwrap_or("").starts_with("invalid task envelope")));
    }

    #[tokio::test]
    async fn test_concurrency_is_bounded() {
        let input: String = (0..6)
            .map(|i| format!(r#"{{"taskId":"{}","taskName":"delete","config":{{}}}}"#, i) + "\n")
            .collect();
        let provider = Arc::new(SlowProvider::default());
        let mut output = Vec::new();

        let stats = worker(provider.clone(), 2)
            .run(input.as_bytes(), &mut output)
            .await
            .unwrap();

        assert_eq!(stats.succeeded, 6);
        assert!(provider.peak.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn test_missing_task_id_is_assigned() {
        let mut output = Vec::new();
        worker(Arc::default(), 1)
            .run(
                r#"{"taskName":"start","config":{}}"#.as_bytes(),
                &mut output,
            )
            .await
            .unwrap();

        let replies = replies(&output);
        let id = replies[0]["taskId"].as_str().unwrap();
        assert!(uuid::Uuid::parse_str(id).is_ok());
    }

    /// Output sink readable while the worker still owns it
    #[derive(Clone, Default)]
    struct SharedOutput(Arc<Mutex<Vec<u8>>>);

    impl SharedOutput {
        fn lines(&self) -> usize {
            self.0.lock().unwrap().iter().filter(|b| **b == b'\n').count()
        }
    }

    impl AsyncWrite for SharedOutput {
        fn poll_write(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            buf: &[u8],
        ) -> Poll<std::io::Result<usize>> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Poll::Ready(Ok(buf.len()))
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
            Poll::Ready(Ok(()))
        }

        fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    #[tokio::test]
    async fn test_shutdown_waits_for_reply_and_refuses_new_tasks() {
        let output = SharedOutput::default();
        // Reply lines already written each time the handler runs
        let handled_at = Arc::new(Mutex::new(Vec::new()));

        let sink = output.clone();
        let record = Arc::clone(&handled_at);
        let signals = Arc::new(SignalCoordinator::new(move |_| {
            record.lock().unwrap().push(sink.lines());
        }));
        let dispatcher = Dispatcher::new(
            Arc::new(SlowProvider::default()),
            Arc::new(NoAutomator),
            Arc::clone(&signals),
        );
        let worker = Worker::new(Arc::new(dispatcher), 4);

        let (mut input, reader) = tokio::io::duplex(4096);
        let run = tokio::spawn({
            let output = output.clone();
            async move {
                worker
                    .run(tokio::io::BufReader::new(reader), output)
                    .await
                    .unwrap()
            }
        });

        input
            .write_all(b"{\"taskId\":\"1\",\"taskName\":\"delete\",\"config\":{}}\n")
            .await
            .unwrap();
        while signals.is_armed() {
            tokio::task::yield_now().await;
        }
        signals.notify(libc::SIGTERM);
        assert!(handled_at.lock().unwrap().is_empty());

        input
            .write_all(b"{\"taskId\":\"2\",\"taskName\":\"delete\",\"config\":{}}\n")
            .await
            .unwrap();

        let stats = run.await.unwrap();
        assert_eq!(stats.succeeded, 1);
        assert_eq!(stats.rejected, 1);

        // The deferred signal ran once, after both replies were out
        assert_eq!(*handled_at.lock().unwrap(), vec![2]);

        let replies = replies(&output.0.lock().unwrap());
        let refused = replies.iter().find(|r| r["taskId"] == "2").unwrap();
        assert_eq!(refused["error"], "worker is shutting down; task not accepted");
        let done = replies.iter().find(|r| r["taskId"] == "1").unwrap();
        assert_eq!(done["status"], 0);
    }
}
