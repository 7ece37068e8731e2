//! Shared remote-shell helper owned by plugins
//!
//! Plugins hold a [`ShellAccess`] and call into it; it owns the connector and
//! the sshd wait budget, and moves every blocking libssh2 call onto the
//! blocking thread pool.

use crate::error::{ProvisionerError, Result};
use crate::remote::exec::{CommandOutput, RemoteCommand};
use crate::remote::{SessionConnector, SshTarget};
use crate::retry::{RetryConfig, RetryState};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

#[derive(Clone)]
pub struct ShellAccess {
    connector: Arc<dyn SessionConnector>,
    retry: RetryConfig,
    probe_timeout: Duration,
}

impl ShellAccess {
    pub fn new(
        connector: Arc<dyn SessionConnector>,
        retry: RetryConfig,
        probe_timeout: Duration,
    ) -> Self {
        Self {
            connector,
            retry,
            probe_timeout,
        }
    }

    pub fn retry_config(&self) -> &RetryConfig {
        &self.retry
    }

    /// Wait until `host:port` answers with an SSH banner.
    ///
    /// Probes once, then retries with exponential backoff until the retry
    /// budget is spent.
    pub async fn wait_for_sshd(&self, host: &str, port: u16) -> Result<()> {
        let mut state = RetryState::new();
        debug!(
            "Waiting for sshd on {}:{} ({} retries, up to {:?} of backoff)",
            host,
            port,
            self.retry.max_retries,
            self.retry.total_budget()
        );

        loop {
            let connector = Arc::clone(&self.connector);
            let probe_host = host.to_string();
            let timeout = self.probe_timeout;
            let probe = tokio::task::spawn_blocking(move || {
                connector.probe(&probe_host, port, timeout)
            })
            .await
            .map_err(|e| ProvisionerError::Other(format!("Task join error: {}", e)))?;

            match probe {
                Ok(()) => {
                    info!("sshd is up on {}:{} (attempt {})", host, port, state.attempt);
                    return Ok(());
                }
                Err(e) if state.should_retry(&self.retry) => {
                    let delay = state.calculate_delay(&self.retry);
                    debug!(
                        "sshd on {}:{} not ready (attempt {}): {}; retrying in {:?}",
                        host, port, state.attempt, e, delay
                    );
                    tokio::time::sleep(delay).await;
                    state.record_retry();
                }
                Err(e) => {
                    warn!("Giving up on sshd at {}:{}: {}", host, port, e);
                    return Err(ProvisionerError::SshdUnavailable {
                        address: format!("{}:{}", host, port),
                        attempts: state.attempt,
                    });
                }
            }
        }
    }

    /// Connect to `target` and run `commands` in order on one session.
    ///
    /// Stops at the first failing command.
    pub async fn run(
        &self,
        target: SshTarget,
        commands: Vec<RemoteCommand>,
    ) -> Result<Vec<CommandOutput>> {
        let connector = Arc::clone(&self.connector);

        tokio::task::spawn_blocking(move || {
            let mut session = connector.connect(&target)?;
            commands
                .iter()
                .map(|command| command.run(session.as_mut()))
                .collect()
        })
        .await
        .map_err(|e| ProvisionerError::Other(format!("Task join error: {}", e)))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::{CommandChannel, RemoteSession};
    use std::io;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    /// Probe fails until `ready_after` attempts have been made
    struct FlakyConnector {
        ready_after: u32,
        probes: AtomicU32,
        executed: Arc<Mutex<Vec<String>>>,
        exit_codes: Vec<i32>,
    }

    impl FlakyConnector {
        fn new(ready_after: u32) -> Self {
            Self {
                ready_after,
                probes: AtomicU32::new(0),
                executed: Arc::default(),
                exit_codes: Vec::new(),
            }
        }
    }

    struct FakeSession {
        executed: Arc<Mutex<Vec<String>>>,
        exit_codes: Vec<i32>,
    }

    struct FakeChannel<'a> {
        session: &'a mut FakeSession,
        exit_code: i32,
    }

    impl SessionConnector for FlakyConnector {
        fn probe(&self, host: &str, _port: u16, _timeout: Duration) -> Result<()> {
            let n = self.probes.fetch_add(1, Ordering::SeqCst) + 1;
            if n >= self.ready_after {
                Ok(())
            } else {
                Err(ProvisionerError::Ssh {
                    host: host.to_string(),
                    message: "connection refused".to_string(),
                })
            }
        }

        fn connect(&self, _target: &SshTarget) -> Result<Box<dyn RemoteSession>> {
            Ok(Box::new(FakeSession {
                executed: Arc::clone(&self.executed),
                exit_codes: self.exit_codes.clone(),
            }))
        }
    }

    impl RemoteSession for FakeSession {
        fn host(&self) -> &str {
            "10.0.0.5"
        }

        fn open_channel(&mut self) -> Result<Box<dyn CommandChannel + '_>> {
            let exit_code = if self.exit_codes.is_empty() {
                0
            } else {
                self.exit_codes.remove(0)
            };
            Ok(Box::new(FakeChannel {
                session: self,
                exit_code,
            }))
        }
    }

    impl CommandChannel for FakeChannel<'_> {
        fn request_pty(&mut self) -> Result<()> {
            Ok(())
        }

        fn exec(&mut self, command: &str) -> Result<()> {
            self.session.executed.lock().unwrap().push(command.to_string());
            Ok(())
        }

        fn read_stdout(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
            Ok(0)
        }

        fn read_stderr(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
            Ok(0)
        }

        fn wait_close(&mut self) -> Result<()> {
            Ok(())
        }

        fn exit_status(&self) -> Result<Option<i32>> {
            Ok(Some(self.exit_code))
        }

        fn exit_signal(&self) -> Result<Option<String>> {
            Ok(None)
        }
    }

    fn fast_retry(max_retries: u32) -> RetryConfig {
        RetryConfig::new(max_retries, Duration::from_millis(1), Duration::from_millis(5))
    }

    #[tokio::test]
    async fn test_wait_for_sshd_retries_until_ready() {
        let connector = Arc::new(FlakyConnector::new(3));
        let access = ShellAccess::new(connector.clone(), fast_retry(5), Duration::from_millis(10));

        access.wait_for_sshd("10.0.0.5", 22).await.unwrap();
        assert_eq!(connector.probes.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_wait_for_sshd_gives_up_after_budget() {
        let connector = Arc::new(FlakyConnector::new(u32::MAX));
        let access = ShellAccess::new(connector.clone(), fast_retry(2), Duration::from_millis(10));

        let err = access.wait_for_sshd("10.0.0.5", 22).await.unwrap_err();
        match err {
            ProvisionerError::SshdUnavailable { address, attempts } => {
                assert_eq!(address, "10.0.0.5:22");
                assert_eq!(attempts, 3);
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(connector.probes.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_run_executes_commands_in_order() {
        let connector = Arc::new(FlakyConnector::new(0));
        let executed = Arc::clone(&connector.executed);
        let access = ShellAccess::new(connector, fast_retry(0), Duration::from_millis(10));

        let outputs = access
            .run(
                SshTarget::default(),
                vec![RemoteCommand::new("uname -a"), RemoteCommand::new("hostname")],
            )
            .await
            .unwrap();

        assert_eq!(outputs.len(), 2);
        assert_eq!(*executed.lock().unwrap(), vec!["uname -a", "hostname"]);
    }

    #[tokio::test]
    async fn test_run_stops_at_first_failure() {
        let mut connector = FlakyConnector::new(0);
        connector.exit_codes = vec![2, 0];
        let executed = Arc::clone(&connector.executed);
        let access =
            ShellAccess::new(Arc::new(connector), fast_retry(0), Duration::from_millis(10));

        let err = access
            .run(
                SshTarget::default(),
                vec![RemoteCommand::new("false"), RemoteCommand::new("true")],
            )
            .await
            .unwrap_err();

        assert_eq!(err.kind(), "command_execution");
        assert_eq!(*executed.lock().unwrap(), vec!["false"]);
    }
}
