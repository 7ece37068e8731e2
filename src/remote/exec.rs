//! Remote command execution engine
//!
//! Runs exactly one command per channel on an already-authenticated
//! [`RemoteSession`], accumulates stdout and stderr into separate buffers and
//! captures the exit status (or exit signal). The call blocks until the
//! channel closes. Anything but a clean `exit 0` is turned into a
//! [`CommandExecutionError`] that carries the full output for diagnostics.

use crate::error::{ProvisionerError, Result};
use crate::models::MAX_OUTPUT_SIZE;
use crate::remote::{CommandChannel, RemoteSession};
use serde::Serialize;
use std::fmt;
use std::io;
use std::time::Duration;
use tracing::{debug, warn};

const READ_CHUNK: usize = 8192;

/// Pause between read rounds when neither stream has data ready
const IDLE_WAIT: Duration = Duration::from_millis(10);

/// Terminal outcome of a command that exited with status 0
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CommandOutput {
    pub command: String,
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i32>,
    pub exit_signal: Option<String>,
}

/// A command that ran but did not exit cleanly
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CommandExecutionError {
    /// Human-readable description of what the command was for
    pub message: Option<String>,
    pub command: String,
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i32>,
    pub exit_signal: Option<String>,
}

impl CommandExecutionError {
    fn from_output(output: CommandOutput, message: Option<String>) -> Self {
        Self {
            message,
            command: output.command,
            stdout: output.stdout,
            stderr: output.stderr,
            exit_code: output.exit_code,
            exit_signal: output.exit_signal,
        }
    }

    /// JSON form handed back to the task queue
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "message": self.to_string(),
            "command": self.command,
            "stdout": self.stdout,
            "stderr": self.stderr,
            "exit_code": self.exit_code,
            "exit_signal": self.exit_signal,
        })
    }
}

impl fmt::Display for CommandExecutionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(message) = &self.message {
            write!(f, "{}: ", message)?;
        }
        write!(f, "command '{}' ", self.command)?;
        match (&self.exit_signal, self.exit_code) {
            (Some(signal), _) => write!(f, "terminated by signal {}", signal)?,
            (None, Some(code)) => write!(f, "exited with status {}", code)?,
            (None, None) => write!(f, "exited without reporting a status")?,
        }
        let stderr = self.stderr.trim();
        if !stderr.is_empty() {
            write!(f, ": {}", stderr)?;
        }
        Ok(())
    }
}

impl std::error::Error for CommandExecutionError {}

/// A command to run on a remote session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteCommand {
    command: String,
    message: Option<String>,
    pty: bool,
}

impl RemoteCommand {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            message: None,
            pty: false,
        }
    }

    /// Describe what the command is for; logged and attached to failures
    pub fn message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    /// Request a pseudo-terminal before running
    pub fn pty(mut self, pty: bool) -> Self {
        self.pty = pty;
        self
    }

    pub fn command(&self) -> &str {
        &self.command
    }

    /// Run the command and wait for the channel to close.
    ///
    /// # Errors
    ///
    /// * `ProvisionerError::Ssh` - channel could not be opened, PTY was
    ///   rejected, or the stream broke
    /// * `ProvisionerError::CommandExecution` - non-zero exit or exit via signal
    pub fn run(&self, session: &mut dyn RemoteSession) -> Result<CommandOutput> {
        let host = session.host().to_string();
        if let Some(message) = self.message.as_deref().filter(|m| *m != self.command) {
            debug!("{}", message);
        }
        debug!(host = %host, "ssh-exec command: {}", self.command);

        let mut channel = session.open_channel()?;

        if self.pty {
            channel.request_pty().map_err(|e| ProvisionerError::Ssh {
                host: host.clone(),
                message: format!("no pty: {}", e),
            })?;
        }

        channel.exec(&self.command)?;

        let (stdout, stderr) = drain_both(channel.as_mut()).map_err(|e| ProvisionerError::Ssh {
            host: host.clone(),
            message: format!("Failed to read command output: {}", e),
        })?;

        channel.wait_close()?;

        let exit_signal = channel.exit_signal()?;
        let exit_code = match exit_signal {
            Some(_) => None,
            None => channel.exit_status()?,
        };

        debug!("stderr: {}", stderr);
        debug!("stdout: {}", stdout);

        let output = CommandOutput {
            command: self.command.clone(),
            stdout,
            stderr,
            exit_code,
            exit_signal,
        };

        if output.exit_code == Some(0) {
            Ok(output)
        } else {
            Err(CommandExecutionError::from_output(output, self.message.clone()).into())
        }
    }
}

/// Run `command` on `session`, optionally under a pseudo-terminal.
pub fn exec(
    session: &mut dyn RemoteSession,
    command: &str,
    want_pty: bool,
) -> Result<CommandOutput> {
    RemoteCommand::new(command).pty(want_pty).run(session)
}

/// One output stream, capped at MAX_OUTPUT_SIZE bytes
#[derive(Debug, Default)]
struct StreamBuffer {
    collected: Vec<u8>,
    truncated: bool,
    done: bool,
}

impl StreamBuffer {
    /// Take one chunk from `read`; returns whether anything happened
    fn pull<F>(&mut self, buf: &mut [u8], read: F) -> io::Result<bool>
    where
        F: FnOnce(&mut [u8]) -> io::Result<usize>,
    {
        if self.done {
            return Ok(false);
        }
        match read(buf) {
            Ok(0) => {
                self.done = true;
                Ok(true)
            }
            Ok(n) => {
                let room = MAX_OUTPUT_SIZE.saturating_sub(self.collected.len());
                if n > room {
                    self.truncated = true;
                }
                self.collected.extend_from_slice(&buf[..n.min(room)]);
                Ok(true)
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(false),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => Ok(true),
            Err(e) => Err(e),
        }
    }

    fn into_string(self) -> String {
        if self.truncated {
            warn!("Output truncated to {} bytes", MAX_OUTPUT_SIZE);
        }
        String::from_utf8_lossy(&self.collected).into_owned()
    }
}

/// Drain stdout and stderr in alternation until both reach end of stream.
///
/// Both streams share the channel window, so neither may be left unread
/// while waiting on the other. `WouldBlock` from a stream means no data yet.
fn drain_both(channel: &mut dyn CommandChannel) -> io::Result<(String, String)> {
    let mut stdout = StreamBuffer::default();
    let mut stderr = StreamBuffer::default();
    let mut buf = [0u8; READ_CHUNK];

    while !(stdout.done && stderr.done) {
        let mut progressed = stdout.pull(&mut buf, |b| channel.read_stdout(b))?;
        progressed |= stderr.pull(&mut buf, |b| channel.read_stderr(b))?;
        if !progressed {
            std::thread::sleep(IDLE_WAIT);
        }
    }

    Ok((stdout.into_string(), stderr.into_string()))
}
