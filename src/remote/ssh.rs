//! SSH sessions on top of libssh2
//!
//! [`Ssh2Connector`] establishes TCP, performs the SSH handshake and
//! authenticates with the task's credentials:
//! - identity file (public key) first, when given
//! - password, when given and the key did not authenticate
//! - the local SSH agent when neither is given
//!
//! Every blocking libssh2 call is bounded by the session timeout, so a dead
//! peer surfaces as an error instead of hanging the worker.

use crate::error::{ProvisionerError, Result};
use crate::remote::{CommandChannel, RemoteSession, SessionConnector, SshTarget};
use ssh2::{Channel, Session};
use std::io::{self, Read};
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Production [`SessionConnector`] backed by `ssh2`
#[derive(Debug, Clone)]
pub struct Ssh2Connector {
    connect_timeout: Duration,
    session_timeout: Duration,
}

impl Ssh2Connector {
    pub fn new(connect_timeout: Duration, session_timeout: Duration) -> Self {
        Self {
            connect_timeout,
            session_timeout,
        }
    }

    fn resolve(host: &str, port: u16) -> Result<SocketAddr> {
        (host, port)
            .to_socket_addrs()
            .map_err(|e| ProvisionerError::Ssh {
                host: host.to_string(),
                message: format!("Invalid host address: {}", e),
            })?
            .next()
            .ok_or_else(|| ProvisionerError::Ssh {
                host: host.to_string(),
                message: "Host resolved to no addresses".to_string(),
            })
    }

    fn authenticate(session: &Session, target: &SshTarget) -> Result<()> {
        let auth_error = |message: String| ProvisionerError::AuthenticationFailure {
            user: target.user.clone(),
            host: target.host.clone(),
            message,
        };
        let creds = &target.credentials;

        if creds.is_agent() {
            debug!("Authenticating {} via SSH agent", target.user);
            session
                .userauth_agent(&target.user)
                .map_err(|e| auth_error(format!("Agent auth: {}", e)))?;
        } else {
            let mut last_error = None;

            if let Some(key_path) = &creds.identity_file {
                debug!("Authenticating with key: {}", key_path.display());
                if let Err(e) = session.userauth_pubkey_file(&target.user, None, key_path, None) {
                    last_error = Some(format!("Pubkey auth: {}", e));
                }
            }

            if !session.authenticated() {
                if let Some(password) = &creds.password {
                    debug!("Authenticating {} with password", target.user);
                    if let Err(e) = session.userauth_password(&target.user, password) {
                        last_error = Some(format!("Password auth: {}", e));
                    }
                }
            }

            if let Some(message) = last_error.filter(|_| !session.authenticated()) {
                return Err(auth_error(message));
            }
        }

        if !session.authenticated() {
            return Err(auth_error("Authentication failed".to_string()));
        }

        Ok(())
    }
}

impl Default for Ssh2Connector {
    fn default() -> Self {
        Self::new(Duration::from_secs(10), Duration::from_secs(300))
    }
}

impl SessionConnector for Ssh2Connector {
    fn probe(&self, host: &str, port: u16, timeout: Duration) -> Result<()> {
        let addr = Self::resolve(host, port)?;
        let mut tcp = TcpStream::connect_timeout(&addr, timeout)?;
        tcp.set_read_timeout(Some(timeout))?;

        // sshd greets with "SSH-<proto>-<software>"
        let mut banner = [0u8; 4];
        tcp.read_exact(&mut banner)?;
        if &banner != b"SSH-" {
            return Err(ProvisionerError::Ssh {
                host: host.to_string(),
                message: format!(
                    "Unexpected banner on port {}: {:?}",
                    port,
                    String::from_utf8_lossy(&banner)
                ),
            });
        }
        Ok(())
    }

    fn connect(&self, target: &SshTarget) -> Result<Box<dyn RemoteSession>> {
        debug!("Creating SSH session to {}", target.address());

        let addr = Self::resolve(&target.host, target.port)?;
        let tcp = TcpStream::connect_timeout(&addr, self.connect_timeout).map_err(|e| {
            ProvisionerError::Ssh {
                host: target.host.clone(),
                message: format!("Failed to connect: {}", e),
            }
        })?;
        tcp.set_read_timeout(Some(self.session_timeout))?;
        tcp.set_write_timeout(Some(self.session_timeout))?;

        let mut session = Session::new().map_err(|e| ProvisionerError::Ssh {
            host: target.host.clone(),
            message: format!("Failed to create SSH session: {}", e),
        })?;
        session.set_tcp_stream(tcp);
        session.set_timeout(self.session_timeout.as_millis().min(u32::MAX as u128) as u32);
        session.handshake().map_err(|e| ProvisionerError::Ssh {
            host: target.host.clone(),
            message: format!("SSH handshake failed: {}", e),
        })?;

        Self::authenticate(&session, target)?;

        info!("SSH session established to {}@{}", target.user, target.address());

        Ok(Box::new(Ssh2Session {
            host: target.host.clone(),
            session,
            timeout: self.session_timeout,
        }))
    }
}

/// Authenticated libssh2 session
pub struct Ssh2Session {
    host: String,
    session: Session,
    timeout: Duration,
}

impl RemoteSession for Ssh2Session {
    fn host(&self) -> &str {
        &self.host
    }

    fn open_channel(&mut self) -> Result<Box<dyn CommandChannel + '_>> {
        let channel = self
            .session
            .channel_session()
            .map_err(|e| ssh_error(&self.host, "Failed to open channel", e))?;
        Ok(Box::new(Ssh2Channel {
            host: self.host.clone(),
            session: self.session.clone(),
            channel,
            timeout: self.timeout,
            read_deadline: None,
        }))
    }
}

/// Output is read with the session in non-blocking mode so that stdout and
/// stderr can be serviced in turn; the session timeout then bounds the
/// whole read phase instead of each call.
struct Ssh2Channel {
    host: String,
    session: Session,
    channel: Channel,
    timeout: Duration,
    read_deadline: Option<Instant>,
}

impl Ssh2Channel {
    fn read_with<F>(&mut self, read: F) -> io::Result<usize>
    where
        F: FnOnce(&mut Channel) -> io::Result<usize>,
    {
        match read(&mut self.channel) {
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                if self.read_deadline.is_some_and(|d| Instant::now() >= d) {
                    Err(io::Error::new(
                        io::ErrorKind::TimedOut,
                        format!("no output for {:?}", self.timeout),
                    ))
                } else {
                    Err(e)
                }
            }
            Ok(n) => {
                self.read_deadline = Some(Instant::now() + self.timeout);
                Ok(n)
            }
            other => other,
        }
    }
}

impl Drop for Ssh2Channel {
    fn drop(&mut self) {
        self.session.set_blocking(true);
    }
}

/// libssh2 reports 0 when no exit-status message arrived; only trust a 0
/// from a channel that reached a regular end of stream.
fn reported_status(code: i32, eof: bool) -> Option<i32> {
    if code == 0 && !eof {
        None
    } else {
        Some(code)
    }
}

impl CommandChannel for Ssh2Channel {
    fn request_pty(&mut self) -> Result<()> {
        self.channel
            .request_pty("xterm", None, None)
            .map_err(|e| ssh_error(&self.host, "PTY request rejected", e))
    }

    fn exec(&mut self, command: &str) -> Result<()> {
        self.channel
            .exec(command)
            .map_err(|e| ssh_error(&self.host, "Failed to execute command", e))?;
        self.session.set_blocking(false);
        self.read_deadline = Some(Instant::now() + self.timeout);
        Ok(())
    }

    fn read_stdout(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.read_with(|channel| channel.read(buf))
    }

    fn read_stderr(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.read_with(|channel| channel.stderr().read(buf))
    }

    fn wait_close(&mut self) -> Result<()> {
        self.session.set_blocking(true);
        self.channel
            .wait_close()
            .map_err(|e| ssh_error(&self.host, "Failed to close channel", e))
    }

    fn exit_status(&self) -> Result<Option<i32>> {
        self.channel
            .exit_status()
            .map(|code| reported_status(code, self.channel.eof()))
            .map_err(|e| ssh_error(&self.host, "Failed to get exit status", e))
    }

    fn exit_signal(&self) -> Result<Option<String>> {
        self.channel
            .exit_signal()
            .map(|signal| signal.exit_signal)
            .map_err(|e| ssh_error(&self.host, "Failed to get exit signal", e))
    }
}

fn ssh_error(host: &str, context: &str, err: ssh2::Error) -> ProvisionerError {
    ProvisionerError::Ssh {
        host: host.to_string(),
        message: format!("{}: {}", context, err),
    }
}
