//! Remote shell sessions
//!
//! The execution engine in [`exec`] only needs an authenticated session that
//! can open command channels. That seam is expressed by [`RemoteSession`] and
//! [`CommandChannel`]; [`ssh`] provides the production implementation on top
//! of libssh2 and [`access`] composes connection management for plugins.

pub mod access;
pub mod exec;
pub mod ssh;

use crate::error::Result;
use crate::models::{SshAuth, DEFAULT_SSH_PORT, DEFAULT_SSH_USER};
use std::fmt;
use std::io;
use std::path::PathBuf;
use std::time::Duration;

/// An authenticated remote shell session
pub trait RemoteSession: Send {
    /// Host this session is connected to (used in error messages)
    fn host(&self) -> &str;

    /// Open one logical channel for a single command
    fn open_channel(&mut self) -> Result<Box<dyn CommandChannel + '_>>;
}

/// One command channel on a [`RemoteSession`]
pub trait CommandChannel {
    /// Ask the remote end for a pseudo-terminal
    fn request_pty(&mut self) -> Result<()>;

    /// Start the command
    fn exec(&mut self, command: &str) -> Result<()>;

    /// Read the next chunk of standard output; `Ok(0)` at end of stream.
    ///
    /// May fail with `WouldBlock` when no data is ready yet, so that the
    /// caller can service the other stream meanwhile.
    fn read_stdout(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    /// Read the next chunk of standard error; same contract as `read_stdout`
    fn read_stderr(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    /// Block until the remote side closes the channel
    fn wait_close(&mut self) -> Result<()>;

    /// Exit status reported by the remote process; `None` if it sent none
    fn exit_status(&self) -> Result<Option<i32>>;

    /// Signal name if the remote process was killed by a signal
    fn exit_signal(&self) -> Result<Option<String>>;
}

/// Opens authenticated sessions and probes sshd reachability.
///
/// Both calls block; async callers run them on the blocking pool.
pub trait SessionConnector: Send + Sync {
    /// Wait up to `timeout` for a single TCP connect + SSH banner on `host:port`
    fn probe(&self, host: &str, port: u16, timeout: Duration) -> Result<()>;

    /// Connect and authenticate
    fn connect(&self, target: &SshTarget) -> Result<Box<dyn RemoteSession>>;
}

/// Credentials for a remote shell login
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Credentials {
    pub password: Option<String>,
    pub identity_file: Option<PathBuf>,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("identity_file", &self.identity_file)
            .finish()
    }
}

impl Credentials {
    /// Neither a key nor a password: fall back to the SSH agent
    pub fn is_agent(&self) -> bool {
        self.password.is_none() && self.identity_file.is_none()
    }
}

/// Endpoint and login for one remote shell connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SshTarget {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub credentials: Credentials,
}

impl SshTarget {
    /// Bind task-supplied `ssh-auth` to a host
    pub fn from_auth(host: impl Into<String>, port: u16, auth: &SshAuth) -> Self {
        Self {
            host: host.into(),
            port,
            user: auth
                .user
                .clone()
                .unwrap_or_else(|| DEFAULT_SSH_USER.to_string()),
            credentials: Credentials {
                password: auth.password.clone(),
                identity_file: auth.identityfile.as_ref().map(PathBuf::from),
            },
        }
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl Default for SshTarget {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: DEFAULT_SSH_PORT,
            user: DEFAULT_SSH_USER.to_string(),
            credentials: Credentials::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_target_from_auth_defaults_user() {
        let target = SshTarget::from_auth("10.0.0.5", 22, &SshAuth::default());
        assert_eq!(target.user, "root");
        assert!(target.credentials.is_agent());
        assert_eq!(target.address(), "10.0.0.5:22");
    }

    #[test]
    fn test_target_from_auth_binds_credentials() {
        let auth = SshAuth {
            user: Some("centos".to_string()),
            password: Some("s3cret".to_string()),
            identityfile: Some("/keys/id_rsa".to_string()),
        };
        let target = SshTarget::from_auth("node1", 2222, &auth);
        assert_eq!(target.user, "centos");
        assert_eq!(target.port, 2222);
        assert_eq!(target.credentials.password.as_deref(), Some("s3cret"));
        assert_eq!(
            target.credentials.identity_file,
            Some(PathBuf::from("/keys/id_rsa"))
        );
    }

    #[test]
    fn test_credentials_debug_redacts_password() {
        let creds = Credentials {
            password: Some("s3cret".to_string()),
            identity_file: None,
        };
        let printed = format!("{:?}", creds);
        assert!(!printed.contains("s3cret"));
        assert!(printed.contains("redacted"));
    }
}
