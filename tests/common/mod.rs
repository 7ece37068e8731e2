//! Shared stubs for integration tests: an in-memory compute API and a
//! scriptable remote shell.

#![allow(dead_code)]

use async_trait::async_trait;
use provisioner::error::{ProvisionerError, Result};
use provisioner::models::Fields;
use provisioner::providers::{
    ComputeApi, ComputeConnector, CreatedNode, NodeAddress, NodeInfo, NodeSpec, NodeState,
};
use provisioner::remote::access::ShellAccess;
use provisioner::remote::{CommandChannel, RemoteSession, SessionConnector, SshTarget};
use provisioner::retry::RetryConfig;
use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub const NODE_ADDRESS: &str = "10.0.0.5";

#[derive(Debug, Clone)]
struct StubNode {
    name: String,
    /// Polls answered with BUILD before the node turns ACTIVE
    builds_left: u32,
    failed: bool,
}

/// Compute API keeping nodes in memory.
///
/// Every node reports `BUILD` for its first two lookups, then `ACTIVE` with
/// [`NODE_ADDRESS`] on the `public` network.
#[derive(Default)]
pub struct StubCompute {
    nodes: Mutex<HashMap<String, StubNode>>,
    next_id: AtomicU32,
    pub destroyed: Mutex<Vec<String>>,
    pub created: Mutex<Vec<NodeSpec>>,
}

impl StubCompute {
    /// Register an existing node
    pub fn insert(&self, id: &str, name: &str) {
        self.nodes.lock().unwrap().insert(
            id.to_string(),
            StubNode {
                name: name.to_string(),
                builds_left: 2,
                failed: false,
            },
        );
    }

    /// Register a node stuck in the ERROR state
    pub fn insert_failed(&self, id: &str, name: &str) {
        self.nodes.lock().unwrap().insert(
            id.to_string(),
            StubNode {
                name: name.to_string(),
                builds_left: 0,
                failed: true,
            },
        );
    }
}

#[async_trait]
impl ComputeApi for StubCompute {
    async fn create_node(&self, spec: &NodeSpec) -> Result<CreatedNode> {
        let id = format!("node-{}", self.next_id.fetch_add(1, Ordering::SeqCst) + 1);
        self.insert(&id, &spec.name);
        self.created.lock().unwrap().push(spec.clone());
        Ok(CreatedNode {
            id,
            admin_password: None,
        })
    }

    async fn get_node(&self, id: &str) -> Result<Option<NodeInfo>> {
        let mut nodes = self.nodes.lock().unwrap();
        let Some(node) = nodes.get_mut(id) else {
            return Ok(None);
        };

        let (state, addresses) = if node.failed {
            (NodeState::Error, HashMap::new())
        } else if node.builds_left > 0 {
            node.builds_left -= 1;
            (NodeState::Building, HashMap::new())
        } else {
            let mut addresses = HashMap::new();
            addresses.insert(
                "public".to_string(),
                vec![NodeAddress {
                    addr: NODE_ADDRESS.to_string(),
                    version: 4,
                }],
            );
            (NodeState::Ready, addresses)
        };

        Ok(Some(NodeInfo {
            id: id.to_string(),
            name: node.name.clone(),
            state,
            addresses,
        }))
    }

    async fn destroy_node(&self, id: &str) -> Result<()> {
        if self.nodes.lock().unwrap().remove(id).is_none() {
            return Err(ProvisionerError::ResourceNotFound(id.to_string()));
        }
        self.destroyed.lock().unwrap().push(id.to_string());
        Ok(())
    }
}

pub struct StubConnector(pub Arc<StubCompute>);

impl ComputeConnector for StubConnector {
    fn name(&self) -> &str {
        "stub"
    }

    fn connect(&self, _fields: &Fields) -> Result<Arc<dyn ComputeApi>> {
        Ok(self.0.clone())
    }
}

/// Remote shell where sshd is always up.
///
/// By default logins succeed and every command exits 0 with no output.
#[derive(Default)]
pub struct StubShell {
    pub executed: Arc<Mutex<Vec<String>>>,
    pub targets: Mutex<Vec<SshTarget>>,
    login_error: Option<String>,
    exit_code: i32,
    stdout: String,
}

impl StubShell {
    /// Shell whose sshd refuses every login with `message`
    pub fn rejecting(message: &str) -> Self {
        Self {
            login_error: Some(message.to_string()),
            ..Self::default()
        }
    }

    /// Shell where every command prints `stdout` and exits with `code`
    pub fn exiting(code: i32, stdout: &str) -> Self {
        Self {
            exit_code: code,
            stdout: stdout.to_string(),
            ..Self::default()
        }
    }
}

struct StubSession {
    executed: Arc<Mutex<Vec<String>>>,
    exit_code: i32,
    stdout: String,
}

struct StubChannel<'a> {
    session: &'a mut StubSession,
    stdout_sent: bool,
}

impl SessionConnector for StubShell {
    fn probe(&self, _host: &str, _port: u16, _timeout: Duration) -> Result<()> {
        Ok(())
    }

    fn connect(&self, target: &SshTarget) -> Result<Box<dyn RemoteSession>> {
        self.targets.lock().unwrap().push(target.clone());
        if let Some(message) = &self.login_error {
            return Err(ProvisionerError::AuthenticationFailure {
                user: target.user.clone(),
                host: target.host.clone(),
                message: message.clone(),
            });
        }
        Ok(Box::new(StubSession {
            executed: Arc::clone(&self.executed),
            exit_code: self.exit_code,
            stdout: self.stdout.clone(),
        }))
    }
}

impl RemoteSession for StubSession {
    fn host(&self) -> &str {
        NODE_ADDRESS
    }

    fn open_channel(&mut self) -> Result<Box<dyn CommandChannel + '_>> {
        Ok(Box::new(StubChannel {
            session: self,
            stdout_sent: false,
        }))
    }
}

impl CommandChannel for StubChannel<'_> {
    fn request_pty(&mut self) -> Result<()> {
        Ok(())
    }

    fn exec(&mut self, command: &str) -> Result<()> {
        self.session
            .executed
            .lock()
            .unwrap()
            .push(command.to_string());
        Ok(())
    }

    fn read_stdout(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.stdout_sent {
            return Ok(0);
        }
        self.stdout_sent = true;
        let bytes = self.session.stdout.as_bytes();
        let n = bytes.len().min(buf.len());
        buf[..n].copy_from_slice(&bytes[..n]);
        Ok(n)
    }

    fn read_stderr(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
        Ok(0)
    }

    fn wait_close(&mut self) -> Result<()> {
        Ok(())
    }

    fn exit_status(&self) -> Result<Option<i32>> {
        Ok(Some(self.session.exit_code))
    }

    fn exit_signal(&self) -> Result<Option<String>> {
        Ok(None)
    }
}

/// Shell access with fast retries over `connector`
pub fn shell_access(connector: Arc<dyn SessionConnector>) -> ShellAccess {
    ShellAccess::new(
        connector,
        RetryConfig::new(2, Duration::from_millis(1), Duration::from_millis(5)),
        Duration::from_millis(50),
    )
}
