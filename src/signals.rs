//! Deferred shutdown signals around critical sections
//!
//! The coordinator is either *armed* (signals go straight to the handler) or
//! *guarded* (signals are queued). Guarded sections nest: concurrent tasks
//! each hold a [`GuardedSection`] and the coordinator only re-arms when the
//! last one is dropped. Re-arming replays every queued signal, in arrival
//! order, through the handler before control returns to the caller.
//!
//! ```
//! use provisioner::signals::SignalCoordinator;
//! use std::sync::{Arc, Mutex};
//!
//! let seen = Arc::new(Mutex::new(Vec::new()));
//! let recorder = Arc::clone(&seen);
//! let coordinator = Arc::new(SignalCoordinator::new(move |sig| {
//!     recorder.lock().unwrap().push(sig)
//! }));
//!
//! let section = coordinator.enter();
//! coordinator.notify(libc::SIGTERM);
//! assert!(seen.lock().unwrap().is_empty());
//!
//! drop(section);
//! assert_eq!(*seen.lock().unwrap(), vec![libc::SIGTERM]);
//! ```

use crate::error::{ProvisionerError, Result};
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::signal::unix::{signal, SignalKind};
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// Callback that acts on a delivered signal
pub type SignalHandler = Arc<dyn Fn(i32) + Send + Sync>;

#[derive(Debug, Default)]
struct SignalState {
    depth: usize,
    queued: Vec<i32>,
}

pub struct SignalCoordinator {
    state: Mutex<SignalState>,
    handler: SignalHandler,
}

impl SignalCoordinator {
    pub fn new(handler: impl Fn(i32) + Send + Sync + 'static) -> Self {
        Self {
            state: Mutex::new(SignalState::default()),
            handler: Arc::new(handler),
        }
    }

    /// Coordinator whose handler logs and exits the process with status 0
    pub fn with_default_shutdown() -> Self {
        Self::new(|signum| {
            info!("Received {}", signal_name(signum));
            info!("Gracefully shutting down provisioner worker...");
            std::process::exit(0);
        })
    }

    fn lock(&self) -> MutexGuard<'_, SignalState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_armed(&self) -> bool {
        self.lock().depth == 0
    }

    /// Signals waiting for the guarded section to end
    pub fn queued(&self) -> Vec<i32> {
        self.lock().queued.clone()
    }

    /// Deliver a signal: queue it while guarded, otherwise act on it now.
    pub fn notify(&self, signum: i32) {
        let mut state = self.lock();
        if state.depth > 0 {
            info!(
                "Deferring {} until the running operation completes",
                signal_name(signum)
            );
            state.queued.push(signum);
            return;
        }
        drop(state);
        (self.handler)(signum);
    }

    /// True while a signal waits for the running sections to finish
    pub fn shutdown_pending(&self) -> bool {
        !self.lock().queued.is_empty()
    }

    /// Enter a guarded section; it ends when the returned guard is dropped.
    pub fn enter(self: &Arc<Self>) -> GuardedSection {
        let mut state = self.lock();
        self.enter_locked(&mut state)
    }

    /// Enter a guarded section for newly admitted work.
    ///
    /// Returns `None` once a signal is queued: work that arrives after a
    /// shutdown request must not keep the coordinator guarded.
    pub fn try_enter(self: &Arc<Self>) -> Option<GuardedSection> {
        let mut state = self.lock();
        if !state.queued.is_empty() {
            return None;
        }
        Some(self.enter_locked(&mut state))
    }

    fn enter_locked(self: &Arc<Self>, state: &mut SignalState) -> GuardedSection {
        if state.depth == 0 {
            state.queued.clear();
        }
        state.depth += 1;
        debug!("Entered guarded section (depth {})", state.depth);
        GuardedSection {
            coordinator: Arc::clone(self),
        }
    }

    fn leave(&self) {
        let replay = {
            let mut state = self.lock();
            state.depth = state.depth.saturating_sub(1);
            debug!("Left guarded section (depth {})", state.depth);
            if state.depth == 0 {
                std::mem::take(&mut state.queued)
            } else {
                Vec::new()
            }
        };

        for signum in replay {
            info!("Replaying deferred {}", signal_name(signum));
            (self.handler)(signum);
        }
    }

    /// Run `fut` inside a guarded section
    pub async fn guard<F: Future>(self: &Arc<Self>, fut: F) -> F::Output {
        let _section = self.enter();
        fut.await
    }

    /// Route process deliveries of `signum` into [`notify`](Self::notify).
    ///
    /// The OS handler is installed before this returns, so the runtime
    /// default action no longer applies to `signum`.
    pub fn listen(self: &Arc<Self>, signum: i32) -> Result<JoinHandle<()>> {
        let mut stream = signal(SignalKind::from_raw(signum)).map_err(|e| {
            ProvisionerError::Other(format!(
                "Failed to setup {} handler: {}",
                signal_name(signum),
                e
            ))
        })?;
        let coordinator = Arc::clone(self);

        Ok(tokio::spawn(async move {
            while stream.recv().await.is_some() {
                coordinator.notify(signum);
            }
        }))
    }
}

/// RAII guard for one guarded section
#[must_use = "the section ends as soon as the guard is dropped"]
pub struct GuardedSection {
    coordinator: Arc<SignalCoordinator>,
}

impl Drop for GuardedSection {
    fn drop(&mut self) {
        self.coordinator.leave();
    }
}

/// Map a signal name (`TERM`, `SIGTERM`, `term`, ...) to its number
pub fn parse_signal(name: &str) -> Result<i32> {
    let upper = name.trim().to_uppercase();
    let bare = upper.strip_prefix("SIG").unwrap_or(&upper);
    match bare {
        "TERM" => Ok(libc::SIGTERM),
        "INT" => Ok(libc::SIGINT),
        "HUP" => Ok(libc::SIGHUP),
        "QUIT" => Ok(libc::SIGQUIT),
        "USR1" => Ok(libc::SIGUSR1),
        "USR2" => Ok(libc::SIGUSR2),
        _ => Err(ProvisionerError::Config(format!(
            "Unsupported shutdown signal: {}",
            name
        ))),
    }
}

pub fn signal_name(signum: i32) -> String {
    match signum {
        libc::SIGTERM => "SIGTERM".to_string(),
        libc::SIGINT => "SIGINT".to_string(),
        libc::SIGHUP => "SIGHUP".to_string(),
        libc::SIGQUIT => "SIGQUIT".to_string(),
        libc::SIGUSR1 => "SIGUSR1".to_string(),
        libc::SIGUSR2 => "SIGUSR2".to_string(),
        other => format!("signal {}", other),
    }
}
