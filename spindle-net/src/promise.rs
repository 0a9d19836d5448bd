//! Two-outcome, resolve-once promise used for reporting connection results.

use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use crate::msg::ConnectionStatusCode;
use crate::util::lock;

/// Terminal outcome of a single connection attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectOutcome {
    Connected,
    Failed {
        code: ConnectionStatusCode,
        message: String,
    },
}

impl ConnectOutcome {
    pub fn is_connected(&self) -> bool {
        *self == ConnectOutcome::Connected
    }
}

impl std::fmt::Display for ConnectOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectOutcome::Connected => write!(f, "connected"),
            ConnectOutcome::Failed { code, message } => write!(f, "failed: {}: {}", code, message),
        }
    }
}

pub type ConnectedCallback = Box<dyn FnOnce() + Send>;
pub type FailedCallback = Box<dyn FnOnce(u8, String) + Send>;

#[derive(Default)]
struct Shared {
    outcome: Mutex<Option<ConnectOutcome>>,
    resolved: Condvar,
}

/// Resolving side of a connection attempt.
///
/// Dropping an unresolved promise resolves it as failed, so observers
/// always end up with an outcome.
pub struct ConnectPromise {
    shared: Arc<Shared>,
    on_connected: Option<ConnectedCallback>,
    on_failed: Option<FailedCallback>,
}

/// Observing side of a connection attempt.
#[derive(Clone)]
pub struct ConnectFuture {
    shared: Arc<Shared>,
}

/// Creates a linked promise and future pair, with callbacks fired by the
/// promise upon resolution.
pub fn pair(
    on_connected: Option<ConnectedCallback>,
    on_failed: Option<FailedCallback>,
) -> (ConnectPromise, ConnectFuture) {
    let shared = Arc::new(Shared::default());
    (
        ConnectPromise {
            shared: shared.clone(),
            on_connected,
            on_failed,
        },
        ConnectFuture { shared },
    )
}

impl ConnectPromise {
    /// Resolves the attempt, firing the matching callback.
    ///
    /// Returns false if the promise was already resolved, in which case
    /// nothing happens.
    pub fn resolve(&mut self, outcome: ConnectOutcome) -> bool {
        {
            let mut slot = lock(&self.shared.outcome);
            if slot.is_some() {
                return false;
            }
            *slot = Some(outcome.clone());
        }
        self.shared.resolved.notify_all();

        // exactly one of the callbacks is ever invoked
        let on_connected = self.on_connected.take();
        let on_failed = self.on_failed.take();
        match outcome {
            ConnectOutcome::Connected => {
                if let Some(callback) = on_connected {
                    callback();
                }
            }
            ConnectOutcome::Failed { code, message } => {
                if let Some(callback) = on_failed {
                    callback(code.into(), message);
                }
            }
        }
        true
    }

    pub fn fail(&mut self, code: ConnectionStatusCode, message: impl Into<String>) -> bool {
        self.resolve(ConnectOutcome::Failed {
            code,
            message: message.into(),
        })
    }

    pub fn is_resolved(&self) -> bool {
        lock(&self.shared.outcome).is_some()
    }
}

impl Drop for ConnectPromise {
    fn drop(&mut self) {
        if !self.is_resolved() {
            self.fail(
                ConnectionStatusCode::Cancelled,
                "connection attempt was abandoned",
            );
        }
    }
}

impl ConnectFuture {
    /// Returns the outcome if the attempt was already resolved.
    pub fn poll(&self) -> Option<ConnectOutcome> {
        lock(&self.shared.outcome).clone()
    }

    pub fn is_resolved(&self) -> bool {
        lock(&self.shared.outcome).is_some()
    }

    /// Blocks until the attempt is resolved.
    pub fn wait(&self) -> ConnectOutcome {
        let mut slot = lock(&self.shared.outcome);
        loop {
            if let Some(outcome) = slot.as_ref() {
                return outcome.clone();
            }
            slot = self
                .shared
                .resolved
                .wait(slot)
                .unwrap_or_else(|poisoned| poisoned.into_inner());
        }
    }

    /// Blocks until the attempt is resolved or the timeout passes.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<ConnectOutcome> {
        let deadline = Instant::now() + timeout;
        let mut slot = lock(&self.shared.outcome);
        loop {
            if let Some(outcome) = slot.as_ref() {
                return Some(outcome.clone());
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            slot = match self.shared.resolved.wait_timeout(slot, deadline - now) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
    }
}
