//! Cooperative command queue for driving connection scenarios.
//!
//! Commands are updated one at a time, once per tick, in the order they
//! were pushed. A command stays at the front of the queue until its
//! `update` reports it's done or fails. Commands never block, which makes
//! it possible to drive a whole scenario from an external loop.
//!
//! Commands get access to a user-provided state object. Commands dealing
//! with connections or deployments are given plain accessor functions
//! pointing into that state.
//!
//! ```no_run
//! use std::time::Duration;
//! use spindle_net::latent::{Connect, LatentQueue, WaitForConnectionOutcome};
//! use spindle_net::{ConnectionSetup, WorkerConnection, WorkerRole};
//!
//! struct State {
//!     worker: WorkerConnection,
//! }
//!
//! fn worker(state: &mut State) -> &mut WorkerConnection {
//!     &mut state.worker
//! }
//!
//! let mut state = State {
//!     worker: WorkerConnection::new(ConnectionSetup::receptionist("127.0.0.1", 7777, "Managed")),
//! };
//! let mut queue = LatentQueue::new();
//! queue
//!     .push(Connect::new(worker, WorkerRole::Server, 0))
//!     .push(WaitForConnectionOutcome::new(worker, Duration::from_secs(10)));
//! queue.run(&mut state, Duration::from_millis(10)).unwrap();
//! ```

use std::collections::VecDeque;
use std::fmt::{Display, Formatter};
use std::thread;
use std::time::{Duration, Instant};

use spindle_core::{Op, OpList, OpType};

use crate::config::WorkerRole;
use crate::connection::WorkerConnection;
use crate::deployment::{Deployment, DeploymentConfig};

/// Outcome of a single update, `Ok(true)` once the command is done.
pub type Progress = std::result::Result<bool, String>;

/// Accessor for the connection a command operates on.
pub type ConnectionAccessor<S> = fn(&mut S) -> &mut WorkerConnection;

/// Accessor for the slot holding a deployment.
pub type DeploymentAccessor<S> = fn(&mut S) -> &mut Option<Deployment>;

pub trait LatentCommand<S> {
    fn name(&self) -> String;

    /// Advances the command by a single tick.
    fn update(&mut self, state: &mut S) -> Progress;
}

/// Recorded command failure. Timeouts end up here too.
#[derive(Debug, Clone, PartialEq)]
pub struct Failure {
    pub command: String,
    pub message: String,
}

impl Display for Failure {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.command, self.message)
    }
}

pub struct LatentQueue<S> {
    commands: VecDeque<Box<dyn LatentCommand<S>>>,
    failures: Vec<Failure>,
    /// Drop all remaining commands after the first failure
    pub abort_on_failure: bool,
}

impl<S> Default for LatentQueue<S> {
    fn default() -> Self {
        Self {
            commands: VecDeque::new(),
            failures: Vec::new(),
            abort_on_failure: true,
        }
    }
}

impl<S> LatentQueue<S> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push<C: LatentCommand<S> + 'static>(&mut self, command: C) -> &mut Self {
        self.commands.push_back(Box::new(command));
        self
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    pub fn failures(&self) -> &[Failure] {
        &self.failures
    }

    /// Updates the command at the front of the queue. Returns true once
    /// the queue is empty.
    pub fn tick(&mut self, state: &mut S) -> bool {
        let command = match self.commands.front_mut() {
            Some(c) => c,
            None => return true,
        };
        match command.update(state) {
            Ok(false) => (),
            Ok(true) => {
                trace!("latent command done: {}", command.name());
                self.commands.pop_front();
            }
            Err(message) => {
                let failure = Failure {
                    command: command.name(),
                    message,
                };
                warn!("latent command failed: {}", failure);
                self.failures.push(failure);
                if self.abort_on_failure {
                    self.commands.clear();
                } else {
                    self.commands.pop_front();
                }
            }
        }
        self.commands.is_empty()
    }

    /// Ticks until the queue is empty, sleeping between ticks.
    pub fn run(&mut self, state: &mut S, tick: Duration) -> std::result::Result<(), Vec<Failure>> {
        while !self.tick(state) {
            thread::sleep(tick);
        }
        if self.failures.is_empty() {
            Ok(())
        } else {
            Err(std::mem::take(&mut self.failures))
        }
    }
}

/// Tracks a command's deadline, starting on first check.
#[derive(Debug, Clone)]
struct Deadline {
    timeout: Duration,
    started: Option<Instant>,
}

impl Deadline {
    fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            started: None,
        }
    }

    fn passed(&mut self) -> bool {
        self.started.get_or_insert_with(Instant::now).elapsed() > self.timeout
    }
}

/// Starts connecting, done as soon as the attempt is started.
pub struct Connect<S> {
    connection: ConnectionAccessor<S>,
    role: WorkerRole,
    context_id: u32,
}

impl<S> Connect<S> {
    pub fn new(connection: ConnectionAccessor<S>, role: WorkerRole, context_id: u32) -> Self {
        Self {
            connection,
            role,
            context_id,
        }
    }
}

impl<S> LatentCommand<S> for Connect<S> {
    fn name(&self) -> String {
        format!("connect as {}", self.role)
    }

    fn update(&mut self, state: &mut S) -> Progress {
        (self.connection)(state)
            .connect(self.role, self.context_id)
            .map(|_| true)
            .map_err(|e| e.to_string())
    }
}

/// Waits for the outcome of the latest connection attempt.
///
/// By default any outcome ends the wait. Use `expect_connected` to turn
/// the wrong outcome into a failure.
pub struct WaitForConnectionOutcome<S> {
    connection: ConnectionAccessor<S>,
    deadline: Deadline,
    expected: Option<bool>,
}

impl<S> WaitForConnectionOutcome<S> {
    pub fn new(connection: ConnectionAccessor<S>, timeout: Duration) -> Self {
        Self {
            connection,
            deadline: Deadline::new(timeout),
            expected: None,
        }
    }

    pub fn expect_connected(mut self, connected: bool) -> Self {
        self.expected = Some(connected);
        self
    }
}

impl<S> LatentCommand<S> for WaitForConnectionOutcome<S> {
    fn name(&self) -> String {
        "wait for connection outcome".to_string()
    }

    fn update(&mut self, state: &mut S) -> Progress {
        let outcome = match (self.connection)(state).connect_future() {
            Some(future) => future.poll(),
            None => return Err("no connection attempt was made".to_string()),
        };
        match outcome {
            Some(outcome) => match self.expected {
                Some(expected) if expected != outcome.is_connected() => {
                    Err(format!("unexpected connection outcome: {}", outcome))
                }
                _ => Ok(true),
            },
            None if self.deadline.passed() => Err("timed out".to_string()),
            None => Ok(false),
        }
    }
}

/// Runs a closure once, usually to send out a request.
pub struct Run<S> {
    name: String,
    f: Box<dyn FnMut(&mut S) -> crate::Result<()>>,
}

impl<S> Run<S> {
    pub fn new<F>(name: &str, f: F) -> Self
    where
        F: FnMut(&mut S) -> crate::Result<()> + 'static,
    {
        Self {
            name: name.to_string(),
            f: Box::new(f),
        }
    }
}

impl<S> LatentCommand<S> for Run<S> {
    fn name(&self) -> String {
        self.name.clone()
    }

    fn update(&mut self, state: &mut S) -> Progress {
        (self.f)(state).map(|_| true).map_err(|e| e.to_string())
    }
}

/// Drains the connection's op lists until an op of the given type shows
/// up.
///
/// Only the matching op is consumed. All the other ops drained while
/// waiting are handed back to the connection in their original order, so
/// the following commands still see them.
pub struct WaitForOp<S> {
    connection: ConnectionAccessor<S>,
    op_type: OpType,
    deadline: Deadline,
    filter: Option<Box<dyn Fn(&S, &Op) -> bool>>,
    handler: Option<Box<dyn FnMut(&mut S, Op)>>,
}

impl<S> WaitForOp<S> {
    pub fn new(connection: ConnectionAccessor<S>, op_type: OpType, timeout: Duration) -> Self {
        Self {
            connection,
            op_type,
            deadline: Deadline::new(timeout),
            filter: None,
            handler: None,
        }
    }

    /// Narrows down the ops accepted by the wait.
    pub fn matching<F: Fn(&S, &Op) -> bool + 'static>(mut self, filter: F) -> Self {
        self.filter = Some(Box::new(filter));
        self
    }

    /// Hands the matching op over to the state.
    pub fn then<F: FnMut(&mut S, Op) + 'static>(mut self, handler: F) -> Self {
        self.handler = Some(Box::new(handler));
        self
    }

    fn accepts(&self, state: &S, op: &Op) -> bool {
        op.op_type() == self.op_type
            && self.filter.as_ref().map_or(true, |filter| filter(state, op))
    }
}

impl<S> LatentCommand<S> for WaitForOp<S> {
    fn name(&self) -> String {
        format!("wait for {:?} op", self.op_type)
    }

    fn update(&mut self, state: &mut S) -> Progress {
        let op_lists = (self.connection)(state).get_op_list();
        let mut found = None;
        let mut rest = Vec::with_capacity(op_lists.len());
        for op_list in op_lists {
            if found.is_some() {
                rest.push(op_list);
                continue;
            }
            let mut kept = OpList::new();
            for op in op_list {
                if found.is_none() && self.accepts(state, &op) {
                    found = Some(op);
                } else {
                    kept.push(op);
                }
            }
            rest.push(kept);
        }
        let connection = (self.connection)(state);
        for op_list in rest {
            connection.unread_op_list(op_list);
        }

        match found {
            Some(op) => {
                if let Some(handler) = &mut self.handler {
                    handler(state, op);
                }
                Ok(true)
            }
            None if self.deadline.passed() => Err("timed out".to_string()),
            None => Ok(false),
        }
    }
}

/// Waits until the predicate holds.
pub struct WaitFor<S> {
    name: String,
    predicate: Box<dyn FnMut(&mut S) -> bool>,
    deadline: Deadline,
}

impl<S> WaitFor<S> {
    pub fn new<F>(name: &str, predicate: F, timeout: Duration) -> Self
    where
        F: FnMut(&mut S) -> bool + 'static,
    {
        Self {
            name: name.to_string(),
            predicate: Box::new(predicate),
            deadline: Deadline::new(timeout),
        }
    }
}

impl<S> LatentCommand<S> for WaitFor<S> {
    fn name(&self) -> String {
        format!("wait for {}", self.name)
    }

    fn update(&mut self, state: &mut S) -> Progress {
        if (self.predicate)(state) {
            Ok(true)
        } else if self.deadline.passed() {
            Err("timed out".to_string())
        } else {
            Ok(false)
        }
    }
}

/// Starts a deployment and waits for it to run.
pub struct StartDeployment<S> {
    deployment: DeploymentAccessor<S>,
    config: Option<DeploymentConfig>,
    deadline: Deadline,
}

impl<S> StartDeployment<S> {
    pub fn new(deployment: DeploymentAccessor<S>, config: DeploymentConfig) -> Self {
        Self {
            deployment,
            config: Some(config),
            deadline: Deadline::new(Duration::from_secs(10)),
        }
    }
}

impl<S> LatentCommand<S> for StartDeployment<S> {
    fn name(&self) -> String {
        "start deployment".to_string()
    }

    fn update(&mut self, state: &mut S) -> Progress {
        let slot = (self.deployment)(state);
        if let Some(config) = self.config.take() {
            if slot.is_some() {
                return Err("deployment already started".to_string());
            }
            *slot = Some(Deployment::start(config).map_err(|e| e.to_string())?);
        }
        match slot {
            Some(d) if d.is_running() => Ok(true),
            Some(_) if self.deadline.passed() => Err("timed out".to_string()),
            Some(_) => Ok(false),
            None => Err("deployment is gone".to_string()),
        }
    }
}

/// Stops the deployment and waits until it's fully stopped.
pub struct StopDeployment<S> {
    deployment: DeploymentAccessor<S>,
    deadline: Deadline,
}

impl<S> StopDeployment<S> {
    pub fn new(deployment: DeploymentAccessor<S>) -> Self {
        Self {
            deployment,
            deadline: Deadline::new(Duration::from_secs(10)),
        }
    }
}

impl<S> LatentCommand<S> for StopDeployment<S> {
    fn name(&self) -> String {
        "stop deployment".to_string()
    }

    fn update(&mut self, state: &mut S) -> Progress {
        let slot = (self.deployment)(state);
        let stopped = match slot.as_ref() {
            Some(d) => {
                d.stop();
                d.state() == crate::DeploymentState::Stopped
            }
            None => return Ok(true),
        };
        if stopped {
            *slot = None;
            Ok(true)
        } else if self.deadline.passed() {
            Err("timed out".to_string())
        } else {
            Ok(false)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Counter {
        ticks: u32,
        log: Vec<&'static str>,
    }

    #[test]
    fn commands_run_in_order() {
        let mut queue = LatentQueue::new();
        queue
            .push(Run::new("first", |s: &mut Counter| {
                s.log.push("first");
                Ok(())
            }))
            .push(WaitFor::new(
                "three ticks",
                |s: &mut Counter| {
                    s.ticks += 1;
                    s.ticks == 3
                },
                Duration::from_secs(1),
            ))
            .push(Run::new("last", |s: &mut Counter| {
                s.log.push("last");
                Ok(())
            }));

        let mut state = Counter::default();
        assert!(!queue.tick(&mut state));
        assert_eq!(state.log, vec!["first"]);
        queue.run(&mut state, Duration::from_millis(1)).unwrap();
        assert_eq!(state.ticks, 3);
        assert_eq!(state.log, vec!["first", "last"]);
    }

    #[test]
    fn timeouts_are_recorded_as_failures() {
        let mut queue = LatentQueue::new();
        queue
            .push(WaitFor::new(
                "never",
                |_: &mut Counter| false,
                Duration::from_millis(20),
            ))
            .push(Run::new("unreachable", |s: &mut Counter| {
                s.log.push("unreachable");
                Ok(())
            }));

        let mut state = Counter::default();
        let failures = queue
            .run(&mut state, Duration::from_millis(5))
            .unwrap_err();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].command, "wait for never");
        assert_eq!(failures[0].message, "timed out");
        assert!(state.log.is_empty());
    }

    #[test]
    fn failures_can_be_skipped() {
        let mut queue = LatentQueue::new();
        queue.abort_on_failure = false;
        queue
            .push(Run::new("fails", |_: &mut Counter| {
                Err(crate::Error::Other("boom".to_string()))
            }))
            .push(Run::new("runs anyway", |s: &mut Counter| {
                s.log.push("ran");
                Ok(())
            }));

        let mut state = Counter::default();
        let failures = queue
            .run(&mut state, Duration::from_millis(1))
            .unwrap_err();
        assert_eq!(failures[0].message, "boom");
        assert_eq!(state.log, vec!["ran"]);
    }
}
