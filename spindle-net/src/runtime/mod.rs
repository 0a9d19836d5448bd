//! Runtime, the receptionist endpoint of a deployment.
//!
//! # Worker sessions
//!
//! Runtime exposes a single listener at a known address. Any worker that
//! wishes to join has to open a connection and send a handshake request as
//! the very first message. Once the handshake is accepted the worker is
//! assigned a session id and receives the initial op list describing the
//! current state of the world.
//!
//! # Authority
//!
//! Authority over all the components of an entity is delegated to a single
//! server-role worker, the one with the lowest session id at the time the
//! entity is created. Authority is reassigned when the authoritative worker
//! leaves. Only the authoritative worker can change the entity's components.
//!
//! # Interest
//!
//! Each worker declares a set of components it's interested in, and gets to
//! see entities that have at least one of those components. An empty set
//! means the worker sees everything. Interest can be overridden for single
//! entities. Authoritative workers always see the entities they are
//! authoritative over.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use fnv::FnvHashMap;
use id_pool::IdPool;

use spindle_core::{EntityId, Interest, LogLevel, Metrics, Op, OpList, RequestId, World};

use crate::config::WorkerRole;
use crate::msg::*;
use crate::socket::{Socket, SocketConfig, SocketEvent, SocketEventType};
use crate::util::lock;
use crate::{Error, Result};

mod command;
mod entity;

use command::PendingCommand;

pub type SessionId = u32;

/// Upper bound on the number of socket events handled in a single poll.
const MAX_EVENTS_PER_POLL: usize = 1024;

/// How long a handshake reusing a connected worker's id is held back,
/// waiting for the old session to close.
const REPLACEMENT_GRACE: Duration = Duration::from_millis(500);

/// Configuration settings for the runtime.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Name of the deployment the runtime belongs to
    pub name: String,
    /// Time between polls in the main loop
    pub poll_wait: Duration,
    /// Time since last traffic from worker until it's removed, set to none
    /// to keep idle workers around forever
    pub worker_keepalive: Option<Duration>,
    /// Maximum number of connected workers
    pub max_workers: Option<usize>,
    /// Accepted worker types, empty list accepts any type
    pub worker_types: Vec<String>,
    /// Deployment-wide flags sent to every worker on connect
    pub flags: BTreeMap<String, String>,
    /// Address advertised to workers asking for the external ip
    pub external_ip: Option<String>,
    /// Applied to commands sent without an explicit timeout
    pub default_command_timeout: Duration,
    /// Interval at which runtime metrics are pushed to workers, none
    /// disables pushing metrics
    pub metrics_interval: Option<Duration>,
    pub socket: SocketConfig,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            name: "local".to_string(),
            poll_wait: Duration::from_millis(1),
            worker_keepalive: Some(Duration::from_secs(4)),
            max_workers: None,
            worker_types: Vec::new(),
            flags: BTreeMap::new(),
            external_ip: None,
            default_command_timeout: Duration::from_secs(5),
            metrics_interval: Some(Duration::from_secs(5)),
            socket: SocketConfig::default(),
        }
    }
}

/// Connected worker as seen by the runtime.
#[derive(Debug, Clone)]
pub struct WorkerSession {
    /// Unique id assigned at handshake
    pub id: SessionId,
    pub worker_id: String,
    pub worker_type: String,
    pub role: WorkerRole,
    pub addr: SocketAddr,
    pub use_external_ip: bool,
    /// Default interest
    pub interest: Interest,
    /// Interest overrides for single entities
    pub interest_overrides: FnvHashMap<EntityId, Interest>,
    /// Latest metrics reported by the worker
    pub metrics: Metrics,
    pub last_event: Instant,
    pub connected_at: DateTime<Utc>,
}

impl WorkerSession {
    pub fn interest_for(&self, entity_id: EntityId) -> &Interest {
        self.interest_overrides
            .get(&entity_id)
            .unwrap_or(&self.interest)
    }
}

/// Snapshot of the runtime's state.
#[derive(Debug, Clone, Default)]
pub struct RuntimeStatus {
    pub name: String,
    pub uptime: Duration,
    pub started_at: Option<DateTime<Utc>>,
    pub entity_count: usize,
    pub workers: Vec<WorkerStatus>,
}

#[derive(Debug, Clone)]
pub struct WorkerStatus {
    pub worker_id: String,
    pub worker_type: String,
    pub role: WorkerRole,
    pub connected_at: DateTime<Utc>,
    pub authoritative_entities: usize,
    pub metrics: Metrics,
}

impl RuntimeStatus {
    pub fn worker(&self, worker_id: &str) -> Option<&WorkerStatus> {
        self.workers.iter().find(|w| w.worker_id == worker_id)
    }
}

struct DeferredHandshake {
    addr: SocketAddr,
    msg: Message,
    since: Instant,
}

/// Receptionist endpoint serving worker sessions.
pub struct Runtime {
    pub config: RuntimeConfig,
    greeter: Socket,
    world: World,

    workers: BTreeMap<SessionId, WorkerSession>,
    by_addr: FnvHashMap<SocketAddr, SessionId>,
    session_pool: IdPool,

    /// Authoritative worker for each entity
    authority: FnvHashMap<EntityId, SessionId>,
    /// Commands waiting for a response, keyed by runtime-side request id
    commands: FnvHashMap<RequestId, PendingCommand>,
    next_command_id: RequestId,

    /// Ops waiting to be sent out at the end of the current poll
    outbox: BTreeMap<SessionId, OpList>,
    /// Handshakes held back until the worker id they use frees up
    deferred: Vec<DeferredHandshake>,

    started: Instant,
    started_at: DateTime<Utc>,
    last_metrics_push: Instant,
    status_sink: Option<Arc<Mutex<RuntimeStatus>>>,
}

impl Runtime {
    /// Creates a new runtime listening on the provided address.
    pub fn new(addr: SocketAddr, config: RuntimeConfig) -> Result<Self> {
        let greeter = Socket::bind(addr, config.socket)?;
        info!(
            "runtime {} listening on {}",
            config.name,
            greeter.listener_addr()?
        );
        Ok(Self {
            config,
            greeter,
            world: World::new(),
            workers: BTreeMap::new(),
            by_addr: FnvHashMap::default(),
            session_pool: IdPool::new(),
            authority: FnvHashMap::default(),
            commands: FnvHashMap::default(),
            next_command_id: 1,
            outbox: BTreeMap::new(),
            deferred: Vec::new(),
            started: Instant::now(),
            started_at: Utc::now(),
            last_metrics_push: Instant::now(),
            status_sink: None,
        })
    }

    pub fn listener_addr(&self) -> Result<SocketAddr> {
        self.greeter.listener_addr()
    }

    pub fn world(&self) -> &World {
        &self.world
    }

    pub fn workers(&self) -> impl Iterator<Item = &WorkerSession> {
        self.workers.values()
    }

    /// Session of the worker authoritative over the given entity.
    pub fn authority(&self, entity_id: EntityId) -> Option<&WorkerSession> {
        self.authority
            .get(&entity_id)
            .and_then(|id| self.workers.get(id))
    }

    /// Makes the runtime keep the shared status up to date while polling.
    pub fn share_status(&mut self) -> Arc<Mutex<RuntimeStatus>> {
        let status = Arc::new(Mutex::new(self.status()));
        self.status_sink = Some(status.clone());
        status
    }

    pub fn status(&self) -> RuntimeStatus {
        RuntimeStatus {
            name: self.config.name.clone(),
            uptime: self.started.elapsed(),
            started_at: Some(self.started_at),
            entity_count: self.world.entity_count(),
            workers: self
                .workers
                .values()
                .map(|w| WorkerStatus {
                    worker_id: w.worker_id.clone(),
                    worker_type: w.worker_type.clone(),
                    role: w.role,
                    connected_at: w.connected_at,
                    authoritative_entities: self.authority.values().filter(|a| **a == w.id).count(),
                    metrics: w.metrics.clone(),
                })
                .collect(),
        }
    }

    /// Main runtime polling function.
    ///
    /// Handles incoming events, drops idle workers, expires commands and
    /// finally sends out all the ops produced during the poll.
    pub fn manual_poll(&mut self) -> Result<()> {
        let mut handled = 0;
        while handled < MAX_EVENTS_PER_POLL {
            let (addr, event) = match self.greeter.try_recv() {
                Ok(e) => e,
                Err(Error::WouldBlock) => break,
                Err(e) => return Err(e),
            };
            handled += 1;
            if let Err(e) = self.handle_event(addr, event) {
                warn!("failed handling event from {}: {}", addr, e);
            }
        }

        for deferred in std::mem::take(&mut self.deferred) {
            if let Err(e) = self.handle_handshake(deferred.addr, deferred.msg, deferred.since) {
                warn!("failed handling handshake from {}: {}", deferred.addr, e);
            }
        }

        self.remove_idle_workers();
        self.expire_commands();
        self.push_metrics();
        self.flush();

        if handled > 0 {
            if let Some(sink) = &self.status_sink {
                *lock(sink) = self.status();
            }
        }
        Ok(())
    }

    /// Start a polling loop.
    ///
    /// Allows for remote termination. Connected workers are notified about
    /// the shutdown once the loop ends.
    pub fn start_polling(&mut self, running: Arc<AtomicBool>) -> Result<()> {
        while running.load(Ordering::SeqCst) {
            if let Err(e) = self.manual_poll() {
                warn!("runtime error: {}", e);
            }
            thread::sleep(self.config.poll_wait);
        }
        self.shutdown()
    }

    /// Notifies all the workers about the shutdown and drops their
    /// connections.
    pub fn shutdown(&mut self) -> Result<()> {
        self.flush();
        let notice = DisconnectNotice {
            code: ConnectionStatusCode::ServerShutdown,
            reason: format!("runtime {} is shutting down", self.config.name),
        };
        for deferred in std::mem::take(&mut self.deferred) {
            let _ = self.greeter.disconnect(Some(deferred.addr));
        }
        let sessions: Vec<SessionId> = self.workers.keys().cloned().collect();
        for id in sessions {
            if let Some(worker) = self.workers.get(&id) {
                let addr = worker.addr;
                if let Err(e) = self.greeter.send_payload(&notice, 0, Some(addr)) {
                    debug!("failed notifying {}: {}", addr, e);
                }
                let _ = self.greeter.disconnect(Some(addr));
            }
            self.remove_worker(id, "runtime shutdown");
        }
        if let Some(sink) = &self.status_sink {
            *lock(sink) = self.status();
        }
        info!("runtime {} stopped", self.config.name);
        Ok(())
    }

    fn handle_event(&mut self, addr: SocketAddr, event: SocketEvent) -> Result<()> {
        let session = self.by_addr.get(&addr).copied();
        if let Some(id) = session {
            if let Some(worker) = self.workers.get_mut(&id) {
                worker.last_event = Instant::now();
            }
        }
        match event.type_ {
            SocketEventType::Heartbeat => (),
            SocketEventType::Connect => trace!("new connection from {}", addr),
            SocketEventType::Disconnect => {
                self.deferred.retain(|d| d.addr != addr);
                if let Some(id) = session {
                    self.remove_worker(id, "connection closed");
                }
            }
            SocketEventType::Bytes => {
                let msg = Message::from_bytes(&event.bytes, self.greeter.encoding())?;
                match session {
                    Some(id) => self.handle_message(id, msg)?,
                    None if msg.type_ == MessageType::HandshakeRequest => {
                        self.handle_handshake(addr, msg, Instant::now())?
                    }
                    None => warn!(
                        "expected handshake from {}, got {:?}, ignoring",
                        addr, msg.type_
                    ),
                }
            }
        }
        Ok(())
    }

    fn handle_message(&mut self, id: SessionId, msg: Message) -> Result<()> {
        let encoding = self.greeter.encoding();
        match msg.type_ {
            MessageType::ReserveEntityIdsRequest => {
                self.handle_reserve_entity_ids(id, msg.task_id, msg.unpack_payload(encoding)?)?
            }
            MessageType::CreateEntityRequest => {
                self.handle_create_entity(id, msg.task_id, msg.unpack_payload(encoding)?)?
            }
            MessageType::DeleteEntityRequest => {
                self.handle_delete_entity(id, msg.task_id, msg.unpack_payload(encoding)?)?
            }
            MessageType::EntityQueryRequest => {
                self.handle_entity_query(id, msg.task_id, msg.unpack_payload(encoding)?)?
            }
            MessageType::ComponentUpdateRequest => {
                self.handle_component_update(id, msg.unpack_payload(encoding)?)?
            }
            MessageType::AddComponentRequest => {
                self.handle_add_component(id, msg.unpack_payload(encoding)?)?
            }
            MessageType::RemoveComponentRequest => {
                self.handle_remove_component(id, msg.unpack_payload(encoding)?)?
            }
            MessageType::InterestChangeRequest => {
                self.handle_interest_change(id, msg.unpack_payload(encoding)?)?
            }
            MessageType::CommandRequest => {
                self.handle_command_request(id, msg.task_id, msg.unpack_payload(encoding)?)?
            }
            MessageType::CommandResponse => {
                self.handle_command_response(id, msg.unpack_payload(encoding)?)?
            }
            MessageType::CommandFailure => {
                self.handle_command_failure(id, msg.unpack_payload(encoding)?)?
            }
            MessageType::MetricsReport => {
                let report: MetricsReport = msg.unpack_payload(encoding)?;
                if let Some(worker) = self.workers.get_mut(&id) {
                    worker.metrics.merge(report.metrics);
                }
            }
            MessageType::LogMessage => {
                let log_msg: LogMessage = msg.unpack_payload(encoding)?;
                let worker_id = self
                    .workers
                    .get(&id)
                    .map(|w| w.worker_id.as_str())
                    .unwrap_or("?");
                match log_msg.entity_id {
                    Some(entity_id) => log!(
                        target: "spindle::worker",
                        log_msg.level.as_log_level(),
                        "[{}] {} (entity {}): {}",
                        worker_id,
                        log_msg.logger_name,
                        entity_id,
                        log_msg.message
                    ),
                    None => log!(
                        target: "spindle::worker",
                        log_msg.level.as_log_level(),
                        "[{}] {}: {}",
                        worker_id,
                        log_msg.logger_name,
                        log_msg.message
                    ),
                }
            }
            MessageType::HandshakeRequest => {
                warn!("session {} sent a second handshake, ignoring", id)
            }
            other => warn!("unexpected message from session {}: {:?}", id, other),
        }
        Ok(())
    }

    /// Checks whether the worker can join, returning the rejection reason
    /// if it can't.
    fn admit(&self, req: &HandshakeRequest) -> std::result::Result<(), (ConnectionStatusCode, String)> {
        if req.protocol_version != PROTOCOL_VERSION {
            return Err((
                ConnectionStatusCode::InvalidArgument,
                format!(
                    "protocol version mismatch: runtime {}, worker {}",
                    PROTOCOL_VERSION, req.protocol_version
                ),
            ));
        }
        if !self.config.worker_types.is_empty()
            && !self.config.worker_types.contains(&req.worker_type)
        {
            return Err((
                ConnectionStatusCode::Rejected,
                format!("unknown worker type: {}", req.worker_type),
            ));
        }
        if self.workers.values().any(|w| w.worker_id == req.worker_id) {
            return Err((
                ConnectionStatusCode::Rejected,
                format!("worker id already in use: {}", req.worker_id),
            ));
        }
        if let Some(max) = self.config.max_workers {
            if self.workers.len() >= max {
                return Err((
                    ConnectionStatusCode::CapacityExceeded,
                    format!("deployment is full ({} workers)", max),
                ));
            }
        }
        Ok(())
    }

    /// Handles a handshake received at `since`.
    ///
    /// A worker reconnecting under the same id can get here before the
    /// runtime notices its previous connection closed. Such handshakes are
    /// retried on the following polls, and only rejected as duplicates
    /// once the grace period runs out.
    fn handle_handshake(&mut self, addr: SocketAddr, msg: Message, since: Instant) -> Result<()> {
        let req: HandshakeRequest = msg.unpack_payload(self.greeter.encoding())?;
        if since.elapsed() < REPLACEMENT_GRACE
            && self.workers.values().any(|w| w.worker_id == req.worker_id)
        {
            trace!(
                "worker id {} still in use, holding back handshake from {}",
                req.worker_id,
                addr
            );
            self.deferred.push(DeferredHandshake { addr, msg, since });
            return Ok(());
        }
        if let Err((code, message)) = self.admit(&req) {
            warn!("rejecting worker {} from {}: {}", req.worker_id, addr, message);
            let response = HandshakeResponse {
                code,
                message,
                session_id: 0,
                bridge_address: String::new(),
            };
            return self.greeter.send_payload(&response, msg.task_id, Some(addr));
        }

        let id = self
            .session_pool
            .request_id()
            .ok_or_else(|| Error::Other("session ids exhausted".to_string()))?;
        let sent = self.bridge_address(req.use_external_ip).and_then(|bridge_address| {
            let response = HandshakeResponse {
                code: ConnectionStatusCode::Success,
                message: String::new(),
                session_id: id,
                bridge_address,
            };
            self.greeter.send_payload(&response, msg.task_id, Some(addr))
        });
        if let Err(e) = sent {
            if self.session_pool.return_id(id).is_err() {
                warn!("failed returning session id {} to the pool", id);
            }
            return Err(e);
        }

        info!(
            "worker {} ({}, {}) joined from {} as session {}",
            req.worker_id, req.worker_type, req.role, addr, id
        );
        self.workers.insert(
            id,
            WorkerSession {
                id,
                worker_id: req.worker_id,
                worker_type: req.worker_type,
                role: req.role,
                addr,
                use_external_ip: req.use_external_ip,
                interest: Interest::all(),
                interest_overrides: FnvHashMap::default(),
                metrics: Metrics::default(),
                last_event: Instant::now(),
                connected_at: Utc::now(),
            },
        );
        self.by_addr.insert(addr, id);
        self.send_initial_ops(id);
        Ok(())
    }

    fn bridge_address(&self, use_external_ip: bool) -> Result<String> {
        let listener = self.greeter.listener_addr()?;
        let ip = match (&self.config.external_ip, use_external_ip) {
            (Some(external), true) => external.clone(),
            _ if listener.ip().is_unspecified() => "127.0.0.1".to_string(),
            _ => listener.ip().to_string(),
        };
        Ok(format!("{}:{}", ip, listener.port()))
    }

    /// Queues up the initial op list for a freshly joined worker.
    ///
    /// The whole initial state arrives within a critical section.
    fn send_initial_ops(&mut self, id: SessionId) {
        let role = match self.workers.get(&id) {
            Some(w) => w.role,
            None => return,
        };

        // entities left without authority go to the first server to join
        if role == WorkerRole::Server {
            let orphaned: Vec<EntityId> = self
                .world
                .entities()
                .map(|(eid, _)| *eid)
                .filter(|eid| !self.authority.contains_key(eid))
                .collect();
            for eid in orphaned {
                self.authority.insert(eid, id);
            }
        }

        self.push_op(
            id,
            Op::CriticalSection {
                in_critical_section: true,
            },
        );
        let flags: Vec<Op> = self
            .config
            .flags
            .iter()
            .map(|(name, value)| Op::FlagUpdate {
                name: name.clone(),
                value: Some(value.clone()),
            })
            .collect();
        for op in flags {
            self.push_op(id, op);
        }
        let visible: Vec<EntityId> = self
            .world
            .entities()
            .map(|(eid, _)| *eid)
            .filter(|eid| self.is_visible(id, *eid))
            .collect();
        for eid in visible {
            self.push_entity(id, eid);
            if self.authority.get(&eid) == Some(&id) {
                self.push_authority(id, eid, true);
            }
        }
        self.push_op(
            id,
            Op::CriticalSection {
                in_critical_section: false,
            },
        );
    }

    /// Removes the worker, failing its pending commands and reassigning
    /// its authority.
    fn remove_worker(&mut self, id: SessionId, reason: &str) {
        let worker = match self.workers.remove(&id) {
            Some(w) => w,
            None => return,
        };
        info!("worker {} left: {}", worker.worker_id, reason);
        self.by_addr.remove(&worker.addr);
        self.outbox.remove(&id);
        if self.session_pool.return_id(id).is_err() {
            warn!("failed returning session id {} to the pool", id);
        }

        self.fail_commands_for(id);

        let mut orphaned: Vec<EntityId> = self
            .authority
            .iter()
            .filter(|(_, a)| **a == id)
            .map(|(eid, _)| *eid)
            .collect();
        orphaned.sort_unstable();
        for eid in &orphaned {
            self.authority.remove(eid);
        }
        if orphaned.is_empty() {
            return;
        }
        match self.lowest_server() {
            Some(new) => {
                debug!(
                    "reassigning authority over {} entities to session {}",
                    orphaned.len(),
                    new
                );
                for eid in orphaned {
                    let was_visible = self.is_visible(new, eid);
                    self.authority.insert(eid, new);
                    if !was_visible {
                        self.push_entity(new, eid);
                    }
                    self.push_authority(new, eid, true);
                }
            }
            None => debug!("no server workers left, {} entities orphaned", orphaned.len()),
        }
    }

    fn remove_idle_workers(&mut self) {
        let keepalive = match self.config.worker_keepalive {
            Some(k) => k,
            None => return,
        };
        let idle: Vec<(SessionId, SocketAddr)> = self
            .workers
            .values()
            .filter(|w| w.last_event.elapsed() > keepalive)
            .map(|w| (w.id, w.addr))
            .collect();
        for (id, addr) in idle {
            let notice = DisconnectNotice {
                code: ConnectionStatusCode::Timeout,
                reason: "worker keepalive limit reached".to_string(),
            };
            let _ = self.greeter.send_payload(&notice, 0, Some(addr));
            let _ = self.greeter.disconnect(Some(addr));
            self.remove_worker(id, "idle");
        }
    }

    /// Pushes runtime-wide gauges to all the workers.
    fn push_metrics(&mut self) {
        let interval = match self.config.metrics_interval {
            Some(i) => i,
            None => return,
        };
        if self.last_metrics_push.elapsed() < interval {
            return;
        }
        self.last_metrics_push = Instant::now();
        let metrics = Metrics::default()
            .with_gauge("entity_count", self.world.entity_count() as f64)
            .with_gauge("worker_count", self.workers.len() as f64)
            .with_gauge("uptime_secs", self.started.elapsed().as_secs_f64());
        let sessions: Vec<SessionId> = self.workers.keys().cloned().collect();
        for id in sessions {
            self.push_op(
                id,
                Op::Metrics {
                    metrics: metrics.clone(),
                },
            );
        }
    }

    /// Sends out all the queued op lists, one per worker.
    /// Sends out all the queued ops, one op list per worker.
    ///
    /// Failing to reach one worker doesn't hold back the others.
    fn flush(&mut self) {
        let outbox = std::mem::take(&mut self.outbox);
        for (id, op_list) in outbox {
            if op_list.is_empty() {
                continue;
            }
            if let Some(worker) = self.workers.get(&id) {
                trace!("sending {} ops to {}", op_list.len(), worker.worker_id);
                if let Err(e) =
                    self.greeter
                        .send_payload(&OpListDelivery { op_list }, 0, Some(worker.addr))
                {
                    warn!("failed sending ops to {}: {}", worker.worker_id, e);
                }
            }
        }
    }

    fn push_op(&mut self, id: SessionId, op: Op) {
        self.outbox.entry(id).or_default().push(op);
    }

    /// Queues a log message op, used for telling workers about dropped
    /// requests.
    fn push_warning(&mut self, id: SessionId, message: String) {
        debug!("session {}: {}", id, message);
        self.push_op(
            id,
            Op::LogMessage {
                level: LogLevel::Warn,
                message,
            },
        );
    }

    /// Session id of the connected server worker with the lowest id.
    fn lowest_server(&self) -> Option<SessionId> {
        self.workers
            .values()
            .find(|w| w.role == WorkerRole::Server)
            .map(|w| w.id)
    }

    fn is_authoritative(&self, id: SessionId, entity_id: EntityId) -> bool {
        self.authority.get(&entity_id) == Some(&id)
    }
}
