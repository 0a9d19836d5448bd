//! Worker-side connection to a deployment's runtime.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{sleep, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{unbounded, Receiver, Sender, TryRecvError};
use serde::Serialize;

use spindle_core::{
    ComponentData, ComponentId, ComponentUpdate, EntityId, EntityQuery, Fields, Interest,
    LogLevel, Metrics, Op, OpList, RequestId,
};

use crate::config::{
    ConnectionConfig, ConnectionSetup, WorkerRole, DEFAULT_RECEPTIONIST_PORT,
};
use crate::lifecycle::Lifecycle;
use crate::msg::*;
use crate::promise::{self, ConnectFuture, ConnectOutcome, ConnectPromise, ConnectedCallback, FailedCallback};
use crate::socket::{Socket, SocketEventType};
use crate::util::{lock, resolve, split_host_port, timeout_millis};
use crate::{locator, Error, Result};

/// Connection state as observed from the outside.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    /// No connection attempt was made yet
    Idle,
    Connecting,
    Connected,
    /// Last attempt failed
    Failed,
    /// Previously established session has ended
    Disconnected,
}

struct Shared {
    state: Mutex<ConnectionState>,
    stop: AtomicBool,
    bridge_address: Mutex<Option<String>>,
}

/// Connection between a single worker and a deployment's runtime.
///
/// # Connecting
///
/// Calling [`connect`] starts establishing the session on a separate
/// transport thread and returns right away. Exactly one of the registered
/// callbacks is invoked for every attempt, on the transport thread. The
/// attempt's outcome can also be observed using the returned
/// [`ConnectFuture`].
///
/// # Receiving
///
/// Everything the runtime sends to the worker arrives in the form of op
/// lists. These are queued up as they come in and can be drained using
/// [`get_op_list`]. When the session ends a final op list with a single
/// `Disconnect` op is queued.
///
/// [`connect`]: #method.connect
/// [`get_op_list`]: #method.get_op_list
/// [`ConnectFuture`]: ../promise/struct.ConnectFuture.html
pub struct WorkerConnection {
    setup: ConnectionSetup,
    role: Option<WorkerRole>,
    worker_id: Option<String>,
    shared: Arc<Shared>,

    on_connected: Option<ConnectedCallback>,
    on_failed: Option<FailedCallback>,
    future: Option<ConnectFuture>,

    op_sender: Sender<OpList>,
    op_receiver: Receiver<OpList>,
    /// Op lists handed back with `unread_op_list`
    unread: VecDeque<OpList>,
    outgoing: Option<Sender<Message>>,
    next_request_id: RequestId,

    session: Option<JoinHandle<()>>,
    holders: usize,
}

impl WorkerConnection {
    pub fn new(setup: ConnectionSetup) -> Self {
        let (op_sender, op_receiver) = unbounded();
        Self {
            setup,
            role: None,
            worker_id: None,
            shared: Arc::new(Shared {
                state: Mutex::new(ConnectionState::Idle),
                stop: AtomicBool::new(false),
                bridge_address: Mutex::new(None),
            }),
            on_connected: None,
            on_failed: None,
            future: None,
            op_sender,
            op_receiver,
            unread: VecDeque::new(),
            outgoing: None,
            next_request_id: 1,
            session: None,
            holders: 0,
        }
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.setup.config
    }

    pub fn worker_type(&self) -> &str {
        self.setup.config.worker_type()
    }

    /// Worker id of the current or last connection attempt.
    pub fn worker_id(&self) -> Option<&str> {
        self.worker_id.as_deref()
    }

    pub fn role(&self) -> Option<WorkerRole> {
        self.role
    }

    pub fn state(&self) -> ConnectionState {
        *lock(&self.shared.state)
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Address the runtime advertised during the handshake.
    pub fn bridge_address(&self) -> Option<String> {
        lock(&self.shared.bridge_address).clone()
    }

    /// Future of the current or last connection attempt.
    pub fn connect_future(&self) -> Option<&ConnectFuture> {
        self.future.as_ref()
    }

    /// Registers a callback fired once the next attempt succeeds.
    pub fn on_connected<F: FnOnce() + Send + 'static>(&mut self, callback: F) {
        self.on_connected = Some(Box::new(callback));
    }

    /// Registers a callback fired once the next attempt fails, with the
    /// numeric `ConnectionStatusCode` and a message.
    pub fn on_failed_to_connect<F: FnOnce(u8, String) + Send + 'static>(&mut self, callback: F) {
        self.on_failed = Some(Box::new(callback));
    }

    /// Starts connecting with the given role.
    ///
    /// Worker id is made up of the worker type and the context id, for
    /// example `UnrealWorker0`.
    pub fn connect(&mut self, role: WorkerRole, context_id: u32) -> Result<ConnectFuture> {
        {
            let mut state = lock(&self.shared.state);
            match *state {
                ConnectionState::Connecting | ConnectionState::Connected => {
                    return Err(Error::AlreadyConnecting)
                }
                _ => *state = ConnectionState::Connecting,
            }
        }
        // previous session thread, if any, is already on its way out
        if let Some(handle) = self.session.take() {
            if handle.join().is_err() {
                error!("previous session thread panicked");
            }
        }
        self.shared.stop.store(false, Ordering::SeqCst);
        *lock(&self.shared.bridge_address) = None;

        let worker_id = format!("{}{}", self.worker_type(), context_id);
        debug!("{} connecting as {}", worker_id, role);

        let (promise, future) = promise::pair(self.on_connected.take(), self.on_failed.take());
        let (out_sender, out_receiver) = unbounded();
        let session = Session {
            worker_id: worker_id.clone(),
            role,
            setup: self.setup.clone(),
            shared: self.shared.clone(),
            ops: self.op_sender.clone(),
            outgoing: out_receiver,
        };
        let handle = std::thread::Builder::new()
            .name(format!("spindle-{}", worker_id))
            .spawn(move || session.run(promise));
        let handle = match handle {
            Ok(h) => h,
            Err(e) => {
                *lock(&self.shared.state) = ConnectionState::Failed;
                return Err(e.into());
            }
        };

        self.role = Some(role);
        self.worker_id = Some(worker_id);
        self.outgoing = Some(out_sender);
        self.session = Some(handle);
        self.future = Some(future.clone());
        Ok(future)
    }

    /// Ends the current session, blocking until the transport thread
    /// finishes.
    pub fn disconnect(&mut self) {
        self.shared.stop.store(true, Ordering::SeqCst);
        self.outgoing = None;
        if let Some(handle) = self.session.take() {
            if handle.join().is_err() {
                error!("session thread panicked");
            }
        }
    }

    /// Drains all the op lists received since the last call.
    ///
    /// Never blocks. Each received op list is returned exactly once, unless
    /// handed back with `unread_op_list`.
    pub fn get_op_list(&mut self) -> Vec<OpList> {
        let mut op_lists: Vec<OpList> = self.unread.drain(..).collect();
        op_lists.extend(self.op_receiver.try_iter());
        op_lists
    }

    /// Hands an op list back, to be returned first on the next
    /// `get_op_list` call. Lists handed back in a row keep their order.
    pub fn unread_op_list(&mut self, op_list: OpList) {
        if !op_list.is_empty() {
            self.unread.push_back(op_list);
        }
    }

    fn next_request_id(&mut self) -> RequestId {
        let id = self.next_request_id;
        self.next_request_id = self.next_request_id.checked_add(1).unwrap_or(1);
        id
    }

    fn send<P: Payload + Serialize>(&self, payload: &P, task_id: TaskId) -> Result<()> {
        if !self.is_connected() {
            return Err(Error::NotConnected);
        }
        let msg = Message::from_payload(payload, task_id, &self.setup.params.socket_config())?;
        self.outgoing
            .as_ref()
            .ok_or(Error::NotConnected)?
            .send(msg)
            .map_err(|_| Error::NotConnected)
    }

    fn send_request<P: Payload + Serialize>(&mut self, payload: &P) -> Result<RequestId> {
        if !self.is_connected() {
            return Err(Error::NotConnected);
        }
        let request_id = self.next_request_id();
        self.send(payload, request_id)?;
        trace!("sent {:?} as request {}", payload.type_(), request_id);
        Ok(request_id)
    }

    pub fn send_reserve_entity_ids_request(
        &mut self,
        count: u32,
        timeout: Option<Duration>,
    ) -> Result<RequestId> {
        self.send_request(&ReserveEntityIdsRequest {
            count,
            timeout_millis: timeout_millis(timeout),
        })
    }

    /// Requests creating an entity. Passing an entity id requires it to be
    /// reserved beforehand.
    pub fn send_create_entity_request(
        &mut self,
        components: Vec<ComponentData>,
        entity_id: Option<EntityId>,
        timeout: Option<Duration>,
    ) -> Result<RequestId> {
        self.send_request(&CreateEntityRequest {
            entity_id,
            components,
            timeout_millis: timeout_millis(timeout),
        })
    }

    pub fn send_delete_entity_request(
        &mut self,
        entity_id: EntityId,
        timeout: Option<Duration>,
    ) -> Result<RequestId> {
        self.send_request(&DeleteEntityRequest {
            entity_id,
            timeout_millis: timeout_millis(timeout),
        })
    }

    pub fn send_entity_query_request(
        &mut self,
        query: EntityQuery,
        timeout: Option<Duration>,
    ) -> Result<RequestId> {
        self.send_request(&EntityQueryRequest {
            query,
            timeout_millis: timeout_millis(timeout),
        })
    }

    pub fn send_command_request(
        &mut self,
        entity_id: EntityId,
        component_id: ComponentId,
        command_index: u32,
        payload: Fields,
        timeout: Option<Duration>,
    ) -> Result<RequestId> {
        self.send_request(&CommandRequest {
            entity_id,
            component_id,
            command_index,
            payload,
            timeout_millis: timeout_millis(timeout),
        })
    }

    /// Responds to a command request received as an op.
    pub fn send_command_response(&mut self, request_id: RequestId, payload: Fields) -> Result<()> {
        self.send(
            &CommandResponse {
                request_id,
                payload,
            },
            request_id,
        )
    }

    pub fn send_command_failure(&mut self, request_id: RequestId, message: &str) -> Result<()> {
        self.send(
            &CommandFailure {
                request_id,
                message: message.to_string(),
            },
            request_id,
        )
    }

    pub fn send_component_update(
        &mut self,
        entity_id: EntityId,
        update: ComponentUpdate,
    ) -> Result<()> {
        self.send(&ComponentUpdateRequest { entity_id, update }, 0)
    }

    pub fn send_add_component(&mut self, entity_id: EntityId, data: ComponentData) -> Result<()> {
        self.send(&AddComponentRequest { entity_id, data }, 0)
    }

    pub fn send_remove_component(
        &mut self,
        entity_id: EntityId,
        component_id: ComponentId,
    ) -> Result<()> {
        self.send(
            &RemoveComponentRequest {
                entity_id,
                component_id,
            },
            0,
        )
    }

    /// Overrides the worker's interest for a single entity.
    pub fn send_component_interest(
        &mut self,
        entity_id: EntityId,
        interest: Interest,
    ) -> Result<()> {
        self.send(
            &InterestChangeRequest {
                entity_id: Some(entity_id),
                interest,
            },
            0,
        )
    }

    /// Sets the worker's default interest, applying to all the entities
    /// without an override.
    pub fn send_interest_change(&mut self, interest: Interest) -> Result<()> {
        self.send(
            &InterestChangeRequest {
                entity_id: None,
                interest,
            },
            0,
        )
    }

    pub fn send_metrics(&mut self, metrics: Metrics) -> Result<()> {
        self.send(
            &MetricsReport {
                metrics,
                timestamp: chrono::Utc::now().timestamp_millis(),
            },
            0,
        )
    }

    pub fn send_log_message(
        &mut self,
        level: LogLevel,
        logger_name: &str,
        message: &str,
        entity_id: Option<EntityId>,
    ) -> Result<()> {
        self.send(
            &LogMessage {
                level,
                logger_name: logger_name.to_string(),
                message: message.to_string(),
                entity_id,
                timestamp: chrono::Utc::now().timestamp_millis(),
            },
            0,
        )
    }
}

impl Lifecycle for WorkerConnection {
    fn acquire(&mut self) {
        self.holders += 1;
    }

    /// Tears down the session once the last holder lets go.
    fn release(&mut self) {
        self.holders = self.holders.saturating_sub(1);
        if self.holders == 0 {
            self.disconnect();
        }
    }
}

impl Drop for WorkerConnection {
    fn drop(&mut self) {
        self.disconnect();
    }
}

/// State moved onto the transport thread for the duration of a session.
struct Session {
    worker_id: String,
    role: WorkerRole,
    setup: ConnectionSetup,
    shared: Arc<Shared>,
    ops: Sender<OpList>,
    outgoing: Receiver<Message>,
}

impl Session {
    fn run(self, mut promise: ConnectPromise) {
        let (mut socket, response) = match self.establish() {
            Ok(established) => established,
            Err(e) => {
                let (code, message) = failure_of(e);
                warn!("{} failed to connect: {}: {}", self.worker_id, code, message);
                self.set_state(ConnectionState::Failed);
                promise.fail(code, message);
                return;
            }
        };

        info!(
            "{} connected as {} (session {})",
            self.worker_id, self.role, response.session_id
        );
        *lock(&self.shared.bridge_address) = Some(response.bridge_address);
        self.set_state(ConnectionState::Connected);
        promise.resolve(ConnectOutcome::Connected);

        let (code, reason) = self.pump(&mut socket);
        info!("{} disconnected: {}: {}", self.worker_id, code, reason);
        self.set_state(ConnectionState::Disconnected);
        let _ = self.ops.send(OpList::from_ops(vec![Op::Disconnect {
            code: code.into(),
            reason,
        }]));
    }

    fn set_state(&self, state: ConnectionState) {
        *lock(&self.shared.state) = state;
    }

    /// Runs the full connection sequence, up until the runtime accepts the
    /// handshake.
    fn establish(&self) -> Result<(Socket, HandshakeResponse)> {
        let params = &self.setup.params;
        let (host, port, use_external_ip) = match &self.setup.config {
            ConnectionConfig::Receptionist(c) => (c.host.clone(), c.port, c.use_external_ip),
            ConnectionConfig::Locator(c) => {
                let login = locator::login(c, params)?;
                if login.code != ConnectionStatusCode::Success {
                    return Err(Error::ConnectionFailed(login.code, login.message));
                }
                debug!(
                    "locator resolved deployment {} at {}",
                    login.deployment, login.receptionist_addr
                );
                let (host, port) =
                    split_host_port(&login.receptionist_addr, DEFAULT_RECEPTIONIST_PORT)?;
                (host, port, true)
            }
        };

        let addr = resolve(&host, port)?;
        let mut socket = Socket::connect(addr, params.socket_config(), params.connect_timeout)?;
        socket.send_payload(
            &HandshakeRequest {
                worker_id: self.worker_id.clone(),
                worker_type: self.setup.config.worker_type().to_string(),
                role: self.role,
                use_external_ip,
                protocol_version: PROTOCOL_VERSION,
            },
            0,
            None,
        )?;

        let (_, msg) = socket.recv_msg_timeout(params.connect_timeout)?;
        let response: HandshakeResponse =
            msg.expect_payload(socket.encoding(), MessageType::HandshakeResponse)?;
        if !response.accepted() {
            return Err(Error::ConnectionFailed(response.code, response.message));
        }
        Ok((socket, response))
    }

    /// Moves messages between the socket and the connection handle until
    /// the session ends, returning the reason it ended.
    fn pump(&self, socket: &mut Socket) -> (ConnectionStatusCode, String) {
        let params = &self.setup.params;
        let mut last_seen = Instant::now();
        loop {
            if self.shared.stop.load(Ordering::SeqCst) {
                let _ = socket.disconnect(None);
                return (
                    ConnectionStatusCode::Cancelled,
                    "disconnected by the worker".to_string(),
                );
            }

            let mut busy = false;
            loop {
                match self.outgoing.try_recv() {
                    Ok(msg) => {
                        busy = true;
                        if let Err(e) = socket.send_msg(&msg, None) {
                            return (ConnectionStatusCode::NetworkError, e.to_string());
                        }
                    }
                    Err(TryRecvError::Empty) => break,
                    Err(TryRecvError::Disconnected) => {
                        let _ = socket.disconnect(None);
                        return (
                            ConnectionStatusCode::Cancelled,
                            "connection handle went away".to_string(),
                        );
                    }
                }
            }

            loop {
                match socket.try_recv() {
                    Ok((_, event)) => {
                        busy = true;
                        last_seen = Instant::now();
                        match event.type_ {
                            SocketEventType::Bytes => {
                                match self.handle_message(&event.bytes, socket) {
                                    Ok(Some(end)) => return end,
                                    Ok(None) => (),
                                    Err(e) => warn!("{}: failed handling message: {}", self.worker_id, e),
                                }
                            }
                            SocketEventType::Disconnect => {
                                return (
                                    ConnectionStatusCode::NetworkError,
                                    "connection closed by the runtime".to_string(),
                                )
                            }
                            _ => (),
                        }
                    }
                    Err(Error::WouldBlock) => break,
                    Err(e) => return (ConnectionStatusCode::NetworkError, e.to_string()),
                }
            }

            if last_seen.elapsed() > params.heartbeat_timeout {
                return (
                    ConnectionStatusCode::Timeout,
                    "runtime stopped responding".to_string(),
                );
            }
            if !busy {
                sleep(params.poll_wait);
            }
        }
    }

    fn handle_message(
        &self,
        bytes: &[u8],
        socket: &Socket,
    ) -> Result<Option<(ConnectionStatusCode, String)>> {
        let msg = Message::from_bytes(bytes, socket.encoding())?;
        match msg.type_ {
            MessageType::OpListDelivery => {
                let delivery: OpListDelivery = msg.unpack_payload(socket.encoding())?;
                trace!(
                    "{} received op list with {} ops",
                    self.worker_id,
                    delivery.op_list.len()
                );
                let _ = self.ops.send(delivery.op_list);
            }
            MessageType::DisconnectNotice => {
                let notice: DisconnectNotice = msg.unpack_payload(socket.encoding())?;
                return Ok(Some((notice.code, notice.reason)));
            }
            other => debug!("{}: ignoring unexpected message {:?}", self.worker_id, other),
        }
        Ok(None)
    }
}

/// Maps an error encountered while connecting onto a failure code.
fn failure_of(error: Error) -> (ConnectionStatusCode, String) {
    let code = match &error {
        Error::ConnectionFailed(code, message) => return (*code, message.clone()),
        Error::TimedOut => ConnectionStatusCode::Timeout,
        Error::HostUnreachable
        | Error::SocketNotConnected
        | Error::IoError(_)
        | Error::WouldBlock => ConnectionStatusCode::NetworkError,
        Error::InvalidUrl(_)
        | Error::InvalidConfig(_)
        | Error::AddrParseError(_)
        | Error::IntParseError(_) => ConnectionStatusCode::InvalidArgument,
        _ => ConnectionStatusCode::InternalError,
    };
    (code, error.to_string())
}
