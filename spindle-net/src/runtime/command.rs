//! Command routing between workers.
//!
//! Commands are addressed to a component of an entity and delivered to the
//! worker authoritative over that entity. The runtime tracks each forwarded
//! command under its own request id and maps the handler's response back
//! onto the id the caller used.

use std::time::{Duration, Instant};

use spindle_core::{ComponentId, EntityId, Fields, Op, RequestId, StatusCode};

use super::{Runtime, SessionId};
use crate::msg::{CommandFailure, CommandRequest, CommandResponse};
use crate::util::duration_millis;
use crate::Result;

/// Command forwarded to its handler and awaiting response.
#[derive(Debug, Clone)]
pub(crate) struct PendingCommand {
    pub caller: SessionId,
    pub caller_request_id: RequestId,
    pub handler: SessionId,
    pub entity_id: EntityId,
    pub component_id: ComponentId,
    pub command_index: u32,
    pub deadline: Instant,
}

impl PendingCommand {
    fn response(&self, status_code: StatusCode, message: String, payload: Option<Fields>) -> Op {
        Op::CommandResponse {
            request_id: self.caller_request_id,
            status_code,
            message,
            entity_id: self.entity_id,
            component_id: self.component_id,
            command_index: self.command_index,
            payload,
        }
    }
}

impl Runtime {
    pub(super) fn handle_command_request(
        &mut self,
        id: SessionId,
        request_id: RequestId,
        req: CommandRequest,
    ) -> Result<()> {
        let fail = |status_code, message: String| Op::CommandResponse {
            request_id,
            status_code,
            message,
            entity_id: req.entity_id,
            component_id: req.component_id,
            command_index: req.command_index,
            payload: None,
        };

        let has_component = match self.world.entity(req.entity_id) {
            Some(entity) => entity.has_component(req.component_id),
            None => {
                let op = fail(
                    StatusCode::NotFound,
                    format!("no such entity: {}", req.entity_id),
                );
                self.push_op(id, op);
                return Ok(());
            }
        };
        if !has_component {
            let op = fail(
                StatusCode::NotFound,
                format!(
                    "entity {} has no component {}",
                    req.entity_id, req.component_id
                ),
            );
            self.push_op(id, op);
            return Ok(());
        }
        let handler = match self.authority.get(&req.entity_id) {
            Some(handler) => *handler,
            None => {
                let op = fail(
                    StatusCode::AuthorityLost,
                    format!("no worker is authoritative over entity {}", req.entity_id),
                );
                self.push_op(id, op);
                return Ok(());
            }
        };

        let caller_worker_id = self
            .workers
            .get(&id)
            .map(|w| w.worker_id.clone())
            .unwrap_or_default();
        let timeout = match req.timeout_millis {
            0 => self.config.default_command_timeout,
            millis => Duration::from_millis(millis as u64),
        };

        let runtime_request_id = self.next_command_id;
        self.next_command_id = self.next_command_id.wrapping_add(1).max(1);
        self.commands.insert(
            runtime_request_id,
            PendingCommand {
                caller: id,
                caller_request_id: request_id,
                handler,
                entity_id: req.entity_id,
                component_id: req.component_id,
                command_index: req.command_index,
                deadline: Instant::now() + timeout,
            },
        );
        trace!(
            "routing command {} from {} to session {} as {}",
            request_id,
            caller_worker_id,
            handler,
            runtime_request_id
        );
        self.push_op(
            handler,
            Op::CommandRequest {
                request_id: runtime_request_id,
                entity_id: req.entity_id,
                component_id: req.component_id,
                command_index: req.command_index,
                payload: req.payload,
                caller_worker_id,
                timeout_millis: duration_millis(timeout),
            },
        );
        Ok(())
    }

    pub(super) fn handle_command_response(
        &mut self,
        id: SessionId,
        resp: CommandResponse,
    ) -> Result<()> {
        if let Some(pending) = self.take_command(id, resp.request_id) {
            let op = pending.response(StatusCode::Success, String::new(), Some(resp.payload));
            self.push_op(pending.caller, op);
        }
        Ok(())
    }

    pub(super) fn handle_command_failure(
        &mut self,
        id: SessionId,
        failure: CommandFailure,
    ) -> Result<()> {
        if let Some(pending) = self.take_command(id, failure.request_id) {
            let op = pending.response(StatusCode::ApplicationError, failure.message, None);
            self.push_op(pending.caller, op);
        }
        Ok(())
    }

    /// Removes the pending command, provided it was sent to the responding
    /// worker.
    fn take_command(&mut self, id: SessionId, request_id: RequestId) -> Option<PendingCommand> {
        match self.commands.get(&request_id) {
            Some(pending) if pending.handler == id => self.commands.remove(&request_id),
            Some(_) => {
                warn!(
                    "session {} responded to command {} it wasn't handling",
                    id, request_id
                );
                None
            }
            None => {
                debug!("late response to command {} from session {}", request_id, id);
                None
            }
        }
    }

    /// Responds with a timeout to all the commands past their deadline.
    pub(super) fn expire_commands(&mut self) {
        let now = Instant::now();
        let expired: Vec<RequestId> = self
            .commands
            .iter()
            .filter(|(_, c)| c.deadline <= now)
            .map(|(id, _)| *id)
            .collect();
        for request_id in expired {
            if let Some(pending) = self.commands.remove(&request_id) {
                let op = pending.response(
                    StatusCode::Timeout,
                    "command timed out".to_string(),
                    None,
                );
                self.push_op(pending.caller, op);
            }
        }
    }

    /// Drops commands issued by the session and fails the ones it was
    /// supposed to handle.
    pub(super) fn fail_commands_for(&mut self, id: SessionId) {
        self.commands.retain(|_, c| c.caller != id);
        let lost: Vec<RequestId> = self
            .commands
            .iter()
            .filter(|(_, c)| c.handler == id)
            .map(|(request_id, _)| *request_id)
            .collect();
        for request_id in lost {
            if let Some(pending) = self.commands.remove(&request_id) {
                let op = pending.response(
                    StatusCode::AuthorityLost,
                    "handling worker disconnected".to_string(),
                    None,
                );
                self.push_op(pending.caller, op);
            }
        }
    }
}
