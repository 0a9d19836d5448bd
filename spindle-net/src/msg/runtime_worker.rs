//! Messages exchanged between workers and the runtime.

use spindle_core::{
    ComponentData, ComponentId, ComponentUpdate, EntityId, EntityQuery, Fields, Interest,
    LogLevel, Metrics, OpList, RequestId,
};

use crate::config::WorkerRole;
use crate::msg::{ConnectionStatusCode, MessageType, Payload};

/// First message sent by a worker after establishing the transport-level
/// connection.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct HandshakeRequest {
    pub worker_id: String,
    pub worker_type: String,
    pub role: WorkerRole,
    pub use_external_ip: bool,
    pub protocol_version: u32,
}
impl Payload for HandshakeRequest {
    fn type_(&self) -> MessageType {
        MessageType::HandshakeRequest
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct HandshakeResponse {
    pub code: ConnectionStatusCode,
    pub message: String,
    /// Runtime-assigned session id, valid only if the handshake succeeded
    pub session_id: u32,
    /// Address other parties should use to reach the runtime
    pub bridge_address: String,
}
impl HandshakeResponse {
    pub fn accepted(&self) -> bool {
        self.code == ConnectionStatusCode::Success
    }
}
impl Payload for HandshakeResponse {
    fn type_(&self) -> MessageType {
        MessageType::HandshakeResponse
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ReserveEntityIdsRequest {
    pub count: u32,
    pub timeout_millis: u32,
}
impl Payload for ReserveEntityIdsRequest {
    fn type_(&self) -> MessageType {
        MessageType::ReserveEntityIdsRequest
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CreateEntityRequest {
    /// Previously reserved id, if `None` the runtime picks a fresh one
    pub entity_id: Option<EntityId>,
    pub components: Vec<ComponentData>,
    pub timeout_millis: u32,
}
impl Payload for CreateEntityRequest {
    fn type_(&self) -> MessageType {
        MessageType::CreateEntityRequest
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DeleteEntityRequest {
    pub entity_id: EntityId,
    pub timeout_millis: u32,
}
impl Payload for DeleteEntityRequest {
    fn type_(&self) -> MessageType {
        MessageType::DeleteEntityRequest
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EntityQueryRequest {
    pub query: EntityQuery,
    pub timeout_millis: u32,
}
impl Payload for EntityQueryRequest {
    fn type_(&self) -> MessageType {
        MessageType::EntityQueryRequest
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ComponentUpdateRequest {
    pub entity_id: EntityId,
    pub update: ComponentUpdate,
}
impl Payload for ComponentUpdateRequest {
    fn type_(&self) -> MessageType {
        MessageType::ComponentUpdateRequest
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AddComponentRequest {
    pub entity_id: EntityId,
    pub data: ComponentData,
}
impl Payload for AddComponentRequest {
    fn type_(&self) -> MessageType {
        MessageType::AddComponentRequest
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RemoveComponentRequest {
    pub entity_id: EntityId,
    pub component_id: ComponentId,
}
impl Payload for RemoveComponentRequest {
    fn type_(&self) -> MessageType {
        MessageType::RemoveComponentRequest
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CommandRequest {
    pub entity_id: EntityId,
    pub component_id: ComponentId,
    pub command_index: u32,
    pub payload: Fields,
    pub timeout_millis: u32,
}
impl Payload for CommandRequest {
    fn type_(&self) -> MessageType {
        MessageType::CommandRequest
    }
}

/// Sent by the worker handling a command back to the runtime.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CommandResponse {
    /// Id found in the received `CommandRequest` op
    pub request_id: RequestId,
    pub payload: Fields,
}
impl Payload for CommandResponse {
    fn type_(&self) -> MessageType {
        MessageType::CommandResponse
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CommandFailure {
    pub request_id: RequestId,
    pub message: String,
}
impl Payload for CommandFailure {
    fn type_(&self) -> MessageType {
        MessageType::CommandFailure
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct InterestChangeRequest {
    /// Entity the interest applies to, `None` sets the worker's default
    pub entity_id: Option<EntityId>,
    pub interest: Interest,
}
impl Payload for InterestChangeRequest {
    fn type_(&self) -> MessageType {
        MessageType::InterestChangeRequest
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MetricsReport {
    pub metrics: Metrics,
    /// Unix timestamp in milliseconds
    pub timestamp: i64,
}
impl Payload for MetricsReport {
    fn type_(&self) -> MessageType {
        MessageType::MetricsReport
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LogMessage {
    pub level: LogLevel,
    pub logger_name: String,
    pub message: String,
    pub entity_id: Option<EntityId>,
    /// Unix timestamp in milliseconds
    pub timestamp: i64,
}
impl Payload for LogMessage {
    fn type_(&self) -> MessageType {
        MessageType::LogMessage
    }
}

/// Batch of ops produced by the runtime for a single worker.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OpListDelivery {
    pub op_list: OpList,
}
impl Payload for OpListDelivery {
    fn type_(&self) -> MessageType {
        MessageType::OpListDelivery
    }
}

/// Sent by the runtime right before it closes a worker's connection.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DisconnectNotice {
    pub code: ConnectionStatusCode,
    pub reason: String,
}
impl Payload for DisconnectNotice {
    fn type_(&self) -> MessageType {
        MessageType::DisconnectNotice
    }
}
