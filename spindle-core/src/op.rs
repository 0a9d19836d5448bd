//! Operation definitions.
//!
//! Everything a worker learns from the runtime arrives as an [`Op`]. Ops are
//! grouped into [`OpList`] batches, each batch being the product of a single
//! runtime dispatch for a given worker. Order of ops within a list is
//! significant, for example an `AddEntity` op always precedes the
//! `AddComponent` ops for that entity.
//!
//! [`Op`]: enum.Op.html
//! [`OpList`]: struct.OpList.html

use std::collections::BTreeMap;
use std::convert::TryFrom;

use num_enum::{IntoPrimitive, TryFromPrimitive};
use serde_repr::{Deserialize_repr, Serialize_repr};

use crate::component::{ComponentData, ComponentId, ComponentUpdate, Fields};
use crate::EntityId;

/// Per-connection request identifier, echoed back in response ops.
pub type RequestId = u32;

/// Numeric tag identifying the kind of an operation.
#[derive(
    Debug,
    Copy,
    Clone,
    PartialEq,
    Eq,
    Hash,
    Serialize_repr,
    Deserialize_repr,
    TryFromPrimitive,
    IntoPrimitive,
)]
#[repr(u8)]
pub enum OpType {
    Disconnect = 1,
    FlagUpdate = 2,
    LogMessage = 3,
    Metrics = 4,
    CriticalSection = 5,
    AddEntity = 6,
    RemoveEntity = 7,
    ReserveEntityIdsResponse = 8,
    CreateEntityResponse = 9,
    DeleteEntityResponse = 10,
    EntityQueryResponse = 11,
    AddComponent = 12,
    RemoveComponent = 13,
    AuthorityChange = 14,
    ComponentUpdate = 15,
    CommandRequest = 16,
    CommandResponse = 17,
}

impl OpType {
    /// Parses an op type from either its numeric tag or its name.
    pub fn parse(s: &str) -> crate::Result<Self> {
        if let Ok(num) = s.parse::<u8>() {
            return Ok(OpType::try_from(num)?);
        }
        let normalized = s.to_lowercase().replace(|c: char| c == '_' || c == '-', "");
        let op_type = match normalized.as_str() {
            "disconnect" => OpType::Disconnect,
            "flagupdate" | "flag" => OpType::FlagUpdate,
            "logmessage" | "log" => OpType::LogMessage,
            "metrics" => OpType::Metrics,
            "criticalsection" => OpType::CriticalSection,
            "addentity" => OpType::AddEntity,
            "removeentity" => OpType::RemoveEntity,
            "reserveentityidsresponse" | "reserve" => OpType::ReserveEntityIdsResponse,
            "createentityresponse" | "create" => OpType::CreateEntityResponse,
            "deleteentityresponse" | "delete" => OpType::DeleteEntityResponse,
            "entityqueryresponse" | "query" => OpType::EntityQueryResponse,
            "addcomponent" => OpType::AddComponent,
            "removecomponent" => OpType::RemoveComponent,
            "authoritychange" | "authority" => OpType::AuthorityChange,
            "componentupdate" | "update" => OpType::ComponentUpdate,
            "commandrequest" => OpType::CommandRequest,
            "commandresponse" => OpType::CommandResponse,
            _ => return Err(crate::Error::Other(format!("unknown op type: {}", s))),
        };
        Ok(op_type)
    }
}

/// Result of a request, as reported by the runtime.
#[derive(
    Debug,
    Copy,
    Clone,
    PartialEq,
    Eq,
    Hash,
    Serialize_repr,
    Deserialize_repr,
    TryFromPrimitive,
    IntoPrimitive,
)]
#[repr(u8)]
pub enum StatusCode {
    Success = 1,
    Timeout = 2,
    NotFound = 3,
    AuthorityLost = 4,
    PermissionDenied = 5,
    ApplicationError = 6,
    InternalError = 7,
}

impl StatusCode {
    pub fn is_success(&self) -> bool {
        *self == StatusCode::Success
    }
}

#[derive(
    Debug,
    Copy,
    Clone,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Serialize_repr,
    Deserialize_repr,
    TryFromPrimitive,
    IntoPrimitive,
)]
#[repr(u8)]
pub enum LogLevel {
    Debug = 1,
    Info = 2,
    Warn = 3,
    Error = 4,
    Fatal = 5,
}

impl LogLevel {
    /// Maps onto the closest `log` crate level.
    pub fn as_log_level(&self) -> log::Level {
        match self {
            LogLevel::Debug => log::Level::Debug,
            LogLevel::Info => log::Level::Info,
            LogLevel::Warn => log::Level::Warn,
            LogLevel::Error | LogLevel::Fatal => log::Level::Error,
        }
    }
}

/// Set of gauge readings reported by a worker or the runtime.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Metrics {
    /// Optional load figure, used for load reporting
    pub load: Option<f64>,
    pub gauges: BTreeMap<String, f64>,
}

impl Metrics {
    pub fn with_gauge(mut self, name: &str, value: f64) -> Self {
        self.gauges.insert(name.to_string(), value);
        self
    }

    /// Overwrites gauges present in `other`, keeping all the others.
    pub fn merge(&mut self, other: Metrics) {
        if other.load.is_some() {
            self.load = other.load;
        }
        self.gauges.extend(other.gauges);
    }
}

/// Single operation delivered to a worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Op {
    Disconnect {
        code: u8,
        reason: String,
    },
    FlagUpdate {
        name: String,
        /// `None` signals the flag was removed
        value: Option<String>,
    },
    LogMessage {
        level: LogLevel,
        message: String,
    },
    Metrics {
        metrics: Metrics,
    },
    CriticalSection {
        in_critical_section: bool,
    },
    AddEntity {
        entity_id: EntityId,
    },
    RemoveEntity {
        entity_id: EntityId,
    },
    ReserveEntityIdsResponse {
        request_id: RequestId,
        status_code: StatusCode,
        message: String,
        first_entity_id: EntityId,
        number_of_entity_ids: u32,
    },
    CreateEntityResponse {
        request_id: RequestId,
        status_code: StatusCode,
        message: String,
        entity_id: EntityId,
    },
    DeleteEntityResponse {
        request_id: RequestId,
        status_code: StatusCode,
        message: String,
        entity_id: EntityId,
    },
    EntityQueryResponse {
        request_id: RequestId,
        status_code: StatusCode,
        message: String,
        result_count: u32,
        results: Vec<(EntityId, Vec<ComponentData>)>,
    },
    AddComponent {
        entity_id: EntityId,
        data: ComponentData,
    },
    RemoveComponent {
        entity_id: EntityId,
        component_id: ComponentId,
    },
    AuthorityChange {
        entity_id: EntityId,
        component_id: ComponentId,
        authoritative: bool,
    },
    ComponentUpdate {
        entity_id: EntityId,
        update: ComponentUpdate,
    },
    CommandRequest {
        request_id: RequestId,
        entity_id: EntityId,
        component_id: ComponentId,
        command_index: u32,
        payload: Fields,
        caller_worker_id: String,
        timeout_millis: u32,
    },
    CommandResponse {
        request_id: RequestId,
        status_code: StatusCode,
        message: String,
        entity_id: EntityId,
        component_id: ComponentId,
        command_index: u32,
        payload: Option<Fields>,
    },
}

impl Op {
    pub fn op_type(&self) -> OpType {
        match self {
            Op::Disconnect { .. } => OpType::Disconnect,
            Op::FlagUpdate { .. } => OpType::FlagUpdate,
            Op::LogMessage { .. } => OpType::LogMessage,
            Op::Metrics { .. } => OpType::Metrics,
            Op::CriticalSection { .. } => OpType::CriticalSection,
            Op::AddEntity { .. } => OpType::AddEntity,
            Op::RemoveEntity { .. } => OpType::RemoveEntity,
            Op::ReserveEntityIdsResponse { .. } => OpType::ReserveEntityIdsResponse,
            Op::CreateEntityResponse { .. } => OpType::CreateEntityResponse,
            Op::DeleteEntityResponse { .. } => OpType::DeleteEntityResponse,
            Op::EntityQueryResponse { .. } => OpType::EntityQueryResponse,
            Op::AddComponent { .. } => OpType::AddComponent,
            Op::RemoveComponent { .. } => OpType::RemoveComponent,
            Op::AuthorityChange { .. } => OpType::AuthorityChange,
            Op::ComponentUpdate { .. } => OpType::ComponentUpdate,
            Op::CommandRequest { .. } => OpType::CommandRequest,
            Op::CommandResponse { .. } => OpType::CommandResponse,
        }
    }

    /// Request id this op answers, if it's a response (or an incoming
    /// command request).
    pub fn request_id(&self) -> Option<RequestId> {
        match self {
            Op::ReserveEntityIdsResponse { request_id, .. }
            | Op::CreateEntityResponse { request_id, .. }
            | Op::DeleteEntityResponse { request_id, .. }
            | Op::EntityQueryResponse { request_id, .. }
            | Op::CommandRequest { request_id, .. }
            | Op::CommandResponse { request_id, .. } => Some(*request_id),
            _ => None,
        }
    }

    pub fn status_code(&self) -> Option<StatusCode> {
        match self {
            Op::ReserveEntityIdsResponse { status_code, .. }
            | Op::CreateEntityResponse { status_code, .. }
            | Op::DeleteEntityResponse { status_code, .. }
            | Op::EntityQueryResponse { status_code, .. }
            | Op::CommandResponse { status_code, .. } => Some(*status_code),
            _ => None,
        }
    }

    pub fn entity_id(&self) -> Option<EntityId> {
        match self {
            Op::AddEntity { entity_id }
            | Op::RemoveEntity { entity_id }
            | Op::CreateEntityResponse { entity_id, .. }
            | Op::DeleteEntityResponse { entity_id, .. }
            | Op::AddComponent { entity_id, .. }
            | Op::RemoveComponent { entity_id, .. }
            | Op::AuthorityChange { entity_id, .. }
            | Op::ComponentUpdate { entity_id, .. }
            | Op::CommandRequest { entity_id, .. }
            | Op::CommandResponse { entity_id, .. } => Some(*entity_id),
            _ => None,
        }
    }
}

/// Ordered batch of operations.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OpList {
    ops: Vec<Op>,
}

impl OpList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_ops(ops: Vec<Op>) -> Self {
        Self { ops }
    }

    pub fn push(&mut self, op: Op) {
        self.ops.push(op);
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn ops(&self) -> &[Op] {
        &self.ops
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Op> {
        self.ops.iter()
    }

    /// Returns the first op of the given type.
    pub fn find(&self, op_type: OpType) -> Option<&Op> {
        self.ops.iter().find(|op| op.op_type() == op_type)
    }

    pub fn contains(&self, op_type: OpType) -> bool {
        self.find(op_type).is_some()
    }

    /// Returns the response op answering the given request.
    pub fn response_to(&self, request_id: RequestId) -> Option<&Op> {
        self.ops
            .iter()
            .find(|op| op.request_id() == Some(request_id) && op.status_code().is_some())
    }
}

impl IntoIterator for OpList {
    type Item = Op;
    type IntoIter = std::vec::IntoIter<Op>;
    fn into_iter(self) -> Self::IntoIter {
        self.ops.into_iter()
    }
}

impl<'a> IntoIterator for &'a OpList {
    type Item = &'a Op;
    type IntoIter = std::slice::Iter<'a, Op>;
    fn into_iter(self) -> Self::IntoIter {
        self.ops.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn op_type_tags_are_stable() {
        assert_eq!(u8::from(OpType::ReserveEntityIdsResponse), 8);
        assert_eq!(u8::from(OpType::CreateEntityResponse), 9);
        assert_eq!(u8::from(OpType::DeleteEntityResponse), 10);
        assert_eq!(OpType::try_from(17u8).unwrap(), OpType::CommandResponse);
        assert!(OpType::try_from(0u8).is_err());
    }

    #[test]
    fn op_type_parses_from_names_and_tags() {
        assert_eq!(
            OpType::parse("reserve_entity_ids_response").unwrap(),
            OpType::ReserveEntityIdsResponse
        );
        assert_eq!(OpType::parse("9").unwrap(), OpType::CreateEntityResponse);
        assert_eq!(OpType::parse("Delete").unwrap(), OpType::DeleteEntityResponse);
        assert!(OpType::parse("teleport").is_err());
    }

    #[test]
    fn response_lookup_ignores_incoming_command_requests() {
        let list = OpList::from_ops(vec![
            Op::CommandRequest {
                request_id: 4,
                entity_id: 1,
                component_id: 2,
                command_index: 0,
                payload: Fields::new(),
                caller_worker_id: "client0".to_string(),
                timeout_millis: 1000,
            },
            Op::DeleteEntityResponse {
                request_id: 4,
                status_code: StatusCode::Success,
                message: String::new(),
                entity_id: 1,
            },
        ]);
        assert_eq!(
            list.response_to(4).map(|op| op.op_type()),
            Some(OpType::DeleteEntityResponse)
        );
        assert!(list.contains(OpType::CommandRequest));
        assert!(!list.contains(OpType::AddEntity));
    }

    #[test]
    fn op_list_survives_bincode() {
        let list = OpList::from_ops(vec![
            Op::AddEntity { entity_id: 3 },
            Op::AddComponent {
                entity_id: 3,
                data: ComponentData::new(54).with_field("x", 1.0),
            },
        ]);
        let bytes = bincode::serialize(&list).unwrap();
        let decoded: OpList = bincode::deserialize(&bytes).unwrap();
        assert_eq!(decoded, list);
    }
}
