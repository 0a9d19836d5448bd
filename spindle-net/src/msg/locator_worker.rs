//! Messages exchanged between workers and the locator service.

use crate::msg::{ConnectionStatusCode, MessageType, Payload};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LoginRequest {
    pub player_identity_token: String,
    pub login_token: String,
    pub worker_type: String,
    /// Name of the deployment to join, `None` picks the first one available
    pub deployment: Option<String>,
}
impl Payload for LoginRequest {
    fn type_(&self) -> MessageType {
        MessageType::LoginRequest
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LoginResponse {
    pub code: ConnectionStatusCode,
    pub message: String,
    pub deployment: String,
    /// Receptionist address of the resolved deployment
    pub receptionist_addr: String,
}
impl Payload for LoginResponse {
    fn type_(&self) -> MessageType {
        MessageType::LoginResponse
    }
}
