//! Message definitions.
//!
//! A [`Message`] is an envelope around a payload struct. The envelope
//! carries the payload type, a task id used for correlating requests with
//! responses, and the payload bytes, optionally compressed.
//!
//! [`Message`]: struct.Message.html

use num_enum::{IntoPrimitive, TryFromPrimitive};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_repr::{Deserialize_repr, Serialize_repr};

use crate::socket::{pack, unpack, Encoding, SocketConfig};
use crate::{Error, Result};

pub mod locator_worker;
pub mod runtime_worker;

pub use locator_worker::*;
pub use runtime_worker::*;

/// Identifier used for matching requests with their responses.
pub type TaskId = u32;

/// Version of the worker protocol, checked during the handshake.
pub const PROTOCOL_VERSION: u32 = 1;

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
pub enum MessageType {
    HandshakeRequest = 1,
    HandshakeResponse = 2,
    LoginRequest = 3,
    LoginResponse = 4,

    ReserveEntityIdsRequest = 10,
    CreateEntityRequest = 11,
    DeleteEntityRequest = 12,
    EntityQueryRequest = 13,
    ComponentUpdateRequest = 14,
    AddComponentRequest = 15,
    RemoveComponentRequest = 16,
    CommandRequest = 17,
    CommandResponse = 18,
    CommandFailure = 19,
    InterestChangeRequest = 20,
    MetricsReport = 21,
    LogMessage = 22,

    OpListDelivery = 30,
    DisconnectNotice = 31,
}

/// Outcome of a connection attempt.
///
/// Numeric values are part of the protocol and are reported to the failure
/// callbacks.
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
pub enum ConnectionStatusCode {
    Success = 1,
    InternalError = 2,
    InvalidArgument = 3,
    NetworkError = 4,
    Timeout = 5,
    Cancelled = 6,
    Rejected = 7,
    PlayerIdentityTokenExpired = 8,
    LoginTokenExpired = 9,
    CapacityExceeded = 10,
    RateExceeded = 11,
    ServerShutdown = 12,
}

impl std::fmt::Display for ConnectionStatusCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?} ({})", self, u8::from(*self))
    }
}

/// Defines a single message, which is a wrapper around a payload.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct Message {
    /// Specifies the type of the payload
    pub type_: MessageType,
    pub task_id: TaskId,
    /// Size of the payload before compression, zero if the payload was not
    /// compressed
    pub uncompressed_size: u32,
    #[serde(with = "serde_bytes")]
    pub payload: Vec<u8>,
}

impl Message {
    /// Creates a complete `Message` from a payload struct, compressing the
    /// payload if it's larger than the configured threshold.
    pub fn from_payload<P>(payload: &P, task_id: TaskId, config: &SocketConfig) -> Result<Self>
    where
        P: Payload + Serialize,
    {
        let bytes = pack(payload, config.encoding)?;
        let (payload_bytes, uncompressed_size) = match config.compress_above {
            #[cfg(feature = "lz4")]
            Some(limit) if bytes.len() > limit => {
                let compressed = lz4::block::compress(&bytes, None, false)?;
                (compressed, bytes.len() as u32)
            }
            _ => (bytes, 0),
        };
        Ok(Message {
            type_: payload.type_(),
            task_id,
            uncompressed_size,
            payload: payload_bytes,
        })
    }

    /// Deserializes from bytes.
    pub fn from_bytes(bytes: &[u8], encoding: Encoding) -> Result<Self> {
        unpack(bytes, encoding)
    }

    /// Serializes into bytes.
    pub fn to_bytes(&self, encoding: Encoding) -> Result<Vec<u8>> {
        pack(self, encoding)
    }

    pub fn is_compressed(&self) -> bool {
        self.uncompressed_size > 0
    }

    /// Unpacks message payload into a payload struct of provided type.
    pub fn unpack_payload<P>(&self, encoding: Encoding) -> Result<P>
    where
        P: Payload + DeserializeOwned,
    {
        if !self.is_compressed() {
            return unpack(&self.payload, encoding);
        }
        #[cfg(feature = "lz4")]
        {
            let decompressed =
                lz4::block::decompress(&self.payload, Some(self.uncompressed_size as i32))?;
            return unpack(&decompressed, encoding);
        }
        #[cfg(not(feature = "lz4"))]
        return Err(Error::CompressionUnavailable);
    }

    /// Unpacks the payload, making sure the message is of the expected
    /// type first.
    pub fn expect_payload<P>(&self, encoding: Encoding, expected: MessageType) -> Result<P>
    where
        P: Payload + DeserializeOwned,
    {
        if self.type_ != expected {
            return Err(Error::UnexpectedMessage {
                expected,
                got: self.type_,
            });
        }
        self.unpack_payload(encoding)
    }
}

/// Implemented by all the structs that can be sent as message payloads.
pub trait Payload {
    fn type_(&self) -> MessageType;
}
