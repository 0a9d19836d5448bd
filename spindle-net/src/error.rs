use num_enum::TryFromPrimitiveError;
use thiserror::Error;

use crate::msg::{ConnectionStatusCode, MessageType};
use crate::socket::Encoding;

pub type Result<T> = core::result::Result<T, Error>;

/// Enumeration of errors that may occur during network operations.
#[derive(Error, Debug)]
pub enum Error {
    #[error("would block")]
    WouldBlock,
    #[error("timed out")]
    TimedOut,
    #[error("host unreachable")]
    HostUnreachable,
    #[error("socket not connected")]
    SocketNotConnected,
    #[error("socket not bound to address")]
    SocketNotBoundToAddress,

    #[error("worker connection is not connected")]
    NotConnected,
    #[error("worker connection is already connecting or connected")]
    AlreadyConnecting,
    #[error("connection failed ({0:?}): {1}")]
    ConnectionFailed(ConnectionStatusCode, String),
    #[error("expected message of type {expected:?}, got {got:?}")]
    UnexpectedMessage {
        expected: MessageType,
        got: MessageType,
    },

    #[error("invalid url: {0}")]
    InvalidUrl(String),
    #[error("invalid config: {0}")]
    InvalidConfig(String),
    #[error("encoding unavailable: {0}, enable the matching crate feature")]
    EncodingUnavailable(Encoding),
    #[error("received compressed payload, but lz4 feature is not enabled")]
    CompressionUnavailable,

    #[error("other: {0}")]
    Other(String),

    #[error("failed parsing int: {0}")]
    IntParseError(#[from] std::num::ParseIntError),
    #[error("failed parsing address: {0}")]
    AddrParseError(#[from] std::net::AddrParseError),

    #[error("io error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("bincode error: {0}")]
    BincodeError(#[from] bincode::Error),

    #[cfg(feature = "msgpack_encoding")]
    #[error("rmp_serde decode error: {0}")]
    RmpsDecodeError(#[from] rmp_serde::decode::Error),
    #[cfg(feature = "msgpack_encoding")]
    #[error("rmp_serde encode error: {0}")]
    RmpsEncodeError(#[from] rmp_serde::encode::Error),

    #[cfg(feature = "json_encoding")]
    #[error("serde_json error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("toml deserialization error: {0}")]
    TomlDeserError(#[from] toml::de::Error),

    #[error("unknown connection status code: {0}")]
    UnknownStatusCode(#[from] TryFromPrimitiveError<ConnectionStatusCode>),

    #[error("core error: {0}")]
    CoreError(#[from] spindle_core::Error),
}
