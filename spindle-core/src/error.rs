//! Error types.

use num_enum::TryFromPrimitiveError;

use crate::op::{OpType, StatusCode};
use crate::{ComponentId, EntityId};

pub type Result<T> = core::result::Result<T, Error>;

/// Crate-wide error type.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("invalid entity id: {0}")]
    InvalidEntityId(EntityId),
    #[error("entity already exists: {0}")]
    EntityAlreadyExists(EntityId),
    #[error("entity id was not reserved: {0}")]
    EntityIdNotReserved(EntityId),
    #[error("failed getting entity with id: {0}")]
    NoSuchEntity(EntityId),
    #[error("entity {0} has no component {1}")]
    NoSuchComponent(EntityId, ComponentId),
    #[error("entity {0} already has component {1}")]
    ComponentAlreadyPresent(EntityId, ComponentId),
    #[error("component {0} listed more than once")]
    DuplicateComponent(ComponentId),
    #[error("invalid entity id reservation: {0}")]
    InvalidReservation(String),

    #[error("unknown op type: {0}")]
    UnknownOpType(#[from] TryFromPrimitiveError<OpType>),
    #[error("unknown status code: {0}")]
    UnknownStatusCode(#[from] TryFromPrimitiveError<StatusCode>),

    #[error("other error: {0}")]
    Other(String),
}

impl Error {
    /// Status code reported back to a worker whose request failed with
    /// this error.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Error::NoSuchEntity(_) | Error::NoSuchComponent(..) => StatusCode::NotFound,
            Error::Other(_) => StatusCode::InternalError,
            _ => StatusCode::ApplicationError,
        }
    }
}
