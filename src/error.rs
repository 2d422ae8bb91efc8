//! Error taxonomy shared by the client, the queue and the thermostat handles.
use crate::{protocol as proto, queue::TransactionError};

/// Represents all possible errors of a thermostat operation.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Reading from or writing to the serial line failed. The connection is
    /// closed, since the line needs attention before it can work again.
    #[error("Transport error: {0}")]
    Transport(#[source] std::io::Error),

    /// The transport could not be opened.
    #[error("Cannot open transport: {0}")]
    Connect(#[source] std::io::Error),

    /// The device did not answer properly, even after retrying.
    #[error(transparent)]
    Transaction(#[from] TransactionError),

    /// Wraps `proto::Error`: a value out of range or a reply that makes no sense.
    #[error(transparent)]
    Protocol(#[from] proto::Error),

    #[error("Client is not connected")]
    NotConnected,

    /// The client was closed while the operation was waiting.
    #[error("Operation cancelled, the client was closed")]
    Cancelled,
}

impl From<proto::RangeError> for Error {
    fn from(err: proto::RangeError) -> Self {
        Error::Protocol(err.into())
    }
}

impl From<proto::DecodeError> for Error {
    fn from(err: proto::DecodeError) -> Self {
        Error::Protocol(err.into())
    }
}

/// The result type for thermostat operations.
pub type Result<T> = std::result::Result<T, Error>;
