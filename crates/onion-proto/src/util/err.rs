//! Declare an error type for the relay cell engine.

use onion_cell::chancell::DestroyReason;
use thiserror::Error;

/// An error type for the relay cell engine.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum Error {
    /// An error that occurred while decoding or encoding a cell or
    /// message.
    #[error("cell encoding error: {0}")]
    CellErr(#[from] onion_cell::Error),
    /// The authentication information on this cell was completely
    /// wrong, or the cell was corrupted.
    #[error("bad relay cell authentication")]
    BadCellAuth,
    /// We tried to encrypt a message to a hop that wasn't there.
    #[error("tried to encrypt to nonexistent hop")]
    NoSuchHop,
    /// Protocol violation at the circuit level.
    #[error("circuit protocol violation: {0}")]
    CircProto(String),
    /// Protocol violation at the stream level.
    #[error("stream protocol violation: {0}")]
    StreamProto(String),
    /// Circuit is closed, or closing.
    #[error("circuit closed")]
    CircuitClosed,
    /// There was a programming error somewhere in our code, or an
    /// invariant-critical structure was found in an impossible state.
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Return the close reason that a circuit should be torn down with
    /// when this error reaches the top of the receive loop.
    pub fn close_reason(&self) -> DestroyReason {
        match self {
            Error::CellErr(_) | Error::BadCellAuth | Error::CircProto(_) | Error::StreamProto(_) => {
                DestroyReason::PROTOCOL
            }
            Error::CircuitClosed => DestroyReason::NONE,
            _ => DestroyReason::INTERNAL,
        }
    }
}

/// Create an [`Error::Internal`], formatting its arguments.
macro_rules! internal {
    ($($arg:tt)*) => {
        $crate::Error::Internal(format!($($arg)*))
    };
}
pub(crate) use internal;
