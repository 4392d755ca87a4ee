//! Memcached text protocol engine.
//!
//! Implements the subset served over TCP:
//! - Storage: set, add
//! - Retrieval: get, gets
//! - Deletion: delete
//! - Other: ping, quit
//!
//! [`Request`] is an incremental, byte-at-a-time parser that also executes
//! the finished command against a [`Store`](crate::store::Store). It owns no
//! I/O; the connection layer feeds it whatever chunks the socket delivers.

mod request;
mod response;

pub use request::{Request, State};
pub use response::Response;

use thiserror::Error;

/// Protocol parsing errors, reported to clients as `CLIENT_ERROR <msg>`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("unsupported command: {0}")]
    UnknownCommand(String),

    #[error("invalid key")]
    InvalidKey,

    #[error("invalid {field}: {value}")]
    InvalidNumber { field: &'static str, value: String },

    #[error("unexpected token: {0}")]
    UnexpectedToken(String),

    #[error("bad command line format")]
    MissingArguments,

    #[error("bad data chunk")]
    BadDataChunk,

    #[error("request size exceeded max bytes")]
    SizeExceeded,

    /// The response was requested before the command was complete.
    #[error("request not fully parsed")]
    NotFinished,
}
