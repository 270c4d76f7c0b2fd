//! Error taxonomy for the replication engine.
//!
//! Mirrors the error handling design in spec §7: lifecycle and argument
//! errors are local and never touch the socket, server errors propagate
//! as-is (with `query_canceled` rewritten to normal stream end by the
//! caller, not here), and protocol/IO errors are fatal to the connection.

use thiserror::Error;

/// sqlstate for a server-side `query_canceled` condition.
pub const SQLSTATE_QUERY_CANCELED: &str = "57014";

#[derive(Error, Debug)]
pub enum Error {
    /// An operation was attempted in a state that forbids it (spec §6.3).
    #[error("invalid state: expected {expected}, operation not permitted")]
    InvalidState { expected: &'static str },

    /// A requested feature needs a newer server than the one connected to.
    #[error("{feature} requires server >= {min_version}, connected server is {actual_version}")]
    Unsupported {
        feature: &'static str,
        min_version: &'static str,
        actual_version: String,
    },

    /// The wire protocol was violated (unexpected message code, malformed
    /// tuple tag, short frame, bad pgoutput message type). Fatal.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// A server-reported error (`ErrorResponse`), propagated verbatim.
    #[error("server error [{sqlstate}]: {message}")]
    Server {
        sqlstate: String,
        message: String,
        detail: Option<String>,
    },

    /// LSN or server-version text failed to parse.
    #[error("format error in {kind} at byte {index}")]
    FormatError { kind: &'static str, index: usize },

    /// A caller-supplied argument is invalid.
    #[error("invalid argument {param}: {reason}")]
    InvalidArgument { param: &'static str, reason: String },

    /// Transport-level IO failure. Fatal to the connection.
    #[error("io error")]
    Io(#[from] std::io::Error),

    /// Failure while establishing the underlying connection.
    #[error("connect error: {0}")]
    Connect(#[from] tokio_postgres::Error),

    /// The operation was cancelled outside of a streaming context (spec §7
    /// rule 7: cancellation during streaming is normal end-of-stream and is
    /// not represented by this variant).
    #[error("operation cancelled")]
    Cancelled,
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn protocol<S: Into<String>>(message: S) -> Self {
        Self::Protocol(message.into())
    }

    pub fn invalid_argument<S: Into<String>>(param: &'static str, reason: S) -> Self {
        Self::InvalidArgument {
            param,
            reason: reason.into(),
        }
    }

    pub fn format(kind: &'static str, index: usize) -> Self {
        Self::FormatError { kind, index }
    }

    /// True for a server error carrying the `query_canceled` sqlstate.
    pub fn is_query_canceled(&self) -> bool {
        matches!(self, Self::Server { sqlstate, .. } if sqlstate == SQLSTATE_QUERY_CANCELED)
    }
}
