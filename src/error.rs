//! Error types for the client.
//!
//! The crate uses a single error enum. It is `Clone` because a session-level
//! failure is delivered to every pending submission as well as to the
//! session's terminal signal; I/O causes are shared through `Arc` to keep
//! that cheap.

use std::collections::HashMap;
use std::io;
use std::sync::Arc;

use thiserror::Error;

/// Result type for client operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur during client operations.
#[derive(Debug, Clone, Error)]
pub enum Error {
    /// I/O error during communication.
    #[error("i/o error: {0}")]
    Io(Arc<io::Error>),

    /// Protocol error (unexpected message, invalid format, etc.).
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Authentication failed.
    #[error("authentication failed: {0}")]
    Auth(String),

    /// The server returned an error response.
    #[error("{0}")]
    Server(ServerError),

    /// Value conversion failed.
    #[error("decode error: {0}")]
    Decode(String),

    /// The physical connection is closed or in an invalid state.
    #[error("connection is closed")]
    ConnectionClosed,

    /// A submission was made to a session that is no longer accepting work.
    #[error("session is no longer active")]
    SessionNotActive,

    /// The session terminated before this submission could run.
    #[error("session has already completed")]
    SessionClosed,

    /// The transaction entered the failed state and took the session down.
    #[error("transaction failed; session closed")]
    TransactionFailed,

    /// The server became unreachable; the physical connection was closed.
    #[error("postgresql unavailable")]
    Unavailable(#[source] Box<Error>),

    /// A user-supplied copy source failed mid-stream.
    #[error("copy source failed: {0}")]
    CopySource(String),
}

impl Error {
    /// Whether this error means the physical connection can no longer be
    /// trusted. The session runner closes the connection for these instead
    /// of releasing it back to the pool.
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            Error::Io(_) | Error::Protocol(_) | Error::ConnectionClosed | Error::Unavailable(_)
        )
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Io(Arc::new(e))
    }
}

/// An error or notice reported by the server, parsed from the tagged fields
/// of an ErrorResponse or NoticeResponse message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerError {
    pub severity: String,
    pub code: String,
    pub message: String,
    pub detail: Option<String>,
    pub hint: Option<String>,
}

impl ServerError {
    /// Build from the raw field map of an ErrorResponse / NoticeResponse.
    pub fn from_fields(fields: &HashMap<u8, String>) -> Self {
        Self {
            severity: fields.get(&b'S').cloned().unwrap_or_default(),
            code: fields.get(&b'C').cloned().unwrap_or_default(),
            message: fields.get(&b'M').cloned().unwrap_or_default(),
            detail: fields.get(&b'D').cloned(),
            hint: fields.get(&b'H').cloned(),
        }
    }
}

impl std::fmt::Display for ServerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {} ({})", self.severity, self.message, self.code)?;
        if let Some(d) = &self.detail {
            write!(f, "\ndetail: {}", d)?;
        }
        if let Some(h) = &self.hint {
            write!(f, "\nhint: {}", h)?;
        }
        Ok(())
    }
}
