//! Error types for courier.
//!
//! Failures fall into two groups: connection-fatal ones (`MalformedFrame`,
//! `ConnectionClosed`, `Io`) that end a session, and per-operation ones that
//! are answered with an ERROR frame while the connection carries on.

use std::io;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    /// The byte stream does not hold a valid frame. Connection-fatal.
    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    /// A transfer broke its ordering, identity or size rules. Transfer-fatal.
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    /// The store collaborator failed or is unavailable.
    #[error("storage failure: {0}")]
    Storage(String),

    #[error("transfer {transfer_id} timed out after {attempts} attempt(s)")]
    TransferTimeout { transfer_id: String, attempts: u32 },

    /// The local payload could not be read.
    #[error("transfer payload unreadable: {0}")]
    TransferIo(#[source] io::Error),

    /// The payload failed local validation before anything was sent.
    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    /// The request was refused; on the client, the body of an ERROR reply.
    #[error("rejected: {0}")]
    Rejected(String),

    #[error("not logged in")]
    Unauthorized,

    #[error("not found: {0}")]
    NotFound(String),

    #[error("connection closed")]
    ConnectionClosed,

    #[error("configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Whether the session must stop reading from the connection.
    pub fn is_connection_fatal(&self) -> bool {
        matches!(
            self,
            Error::MalformedFrame(_) | Error::ConnectionClosed | Error::Io(_)
        )
    }

    /// Whether a client transfer attempt should be retried after this error.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::TransferTimeout { .. } | Error::TransferIo(_) | Error::Io(_)
        )
    }
}
