//! Error types for the broker.
//!
//! Per-connection errors never leave the connection's own task; they end up
//! in the log and in [`crate::event::ServerEvent::Disconnected`]. Only
//! [`BroadcastError`] is returned to a caller.

use std::io;

use thiserror::Error;

use crate::id::ClientId;

/// Why a freshly accepted connection did not become a registered client.
#[derive(Error, Debug)]
pub enum HandshakeError {
    /// The peer closed the stream before sending a full identifier.
    #[error("malformed handshake: received {received} of 16 identifier bytes")]
    Malformed { received: usize },

    /// Another live connection already uses this identifier.
    #[error("client {0} is already connected")]
    DuplicateId(ClientId),

    #[error("handshake timed out")]
    TimedOut,

    #[error("server shutting down")]
    Cancelled,

    #[error("handshake read failed: {0}")]
    Io(#[from] io::Error),
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum RegistryError {
    #[error("client {0} is already registered")]
    DuplicateId(ClientId),
}

impl From<RegistryError> for HandshakeError {
    fn from(err: RegistryError) -> Self {
        match err {
            RegistryError::DuplicateId(id) => HandshakeError::DuplicateId(id),
        }
    }
}

#[derive(Error, Debug)]
pub enum BroadcastError {
    #[error("failed to serialize broadcast message: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Failure to deliver a broadcast to a single client.
#[derive(Error, Debug)]
pub enum DeliveryError {
    #[error("write failed: {0}")]
    Io(#[from] io::Error),

    #[error("write timed out")]
    TimedOut,

    /// The client was torn down or the server stopped while the write was pending.
    #[error("client disconnected before the write finished")]
    Cancelled,
}
