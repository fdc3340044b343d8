use std::net::SocketAddr;

use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::id::ClientId;

/// Notifications the broker raises for whoever consumes its event channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerEvent {
    Connected {
        id: ClientId,
        peer: Option<SocketAddr>,
    },
    /// One non-empty read from a client, decoded as UTF-8.
    ///
    /// A read is an opaque chunk: one event does not correspond to one
    /// message the peer wrote.
    Data { id: ClientId, text: String },
    Disconnected {
        id: ClientId,
        reason: DisconnectReason,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectReason {
    /// The peer closed its side (zero-byte read).
    PeerClosed,
    ReadError(String),
    /// Server shutdown or an eviction request from the liveness sweep.
    Cancelled,
}

/// Sending side of the event channel.
///
/// Events are offered with `try_send`: when the consumer falls behind and the
/// channel is full, the event is dropped and a warning logged, so a slow
/// consumer never stalls a connection's read loop.
#[derive(Clone)]
pub struct EventSink {
    tx: mpsc::Sender<ServerEvent>,
}

impl EventSink {
    pub fn new(tx: mpsc::Sender<ServerEvent>) -> Self {
        Self { tx }
    }

    /// Creates a sink together with the receiver it feeds.
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<ServerEvent>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self::new(tx), rx)
    }

    /// Returns true if the event was queued.
    pub fn emit(&self, event: ServerEvent) -> bool {
        match self.tx.try_send(event) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(event)) => {
                warn!(?event, "event channel full; dropping event");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!("event receiver dropped; event discarded");
                false
            }
        }
    }
}
