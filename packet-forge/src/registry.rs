//! Shared map of connected clients.
//!
//! One [`ClientEntry`] per identifier holds everything the rest of the broker
//! needs about a live peer: its write half, its activity timestamp, and the
//! token that asks its worker to stop. Keeping these in a single entry means
//! a client is either fully present or fully absent.
//!
//! Only the worker that registered an entry ever touches or removes it.
//! Other tasks read snapshots ([`ClientRegistry::snapshot`]) or ask the owner
//! to leave ([`ClientRegistry::signal_disconnect`]).

use std::{
    net::SocketAddr,
    sync::Arc,
    time::{Duration, Instant},
};

use dashmap::{DashMap, mapref::entry::Entry};
use tokio::{io::AsyncWrite, sync::Mutex};
use tokio_util::sync::CancellationToken;

use crate::{error::RegistryError, id::ClientId};

pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Write half of a client connection, shared between its worker and broadcasts.
///
/// The mutex keeps two concurrent broadcasts from interleaving bytes on the
/// same socket.
pub type SharedWriter = Arc<Mutex<BoxedWriter>>;

pub fn shared_writer<W>(writer: W) -> SharedWriter
where
    W: AsyncWrite + Send + Unpin + 'static,
{
    Arc::new(Mutex::new(Box::new(writer)))
}

pub struct ClientEntry {
    writer: SharedWriter,
    peer: Option<SocketAddr>,
    connected_at: Instant,
    last_activity: Instant,
    cancel: CancellationToken,
}

impl ClientEntry {
    pub fn writer(&self) -> &SharedWriter {
        &self.writer
    }

    pub fn peer(&self) -> Option<SocketAddr> {
        self.peer
    }

    pub fn connected_at(&self) -> Instant {
        self.connected_at
    }

    pub fn last_activity(&self) -> Instant {
        self.last_activity
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }
}

impl std::fmt::Debug for ClientEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientEntry")
            .field("peer", &self.peer)
            .field("connected_at", &self.connected_at)
            .field("last_activity", &self.last_activity)
            .field("cancelled", &self.cancel.is_cancelled())
            .finish()
    }
}

#[derive(Default)]
pub struct ClientRegistry {
    clients: DashMap<ClientId, ClientEntry>,
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a new entry unless `id` is already present.
    ///
    /// The check and the insert happen under the same shard lock, so two
    /// handshakes racing on one identifier cannot both succeed. A rejected
    /// registration leaves the existing entry untouched.
    pub fn register(
        &self,
        id: ClientId,
        writer: SharedWriter,
        peer: Option<SocketAddr>,
        cancel: CancellationToken,
    ) -> Result<(), RegistryError> {
        match self.clients.entry(id) {
            Entry::Occupied(_) => Err(RegistryError::DuplicateId(id)),
            Entry::Vacant(slot) => {
                let now = Instant::now();
                slot.insert(ClientEntry {
                    writer,
                    peer,
                    connected_at: now,
                    last_activity: now,
                    cancel,
                });
                Ok(())
            }
        }
    }

    /// Records activity for `id`. Returns false if the client is gone.
    pub fn touch(&self, id: ClientId) -> bool {
        match self.clients.get_mut(&id) {
            Some(mut entry) => {
                let now = Instant::now();
                if now > entry.last_activity {
                    entry.last_activity = now;
                }
                true
            }
            None => false,
        }
    }

    /// Removes `id`. Removing an absent id is a no-op returning `None`.
    pub fn remove(&self, id: ClientId) -> Option<ClientEntry> {
        self.clients.remove(&id).map(|(_, entry)| entry)
    }

    pub fn contains(&self, id: ClientId) -> bool {
        self.clients.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    pub fn ids(&self) -> Vec<ClientId> {
        self.clients.iter().map(|entry| *entry.key()).collect()
    }

    pub fn last_activity(&self, id: ClientId) -> Option<Instant> {
        self.clients.get(&id).map(|entry| entry.last_activity)
    }

    pub fn connected_at(&self, id: ClientId) -> Option<Instant> {
        self.clients.get(&id).map(|entry| entry.connected_at)
    }

    pub fn peer(&self, id: ClientId) -> Option<SocketAddr> {
        self.clients.get(&id).and_then(|entry| entry.peer)
    }

    /// Point-in-time copy of every registered writer with its owner's token.
    ///
    /// No shard lock is held once this returns, so writing to the snapshot
    /// never blocks registration or removal. The token belongs to the
    /// connection that was registered when the snapshot was taken, so
    /// cancelling it can never reach a later connection reusing the id.
    pub fn snapshot(&self) -> Vec<(ClientId, SharedWriter, CancellationToken)> {
        self.clients
            .iter()
            .map(|entry| {
                (
                    *entry.key(),
                    Arc::clone(&entry.writer),
                    entry.cancel.clone(),
                )
            })
            .collect()
    }

    /// Clients whose last activity is at least `idle_for` ago, with the
    /// token of the connection that went idle.
    pub fn idle_clients(&self, idle_for: Duration) -> Vec<(ClientId, CancellationToken)> {
        self.clients
            .iter()
            .filter(|entry| entry.last_activity.elapsed() >= idle_for)
            .map(|entry| (*entry.key(), entry.cancel.clone()))
            .collect()
    }

    /// Asks the worker owning `id` to close its connection.
    ///
    /// The entry itself stays until that worker removes it.
    pub fn signal_disconnect(&self, id: ClientId) -> bool {
        match self.clients.get(&id) {
            Some(entry) => {
                entry.cancel.cancel();
                true
            }
            None => false,
        }
    }
}
