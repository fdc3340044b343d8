//! TCP connection broker with a shared client registry.
//!
//! Peers connect over plain TCP and open with a 16-byte client identifier.
//! After that every chunk they send is surfaced as a
//! [`event::ServerEvent::Data`], and the application can push one serialized
//! message to every connected client with [`server::ServerHandle::broadcast`].
//!
//! - [`id`] is the 128-bit client identifier and its wire byte order.
//! - [`registry`] keeps one entry per connected client in a sharded map.
//! - [`handshake`] reads the opening identifier.
//! - [`connection`] drives one socket from handshake to cleanup.
//! - [`broadcast`] serializes once and writes to every registered client.
//! - [`server`] runs the accept loop, admission limit, and idle sweep.
//! - [`event`] is the channel the broker reports through.
//! - [`cli`], [`client`], and [`message`] back the `packet_forge` binary.
//!
//! Unit tests sit next to each module; `tests/` drives the server over real
//! sockets and the binary end to end.

pub mod broadcast;
pub mod cli;
pub mod client;
pub mod connection;
pub mod error;
pub mod event;
pub mod handshake;
pub mod id;
pub mod message;
pub mod registry;
pub mod server;

pub use error::{BroadcastError, DeliveryError, HandshakeError, RegistryError};
pub use event::{DisconnectReason, EventSink, ServerEvent};
pub use id::ClientId;
pub use server::{Server, ServerConfig, ServerHandle};
