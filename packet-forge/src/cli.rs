use std::{net::SocketAddr, time::Duration};

use clap::{Args, Parser, Subcommand};

use crate::{id::ClientId, server::ServerConfig};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Default log filter when RUST_LOG is not set.
    #[arg(long, global = true, default_value = "info")]
    pub log_level: String,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the broker, accepting TCP clients and broadcasting stdin lines to them.
    Serve(ServeArgs),
    /// Connect as a client that sends a heartbeat and prints broadcasts.
    Client(ClientArgs),
}

#[derive(Args, Debug, Clone)]
pub struct ServeArgs {
    /// Socket address to bind. Use port 0 for an ephemeral port.
    #[arg(long, default_value = "0.0.0.0:5000")]
    pub listen: SocketAddr,

    /// Maximum number of connections served at once.
    #[arg(long)]
    pub max_connections: Option<usize>,

    /// Drop connections that do not send their 16-byte id within this many seconds.
    #[arg(long)]
    pub handshake_timeout_secs: Option<u64>,

    /// Give up on a broadcast write to one client after this many seconds.
    #[arg(long)]
    pub write_timeout_secs: Option<u64>,

    /// Disconnect clients that stay silent for this many seconds.
    #[arg(long)]
    pub idle_timeout_secs: Option<u64>,

    /// Capacity of the internal event queue.
    #[arg(long, default_value_t = 1024)]
    pub event_capacity: usize,
}

impl From<&ServeArgs> for ServerConfig {
    fn from(args: &ServeArgs) -> Self {
        ServerConfig {
            listen: args.listen,
            event_capacity: args.event_capacity,
            max_connections: args.max_connections,
            handshake_timeout: args.handshake_timeout_secs.map(Duration::from_secs),
            write_timeout: args.write_timeout_secs.map(Duration::from_secs),
            idle_timeout: args.idle_timeout_secs.map(Duration::from_secs),
            sweep_interval: None,
        }
    }
}

#[derive(Args, Debug, Clone)]
pub struct ClientArgs {
    /// Address of the broker to connect to.
    #[arg(long, default_value = "127.0.0.1:5000")]
    pub server: SocketAddr,

    /// Client id to present; a random one is generated when omitted.
    #[arg(long)]
    pub id: Option<ClientId>,

    /// Text sent on every heartbeat.
    #[arg(long, default_value = "Hello, server!")]
    pub message: String,

    /// Milliseconds between heartbeats.
    #[arg(long, default_value_t = 1000)]
    pub interval_ms: u64,
}
