use std::{
    future::Future,
    net::{Ipv4Addr, SocketAddr},
    sync::Arc,
    time::Duration,
};

use anyhow::{Context, Result};
use serde::Serialize;
use tokio::{
    net::{TcpListener, TcpStream},
    select,
    sync::{OwnedSemaphorePermit, Semaphore, mpsc},
    task::JoinSet,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    broadcast::{self, BroadcastReport},
    connection::{ConnectionContext, serve_client},
    error::{BroadcastError, HandshakeError},
    event::{EventSink, ServerEvent},
    registry::ClientRegistry,
};

pub const DEFAULT_PORT: u16 = 5000;

/// Tunables for a [`Server`].
///
/// Every timeout is off unless set; the broker never invents a deadline of
/// its own.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub listen: SocketAddr,
    /// Capacity of the event channel returned by [`Server::bind`].
    pub event_capacity: usize,
    /// Upper bound on concurrently served connections.
    pub max_connections: Option<usize>,
    pub handshake_timeout: Option<Duration>,
    /// Per-client deadline for a single broadcast write.
    pub write_timeout: Option<Duration>,
    /// Clients silent for this long are asked to disconnect.
    pub idle_timeout: Option<Duration>,
    /// How often idle clients are looked for. Defaults to half of `idle_timeout`.
    pub sweep_interval: Option<Duration>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from((Ipv4Addr::LOCALHOST, DEFAULT_PORT)),
            event_capacity: 1024,
            max_connections: None,
            handshake_timeout: None,
            write_timeout: None,
            idle_timeout: None,
            sweep_interval: None,
        }
    }
}

impl ServerConfig {
    fn effective_sweep_interval(&self) -> Option<Duration> {
        let idle_timeout = self.idle_timeout?;
        let interval = self.sweep_interval.unwrap_or(idle_timeout / 2);
        Some(interval.max(Duration::from_millis(10)))
    }
}

pub struct Server {
    listener: TcpListener,
    config: ServerConfig,
    state: Arc<ServerState>,
}

struct ServerState {
    registry: Arc<ClientRegistry>,
    events: EventSink,
    shutdown: CancellationToken,
    admission: Option<Arc<Semaphore>>,
}

impl Server {
    /// Binds `config.listen` and returns the server with its event receiver.
    pub async fn bind(config: ServerConfig) -> Result<(Self, mpsc::Receiver<ServerEvent>)> {
        let listener = TcpListener::bind(config.listen)
            .await
            .with_context(|| format!("failed to bind {}", config.listen))?;
        let (events, rx) = EventSink::channel(config.event_capacity);
        Ok((Self::new(listener, config, events), rx))
    }

    pub fn new(listener: TcpListener, config: ServerConfig, events: EventSink) -> Self {
        let admission = config
            .max_connections
            .map(|limit| Arc::new(Semaphore::new(limit.max(1))));
        Self {
            listener,
            config,
            state: Arc::new(ServerState {
                registry: Arc::new(ClientRegistry::new()),
                events,
                shutdown: CancellationToken::new(),
                admission,
            }),
        }
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn handle(&self) -> ServerHandle {
        ServerHandle {
            state: Arc::clone(&self.state),
            write_timeout: self.config.write_timeout,
        }
    }

    /// Accepts connections until `cancel` (or [`ServerHandle::stop`]) fires.
    pub async fn run(self, cancel: CancellationToken) -> Result<()> {
        self.run_until(async move { cancel.cancelled().await }).await
    }

    /// Accepts connections until `shutdown` resolves or [`ServerHandle::stop`]
    /// is called.
    ///
    /// Each connection runs on its own task. After shutdown the listener is
    /// closed and the call waits for the connection tasks, which exit at their
    /// next read because they observe the same shutdown.
    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        let Server {
            listener,
            config,
            state,
        } = self;
        let stopped = state.shutdown.clone();
        let ctx = ConnectionContext {
            registry: Arc::clone(&state.registry),
            events: state.events.clone(),
            shutdown: stopped.clone(),
            handshake_timeout: config.handshake_timeout,
        };

        if let (Some(idle_timeout), Some(interval)) =
            (config.idle_timeout, config.effective_sweep_interval())
        {
            spawn_idle_sweep(&state, idle_timeout, interval);
        }

        tokio::pin!(shutdown);
        let mut workers = JoinSet::new();
        loop {
            let permit = select! {
                _ = &mut shutdown => break,
                _ = stopped.cancelled() => break,
                permit = acquire_admission(&state) => permit,
            };

            select! {
                _ = &mut shutdown => break,
                _ = stopped.cancelled() => break,
                accept_result = listener.accept() => {
                    handle_accept_result(accept_result, &ctx, permit, &mut workers);
                }
                Some(joined) = workers.join_next(), if !workers.is_empty() => {
                    log_worker_exit(joined);
                }
            }
        }

        info!("server shutting down");
        stopped.cancel();
        drop(listener);

        while let Some(joined) = workers.join_next().await {
            log_worker_exit(joined);
        }
        debug!("all connection workers finished");

        Ok(())
    }

    pub async fn run_until_ctrl_c(self) -> Result<()> {
        self.run_until(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!(error = ?err, "failed to install ctrl-c handler");
            }
        })
        .await
    }
}

async fn acquire_admission(state: &ServerState) -> Option<OwnedSemaphorePermit> {
    let semaphore = state.admission.as_ref()?;
    // The semaphore is never closed, so acquisition only fails if that changes.
    Arc::clone(semaphore).acquire_owned().await.ok()
}

fn handle_accept_result(
    result: std::io::Result<(TcpStream, SocketAddr)>,
    ctx: &ConnectionContext,
    permit: Option<OwnedSemaphorePermit>,
    workers: &mut JoinSet<()>,
) {
    match result {
        Ok((stream, peer)) => spawn_client_handler(stream, peer, ctx, permit, workers),
        Err(err) => warn!(error = ?err, "failed to accept connection"),
    }
}

fn spawn_client_handler(
    stream: TcpStream,
    peer: SocketAddr,
    ctx: &ConnectionContext,
    permit: Option<OwnedSemaphorePermit>,
    workers: &mut JoinSet<()>,
) {
    let ctx = ctx.clone();
    workers.spawn(async move {
        let _permit = permit;
        debug!(%peer, "accepted connection");
        let (reader, writer) = stream.into_split();
        if let Err(err) = serve_client(reader, writer, Some(peer), &ctx).await {
            log_rejection(peer, &err);
        }
    });
}

fn log_rejection(peer: SocketAddr, err: &HandshakeError) {
    match err {
        HandshakeError::Cancelled => debug!(%peer, "handshake abandoned during shutdown"),
        HandshakeError::DuplicateId(id) => {
            warn!(%peer, %id, "rejected connection with duplicate client id")
        }
        other => warn!(%peer, error = %other, "rejected connection"),
    }
}

fn log_worker_exit(joined: Result<(), tokio::task::JoinError>) {
    if let Err(err) = joined {
        warn!(error = ?err, "connection worker panicked");
    }
}

fn spawn_idle_sweep(state: &Arc<ServerState>, idle_timeout: Duration, interval: Duration) {
    let registry = Arc::clone(&state.registry);
    let shutdown = state.shutdown.clone();

    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    sweep_idle_clients(&registry, idle_timeout);
                }
            }
        }
    });
}

/// Asks every client idle for at least `idle_timeout` to disconnect.
///
/// Returns how many clients were signalled. Their own workers remove them.
pub fn sweep_idle_clients(registry: &ClientRegistry, idle_timeout: Duration) -> usize {
    let idle = registry.idle_clients(idle_timeout);
    for (id, cancel) in &idle {
        info!(%id, ?idle_timeout, "disconnecting idle client");
        cancel.cancel();
    }
    idle.len()
}

/// Cloneable control surface for a running [`Server`].
#[derive(Clone)]
pub struct ServerHandle {
    state: Arc<ServerState>,
    write_timeout: Option<Duration>,
}

impl ServerHandle {
    /// Stops accepting and closes every connection at its next read.
    ///
    /// Broadcast writes still pending to those connections are abandoned.
    pub fn stop(&self) {
        self.state.shutdown.cancel();
    }

    pub fn is_stopped(&self) -> bool {
        self.state.shutdown.is_cancelled()
    }

    pub async fn broadcast<T>(&self, message: &T) -> Result<BroadcastReport, BroadcastError>
    where
        T: Serialize + ?Sized,
    {
        broadcast::broadcast(&self.state.registry, message, self.write_timeout).await
    }

    pub fn client_count(&self) -> usize {
        self.state.registry.len()
    }

    pub fn registry(&self) -> &Arc<ClientRegistry> {
        &self.state.registry
    }
}
