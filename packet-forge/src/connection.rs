//! Per-connection worker: handshake, registration, inbound loop, cleanup.
//!
//! Each accepted socket is driven by exactly one call to [`serve_client`].
//! That call is the only code that registers, touches, or removes the
//! client's registry entry, and the only code that shuts its writer down.

use std::{net::SocketAddr, sync::Arc, time::Duration};

use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    select,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    error::HandshakeError,
    event::{DisconnectReason, EventSink, ServerEvent},
    handshake::perform_handshake,
    id::ClientId,
    registry::{ClientRegistry, SharedWriter, shared_writer},
};

/// Size of the buffer each inbound read fills.
pub const READ_CHUNK_SIZE: usize = 1024;

/// Everything a connection worker shares with the rest of the server.
#[derive(Clone)]
pub struct ConnectionContext {
    pub registry: Arc<ClientRegistry>,
    pub events: EventSink,
    /// Server-wide shutdown token; each connection listens on a child of it.
    pub shutdown: CancellationToken,
    pub handshake_timeout: Option<Duration>,
}

/// Runs one connection from handshake to teardown.
///
/// Returns why a registered client went away, or the handshake error for a
/// connection that never became a client. In the error case the writer has
/// already been shut down and the registry was not modified.
pub async fn serve_client<R, W>(
    mut reader: R,
    writer: W,
    peer: Option<SocketAddr>,
    ctx: &ConnectionContext,
) -> Result<DisconnectReason, HandshakeError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Send + Unpin + 'static,
{
    let cancel = ctx.shutdown.child_token();

    let id = match perform_handshake(&mut reader, &cancel, ctx.handshake_timeout).await {
        Ok(id) => id,
        Err(err) => {
            reject(writer).await;
            return Err(err);
        }
    };

    let writer = shared_writer(writer);
    if let Err(err) = ctx
        .registry
        .register(id, Arc::clone(&writer), peer, cancel.clone())
    {
        shutdown_writer(&writer).await;
        return Err(err.into());
    }

    let guard = ConnectionGuard::new(id, ctx, cancel.clone());
    info!(%id, ?peer, "client connected");
    ctx.events.emit(ServerEvent::Connected { id, peer });

    let reason = read_loop(&mut reader, id, &ctx.registry, &ctx.events, &cancel).await;
    guard.close(reason.clone()).await;

    Ok(reason)
}

/// Reads chunks from a registered client until EOF, error, or cancellation.
///
/// Every non-empty chunk refreshes the client's activity timestamp and is
/// forwarded as [`ServerEvent::Data`]. Chunks are decoded independently, so a
/// multi-byte character split across two reads decodes as replacement
/// characters.
pub async fn read_loop<R>(
    reader: &mut R,
    id: ClientId,
    registry: &ClientRegistry,
    events: &EventSink,
    cancel: &CancellationToken,
) -> DisconnectReason
where
    R: AsyncRead + Unpin,
{
    let mut buffer = [0u8; READ_CHUNK_SIZE];

    loop {
        let read = select! {
            _ = cancel.cancelled() => return DisconnectReason::Cancelled,
            read = reader.read(&mut buffer) => read,
        };

        match read {
            Ok(0) => return DisconnectReason::PeerClosed,
            Ok(n) => {
                registry.touch(id);
                let text = String::from_utf8_lossy(&buffer[..n]).into_owned();
                debug!(%id, bytes = n, %text, "received data from client");
                events.emit(ServerEvent::Data { id, text });
            }
            Err(err) => {
                warn!(%id, error = ?err, "error while reading from client");
                return DisconnectReason::ReadError(err.to_string());
            }
        }
    }
}

async fn reject<W>(mut writer: W)
where
    W: AsyncWrite + Unpin,
{
    if let Err(err) = writer.shutdown().await {
        debug!(error = ?err, "failed to shut down rejected connection");
    }
}

/// Waits for the writer lock, then closes the write half.
///
/// Teardown cancels the connection's token first; broadcast writes select on
/// it and drop the lock, so this wait is bounded.
async fn shutdown_writer(writer: &SharedWriter) {
    let mut writer = writer.lock().await;
    if let Err(err) = writer.shutdown().await {
        debug!(error = ?err, "failed to shut down client writer");
    }
}

/// Removes a registered client exactly once.
///
/// [`ConnectionGuard::close`] is the normal path. If the worker future is
/// dropped before reaching it (runtime shutdown, panic), `Drop` still removes
/// the entry so the registry never keeps a dead client. Either way the
/// connection's token is cancelled, which abandons any broadcast write still
/// in flight to it.
struct ConnectionGuard {
    id: ClientId,
    registry: Arc<ClientRegistry>,
    events: EventSink,
    cancel: CancellationToken,
    closed: bool,
}

impl ConnectionGuard {
    fn new(id: ClientId, ctx: &ConnectionContext, cancel: CancellationToken) -> Self {
        Self {
            id,
            registry: Arc::clone(&ctx.registry),
            events: ctx.events.clone(),
            cancel,
            closed: false,
        }
    }

    async fn close(mut self, reason: DisconnectReason) {
        self.closed = true;
        let Some(entry) = self.registry.remove(self.id) else {
            return;
        };
        self.cancel.cancel();

        shutdown_writer(entry.writer()).await;
        info!(id = %self.id, ?reason, "client disconnected");
        self.events.emit(ServerEvent::Disconnected {
            id: self.id,
            reason,
        });
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        self.cancel.cancel();
        if self.registry.remove(self.id).is_some() {
            warn!(id = %self.id, "connection worker stopped before cleanup; client removed");
            self.events.emit(ServerEvent::Disconnected {
                id: self.id,
                reason: DisconnectReason::Cancelled,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use tokio::{
        io::DuplexStream,
        sync::mpsc,
        task::JoinHandle,
        time::{sleep, timeout},
    };

    use super::*;
    use crate::{broadcast::broadcast_bytes, error::DeliveryError};

    const WAIT: Duration = Duration::from_secs(1);

    fn context() -> (ConnectionContext, mpsc::Receiver<ServerEvent>) {
        let (events, rx) = EventSink::channel(16);
        let ctx = ConnectionContext {
            registry: Arc::new(ClientRegistry::new()),
            events,
            shutdown: CancellationToken::new(),
            handshake_timeout: None,
        };
        (ctx, rx)
    }

    fn spawn_worker(
        ctx: &ConnectionContext,
    ) -> (
        DuplexStream,
        JoinHandle<Result<DisconnectReason, HandshakeError>>,
    ) {
        let (client, server) = tokio::io::duplex(4096);
        let (reader, writer) = tokio::io::split(server);
        let ctx = ctx.clone();
        let task = tokio::spawn(async move { serve_client(reader, writer, None, &ctx).await });
        (client, task)
    }

    async fn next_event(rx: &mut mpsc::Receiver<ServerEvent>) -> ServerEvent {
        timeout(WAIT, rx.recv())
            .await
            .expect("event in time")
            .expect("channel open")
    }

    #[tokio::test]
    async fn full_lifecycle_emits_events_and_cleans_up() {
        let (ctx, mut rx) = context();
        let (mut client, task) = spawn_worker(&ctx);
        let id = ClientId::from_u128(1);

        client.write_all(&id.to_bytes()).await.expect("handshake");
        assert_eq!(
            next_event(&mut rx).await,
            ServerEvent::Connected { id, peer: None }
        );
        assert!(ctx.registry.contains(id));
        let registered_at = ctx.registry.last_activity(id).expect("registered");

        client.write_all(b"Hello, server!").await.expect("payload");
        assert_eq!(
            next_event(&mut rx).await,
            ServerEvent::Data {
                id,
                text: "Hello, server!".into()
            }
        );
        let touched_at = ctx.registry.last_activity(id).expect("still registered");
        assert!(touched_at >= registered_at);

        drop(client);
        let reason = timeout(WAIT, task)
            .await
            .expect("worker finished")
            .expect("worker did not panic")
            .expect("handshake succeeded");
        assert_eq!(reason, DisconnectReason::PeerClosed);
        assert_eq!(
            next_event(&mut rx).await,
            ServerEvent::Disconnected {
                id,
                reason: DisconnectReason::PeerClosed
            }
        );
        assert!(ctx.registry.is_empty());
    }

    #[tokio::test]
    async fn invalid_utf8_is_replaced() {
        let (ctx, mut rx) = context();
        let (mut client, _task) = spawn_worker(&ctx);
        let id = ClientId::from_u128(2);

        client.write_all(&id.to_bytes()).await.expect("handshake");
        next_event(&mut rx).await;
        client.write_all(&[b'o', b'k', 0xff]).await.expect("payload");

        assert_eq!(
            next_event(&mut rx).await,
            ServerEvent::Data {
                id,
                text: "ok\u{fffd}".into()
            }
        );
    }

    #[tokio::test]
    async fn short_handshake_never_registers() {
        let (ctx, mut rx) = context();
        let (mut client, task) = spawn_worker(&ctx);

        client.write_all(&[1u8; 10]).await.expect("partial handshake");
        drop(client);

        let result = timeout(WAIT, task).await.expect("finished").expect("no panic");
        assert!(matches!(result, Err(HandshakeError::Malformed { received: 10 })));
        assert!(ctx.registry.is_empty());
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn duplicate_identifier_is_rejected() {
        let (ctx, mut rx) = context();
        let id = ClientId::from_u128(3);

        let (mut first, _first_task) = spawn_worker(&ctx);
        first.write_all(&id.to_bytes()).await.expect("first handshake");
        next_event(&mut rx).await;
        let connected_at = ctx.registry.connected_at(id);

        let (mut second, second_task) = spawn_worker(&ctx);
        second.write_all(&id.to_bytes()).await.expect("second handshake");
        let result = timeout(WAIT, second_task)
            .await
            .expect("finished")
            .expect("no panic");
        assert!(matches!(result, Err(HandshakeError::DuplicateId(dup)) if dup == id));

        // The rejected socket is shut down: the client sees EOF.
        let mut buf = [0u8; 8];
        let n = timeout(WAIT, second.read(&mut buf))
            .await
            .expect("eof in time")
            .expect("read");
        assert_eq!(n, 0);

        assert_eq!(ctx.registry.len(), 1);
        assert_eq!(ctx.registry.connected_at(id), connected_at);

        first.write_all(b"still here").await.expect("payload");
        assert_eq!(
            next_event(&mut rx).await,
            ServerEvent::Data {
                id,
                text: "still here".into()
            }
        );
    }

    #[tokio::test]
    async fn shutdown_token_ends_read_loop() {
        let (ctx, mut rx) = context();
        let (mut client, task) = spawn_worker(&ctx);
        let id = ClientId::from_u128(4);

        client.write_all(&id.to_bytes()).await.expect("handshake");
        next_event(&mut rx).await;

        ctx.shutdown.cancel();
        let reason = timeout(WAIT, task)
            .await
            .expect("finished")
            .expect("no panic")
            .expect("handshake succeeded");
        assert_eq!(reason, DisconnectReason::Cancelled);
        assert!(ctx.registry.is_empty());
    }

    #[tokio::test]
    async fn signal_disconnect_asks_owner_to_leave() {
        let (ctx, mut rx) = context();
        let (mut client, task) = spawn_worker(&ctx);
        let id = ClientId::from_u128(5);

        client.write_all(&id.to_bytes()).await.expect("handshake");
        next_event(&mut rx).await;

        assert!(ctx.registry.signal_disconnect(id));
        let reason = timeout(WAIT, task)
            .await
            .expect("finished")
            .expect("no panic")
            .expect("handshake succeeded");
        assert_eq!(reason, DisconnectReason::Cancelled);
        assert!(!ctx.shutdown.is_cancelled());
        assert!(!ctx.registry.contains(id));
    }

    #[tokio::test]
    async fn teardown_abandons_blocked_broadcast_and_closes_writer() {
        let (ctx, mut rx) = context();
        let (mut client, task) = spawn_worker(&ctx);
        let id = ClientId::from_u128(6);

        client.write_all(&id.to_bytes()).await.expect("handshake");
        next_event(&mut rx).await;

        // Far more than the duplex buffer, and the client never reads it.
        let payload = vec![b'x'; 64 * 1024];
        let registry = Arc::clone(&ctx.registry);
        let pending = tokio::spawn(async move { broadcast_bytes(&registry, &payload, None).await });
        sleep(Duration::from_millis(50)).await;

        client.shutdown().await.expect("half close");
        let reason = timeout(WAIT, task)
            .await
            .expect("finished")
            .expect("no panic")
            .expect("handshake succeeded");
        assert_eq!(reason, DisconnectReason::PeerClosed);

        let report = timeout(WAIT, pending)
            .await
            .expect("broadcast returned")
            .expect("no panic");
        assert!(matches!(report.failed.as_slice(), [(failed, DeliveryError::Cancelled)] if *failed == id));

        // Whatever was buffered is followed by EOF: the write half is closed.
        let mut received = Vec::new();
        timeout(WAIT, client.read_to_end(&mut received))
            .await
            .expect("eof in time")
            .expect("read");
        assert!(received.len() < 64 * 1024);
    }
}
