//! Serialize-once fan-out to every registered client.

use std::time::Duration;

use futures::future::join_all;
use serde::Serialize;
use tokio::{io::AsyncWriteExt, select, time::timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{
    error::{BroadcastError, DeliveryError},
    id::ClientId,
    registry::{ClientRegistry, SharedWriter},
};

/// Outcome of one broadcast, per client in the registry snapshot.
#[derive(Debug, Default)]
pub struct BroadcastReport {
    pub delivered: Vec<ClientId>,
    pub failed: Vec<(ClientId, DeliveryError)>,
}

impl BroadcastReport {
    pub fn attempted(&self) -> usize {
        self.delivered.len() + self.failed.len()
    }

    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Encodes `message` as JSON and writes the bytes to every registered client.
///
/// The bytes are written as-is with no delimiter or length prefix.
pub async fn broadcast<T>(
    registry: &ClientRegistry,
    message: &T,
    write_timeout: Option<Duration>,
) -> Result<BroadcastReport, BroadcastError>
where
    T: Serialize + ?Sized,
{
    let bytes = serde_json::to_vec(message)?;
    Ok(broadcast_bytes(registry, &bytes, write_timeout).await)
}

/// Writes `bytes` to every client present in a snapshot of the registry.
///
/// Writes run concurrently and each has its own error boundary: a failed or
/// timed-out client is recorded in the report and asked to disconnect, and
/// delivery to everyone else proceeds. A write still pending when its client
/// is torn down (or the server stops) is abandoned as
/// [`DeliveryError::Cancelled`]. Clients that register after the snapshot is
/// taken do not receive this broadcast.
pub async fn broadcast_bytes(
    registry: &ClientRegistry,
    bytes: &[u8],
    write_timeout: Option<Duration>,
) -> BroadcastReport {
    let targets = registry.snapshot();
    debug!(clients = targets.len(), bytes = bytes.len(), "broadcasting");

    let deliveries = targets.into_iter().map(|(id, writer, cancel)| async move {
        let result = deliver(&writer, &cancel, bytes, write_timeout).await;
        if let Err(err) = &result {
            report_failure(id, &cancel, err);
        }
        (id, result)
    });

    let mut report = BroadcastReport::default();
    for (id, result) in join_all(deliveries).await {
        match result {
            Ok(()) => report.delivered.push(id),
            Err(err) => report.failed.push((id, err)),
        }
    }

    report
}

fn report_failure(id: ClientId, cancel: &CancellationToken, err: &DeliveryError) {
    match err {
        DeliveryError::Cancelled => debug!(%id, "client left during broadcast"),
        other => {
            warn!(%id, error = %other, "failed to deliver broadcast to client");
            // Only the connection that was snapshotted is asked to leave.
            cancel.cancel();
        }
    }
}

async fn deliver(
    writer: &SharedWriter,
    cancel: &CancellationToken,
    bytes: &[u8],
    write_timeout: Option<Duration>,
) -> Result<(), DeliveryError> {
    let write = async {
        let mut writer = writer.lock().await;
        writer.write_all(bytes).await?;
        writer.flush().await
    };
    let write = async {
        match write_timeout {
            Some(limit) => match timeout(limit, write).await {
                Ok(result) => result.map_err(DeliveryError::from),
                Err(_) => Err(DeliveryError::TimedOut),
            },
            None => write.await.map_err(DeliveryError::from),
        }
    };

    select! {
        _ = cancel.cancelled() => Err(DeliveryError::Cancelled),
        result = write => result,
    }
}
