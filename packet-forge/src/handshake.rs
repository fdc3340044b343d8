use std::time::Duration;

use tokio::{
    io::{AsyncRead, AsyncReadExt},
    select,
};
use tokio_util::sync::CancellationToken;

use crate::{
    error::HandshakeError,
    id::{CLIENT_ID_LEN, ClientId},
};

/// Reads the 16-byte identifier that opens every connection.
///
/// The identifier may arrive split over several reads. EOF before the 16th
/// byte is a malformed handshake carrying the number of bytes seen.
pub async fn read_client_id<R>(reader: &mut R) -> Result<ClientId, HandshakeError>
where
    R: AsyncRead + Unpin,
{
    let mut bytes = [0u8; CLIENT_ID_LEN];
    let mut received = 0;

    while received < CLIENT_ID_LEN {
        let n = reader.read(&mut bytes[received..]).await?;
        if n == 0 {
            return Err(HandshakeError::Malformed { received });
        }
        received += n;
    }

    Ok(ClientId::from_bytes(bytes))
}

/// [`read_client_id`], abandoned when `cancel` fires or `timeout` elapses.
pub async fn perform_handshake<R>(
    reader: &mut R,
    cancel: &CancellationToken,
    timeout: Option<Duration>,
) -> Result<ClientId, HandshakeError>
where
    R: AsyncRead + Unpin,
{
    let read = async {
        match timeout {
            Some(limit) => match tokio::time::timeout(limit, read_client_id(reader)).await {
                Ok(result) => result,
                Err(_) => Err(HandshakeError::TimedOut),
            },
            None => read_client_id(reader).await,
        }
    };

    select! {
        _ = cancel.cancelled() => Err(HandshakeError::Cancelled),
        result = read => result,
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::AsyncWriteExt;

    use super::*;

    #[tokio::test]
    async fn reads_identifier_split_across_writes() {
        let (mut client, mut server) = tokio::io::duplex(64);
        let id = ClientId::from_u128(0xdead_beef);
        let bytes = id.to_bytes();

        client.write_all(&bytes[..5]).await.expect("first half");
        client.write_all(&bytes[5..]).await.expect("second half");

        let parsed = read_client_id(&mut server).await.expect("handshake");
        assert_eq!(parsed, id);
    }

    #[tokio::test]
    async fn leaves_trailing_bytes_unread() {
        let (mut client, mut server) = tokio::io::duplex(64);
        let id = ClientId::from_u128(5);
        client.write_all(&id.to_bytes()).await.expect("id");
        client.write_all(b"hello").await.expect("payload");
        drop(client);

        assert_eq!(read_client_id(&mut server).await.expect("handshake"), id);
        let mut rest = String::new();
        server.read_to_string(&mut rest).await.expect("payload");
        assert_eq!(rest, "hello");
    }

    #[tokio::test]
    async fn short_handshake_is_malformed() {
        let (mut client, mut server) = tokio::io::duplex(64);
        client.write_all(&[7u8; 10]).await.expect("partial id");
        drop(client);

        let err = read_client_id(&mut server).await.expect_err("too short");
        assert!(matches!(err, HandshakeError::Malformed { received: 10 }));
    }

    #[tokio::test]
    async fn immediate_close_is_malformed_with_zero_bytes() {
        let (client, mut server) = tokio::io::duplex(64);
        drop(client);

        let err = read_client_id(&mut server).await.expect_err("no bytes");
        assert!(matches!(err, HandshakeError::Malformed { received: 0 }));
    }

    #[tokio::test]
    async fn cancellation_interrupts_waiting_handshake() {
        let (_client, mut server) = tokio::io::duplex(64);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = perform_handshake(&mut server, &cancel, None)
            .await
            .expect_err("cancelled");
        assert!(matches!(err, HandshakeError::Cancelled));
    }

    #[tokio::test]
    async fn silent_peer_times_out() {
        let (_client, mut server) = tokio::io::duplex(64);
        let cancel = CancellationToken::new();

        let err = perform_handshake(&mut server, &cancel, Some(Duration::from_millis(20)))
            .await
            .expect_err("timed out");
        assert!(matches!(err, HandshakeError::TimedOut));
    }
}
