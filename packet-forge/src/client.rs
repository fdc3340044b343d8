use std::time::Duration;

use anyhow::{Context, Result};
use tokio::{
    io::{self, AsyncReadExt, AsyncWriteExt},
    net::{
        TcpStream,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
    select,
    time::{MissedTickBehavior, interval},
};
use tracing::{info, warn};

use crate::{cli::ClientArgs, connection::READ_CHUNK_SIZE, id::ClientId};

/// Connects, identifies, then sends `args.message` every `args.interval_ms`
/// while printing whatever the broker broadcasts.
pub async fn run(args: ClientArgs) -> Result<()> {
    let id = args.id.unwrap_or_else(ClientId::random);
    let (mut reader, mut writer) = establish_connection(&args).await?;
    send_handshake(&mut writer, id).await?;
    write_stdout(&format!("*** connected as {id}")).await?;

    run_client_loop(&mut reader, &mut writer, &args).await?;
    shutdown_connection(&mut writer).await;

    Ok(())
}

async fn establish_connection(args: &ClientArgs) -> Result<(OwnedReadHalf, OwnedWriteHalf)> {
    let stream = TcpStream::connect(args.server)
        .await
        .with_context(|| format!("failed to connect to {}", args.server))?;

    info!("connected to {}", args.server);
    Ok(stream.into_split())
}

async fn send_handshake(writer: &mut OwnedWriteHalf, id: ClientId) -> Result<()> {
    writer
        .write_all(&id.to_bytes())
        .await
        .context("failed to send client id")?;
    Ok(())
}

async fn run_client_loop(
    reader: &mut OwnedReadHalf,
    writer: &mut OwnedWriteHalf,
    args: &ClientArgs,
) -> Result<()> {
    let mut heartbeat = interval(Duration::from_millis(args.interval_ms.max(1)));
    heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick fires immediately; the first heartbeat waits one period.
    heartbeat.tick().await;

    let mut buffer = [0u8; READ_CHUNK_SIZE];
    loop {
        select! {
            read = reader.read(&mut buffer) => {
                if !handle_server_bytes(read, &buffer).await? {
                    break;
                }
            }
            _ = heartbeat.tick() => {
                writer
                    .write_all(args.message.as_bytes())
                    .await
                    .context("failed to send heartbeat")?;
            }
            ctrl_c = tokio::signal::ctrl_c() => {
                handle_ctrl_c(ctrl_c);
                break;
            }
        }
    }
    Ok(())
}

async fn handle_server_bytes(read: io::Result<usize>, buffer: &[u8]) -> Result<bool> {
    match read? {
        0 => {
            write_stdout("*** server closed the connection").await?;
            Ok(false)
        }
        n => {
            write_stdout(&String::from_utf8_lossy(&buffer[..n])).await?;
            Ok(true)
        }
    }
}

fn handle_ctrl_c(result: io::Result<()>) {
    if let Err(error) = result {
        warn!(?error, "ctrl-c handler failed");
    }
}

async fn shutdown_connection(writer: &mut OwnedWriteHalf) {
    if let Err(error) = writer.shutdown().await {
        warn!(?error, "failed to shutdown client writer cleanly");
    }
}

async fn write_stdout(line: &str) -> io::Result<()> {
    let mut stdout = tokio::io::stdout();
    stdout.write_all(line.as_bytes()).await?;
    stdout.write_all(b"\n").await?;
    stdout.flush().await
}
