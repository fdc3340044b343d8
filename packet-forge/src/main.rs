use anyhow::Result;
use clap::Parser;
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    sync::mpsc,
};
use tracing::{info, warn};

use packet_forge::{
    DisconnectReason, Server, ServerConfig, ServerEvent, ServerHandle,
    cli::{Cli, Command, ServeArgs},
    client,
    message::ServerMessage,
};

fn init_tracing(default_level: &str) {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    // Logs go to stderr; stdout carries the listening banner and client output.
    let _ = fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli.log_level);

    match cli.command {
        Command::Serve(args) => serve(args).await?,
        Command::Client(args) => client::run(args).await?,
    }

    Ok(())
}

async fn serve(args: ServeArgs) -> Result<()> {
    let (server, events) = Server::bind(ServerConfig::from(&args)).await?;
    let addr = server.local_addr()?;
    let handle = server.handle();
    println!("server listening on {addr}");

    let event_task = tokio::spawn(print_events(events));
    let console_task = tokio::spawn(broadcast_console_lines(handle));

    let result = server.run_until_ctrl_c().await;
    console_task.abort();
    event_task.abort();

    if let Err(err) = &result {
        warn!("server exited with error: {err:?}");
    }
    result
}

async fn print_events(mut events: mpsc::Receiver<ServerEvent>) {
    while let Some(event) = events.recv().await {
        match event {
            ServerEvent::Connected { id, peer } => match peer {
                Some(peer) => println!("*** {id} connected from {peer}"),
                None => println!("*** {id} connected"),
            },
            ServerEvent::Data { id, text } => println!("<{id}> {text}"),
            ServerEvent::Disconnected { id, reason } => match reason {
                DisconnectReason::PeerClosed => println!("*** {id} disconnected"),
                DisconnectReason::ReadError(err) => println!("*** {id} dropped: {err}"),
                DisconnectReason::Cancelled => println!("*** {id} closed by server"),
            },
        }
    }
}

/// Broadcasts each stdin line until stdin closes; the server keeps running.
async fn broadcast_console_lines(handle: ServerHandle) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(err) => {
                warn!(error = ?err, "failed to read stdin");
                break;
            }
        };

        let Some(message) = ServerMessage::from_console_line(&line) else {
            continue;
        };
        match handle.broadcast(&message).await {
            Ok(report) => info!(
                delivered = report.delivered.len(),
                failed = report.failed.len(),
                "broadcast sent"
            ),
            Err(err) => warn!(error = %err, "broadcast failed"),
        }
    }
}
