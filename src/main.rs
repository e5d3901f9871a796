//! chat-relay - command line front end
//!
//! `serve` runs the relay: received messages are printed, and lines typed
//! on stdin are broadcast to every peer. `connect` runs a line-based client.

use anyhow::{Context, Result};
use chat_relay::{ClientEvent, Event, RelayBuilder, RelayClient, RelayConfig};
use clap::{Parser, Subcommand};
use std::io::BufRead;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{info, warn};

/// Text broadcast relay
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the relay server
    Serve {
        /// Address to listen on (overrides the config file)
        #[arg(short, long)]
        bind: Option<SocketAddr>,

        /// JSON configuration file
        #[arg(short, long)]
        config: Option<PathBuf>,
    },

    /// Connect to a relay and chat from the terminal
    ///
    /// Exits on end of input, Ctrl-C, or when the relay closes the connection.
    Connect {
        /// Relay address
        #[arg(short, long, default_value = "127.0.0.1:5000")]
        server: SocketAddr,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let log_level = if args.debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                tracing_subscriber::EnvFilter::new(format!("chat_relay={}", log_level))
            }),
        )
        .with_target(false)
        .init();

    match args.command {
        Command::Serve { bind, config } => serve(bind, config).await,
        Command::Connect { server } => connect(server).await,
    }
}

/// Lines typed on stdin
///
/// Read on a detached thread: a read pending at exit must not hold up
/// runtime shutdown.
fn stdin_lines() -> mpsc::UnboundedReceiver<String> {
    let (tx, rx) = mpsc::unbounded_channel();
    std::thread::spawn(move || {
        for line in std::io::stdin().lock().lines() {
            let Ok(line) = line else { break };
            if tx.send(line).is_err() {
                break;
            }
        }
    });
    rx
}

async fn serve(bind: Option<SocketAddr>, config_path: Option<PathBuf>) -> Result<()> {
    let mut config = match config_path {
        Some(path) => RelayConfig::load_from_file(&path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None => RelayConfig::default(),
    };
    if let Some(bind) = bind {
        config.listen_addr = bind;
    }

    let relay = Arc::new(
        RelayBuilder::new()
            .with_config(config)
            .build()
            .context("Invalid relay configuration")?,
    );

    // Local display
    relay.on_event(|event| {
        if let Event::MessageReceived { peer_addr, .. } = &event {
            if let Some(text) = event.message_text() {
                println!("[{}] {}", peer_addr, text.trim_end());
            }
        }
    });

    let addr = relay.start().await.context("Failed to start relay")?;
    println!("Relay listening on {}", addr);

    // Local input
    let input_relay = Arc::clone(&relay);
    let mut lines = stdin_lines();
    let input = tokio::spawn(async move {
        while let Some(line) = lines.recv().await {
            if line.trim().is_empty() {
                continue;
            }
            match input_relay.send_local(line.as_bytes()).await {
                Ok(report) => info!(
                    delivered = report.delivered,
                    failed = report.failed,
                    "local message sent"
                ),
                Err(e) => {
                    warn!(error = %e, "local message not sent");
                    break;
                },
            }
        }
    });

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;

    input.abort();
    relay.stop().await.context("Failed to stop relay")?;

    Ok(())
}

async fn connect(server: SocketAddr) -> Result<()> {
    let client = Arc::new(
        RelayClient::connect(server)
            .await
            .with_context(|| format!("Failed to connect to {}", server))?,
    );
    println!("Connected to {}", server);

    let receiver = Arc::clone(&client);
    let mut receive = tokio::spawn(async move {
        while let Some(event) = receiver.next_event().await {
            match event {
                ClientEvent::Received { .. } => {
                    if let Some(text) = event.text() {
                        println!("Server: {}", text.trim_end());
                    }
                },
                ClientEvent::Disconnected => {
                    println!("Disconnected.");
                    break;
                },
            }
        }
    });

    let mut lines = stdin_lines();
    let mut receive_finished = false;
    loop {
        tokio::select! {
            line = lines.recv() => match line {
                Some(line) => match client.send(&line).await {
                    Ok(()) => println!("Me: {}", line),
                    Err(chat_relay::RelayError::Network(chat_relay::NetworkError::EmptyMessage)) => {},
                    Err(e) => {
                        println!("Send failed: {}", e);
                        break;
                    },
                },
                None => break,
            },
            _ = &mut receive => {
                receive_finished = true;
                break;
            },
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    client.disconnect().await;
    if !receive_finished {
        let _ = receive.await;
    }

    Ok(())
}
