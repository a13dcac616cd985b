//! Gatenet Client - Entry Point
//!
//! Dials a gatenet server, sends messages and prints whatever comes back.

use anyhow::{Context, Result};
use bytes::Bytes;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::info;

use gatenet::transport::{MessageType, QuicTransport};
use gatenet::{Client, Config, Conn, VERSION};

/// Gatenet Client - talk to a gatenet server
#[derive(Parser)]
#[command(name = "gatenet-client")]
#[command(version = VERSION)]
#[command(about = "Dial a gatenet server and exchange messages")]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "client-config.toml")]
    config: PathBuf,

    /// Server address, overrides `client.server_addr`
    #[arg(short, long)]
    addr: Option<String>,

    /// Skip certificate verification
    #[arg(long)]
    insecure: bool,

    /// Seconds to wait for each reply
    #[arg(long, default_value_t = 5)]
    timeout: u64,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Send messages and print the replies
    Send {
        /// Messages to send, one packet each
        #[arg(required = true)]
        messages: Vec<String>,
        /// Send as text instead of binary
        #[arg(long)]
        text: bool,
    },
    /// Measure round trips against an echo server
    Ping {
        #[arg(short = 'n', long, default_value_t = 4)]
        count: u32,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = if cli.config.exists() {
        Config::load(&cli.config)
            .with_context(|| format!("Failed to load config from {:?}", cli.config))?
    } else {
        Config::default()
    };
    if let Some(addr) = &cli.addr {
        config.client.server_addr = addr.clone();
    }
    if cli.insecure {
        config.tls.client.insecure = true;
    }

    gatenet::util::init_tracing(&config.logging)?;

    let options = config
        .client_options()
        .context("Invalid client options")?;
    let transport = Arc::new(QuicTransport::new(config.tls.clone()));
    let mut client = Client::with_transport(Arc::new(options), transport);

    let (reply_tx, mut replies) = mpsc::unbounded_channel();
    client.on_receive(move |_conn, payload, msg_type| {
        let _ = reply_tx.send((payload, msg_type));
    });
    client.on_disconnect(|conn| {
        info!(conn_id = conn.id(), "Disconnected");
    });

    info!(server = %config.client.server_addr, "Connecting");
    let conn = client
        .dial()
        .await
        .with_context(|| format!("Failed to connect to {}", config.client.server_addr))?;

    let timeout = Duration::from_secs(cli.timeout);
    match cli.command {
        Commands::Send { messages, text } => {
            for message in messages {
                send(&conn, Bytes::from(message), text).await?;
                let (payload, msg_type) = recv(&mut replies, timeout).await?;
                print_reply(&payload, msg_type);
            }
        }
        Commands::Ping { count } => {
            for seq in 0..count {
                let started = Instant::now();
                send(&conn, Bytes::from(format!("ping {seq}")), false).await?;
                let (payload, _) = recv(&mut replies, timeout).await?;
                println!(
                    "{} bytes from {}: seq={} time={:.2}ms",
                    payload.len(),
                    config.client.server_addr,
                    seq,
                    started.elapsed().as_secs_f64() * 1000.0
                );
            }
        }
    }

    conn.close()?;
    Ok(())
}

async fn send(conn: &Conn, payload: Bytes, text: bool) -> Result<()> {
    if text {
        conn.push_text(payload).await?;
    } else {
        conn.push(payload).await?;
    }
    Ok(())
}

async fn recv(
    replies: &mut mpsc::UnboundedReceiver<(Bytes, MessageType)>,
    timeout: Duration,
) -> Result<(Bytes, MessageType)> {
    tokio::time::timeout(timeout, replies.recv())
        .await
        .context("Timed out waiting for reply")?
        .context("Connection closed before reply")
}

fn print_reply(payload: &Bytes, msg_type: MessageType) {
    match msg_type {
        MessageType::Text => println!("< {}", String::from_utf8_lossy(payload)),
        MessageType::Binary => println!("< {:02x?}", payload.as_ref()),
    }
}
