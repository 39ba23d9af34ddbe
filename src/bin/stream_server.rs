//! Stream transport server CLI.
//!
//! Listens for handshake/session-create/session-start traffic on one
//! carrier and relays application packets across its negotiated
//! channels (§4.4-§4.6).

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Result};
use clap::Parser;
use log::info;

use streamcarrier::{HttpTransport, SessionStore, StreamConfig, TransportKind, UdpTransport, WebSocketTransport};

#[derive(Parser)]
#[command(name = "stream-server")]
#[command(author = "Sina Rabbani")]
#[command(version = concat!(env!("CARGO_PKG_VERSION"), " (", env!("GIT_HASH"), ", built ", env!("BUILD_DATE"), ")"))]
#[command(about = "Pluggable encrypted stream-transport server", long_about = None)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Bind address
    #[arg(short, long, default_value = "0.0.0.0:8443")]
    bind: String,

    /// Carrier to listen on: http, websocket, or udp
    #[arg(short, long, default_value = "http")]
    transport: String,

    /// Single-packet symmetric-key capacity advertised to clients
    #[arg(long, default_value_t = 60_000)]
    capacity: usize,

    /// Enable verbose logging (-v info, -vv debug, -vvv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn init_logger(verbose: u8) {
    let level = match verbose {
        0 => log::LevelFilter::Warn,
        1 => log::LevelFilter::Info,
        2 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };
    env_logger::Builder::from_default_env()
        .filter_level(level)
        .format_timestamp_millis()
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logger(cli.verbose);

    let config = match &cli.config {
        Some(path) => StreamConfig::from_file(path)?,
        None => StreamConfig::default(),
    };
    config.validate().map_err(anyhow::Error::msg)?;

    let sessions = Arc::new(SessionStore::new());

    info!(
        "starting stream server on {} (transport={}, preferred_encryption={})",
        cli.bind, cli.transport, config.stream.preferred_encryption
    );

    match TransportKind::parse(&cli.transport) {
        TransportKind::Http => {
            let transport = HttpTransport::server(sessions, cli.capacity);
            transport.listen(&cli.bind).await?;
        }
        TransportKind::WebSocket => {
            let transport = WebSocketTransport::server("/stream", sessions, cli.capacity);
            transport.listen(&cli.bind).await?;
        }
        TransportKind::Udp => {
            let transport = UdpTransport::server(sessions, cli.capacity, config.stream_udp.max_packet_size as usize);
            transport.listen(&cli.bind).await?;
        }
        TransportKind::Tls | TransportKind::Dns => {
            bail!("transport '{}' has no server adapter in this build", cli.transport);
        }
    }

    Ok(())
}
