//! Stream transport client CLI.
//!
//! Drives a [`StageClient`] from `BEGIN` to `STREAM_STREAMING` against a
//! configured remote, over whichever carrier the fallback order settles
//! on (§4.3, §8 scenario 6).

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use log::info;

use streamcarrier::{
    HttpTransport, SocketKind, Stage, StageClient, StreamConfig, TransportCapabilities, TransportDescriptor,
    TransportKind, TransportRegistry, UdpTransport, WebSocketTransport,
};

#[derive(Parser)]
#[command(name = "stream-client")]
#[command(author = "Sina Rabbani")]
#[command(version = concat!(env!("CARGO_PKG_VERSION"), " (", env!("GIT_HASH"), ", built ", env!("BUILD_DATE"), ")"))]
#[command(about = "Pluggable encrypted stream-transport client", long_about = None)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Remote address (host:port) to stage toward
    #[arg(short, long)]
    remote: String,

    /// Active channel ids to request, e.g. "A,B"
    #[arg(long, default_value = "A")]
    channels: String,

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

async fn build_registry(fallback_order: &[TransportKind], remote: &str) -> TransportRegistry {
    let registry = TransportRegistry::new();
    for kind in fallback_order {
        let descriptor = match kind {
            TransportKind::Http => TransportDescriptor {
                kind: TransportKind::Http,
                name: "http".to_string(),
                socket_kind: SocketKind::Stream,
                ops: Arc::new(HttpTransport::client(remote.to_string())),
                capabilities: TransportCapabilities {
                    reliable: true,
                    ordered: true,
                    obfuscation: true,
                    mimicry: true,
                    bidirectional: true,
                    ..Default::default()
                },
                mtu_hint: None,
                has_session_control: true,
            },
            TransportKind::WebSocket => TransportDescriptor {
                kind: TransportKind::WebSocket,
                name: "websocket".to_string(),
                socket_kind: SocketKind::Stream,
                ops: Arc::new(WebSocketTransport::client(remote.to_string(), "/stream")),
                capabilities: TransportCapabilities {
                    reliable: true,
                    ordered: true,
                    obfuscation: true,
                    mimicry: true,
                    multiplexing: true,
                    bidirectional: true,
                    low_latency: true,
                    ..Default::default()
                },
                mtu_hint: None,
                has_session_control: true,
            },
            TransportKind::Udp => TransportDescriptor {
                kind: TransportKind::Udp,
                name: "udp".to_string(),
                socket_kind: SocketKind::Datagram,
                ops: Arc::new(UdpTransport::client(remote.to_string(), 1400)),
                capabilities: TransportCapabilities {
                    bidirectional: true,
                    low_latency: true,
                    high_throughput: true,
                    ..Default::default()
                },
                mtu_hint: Some(1400),
                has_session_control: true,
            },
            TransportKind::Tls | TransportKind::Dns => continue,
        };
        // Safe to ignore: the caller never lists the same kind twice.
        let _ = registry.register(descriptor).await;
    }
    registry
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logger(cli.verbose);

    let config = match &cli.config {
        Some(path) => StreamConfig::from_file(path).context("loading client config")?,
        None => StreamConfig::default(),
    };
    config.validate().map_err(anyhow::Error::msg)?;

    let fallback_order: Vec<TransportKind> = config
        .dap_client
        .fallback_transports
        .iter()
        .map(|name| TransportKind::parse(name))
        .collect();

    info!(
        "starting stream client toward {} (fallback order: {:?})",
        cli.remote,
        config.dap_client.fallback_transports
    );

    let registry = build_registry(&fallback_order, &cli.remote).await;
    let client = StageClient::new(cli.remote.clone(), fallback_order, false);

    client.go_stage(Stage::StreamStreaming, &registry).await?;
    info!(
        "reached STREAM_STREAMING (session_id={}), requested channels: {}",
        client.session_id(),
        cli.channels
    );

    Ok(())
}
