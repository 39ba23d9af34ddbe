//! A pluggable stream-transport framework that carries an encrypted,
//! channel-multiplexed packet stream over interchangeable carriers (HTTP
//! upgrade, WebSocket, raw UDP). It terminates a handshake on both sides
//! that establishes a per-session symmetric key, assigns a session id,
//! negotiates active application channels, and relays fragmented,
//! sequenced packets between peers.
//!
//! ## Layout
//!
//! - [`transport`] — the registry/vtable abstraction (`StreamTransportOps`)
//!   plus the HTTP, WebSocket and UDP carrier adapters.
//! - [`codec`] — stream-packet framing, fragmentation/reassembly, sequence
//!   gap detection, channel dispatch.
//! - [`handshake`] — the transport-agnostic TLV encoding for handshake,
//!   session-create and stream-ready/start messages.
//! - [`stage`] — the client-side stage machine
//!   (`BEGIN → ENC_INIT → STREAM_CTL → STREAM_SESSION → STREAM_CONNECTED →
//!   STREAM_STREAMING`) with transport fallback.
//! - [`channel`], [`session`], [`stream`] — the channel table, session
//!   store and per-connection `Stream` object.
//! - [`crypto`] — the `Key`/`Cert`/`Sign` capability set the framework
//!   consumes rather than implements, plus one concrete instantiation of
//!   each so the framework is exercisable end to end.
//! - [`context`] — `StreamContext`, bundling the process-wide tables.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use streamcarrier::{StreamConfig, StreamContext};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = StreamConfig::default();
//!     config.validate().map_err(anyhow::Error::msg)?;
//!     let ctx = StreamContext::new(config);
//!     println!("preferred encryption: {}", ctx.preferred_encryption());
//!     Ok(())
//! }
//! ```
//!
//! ## As a command-line tool
//!
//! ```bash
//! # Run as server
//! stream-server --bind 0.0.0.0:8443 --transport http
//!
//! # Run as client
//! stream-client --remote example.com:8443 --channels A,B
//! ```

pub mod channel;
pub mod codec;
pub mod config;
pub mod context;
pub mod crypto;
pub mod error;
pub mod handshake;
pub mod magic;
pub mod session;
pub mod stage;
pub mod stream;
pub mod transport;

pub use channel::{Channel, ChannelTable, PacketVerdict};
pub use codec::{ChannelPacket, InboundEvent, PacketType, SeqCheck, StreamCodec, DAP_STREAM_PKT_SIZE_MAX};
pub use config::{ClientSettings, StreamConfig, StreamSettings, StreamUdpSettings};
pub use context::StreamContext;
pub use crypto::{CertStore, Kem, NoiseSessionKey, RawAeadSessionKey, SessionKey, Signer, X25519Kem};
pub use error::{FrameDropReason, StreamError, StreamResult};
pub use handshake::{
    HandshakeRequest, HandshakeResponse, MessageType, SessionCreateRequest, SessionCreateResponse,
    StreamReadyNotice, StreamStartRequest,
};
pub use magic::{FixedMagicProvider, MagicProvider, HANDSHAKE_MAGIC, STREAM_PACKET_MAGIC};
pub use session::{NewSession, Session, SessionStore};
pub use stage::{Stage, StageClient, StageStatus};
pub use stream::{AuthorizedStreamsIndex, Stream, TaskHandle};
pub use transport::http::HttpTransport;
pub use transport::udp::UdpTransport;
pub use transport::websocket::WebSocketTransport;
pub use transport::{
    SocketKind, StreamTransportOps, TransportCapabilities, TransportDescriptor, TransportKind, TransportRegistry,
    MAX_TRANSPORT_NAME_LEN,
};
