//! Transport abstraction layer: a registry of transport implementations
//! behind a uniform vtable, and the carrier-specific adapters (§4.1,
//! §4.4-§4.6).
//!
//! Grounded on the donor's `transport.rs` (`StreamTransport`/
//! `DatagramTransport` async traits, `TransportType` enum) generalized
//! from a TCP/TLS/QUIC/WebRTC carrier set to the handshake/session-aware
//! vtable this framework's stage machine drives.

pub mod http;
pub mod udp;
pub mod websocket;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::error::{StreamError, StreamResult};

/// Transport kind identifier (§4.1 string-parsing table).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportKind {
    Http,
    WebSocket,
    Udp,
    Tls,
    Dns,
}

impl TransportKind {
    /// Case-insensitive name parsing; unknown names map to HTTP, matching
    /// §4.1's registry lookup rule.
    pub fn parse(name: &str) -> Self {
        match name.to_ascii_lowercase().as_str() {
            "http" | "https" => TransportKind::Http,
            "websocket" | "ws" => TransportKind::WebSocket,
            "udp" | "udp_basic" | "udp_reliable" | "udp_quic" | "quic" => TransportKind::Udp,
            "tls" | "tls_direct" => TransportKind::Tls,
            "dns" | "dns_tunnel" => TransportKind::Dns,
            _ => TransportKind::Http,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TransportKind::Http => "http",
            TransportKind::WebSocket => "websocket",
            TransportKind::Udp => "udp",
            TransportKind::Tls => "tls",
            TransportKind::Dns => "dns",
        }
    }
}

/// Whether a transport carries a byte stream (TCP-like) or discrete
/// messages (UDP-like), mirroring the donor's `TransportSemantics` split.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketKind {
    Stream,
    Datagram,
}

/// Uniform transport vtable (§4.1): `connect`, `listen`,
/// `handshake_init`/`handshake_process`, `session_create`/`session_start`,
/// `read`/`write`, `close`, `stage_prepare`. Every method takes `&self`;
/// per-connection mutable state lives behind interior mutability inside
/// the concrete implementation, matching the "plain record of function
/// pointers plus a context pointer" vtable shape called out in §9.
#[async_trait]
pub trait StreamTransportOps: Send + Sync {
    fn kind(&self) -> TransportKind;

    fn socket_kind(&self) -> SocketKind;

    /// Prepares whatever resource the stage machine's `BEGIN` stage needs
    /// before `connect` (e.g. a bound UDP socket) (§4.3, §4.6).
    async fn stage_prepare(&self) -> StreamResult<()>;

    async fn connect(&self, remote: &str) -> StreamResult<()>;

    async fn listen(&self, bind_addr: &str) -> StreamResult<()>;

    async fn handshake_init(&self, request: &[u8]) -> StreamResult<Vec<u8>>;

    async fn handshake_process(&self, response: &[u8]) -> StreamResult<()>;

    async fn session_create(&self, request: &[u8]) -> StreamResult<Vec<u8>>;

    async fn session_start(&self, session_id: u32) -> StreamResult<()>;

    async fn read(&self) -> StreamResult<Vec<u8>>;

    async fn write(&self, data: &[u8]) -> StreamResult<()>;

    async fn close(&self) -> StreamResult<()>;
}

/// Maximum byte length of a [`TransportDescriptor::name`] (§3 "Transport
/// descriptor": "human name (≤63 chars)").
pub const MAX_TRANSPORT_NAME_LEN: usize = 63;

/// Capability flags a transport advertises about itself (§3 "Transport
/// descriptor"). Purely descriptive — nothing in the registry or stage
/// machine currently branches on these, but a deployment picking among
/// several registered transports for the same fallback slot (e.g. two UDP
/// variants) can filter on them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TransportCapabilities {
    pub reliable: bool,
    pub ordered: bool,
    pub obfuscation: bool,
    pub padding: bool,
    pub mimicry: bool,
    pub multiplexing: bool,
    pub bidirectional: bool,
    pub low_latency: bool,
    pub high_throughput: bool,
}

/// A registered transport: its kind, display name, socket semantics, the
/// ops vtable (§4.1 "registration stores ops as ... `Arc<dyn
/// StreamTransportOps>`"), its capability bitset, an MTU hint, and whether
/// it implements its own session-create/session-start handshake steps
/// (`has_session_control`) versus deferring session management entirely to
/// the framework.
pub struct TransportDescriptor {
    pub kind: TransportKind,
    pub name: String,
    pub socket_kind: SocketKind,
    pub ops: Arc<dyn StreamTransportOps>,
    pub capabilities: TransportCapabilities,
    pub mtu_hint: Option<u32>,
    pub has_session_control: bool,
}

/// Transport registry (§4.1).
#[derive(Default)]
pub struct TransportRegistry {
    by_kind: RwLock<HashMap<TransportKind, Arc<TransportDescriptor>>>,
}

impl TransportRegistry {
    pub fn new() -> Self {
        Self {
            by_kind: RwLock::new(HashMap::new()),
        }
    }

    pub async fn register(&self, descriptor: TransportDescriptor) -> StreamResult<()> {
        if descriptor.name.is_empty() || descriptor.name.len() > MAX_TRANSPORT_NAME_LEN {
            return Err(StreamError::InvalidArgs(format!(
                "transport name must be 1-{} bytes, got {}",
                MAX_TRANSPORT_NAME_LEN,
                descriptor.name.len()
            )));
        }
        let mut table = self.by_kind.write().await;
        if table.contains_key(&descriptor.kind) {
            return Err(StreamError::TransportAlreadyRegistered);
        }
        table.insert(descriptor.kind, Arc::new(descriptor));
        Ok(())
    }

    pub async fn unregister(&self, kind: TransportKind) {
        self.by_kind.write().await.remove(&kind);
    }

    pub async fn find(&self, kind: TransportKind) -> Option<Arc<TransportDescriptor>> {
        self.by_kind.read().await.get(&kind).cloned()
    }

    pub async fn find_by_name(&self, name: &str) -> Option<Arc<TransportDescriptor>> {
        self.find(TransportKind::parse(name)).await
    }

    /// Snapshot of every registered descriptor (§4.1 "`list_all` yields a
    /// snapshot").
    pub async fn list_all(&self) -> Vec<Arc<TransportDescriptor>> {
        self.by_kind.read().await.values().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_descriptor(kind: TransportKind, name: &str, ops: Arc<dyn StreamTransportOps>) -> TransportDescriptor {
        TransportDescriptor {
            kind,
            name: name.to_string(),
            socket_kind: SocketKind::Stream,
            ops,
            capabilities: TransportCapabilities::default(),
            mtu_hint: None,
            has_session_control: true,
        }
    }

    #[test]
    fn unknown_transport_name_defaults_to_http() {
        assert_eq!(TransportKind::parse("carrier-pigeon"), TransportKind::Http);
        assert_eq!(TransportKind::parse("WS"), TransportKind::WebSocket);
        assert_eq!(TransportKind::parse("udp_quic"), TransportKind::Udp);
    }

    struct NoopTransport(TransportKind);

    #[async_trait]
    impl StreamTransportOps for NoopTransport {
        fn kind(&self) -> TransportKind {
            self.0
        }
        fn socket_kind(&self) -> SocketKind {
            SocketKind::Stream
        }
        async fn stage_prepare(&self) -> StreamResult<()> {
            Ok(())
        }
        async fn connect(&self, _remote: &str) -> StreamResult<()> {
            Ok(())
        }
        async fn listen(&self, _bind_addr: &str) -> StreamResult<()> {
            Ok(())
        }
        async fn handshake_init(&self, _request: &[u8]) -> StreamResult<Vec<u8>> {
            Ok(Vec::new())
        }
        async fn handshake_process(&self, _response: &[u8]) -> StreamResult<()> {
            Ok(())
        }
        async fn session_create(&self, _request: &[u8]) -> StreamResult<Vec<u8>> {
            Ok(Vec::new())
        }
        async fn session_start(&self, _session_id: u32) -> StreamResult<()> {
            Ok(())
        }
        async fn read(&self) -> StreamResult<Vec<u8>> {
            Ok(Vec::new())
        }
        async fn write(&self, _data: &[u8]) -> StreamResult<()> {
            Ok(())
        }
        async fn close(&self) -> StreamResult<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn registry_rejects_duplicate_kind() {
        let registry = TransportRegistry::new();
        registry
            .register(test_descriptor(TransportKind::Http, "http", Arc::new(NoopTransport(TransportKind::Http))))
            .await
            .unwrap();
        let result = registry
            .register(test_descriptor(TransportKind::Http, "http", Arc::new(NoopTransport(TransportKind::Http))))
            .await;
        assert!(matches!(result, Err(StreamError::TransportAlreadyRegistered)));
    }

    #[tokio::test]
    async fn find_by_name_is_case_insensitive() {
        let registry = TransportRegistry::new();
        registry
            .register(test_descriptor(
                TransportKind::WebSocket,
                "websocket",
                Arc::new(NoopTransport(TransportKind::WebSocket)),
            ))
            .await
            .unwrap();
        assert!(registry.find_by_name("WS").await.is_some());
        assert!(registry.find_by_name("WebSocket").await.is_some());
    }

    #[tokio::test]
    async fn register_rejects_name_over_63_bytes() {
        let registry = TransportRegistry::new();
        let long_name = "x".repeat(64);
        let result = registry
            .register(test_descriptor(TransportKind::Http, &long_name, Arc::new(NoopTransport(TransportKind::Http))))
            .await;
        assert!(matches!(result, Err(StreamError::InvalidArgs(_))));
    }

    #[tokio::test]
    async fn register_unregister_round_trips_list_all() {
        let registry = TransportRegistry::new();
        let before = registry.list_all().await.len();
        registry
            .register(test_descriptor(TransportKind::Http, "http", Arc::new(NoopTransport(TransportKind::Http))))
            .await
            .unwrap();
        assert_eq!(registry.list_all().await.len(), before + 1);
        registry.unregister(TransportKind::Http).await;
        assert_eq!(registry.list_all().await.len(), before);
    }
}
