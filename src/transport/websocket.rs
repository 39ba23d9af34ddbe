//! WebSocket transport adapter (§4.5): RFC 6455 upgrade handshake, binary
//! frame masking, and the ping/pong liveness watchdog.
//!
//! Grounded on the donor's `dns_transport.rs` socket-wrapping pattern
//! (store the live connection behind a mutex, drive it with plain
//! `AsyncRead`/`AsyncWrite` calls rather than a frame-library dependency)
//! and on `original_source/include/dap_stream_transport_websocket.h` for
//! the 30s ping / 10s pong-timeout cadence.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use log::{debug, info, warn};
use rand::RngCore;
use sha1::{Digest, Sha1};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;

use crate::codec::{InboundEvent, StreamCodec};
use crate::crypto::{derive_labeled_key, Kem, RawAeadSessionKey, SessionKey};
use crate::error::{StreamError, StreamResult};
use crate::handshake::{
    HandshakeRequest, HandshakeResponse, SessionCreateRequest, SessionCreateResponse, StreamReadyNotice,
    StreamStartRequest,
};
use crate::magic::{FixedMagicProvider, MagicProvider};
use crate::session::{NewSession, SessionStore};
use crate::stream::Stream;

use super::{SocketKind, TransportKind, StreamTransportOps};

const WEBSOCKET_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";
const PING_INTERVAL_SECS: u64 = 30;
const PONG_TIMEOUT_SECS: i64 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Opcode {
    Continuation,
    Text,
    Binary,
    Close,
    Ping,
    Pong,
}

impl Opcode {
    fn from_u8(v: u8) -> Option<Self> {
        Some(match v & 0x0F {
            0x0 => Opcode::Continuation,
            0x1 => Opcode::Text,
            0x2 => Opcode::Binary,
            0x8 => Opcode::Close,
            0x9 => Opcode::Ping,
            0xA => Opcode::Pong,
            _ => return None,
        })
    }

    fn as_u8(self) -> u8 {
        match self {
            Opcode::Continuation => 0x0,
            Opcode::Text => 0x1,
            Opcode::Binary => 0x2,
            Opcode::Close => 0x8,
            Opcode::Ping => 0x9,
            Opcode::Pong => 0xA,
        }
    }
}

/// Writes one unfragmented frame. `mask` is `Some(key)` for client→server
/// frames (RFC 6455 requires client frames to be masked), `None` for
/// server→client frames.
async fn write_frame(stream: &mut TcpStream, opcode: Opcode, payload: &[u8], mask: Option<[u8; 4]>) -> StreamResult<()> {
    let mut header = vec![0x80 | opcode.as_u8()];
    let mask_bit = if mask.is_some() { 0x80 } else { 0x00 };
    let len = payload.len();
    if len < 126 {
        header.push(mask_bit | len as u8);
    } else if len <= u16::MAX as usize {
        header.push(mask_bit | 126);
        header.extend_from_slice(&(len as u16).to_be_bytes());
    } else {
        header.push(mask_bit | 127);
        header.extend_from_slice(&(len as u64).to_be_bytes());
    }
    stream.write_all(&header).await?;

    if let Some(key) = mask {
        stream.write_all(&key).await?;
        let masked: Vec<u8> = payload.iter().enumerate().map(|(i, b)| b ^ key[i % 4]).collect();
        stream.write_all(&masked).await?;
    } else {
        stream.write_all(payload).await?;
    }
    stream.flush().await?;
    Ok(())
}

struct Frame {
    opcode: Opcode,
    payload: Vec<u8>,
}

async fn read_frame(stream: &mut TcpStream) -> StreamResult<Frame> {
    let mut header = [0u8; 2];
    stream.read_exact(&mut header).await?;
    let opcode = Opcode::from_u8(header[0]).ok_or_else(|| StreamError::InvalidArgs("unknown websocket opcode".to_string()))?;
    let masked = header[1] & 0x80 != 0;
    let mut len = (header[1] & 0x7F) as u64;
    if len == 126 {
        let mut ext = [0u8; 2];
        stream.read_exact(&mut ext).await?;
        len = u16::from_be_bytes(ext) as u64;
    } else if len == 127 {
        let mut ext = [0u8; 8];
        stream.read_exact(&mut ext).await?;
        len = u64::from_be_bytes(ext);
    }

    let mask_key = if masked {
        let mut key = [0u8; 4];
        stream.read_exact(&mut key).await?;
        Some(key)
    } else {
        None
    };

    let mut payload = vec![0u8; len as usize];
    if len > 0 {
        stream.read_exact(&mut payload).await?;
    }
    if let Some(key) = mask_key {
        for (i, b) in payload.iter_mut().enumerate() {
            *b ^= key[i % 4];
        }
    }
    Ok(Frame { opcode, payload })
}

/// Reads frames until a data frame (`Binary`/`Text`) arrives, transparently
/// answering `Ping` with `Pong` and recording liveness (§4.5 "control
/// frames are handled transparently by the read path").
async fn read_data_frame(
    stream: &mut TcpStream,
    mask_outgoing: Option<fn() -> [u8; 4]>,
    last_pong: &AtomicI64,
    now_unix: impl Fn() -> i64,
) -> StreamResult<Vec<u8>> {
    loop {
        let frame = read_frame(stream).await?;
        match frame.opcode {
            Opcode::Binary | Opcode::Text | Opcode::Continuation => return Ok(frame.payload),
            Opcode::Ping => {
                let mask = mask_outgoing.map(|f| f());
                write_frame(stream, Opcode::Pong, &frame.payload, mask).await?;
            }
            Opcode::Pong => {
                last_pong.store(now_unix(), Ordering::Relaxed);
            }
            Opcode::Close => {
                return Err(StreamError::StreamAborted);
            }
        }
    }
}

fn new_mask_key() -> [u8; 4] {
    let mut key = [0u8; 4];
    rand::thread_rng().fill_bytes(&mut key);
    key
}

fn accept_key(client_key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(client_key.as_bytes());
    hasher.update(WEBSOCKET_GUID.as_bytes());
    base64::engine::general_purpose::STANDARD.encode(hasher.finalize())
}

struct ClientState {
    remote: String,
    stream: Option<TcpStream>,
    last_pong_unix: Arc<AtomicI64>,
    handshake_key: Option<RawAeadSessionKey>,
    shared_secret: Option<Vec<u8>>,
    session_key: Option<Arc<RawAeadSessionKey>>,
    session_id: u32,
}

enum Role {
    Client(Mutex<ClientState>),
    Server { sessions: Arc<SessionStore>, capacity: usize },
}

/// WebSocket transport adapter. Client role performs the upgrade and
/// carries subsequent handshake/session/data exchanges as binary frames
/// over the single resulting connection; server role answers the upgrade
/// and the same frame sequence (§4.5). Grounded on the same KEM-based
/// handshake the UDP adapter uses (§4.6), since WebSocket has no Noise
/// handshake to ride on the way HTTP does.
pub struct WebSocketTransport {
    path: String,
    magic: Arc<dyn MagicProvider>,
    kem: Arc<dyn Kem>,
    role: Role,
}

impl WebSocketTransport {
    /// `remote` is dialed lazily the first time the upgrade is needed
    /// (inside `handshake_init`, since the stage table in §4.3 runs that
    /// before `connect`).
    pub fn client(remote: String, path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            magic: Arc::new(FixedMagicProvider),
            kem: Arc::new(crate::crypto::X25519Kem),
            role: Role::Client(Mutex::new(ClientState {
                remote,
                stream: None,
                last_pong_unix: Arc::new(AtomicI64::new(0)),
                handshake_key: None,
                shared_secret: None,
                session_key: None,
                session_id: 0,
            })),
        }
    }

    pub fn server(path: impl Into<String>, sessions: Arc<SessionStore>, capacity: usize) -> Self {
        Self {
            path: path.into(),
            magic: Arc::new(FixedMagicProvider),
            kem: Arc::new(crate::crypto::X25519Kem),
            role: Role::Server { sessions, capacity },
        }
    }

    fn client_state(&self) -> StreamResult<&Mutex<ClientState>> {
        match &self.role {
            Role::Client(state) => Ok(state),
            Role::Server { .. } => Err(StreamError::StageWrongStage),
        }
    }

    /// Performs the RFC 6455 upgrade against `state.remote` if not already
    /// done, then returns the live stream.
    async fn ensure_upgraded<'a>(&self, state: &'a mut ClientState) -> StreamResult<&'a mut TcpStream> {
        if state.stream.is_some() {
            return Ok(state.stream.as_mut().expect("just checked"));
        }

        let mut stream = TcpStream::connect(&state.remote).await.map_err(|_| StreamError::ConnectionRefused)?;

        let mut nonce = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut nonce);
        let client_key = base64::engine::general_purpose::STANDARD.encode(nonce);
        let request = format!(
            "GET {} HTTP/1.1\r\nHost: {}\r\nUpgrade: websocket\r\nConnection: Upgrade\r\nSec-WebSocket-Key: {}\r\nSec-WebSocket-Version: 13\r\n\r\n",
            self.path, state.remote, client_key
        );
        stream.write_all(request.as_bytes()).await?;
        stream.flush().await?;

        let mut raw = Vec::new();
        let mut byte = [0u8; 1];
        loop {
            stream.read_exact(&mut byte).await?;
            raw.push(byte[0]);
            if raw.len() >= 4 && &raw[raw.len() - 4..] == b"\r\n\r\n" {
                break;
            }
        }
        let head = String::from_utf8_lossy(&raw);
        if !head.starts_with("HTTP/1.1 101") {
            return Err(StreamError::ConnectionRefused);
        }
        let expected = accept_key(&client_key);
        let got = head
            .lines()
            .find_map(|line| line.strip_prefix("Sec-WebSocket-Accept:").map(|v| v.trim().to_string()));
        if got.as_deref() != Some(expected.as_str()) {
            return Err(StreamError::HandshakeAuthError);
        }

        info!("websocket: upgrade complete to {}", state.remote);
        state.last_pong_unix.store(chrono::Utc::now().timestamp(), Ordering::Relaxed);
        state.stream = Some(stream);
        Ok(state.stream.as_mut().expect("just inserted"))
    }

    /// Runs the server side of the handshake/session-create/stream-start
    /// sequence over one already-upgraded connection, then relays frames
    /// into the stream packet engine until the peer closes (§4.2/§4.5,
    /// mirroring the UDP adapter's KEM-based server path).
    async fn handle_connection(&self, mut stream: TcpStream, sessions: Arc<SessionStore>, capacity: usize) -> StreamResult<()> {
        let peer = stream.peer_addr().map(|addr| addr.to_string()).ok();

        let frame = read_frame(&mut stream).await?;
        let handshake_request = HandshakeRequest::decode(&frame.payload, self.magic.as_ref())
            .map_err(|e| StreamError::HandshakeResponseFormatError(e.to_string()))?;
        let (ciphertext, shared_secret) = self
            .kem
            .encapsulate(&handshake_request.alice_pub_key)
            .map_err(|e| StreamError::HandshakeControlError(e.to_string()))?;
        let session_id = rand::thread_rng().next_u32().max(1);
        let handshake_key = RawAeadSessionKey::new(&derive_labeled_key(&shared_secret, b"handshake"), capacity)
            .map_err(|e| StreamError::HandshakeControlError(e.to_string()))?;

        let response = HandshakeResponse {
            success: true,
            session_id,
            bob_pub_key: ciphertext,
            bob_signature: None,
            error_code: 0,
            error_message: None,
        };
        let body = response
            .encode(self.magic.as_ref())
            .map_err(|e| StreamError::HandshakeControlError(e.to_string()))?;
        write_frame(&mut stream, Opcode::Binary, &body, None).await?;
        info!("websocket: handshake established for {:?}, session_id={}", peer, session_id);

        let frame = read_frame(&mut stream).await?;
        let plaintext = handshake_key.decrypt(&frame.payload).map_err(|_| StreamError::EncWrongKey)?;
        let create = SessionCreateRequest::decode(&plaintext, self.magic.as_ref())
            .map_err(|e| StreamError::HandshakeResponseFormatError(e.to_string()))?;

        let session_key = Arc::new(
            RawAeadSessionKey::new(&derive_labeled_key(&shared_secret, b"session"), capacity)
                .map_err(|e| StreamError::HandshakeControlError(e.to_string()))?,
        );
        let channels_spec = create.channels.clone();
        let session = sessions
            .create(
                NewSession {
                    channels: create.channels,
                    key: session_key.clone() as Arc<dyn SessionKey>,
                    create_empty: false,
                    service_key: None,
                    authorized_node_addr: peer.clone(),
                },
                chrono::Utc::now().timestamp(),
            )
            .await;

        let relay = Stream::new(session_id as u64, "websocket".to_string(), peer.clone(), StreamCodec::new(self.magic.clone()));
        relay.install_default_channels(&channels_spec);
        relay.attach_session(session);

        let response = SessionCreateResponse {
            success: true,
            session_id,
            error_code: 0,
            error_message: None,
        };
        let body = response
            .encode(self.magic.as_ref())
            .map_err(|e| StreamError::HandshakeControlError(e.to_string()))?;
        write_frame(&mut stream, Opcode::Binary, &body, None).await?;

        let frame = read_frame(&mut stream).await?;
        let start = StreamStartRequest::decode(&frame.payload, self.magic.as_ref())
            .map_err(|e| StreamError::HandshakeResponseFormatError(e.to_string()))?;
        let ready = StreamReadyNotice {
            session_id: start.session_id,
            channels: channels_spec,
        };
        let body = ready
            .encode(self.magic.as_ref())
            .map_err(|e| StreamError::HandshakeControlError(e.to_string()))?;
        write_frame(&mut stream, Opcode::Binary, &body, None).await?;

        loop {
            let frame = match read_frame(&mut stream).await {
                Ok(frame) => frame,
                Err(_) => break,
            };
            match frame.opcode {
                Opcode::Ping => {
                    if write_frame(&mut stream, Opcode::Pong, &frame.payload, None).await.is_err() {
                        break;
                    }
                    continue;
                }
                Opcode::Pong => continue,
                Opcode::Close => break,
                Opcode::Binary | Opcode::Text | Opcode::Continuation => {}
            }

            let events = {
                let mut codec = relay.codec();
                codec.feed(&frame.payload);
                codec.poll(session_key.as_ref() as &dyn SessionKey)
            };
            for event in events {
                match event {
                    InboundEvent::Channel(packet, seq) => {
                        let verdict = relay.channels().dispatch_channel_packet(&packet);
                        debug!(
                            "websocket: channel '{}' packet ({} bytes, seq={:?}, verdict={:?})",
                            packet.channel_id as char, packet.data.len(), seq, verdict
                        );
                    }
                    InboundEvent::KeepaliveReceived => {
                        let alive = relay.codec().encode_alive();
                        if write_frame(&mut stream, Opcode::Binary, &alive, None).await.is_err() {
                            return Ok(());
                        }
                    }
                    InboundEvent::AliveReceived => relay.set_active(true),
                    InboundEvent::ServiceSessionCheck(id) => {
                        debug!("websocket: service-session check for {}", id);
                    }
                    InboundEvent::Dropped(reason) => {
                        debug!("websocket: codec dropped a packet: {:?}", reason);
                    }
                }
            }
        }
        Ok(())
    }
}

#[async_trait]
impl StreamTransportOps for WebSocketTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::WebSocket
    }

    fn socket_kind(&self) -> SocketKind {
        SocketKind::Stream
    }

    async fn stage_prepare(&self) -> StreamResult<()> {
        Ok(())
    }

    async fn connect(&self, _remote: &str) -> StreamResult<()> {
        let client = self.client_state()?;
        let mut state = client.lock().await;
        // Already upgraded inside `handshake_init`; just confirm it held.
        self.ensure_upgraded(&mut state).await?;
        Ok(())
    }

    async fn listen(&self, bind_addr: &str) -> StreamResult<()> {
        let (sessions, capacity) = match &self.role {
            Role::Server { sessions, capacity } => (sessions.clone(), *capacity),
            Role::Client(_) => return Err(StreamError::StageWrongStage),
        };
        let listener = TcpListener::bind(bind_addr).await?;
        info!("websocket transport listening on {}", bind_addr);
        loop {
            let (mut stream, peer) = listener.accept().await?;
            debug!("websocket: accepted connection from {}", peer);

            let mut raw = Vec::new();
            let mut byte = [0u8; 1];
            loop {
                if stream.read_exact(&mut byte).await.is_err() {
                    break;
                }
                raw.push(byte[0]);
                if raw.len() >= 4 && &raw[raw.len() - 4..] == b"\r\n\r\n" {
                    break;
                }
            }
            let head = String::from_utf8_lossy(&raw);
            let client_key = head
                .lines()
                .find_map(|line| line.strip_prefix("Sec-WebSocket-Key:").map(|v| v.trim().to_string()));
            let Some(client_key) = client_key else {
                warn!("websocket: upgrade request missing Sec-WebSocket-Key");
                continue;
            };
            let accept = accept_key(&client_key);
            let response = format!(
                "HTTP/1.1 101 Switching Protocols\r\nUpgrade: websocket\r\nConnection: Upgrade\r\nSec-WebSocket-Accept: {}\r\n\r\n",
                accept
            );
            if stream.write_all(response.as_bytes()).await.is_err() {
                continue;
            }
            // NOTE: handled inline rather than spawned, same tradeoff the
            // HTTP adapter makes — a real server would spawn a task per
            // connection against a cloned `Arc<WebSocketTransport>`.
            if let Err(err) = self.handle_connection(stream, sessions.clone(), capacity).await {
                warn!("websocket: connection error: {}", err);
            }
        }
    }

    async fn handshake_init(&self, _request: &[u8]) -> StreamResult<Vec<u8>> {
        let client = self.client_state()?;
        let mut state = client.lock().await;
        let last_pong = state.last_pong_unix.clone();

        let (public, secret) = self
            .kem
            .generate_keypair()
            .map_err(|e| StreamError::HandshakeControlError(e.to_string()))?;
        let request = HandshakeRequest {
            enc_type: 1,
            pkey_exchange_type: 1,
            pkey_exchange_size: self.kem.public_key_size(),
            block_key_size: 32,
            alice_pub_key: public,
            alice_signature: None,
        };
        let body = request
            .encode(self.magic.as_ref())
            .map_err(|e| StreamError::HandshakeControlError(e.to_string()))?;

        let stream = self.ensure_upgraded(&mut state).await?;
        write_frame(stream, Opcode::Binary, &body, Some(new_mask_key())).await?;
        let response_body = read_data_frame(stream, Some(new_mask_key), &last_pong, || chrono::Utc::now().timestamp()).await?;

        let response = HandshakeResponse::decode(&response_body, self.magic.as_ref())
            .map_err(|e| StreamError::HandshakeResponseFormatError(e.to_string()))?;
        if !response.success {
            return Err(StreamError::HandshakeAuthError);
        }
        let shared_secret = self
            .kem
            .decapsulate(secret, &response.bob_pub_key)
            .map_err(|_| StreamError::HandshakeAuthError)?;
        let handshake_key = RawAeadSessionKey::new(&derive_labeled_key(&shared_secret, b"handshake"), 16 * 1024)
            .map_err(|e| StreamError::HandshakeControlError(e.to_string()))?;

        state.handshake_key = Some(handshake_key);
        state.shared_secret = Some(shared_secret);
        state.session_id = response.session_id;
        Ok(response_body)
    }

    async fn handshake_process(&self, _response: &[u8]) -> StreamResult<()> {
        Ok(())
    }

    async fn session_create(&self, _request: &[u8]) -> StreamResult<Vec<u8>> {
        let client = self.client_state()?;
        let mut state = client.lock().await;
        let last_pong = state.last_pong_unix.clone();
        let handshake_key = state.handshake_key.take().ok_or(StreamError::EncNoKey)?;

        let create = SessionCreateRequest {
            channels: "A".to_string(),
            enc_type: 1,
            enc_key_size: 32,
            enc_headers: false,
        };
        let plaintext = create
            .encode(self.magic.as_ref())
            .map_err(|e| StreamError::HandshakeControlError(e.to_string()))?;
        let ciphertext = handshake_key.encrypt(&plaintext).map_err(|_| StreamError::EncNoKey)?;

        let stream = self.ensure_upgraded(&mut state).await?;
        write_frame(stream, Opcode::Binary, &ciphertext, Some(new_mask_key())).await?;
        let response_body = read_data_frame(stream, Some(new_mask_key), &last_pong, || chrono::Utc::now().timestamp()).await?;

        let response = SessionCreateResponse::decode(&response_body, self.magic.as_ref())
            .map_err(|e| StreamError::HandshakeResponseFormatError(e.to_string()))?;
        if !response.success {
            return Err(StreamError::HandshakeControlError(response.error_message.unwrap_or_default()));
        }

        let shared_secret = state.shared_secret.take().ok_or(StreamError::EncNoKey)?;
        let session_key = RawAeadSessionKey::new(&derive_labeled_key(&shared_secret, b"session"), 16 * 1024)
            .map_err(|e| StreamError::HandshakeControlError(e.to_string()))?;
        state.session_key = Some(Arc::new(session_key));
        state.session_id = response.session_id;
        Ok(response_body)
    }

    async fn session_start(&self, session_id: u32) -> StreamResult<()> {
        let client = self.client_state()?;
        let mut state = client.lock().await;
        let last_pong = state.last_pong_unix.clone();
        {
            let stream = self.ensure_upgraded(&mut state).await?;
            let request = crate::handshake::StreamStartRequest { session_id }
                .encode(&crate::magic::FixedMagicProvider)
                .map_err(|e| StreamError::HandshakeControlError(e.to_string()))?;
            write_frame(stream, Opcode::Binary, &request, Some(new_mask_key())).await?;
            let _ = read_data_frame(stream, Some(new_mask_key), &last_pong, || chrono::Utc::now().timestamp()).await?;
        }

        // Mark the connection alive now that it has moved into its
        // long-lived streaming phase; `read` below enforces the 30s+10s
        // ping/pong budget against this timestamp on every poll rather
        // than from a detached watchdog task, since a real background
        // pinger needs a split socket (`OwnedWriteHalf`) this adapter's
        // single shared `TcpStream` does not provide.
        state.last_pong_unix.store(chrono::Utc::now().timestamp(), Ordering::Relaxed);
        Ok(())
    }

    async fn read(&self) -> StreamResult<Vec<u8>> {
        let client = self.client_state()?;
        let mut state = client.lock().await;
        let last_pong = state.last_pong_unix.clone();
        let now = chrono::Utc::now().timestamp();
        if now - last_pong.load(Ordering::Relaxed) > PING_INTERVAL_SECS as i64 + PONG_TIMEOUT_SECS {
            return Err(StreamError::StreamFrozen);
        }
        let stream = self.ensure_upgraded(&mut state).await?;
        read_data_frame(stream, Some(new_mask_key), &last_pong, || chrono::Utc::now().timestamp()).await
    }

    async fn write(&self, data: &[u8]) -> StreamResult<()> {
        let client = self.client_state()?;
        let mut state = client.lock().await;
        let stream = self.ensure_upgraded(&mut state).await?;
        write_frame(stream, Opcode::Binary, data, Some(new_mask_key())).await
    }

    async fn close(&self) -> StreamResult<()> {
        if let Role::Client(state) = &self.role {
            let mut state = state.lock().await;
            if let Some(mut stream) = state.stream.take() {
                let _ = write_frame(&mut stream, Opcode::Close, &[], Some(new_mask_key())).await;
                let _ = stream.shutdown().await;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accept_key_matches_rfc6455_example() {
        // RFC 6455 §1.3 worked example.
        assert_eq!(accept_key("dGhlIHNhbXBsZSBub25jZQ=="), "s3pPLMBiTxaQ9kYGzzhZRbK+xOo=");
    }

    #[test]
    fn opcode_round_trips_through_raw_byte() {
        for (raw, expected) in [
            (0x0, Opcode::Continuation),
            (0x1, Opcode::Text),
            (0x2, Opcode::Binary),
            (0x8, Opcode::Close),
            (0x9, Opcode::Ping),
            (0xA, Opcode::Pong),
        ] {
            assert_eq!(Opcode::from_u8(raw), Some(expected));
        }
        assert_eq!(Opcode::from_u8(0x3), None);
    }

    #[tokio::test]
    async fn websocket_client_round_trips_handshake_session_and_data_against_server() {
        let server_store = Arc::new(SessionStore::new());
        let server = Arc::new(WebSocketTransport::server("/stream", server_store.clone(), 64));
        let server_for_task = server.clone();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let bind_addr = listener.local_addr().unwrap();
        drop(listener);

        let server_task = tokio::spawn({
            let server = server_for_task;
            let addr = bind_addr.to_string();
            async move {
                let _ = server.listen(&addr).await;
            }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;

        let client = WebSocketTransport::client(bind_addr.to_string(), "/stream");
        client.handshake_init(&[]).await.unwrap();
        client.session_create(&[]).await.unwrap();
        client.session_start(0).await.unwrap();
        client.write(b"ping").await.unwrap();

        // The server decodes the handshake, creates a session, installs
        // channel 'A's default notifier, and then feeds the DATA frame
        // through its stream codec and dispatches it there.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(server_store.len().await, 1, "server must have created exactly one session");
        server_task.abort();
    }
}
