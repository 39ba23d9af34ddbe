//! End-to-end scenarios exercising the stream packet engine and stage
//! machine the way two real peers would drive them: shared session key,
//! independent codec state per direction, fed byte-for-byte across an
//! in-memory "wire" (§8 scenarios 1, 3, 4, 5, 6).

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;

use streamcarrier::{
    Channel, ChannelTable, FixedMagicProvider, InboundEvent, PacketVerdict, RawAeadSessionKey, SessionCreateResponse,
    SessionKey, SocketKind, Stage, StageClient, StreamCodec, StreamError, StreamTransportOps, TransportCapabilities,
    TransportDescriptor, TransportKind, TransportRegistry,
};

fn shared_key(capacity: usize) -> (Arc<RawAeadSessionKey>, Arc<RawAeadSessionKey>) {
    let bytes = [7u8; 32];
    let a = Arc::new(RawAeadSessionKey::new(&bytes, capacity).expect("valid key"));
    let b = Arc::new(RawAeadSessionKey::new(&bytes, capacity).expect("valid key"));
    (a, b)
}

/// One side of a full-duplex, in-memory stream packet connection.
struct Endpoint {
    codec: StreamCodec,
    key: Arc<RawAeadSessionKey>,
}

impl Endpoint {
    fn new(key: Arc<RawAeadSessionKey>) -> Self {
        Self {
            codec: StreamCodec::new(Arc::new(FixedMagicProvider)),
            key,
        }
    }

    fn send(&mut self, channel_id: u8, data: &[u8]) -> Vec<u8> {
        let frames = self
            .codec
            .encode_write(self.key.as_ref() as &dyn SessionKey, channel_id, 0x01, 0x01, data)
            .expect("encode_write succeeds");
        frames.concat()
    }

    fn recv(&mut self, wire_bytes: &[u8]) -> Vec<InboundEvent> {
        self.codec.feed(wire_bytes);
        self.codec.poll(self.key.as_ref() as &dyn SessionKey)
    }
}

fn only_channel_packet(events: Vec<InboundEvent>) -> Vec<u8> {
    assert_eq!(events.len(), 1, "expected exactly one event");
    match events.into_iter().next().unwrap() {
        InboundEvent::Channel(packet, _) => packet.data,
        other => panic!("expected a channel packet, got a different event: {other:?}"),
    }
}

impl std::fmt::Debug for InboundEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            InboundEvent::Channel(p, seq) => write!(f, "Channel(channel={}, seq={:?})", p.channel_id, seq),
            InboundEvent::ServiceSessionCheck(id) => write!(f, "ServiceSessionCheck({id})"),
            InboundEvent::KeepaliveReceived => write!(f, "KeepaliveReceived"),
            InboundEvent::AliveReceived => write!(f, "AliveReceived"),
            InboundEvent::Dropped(reason) => write!(f, "Dropped({reason:?})"),
        }
    }
}

#[test]
fn single_small_write_round_trips_through_the_codec() {
    let (key_a, key_b) = shared_key(4096);
    let mut sender = Endpoint::new(key_a);
    let mut receiver = Endpoint::new(key_b);

    let wire = sender.send(b'A', b"hello over the wire");
    let events = receiver.recv(&wire);
    assert_eq!(only_channel_packet(events), b"hello over the wire");
}

#[test]
fn oversize_write_fragments_and_reassembles_in_order() {
    // Tiny capacity forces `encode_write` to split the payload into several
    // FRAGMENT frames that must reassemble to the original bytes.
    let (key_a, key_b) = shared_key(32);
    let mut sender = Endpoint::new(key_a);
    let mut receiver = Endpoint::new(key_b);

    let payload: Vec<u8> = (0u8..=255).cycle().take(5000).collect();
    let wire = sender.send(b'A', &payload);
    assert!(wire.len() > payload.len(), "fragmentation must split across several frames");

    let events = receiver.recv(&wire);
    assert_eq!(only_channel_packet(events), payload);
}

#[test]
fn sequence_gap_is_reported_as_loss_not_dropped() {
    let (key_a, key_b) = shared_key(4096);
    let mut sender = Endpoint::new(key_a);
    let mut receiver = Endpoint::new(key_b);

    let first = sender.send(b'A', b"one");
    let _second = sender.send(b'A', b"two");
    let third = sender.send(b'A', b"three");

    // Second frame never arrives (simulated loss on an unreliable carrier).
    let mut events = receiver.recv(&first);
    events.extend(receiver.recv(&third));

    assert_eq!(events.len(), 2);
    match &events[0] {
        InboundEvent::Channel(p, _) => assert_eq!(p.data, b"one"),
        other => panic!("unexpected {other:?}"),
    }
    match &events[1] {
        InboundEvent::Channel(p, seq) => {
            assert_eq!(p.data, b"three");
            assert!(matches!(seq, streamcarrier::SeqCheck::Loss { .. }));
        }
        other => panic!("unexpected {other:?}"),
    }
}

#[test]
fn keepalive_and_alive_frames_are_recognized_without_a_payload() {
    let (key_a, key_b) = shared_key(4096);
    let sender = Endpoint::new(key_a);
    let mut receiver = Endpoint::new(key_b);

    let keepalive = sender.codec.encode_keepalive();
    let events = receiver.recv(&keepalive);
    assert_eq!(events.len(), 1);
    assert!(matches!(events[0], InboundEvent::KeepaliveReceived));

    let alive = sender.codec.encode_alive();
    let events = receiver.recv(&alive);
    assert_eq!(events.len(), 1);
    assert!(matches!(events[0], InboundEvent::AliveReceived));
}

#[test]
fn channel_table_rejects_packets_for_unregistered_channels() {
    let mut table = ChannelTable::new();
    table.get_or_create(b'A');

    let accepted = streamcarrier::ChannelPacket {
        channel_id: b'A',
        packet_type: 0x01,
        seq_id: 0,
        enc_type: 0x01,
        data: b"ok".to_vec(),
    };
    let rejected = streamcarrier::ChannelPacket {
        channel_id: b'Z',
        packet_type: 0x01,
        seq_id: 0,
        enc_type: 0x01,
        data: b"nope".to_vec(),
    };

    assert_eq!(table.dispatch_channel_packet(&accepted), PacketVerdict::Accept);
    assert_eq!(table.dispatch_channel_packet(&rejected), PacketVerdict::Reject);
}

#[test]
fn channel_with_a_rejecting_packet_in_handler_never_reaches_its_notifiers() {
    let mut table = ChannelTable::new();
    let channel = table.get_or_create(b'A');
    channel.set_packet_in(Box::new(|_packet| PacketVerdict::Reject));
    let delivered = Arc::new(AtomicU32::new(0));
    let delivered_clone = delivered.clone();
    channel.add_notifier(Box::new(move |_id, _ty, _data| {
        delivered_clone.fetch_add(1, Ordering::SeqCst);
    }));

    let packet = streamcarrier::ChannelPacket {
        channel_id: b'A',
        packet_type: 0x01,
        seq_id: 0,
        enc_type: 0x01,
        data: b"x".to_vec(),
    };
    let verdict = table.dispatch_channel_packet(&packet);
    assert_eq!(verdict, PacketVerdict::Reject);
    assert_eq!(delivered.load(Ordering::SeqCst), 0);
}

/// A fake [`StreamTransportOps`] that fails `connect` for every kind but one,
/// so the stage machine must fall back before it can reach
/// `STREAM_CONNECTED` (§4.3, §8 scenario 6).
struct FlakyTransport {
    kind: TransportKind,
    should_fail: bool,
}

#[async_trait]
impl StreamTransportOps for FlakyTransport {
    fn kind(&self) -> TransportKind {
        self.kind
    }

    fn socket_kind(&self) -> SocketKind {
        SocketKind::Stream
    }

    async fn stage_prepare(&self) -> streamcarrier::StreamResult<()> {
        Ok(())
    }

    async fn connect(&self, _remote: &str) -> streamcarrier::StreamResult<()> {
        if self.should_fail {
            Err(StreamError::ConnectionRefused)
        } else {
            Ok(())
        }
    }

    async fn listen(&self, _bind_addr: &str) -> streamcarrier::StreamResult<()> {
        Ok(())
    }

    async fn handshake_init(&self, _request: &[u8]) -> streamcarrier::StreamResult<Vec<u8>> {
        Ok(Vec::new())
    }

    async fn handshake_process(&self, _response: &[u8]) -> streamcarrier::StreamResult<()> {
        Ok(())
    }

    async fn session_create(&self, _request: &[u8]) -> streamcarrier::StreamResult<Vec<u8>> {
        let response = SessionCreateResponse {
            success: true,
            session_id: 42,
            error_code: 0,
            error_message: None,
        };
        Ok(response.encode(&FixedMagicProvider).expect("encode succeeds"))
    }

    async fn session_start(&self, _session_id: u32) -> streamcarrier::StreamResult<()> {
        Ok(())
    }

    async fn read(&self) -> streamcarrier::StreamResult<Vec<u8>> {
        Ok(Vec::new())
    }

    async fn write(&self, _data: &[u8]) -> streamcarrier::StreamResult<()> {
        Ok(())
    }

    async fn close(&self) -> streamcarrier::StreamResult<()> {
        Ok(())
    }
}

#[tokio::test]
async fn stage_client_falls_back_to_the_next_carrier_when_the_first_refuses() {
    let registry = TransportRegistry::new();
    registry
        .register(TransportDescriptor {
            kind: TransportKind::Http,
            name: "http".to_string(),
            socket_kind: SocketKind::Stream,
            ops: Arc::new(FlakyTransport {
                kind: TransportKind::Http,
                should_fail: true,
            }),
            capabilities: TransportCapabilities::default(),
            mtu_hint: None,
            has_session_control: true,
        })
        .await
        .unwrap();
    registry
        .register(TransportDescriptor {
            kind: TransportKind::WebSocket,
            name: "websocket".to_string(),
            socket_kind: SocketKind::Stream,
            ops: Arc::new(FlakyTransport {
                kind: TransportKind::WebSocket,
                should_fail: false,
            }),
            capabilities: TransportCapabilities::default(),
            mtu_hint: None,
            has_session_control: true,
        })
        .await
        .unwrap();

    let client = StageClient::new(
        "example.invalid:443".to_string(),
        vec![TransportKind::Http, TransportKind::WebSocket],
        false,
    );

    client.go_stage(Stage::StreamConnected, &registry).await.unwrap();
    assert_eq!(client.current_stage(), Stage::StreamConnected);
    assert_eq!(client.session_id(), 42, "the negotiated session id must survive the fallback");
}
