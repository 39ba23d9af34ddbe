//! Client stage machine (§4.3): drives a connection from `BEGIN` through
//! `ENC_INIT → STREAM_CTL → STREAM_SESSION → STREAM_CONNECTED →
//! STREAM_STREAMING`, with transport-selected fallback on failure.
//!
//! Grounded on `original_source/net/client/dap_client.c`'s
//! `dap_client_go_stage`/`s_go_stage_on_client_worker_unsafe` pair: the
//! "if already at target and COMPLETE, fire the callback immediately,
//! otherwise post a transaction that advances one stage at a time"
//! structure is preserved; the original's worker-thread callback posting
//! becomes a plain `async fn` loop per §9's "async control flow" note,
//! since a future already gives the caller the completion signal the C
//! code needed a callback for.

use std::sync::Mutex;

use log::info;

use crate::error::{StreamError, StreamResult};
use crate::handshake::SessionCreateResponse;
use crate::magic::FixedMagicProvider;
use crate::transport::{TransportDescriptor, TransportKind, TransportRegistry};
use std::sync::Arc;

/// Linear stage order (§4.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Stage {
    Begin,
    EncInit,
    StreamCtl,
    StreamSession,
    StreamConnected,
    StreamStreaming,
}

impl Stage {
    fn next(self) -> Option<Stage> {
        match self {
            Stage::Begin => Some(Stage::EncInit),
            Stage::EncInit => Some(Stage::StreamCtl),
            Stage::StreamCtl => Some(Stage::StreamSession),
            Stage::StreamSession => Some(Stage::StreamConnected),
            Stage::StreamConnected => Some(Stage::StreamStreaming),
            Stage::StreamStreaming => None,
        }
    }

    fn as_str(self) -> &'static str {
        match self {
            Stage::Begin => "BEGIN",
            Stage::EncInit => "ENC_INIT",
            Stage::StreamCtl => "STREAM_CTL",
            Stage::StreamSession => "STREAM_SESSION",
            Stage::StreamConnected => "STREAM_CONNECTED",
            Stage::StreamStreaming => "STREAM_STREAMING",
        }
    }
}

/// Per-client stage status (§4.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageStatus {
    None,
    InProgress,
    Error,
    Done,
    Complete,
}

/// Hard cap on transport-fallback attempts per `go_stage` call (§4.3, §9
/// open-question resolution #1).
pub const MAX_FALLBACK_ATTEMPTS: u32 = 5;

struct StageState {
    stage: Stage,
    status: StageStatus,
    active: Option<Arc<TransportDescriptor>>,
    tried: Vec<TransportKind>,
    session_id: u32,
}

/// Whether a transport-level error should trigger a fallback to the next
/// untried transport, or bubble up as a terminal failure (§4.3, §7
/// propagation policy).
fn triggers_fallback(err: &StreamError) -> bool {
    matches!(
        err,
        StreamError::HandshakeControlError(_)
            | StreamError::HandshakeAuthError
            | StreamError::HandshakeResponseFormatError(_)
            | StreamError::ConnectionRefused
            | StreamError::ConnectionTimeout
    )
}

/// Drives one client's connection lifecycle across a configured fallback
/// order of transports (§4.3, §8 scenario 6).
pub struct StageClient {
    remote: String,
    fallback_order: Vec<TransportKind>,
    connect_on_demand: bool,
    state: Mutex<StageState>,
    pending_writes: Mutex<Vec<(u8, Vec<u8>)>>,
}

impl StageClient {
    pub fn new(remote: String, fallback_order: Vec<TransportKind>, connect_on_demand: bool) -> Self {
        Self {
            remote,
            fallback_order,
            connect_on_demand,
            state: Mutex::new(StageState {
                stage: Stage::Begin,
                status: StageStatus::None,
                active: None,
                tried: Vec::new(),
                session_id: 0,
            }),
            pending_writes: Mutex::new(Vec::new()),
        }
    }

    pub fn connect_on_demand(&self) -> bool {
        self.connect_on_demand
    }

    pub fn current_stage(&self) -> Stage {
        self.state.lock().unwrap().stage
    }

    pub fn status(&self) -> StageStatus {
        self.state.lock().unwrap().status
    }

    pub fn session_id(&self) -> u32 {
        self.state.lock().unwrap().session_id
    }

    /// Queues an application write for a not-yet-streaming client
    /// (`connect_on_demand`, §4.3). Returns the queued payloads once the
    /// stage machine reaches `STREAM_STREAMING` so the caller can flush
    /// them onto the now-live channel.
    pub fn queue_write(&self, channel_id: u8, data: Vec<u8>) {
        self.pending_writes.lock().unwrap().push((channel_id, data));
    }

    pub fn take_pending_writes(&self) -> Vec<(u8, Vec<u8>)> {
        std::mem::take(&mut self.pending_writes.lock().unwrap())
    }

    /// Drives the stage machine toward `target`, selecting and falling
    /// back across `registry`'s transports as needed. Mirrors
    /// `dap_client_go_stage`'s "already there and COMPLETE → fire
    /// immediately" fast path.
    pub async fn go_stage(&self, target: Stage, registry: &TransportRegistry) -> StreamResult<()> {
        {
            let state = self.state.lock().unwrap();
            if state.stage == target && state.status == StageStatus::Complete {
                return Ok(());
            }
        }

        {
            let mut state = self.state.lock().unwrap();
            state.status = StageStatus::InProgress;
        }

        let mut attempts = 0u32;
        loop {
            let active = match self.ensure_active_transport(registry).await {
                Some(descriptor) => descriptor,
                None => {
                    let mut state = self.state.lock().unwrap();
                    state.status = StageStatus::Error;
                    return Err(StreamError::FallbackLimitExceeded);
                }
            };

            match self.drive_to_target(&active, target).await {
                Ok(()) => {
                    let mut state = self.state.lock().unwrap();
                    state.status = StageStatus::Complete;
                    return Ok(());
                }
                Err(err) if triggers_fallback(&err) => {
                    attempts += 1;
                    if attempts >= MAX_FALLBACK_ATTEMPTS {
                        let mut state = self.state.lock().unwrap();
                        state.status = StageStatus::Error;
                        return Err(StreamError::FallbackLimitExceeded);
                    }
                    let mut state = self.state.lock().unwrap();
                    state.tried.push(active.kind);
                    state.active = None;
                    state.stage = Stage::Begin;
                    info!(
                        "transport {} failed ({err}), falling back (attempt {}/{})",
                        active.name, attempts, MAX_FALLBACK_ATTEMPTS
                    );
                }
                Err(err) => {
                    let mut state = self.state.lock().unwrap();
                    state.status = StageStatus::Error;
                    return Err(err);
                }
            }
        }
    }

    async fn ensure_active_transport(&self, registry: &TransportRegistry) -> Option<Arc<TransportDescriptor>> {
        {
            let state = self.state.lock().unwrap();
            if let Some(active) = &state.active {
                return Some(active.clone());
            }
        }
        let tried = self.state.lock().unwrap().tried.clone();
        for kind in &self.fallback_order {
            if tried.contains(kind) {
                continue;
            }
            if let Some(descriptor) = registry.find(*kind).await {
                self.state.lock().unwrap().active = Some(descriptor.clone());
                return Some(descriptor);
            }
        }
        None
    }

    /// Advances one stage transition at a time until `target` is reached,
    /// invoking the transport primitive the table in §4.3 names for each
    /// edge. Logs "current X, go to Y (target T)" per transition, matching
    /// the FSM operator's log line.
    async fn drive_to_target(&self, active: &TransportDescriptor, target: Stage) -> StreamResult<()> {
        loop {
            let current = self.state.lock().unwrap().stage;
            if current >= target {
                return Ok(());
            }
            let next = current.next().expect("stage below STREAM_STREAMING always has a next stage");
            info!("current {}, go to {} (target {})", current.as_str(), next.as_str(), target.as_str());

            match current {
                Stage::Begin => {
                    active.ops.handshake_init(&[]).await?;
                }
                Stage::EncInit => {
                    let response_body = active.ops.session_create(&[]).await?;
                    let response = SessionCreateResponse::decode(&response_body, &FixedMagicProvider)
                        .map_err(|e| StreamError::HandshakeResponseFormatError(e.to_string()))?;
                    if !response.success {
                        return Err(StreamError::HandshakeControlError(response.error_message.unwrap_or_default()));
                    }
                    self.state.lock().unwrap().session_id = response.session_id;
                }
                Stage::StreamCtl => {
                    active.ops.stage_prepare().await?;
                }
                Stage::StreamSession => {
                    active.ops.connect(&self.remote).await?;
                }
                Stage::StreamConnected => {
                    let session_id = self.state.lock().unwrap().session_id;
                    active.ops.session_start(session_id).await?;
                }
                Stage::StreamStreaming => unreachable!("no transition leaves STREAM_STREAMING"),
            }

            self.state.lock().unwrap().stage = next;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StreamResult as Result2;
    use crate::transport::{SocketKind, StreamTransportOps};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

    struct FakeTransport {
        kind: TransportKind,
        fail_connect: AtomicBool,
        calls: AtomicU32,
    }

    #[async_trait]
    impl StreamTransportOps for FakeTransport {
        fn kind(&self) -> TransportKind {
            self.kind
        }
        fn socket_kind(&self) -> SocketKind {
            SocketKind::Stream
        }
        async fn stage_prepare(&self) -> Result2<()> {
            Ok(())
        }
        async fn connect(&self, _remote: &str) -> Result2<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_connect.load(Ordering::SeqCst) {
                Err(StreamError::ConnectionRefused)
            } else {
                Ok(())
            }
        }
        async fn listen(&self, _bind_addr: &str) -> Result2<()> {
            Ok(())
        }
        async fn handshake_init(&self, _request: &[u8]) -> Result2<Vec<u8>> {
            Ok(Vec::new())
        }
        async fn handshake_process(&self, _response: &[u8]) -> Result2<()> {
            Ok(())
        }
        async fn session_create(&self, _request: &[u8]) -> Result2<Vec<u8>> {
            let response = SessionCreateResponse {
                success: true,
                session_id: 99,
                error_code: 0,
                error_message: None,
            };
            Ok(response.encode(&FixedMagicProvider).expect("encode succeeds"))
        }
        async fn session_start(&self, _session_id: u32) -> Result2<()> {
            Ok(())
        }
        async fn read(&self) -> Result2<Vec<u8>> {
            Ok(Vec::new())
        }
        async fn write(&self, _data: &[u8]) -> Result2<()> {
            Ok(())
        }
        async fn close(&self) -> Result2<()> {
            Ok(())
        }
    }

    async fn registry_with(http_fails: bool) -> TransportRegistry {
        let registry = TransportRegistry::new();
        registry
            .register(TransportDescriptor {
                kind: TransportKind::Http,
                name: "http".to_string(),
                socket_kind: SocketKind::Stream,
                capabilities: crate::transport::TransportCapabilities::default(),
                mtu_hint: None,
                has_session_control: true,
                ops: Arc::new(FakeTransport {
                    kind: TransportKind::Http,
                    fail_connect: AtomicBool::new(http_fails),
                    calls: AtomicU32::new(0),
                }),
            })
            .await
            .unwrap();
        registry
            .register(TransportDescriptor {
                kind: TransportKind::WebSocket,
                name: "websocket".to_string(),
                socket_kind: SocketKind::Stream,
                capabilities: crate::transport::TransportCapabilities::default(),
                mtu_hint: None,
                has_session_control: true,
                ops: Arc::new(FakeTransport {
                    kind: TransportKind::WebSocket,
                    fail_connect: AtomicBool::new(false),
                    calls: AtomicU32::new(0),
                }),
            })
            .await
            .unwrap();
        registry
    }

    #[tokio::test]
    async fn reaches_streaming_with_no_failures() {
        let registry = registry_with(false).await;
        let client = StageClient::new("127.0.0.1:1".to_string(), vec![TransportKind::Http], false);
        client.go_stage(Stage::StreamStreaming, &registry).await.unwrap();
        assert_eq!(client.current_stage(), Stage::StreamStreaming);
        assert_eq!(client.status(), StageStatus::Complete);
    }

    #[tokio::test]
    async fn session_create_response_is_decoded_into_the_real_session_id() {
        let registry = registry_with(false).await;
        let client = StageClient::new("127.0.0.1:1".to_string(), vec![TransportKind::Http], false);
        assert_eq!(client.session_id(), 0);
        client.go_stage(Stage::StreamStreaming, &registry).await.unwrap();
        assert_eq!(client.session_id(), 99);
    }

    #[tokio::test]
    async fn repeated_go_stage_is_idempotent() {
        let registry = registry_with(false).await;
        let client = StageClient::new("127.0.0.1:1".to_string(), vec![TransportKind::Http], false);
        client.go_stage(Stage::StreamStreaming, &registry).await.unwrap();
        // Second call against an already-satisfied target must not re-run
        // any transition (fast path returns immediately, §8 "two
        // back-to-back go_stage calls ... each invoke their done-callback
        // exactly once").
        client.go_stage(Stage::StreamStreaming, &registry).await.unwrap();
        assert_eq!(client.current_stage(), Stage::StreamStreaming);
    }

    #[tokio::test]
    async fn falls_back_to_next_transport_on_connection_refused() {
        let registry = registry_with(true).await;
        let client = StageClient::new(
            "127.0.0.1:1".to_string(),
            vec![TransportKind::Http, TransportKind::WebSocket],
            false,
        );
        client.go_stage(Stage::StreamStreaming, &registry).await.unwrap();
        assert_eq!(client.current_stage(), Stage::StreamStreaming);
    }

    #[tokio::test]
    async fn exhausting_fallback_list_surfaces_limit_exceeded() {
        let registry = TransportRegistry::new();
        registry
            .register(TransportDescriptor {
                kind: TransportKind::Http,
                name: "http".to_string(),
                socket_kind: SocketKind::Stream,
                capabilities: crate::transport::TransportCapabilities::default(),
                mtu_hint: None,
                has_session_control: true,
                ops: Arc::new(FakeTransport {
                    kind: TransportKind::Http,
                    fail_connect: AtomicBool::new(true),
                    calls: AtomicU32::new(0),
                }),
            })
            .await
            .unwrap();
        let client = StageClient::new("127.0.0.1:1".to_string(), vec![TransportKind::Http], false);
        let result = client.go_stage(Stage::StreamStreaming, &registry).await;
        assert!(matches!(result, Err(StreamError::FallbackLimitExceeded)));
    }
}
