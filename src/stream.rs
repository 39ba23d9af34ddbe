//! `Stream` object and the process-wide authorized-streams index (§3
//! "Stream", §9 "cyclic references").
//!
//! Grounded on the event-socket/stream-inheritor ownership pattern this
//! core's design is extracted from: the owning direction (task owns
//! `Stream`) is expressed directly in the type system instead of the
//! original's manual tagged-pointer cycle, so `Stream`'s back-reference to
//! its owning task is a [`Weak`]-style handle rather than a strong `Arc`
//! (see the module doc on cyclic references in the expanded spec).

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use log::{info, warn};
use tokio::task::JoinHandle;

use crate::channel::ChannelTable;
use crate::codec::StreamCodec;
use crate::session::Session;

/// Back-reference to the task that owns a [`Stream`]. Deliberately
/// non-owning: the owning direction is the task holding the `Stream`
/// directly, never the reverse.
pub struct TaskHandle {
    pub task_id: u64,
    abort: Option<tokio::task::AbortHandle>,
}

impl TaskHandle {
    pub fn new(task_id: u64, join: &JoinHandle<()>) -> Self {
        Self {
            task_id,
            abort: Some(join.abort_handle()),
        }
    }

    pub fn abort(&self) {
        if let Some(handle) = &self.abort {
            handle.abort();
        }
    }
}

/// Per-connection state (§3 "Stream"). One `Stream` exists per accepted
/// server connection or per client connection that has reached
/// `STAGE_STREAM_SESSION`.
pub struct Stream {
    pub id: u64,
    transport_name: String,
    session: Mutex<Option<Arc<Session>>>,
    channels: Mutex<ChannelTable>,
    codec: Mutex<StreamCodec>,
    node_addr: Option<String>,
    owner_task: Mutex<Option<TaskHandle>>,
    authorized: AtomicBool,
    primary: AtomicBool,
    is_client_to_uplink: AtomicBool,
    closing: AtomicBool,
    is_active: AtomicBool,
}

impl Stream {
    pub fn new(id: u64, transport_name: String, node_addr: Option<String>, codec: StreamCodec) -> Self {
        Self {
            id,
            transport_name,
            session: Mutex::new(None),
            channels: Mutex::new(ChannelTable::new()),
            codec: Mutex::new(codec),
            node_addr,
            owner_task: Mutex::new(None),
            authorized: AtomicBool::new(false),
            primary: AtomicBool::new(false),
            is_client_to_uplink: AtomicBool::new(false),
            closing: AtomicBool::new(false),
            is_active: AtomicBool::new(true),
        }
    }

    pub fn transport_name(&self) -> &str {
        &self.transport_name
    }

    pub fn node_addr(&self) -> Option<&str> {
        self.node_addr.as_deref()
    }

    pub fn set_owner_task(&self, handle: TaskHandle) {
        *self.owner_task.lock().unwrap() = Some(handle);
    }

    pub fn attach_session(&self, session: Arc<Session>) {
        *self.session.lock().unwrap() = Some(session);
    }

    pub fn session(&self) -> Option<Arc<Session>> {
        self.session.lock().unwrap().clone()
    }

    pub fn channels(&self) -> std::sync::MutexGuard<'_, ChannelTable> {
        self.channels.lock().unwrap()
    }

    pub fn codec(&self) -> std::sync::MutexGuard<'_, StreamCodec> {
        self.codec.lock().unwrap()
    }

    pub fn is_authorized(&self) -> bool {
        self.authorized.load(Ordering::Acquire)
    }

    pub fn set_authorized(&self, value: bool) {
        self.authorized.store(value, Ordering::Release)
    }

    pub fn is_primary(&self) -> bool {
        self.primary.load(Ordering::Acquire)
    }

    fn set_primary(&self, value: bool) {
        self.primary.store(value, Ordering::Release)
    }

    pub fn is_client_to_uplink(&self) -> bool {
        self.is_client_to_uplink.load(Ordering::Acquire)
    }

    pub fn set_client_to_uplink(&self, value: bool) {
        self.is_client_to_uplink.store(value, Ordering::Release)
    }

    pub fn is_closing(&self) -> bool {
        self.closing.load(Ordering::Acquire)
    }

    pub fn is_active(&self) -> bool {
        self.is_active.load(Ordering::Acquire)
    }

    pub fn set_active(&self, value: bool) {
        self.is_active.store(value, Ordering::Release)
    }

    /// Registers one channel per id named in `spec` (e.g. `"A,B"`), each
    /// wired with a default notifier that logs delivery. The framework
    /// itself has no opinion on application-level channel semantics (§1
    /// non-goal); this gives every adapter's server receive path somewhere
    /// real to deliver decoded channel-packets to instead of discarding
    /// them after decode (§2/§4.2 "route decrypted stream bytes ... into
    /// the matched channel handler").
    pub fn install_default_channels(&self, spec: &str) {
        let mut channels = self.channels();
        let remote = self.node_addr().unwrap_or("unknown").to_string();
        for part in spec.split(',') {
            let Some(id) = part.trim().bytes().next() else { continue };
            let channel = channels.get_or_create(id);
            let remote = remote.clone();
            channel.add_notifier(Box::new(move |channel_id, packet_type, data| {
                info!(
                    "stream: channel '{}' delivered {} bytes (type=0x{:02x}) from {}",
                    channel_id as char,
                    data.len(),
                    packet_type,
                    remote
                );
            }));
        }
    }

    /// Begins close: marks `closing`, stops dispatching to channel
    /// notifiers, and aborts the owning task's keep-alive bookkeeping.
    /// Transport `close()` must have already run before this is called
    /// (§9 close ordering).
    pub fn begin_close(&self) {
        self.closing.store(true, Ordering::Release);
        self.channels.lock().unwrap().close_all();
        if let Some(owner) = self.owner_task.lock().unwrap().take() {
            owner.abort();
        }
        info!("stream {} closing (transport={})", self.id, self.transport_name);
    }
}

struct IndexInner {
    /// Every live stream, keyed by id. Stands in for the original's
    /// doubly-linked list: idiomatic Rust reaches for a hash map rather
    /// than an intrusive list, and iteration order is not load-bearing
    /// here (only membership and per-node lookup are).
    all: HashMap<u64, Arc<Stream>>,
    /// node address → id of that node's primary authorized stream.
    primary_by_node: HashMap<String, u64>,
}

/// Authorized-streams index (§3 "Authorized-streams index"): every stream
/// in the process plus a node-address → primary-stream map, sharing one
/// reader-writer lock.
pub struct AuthorizedStreamsIndex {
    inner: RwLock<IndexInner>,
}

impl Default for AuthorizedStreamsIndex {
    fn default() -> Self {
        Self::new()
    }
}

impl AuthorizedStreamsIndex {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(IndexInner {
                all: HashMap::new(),
                primary_by_node: HashMap::new(),
            }),
        }
    }

    /// Registers `stream`. If it is `authorized` and is the first stream
    /// seen for its node address, it becomes that node's primary.
    pub fn register(&self, stream: Arc<Stream>) {
        let mut inner = self.inner.write().unwrap();
        if stream.is_authorized() {
            if let Some(node_addr) = stream.node_addr() {
                if !inner.primary_by_node.contains_key(node_addr) {
                    stream.set_primary(true);
                    inner.primary_by_node.insert(node_addr.to_string(), stream.id);
                }
            }
        }
        inner.all.insert(stream.id, stream);
    }

    /// Unregisters a stream. If it was its node's primary, promotes
    /// another stream with the same node address, if one remains (§3
    /// "When the primary stream disappears, any other stream in the list
    /// with that node address is promoted").
    pub fn unregister(&self, id: u64) {
        let mut inner = self.inner.write().unwrap();
        let removed = match inner.all.remove(&id) {
            Some(stream) => stream,
            None => return,
        };

        if !removed.is_primary() {
            return;
        }
        let node_addr = match removed.node_addr() {
            Some(addr) => addr.to_string(),
            None => return,
        };
        inner.primary_by_node.remove(&node_addr);

        let promoted = inner
            .all
            .values()
            .find(|candidate| candidate.is_authorized() && candidate.node_addr() == Some(node_addr.as_str()))
            .cloned();
        if let Some(candidate) = promoted {
            candidate.set_primary(true);
            inner.primary_by_node.insert(node_addr.clone(), candidate.id);
            info!("promoted stream {} to primary for node {}", candidate.id, node_addr);
        } else {
            warn!("no remaining stream to promote as primary for node {}", node_addr);
        }
    }

    pub fn primary_for_node(&self, node_addr: &str) -> Option<Arc<Stream>> {
        let inner = self.inner.read().unwrap();
        let id = *inner.primary_by_node.get(node_addr)?;
        inner.all.get(&id).cloned()
    }

    pub fn find(&self, id: u64) -> Option<Arc<Stream>> {
        self.inner.read().unwrap().all.get(&id).cloned()
    }

    pub fn len(&self) -> usize {
        self.inner.read().unwrap().all.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::magic::FixedMagicProvider;

    fn stream(id: u64, node_addr: &str, authorized: bool) -> Arc<Stream> {
        let codec = StreamCodec::new(Arc::new(FixedMagicProvider));
        let stream = Arc::new(Stream::new(id, "http".to_string(), Some(node_addr.to_string()), codec));
        stream.set_authorized(authorized);
        stream
    }

    #[test]
    fn first_authorized_stream_for_a_node_becomes_primary() {
        let index = AuthorizedStreamsIndex::new();
        let a = stream(1, "10.0.0.1", true);
        index.register(a.clone());
        assert!(a.is_primary());
        assert_eq!(index.primary_for_node("10.0.0.1").unwrap().id, 1);
    }

    #[test]
    fn second_stream_for_same_node_does_not_steal_primary() {
        let index = AuthorizedStreamsIndex::new();
        let a = stream(1, "10.0.0.1", true);
        let b = stream(2, "10.0.0.1", true);
        index.register(a.clone());
        index.register(b.clone());
        assert!(a.is_primary());
        assert!(!b.is_primary());
    }

    #[test]
    fn removing_primary_promotes_remaining_stream() {
        let index = AuthorizedStreamsIndex::new();
        let a = stream(1, "10.0.0.1", true);
        let b = stream(2, "10.0.0.1", true);
        index.register(a.clone());
        index.register(b.clone());
        index.unregister(a.id);
        assert!(b.is_primary());
        assert_eq!(index.primary_for_node("10.0.0.1").unwrap().id, 2);
    }

    #[test]
    fn removing_only_stream_for_a_node_leaves_no_primary() {
        let index = AuthorizedStreamsIndex::new();
        let a = stream(1, "10.0.0.1", true);
        index.register(a.clone());
        index.unregister(a.id);
        assert!(index.primary_for_node("10.0.0.1").is_none());
    }
}
