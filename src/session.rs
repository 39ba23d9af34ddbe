//! Session store: session id → per-session state (§2.3, §3 "Session").
//!
//! Grounded on the donor's `udp_proxy.rs` session-table pattern: an
//! `Arc<RwLock<HashMap<...>>>` guarding session entries, with a periodic
//! sweep evicting stale ones.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;

use rand::RngCore;
use tokio::sync::RwLock;

use crate::crypto::SessionKey;
use crate::error::{StreamError, StreamResult};

/// Per-session state (§3 "Session").
pub struct Session {
    pub id: u32,
    /// Active channel ids, e.g. `"A,B"`. Immutable after creation.
    channels: String,
    key: Arc<dyn SessionKey>,
    created_at_unix: i64,
    create_empty: bool,
    service_key: Option<String>,
    authorized_node_addr: Option<String>,
    opened: AtomicBool,
    last_seen_unix: AtomicI64,
    alive: AtomicBool,
}

impl Session {
    pub fn channels(&self) -> &str {
        &self.channels
    }

    pub fn key(&self) -> &Arc<dyn SessionKey> {
        &self.key
    }

    pub fn created_at_unix(&self) -> i64 {
        self.created_at_unix
    }

    pub fn create_empty(&self) -> bool {
        self.create_empty
    }

    pub fn service_key(&self) -> Option<&str> {
        self.service_key.as_deref()
    }

    pub fn authorized_node_addr(&self) -> Option<&str> {
        self.authorized_node_addr.as_deref()
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    pub fn mark_dead(&self) {
        self.alive.store(false, Ordering::Release)
    }

    pub fn touch(&self, now_unix: i64) {
        self.last_seen_unix.store(now_unix, Ordering::Relaxed);
    }

    pub fn last_seen_unix(&self) -> i64 {
        self.last_seen_unix.load(Ordering::Relaxed)
    }

    /// Opens the session for the first attaching stream. A session may be
    /// opened exactly once (§3 "Session" invariant); subsequent calls
    /// return `AlreadyOpened`.
    pub fn open(&self) -> StreamResult<()> {
        if self.opened.swap(true, Ordering::AcqRel) {
            return Err(StreamError::SessionAlreadyOpened { session_id: self.id });
        }
        Ok(())
    }
}

/// Builder for a new [`Session`]; mirrors the server's handshake-success
/// creation path.
pub struct NewSession {
    pub channels: String,
    pub key: Arc<dyn SessionKey>,
    pub create_empty: bool,
    pub service_key: Option<String>,
    pub authorized_node_addr: Option<String>,
}

/// Maps session id → [`Session`] (§2.3 "Session store").
pub struct SessionStore {
    sessions: RwLock<HashMap<u32, Arc<Session>>>,
}

impl Default for SessionStore {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionStore {
    pub fn new() -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
        }
    }

    /// Creates a session with a random non-zero id, retrying on collision.
    pub async fn create(&self, new: NewSession, now_unix: i64) -> Arc<Session> {
        let mut sessions = self.sessions.write().await;
        let id = loop {
            let candidate = rand::thread_rng().next_u32();
            if candidate != 0 && !sessions.contains_key(&candidate) {
                break candidate;
            }
        };
        let session = Arc::new(Session {
            id,
            channels: new.channels,
            key: new.key,
            created_at_unix: now_unix,
            create_empty: new.create_empty,
            service_key: new.service_key,
            authorized_node_addr: new.authorized_node_addr,
            opened: AtomicBool::new(false),
            last_seen_unix: AtomicI64::new(now_unix),
            alive: AtomicBool::new(true),
        });
        sessions.insert(id, session.clone());
        session
    }

    pub async fn lookup(&self, id: u32) -> Option<Arc<Session>> {
        self.sessions.read().await.get(&id).cloned()
    }

    pub async fn close(&self, id: u32) -> Option<Arc<Session>> {
        let removed = self.sessions.write().await.remove(&id);
        if let Some(session) = &removed {
            session.mark_dead();
        }
        removed
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Evicts sessions whose last activity is older than `max_idle_secs`.
    /// Grounded on `udp_proxy.rs`'s periodic cleanup sweep of the
    /// remote-address session table.
    pub async fn sweep_stale(&self, now_unix: i64, max_idle_secs: i64) -> usize {
        let mut sessions = self.sessions.write().await;
        let before = sessions.len();
        sessions.retain(|_, session| now_unix - session.last_seen_unix() <= max_idle_secs);
        before - sessions.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dummy_key() -> Arc<dyn SessionKey> {
        struct Noop;
        impl SessionKey for Noop {
            fn encrypt(&self, plaintext: &[u8]) -> anyhow::Result<Vec<u8>> {
                Ok(plaintext.to_vec())
            }
            fn decrypt(&self, ciphertext: &[u8]) -> anyhow::Result<Vec<u8>> {
                Ok(ciphertext.to_vec())
            }
            fn overhead(&self) -> usize {
                0
            }
            fn single_packet_capacity(&self) -> usize {
                60_000
            }
            fn block_size(&self) -> u32 {
                32
            }
        }
        Arc::new(Noop)
    }

    #[tokio::test]
    async fn create_then_lookup_round_trips() {
        let store = SessionStore::new();
        let session = store
            .create(
                NewSession {
                    channels: "A,B".to_string(),
                    key: dummy_key(),
                    create_empty: false,
                    service_key: None,
                    authorized_node_addr: None,
                },
                1_000,
            )
            .await;
        let found = store.lookup(session.id).await.unwrap();
        assert_eq!(found.channels(), "A,B");
    }

    #[tokio::test]
    async fn session_opens_exactly_once() {
        let store = SessionStore::new();
        let session = store
            .create(
                NewSession {
                    channels: "A".to_string(),
                    key: dummy_key(),
                    create_empty: false,
                    service_key: None,
                    authorized_node_addr: None,
                },
                1_000,
            )
            .await;
        assert!(session.open().is_ok());
        assert!(session.open().is_err());
    }

    #[tokio::test]
    async fn sweep_evicts_idle_sessions() {
        let store = SessionStore::new();
        let session = store
            .create(
                NewSession {
                    channels: "A".to_string(),
                    key: dummy_key(),
                    create_empty: false,
                    service_key: None,
                    authorized_node_addr: None,
                },
                0,
            )
            .await;
        session.touch(0);
        let evicted = store.sweep_stale(100, 30).await;
        assert_eq!(evicted, 1);
        assert!(store.lookup(session.id).await.is_none());
    }
}
