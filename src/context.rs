//! `StreamContext`: the explicit context object bundling the four
//! process-wide tables §5/§9 call out ("no global mutable state other
//! than: transport registry, authorized streams, session store,
//! preferred-encryption setting, debug-flag bools").
//!
//! Grounded on the donor's `NooshdarooClient`/`NooshdarooServer` structs in
//! `lib.rs`, which already bundle a config and a shared library behind one
//! top-level object passed to entry points rather than relying on statics.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::RwLock;

use crate::config::StreamConfig;
use crate::session::SessionStore;
use crate::stream::AuthorizedStreamsIndex;
use crate::transport::TransportRegistry;

/// Bundles the framework's process-wide state. Constructed once per
/// process and shared via `Arc` with every entry point that needs it,
/// rather than kept as `static`s (§9 "Global mutable state").
pub struct StreamContext {
    pub config: StreamConfig,
    pub transports: TransportRegistry,
    pub streams: AuthorizedStreamsIndex,
    pub sessions: SessionStore,
    preferred_encryption: RwLock<String>,
    debug_dump_stream_headers: AtomicBool,
    debug_more: AtomicBool,
}

impl StreamContext {
    pub fn new(config: StreamConfig) -> Self {
        let preferred_encryption = config.stream.preferred_encryption.clone();
        let debug_dump_stream_headers = config.stream.debug_dump_stream_headers;
        let debug_more = config.stream.debug_more;
        Self {
            config,
            transports: TransportRegistry::new(),
            streams: AuthorizedStreamsIndex::new(),
            sessions: SessionStore::new(),
            preferred_encryption: RwLock::new(preferred_encryption),
            debug_dump_stream_headers: AtomicBool::new(debug_dump_stream_headers),
            debug_more: AtomicBool::new(debug_more),
        }
    }

    pub fn preferred_encryption(&self) -> String {
        self.preferred_encryption.read().unwrap().clone()
    }

    pub fn set_preferred_encryption(&self, algorithm: String) {
        *self.preferred_encryption.write().unwrap() = algorithm;
    }

    pub fn debug_dump_stream_headers(&self) -> bool {
        self.debug_dump_stream_headers.load(Ordering::Relaxed)
    }

    pub fn debug_more(&self) -> bool {
        self.debug_more.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn context_seeds_settings_from_config() {
        let mut config = StreamConfig::default();
        config.stream.preferred_encryption = "noise-x25519-chachapoly".to_string();
        config.stream.debug_more = true;
        let ctx = StreamContext::new(config);
        assert_eq!(ctx.preferred_encryption(), "noise-x25519-chachapoly");
        assert!(ctx.debug_more());
        assert!(ctx.streams.is_empty());
    }

    #[test]
    fn preferred_encryption_is_mutable_at_runtime() {
        let ctx = StreamContext::new(StreamConfig::default());
        ctx.set_preferred_encryption("salsa2012".to_string());
        assert_eq!(ctx.preferred_encryption(), "salsa2012");
    }
}
