//! Pluggable byte-sequence providers for the two magic constants the wire
//! formats rely on to find their own framing inside a byte stream.
//!
//! The handshake magic is a fixed 32-bit pattern in the source this core is
//! extracted from, which the source itself documents as an easy DPI
//! signature. Rather than forking the codec to substitute a different
//! magic, obfuscation strategies implement [`MagicProvider`].

/// Stream packet framing magic, 8 bytes, scanned for by the packet codec.
pub const STREAM_PACKET_MAGIC: [u8; 8] = *b"\x19\xAFDPSS\x31\x01";

/// DSHP handshake magic, 4 bytes big-endian ('DAPS').
pub const HANDSHAKE_MAGIC: u32 = 0x44415053;

/// DSHP protocol version, 4 bytes big-endian (major.minor.patch.build).
pub const HANDSHAKE_VERSION: u32 = 0x01000000;

/// Supplies the byte sequences used to frame stream packets and handshake
/// messages. The default provider returns the fixed constants above;
/// obfuscation-aware deployments can substitute a session-derived or
/// rotating sequence without touching [`crate::codec`] or
/// [`crate::handshake`].
pub trait MagicProvider: Send + Sync {
    fn stream_packet_magic(&self) -> [u8; 8] {
        STREAM_PACKET_MAGIC
    }

    fn handshake_magic(&self) -> u32 {
        HANDSHAKE_MAGIC
    }
}

/// The provider used when no obfuscation strategy is configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct FixedMagicProvider;

impl MagicProvider for FixedMagicProvider {}
