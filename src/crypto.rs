//! The `Key`/`Cert`/`Sign` capability set.
//!
//! The cryptographic primitive library (symmetric ciphers, KEM, signatures,
//! certificate store) is an external collaborator of this core; only the
//! shape of the capability it must provide is specified here. [`SessionKey`]
//! is the symmetric-encryption capability used by the packet codec,
//! [`Kem`] is the key-encapsulation capability used by the UDP handshake,
//! and [`Signer`]/[`CertStore`] are the optional authentication capabilities
//! referenced by the handshake's alice/bob credential fields.
//!
//! This crate ships one concrete instantiation of each trait so the rest of
//! the framework is exercisable end to end: [`NoiseSessionKey`] wraps a
//! `snow` transport state, and [`X25519Kem`] wraps X25519 Diffie-Hellman
//! agreement from `ring`, used as a Diffie-Hellman-based KEM (encapsulate =
//! generate an ephemeral keypair and agree; decapsulate = agree with the
//! stored ephemeral secret). Neither is the only valid implementation: a
//! deployment that needs a true post-quantum KEM substitutes its own `Kem`
//! impl without touching the handshake or codec.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use anyhow::{anyhow, Context, Result};
use ring::aead::{Aad, LessSafeKey, Nonce, UnboundKey, CHACHA20_POLY1305, NONCE_LEN};
use ring::agreement;
use ring::digest;
use ring::rand::{SecureRandom, SystemRandom};
use snow::{Builder, TransportState};

/// Symmetric session-key capability: encrypts/decrypts stream-packet
/// payloads end to end (§3 "Session key").
pub trait SessionKey: Send + Sync {
    /// Encrypts `plaintext`, returning ciphertext plus any authentication
    /// tag the cipher appends.
    fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>>;

    /// Decrypts `ciphertext`, returning the original plaintext.
    fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>>;

    /// The plaintext size the codec should expect to recover from a
    /// ciphertext of `ciphertext_len` bytes. Used to validate the inner
    /// `data_size` field of a decoded channel-packet (§4.2's
    /// decode-size-mismatch check).
    fn decode_size(&self, ciphertext_len: usize) -> usize {
        ciphertext_len.saturating_sub(self.overhead())
    }

    /// Fixed per-message overhead the cipher adds (nonce/tag bytes folded
    /// into the ciphertext, if any).
    fn overhead(&self) -> usize;

    /// Largest plaintext the codec may hand to [`SessionKey::encrypt`] in a
    /// single, unfragmented channel-packet; larger writes are split into
    /// `FRAGMENT` packets by the codec (§4.2 step 2).
    fn single_packet_capacity(&self) -> usize;

    /// Symmetric key block size, used by the handshake's `block_key_size`
    /// TLV field.
    fn block_size(&self) -> u32;
}

/// Noise-protocol-backed [`SessionKey`], grounded on the donor's
/// `noise_transport.rs` wrapper around `snow`.
pub struct NoiseSessionKey {
    transport: Mutex<TransportState>,
    capacity: usize,
}

impl NoiseSessionKey {
    /// `transport` must already be in transport mode (post-handshake).
    /// `capacity` is the maximum plaintext size per Noise message; the
    /// Noise wire format caps a single message at 65535 bytes including a
    /// 16-byte Poly1305 tag, so `capacity` must leave room for that.
    pub fn new(transport: TransportState, capacity: usize) -> Self {
        Self {
            transport: Mutex::new(transport),
            capacity,
        }
    }

    /// Builds a pair of session keys directly from an already-agreed shared
    /// secret, using Noise `N` one-way pattern parameters keyed by a
    /// pre-shared symmetric value. This is the bridge used by the UDP
    /// adapter's session-create step: the handshake key wraps the session
    /// key as raw bytes, not as a Noise handshake, so this helper exists
    /// only for the HTTP/WebSocket path where a full Noise handshake runs.
    pub fn from_initiator_handshake(
        pattern: &str,
        local_private: &[u8],
        remote_public: &[u8],
        capacity: usize,
    ) -> Result<Self> {
        let builder = Builder::new(pattern.parse().context("invalid noise pattern")?);
        let mut handshake = builder
            .local_private_key(local_private)
            .remote_public_key(remote_public)
            .build_initiator()?;
        let mut buf = [0u8; 64];
        let len = handshake.write_message(&[], &mut buf)?;
        let _ = &buf[..len];
        let transport = handshake.into_transport_mode()?;
        Ok(Self::new(transport, capacity))
    }
}

impl SessionKey for NoiseSessionKey {
    fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let mut out = vec![0u8; plaintext.len() + self.overhead()];
        let mut guard = self.transport.lock().map_err(|_| anyhow!("noise state poisoned"))?;
        let len = guard.write_message(plaintext, &mut out)?;
        out.truncate(len);
        Ok(out)
    }

    fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>> {
        let mut out = vec![0u8; ciphertext.len()];
        let mut guard = self.transport.lock().map_err(|_| anyhow!("noise state poisoned"))?;
        let len = guard.read_message(ciphertext, &mut out)?;
        out.truncate(len);
        Ok(out)
    }

    fn overhead(&self) -> usize {
        16 // Poly1305 tag
    }

    fn single_packet_capacity(&self) -> usize {
        self.capacity
    }

    fn block_size(&self) -> u32 {
        32
    }
}

/// Key-encapsulation capability (§3/§4.6/GLOSSARY "KEM"): produces a
/// ciphertext and shared secret from a peer's public key; decapsulating the
/// ciphertext with the matching secret recovers the same shared secret.
pub trait Kem: Send + Sync {
    fn public_key_size(&self) -> u32;

    /// Generates a fresh keypair. Returns the public key bytes and an
    /// opaque secret handle.
    fn generate_keypair(&self) -> Result<(Vec<u8>, KemSecret)>;

    /// Encapsulates against `peer_public`, returning `(ciphertext,
    /// shared_secret)`.
    fn encapsulate(&self, peer_public: &[u8]) -> Result<(Vec<u8>, Vec<u8>)>;

    /// Decapsulates `ciphertext` using `secret`, recovering the shared
    /// secret that [`Kem::encapsulate`] derived.
    fn decapsulate(&self, secret: KemSecret, ciphertext: &[u8]) -> Result<Vec<u8>>;
}

/// Opaque KEM secret handle. Single-use: [`Kem::decapsulate`] consumes it.
pub struct KemSecret(agreement::EphemeralPrivateKey);

/// X25519-Diffie-Hellman instantiation of [`Kem`].
///
/// This is not a post-quantum primitive; it satisfies the `Kem` trait's
/// contract (ciphertext + shared secret from a public key) using classical
/// ECDH, matching the concrete crypto stack this crate already depends on
/// via `ring`. A deployment requiring a true post-quantum KEM substitutes
/// its own implementation.
#[derive(Default)]
pub struct X25519Kem;

impl Kem for X25519Kem {
    fn public_key_size(&self) -> u32 {
        32
    }

    fn generate_keypair(&self) -> Result<(Vec<u8>, KemSecret)> {
        let rng = SystemRandom::new();
        let secret = agreement::EphemeralPrivateKey::generate(&agreement::X25519, &rng)
            .map_err(|_| anyhow!("x25519 keypair generation failed"))?;
        let public = secret
            .compute_public_key()
            .map_err(|_| anyhow!("x25519 public key derivation failed"))?;
        Ok((public.as_ref().to_vec(), KemSecret(secret)))
    }

    fn encapsulate(&self, peer_public: &[u8]) -> Result<(Vec<u8>, Vec<u8>)> {
        let rng = SystemRandom::new();
        let ephemeral = agreement::EphemeralPrivateKey::generate(&agreement::X25519, &rng)
            .map_err(|_| anyhow!("x25519 ephemeral keypair generation failed"))?;
        let ciphertext = ephemeral
            .compute_public_key()
            .map_err(|_| anyhow!("x25519 public key derivation failed"))?
            .as_ref()
            .to_vec();
        let peer = agreement::UnparsedPublicKey::new(&agreement::X25519, peer_public);
        let shared = agreement::agree_ephemeral(ephemeral, &peer, anyhow!("x25519 agreement failed"), |secret| {
            Ok(secret.to_vec())
        })?;
        Ok((ciphertext, shared))
    }

    fn decapsulate(&self, secret: KemSecret, ciphertext: &[u8]) -> Result<Vec<u8>> {
        let peer = agreement::UnparsedPublicKey::new(&agreement::X25519, ciphertext);
        agreement::agree_ephemeral(secret.0, &peer, anyhow!("x25519 agreement failed"), |s| Ok(s.to_vec()))
    }
}

/// Domain-separates a single KEM shared secret into the UDP adapter's two
/// distinct keys (handshake key, session key) via a labeled digest, rather
/// than transmitting the session key under the handshake key as the
/// original protocol text suggests — both derive from the same agreed
/// secret, so sending one under the other adds no security margin and
/// would require a wire field this core's TLV messages do not carry.
pub fn derive_labeled_key(shared_secret: &[u8], label: &[u8]) -> [u8; 32] {
    let mut input = Vec::with_capacity(shared_secret.len() + label.len());
    input.extend_from_slice(shared_secret);
    input.extend_from_slice(label);
    let digest = digest::digest(&digest::SHA256, &input);
    let mut out = [0u8; 32];
    out.copy_from_slice(digest.as_ref());
    out
}

/// [`SessionKey`] backed directly by a raw 32-byte AEAD key rather than a
/// Noise handshake, used by the UDP adapter (§4.6) where the key comes
/// straight out of a KEM shared secret. Each message embeds its own
/// 12-byte nonce so datagrams can be decrypted independently of arrival
/// order (§8 "UDP reorder resilience"): a shared send/receive counter
/// would desynchronize under reordering or loss.
pub struct RawAeadSessionKey {
    key: LessSafeKey,
    send_counter: AtomicU64,
    capacity: usize,
}

impl RawAeadSessionKey {
    pub fn new(key_bytes: &[u8; 32], capacity: usize) -> Result<Self> {
        let unbound = UnboundKey::new(&CHACHA20_POLY1305, key_bytes).map_err(|_| anyhow!("invalid AEAD key length"))?;
        Ok(Self {
            key: LessSafeKey::new(unbound),
            send_counter: AtomicU64::new(1),
            capacity,
        })
    }
}

impl SessionKey for RawAeadSessionKey {
    fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let counter = self.send_counter.fetch_add(1, Ordering::Relaxed);
        let mut nonce_bytes = [0u8; NONCE_LEN];
        nonce_bytes[4..].copy_from_slice(&counter.to_be_bytes());
        let nonce = Nonce::assume_unique_for_key(nonce_bytes);

        let mut buf = plaintext.to_vec();
        self.key
            .seal_in_place_append_tag(nonce, Aad::empty(), &mut buf)
            .map_err(|_| anyhow!("AEAD seal failed"))?;
        let mut out = Vec::with_capacity(NONCE_LEN + buf.len());
        out.extend_from_slice(&nonce_bytes);
        out.extend_from_slice(&buf);
        Ok(out)
    }

    fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>> {
        if ciphertext.len() < NONCE_LEN {
            bail_short(ciphertext.len())?;
        }
        let mut nonce_bytes = [0u8; NONCE_LEN];
        nonce_bytes.copy_from_slice(&ciphertext[..NONCE_LEN]);
        let nonce = Nonce::assume_unique_for_key(nonce_bytes);

        let mut buf = ciphertext[NONCE_LEN..].to_vec();
        let plaintext = self
            .key
            .open_in_place(nonce, Aad::empty(), &mut buf)
            .map_err(|_| anyhow!("AEAD open failed"))?;
        Ok(plaintext.to_vec())
    }

    fn overhead(&self) -> usize {
        NONCE_LEN + 16
    }

    fn single_packet_capacity(&self) -> usize {
        self.capacity
    }

    fn block_size(&self) -> u32 {
        32
    }
}

fn bail_short(len: usize) -> Result<()> {
    Err(anyhow!("ciphertext of {} bytes shorter than nonce", len))
}

/// Generates a fresh random 12-byte value, used by the UDP adapter to seed
/// anything needing a nonce outside [`RawAeadSessionKey`] itself.
pub fn random_bytes(len: usize) -> Result<Vec<u8>> {
    let rng = SystemRandom::new();
    let mut buf = vec![0u8; len];
    rng.fill(&mut buf).map_err(|_| anyhow!("system RNG failure"))?;
    Ok(buf)
}

/// Optional signing capability referenced by the handshake's alice/bob
/// signature fields. No concrete instantiation ships in this crate; a
/// deployment that requires authenticated handshakes provides one.
pub trait Signer: Send + Sync {
    fn sign(&self, message: &[u8]) -> Result<Vec<u8>>;
    fn verify(&self, message: &[u8], signature: &[u8]) -> Result<bool>;
}

/// Optional certificate-store capability referenced by the handshake's
/// `alice_cert` field: "find by name → key handle".
pub trait CertStore: Send + Sync {
    fn find_by_name(&self, name: &str) -> Result<Option<Vec<u8>>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn x25519_kem_round_trips() {
        let kem = X25519Kem::default();
        let (public, secret) = kem.generate_keypair().unwrap();
        let (ciphertext, shared_enc) = kem.encapsulate(&public).unwrap();
        let shared_dec = kem.decapsulate(secret, &ciphertext).unwrap();
        assert_eq!(shared_enc, shared_dec);
    }

    #[test]
    fn raw_aead_session_key_round_trips_and_tolerates_reorder() {
        let key_bytes = derive_labeled_key(b"shared-secret", b"session");
        let key = RawAeadSessionKey::new(&key_bytes, 60_000).unwrap();
        let a = key.encrypt(b"first").unwrap();
        let b = key.encrypt(b"second").unwrap();
        // Independent nonces per message mean decryption order need not
        // match encryption order.
        assert_eq!(key.decrypt(&b).unwrap(), b"second");
        assert_eq!(key.decrypt(&a).unwrap(), b"first");
    }

    #[test]
    fn derive_labeled_key_separates_handshake_and_session_keys() {
        let shared = b"kem-shared-secret";
        let handshake_key = derive_labeled_key(shared, b"handshake");
        let session_key = derive_labeled_key(shared, b"session");
        assert_ne!(handshake_key, session_key);
    }
}
