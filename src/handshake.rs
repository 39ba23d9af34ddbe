//! Transport-agnostic TLV handshake codec (§4.7).
//!
//! Wire format: 4-byte magic, 4-byte version, then a sequence of
//! `{type: u16 network order, length: u16 network order, value: length
//! bytes}`. Byte layout and the type-id range partitioning are taken from
//! the handshake protocol header this core's design is extracted from,
//! since spec.md states them only at the summary level.

use std::collections::HashMap;

use anyhow::{anyhow, bail, Result};

use crate::magic::{MagicProvider, HANDSHAKE_VERSION};

/// Maximum single TLV value (§4.7).
pub const MAX_TLV_VALUE_SIZE: usize = 65_535;

/// The six message types in the handshake protocol's lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum MessageType {
    HandshakeRequest = 0x0001,
    HandshakeResponse = 0x0002,
    SessionCreate = 0x0003,
    SessionCreateResponse = 0x0004,
    StreamReady = 0x0005,
    StreamStart = 0x0006,
}

impl MessageType {
    fn from_u16(v: u16) -> Result<Self> {
        Ok(match v {
            0x0001 => MessageType::HandshakeRequest,
            0x0002 => MessageType::HandshakeResponse,
            0x0003 => MessageType::SessionCreate,
            0x0004 => MessageType::SessionCreateResponse,
            0x0005 => MessageType::StreamReady,
            0x0006 => MessageType::StreamStart,
            other => bail!("unknown handshake message type 0x{:04x}", other),
        })
    }
}

/// TLV type identifiers, partitioned into ranges by concern.
#[allow(dead_code)]
mod tlv_type {
    // 0x01xx - header/control
    pub const MESSAGE_TYPE: u16 = 0x0102;
    pub const STATUS: u16 = 0x0103;
    // 0x02xx - encryption params
    pub const ENC_TYPE: u16 = 0x0200;
    pub const PKEY_EXCHANGE_TYPE: u16 = 0x0201;
    pub const PKEY_EXCHANGE_SIZE: u16 = 0x0202;
    pub const BLOCK_KEY_SIZE: u16 = 0x0203;
    // 0x03xx - alice credentials
    pub const ALICE_PUB_KEY: u16 = 0x0300;
    pub const ALICE_SIGNATURE: u16 = 0x0301;
    pub const ALICE_CERT: u16 = 0x0302;
    // 0x05xx - session management
    pub const SESSION_ID: u16 = 0x0500;
    pub const SESSION_TIMEOUT: u16 = 0x0501;
    // 0x06xx - bob credentials
    pub const BOB_PUB_KEY: u16 = 0x0600;
    pub const BOB_SIGNATURE: u16 = 0x0601;
    // 0x07xx - errors
    pub const ERROR_CODE: u16 = 0x0700;
    pub const ERROR_MESSAGE: u16 = 0x0701;
    // 0x08xx - stream params
    pub const CHANNELS: u16 = 0x0800;
    pub const STREAM_ENC_TYPE: u16 = 0x0801;
    pub const STREAM_ENC_SIZE: u16 = 0x0802;
    pub const STREAM_ENC_HDR: u16 = 0x0803;
}

/// Appends one TLV field to `buf`.
fn write_tlv(buf: &mut Vec<u8>, ty: u16, value: &[u8]) -> Result<()> {
    if value.len() > MAX_TLV_VALUE_SIZE {
        bail!("TLV value for type 0x{:04x} exceeds {} bytes", ty, MAX_TLV_VALUE_SIZE);
    }
    buf.extend_from_slice(&ty.to_be_bytes());
    buf.extend_from_slice(&(value.len() as u16).to_be_bytes());
    buf.extend_from_slice(value);
    Ok(())
}

/// Parses every TLV field out of `data` into a type → value map. Later
/// duplicate types overwrite earlier ones.
fn read_all_tlv(data: &[u8]) -> Result<HashMap<u16, Vec<u8>>> {
    let mut out = HashMap::new();
    let mut offset = 0;
    while offset < data.len() {
        if data.len() - offset < 4 {
            bail!("truncated TLV header at offset {}", offset);
        }
        let ty = u16::from_be_bytes([data[offset], data[offset + 1]]);
        let len = u16::from_be_bytes([data[offset + 2], data[offset + 3]]) as usize;
        offset += 4;
        if data.len() - offset < len {
            bail!("truncated TLV value at offset {}", offset);
        }
        out.insert(ty, data[offset..offset + len].to_vec());
        offset += len;
    }
    Ok(out)
}

fn message_header(magic: &dyn MagicProvider, message_type: MessageType) -> Vec<u8> {
    let mut buf = Vec::with_capacity(16);
    buf.extend_from_slice(&magic.handshake_magic().to_be_bytes());
    buf.extend_from_slice(&HANDSHAKE_VERSION.to_be_bytes());
    // message type is itself a TLV so the parser can validate it uniformly
    // alongside every other field.
    write_tlv(&mut buf, tlv_type::MESSAGE_TYPE, &(message_type as u16).to_be_bytes()).unwrap();
    buf
}

fn validate_header(data: &[u8], magic: &dyn MagicProvider) -> Result<(u32, &[u8])> {
    if data.len() < 8 {
        bail!("handshake message shorter than fixed header");
    }
    let got_magic = u32::from_be_bytes([data[0], data[1], data[2], data[3]]);
    if got_magic != magic.handshake_magic() {
        bail!("handshake magic mismatch: got 0x{:08x}", got_magic);
    }
    let version = u32::from_be_bytes([data[4], data[5], data[6], data[7]]);
    if version != HANDSHAKE_VERSION {
        bail!("unsupported handshake version 0x{:08x}", version);
    }
    Ok((version, &data[8..]))
}

fn require<'a>(fields: &'a HashMap<u16, Vec<u8>>, ty: u16, what: &str) -> Result<&'a [u8]> {
    fields.get(&ty).map(|v| v.as_slice()).ok_or_else(|| anyhow!("missing required field: {}", what))
}

/// Client → Server: initial handshake carrying KEM/encryption parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeRequest {
    pub enc_type: u8,
    pub pkey_exchange_type: u8,
    pub pkey_exchange_size: u32,
    pub block_key_size: u32,
    pub alice_pub_key: Vec<u8>,
    pub alice_signature: Option<Vec<u8>>,
}

impl HandshakeRequest {
    pub fn encode(&self, magic: &dyn MagicProvider) -> Result<Vec<u8>> {
        let mut buf = message_header(magic, MessageType::HandshakeRequest);
        write_tlv(&mut buf, tlv_type::ENC_TYPE, &[self.enc_type])?;
        write_tlv(&mut buf, tlv_type::PKEY_EXCHANGE_TYPE, &[self.pkey_exchange_type])?;
        write_tlv(&mut buf, tlv_type::PKEY_EXCHANGE_SIZE, &self.pkey_exchange_size.to_be_bytes())?;
        write_tlv(&mut buf, tlv_type::BLOCK_KEY_SIZE, &self.block_key_size.to_be_bytes())?;
        write_tlv(&mut buf, tlv_type::ALICE_PUB_KEY, &self.alice_pub_key)?;
        if let Some(sig) = &self.alice_signature {
            write_tlv(&mut buf, tlv_type::ALICE_SIGNATURE, sig)?;
        }
        Ok(buf)
    }

    pub fn decode(data: &[u8], magic: &dyn MagicProvider) -> Result<Self> {
        let (_, body) = validate_header(data, magic)?;
        let fields = read_all_tlv(body)?;
        let message_type = u16::from_be_bytes(
            require(&fields, tlv_type::MESSAGE_TYPE, "message_type")?
                .try_into()
                .map_err(|_| anyhow!("malformed message_type field"))?,
        );
        if MessageType::from_u16(message_type)? != MessageType::HandshakeRequest {
            bail!("expected HANDSHAKE_REQUEST, got 0x{:04x}", message_type);
        }
        Ok(Self {
            enc_type: require(&fields, tlv_type::ENC_TYPE, "enc_type")?[0],
            pkey_exchange_type: require(&fields, tlv_type::PKEY_EXCHANGE_TYPE, "pkey_exchange_type")?[0],
            pkey_exchange_size: u32::from_be_bytes(
                require(&fields, tlv_type::PKEY_EXCHANGE_SIZE, "pkey_exchange_size")?
                    .try_into()
                    .map_err(|_| anyhow!("malformed pkey_exchange_size"))?,
            ),
            block_key_size: u32::from_be_bytes(
                require(&fields, tlv_type::BLOCK_KEY_SIZE, "block_key_size")?
                    .try_into()
                    .map_err(|_| anyhow!("malformed block_key_size"))?,
            ),
            alice_pub_key: require(&fields, tlv_type::ALICE_PUB_KEY, "alice_pub_key")?.to_vec(),
            alice_signature: fields.get(&tlv_type::ALICE_SIGNATURE).cloned(),
        })
    }
}

/// Server → Client: handshake result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeResponse {
    pub success: bool,
    pub session_id: u32,
    pub bob_pub_key: Vec<u8>,
    pub bob_signature: Option<Vec<u8>>,
    pub error_code: u32,
    pub error_message: Option<String>,
}

impl HandshakeResponse {
    pub fn encode(&self, magic: &dyn MagicProvider) -> Result<Vec<u8>> {
        let mut buf = message_header(magic, MessageType::HandshakeResponse);
        write_tlv(&mut buf, tlv_type::STATUS, &[if self.success { 0 } else { 1 }])?;
        if self.success {
            write_tlv(&mut buf, tlv_type::SESSION_ID, &self.session_id.to_be_bytes())?;
            write_tlv(&mut buf, tlv_type::BOB_PUB_KEY, &self.bob_pub_key)?;
            if let Some(sig) = &self.bob_signature {
                write_tlv(&mut buf, tlv_type::BOB_SIGNATURE, sig)?;
            }
        } else {
            write_tlv(&mut buf, tlv_type::ERROR_CODE, &self.error_code.to_be_bytes())?;
            if let Some(msg) = &self.error_message {
                write_tlv(&mut buf, tlv_type::ERROR_MESSAGE, msg.as_bytes())?;
            }
        }
        Ok(buf)
    }

    pub fn decode(data: &[u8], magic: &dyn MagicProvider) -> Result<Self> {
        let (_, body) = validate_header(data, magic)?;
        let fields = read_all_tlv(body)?;
        let message_type = u16::from_be_bytes(
            require(&fields, tlv_type::MESSAGE_TYPE, "message_type")?
                .try_into()
                .map_err(|_| anyhow!("malformed message_type field"))?,
        );
        if MessageType::from_u16(message_type)? != MessageType::HandshakeResponse {
            bail!("expected HANDSHAKE_RESPONSE, got 0x{:04x}", message_type);
        }
        let success = require(&fields, tlv_type::STATUS, "status")?[0] == 0;
        if success {
            Ok(Self {
                success: true,
                session_id: u32::from_be_bytes(
                    require(&fields, tlv_type::SESSION_ID, "session_id")?
                        .try_into()
                        .map_err(|_| anyhow!("malformed session_id"))?,
                ),
                bob_pub_key: require(&fields, tlv_type::BOB_PUB_KEY, "bob_pub_key")?.to_vec(),
                bob_signature: fields.get(&tlv_type::BOB_SIGNATURE).cloned(),
                error_code: 0,
                error_message: None,
            })
        } else {
            Ok(Self {
                success: false,
                session_id: 0,
                bob_pub_key: Vec::new(),
                bob_signature: None,
                error_code: u32::from_be_bytes(
                    require(&fields, tlv_type::ERROR_CODE, "error_code")?
                        .try_into()
                        .map_err(|_| anyhow!("malformed error_code"))?,
                ),
                error_message: fields
                    .get(&tlv_type::ERROR_MESSAGE)
                    .map(|b| String::from_utf8_lossy(b).into_owned()),
            })
        }
    }
}

/// Client → Server: create streaming session (sent encrypted with the
/// handshake key over UDP, or under the handshake-established key over
/// HTTP/WebSocket).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionCreateRequest {
    pub channels: String,
    pub enc_type: u8,
    pub enc_key_size: u32,
    pub enc_headers: bool,
}

impl SessionCreateRequest {
    pub fn encode(&self, magic: &dyn MagicProvider) -> Result<Vec<u8>> {
        let mut buf = message_header(magic, MessageType::SessionCreate);
        write_tlv(&mut buf, tlv_type::CHANNELS, self.channels.as_bytes())?;
        write_tlv(&mut buf, tlv_type::STREAM_ENC_TYPE, &[self.enc_type])?;
        write_tlv(&mut buf, tlv_type::STREAM_ENC_SIZE, &self.enc_key_size.to_be_bytes())?;
        write_tlv(&mut buf, tlv_type::STREAM_ENC_HDR, &[self.enc_headers as u8])?;
        Ok(buf)
    }

    pub fn decode(data: &[u8], magic: &dyn MagicProvider) -> Result<Self> {
        let (_, body) = validate_header(data, magic)?;
        let fields = read_all_tlv(body)?;
        let message_type = u16::from_be_bytes(
            require(&fields, tlv_type::MESSAGE_TYPE, "message_type")?
                .try_into()
                .map_err(|_| anyhow!("malformed message_type field"))?,
        );
        if MessageType::from_u16(message_type)? != MessageType::SessionCreate {
            bail!("expected SESSION_CREATE, got 0x{:04x}", message_type);
        }
        Ok(Self {
            channels: String::from_utf8(require(&fields, tlv_type::CHANNELS, "channels")?.to_vec())?,
            enc_type: require(&fields, tlv_type::STREAM_ENC_TYPE, "enc_type")?[0],
            enc_key_size: u32::from_be_bytes(
                require(&fields, tlv_type::STREAM_ENC_SIZE, "enc_key_size")?
                    .try_into()
                    .map_err(|_| anyhow!("malformed enc_key_size"))?,
            ),
            enc_headers: require(&fields, tlv_type::STREAM_ENC_HDR, "enc_headers")?[0] != 0,
        })
    }
}

/// Server → Client: session creation result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionCreateResponse {
    pub success: bool,
    pub session_id: u32,
    pub error_code: u32,
    pub error_message: Option<String>,
}

impl SessionCreateResponse {
    pub fn encode(&self, magic: &dyn MagicProvider) -> Result<Vec<u8>> {
        let mut buf = message_header(magic, MessageType::SessionCreateResponse);
        write_tlv(&mut buf, tlv_type::STATUS, &[if self.success { 0 } else { 1 }])?;
        if self.success {
            write_tlv(&mut buf, tlv_type::SESSION_ID, &self.session_id.to_be_bytes())?;
        } else {
            write_tlv(&mut buf, tlv_type::ERROR_CODE, &self.error_code.to_be_bytes())?;
            if let Some(msg) = &self.error_message {
                write_tlv(&mut buf, tlv_type::ERROR_MESSAGE, msg.as_bytes())?;
            }
        }
        Ok(buf)
    }

    pub fn decode(data: &[u8], magic: &dyn MagicProvider) -> Result<Self> {
        let (_, body) = validate_header(data, magic)?;
        let fields = read_all_tlv(body)?;
        let message_type = u16::from_be_bytes(
            require(&fields, tlv_type::MESSAGE_TYPE, "message_type")?
                .try_into()
                .map_err(|_| anyhow!("malformed message_type field"))?,
        );
        if MessageType::from_u16(message_type)? != MessageType::SessionCreateResponse {
            bail!("expected SESSION_CREATE_RESPONSE, got 0x{:04x}", message_type);
        }
        let success = require(&fields, tlv_type::STATUS, "status")?[0] == 0;
        Ok(Self {
            success,
            session_id: fields
                .get(&tlv_type::SESSION_ID)
                .map(|b| u32::from_be_bytes(b.as_slice().try_into().unwrap_or([0; 4])))
                .unwrap_or(0),
            error_code: fields
                .get(&tlv_type::ERROR_CODE)
                .map(|b| u32::from_be_bytes(b.as_slice().try_into().unwrap_or([0; 4])))
                .unwrap_or(0),
            error_message: fields
                .get(&tlv_type::ERROR_MESSAGE)
                .map(|b| String::from_utf8_lossy(b).into_owned()),
        })
    }
}

/// Server → Client: the channels negotiated in [`SessionCreateRequest`] are
/// open and the stream may move to `STREAM_CONNECTED` (§4.3).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamReadyNotice {
    pub session_id: u32,
    pub channels: String,
}

impl StreamReadyNotice {
    pub fn encode(&self, magic: &dyn MagicProvider) -> Result<Vec<u8>> {
        let mut buf = message_header(magic, MessageType::StreamReady);
        write_tlv(&mut buf, tlv_type::SESSION_ID, &self.session_id.to_be_bytes())?;
        write_tlv(&mut buf, tlv_type::CHANNELS, self.channels.as_bytes())?;
        Ok(buf)
    }

    pub fn decode(data: &[u8], magic: &dyn MagicProvider) -> Result<Self> {
        let (_, body) = validate_header(data, magic)?;
        let fields = read_all_tlv(body)?;
        let message_type = u16::from_be_bytes(
            require(&fields, tlv_type::MESSAGE_TYPE, "message_type")?
                .try_into()
                .map_err(|_| anyhow!("malformed message_type field"))?,
        );
        if MessageType::from_u16(message_type)? != MessageType::StreamReady {
            bail!("expected STREAM_READY, got 0x{:04x}", message_type);
        }
        Ok(Self {
            session_id: u32::from_be_bytes(
                require(&fields, tlv_type::SESSION_ID, "session_id")?
                    .try_into()
                    .map_err(|_| anyhow!("malformed session_id"))?,
            ),
            channels: String::from_utf8(require(&fields, tlv_type::CHANNELS, "channels")?.to_vec())?,
        })
    }
}

/// Client → Server: begin streaming on an already-connected session,
/// driving `STREAM_CONNECTED` → `STREAM_STREAMING` (§4.3, §4.6
/// "session_start simply marks the stream ready"). Carries no payload
/// beyond the session id it applies to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamStartRequest {
    pub session_id: u32,
}

impl StreamStartRequest {
    pub fn encode(&self, magic: &dyn MagicProvider) -> Result<Vec<u8>> {
        let mut buf = message_header(magic, MessageType::StreamStart);
        write_tlv(&mut buf, tlv_type::SESSION_ID, &self.session_id.to_be_bytes())?;
        Ok(buf)
    }

    pub fn decode(data: &[u8], magic: &dyn MagicProvider) -> Result<Self> {
        let (_, body) = validate_header(data, magic)?;
        let fields = read_all_tlv(body)?;
        let message_type = u16::from_be_bytes(
            require(&fields, tlv_type::MESSAGE_TYPE, "message_type")?
                .try_into()
                .map_err(|_| anyhow!("malformed message_type field"))?,
        );
        if MessageType::from_u16(message_type)? != MessageType::StreamStart {
            bail!("expected STREAM_START, got 0x{:04x}", message_type);
        }
        Ok(Self {
            session_id: u32::from_be_bytes(
                require(&fields, tlv_type::SESSION_ID, "session_id")?
                    .try_into()
                    .map_err(|_| anyhow!("malformed session_id"))?,
            ),
        })
    }
}
