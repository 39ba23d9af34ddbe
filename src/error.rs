//! Public error taxonomy for the stream-transport framework.
//!
//! Internal call sites use `anyhow::Result` for convenience; this enum is
//! the stable, typed surface returned from the crate's public entry points
//! (transport operations, the stage machine, the packet codec).

use thiserror::Error;

/// Stable error taxonomy surfaced to applications.
///
/// Each variant's `Display` impl is the stable short token mentioned in the
/// external-interfaces error contract (e.g. `STREAM_RESPONSE_TIMEOUT`).
#[derive(Debug, Error)]
pub enum StreamError {
    #[error("RESOURCE_EXHAUSTED")]
    ResourceExhausted,

    #[error("ENC_NO_KEY")]
    EncNoKey,
    #[error("ENC_WRONG_KEY")]
    EncWrongKey,
    #[error("ENC_SESSION_CLOSED")]
    EncSessionClosed,
    #[error("SESSION_ALREADY_OPENED: {session_id}")]
    SessionAlreadyOpened { session_id: u32 },

    #[error("HANDSHAKE_CONTROL_ERROR: {0}")]
    HandshakeControlError(String),
    #[error("HANDSHAKE_AUTH_ERROR")]
    HandshakeAuthError,
    #[error("HANDSHAKE_RESPONSE_FORMAT_ERROR: {0}")]
    HandshakeResponseFormatError(String),

    #[error("NETWORK_CONNECTION_REFUSED")]
    ConnectionRefused,
    #[error("NETWORK_CONNECTION_TIMEOUT")]
    ConnectionTimeout,

    #[error("STREAM_WRONG_RESPONSE")]
    StreamWrongResponse,
    #[error("STREAM_RESPONSE_TIMEOUT")]
    StreamResponseTimeout,
    #[error("STREAM_FROZEN")]
    StreamFrozen,
    #[error("STREAM_ABORTED")]
    StreamAborted,

    #[error("STAGE_WRONG_STAGE")]
    StageWrongStage,
    #[error("STAGE_WRONG_ADDRESS")]
    StageWrongAddress,
    #[error("STAGE_FALLBACK_LIMIT_EXCEEDED")]
    FallbackLimitExceeded,

    #[error("TRANSPORT_ALREADY_REGISTERED")]
    TransportAlreadyRegistered,
    #[error("TRANSPORT_NOT_FOUND")]
    TransportNotFound,
    #[error("TRANSPORT_INVALID_ARGS: {0}")]
    InvalidArgs(String),

    #[error("IO_ERROR: {0}")]
    Io(#[from] std::io::Error),
}

pub type StreamResult<T> = Result<T, StreamError>;

/// Framing/sequencing failures are recovered locally by the packet codec and
/// never escape as a `StreamError` (see §7 propagation policy); this enum
/// exists only so the codec can log a distinct reason for each drop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameDropReason {
    Oversize,
    BadSize,
    DecodeSizeMismatch,
    FragmentOutOfOrder,
    Replay,
}

impl FrameDropReason {
    pub fn as_str(self) -> &'static str {
        match self {
            FrameDropReason::Oversize => "oversize",
            FrameDropReason::BadSize => "bad_size",
            FrameDropReason::DecodeSizeMismatch => "decode_size_mismatch",
            FrameDropReason::FragmentOutOfOrder => "fragment_out_of_order",
            FrameDropReason::Replay => "replay",
        }
    }
}
