//! Error types for the named pipe RPC client
//!
//! Errors are split by the stage that produces them. `ProtocolError` covers
//! malformed or unexpected PDUs, `IntegrityError` covers signature failures,
//! `BindError` is returned by [`bind`](crate::bind) and `CallError` by
//! [`BoundChannel::call`](crate::BoundChannel::call). Transport failures are
//! passed through unchanged as `std::io::Error`.

use crate::dcerpc::SyntaxId;
use crate::ntlmssp::{CredentialsError, NtlmError};
use thiserror::Error;

/// Malformed, truncated or out-of-sequence PDUs
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("{what} too short: need {need} bytes, got {got}")]
    Truncated {
        what: &'static str,
        need: usize,
        got: usize,
    },

    #[error("DCE RPC version mismatch: expected {expected}, got {got}")]
    VersionMismatch { expected: u8, got: u8 },

    #[error("unknown packet type: {0}")]
    UnknownPacketType(u8),

    #[error("unexpected packet type: expected {expected}, got {got}")]
    UnexpectedPacketType { expected: &'static str, got: u8 },

    #[error("invalid fragment length {frag_length} for a {available}-byte buffer")]
    InvalidFragLength { frag_length: u16, available: usize },

    #[error("auth length {auth_length} does not fit in a {body_len}-byte body")]
    InvalidAuthLength { auth_length: u16, body_len: usize },

    #[error("auth padding {pad} exceeds stub length {stub_len}")]
    InvalidAuthPadding { pad: u8, stub_len: usize },

    #[error("unknown auth type: {0}")]
    UnknownAuthType(u8),

    #[error("unknown auth level: {0}")]
    UnknownAuthLevel(u8),

    #[error("call ID mismatch: expected {expected}, got {got}")]
    CallIdMismatch { expected: u32, got: u32 },

    #[error("PDU too large: {size} bytes exceeds maximum {max}")]
    PduTooLarge { size: usize, max: usize },

    #[error("invalid PDU: {0}")]
    InvalidPduData(String),
}

/// Signature or sequence verification failures
///
/// Every variant is fatal for the connection: the keystream has already
/// advanced past the offending PDU and cannot be rewound.
#[derive(Debug, Error)]
pub enum IntegrityError {
    #[error("signature missing from a signed response")]
    MissingSignature,

    #[error("signature must be 16 bytes, got {0}")]
    InvalidSignatureLength(usize),

    #[error("unsupported signature version {0}")]
    InvalidSignatureVersion(u32),

    #[error("signature reserved field is 0x{0:08x}, expected zero")]
    NonZeroReserved(u32),

    #[error("checksum mismatch: expected 0x{expected:08x}, got 0x{got:08x}")]
    ChecksumMismatch { expected: u32, got: u32 },

    #[error("sequence number mismatch: expected {expected}, got {got}")]
    SequenceMismatch { expected: u32, got: u32 },
}

/// Errors returned while binding to an interface
#[derive(Debug, Error)]
pub enum BindError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("bind rejected by server: reason {reason}")]
    Nak { reason: u16 },

    #[error("bind fault: status 0x{0:08x}")]
    Fault(u32),

    #[error("expected exactly one presentation result, got {0}")]
    ResultCount(usize),

    #[error("presentation context rejected: result {result}, reason {reason}")]
    Rejected { result: u16, reason: u16 },

    #[error("transfer syntax mismatch: offered {offered}, accepted {accepted}")]
    TransferSyntaxMismatch {
        offered: SyntaxId,
        accepted: SyntaxId,
    },

    #[error("secondary address mismatch: expected {expected:?}, got {got:?}")]
    SecondaryAddressMismatch { expected: String, got: String },

    #[error("server did not return an NTLMSSP challenge")]
    MissingChallenge,

    #[error("unexpected auth type {0} in bind ack")]
    AuthTypeMismatch(u8),

    #[error("malformed NTLMSSP challenge: {0}")]
    MalformedChallenge(#[source] NtlmError),

    #[error("credentials rejected the challenge: {0}")]
    Credentials(#[source] CredentialsError),
}

impl BindError {
    /// True when the interface was acceptable but authentication failed.
    ///
    /// Interface problems (nak, rejected context, syntax or address mismatch)
    /// return false, as do transport and framing errors.
    pub fn is_authentication_failure(&self) -> bool {
        matches!(
            self,
            Self::MissingChallenge
                | Self::AuthTypeMismatch(_)
                | Self::MalformedChallenge(_)
                | Self::Credentials(_)
        )
    }
}

/// Errors returned by a call on a bound channel
#[derive(Debug, Error)]
pub enum CallError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Integrity(#[from] IntegrityError),

    #[error("fault: status 0x{0:08x}")]
    Fault(u32),

    #[error("fragment stream out of sync: {0}")]
    Desync(String),

    #[error("request too large: {size}-byte fragment exceeds max_xmit_frag {max}")]
    RequestTooLarge { size: usize, max: usize },

    #[error("channel is unusable after an earlier failure")]
    Poisoned,
}

impl CallError {
    /// Whether this error leaves the channel unusable.
    ///
    /// Failures before anything reaches the wire never poison; everything
    /// after that, a fault included, does.
    pub(crate) fn poisons(&self) -> bool {
        !matches!(self, Self::RequestTooLarge { .. } | Self::Poisoned)
    }
}

pub type Result<T, E = CallError> = std::result::Result<T, E>;
