//! NTLMSSP messages carried in bind auth trailers
//!
//! The client sends NEGOTIATE in the BIND, reads CHALLENGE from the
//! BIND_ACK and answers with AUTHENTICATE in the AUTH3 PDU. Every message
//! starts with the `NTLMSSP\0` signature and a little-endian message type.
//! Variable-length fields are referenced by 8-byte security buffers
//! (length, capacity, offset from the start of the message).
//!
//! Password hashing and challenge-response computation are outside this
//! crate. They are reached through the [`NtlmCredentials`] trait.

use bitflags::bitflags;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::fmt;
use std::io::Cursor;
use thiserror::Error;

/// Signature at the start of every NTLMSSP message
pub const NTLMSSP_SIGNATURE: [u8; 8] = *b"NTLMSSP\0";

bitflags! {
    /// NTLMSSP negotiate flags
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct Flags: u32 {
        const NEGOTIATE_UNICODE = 0x0000_0001;
        const NEGOTIATE_OEM = 0x0000_0002;
        const REQUEST_TARGET = 0x0000_0004;
        const NEGOTIATE_SIGN = 0x0000_0010;
        const NEGOTIATE_SEAL = 0x0000_0020;
        const NEGOTIATE_DATAGRAM = 0x0000_0040;
        const NEGOTIATE_LM_KEY = 0x0000_0080;
        const NEGOTIATE_NETWARE = 0x0000_0100;
        const NEGOTIATE_NTLM = 0x0000_0200;
        const NEGOTIATE_ANONYMOUS = 0x0000_0800;
        const NEGOTIATE_DOMAIN_SUPPLIED = 0x0000_1000;
        const NEGOTIATE_WORKSTATION_SUPPLIED = 0x0000_2000;
        const NEGOTIATE_LOCAL_CALL = 0x0000_4000;
        const NEGOTIATE_ALWAYS_SIGN = 0x0000_8000;
        const TARGET_TYPE_DOMAIN = 0x0001_0000;
        const TARGET_TYPE_SERVER = 0x0002_0000;
        const TARGET_TYPE_SHARE = 0x0004_0000;
        const NEGOTIATE_NTLM2_KEY = 0x0008_0000;
        const NEGOTIATE_TARGET_INFO = 0x0080_0000;
        const NEGOTIATE_VERSION = 0x0200_0000;
        const NEGOTIATE_128BIT = 0x2000_0000;
        const NEGOTIATE_KEY_EXCHANGE = 0x4000_0000;
        const NEGOTIATE_56BIT = 0x8000_0000;
    }
}

impl Flags {
    /// Flags a named pipe client requests by default: NTLM with both
    /// signing and sealing.
    pub fn client_default() -> Self {
        Self::NEGOTIATE_UNICODE
            | Self::NEGOTIATE_OEM
            | Self::REQUEST_TARGET
            | Self::NEGOTIATE_SIGN
            | Self::NEGOTIATE_SEAL
            | Self::NEGOTIATE_NTLM
            | Self::NEGOTIATE_ALWAYS_SIGN
    }
}

/// NTLMSSP message type numbers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum MessageType {
    Negotiate = 1,
    Challenge = 2,
    Authenticate = 3,
}

/// NTLMSSP parsing errors
#[derive(Debug, Error)]
pub enum NtlmError {
    #[error("NTLMSSP message too short: need {need} bytes, got {got}")]
    Truncated { need: usize, got: usize },

    #[error("missing NTLMSSP signature")]
    InvalidSignature,

    #[error("wrong NTLMSSP message type: expected {expected}, got {got}")]
    WrongMessageType { expected: u32, got: u32 },

    #[error("security buffer at offset {offset} with length {length} exceeds {message_len}-byte message")]
    BufferOutOfRange {
        offset: u32,
        length: u16,
        message_len: usize,
    },

    #[error("invalid UTF-16 string")]
    InvalidUtf16,
}

type NtlmResult<T> = std::result::Result<T, NtlmError>;

/// Length/capacity/offset triple pointing into the message payload
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SecurityBuffer {
    pub length: u16,
    pub capacity: u16,
    pub offset: u32,
}

impl SecurityBuffer {
    pub const SIZE: usize = 8;

    fn decode(cursor: &mut Cursor<&[u8]>) -> Self {
        Self {
            length: cursor.get_u16_le(),
            capacity: cursor.get_u16_le(),
            offset: cursor.get_u32_le(),
        }
    }

    fn encode(&self, buf: &mut BytesMut) {
        buf.put_u16_le(self.length);
        buf.put_u16_le(self.capacity);
        buf.put_u32_le(self.offset);
    }

    /// Resolve against the whole message, signature included.
    fn slice<'a>(&self, message: &'a [u8]) -> NtlmResult<&'a [u8]> {
        let start = self.offset as usize;
        let end = start + self.length as usize;
        message.get(start..end).ok_or(NtlmError::BufferOutOfRange {
            offset: self.offset,
            length: self.length,
            message_len: message.len(),
        })
    }
}

/// Builds a message: fixed fields first, buffer contents appended after.
struct MessageWriter {
    fixed: BytesMut,
    payload: BytesMut,
    fixed_len: usize,
}

impl MessageWriter {
    fn new(message_type: MessageType, fixed_len: usize) -> Self {
        let mut fixed = BytesMut::with_capacity(fixed_len);
        fixed.put_slice(&NTLMSSP_SIGNATURE);
        fixed.put_u32_le(message_type as u32);
        Self {
            fixed,
            payload: BytesMut::new(),
            fixed_len,
        }
    }

    fn put_buffer(&mut self, data: &[u8]) {
        debug_assert!(
            data.len() <= u16::MAX as usize,
            "{}-byte field does not fit in a security buffer",
            data.len()
        );
        let length = u16::try_from(data.len()).unwrap_or(u16::MAX);
        SecurityBuffer {
            length,
            capacity: length,
            offset: (self.fixed_len + self.payload.len()) as u32,
        }
        .encode(&mut self.fixed);
        self.payload.put_slice(&data[..length as usize]);
    }

    fn put_u32(&mut self, value: u32) {
        self.fixed.put_u32_le(value);
    }

    fn put_slice(&mut self, data: &[u8]) {
        self.fixed.put_slice(data);
    }

    fn finish(mut self) -> Bytes {
        debug_assert_eq!(self.fixed.len(), self.fixed_len);
        self.fixed.put_slice(&self.payload);
        self.fixed.freeze()
    }
}

/// Check signature and type, returning a cursor positioned after them.
fn open_message(message: &[u8], expected: MessageType, min_len: usize) -> NtlmResult<Cursor<&[u8]>> {
    if message.len() < min_len {
        return Err(NtlmError::Truncated {
            need: min_len,
            got: message.len(),
        });
    }
    if message[..8] != NTLMSSP_SIGNATURE {
        return Err(NtlmError::InvalidSignature);
    }
    let mut cursor = Cursor::new(message);
    cursor.advance(8);
    let got = cursor.get_u32_le();
    if got != expected as u32 {
        return Err(NtlmError::WrongMessageType {
            expected: expected as u32,
            got,
        });
    }
    Ok(cursor)
}

/// UTF-16LE when unicode was negotiated, otherwise single-byte OEM text.
fn encode_string(flags: Flags, value: &str) -> Vec<u8> {
    if flags.contains(Flags::NEGOTIATE_UNICODE) {
        value.encode_utf16().flat_map(u16::to_le_bytes).collect()
    } else {
        value
            .chars()
            .map(|c| if c.is_ascii() { c as u8 } else { b'?' })
            .collect()
    }
}

fn decode_string(flags: Flags, bytes: &[u8]) -> NtlmResult<String> {
    if flags.contains(Flags::NEGOTIATE_UNICODE) {
        let units: Vec<u16> = bytes
            .chunks_exact(2)
            .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
            .collect();
        String::from_utf16(&units).map_err(|_| NtlmError::InvalidUtf16)
    } else {
        Ok(bytes.iter().map(|&b| b as char).collect())
    }
}

/// First leg, sent in the BIND auth trailer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NegotiateMessage {
    pub flags: Flags,
    pub domain: String,
    pub workstation: String,
}

impl NegotiateMessage {
    const FIXED_LEN: usize = 8 + 4 + 4 + 2 * SecurityBuffer::SIZE;

    pub fn new(flags: Flags, domain: impl Into<String>, workstation: impl Into<String>) -> Self {
        Self {
            flags,
            domain: domain.into(),
            workstation: workstation.into(),
        }
    }

    /// Supplied-name flags are set for whichever names are non-empty. Names
    /// in a negotiate message are always OEM.
    pub fn encode(&self) -> Bytes {
        let mut flags = self.flags;
        flags.set(Flags::NEGOTIATE_DOMAIN_SUPPLIED, !self.domain.is_empty());
        flags.set(Flags::NEGOTIATE_WORKSTATION_SUPPLIED, !self.workstation.is_empty());

        let oem = Flags::NEGOTIATE_OEM;
        let mut writer = MessageWriter::new(MessageType::Negotiate, Self::FIXED_LEN);
        writer.put_u32(flags.bits());
        writer.put_buffer(&encode_string(oem, &self.domain));
        writer.put_buffer(&encode_string(oem, &self.workstation));
        writer.finish()
    }

    pub fn decode(message: &[u8]) -> NtlmResult<Self> {
        let mut cursor = open_message(message, MessageType::Negotiate, 16)?;
        let flags = Flags::from_bits_retain(cursor.get_u32_le());
        if cursor.remaining() < 2 * SecurityBuffer::SIZE {
            return Ok(Self::new(flags, "", ""));
        }
        let domain = SecurityBuffer::decode(&mut cursor);
        let workstation = SecurityBuffer::decode(&mut cursor);
        let oem = Flags::NEGOTIATE_OEM;
        Ok(Self {
            flags,
            domain: decode_string(oem, domain.slice(message)?)?,
            workstation: decode_string(oem, workstation.slice(message)?)?,
        })
    }
}

/// Second leg, returned by the server in the BIND_ACK auth trailer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChallengeMessage {
    pub target_name: String,
    /// Flags the server settled on; these fix signing and sealing for the
    /// lifetime of the connection.
    pub flags: Flags,
    pub challenge: [u8; 8],
    pub context: [u8; 8],
    pub target_info: Bytes,
}

impl ChallengeMessage {
    const MIN_LEN: usize = 8 + 4 + SecurityBuffer::SIZE + 4 + 8;
    const FIXED_LEN: usize = Self::MIN_LEN + 8 + SecurityBuffer::SIZE;

    pub fn new(flags: Flags, challenge: [u8; 8]) -> Self {
        Self {
            target_name: String::new(),
            flags,
            challenge,
            context: [0; 8],
            target_info: Bytes::new(),
        }
    }

    pub fn encode(&self) -> Bytes {
        let mut writer = MessageWriter::new(MessageType::Challenge, Self::FIXED_LEN);
        writer.put_buffer(&encode_string(self.flags, &self.target_name));
        writer.put_u32(self.flags.bits());
        writer.put_slice(&self.challenge);
        writer.put_slice(&self.context);
        writer.put_buffer(&self.target_info);
        writer.finish()
    }

    /// Older servers stop after the challenge or the context field; both
    /// shorter forms are accepted.
    pub fn decode(message: &[u8]) -> NtlmResult<Self> {
        let mut cursor = open_message(message, MessageType::Challenge, Self::MIN_LEN)?;
        let target_name_buf = SecurityBuffer::decode(&mut cursor);
        let flags = Flags::from_bits_retain(cursor.get_u32_le());
        let mut challenge = [0u8; 8];
        cursor.copy_to_slice(&mut challenge);

        let mut context = [0u8; 8];
        if cursor.remaining() >= 8 {
            cursor.copy_to_slice(&mut context);
        }
        let target_info = if cursor.remaining() >= SecurityBuffer::SIZE {
            let buf = SecurityBuffer::decode(&mut cursor);
            Bytes::copy_from_slice(buf.slice(message)?)
        } else {
            Bytes::new()
        };

        Ok(Self {
            target_name: decode_string(flags, target_name_buf.slice(message)?)?,
            flags,
            challenge,
            context,
            target_info,
        })
    }
}

/// Third leg, sent in the AUTH3 PDU
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthenticateMessage {
    pub flags: Flags,
    pub lm_response: Bytes,
    pub nt_response: Bytes,
    pub domain: String,
    pub user: String,
    pub workstation: String,
    pub session_key: Bytes,
}

impl AuthenticateMessage {
    const FIXED_LEN: usize = 8 + 4 + 6 * SecurityBuffer::SIZE + 4;

    pub fn encode(&self) -> Bytes {
        let mut writer = MessageWriter::new(MessageType::Authenticate, Self::FIXED_LEN);
        writer.put_buffer(&self.lm_response);
        writer.put_buffer(&self.nt_response);
        writer.put_buffer(&encode_string(self.flags, &self.domain));
        writer.put_buffer(&encode_string(self.flags, &self.user));
        writer.put_buffer(&encode_string(self.flags, &self.workstation));
        writer.put_buffer(&self.session_key);
        writer.put_u32(self.flags.bits());
        writer.finish()
    }

    pub fn decode(message: &[u8]) -> NtlmResult<Self> {
        let mut cursor = open_message(message, MessageType::Authenticate, Self::FIXED_LEN)?;
        let buffers: Vec<SecurityBuffer> = (0..6).map(|_| SecurityBuffer::decode(&mut cursor)).collect();
        let flags = Flags::from_bits_retain(cursor.get_u32_le());

        Ok(Self {
            flags,
            lm_response: Bytes::copy_from_slice(buffers[0].slice(message)?),
            nt_response: Bytes::copy_from_slice(buffers[1].slice(message)?),
            domain: decode_string(flags, buffers[2].slice(message)?)?,
            user: decode_string(flags, buffers[3].slice(message)?)?,
            workstation: decode_string(flags, buffers[4].slice(message)?)?,
            session_key: Bytes::copy_from_slice(buffers[5].slice(message)?),
        })
    }
}

/// Error type returned by credential providers
pub type CredentialsError = Box<dyn std::error::Error + Send + Sync>;

/// Output of the external challenge-response computation
#[derive(Clone)]
pub struct ChallengeResponse {
    /// 24-byte LM response
    pub lm_response: Bytes,
    /// 24-byte NT response
    pub nt_response: Bytes,
    /// 16-byte session key the keystream is derived from
    pub session_key: [u8; 16],
}

impl fmt::Debug for ChallengeResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChallengeResponse")
            .field("lm_response", &self.lm_response.len())
            .field("nt_response", &self.nt_response.len())
            .finish_non_exhaustive()
    }
}

/// Source of the user's identity and challenge responses
pub trait NtlmCredentials: Send + Sync {
    fn user_name(&self) -> &str;

    fn domain(&self) -> &str;

    /// Compute the LM/NT responses to `server_challenge` and the session key.
    fn challenge_response(
        &self,
        server_challenge: &[u8; 8],
    ) -> Result<ChallengeResponse, CredentialsError>;
}
