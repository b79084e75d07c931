//! DCE RPC auth trailer (sec_trailer)
//!
//! Every authenticated PDU ends with an 8-byte trailer header followed by
//! `auth_length` bytes of security data: an NTLMSSP token during bind, a
//! 16-byte signature block afterwards.

use crate::dcerpc::{get_u32, put_u32};
use crate::error::ProtocolError;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::io::Cursor;

/// Authentication types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum AuthType {
    None = 0,
    GssNegotiate = 9,
    /// NTLMSSP, the only type this client negotiates
    Ntlm = 10,
    GssKerberos = 16,
}

impl AuthType {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::None),
            9 => Some(Self::GssNegotiate),
            10 => Some(Self::Ntlm),
            16 => Some(Self::GssKerberos),
            _ => None,
        }
    }
}

/// Authentication levels
///
/// Carried on the wire for the server's benefit. Whether PDUs are signed or
/// sealed is decided by the negotiated NTLMSSP flags, not by this value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
#[repr(u8)]
pub enum AuthLevel {
    #[default]
    None = 1,
    Connect = 2,
    Call = 3,
    Pkt = 4,
    PktIntegrity = 5,
    PktPrivacy = 6,
}

impl AuthLevel {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(Self::None),
            2 => Some(Self::Connect),
            3 => Some(Self::Call),
            4 => Some(Self::Pkt),
            5 => Some(Self::PktIntegrity),
            6 => Some(Self::PktPrivacy),
            _ => None,
        }
    }
}

/// Auth trailer appended to authenticated PDUs
///
/// ```text
/// +-----------+------------+--------------+----------+
/// | auth_type | auth_level | auth_pad_len | reserved |
/// +-----------+------------+--------------+----------+
/// |              auth_context_id (4)                 |
/// +--------------------------------------------------+
/// |          auth_value (auth_length bytes)          |
/// +--------------------------------------------------+
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthVerifier {
    pub auth_type: AuthType,
    pub auth_level: AuthLevel,
    /// Padding bytes between the stub data and this trailer
    pub auth_pad_length: u8,
    pub reserved: u8,
    pub auth_context_id: u32,
    pub auth_value: Bytes,
}

impl AuthVerifier {
    /// Size of the fixed header portion
    pub const HEADER_SIZE: usize = 8;

    pub fn new(
        auth_type: AuthType,
        auth_level: AuthLevel,
        auth_context_id: u32,
        auth_value: Bytes,
    ) -> Self {
        Self {
            auth_type,
            auth_level,
            auth_pad_length: 0,
            reserved: 0,
            auth_context_id,
            auth_value,
        }
    }

    pub fn with_padding(mut self, auth_pad_length: u8) -> Self {
        self.auth_pad_length = auth_pad_length;
        self
    }

    pub fn size(&self) -> usize {
        Self::HEADER_SIZE + self.auth_value.len()
    }

    pub fn encode(&self, buf: &mut BytesMut, little_endian: bool) {
        buf.put_u8(self.auth_type as u8);
        buf.put_u8(self.auth_level as u8);
        buf.put_u8(self.auth_pad_length);
        buf.put_u8(self.reserved);
        put_u32(buf, self.auth_context_id, little_endian);
        buf.put_slice(&self.auth_value);
    }

    /// Decode a trailer occupying all of `data`.
    pub fn decode(data: &[u8], little_endian: bool) -> Result<Self, ProtocolError> {
        if data.len() < Self::HEADER_SIZE {
            return Err(ProtocolError::Truncated {
                what: "auth trailer",
                need: Self::HEADER_SIZE,
                got: data.len(),
            });
        }

        let mut cursor = Cursor::new(data);
        let auth_type = AuthType::from_u8(cursor.get_u8())
            .ok_or(ProtocolError::UnknownAuthType(data[0]))?;
        let auth_level = AuthLevel::from_u8(cursor.get_u8())
            .ok_or(ProtocolError::UnknownAuthLevel(data[1]))?;
        let auth_pad_length = cursor.get_u8();
        let reserved = cursor.get_u8();
        let auth_context_id = get_u32(&mut cursor, little_endian);

        Ok(Self {
            auth_type,
            auth_level,
            auth_pad_length,
            reserved,
            auth_context_id,
            auth_value: Bytes::copy_from_slice(&data[Self::HEADER_SIZE..]),
        })
    }
}

/// Padding needed after `stub_len` bytes so the trailer starts 4-byte aligned
pub fn calculate_auth_padding(stub_len: usize) -> usize {
    (4 - stub_len % 4) % 4
}
