//! DCE RPC connection-oriented PDU codec
//!
//! Covers the PDUs a named pipe client exchanges with its server: BIND,
//! BIND_ACK, BIND_NAK, AUTH3, REQUEST, RESPONSE and FAULT.
//!
//! Common header format:
//! ```text
//! +--------+--------+--------+--------+
//! |  vers  |vers_min| ptype  | pflags |
//! +--------+--------+--------+--------+
//! |        data representation        |
//! +--------+--------+--------+--------+
//! |   frag_len      |   auth_len      |
//! +--------+--------+--------+--------+
//! |             call_id               |
//! +--------+--------+--------+--------+
//! ```
//!
//! Multi-byte integers follow the byte order named by the data
//! representation. Outgoing PDUs always use NDR little-endian.

use crate::error::ProtocolError;
use crate::security::{calculate_auth_padding, AuthVerifier};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::fmt;
use std::io::Cursor;

/// DCE RPC protocol version
pub const DCE_RPC_VERSION: u8 = 5;
/// DCE RPC protocol minor version
pub const DCE_RPC_VERSION_MINOR: u8 = 0;

type CodecResult<T> = std::result::Result<T, ProtocolError>;

pub(crate) fn ensure(cursor: &Cursor<&[u8]>, need: usize, what: &'static str) -> CodecResult<()> {
    if cursor.remaining() < need {
        return Err(ProtocolError::Truncated {
            what,
            need,
            got: cursor.remaining(),
        });
    }
    Ok(())
}

pub(crate) fn get_u16(cursor: &mut Cursor<&[u8]>, little_endian: bool) -> u16 {
    if little_endian {
        cursor.get_u16_le()
    } else {
        cursor.get_u16()
    }
}

pub(crate) fn get_u32(cursor: &mut Cursor<&[u8]>, little_endian: bool) -> u32 {
    if little_endian {
        cursor.get_u32_le()
    } else {
        cursor.get_u32()
    }
}

pub(crate) fn put_u16(buf: &mut BytesMut, value: u16, little_endian: bool) {
    if little_endian {
        buf.put_u16_le(value);
    } else {
        buf.put_u16(value);
    }
}

pub(crate) fn put_u32(buf: &mut BytesMut, value: u32, little_endian: bool) {
    if little_endian {
        buf.put_u32_le(value);
    } else {
        buf.put_u32(value);
    }
}

/// Connection-oriented packet types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PacketType {
    Request = 0,
    Response = 2,
    Fault = 3,
    Bind = 11,
    BindAck = 12,
    BindNak = 13,
    /// Third leg of a three-way authenticated bind
    Auth3 = 16,
}

impl PacketType {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Request),
            2 => Some(Self::Response),
            3 => Some(Self::Fault),
            11 => Some(Self::Bind),
            12 => Some(Self::BindAck),
            13 => Some(Self::BindNak),
            16 => Some(Self::Auth3),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Request => "request",
            Self::Response => "response",
            Self::Fault => "fault",
            Self::Bind => "bind",
            Self::BindAck => "bind_ack",
            Self::BindNak => "bind_nak",
            Self::Auth3 => "auth3",
        }
    }
}

fn expect_type(header: &PduHeader, expected: PacketType) -> CodecResult<()> {
    if header.packet_type != expected {
        return Err(ProtocolError::UnexpectedPacketType {
            expected: expected.name(),
            got: header.packet_type as u8,
        });
    }
    Ok(())
}

/// Packet flags
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PacketFlags(u8);

impl PacketFlags {
    /// First fragment of a call
    pub const FIRST_FRAG: u8 = 0x01;
    /// Last fragment of a call
    pub const LAST_FRAG: u8 = 0x02;

    pub fn new() -> Self {
        Self(0)
    }

    /// Flags for a PDU that is both the first and last fragment
    pub fn complete() -> Self {
        Self(Self::FIRST_FRAG | Self::LAST_FRAG)
    }

    pub fn fragment(first: bool, last: bool) -> Self {
        let mut flags = Self::new();
        if first {
            flags.set_first_frag();
        }
        if last {
            flags.set_last_frag();
        }
        flags
    }

    pub fn set_first_frag(&mut self) -> &mut Self {
        self.0 |= Self::FIRST_FRAG;
        self
    }

    pub fn set_last_frag(&mut self) -> &mut Self {
        self.0 |= Self::LAST_FRAG;
        self
    }

    pub fn is_first_frag(&self) -> bool {
        (self.0 & Self::FIRST_FRAG) != 0
    }

    pub fn is_last_frag(&self) -> bool {
        (self.0 & Self::LAST_FRAG) != 0
    }

    pub fn as_u8(&self) -> u8 {
        self.0
    }

    pub fn from_u8(value: u8) -> Self {
        Self(value)
    }
}

/// Integer representation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntRep {
    BigEndian = 0,
    LittleEndian = 1,
}

/// Character representation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CharRep {
    Ascii = 0,
    Ebcdic = 1,
}

/// Floating point representation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FloatRep {
    Ieee = 0,
    Vax = 1,
    Cray = 2,
    Ibm = 3,
}

/// Data representation format label (drep)
///
/// Byte 0 carries the integer representation in the upper nibble and the
/// character set in the lower nibble. Byte 1 is the float format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataRepresentation {
    pub int_rep: IntRep,
    pub char_rep: CharRep,
    pub float_rep: FloatRep,
}

impl DataRepresentation {
    /// NDR: little-endian, ASCII, IEEE. Encodes as `10 00 00 00`.
    pub fn ndr() -> Self {
        Self {
            int_rep: IntRep::LittleEndian,
            char_rep: CharRep::Ascii,
            float_rep: FloatRep::Ieee,
        }
    }

    pub fn big_endian() -> Self {
        Self {
            int_rep: IntRep::BigEndian,
            ..Self::ndr()
        }
    }

    pub fn encode(&self) -> [u8; 4] {
        [
            (self.char_rep as u8) | ((self.int_rep as u8) << 4),
            self.float_rep as u8,
            0,
            0,
        ]
    }

    pub fn decode(data: [u8; 4]) -> Self {
        let int_rep = if data[0] & 0xF0 == 0 {
            IntRep::BigEndian
        } else {
            IntRep::LittleEndian
        };
        let char_rep = if data[0] & 0x0F == 0 {
            CharRep::Ascii
        } else {
            CharRep::Ebcdic
        };
        let float_rep = match data[1] {
            0 => FloatRep::Ieee,
            1 => FloatRep::Vax,
            2 => FloatRep::Cray,
            _ => FloatRep::Ibm,
        };
        Self {
            int_rep,
            char_rep,
            float_rep,
        }
    }

    pub fn is_little_endian(&self) -> bool {
        self.int_rep == IntRep::LittleEndian
    }
}

impl Default for DataRepresentation {
    fn default() -> Self {
        Self::ndr()
    }
}

/// 128-bit interface or transfer syntax identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash)]
pub struct Uuid {
    pub time_low: u32,
    pub time_mid: u16,
    pub time_hi_and_version: u16,
    pub clock_seq_hi_and_reserved: u8,
    pub clock_seq_low: u8,
    pub node: [u8; 6],
}

impl Uuid {
    pub const NIL: Self = Self::new(0, 0, 0, 0, [0; 6]);

    /// Build from the five groups of the textual form
    pub const fn new(
        time_low: u32,
        time_mid: u16,
        time_hi_and_version: u16,
        clock_seq: u16,
        node: [u8; 6],
    ) -> Self {
        Self {
            time_low,
            time_mid,
            time_hi_and_version,
            clock_seq_hi_and_reserved: (clock_seq >> 8) as u8,
            clock_seq_low: clock_seq as u8,
            node,
        }
    }

    /// Parse "xxxxxxxx-xxxx-xxxx-xxxx-xxxxxxxxxxxx"
    pub fn parse(s: &str) -> Option<Self> {
        let s = s.trim();
        let mut parts = s.split('-');
        let time_low = parts.next().filter(|p| p.len() == 8)?;
        let time_mid = parts.next().filter(|p| p.len() == 4)?;
        let time_hi = parts.next().filter(|p| p.len() == 4)?;
        let clock = parts.next().filter(|p| p.len() == 4)?;
        let node_str = parts.next().filter(|p| p.len() == 12)?;
        if parts.next().is_some() {
            return None;
        }

        let mut node = [0u8; 6];
        for (i, byte) in node.iter_mut().enumerate() {
            *byte = u8::from_str_radix(node_str.get(i * 2..i * 2 + 2)?, 16).ok()?;
        }

        Some(Self::new(
            u32::from_str_radix(time_low, 16).ok()?,
            u16::from_str_radix(time_mid, 16).ok()?,
            u16::from_str_radix(time_hi, 16).ok()?,
            u16::from_str_radix(clock, 16).ok()?,
            node,
        ))
    }

    pub fn encode(&self, buf: &mut BytesMut, little_endian: bool) {
        put_u32(buf, self.time_low, little_endian);
        put_u16(buf, self.time_mid, little_endian);
        put_u16(buf, self.time_hi_and_version, little_endian);
        buf.put_u8(self.clock_seq_hi_and_reserved);
        buf.put_u8(self.clock_seq_low);
        buf.put_slice(&self.node);
    }

    pub fn decode(cursor: &mut Cursor<&[u8]>, little_endian: bool) -> CodecResult<Self> {
        ensure(cursor, 16, "UUID")?;
        let time_low = get_u32(cursor, little_endian);
        let time_mid = get_u16(cursor, little_endian);
        let time_hi_and_version = get_u16(cursor, little_endian);
        let clock_seq_hi_and_reserved = cursor.get_u8();
        let clock_seq_low = cursor.get_u8();
        let mut node = [0u8; 6];
        cursor.copy_to_slice(&mut node);
        Ok(Self {
            time_low,
            time_mid,
            time_hi_and_version,
            clock_seq_hi_and_reserved,
            clock_seq_low,
            node,
        })
    }
}

impl fmt::Display for Uuid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:08x}-{:04x}-{:04x}-{:02x}{:02x}-",
            self.time_low,
            self.time_mid,
            self.time_hi_and_version,
            self.clock_seq_hi_and_reserved,
            self.clock_seq_low,
        )?;
        for byte in &self.node {
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}

/// Interface UUID with version (major in the low 16 bits, minor in the high)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SyntaxId {
    pub uuid: Uuid,
    pub version: u32,
}

impl SyntaxId {
    /// NDR transfer syntax 8a885d04-1ceb-11c9-9fe8-08002b104860 v2
    pub const NDR: Self = Self::new(
        Uuid::new(
            0x8a885d04,
            0x1ceb,
            0x11c9,
            0x9fe8,
            [0x08, 0x00, 0x2b, 0x10, 0x48, 0x60],
        ),
        2,
        0,
    );

    pub const fn new(uuid: Uuid, major: u16, minor: u16) -> Self {
        Self {
            uuid,
            version: (major as u32) | ((minor as u32) << 16),
        }
    }

    pub fn major_version(&self) -> u16 {
        self.version as u16
    }

    pub fn minor_version(&self) -> u16 {
        (self.version >> 16) as u16
    }

    pub fn encode(&self, buf: &mut BytesMut, little_endian: bool) {
        self.uuid.encode(buf, little_endian);
        put_u32(buf, self.version, little_endian);
    }

    pub fn decode(cursor: &mut Cursor<&[u8]>, little_endian: bool) -> CodecResult<Self> {
        let uuid = Uuid::decode(cursor, little_endian)?;
        ensure(cursor, 4, "syntax version")?;
        let version = get_u32(cursor, little_endian);
        Ok(Self { uuid, version })
    }
}

impl fmt::Display for SyntaxId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} v{}.{}",
            self.uuid,
            self.major_version(),
            self.minor_version()
        )
    }
}

/// Common PDU header (16 bytes)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PduHeader {
    pub version: u8,
    pub version_minor: u8,
    pub packet_type: PacketType,
    pub packet_flags: PacketFlags,
    pub data_rep: DataRepresentation,
    /// Total length of this fragment, header included
    pub frag_length: u16,
    /// Length of the auth value, excluding the 8-byte trailer header
    pub auth_length: u16,
    pub call_id: u32,
}

impl PduHeader {
    pub const SIZE: usize = 16;

    pub fn new(packet_type: PacketType, call_id: u32) -> Self {
        Self {
            version: DCE_RPC_VERSION,
            version_minor: DCE_RPC_VERSION_MINOR,
            packet_type,
            packet_flags: PacketFlags::complete(),
            data_rep: DataRepresentation::ndr(),
            frag_length: 0,
            auth_length: 0,
            call_id,
        }
    }

    pub fn is_little_endian(&self) -> bool {
        self.data_rep.is_little_endian()
    }

    pub fn encode(&self, buf: &mut BytesMut) {
        let little_endian = self.is_little_endian();
        buf.put_u8(self.version);
        buf.put_u8(self.version_minor);
        buf.put_u8(self.packet_type as u8);
        buf.put_u8(self.packet_flags.as_u8());
        buf.put_slice(&self.data_rep.encode());
        put_u16(buf, self.frag_length, little_endian);
        put_u16(buf, self.auth_length, little_endian);
        put_u32(buf, self.call_id, little_endian);
    }

    /// Decode the first 16 bytes of `data`.
    ///
    /// A minor version mismatch is accepted. Fault PDUs decode like any
    /// other; callers must branch on `packet_type` before reading a body.
    pub fn decode(data: &[u8]) -> CodecResult<Self> {
        if data.len() < Self::SIZE {
            return Err(ProtocolError::Truncated {
                what: "PDU header",
                need: Self::SIZE,
                got: data.len(),
            });
        }

        if data[0] != DCE_RPC_VERSION {
            return Err(ProtocolError::VersionMismatch {
                expected: DCE_RPC_VERSION,
                got: data[0],
            });
        }

        let packet_type =
            PacketType::from_u8(data[2]).ok_or(ProtocolError::UnknownPacketType(data[2]))?;
        let data_rep = DataRepresentation::decode([data[4], data[5], data[6], data[7]]);

        let mut cursor = Cursor::new(&data[8..Self::SIZE]);
        let little_endian = data_rep.is_little_endian();
        let frag_length = get_u16(&mut cursor, little_endian);
        let auth_length = get_u16(&mut cursor, little_endian);
        let call_id = get_u32(&mut cursor, little_endian);

        if (frag_length as usize) < Self::SIZE {
            return Err(ProtocolError::InvalidFragLength {
                frag_length,
                available: data.len(),
            });
        }

        Ok(Self {
            version: data[0],
            version_minor: data[1],
            packet_type,
            packet_flags: PacketFlags::from_u8(data[3]),
            data_rep,
            frag_length,
            auth_length,
            call_id,
        })
    }
}

/// Decode the header and trim `data` to the fragment it describes.
fn frame(data: &[u8]) -> CodecResult<(PduHeader, &[u8])> {
    let header = PduHeader::decode(data)?;
    let frag_length = header.frag_length as usize;
    if frag_length > data.len() {
        return Err(ProtocolError::InvalidFragLength {
            frag_length: header.frag_length,
            available: data.len(),
        });
    }
    Ok((header, &data[..frag_length]))
}

/// Locate the auth trailer at the end of a framed PDU.
///
/// Returns the offset where the trailer starts (the end of stub data and
/// padding) and the decoded trailer, if any.
fn split_auth(
    pdu: &[u8],
    header: &PduHeader,
    body_start: usize,
) -> CodecResult<(usize, Option<AuthVerifier>)> {
    if header.auth_length == 0 {
        return Ok((pdu.len(), None));
    }
    let trailer_len = AuthVerifier::HEADER_SIZE + header.auth_length as usize;
    let body_len = pdu.len().saturating_sub(body_start);
    if body_len < trailer_len {
        return Err(ProtocolError::InvalidAuthLength {
            auth_length: header.auth_length,
            body_len,
        });
    }
    let trailer_start = pdu.len() - trailer_len;
    let verifier = AuthVerifier::decode(&pdu[trailer_start..], header.is_little_endian())?;
    Ok((trailer_start, Some(verifier)))
}

fn start_pdu(capacity: usize) -> BytesMut {
    let mut buf = BytesMut::with_capacity(PduHeader::SIZE + capacity);
    buf.put_slice(&[0u8; PduHeader::SIZE]);
    buf
}

/// Pad to a 4-byte boundary and append the trailer. Padding already present
/// at the end of the body is counted through `auth_pad_length`.
fn put_auth(buf: &mut BytesMut, auth: Option<&AuthVerifier>, little_endian: bool) -> u16 {
    let Some(auth) = auth else {
        return 0;
    };
    let extra = calculate_auth_padding(buf.len() - PduHeader::SIZE);
    buf.put_bytes(0, extra);
    let mut trailer = auth.clone();
    trailer.auth_pad_length = trailer.auth_pad_length.saturating_add(extra as u8);
    trailer.encode(buf, little_endian);
    debug_assert!(
        auth.auth_value.len() <= u16::MAX as usize,
        "auth value of {} bytes does not fit in auth_length",
        auth.auth_value.len()
    );
    auth.auth_value.len() as u16
}

fn finish_pdu(mut buf: BytesMut, header: &PduHeader, auth_length: u16) -> Bytes {
    debug_assert!(
        buf.len() <= u16::MAX as usize,
        "PDU of {} bytes does not fit in frag_length",
        buf.len()
    );
    let mut header = header.clone();
    header.frag_length = u16::try_from(buf.len()).unwrap_or(u16::MAX);
    header.auth_length = auth_length;

    let mut header_buf = BytesMut::with_capacity(PduHeader::SIZE);
    header.encode(&mut header_buf);
    buf[..PduHeader::SIZE].copy_from_slice(&header_buf);
    buf.freeze()
}

/// Presentation context offered in a bind
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContextElement {
    pub context_id: u16,
    pub abstract_syntax: SyntaxId,
    pub transfer_syntaxes: Vec<SyntaxId>,
}

impl ContextElement {
    pub fn new(context_id: u16, abstract_syntax: SyntaxId, transfer_syntax: SyntaxId) -> Self {
        Self {
            context_id,
            abstract_syntax,
            transfer_syntaxes: vec![transfer_syntax],
        }
    }

    pub fn encode(&self, buf: &mut BytesMut, little_endian: bool) {
        put_u16(buf, self.context_id, little_endian);
        buf.put_u8(self.transfer_syntaxes.len() as u8);
        buf.put_u8(0);
        self.abstract_syntax.encode(buf, little_endian);
        for syntax in &self.transfer_syntaxes {
            syntax.encode(buf, little_endian);
        }
    }

    pub fn decode(cursor: &mut Cursor<&[u8]>, little_endian: bool) -> CodecResult<Self> {
        ensure(cursor, 4, "context element")?;
        let context_id = get_u16(cursor, little_endian);
        let n_transfer = cursor.get_u8();
        cursor.advance(1);

        let abstract_syntax = SyntaxId::decode(cursor, little_endian)?;
        let transfer_syntaxes = (0..n_transfer)
            .map(|_| SyntaxId::decode(cursor, little_endian))
            .collect::<CodecResult<Vec<_>>>()?;

        Ok(Self {
            context_id,
            abstract_syntax,
            transfer_syntaxes,
        })
    }
}

/// Bind PDU
#[derive(Debug, Clone)]
pub struct BindPdu {
    pub header: PduHeader,
    pub max_xmit_frag: u16,
    pub max_recv_frag: u16,
    pub assoc_group_id: u32,
    pub context_list: Vec<ContextElement>,
    pub auth_verifier: Option<AuthVerifier>,
}

impl BindPdu {
    pub fn new(call_id: u32, context: ContextElement, max_xmit_frag: u16, max_recv_frag: u16) -> Self {
        Self {
            header: PduHeader::new(PacketType::Bind, call_id),
            max_xmit_frag,
            max_recv_frag,
            assoc_group_id: 0,
            context_list: vec![context],
            auth_verifier: None,
        }
    }

    pub fn encode(&self) -> Bytes {
        let little_endian = self.header.is_little_endian();
        let mut buf = start_pdu(128);

        put_u16(&mut buf, self.max_xmit_frag, little_endian);
        put_u16(&mut buf, self.max_recv_frag, little_endian);
        put_u32(&mut buf, self.assoc_group_id, little_endian);

        buf.put_u8(self.context_list.len() as u8);
        buf.put_bytes(0, 3);
        for ctx in &self.context_list {
            ctx.encode(&mut buf, little_endian);
        }

        let auth_length = put_auth(&mut buf, self.auth_verifier.as_ref(), little_endian);
        finish_pdu(buf, &self.header, auth_length)
    }

    pub fn decode(data: &[u8]) -> CodecResult<Self> {
        let (header, pdu) = frame(data)?;
        expect_type(&header, PacketType::Bind)?;
        let little_endian = header.is_little_endian();
        let (body_end, auth_verifier) = split_auth(pdu, &header, PduHeader::SIZE)?;

        let mut cursor = Cursor::new(&pdu[PduHeader::SIZE..body_end]);
        ensure(&cursor, 12, "bind body")?;
        let max_xmit_frag = get_u16(&mut cursor, little_endian);
        let max_recv_frag = get_u16(&mut cursor, little_endian);
        let assoc_group_id = get_u32(&mut cursor, little_endian);
        let n_context = cursor.get_u8();
        cursor.advance(3);

        let context_list = (0..n_context)
            .map(|_| ContextElement::decode(&mut cursor, little_endian))
            .collect::<CodecResult<Vec<_>>>()?;

        Ok(Self {
            header,
            max_xmit_frag,
            max_recv_frag,
            assoc_group_id,
            context_list,
            auth_verifier,
        })
    }
}

/// Presentation context result codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum ContextResult {
    Acceptance = 0,
    UserRejection = 1,
    ProviderRejection = 2,
}

/// One entry of the bind ack result list
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PresentationResult {
    pub result: u16,
    pub reason: u16,
    pub transfer_syntax: SyntaxId,
}

impl PresentationResult {
    pub fn accepted(transfer_syntax: SyntaxId) -> Self {
        Self {
            result: ContextResult::Acceptance as u16,
            reason: 0,
            transfer_syntax,
        }
    }

    pub fn is_accepted(&self) -> bool {
        self.result == ContextResult::Acceptance as u16
    }
}

/// Bind acknowledgment PDU
#[derive(Debug, Clone)]
pub struct BindAckPdu {
    pub header: PduHeader,
    pub max_xmit_frag: u16,
    pub max_recv_frag: u16,
    pub assoc_group_id: u32,
    /// Server-side endpoint name, without the NUL terminator
    pub secondary_addr: String,
    pub results: Vec<PresentationResult>,
    pub auth_verifier: Option<AuthVerifier>,
}

impl BindAckPdu {
    pub fn new(call_id: u32, secondary_addr: impl Into<String>, accepted: SyntaxId) -> Self {
        Self {
            header: PduHeader::new(PacketType::BindAck, call_id),
            max_xmit_frag: 0x1630,
            max_recv_frag: 0x1630,
            assoc_group_id: 0,
            secondary_addr: secondary_addr.into(),
            results: vec![PresentationResult::accepted(accepted)],
            auth_verifier: None,
        }
    }

    pub fn encode(&self) -> Bytes {
        let little_endian = self.header.is_little_endian();
        let mut buf = start_pdu(128);

        put_u16(&mut buf, self.max_xmit_frag, little_endian);
        put_u16(&mut buf, self.max_recv_frag, little_endian);
        put_u32(&mut buf, self.assoc_group_id, little_endian);

        let addr = self.secondary_addr.as_bytes();
        put_u16(&mut buf, addr.len() as u16 + 1, little_endian);
        buf.put_slice(addr);
        buf.put_u8(0);
        let padding = (4 - buf.len() % 4) % 4;
        buf.put_bytes(0, padding);

        buf.put_u8(self.results.len() as u8);
        buf.put_bytes(0, 3);
        for entry in &self.results {
            put_u16(&mut buf, entry.result, little_endian);
            put_u16(&mut buf, entry.reason, little_endian);
            entry.transfer_syntax.encode(&mut buf, little_endian);
        }

        let auth_length = put_auth(&mut buf, self.auth_verifier.as_ref(), little_endian);
        finish_pdu(buf, &self.header, auth_length)
    }

    pub fn decode(data: &[u8]) -> CodecResult<Self> {
        let (header, pdu) = frame(data)?;
        expect_type(&header, PacketType::BindAck)?;
        let little_endian = header.is_little_endian();
        let (body_end, auth_verifier) = split_auth(pdu, &header, PduHeader::SIZE)?;

        let mut cursor = Cursor::new(&pdu[PduHeader::SIZE..body_end]);
        ensure(&cursor, 10, "bind ack body")?;
        let max_xmit_frag = get_u16(&mut cursor, little_endian);
        let max_recv_frag = get_u16(&mut cursor, little_endian);
        let assoc_group_id = get_u32(&mut cursor, little_endian);

        let addr_len = get_u16(&mut cursor, little_endian) as usize;
        ensure(&cursor, addr_len, "secondary address")?;
        let mut addr = vec![0u8; addr_len];
        cursor.copy_to_slice(&mut addr);
        if let Some(nul) = addr.iter().position(|&b| b == 0) {
            addr.truncate(nul);
        }
        let secondary_addr = String::from_utf8_lossy(&addr).into_owned();

        // The body starts 4-byte aligned, so cursor alignment matches the PDU's.
        let padding = (4 - cursor.position() as usize % 4) % 4;
        ensure(&cursor, padding + 4, "result list")?;
        cursor.advance(padding);

        let n_results = cursor.get_u8();
        cursor.advance(3);
        let mut results = Vec::with_capacity(n_results as usize);
        for _ in 0..n_results {
            ensure(&cursor, 4, "presentation result")?;
            let result = get_u16(&mut cursor, little_endian);
            let reason = get_u16(&mut cursor, little_endian);
            let transfer_syntax = SyntaxId::decode(&mut cursor, little_endian)?;
            results.push(PresentationResult {
                result,
                reason,
                transfer_syntax,
            });
        }

        Ok(Self {
            header,
            max_xmit_frag,
            max_recv_frag,
            assoc_group_id,
            secondary_addr,
            results,
            auth_verifier,
        })
    }
}

/// Bind rejection PDU
#[derive(Debug, Clone)]
pub struct BindNakPdu {
    pub header: PduHeader,
    pub reject_reason: u16,
}

impl BindNakPdu {
    pub fn new(call_id: u32, reject_reason: u16) -> Self {
        Self {
            header: PduHeader::new(PacketType::BindNak, call_id),
            reject_reason,
        }
    }

    pub fn encode(&self) -> Bytes {
        let little_endian = self.header.is_little_endian();
        let mut buf = start_pdu(4);
        put_u16(&mut buf, self.reject_reason, little_endian);
        // empty protocol version list
        buf.put_u8(0);
        buf.put_u8(0);
        finish_pdu(buf, &self.header, 0)
    }

    pub fn decode(data: &[u8]) -> CodecResult<Self> {
        let (header, pdu) = frame(data)?;
        expect_type(&header, PacketType::BindNak)?;
        let mut cursor = Cursor::new(&pdu[PduHeader::SIZE..]);
        ensure(&cursor, 2, "bind nak body")?;
        let reject_reason = get_u16(&mut cursor, header.is_little_endian());
        Ok(Self {
            header,
            reject_reason,
        })
    }
}

/// Auth3 PDU, carrying the final NTLMSSP leg
///
/// Body: max_xmit_frag(2), max_recv_frag(2), then the auth trailer. No
/// response is sent by the server.
#[derive(Debug, Clone)]
pub struct Auth3Pdu {
    pub header: PduHeader,
    pub max_xmit_frag: u16,
    pub max_recv_frag: u16,
    pub auth_verifier: AuthVerifier,
}

impl Auth3Pdu {
    pub fn new(call_id: u32, max_xmit_frag: u16, max_recv_frag: u16, auth_verifier: AuthVerifier) -> Self {
        Self {
            header: PduHeader::new(PacketType::Auth3, call_id),
            max_xmit_frag,
            max_recv_frag,
            auth_verifier,
        }
    }

    pub fn encode(&self) -> Bytes {
        let little_endian = self.header.is_little_endian();
        let mut buf = start_pdu(64 + self.auth_verifier.auth_value.len());
        put_u16(&mut buf, self.max_xmit_frag, little_endian);
        put_u16(&mut buf, self.max_recv_frag, little_endian);
        let auth_length = put_auth(&mut buf, Some(&self.auth_verifier), little_endian);
        finish_pdu(buf, &self.header, auth_length)
    }

    pub fn decode(data: &[u8]) -> CodecResult<Self> {
        let (header, pdu) = frame(data)?;
        expect_type(&header, PacketType::Auth3)?;
        let little_endian = header.is_little_endian();
        let (body_end, auth_verifier) = split_auth(pdu, &header, PduHeader::SIZE)?;
        let auth_verifier = auth_verifier
            .ok_or_else(|| ProtocolError::InvalidPduData("auth3 without auth trailer".to_string()))?;

        let mut cursor = Cursor::new(&pdu[PduHeader::SIZE..body_end]);
        ensure(&cursor, 4, "auth3 body")?;
        let max_xmit_frag = get_u16(&mut cursor, little_endian);
        let max_recv_frag = get_u16(&mut cursor, little_endian);

        Ok(Self {
            header,
            max_xmit_frag,
            max_recv_frag,
            auth_verifier,
        })
    }
}

/// Request PDU
///
/// `stub_data` may already end in auth padding, in which case the trailer's
/// `auth_pad_length` must say so. Encoding adds any padding still needed to
/// reach 4-byte alignment.
#[derive(Debug, Clone)]
pub struct RequestPdu {
    pub header: PduHeader,
    pub alloc_hint: u32,
    pub context_id: u16,
    pub opnum: u16,
    pub stub_data: Bytes,
    pub auth_verifier: Option<AuthVerifier>,
}

impl RequestPdu {
    /// alloc_hint(4) + context_id(2) + opnum(2)
    pub const BODY_HEADER_SIZE: usize = 8;

    pub fn new(call_id: u32, context_id: u16, opnum: u16, stub_data: Bytes) -> Self {
        Self {
            header: PduHeader::new(PacketType::Request, call_id),
            alloc_hint: stub_data.len() as u32,
            context_id,
            opnum,
            stub_data,
            auth_verifier: None,
        }
    }

    pub fn encode(&self) -> Bytes {
        let little_endian = self.header.is_little_endian();
        let mut buf = start_pdu(Self::BODY_HEADER_SIZE + self.stub_data.len() + 32);
        put_u32(&mut buf, self.alloc_hint, little_endian);
        put_u16(&mut buf, self.context_id, little_endian);
        put_u16(&mut buf, self.opnum, little_endian);
        buf.put_slice(&self.stub_data);
        let auth_length = put_auth(&mut buf, self.auth_verifier.as_ref(), little_endian);
        finish_pdu(buf, &self.header, auth_length)
    }

    /// Decode a request. `stub_data` keeps any auth padding.
    pub fn decode(data: &[u8]) -> CodecResult<Self> {
        let (header, pdu) = frame(data)?;
        expect_type(&header, PacketType::Request)?;
        let little_endian = header.is_little_endian();
        let body_start = PduHeader::SIZE + Self::BODY_HEADER_SIZE;
        let (stub_end, auth_verifier) = split_auth(pdu, &header, body_start)?;

        let mut cursor = Cursor::new(&pdu[PduHeader::SIZE..]);
        ensure(&cursor, Self::BODY_HEADER_SIZE, "request body")?;
        let alloc_hint = get_u32(&mut cursor, little_endian);
        let context_id = get_u16(&mut cursor, little_endian);
        let opnum = get_u16(&mut cursor, little_endian);

        Ok(Self {
            header,
            alloc_hint,
            context_id,
            opnum,
            stub_data: Bytes::copy_from_slice(&pdu[body_start..stub_end]),
            auth_verifier,
        })
    }
}

/// Response PDU
///
/// After decoding, `stub_data` holds everything between the body header and
/// the auth trailer. When a trailer is present its last `auth_pad_length`
/// bytes are padding, which stays in place so the signed region can be
/// verified as received.
#[derive(Debug, Clone)]
pub struct ResponsePdu {
    pub header: PduHeader,
    pub alloc_hint: u32,
    pub context_id: u16,
    pub cancel_count: u8,
    pub stub_data: Bytes,
    pub auth_verifier: Option<AuthVerifier>,
}

impl ResponsePdu {
    /// alloc_hint(4) + context_id(2) + cancel_count(1) + reserved(1)
    pub const BODY_HEADER_SIZE: usize = 8;

    pub fn new(call_id: u32, context_id: u16, stub_data: Bytes) -> Self {
        Self {
            header: PduHeader::new(PacketType::Response, call_id),
            alloc_hint: stub_data.len() as u32,
            context_id,
            cancel_count: 0,
            stub_data,
            auth_verifier: None,
        }
    }

    pub fn encode(&self) -> Bytes {
        let little_endian = self.header.is_little_endian();
        let mut buf = start_pdu(Self::BODY_HEADER_SIZE + self.stub_data.len() + 32);
        put_u32(&mut buf, self.alloc_hint, little_endian);
        put_u16(&mut buf, self.context_id, little_endian);
        buf.put_u8(self.cancel_count);
        buf.put_u8(0);
        buf.put_slice(&self.stub_data);
        let auth_length = put_auth(&mut buf, self.auth_verifier.as_ref(), little_endian);
        finish_pdu(buf, &self.header, auth_length)
    }

    pub fn decode(data: &[u8]) -> CodecResult<Self> {
        let (header, pdu) = frame(data)?;
        expect_type(&header, PacketType::Response)?;
        let little_endian = header.is_little_endian();
        let body_start = PduHeader::SIZE + Self::BODY_HEADER_SIZE;
        let (stub_end, auth_verifier) = split_auth(pdu, &header, body_start)?;

        let mut cursor = Cursor::new(&pdu[PduHeader::SIZE..]);
        ensure(&cursor, Self::BODY_HEADER_SIZE, "response body")?;
        let alloc_hint = get_u32(&mut cursor, little_endian);
        let context_id = get_u16(&mut cursor, little_endian);
        let cancel_count = cursor.get_u8();

        Ok(Self {
            header,
            alloc_hint,
            context_id,
            cancel_count,
            stub_data: Bytes::copy_from_slice(&pdu[body_start..stub_end]),
            auth_verifier,
        })
    }

    /// Stub data with trailing auth padding removed
    pub fn unpadded_stub(&self) -> CodecResult<Bytes> {
        let pad = self.auth_verifier.as_ref().map_or(0, |a| a.auth_pad_length);
        strip_padding(&self.stub_data, pad)
    }
}

pub(crate) fn strip_padding(stub: &Bytes, pad: u8) -> CodecResult<Bytes> {
    let keep = stub
        .len()
        .checked_sub(pad as usize)
        .ok_or(ProtocolError::InvalidAuthPadding {
            pad,
            stub_len: stub.len(),
        })?;
    Ok(stub.slice(..keep))
}

/// Fault status codes a client commonly sees
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum FaultStatus {
    AccessDenied = 0x0000_0005,
    OpRngError = 0x1c01_0002,
}

/// Fault PDU
#[derive(Debug, Clone)]
pub struct FaultPdu {
    pub header: PduHeader,
    pub alloc_hint: u32,
    pub context_id: u16,
    pub cancel_count: u8,
    pub status: u32,
}

impl FaultPdu {
    pub fn new(call_id: u32, status: u32) -> Self {
        Self {
            header: PduHeader::new(PacketType::Fault, call_id),
            alloc_hint: 0,
            context_id: 0,
            cancel_count: 0,
            status,
        }
    }

    pub fn encode(&self) -> Bytes {
        let little_endian = self.header.is_little_endian();
        let mut buf = start_pdu(16);
        put_u32(&mut buf, self.alloc_hint, little_endian);
        put_u16(&mut buf, self.context_id, little_endian);
        buf.put_u8(self.cancel_count);
        buf.put_u8(0);
        put_u32(&mut buf, self.status, little_endian);
        buf.put_u32(0);
        finish_pdu(buf, &self.header, 0)
    }

    pub fn decode(data: &[u8]) -> CodecResult<Self> {
        let (header, pdu) = frame(data)?;
        expect_type(&header, PacketType::Fault)?;
        let little_endian = header.is_little_endian();

        let mut cursor = Cursor::new(&pdu[PduHeader::SIZE..]);
        ensure(&cursor, 12, "fault body")?;
        let alloc_hint = get_u32(&mut cursor, little_endian);
        let context_id = get_u16(&mut cursor, little_endian);
        let cancel_count = cursor.get_u8();
        cursor.advance(1);
        let status = get_u32(&mut cursor, little_endian);

        Ok(Self {
            header,
            alloc_hint,
            context_id,
            cancel_count,
            status,
        })
    }
}

/// Any PDU a named pipe client sends or receives
#[derive(Debug, Clone)]
pub enum Pdu {
    Bind(BindPdu),
    BindAck(BindAckPdu),
    BindNak(BindNakPdu),
    Auth3(Auth3Pdu),
    Request(RequestPdu),
    Response(ResponsePdu),
    Fault(FaultPdu),
}

impl Pdu {
    pub fn decode(data: &[u8]) -> CodecResult<Self> {
        let header = PduHeader::decode(data)?;
        match header.packet_type {
            PacketType::Bind => Ok(Pdu::Bind(BindPdu::decode(data)?)),
            PacketType::BindAck => Ok(Pdu::BindAck(BindAckPdu::decode(data)?)),
            PacketType::BindNak => Ok(Pdu::BindNak(BindNakPdu::decode(data)?)),
            PacketType::Auth3 => Ok(Pdu::Auth3(Auth3Pdu::decode(data)?)),
            PacketType::Request => Ok(Pdu::Request(RequestPdu::decode(data)?)),
            PacketType::Response => Ok(Pdu::Response(ResponsePdu::decode(data)?)),
            PacketType::Fault => Ok(Pdu::Fault(FaultPdu::decode(data)?)),
        }
    }

    pub fn encode(&self) -> Bytes {
        match self {
            Pdu::Bind(pdu) => pdu.encode(),
            Pdu::BindAck(pdu) => pdu.encode(),
            Pdu::BindNak(pdu) => pdu.encode(),
            Pdu::Auth3(pdu) => pdu.encode(),
            Pdu::Request(pdu) => pdu.encode(),
            Pdu::Response(pdu) => pdu.encode(),
            Pdu::Fault(pdu) => pdu.encode(),
        }
    }

    pub fn header(&self) -> &PduHeader {
        match self {
            Pdu::Bind(pdu) => &pdu.header,
            Pdu::BindAck(pdu) => &pdu.header,
            Pdu::BindNak(pdu) => &pdu.header,
            Pdu::Auth3(pdu) => &pdu.header,
            Pdu::Request(pdu) => &pdu.header,
            Pdu::Response(pdu) => &pdu.header,
            Pdu::Fault(pdu) => &pdu.header,
        }
    }

    pub fn call_id(&self) -> u32 {
        self.header().call_id
    }
}
