//! Request framing and response reassembly
//!
//! Requests always go out as a single fragment with FIRST_FRAG and
//! LAST_FRAG set; a request that does not fit in the negotiated
//! `max_xmit_frag` is refused before any keystream is consumed.
//!
//! Responses may span several fragments:
//!
//! ```text
//! read 1:  [hdr FIRST]  [body]  [pad] [trailer sig]
//! read 2:  [hdr      ]  [body]  [pad] [trailer sig]
//! read N:  [hdr  LAST]  [body]  [pad] [trailer sig]
//! ```
//!
//! On a signed connection each fragment carries its own signature and is
//! verified (and unsealed) as it arrives, before its body is appended.

use crate::dcerpc::{
    strip_padding, FaultPdu, PacketType, PduHeader, RequestPdu, ResponsePdu,
};
use crate::dcerpc_transport::DceRpcTransport;
use crate::error::{CallError, IntegrityError, ProtocolError};
use crate::security::{calculate_auth_padding, AuthLevel, AuthType, AuthVerifier};
use crate::sign_seal::{SecurityContext, SIGNATURE_SIZE};
use bytes::{BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, trace};

/// Per-call values needed to frame a request
#[derive(Debug, Clone, Copy)]
pub struct CallParams {
    pub call_id: u32,
    pub context_id: u16,
    pub opnum: u16,
    pub max_xmit_frag: u16,
    pub auth_level: AuthLevel,
    pub auth_context_id: u32,
}

/// Size of the single request fragment carrying `stub_len` bytes of stub.
pub fn request_fragment_size(stub_len: usize, signing: bool) -> usize {
    let base = PduHeader::SIZE + RequestPdu::BODY_HEADER_SIZE + stub_len;
    if signing {
        base + calculate_auth_padding(stub_len) + AuthVerifier::HEADER_SIZE + SIGNATURE_SIZE
    } else {
        base
    }
}

/// Largest stub that fits in one request fragment of `max_frag` bytes.
pub fn max_stub_size(max_frag: u16, signing: bool) -> usize {
    let overhead = PduHeader::SIZE + RequestPdu::BODY_HEADER_SIZE;
    let available = (max_frag as usize).saturating_sub(overhead);
    if signing {
        // the trailer starts 4-byte aligned, so round down first
        let room = available.saturating_sub(AuthVerifier::HEADER_SIZE + SIGNATURE_SIZE);
        room - room % 4
    } else {
        available
    }
}

/// Sign or seal `stub` as the context requires and write it as one request
/// fragment.
pub async fn send_request<T: AsyncWrite + Unpin>(
    transport: &mut DceRpcTransport<T>,
    security: Option<&mut SecurityContext>,
    params: &CallParams,
    stub: &[u8],
) -> Result<(), CallError> {
    let signing = security.as_ref().map_or(false, |ctx| ctx.is_signing());
    let size = request_fragment_size(stub.len(), signing);
    if size > params.max_xmit_frag as usize {
        return Err(CallError::RequestTooLarge {
            size,
            max: params.max_xmit_frag as usize,
        });
    }

    let pad = if signing {
        calculate_auth_padding(stub.len())
    } else {
        0
    };
    let mut body = BytesMut::with_capacity(stub.len() + pad);
    body.extend_from_slice(stub);
    body.put_bytes(0, pad);

    let signature = security.and_then(|ctx| ctx.protect(&mut body));

    let mut request = RequestPdu::new(params.call_id, params.context_id, params.opnum, body.freeze());
    request.alloc_hint = stub.len() as u32;
    if let Some(signature) = signature {
        request.auth_verifier = Some(
            AuthVerifier::new(
                AuthType::Ntlm,
                params.auth_level,
                params.auth_context_id,
                Bytes::copy_from_slice(signature.as_bytes()),
            )
            .with_padding(pad as u8),
        );
    }

    let encoded = request.encode();
    debug!(
        "Sending request: call_id={}, opnum={}, stub_len={}, frag_length={}, signed={}",
        params.call_id,
        params.opnum,
        stub.len(),
        encoded.len(),
        signing
    );
    transport.write_fragment(&encoded).await?;
    Ok(())
}

/// Read fragments until LAST_FRAG and return the reassembled stub.
///
/// A fault at any point ends the call with [`CallError::Fault`].
pub async fn receive_response<T: AsyncRead + Unpin>(
    transport: &mut DceRpcTransport<T>,
    mut security: Option<&mut SecurityContext>,
    call_id: u32,
) -> Result<Bytes, CallError> {
    let mut assembler = FragmentAssembler::new(call_id);

    loop {
        let (header, data) = transport.read_fragment::<CallError>().await?;
        match header.packet_type {
            PacketType::Response => {}
            PacketType::Fault => {
                let fault = FaultPdu::decode(&data)?;
                debug!("Call faulted: call_id={}, status=0x{:08x}", call_id, fault.status);
                return Err(CallError::Fault(fault.status));
            }
            other => {
                return Err(ProtocolError::UnexpectedPacketType {
                    expected: PacketType::Response.name(),
                    got: other as u8,
                }
                .into())
            }
        }

        assembler.check_header(&header)?;
        let response = ResponsePdu::decode(&data)?;
        let pad = response
            .auth_verifier
            .as_ref()
            .map_or(0, |verifier| verifier.auth_pad_length);

        let body = match security.as_deref_mut() {
            Some(ctx) if ctx.is_signing() => {
                let verifier = response
                    .auth_verifier
                    .as_ref()
                    .ok_or(IntegrityError::MissingSignature)?;
                let mut body = BytesMut::from(&response.stub_data[..]);
                ctx.verify(&mut body, &verifier.auth_value)?;
                body.freeze()
            }
            _ => response.stub_data.clone(),
        };

        let stub = strip_padding(&body, pad)?;
        if let Some(complete) = assembler.append(&header, &stub) {
            return Ok(complete);
        }
    }
}

/// Accumulates the stub of one multi-fragment response
///
/// The first fragment must carry FIRST_FRAG and no later one may. Every
/// fragment must echo the call id of the request.
#[derive(Debug)]
pub struct FragmentAssembler {
    call_id: u32,
    stub: BytesMut,
    fragments: usize,
}

impl FragmentAssembler {
    pub fn new(call_id: u32) -> Self {
        Self {
            call_id,
            stub: BytesMut::new(),
            fragments: 0,
        }
    }

    pub fn call_id(&self) -> u32 {
        self.call_id
    }

    /// Number of fragments appended so far
    pub fn fragments(&self) -> usize {
        self.fragments
    }

    /// Validate a fragment header before its body is touched.
    pub fn check_header(&self, header: &PduHeader) -> Result<(), CallError> {
        if header.call_id != self.call_id {
            return Err(ProtocolError::CallIdMismatch {
                expected: self.call_id,
                got: header.call_id,
            }
            .into());
        }

        let first = header.packet_flags.is_first_frag();
        if self.fragments == 0 && !first {
            return Err(CallError::Desync(format!(
                "first fragment of call {} lacks FIRST_FRAG",
                self.call_id
            )));
        }
        if self.fragments > 0 && first {
            return Err(CallError::Desync(format!(
                "FIRST_FRAG set on fragment {} of call {}",
                self.fragments + 1,
                self.call_id
            )));
        }
        Ok(())
    }

    /// Append a checked fragment. Returns the whole stub once the fragment
    /// carrying LAST_FRAG has been added.
    pub fn append(&mut self, header: &PduHeader, stub: &[u8]) -> Option<Bytes> {
        self.stub.extend_from_slice(stub);
        self.fragments += 1;
        trace!(
            "Appended fragment: call_id={}, fragment={}, len={}, total={}",
            self.call_id,
            self.fragments,
            stub.len(),
            self.stub.len()
        );

        if header.packet_flags.is_last_frag() {
            Some(self.stub.split().freeze())
        } else {
            None
        }
    }
}
