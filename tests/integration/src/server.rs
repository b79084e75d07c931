//! Scripted pipe server
//!
//! Each test spawns a task that owns a [`PipeServer`] and plays one side of
//! the conversation step by step. Helpers panic on anything unexpected so a
//! broken script fails the test through the task's `JoinHandle`.

use crate::reference::ReferenceSealer;
use crate::SESSION_KEY;
use bytes::{BufMut, Bytes, BytesMut};
use dcerpc_np::{
    calculate_auth_padding, AuthLevel, AuthType, AuthVerifier, AuthenticateMessage, BindAckPdu,
    BindNakPdu, BindPdu, CallError, ChallengeMessage, DceRpcTransport, FaultPdu, Flags,
    PacketFlags, Pdu, RequestPdu, ResponsePdu,
};
use tokio::io::{duplex, DuplexStream};
use tracing::debug;

/// Context id used by the server in responses
pub const SERVER_CONTEXT_ID: u16 = 0;

/// Create a connected client pipe and server.
pub fn pipe_pair() -> (DuplexStream, PipeServer) {
    let (client, server) = duplex(64 * 1024);
    (client, PipeServer::new(server))
}

pub struct PipeServer {
    transport: DceRpcTransport<DuplexStream>,
    sealer: Option<ReferenceSealer>,
}

impl PipeServer {
    pub fn new(stream: DuplexStream) -> Self {
        Self {
            transport: DceRpcTransport::new(stream),
            sealer: None,
        }
    }

    pub fn sealer(&self) -> Option<&ReferenceSealer> {
        self.sealer.as_ref()
    }

    pub async fn read_pdu(&mut self) -> Pdu {
        let (_, data) = self
            .transport
            .read_fragment::<CallError>()
            .await
            .expect("read fragment");
        Pdu::decode(&data).expect("decode PDU")
    }

    pub async fn send(&mut self, fragment: &[u8]) {
        self.transport
            .write_fragment(fragment)
            .await
            .expect("write fragment");
    }

    pub async fn read_bind(&mut self) -> BindPdu {
        match self.read_pdu().await {
            Pdu::Bind(bind) => bind,
            other => panic!("expected bind, got {:?}", other),
        }
    }

    /// Accept an unauthenticated bind, answering with `secondary_addr`.
    pub async fn accept_bind(&mut self, secondary_addr: &str) -> BindPdu {
        let bind = self.read_bind().await;
        let ack = accept(&bind, secondary_addr);
        self.send(&ack.encode()).await;
        bind
    }

    /// Answer a bind with a BIND_NAK.
    pub async fn reject_bind(&mut self, reason: u16) -> BindPdu {
        let bind = self.read_bind().await;
        let nak = BindNakPdu::new(bind.header.call_id, reason);
        self.send(&nak.encode()).await;
        bind
    }

    /// Run the NTLMSSP handshake with `flags` and `challenge`, then install
    /// a sealer keyed with [`SESSION_KEY`].
    pub async fn accept_authenticated_bind(
        &mut self,
        secondary_addr: &str,
        flags: Flags,
        challenge: [u8; 8],
    ) -> AuthenticateMessage {
        let bind = self.read_bind().await;
        let negotiate = bind.auth_verifier.as_ref().expect("bind carries NEGOTIATE");
        assert_eq!(negotiate.auth_type, AuthType::Ntlm);

        let mut ack = accept(&bind, secondary_addr);
        ack.auth_verifier = Some(AuthVerifier::new(
            AuthType::Ntlm,
            AuthLevel::PktPrivacy,
            negotiate.auth_context_id,
            ChallengeMessage::new(flags, challenge).encode(),
        ));
        self.send(&ack.encode()).await;

        let auth3 = match self.read_pdu().await {
            Pdu::Auth3(auth3) => auth3,
            other => panic!("expected auth3, got {:?}", other),
        };
        assert_eq!(auth3.header.call_id, bind.header.call_id);
        let authenticate =
            AuthenticateMessage::decode(&auth3.auth_verifier.auth_value).expect("AUTHENTICATE");

        let seal = flags.contains(Flags::NEGOTIATE_SEAL);
        debug!("Server installed sealer: seal={}", seal);
        self.sealer = Some(ReferenceSealer::new(&SESSION_KEY, seal));
        authenticate
    }

    /// Read a request, verify and unseal it if a sealer is installed, and
    /// return it with padding removed from `stub_data`.
    pub async fn read_request(&mut self) -> RequestPdu {
        let mut request = match self.read_pdu().await {
            Pdu::Request(request) => request,
            other => panic!("expected request, got {:?}", other),
        };
        let pad = request
            .auth_verifier
            .as_ref()
            .map_or(0, |verifier| verifier.auth_pad_length as usize);

        let mut body = BytesMut::from(&request.stub_data[..]);
        if let Some(sealer) = self.sealer.as_mut() {
            let verifier = request.auth_verifier.as_ref().expect("signed request");
            sealer
                .verify(&mut body, &verifier.auth_value)
                .expect("request signature");
        }
        body.truncate(body.len() - pad);
        request.stub_data = body.freeze();
        request
    }

    /// Build one response fragment, signed and sealed when a sealer is
    /// installed.
    pub fn response_fragment(&mut self, call_id: u32, stub: &[u8], flags: PacketFlags) -> Bytes {
        let mut response = match self.sealer.as_mut() {
            Some(sealer) => {
                let pad = calculate_auth_padding(stub.len());
                let mut body = BytesMut::with_capacity(stub.len() + pad);
                body.extend_from_slice(stub);
                body.put_bytes(0, pad);
                let signature = sealer.sign(&mut body);

                let mut response = ResponsePdu::new(call_id, SERVER_CONTEXT_ID, body.freeze());
                response.auth_verifier = Some(
                    AuthVerifier::new(
                        AuthType::Ntlm,
                        AuthLevel::PktPrivacy,
                        1,
                        Bytes::copy_from_slice(&signature),
                    )
                    .with_padding(pad as u8),
                );
                response
            }
            None => ResponsePdu::new(call_id, SERVER_CONTEXT_ID, Bytes::copy_from_slice(stub)),
        };
        response.alloc_hint = stub.len() as u32;
        response.header.packet_flags = flags;
        response.encode()
    }

    /// Answer with a single-fragment response.
    pub async fn respond(&mut self, call_id: u32, stub: &[u8]) {
        let fragment = self.response_fragment(call_id, stub, PacketFlags::fragment(true, true));
        self.send(&fragment).await;
    }

    /// Answer with one fragment per chunk.
    pub async fn respond_fragments(&mut self, call_id: u32, chunks: &[&[u8]]) {
        let last = chunks.len() - 1;
        for (i, chunk) in chunks.iter().enumerate() {
            let flags = PacketFlags::fragment(i == 0, i == last);
            let fragment = self.response_fragment(call_id, chunk, flags);
            self.send(&fragment).await;
        }
    }

    pub async fn fault(&mut self, call_id: u32, status: u32) {
        let fault = FaultPdu::new(call_id, status);
        self.send(&fault.encode()).await;
    }
}

fn accept(bind: &BindPdu, secondary_addr: &str) -> BindAckPdu {
    let context = &bind.context_list[0];
    let mut ack = BindAckPdu::new(bind.header.call_id, secondary_addr, context.transfer_syntaxes[0]);
    ack.max_xmit_frag = bind.max_recv_frag;
    ack.max_recv_frag = bind.max_xmit_frag;
    ack
}
