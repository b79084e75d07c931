//! Bind negotiation with optional NTLMSSP authentication
//!
//! ```text
//! client                                   server
//!   BIND      [NEGOTIATE]         ->
//!             <-  BIND_ACK  [CHALLENGE]
//!   AUTH3     [AUTHENTICATE]      ->
//! ```
//!
//! The server does not answer the AUTH3. Once it has been written the
//! channel is bound, and the flags from the CHALLENGE decide for the rest
//! of the connection whether PDUs are signed, sealed, both or neither.

use crate::config::ChannelConfig;
use crate::dcerpc::{
    Auth3Pdu, BindAckPdu, BindNakPdu, BindPdu, ContextElement, FaultPdu, PacketType,
};
use crate::dcerpc_transport::DceRpcTransport;
use crate::error::{BindError, ProtocolError};
use crate::ntlmssp::{AuthenticateMessage, ChallengeMessage, NegotiateMessage, NtlmCredentials};
use crate::security::{AuthType, AuthVerifier};
use crate::sign_seal::SecurityContext;
use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, trace};

/// Call id carried by the BIND and the AUTH3
pub const BIND_CALL_ID: u32 = 1;

/// Where a bind negotiation currently stands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindState {
    Idle,
    SentBindReq,
    AwaitingChallenge,
    SentAuthenticate,
    Bound,
    Failed,
}

/// Result of a successful bind
#[derive(Debug)]
pub struct BindOutcome {
    /// `None` for an unauthenticated channel
    pub security: Option<SecurityContext>,
    pub max_xmit_frag: u16,
    pub max_recv_frag: u16,
    pub assoc_group_id: u32,
    pub secondary_addr: String,
}

/// Drives one bind to completion
pub struct BindNegotiator<'a> {
    config: &'a ChannelConfig,
    credentials: Option<&'a dyn NtlmCredentials>,
    state: BindState,
}

impl<'a> BindNegotiator<'a> {
    pub fn new(config: &'a ChannelConfig, credentials: Option<&'a dyn NtlmCredentials>) -> Self {
        Self {
            config,
            credentials,
            state: BindState::Idle,
        }
    }

    pub fn state(&self) -> BindState {
        self.state
    }

    fn transition(&mut self, next: BindState) {
        debug!("Bind state {:?} -> {:?}", self.state, next);
        self.state = next;
    }

    /// Run the handshake. Any error leaves the negotiator in
    /// [`BindState::Failed`].
    pub async fn run<T: AsyncRead + AsyncWrite + Unpin>(
        &mut self,
        transport: &mut DceRpcTransport<T>,
    ) -> Result<BindOutcome, BindError> {
        match self.negotiate(transport).await {
            Ok(outcome) => Ok(outcome),
            Err(e) => {
                debug!("Bind failed: {}", e);
                self.transition(BindState::Failed);
                Err(e)
            }
        }
    }

    async fn negotiate<T: AsyncRead + AsyncWrite + Unpin>(
        &mut self,
        transport: &mut DceRpcTransport<T>,
    ) -> Result<BindOutcome, BindError> {
        let config = self.config;

        let mut bind = BindPdu::new(
            BIND_CALL_ID,
            ContextElement::new(config.context_id, config.abstract_syntax, config.transfer_syntax),
            config.max_xmit_frag,
            config.max_recv_frag,
        );
        if let Some(credentials) = self.credentials {
            let negotiate = NegotiateMessage::new(
                config.ntlmssp_flags,
                credentials.domain(),
                config.workstation.as_str(),
            );
            bind.auth_verifier = Some(self.verifier(negotiate.encode()));
        }

        debug!(
            "Sending bind: call_id={}, interface={}, authenticated={}",
            BIND_CALL_ID,
            config.abstract_syntax,
            self.credentials.is_some()
        );
        transport.write_fragment(&bind.encode()).await?;
        self.transition(BindState::SentBindReq);

        let ack = read_bind_ack(transport).await?;
        self.check_ack(&ack)?;

        let max_xmit_frag = negotiate_frag(config.max_xmit_frag, ack.max_recv_frag);
        let max_recv_frag = negotiate_frag(config.max_recv_frag, ack.max_xmit_frag);
        debug!(
            "Bind accepted: secondary_addr={:?}, max_xmit={}, max_recv={}",
            ack.secondary_addr, max_xmit_frag, max_recv_frag
        );

        let credentials = self.credentials;
        let security = match credentials {
            Some(credentials) => Some(
                self.authenticate(transport, credentials, &ack, max_xmit_frag, max_recv_frag)
                    .await?,
            ),
            None => None,
        };

        self.transition(BindState::Bound);
        Ok(BindOutcome {
            security,
            max_xmit_frag,
            max_recv_frag,
            assoc_group_id: ack.assoc_group_id,
            secondary_addr: ack.secondary_addr,
        })
    }

    /// Answer the challenge in the ack with an AUTH3 and build the
    /// security context from the resulting session key.
    async fn authenticate<T: AsyncWrite + Unpin>(
        &mut self,
        transport: &mut DceRpcTransport<T>,
        credentials: &dyn NtlmCredentials,
        ack: &BindAckPdu,
        max_xmit_frag: u16,
        max_recv_frag: u16,
    ) -> Result<SecurityContext, BindError> {
        let verifier = ack.auth_verifier.as_ref().ok_or(BindError::MissingChallenge)?;
        if verifier.auth_type != AuthType::Ntlm {
            return Err(BindError::AuthTypeMismatch(verifier.auth_type as u8));
        }
        let challenge =
            ChallengeMessage::decode(&verifier.auth_value).map_err(BindError::MalformedChallenge)?;
        self.transition(BindState::AwaitingChallenge);
        debug!("Received NTLMSSP challenge: flags={:?}", challenge.flags);

        let response = credentials
            .challenge_response(&challenge.challenge)
            .map_err(BindError::Credentials)?;

        let authenticate = AuthenticateMessage {
            flags: challenge.flags,
            lm_response: response.lm_response.clone(),
            nt_response: response.nt_response.clone(),
            domain: credentials.domain().to_string(),
            user: credentials.user_name().to_string(),
            workstation: self.config.workstation.clone(),
            session_key: Bytes::new(),
        };
        let security = SecurityContext::new(challenge.flags, &response.session_key);

        let auth3 = Auth3Pdu::new(
            BIND_CALL_ID,
            max_xmit_frag,
            max_recv_frag,
            self.verifier(authenticate.encode()),
        );
        transport.write_fragment(&auth3.encode()).await?;
        self.transition(BindState::SentAuthenticate);

        debug!(
            "Sent AUTH3: user={}, signing={}, sealing={}",
            credentials.user_name(),
            security.is_signing(),
            security.is_sealing()
        );
        Ok(security)
    }

    fn verifier(&self, token: Bytes) -> AuthVerifier {
        AuthVerifier::new(
            AuthType::Ntlm,
            self.config.auth_level,
            self.config.auth_context_id,
            token,
        )
    }

    fn check_ack(&self, ack: &BindAckPdu) -> Result<(), BindError> {
        if ack.header.call_id != BIND_CALL_ID {
            return Err(ProtocolError::CallIdMismatch {
                expected: BIND_CALL_ID,
                got: ack.header.call_id,
            }
            .into());
        }

        let result = match ack.results.as_slice() {
            [result] => result,
            results => return Err(BindError::ResultCount(results.len())),
        };
        if !result.is_accepted() {
            return Err(BindError::Rejected {
                result: result.result,
                reason: result.reason,
            });
        }
        if result.transfer_syntax != self.config.transfer_syntax {
            return Err(BindError::TransferSyntaxMismatch {
                offered: self.config.transfer_syntax,
                accepted: result.transfer_syntax,
            });
        }

        if let Some(expected) = &self.config.expected_secondary_address {
            if !ack.secondary_addr.eq_ignore_ascii_case(expected) {
                return Err(BindError::SecondaryAddressMismatch {
                    expected: expected.clone(),
                    got: ack.secondary_addr.clone(),
                });
            }
        }
        Ok(())
    }
}

/// Read the reply to a BIND. Some servers send the ack with neither
/// fragment flag set; it is always treated as one complete fragment.
async fn read_bind_ack<T: AsyncRead + Unpin>(
    transport: &mut DceRpcTransport<T>,
) -> Result<BindAckPdu, BindError> {
    let (header, data) = transport.read_fragment::<BindError>().await?;
    trace!("Bind reply flags=0x{:02x}", header.packet_flags.as_u8());

    match header.packet_type {
        PacketType::BindAck => Ok(BindAckPdu::decode(&data)?),
        PacketType::BindNak => {
            let nak = BindNakPdu::decode(&data)?;
            Err(BindError::Nak {
                reason: nak.reject_reason,
            })
        }
        PacketType::Fault => {
            let fault = FaultPdu::decode(&data)?;
            Err(BindError::Fault(fault.status))
        }
        other => Err(ProtocolError::UnexpectedPacketType {
            expected: PacketType::BindAck.name(),
            got: other as u8,
        }
        .into()),
    }
}

/// The smaller of our limit and the peer's, ignoring a zero from the peer.
fn negotiate_frag(ours: u16, theirs: u16) -> u16 {
    if theirs == 0 {
        ours
    } else {
        ours.min(theirs)
    }
}
