//! Bound RPC channel over a named pipe
//!
//! [`bind`] runs the handshake on an already-open pipe and returns a
//! [`BoundChannel`]. Each [`BoundChannel::call`] sends one request and
//! waits for its complete response; `&mut self` keeps calls strictly
//! sequential.

use crate::config::ChannelConfig;
use crate::dcerpc_bind::{BindNegotiator, BIND_CALL_ID};
use crate::dcerpc_transport::DceRpcTransport;
use crate::error::{BindError, CallError};
use crate::fragmentation::{receive_response, send_request, CallParams};
use crate::ntlmssp::{Flags, NtlmCredentials};
use crate::security::AuthLevel;
use crate::sign_seal::SecurityContext;
use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, warn};

/// Bind to the interface named by `config` over `transport`.
///
/// With `credentials` the bind carries an NTLMSSP handshake and the
/// resulting channel signs and seals as the server's flags require.
/// Without, the channel is unauthenticated.
pub async fn bind<T: AsyncRead + AsyncWrite + Unpin>(
    transport: T,
    config: &ChannelConfig,
    credentials: Option<&dyn NtlmCredentials>,
) -> Result<BoundChannel<T>, BindError> {
    let mut transport = DceRpcTransport::new(transport).with_max_pdu_size(config.max_pdu_size);
    let outcome = BindNegotiator::new(config, credentials)
        .run(&mut transport)
        .await?;

    Ok(BoundChannel {
        transport,
        security: outcome.security,
        next_call_id: BIND_CALL_ID + 1,
        context_id: config.context_id,
        max_xmit_frag: outcome.max_xmit_frag,
        max_recv_frag: outcome.max_recv_frag,
        auth_level: config.auth_level,
        auth_context_id: config.auth_context_id,
        secondary_addr: outcome.secondary_addr,
        poisoned: false,
    })
}

/// Issue one call on `channel`. Same as [`BoundChannel::call`].
pub async fn call<T: AsyncRead + AsyncWrite + Unpin>(
    channel: &mut BoundChannel<T>,
    opnum: u16,
    request: &[u8],
) -> Result<Bytes, CallError> {
    channel.call(opnum, request).await
}

/// A pipe bound to one interface
///
/// Owns the call id counter and, when authenticated, the security context.
/// Once a call fails in a way that leaves the keystream or fragment stream
/// in an unknown state the channel is poisoned and every later call returns
/// [`CallError::Poisoned`]; the caller must open a new pipe and bind again.
#[derive(Debug)]
pub struct BoundChannel<T> {
    transport: DceRpcTransport<T>,
    security: Option<SecurityContext>,
    next_call_id: u32,
    context_id: u16,
    max_xmit_frag: u16,
    max_recv_frag: u16,
    auth_level: AuthLevel,
    auth_context_id: u32,
    secondary_addr: String,
    poisoned: bool,
}

impl<T: AsyncRead + AsyncWrite + Unpin> BoundChannel<T> {
    /// Send `request` as operation `opnum` and return the reassembled,
    /// verified response stub.
    pub async fn call(&mut self, opnum: u16, request: &[u8]) -> Result<Bytes, CallError> {
        if self.poisoned {
            return Err(CallError::Poisoned);
        }

        match self.exchange(opnum, request).await {
            Ok(response) => Ok(response),
            Err(e) => {
                if e.poisons() {
                    warn!("Channel poisoned by failed call: opnum={}, error={}", opnum, e);
                    self.poisoned = true;
                }
                Err(e)
            }
        }
    }

    async fn exchange(&mut self, opnum: u16, request: &[u8]) -> Result<Bytes, CallError> {
        let params = CallParams {
            call_id: self.next_call_id,
            context_id: self.context_id,
            opnum,
            max_xmit_frag: self.max_xmit_frag,
            auth_level: self.auth_level,
            auth_context_id: self.auth_context_id,
        };

        send_request(&mut self.transport, self.security.as_mut(), &params, request).await?;
        self.next_call_id = self.next_call_id.wrapping_add(1);

        let response =
            receive_response(&mut self.transport, self.security.as_mut(), params.call_id).await?;
        debug!(
            "Call complete: call_id={}, opnum={}, response_len={}",
            params.call_id,
            opnum,
            response.len()
        );
        Ok(response)
    }
}

impl<T> BoundChannel<T> {
    /// Flags the server settled on, or `None` when unauthenticated
    pub fn negotiated_flags(&self) -> Option<Flags> {
        self.security.as_ref().map(SecurityContext::flags)
    }

    pub fn is_signing(&self) -> bool {
        self.security.as_ref().map_or(false, SecurityContext::is_signing)
    }

    pub fn is_sealing(&self) -> bool {
        self.security.as_ref().map_or(false, SecurityContext::is_sealing)
    }

    pub fn max_xmit_frag(&self) -> u16 {
        self.max_xmit_frag
    }

    pub fn max_recv_frag(&self) -> u16 {
        self.max_recv_frag
    }

    /// Server pipe name reported in the bind ack
    pub fn secondary_addr(&self) -> &str {
        &self.secondary_addr
    }

    /// Call id the next request will use
    pub fn next_call_id(&self) -> u32 {
        self.next_call_id
    }

    pub fn is_poisoned(&self) -> bool {
        self.poisoned
    }

    /// Give the pipe back, discarding the security state.
    pub fn into_inner(self) -> T {
        self.transport.into_inner()
    }
}
