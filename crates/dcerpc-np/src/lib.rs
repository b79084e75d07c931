//! DCE RPC client over SMB named pipes
//!
//! This crate is the transport and security core that sits between
//! generated stub code and an already-open named pipe:
//!
//! - Connection-oriented PDU codec (BIND, BIND_ACK, AUTH3, REQUEST,
//!   RESPONSE, FAULT)
//! - Bind negotiation with an optional NTLMSSP handshake
//! - Reassembly of multi-fragment responses
//! - NTLMSSP v1 packet signing and sealing
//!
//! Opening the pipe, marshaling parameters and computing LM/NT responses
//! are left to the caller. The pipe is any `AsyncRead + AsyncWrite` stream.
//!
//! # Example
//!
//! ```no_run
//! use dcerpc_np::{bind, pipes, ChallengeResponse, ChannelConfig, CredentialsError, NtlmCredentials};
//! use tokio::net::TcpStream;
//!
//! struct Account;
//!
//! impl NtlmCredentials for Account {
//!     fn user_name(&self) -> &str {
//!         "alice"
//!     }
//!
//!     fn domain(&self) -> &str {
//!         "EXAMPLE"
//!     }
//!
//!     fn challenge_response(&self, challenge: &[u8; 8]) -> Result<ChallengeResponse, CredentialsError> {
//!         unimplemented!("compute LM/NT responses for {:?}", challenge)
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // stands in for a pipe opened through an SMB session
//!     let pipe = TcpStream::connect("127.0.0.1:4445").await?;
//!
//!     let config = ChannelConfig::for_pipe(&pipes::SAMR);
//!     let mut channel = bind(pipe, &config, Some(&Account)).await?;
//!
//!     let reply = channel.call(0x40, &[0u8; 8]).await?;
//!     println!("{} bytes back, sealed={}", reply.len(), channel.is_sealing());
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod error;

// Wire format
pub mod dcerpc;
pub mod security;
pub mod ntlmssp;

// Security engine
pub mod keystream;
pub mod sign_seal;

// Channel
pub mod dcerpc_bind;
pub mod dcerpc_client;
pub mod dcerpc_transport;
pub mod fragmentation;
pub mod pipes;

pub use config::{ChannelConfig, ChannelConfigBuilder, DEFAULT_MAX_FRAG};
pub use error::{BindError, CallError, IntegrityError, ProtocolError, Result};

pub use dcerpc::{
    Auth3Pdu, BindAckPdu, BindNakPdu, BindPdu, ContextElement, ContextResult,
    DataRepresentation, FaultPdu, FaultStatus, PacketFlags, PacketType, Pdu, PduHeader,
    PresentationResult, RequestPdu, ResponsePdu, SyntaxId, Uuid, DCE_RPC_VERSION,
    DCE_RPC_VERSION_MINOR,
};
pub use security::{calculate_auth_padding, AuthLevel, AuthType, AuthVerifier};

pub use ntlmssp::{
    AuthenticateMessage, ChallengeMessage, ChallengeResponse, CredentialsError, Flags,
    NegotiateMessage, NtlmCredentials,
};
pub use keystream::KeystreamState;
pub use sign_seal::{SecurityContext, SignatureBlock, SIGNATURE_SIZE};

pub use dcerpc_bind::{BindNegotiator, BindOutcome, BindState};
pub use dcerpc_client::{bind, call, BoundChannel};
pub use dcerpc_transport::{DceRpcTransport, DEFAULT_MAX_PDU_SIZE};
pub use fragmentation::{receive_response, send_request, CallParams, FragmentAssembler};
pub use pipes::WellKnownPipe;
