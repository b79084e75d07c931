//! Fixtures for the end-to-end tests
//!
//! The tests drive a real [`BoundChannel`](dcerpc_np::BoundChannel) against
//! a scripted server on the other end of an in-memory duplex pipe. When the
//! server has to check or produce signatures it uses [`ReferenceSealer`],
//! which is built on the `rc4` crate rather than on the client's own
//! keystream.
//!
//! Run with logging:
//! ```text
//! RUST_LOG=dcerpc_np=trace cargo test -p integration-tests
//! ```

pub mod reference;
pub mod server;

pub use reference::ReferenceSealer;
pub use server::{pipe_pair, PipeServer};

use dcerpc_np::{ChallengeResponse, CredentialsError, NtlmCredentials};
use std::sync::{Mutex, Once};
use tracing_subscriber::EnvFilter;

static INIT_LOGGING: Once = Once::new();

/// Install a `fmt` subscriber filtered by `RUST_LOG`, once per process.
pub fn init_logging() {
    INIT_LOGGING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// Session key handed out by [`TestCredentials`]
pub const SESSION_KEY: [u8; 16] = [
    0x8e, 0x3c, 0x1d, 0x42, 0x97, 0x0b, 0x55, 0xa1, 0x6f, 0x20, 0xd4, 0x13, 0xc8, 0x7a, 0x09,
    0xee,
];

/// Credentials with fixed responses that remember the challenge they saw
pub struct TestCredentials {
    seen_challenge: Mutex<Option<[u8; 8]>>,
}

impl TestCredentials {
    pub fn new() -> Self {
        Self {
            seen_challenge: Mutex::new(None),
        }
    }

    pub fn seen_challenge(&self) -> Option<[u8; 8]> {
        *self.seen_challenge.lock().unwrap()
    }
}

impl Default for TestCredentials {
    fn default() -> Self {
        Self::new()
    }
}

impl NtlmCredentials for TestCredentials {
    fn user_name(&self) -> &str {
        "testuser"
    }

    fn domain(&self) -> &str {
        "TESTDOM"
    }

    fn challenge_response(
        &self,
        server_challenge: &[u8; 8],
    ) -> Result<ChallengeResponse, CredentialsError> {
        *self.seen_challenge.lock().unwrap() = Some(*server_challenge);
        Ok(ChallengeResponse {
            lm_response: vec![0xaa; 24].into(),
            nt_response: vec![0xbb; 24].into(),
            session_key: SESSION_KEY,
        })
    }
}
