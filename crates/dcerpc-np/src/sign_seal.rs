//! Per-PDU signing and sealing with the NTLMSSP v1 scheme
//!
//! One keystream serves both purposes and both directions. Sealing XORs the
//! stub in place; signing builds a 16-byte block and XORs its last 12
//! bytes. Every operation consumes keystream, so the order of operations
//! on each PDU is part of the wire format:
//!
//! ```text
//! send:    crc = CRC32(plain)  seal(body)  sig(seq++)  xor(sig[4..16])
//! receive: unseal(body)  xor(sig[4..16])  check crc and seq  seq++
//! ```

use crate::error::IntegrityError;
use crate::keystream::KeystreamState;
use crate::ntlmssp::Flags;
use bytes::{Buf, BufMut, BytesMut};
use std::fmt;
use tracing::trace;

/// Size of an encoded signature block
pub const SIGNATURE_SIZE: usize = 16;

/// Only version 1 signatures are produced or accepted
pub const SIGNATURE_VERSION: u32 = 1;

/// Appended to the first five bytes of the session key to form the
/// keystream key
pub const KEY_SUFFIX: [u8; 3] = [0xe5, 0x38, 0xb0];

/// A signature block as it appears on the wire, dynamic part encrypted
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct SignatureBlock([u8; SIGNATURE_SIZE]);

impl SignatureBlock {
    fn from_plain(checksum: u32, seq_num: u32) -> Self {
        let mut buf = BytesMut::with_capacity(SIGNATURE_SIZE);
        buf.put_u32_le(SIGNATURE_VERSION);
        buf.put_u32_le(0);
        buf.put_u32_le(checksum);
        buf.put_u32_le(seq_num);

        let mut block = [0u8; SIGNATURE_SIZE];
        block.copy_from_slice(&buf);
        Self(block)
    }

    pub fn as_bytes(&self) -> &[u8; SIGNATURE_SIZE] {
        &self.0
    }
}

impl fmt::Debug for SignatureBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SignatureBlock(")?;
        for byte in self.0 {
            write!(f, "{:02x}", byte)?;
        }
        write!(f, ")")
    }
}

/// Security state of one bound connection
///
/// Created once the AUTHENTICATE message is on its way and owned by the
/// channel for the rest of its life. Not `Clone`: a copy would let two
/// parties advance what must be a single keystream.
pub struct SecurityContext {
    flags: Flags,
    keystream: KeystreamState,
    seq_num: u32,
}

impl SecurityContext {
    pub fn new(flags: Flags, session_key: &[u8; 16]) -> Self {
        let mut key = [0u8; 8];
        key[..5].copy_from_slice(&session_key[..5]);
        key[5..].copy_from_slice(&KEY_SUFFIX);

        Self {
            flags,
            keystream: KeystreamState::new(&key),
            seq_num: 0,
        }
    }

    pub fn flags(&self) -> Flags {
        self.flags
    }

    /// Sealing implies signing.
    pub fn is_signing(&self) -> bool {
        self.flags
            .intersects(Flags::NEGOTIATE_SIGN | Flags::NEGOTIATE_SEAL)
    }

    pub fn is_sealing(&self) -> bool {
        self.flags.contains(Flags::NEGOTIATE_SEAL)
    }

    /// Sequence number the next signature will carry or be checked against
    pub fn seq_num(&self) -> u32 {
        self.seq_num
    }

    /// Sign a plaintext body without sealing it.
    pub fn sign(&mut self, body: &[u8]) -> SignatureBlock {
        let checksum = crc32fast::hash(body);
        self.finish_signature(checksum)
    }

    /// Encrypt `body` in place.
    pub fn seal(&mut self, body: &mut [u8]) {
        self.keystream.apply(body);
    }

    /// Checksum the plaintext, seal it, then sign.
    pub fn seal_and_sign(&mut self, body: &mut [u8]) -> SignatureBlock {
        let checksum = crc32fast::hash(body);
        self.seal(body);
        self.finish_signature(checksum)
    }

    /// Apply whatever protection the negotiated flags require to an
    /// outgoing body. `None` means the PDU goes out unauthenticated.
    pub fn protect(&mut self, body: &mut [u8]) -> Option<SignatureBlock> {
        if self.is_sealing() {
            Some(self.seal_and_sign(body))
        } else if self.is_signing() {
            Some(self.sign(body))
        } else {
            None
        }
    }

    /// Unseal `body` in place if sealing is negotiated and check it against
    /// `signature`.
    ///
    /// The keystream advances even when verification fails; the context is
    /// unusable afterwards.
    pub fn verify(&mut self, body: &mut [u8], signature: &[u8]) -> Result<(), IntegrityError> {
        if signature.len() != SIGNATURE_SIZE {
            return Err(IntegrityError::InvalidSignatureLength(signature.len()));
        }

        if self.is_sealing() {
            self.keystream.apply(body);
        }

        let mut block = [0u8; SIGNATURE_SIZE];
        block.copy_from_slice(signature);
        self.keystream.apply(&mut block[4..]);

        let mut cursor = &block[..];
        let version = cursor.get_u32_le();
        let reserved = cursor.get_u32_le();
        let checksum = cursor.get_u32_le();
        let seq_num = cursor.get_u32_le();

        let expected_seq = self.seq_num;
        self.seq_num = self.seq_num.wrapping_add(1);

        if version != SIGNATURE_VERSION {
            return Err(IntegrityError::InvalidSignatureVersion(version));
        }
        if reserved != 0 {
            return Err(IntegrityError::NonZeroReserved(reserved));
        }
        let computed = crc32fast::hash(body);
        if checksum != computed {
            return Err(IntegrityError::ChecksumMismatch {
                expected: computed,
                got: checksum,
            });
        }
        if seq_num != expected_seq {
            return Err(IntegrityError::SequenceMismatch {
                expected: expected_seq,
                got: seq_num,
            });
        }

        trace!("Verified signature: seq_num={}, len={}", seq_num, body.len());
        Ok(())
    }

    fn finish_signature(&mut self, checksum: u32) -> SignatureBlock {
        let mut block = SignatureBlock::from_plain(checksum, self.seq_num);
        trace!("Signing: seq_num={}, checksum=0x{:08x}", self.seq_num, checksum);
        self.seq_num = self.seq_num.wrapping_add(1);
        self.keystream.apply(&mut block.0[4..]);
        block
    }
}

impl fmt::Debug for SecurityContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecurityContext")
            .field("flags", &self.flags)
            .field("seq_num", &self.seq_num)
            .finish_non_exhaustive()
    }
}
