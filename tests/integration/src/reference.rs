//! Independent NTLMSSP v1 sign/seal, used by the scripted server

use rc4::{consts::U8, Key, KeyInit, Rc4, StreamCipher};

/// Server-side mirror of the client's security context
pub struct ReferenceSealer {
    cipher: Rc4<U8>,
    seal: bool,
    seq_num: u32,
}

impl ReferenceSealer {
    pub fn new(session_key: &[u8; 16], seal: bool) -> Self {
        let mut key = [0u8; 8];
        key[..5].copy_from_slice(&session_key[..5]);
        key[5..].copy_from_slice(&[0xe5, 0x38, 0xb0]);
        Self {
            cipher: Rc4::new(Key::<U8>::from_slice(&key)),
            seal,
            seq_num: 0,
        }
    }

    pub fn seq_num(&self) -> u32 {
        self.seq_num
    }

    /// Unseal `body` in place and check `signature` against it.
    pub fn verify(&mut self, body: &mut [u8], signature: &[u8]) -> Result<(), String> {
        if self.seal {
            self.cipher.apply_keystream(body);
        }
        let mut sig = [0u8; 16];
        sig.copy_from_slice(signature);
        self.cipher.apply_keystream(&mut sig[4..]);

        let word = |i: usize| u32::from_le_bytes([sig[i], sig[i + 1], sig[i + 2], sig[i + 3]]);
        let expected_seq = self.seq_num;
        self.seq_num += 1;

        if word(0) != 1 {
            return Err(format!("bad version {}", word(0)));
        }
        if word(4) != 0 {
            return Err(format!("bad reserved word {:08x}", word(4)));
        }
        if word(8) != crc32fast::hash(body) {
            return Err(format!("bad checksum {:08x}", word(8)));
        }
        if word(12) != expected_seq {
            return Err(format!("bad sequence {} (expected {})", word(12), expected_seq));
        }
        Ok(())
    }

    /// Checksum `body`, seal it if required and return the signature.
    pub fn sign(&mut self, body: &mut [u8]) -> [u8; 16] {
        let checksum = crc32fast::hash(body);
        if self.seal {
            self.cipher.apply_keystream(body);
        }
        let mut sig = [0u8; 16];
        sig[..4].copy_from_slice(&1u32.to_le_bytes());
        sig[8..12].copy_from_slice(&checksum.to_le_bytes());
        sig[12..].copy_from_slice(&self.seq_num.to_le_bytes());
        self.cipher.apply_keystream(&mut sig[4..]);
        self.seq_num += 1;
        sig
    }
}
