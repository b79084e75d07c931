//! RC4-family keystream used for NTLMSSP sealing and signature encryption
//!
//! The state is a 256-byte permutation plus two indices. It is owned by a
//! single security context and advances on every byte it produces, in both
//! directions of the connection.

use std::fmt;

/// Explicit keystream state: permutation table and the two running indices
pub struct KeystreamState {
    table: [u8; 256],
    i: u8,
    j: u8,
}

impl KeystreamState {
    /// Run the key schedule over `key`. Both indices start at zero.
    pub fn new(key: &[u8]) -> Self {
        let mut table = [0u8; 256];
        for (slot, value) in table.iter_mut().zip(0u8..=255) {
            *slot = value;
        }

        if !key.is_empty() {
            let mut j: u8 = 0;
            for i in 0..256 {
                j = j.wrapping_add(table[i]).wrapping_add(key[i % key.len()]);
                table.swap(i, j as usize);
            }
        }

        Self { table, i: 0, j: 0 }
    }

    /// Produce the next keystream byte.
    pub fn next_byte(&mut self) -> u8 {
        self.i = self.i.wrapping_add(1);
        self.j = self.j.wrapping_add(self.table[self.i as usize]);
        self.table.swap(self.i as usize, self.j as usize);
        let t = self.table[self.i as usize].wrapping_add(self.table[self.j as usize]);
        self.table[t as usize]
    }

    /// XOR `buf` in place with the next `buf.len()` keystream bytes.
    pub fn apply(&mut self, buf: &mut [u8]) {
        for byte in buf.iter_mut() {
            *byte ^= self.next_byte();
        }
    }
}

impl fmt::Debug for KeystreamState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeystreamState").finish_non_exhaustive()
    }
}
