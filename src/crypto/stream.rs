//! Inner random stream protecting individual values inside the document.
//!
//! Protected strings and binaries are XORed with one continuous keystream in
//! document order, so the reader and the writer must visit them in the same
//! sequence.

use ::cipher::{KeyIvInit, StreamCipher};
use chacha20::ChaCha20;
use salsa20::Salsa20;
use sha2::{Digest, Sha256, Sha512};

use crate::error::{DatabaseError, Result};

const SALSA20_IV: [u8; 8] = [0xE8, 0x30, 0x09, 0x4B, 0x97, 0x20, 0x5D, 0x2A];

/// Keystream bytes thrown away after the RC4 key schedule.
const ARCFOUR_DISCARD: usize = 512;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InnerStreamKind {
    None,
    ArcFour,
    Salsa20,
    ChaCha20,
}

impl InnerStreamKind {
    pub fn from_id(id: u32) -> Result<Self> {
        match id {
            0 => Ok(InnerStreamKind::None),
            1 => Ok(InnerStreamKind::ArcFour),
            2 => Ok(InnerStreamKind::Salsa20),
            3 => Ok(InnerStreamKind::ChaCha20),
            other => Err(DatabaseError::UnsupportedAlgorithm(format!("внутренний поток {}", other))),
        }
    }

    pub fn id(self) -> u32 {
        match self {
            InnerStreamKind::None => 0,
            InnerStreamKind::ArcFour => 1,
            InnerStreamKind::Salsa20 => 2,
            InnerStreamKind::ChaCha20 => 3,
        }
    }

    /// Length of a freshly generated stream key for this kind.
    pub fn key_len(self) -> usize {
        match self {
            InnerStreamKind::ChaCha20 => 64,
            _ => 32,
        }
    }
}

enum Keystream {
    None,
    ArcFour(ArcFour),
    Salsa20(Box<Salsa20>),
    ChaCha20(Box<ChaCha20>),
}

pub struct InnerStream {
    kind: InnerStreamKind,
    keystream: Keystream,
}

impl InnerStream {
    pub fn new(kind: InnerStreamKind, key: &[u8]) -> Result<Self> {
        let keystream = match kind {
            InnerStreamKind::None => Keystream::None,
            InnerStreamKind::ArcFour => {
                if key.is_empty() {
                    return Err(DatabaseError::MalformedStream("пустой ключ ArcFour".into()));
                }
                let mut rc4 = ArcFour::new(key);
                let mut discard = [0u8; ARCFOUR_DISCARD];
                rc4.apply(&mut discard);
                Keystream::ArcFour(rc4)
            }
            InnerStreamKind::Salsa20 => {
                let digest = Sha256::digest(key);
                let cipher = Salsa20::new_from_slices(&digest, &SALSA20_IV)
                    .map_err(|e| DatabaseError::Other(e.to_string()))?;
                Keystream::Salsa20(Box::new(cipher))
            }
            InnerStreamKind::ChaCha20 => {
                let digest = Sha512::digest(key);
                let cipher = ChaCha20::new_from_slices(&digest[..32], &digest[32..44])
                    .map_err(|e| DatabaseError::Other(e.to_string()))?;
                Keystream::ChaCha20(Box::new(cipher))
            }
        };
        Ok(Self { kind, keystream })
    }

    pub fn kind(&self) -> InnerStreamKind {
        self.kind
    }

    /// XORs the next `data.len()` keystream bytes into `data`.
    pub fn process(&mut self, data: &mut [u8]) {
        match &mut self.keystream {
            Keystream::None => {}
            Keystream::ArcFour(c) => c.apply(data),
            Keystream::Salsa20(c) => c.apply_keystream(data),
            Keystream::ChaCha20(c) => c.apply_keystream(data),
        }
    }
}

impl std::fmt::Debug for InnerStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InnerStream").field("kind", &self.kind).finish()
    }
}

/// RC4 with the key schedule as published; only used by old 2.x databases.
struct ArcFour {
    state: [u8; 256],
    i: u8,
    j: u8,
}

impl ArcFour {
    fn new(key: &[u8]) -> Self {
        let mut state = [0u8; 256];
        for (i, s) in state.iter_mut().enumerate() {
            *s = i as u8;
        }
        let mut j: u8 = 0;
        for i in 0..256 {
            j = j.wrapping_add(state[i]).wrapping_add(key[i % key.len()]);
            state.swap(i, j as usize);
        }
        Self { state, i: 0, j: 0 }
    }

    fn apply(&mut self, data: &mut [u8]) {
        for byte in data.iter_mut() {
            self.i = self.i.wrapping_add(1);
            self.j = self.j.wrapping_add(self.state[self.i as usize]);
            self.state.swap(self.i as usize, self.j as usize);
            let k = self.state[usize::from(self.state[self.i as usize].wrapping_add(self.state[self.j as usize]))];
            *byte ^= k;
        }
    }
}

impl Drop for ArcFour {
    fn drop(&mut self) {
        zeroize::Zeroize::zeroize(&mut self.state);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rc4_known_answer() {
        // "Key" / "Plaintext" test vector, without the discard.
        let mut rc4 = ArcFour::new(b"Key");
        let mut data = b"Plaintext".to_vec();
        rc4.apply(&mut data);
        assert_eq!(data, [0xBB, 0xF3, 0x16, 0xE8, 0xD9, 0x40, 0xAF, 0x0A, 0xD3]);
    }

    #[test]
    fn test_stream_is_continuous_across_values() {
        for kind in [InnerStreamKind::ArcFour, InnerStreamKind::Salsa20, InnerStreamKind::ChaCha20] {
            let key = vec![0x33u8; kind.key_len()];
            let mut whole = InnerStream::new(kind, &key).unwrap();
            let mut all = b"firstsecond".to_vec();
            whole.process(&mut all);

            let mut split = InnerStream::new(kind, &key).unwrap();
            let mut a = b"first".to_vec();
            let mut b = b"second".to_vec();
            split.process(&mut a);
            split.process(&mut b);
            a.extend(b);
            assert_eq!(all, a, "{:?}", kind);
        }
    }

    #[test]
    fn test_protect_then_unprotect() {
        let key = [7u8; 64];
        let mut writer = InnerStream::new(InnerStreamKind::ChaCha20, &key).unwrap();
        let mut reader = InnerStream::new(InnerStreamKind::ChaCha20, &key).unwrap();
        let mut value = b"pass".to_vec();
        writer.process(&mut value);
        assert_ne!(value, b"pass");
        reader.process(&mut value);
        assert_eq!(value, b"pass");
    }

    #[test]
    fn test_unknown_id() {
        assert!(InnerStreamKind::from_id(9).is_err());
        assert_eq!(InnerStreamKind::from_id(3).unwrap(), InnerStreamKind::ChaCha20);
    }
}
