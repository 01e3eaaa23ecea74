//! Zeroizing byte buffer for keys, composite keys and decrypted payloads
//!
//! Buffers are wiped on drop and, on unix, locked against swapping on a
//! best-effort basis. `Debug` never prints the contents.

use std::ops::{Deref, DerefMut};

use rand::RngCore;
use zeroize::Zeroize;

#[derive(Zeroize)]
#[zeroize(drop)]
pub struct SecureBytes(Vec<u8>);

impl SecureBytes {
    pub fn new(data: Vec<u8>) -> Self {
        let secure = Self(data);
        secure.lock_memory();
        secure
    }

    pub fn zeroed(len: usize) -> Self {
        Self::new(vec![0u8; len])
    }

    /// Fresh bytes from the OS generator, used for seeds, IVs and salts.
    pub fn random(len: usize) -> Self {
        let mut data = vec![0u8; len];
        rand::rngs::OsRng.fill_bytes(&mut data);
        Self::new(data)
    }

    /// Concatenates several secret parts without leaving an unprotected copy behind.
    pub fn concat(parts: &[&[u8]]) -> Self {
        let total = parts.iter().map(|p| p.len()).sum();
        let mut data = Vec::with_capacity(total);
        for part in parts {
            data.extend_from_slice(part);
        }
        Self::new(data)
    }

    #[cfg(unix)]
    fn lock_memory(&self) {
        if self.0.is_empty() {
            return;
        }
        unsafe {
            libc::mlock(self.0.as_ptr() as *const libc::c_void, self.0.len());
        }
    }

    #[cfg(not(unix))]
    fn lock_memory(&self) {}

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Returns the first 32 bytes as a key array. Shorter buffers are zero padded.
    pub fn as_key(&self) -> [u8; 32] {
        let mut key = [0u8; 32];
        let n = self.0.len().min(32);
        key[..n].copy_from_slice(&self.0[..n]);
        key
    }

    /// WARNING: the returned Vec is no longer wiped on drop.
    pub fn into_vec(mut self) -> Vec<u8> {
        std::mem::take(&mut self.0)
    }
}

impl Clone for SecureBytes {
    fn clone(&self) -> Self {
        Self::new(self.0.clone())
    }
}

impl PartialEq for SecureBytes {
    fn eq(&self, other: &Self) -> bool {
        if self.0.len() != other.0.len() {
            return false;
        }
        // Constant time over the common length.
        self.0
            .iter()
            .zip(other.0.iter())
            .fold(0u8, |acc, (a, b)| acc | (a ^ b))
            == 0
    }
}

impl Eq for SecureBytes {}

impl Deref for SecureBytes {
    type Target = [u8];

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl DerefMut for SecureBytes {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

impl From<Vec<u8>> for SecureBytes {
    fn from(data: Vec<u8>) -> Self {
        Self::new(data)
    }
}

impl From<&[u8]> for SecureBytes {
    fn from(data: &[u8]) -> Self {
        Self::new(data.to_vec())
    }
}

impl Default for SecureBytes {
    fn default() -> Self {
        Self(Vec::new())
    }
}

impl std::fmt::Debug for SecureBytes {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecureBytes")
            .field("len", &self.0.len())
            .field("data", &"[REDACTED]")
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_random_is_not_repeated() {
        let a = SecureBytes::random(32);
        let b = SecureBytes::random(32);
        assert_eq!(a.len(), 32);
        assert_ne!(a, b);
    }

    #[test]
    fn test_concat_and_key() {
        let joined = SecureBytes::concat(&[b"ab", b"cd"]);
        assert_eq!(&*joined, b"abcd");
        let key = joined.as_key();
        assert_eq!(&key[..4], b"abcd");
        assert!(key[4..].iter().all(|b| *b == 0));
    }

    #[test]
    fn test_debug_is_redacted() {
        let secret = SecureBytes::new(b"hunter2".to_vec());
        let printed = format!("{:?}", secret);
        assert!(!printed.contains("hunter2"));
        assert!(printed.contains("REDACTED"));
    }
}
