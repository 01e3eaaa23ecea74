//! Cryptographic building blocks of the container
//!
//! This module provides:
//! - Body ciphers (AES-256-CBC, Twofish-CBC, ChaCha20) behind [`CipherEngine`]
//! - Key derivation (AES-KDF, Argon2d/id) behind [`KdfEngine`]
//! - The inner random stream for protected values
//! - Master credential hashing and key file decoding
//! - Secure memory handling with automatic zeroing

pub mod credential;
pub mod engine;
pub mod kdf;
pub mod stream;
mod secure_bytes;

use sha2::{Digest, Sha256, Sha512};

pub use credential::{HardwareKey, MasterCredential};
pub use engine::{CipherEngine, CipherMode, CipherRegistry, CipherSuite, CipherTransform};
pub use kdf::{KdfAlgorithm, KdfEngine, KdfParameters, KdfRegistry};
pub use secure_bytes::SecureBytes;
pub use stream::{InnerStream, InnerStreamKind};

/// Final cipher key: `SHA-256(master_seed || transformed_key)`.
pub fn final_key(master_seed: &[u8], transformed_key: &[u8]) -> SecureBytes {
    let mut hasher = Sha256::new();
    hasher.update(master_seed);
    hasher.update(transformed_key);
    SecureBytes::new(hasher.finalize().to_vec())
}

/// HMAC base key of the version 4 envelope: `SHA-512(master_seed || transformed_key || 0x01)`.
pub fn hmac_base_key(master_seed: &[u8], transformed_key: &[u8]) -> SecureBytes {
    let mut hasher = Sha512::new();
    hasher.update(master_seed);
    hasher.update(transformed_key);
    hasher.update([0x01u8]);
    SecureBytes::new(hasher.finalize().to_vec())
}

pub fn sha256(data: &[u8]) -> [u8; 32] {
    Sha256::digest(data).into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_final_key_is_seed_then_key() {
        let seed = [1u8; 32];
        let transformed = [2u8; 32];
        let mut joined = seed.to_vec();
        joined.extend_from_slice(&transformed);
        assert_eq!(&*final_key(&seed, &transformed), &sha256(&joined));
    }

    #[test]
    fn test_hmac_base_key_is_64_bytes() {
        assert_eq!(hmac_base_key(&[0u8; 32], &[0u8; 32]).len(), 64);
    }
}
