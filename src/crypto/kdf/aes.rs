//! AES-KDF: the composite key is encrypted `rounds` times with AES-256-ECB
//! keyed by the seed, then hashed with SHA-256.

use ::cipher::generic_array::GenericArray;
use ::cipher::{BlockEncrypt, BlockEncryptMut, InnerIvInit, KeyInit};
use aes::Aes256;
use sha2::{Digest, Sha256};
use uuid::Uuid;

use super::params::{KdfParameters, PARAM_ROUNDS, PARAM_SEED};
use crate::crypto::SecureBytes;
use crate::error::{DatabaseError, Result};

pub const AES_KDF_UUID: Uuid = Uuid::from_bytes([
    0xC9, 0xD9, 0xF3, 0x9A, 0x62, 0x8A, 0x44, 0x60, 0xBF, 0x74, 0x0D, 0x08, 0xC1, 0x8A, 0x4F, 0xEA,
]);

pub const DEFAULT_ROUNDS: u64 = 60_000;
pub const MIN_ROUNDS: u64 = 1;
pub const SEED_LEN: usize = 32;

pub fn parameters(rounds: u64) -> KdfParameters {
    let mut params = KdfParameters::new(AES_KDF_UUID);
    params.set_u64(PARAM_ROUNDS, rounds);
    params.set_bytes(PARAM_SEED, SecureBytes::random(SEED_LEN).to_vec());
    params
}

pub fn validate(params: &KdfParameters) -> Result<(u64, &[u8])> {
    let rounds = params
        .get_u64(PARAM_ROUNDS)
        .ok_or_else(|| DatabaseError::InvalidKdfParameter("AES-KDF: нет числа раундов".into()))?;
    if rounds < MIN_ROUNDS {
        return Err(DatabaseError::InvalidKdfParameter(format!(
            "AES-KDF: число раундов {} меньше {}",
            rounds, MIN_ROUNDS
        )));
    }
    let seed = params
        .get_bytes(PARAM_SEED)
        .ok_or_else(|| DatabaseError::InvalidKdfParameter("AES-KDF: нет зерна".into()))?;
    if seed.len() != SEED_LEN {
        return Err(DatabaseError::InvalidKdfParameter(format!(
            "AES-KDF: длина зерна {} вместо {}",
            seed.len(),
            SEED_LEN
        )));
    }
    Ok((rounds, seed))
}

fn check_input(seed: &[u8], key: &[u8]) -> Result<Aes256> {
    if key.len() != 32 {
        return Err(DatabaseError::InvalidKdfParameter(format!(
            "AES-KDF: длина ключа {} вместо 32",
            key.len()
        )));
    }
    Aes256::new_from_slice(seed).map_err(|_| {
        DatabaseError::InvalidKdfParameter(format!("AES-KDF: длина зерна {} вместо {}", seed.len(), SEED_LEN))
    })
}

/// Both 16-byte halves are encrypted together each round.
pub fn transform_key(seed: &[u8], key: &[u8], rounds: u64) -> Result<SecureBytes> {
    let aes = check_input(seed, key)?;

    let mut blocks = [
        GenericArray::clone_from_slice(&key[..16]),
        GenericArray::clone_from_slice(&key[16..]),
    ];
    for _ in 0..rounds {
        aes.encrypt_blocks(&mut blocks);
    }

    let mut transformed = SecureBytes::zeroed(32);
    transformed[..16].copy_from_slice(&blocks[0]);
    transformed[16..].copy_from_slice(&blocks[1]);

    Ok(SecureBytes::new(Sha256::digest(&*transformed).to_vec()))
}

/// Slow path: every half, every round, is a single-block CBC with a zero IV.
/// Kept to cross-check [`transform_key`].
pub fn transform_key_reference(seed: &[u8], key: &[u8], rounds: u64) -> Result<SecureBytes> {
    let aes = check_input(seed, key)?;
    let zero_iv = [0u8; 16];

    let mut state = SecureBytes::new(key.to_vec());
    for _ in 0..rounds {
        for half in state.chunks_exact_mut(16) {
            let mut enc = cbc::Encryptor::<Aes256>::inner_iv_slice_init(aes.clone(), &zero_iv)
                .map_err(|e| DatabaseError::Other(e.to_string()))?;
            enc.encrypt_block_mut(GenericArray::from_mut_slice(half));
        }
    }

    Ok(SecureBytes::new(Sha256::digest(&*state).to_vec()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fast_and_reference_paths_agree() {
        let seed = [0x11u8; 32];
        let key: Vec<u8> = (0u8..32).collect();
        for rounds in [0u64, 1, 6, 1000] {
            let fast = transform_key(&seed, &key, rounds).unwrap();
            let slow = transform_key_reference(&seed, &key, rounds).unwrap();
            assert_eq!(fast, slow, "rounds {}", rounds);
        }
    }

    // Seed and key blocks from FIPS-197 appendix C.3; one round yields its
    // published ciphertext in both halves.
    #[test]
    fn test_known_answer_vectors() {
        let seed: Vec<u8> = (0u8..32).collect();
        let key = hex::decode("00112233445566778899aabbccddeeff00112233445566778899aabbccddeeff").unwrap();
        let block = hex::decode("8ea2b7ca516745bfeafc49904b496089").unwrap();
        let one_round = [block.as_slice(), block.as_slice()].concat();

        let out = transform_key(&seed, &key, 1).unwrap();
        assert_eq!(&*out, Sha256::digest(&one_round).as_slice());
        assert_eq!(
            hex::encode(&*out),
            "a1e083ff3a9e921f0ec8f64a1ce1f46af316aedc7e6967f79e1c0127c936b57a"
        );
        assert_eq!(
            hex::encode(&*transform_key(&seed, &key, 1000).unwrap()),
            "a50041e308c7c3b1fcb3b43592f0bfc53c8bf40a1fc0a941cc2d027bd2a8cfc0"
        );
    }

    #[test]
    fn test_zero_rounds_is_plain_sha256() {
        let key = [0x42u8; 32];
        let out = transform_key(&[0u8; 32], &key, 0).unwrap();
        assert_eq!(&*out, Sha256::digest(key).as_slice());
    }

    #[test]
    fn test_rounds_change_output() {
        let seed = [1u8; 32];
        let key = [2u8; 32];
        assert_ne!(
            transform_key(&seed, &key, 6).unwrap(),
            transform_key(&seed, &key, 7).unwrap()
        );
    }

    #[test]
    fn test_validation() {
        let mut params = parameters(6);
        assert_eq!(validate(&params).unwrap().0, 6);

        params.set_u64(PARAM_ROUNDS, 0);
        assert!(matches!(validate(&params), Err(DatabaseError::InvalidKdfParameter(_))));

        let mut short_seed = parameters(6);
        short_seed.set_bytes(PARAM_SEED, vec![0u8; 16]);
        assert!(matches!(validate(&short_seed), Err(DatabaseError::InvalidKdfParameter(_))));
    }

    #[test]
    fn test_bad_seed_length_is_rejected() {
        assert!(transform_key(&[0u8; 16], &[0u8; 32], 1).is_err());
    }
}
