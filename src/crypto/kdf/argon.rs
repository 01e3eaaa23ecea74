//! Argon2d / Argon2id key derivation
//!
//! Memory is stored in the header in bytes and handed to Argon2 in KiB.
//! Every tunable is checked against its bounds before hashing; nothing is
//! clamped except a missing version, which falls back to 0x13.

use argon2::{Algorithm, Argon2, AssociatedData, Block, ParamsBuilder, Version};
use tracing::debug;
use uuid::Uuid;

use super::params::{
    KdfParameters, PARAM_ASSOC_DATA, PARAM_ITERATIONS, PARAM_MEMORY, PARAM_PARALLELISM, PARAM_SALT,
    PARAM_SECRET_KEY, PARAM_VERSION,
};
use crate::crypto::SecureBytes;
use crate::error::{DatabaseError, Result};

pub const ARGON2D_UUID: Uuid = Uuid::from_bytes([
    0xEF, 0x63, 0x6D, 0xDF, 0x8C, 0x29, 0x44, 0x4B, 0x91, 0xF7, 0xA9, 0xA4, 0x03, 0xE3, 0x0A, 0x0C,
]);
pub const ARGON2ID_UUID: Uuid = Uuid::from_bytes([
    0x9E, 0x29, 0x8B, 0x19, 0x56, 0xDB, 0x47, 0x73, 0xB2, 0x3D, 0xFC, 0x3E, 0xC6, 0xF0, 0xA1, 0xE6,
]);

/// Salt length in bytes (256 bits)
pub const SALT_LEN: usize = 32;

/// Derived key length in bytes
pub const KEY_LEN: usize = 32;

/// Shortest salt Argon2 accepts.
pub const MIN_SALT_LEN: usize = 8;

pub const MIN_VERSION: u32 = 0x10;
pub const MAX_VERSION: u32 = 0x13;

pub const DEFAULT_ITERATIONS: u64 = 3;
pub const MIN_ITERATIONS: u64 = 1;
pub const MAX_ITERATIONS: u64 = u32::MAX as u64;

/// Bytes, as stored in the `M` parameter.
pub const DEFAULT_MEMORY: u64 = 16 * 1024 * 1024;
pub const MIN_MEMORY: u64 = 8 * 1024;
pub const MAX_MEMORY: u64 = u32::MAX as u64;
pub const MEMORY_BLOCK_SIZE: u64 = 1024;

pub const DEFAULT_PARALLELISM: u32 = 4;
pub const MIN_PARALLELISM: u32 = 1;
pub const MAX_PARALLELISM: u32 = (1 << 24) - 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Argon2Variant {
    D,
    Id,
}

impl Argon2Variant {
    pub fn uuid(self) -> Uuid {
        match self {
            Argon2Variant::D => ARGON2D_UUID,
            Argon2Variant::Id => ARGON2ID_UUID,
        }
    }

    fn algorithm(self) -> Algorithm {
        match self {
            Argon2Variant::D => Algorithm::Argon2d,
            Argon2Variant::Id => Algorithm::Argon2id,
        }
    }
}

/// Validated Argon2 settings, ready to run.
#[derive(Debug, Clone)]
pub struct Argon2Settings {
    pub variant: Argon2Variant,
    pub salt: Vec<u8>,
    pub parallelism: u32,
    pub memory_kib: u32,
    pub iterations: u32,
    pub version: u32,
    pub secret: Option<SecureBytes>,
    pub associated_data: Option<Vec<u8>>,
}

pub fn parameters(variant: Argon2Variant, iterations: u64, memory_bytes: u64, parallelism: u32) -> KdfParameters {
    let mut params = KdfParameters::new(variant.uuid());
    params.set_u32(PARAM_PARALLELISM, parallelism);
    params.set_u64(PARAM_MEMORY, memory_bytes);
    params.set_u64(PARAM_ITERATIONS, iterations);
    params.set_u32(PARAM_VERSION, MAX_VERSION);
    params.set_bytes(PARAM_SALT, SecureBytes::random(SALT_LEN).to_vec());
    params
}

fn out_of_range(name: &str, value: u64, min: u64, max: u64) -> DatabaseError {
    DatabaseError::InvalidKdfParameter(format!(
        "Argon2: {} = {} вне диапазона [{}, {}]",
        name, value, min, max
    ))
}

impl Argon2Settings {
    pub fn from_parameters(variant: Argon2Variant, params: &KdfParameters) -> Result<Self> {
        let salt = params
            .get_bytes(PARAM_SALT)
            .ok_or_else(|| DatabaseError::InvalidKdfParameter("Argon2: нет соли".into()))?
            .to_vec();
        if salt.len() < MIN_SALT_LEN {
            return Err(DatabaseError::InvalidKdfParameter(format!(
                "Argon2: длина соли {} меньше {}",
                salt.len(),
                MIN_SALT_LEN
            )));
        }

        let parallelism = params.get_u32(PARAM_PARALLELISM).unwrap_or(DEFAULT_PARALLELISM);
        if !(MIN_PARALLELISM..=MAX_PARALLELISM).contains(&parallelism) {
            return Err(out_of_range(
                "parallelism",
                u64::from(parallelism),
                u64::from(MIN_PARALLELISM),
                u64::from(MAX_PARALLELISM),
            ));
        }

        let memory = params.get_u64(PARAM_MEMORY).unwrap_or(DEFAULT_MEMORY);
        if !(MIN_MEMORY..=MAX_MEMORY).contains(&memory) {
            return Err(out_of_range("memory", memory, MIN_MEMORY, MAX_MEMORY));
        }
        let memory_kib = (memory / MEMORY_BLOCK_SIZE) as u32;
        // Argon2 needs at least 8 blocks per lane.
        if u64::from(memory_kib) < 8 * u64::from(parallelism) {
            return Err(DatabaseError::InvalidKdfParameter(format!(
                "Argon2: {} КиБ недостаточно для {} потоков",
                memory_kib, parallelism
            )));
        }

        let iterations = params.get_u64(PARAM_ITERATIONS).unwrap_or(DEFAULT_ITERATIONS);
        if !(MIN_ITERATIONS..=MAX_ITERATIONS).contains(&iterations) {
            return Err(out_of_range("iterations", iterations, MIN_ITERATIONS, MAX_ITERATIONS));
        }

        let version = params.get_u32(PARAM_VERSION).unwrap_or(MAX_VERSION);
        if version != MIN_VERSION && version != MAX_VERSION {
            return Err(DatabaseError::InvalidKdfParameter(format!(
                "Argon2: неподдерживаемая версия {:#x}",
                version
            )));
        }

        Ok(Self {
            variant,
            salt,
            parallelism,
            memory_kib,
            iterations: iterations as u32,
            version,
            secret: params.get_bytes(PARAM_SECRET_KEY).map(SecureBytes::from),
            associated_data: params.get_bytes(PARAM_ASSOC_DATA).map(|a| a.to_vec()),
        })
    }
}

/// Runs Argon2 over the composite key.
///
/// The block matrix is reserved up front so that an allocation failure is
/// reported as [`DatabaseError::OutOfMemoryDuringKdf`] instead of aborting.
pub fn derive_key(password: &[u8], settings: &Argon2Settings) -> Result<SecureBytes> {
    let mut builder = ParamsBuilder::new();
    builder
        .m_cost(settings.memory_kib)
        .t_cost(settings.iterations)
        .p_cost(settings.parallelism)
        .output_len(KEY_LEN);
    if let Some(ad) = &settings.associated_data {
        let data = AssociatedData::new(ad)
            .map_err(|e| DatabaseError::InvalidKdfParameter(format!("Argon2: {}", e)))?;
        builder.data(data);
    }
    let params = builder
        .build()
        .map_err(|e| DatabaseError::InvalidKdfParameter(format!("Argon2: {}", e)))?;

    let version = if settings.version == MIN_VERSION {
        Version::V0x10
    } else {
        Version::V0x13
    };

    let block_count = params.block_count();
    let argon2 = match &settings.secret {
        Some(secret) => Argon2::new_with_secret(secret, settings.variant.algorithm(), version, params)
            .map_err(|e| DatabaseError::InvalidKdfParameter(format!("Argon2: {}", e)))?,
        None => Argon2::new(settings.variant.algorithm(), version, params),
    };

    let mut blocks: Vec<Block> = Vec::new();
    blocks
        .try_reserve_exact(block_count)
        .map_err(|_| DatabaseError::OutOfMemoryDuringKdf(u64::from(settings.memory_kib)))?;
    blocks.resize(block_count, Block::default());

    debug!(
        memory_kib = settings.memory_kib,
        iterations = settings.iterations,
        parallelism = settings.parallelism,
        "argon2 derivation"
    );

    let mut key_bytes = vec![0u8; KEY_LEN];
    argon2
        .hash_password_into_with_memory(password, &settings.salt, &mut key_bytes, &mut blocks)
        .map_err(|e| DatabaseError::InvalidKdfParameter(format!("Argon2: {}", e)))?;

    Ok(SecureBytes::new(key_bytes))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cheap(variant: Argon2Variant) -> KdfParameters {
        let mut params = parameters(variant, 1, 8 * 1024 * 2, 2);
        params.set_bytes(PARAM_SALT, vec![0x42u8; SALT_LEN]);
        params
    }

    #[test]
    fn test_derive_key_deterministic() {
        let settings = Argon2Settings::from_parameters(Argon2Variant::D, &cheap(Argon2Variant::D)).unwrap();
        let key1 = derive_key(b"test_password_123", &settings).unwrap();
        let key2 = derive_key(b"test_password_123", &settings).unwrap();
        assert_eq!(key1, key2);
        assert_eq!(key1.len(), KEY_LEN);
    }

    #[test]
    fn test_variants_and_versions_differ() {
        let d = Argon2Settings::from_parameters(Argon2Variant::D, &cheap(Argon2Variant::D)).unwrap();
        let id = Argon2Settings::from_parameters(Argon2Variant::Id, &cheap(Argon2Variant::Id)).unwrap();
        let mut old = d.clone();
        old.version = MIN_VERSION;

        let a = derive_key(b"pw", &d).unwrap();
        assert_ne!(a, derive_key(b"pw", &id).unwrap());
        assert_ne!(a, derive_key(b"pw", &old).unwrap());
    }

    #[test]
    fn test_derive_key_different_salts() {
        let mut p1 = cheap(Argon2Variant::Id);
        let mut p2 = cheap(Argon2Variant::Id);
        p1.set_bytes(PARAM_SALT, vec![0x42u8; SALT_LEN]);
        p2.set_bytes(PARAM_SALT, vec![0x43u8; SALT_LEN]);
        let s1 = Argon2Settings::from_parameters(Argon2Variant::Id, &p1).unwrap();
        let s2 = Argon2Settings::from_parameters(Argon2Variant::Id, &p2).unwrap();
        assert_ne!(derive_key(b"pw", &s1).unwrap(), derive_key(b"pw", &s2).unwrap());
    }

    #[test]
    fn test_missing_version_defaults_to_max() {
        let mut params = cheap(Argon2Variant::D);
        params.set_u32(PARAM_VERSION, 0);
        assert!(Argon2Settings::from_parameters(Argon2Variant::D, &params).is_err());

        let mut dict = params.dictionary().clone();
        dict.remove(PARAM_VERSION);
        let params = KdfParameters::from_dictionary(dict).unwrap();
        let settings = Argon2Settings::from_parameters(Argon2Variant::D, &params).unwrap();
        assert_eq!(settings.version, MAX_VERSION);
    }

    #[test]
    fn test_out_of_range_values_are_rejected() {
        let cases: [fn(&mut KdfParameters); 7] = [
            |p| p.set_u64(PARAM_MEMORY, 1024),
            |p| p.set_u64(PARAM_MEMORY, MAX_MEMORY + 1),
            |p| p.set_u64(PARAM_ITERATIONS, 0),
            |p| p.set_u64(PARAM_ITERATIONS, MAX_ITERATIONS + 1),
            |p| p.set_u32(PARAM_PARALLELISM, 0),
            |p| p.set_u32(PARAM_PARALLELISM, MAX_PARALLELISM + 1),
            |p| p.set_bytes(PARAM_SALT, vec![1, 2, 3]),
        ];
        for (i, mutate) in cases.iter().enumerate() {
            let mut params = cheap(Argon2Variant::D);
            mutate(&mut params);
            let err = Argon2Settings::from_parameters(Argon2Variant::D, &params).unwrap_err();
            assert!(matches!(err, DatabaseError::InvalidKdfParameter(_)), "case {}", i);
        }
    }

    #[test]
    fn test_secret_and_associated_data_are_mixed_in() {
        let plain = Argon2Settings::from_parameters(Argon2Variant::Id, &cheap(Argon2Variant::Id)).unwrap();
        let mut keyed = plain.clone();
        keyed.secret = Some(SecureBytes::new(b"pepper".to_vec()));
        let mut with_ad = plain.clone();
        with_ad.associated_data = Some(b"context".to_vec());

        let base = derive_key(b"pw", &plain).unwrap();
        assert_ne!(base, derive_key(b"pw", &keyed).unwrap());
        assert_ne!(base, derive_key(b"pw", &with_ad).unwrap());
    }
}
