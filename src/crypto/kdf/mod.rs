//! Key derivation: stretches the 32-byte composite key into the transformed key.

pub mod aes;
pub mod argon;
pub mod params;

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use uuid::Uuid;

pub use self::argon::Argon2Variant;
pub use self::params::KdfParameters;

use self::params::PARAM_SEED;
use crate::crypto::SecureBytes;
use crate::error::{DatabaseError, Result};
use crate::format::codec::uuid_hex;

pub trait KdfEngine: Send + Sync + fmt::Debug {
    fn uuid(&self) -> Uuid;

    fn name(&self) -> &'static str;

    /// Default tunables with a fresh seed or salt.
    fn default_parameters(&self) -> KdfParameters;

    fn validate(&self, params: &KdfParameters) -> Result<()>;

    fn transform(&self, composite_key: &[u8], params: &KdfParameters) -> Result<SecureBytes>;

    /// Regenerates the seed or salt, leaving the tunables alone.
    fn randomize(&self, params: &mut KdfParameters) {
        params.set_bytes(PARAM_SEED, SecureBytes::random(32).to_vec());
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KdfAlgorithm {
    AesKdf,
    Argon2d,
    Argon2id,
}

impl KdfAlgorithm {
    pub const ALL: [KdfAlgorithm; 3] = [KdfAlgorithm::AesKdf, KdfAlgorithm::Argon2d, KdfAlgorithm::Argon2id];

    pub fn from_uuid(uuid: &Uuid) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|k| k.uuid() == *uuid)
            .ok_or_else(|| DatabaseError::UnsupportedAlgorithm(uuid_hex(uuid)))
    }

    pub fn for_parameters(params: &KdfParameters) -> Result<Self> {
        Self::from_uuid(&params.uuid()?)
    }

    fn argon_variant(self) -> Option<Argon2Variant> {
        match self {
            KdfAlgorithm::AesKdf => None,
            KdfAlgorithm::Argon2d => Some(Argon2Variant::D),
            KdfAlgorithm::Argon2id => Some(Argon2Variant::Id),
        }
    }

    fn check_uuid(self, params: &KdfParameters) -> Result<()> {
        let uuid = params.uuid()?;
        if uuid != self.uuid() {
            return Err(DatabaseError::InvalidKdfParameter(format!(
                "параметры {} переданы в {}",
                uuid_hex(&uuid),
                self.name()
            )));
        }
        Ok(())
    }
}

impl KdfEngine for KdfAlgorithm {
    fn uuid(&self) -> Uuid {
        match self {
            KdfAlgorithm::AesKdf => aes::AES_KDF_UUID,
            KdfAlgorithm::Argon2d => argon::ARGON2D_UUID,
            KdfAlgorithm::Argon2id => argon::ARGON2ID_UUID,
        }
    }

    fn name(&self) -> &'static str {
        match self {
            KdfAlgorithm::AesKdf => "AES-KDF",
            KdfAlgorithm::Argon2d => "Argon2d",
            KdfAlgorithm::Argon2id => "Argon2id",
        }
    }

    fn default_parameters(&self) -> KdfParameters {
        match self.argon_variant() {
            None => aes::parameters(aes::DEFAULT_ROUNDS),
            Some(variant) => argon::parameters(
                variant,
                argon::DEFAULT_ITERATIONS,
                argon::DEFAULT_MEMORY,
                argon::DEFAULT_PARALLELISM,
            ),
        }
    }

    fn validate(&self, params: &KdfParameters) -> Result<()> {
        self.check_uuid(params)?;
        match self.argon_variant() {
            None => aes::validate(params).map(|_| ()),
            Some(variant) => argon::Argon2Settings::from_parameters(variant, params).map(|_| ()),
        }
    }

    fn transform(&self, composite_key: &[u8], params: &KdfParameters) -> Result<SecureBytes> {
        self.check_uuid(params)?;
        match self.argon_variant() {
            None => {
                let (rounds, seed) = aes::validate(params)?;
                aes::transform_key(seed, composite_key, rounds)
            }
            Some(variant) => {
                let settings = argon::Argon2Settings::from_parameters(variant, params)?;
                argon::derive_key(composite_key, &settings)
            }
        }
    }
}

/// UUID to KDF lookup, pre-populated with [`KdfAlgorithm::ALL`].
#[derive(Debug, Clone)]
pub struct KdfRegistry {
    engines: HashMap<Uuid, Arc<dyn KdfEngine>>,
}

impl KdfRegistry {
    pub fn new() -> Self {
        let mut registry = Self {
            engines: HashMap::new(),
        };
        for kdf in KdfAlgorithm::ALL {
            registry.register(Arc::new(kdf));
        }
        registry
    }

    pub fn register(&mut self, engine: Arc<dyn KdfEngine>) {
        self.engines.insert(engine.uuid(), engine);
    }

    pub fn get(&self, uuid: &Uuid) -> Result<Arc<dyn KdfEngine>> {
        self.engines
            .get(uuid)
            .cloned()
            .ok_or_else(|| DatabaseError::UnsupportedAlgorithm(uuid_hex(uuid)))
    }

    pub fn transform(&self, composite_key: &[u8], params: &KdfParameters) -> Result<SecureBytes> {
        self.get(&params.uuid()?)?.transform(composite_key, params)
    }
}

impl Default for KdfRegistry {
    fn default() -> Self {
        Self::new()
    }
}
