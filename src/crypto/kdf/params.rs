//! KDF parameter sets
//!
//! A parameter set is a [`VariantDictionary`] whose `$UUID` entry names the
//! algorithm. The remaining keys are algorithm specific.

use uuid::Uuid;

use crate::error::{DatabaseError, Result};
use crate::format::codec::uuid_from_slice;
use crate::format::variant::{VariantDictionary, VariantValue};

pub const PARAM_UUID: &str = "$UUID";

// AES-KDF
pub const PARAM_ROUNDS: &str = "R";
pub const PARAM_SEED: &str = "S";

// Argon2
pub const PARAM_SALT: &str = "S";
pub const PARAM_PARALLELISM: &str = "P";
pub const PARAM_MEMORY: &str = "M";
pub const PARAM_ITERATIONS: &str = "I";
pub const PARAM_VERSION: &str = "V";
pub const PARAM_SECRET_KEY: &str = "K";
pub const PARAM_ASSOC_DATA: &str = "A";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KdfParameters {
    dict: VariantDictionary,
}

impl KdfParameters {
    pub fn new(uuid: Uuid) -> Self {
        let mut dict = VariantDictionary::new();
        dict.set(PARAM_UUID, VariantValue::Bytes(uuid.as_bytes().to_vec()));
        Self { dict }
    }

    pub fn from_dictionary(dict: VariantDictionary) -> Result<Self> {
        let params = Self { dict };
        params.uuid()?;
        Ok(params)
    }

    pub fn read(data: &[u8]) -> Result<Self> {
        Self::from_dictionary(VariantDictionary::read(data)?)
    }

    pub fn write(&self) -> Result<Vec<u8>> {
        self.dict.write()
    }

    pub fn uuid(&self) -> Result<Uuid> {
        let bytes = self
            .dict
            .get_bytes(PARAM_UUID)
            .ok_or_else(|| DatabaseError::InvalidKdfParameter("отсутствует $UUID".into()))?;
        uuid_from_slice(bytes)
    }

    pub fn dictionary(&self) -> &VariantDictionary {
        &self.dict
    }

    pub fn get_u32(&self, key: &str) -> Option<u32> {
        self.dict.get_u32(key)
    }

    pub fn get_u64(&self, key: &str) -> Option<u64> {
        self.dict.get_u64(key)
    }

    pub fn get_bytes(&self, key: &str) -> Option<&[u8]> {
        self.dict.get_bytes(key)
    }

    pub fn set_u32(&mut self, key: &str, value: u32) {
        self.dict.set(key, VariantValue::UInt32(value));
    }

    pub fn set_u64(&mut self, key: &str, value: u64) {
        self.dict.set(key, VariantValue::UInt64(value));
    }

    pub fn set_bytes(&mut self, key: &str, value: Vec<u8>) {
        self.dict.set(key, VariantValue::Bytes(value));
    }

    /// The AES seed or Argon2 salt, also used as the hardware-key challenge.
    pub fn seed(&self) -> Option<&[u8]> {
        self.get_bytes(PARAM_SEED)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uuid_is_first_entry() {
        let id = Uuid::from_bytes([0xC9; 16]);
        let mut params = KdfParameters::new(id);
        params.set_u64(PARAM_ROUNDS, 6);
        let (first, _) = params.dictionary().iter().next().unwrap();
        assert_eq!(first, PARAM_UUID);
        let back = KdfParameters::read(&params.write().unwrap()).unwrap();
        assert_eq!(back.uuid().unwrap(), id);
        assert_eq!(back.get_u64(PARAM_ROUNDS), Some(6));
    }

    #[test]
    fn test_missing_uuid_is_rejected() {
        let dict = VariantDictionary::new();
        assert!(matches!(
            KdfParameters::from_dictionary(dict),
            Err(DatabaseError::InvalidKdfParameter(_))
        ));
    }
}
