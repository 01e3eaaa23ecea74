//! Cipher engines for the container body
//!
//! Each engine is identified by the 16-byte UUID stored in the container
//! header and hands out a streaming transform:
//! - AES-256 and Twofish in CBC mode with PKCS#7 padding
//! - ChaCha20 (IETF, 12-byte nonce) as a keystream XOR
//!
//! The CBC transforms are written block by block so that the body can be
//! fed in arbitrary chunks; [`reference`] holds the one-shot RustCrypto
//! rendition the streaming path is checked against.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use ::cipher::generic_array::GenericArray;
use ::cipher::{BlockDecryptMut, BlockEncryptMut, InnerIvInit, KeyInit, KeyIvInit, StreamCipher};
use aes::Aes256;
use chacha20::ChaCha20;
use twofish::Twofish;
use uuid::Uuid;

use crate::error::{DatabaseError, Result};
use crate::format::codec::uuid_hex;

/// Every engine takes a 256-bit key.
pub const KEY_LEN: usize = 32;
pub const BLOCK_LEN: usize = 16;

pub const AES256_UUID: Uuid = Uuid::from_bytes([
    0x31, 0xC1, 0xF2, 0xE6, 0xBF, 0x71, 0x43, 0x50, 0xBE, 0x58, 0x05, 0x21, 0x6A, 0xFC, 0x5A, 0xFF,
]);
pub const TWOFISH_UUID: Uuid = Uuid::from_bytes([
    0xAD, 0x68, 0xF2, 0x9F, 0x57, 0x6F, 0x4B, 0xB9, 0xA3, 0x6A, 0xD4, 0x7A, 0xF9, 0x65, 0x34, 0x6C,
]);
pub const CHACHA20_UUID: Uuid = Uuid::from_bytes([
    0xD6, 0x03, 0x8A, 0x2B, 0x8B, 0x6F, 0x4C, 0xB5, 0xA5, 0x24, 0x33, 0x9A, 0x31, 0xDB, 0xB5, 0x9A,
]);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CipherMode {
    Encrypt,
    Decrypt,
}

/// A body cipher as published in the header.
pub trait CipherEngine: Send + Sync + fmt::Debug {
    fn uuid(&self) -> Uuid;

    fn name(&self) -> &'static str;

    fn key_len(&self) -> usize {
        KEY_LEN
    }

    fn iv_len(&self) -> usize;

    fn cipher(&self, mode: CipherMode, key: &[u8], iv: &[u8]) -> Result<Box<dyn CipherTransform>>;

    fn encrypt_all(&self, key: &[u8], iv: &[u8], data: &[u8]) -> Result<Vec<u8>> {
        let mut transform = self.cipher(CipherMode::Encrypt, key, iv)?;
        let mut out = transform.update(data)?;
        out.extend(transform.finish()?);
        Ok(out)
    }

    fn decrypt_all(&self, key: &[u8], iv: &[u8], data: &[u8]) -> Result<Vec<u8>> {
        let mut transform = self.cipher(CipherMode::Decrypt, key, iv)?;
        let mut out = transform.update(data)?;
        out.extend(transform.finish()?);
        Ok(out)
    }
}

/// Incremental encryption or decryption.
///
/// `update` may hold bytes back (a partial block, or the final block of a
/// CBC decryption); `finish` flushes them and applies or strips padding.
pub trait CipherTransform: Send {
    fn update(&mut self, input: &[u8]) -> Result<Vec<u8>>;

    fn finish(self: Box<Self>) -> Result<Vec<u8>>;
}

/// The closed set of suites this engine knows about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CipherSuite {
    Aes256,
    Twofish,
    ChaCha20,
}

impl CipherSuite {
    pub const ALL: [CipherSuite; 3] = [CipherSuite::Aes256, CipherSuite::Twofish, CipherSuite::ChaCha20];

    pub fn from_uuid(uuid: &Uuid) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|s| s.uuid() == *uuid)
            .ok_or_else(|| DatabaseError::UnsupportedCipher(uuid_hex(uuid)))
    }
}

impl CipherEngine for CipherSuite {
    fn uuid(&self) -> Uuid {
        match self {
            CipherSuite::Aes256 => AES256_UUID,
            CipherSuite::Twofish => TWOFISH_UUID,
            CipherSuite::ChaCha20 => CHACHA20_UUID,
        }
    }

    fn name(&self) -> &'static str {
        match self {
            CipherSuite::Aes256 => "AES-256",
            CipherSuite::Twofish => "Twofish",
            CipherSuite::ChaCha20 => "ChaCha20",
        }
    }

    fn iv_len(&self) -> usize {
        match self {
            CipherSuite::ChaCha20 => 12,
            _ => BLOCK_LEN,
        }
    }

    fn cipher(&self, mode: CipherMode, key: &[u8], iv: &[u8]) -> Result<Box<dyn CipherTransform>> {
        if key.len() != KEY_LEN {
            return Err(DatabaseError::Other(format!(
                "{}: длина ключа {} вместо {}",
                self.name(),
                key.len(),
                KEY_LEN
            )));
        }
        if iv.len() != self.iv_len() {
            return Err(DatabaseError::MalformedStream(format!(
                "{}: длина IV {} вместо {}",
                self.name(),
                iv.len(),
                self.iv_len()
            )));
        }

        match self {
            CipherSuite::ChaCha20 => {
                let inner = ChaCha20::new_from_slices(key, iv).map_err(invalid_length)?;
                Ok(Box::new(KeystreamTransform { inner }))
            }
            CipherSuite::Aes256 | CipherSuite::Twofish => {
                let block = BlockCore::new(*self, mode, key, iv)?;
                Ok(match mode {
                    CipherMode::Encrypt => Box::new(CbcEncryptTransform { block, pending: Vec::new() }),
                    CipherMode::Decrypt => Box::new(CbcDecryptTransform { block, pending: Vec::new() }),
                })
            }
        }
    }
}

fn invalid_length(e: ::cipher::InvalidLength) -> DatabaseError {
    DatabaseError::Other(format!("недопустимая длина ключа или IV: {}", e))
}

/// UUID to engine lookup, pre-populated with [`CipherSuite::ALL`].
#[derive(Debug, Clone)]
pub struct CipherRegistry {
    engines: HashMap<Uuid, Arc<dyn CipherEngine>>,
}

impl CipherRegistry {
    pub fn new() -> Self {
        let mut registry = Self {
            engines: HashMap::new(),
        };
        for suite in CipherSuite::ALL {
            registry.register(Arc::new(suite));
        }
        registry
    }

    /// Adds or replaces the engine for its UUID.
    pub fn register(&mut self, engine: Arc<dyn CipherEngine>) {
        self.engines.insert(engine.uuid(), engine);
    }

    pub fn get(&self, uuid: &Uuid) -> Result<Arc<dyn CipherEngine>> {
        self.engines
            .get(uuid)
            .cloned()
            .ok_or_else(|| DatabaseError::UnsupportedCipher(uuid_hex(uuid)))
    }
}

impl Default for CipherRegistry {
    fn default() -> Self {
        Self::new()
    }
}

enum BlockCore {
    AesEnc(cbc::Encryptor<Aes256>),
    AesDec(cbc::Decryptor<Aes256>),
    TwofishEnc(cbc::Encryptor<Twofish>),
    TwofishDec(cbc::Decryptor<Twofish>),
}

impl BlockCore {
    fn new(suite: CipherSuite, mode: CipherMode, key: &[u8], iv: &[u8]) -> Result<Self> {
        let core = match (suite, mode) {
            (CipherSuite::Aes256, CipherMode::Encrypt) => {
                let inner = Aes256::new_from_slice(key).map_err(invalid_length)?;
                BlockCore::AesEnc(cbc::Encryptor::inner_iv_slice_init(inner, iv).map_err(invalid_length)?)
            }
            (CipherSuite::Aes256, CipherMode::Decrypt) => {
                let inner = Aes256::new_from_slice(key).map_err(invalid_length)?;
                BlockCore::AesDec(cbc::Decryptor::inner_iv_slice_init(inner, iv).map_err(invalid_length)?)
            }
            (CipherSuite::Twofish, CipherMode::Encrypt) => {
                let inner = Twofish::new_from_slice(key).map_err(invalid_length)?;
                BlockCore::TwofishEnc(cbc::Encryptor::inner_iv_slice_init(inner, iv).map_err(invalid_length)?)
            }
            (CipherSuite::Twofish, CipherMode::Decrypt) => {
                let inner = Twofish::new_from_slice(key).map_err(invalid_length)?;
                BlockCore::TwofishDec(cbc::Decryptor::inner_iv_slice_init(inner, iv).map_err(invalid_length)?)
            }
            (CipherSuite::ChaCha20, _) => {
                return Err(DatabaseError::Other("ChaCha20 не является блочным шифром".into()))
            }
        };
        Ok(core)
    }

    /// Transforms whole 16-byte blocks in place.
    fn process(&mut self, data: &mut [u8]) {
        for chunk in data.chunks_exact_mut(BLOCK_LEN) {
            let block = GenericArray::from_mut_slice(chunk);
            match self {
                BlockCore::AesEnc(c) => c.encrypt_block_mut(block),
                BlockCore::AesDec(c) => c.decrypt_block_mut(block),
                BlockCore::TwofishEnc(c) => c.encrypt_block_mut(block),
                BlockCore::TwofishDec(c) => c.decrypt_block_mut(block),
            }
        }
    }
}

struct CbcEncryptTransform {
    block: BlockCore,
    pending: Vec<u8>,
}

impl CipherTransform for CbcEncryptTransform {
    fn update(&mut self, input: &[u8]) -> Result<Vec<u8>> {
        self.pending.extend_from_slice(input);
        let ready = self.pending.len() - self.pending.len() % BLOCK_LEN;
        let mut out: Vec<u8> = self.pending.drain(..ready).collect();
        self.block.process(&mut out);
        Ok(out)
    }

    fn finish(mut self: Box<Self>) -> Result<Vec<u8>> {
        let pad = BLOCK_LEN - self.pending.len() % BLOCK_LEN;
        let mut out = std::mem::take(&mut self.pending);
        out.resize(out.len() + pad, pad as u8);
        self.block.process(&mut out);
        Ok(out)
    }
}

struct CbcDecryptTransform {
    block: BlockCore,
    pending: Vec<u8>,
}

impl CipherTransform for CbcDecryptTransform {
    fn update(&mut self, input: &[u8]) -> Result<Vec<u8>> {
        self.pending.extend_from_slice(input);
        // The last full block stays behind until finish() so padding can be stripped.
        let total = self.pending.len();
        let keep = match total % BLOCK_LEN {
            0 => total.min(BLOCK_LEN),
            partial => partial,
        };
        let mut out: Vec<u8> = self.pending.drain(..total - keep).collect();
        self.block.process(&mut out);
        Ok(out)
    }

    fn finish(mut self: Box<Self>) -> Result<Vec<u8>> {
        if self.pending.len() != BLOCK_LEN {
            return Err(DatabaseError::MalformedStream(format!(
                "длина шифротекста не кратна {} байтам",
                BLOCK_LEN
            )));
        }
        let mut out = std::mem::take(&mut self.pending);
        self.block.process(&mut out);
        let pad = out[BLOCK_LEN - 1] as usize;
        if pad == 0 || pad > BLOCK_LEN || out[BLOCK_LEN - pad..].iter().any(|b| *b as usize != pad) {
            return Err(DatabaseError::MalformedStream("неверное дополнение PKCS#7".into()));
        }
        out.truncate(BLOCK_LEN - pad);
        Ok(out)
    }
}

struct KeystreamTransform {
    inner: ChaCha20,
}

impl CipherTransform for KeystreamTransform {
    fn update(&mut self, input: &[u8]) -> Result<Vec<u8>> {
        let mut out = input.to_vec();
        self.inner.apply_keystream(&mut out);
        Ok(out)
    }

    fn finish(self: Box<Self>) -> Result<Vec<u8>> {
        Ok(Vec::new())
    }
}

/// One-shot CBC built directly on the `cbc` crate's padded helpers.
pub mod reference {
    use ::cipher::block_padding::Pkcs7;
    use ::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
    use aes::Aes256;

    use crate::error::{DatabaseError, Result};

    pub fn aes_cbc_encrypt(key: &[u8], iv: &[u8], data: &[u8]) -> Result<Vec<u8>> {
        let enc = cbc::Encryptor::<Aes256>::new_from_slices(key, iv)
            .map_err(|e| DatabaseError::Other(e.to_string()))?;
        Ok(enc.encrypt_padded_vec_mut::<Pkcs7>(data))
    }

    pub fn aes_cbc_decrypt(key: &[u8], iv: &[u8], data: &[u8]) -> Result<Vec<u8>> {
        let dec = cbc::Decryptor::<Aes256>::new_from_slices(key, iv)
            .map_err(|e| DatabaseError::Other(e.to_string()))?;
        dec.decrypt_padded_vec_mut::<Pkcs7>(data)
            .map_err(|_| DatabaseError::MalformedStream("неверное дополнение PKCS#7".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: [u8; 32] = [7u8; 32];
    const IV: [u8; 16] = [9u8; 16];

    fn feed_in_chunks(engine: &dyn CipherEngine, mode: CipherMode, iv: &[u8], data: &[u8], chunk: usize) -> Result<Vec<u8>> {
        let mut t = engine.cipher(mode, &KEY, iv)?;
        let mut out = Vec::new();
        for piece in data.chunks(chunk.max(1)) {
            out.extend(t.update(piece)?);
        }
        out.extend(t.finish()?);
        Ok(out)
    }

    #[test]
    fn test_aes_streaming_matches_reference() {
        for len in [0usize, 1, 15, 16, 17, 100, 4096] {
            let plain: Vec<u8> = (0..len).map(|i| (i * 31 % 251) as u8).collect();
            let ours = feed_in_chunks(&CipherSuite::Aes256, CipherMode::Encrypt, &IV, &plain, 7).unwrap();
            let theirs = reference::aes_cbc_encrypt(&KEY, &IV, &plain).unwrap();
            assert_eq!(ours, theirs, "len {}", len);

            assert_eq!(reference::aes_cbc_decrypt(&KEY, &IV, &ours).unwrap(), plain);
            let back = feed_in_chunks(&CipherSuite::Aes256, CipherMode::Decrypt, &IV, &theirs, 5).unwrap();
            assert_eq!(back, plain);
        }
    }

    // NIST SP 800-38A F.2.5 (CBC-AES256) for the first two blocks; the final
    // block is the PKCS7 padding.
    #[test]
    fn test_aes_cbc_known_answer() {
        let key = hex::decode("603deb1015ca71be2b73aef0857d77811f352c073b6108d72d9810a30914dff4").unwrap();
        let iv: Vec<u8> = (0u8..16).collect();
        let plain = hex::decode("6bc1bee22e409f96e93d7e117393172aae2d8a571e03ac9c9eb76fac45af8e51").unwrap();
        let expected = "f58c4c04d6e5f1ba779eabfb5f7bfbd69cfc4e967edb808d679f777bc6702c7d\
                        3a3aa5e0213db1a9901f9036cf5102d2";

        let enc = CipherSuite::Aes256.encrypt_all(&key, &iv, &plain).unwrap();
        assert_eq!(hex::encode(&enc), expected);
        let streamed = {
            let mut t = CipherSuite::Aes256.cipher(CipherMode::Encrypt, &key, &iv).unwrap();
            let mut out = t.update(&plain[..5]).unwrap();
            out.extend(t.update(&plain[5..]).unwrap());
            out.extend(t.finish().unwrap());
            out
        };
        assert_eq!(streamed, enc);
        assert_eq!(CipherSuite::Aes256.decrypt_all(&key, &iv, &enc).unwrap(), plain);
    }

    // Twofish ECB_TBL 256-bit vector I=1: zero key, zero block. With a zero IV
    // the first CBC block is the plain block encryption.
    #[test]
    fn test_twofish_known_answer() {
        let enc = CipherSuite::Twofish.encrypt_all(&[0u8; 32], &[0u8; 16], &[0u8; 16]).unwrap();
        assert_eq!(enc.len(), 32);
        assert_eq!(hex::encode_upper(&enc[..16]), "57FF739D4DC92C1BD7FC01700CC8216F");
        assert_eq!(
            CipherSuite::Twofish.decrypt_all(&[0u8; 32], &[0u8; 16], &enc).unwrap(),
            vec![0u8; 16]
        );
    }

    #[test]
    fn test_chacha20_known_answer() {
        // RFC 8439 2.4.2 key, nonce and plaintext prefix, block counter 0.
        let key: Vec<u8> = (0u8..32).collect();
        let nonce = hex::decode("000000000000004a00000000").unwrap();
        let plain = b"Ladies and Gentlemen of the class of '99";
        let enc = CipherSuite::ChaCha20.encrypt_all(&key, &nonce, plain).unwrap();
        assert_eq!(
            hex::encode(&enc),
            "e3647a29ded31528ef56bac70f7a7ac3b735c7444da42d99823ef9938c8ebfdcf05bb71a822c6298"
        );
    }

    #[test]
    fn test_twofish_roundtrip() {
        let plain = b"twofish body with an uneven length!".to_vec();
        let enc = CipherSuite::Twofish.encrypt_all(&KEY, &IV, &plain).unwrap();
        assert_eq!(enc.len() % BLOCK_LEN, 0);
        assert_ne!(&enc[..plain.len().min(enc.len())], &plain[..]);
        assert_eq!(CipherSuite::Twofish.decrypt_all(&KEY, &IV, &enc).unwrap(), plain);
    }

    #[test]
    fn test_chacha20_is_symmetric_and_unpadded() {
        let nonce = [3u8; 12];
        let plain = b"keystream".to_vec();
        let enc = feed_in_chunks(&CipherSuite::ChaCha20, CipherMode::Encrypt, &nonce, &plain, 2).unwrap();
        assert_eq!(enc.len(), plain.len());
        let dec = CipherSuite::ChaCha20.decrypt_all(&KEY, &nonce, &enc).unwrap();
        assert_eq!(dec, plain);
    }

    #[test]
    fn test_wrong_key_breaks_padding_or_plaintext() {
        let plain = vec![0x41u8; 64];
        let enc = CipherSuite::Aes256.encrypt_all(&KEY, &IV, &plain).unwrap();
        match CipherSuite::Aes256.decrypt_all(&[8u8; 32], &IV, &enc) {
            Ok(dec) => assert_ne!(dec, plain),
            Err(e) => assert!(matches!(e, DatabaseError::MalformedStream(_))),
        }
    }

    #[test]
    fn test_truncated_ciphertext_is_rejected() {
        let enc = CipherSuite::Aes256.encrypt_all(&KEY, &IV, b"abc").unwrap();
        assert!(CipherSuite::Aes256.decrypt_all(&KEY, &IV, &enc[..10]).is_err());
        assert!(CipherSuite::Aes256.decrypt_all(&KEY, &IV, &[]).is_err());
    }

    #[test]
    fn test_registry_lookup() {
        let registry = CipherRegistry::new();
        assert_eq!(registry.get(&TWOFISH_UUID).unwrap().name(), "Twofish");
        assert_eq!(registry.get(&CHACHA20_UUID).unwrap().iv_len(), 12);
        let unknown = Uuid::from_bytes([1u8; 16]);
        assert!(matches!(registry.get(&unknown), Err(DatabaseError::UnsupportedCipher(_))));
        assert!(CipherSuite::from_uuid(&unknown).is_err());
    }

    #[test]
    fn test_iv_length_is_checked() {
        assert!(CipherSuite::Aes256.cipher(CipherMode::Encrypt, &KEY, &[0u8; 12]).is_err());
        assert!(CipherSuite::ChaCha20.cipher(CipherMode::Encrypt, &KEY, &[0u8; 16]).is_err());
    }
}
