//! Outer and inner headers of the current generation
//!
//! Outer header:
//! [4 bytes: signature 1][4 bytes: signature 2][4 bytes: version (u32 LE)]
//! repeated: [1 byte: field id][2 or 4 bytes: length][value]
//!
//! The length is a u16 before version 4 and a u32 from version 4 on. The
//! field list ends with an `End` field.
//!
//! Inner header (version 4 only, first bytes of the decrypted payload):
//! repeated: [1 byte: field id][4 bytes: length (u32 LE)][value]

use tracing::{debug, warn};
use uuid::Uuid;

use super::codec::{u32_from_slice, u64_from_slice, uuid_from_slice, write_u16, write_u32, write_u8, ByteReader};
use super::variant::VariantDictionary;
use crate::crypto::kdf::aes::{self, AES_KDF_UUID};
use crate::crypto::kdf::params::{PARAM_ROUNDS, PARAM_SEED};
use crate::crypto::{InnerStreamKind, KdfParameters};
use crate::error::{DatabaseError, Result};
use crate::tree::Compression;

pub const SIGNATURE_1: u32 = 0x9AA2_D903;
pub const SIGNATURE_2: u32 = 0xB54B_FB67;
/// Written by 2.x pre-releases; same layout.
pub const SIGNATURE_2_PRE_RELEASE: u32 = 0xB54B_FB66;
/// Second signature word of the legacy generation.
pub const SIGNATURE_2_LEGACY: u32 = 0xB54B_FB65;

pub const VERSION_3_1: u32 = 0x0003_0001;
pub const VERSION_4: u32 = 0x0004_0000;
pub const VERSION_4_1: u32 = 0x0004_0001;
pub const VERSION_CRITICAL_MASK: u32 = 0xFFFF_0000;

const MIN_MAJOR_VERSION: u32 = 0x0003_0000;

pub const MASTER_SEED_LEN: usize = 32;
pub const STREAM_START_LEN: usize = 32;

/// Terminator payload of the version 3 header.
const END_OF_HEADER: &[u8] = b"\r\n\r\n";

mod field {
    pub const END: u8 = 0;
    pub const COMMENT: u8 = 1;
    pub const CIPHER_ID: u8 = 2;
    pub const COMPRESSION: u8 = 3;
    pub const MASTER_SEED: u8 = 4;
    pub const TRANSFORM_SEED: u8 = 5;
    pub const TRANSFORM_ROUNDS: u8 = 6;
    pub const ENCRYPTION_IV: u8 = 7;
    pub const INNER_STREAM_KEY: u8 = 8;
    pub const STREAM_START_BYTES: u8 = 9;
    pub const INNER_STREAM_ID: u8 = 10;
    pub const KDF_PARAMETERS: u8 = 11;
    pub const PUBLIC_CUSTOM_DATA: u8 = 12;
}

mod inner_field {
    pub const END: u8 = 0;
    pub const STREAM_ID: u8 = 1;
    pub const STREAM_KEY: u8 = 2;
    pub const BINARY: u8 = 3;
}

/// Flag bit of an inner-header binary: keep it memory-protected.
const BINARY_FLAG_PROTECTED: u8 = 0x01;

pub fn is_v4(version: u32) -> bool {
    (version & VERSION_CRITICAL_MASK) >= VERSION_4
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OuterHeader {
    pub version: u32,
    pub cipher: Uuid,
    pub compression: Compression,
    pub master_seed: Vec<u8>,
    pub encryption_iv: Vec<u8>,
    pub kdf: KdfParameters,
    pub public_custom_data: VariantDictionary,
    pub comment: Vec<u8>,
    // Version 3 only; version 4 moves these into the inner header.
    pub inner_stream: InnerStreamKind,
    pub inner_stream_key: Vec<u8>,
    pub stream_start_bytes: Vec<u8>,
}

impl OuterHeader {
    /// Parses the header at the start of `data`. Returns the header and the
    /// number of bytes it occupies, which the caller needs for hashing.
    pub fn read(data: &[u8]) -> Result<(Self, usize)> {
        let mut r = ByteReader::new(data);
        let sig1 = r.read_u32().map_err(|_| DatabaseError::SignatureMismatch)?;
        let sig2 = r.read_u32().map_err(|_| DatabaseError::SignatureMismatch)?;
        if sig1 != SIGNATURE_1 || (sig2 != SIGNATURE_2 && sig2 != SIGNATURE_2_PRE_RELEASE) {
            return Err(DatabaseError::SignatureMismatch);
        }
        let version = r.read_u32()?;
        let major = version & VERSION_CRITICAL_MASK;
        if major > (VERSION_4_1 & VERSION_CRITICAL_MASK) || major < MIN_MAJOR_VERSION {
            return Err(DatabaseError::UnsupportedVersion(version));
        }
        let v4 = is_v4(version);

        let mut cipher = None;
        let mut compression = Compression::None;
        let mut master_seed = None;
        let mut encryption_iv = None;
        let mut kdf = None;
        let mut transform_seed = None;
        let mut transform_rounds = None;
        let mut public_custom_data = VariantDictionary::new();
        let mut comment = Vec::new();
        let mut inner_stream = InnerStreamKind::None;
        let mut inner_stream_key = Vec::new();
        let mut stream_start_bytes = Vec::new();

        loop {
            let id = r.read_u8()?;
            let len = if v4 { r.read_u32()? as usize } else { r.read_u16()? as usize };
            let value = r.take(len)?;
            match id {
                field::END => break,
                field::COMMENT => comment = value.to_vec(),
                field::CIPHER_ID => cipher = Some(uuid_from_slice(value)?),
                field::COMPRESSION => compression = Compression::from_id(u32_from_slice(value)?)?,
                field::MASTER_SEED => {
                    if value.len() != MASTER_SEED_LEN {
                        return Err(DatabaseError::MalformedStream(format!(
                            "длина мастер-соли {}",
                            value.len()
                        )));
                    }
                    master_seed = Some(value.to_vec());
                }
                field::TRANSFORM_SEED if !v4 => transform_seed = Some(value.to_vec()),
                field::TRANSFORM_ROUNDS if !v4 => transform_rounds = Some(u64_from_slice(value)?),
                field::ENCRYPTION_IV => encryption_iv = Some(value.to_vec()),
                field::INNER_STREAM_KEY if !v4 => inner_stream_key = value.to_vec(),
                field::STREAM_START_BYTES if !v4 => stream_start_bytes = value.to_vec(),
                field::INNER_STREAM_ID if !v4 => inner_stream = InnerStreamKind::from_id(u32_from_slice(value)?)?,
                field::KDF_PARAMETERS if v4 => kdf = Some(KdfParameters::read(value)?),
                field::PUBLIC_CUSTOM_DATA if v4 => public_custom_data = VariantDictionary::read(value)?,
                other => warn!(field = other, len, "unknown header field skipped"),
            }
        }

        let kdf = match kdf {
            Some(kdf) => kdf,
            None if !v4 => {
                let seed = transform_seed
                    .ok_or_else(|| DatabaseError::MalformedStream("нет зерна преобразования".into()))?;
                let rounds = transform_rounds
                    .ok_or_else(|| DatabaseError::MalformedStream("нет числа раундов".into()))?;
                let mut params = KdfParameters::new(AES_KDF_UUID);
                params.set_u64(PARAM_ROUNDS, rounds);
                params.set_bytes(PARAM_SEED, seed);
                params
            }
            None => return Err(DatabaseError::MalformedStream("нет параметров KDF".into())),
        };

        let header = Self {
            version,
            cipher: cipher.ok_or_else(|| DatabaseError::MalformedStream("нет идентификатора шифра".into()))?,
            compression,
            master_seed: master_seed.ok_or_else(|| DatabaseError::MalformedStream("нет мастер-соли".into()))?,
            encryption_iv: encryption_iv.ok_or_else(|| DatabaseError::MalformedStream("нет вектора инициализации".into()))?,
            kdf,
            public_custom_data,
            comment,
            inner_stream,
            inner_stream_key,
            stream_start_bytes,
        };
        debug!(version = %format!("{:#010x}", version), bytes = r.position(), "outer header read");
        Ok((header, r.position()))
    }

    pub fn write(&self) -> Result<Vec<u8>> {
        let v4 = is_v4(self.version);
        let mut out = Vec::new();
        write_u32(&mut out, SIGNATURE_1)?;
        write_u32(&mut out, SIGNATURE_2)?;
        write_u32(&mut out, self.version)?;

        let mut put = |id: u8, value: &[u8]| -> Result<()> {
            write_u8(&mut out, id)?;
            if v4 {
                write_u32(&mut out, value.len() as u32)?;
            } else {
                let len = u16::try_from(value.len())
                    .map_err(|_| DatabaseError::MalformedStream(format!("поле заголовка {} слишком длинное", id)))?;
                write_u16(&mut out, len)?;
            }
            out.extend_from_slice(value);
            Ok(())
        };

        if !self.comment.is_empty() {
            put(field::COMMENT, &self.comment)?;
        }
        put(field::CIPHER_ID, self.cipher.as_bytes())?;
        put(field::COMPRESSION, &self.compression.id().to_le_bytes())?;
        put(field::MASTER_SEED, &self.master_seed)?;
        if v4 {
            put(field::ENCRYPTION_IV, &self.encryption_iv)?;
            put(field::KDF_PARAMETERS, &self.kdf.write()?)?;
            if !self.public_custom_data.is_empty() {
                put(field::PUBLIC_CUSTOM_DATA, &self.public_custom_data.write()?)?;
            }
        } else {
            let (rounds, seed) = aes::validate(&self.kdf)?;
            put(field::TRANSFORM_SEED, seed)?;
            put(field::TRANSFORM_ROUNDS, &rounds.to_le_bytes())?;
            put(field::ENCRYPTION_IV, &self.encryption_iv)?;
            put(field::INNER_STREAM_KEY, &self.inner_stream_key)?;
            put(field::STREAM_START_BYTES, &self.stream_start_bytes)?;
            put(field::INNER_STREAM_ID, &self.inner_stream.id().to_le_bytes())?;
        }
        put(field::END, END_OF_HEADER)?;
        Ok(out)
    }
}

/// A binary carried by the version 4 inner header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InnerBinary {
    pub protected: bool,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InnerHeader {
    pub inner_stream: InnerStreamKind,
    pub inner_stream_key: Vec<u8>,
    pub binaries: Vec<InnerBinary>,
}

impl InnerHeader {
    /// Parses the inner header; returns it and the offset of the document.
    pub fn read(data: &[u8]) -> Result<(Self, usize)> {
        let mut r = ByteReader::new(data);
        let mut inner_stream = None;
        let mut inner_stream_key = None;
        let mut binaries = Vec::new();

        loop {
            let id = r.read_u8()?;
            let len = r.read_u32()? as usize;
            let value = r.take(len)?;
            match id {
                inner_field::END => break,
                inner_field::STREAM_ID => inner_stream = Some(InnerStreamKind::from_id(u32_from_slice(value)?)?),
                inner_field::STREAM_KEY => inner_stream_key = Some(value.to_vec()),
                inner_field::BINARY => {
                    let (flags, payload) = value
                        .split_first()
                        .ok_or_else(|| DatabaseError::MalformedStream("пустое вложение во внутреннем заголовке".into()))?;
                    binaries.push(InnerBinary {
                        protected: flags & BINARY_FLAG_PROTECTED != 0,
                        data: payload.to_vec(),
                    });
                }
                other => warn!(field = other, len, "unknown inner header field skipped"),
            }
        }

        let header = Self {
            inner_stream: inner_stream
                .ok_or_else(|| DatabaseError::MalformedStream("нет идентификатора внутреннего потока".into()))?,
            inner_stream_key: inner_stream_key
                .ok_or_else(|| DatabaseError::MalformedStream("нет ключа внутреннего потока".into()))?,
            binaries,
        };
        Ok((header, r.position()))
    }

    pub fn write(&self) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        let mut put = |id: u8, parts: &[&[u8]]| -> Result<()> {
            let len: usize = parts.iter().map(|p| p.len()).sum();
            write_u8(&mut out, id)?;
            write_u32(&mut out, len as u32)?;
            for part in parts {
                out.extend_from_slice(part);
            }
            Ok(())
        };
        put(inner_field::STREAM_ID, &[&self.inner_stream.id().to_le_bytes()])?;
        put(inner_field::STREAM_KEY, &[&self.inner_stream_key])?;
        for binary in &self.binaries {
            let flags = if binary.protected { BINARY_FLAG_PROTECTED } else { 0 };
            put(inner_field::BINARY, &[&[flags], &binary.data])?;
        }
        put(inner_field::END, &[])?;
        Ok(out)
    }
}

/// Peeks at the two signature words without consuming anything.
pub fn read_signature(data: &[u8]) -> Result<(u32, u32)> {
    let mut r = ByteReader::new(data);
    let sig1 = r.read_u32().map_err(|_| DatabaseError::SignatureMismatch)?;
    let sig2 = r.read_u32().map_err(|_| DatabaseError::SignatureMismatch)?;
    Ok((sig1, sig2))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::engine::{AES256_UUID, CHACHA20_UUID};
    use crate::crypto::kdf::argon::{self, Argon2Variant};

    fn v3_header() -> OuterHeader {
        OuterHeader {
            version: VERSION_3_1,
            cipher: AES256_UUID,
            compression: Compression::Gzip,
            master_seed: vec![1; 32],
            encryption_iv: vec![2; 16],
            kdf: aes::parameters(6),
            public_custom_data: VariantDictionary::new(),
            comment: Vec::new(),
            inner_stream: InnerStreamKind::Salsa20,
            inner_stream_key: vec![3; 32],
            stream_start_bytes: vec![4; 32],
        }
    }

    #[test]
    fn test_v3_header_layout() {
        let header = v3_header();
        let bytes = header.write().unwrap();
        assert_eq!(&bytes[..4], &[0x03, 0xD9, 0xA2, 0x9A]);
        assert_eq!(&bytes[8..12], &[0x01, 0x00, 0x03, 0x00]);
        // First field: cipher id with a u16 length.
        assert_eq!(bytes[12], field::CIPHER_ID);
        assert_eq!(&bytes[13..15], &[16, 0]);

        let (parsed, len) = OuterHeader::read(&bytes).unwrap();
        assert_eq!(len, bytes.len());
        assert_eq!(parsed, header);
    }

    #[test]
    fn test_v4_header_uses_u32_lengths() {
        let mut header = v3_header();
        header.version = VERSION_4;
        header.cipher = CHACHA20_UUID;
        header.encryption_iv = vec![2; 12];
        header.kdf = argon::parameters(Argon2Variant::Id, 1, 64 * 1024, 2);
        header.inner_stream = InnerStreamKind::None;
        header.inner_stream_key = Vec::new();
        header.stream_start_bytes = Vec::new();

        let mut bytes = header.write().unwrap();
        assert_eq!(&bytes[13..17], &[16, 0, 0, 0]);
        bytes.extend_from_slice(b"body");
        let (parsed, len) = OuterHeader::read(&bytes).unwrap();
        assert_eq!(&bytes[len..], b"body");
        assert_eq!(parsed, header);
    }

    #[test]
    fn test_bad_signature_and_version() {
        let mut bytes = v3_header().write().unwrap();
        bytes[0] ^= 0xFF;
        assert!(matches!(OuterHeader::read(&bytes), Err(DatabaseError::SignatureMismatch)));

        let mut bytes = v3_header().write().unwrap();
        bytes[8..12].copy_from_slice(&0x0005_0000u32.to_le_bytes());
        assert!(matches!(OuterHeader::read(&bytes), Err(DatabaseError::UnsupportedVersion(0x0005_0000))));

        assert!(matches!(OuterHeader::read(&[0x03, 0xD9]), Err(DatabaseError::SignatureMismatch)));
    }

    #[test]
    fn test_truncated_header() {
        let bytes = v3_header().write().unwrap();
        let cut = &bytes[..bytes.len() - 3];
        assert!(matches!(OuterHeader::read(cut), Err(DatabaseError::MalformedStream(_))));
    }

    #[test]
    fn test_inner_header_roundtrip() {
        let inner = InnerHeader {
            inner_stream: InnerStreamKind::ChaCha20,
            inner_stream_key: vec![9; 64],
            binaries: vec![
                InnerBinary { protected: true, data: b"secret".to_vec() },
                InnerBinary { protected: false, data: Vec::new() },
            ],
        };
        let mut bytes = inner.write().unwrap();
        bytes.extend_from_slice(b"<?xml");
        let (parsed, offset) = InnerHeader::read(&bytes).unwrap();
        assert_eq!(parsed, inner);
        assert_eq!(&bytes[offset..], b"<?xml");
    }
}
