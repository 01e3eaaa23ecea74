//! HMAC block stream of the version 4 envelope
//!
//! [32 bytes: HMAC-SHA256][4 bytes: length (u32 LE)][data]
//!
//! Each block is authenticated with its own key,
//! `SHA-512(index u64 LE || hmac_key)`, over `index || length || data`.
//! A zero-length block ends the stream and is authenticated the same way.

use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256, Sha512};

use super::codec::{write_u32, ByteReader};
use crate::crypto::SecureBytes;
use crate::error::{DatabaseError, Result};

type HmacSha256 = Hmac<Sha256>;

/// Index reserved for authenticating the header itself.
pub const HEADER_BLOCK_INDEX: u64 = u64::MAX;

pub fn block_key(index: u64, hmac_key: &[u8]) -> SecureBytes {
    let mut hasher = Sha512::new();
    hasher.update(index.to_le_bytes());
    hasher.update(hmac_key);
    SecureBytes::new(hasher.finalize().to_vec())
}

/// HMAC over `index || length || data` with the per-block key.
pub fn block_mac(index: u64, hmac_key: &[u8], data: &[u8]) -> Result<[u8; 32]> {
    let key = block_key(index, hmac_key);
    let mut mac = HmacSha256::new_from_slice(&key).map_err(|e| DatabaseError::Other(e.to_string()))?;
    mac.update(&index.to_le_bytes());
    mac.update(&(data.len() as u32).to_le_bytes());
    mac.update(data);
    Ok(mac.finalize().into_bytes().into())
}

/// HMAC of the raw header bytes, stored right after their SHA-256.
pub fn header_mac(header: &[u8], hmac_key: &[u8]) -> Result<[u8; 32]> {
    let key = block_key(HEADER_BLOCK_INDEX, hmac_key);
    let mut mac = HmacSha256::new_from_slice(&key).map_err(|e| DatabaseError::Other(e.to_string()))?;
    mac.update(header);
    Ok(mac.finalize().into_bytes().into())
}

pub fn header_hash(header: &[u8]) -> [u8; 32] {
    Sha256::digest(header).into()
}

pub fn encode(payload: &[u8], hmac_key: &[u8], block_size: usize) -> Result<Vec<u8>> {
    if block_size == 0 {
        return Err(DatabaseError::Other("размер блока должен быть положительным".into()));
    }

    let mut out = Vec::with_capacity(payload.len() + (payload.len() / block_size + 2) * 36);
    let mut index: u64 = 0;
    for chunk in payload.chunks(block_size) {
        out.extend_from_slice(&block_mac(index, hmac_key, chunk)?);
        write_u32(&mut out, chunk.len() as u32)?;
        out.extend_from_slice(chunk);
        index += 1;
    }
    out.extend_from_slice(&block_mac(index, hmac_key, &[])?);
    write_u32(&mut out, 0)?;
    Ok(out)
}

pub fn decode(stream: &[u8], hmac_key: &[u8]) -> Result<Vec<u8>> {
    let mut reader = ByteReader::new(stream);
    let mut out = Vec::with_capacity(stream.len());
    let mut index: u64 = 0;

    loop {
        let stored: [u8; 32] = reader.read_array()?;
        let len = reader.read_u32()? as usize;
        let data = reader.take(len)?;

        let key = block_key(index, hmac_key);
        let mut mac = HmacSha256::new_from_slice(&key).map_err(|e| DatabaseError::Other(e.to_string()))?;
        mac.update(&index.to_le_bytes());
        mac.update(&(len as u32).to_le_bytes());
        mac.update(data);
        mac.verify_slice(&stored)
            .map_err(|_| DatabaseError::IntegrityCheckFailed(index))?;

        if len == 0 {
            break;
        }
        out.extend_from_slice(data);
        index += 1;
    }

    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: [u8; 64] = [0x5A; 64];

    #[test]
    fn test_roundtrip_sizes() {
        for len in [0usize, 1, 31, 32, 33, 1000] {
            let data: Vec<u8> = (0..len).map(|i| i as u8).collect();
            let encoded = encode(&data, &KEY, 32).unwrap();
            assert_eq!(decode(&encoded, &KEY).unwrap(), data);
        }
    }

    #[test]
    fn test_wrong_key_fails_first_block() {
        let encoded = encode(b"secret payload", &KEY, 8).unwrap();
        let err = decode(&encoded, &[0u8; 64]).unwrap_err();
        assert!(matches!(err, DatabaseError::IntegrityCheckFailed(0)));
    }

    #[test]
    fn test_tampered_data_names_the_block() {
        let mut encoded = encode(&[1u8; 40], &KEY, 16).unwrap();
        // Second block starts at 36 + 16.
        encoded[52 + 36 + 3] ^= 0xFF;
        assert!(matches!(decode(&encoded, &KEY), Err(DatabaseError::IntegrityCheckFailed(1))));
    }

    #[test]
    fn test_dropped_terminator_is_malformed() {
        let encoded = encode(&[1u8; 10], &KEY, 16).unwrap();
        let cut = &encoded[..encoded.len() - 36];
        assert!(matches!(decode(cut, &KEY), Err(DatabaseError::MalformedStream(_))));
    }

    #[test]
    fn test_header_mac_depends_on_key() {
        let a = header_mac(b"header", &KEY).unwrap();
        let b = header_mac(b"header", &[1u8; 64]).unwrap();
        assert_ne!(a, b);
    }
}
