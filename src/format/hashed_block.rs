//! Hashed block stream
//!
//! Block layout, repeated until a terminal block:
//! [4 bytes: index (u32 LE)][32 bytes: SHA-256 of data][4 bytes: length (u32 LE)][data]
//!
//! The terminal block has length 0 and an all-zero hash. Indices start at 0
//! and increase by one.

use sha2::{Digest, Sha256};
use tracing::debug;

use super::codec::{write_u32, ByteReader};
use crate::error::{DatabaseError, Result};

/// Default payload size of one block (1 MiB).
pub const DEFAULT_BLOCK_SIZE: usize = 1024 * 1024;

const HASH_LEN: usize = 32;

pub fn encode(payload: &[u8], block_size: usize) -> Result<Vec<u8>> {
    if block_size == 0 {
        return Err(DatabaseError::Other("размер блока должен быть положительным".into()));
    }

    let blocks = payload.len().div_ceil(block_size);
    let mut out = Vec::with_capacity(payload.len() + (blocks + 1) * (8 + HASH_LEN));

    let mut index: u32 = 0;
    for chunk in payload.chunks(block_size) {
        write_u32(&mut out, index)?;
        out.extend_from_slice(&Sha256::digest(chunk));
        write_u32(&mut out, chunk.len() as u32)?;
        out.extend_from_slice(chunk);
        index = index
            .checked_add(1)
            .ok_or_else(|| DatabaseError::MalformedStream("слишком много блоков".into()))?;
    }

    write_u32(&mut out, index)?;
    out.extend_from_slice(&[0u8; HASH_LEN]);
    write_u32(&mut out, 0)?;

    debug!(blocks = index, bytes = payload.len(), "hashed block stream encoded");
    Ok(out)
}

pub fn decode(stream: &[u8]) -> Result<Vec<u8>> {
    let mut reader = ByteReader::new(stream);
    let mut out = Vec::with_capacity(stream.len());
    let mut expected: u32 = 0;

    loop {
        let index = reader.read_u32()?;
        if index != expected {
            return Err(DatabaseError::MalformedStream(format!(
                "блок {} вместо ожидаемого {}",
                index, expected
            )));
        }

        let hash: [u8; HASH_LEN] = reader.read_array()?;
        let len = reader.read_u32()? as usize;

        if len == 0 {
            if hash.iter().any(|b| *b != 0) {
                return Err(DatabaseError::MalformedStream(
                    "ненулевой хеш завершающего блока".into(),
                ));
            }
            break;
        }

        let data = reader.take(len)?;
        if Sha256::digest(data).as_slice() != hash {
            return Err(DatabaseError::IntegrityCheckFailed(u64::from(index)));
        }
        out.extend_from_slice(data);
        expected = expected
            .checked_add(1)
            .ok_or_else(|| DatabaseError::MalformedStream("слишком много блоков".into()))?;
    }

    debug!(blocks = expected, bytes = out.len(), "hashed block stream decoded");
    Ok(out)
}
