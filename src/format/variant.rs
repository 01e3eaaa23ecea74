//! Typed key/value dictionary used for KDF parameters and public custom data.
//!
//! [2 bytes: version 0x0100]
//! repeated: [1 byte: type][4 bytes: key length][key][4 bytes: value length][value]
//! [1 byte: 0x00]

use super::codec::{write_u16, write_u32, write_u8, ByteReader};
use crate::error::{DatabaseError, Result};

pub const VERSION: u16 = 0x0100;
const VERSION_CRITICAL_MASK: u16 = 0xFF00;

const TYPE_END: u8 = 0x00;
const TYPE_UINT32: u8 = 0x04;
const TYPE_UINT64: u8 = 0x05;
const TYPE_BOOL: u8 = 0x08;
const TYPE_INT32: u8 = 0x0C;
const TYPE_INT64: u8 = 0x0D;
const TYPE_STRING: u8 = 0x18;
const TYPE_BYTES: u8 = 0x42;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VariantValue {
    UInt32(u32),
    UInt64(u64),
    Bool(bool),
    Int32(i32),
    Int64(i64),
    String(String),
    Bytes(Vec<u8>),
}

impl VariantValue {
    fn type_id(&self) -> u8 {
        match self {
            VariantValue::UInt32(_) => TYPE_UINT32,
            VariantValue::UInt64(_) => TYPE_UINT64,
            VariantValue::Bool(_) => TYPE_BOOL,
            VariantValue::Int32(_) => TYPE_INT32,
            VariantValue::Int64(_) => TYPE_INT64,
            VariantValue::String(_) => TYPE_STRING,
            VariantValue::Bytes(_) => TYPE_BYTES,
        }
    }

    fn to_bytes(&self) -> Vec<u8> {
        match self {
            VariantValue::UInt32(v) => v.to_le_bytes().to_vec(),
            VariantValue::UInt64(v) => v.to_le_bytes().to_vec(),
            VariantValue::Bool(v) => vec![u8::from(*v)],
            VariantValue::Int32(v) => v.to_le_bytes().to_vec(),
            VariantValue::Int64(v) => v.to_le_bytes().to_vec(),
            VariantValue::String(v) => v.as_bytes().to_vec(),
            VariantValue::Bytes(v) => v.clone(),
        }
    }

    fn from_bytes(type_id: u8, data: &[u8]) -> Result<Self> {
        let mut r = ByteReader::new(data);
        let value = match type_id {
            TYPE_UINT32 => VariantValue::UInt32(r.read_u32()?),
            TYPE_UINT64 => VariantValue::UInt64(r.read_u64()?),
            TYPE_BOOL => VariantValue::Bool(r.read_u8()? != 0),
            TYPE_INT32 => VariantValue::Int32(r.read_i32()?),
            TYPE_INT64 => VariantValue::Int64(r.read_i64()?),
            TYPE_STRING => VariantValue::String(
                String::from_utf8(data.to_vec()).map_err(|e| DatabaseError::MalformedStream(e.to_string()))?,
            ),
            TYPE_BYTES => VariantValue::Bytes(data.to_vec()),
            other => {
                return Err(DatabaseError::MalformedStream(format!(
                    "неизвестный тип значения словаря {:#04x}",
                    other
                )))
            }
        };
        Ok(value)
    }
}

/// Insertion-ordered so that a re-serialized dictionary keeps its byte layout.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VariantDictionary {
    entries: Vec<(String, VariantValue)>,
}

impl VariantDictionary {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn get(&self, key: &str) -> Option<&VariantValue> {
        self.entries.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    pub fn set(&mut self, key: &str, value: VariantValue) {
        match self.entries.iter_mut().find(|(k, _)| k == key) {
            Some(slot) => slot.1 = value,
            None => self.entries.push((key.to_string(), value)),
        }
    }

    pub fn remove(&mut self, key: &str) -> Option<VariantValue> {
        let pos = self.entries.iter().position(|(k, _)| k == key)?;
        Some(self.entries.remove(pos).1)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &VariantValue)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn get_u32(&self, key: &str) -> Option<u32> {
        match self.get(key)? {
            VariantValue::UInt32(v) => Some(*v),
            _ => None,
        }
    }

    pub fn get_u64(&self, key: &str) -> Option<u64> {
        match self.get(key)? {
            VariantValue::UInt64(v) => Some(*v),
            _ => None,
        }
    }

    pub fn get_bytes(&self, key: &str) -> Option<&[u8]> {
        match self.get(key)? {
            VariantValue::Bytes(v) => Some(v),
            _ => None,
        }
    }

    pub fn read(data: &[u8]) -> Result<Self> {
        let mut r = ByteReader::new(data);
        let version = r.read_u16()?;
        if version & VERSION_CRITICAL_MASK > VERSION & VERSION_CRITICAL_MASK {
            return Err(DatabaseError::UnsupportedVersion(u32::from(version)));
        }

        let mut dict = Self::new();
        loop {
            let type_id = r.read_u8()?;
            if type_id == TYPE_END {
                break;
            }
            let key_len = r.read_u32()? as usize;
            let key = String::from_utf8(r.take(key_len)?.to_vec())
                .map_err(|e| DatabaseError::MalformedStream(e.to_string()))?;
            let value_len = r.read_u32()? as usize;
            let value = VariantValue::from_bytes(type_id, r.take(value_len)?)?;
            dict.set(&key, value);
        }
        Ok(dict)
    }

    pub fn write(&self) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        write_u16(&mut out, VERSION)?;
        for (key, value) in &self.entries {
            let bytes = value.to_bytes();
            write_u8(&mut out, value.type_id())?;
            write_u32(&mut out, key.len() as u32)?;
            out.extend_from_slice(key.as_bytes());
            write_u32(&mut out, bytes.len() as u32)?;
            out.extend_from_slice(&bytes);
        }
        write_u8(&mut out, TYPE_END)?;
        Ok(out)
    }
}
