//! Little-endian primitives shared by both container generations.
//!
//! Everything here is exact to the byte: integers are little-endian, UUIDs
//! are 16 raw bytes, legacy dates are packed into 5 bytes and current
//! generation dates are seconds since `0001-01-01T00:00:00Z`.

use std::io::Write;

use byteorder::{ByteOrder, LittleEndian, WriteBytesExt};
use chrono::{DateTime, Datelike, NaiveDate, TimeZone, Timelike, Utc};
use uuid::Uuid;

use crate::error::{DatabaseError, Result};

/// Seconds between `0001-01-01` and the unix epoch.
pub const DOTNET_EPOCH_OFFSET: i64 = 62_135_596_800;

/// Bounds-checked cursor over a byte slice.
#[derive(Debug, Clone)]
pub struct ByteReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> ByteReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    /// Everything after the cursor, without advancing.
    pub fn rest(&self) -> &'a [u8] {
        &self.data[self.pos..]
    }

    pub fn take(&mut self, len: usize) -> Result<&'a [u8]> {
        if len > self.remaining() {
            return Err(DatabaseError::MalformedStream(format!(
                "ожидалось {} байт по смещению {}, доступно {}",
                len,
                self.pos,
                self.remaining()
            )));
        }
        let slice = &self.data[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }

    pub fn read_array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    pub fn read_u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    pub fn read_u16(&mut self) -> Result<u16> {
        Ok(LittleEndian::read_u16(self.take(2)?))
    }

    pub fn read_u32(&mut self) -> Result<u32> {
        Ok(LittleEndian::read_u32(self.take(4)?))
    }

    pub fn read_i32(&mut self) -> Result<i32> {
        Ok(LittleEndian::read_i32(self.take(4)?))
    }

    pub fn read_u64(&mut self) -> Result<u64> {
        Ok(LittleEndian::read_u64(self.take(8)?))
    }

    pub fn read_i64(&mut self) -> Result<i64> {
        Ok(LittleEndian::read_i64(self.take(8)?))
    }

    pub fn read_uuid(&mut self) -> Result<Uuid> {
        Ok(Uuid::from_bytes(self.read_array::<16>()?))
    }
}

pub fn write_u8<W: Write>(w: &mut W, v: u8) -> Result<()> {
    w.write_u8(v)?;
    Ok(())
}

pub fn write_u16<W: Write>(w: &mut W, v: u16) -> Result<()> {
    w.write_u16::<LittleEndian>(v)?;
    Ok(())
}

pub fn write_u32<W: Write>(w: &mut W, v: u32) -> Result<()> {
    w.write_u32::<LittleEndian>(v)?;
    Ok(())
}

pub fn write_i32<W: Write>(w: &mut W, v: i32) -> Result<()> {
    w.write_i32::<LittleEndian>(v)?;
    Ok(())
}

pub fn write_u64<W: Write>(w: &mut W, v: u64) -> Result<()> {
    w.write_u64::<LittleEndian>(v)?;
    Ok(())
}

pub fn write_i64<W: Write>(w: &mut W, v: i64) -> Result<()> {
    w.write_i64::<LittleEndian>(v)?;
    Ok(())
}

pub fn write_uuid<W: Write>(w: &mut W, id: &Uuid) -> Result<()> {
    w.write_all(id.as_bytes())?;
    Ok(())
}

/// Slice conversion for fixed-width header values.
pub fn u32_from_slice(bytes: &[u8]) -> Result<u32> {
    if bytes.len() != 4 {
        return Err(DatabaseError::MalformedStream(format!(
            "ожидалось 4 байта, получено {}",
            bytes.len()
        )));
    }
    Ok(LittleEndian::read_u32(bytes))
}

pub fn u64_from_slice(bytes: &[u8]) -> Result<u64> {
    if bytes.len() != 8 {
        return Err(DatabaseError::MalformedStream(format!(
            "ожидалось 8 байт, получено {}",
            bytes.len()
        )));
    }
    Ok(LittleEndian::read_u64(bytes))
}

pub fn uuid_from_slice(bytes: &[u8]) -> Result<Uuid> {
    Uuid::from_slice(bytes).map_err(|e| DatabaseError::MalformedStream(e.to_string()))
}

/// Hex without dashes, the form used in logs and error messages.
pub fn uuid_hex(id: &Uuid) -> String {
    id.simple().to_string().to_uppercase()
}

/// Null-terminated UTF-8 string. Anything past the first NUL is ignored.
pub fn read_cstring(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|b| *b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).into_owned()
}

/// Encodes a string with its terminating NUL.
pub fn cstring_bytes(s: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(s.len() + 1);
    out.extend_from_slice(s.as_bytes());
    out.push(0);
    out
}

/// The legacy "never expires" marker.
pub fn never_expires() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2999, 12, 28, 23, 59, 59)
        .single()
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// Current time truncated to whole seconds, the precision every format stores.
pub fn now() -> DateTime<Utc> {
    truncate_seconds(Utc::now())
}

pub fn truncate_seconds(t: DateTime<Utc>) -> DateTime<Utc> {
    Utc.timestamp_opt(t.timestamp(), 0).single().unwrap_or(t)
}

/// Packs a date into the legacy 5-byte layout (year:14 month:4 day:5 hour:5 minute:6 second:6).
pub fn pack_date(t: &DateTime<Utc>) -> [u8; 5] {
    let year = t.year() as u32;
    let month = t.month();
    let day = t.day();
    let hour = t.hour();
    let minute = t.minute();
    let second = t.second();
    [
        ((year >> 6) & 0x3F) as u8,
        (((year & 0x3F) << 2) | ((month >> 2) & 0x03)) as u8,
        (((month & 0x03) << 6) | ((day & 0x1F) << 1) | ((hour >> 4) & 0x01)) as u8,
        (((hour & 0x0F) << 4) | ((minute >> 2) & 0x0F)) as u8,
        (((minute & 0x03) << 6) | (second & 0x3F)) as u8,
    ]
}

pub fn unpack_date(b: &[u8; 5]) -> Result<DateTime<Utc>> {
    let [b1, b2, b3, b4, b5] = b.map(u32::from);
    let year = (b1 << 6) | (b2 >> 2);
    let month = ((b2 & 0x03) << 2) | (b3 >> 6);
    let day = (b3 >> 1) & 0x1F;
    let hour = ((b3 & 0x01) << 4) | (b4 >> 4);
    let minute = ((b4 & 0x0F) << 2) | (b5 >> 6);
    let second = b5 & 0x3F;

    NaiveDate::from_ymd_opt(year as i32, month, day)
        .and_then(|d| d.and_hms_opt(hour, minute, second))
        .map(|dt| Utc.from_utc_datetime(&dt))
        .ok_or_else(|| {
            DatabaseError::MalformedStream(format!(
                "недопустимая дата {:04}-{:02}-{:02} {:02}:{:02}:{:02}",
                year, month, day, hour, minute, second
            ))
        })
}

/// Seconds since `0001-01-01`, as stored by the version 4 document.
pub fn to_dotnet_seconds(t: &DateTime<Utc>) -> i64 {
    t.timestamp() + DOTNET_EPOCH_OFFSET
}

pub fn from_dotnet_seconds(seconds: i64) -> Result<DateTime<Utc>> {
    seconds
        .checked_sub(DOTNET_EPOCH_OFFSET)
        .and_then(|unix| Utc.timestamp_opt(unix, 0).single())
        .ok_or_else(|| DatabaseError::MalformedDocument(format!("недопустимая отметка времени {}", seconds)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_reader_little_endian() {
        let data = [0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08, 0xFF];
        let mut r = ByteReader::new(&data);
        assert_eq!(r.read_u16().unwrap(), 0x0201);
        assert_eq!(r.read_u32().unwrap(), 0x0605_0403);
        assert_eq!(r.remaining(), 3);
        assert!(r.read_u32().is_err());
        // A failed read does not move the cursor.
        assert_eq!(r.position(), 6);
    }

    #[test]
    fn test_writer_little_endian() {
        let mut buf = Vec::new();
        write_u32(&mut buf, 0x9AA2_D903).unwrap();
        write_u16(&mut buf, 0x0100).unwrap();
        assert_eq!(buf, vec![0x03, 0xD9, 0xA2, 0x9A, 0x00, 0x01]);
    }

    #[test]
    fn test_dotnet_seconds_out_of_range() {
        assert!(matches!(from_dotnet_seconds(i64::MIN), Err(DatabaseError::MalformedDocument(_))));
        assert!(from_dotnet_seconds(i64::MAX).is_err());
        let now = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        assert_eq!(from_dotnet_seconds(to_dotnet_seconds(&now)).unwrap(), now);
    }

    #[test]
    fn test_uuid_hex_has_no_dashes() {
        let id = Uuid::from_bytes([0x31, 0xC1, 0xF2, 0xE6, 0xBF, 0x71, 0x43, 0x50, 0xBE, 0x58, 0x05, 0x21, 0x6A, 0xFC, 0x5A, 0xFF]);
        assert_eq!(uuid_hex(&id), "31C1F2E6BF714350BE5805216AFC5AFF");
    }

    #[test]
    fn test_cstring() {
        assert_eq!(read_cstring(b"Root\0garbage"), "Root");
        assert_eq!(read_cstring(b"no-terminator"), "no-terminator");
        assert_eq!(cstring_bytes("ab"), vec![b'a', b'b', 0]);
    }

    #[test]
    fn test_never_expires_packs_exactly() {
        let packed = pack_date(&never_expires());
        assert_eq!(packed, [0x2E, 0xDF, 0x39, 0x7E, 0xFB]);
        assert_eq!(unpack_date(&packed).unwrap(), never_expires());
    }

    #[test]
    fn test_dotnet_epoch() {
        let epoch = Utc.timestamp_opt(0, 0).unwrap();
        assert_eq!(to_dotnet_seconds(&epoch), DOTNET_EPOCH_OFFSET);
        assert_eq!(from_dotnet_seconds(DOTNET_EPOCH_OFFSET).unwrap(), epoch);
    }

    #[test]
    fn test_unpack_rejects_month_zero() {
        assert!(unpack_date(&[0x1F, 0x40, 0x02, 0x00, 0x00]).is_err());
    }

    proptest! {
        #[test]
        fn packed_dates_survive(secs in 0i64..32_503_680_000i64) {
            let t = Utc.timestamp_opt(secs, 0).unwrap();
            prop_assert_eq!(unpack_date(&pack_date(&t)).unwrap(), t);
        }
    }
}
