//! The structured document inside the current-generation envelope
//!
//! Dates are ISO-8601 strings before version 4 and base64 of a little-endian
//! i64 (seconds since `0001-01-01`) from version 4 on. UUIDs are base64 of
//! their 16 bytes. Protected values are XORed with the inner random stream
//! in document order and then base64-encoded.

mod reader;
mod writer;

pub use reader::{read_document, ParsedDocument};
pub use writer::write_document;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use chrono::{NaiveDateTime, SecondsFormat, TimeZone, Utc};
use uuid::Uuid;

use super::codec::{from_dotnet_seconds, to_dotnet_seconds, uuid_from_slice};
use super::header::is_v4;
use crate::error::{DatabaseError, Result};
use crate::tree::Timestamp;

fn malformed(message: impl Into<String>) -> DatabaseError {
    DatabaseError::MalformedDocument(message.into())
}

pub(crate) fn format_date(t: &Timestamp, version: u32) -> String {
    if is_v4(version) {
        STANDARD.encode(to_dotnet_seconds(t).to_le_bytes())
    } else {
        t.to_rfc3339_opts(SecondsFormat::Secs, true)
    }
}

/// Accepts either encoding regardless of version; older writers mix them.
pub(crate) fn parse_date(text: &str) -> Result<Timestamp> {
    let text = text.trim();
    if text.contains('-') && text.contains(':') {
        if let Ok(t) = chrono::DateTime::parse_from_rfc3339(text) {
            return Ok(t.with_timezone(&Utc));
        }
        return NaiveDateTime::parse_from_str(text, "%Y-%m-%dT%H:%M:%S")
            .map(|t| Utc.from_utc_datetime(&t))
            .map_err(|e| malformed(format!("дата '{}': {}", text, e)));
    }
    let bytes = STANDARD
        .decode(text)
        .map_err(|e| malformed(format!("дата '{}': {}", text, e)))?;
    let raw: [u8; 8] = bytes
        .as_slice()
        .try_into()
        .map_err(|_| malformed(format!("дата '{}': ожидалось 8 байт", text)))?;
    from_dotnet_seconds(i64::from_le_bytes(raw))
}

pub(crate) fn format_uuid(id: &Uuid) -> String {
    STANDARD.encode(id.as_bytes())
}

pub(crate) fn parse_uuid(text: &str) -> Result<Uuid> {
    let bytes = STANDARD
        .decode(text.trim())
        .map_err(|e| malformed(format!("UUID '{}': {}", text, e)))?;
    uuid_from_slice(&bytes).map_err(|_| malformed(format!("UUID '{}'", text)))
}

/// The all-zero UUID stands for "none".
pub(crate) fn parse_optional_uuid(text: &str) -> Result<Option<Uuid>> {
    let id = parse_uuid(text)?;
    Ok(if id.is_nil() { None } else { Some(id) })
}

pub(crate) fn format_bool(value: bool) -> &'static str {
    if value {
        "True"
    } else {
        "False"
    }
}

pub(crate) fn parse_bool(text: &str) -> bool {
    let text = text.trim();
    text.eq_ignore_ascii_case("true") || text == "1"
}

pub(crate) fn format_tristate(value: Option<bool>) -> &'static str {
    match value {
        None => "null",
        Some(v) => format_bool(v),
    }
}

pub(crate) fn parse_tristate(text: &str) -> Option<bool> {
    let text = text.trim();
    if text.is_empty() || text.eq_ignore_ascii_case("null") {
        None
    } else {
        Some(parse_bool(text))
    }
}

pub(crate) fn parse_number<T: std::str::FromStr>(text: &str, what: &str) -> Result<T> {
    text.trim()
        .parse()
        .map_err(|_| malformed(format!("{}: '{}' не число", what, text)))
}

/// Tags are stored as one string separated by `;` or `,`.
pub(crate) fn split_tags(text: &str) -> Vec<String> {
    text.split([';', ','])
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .collect()
}

pub(crate) fn join_tags(tags: &[String]) -> String {
    tags.join(";")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::header::{VERSION_3_1, VERSION_4};

    #[test]
    fn test_date_encodings() {
        let t = Utc.with_ymd_and_hms(2024, 3, 15, 10, 30, 0).unwrap();
        let iso = format_date(&t, VERSION_3_1);
        assert_eq!(iso, "2024-03-15T10:30:00Z");
        assert_eq!(parse_date(&iso).unwrap(), t);

        let packed = format_date(&t, VERSION_4);
        assert!(!packed.contains('-'));
        assert_eq!(parse_date(&packed).unwrap(), t);
        assert!(parse_date("not a date").is_err());
    }

    #[test]
    fn test_packed_date_out_of_range() {
        for seconds in [i64::MIN, i64::MAX] {
            let text = STANDARD.encode(seconds.to_le_bytes());
            assert!(matches!(parse_date(&text), Err(DatabaseError::MalformedDocument(_))));
        }
    }

    #[test]
    fn test_uuid_and_flags() {
        let id = Uuid::from_bytes([7; 16]);
        assert_eq!(parse_uuid(&format_uuid(&id)).unwrap(), id);
        assert_eq!(parse_optional_uuid("AAAAAAAAAAAAAAAAAAAAAA==").unwrap(), None);
        assert!(parse_bool("True"));
        assert!(!parse_bool("False"));
        assert_eq!(parse_tristate("null"), None);
        assert_eq!(parse_tristate("false"), Some(false));
        assert_eq!(split_tags("a; b,c;;"), vec!["a", "b", "c"]);
    }
}
