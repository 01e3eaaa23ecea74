//! Master credential and composite key
//!
//! The composite key is the SHA-256 over whichever factors are configured,
//! in the fixed order password, key file, hardware key. Each factor is
//! itself reduced to 32 bytes first:
//! - password: SHA-256 of its encoded bytes (UTF-8, or Latin-1 for KDB)
//! - key file: see [`key_file_key`]
//! - hardware key: SHA-256 of the challenge-response over the KDF seed

use std::fmt;
use std::sync::Arc;

use base64::Engine as _;
use quick_xml::events::Event;
use quick_xml::Reader;
use secrecy::{ExposeSecret, SecretString};
use sha2::{Digest, Sha256};

use super::SecureBytes;
use crate::error::{DatabaseError, Result};

/// Challenge-response device supplied by the host (for example a YubiKey
/// slot). The challenge is the KDF seed of the container being opened or
/// written.
pub trait HardwareKey: Send + Sync + fmt::Debug {
    fn challenge_response(&self, challenge: &[u8]) -> Result<Vec<u8>>;
}

#[derive(Default)]
pub struct MasterCredential {
    password: Option<SecretString>,
    key_file: Option<SecureBytes>,
    hardware_key: Option<Arc<dyn HardwareKey>>,
    allow_empty: bool,
}

impl MasterCredential {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn password(password: &str) -> Self {
        Self::new().with_password(password)
    }

    pub fn with_password(mut self, password: &str) -> Self {
        self.password = Some(SecretString::new(password.to_string()));
        self
    }

    /// Raw key file contents; decoded lazily because KDB ignores the XML forms.
    pub fn with_key_file(mut self, contents: Vec<u8>) -> Self {
        self.key_file = Some(SecureBytes::new(contents));
        self
    }

    pub fn with_hardware_key(mut self, key: Arc<dyn HardwareKey>) -> Self {
        self.hardware_key = Some(key);
        self
    }

    /// Opt in to a credential with no factors at all.
    pub fn allow_empty(mut self) -> Self {
        self.allow_empty = true;
        self
    }

    pub fn is_empty(&self) -> bool {
        self.password.is_none() && self.key_file.is_none() && self.hardware_key.is_none()
    }

    pub fn has_hardware_key(&self) -> bool {
        self.hardware_key.is_some()
    }

    fn check_not_empty(&self) -> Result<()> {
        if self.is_empty() && !self.allow_empty {
            return Err(DatabaseError::EmptyCredential);
        }
        Ok(())
    }

    /// Composite key of the current generation. `challenge` is the KDF seed.
    pub fn composite_key(&self, challenge: &[u8]) -> Result<SecureBytes> {
        self.check_not_empty()?;

        let mut hasher = Sha256::new();
        if let Some(password) = &self.password {
            hasher.update(Sha256::digest(password.expose_secret().as_bytes()));
        }
        if let Some(contents) = &self.key_file {
            hasher.update(&*key_file_key(contents, true)?);
        }
        if let Some(device) = &self.hardware_key {
            let response = SecureBytes::new(device.challenge_response(challenge)?);
            hasher.update(Sha256::digest(&*response));
        }
        Ok(SecureBytes::new(hasher.finalize().to_vec()))
    }

    /// Composite key of the legacy generation: a single factor is used as is,
    /// two factors are hashed together. Hardware keys are not supported.
    pub fn legacy_composite_key(&self) -> Result<SecureBytes> {
        if self.hardware_key.is_some() {
            return Err(DatabaseError::KeyFile(
                "аппаратный ключ не поддерживается форматом KDB".into(),
            ));
        }
        self.check_not_empty()?;

        let password = self
            .password
            .as_ref()
            .map(|p| SecureBytes::new(Sha256::digest(latin1_bytes(p.expose_secret())).to_vec()));
        let key_file = match &self.key_file {
            Some(contents) => Some(key_file_key(contents, false)?),
            None => None,
        };

        Ok(match (password, key_file) {
            (Some(p), Some(k)) => SecureBytes::new(Sha256::digest(&*SecureBytes::concat(&[&p, &k])).to_vec()),
            (Some(p), None) => p,
            (None, Some(k)) => k,
            (None, None) => SecureBytes::new(Sha256::digest(b"").to_vec()),
        })
    }
}

impl Clone for MasterCredential {
    fn clone(&self) -> Self {
        Self {
            password: self
                .password
                .as_ref()
                .map(|p| SecretString::new(p.expose_secret().clone())),
            key_file: self.key_file.clone(),
            hardware_key: self.hardware_key.clone(),
            allow_empty: self.allow_empty,
        }
    }
}

impl fmt::Debug for MasterCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MasterCredential")
            .field("password", &self.password.is_some())
            .field("key_file", &self.key_file.is_some())
            .field("hardware_key", &self.hardware_key.is_some())
            .finish()
    }
}

/// KDB passwords are Latin-1; characters outside it become `?`.
fn latin1_bytes(s: &str) -> Vec<u8> {
    s.chars()
        .map(|c| u8::try_from(u32::from(c)).unwrap_or(b'?'))
        .collect()
}

/// Reduces key file contents to 32 bytes.
///
/// Tried in order: XML key file (versions 1.0 and 2.0, only when `allow_xml`),
/// exactly 32 raw bytes, exactly 64 hex characters, otherwise SHA-256 of
/// the whole file.
pub fn key_file_key(contents: &[u8], allow_xml: bool) -> Result<SecureBytes> {
    if allow_xml {
        if let Some(key) = xml_key_file(contents)? {
            return Ok(key);
        }
    }
    match contents.len() {
        32 => return Ok(SecureBytes::from(contents)),
        64 => {
            if let Ok(decoded) = hex::decode(contents) {
                return Ok(SecureBytes::new(decoded));
            }
        }
        _ => {}
    }
    Ok(SecureBytes::new(Sha256::digest(contents).to_vec()))
}

/// `Ok(None)` means "not an XML key file", not an error.
fn xml_key_file(contents: &[u8]) -> Result<Option<SecureBytes>> {
    let mut reader = Reader::from_reader(contents);
    reader.trim_text(true);

    let mut path: Vec<String> = Vec::new();
    let mut version = String::from("1.0");
    let mut data: Option<String> = None;
    let mut hash: Option<String> = None;
    let mut buf = Vec::new();

    loop {
        let event = match reader.read_event_into(&mut buf) {
            Ok(event) => event,
            Err(_) => return Ok(None),
        };
        match event {
            Event::Start(e) => {
                let name = String::from_utf8_lossy(e.name().as_ref()).into_owned();
                if path.is_empty() && !name.eq_ignore_ascii_case("KeyFile") {
                    return Ok(None);
                }
                if name.eq_ignore_ascii_case("Data") {
                    hash = e
                        .try_get_attribute("Hash")
                        .ok()
                        .flatten()
                        .and_then(|a| a.unescape_value().ok())
                        .map(|v| v.into_owned());
                }
                path.push(name);
            }
            Event::End(_) => {
                path.pop();
            }
            Event::Text(t) => {
                let text: String = match t.unescape() {
                    Ok(text) => text.chars().filter(|c| !c.is_whitespace()).collect(),
                    Err(_) => return Ok(None),
                };
                match path.last().map(String::as_str) {
                    Some(n) if n.eq_ignore_ascii_case("Version") => version = text,
                    Some(n) if n.eq_ignore_ascii_case("Data") => data = Some(text),
                    _ => {}
                }
            }
            Event::Eof => break,
            _ => {}
        }
        buf.clear();
    }

    let Some(data) = data else {
        return Ok(None);
    };

    if version.starts_with("2.") {
        let key = hex::decode(&data)
            .map_err(|e| DatabaseError::KeyFile(format!("данные ключа не в hex: {}", e)))?;
        let expected = hash.ok_or_else(|| DatabaseError::KeyFile("нет контрольной суммы ключа".into()))?;
        let actual = hex::encode(&Sha256::digest(&key)[..4]);
        if !actual.eq_ignore_ascii_case(&expected) {
            return Err(DatabaseError::KeyFile("контрольная сумма ключа не совпадает".into()));
        }
        Ok(Some(SecureBytes::new(key)))
    } else if version.starts_with("1.") {
        let key = base64::engine::general_purpose::STANDARD
            .decode(data.as_bytes())
            .map_err(|e| DatabaseError::KeyFile(format!("данные ключа не в base64: {}", e)))?;
        Ok(Some(SecureBytes::new(key)))
    } else {
        Err(DatabaseError::KeyFile(format!("неподдерживаемая версия ключевого файла {}", version)))
    }
}

/// Serializes a fresh version 2.0 XML key file around `key`.
pub fn make_key_file(key: &[u8]) -> String {
    let data = hex::encode_upper(key);
    let checksum = hex::encode_upper(&Sha256::digest(key)[..4]);
    let grouped: Vec<String> = data
        .as_bytes()
        .chunks(8)
        .map(|c| String::from_utf8_lossy(c).into_owned())
        .collect();
    format!(
        "<?xml version=\"1.0\" encoding=\"utf-8\"?>\n<KeyFile>\n\t<Meta>\n\t\t<Version>2.0</Version>\n\t</Meta>\n\t<Key>\n\t\t<Data Hash=\"{}\">{}</Data>\n\t</Key>\n</KeyFile>\n",
        checksum,
        grouped.join(" ")
    )
}
