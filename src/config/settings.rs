//! Настройки движка по умолчанию
//!
//! Хранятся в JSON. Ядро их не читает: командная строка загружает файл и
//! передаёт значения явными параметрами.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::storage::{self, MAX_SETTINGS_LEN};
use crate::context::EngineContext;
use crate::crypto::kdf::{aes, argon, Argon2Variant};
use crate::crypto::{CipherEngine, CipherSuite, KdfParameters};
use crate::error::Result;
use crate::format::SaveOptions;
use crate::tree::{Compression, HistoryLimits};

const SETTINGS_FILE: &str = "settings.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CipherChoice {
    Aes,
    Twofish,
    Chacha20,
}

impl CipherChoice {
    pub fn suite(self) -> CipherSuite {
        match self {
            CipherChoice::Aes => CipherSuite::Aes256,
            CipherChoice::Twofish => CipherSuite::Twofish,
            CipherChoice::Chacha20 => CipherSuite::ChaCha20,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum KdfChoice {
    AesKdf,
    Argon2d,
    Argon2id,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSettings {
    pub cipher: CipherChoice,
    pub kdf: KdfChoice,
    pub aes_rounds: u64,
    pub argon_iterations: u64,
    /// Argon2 memory in bytes.
    pub argon_memory: u64,
    pub argon_parallelism: u32,
    pub compression: bool,
    pub history_max_items: i32,
    pub history_max_size: i64,
    /// Attachments larger than this go to the scratch cache when one is set.
    pub memory_limit: u64,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            cipher: CipherChoice::Aes,
            kdf: KdfChoice::Argon2d,
            aes_rounds: aes::DEFAULT_ROUNDS,
            argon_iterations: argon::DEFAULT_ITERATIONS,
            argon_memory: argon::DEFAULT_MEMORY,
            argon_parallelism: argon::DEFAULT_PARALLELISM,
            compression: true,
            history_max_items: HistoryLimits::default().max_items,
            history_max_size: HistoryLimits::default().max_size,
            memory_limit: 64 * 1024 * 1024,
        }
    }
}

impl EngineSettings {
    /// Путь к файлу настроек по умолчанию
    pub fn default_path() -> Result<PathBuf> {
        Ok(storage::get_config_dir()?.join(SETTINGS_FILE))
    }

    /// An explicit path must exist. Without one, the default file is used
    /// when present and built-in defaults otherwise.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = match path {
            Some(p) => p.to_path_buf(),
            None => {
                let default = Self::default_path()?;
                if !default.exists() {
                    debug!("no settings file, using defaults");
                    return Ok(Self::default());
                }
                default
            }
        };
        let data = storage::read_file(&path, MAX_SETTINGS_LEN)?;
        let settings = serde_json::from_slice(&data)?;
        debug!(path = %path.display(), "settings loaded");
        Ok(settings)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_vec_pretty(self)?;
        storage::write_atomic(path, &json)
    }

    pub fn kdf_parameters(&self) -> KdfParameters {
        match self.kdf {
            KdfChoice::AesKdf => aes::parameters(self.aes_rounds),
            KdfChoice::Argon2d => argon::parameters(
                Argon2Variant::D,
                self.argon_iterations,
                self.argon_memory,
                self.argon_parallelism,
            ),
            KdfChoice::Argon2id => argon::parameters(
                Argon2Variant::Id,
                self.argon_iterations,
                self.argon_memory,
                self.argon_parallelism,
            ),
        }
    }

    pub fn compression(&self) -> Compression {
        if self.compression {
            Compression::Gzip
        } else {
            Compression::None
        }
    }

    pub fn history_limits(&self) -> HistoryLimits {
        HistoryLimits {
            max_items: self.history_max_items,
            max_size: self.history_max_size,
        }
    }

    pub fn save_options(&self) -> SaveOptions {
        SaveOptions::new()
            .cipher(self.cipher.suite().uuid())
            .kdf(self.kdf_parameters())
            .compression(self.compression())
    }

    pub fn context(&self) -> EngineContext {
        EngineContext::new().with_memory_limit(self.memory_limit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::engine::TWOFISH_UUID;
    use crate::crypto::kdf::KdfAlgorithm;

    #[test]
    fn test_defaults() {
        let settings = EngineSettings::default();
        assert_eq!(settings.cipher, CipherChoice::Aes);
        assert_eq!(
            KdfAlgorithm::for_parameters(&settings.kdf_parameters()).unwrap(),
            KdfAlgorithm::Argon2d
        );
        assert_eq!(settings.compression(), Compression::Gzip);
        assert_eq!(settings.history_limits(), HistoryLimits::default());
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let settings: EngineSettings =
            serde_json::from_str(r#"{"cipher": "twofish", "kdf": "aes-kdf", "aes_rounds": 6}"#).unwrap();
        assert_eq!(settings.cipher.suite().uuid(), TWOFISH_UUID);
        assert_eq!(aes::validate(&settings.kdf_parameters()).unwrap().0, 6);
        assert!(settings.compression);
        assert_eq!(settings.memory_limit, 64 * 1024 * 1024);
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        let settings = EngineSettings {
            compression: false,
            history_max_items: 3,
            ..EngineSettings::default()
        };
        settings.save(&path).unwrap();
        assert_eq!(EngineSettings::load(Some(&path)).unwrap(), settings);
        assert!(EngineSettings::load(Some(&dir.path().join("missing.json"))).is_err());
    }
}
