//! Файловое хранилище базы и настроек
//!
//! Записи атомарные: данные пишутся во временный файл рядом с целевым,
//! сбрасываются на диск и только затем переименовываются поверх оригинала.
//! Прерванное сохранение оставляет исходный файл нетронутым.

use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use rand::RngCore;
use tracing::{debug, warn};

use crate::error::{DatabaseError, Result};

const APP_DIR: &str = "keepass-core";

/// Upper bound for a database file read into memory.
pub const MAX_DATABASE_LEN: u64 = 1 << 31;

/// Upper bound for the settings file.
pub const MAX_SETTINGS_LEN: u64 = 1 << 20;

/// Получить директорию конфигурации пользователя
pub fn get_config_dir() -> Result<PathBuf> {
    dirs::config_dir()
        .map(|p| p.join(APP_DIR))
        .ok_or_else(|| DatabaseError::Other("Не удалось определить директорию конфигурации".into()))
}

fn ensure_parent_dir(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            fs::create_dir_all(parent)?;
        }
    }
    Ok(())
}

fn temp_path(path: &Path) -> Result<PathBuf> {
    let name = path
        .file_name()
        .ok_or_else(|| DatabaseError::Other(format!("Некорректный путь: {}", path.display())))?;
    let mut suffix = [0u8; 6];
    rand::rngs::OsRng.fill_bytes(&mut suffix);
    let mut temp = std::ffi::OsString::from(".");
    temp.push(name);
    temp.push(format!(".{}.tmp", hex::encode(suffix)));
    Ok(path.with_file_name(temp))
}

/// Прочитать файл целиком, отказываясь от пустых и слишком больших файлов
pub fn read_file(path: &Path, max_len: u64) -> Result<Vec<u8>> {
    let mut file = File::open(path)?;
    let len = file.metadata()?.len();
    if len == 0 {
        return Err(DatabaseError::MalformedStream(format!("Файл пуст: {}", path.display())));
    }
    if len > max_len {
        return Err(DatabaseError::Other(format!(
            "Файл слишком большой: {} ({} байт, допустимо {})",
            path.display(),
            len,
            max_len
        )));
    }

    let mut data = Vec::with_capacity(len as usize);
    file.read_to_end(&mut data)?;
    debug!(path = %path.display(), bytes = data.len(), "file read");
    Ok(data)
}

/// Атомарно записать `data` в `path` с правами 0o600 на Unix
pub fn write_atomic(path: &Path, data: &[u8]) -> Result<()> {
    ensure_parent_dir(path)?;
    let temp = temp_path(path)?;

    let written = (|| -> Result<()> {
        let mut file = File::create(&temp)?;

        // Set restrictive permissions on Unix
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&temp, fs::Permissions::from_mode(0o600))?;
        }

        file.write_all(data)?;
        file.sync_all()?;
        fs::rename(&temp, path)?;
        Ok(())
    })();

    if let Err(e) = written {
        if temp.exists() {
            if let Err(cleanup) = fs::remove_file(&temp) {
                warn!(path = %temp.display(), error = %cleanup, "temporary file left behind");
            }
        }
        return Err(e);
    }
    debug!(path = %path.display(), bytes = data.len(), "file replaced atomically");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_atomic_write_replaces_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("db.kdbx");
        write_atomic(&path, b"first").unwrap();
        write_atomic(&path, b"second").unwrap();
        assert_eq!(read_file(&path, 1024).unwrap(), b"second");

        let leftovers: Vec<_> = fs::read_dir(dir.path()).unwrap().collect();
        assert_eq!(leftovers.len(), 1);
    }

    #[cfg(unix)]
    #[test]
    fn test_written_file_is_private() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("db.kdbx");
        write_atomic(&path, b"data").unwrap();
        let mode = fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn test_size_checks() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("big");
        fs::write(&path, [0u8; 64]).unwrap();
        assert!(read_file(&path, 32).is_err());
        assert!(read_file(&path, 64).is_ok());

        let empty = dir.path().join("empty");
        fs::write(&empty, []).unwrap();
        assert!(matches!(read_file(&empty, 64), Err(DatabaseError::MalformedStream(_))));
        assert!(matches!(read_file(&dir.path().join("missing"), 64), Err(DatabaseError::Io(_))));
    }
}
