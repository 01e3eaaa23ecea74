//! Сведения о базе

use colored::Colorize;

use crate::config::EngineSettings;
use crate::crypto::{CipherEngine, CipherSuite, KdfAlgorithm, KdfEngine};
use crate::format::codec::uuid_hex;
use crate::tree::{Compression, Database};

use super::{DatabaseArgs, Session};

fn format_version(db: &Database) -> String {
    let version = db.crypto.version;
    let generation = if db.is_legacy() { "KDB" } else { "KDBX" };
    format!("{} {}.{}", generation, version >> 16, version & 0xFFFF)
}

pub fn run(args: &DatabaseArgs, settings: &EngineSettings) -> anyhow::Result<()> {
    let session = Session::open(args, settings, true)?;
    let db = &session.db;

    let cipher = CipherSuite::from_uuid(&db.crypto.cipher)
        .map(|s| s.name().to_string())
        .unwrap_or_else(|_| uuid_hex(&db.crypto.cipher));
    let kdf = KdfAlgorithm::for_parameters(&db.crypto.kdf)
        .map(|k| k.name().to_string())
        .unwrap_or_else(|_| "неизвестен".to_string());
    let attachments: u64 = db.binaries.iter().map(|(_, b)| b.len()).sum();

    println!();
    println!("{}", "=== Сведения о базе ===".cyan().bold());
    println!();
    let rows = [
        ("Файл", session.path.display().to_string()),
        ("Формат", format_version(db)),
        ("Название", db.meta.name.clone()),
        ("Описание", db.meta.description.clone()),
        ("Шифр", cipher),
        ("KDF", kdf),
        (
            "Сжатие",
            match db.crypto.compression {
                Compression::Gzip => "gzip".to_string(),
                Compression::None => "нет".to_string(),
            },
        ),
        ("Групп", db.group_count().to_string()),
        ("Записей", db.entry_count().to_string()),
        ("Вложений", format!("{} ({} байт)", db.binaries.len(), attachments)),
    ];
    for (label, value) in rows {
        println!("{:<12} {}", format!("{}:", label).bold(), value);
    }
    println!();
    Ok(())
}
