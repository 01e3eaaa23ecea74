//! Создание новой базы

use std::path::Path;

use anyhow::Context;
use colored::Colorize;

use crate::config::{CipherChoice, EngineSettings};
use crate::crypto::kdf::aes;
use crate::crypto::CipherEngine;
use crate::format::{self, SaveOptions};
use crate::tree::Database;

use super::{confirm, credential, done, prompt_new_password, step};

pub fn run(path: &Path, key_file: Option<&Path>, name: &str, legacy: bool, settings: &EngineSettings) -> anyhow::Result<()> {
    println!("{}", "=== Создание базы ===".cyan().bold());
    println!();

    if path.exists() {
        println!("{} файл {} уже существует.", "Внимание:".yellow().bold(), path.display());
        if !confirm("Перезаписать?") {
            println!("Отменено.");
            return Ok(());
        }
        println!();
    }

    let password = prompt_new_password()?;
    let credential = credential(&password, key_file)?;
    println!();

    let mut db = if legacy {
        let mut db = Database::new_legacy();
        // KDB keeps entries only inside groups.
        let root = db.root_id();
        db.add_group(&root, db.new_group(name))?;
        db.crypto.kdf = aes::parameters(settings.aes_rounds);
        db
    } else {
        let mut db = Database::new(name);
        db.crypto.kdf = settings.kdf_parameters();
        db.crypto.compression = settings.compression();
        db.meta.history = settings.history_limits();
        db
    };

    let cipher = match (legacy, settings.cipher) {
        (true, CipherChoice::Chacha20) => {
            println!(
                "{} ChaCha20 недоступен в формате KDB, используется AES.",
                "Внимание:".yellow().bold()
            );
            CipherChoice::Aes
        }
        (_, choice) => choice,
    };
    db.crypto.cipher = cipher.suite().uuid();

    step("Вычисление ключа и сохранение");
    format::save_to_path(&db, path, &credential, &SaveOptions::default(), &settings.context())
        .with_context(|| format!("Не удалось создать {}", path.display()))?;
    done();

    println!();
    println!(
        "{} База '{}' создана ({}, {}).",
        "Успех:".green().bold(),
        name,
        if legacy { "KDB" } else { "KDBX" },
        cipher.suite().name()
    );
    Ok(())
}
