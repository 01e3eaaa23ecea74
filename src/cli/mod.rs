//! Реализация CLI команд

pub mod change_pass;
pub mod entry;
pub mod info;
pub mod init;
pub mod list;
pub mod merge;
pub mod search;

use std::io::{self, Write};
use std::path::{Path, PathBuf};

use anyhow::Context;
use colored::Colorize;

use crate::config::{self, EngineSettings};
use crate::context::EngineContext;
use crate::crypto::MasterCredential;
use crate::format::{self, DuplicateIdPolicy, OpenOptions, SaveOptions};
use crate::tree::Database;

/// Минимальная длина пароля
pub const MIN_PASSWORD_LEN: usize = 8;

const MAX_KEY_FILE_LEN: u64 = 1 << 20;

/// Путь к базе и необязательный ключевой файл
#[derive(Debug, Clone, clap::Args)]
pub struct DatabaseArgs {
    /// Файл базы (.kdbx или .kdb)
    pub path: PathBuf,

    /// Ключевой файл
    #[arg(long, short = 'k')]
    pub key_file: Option<PathBuf>,
}

/// Запросить новый пароль с подтверждением
pub fn prompt_new_password() -> crate::error::Result<String> {
    println!("{}", "Создание мастер-пароля".cyan().bold());
    println!("Этот пароль шифрует базу. Выберите надёжный пароль.");
    println!("Минимальная длина: {} символов\n", MIN_PASSWORD_LEN);

    loop {
        let password = rpassword::prompt_password("Введите мастер-пароль: ")?;

        if password.chars().count() < MIN_PASSWORD_LEN {
            println!(
                "{} Пароль должен содержать минимум {} символов",
                "Ошибка:".red(),
                MIN_PASSWORD_LEN
            );
            continue;
        }

        let confirm = rpassword::prompt_password("Подтвердите мастер-пароль: ")?;

        if password != confirm {
            println!("{} Пароли не совпадают", "Ошибка:".red());
            continue;
        }

        return Ok(password);
    }
}

/// Запросить существующий пароль
pub fn prompt_password() -> crate::error::Result<String> {
    let password = rpassword::prompt_password("Введите мастер-пароль: ")?;
    Ok(password)
}

/// Запросить строку, пустой ввод даёт пустую строку
pub fn prompt_line(label: &str) -> crate::error::Result<String> {
    print!("{}: ", label);
    io::stdout().flush()?;
    let mut input = String::new();
    io::stdin().read_line(&mut input)?;
    Ok(input.trim().to_string())
}

/// Запросить подтверждение да/нет
pub fn confirm(prompt: &str) -> bool {
    print!("{} [y/N] ", prompt);
    io::stdout().flush().ok();

    let mut input = String::new();
    if io::stdin().read_line(&mut input).is_err() {
        return false;
    }

    matches!(input.trim().to_lowercase().as_str(), "y" | "yes" | "д" | "да")
}

/// Вывести шаг длительной операции; `готово` печатается после её завершения
pub fn step(label: &str) {
    print!("{}", format!("{}... ", label).cyan());
    io::stdout().flush().ok();
}

pub fn done() {
    println!("{}", "готово".green());
}

/// Пустой пароль допустим только вместе с ключевым файлом
pub fn credential(password: &str, key_file: Option<&Path>) -> anyhow::Result<MasterCredential> {
    let mut credential = if password.is_empty() {
        MasterCredential::new()
    } else {
        MasterCredential::password(password)
    };
    if let Some(path) = key_file {
        let contents = config::read_file(path, MAX_KEY_FILE_LEN)
            .with_context(|| format!("Не удалось прочитать ключевой файл {}", path.display()))?;
        credential = credential.with_key_file(contents);
    }
    Ok(credential)
}

/// Открытая база вместе со всем, что нужно для её сохранения
pub struct Session {
    pub path: PathBuf,
    pub db: Database,
    pub credential: MasterCredential,
    pub ctx: EngineContext,
}

impl Session {
    pub fn open(args: &DatabaseArgs, settings: &EngineSettings, read_only: bool) -> anyhow::Result<Self> {
        let password = prompt_password()?;
        let credential = credential(&password, args.key_file.as_deref())?;
        let ctx = settings.context();
        let options = OpenOptions::new()
            .read_only(read_only)
            .duplicate_ids(DuplicateIdPolicy::Fix);

        step("Вычисление ключа и расшифровка");
        let db = format::open_path(&args.path, &credential, &options, &ctx)
            .with_context(|| format!("Не удалось открыть {}", args.path.display()))?;
        done();

        Ok(Self {
            path: args.path.clone(),
            db,
            credential,
            ctx,
        })
    }

    /// Envelope settings are kept as read from the file.
    pub fn save(&self) -> anyhow::Result<()> {
        step("Шифрование и сохранение");
        format::save_to_path(&self.db, &self.path, &self.credential, &SaveOptions::default(), &self.ctx)
            .with_context(|| format!("Не удалось сохранить {}", self.path.display()))?;
        done();
        Ok(())
    }
}
