//! Смена мастер-пароля

use anyhow::Context;
use colored::Colorize;

use crate::config::EngineSettings;
use crate::format::{self, SaveOptions};

use super::{credential, done, prompt_new_password, step, DatabaseArgs, Session};

pub fn run(args: &DatabaseArgs, settings: &EngineSettings) -> anyhow::Result<()> {
    println!("{}", "=== Смена мастер-пароля ===".cyan().bold());
    println!();

    // Получить текущий пароль
    println!("Введите текущий пароль:");
    let mut session = Session::open(args, settings, false)?;

    // Получить новый пароль
    println!();
    let new_password = prompt_new_password()?;
    let new_credential = credential(&new_password, args.key_file.as_deref())?;
    println!();

    if !session.db.is_legacy() {
        session.db.meta.master_key_changed = format::codec::now();
    }

    // Перешифровать базу новым ключом
    step("Перешифровка базы");
    format::save_to_path(&session.db, &session.path, &new_credential, &SaveOptions::default(), &session.ctx)
        .with_context(|| format!("Не удалось сохранить {}", session.path.display()))?;
    done();

    println!();
    println!("{}", "Пароль успешно изменён!".green().bold());
    Ok(())
}
