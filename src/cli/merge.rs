//! Слияние двух баз

use std::path::PathBuf;

use anyhow::Context;
use colored::Colorize;

use crate::config::EngineSettings;

use super::{done, step, DatabaseArgs, Session};

pub fn run(
    target: &DatabaseArgs,
    source: PathBuf,
    source_key_file: Option<PathBuf>,
    settings: &EngineSettings,
) -> anyhow::Result<()> {
    println!("{}", "=== Слияние баз ===".cyan().bold());
    println!();

    println!("База, в которую вносятся изменения ({}):", target.path.display());
    let mut session = Session::open(target, settings, false)?;
    println!();

    let source = DatabaseArgs {
        path: source,
        key_file: source_key_file,
    };
    println!("Присоединяемая база ({}):", source.path.display());
    let incoming = Session::open(&source, settings, true)?;
    println!();

    step("Слияние");
    let summary = session
        .db
        .merge(&incoming.db, &session.ctx)
        .with_context(|| format!("Не удалось объединить с {}", source.path.display()))?;
    done();

    if summary.is_empty() {
        println!("{}", "Изменений нет".yellow());
        return Ok(());
    }
    println!("  Добавлено групп:    {}", summary.groups_added);
    println!("  Добавлено записей:  {}", summary.entries_added);
    println!("  Обновлено групп:    {}", summary.groups_updated);
    println!("  Обновлено записей:  {}", summary.entries_updated);
    println!("  Удалено узлов:      {}", summary.nodes_deleted);
    println!();

    session.save()?;
    println!("{}", "Базы объединены!".green().bold());
    Ok(())
}
