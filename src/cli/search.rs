//! Поиск записей

use colored::Colorize;

use crate::config::EngineSettings;
use crate::tree::{search, SearchParameters};

use super::{DatabaseArgs, Session};

pub struct SearchFlags {
    pub regex: bool,
    pub case_sensitive: bool,
    pub passwords: bool,
    pub max_results: usize,
}

pub fn run(args: &DatabaseArgs, query: &str, flags: &SearchFlags, settings: &EngineSettings) -> anyhow::Result<()> {
    let session = Session::open(args, settings, true)?;
    let db = &session.db;

    let params = SearchParameters {
        is_regex: flags.regex,
        case_sensitive: flags.case_sensitive,
        search_in_passwords: flags.passwords,
        max_results: flags.max_results,
        ..SearchParameters::new(query)
    };
    let result = search(db, &params)?;

    println!();
    println!("{} {}: {}", "Найдено".bold(), result.group.title, result.count_label());
    if result.is_empty() {
        return Ok(());
    }
    println!();
    println!("{:<30} {:<20} {:<30}", "НАЗВАНИЕ".bold(), "ПОЛЬЗОВАТЕЛЬ".bold(), "URL".bold());
    println!("{}", "─".repeat(80).dimmed());
    for entry in result.entries().iter().filter_map(|id| db.entry(id)) {
        println!("{:<30} {:<20} {:<30}", entry.title(), entry.username(), entry.url());
    }
    println!();
    Ok(())
}
