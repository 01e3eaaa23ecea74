//! Команды управления записями

use anyhow::{anyhow, bail};
use colored::Colorize;

use crate::config::EngineSettings;
use crate::tree::{Database, Entry, NodeId, NodeRef};

use super::{confirm, prompt_line, DatabaseArgs, Session};

pub struct NewEntry {
    pub title: String,
    pub username: Option<String>,
    pub url: Option<String>,
    pub notes: Option<String>,
    pub group: Option<String>,
}

/// Target group by title, or the default place for new entries.
fn target_group(db: &Database, title: Option<&str>) -> anyhow::Result<NodeId> {
    match title {
        Some(title) => db
            .groups()
            .find(|g| g.title == title)
            .map(|g| g.id)
            .ok_or_else(|| anyhow!("Группа '{}' не найдена", title)),
        None if db.is_legacy() => db
            .child_groups(&db.root_id())
            .next()
            .map(|g| g.id)
            .ok_or_else(|| anyhow!("В базе KDB нет ни одной группы")),
        None => Ok(db.root_id()),
    }
}

/// Добавить запись
pub fn add(args: &DatabaseArgs, new: NewEntry, settings: &EngineSettings) -> anyhow::Result<()> {
    let mut session = Session::open(args, settings, false)?;
    let parent = target_group(&session.db, new.group.as_deref())?;

    let username = match new.username {
        Some(u) => u,
        None => prompt_line("Имя пользователя")?,
    };
    let password = rpassword::prompt_password("Пароль записи: ")?;

    let protection = session.db.meta.memory_protection.clone();
    let mut entry = Entry::new();
    entry.set(crate::tree::entry::TITLE, new.title.clone(), protection.title);
    entry.set(crate::tree::entry::USERNAME, username, protection.username);
    entry.set(crate::tree::entry::PASSWORD, password, protection.password);
    entry.set(crate::tree::entry::URL, new.url.unwrap_or_default(), protection.url);
    entry.set(crate::tree::entry::NOTES, new.notes.unwrap_or_default(), protection.notes);
    session.db.add_entry(&parent, entry)?;
    session.save()?;

    println!();
    println!("{} Запись '{}' добавлена.", "Успех:".green().bold(), new.title);
    Ok(())
}

/// Удалить запись по названию или UUID (в корзину, если она включена)
pub fn remove(args: &DatabaseArgs, name: &str, settings: &EngineSettings) -> anyhow::Result<()> {
    let mut session = Session::open(args, settings, false)?;

    let matches: Vec<NodeId> = session
        .db
        .entries()
        .filter(|e| e.title() == name || e.id.to_string().eq_ignore_ascii_case(name))
        .map(|e| e.id)
        .collect();
    let id = match matches.as_slice() {
        [] => bail!("Запись '{}' не найдена", name),
        [id] => *id,
        _ => bail!(
            "Найдено {} записей с названием '{}', укажите UUID",
            matches.len(),
            name
        ),
    };

    if !confirm(&format!("Удалить запись '{}'?", name)) {
        println!("Отменено.");
        return Ok(());
    }

    session.db.recycle(&NodeRef::Entry(id))?;
    session.save()?;

    println!("{} Запись '{}' удалена.", "Успех:".green().bold(), name);
    Ok(())
}
