//! Вывод дерева групп и записей

use colored::Colorize;

use crate::config::EngineSettings;
use crate::tree::{Database, NodeId};

use super::{DatabaseArgs, Session};

fn print_group(db: &Database, id: &NodeId, depth: usize) {
    let indent = "  ".repeat(depth);
    for entry in db.child_entries(id) {
        let username = if entry.username().is_empty() {
            String::new()
        } else {
            format!(" ({})", entry.username())
        };
        println!("{}  {}{}", indent, entry.title(), username.dimmed());
    }
    for group in db.child_groups(id) {
        println!("{}{} {}", indent, "▸".cyan(), group.title.bold());
        print_group(db, &group.id, depth + 1);
    }
}

pub fn run(args: &DatabaseArgs, settings: &EngineSettings) -> anyhow::Result<()> {
    let session = Session::open(args, settings, true)?;
    let db = &session.db;

    println!();
    if db.entry_count() == 0 && db.group_count() <= 1 {
        println!("База пуста.");
        return Ok(());
    }
    if !db.is_legacy() {
        println!("{}", db.root().title.cyan().bold());
    }
    print_group(db, &db.root_id(), 0);
    println!();
    Ok(())
}
