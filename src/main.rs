use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Context;
use clap::{Parser, Subcommand};
use colored::Colorize;
use tracing_subscriber::EnvFilter;

use keepass_core::cli::{self, entry::NewEntry, search::SearchFlags, DatabaseArgs};
use keepass_core::config::EngineSettings;
use keepass_core::tree::search::DEFAULT_MAX_RESULTS;

#[derive(Parser)]
#[command(name = "keepass-core")]
#[command(author = "Oleg")]
#[command(version)]
#[command(about = "Работа с зашифрованными базами KeePass (KDB и KDBX)", long_about = None)]
struct Cli {
    /// Файл настроек (JSON)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Создать новую базу
    Init {
        #[command(flatten)]
        db: DatabaseArgs,

        /// Название базы
        #[arg(long, default_value = "Пароли")]
        name: String,

        /// Создать базу в старом формате KDB
        #[arg(long)]
        legacy: bool,
    },

    /// Показать сведения о базе
    Info {
        #[command(flatten)]
        db: DatabaseArgs,
    },

    /// Показать дерево групп и записей
    List {
        #[command(flatten)]
        db: DatabaseArgs,
    },

    /// Найти записи
    Search {
        #[command(flatten)]
        db: DatabaseArgs,

        /// Строка поиска
        query: String,

        /// Трактовать запрос как регулярное выражение
        #[arg(long)]
        regex: bool,

        /// Учитывать регистр
        #[arg(long)]
        case_sensitive: bool,

        /// Искать также в паролях
        #[arg(long)]
        passwords: bool,

        /// Максимум результатов
        #[arg(long, default_value_t = DEFAULT_MAX_RESULTS)]
        max: usize,
    },

    /// Управление записями
    Entry {
        #[command(subcommand)]
        action: EntryCommands,
    },

    /// Сменить мастер-пароль
    ChangePass {
        #[command(flatten)]
        db: DatabaseArgs,
    },

    /// Перенести изменения из другой базы
    Merge {
        #[command(flatten)]
        db: DatabaseArgs,

        /// Присоединяемая база (.kdbx или .kdb)
        source: PathBuf,

        /// Ключевой файл присоединяемой базы
        #[arg(long)]
        source_key_file: Option<PathBuf>,
    },
}

#[derive(Subcommand)]
enum EntryCommands {
    /// Добавить запись
    Add {
        #[command(flatten)]
        db: DatabaseArgs,

        /// Название записи
        #[arg(long)]
        title: String,

        /// Имя пользователя (запрашивается, если не указано)
        #[arg(long)]
        username: Option<String>,

        #[arg(long)]
        url: Option<String>,

        #[arg(long)]
        notes: Option<String>,

        /// Название группы
        #[arg(long)]
        group: Option<String>,
    },
    /// Удалить запись
    Remove {
        #[command(flatten)]
        db: DatabaseArgs,

        /// Название или UUID записи
        name: String,
    },
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn main() -> ExitCode {
    init_logging();
    let cli = Cli::parse();

    let result = run(cli);

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{} {:#}", "Ошибка:".red().bold(), e);
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> anyhow::Result<()> {
    let settings = EngineSettings::load(cli.config.as_deref()).context("Не удалось загрузить настройки")?;

    match cli.command {
        Commands::Init { db, name, legacy } => {
            cli::init::run(&db.path, db.key_file.as_deref(), &name, legacy, &settings)
        }
        Commands::Info { db } => cli::info::run(&db, &settings),
        Commands::List { db } => cli::list::run(&db, &settings),
        Commands::Search {
            db,
            query,
            regex,
            case_sensitive,
            passwords,
            max,
        } => {
            let flags = SearchFlags {
                regex,
                case_sensitive,
                passwords,
                max_results: max,
            };
            cli::search::run(&db, &query, &flags, &settings)
        }
        Commands::Entry { action } => match action {
            EntryCommands::Add {
                db,
                title,
                username,
                url,
                notes,
                group,
            } => cli::entry::add(
                &db,
                NewEntry {
                    title,
                    username,
                    url,
                    notes,
                    group,
                },
                &settings,
            ),
            EntryCommands::Remove { db, name } => cli::entry::remove(&db, &name, &settings),
        },
        Commands::ChangePass { db } => cli::change_pass::run(&db, &settings),
        Commands::Merge {
            db,
            source,
            source_key_file,
        } => cli::merge::run(&db, source, source_key_file, &settings),
    }
}
