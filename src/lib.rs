//! KeePass Core - engine for encrypted KeePass password databases
//!
//! This crate reads and writes:
//! - Legacy KDB files (KeePass 1.x, fixed header and binary records)
//! - KDBX 3.1 and 4.x containers with AES, Twofish or ChaCha20 bodies
//! - AES-KDF and Argon2d/Argon2id key derivation
//!
//! and keeps the decoded group/entry tree with history, attachments and search.

pub mod cli;
pub mod config;
pub mod context;
pub mod crypto;
pub mod error;
pub mod format;
pub mod tree;

pub use context::{CancelToken, EngineContext};
pub use crypto::MasterCredential;
pub use error::{DatabaseError, Result};
pub use format::{open, open_path, save, save_to_path, DuplicateIdPolicy, OpenOptions, SaveOptions};
pub use tree::Database;
