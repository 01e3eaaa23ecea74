//! Container formats and the load/save entry points
//!
//! [`open`] sniffs the signature and dispatches to the legacy (`kdb`) or
//! current (`kdbx`) generation. [`save`] writes whichever generation the
//! database belongs to. Decoding never exposes a partial tree: any failure
//! aborts the whole load.

pub mod codec;
pub mod hashed_block;
pub mod header;
pub mod hmac_block;
pub mod kdb;
pub mod kdbx;
pub mod variant;
pub mod xml;

use std::io::{Read, Write};
use std::path::Path;

use tracing::{info, warn};
use uuid::Uuid;

use self::header::{read_signature, SIGNATURE_1, SIGNATURE_2, SIGNATURE_2_LEGACY, SIGNATURE_2_PRE_RELEASE};
use crate::config::storage::{self, MAX_DATABASE_LEN};
use crate::context::EngineContext;
use crate::crypto::{KdfParameters, MasterCredential};
use crate::error::{DatabaseError, Result};
use crate::tree::{Compression, CryptoSettings, Database, Entry, FormatGeneration, Group, NodeId};

/// What to do when a decoded node reuses an id already present in the tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DuplicateIdPolicy {
    /// Abort the load with [`DatabaseError::DuplicateIdentifier`].
    #[default]
    Fail,
    /// Give the newcomer a fresh id and keep going.
    Fix,
}

#[derive(Debug, Clone, Default)]
pub struct OpenOptions {
    pub read_only: bool,
    pub duplicate_ids: DuplicateIdPolicy,
}

impl OpenOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn read_only(mut self, read_only: bool) -> Self {
        self.read_only = read_only;
        self
    }

    pub fn duplicate_ids(mut self, policy: DuplicateIdPolicy) -> Self {
        self.duplicate_ids = policy;
        self
    }
}

/// Overrides applied on top of the database's own envelope settings.
#[derive(Debug, Clone, Default)]
pub struct SaveOptions {
    pub cipher: Option<Uuid>,
    pub kdf: Option<KdfParameters>,
    pub compression: Option<Compression>,
}

impl SaveOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cipher(mut self, cipher: Uuid) -> Self {
        self.cipher = Some(cipher);
        self
    }

    pub fn kdf(mut self, kdf: KdfParameters) -> Self {
        self.kdf = Some(kdf);
        self
    }

    pub fn compression(mut self, compression: Compression) -> Self {
        self.compression = Some(compression);
        self
    }

    fn apply(&self, base: &CryptoSettings) -> CryptoSettings {
        let mut crypto = base.clone();
        if let Some(cipher) = self.cipher {
            crypto.cipher = cipher;
        }
        if let Some(kdf) = &self.kdf {
            crypto.kdf = kdf.clone();
        }
        if let Some(compression) = self.compression {
            crypto.compression = compression;
        }
        crypto
    }
}

/// Links a decoded group, reassigning its id under [`DuplicateIdPolicy::Fix`].
pub(crate) fn place_group(
    db: &mut Database,
    parent: &NodeId,
    mut group: Group,
    policy: DuplicateIdPolicy,
) -> Result<NodeId> {
    if policy == DuplicateIdPolicy::Fix && db.group(&group.id).is_some() {
        let fresh = db.new_group_id();
        warn!(old = %group.id, new = %fresh, "duplicate group id reassigned");
        group.id = fresh;
    }
    db.insert_group(parent, group)
}

/// Links a decoded entry, reassigning its id under [`DuplicateIdPolicy::Fix`].
pub(crate) fn place_entry(
    db: &mut Database,
    parent: &NodeId,
    mut entry: Entry,
    policy: DuplicateIdPolicy,
) -> Result<NodeId> {
    if policy == DuplicateIdPolicy::Fix && db.entry(&entry.id).is_some() {
        let fresh = NodeId::random();
        warn!(old = %entry.id, new = %fresh, "duplicate entry id reassigned");
        entry.id = fresh;
        for old in &mut entry.history {
            old.id = fresh;
        }
    }
    db.insert_entry(parent, entry)
}

/// Which generation the bytes belong to, judged by the two signature words.
pub fn detect_generation(data: &[u8]) -> Result<FormatGeneration> {
    let (sig1, sig2) = read_signature(data)?;
    match (sig1, sig2) {
        (SIGNATURE_1, SIGNATURE_2_LEGACY) => Ok(FormatGeneration::Legacy),
        (SIGNATURE_1, SIGNATURE_2) | (SIGNATURE_1, SIGNATURE_2_PRE_RELEASE) => Ok(FormatGeneration::Current),
        _ => Err(DatabaseError::SignatureMismatch),
    }
}

pub fn open(data: &[u8], credential: &MasterCredential, options: &OpenOptions, ctx: &EngineContext) -> Result<Database> {
    match detect_generation(data)? {
        FormatGeneration::Legacy => kdb::read(data, credential, options, ctx),
        FormatGeneration::Current => kdbx::read(data, credential, options, ctx),
    }
}

pub fn open_reader<R: Read>(
    mut reader: R,
    credential: &MasterCredential,
    options: &OpenOptions,
    ctx: &EngineContext,
) -> Result<Database> {
    let mut data = Vec::new();
    reader.read_to_end(&mut data)?;
    open(&data, credential, options, ctx)
}

/// Encodes `db` into bytes without writing anywhere.
pub fn encode(db: &Database, credential: &MasterCredential, options: &SaveOptions, ctx: &EngineContext) -> Result<Vec<u8>> {
    if db.is_read_only() {
        return Err(DatabaseError::ReadOnly);
    }
    let crypto = options.apply(&db.crypto);
    match db.generation() {
        FormatGeneration::Legacy => kdb::write(db, &crypto, credential, ctx),
        FormatGeneration::Current => kdbx::write(db, &crypto, credential, ctx),
    }
}

/// The whole container is built in memory first, so a failed encode never
/// reaches `writer`.
pub fn save<W: Write>(
    db: &Database,
    mut writer: W,
    credential: &MasterCredential,
    options: &SaveOptions,
    ctx: &EngineContext,
) -> Result<()> {
    let bytes = encode(db, credential, options, ctx)?;
    writer.write_all(&bytes)?;
    writer.flush()?;
    Ok(())
}

pub fn open_path(
    path: &Path,
    credential: &MasterCredential,
    options: &OpenOptions,
    ctx: &EngineContext,
) -> Result<Database> {
    let data = storage::read_file(path, MAX_DATABASE_LEN)?;
    let db = open(&data, credential, options, ctx)?;
    info!(path = %path.display(), "database opened");
    Ok(db)
}

/// Saves through a temporary sibling file that replaces `path` only after
/// a complete encode and sync.
pub fn save_to_path(
    db: &Database,
    path: &Path,
    credential: &MasterCredential,
    options: &SaveOptions,
    ctx: &EngineContext,
) -> Result<()> {
    let bytes = encode(db, credential, options, ctx)?;
    storage::write_atomic(path, &bytes)?;
    info!(path = %path.display(), bytes = bytes.len(), "database saved");
    Ok(())
}

fn join_error(e: tokio::task::JoinError) -> DatabaseError {
    DatabaseError::Other(format!("Фоновая задача прервана: {}", e))
}

/// [`open_path`] on the blocking thread pool.
pub async fn open_async(
    path: impl AsRef<Path>,
    credential: MasterCredential,
    options: OpenOptions,
    ctx: EngineContext,
) -> Result<Database> {
    let path = path.as_ref().to_path_buf();
    tokio::task::spawn_blocking(move || open_path(&path, &credential, &options, &ctx))
        .await
        .map_err(join_error)?
}

/// [`save_to_path`] on the blocking thread pool. The database is handed
/// back once the file is in place.
pub async fn save_async(
    db: Database,
    path: impl AsRef<Path>,
    credential: MasterCredential,
    options: SaveOptions,
    ctx: EngineContext,
) -> Result<Database> {
    let path = path.as_ref().to_path_buf();
    tokio::task::spawn_blocking(move || {
        save_to_path(&db, &path, &credential, &options, &ctx)?;
        Ok(db)
    })
    .await
    .map_err(join_error)?
}
