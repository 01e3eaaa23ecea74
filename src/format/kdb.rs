//! Legacy generation (KDB)
//!
//! A fixed 124-byte header followed by one CBC-encrypted body made of
//! `{type u16, size u32, data}` fields. Records end with type `0xFFFF`.
//! Groups come first, in tree pre-order with their depth stored as a
//! level; entries follow and point back to their group by id.

use rand::rngs::OsRng;
use rand::RngCore;
use tracing::{debug, info};
use uuid::Uuid;

use super::codec::{
    cstring_bytes, never_expires, pack_date, read_cstring, u32_from_slice, unpack_date, uuid_from_slice,
    uuid_hex, write_u16, write_u32, ByteReader,
};
use super::header::{SIGNATURE_1, SIGNATURE_2_LEGACY};
use super::hmac_block::HEADER_BLOCK_INDEX;
use super::{place_entry, place_group, OpenOptions};
use crate::context::EngineContext;
use crate::crypto::engine::{AES256_UUID, TWOFISH_UUID};
use crate::crypto::kdf::aes;
use crate::crypto::kdf::params::PARAM_SEED;
use crate::crypto::{final_key, sha256, InnerStreamKind, MasterCredential, SecureBytes};
use crate::error::{DatabaseError, Result};
use crate::tree::{
    Attachment, Compression, CryptoSettings, Database, Entry, Group, NodeIcon, NodeId, Times, Timestamp,
    LEGACY_ROOT_ID,
};

pub const HEADER_LEN: usize = 124;
pub const VERSION: u32 = 0x0003_0004;
const VERSION_MASK: u32 = 0xFFFF_FF00;

const FLAG_SHA2: u32 = 1;
const FLAG_RIJNDAEL: u32 = 2;
const FLAG_ARCFOUR: u32 = 4;
const FLAG_TWOFISH: u32 = 8;

const MASTER_SEED_LEN: usize = 16;
const IV_LEN: usize = 16;
const CONTENTS_HASH_RANGE: std::ops::Range<usize> = 56..88;

const FIELD_EXT_DATA: u16 = 0x0000;
/// Smallest possible group: an id field plus the end marker.
const MIN_RECORD_LEN: usize = 16;
const FIELD_END: u16 = 0xFFFF;

const EXT_HEADER_HASH: u16 = 0x0001;
const EXT_RANDOM: u16 = 0x0002;

mod group_field {
    pub const ID: u16 = 1;
    pub const TITLE: u16 = 2;
    pub const CREATION: u16 = 3;
    pub const MODIFICATION: u16 = 4;
    pub const ACCESS: u16 = 5;
    pub const EXPIRY: u16 = 6;
    pub const ICON: u16 = 7;
    pub const LEVEL: u16 = 8;
    pub const FLAGS: u16 = 9;
}

mod entry_field {
    pub const UUID: u16 = 1;
    pub const GROUP_ID: u16 = 2;
    pub const ICON: u16 = 3;
    pub const TITLE: u16 = 4;
    pub const URL: u16 = 5;
    pub const USERNAME: u16 = 6;
    pub const PASSWORD: u16 = 7;
    pub const NOTES: u16 = 8;
    pub const CREATION: u16 = 9;
    pub const MODIFICATION: u16 = 10;
    pub const ACCESS: u16 = 11;
    pub const EXPIRY: u16 = 12;
    pub const BINARY_DESC: u16 = 13;
    pub const BINARY_DATA: u16 = 14;
}

// Meta-stream entries carry database settings KeePass 1.x keeps nowhere else.
const META_TITLE: &str = "Meta-Info";
const META_USERNAME: &str = "SYSTEM";
const META_URL: &str = "$";
const META_BINARY_DESC: &str = "bin-stream";
const META_DEFAULT_USERNAME: &str = "Default User Name";
const META_DATABASE_COLOR: &str = "Database Color";

#[derive(Debug, Clone, PartialEq, Eq)]
struct LegacyHeader {
    flags: u32,
    version: u32,
    master_seed: [u8; MASTER_SEED_LEN],
    encryption_iv: [u8; IV_LEN],
    num_groups: u32,
    num_entries: u32,
    contents_hash: [u8; 32],
    transform_seed: [u8; 32],
    rounds: u32,
}

impl LegacyHeader {
    fn read(data: &[u8]) -> Result<Self> {
        if data.len() < HEADER_LEN {
            return Err(DatabaseError::MalformedStream("файл короче заголовка KDB".into()));
        }
        let mut r = ByteReader::new(data);
        let sig1 = r.read_u32()?;
        let sig2 = r.read_u32()?;
        if sig1 != SIGNATURE_1 || sig2 != SIGNATURE_2_LEGACY {
            return Err(DatabaseError::SignatureMismatch);
        }
        let flags = r.read_u32()?;
        let version = r.read_u32()?;
        if version & VERSION_MASK != VERSION & VERSION_MASK {
            return Err(DatabaseError::UnsupportedVersion(version));
        }
        Ok(Self {
            flags,
            version,
            master_seed: r.read_array()?,
            encryption_iv: r.read_array()?,
            num_groups: r.read_u32()?,
            num_entries: r.read_u32()?,
            contents_hash: r.read_array()?,
            transform_seed: r.read_array()?,
            rounds: r.read_u32()?,
        })
    }

    fn write(&self) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(HEADER_LEN);
        write_u32(&mut out, SIGNATURE_1)?;
        write_u32(&mut out, SIGNATURE_2_LEGACY)?;
        write_u32(&mut out, self.flags)?;
        write_u32(&mut out, self.version)?;
        out.extend_from_slice(&self.master_seed);
        out.extend_from_slice(&self.encryption_iv);
        write_u32(&mut out, self.num_groups)?;
        write_u32(&mut out, self.num_entries)?;
        out.extend_from_slice(&self.contents_hash);
        out.extend_from_slice(&self.transform_seed);
        write_u32(&mut out, self.rounds)?;
        Ok(out)
    }

    fn cipher(&self) -> Result<Uuid> {
        if self.flags & FLAG_RIJNDAEL != 0 {
            Ok(AES256_UUID)
        } else if self.flags & FLAG_TWOFISH != 0 {
            Ok(TWOFISH_UUID)
        } else if self.flags & FLAG_ARCFOUR != 0 {
            Err(DatabaseError::UnsupportedCipher("ArcFour".into()))
        } else {
            Err(DatabaseError::UnsupportedCipher(format!("флаги {:#x}", self.flags)))
        }
    }
}

/// SHA-256 over the header without the contents hash, as stored in the
/// ext-data record.
fn header_digest(header: &[u8]) -> [u8; 32] {
    let mut bytes = Vec::with_capacity(HEADER_LEN - 32);
    bytes.extend_from_slice(&header[..CONTENTS_HASH_RANGE.start]);
    bytes.extend_from_slice(&header[CONTENTS_HASH_RANGE.end..HEADER_LEN]);
    sha256(&bytes)
}

fn read_date(value: &[u8]) -> Result<Timestamp> {
    let raw: [u8; 5] = value
        .try_into()
        .map_err(|_| DatabaseError::MalformedStream(format!("дата длиной {} байт", value.len())))?;
    unpack_date(&raw)
}

fn read_u16_field(value: &[u8]) -> Result<u16> {
    let mut r = ByteReader::new(value);
    r.read_u16()
}

fn expiry_from(t: Timestamp, times: &mut Times) {
    times.expiry = t;
    times.expires = t < never_expires();
}

struct ParsedEntry {
    entry: Entry,
    group_id: u32,
    binary_desc: String,
    binary_data: Vec<u8>,
}

impl ParsedEntry {
    fn is_meta_stream(&self) -> bool {
        !self.binary_data.is_empty()
            && self.binary_desc == META_BINARY_DESC
            && self.entry.title() == META_TITLE
            && self.entry.username() == META_USERNAME
            && self.entry.url() == META_URL
            && self.entry.icon.standard == 0
    }
}

enum Record {
    Idle,
    Group(Group, u16),
    Entry(ParsedEntry),
}

fn apply_group_field(group: &mut Group, level: &mut u16, kind: u16, value: &[u8]) -> Result<()> {
    match kind {
        group_field::TITLE => group.title = read_cstring(value),
        group_field::CREATION => group.times.creation = read_date(value)?,
        group_field::MODIFICATION => group.times.last_modification = read_date(value)?,
        group_field::ACCESS => group.times.last_access = read_date(value)?,
        group_field::EXPIRY => expiry_from(read_date(value)?, &mut group.times),
        group_field::ICON => group.icon = NodeIcon::standard(u32_from_slice(value)?),
        group_field::LEVEL => *level = read_u16_field(value)?,
        group_field::FLAGS => group.legacy_flags = u32_from_slice(value)?,
        other => debug!(field = other, "unknown group field skipped"),
    }
    Ok(())
}

fn apply_entry_field(parsed: &mut ParsedEntry, kind: u16, value: &[u8]) -> Result<()> {
    let entry = &mut parsed.entry;
    match kind {
        entry_field::GROUP_ID => parsed.group_id = u32_from_slice(value)?,
        entry_field::ICON => {
            let icon = u32_from_slice(value)?;
            // Old writers stored -1 for "no icon".
            entry.icon = NodeIcon::standard(if icon == u32::MAX { 0 } else { icon });
        }
        entry_field::TITLE => entry.set_title(&read_cstring(value)),
        entry_field::URL => entry.set_url(&read_cstring(value)),
        entry_field::USERNAME => entry.set_username(&read_cstring(value)),
        entry_field::PASSWORD => entry.set_password(&read_cstring(value)),
        entry_field::NOTES => entry.set_notes(&read_cstring(value)),
        entry_field::CREATION => entry.times.creation = read_date(value)?,
        entry_field::MODIFICATION => entry.times.last_modification = read_date(value)?,
        entry_field::ACCESS => entry.times.last_access = read_date(value)?,
        entry_field::EXPIRY => expiry_from(read_date(value)?, &mut entry.times),
        entry_field::BINARY_DESC => parsed.binary_desc = read_cstring(value),
        entry_field::BINARY_DATA => parsed.binary_data = value.to_vec(),
        other => debug!(field = other, "unknown entry field skipped"),
    }
    Ok(())
}

fn check_ext_data(value: &[u8], header: &[u8]) -> Result<()> {
    let mut r = ByteReader::new(value);
    while !r.is_empty() {
        let kind = r.read_u16()?;
        let size = r.read_u32()? as usize;
        let data = r.take(size)?;
        match kind {
            EXT_HEADER_HASH => {
                if data != header_digest(header).as_slice() {
                    return Err(DatabaseError::IntegrityCheckFailed(HEADER_BLOCK_INDEX));
                }
            }
            FIELD_END => break,
            _ => {}
        }
    }
    Ok(())
}

fn color_from_meta(data: &[u8]) -> Option<String> {
    let value = u32_from_slice(data.get(..4)?).ok()?;
    let (r, g, b) = (value & 0xFF, (value >> 8) & 0xFF, (value >> 16) & 0xFF);
    Some(format!("#{:02X}{:02X}{:02X}", r, g, b))
}

fn color_to_meta(color: &str) -> Option<[u8; 4]> {
    let hex = color.strip_prefix('#')?;
    if hex.len() != 6 {
        return None;
    }
    let rgb = u32::from_str_radix(hex, 16).ok()?;
    let (r, g, b) = ((rgb >> 16) & 0xFF, (rgb >> 8) & 0xFF, rgb & 0xFF);
    Some((r | (g << 8) | (b << 16)).to_le_bytes())
}

pub fn read(data: &[u8], credential: &MasterCredential, options: &OpenOptions, ctx: &EngineContext) -> Result<Database> {
    ctx.checkpoint("header")?;
    let header = LegacyHeader::read(data)?;
    let header_bytes = &data[..HEADER_LEN];
    let cipher_uuid = header.cipher()?;
    let cipher = ctx.ciphers().get(&cipher_uuid)?;
    let mut kdf_params = aes::parameters(u64::from(header.rounds));
    kdf_params.set_bytes(PARAM_SEED, header.transform_seed.to_vec());
    debug!(
        cipher = cipher.name(),
        rounds = header.rounds,
        groups = header.num_groups,
        entries = header.num_entries,
        "legacy header parsed"
    );

    ctx.checkpoint("derive")?;
    let composite = credential.legacy_composite_key()?;
    let transformed = ctx.kdfs().transform(&composite, &kdf_params)?;
    let key = final_key(&header.master_seed, &transformed);

    ctx.checkpoint("decrypt")?;
    // Without a stream-start marker, bad padding is the first sign of a wrong key.
    let plain = SecureBytes::new(
        cipher
            .decrypt_all(&key, &header.encryption_iv, &data[HEADER_LEN..])
            .map_err(|_| DatabaseError::InvalidCredentials)?,
    );
    if sha256(&plain) != header.contents_hash {
        return Err(DatabaseError::InvalidCredentials);
    }

    ctx.checkpoint("document")?;
    // The counts are not covered by any hash yet; size buffers from the body.
    let max_records = plain.len() / MIN_RECORD_LEN;
    let mut groups: Vec<(Group, u16)> = Vec::with_capacity((header.num_groups as usize).min(max_records));
    let mut entries: Vec<ParsedEntry> = Vec::with_capacity((header.num_entries as usize).min(max_records));
    let mut meta_username = None;
    let mut meta_color = None;
    let mut record = Record::Idle;
    let mut r = ByteReader::new(&plain);
    while (groups.len() as u64) < u64::from(header.num_groups) || (entries.len() as u64) < u64::from(header.num_entries) {
        if r.remaining() == 0 {
            return Err(DatabaseError::MalformedStream(format!(
                "ожидалось {} групп и {} записей, прочитано {} и {}",
                header.num_groups,
                header.num_entries,
                groups.len(),
                entries.len()
            )));
        }
        let kind = r.read_u16()?;
        let size = r.read_u32()? as usize;
        let value = r.take(size)?;

        record = match (record, kind) {
            (Record::Idle, FIELD_EXT_DATA) => {
                check_ext_data(value, header_bytes)?;
                Record::Idle
            }
            (Record::Idle, 1) if size == 4 => {
                let id = NodeId::Int(u32_from_slice(value)?);
                Record::Group(Group::with_id(id, ""), 0)
            }
            (Record::Idle, 1) if size == 16 => {
                let id = NodeId::Uuid(uuid_from_slice(value)?);
                Record::Entry(ParsedEntry {
                    entry: Entry::with_id(id),
                    group_id: 0,
                    binary_desc: String::new(),
                    binary_data: Vec::new(),
                })
            }
            (Record::Idle, FIELD_END) => Record::Idle,
            (Record::Idle, other) => {
                return Err(DatabaseError::MalformedStream(format!("поле {} вне записи", other)));
            }
            (Record::Group(group, level), FIELD_END) => {
                groups.push((group, level));
                Record::Idle
            }
            (Record::Group(mut group, mut level), kind) => {
                apply_group_field(&mut group, &mut level, kind, value)?;
                Record::Group(group, level)
            }
            (Record::Entry(parsed), FIELD_END) => {
                if parsed.is_meta_stream() {
                    match parsed.entry.notes() {
                        META_DEFAULT_USERNAME => {
                            meta_username = Some(read_cstring(&parsed.binary_data));
                        }
                        META_DATABASE_COLOR => meta_color = color_from_meta(&parsed.binary_data),
                        other => debug!(stream = other, "unknown meta-stream kept as entry"),
                    }
                }
                entries.push(parsed);
                Record::Idle
            }
            (Record::Entry(mut parsed), kind) => {
                apply_entry_field(&mut parsed, kind, value)?;
                Record::Entry(parsed)
            }
        };
    }

    let mut db = build_tree(groups, entries, options, ctx)?;
    db.crypto = CryptoSettings {
        cipher: cipher_uuid,
        kdf: kdf_params,
        compression: Compression::None,
        inner_stream: InnerStreamKind::None,
        version: header.version,
        public_custom_data: Default::default(),
    };
    if let Some(username) = meta_username {
        db.meta.default_username = username;
    }
    if let Some(color) = meta_color {
        db.meta.color = color;
    }
    db.set_read_only(options.read_only);
    info!(
        groups = db.group_count(),
        entries = db.entry_count(),
        "legacy database opened"
    );
    Ok(db)
}

/// Rebuilds parent links from group levels: each group hangs under the
/// closest preceding group one level up, level 0 under the implicit root.
fn build_tree(
    groups: Vec<(Group, u16)>,
    entries: Vec<ParsedEntry>,
    options: &OpenOptions,
    ctx: &EngineContext,
) -> Result<Database> {
    let mut db = Database::new_legacy();
    let mut stack: Vec<(u16, NodeId)> = Vec::new();
    for (group, level) in groups {
        while stack.last().map_or(false, |(l, _)| *l >= level) {
            stack.pop();
        }
        let parent = stack.last().map_or(LEGACY_ROOT_ID, |(_, id)| *id);
        let id = place_group(&mut db, &parent, group, options.duplicate_ids)?;
        stack.push((level, id));
    }

    for parsed in entries {
        if parsed.is_meta_stream()
            && matches!(parsed.entry.notes(), META_DEFAULT_USERNAME | META_DATABASE_COLOR)
        {
            continue;
        }
        let parent = NodeId::Int(parsed.group_id);
        if db.group(&parent).is_none() {
            return Err(DatabaseError::MalformedDocument(format!(
                "запись {} ссылается на несуществующую группу {}",
                parsed.entry.id, parsed.group_id
            )));
        }
        let mut entry = parsed.entry;
        if !parsed.binary_data.is_empty() {
            let key = db.binaries.register_unreferenced(&parsed.binary_data, false, ctx)?;
            entry.attachments.push(Attachment {
                name: parsed.binary_desc,
                binary: key,
            });
        }
        place_entry(&mut db, &parent, entry, options.duplicate_ids)?;
    }
    db.binaries.purge_unreferenced();
    Ok(db)
}

fn put_field(out: &mut Vec<u8>, kind: u16, value: &[u8]) -> Result<()> {
    write_u16(out, kind)?;
    write_u32(out, value.len() as u32)?;
    out.extend_from_slice(value);
    Ok(())
}

fn legacy_id(id: &NodeId) -> Result<u32> {
    id.as_int()
        .ok_or_else(|| DatabaseError::MalformedDocument(format!("группа {} без числового идентификатора", id)))
}

fn expiry_of(times: &Times) -> Timestamp {
    if times.expires {
        times.expiry
    } else {
        never_expires()
    }
}

fn write_group(out: &mut Vec<u8>, group: &Group, level: u16) -> Result<()> {
    put_field(out, group_field::ID, &legacy_id(&group.id)?.to_le_bytes())?;
    put_field(out, group_field::TITLE, &cstring_bytes(&group.title))?;
    put_field(out, group_field::CREATION, &pack_date(&group.times.creation))?;
    put_field(out, group_field::MODIFICATION, &pack_date(&group.times.last_modification))?;
    put_field(out, group_field::ACCESS, &pack_date(&group.times.last_access))?;
    put_field(out, group_field::EXPIRY, &pack_date(&expiry_of(&group.times)))?;
    put_field(out, group_field::ICON, &group.icon.standard.to_le_bytes())?;
    put_field(out, group_field::LEVEL, &level.to_le_bytes())?;
    put_field(out, group_field::FLAGS, &group.legacy_flags.to_le_bytes())?;
    put_field(out, FIELD_END, &[])
}

struct EntryRecord<'a> {
    uuid: Uuid,
    group_id: u32,
    icon: u32,
    title: &'a str,
    url: &'a str,
    username: &'a str,
    password: &'a str,
    notes: &'a str,
    times: &'a Times,
    binary_desc: &'a str,
    binary_data: &'a [u8],
}

fn write_entry(out: &mut Vec<u8>, e: &EntryRecord<'_>) -> Result<()> {
    put_field(out, entry_field::UUID, e.uuid.as_bytes())?;
    put_field(out, entry_field::GROUP_ID, &e.group_id.to_le_bytes())?;
    put_field(out, entry_field::ICON, &e.icon.to_le_bytes())?;
    put_field(out, entry_field::TITLE, &cstring_bytes(e.title))?;
    put_field(out, entry_field::URL, &cstring_bytes(e.url))?;
    put_field(out, entry_field::USERNAME, &cstring_bytes(e.username))?;
    put_field(out, entry_field::PASSWORD, &cstring_bytes(e.password))?;
    put_field(out, entry_field::NOTES, &cstring_bytes(e.notes))?;
    put_field(out, entry_field::CREATION, &pack_date(&e.times.creation))?;
    put_field(out, entry_field::MODIFICATION, &pack_date(&e.times.last_modification))?;
    put_field(out, entry_field::ACCESS, &pack_date(&e.times.last_access))?;
    put_field(out, entry_field::EXPIRY, &pack_date(&expiry_of(e.times)))?;
    put_field(out, entry_field::BINARY_DESC, &cstring_bytes(e.binary_desc))?;
    put_field(out, entry_field::BINARY_DATA, e.binary_data)?;
    put_field(out, FIELD_END, &[])
}

fn meta_stream(out: &mut Vec<u8>, group_id: u32, kind: &str, data: &[u8], times: &Times) -> Result<()> {
    write_entry(
        out,
        &EntryRecord {
            uuid: Uuid::new_v4(),
            group_id,
            icon: 0,
            title: META_TITLE,
            url: META_URL,
            username: META_USERNAME,
            password: "",
            notes: kind,
            times,
            binary_desc: META_BINARY_DESC,
            binary_data: data,
        },
    )
}

/// Encodes `db` in the legacy layout. Only AES and Twofish with AES-KDF
/// can be expressed.
pub fn write(
    db: &Database,
    crypto: &CryptoSettings,
    credential: &MasterCredential,
    ctx: &EngineContext,
) -> Result<Vec<u8>> {
    let cipher_flag = match crypto.cipher {
        AES256_UUID => FLAG_RIJNDAEL,
        TWOFISH_UUID => FLAG_TWOFISH,
        other => return Err(DatabaseError::UnsupportedCipher(uuid_hex(&other))),
    };
    let cipher = ctx.ciphers().get(&crypto.cipher)?;
    let kdf_engine = ctx.kdfs().get(&crypto.kdf.uuid()?)?;
    if kdf_engine.uuid() != aes::AES_KDF_UUID {
        return Err(DatabaseError::UnsupportedAlgorithm(format!(
            "{} недоступен в формате KDB",
            kdf_engine.name()
        )));
    }
    let mut kdf = crypto.kdf.clone();
    kdf_engine.randomize(&mut kdf);
    let (rounds, seed) = aes::validate(&kdf)?;
    let rounds = u32::try_from(rounds)
        .map_err(|_| DatabaseError::InvalidKdfParameter(format!("KDB: {} раундов не помещается в u32", rounds)))?;

    if db.root().entries.iter().any(|id| db.entry(id).is_some()) {
        return Err(DatabaseError::MalformedDocument(
            "формат KDB не допускает записей в корне".into(),
        ));
    }

    let mut group_records = Vec::new();
    let mut entry_records = Vec::new();
    let mut num_groups = 0u32;
    let mut num_entries = 0u32;
    let mut first_group = None;

    let mut pending: Vec<(NodeId, u16)> = db.root().groups.iter().rev().map(|id| (*id, 0)).collect();
    while let Some((id, level)) = pending.pop() {
        let group = match db.group(&id) {
            Some(group) => group,
            None => continue,
        };
        let group_id = legacy_id(&group.id)?;
        first_group.get_or_insert(group_id);
        write_group(&mut group_records, group, level)?;
        num_groups += 1;

        for entry in group.entries.iter().filter_map(|e| db.entry(e)) {
            let attachment = entry.attachments.first();
            let data = match attachment {
                Some(a) => db.binaries.data(&a.binary)?.to_vec(),
                None => Vec::new(),
            };
            write_entry(
                &mut entry_records,
                &EntryRecord {
                    uuid: entry.id.as_uuid().unwrap_or_else(Uuid::new_v4),
                    group_id,
                    icon: entry.icon.standard,
                    title: entry.title(),
                    url: entry.url(),
                    username: entry.username(),
                    password: entry.password(),
                    notes: entry.notes(),
                    times: &entry.times,
                    binary_desc: attachment.map_or("", |a| a.name.as_str()),
                    binary_data: &data,
                },
            )?;
            num_entries += 1;
        }
        for child in group.groups.iter().rev() {
            pending.push((*child, level.saturating_add(1)));
        }
    }

    if let Some(group_id) = first_group {
        let times = Times::now();
        if !db.meta.default_username.is_empty() {
            let mut data = db.meta.default_username.as_bytes().to_vec();
            data.push(0);
            meta_stream(&mut entry_records, group_id, META_DEFAULT_USERNAME, &data, &times)?;
            num_entries += 1;
        }
        if let Some(color) = color_to_meta(&db.meta.color) {
            meta_stream(&mut entry_records, group_id, META_DATABASE_COLOR, &color, &times)?;
            num_entries += 1;
        }
    }

    ctx.checkpoint("derive")?;
    let mut master_seed = [0u8; MASTER_SEED_LEN];
    let mut encryption_iv = [0u8; IV_LEN];
    OsRng.fill_bytes(&mut master_seed);
    OsRng.fill_bytes(&mut encryption_iv);
    let mut header = LegacyHeader {
        flags: FLAG_SHA2 | cipher_flag,
        version: VERSION,
        master_seed,
        encryption_iv,
        num_groups,
        num_entries,
        contents_hash: [0; 32],
        transform_seed: seed
            .try_into()
            .map_err(|_| DatabaseError::InvalidKdfParameter("AES-KDF: длина зерна".into()))?,
        rounds,
    };

    let mut ext = Vec::new();
    put_field(&mut ext, EXT_HEADER_HASH, &header_digest(&header.write()?))?;
    put_field(&mut ext, EXT_RANDOM, &SecureBytes::random(32))?;
    put_field(&mut ext, FIELD_END, &[])?;

    let mut body = Vec::with_capacity(ext.len() + group_records.len() + entry_records.len() + 6);
    put_field(&mut body, FIELD_EXT_DATA, &ext)?;
    body.extend_from_slice(&group_records);
    body.extend_from_slice(&entry_records);
    let body = SecureBytes::new(body);
    header.contents_hash = sha256(&body);

    let composite = credential.legacy_composite_key()?;
    let transformed = kdf_engine.transform(&composite, &kdf)?;
    let key = final_key(&header.master_seed, &transformed);

    ctx.checkpoint("encrypt")?;
    let mut out = header.write()?;
    out.extend_from_slice(&cipher.encrypt_all(&key, &header.encryption_iv, &body)?);
    info!(groups = num_groups, entries = num_entries, bytes = out.len(), "legacy database encoded");
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::kdf::argon::{self, Argon2Variant};
    use crate::crypto::HardwareKey;
    use std::sync::Arc;

    fn legacy_sample() -> Database {
        let ctx = EngineContext::default();
        let mut db = Database::new_legacy();
        db.crypto.kdf = aes::parameters(6);
        let root = db.root_id();
        let top = db.add_group(&root, db.new_group("Root")).unwrap();
        let mut entry = Entry::new();
        entry.set_title("Example");
        entry.set_username("user");
        entry.set_password("pass");
        let id = db.add_entry(&top, entry).unwrap();
        db.add_attachment(&id, "key.txt", b"secret file", false, &ctx).unwrap();

        let child = db.add_group(&top, db.new_group("Child")).unwrap();
        let grandchild = db.add_group(&child, db.new_group("Grandchild")).unwrap();
        let mut deep = Entry::new();
        deep.set_title("Deep");
        db.add_entry(&grandchild, deep).unwrap();
        db.add_group(&root, db.new_group("Second")).unwrap();
        db
    }

    fn open(bytes: &[u8], password: &str) -> Result<Database> {
        read(
            bytes,
            &MasterCredential::password(password),
            &OpenOptions::default(),
            &EngineContext::default(),
        )
    }

    #[test]
    fn test_levels_rebuild_the_tree() {
        let db = legacy_sample();
        let bytes = write(&db, &db.crypto, &MasterCredential::password("pw"), &EngineContext::default()).unwrap();
        let back = open(&bytes, "pw").unwrap();

        assert!(back.is_legacy());
        assert_eq!(back.group_count(), 4);
        let top: Vec<&str> = back.child_groups(&back.root_id()).map(|g| g.title.as_str()).collect();
        assert_eq!(top, vec!["Root", "Second"]);

        let root_group = back.child_groups(&back.root_id()).next().unwrap().id;
        let child = back.child_groups(&root_group).next().unwrap();
        assert_eq!(child.title, "Child");
        let grandchild = back.child_groups(&child.id).next().unwrap();
        assert_eq!(back.depth(&grandchild.id), 3);
        assert_eq!(back.child_entries(&grandchild.id).next().unwrap().title(), "Deep");
    }

    #[test]
    fn test_entry_fields_and_attachment_survive() {
        let db = legacy_sample();
        let bytes = write(&db, &db.crypto, &MasterCredential::password("pw"), &EngineContext::default()).unwrap();
        let back = open(&bytes, "pw").unwrap();
        let entry = back.entries().find(|e| e.title() == "Example").unwrap();
        assert_eq!(entry.username(), "user");
        assert_eq!(entry.password(), "pass");
        let attachment = entry.attachment("key.txt").unwrap();
        assert_eq!(&*back.binaries.data(&attachment.binary).unwrap(), b"secret file");
        assert!(!entry.times.expires);
    }

    #[test]
    fn test_wrong_password_and_contents_hash() {
        let db = legacy_sample();
        let bytes = write(&db, &db.crypto, &MasterCredential::password("right"), &EngineContext::default()).unwrap();
        assert!(matches!(open(&bytes, "wrong"), Err(DatabaseError::InvalidCredentials)));
    }

    #[test]
    fn test_meta_streams_carry_username_and_color() {
        let mut db = legacy_sample();
        db.meta.default_username = "admin".into();
        db.meta.color = "#1A2B3C".into();
        let bytes = write(&db, &db.crypto, &MasterCredential::password("pw"), &EngineContext::default()).unwrap();
        let back = open(&bytes, "pw").unwrap();
        assert_eq!(back.meta.default_username, "admin");
        assert_eq!(back.meta.color, "#1A2B3C");
        assert_eq!(back.entry_count(), db.entry_count());
    }

    #[test]
    fn test_corrupted_counts_are_an_error() {
        let db = legacy_sample();
        let bytes = write(&db, &db.crypto, &MasterCredential::password("pw"), &EngineContext::default()).unwrap();
        for count in [u32::MAX, 1000] {
            for offset in [48, 52] {
                let mut patched = bytes.clone();
                patched[offset..offset + 4].copy_from_slice(&count.to_le_bytes());
                assert!(matches!(
                    open(&patched, "pw"),
                    Err(DatabaseError::IntegrityCheckFailed(_)) | Err(DatabaseError::MalformedStream(_))
                ));
            }
        }
    }

    #[test]
    fn test_highest_group_id_is_an_ordinary_group() {
        let mut db = Database::new_legacy();
        db.crypto.kdf = aes::parameters(6);
        let root = db.root_id();
        let last = db.add_group(&root, Group::with_id(NodeId::Int(u32::MAX), "Last")).unwrap();
        db.add_entry(&last, Entry::new()).unwrap();
        let bytes = write(&db, &db.crypto, &MasterCredential::password("pw"), &EngineContext::default()).unwrap();
        let back = open(&bytes, "pw").unwrap();
        let group = back.group(&NodeId::Int(u32::MAX)).unwrap();
        assert_eq!(group.title, "Last");
        assert_eq!(back.child_entries(&group.id).count(), 1);
    }

    #[test]
    fn test_twofish_round_trip() {
        let mut db = legacy_sample();
        db.crypto.cipher = TWOFISH_UUID;
        let bytes = write(&db, &db.crypto, &MasterCredential::password("pw"), &EngineContext::default()).unwrap();
        let back = open(&bytes, "pw").unwrap();
        assert_eq!(back.crypto.cipher, TWOFISH_UUID);
        assert_eq!(back.entry_count(), 2);
    }

    #[test]
    fn test_unrepresentable_settings_are_rejected() {
        let mut db = legacy_sample();
        let ctx = EngineContext::default();
        let credential = MasterCredential::password("pw");

        let mut crypto = db.crypto.clone();
        crypto.kdf = argon::parameters(Argon2Variant::D, 1, 8 * 1024, 1);
        assert!(matches!(
            write(&db, &crypto, &credential, &ctx),
            Err(DatabaseError::UnsupportedAlgorithm(_))
        ));

        let root = db.root_id();
        db.add_entry(&root, Entry::new()).unwrap();
        assert!(write(&db, &db.crypto, &credential, &ctx).is_err());
    }

    #[derive(Debug)]
    struct Token;

    impl HardwareKey for Token {
        fn challenge_response(&self, challenge: &[u8]) -> Result<Vec<u8>> {
            Ok(challenge.to_vec())
        }
    }

    #[test]
    fn test_hardware_key_is_rejected() {
        let db = legacy_sample();
        let credential = MasterCredential::password("pw").with_hardware_key(Arc::new(Token));
        assert!(matches!(
            write(&db, &db.crypto, &credential, &EngineContext::default()),
            Err(DatabaseError::KeyFile(_))
        ));
    }

    #[test]
    fn test_colour_conversion() {
        assert_eq!(color_to_meta("#FF0000"), Some([0xFF, 0, 0, 0]));
        assert_eq!(color_from_meta(&[0xFF, 0, 0, 0]).as_deref(), Some("#FF0000"));
        assert_eq!(color_to_meta(""), None);
    }
}
