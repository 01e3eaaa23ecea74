use std::collections::HashMap;
use std::io::Read;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use flate2::read::GzDecoder;
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use tracing::{debug, warn};
use uuid::Uuid;

use super::{malformed, parse_bool, parse_date, parse_number, parse_optional_uuid, parse_tristate, parse_uuid, split_tags};
use crate::context::EngineContext;
use crate::crypto::InnerStream;
use crate::error::Result;
use crate::format::{place_entry, place_group, DuplicateIdPolicy};
use crate::tree::{
    Attachment, AutoTypeAssociation, BinaryPool, CustomData, CustomIcon, Database, DeletedObject, Entry,
    FormatGeneration, Group, Meta, NodeId, ProtectedValue, Times,
};

/// Result of decoding a document.
#[derive(Debug)]
pub struct ParsedDocument {
    pub database: Database,
    /// `Meta/HeaderHash` of version 3 files, when present.
    pub header_hash: Option<Vec<u8>>,
}

enum Tag<'a> {
    /// An element start; the flag is false for `<Empty/>` elements.
    Open(BytesStart<'a>, bool),
    Close,
    Eof,
}

struct Cursor<'a> {
    reader: Reader<&'a [u8]>,
}

impl<'a> Cursor<'a> {
    fn new(xml: &'a [u8]) -> Self {
        let mut reader = Reader::from_reader(xml);
        reader.trim_text(false);
        Self { reader }
    }

    /// Next element boundary, ignoring whitespace, comments and declarations.
    fn next_tag(&mut self) -> Result<Tag<'a>> {
        loop {
            match self.reader.read_event()? {
                Event::Start(e) => return Ok(Tag::Open(e, true)),
                Event::Empty(e) => return Ok(Tag::Open(e, false)),
                Event::End(_) => return Ok(Tag::Close),
                Event::Eof => return Ok(Tag::Eof),
                _ => {}
            }
        }
    }

    /// Text content up to the closing tag of the current element.
    fn text(&mut self, has_content: bool) -> Result<String> {
        let mut out = String::new();
        if !has_content {
            return Ok(out);
        }
        loop {
            match self.reader.read_event()? {
                Event::Text(t) => out.push_str(&t.unescape()?),
                Event::CData(c) => out.push_str(
                    std::str::from_utf8(&c).map_err(|e| malformed(format!("CDATA: {}", e)))?,
                ),
                Event::Start(_) => self.skip(true)?,
                Event::End(_) => return Ok(out),
                Event::Eof => return Err(malformed("неожиданный конец документа")),
                _ => {}
            }
        }
    }

    fn skip(&mut self, has_content: bool) -> Result<()> {
        if !has_content {
            return Ok(());
        }
        let mut depth = 1usize;
        loop {
            match self.reader.read_event()? {
                Event::Start(_) => depth += 1,
                Event::End(_) => {
                    depth -= 1;
                    if depth == 0 {
                        return Ok(());
                    }
                }
                Event::Eof => return Err(malformed("неожиданный конец документа")),
                _ => {}
            }
        }
    }
}

fn attribute(e: &BytesStart<'_>, key: &[u8]) -> Result<Option<String>> {
    for attr in e.attributes() {
        let attr = attr.map_err(|err| malformed(err.to_string()))?;
        if attr.key.as_ref() == key {
            return Ok(Some(attr.unescape_value()?.into_owned()));
        }
    }
    Ok(None)
}

fn element_name(e: &BytesStart<'_>) -> String {
    String::from_utf8_lossy(e.name().as_ref()).into_owned()
}

/// A group with its children, before it is linked into the arena.
struct ParsedGroup {
    group: Group,
    entries: Vec<Entry>,
    groups: Vec<ParsedGroup>,
}

struct DocumentReader<'a, 's> {
    cursor: Cursor<'a>,
    stream: &'s mut InnerStream,
    ctx: &'s EngineContext,
    binaries: BinaryPool<u32>,
    binary_refs: HashMap<String, u32>,
    icons: BinaryPool<Uuid>,
    header_hash: Option<Vec<u8>>,
}

/// Decodes the XML document.
///
/// `binaries` holds payloads already taken from the inner header, and
/// `binary_refs` their pool keys in header order (the `Ref` attribute
/// indexes into it).
pub fn read_document(
    xml: &[u8],
    stream: &mut InnerStream,
    binaries: BinaryPool<u32>,
    binary_refs: &[u32],
    policy: DuplicateIdPolicy,
    ctx: &EngineContext,
) -> Result<ParsedDocument> {
    let mut reader = DocumentReader {
        cursor: Cursor::new(xml),
        stream,
        ctx,
        binaries,
        binary_refs: binary_refs
            .iter()
            .enumerate()
            .map(|(i, key)| (i.to_string(), *key))
            .collect(),
        icons: BinaryPool::new(),
        header_hash: None,
    };

    let (meta, root, deleted) = loop {
        match reader.cursor.next_tag()? {
            Tag::Open(e, content) if e.name().as_ref() == b"KeePassFile" => break reader.read_file(content)?,
            Tag::Open(e, _) => return Err(malformed(format!("ожидался KeePassFile, найден {}", element_name(&e)))),
            Tag::Close | Tag::Eof => return Err(malformed("пустой документ")),
        }
    };

    let root = root.ok_or_else(|| malformed("нет корневой группы"))?;
    let mut database = Database::with_root(FormatGeneration::Current, root.group);
    database.meta = meta;
    database.binaries = reader.binaries;
    database.icons = reader.icons;
    database.deleted_objects = deleted;

    let root_id = database.root_id();
    link_children(&mut database, &root_id, root.entries, root.groups, policy)?;

    let purged = database.binaries.purge_unreferenced();
    if purged > 0 {
        debug!(purged, "unreferenced binaries dropped");
    }
    debug!(
        groups = database.group_count(),
        entries = database.entry_count(),
        "document read"
    );
    Ok(ParsedDocument {
        database,
        header_hash: reader.header_hash,
    })
}

fn link_children(
    db: &mut Database,
    parent: &NodeId,
    entries: Vec<Entry>,
    groups: Vec<ParsedGroup>,
    policy: DuplicateIdPolicy,
) -> Result<()> {
    for entry in entries {
        place_entry(db, parent, entry, policy)?;
    }
    for child in groups {
        let id = place_group(db, parent, child.group, policy)?;
        link_children(db, &id, child.entries, child.groups, policy)?;
    }
    Ok(())
}

impl<'a, 's> DocumentReader<'a, 's> {
    fn text(&mut self, content: bool) -> Result<String> {
        self.cursor.text(content)
    }

    fn read_file(&mut self, content: bool) -> Result<(Meta, Option<ParsedGroup>, Vec<DeletedObject>)> {
        let mut meta = Meta::default();
        let mut root = None;
        let mut deleted = Vec::new();
        if !content {
            return Ok((meta, root, deleted));
        }
        loop {
            match self.cursor.next_tag()? {
                Tag::Open(e, content) => match e.name().as_ref() {
                    b"Meta" => meta = self.read_meta(content)?,
                    b"Root" => {
                        let (group, objects) = self.read_root(content)?;
                        root = group;
                        deleted = objects;
                    }
                    _ => self.cursor.skip(content)?,
                },
                Tag::Close => break,
                Tag::Eof => return Err(malformed("неожиданный конец документа")),
            }
        }
        Ok((meta, root, deleted))
    }

    fn read_meta(&mut self, content: bool) -> Result<Meta> {
        let mut meta = Meta {
            settings_changed: None,
            ..Meta::default()
        };
        if !content {
            return Ok(meta);
        }
        loop {
            let (e, content) = match self.cursor.next_tag()? {
                Tag::Open(e, content) => (e, content),
                Tag::Close => break,
                Tag::Eof => return Err(malformed("неожиданный конец Meta")),
            };
            match e.name().as_ref() {
                b"Generator" => meta.generator = self.text(content)?,
                b"HeaderHash" => {
                    let text = self.text(content)?;
                    self.header_hash = Some(
                        STANDARD
                            .decode(text.trim())
                            .map_err(|err| malformed(format!("HeaderHash: {}", err)))?,
                    );
                }
                b"SettingsChanged" => meta.settings_changed = Some(parse_date(&self.text(content)?)?),
                b"DatabaseName" => meta.name = self.text(content)?,
                b"DatabaseNameChanged" => meta.name_changed = parse_date(&self.text(content)?)?,
                b"DatabaseDescription" => meta.description = self.text(content)?,
                b"DatabaseDescriptionChanged" => meta.description_changed = parse_date(&self.text(content)?)?,
                b"DefaultUserName" => meta.default_username = self.text(content)?,
                b"DefaultUserNameChanged" => meta.default_username_changed = parse_date(&self.text(content)?)?,
                b"MaintenanceHistoryDays" => {
                    meta.maintenance_history_days = parse_number(&self.text(content)?, "MaintenanceHistoryDays")?
                }
                b"Color" => meta.color = self.text(content)?,
                b"MasterKeyChanged" => meta.master_key_changed = parse_date(&self.text(content)?)?,
                b"MasterKeyChangeRec" => {
                    meta.master_key_change_rec = parse_number(&self.text(content)?, "MasterKeyChangeRec")?
                }
                b"MasterKeyChangeForce" => {
                    meta.master_key_change_force = parse_number(&self.text(content)?, "MasterKeyChangeForce")?
                }
                b"MasterKeyChangeForceOnce" => meta.master_key_change_force_once = parse_bool(&self.text(content)?),
                b"MemoryProtection" => self.read_memory_protection(&mut meta, content)?,
                b"CustomIcons" => self.read_custom_icons(&mut meta, content)?,
                b"RecycleBinEnabled" => meta.recycle_bin_enabled = parse_bool(&self.text(content)?),
                b"RecycleBinUUID" => meta.recycle_bin = parse_optional_uuid(&self.text(content)?)?.map(NodeId::Uuid),
                b"RecycleBinChanged" => meta.recycle_bin_changed = parse_date(&self.text(content)?)?,
                b"EntryTemplatesGroup" => {
                    meta.entry_templates_group = parse_optional_uuid(&self.text(content)?)?.map(NodeId::Uuid)
                }
                b"EntryTemplatesGroupChanged" => meta.entry_templates_group_changed = parse_date(&self.text(content)?)?,
                b"HistoryMaxItems" => meta.history.max_items = parse_number(&self.text(content)?, "HistoryMaxItems")?,
                b"HistoryMaxSize" => meta.history.max_size = parse_number(&self.text(content)?, "HistoryMaxSize")?,
                b"LastSelectedGroup" => meta.last_selected_group = parse_optional_uuid(&self.text(content)?)?,
                b"LastTopVisibleGroup" => meta.last_top_visible_group = parse_optional_uuid(&self.text(content)?)?,
                b"Binaries" => self.read_meta_binaries(content)?,
                b"CustomData" => meta.custom_data = self.read_custom_data(content)?,
                _ => {
                    debug!(element = %element_name(&e), "unknown Meta element skipped");
                    self.cursor.skip(content)?
                }
            }
        }
        Ok(meta)
    }

    fn read_memory_protection(&mut self, meta: &mut Meta, content: bool) -> Result<()> {
        if !content {
            return Ok(());
        }
        loop {
            match self.cursor.next_tag()? {
                Tag::Open(e, content) => {
                    let value = parse_bool(&self.text(content)?);
                    let flags = &mut meta.memory_protection;
                    match e.name().as_ref() {
                        b"ProtectTitle" => flags.title = value,
                        b"ProtectUserName" => flags.username = value,
                        b"ProtectPassword" => flags.password = value,
                        b"ProtectURL" => flags.url = value,
                        b"ProtectNotes" => flags.notes = value,
                        _ => {}
                    }
                }
                Tag::Close => return Ok(()),
                Tag::Eof => return Err(malformed("неожиданный конец MemoryProtection")),
            }
        }
    }

    fn read_custom_icons(&mut self, meta: &mut Meta, content: bool) -> Result<()> {
        if !content {
            return Ok(());
        }
        loop {
            match self.cursor.next_tag()? {
                Tag::Open(e, content) if e.name().as_ref() == b"Icon" => {
                    let mut uuid = None;
                    let mut data = None;
                    let mut name = String::new();
                    let mut last_modification = None;
                    if content {
                        loop {
                            match self.cursor.next_tag()? {
                                Tag::Open(e, content) => match e.name().as_ref() {
                                    b"UUID" => uuid = Some(parse_uuid(&self.text(content)?)?),
                                    b"Data" => {
                                        let text = self.text(content)?;
                                        data = Some(
                                            STANDARD
                                                .decode(text.trim())
                                                .map_err(|err| malformed(format!("значок: {}", err)))?,
                                        );
                                    }
                                    b"Name" => name = self.text(content)?,
                                    b"LastModificationTime" => {
                                        last_modification = Some(parse_date(&self.text(content)?)?)
                                    }
                                    _ => self.cursor.skip(content)?,
                                },
                                Tag::Close => break,
                                Tag::Eof => return Err(malformed("неожиданный конец Icon")),
                            }
                        }
                    }
                    let (uuid, data) = match (uuid, data) {
                        (Some(uuid), Some(data)) => (uuid, data),
                        _ => {
                            warn!("custom icon without UUID or data skipped");
                            continue;
                        }
                    };
                    self.icons.insert(uuid, &data, false, self.ctx)?;
                    self.icons.acquire(&uuid)?;
                    meta.custom_icons.push(CustomIcon {
                        uuid,
                        name,
                        last_modification,
                    });
                }
                Tag::Open(_, content) => self.cursor.skip(content)?,
                Tag::Close => return Ok(()),
                Tag::Eof => return Err(malformed("неожиданный конец CustomIcons")),
            }
        }
    }

    /// Version 3 keeps the binary pool in `Meta/Binaries`.
    fn read_meta_binaries(&mut self, content: bool) -> Result<()> {
        if !content {
            return Ok(());
        }
        loop {
            match self.cursor.next_tag()? {
                Tag::Open(e, content) if e.name().as_ref() == b"Binary" => {
                    let id = attribute(&e, b"ID")?.ok_or_else(|| malformed("Binary без ID"))?;
                    let key = self.read_binary_payload(&e, content)?;
                    self.binary_refs.insert(id, key);
                }
                Tag::Open(_, content) => self.cursor.skip(content)?,
                Tag::Close => return Ok(()),
                Tag::Eof => return Err(malformed("неожиданный конец Binaries")),
            }
        }
    }

    /// Base64 payload, optionally protected by the inner stream and
    /// optionally gzip-compressed.
    fn read_binary_payload(&mut self, e: &BytesStart<'_>, content: bool) -> Result<u32> {
        let protected = attribute(e, b"Protected")?.map_or(false, |v| parse_bool(&v));
        let compressed = attribute(e, b"Compressed")?.map_or(false, |v| parse_bool(&v));
        let text = self.text(content)?;
        let mut data = STANDARD
            .decode(text.trim())
            .map_err(|err| malformed(format!("вложение: {}", err)))?;
        if protected {
            self.stream.process(&mut data);
        }
        if compressed {
            let mut plain = Vec::new();
            GzDecoder::new(data.as_slice())
                .read_to_end(&mut plain)
                .map_err(|err| malformed(format!("сжатое вложение: {}", err)))?;
            data = plain;
        }
        self.binaries.register_unreferenced(&data, protected, self.ctx)
    }

    fn read_root(&mut self, content: bool) -> Result<(Option<ParsedGroup>, Vec<DeletedObject>)> {
        let mut root = None;
        let mut deleted = Vec::new();
        if !content {
            return Ok((root, deleted));
        }
        loop {
            match self.cursor.next_tag()? {
                Tag::Open(e, content) => match e.name().as_ref() {
                    b"Group" if root.is_none() => root = Some(self.read_group(content)?),
                    b"DeletedObjects" => deleted = self.read_deleted_objects(content)?,
                    _ => self.cursor.skip(content)?,
                },
                Tag::Close => return Ok((root, deleted)),
                Tag::Eof => return Err(malformed("неожиданный конец Root")),
            }
        }
    }

    fn read_deleted_objects(&mut self, content: bool) -> Result<Vec<DeletedObject>> {
        let mut out = Vec::new();
        if !content {
            return Ok(out);
        }
        loop {
            match self.cursor.next_tag()? {
                Tag::Open(e, content) if e.name().as_ref() == b"DeletedObject" => {
                    let mut uuid = None;
                    let mut deletion_time = None;
                    if content {
                        loop {
                            match self.cursor.next_tag()? {
                                Tag::Open(e, content) => match e.name().as_ref() {
                                    b"UUID" => uuid = Some(parse_uuid(&self.text(content)?)?),
                                    b"DeletionTime" => deletion_time = Some(parse_date(&self.text(content)?)?),
                                    _ => self.cursor.skip(content)?,
                                },
                                Tag::Close => break,
                                Tag::Eof => return Err(malformed("неожиданный конец DeletedObject")),
                            }
                        }
                    }
                    if let (Some(uuid), Some(deletion_time)) = (uuid, deletion_time) {
                        out.push(DeletedObject { uuid, deletion_time });
                    }
                }
                Tag::Open(_, content) => self.cursor.skip(content)?,
                Tag::Close => return Ok(out),
                Tag::Eof => return Err(malformed("неожиданный конец DeletedObjects")),
            }
        }
    }

    fn read_times(&mut self, times: &mut Times, content: bool) -> Result<()> {
        if !content {
            return Ok(());
        }
        loop {
            match self.cursor.next_tag()? {
                Tag::Open(e, content) => match e.name().as_ref() {
                    b"CreationTime" => times.creation = parse_date(&self.text(content)?)?,
                    b"LastModificationTime" => times.last_modification = parse_date(&self.text(content)?)?,
                    b"LastAccessTime" => times.last_access = parse_date(&self.text(content)?)?,
                    b"ExpiryTime" => times.expiry = parse_date(&self.text(content)?)?,
                    b"Expires" => times.expires = parse_bool(&self.text(content)?),
                    b"UsageCount" => times.usage_count = parse_number(&self.text(content)?, "UsageCount")?,
                    b"LocationChanged" => times.location_changed = parse_date(&self.text(content)?)?,
                    _ => self.cursor.skip(content)?,
                },
                Tag::Close => return Ok(()),
                Tag::Eof => return Err(malformed("неожиданный конец Times")),
            }
        }
    }

    fn read_custom_data(&mut self, content: bool) -> Result<CustomData> {
        let mut data = CustomData::default();
        if !content {
            return Ok(data);
        }
        loop {
            match self.cursor.next_tag()? {
                Tag::Open(e, content) if e.name().as_ref() == b"Item" => {
                    let mut key = None;
                    let mut value = String::new();
                    let mut last_modification = None;
                    if content {
                        loop {
                            match self.cursor.next_tag()? {
                                Tag::Open(e, content) => match e.name().as_ref() {
                                    b"Key" => key = Some(self.text(content)?),
                                    b"Value" => value = self.text(content)?,
                                    b"LastModificationTime" => {
                                        last_modification = Some(parse_date(&self.text(content)?)?)
                                    }
                                    _ => self.cursor.skip(content)?,
                                },
                                Tag::Close => break,
                                Tag::Eof => return Err(malformed("неожиданный конец Item")),
                            }
                        }
                    }
                    if let Some(key) = key {
                        data.set(&key, &value, last_modification);
                    }
                }
                Tag::Open(_, content) => self.cursor.skip(content)?,
                Tag::Close => return Ok(data),
                Tag::Eof => return Err(malformed("неожиданный конец CustomData")),
            }
        }
    }

    fn read_group(&mut self, content: bool) -> Result<ParsedGroup> {
        let mut parsed = ParsedGroup {
            group: Group::new(""),
            entries: Vec::new(),
            groups: Vec::new(),
        };
        if !content {
            return Ok(parsed);
        }
        loop {
            let (e, content) = match self.cursor.next_tag()? {
                Tag::Open(e, content) => (e, content),
                Tag::Close => break,
                Tag::Eof => return Err(malformed("неожиданный конец Group")),
            };
            let group = &mut parsed.group;
            match e.name().as_ref() {
                b"UUID" => group.id = NodeId::Uuid(parse_uuid(&self.text(content)?)?),
                b"Name" => group.title = self.text(content)?,
                b"Notes" => group.notes = self.text(content)?,
                b"IconID" => group.icon.standard = parse_number(&self.text(content)?, "IconID")?,
                b"CustomIconUUID" => group.icon.custom = parse_optional_uuid(&self.text(content)?)?,
                b"Times" => self.read_times(&mut parsed.group.times, content)?,
                b"IsExpanded" => group.is_expanded = parse_bool(&self.text(content)?),
                b"DefaultAutoTypeSequence" => group.default_auto_type_sequence = self.text(content)?,
                b"EnableAutoType" => group.enable_auto_type = parse_tristate(&self.text(content)?),
                b"EnableSearching" => group.enable_searching = parse_tristate(&self.text(content)?),
                b"LastTopVisibleEntry" => group.last_top_visible_entry = parse_optional_uuid(&self.text(content)?)?,
                b"PreviousParentGroup" => group.previous_parent = parse_optional_uuid(&self.text(content)?)?,
                b"Tags" => group.tags = split_tags(&self.text(content)?),
                b"CustomData" => parsed.group.custom_data = self.read_custom_data(content)?,
                b"Entry" => {
                    let entry = self.read_entry(content, false)?;
                    parsed.entries.push(entry);
                }
                b"Group" => {
                    let child = self.read_group(content)?;
                    parsed.groups.push(child);
                }
                _ => {
                    debug!(element = %element_name(&e), "unknown Group element skipped");
                    self.cursor.skip(content)?
                }
            }
        }
        Ok(parsed)
    }

    fn read_entry(&mut self, content: bool, in_history: bool) -> Result<Entry> {
        let mut entry = Entry::new();
        if !content {
            return Ok(entry);
        }
        loop {
            let (e, content) = match self.cursor.next_tag()? {
                Tag::Open(e, content) => (e, content),
                Tag::Close => break,
                Tag::Eof => return Err(malformed("неожиданный конец Entry")),
            };
            match e.name().as_ref() {
                b"UUID" => entry.id = NodeId::Uuid(parse_uuid(&self.text(content)?)?),
                b"IconID" => entry.icon.standard = parse_number(&self.text(content)?, "IconID")?,
                b"CustomIconUUID" => entry.icon.custom = parse_optional_uuid(&self.text(content)?)?,
                b"ForegroundColor" => entry.foreground_color = self.text(content)?,
                b"BackgroundColor" => entry.background_color = self.text(content)?,
                b"OverrideURL" => entry.override_url = self.text(content)?,
                b"QualityCheck" => entry.quality_check = parse_bool(&self.text(content)?),
                b"Tags" => entry.tags = split_tags(&self.text(content)?),
                b"PreviousParentGroup" => entry.previous_parent = parse_optional_uuid(&self.text(content)?)?,
                b"Times" => self.read_times(&mut entry.times, content)?,
                b"String" => {
                    let (key, value) = self.read_string_field(content)?;
                    entry.set_value(&key, value);
                }
                b"Binary" => {
                    if let Some(attachment) = self.read_entry_binary(content)? {
                        entry.attachments.push(attachment);
                    }
                }
                b"AutoType" => self.read_auto_type(&mut entry, content)?,
                b"CustomData" => entry.custom_data = self.read_custom_data(content)?,
                b"History" if !in_history => entry.history = self.read_history(content)?,
                _ => {
                    debug!(element = %element_name(&e), "unknown Entry element skipped");
                    self.cursor.skip(content)?
                }
            }
        }
        Ok(entry)
    }

    fn read_history(&mut self, content: bool) -> Result<Vec<Entry>> {
        let mut history = Vec::new();
        if !content {
            return Ok(history);
        }
        loop {
            match self.cursor.next_tag()? {
                Tag::Open(e, content) if e.name().as_ref() == b"Entry" => {
                    history.push(self.read_entry(content, true)?);
                }
                Tag::Open(_, content) => self.cursor.skip(content)?,
                Tag::Close => return Ok(history),
                Tag::Eof => return Err(malformed("неожиданный конец History")),
            }
        }
    }

    fn read_string_field(&mut self, content: bool) -> Result<(String, ProtectedValue)> {
        let mut key = None;
        let mut value = ProtectedValue::default();
        if content {
            loop {
                match self.cursor.next_tag()? {
                    Tag::Open(e, content) => match e.name().as_ref() {
                        b"Key" => key = Some(self.text(content)?),
                        b"Value" => value = self.read_protected_value(&e, content)?,
                        _ => self.cursor.skip(content)?,
                    },
                    Tag::Close => break,
                    Tag::Eof => return Err(malformed("неожиданный конец String")),
                }
            }
        }
        let key = key.ok_or_else(|| malformed("String без Key"))?;
        Ok((key, value))
    }

    fn read_protected_value(&mut self, e: &BytesStart<'_>, content: bool) -> Result<ProtectedValue> {
        let protected = attribute(e, b"Protected")?.map_or(false, |v| parse_bool(&v));
        let in_memory = attribute(e, b"ProtectInMemory")?.map_or(false, |v| parse_bool(&v));
        let text = self.text(content)?;
        if !protected {
            return Ok(ProtectedValue::new(text, in_memory));
        }
        let mut bytes = STANDARD
            .decode(text.trim())
            .map_err(|err| malformed(format!("защищённое значение: {}", err)))?;
        self.stream.process(&mut bytes);
        let value = String::from_utf8(bytes).map_err(|_| malformed("защищённое значение не в UTF-8"))?;
        Ok(ProtectedValue::new(value, true))
    }

    fn read_entry_binary(&mut self, content: bool) -> Result<Option<Attachment>> {
        let mut name = None;
        let mut binary = None;
        if content {
            loop {
                match self.cursor.next_tag()? {
                    Tag::Open(e, content) => match e.name().as_ref() {
                        b"Key" => name = Some(self.text(content)?),
                        b"Value" => match attribute(&e, b"Ref")? {
                            Some(reference) => {
                                self.cursor.skip(content)?;
                                let key = self
                                    .binary_refs
                                    .get(&reference)
                                    .copied()
                                    .ok_or_else(|| malformed(format!("ссылка на отсутствующее вложение {}", reference)))?;
                                binary = Some(key);
                            }
                            None => binary = Some(self.read_binary_payload(&e, content)?),
                        },
                        _ => self.cursor.skip(content)?,
                    },
                    Tag::Close => break,
                    Tag::Eof => return Err(malformed("неожиданный конец Binary")),
                }
            }
        }
        Ok(match (name, binary) {
            (Some(name), Some(binary)) => Some(Attachment { name, binary }),
            _ => {
                warn!("entry attachment without name or value skipped");
                None
            }
        })
    }

    fn read_auto_type(&mut self, entry: &mut Entry, content: bool) -> Result<()> {
        if !content {
            return Ok(());
        }
        loop {
            match self.cursor.next_tag()? {
                Tag::Open(e, content) => match e.name().as_ref() {
                    b"Enabled" => entry.auto_type.enabled = parse_bool(&self.text(content)?),
                    b"DataTransferObfuscation" => {
                        entry.auto_type.obfuscation = parse_number(&self.text(content)?, "DataTransferObfuscation")?
                    }
                    b"DefaultSequence" => entry.auto_type.default_sequence = self.text(content)?,
                    b"Association" => {
                        let mut association = AutoTypeAssociation {
                            window: String::new(),
                            sequence: String::new(),
                        };
                        if content {
                            loop {
                                match self.cursor.next_tag()? {
                                    Tag::Open(e, content) => match e.name().as_ref() {
                                        b"Window" => association.window = self.text(content)?,
                                        b"KeystrokeSequence" => association.sequence = self.text(content)?,
                                        _ => self.cursor.skip(content)?,
                                    },
                                    Tag::Close => break,
                                    Tag::Eof => return Err(malformed("неожиданный конец Association")),
                                }
                            }
                        }
                        entry.auto_type.associations.push(association);
                    }
                    _ => self.cursor.skip(content)?,
                },
                Tag::Close => return Ok(()),
                Tag::Eof => return Err(malformed("неожиданный конец AutoType")),
            }
        }
    }
}
