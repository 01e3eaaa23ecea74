use std::collections::HashMap;
use std::io::Write as _;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use flate2::write::GzEncoder;
use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};
use quick_xml::Writer;
use uuid::Uuid;

use super::{format_bool, format_date, format_tristate, format_uuid, join_tags};
use crate::crypto::InnerStream;
use crate::error::Result;
use crate::format::header::{is_v4, VERSION_4_1};
use crate::tree::{Compression, CustomData, Database, Entry, Group, NodeId, ProtectedValue, Times, Timestamp};

/// Serializes `db` as the XML document of a `version` file.
///
/// `binary_order` lists pool keys in the order the `Ref` attributes index
/// them. Before version 4 the payloads are written into `Meta/Binaries`;
/// from version 4 on they travel in the inner header.
pub fn write_document(
    db: &Database,
    version: u32,
    stream: &mut InnerStream,
    binary_order: &[u32],
    header_hash: Option<&[u8]>,
) -> Result<Vec<u8>> {
    let mut writer = DocumentWriter {
        xml: Writer::new_with_indent(Vec::new(), b'\t', 1),
        db,
        version,
        stream,
        binary_refs: binary_order.iter().enumerate().map(|(i, key)| (*key, i)).collect(),
    };
    writer
        .xml
        .write_event(Event::Decl(BytesDecl::new("1.0", Some("utf-8"), Some("yes"))))?;
    writer.open("KeePassFile")?;
    writer.write_meta(binary_order, header_hash)?;
    writer.open("Root")?;
    writer.write_group(&db.root_id())?;
    writer.write_deleted_objects()?;
    writer.close("Root")?;
    writer.close("KeePassFile")?;
    Ok(writer.xml.into_inner())
}

fn node_uuid(id: &NodeId) -> Uuid {
    match id {
        NodeId::Uuid(u) => *u,
        NodeId::Int(i) => Uuid::from_u128(u128::from(*i)),
    }
}

struct DocumentWriter<'a> {
    xml: Writer<Vec<u8>>,
    db: &'a Database,
    version: u32,
    stream: &'a mut InnerStream,
    binary_refs: HashMap<u32, usize>,
}

impl<'a> DocumentWriter<'a> {
    fn open(&mut self, name: &str) -> Result<()> {
        self.xml.write_event(Event::Start(BytesStart::new(name)))?;
        Ok(())
    }

    fn close(&mut self, name: &str) -> Result<()> {
        self.xml.write_event(Event::End(BytesEnd::new(name)))?;
        Ok(())
    }

    fn element(&mut self, start: BytesStart<'_>, text: &str) -> Result<()> {
        if text.is_empty() {
            self.xml.write_event(Event::Empty(start))?;
        } else {
            let end = start.to_end().into_owned();
            self.xml.write_event(Event::Start(start))?;
            self.xml.write_event(Event::Text(BytesText::new(text)))?;
            self.xml.write_event(Event::End(end))?;
        }
        Ok(())
    }

    fn text(&mut self, name: &str, text: &str) -> Result<()> {
        self.element(BytesStart::new(name), text)
    }

    fn flag(&mut self, name: &str, value: bool) -> Result<()> {
        self.text(name, format_bool(value))
    }

    fn number(&mut self, name: &str, value: impl ToString) -> Result<()> {
        self.text(name, &value.to_string())
    }

    fn date(&mut self, name: &str, t: &Timestamp) -> Result<()> {
        let text = format_date(t, self.version);
        self.text(name, &text)
    }

    fn uuid(&mut self, name: &str, id: Option<Uuid>) -> Result<()> {
        self.text(name, &format_uuid(&id.unwrap_or_else(Uuid::nil)))
    }

    fn is_v4_1(&self) -> bool {
        self.version >= VERSION_4_1
    }

    fn write_meta(&mut self, binary_order: &[u32], header_hash: Option<&[u8]>) -> Result<()> {
        let db = self.db;
        let meta = &db.meta;
        self.open("Meta")?;
        self.text("Generator", &meta.generator)?;
        if let Some(hash) = header_hash.filter(|_| !is_v4(self.version)) {
            self.text("HeaderHash", &STANDARD.encode(hash))?;
        }
        if is_v4(self.version) {
            if let Some(t) = &meta.settings_changed {
                self.date("SettingsChanged", t)?;
            }
        }
        self.text("DatabaseName", &meta.name)?;
        self.date("DatabaseNameChanged", &meta.name_changed)?;
        self.text("DatabaseDescription", &meta.description)?;
        self.date("DatabaseDescriptionChanged", &meta.description_changed)?;
        self.text("DefaultUserName", &meta.default_username)?;
        self.date("DefaultUserNameChanged", &meta.default_username_changed)?;
        self.number("MaintenanceHistoryDays", meta.maintenance_history_days)?;
        self.text("Color", &meta.color)?;
        self.date("MasterKeyChanged", &meta.master_key_changed)?;
        self.number("MasterKeyChangeRec", meta.master_key_change_rec)?;
        self.number("MasterKeyChangeForce", meta.master_key_change_force)?;
        if meta.master_key_change_force_once {
            self.flag("MasterKeyChangeForceOnce", true)?;
        }

        let protection = &meta.memory_protection;
        self.open("MemoryProtection")?;
        self.flag("ProtectTitle", protection.title)?;
        self.flag("ProtectUserName", protection.username)?;
        self.flag("ProtectPassword", protection.password)?;
        self.flag("ProtectURL", protection.url)?;
        self.flag("ProtectNotes", protection.notes)?;
        self.close("MemoryProtection")?;

        if !meta.custom_icons.is_empty() {
            self.open("CustomIcons")?;
            for icon in &meta.custom_icons {
                let data = match db.icons.data(&icon.uuid) {
                    Ok(data) => data,
                    Err(_) => continue,
                };
                self.open("Icon")?;
                self.uuid("UUID", Some(icon.uuid))?;
                self.text("Data", &STANDARD.encode(&*data))?;
                if self.is_v4_1() {
                    if !icon.name.is_empty() {
                        self.text("Name", &icon.name)?;
                    }
                    if let Some(t) = &icon.last_modification {
                        self.date("LastModificationTime", t)?;
                    }
                }
                self.close("Icon")?;
            }
            self.close("CustomIcons")?;
        }

        self.flag("RecycleBinEnabled", meta.recycle_bin_enabled)?;
        self.uuid("RecycleBinUUID", meta.recycle_bin.as_ref().map(node_uuid))?;
        self.date("RecycleBinChanged", &meta.recycle_bin_changed)?;
        self.uuid("EntryTemplatesGroup", meta.entry_templates_group.as_ref().map(node_uuid))?;
        self.date("EntryTemplatesGroupChanged", &meta.entry_templates_group_changed)?;
        self.number("HistoryMaxItems", meta.history.max_items)?;
        self.number("HistoryMaxSize", meta.history.max_size)?;
        self.uuid("LastSelectedGroup", meta.last_selected_group)?;
        self.uuid("LastTopVisibleGroup", meta.last_top_visible_group)?;

        if !is_v4(self.version) && !binary_order.is_empty() {
            self.write_meta_binaries(binary_order)?;
        }
        self.write_custom_data(&meta.custom_data)?;
        self.close("Meta")
    }

    fn write_meta_binaries(&mut self, binary_order: &[u32]) -> Result<()> {
        let compress = self.db.crypto.compression == Compression::Gzip;
        self.open("Binaries")?;
        for (index, key) in binary_order.iter().enumerate() {
            let binary = self.db.binaries.data(key)?;
            let protected = self.db.binaries.get(key).map_or(false, |b| b.is_protected());
            let mut payload = if compress {
                let mut encoder = GzEncoder::new(Vec::new(), flate2::Compression::default());
                encoder.write_all(&binary)?;
                encoder.finish()?
            } else {
                binary.to_vec()
            };
            if protected {
                self.stream.process(&mut payload);
            }
            let id = index.to_string();
            let mut start = BytesStart::new("Binary");
            start.push_attribute(("ID", id.as_str()));
            if protected {
                start.push_attribute(("Protected", "True"));
            }
            if compress {
                start.push_attribute(("Compressed", "True"));
            }
            self.element(start, &STANDARD.encode(&payload))?;
        }
        self.close("Binaries")
    }

    fn write_custom_data(&mut self, data: &CustomData) -> Result<()> {
        if data.is_empty() {
            return Ok(());
        }
        self.open("CustomData")?;
        for item in data.iter() {
            self.open("Item")?;
            self.text("Key", &item.key)?;
            self.text("Value", &item.value)?;
            if self.is_v4_1() {
                if let Some(t) = &item.last_modification {
                    self.date("LastModificationTime", t)?;
                }
            }
            self.close("Item")?;
        }
        self.close("CustomData")
    }

    fn write_times(&mut self, times: &Times) -> Result<()> {
        self.open("Times")?;
        self.date("CreationTime", &times.creation)?;
        self.date("LastModificationTime", &times.last_modification)?;
        self.date("LastAccessTime", &times.last_access)?;
        self.date("ExpiryTime", &times.expiry)?;
        self.flag("Expires", times.expires)?;
        self.number("UsageCount", times.usage_count)?;
        self.date("LocationChanged", &times.location_changed)?;
        self.close("Times")
    }

    fn write_group(&mut self, id: &NodeId) -> Result<()> {
        let db = self.db;
        let group: &Group = match db.group(id) {
            Some(group) => group,
            None => return Ok(()),
        };
        self.open("Group")?;
        self.uuid("UUID", Some(node_uuid(&group.id)))?;
        self.text("Name", &group.title)?;
        self.text("Notes", &group.notes)?;
        self.number("IconID", group.icon.standard)?;
        if group.icon.custom.is_some() {
            self.uuid("CustomIconUUID", group.icon.custom)?;
        }
        self.write_times(&group.times)?;
        self.flag("IsExpanded", group.is_expanded)?;
        self.text("DefaultAutoTypeSequence", &group.default_auto_type_sequence)?;
        self.text("EnableAutoType", format_tristate(group.enable_auto_type))?;
        self.text("EnableSearching", format_tristate(group.enable_searching))?;
        self.uuid("LastTopVisibleEntry", group.last_top_visible_entry)?;
        if self.is_v4_1() {
            if !group.tags.is_empty() {
                self.text("Tags", &join_tags(&group.tags))?;
            }
            if group.previous_parent.is_some() {
                self.uuid("PreviousParentGroup", group.previous_parent)?;
            }
        }
        if is_v4(self.version) {
            self.write_custom_data(&group.custom_data)?;
        }
        for entry in &group.entries {
            if let Some(entry) = db.entry(entry) {
                self.write_entry(entry, true)?;
            }
        }
        for child in &group.groups {
            self.write_group(child)?;
        }
        self.close("Group")
    }

    fn write_entry(&mut self, entry: &Entry, with_history: bool) -> Result<()> {
        self.open("Entry")?;
        self.uuid("UUID", Some(node_uuid(&entry.id)))?;
        self.number("IconID", entry.icon.standard)?;
        if entry.icon.custom.is_some() {
            self.uuid("CustomIconUUID", entry.icon.custom)?;
        }
        self.text("ForegroundColor", &entry.foreground_color)?;
        self.text("BackgroundColor", &entry.background_color)?;
        self.text("OverrideURL", &entry.override_url)?;
        if self.is_v4_1() {
            if !entry.quality_check {
                self.flag("QualityCheck", false)?;
            }
            if entry.previous_parent.is_some() {
                self.uuid("PreviousParentGroup", entry.previous_parent)?;
            }
        }
        self.text("Tags", &join_tags(&entry.tags))?;
        self.write_times(&entry.times)?;

        for (key, value) in entry.fields() {
            self.open("String")?;
            self.text("Key", key)?;
            self.write_protected_value(value)?;
            self.close("String")?;
        }

        for attachment in &entry.attachments {
            let index = match self.binary_refs.get(&attachment.binary) {
                Some(index) => index.to_string(),
                None => continue,
            };
            self.open("Binary")?;
            self.text("Key", &attachment.name)?;
            let mut value = BytesStart::new("Value");
            value.push_attribute(("Ref", index.as_str()));
            self.xml.write_event(Event::Empty(value))?;
            self.close("Binary")?;
        }

        let auto_type = &entry.auto_type;
        self.open("AutoType")?;
        self.flag("Enabled", auto_type.enabled)?;
        self.number("DataTransferObfuscation", auto_type.obfuscation)?;
        if !auto_type.default_sequence.is_empty() {
            self.text("DefaultSequence", &auto_type.default_sequence)?;
        }
        for association in &auto_type.associations {
            self.open("Association")?;
            self.text("Window", &association.window)?;
            self.text("KeystrokeSequence", &association.sequence)?;
            self.close("Association")?;
        }
        self.close("AutoType")?;

        if is_v4(self.version) {
            self.write_custom_data(&entry.custom_data)?;
        }

        if with_history {
            self.open("History")?;
            for snapshot in &entry.history {
                self.write_entry(snapshot, false)?;
            }
            self.close("History")?;
        }
        self.close("Entry")
    }

    fn write_protected_value(&mut self, value: &ProtectedValue) -> Result<()> {
        let mut start = BytesStart::new("Value");
        if !value.is_protected() {
            return self.element(start, value.as_str());
        }
        let mut bytes = value.as_str().as_bytes().to_vec();
        self.stream.process(&mut bytes);
        start.push_attribute(("Protected", "True"));
        let encoded = STANDARD.encode(&bytes);
        bytes.iter_mut().for_each(|b| *b = 0);
        self.element(start, &encoded)
    }

    fn write_deleted_objects(&mut self) -> Result<()> {
        let db = self.db;
        if db.deleted_objects.is_empty() {
            self.xml.write_event(Event::Empty(BytesStart::new("DeletedObjects")))?;
            return Ok(());
        }
        self.open("DeletedObjects")?;
        for object in &db.deleted_objects {
            self.open("DeletedObject")?;
            self.uuid("UUID", Some(object.uuid))?;
            self.date("DeletionTime", &object.deletion_time)?;
            self.close("DeletedObject")?;
        }
        self.close("DeletedObjects")
    }
}

#[cfg(test)]
mod tests {
    use super::super::read_document;
    use super::*;
    use crate::context::EngineContext;
    use crate::crypto::InnerStreamKind;
    use crate::format::header::{VERSION_3_1, VERSION_4, VERSION_4_1};
    use crate::format::DuplicateIdPolicy;
    use crate::tree::{BinaryPool, Group};

    fn sample(ctx: &EngineContext) -> Database {
        let mut db = Database::new("Документы");
        db.meta.description = "a & b <c>".into();
        let root = db.root_id();
        let web = db.add_group(&root, Group::new("Web")).unwrap();
        let mut e = Entry::new();
        e.set_title("Mail");
        e.set_username("alice");
        e.set_password("p@ss\u{00e9}");
        e.set("Custom", "value", false);
        e.set("PIN", "1234", true);
        e.tags = vec!["work".into(), "mail".into()];
        let id = db.add_entry(&web, e).unwrap();
        db.push_history(&id).unwrap();
        db.entry_mut(&id).unwrap().set_password("changed");
        db.add_attachment(&id, "note.txt", b"attachment body", false, ctx).unwrap();
        db
    }

    fn round_trip(db: &Database, version: u32) -> Database {
        let ctx = EngineContext::default();
        let key = vec![3u8; 64];
        let order: Vec<u32> = db.binaries.keys().copied().collect();
        let mut out_stream = InnerStream::new(InnerStreamKind::ChaCha20, &key).unwrap();
        let xml = write_document(db, version, &mut out_stream, &order, None).unwrap();

        let mut pool = BinaryPool::new();
        let mut refs = Vec::new();
        if is_v4(version) {
            for key in &order {
                let data = db.binaries.data(key).unwrap();
                refs.push(pool.register_unreferenced(&data, false, &ctx).unwrap());
            }
        }
        let mut in_stream = InnerStream::new(InnerStreamKind::ChaCha20, &key).unwrap();
        read_document(&xml, &mut in_stream, pool, &refs, DuplicateIdPolicy::Fail, &ctx)
            .unwrap()
            .database
    }

    fn only_entry(db: &Database) -> &Entry {
        db.entries().next().unwrap()
    }

    #[test]
    fn test_document_round_trip_all_versions() {
        let ctx = EngineContext::default();
        let db = sample(&ctx);
        for version in [VERSION_3_1, VERSION_4, VERSION_4_1] {
            let back = round_trip(&db, version);
            assert_eq!(back.meta.name, "Документы");
            assert_eq!(back.meta.description, "a & b <c>");
            assert_eq!(back.group_count(), db.group_count());

            let original = only_entry(&db);
            let entry = only_entry(&back);
            assert_eq!(entry.id, original.id);
            assert_eq!(entry.password(), "changed");
            assert!(entry.field("PIN").unwrap().is_protected());
            assert_eq!(entry.get("Custom"), Some("value"));
            assert_eq!(entry.tags, original.tags);
            assert_eq!(entry.history.len(), 1);
            assert_eq!(entry.history[0].password(), "p@ss\u{00e9}");
            assert_eq!(entry.times.creation.timestamp(), original.times.creation.timestamp());

            let attachment = entry.attachment("note.txt").unwrap();
            let data = back.binaries.data(&attachment.binary).unwrap();
            assert_eq!(&*data, b"attachment body");
        }
    }

    #[test]
    fn test_protected_values_are_not_plain_text() {
        let ctx = EngineContext::default();
        let db = sample(&ctx);
        let order: Vec<u32> = db.binaries.keys().copied().collect();
        let mut stream = InnerStream::new(InnerStreamKind::ChaCha20, &[9u8; 64]).unwrap();
        let xml = write_document(&db, VERSION_4, &mut stream, &order, None).unwrap();
        let text = String::from_utf8(xml).unwrap();
        assert!(text.contains("Protected=\"True\""));
        assert!(!text.contains("changed"));
        assert!(text.contains("alice"));
        assert!(text.contains("<Value Ref=\"0\"/>"));
    }

    #[test]
    fn test_version_3_embeds_binaries_in_meta() {
        let ctx = EngineContext::default();
        let db = sample(&ctx);
        let order: Vec<u32> = db.binaries.keys().copied().collect();
        let mut stream = InnerStream::new(InnerStreamKind::ChaCha20, &[1u8; 64]).unwrap();
        let xml = write_document(&db, VERSION_3_1, &mut stream, &order, Some(&[0xAB; 32])).unwrap();
        let text = String::from_utf8(xml).unwrap();
        assert!(text.contains("<Binaries>"));
        assert!(text.contains("Compressed=\"True\""));
        assert!(text.contains("<HeaderHash>"));
        assert!(!text.contains("<SettingsChanged>"));
    }
}
