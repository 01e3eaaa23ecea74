//! Password entries and their history snapshots.

use std::collections::BTreeMap;
use std::fmt;

use uuid::Uuid;
use zeroize::Zeroizing;

use super::binary::BinaryPool;
use super::node::{CustomData, NodeIcon, NodeId, Times, ICON_KEY};

pub const TITLE: &str = "Title";
pub const USERNAME: &str = "UserName";
pub const PASSWORD: &str = "Password";
pub const URL: &str = "URL";
pub const NOTES: &str = "Notes";

pub const STANDARD_FIELDS: [&str; 5] = [TITLE, USERNAME, PASSWORD, URL, NOTES];

/// Fixed overhead counted for every entry when sizing history.
const ENTRY_BASE_SIZE: u64 = 128;

pub fn is_standard_field(key: &str) -> bool {
    STANDARD_FIELDS.contains(&key)
}

/// A string value that may be memory-protected inside the document.
#[derive(Clone, Default)]
pub struct ProtectedValue {
    value: Zeroizing<String>,
    protected: bool,
}

impl ProtectedValue {
    pub fn new(value: impl Into<String>, protected: bool) -> Self {
        Self {
            value: Zeroizing::new(value.into()),
            protected,
        }
    }

    pub fn as_str(&self) -> &str {
        self.value.as_str()
    }

    pub fn is_protected(&self) -> bool {
        self.protected
    }

    pub fn set_protected(&mut self, protected: bool) {
        self.protected = protected;
    }

    pub fn len(&self) -> usize {
        self.value.len()
    }

    pub fn is_empty(&self) -> bool {
        self.value.is_empty()
    }
}

impl PartialEq for ProtectedValue {
    fn eq(&self, other: &Self) -> bool {
        self.protected == other.protected && self.value.as_str() == other.value.as_str()
    }
}

impl Eq for ProtectedValue {}

impl fmt::Debug for ProtectedValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.protected {
            write!(f, "ProtectedValue([REDACTED; {}])", self.value.len())
        } else {
            write!(f, "ProtectedValue({:?})", self.value.as_str())
        }
    }
}

/// A named reference into the attachment pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attachment {
    pub name: String,
    pub binary: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AutoTypeAssociation {
    pub window: String,
    pub sequence: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AutoType {
    pub enabled: bool,
    pub obfuscation: u32,
    pub default_sequence: String,
    pub associations: Vec<AutoTypeAssociation>,
}

impl Default for AutoType {
    fn default() -> Self {
        Self {
            enabled: true,
            obfuscation: 0,
            default_sequence: String::new(),
            associations: Vec::new(),
        }
    }
}

impl AutoType {
    fn estimated_size(&self) -> u64 {
        let associations: usize = self
            .associations
            .iter()
            .map(|a| a.window.len() + a.sequence.len())
            .sum();
        (self.default_sequence.len() + associations) as u64
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    pub id: NodeId,
    pub parent: Option<NodeId>,
    pub icon: NodeIcon,
    pub times: Times,
    fields: BTreeMap<String, ProtectedValue>,
    pub attachments: Vec<Attachment>,
    pub tags: Vec<String>,
    pub custom_data: CustomData,
    pub foreground_color: String,
    pub background_color: String,
    pub override_url: String,
    pub quality_check: bool,
    pub auto_type: AutoType,
    pub history: Vec<Entry>,
    pub previous_parent: Option<Uuid>,
}

impl Entry {
    pub fn new() -> Self {
        Self::with_id(NodeId::random())
    }

    pub fn with_id(id: NodeId) -> Self {
        Self {
            id,
            parent: None,
            icon: NodeIcon::standard(ICON_KEY),
            times: Times::now(),
            fields: BTreeMap::new(),
            attachments: Vec::new(),
            tags: Vec::new(),
            custom_data: CustomData::default(),
            foreground_color: String::new(),
            background_color: String::new(),
            override_url: String::new(),
            quality_check: true,
            auto_type: AutoType::default(),
            history: Vec::new(),
            previous_parent: None,
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.fields.get(key).map(|v| v.as_str())
    }

    pub fn field(&self, key: &str) -> Option<&ProtectedValue> {
        self.fields.get(key)
    }

    pub fn set(&mut self, key: &str, value: impl Into<String>, protected: bool) {
        self.fields
            .insert(key.to_string(), ProtectedValue::new(value, protected));
    }

    pub fn set_value(&mut self, key: &str, value: ProtectedValue) {
        self.fields.insert(key.to_string(), value);
    }

    pub fn remove_field(&mut self, key: &str) -> Option<ProtectedValue> {
        self.fields.remove(key)
    }

    pub fn fields(&self) -> impl Iterator<Item = (&str, &ProtectedValue)> {
        self.fields.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Non-standard fields, in key order.
    pub fn custom_fields(&self) -> impl Iterator<Item = (&str, &ProtectedValue)> {
        self.fields().filter(|(k, _)| !is_standard_field(k))
    }

    pub fn title(&self) -> &str {
        self.get(TITLE).unwrap_or_default()
    }

    pub fn username(&self) -> &str {
        self.get(USERNAME).unwrap_or_default()
    }

    pub fn password(&self) -> &str {
        self.get(PASSWORD).unwrap_or_default()
    }

    pub fn url(&self) -> &str {
        self.get(URL).unwrap_or_default()
    }

    pub fn notes(&self) -> &str {
        self.get(NOTES).unwrap_or_default()
    }

    pub fn set_title(&mut self, title: &str) {
        self.set(TITLE, title, false);
    }

    pub fn set_username(&mut self, username: &str) {
        self.set(USERNAME, username, false);
    }

    pub fn set_password(&mut self, password: &str) {
        self.set(PASSWORD, password, true);
    }

    pub fn set_url(&mut self, url: &str) {
        self.set(URL, url, false);
    }

    pub fn set_notes(&mut self, notes: &str) {
        self.set(NOTES, notes, false);
    }

    pub fn attachment(&self, name: &str) -> Option<&Attachment> {
        self.attachments.iter().find(|a| a.name == name)
    }

    pub fn is_expired(&self) -> bool {
        self.times.is_expired()
    }

    /// Copy of the current state suitable for the history list.
    pub fn snapshot(&self) -> Entry {
        let mut copy = self.clone();
        copy.parent = None;
        copy.history.clear();
        copy
    }

    /// Every attachment key this entry and its history point at, once per
    /// reference.
    pub fn attachment_refs(&self) -> impl Iterator<Item = u32> + '_ {
        self.attachments
            .iter()
            .map(|a| a.binary)
            .chain(self.history.iter().flat_map(|h| h.attachments.iter().map(|a| a.binary)))
    }

    /// Approximate in-memory size, used to bound history.
    pub fn estimated_size(&self, binaries: &BinaryPool<u32>) -> u64 {
        let mut size = ENTRY_BASE_SIZE;
        for (key, value) in &self.fields {
            size += (key.len() + value.len()) as u64;
        }
        for attachment in &self.attachments {
            size += attachment.name.len() as u64;
            size += binaries.get(&attachment.binary).map_or(0, |b| b.len());
        }
        size += self.tags.iter().map(|t| t.len() as u64).sum::<u64>();
        size += self.override_url.len() as u64;
        size += self.custom_data.estimated_size();
        size += self.auto_type.estimated_size();
        size
    }
}

impl Default for Entry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::EngineContext;

    #[test]
    fn test_standard_accessors() {
        let mut entry = Entry::new();
        entry.set_title("Example");
        entry.set_username("user");
        entry.set_password("pass");
        assert_eq!(entry.title(), "Example");
        assert_eq!(entry.username(), "user");
        assert_eq!(entry.password(), "pass");
        assert_eq!(entry.url(), "");
        assert!(entry.field(PASSWORD).unwrap().is_protected());
        assert_eq!(entry.custom_fields().count(), 0);

        entry.set("Pin", "1234", true);
        let custom: Vec<_> = entry.custom_fields().map(|(k, _)| k).collect();
        assert_eq!(custom, vec!["Pin"]);
    }

    #[test]
    fn test_protected_debug_is_redacted() {
        let value = ProtectedValue::new("hunter2", true);
        let shown = format!("{:?}", value);
        assert!(!shown.contains("hunter2"));
        let plain = ProtectedValue::new("visible", false);
        assert!(format!("{:?}", plain).contains("visible"));
    }

    #[test]
    fn test_snapshot_drops_history_and_parent() {
        let mut entry = Entry::new();
        entry.parent = Some(NodeId::random());
        entry.history.push(entry.snapshot());
        let snap = entry.snapshot();
        assert!(snap.history.is_empty());
        assert!(snap.parent.is_none());
        assert_eq!(snap.id, entry.id);
    }

    #[test]
    fn test_estimated_size_counts_attachment_payload() {
        let ctx = EngineContext::new();
        let mut pool = BinaryPool::new();
        let key = pool.register(&[0u8; 1000], false, &ctx).unwrap();

        let mut entry = Entry::new();
        let base = entry.estimated_size(&pool);
        assert_eq!(base, ENTRY_BASE_SIZE);
        entry.attachments.push(Attachment {
            name: "a.bin".into(),
            binary: key,
        });
        assert_eq!(entry.estimated_size(&pool), base + 5 + 1000);
    }
}
