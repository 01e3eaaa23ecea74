//! Identity, timestamps and icons shared by groups and entries.

use std::fmt;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::format::codec::{never_expires, now, uuid_hex};

pub type Timestamp = DateTime<Utc>;

/// Standard icons are indexed 0..=68.
pub const STANDARD_ICON_COUNT: u32 = 69;
pub const ICON_KEY: u32 = 0;
pub const ICON_FOLDER: u32 = 48;
pub const ICON_TRASH: u32 = 43;

/// Node identity: legacy groups use integers, everything else UUIDs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum NodeId {
    Int(u32),
    Uuid(Uuid),
}

impl NodeId {
    pub fn random() -> Self {
        NodeId::Uuid(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> Option<Uuid> {
        match self {
            NodeId::Uuid(u) => Some(*u),
            NodeId::Int(_) => None,
        }
    }

    pub fn as_int(&self) -> Option<u32> {
        match self {
            NodeId::Int(i) => Some(*i),
            NodeId::Uuid(_) => None,
        }
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeId::Int(i) => write!(f, "{}", i),
            NodeId::Uuid(u) => f.write_str(&uuid_hex(u)),
        }
    }
}

impl From<Uuid> for NodeId {
    fn from(u: Uuid) -> Self {
        NodeId::Uuid(u)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeKind {
    Group,
    Entry,
}

impl fmt::Display for NodeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeKind::Group => f.write_str("группы"),
            NodeKind::Entry => f.write_str("записи"),
        }
    }
}

/// A node address: kind plus id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeRef {
    Group(NodeId),
    Entry(NodeId),
}

impl NodeRef {
    pub fn id(&self) -> NodeId {
        match self {
            NodeRef::Group(id) | NodeRef::Entry(id) => *id,
        }
    }

    pub fn kind(&self) -> NodeKind {
        match self {
            NodeRef::Group(_) => NodeKind::Group,
            NodeRef::Entry(_) => NodeKind::Entry,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Times {
    pub creation: Timestamp,
    pub last_modification: Timestamp,
    pub last_access: Timestamp,
    pub expiry: Timestamp,
    pub expires: bool,
    pub usage_count: u64,
    pub location_changed: Timestamp,
}

impl Times {
    pub fn now() -> Self {
        let t = now();
        Self {
            creation: t,
            last_modification: t,
            last_access: t,
            expiry: never_expires(),
            expires: false,
            usage_count: 0,
            location_changed: t,
        }
    }

    pub fn touch(&mut self, modified: bool) {
        let t = now();
        self.last_access = t;
        if modified {
            self.last_modification = t;
        }
        self.usage_count = self.usage_count.saturating_add(1);
    }

    pub fn is_expired_at(&self, at: &Timestamp) -> bool {
        self.expires && self.expiry <= *at
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(&now())
    }
}

impl Default for Times {
    fn default() -> Self {
        Self::now()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct NodeIcon {
    pub standard: u32,
    pub custom: Option<Uuid>,
}

impl NodeIcon {
    pub fn standard(index: u32) -> Self {
        Self {
            standard: index.min(STANDARD_ICON_COUNT - 1),
            custom: None,
        }
    }
}

/// Free-form key/value pairs attached to the database, groups and entries.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CustomData {
    items: Vec<CustomDataItem>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CustomDataItem {
    pub key: String,
    pub value: String,
    pub last_modification: Option<Timestamp>,
}

impl CustomData {
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.items.iter().find(|i| i.key == key).map(|i| i.value.as_str())
    }

    pub fn set(&mut self, key: &str, value: &str, last_modification: Option<Timestamp>) {
        match self.items.iter_mut().find(|i| i.key == key) {
            Some(item) => {
                item.value = value.to_string();
                item.last_modification = last_modification;
            }
            None => self.items.push(CustomDataItem {
                key: key.to_string(),
                value: value.to_string(),
                last_modification,
            }),
        }
    }

    pub fn remove(&mut self, key: &str) -> Option<CustomDataItem> {
        let pos = self.items.iter().position(|i| i.key == key)?;
        Some(self.items.remove(pos))
    }

    pub fn iter(&self) -> impl Iterator<Item = &CustomDataItem> {
        self.items.iter()
    }

    pub fn has_timestamps(&self) -> bool {
        self.items.iter().any(|i| i.last_modification.is_some())
    }

    pub fn estimated_size(&self) -> u64 {
        self.items
            .iter()
            .map(|i| (i.key.len() + i.value.len()) as u64)
            .sum()
    }
}
