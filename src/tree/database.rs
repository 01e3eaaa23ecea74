//! The open database: a group/entry arena plus metadata and pools
//!
//! Groups and entries live in maps keyed by [`NodeId`] and link to each
//! other by id, so parent pointers never form reference cycles. Every
//! editing operation checks the read-only flag first and keeps the
//! attachment reference counts in step with the attachment records held by
//! entries and their history.

use std::collections::HashMap;

use tracing::{debug, warn};
use uuid::Uuid;

use super::binary::BinaryPool;
use super::entry::{Attachment, Entry};
use super::group::Group;
use super::node::{CustomData, NodeId, NodeKind, NodeRef, Timestamp, ICON_TRASH};
use crate::context::EngineContext;
use crate::crypto::kdf::aes;
use crate::crypto::engine::AES256_UUID;
use crate::crypto::{InnerStreamKind, KdfParameters, SecureBytes};
use crate::error::{DatabaseError, Result};
use crate::format::codec::now;
use crate::format::variant::VariantDictionary;

/// Id of the implicit root that legacy databases never persist. Legacy
/// groups carry integer ids, so the nil UUID cannot clash with one.
pub const LEGACY_ROOT_ID: NodeId = NodeId::Uuid(Uuid::nil());

pub const RECYCLE_BIN_TITLE: &str = "Recycle Bin";

pub const DEFAULT_HISTORY_MAX_ITEMS: i32 = 10;
pub const DEFAULT_HISTORY_MAX_SIZE: i64 = 6 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FormatGeneration {
    /// KDB: fixed binary header and records.
    Legacy,
    /// KDBX 3.1 and 4.x.
    Current,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compression {
    None,
    Gzip,
}

impl Compression {
    pub fn from_id(id: u32) -> Result<Self> {
        match id {
            0 => Ok(Compression::None),
            1 => Ok(Compression::Gzip),
            other => Err(DatabaseError::UnsupportedAlgorithm(format!("сжатие {}", other))),
        }
    }

    pub fn id(self) -> u32 {
        match self {
            Compression::None => 0,
            Compression::Gzip => 1,
        }
    }
}

/// Envelope settings: what the body is encrypted and derived with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CryptoSettings {
    pub cipher: Uuid,
    pub kdf: KdfParameters,
    pub compression: Compression,
    pub inner_stream: InnerStreamKind,
    /// Version the file was read with; saving picks the lowest version able
    /// to hold the tree.
    pub version: u32,
    pub public_custom_data: VariantDictionary,
}

impl Default for CryptoSettings {
    fn default() -> Self {
        Self {
            cipher: AES256_UUID,
            kdf: aes::parameters(aes::DEFAULT_ROUNDS),
            compression: Compression::Gzip,
            inner_stream: InnerStreamKind::ChaCha20,
            version: 0,
            public_custom_data: VariantDictionary::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryProtection {
    pub title: bool,
    pub username: bool,
    pub password: bool,
    pub url: bool,
    pub notes: bool,
}

impl Default for MemoryProtection {
    fn default() -> Self {
        Self {
            title: false,
            username: false,
            password: true,
            url: false,
            notes: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CustomIcon {
    pub uuid: Uuid,
    pub name: String,
    pub last_modification: Option<Timestamp>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeletedObject {
    pub uuid: Uuid,
    pub deletion_time: Timestamp,
}

/// History bounds; a negative value means unlimited.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HistoryLimits {
    pub max_items: i32,
    pub max_size: i64,
}

impl Default for HistoryLimits {
    fn default() -> Self {
        Self {
            max_items: DEFAULT_HISTORY_MAX_ITEMS,
            max_size: DEFAULT_HISTORY_MAX_SIZE,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Meta {
    pub generator: String,
    pub settings_changed: Option<Timestamp>,
    pub name: String,
    pub name_changed: Timestamp,
    pub description: String,
    pub description_changed: Timestamp,
    pub default_username: String,
    pub default_username_changed: Timestamp,
    pub maintenance_history_days: u32,
    pub color: String,
    pub master_key_changed: Timestamp,
    pub master_key_change_rec: i64,
    pub master_key_change_force: i64,
    pub master_key_change_force_once: bool,
    pub memory_protection: MemoryProtection,
    pub custom_icons: Vec<CustomIcon>,
    pub recycle_bin_enabled: bool,
    pub recycle_bin: Option<NodeId>,
    pub recycle_bin_changed: Timestamp,
    pub entry_templates_group: Option<NodeId>,
    pub entry_templates_group_changed: Timestamp,
    pub history: HistoryLimits,
    pub last_selected_group: Option<Uuid>,
    pub last_top_visible_group: Option<Uuid>,
    pub custom_data: CustomData,
}

impl Default for Meta {
    fn default() -> Self {
        let t = now();
        Self {
            generator: env!("CARGO_PKG_NAME").to_string(),
            settings_changed: Some(t),
            name: String::new(),
            name_changed: t,
            description: String::new(),
            description_changed: t,
            default_username: String::new(),
            default_username_changed: t,
            maintenance_history_days: 365,
            color: String::new(),
            master_key_changed: t,
            master_key_change_rec: -1,
            master_key_change_force: -1,
            master_key_change_force_once: false,
            memory_protection: MemoryProtection::default(),
            custom_icons: Vec::new(),
            recycle_bin_enabled: true,
            recycle_bin: None,
            recycle_bin_changed: t,
            entry_templates_group: None,
            entry_templates_group_changed: t,
            history: HistoryLimits::default(),
            last_selected_group: None,
            last_top_visible_group: None,
            custom_data: CustomData::default(),
        }
    }
}

/// What an entry visitor wants next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Visit {
    Continue,
    Stop,
}

/// What a group visitor wants done with the group's subtree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupVisit {
    Enter,
    Skip,
}

#[derive(Debug)]
pub struct Database {
    generation: FormatGeneration,
    pub crypto: CryptoSettings,
    pub meta: Meta,
    root: NodeId,
    groups: HashMap<NodeId, Group>,
    entries: HashMap<NodeId, Entry>,
    pub binaries: BinaryPool<u32>,
    pub icons: BinaryPool<Uuid>,
    pub deleted_objects: Vec<DeletedObject>,
    read_only: bool,
}

impl Database {
    /// A current-generation database whose root group carries `name`.
    pub fn new(name: &str) -> Self {
        let root = Group::new(name);
        let mut db = Self::with_root(FormatGeneration::Current, root);
        db.meta.name = name.to_string();
        db
    }

    /// A legacy database with its implicit, never persisted root.
    pub fn new_legacy() -> Self {
        let root = Group::with_id(LEGACY_ROOT_ID, "");
        let mut db = Self::with_root(FormatGeneration::Legacy, root);
        db.crypto.inner_stream = InnerStreamKind::None;
        db.crypto.compression = Compression::None;
        db.meta.recycle_bin_enabled = false;
        db
    }

    pub(crate) fn with_root(generation: FormatGeneration, root: Group) -> Self {
        let root_id = root.id;
        let mut groups = HashMap::new();
        groups.insert(root_id, root);
        Self {
            generation,
            crypto: CryptoSettings::default(),
            meta: Meta::default(),
            root: root_id,
            groups,
            entries: HashMap::new(),
            binaries: BinaryPool::new(),
            icons: BinaryPool::new(),
            deleted_objects: Vec::new(),
            read_only: false,
        }
    }

    pub fn generation(&self) -> FormatGeneration {
        self.generation
    }

    pub fn is_legacy(&self) -> bool {
        self.generation == FormatGeneration::Legacy
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    pub fn set_read_only(&mut self, read_only: bool) {
        self.read_only = read_only;
    }

    pub(crate) fn check_writable(&self) -> Result<()> {
        if self.read_only {
            return Err(DatabaseError::ReadOnly);
        }
        Ok(())
    }

    pub fn root_id(&self) -> NodeId {
        self.root
    }

    pub fn root(&self) -> &Group {
        &self.groups[&self.root]
    }

    pub fn group(&self, id: &NodeId) -> Option<&Group> {
        self.groups.get(id)
    }

    /// Direct access for field edits. Structural links (`parent`, `groups`,
    /// `entries`) must be changed through the tree operations instead.
    pub fn group_mut(&mut self, id: &NodeId) -> Option<&mut Group> {
        self.groups.get_mut(id)
    }

    pub fn entry(&self, id: &NodeId) -> Option<&Entry> {
        self.entries.get(id)
    }

    pub fn entry_mut(&mut self, id: &NodeId) -> Option<&mut Entry> {
        self.entries.get_mut(id)
    }

    pub fn contains(&self, node: &NodeRef) -> bool {
        match node {
            NodeRef::Group(id) => self.groups.contains_key(id),
            NodeRef::Entry(id) => self.entries.contains_key(id),
        }
    }

    fn require_group(&self, id: &NodeId) -> Result<&Group> {
        self.groups
            .get(id)
            .ok_or_else(|| DatabaseError::NodeNotFound(id.to_string()))
    }

    fn require_entry(&self, id: &NodeId) -> Result<&Entry> {
        self.entries
            .get(id)
            .ok_or_else(|| DatabaseError::NodeNotFound(id.to_string()))
    }

    fn require_entry_mut(&mut self, id: &NodeId) -> Result<&mut Entry> {
        self.entries
            .get_mut(id)
            .ok_or_else(|| DatabaseError::NodeNotFound(id.to_string()))
    }

    /// Child groups of `id`, in order.
    pub fn child_groups(&self, id: &NodeId) -> impl Iterator<Item = &Group> {
        self.groups
            .get(id)
            .into_iter()
            .flat_map(move |g| g.groups.iter().filter_map(move |c| self.groups.get(c)))
    }

    /// Child entries of `id`, in order.
    pub fn child_entries(&self, id: &NodeId) -> impl Iterator<Item = &Entry> {
        self.groups
            .get(id)
            .into_iter()
            .flat_map(move |g| g.entries.iter().filter_map(move |c| self.entries.get(c)))
    }

    pub fn groups(&self) -> impl Iterator<Item = &Group> {
        self.groups.values()
    }

    pub fn entries(&self) -> impl Iterator<Item = &Entry> {
        self.entries.values()
    }

    /// Number of groups, not counting the legacy implicit root.
    pub fn group_count(&self) -> usize {
        match self.generation {
            FormatGeneration::Legacy => self.groups.len() - 1,
            FormatGeneration::Current => self.groups.len(),
        }
    }

    pub fn entry_count(&self) -> usize {
        self.entries.len()
    }

    /// Groups below `id`, depth first in display order.
    pub fn descendant_groups(&self, id: &NodeId) -> Vec<NodeId> {
        let mut out = Vec::new();
        let mut stack: Vec<NodeId> = match self.groups.get(id) {
            Some(g) => g.groups.iter().rev().copied().collect(),
            None => return out,
        };
        while let Some(next) = stack.pop() {
            out.push(next);
            if let Some(g) = self.groups.get(&next) {
                stack.extend(g.groups.iter().rev().copied());
            }
        }
        out
    }

    fn parent_of(&self, node: &NodeRef) -> Option<NodeId> {
        match node {
            NodeRef::Group(id) => self.groups.get(id).and_then(|g| g.parent),
            NodeRef::Entry(id) => self.entries.get(id).and_then(|e| e.parent),
        }
    }

    /// Ancestor groups of `node`, nearest first, up to and including the root.
    pub fn ancestors(&self, node: &NodeRef) -> Vec<NodeId> {
        let mut out = Vec::new();
        let mut current = self.parent_of(node);
        while let Some(id) = current {
            if out.contains(&id) {
                break;
            }
            out.push(id);
            current = self.groups.get(&id).and_then(|g| g.parent);
        }
        out
    }

    /// Whether `ancestor` is `node` itself or lies on its parent chain.
    pub fn is_ancestor_or_self(&self, ancestor: &NodeId, node: &NodeId) -> bool {
        ancestor == node || self.ancestors(&NodeRef::Group(*node)).contains(ancestor)
    }

    /// Nesting depth of a group: 0 for the root, 1 for its children.
    pub fn depth(&self, id: &NodeId) -> usize {
        self.ancestors(&NodeRef::Group(*id)).len()
    }

    /// Fresh identity appropriate for this generation.
    pub fn new_group_id(&self) -> NodeId {
        match self.generation {
            FormatGeneration::Legacy => {
                let max = self.groups.keys().filter_map(|id| id.as_int()).max().unwrap_or(0);
                match max.checked_add(1) {
                    Some(next) => NodeId::Int(next),
                    // 0xFFFFFFFF is taken; reuse the lowest free id.
                    None => (1..=u32::MAX)
                        .map(NodeId::Int)
                        .find(|id| !self.groups.contains_key(id))
                        .unwrap_or(NodeId::Int(0)),
                }
            }
            FormatGeneration::Current => NodeId::random(),
        }
    }

    pub fn new_group(&self, title: &str) -> Group {
        Group::with_id(self.new_group_id(), title)
    }

    /// Links a decoded group under `parent` without touching timestamps.
    pub(crate) fn insert_group(&mut self, parent: &NodeId, mut group: Group) -> Result<NodeId> {
        let id = group.id;
        if self.groups.contains_key(&id) {
            return Err(DatabaseError::DuplicateIdentifier {
                kind: NodeKind::Group,
                id: id.to_string(),
            });
        }
        let parent_group = self
            .groups
            .get_mut(parent)
            .ok_or_else(|| DatabaseError::NodeNotFound(parent.to_string()))?;
        parent_group.groups.push(id);
        group.parent = Some(*parent);
        group.groups.clear();
        group.entries.clear();
        self.groups.insert(id, group);
        Ok(id)
    }

    /// Links a decoded entry under `parent` and takes references on its
    /// attachments.
    pub(crate) fn insert_entry(&mut self, parent: &NodeId, mut entry: Entry) -> Result<NodeId> {
        let id = entry.id;
        if self.entries.contains_key(&id) {
            return Err(DatabaseError::DuplicateIdentifier {
                kind: NodeKind::Entry,
                id: id.to_string(),
            });
        }
        if !self.groups.contains_key(parent) {
            return Err(DatabaseError::NodeNotFound(parent.to_string()));
        }
        for key in entry.attachment_refs().collect::<Vec<_>>() {
            self.binaries.acquire(&key)?;
        }
        entry.parent = Some(*parent);
        if let Some(parent_group) = self.groups.get_mut(parent) {
            parent_group.entries.push(id);
        }
        self.entries.insert(id, entry);
        Ok(id)
    }

    pub fn add_group(&mut self, parent: &NodeId, mut group: Group) -> Result<NodeId> {
        self.check_writable()?;
        group.times.location_changed = now();
        let id = self.insert_group(parent, group)?;
        self.touch(&NodeRef::Group(*parent), true, false)?;
        debug!(group = %id, parent = %parent, "group added");
        Ok(id)
    }

    pub fn add_entry(&mut self, parent: &NodeId, mut entry: Entry) -> Result<NodeId> {
        self.check_writable()?;
        entry.times.location_changed = now();
        let id = self.insert_entry(parent, entry)?;
        self.touch(&NodeRef::Group(*parent), true, false)?;
        debug!(entry = %id, parent = %parent, "entry added");
        Ok(id)
    }

    fn record_deleted(&mut self, id: &NodeId) {
        if self.generation != FormatGeneration::Current {
            return;
        }
        if let Some(uuid) = id.as_uuid() {
            self.deleted_objects.push(DeletedObject {
                uuid,
                deletion_time: now(),
            });
        }
    }

    pub(crate) fn release_attachments(&mut self, entry: &Entry) {
        for key in entry.attachment_refs() {
            if let Err(e) = self.binaries.release(&key) {
                warn!(binary = key, error = %e, "attachment reference already gone");
            }
        }
    }

    pub(crate) fn detach_entry(&mut self, id: &NodeId) -> Result<Entry> {
        let entry = self
            .entries
            .remove(id)
            .ok_or_else(|| DatabaseError::NodeNotFound(id.to_string()))?;
        if let Some(parent) = entry.parent.and_then(|p| self.groups.get_mut(&p)) {
            parent.entries.retain(|e| e != id);
        }
        Ok(entry)
    }

    /// Deletes an entry for good.
    pub fn remove_entry(&mut self, id: &NodeId) -> Result<Entry> {
        self.check_writable()?;
        let entry = self.detach_entry(id)?;
        self.release_attachments(&entry);
        self.record_deleted(id);
        if let Some(parent) = entry.parent {
            self.touch(&NodeRef::Group(parent), true, false)?;
        }
        Ok(entry)
    }

    /// Deletes a group and everything below it.
    pub fn remove_group(&mut self, id: &NodeId) -> Result<()> {
        self.check_writable()?;
        if *id == self.root {
            return Err(DatabaseError::Other("Корневую группу нельзя удалить".into()));
        }
        let parent = self.require_group(id)?.parent;
        let removed = self.purge_group(id)?;
        for node in &removed {
            self.record_deleted(&node.id());
        }
        if let Some(parent_id) = parent {
            self.touch(&NodeRef::Group(parent_id), true, false)?;
        }
        debug!(group = %id, removed = removed.len(), "group removed");
        Ok(())
    }

    /// Unlinks a group with its subtree and returns every node that went
    /// away. Nothing is recorded as deleted and no timestamp changes.
    pub(crate) fn purge_group(&mut self, id: &NodeId) -> Result<Vec<NodeRef>> {
        let parent = self.require_group(id)?.parent;
        let mut doomed = self.descendant_groups(id);
        doomed.push(*id);

        let mut removed = Vec::new();
        for group_id in &doomed {
            let entries = self.groups.get(group_id).map(|g| g.entries.clone()).unwrap_or_default();
            for entry_id in entries {
                if let Some(entry) = self.entries.remove(&entry_id) {
                    self.release_attachments(&entry);
                    removed.push(NodeRef::Entry(entry_id));
                }
            }
        }
        for group_id in &doomed {
            self.groups.remove(group_id);
            removed.push(NodeRef::Group(*group_id));
            if self.meta.recycle_bin == Some(*group_id) {
                self.meta.recycle_bin = None;
                self.meta.recycle_bin_changed = now();
            }
            if self.meta.entry_templates_group == Some(*group_id) {
                self.meta.entry_templates_group = None;
                self.meta.entry_templates_group_changed = now();
            }
        }
        if let Some(p) = parent.and_then(|p| self.groups.get_mut(&p)) {
            p.groups.retain(|g| g != id);
        }
        Ok(removed)
    }

    /// Moves a group under `new_parent` keeping its timestamps.
    pub(crate) fn relink_group(&mut self, id: &NodeId, new_parent: &NodeId) -> Result<()> {
        self.require_group(new_parent)?;
        let old_parent = self.require_group(id)?.parent;
        if *id == self.root || self.is_ancestor_or_self(id, new_parent) {
            return Err(DatabaseError::CyclicMove);
        }
        if old_parent == Some(*new_parent) {
            return Ok(());
        }
        if let Some(p) = old_parent.and_then(|p| self.groups.get_mut(&p)) {
            p.groups.retain(|g| g != id);
        }
        if let Some(p) = self.groups.get_mut(new_parent) {
            p.groups.push(*id);
        }
        if let Some(group) = self.groups.get_mut(id) {
            group.parent = Some(*new_parent);
        }
        Ok(())
    }

    /// Moves an entry under `new_parent` keeping its timestamps.
    pub(crate) fn relink_entry(&mut self, id: &NodeId, new_parent: &NodeId) -> Result<()> {
        self.require_group(new_parent)?;
        let old_parent = self.require_entry(id)?.parent;
        if old_parent == Some(*new_parent) {
            return Ok(());
        }
        if let Some(p) = old_parent.and_then(|p| self.groups.get_mut(&p)) {
            p.entries.retain(|e| e != id);
        }
        if let Some(p) = self.groups.get_mut(new_parent) {
            p.entries.push(*id);
        }
        if let Some(entry) = self.entries.get_mut(id) {
            entry.parent = Some(*new_parent);
        }
        Ok(())
    }

    /// Re-parents a group. Fails with [`DatabaseError::CyclicMove`] before
    /// changing anything when `new_parent` lies inside the moved subtree.
    pub fn move_group(&mut self, id: &NodeId, new_parent: &NodeId) -> Result<()> {
        self.check_writable()?;
        if *id == self.root {
            return Err(DatabaseError::CyclicMove);
        }
        self.require_group(new_parent)?;
        let old_parent = self.require_group(id)?.parent;
        if self.is_ancestor_or_self(id, new_parent) {
            return Err(DatabaseError::CyclicMove);
        }
        if old_parent == Some(*new_parent) {
            return Ok(());
        }

        if let Some(p) = old_parent.and_then(|p| self.groups.get_mut(&p)) {
            p.groups.retain(|g| g != id);
        }
        if let Some(p) = self.groups.get_mut(new_parent) {
            p.groups.push(*id);
        }
        if let Some(group) = self.groups.get_mut(id) {
            group.parent = Some(*new_parent);
            group.previous_parent = old_parent.and_then(|p| p.as_uuid());
            group.times.location_changed = now();
        }
        self.touch(&NodeRef::Group(*id), true, true)
    }

    pub fn move_entry(&mut self, id: &NodeId, new_parent: &NodeId) -> Result<()> {
        self.check_writable()?;
        self.require_group(new_parent)?;
        let old_parent = self.require_entry(id)?.parent;
        if old_parent == Some(*new_parent) {
            return Ok(());
        }

        if let Some(p) = old_parent.and_then(|p| self.groups.get_mut(&p)) {
            p.entries.retain(|e| e != id);
        }
        if let Some(p) = self.groups.get_mut(new_parent) {
            p.entries.push(*id);
        }
        if let Some(entry) = self.entries.get_mut(id) {
            entry.parent = Some(*new_parent);
            entry.previous_parent = old_parent.and_then(|p| p.as_uuid());
            entry.times.location_changed = now();
        }
        self.touch(&NodeRef::Entry(*id), true, true)
    }

    /// Updates access time (and modification time when `modified`). With
    /// `propagate`, every ancestor group is touched as accessed.
    pub fn touch(&mut self, node: &NodeRef, modified: bool, propagate: bool) -> Result<()> {
        match node {
            NodeRef::Group(id) => self
                .groups
                .get_mut(id)
                .ok_or_else(|| DatabaseError::NodeNotFound(id.to_string()))?
                .times
                .touch(modified),
            NodeRef::Entry(id) => self.require_entry_mut(id)?.times.touch(modified),
        }
        if propagate {
            for ancestor in self.ancestors(node) {
                if let Some(g) = self.groups.get_mut(&ancestor) {
                    g.times.touch(false);
                }
            }
        }
        Ok(())
    }

    /// Depth-first walk below `start`: at each level the entries come first,
    /// then the subgroups.
    ///
    /// An entry visitor returning [`Visit::Stop`] ends the whole walk. A group
    /// visitor returning [`GroupVisit::Skip`] prunes that subtree; with
    /// `halt_on_skip` it ends the whole walk instead. Returns `false` when
    /// the walk ended early.
    pub fn do_for_each_child<F, G>(
        &self,
        start: &NodeId,
        entry_visitor: &mut F,
        group_visitor: &mut G,
        halt_on_skip: bool,
    ) -> bool
    where
        F: FnMut(&Entry) -> Visit,
        G: FnMut(&Group) -> GroupVisit,
    {
        let group = match self.groups.get(start) {
            Some(g) => g,
            None => return true,
        };
        for entry_id in &group.entries {
            if let Some(entry) = self.entries.get(entry_id) {
                if entry_visitor(entry) == Visit::Stop {
                    return false;
                }
            }
        }
        for child_id in &group.groups {
            let child = match self.groups.get(child_id) {
                Some(c) => c,
                None => continue,
            };
            match group_visitor(child) {
                GroupVisit::Enter => {
                    if !self.do_for_each_child(child_id, entry_visitor, group_visitor, halt_on_skip) {
                        return false;
                    }
                }
                GroupVisit::Skip if halt_on_skip => return false,
                GroupVisit::Skip => {}
            }
        }
        true
    }

    /// Appends a snapshot of the entry's current state to its history, then
    /// trims the history to the configured limits.
    pub fn push_history(&mut self, id: &NodeId) -> Result<()> {
        self.check_writable()?;
        let snapshot = self.require_entry(id)?.snapshot();
        for attachment in &snapshot.attachments {
            self.binaries.acquire(&attachment.binary)?;
        }
        self.require_entry_mut(id)?.history.push(snapshot);
        self.trim_history(id)?;
        Ok(())
    }

    /// Drops the oldest snapshots until both the count and the size limit
    /// hold. Returns how many went away.
    pub fn trim_history(&mut self, id: &NodeId) -> Result<usize> {
        let limits = self.meta.history;
        let mut removed = 0;
        loop {
            let entry = self.require_entry(id)?;
            let count = entry.history.len();
            if count == 0 {
                break;
            }
            let too_many = limits.max_items >= 0 && count > limits.max_items as usize;
            let too_big = limits.max_size >= 0 && {
                let total: u64 = entry
                    .history
                    .iter()
                    .map(|h| h.estimated_size(&self.binaries))
                    .sum();
                total > limits.max_size as u64
            };
            if !too_many && !too_big {
                break;
            }
            let oldest = entry
                .history
                .iter()
                .enumerate()
                .min_by_key(|(_, h)| h.times.last_modification)
                .map(|(i, _)| i)
                .unwrap_or(0);
            let dropped = self.require_entry_mut(id)?.history.remove(oldest);
            self.release_attachments(&dropped);
            removed += 1;
        }
        if removed > 0 {
            debug!(entry = %id, removed, "history trimmed");
        }
        Ok(removed)
    }

    /// Makes the entry's content equal to history snapshot `position`. The
    /// history list itself is kept as is.
    pub fn restore_history(&mut self, id: &NodeId, position: usize) -> Result<()> {
        self.check_writable()?;
        let snapshot = self
            .require_entry(id)?
            .history
            .get(position)
            .cloned()
            .ok_or_else(|| DatabaseError::NodeNotFound(format!("{}: версия {}", id, position)))?;

        for attachment in &snapshot.attachments {
            self.binaries.acquire(&attachment.binary)?;
        }
        let entry = self.require_entry_mut(id)?;
        let old_attachments = std::mem::replace(&mut entry.attachments, snapshot.attachments.clone());
        entry.icon = snapshot.icon;
        entry.tags = snapshot.tags.clone();
        entry.custom_data = snapshot.custom_data.clone();
        entry.foreground_color = snapshot.foreground_color.clone();
        entry.background_color = snapshot.background_color.clone();
        entry.override_url = snapshot.override_url.clone();
        entry.quality_check = snapshot.quality_check;
        entry.auto_type = snapshot.auto_type.clone();
        entry.times.expires = snapshot.times.expires;
        entry.times.expiry = snapshot.times.expiry;
        let keys: Vec<String> = entry.fields().map(|(k, _)| k.to_string()).collect();
        for key in keys {
            entry.remove_field(&key);
        }
        for (key, value) in snapshot.fields() {
            entry.set_value(key, value.clone());
        }

        for attachment in old_attachments {
            self.binaries.release(&attachment.binary)?;
        }
        self.touch(&NodeRef::Entry(*id), true, true)
    }

    /// Removes exactly one snapshot and returns it.
    pub fn delete_history(&mut self, id: &NodeId, position: usize) -> Result<Entry> {
        self.check_writable()?;
        let entry = self.require_entry_mut(id)?;
        if position >= entry.history.len() {
            return Err(DatabaseError::NodeNotFound(format!("{}: версия {}", id, position)));
        }
        let dropped = entry.history.remove(position);
        self.release_attachments(&dropped);
        Ok(dropped)
    }

    /// Attaches `data` under `name`, replacing an attachment of the same
    /// name. Legacy entries hold at most one attachment.
    pub fn add_attachment(
        &mut self,
        id: &NodeId,
        name: &str,
        data: &[u8],
        protected: bool,
        ctx: &EngineContext,
    ) -> Result<u32> {
        self.check_writable()?;
        self.require_entry(id)?;
        let key = self.binaries.register(data, protected, ctx)?;

        let legacy = self.is_legacy();
        let entry = self.require_entry_mut(id)?;
        let replaced: Vec<Attachment> = if legacy {
            std::mem::take(&mut entry.attachments)
        } else {
            let (same, rest): (Vec<_>, Vec<_>) =
                std::mem::take(&mut entry.attachments).into_iter().partition(|a| a.name == name);
            entry.attachments = rest;
            same
        };
        entry.attachments.push(Attachment {
            name: name.to_string(),
            binary: key,
        });
        for old in replaced {
            self.binaries.release(&old.binary)?;
        }
        self.touch(&NodeRef::Entry(*id), true, false)?;
        Ok(key)
    }

    pub fn remove_attachment(&mut self, id: &NodeId, name: &str) -> Result<bool> {
        self.check_writable()?;
        let entry = self.require_entry_mut(id)?;
        let pos = match entry.attachments.iter().position(|a| a.name == name) {
            Some(pos) => pos,
            None => return Ok(false),
        };
        let removed = entry.attachments.remove(pos);
        self.binaries.release(&removed.binary)?;
        self.touch(&NodeRef::Entry(*id), true, false)?;
        Ok(true)
    }

    pub fn attachment_data(&self, id: &NodeId, name: &str) -> Result<SecureBytes> {
        let attachment = self
            .require_entry(id)?
            .attachment(name)
            .ok_or_else(|| DatabaseError::NodeNotFound(format!("{}: {}", id, name)))?;
        self.binaries.data(&attachment.binary)
    }

    /// Registers a custom icon, reusing an identical image when present.
    pub fn add_custom_icon(&mut self, data: &[u8], name: &str, ctx: &EngineContext) -> Result<Uuid> {
        self.check_writable()?;
        if let Some(existing) = self.icons.find(data) {
            return Ok(existing);
        }
        let uuid = Uuid::new_v4();
        self.icons.insert(uuid, data, false, ctx)?;
        self.icons.acquire(&uuid)?;
        self.meta.custom_icons.push(CustomIcon {
            uuid,
            name: name.to_string(),
            last_modification: None,
        });
        Ok(uuid)
    }

    /// Drops a custom icon; nodes that used it fall back to their standard icon.
    pub fn remove_custom_icon(&mut self, uuid: &Uuid) -> Result<()> {
        self.check_writable()?;
        let before = self.meta.custom_icons.len();
        self.meta.custom_icons.retain(|i| i.uuid != *uuid);
        if self.meta.custom_icons.len() == before {
            return Err(DatabaseError::NodeNotFound(uuid.to_string()));
        }
        self.icons.remove(uuid);
        for group in self.groups.values_mut() {
            if group.icon.custom == Some(*uuid) {
                group.icon.custom = None;
            }
        }
        for entry in self.entries.values_mut() {
            if entry.icon.custom == Some(*uuid) {
                entry.icon.custom = None;
            }
            for snapshot in entry.history.iter_mut().filter(|h| h.icon.custom == Some(*uuid)) {
                snapshot.icon.custom = None;
            }
        }
        Ok(())
    }

    pub fn custom_icon_data(&self, uuid: &Uuid) -> Result<SecureBytes> {
        self.icons.data(uuid)
    }

    /// Returns the recycle bin, creating it under the root when missing.
    pub fn ensure_recycle_bin(&mut self) -> Result<NodeId> {
        if let Some(bin) = self.meta.recycle_bin {
            if self.groups.contains_key(&bin) {
                return Ok(bin);
            }
        }
        let mut bin = self.new_group(RECYCLE_BIN_TITLE);
        bin.icon.standard = ICON_TRASH;
        bin.enable_auto_type = Some(false);
        bin.enable_searching = Some(false);
        bin.is_expanded = false;
        let root = self.root;
        let id = self.add_group(&root, bin)?;
        self.meta.recycle_bin = Some(id);
        self.meta.recycle_bin_changed = now();
        Ok(id)
    }

    pub fn is_in_recycle_bin(&self, node: &NodeRef) -> bool {
        match self.meta.recycle_bin {
            Some(bin) => node.id() == bin || self.ancestors(node).contains(&bin),
            None => false,
        }
    }

    /// Moves a node to the recycle bin when it is enabled. Deletes it when
    /// the bin is disabled, unsupported, or the node is already inside it.
    pub fn recycle(&mut self, node: &NodeRef) -> Result<()> {
        self.check_writable()?;
        let use_bin = self.generation == FormatGeneration::Current
            && self.meta.recycle_bin_enabled
            && !self.is_in_recycle_bin(node);
        if !use_bin {
            return match node {
                NodeRef::Group(id) => self.remove_group(id),
                NodeRef::Entry(id) => self.remove_entry(id).map(|_| ()),
            };
        }
        let bin = self.ensure_recycle_bin()?;
        match node {
            NodeRef::Group(id) => self.move_group(id, &bin),
            NodeRef::Entry(id) => self.move_entry(id, &bin),
        }
    }

    /// Forgets the tree and every cached payload.
    pub fn close(&mut self) {
        let root = self.groups.remove(&self.root);
        self.groups.clear();
        self.entries.clear();
        self.binaries.clear();
        self.icons.clear();
        self.deleted_objects.clear();
        if let Some(mut root) = root {
            root.groups.clear();
            root.entries.clear();
            self.groups.insert(self.root, root);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> (Database, NodeId, NodeId) {
        let mut db = Database::new("Test");
        let root = db.root_id();
        let group = db.add_group(&root, Group::new("Web")).unwrap();
        let mut entry = Entry::new();
        entry.set_title("Example");
        entry.set_username("user");
        entry.set_password("pass");
        let entry = db.add_entry(&group, entry).unwrap();
        (db, group, entry)
    }

    #[test]
    fn test_add_links_parent_and_child() {
        let (db, group, entry) = sample();
        assert_eq!(db.entry(&entry).unwrap().parent, Some(group));
        assert_eq!(db.group(&group).unwrap().entries, vec![entry]);
        assert_eq!(db.depth(&group), 1);
        assert_eq!(db.group_count(), 2);
    }

    #[test]
    fn test_move_into_descendant_fails_without_change() {
        let (mut db, group, _) = sample();
        let child = db.add_group(&group, Group::new("Child")).unwrap();
        let grandchild = db.add_group(&child, Group::new("Grandchild")).unwrap();

        assert!(matches!(db.move_group(&group, &grandchild), Err(DatabaseError::CyclicMove)));
        assert!(matches!(db.move_group(&group, &group), Err(DatabaseError::CyclicMove)));
        assert_eq!(db.group(&group).unwrap().parent, Some(db.root_id()));
        assert_eq!(db.group(&grandchild).unwrap().parent, Some(child));
        assert_eq!(db.root().groups, vec![group]);
    }

    #[test]
    fn test_move_group_updates_links() {
        let (mut db, group, _) = sample();
        let other = db.add_group(&db.root_id(), Group::new("Other")).unwrap();
        db.move_group(&group, &other).unwrap();
        assert_eq!(db.group(&group).unwrap().parent, Some(other));
        assert_eq!(db.group(&group).unwrap().previous_parent, db.root_id().as_uuid());
        assert_eq!(db.root().groups, vec![other]);
        assert_eq!(db.depth(&group), 2);
    }

    #[test]
    fn test_touch_propagates_to_ancestors() {
        let (mut db, group, entry) = sample();
        let root = db.root_id();
        let root_usage = db.root().times.usage_count;
        let group_modified = db.group(&group).unwrap().times.last_modification;
        db.touch(&NodeRef::Entry(entry), true, true).unwrap();
        assert_eq!(db.root().times.usage_count, root_usage + 1);
        assert_eq!(db.group(&group).unwrap().times.last_modification, group_modified);
        assert!(db.group(&root).is_some());
    }

    #[test]
    fn test_remove_group_records_deleted_objects() {
        let (mut db, group, entry) = sample();
        db.remove_group(&group).unwrap();
        assert!(db.entry(&entry).is_none());
        assert_eq!(db.deleted_objects.len(), 2);
        assert!(db.root().groups.is_empty());
    }

    #[test]
    fn test_read_only_rejects_edits() {
        let (mut db, group, _) = sample();
        db.set_read_only(true);
        assert!(matches!(db.add_group(&group, Group::new("x")), Err(DatabaseError::ReadOnly)));
    }

    #[test]
    fn test_history_keeps_newest() {
        let (mut db, _, entry) = sample();
        db.meta.history.max_items = 3;
        for i in 0..5 {
            let e = db.entry_mut(&entry).unwrap();
            e.set_title(&format!("v{}", i));
            e.times.last_modification = now() + chrono::Duration::seconds(i);
            db.push_history(&entry).unwrap();
        }
        let titles: Vec<_> = db.entry(&entry).unwrap().history.iter().map(|h| h.title().to_string()).collect();
        assert_eq!(titles, vec!["v2", "v3", "v4"]);
    }

    #[test]
    fn test_history_size_limit() {
        let (mut db, _, entry) = sample();
        db.meta.history.max_items = -1;
        db.meta.history.max_size = 1000;
        for i in 0..20 {
            let e = db.entry_mut(&entry).unwrap();
            e.set_notes(&"x".repeat(100));
            e.times.last_modification = now() + chrono::Duration::seconds(i);
            db.push_history(&entry).unwrap();
        }
        let e = db.entry(&entry).unwrap();
        let total: u64 = e.history.iter().map(|h| h.estimated_size(&db.binaries)).sum();
        assert!(total <= 1000);
        assert!(!e.history.is_empty());
    }

    #[test]
    fn test_restore_and_delete_history() {
        let (mut db, _, entry) = sample();
        db.push_history(&entry).unwrap();
        db.entry_mut(&entry).unwrap().set_password("changed");
        db.entry_mut(&entry).unwrap().set("Extra", "field", false);
        db.push_history(&entry).unwrap();

        db.restore_history(&entry, 0).unwrap();
        let e = db.entry(&entry).unwrap();
        assert_eq!(e.password(), "pass");
        assert!(e.get("Extra").is_none());
        assert_eq!(e.history.len(), 2);

        let dropped = db.delete_history(&entry, 1).unwrap();
        assert_eq!(dropped.password(), "changed");
        assert_eq!(db.entry(&entry).unwrap().history.len(), 1);
        assert!(db.delete_history(&entry, 5).is_err());
    }

    #[test]
    fn test_attachment_refcounts_follow_history() {
        let ctx = EngineContext::new();
        let (mut db, _, entry) = sample();
        let key = db.add_attachment(&entry, "a.txt", b"payload", false, &ctx).unwrap();
        db.push_history(&entry).unwrap();
        assert_eq!(db.binaries.get(&key).unwrap().refs(), 2);

        db.remove_attachment(&entry, "a.txt").unwrap();
        assert!(db.binaries.contains(&key));
        db.delete_history(&entry, 0).unwrap();
        assert!(!db.binaries.contains(&key));
    }

    #[test]
    fn test_attachment_dedup_across_entries() {
        let ctx = EngineContext::new();
        let (mut db, group, first) = sample();
        let second = db.add_entry(&group, Entry::new()).unwrap();
        let a = db.add_attachment(&first, "x", b"same", false, &ctx).unwrap();
        let b = db.add_attachment(&second, "y", b"same", false, &ctx).unwrap();
        assert_eq!(a, b);
        assert_eq!(db.binaries.len(), 1);
        db.remove_entry(&first).unwrap();
        assert_eq!(&*db.attachment_data(&second, "y").unwrap(), b"same");
    }

    #[test]
    fn test_recycle_moves_then_deletes() {
        let (mut db, _, entry) = sample();
        db.recycle(&NodeRef::Entry(entry)).unwrap();
        let bin = db.meta.recycle_bin.unwrap();
        assert_eq!(db.entry(&entry).unwrap().parent, Some(bin));
        assert!(db.is_in_recycle_bin(&NodeRef::Entry(entry)));

        db.recycle(&NodeRef::Entry(entry)).unwrap();
        assert!(db.entry(&entry).is_none());
    }

    #[test]
    fn test_custom_icons() {
        let ctx = EngineContext::new();
        let (mut db, group, _) = sample();
        let icon = db.add_custom_icon(b"png", "logo", &ctx).unwrap();
        assert_eq!(db.add_custom_icon(b"png", "again", &ctx).unwrap(), icon);
        db.group_mut(&group).unwrap().icon.custom = Some(icon);
        db.remove_custom_icon(&icon).unwrap();
        assert!(db.group(&group).unwrap().icon.custom.is_none());
        assert!(db.meta.custom_icons.is_empty());
        assert!(db.custom_icon_data(&icon).is_err());
    }

    #[test]
    fn test_legacy_group_ids() {
        let mut db = Database::new_legacy();
        let root = db.root_id();
        let first = db.new_group("A");
        assert_eq!(first.id, NodeId::Int(1));
        db.add_group(&root, first).unwrap();
        assert_eq!(db.new_group_id(), NodeId::Int(2));
        assert_eq!(db.group_count(), 1);
    }

    #[test]
    fn test_legacy_group_with_highest_id() {
        let mut db = Database::new_legacy();
        let root = db.root_id();
        db.add_group(&root, Group::with_id(NodeId::Int(u32::MAX), "Last")).unwrap();
        assert_eq!(db.group_count(), 1);
        assert_eq!(db.new_group_id(), NodeId::Int(1));
    }

    #[test]
    fn test_walk_order_and_stop() {
        let (mut db, group, _) = sample();
        let root = db.root_id();
        let mut top = Entry::new();
        top.set_title("Top");
        db.add_entry(&root, top).unwrap();
        let sub = db.add_group(&group, Group::new("Sub")).unwrap();
        let mut deep = Entry::new();
        deep.set_title("Deep");
        db.add_entry(&sub, deep).unwrap();

        let mut seen = Vec::new();
        let done = db.do_for_each_child(
            &root,
            &mut |e: &Entry| {
                seen.push(e.title().to_string());
                Visit::Continue
            },
            &mut |_: &Group| GroupVisit::Enter,
            false,
        );
        assert!(done);
        assert_eq!(seen, vec!["Top", "Example", "Deep"]);

        let mut seen = Vec::new();
        let done = db.do_for_each_child(
            &root,
            &mut |e: &Entry| {
                seen.push(e.title().to_string());
                Visit::Stop
            },
            &mut |_: &Group| GroupVisit::Enter,
            false,
        );
        assert!(!done);
        assert_eq!(seen.len(), 1);
    }

    #[test]
    fn test_walk_skip_modes() {
        let (mut db, _, _) = sample();
        let root = db.root_id();
        let late = db.add_group(&root, Group::new("Late")).unwrap();
        let mut e = Entry::new();
        e.set_title("InLate");
        db.add_entry(&late, e).unwrap();

        let walk = |halt: bool| {
            let mut seen = Vec::new();
            db.do_for_each_child(
                &root,
                &mut |e: &Entry| {
                    seen.push(e.title().to_string());
                    Visit::Continue
                },
                &mut |g: &Group| if g.title == "Web" { GroupVisit::Skip } else { GroupVisit::Enter },
                halt,
            );
            seen
        };
        assert_eq!(walk(false), vec!["InLate"]);
        assert!(walk(true).is_empty());
    }
}
