//! Merging another database into the open one
//!
//! Nodes are matched by identity. When both sides hold a node the one with
//! the later modification time wins and the other one ends up in the
//! entry's history. Deletions recorded by the incoming database remove
//! local nodes that were not modified after the deletion.

use std::collections::HashSet;

use tracing::{debug, info, warn};
use uuid::Uuid;

use super::database::{CustomIcon, Database, DeletedObject, FormatGeneration};
use super::entry::Entry;
use super::group::Group;
use super::node::{CustomData, NodeId, NodeRef};
use crate::context::EngineContext;
use crate::error::{DatabaseError, Result};

/// What a merge changed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergeSummary {
    pub groups_added: usize,
    pub entries_added: usize,
    pub groups_updated: usize,
    pub entries_updated: usize,
    pub nodes_deleted: usize,
    pub icons_added: usize,
}

impl MergeSummary {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// Items of `source` missing from `target`, or newer there, replace the
/// ones in `target`. Items without a timestamp always win.
fn merge_custom_data(target: &mut CustomData, source: &CustomData) {
    for item in source.iter() {
        let take = match target.iter().find(|t| t.key == item.key) {
            None => true,
            Some(existing) => match (existing.last_modification, item.last_modification) {
                (Some(ours), Some(theirs)) => ours < theirs,
                _ => true,
            },
        };
        if take {
            target.set(&item.key, &item.value, item.last_modification);
        }
    }
}

/// Adds the history of `older` and `older` itself to `newer`, skipping
/// versions `newer` already holds (same modification time).
fn absorb_history(newer: &mut Entry, older: &Entry) -> Vec<Entry> {
    let mut added = Vec::new();
    let candidates = older.history.iter().cloned().chain(std::iter::once(older.snapshot()));
    for version in candidates {
        let known = newer
            .history
            .iter()
            .any(|h| h.times.last_modification == version.times.last_modification);
        if !known && version.times.last_modification != newer.times.last_modification {
            newer.history.push(version.clone());
            added.push(version);
        }
    }
    newer.history.sort_by_key(|h| h.times.last_modification);
    added
}

struct Merger<'a> {
    db: &'a mut Database,
    other: &'a Database,
    ctx: &'a EngineContext,
    /// Local group that receives the incoming root's children.
    root_target: NodeId,
    summary: MergeSummary,
}

impl<'a> Merger<'a> {
    /// Local identity of an incoming node. Legacy integer group ids become
    /// UUIDs offset from the local root UUID, so repeated merges of the same
    /// legacy file land on the same groups.
    fn local_id(&self, id: &NodeId) -> NodeId {
        if *id == self.other.root_id() {
            return self.root_target;
        }
        match (id, self.db.root_id().as_uuid()) {
            (NodeId::Int(i), Some(seed)) => {
                let seed = seed.as_u128();
                let low = (seed as u64).wrapping_add(u64::from(*i));
                NodeId::Uuid(Uuid::from_u128((seed & !u128::from(u64::MAX)) | u128::from(low)))
            }
            _ => *id,
        }
    }

    fn local_parent(&self, parent: Option<NodeId>) -> Option<NodeId> {
        parent
            .map(|p| self.local_id(&p))
            .filter(|p| self.db.group(p).is_some())
    }

    /// The deletion record for `id`, when the local side has one.
    fn local_deletion(&self, id: &NodeId) -> Option<&DeletedObject> {
        let uuid = id.as_uuid()?;
        self.db.deleted_objects.iter().find(|d| d.uuid == uuid)
    }

    fn forget_deletion(&mut self, id: &NodeId) {
        if let Some(uuid) = id.as_uuid() {
            self.db.deleted_objects.retain(|d| d.uuid != uuid);
        }
    }

    /// Copies an incoming entry, re-homing its attachments (history
    /// included) into the local pool. The copies carry no references yet.
    fn import_entry(&mut self, source: &Entry) -> Result<Entry> {
        let other = self.other;
        let mut entry = source.clone();
        entry.parent = None;
        let versions = std::iter::once(&mut entry.attachments)
            .chain(entry.history.iter_mut().map(|h| &mut h.attachments));
        for attachments in versions {
            for attachment in attachments.iter_mut() {
                let protected = other.binaries.get(&attachment.binary).map_or(false, |b| b.is_protected());
                let data = other.binaries.data(&attachment.binary)?;
                attachment.binary = self.db.binaries.register_unreferenced(&data, protected, self.ctx)?;
            }
        }
        Ok(entry)
    }

    fn merge_meta(&mut self) {
        let other = self.other;
        let theirs = &other.meta;
        let ours = &mut self.db.meta;
        if ours.name_changed < theirs.name_changed {
            ours.name = theirs.name.clone();
            ours.name_changed = theirs.name_changed;
        }
        if ours.description_changed < theirs.description_changed {
            ours.description = theirs.description.clone();
            ours.description_changed = theirs.description_changed;
        }
        if ours.default_username_changed < theirs.default_username_changed {
            ours.default_username = theirs.default_username.clone();
            ours.default_username_changed = theirs.default_username_changed;
        }
        if ours.master_key_changed < theirs.master_key_changed {
            ours.master_key_change_rec = theirs.master_key_change_rec;
            ours.master_key_change_force = theirs.master_key_change_force;
            ours.master_key_change_force_once = theirs.master_key_change_force_once;
            ours.master_key_changed = theirs.master_key_changed;
        }
        if ours.recycle_bin_changed < theirs.recycle_bin_changed {
            ours.recycle_bin_enabled = theirs.recycle_bin_enabled;
            ours.recycle_bin = theirs.recycle_bin;
            ours.recycle_bin_changed = theirs.recycle_bin_changed;
        }
        if ours.entry_templates_group_changed < theirs.entry_templates_group_changed {
            ours.entry_templates_group = theirs.entry_templates_group;
            ours.entry_templates_group_changed = theirs.entry_templates_group_changed;
        }
        if ours.settings_changed < theirs.settings_changed {
            ours.color = theirs.color.clone();
            ours.history = theirs.history;
            ours.settings_changed = theirs.settings_changed;
            self.db.crypto.cipher = other.crypto.cipher;
            self.db.crypto.kdf = other.crypto.kdf.clone();
            self.db.crypto.compression = other.crypto.compression;
        }
        merge_custom_data(&mut self.db.meta.custom_data, &other.meta.custom_data);
    }

    fn merge_icons(&mut self) -> Result<()> {
        let other = self.other;
        for icon in &other.meta.custom_icons {
            let data = other.icons.data(&icon.uuid)?;
            let local = self.db.meta.custom_icons.iter().position(|i| i.uuid == icon.uuid);
            match local {
                None => {
                    self.db.icons.insert(icon.uuid, &data, false, self.ctx)?;
                    self.db.icons.acquire(&icon.uuid)?;
                    self.db.meta.custom_icons.push(CustomIcon {
                        uuid: icon.uuid,
                        name: icon.name.clone(),
                        last_modification: icon.last_modification,
                    });
                    self.summary.icons_added += 1;
                }
                Some(pos) => {
                    let newer = match (self.db.meta.custom_icons[pos].last_modification, icon.last_modification) {
                        (Some(ours), Some(theirs)) => ours < theirs,
                        (None, Some(_)) => true,
                        _ => false,
                    };
                    if newer {
                        self.db.icons.insert(icon.uuid, &data, false, self.ctx)?;
                        self.db.meta.custom_icons[pos] = icon.clone();
                    }
                }
            }
        }
        Ok(())
    }

    fn merge_root(&mut self) {
        let other = self.other;
        if other.is_legacy() {
            return;
        }
        let theirs = other.root();
        let target = self.root_target;
        if let Some(ours) = self.db.group_mut(&target) {
            if ours.times.last_modification < theirs.times.last_modification {
                Self::update_group_fields(ours, theirs);
            }
        }
    }

    /// Copies everything but the structural links.
    fn update_group_fields(ours: &mut Group, theirs: &Group) {
        let mut custom_data = ours.custom_data.clone();
        merge_custom_data(&mut custom_data, &theirs.custom_data);
        let mut updated = theirs.clone();
        updated.id = ours.id;
        updated.parent = ours.parent;
        updated.groups = std::mem::take(&mut ours.groups);
        updated.entries = std::mem::take(&mut ours.entries);
        updated.custom_data = custom_data;
        *ours = updated;
    }

    fn merge_group(&mut self, source: &Group) -> Result<()> {
        let id = self.local_id(&source.id);
        let parent = self.local_parent(source.parent);

        if self.db.group(&id).is_none() {
            let deleted_later = self
                .local_deletion(&id)
                .map_or(false, |d| d.deletion_time >= source.times.last_modification);
            let parent = match parent {
                Some(parent) if !deleted_later => parent,
                _ => return Ok(()),
            };
            let mut group = source.clone();
            group.id = id;
            self.db.insert_group(&parent, group)?;
            self.forget_deletion(&id);
            self.summary.groups_added += 1;
            return Ok(());
        }

        let newer = match self.db.group_mut(&id) {
            Some(ours) => {
                merge_custom_data(&mut ours.custom_data, &source.custom_data);
                if ours.times.last_modification < source.times.last_modification {
                    Self::update_group_fields(ours, source);
                    true
                } else {
                    false
                }
            }
            None => false,
        };
        if newer {
            self.summary.groups_updated += 1;
            if let Some(parent) = parent {
                if let Err(e) = self.db.relink_group(&id, &parent) {
                    warn!(group = %id, error = %e, "merged group kept in place");
                }
            }
        }
        Ok(())
    }

    fn merge_entry(&mut self, source: &Entry) -> Result<()> {
        let id = source.id;
        let parent = self.local_parent(source.parent);
        let incoming = self.import_entry(source)?;

        let existing = match self.db.entry(&id) {
            Some(existing) => existing.clone(),
            None => {
                let deleted_later = self
                    .local_deletion(&id)
                    .map_or(false, |d| d.deletion_time >= incoming.times.last_modification);
                if let (Some(parent), false) = (parent, deleted_later) {
                    self.db.insert_entry(&parent, incoming)?;
                    self.forget_deletion(&id);
                    self.summary.entries_added += 1;
                }
                return Ok(());
            }
        };

        if existing.times.last_modification < incoming.times.last_modification {
            let mut replacement = incoming;
            absorb_history(&mut replacement, &existing);
            let mut custom_data = existing.custom_data.clone();
            merge_custom_data(&mut custom_data, &replacement.custom_data);
            replacement.custom_data = custom_data;
            replacement.parent = existing.parent;

            for key in replacement.attachment_refs().collect::<Vec<_>>() {
                self.db.binaries.acquire(&key)?;
            }
            self.db.release_attachments(&existing);
            if let Some(slot) = self.db.entry_mut(&id) {
                *slot = replacement;
            }
            if let Some(parent) = parent {
                self.db.relink_entry(&id, &parent)?;
            }
            self.db.trim_history(&id)?;
            self.summary.entries_updated += 1;
        } else {
            let mut merged = existing;
            merge_custom_data(&mut merged.custom_data, &incoming.custom_data);
            let added = if merged.times.last_modification > incoming.times.last_modification {
                absorb_history(&mut merged, &incoming)
            } else {
                Vec::new()
            };
            for version in &added {
                for attachment in &version.attachments {
                    self.db.binaries.acquire(&attachment.binary)?;
                }
            }
            let changed = !added.is_empty();
            if let Some(slot) = self.db.entry_mut(&id) {
                slot.history = merged.history;
                slot.custom_data = merged.custom_data;
            }
            if changed {
                self.db.trim_history(&id)?;
                self.summary.entries_updated += 1;
            }
        }
        Ok(())
    }

    /// First ancestor of `group` that the incoming deletions leave alone.
    fn surviving_ancestor(&self, group: &NodeId, deleted: &HashSet<Uuid>) -> NodeId {
        self.db
            .ancestors(&NodeRef::Group(*group))
            .into_iter()
            .find(|a| a.as_uuid().map_or(true, |u| !deleted.contains(&u)))
            .unwrap_or_else(|| self.db.root_id())
    }

    fn apply_deletions(&mut self) -> Result<()> {
        let other = self.other;
        let deleted: HashSet<Uuid> = other.deleted_objects.iter().map(|d| d.uuid).collect();
        for record in &other.deleted_objects {
            let id = NodeId::Uuid(record.uuid);

            let stale_entry = self
                .db
                .entry(&id)
                .map_or(false, |e| record.deletion_time > e.times.last_modification);
            if stale_entry {
                let entry = self.db.detach_entry(&id)?;
                self.db.release_attachments(&entry);
                self.summary.nodes_deleted += 1;
            }

            let stale_group = id != self.db.root_id()
                && self
                    .db
                    .group(&id)
                    .map_or(false, |g| record.deletion_time > g.times.last_modification);
            if stale_group {
                let target = self.surviving_ancestor(&id, &deleted);
                let (entries, groups) = match self.db.group(&id) {
                    Some(g) => (g.entries.clone(), g.groups.clone()),
                    None => (Vec::new(), Vec::new()),
                };
                // Children still present survived their own deletion record or
                // meet it later.
                for entry in &entries {
                    self.db.relink_entry(entry, &target)?;
                }
                for child in &groups {
                    self.db.relink_group(child, &target)?;
                }
                self.summary.nodes_deleted += self.db.purge_group(&id)?.len();
            }

            let stale_icon = self
                .db
                .meta
                .custom_icons
                .iter()
                .find(|i| i.uuid == record.uuid)
                .map_or(false, |i| i.last_modification.map_or(true, |t| record.deletion_time > t));
            if stale_icon {
                self.db.remove_custom_icon(&record.uuid)?;
            }

            match self.db.deleted_objects.iter_mut().find(|d| d.uuid == record.uuid) {
                Some(ours) => ours.deletion_time = ours.deletion_time.max(record.deletion_time),
                None => self.db.deleted_objects.push(record.clone()),
            }
        }
        Ok(())
    }

    fn run(mut self) -> Result<MergeSummary> {
        let other = self.other;
        if !other.is_legacy() {
            self.merge_meta();
        }
        self.merge_icons()?;
        self.merge_root();

        // Preorder, so a group always comes before its children.
        let root = other.root_id();
        let mut order: Vec<NodeRef> = other.child_entries(&root).map(|e| NodeRef::Entry(e.id)).collect();
        for group in other.descendant_groups(&root) {
            order.push(NodeRef::Group(group));
            order.extend(other.child_entries(&group).map(|e| NodeRef::Entry(e.id)));
        }
        for node in order {
            match node {
                NodeRef::Group(id) => {
                    if let Some(source) = other.group(&id) {
                        self.merge_group(source)?;
                    }
                }
                NodeRef::Entry(id) => {
                    if let Some(source) = other.entry(&id) {
                        self.merge_entry(source)?;
                    }
                }
            }
        }

        self.apply_deletions()?;
        self.db.binaries.purge_unreferenced();
        Ok(self.summary)
    }
}

impl Database {
    /// Merges `other` into this database.
    ///
    /// Nodes are matched by id. For a node on both sides the later
    /// modification wins and the losing version is added to the entry
    /// history. Incoming nodes are added under their parent when that
    /// parent exists here and no newer local deletion covers them. The
    /// incoming deletion records then remove local nodes not modified after
    /// the deletion; children of a deleted group move to its first
    /// surviving ancestor. A legacy `other` is merged without metadata, its
    /// integer group ids mapped to UUIDs.
    pub fn merge(&mut self, other: &Database, ctx: &EngineContext) -> Result<MergeSummary> {
        self.check_writable()?;
        if self.generation() != FormatGeneration::Current {
            return Err(DatabaseError::Other(
                "Слияние возможно только в базу формата KDBX".into(),
            ));
        }
        let their_root = other.root_id();
        let root_target = if !other.is_legacy() && self.group(&their_root).is_some() {
            their_root
        } else {
            self.root_id()
        };
        debug!(root = %root_target, legacy = other.is_legacy(), "merge started");

        let summary = Merger {
            db: self,
            other,
            ctx,
            root_target,
            summary: MergeSummary::default(),
        }
        .run()?;
        info!(
            groups_added = summary.groups_added,
            entries_added = summary.entries_added,
            groups_updated = summary.groups_updated,
            entries_updated = summary.entries_updated,
            deleted = summary.nodes_deleted,
            "databases merged"
        );
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn base() -> (Database, NodeId, NodeId) {
        let mut db = Database::new("Shared");
        let root = db.root_id();
        let web = db.add_group(&root, Group::new("Web")).unwrap();
        let mut mail = Entry::new();
        mail.set_title("Mail");
        mail.set_password("v1");
        let mail = db.add_entry(&web, mail).unwrap();
        (db, web, mail)
    }

    /// A second copy of the same database, as if synced to another device.
    fn fork(db: &Database, ctx: &EngineContext) -> Database {
        let mut copy = Database::new("Shared");
        copy.merge(db, ctx).unwrap();
        copy
    }

    fn age(db: &mut Database, id: &NodeId, days: i64) {
        let entry = db.entry_mut(id).unwrap();
        entry.times.last_modification = entry.times.last_modification - Duration::days(days);
    }

    #[test]
    fn test_new_nodes_are_added_under_their_parent() {
        let ctx = EngineContext::default();
        let (theirs, web, mail) = base();
        let mut ours = Database::new("Mine");
        let summary = ours.merge(&theirs, &ctx).unwrap();

        assert_eq!(summary.groups_added, 1);
        assert_eq!(summary.entries_added, 1);
        assert_eq!(ours.entry(&mail).unwrap().parent, Some(web));
        assert_eq!(ours.group(&web).unwrap().parent, Some(ours.root_id()));
        assert_eq!(ours.entry(&mail).unwrap().password(), "v1");
    }

    #[test]
    fn test_newer_side_wins_and_older_goes_to_history() {
        let ctx = EngineContext::default();
        let (mut ours, _, mail) = base();
        let mut theirs = fork(&ours, &ctx);

        age(&mut ours, &mail, 2);
        let edited = theirs.entry_mut(&mail).unwrap();
        edited.set_password("v2");
        edited.times.last_modification = edited.times.last_modification + Duration::days(1);

        let summary = ours.merge(&theirs, &ctx).unwrap();
        assert_eq!(summary.entries_updated, 1);
        let merged = ours.entry(&mail).unwrap();
        assert_eq!(merged.password(), "v2");
        assert_eq!(merged.history.len(), 1);
        assert_eq!(merged.history[0].password(), "v1");

        // The same merge again changes nothing.
        assert!(ours.merge(&theirs, &ctx).unwrap().is_empty());
        assert_eq!(ours.entry(&mail).unwrap().history.len(), 1);
    }

    #[test]
    fn test_older_incoming_version_only_feeds_history() {
        let ctx = EngineContext::default();
        let (mut ours, _, mail) = base();
        let mut theirs = fork(&ours, &ctx);
        theirs.entry_mut(&mail).unwrap().set_password("stale");
        age(&mut theirs, &mail, 3);

        ours.merge(&theirs, &ctx).unwrap();
        let merged = ours.entry(&mail).unwrap();
        assert_eq!(merged.password(), "v1");
        assert_eq!(merged.history.len(), 1);
        assert_eq!(merged.history[0].password(), "stale");
    }

    #[test]
    fn test_incoming_deletions_apply_unless_modified_later() {
        let ctx = EngineContext::default();
        let (mut ours, web, mail) = base();
        let root = ours.root_id();
        let mut keep = Entry::new();
        keep.set_title("Keep");
        let keep = ours.add_entry(&web, keep).unwrap();
        let mut theirs = fork(&ours, &ctx);

        age(&mut ours, &mail, 1);
        theirs.remove_entry(&mail).unwrap();
        theirs.remove_group(&web).unwrap();
        // Edited here after the other side deleted it.
        let kept = ours.entry_mut(&keep).unwrap();
        kept.times.last_modification = kept.times.last_modification + Duration::days(1);
        let group = ours.group_mut(&web).unwrap();
        group.times.last_modification = group.times.last_modification - Duration::days(1);

        ours.merge(&theirs, &ctx).unwrap();
        assert!(ours.entry(&mail).is_none());
        assert!(ours.group(&web).is_none());
        assert_eq!(ours.entry(&keep).unwrap().parent, Some(root));
        let uuid = mail.as_uuid().unwrap();
        assert!(ours.deleted_objects.iter().any(|d| d.uuid == uuid));
    }

    #[test]
    fn test_locally_deleted_node_is_not_resurrected() {
        let ctx = EngineContext::default();
        let (mut ours, _, mail) = base();
        let mut theirs = fork(&ours, &ctx);
        age(&mut theirs, &mail, 1);
        ours.remove_entry(&mail).unwrap();

        ours.merge(&theirs, &ctx).unwrap();
        assert!(ours.entry(&mail).is_none());
    }

    #[test]
    fn test_attachments_are_copied_into_the_local_pool() {
        let ctx = EngineContext::default();
        let (mut theirs, _, mail) = base();
        theirs.add_attachment(&mail, "codes.txt", b"123 456", true, &ctx).unwrap();
        let mut ours = Database::new("Mine");
        ours.add_custom_icon(b"unrelated icon", "x", &ctx).unwrap();

        ours.merge(&theirs, &ctx).unwrap();
        assert_eq!(&*ours.attachment_data(&mail, "codes.txt").unwrap(), b"123 456");
        let key = ours.entry(&mail).unwrap().attachment("codes.txt").unwrap().binary;
        assert_eq!(ours.binaries.get(&key).unwrap().refs(), 1);
        assert!(ours.binaries.get(&key).unwrap().is_protected());
    }

    #[test]
    fn test_newer_metadata_is_taken() {
        let ctx = EngineContext::default();
        let (mut ours, _, _) = base();
        let mut theirs = fork(&ours, &ctx);
        theirs.meta.name = "Renamed".into();
        theirs.meta.name_changed = ours.meta.name_changed + Duration::hours(1);
        theirs.meta.description = "ignored".into();
        theirs.meta.description_changed = ours.meta.description_changed - Duration::hours(1);

        ours.merge(&theirs, &ctx).unwrap();
        assert_eq!(ours.meta.name, "Renamed");
        assert_eq!(ours.meta.description, "");
    }

    #[test]
    fn test_legacy_source_and_target() {
        let ctx = EngineContext::default();
        let mut legacy = Database::new_legacy();
        let hidden = legacy.root_id();
        let group = legacy.add_group(&hidden, legacy.new_group("Old")).unwrap();
        let mut entry = Entry::new();
        entry.set_title("From KDB");
        let entry = legacy.add_entry(&group, entry).unwrap();

        let mut ours = Database::new("Mine");
        ours.merge(&legacy, &ctx).unwrap();
        let merged = ours.entry(&entry).unwrap();
        let parent = ours.group(&merged.parent.unwrap()).unwrap();
        assert_eq!(parent.title, "Old");
        assert!(parent.id.as_uuid().is_some());

        // Merging the same file twice reuses the mapped group.
        ours.merge(&legacy, &ctx).unwrap();
        assert_eq!(ours.group_count(), 2);

        assert!(legacy.merge(&ours, &ctx).is_err());
        ours.set_read_only(true);
        assert!(matches!(ours.merge(&legacy, &ctx), Err(DatabaseError::ReadOnly)));
    }
}
