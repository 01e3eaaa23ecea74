//! Groups: folders holding entries and other groups.

use uuid::Uuid;

use super::node::{CustomData, NodeIcon, NodeId, Times, ICON_FOLDER};

/// A folder node. Children are stored as ids; the [`Database`](super::Database)
/// arena owns the nodes themselves.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Group {
    pub id: NodeId,
    /// `None` only for the root.
    pub parent: Option<NodeId>,
    pub title: String,
    pub notes: String,
    pub icon: NodeIcon,
    pub times: Times,
    /// Child groups, in display order.
    pub groups: Vec<NodeId>,
    /// Child entries, in display order.
    pub entries: Vec<NodeId>,
    pub is_expanded: bool,
    pub default_auto_type_sequence: String,
    /// `None` inherits the parent's setting.
    pub enable_auto_type: Option<bool>,
    pub enable_searching: Option<bool>,
    pub last_top_visible_entry: Option<Uuid>,
    pub custom_data: CustomData,
    /// Version 4.1 and later.
    pub tags: Vec<String>,
    /// Group the node was last moved out of, version 4.1 and later.
    pub previous_parent: Option<Uuid>,
    /// Opaque flags word of the legacy format.
    pub legacy_flags: u32,
}

impl Group {
    /// A group with a random UUID; legacy trees use [`Database::new_group`](super::Database::new_group).
    pub fn new(title: &str) -> Self {
        Self::with_id(NodeId::random(), title)
    }

    pub fn with_id(id: NodeId, title: &str) -> Self {
        Self {
            id,
            parent: None,
            title: title.to_string(),
            notes: String::new(),
            icon: NodeIcon::standard(ICON_FOLDER),
            times: Times::now(),
            groups: Vec::new(),
            entries: Vec::new(),
            is_expanded: true,
            default_auto_type_sequence: String::new(),
            enable_auto_type: None,
            enable_searching: None,
            last_top_visible_entry: None,
            custom_data: CustomData::default(),
            tags: Vec::new(),
            previous_parent: None,
            legacy_flags: 0,
        }
    }

    /// No child groups and no entries.
    pub fn is_empty(&self) -> bool {
        self.groups.is_empty() && self.entries.is_empty()
    }

    /// Searching is on unless explicitly disabled.
    pub fn is_searchable(&self) -> bool {
        self.enable_searching != Some(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_searching_inherits_unless_disabled() {
        let mut group = Group::new("Web");
        assert!(group.is_searchable());
        group.enable_searching = Some(true);
        assert!(group.is_searchable());
        group.enable_searching = Some(false);
        assert!(!group.is_searchable());
    }

    #[test]
    fn test_new_group_is_empty_folder() {
        let group = Group::with_id(NodeId::Int(7), "Legacy");
        assert!(group.is_empty());
        assert_eq!(group.icon, NodeIcon::standard(ICON_FOLDER));
        assert_eq!(group.parent, None);
    }
}
