//! Поиск записей
//!
//! A search walks the tree with [`Database::do_for_each_child`] and collects
//! matching entries into a virtual group that is not part of the tree.

use regex::{Regex, RegexBuilder};
use tracing::debug;

use super::database::{Database, GroupVisit, Visit};
use super::entry::Entry;
use super::group::Group;
use super::node::NodeId;
use crate::error::{DatabaseError, Result};
use crate::format::codec::uuid_hex;

pub const DEFAULT_MAX_RESULTS: usize = 999;

#[derive(Debug, Clone)]
pub struct SearchParameters {
    pub text: String,
    pub search_in_titles: bool,
    pub search_in_usernames: bool,
    pub search_in_passwords: bool,
    pub search_in_urls: bool,
    pub search_in_notes: bool,
    pub search_in_uuids: bool,
    pub search_in_other_fields: bool,
    pub search_in_tags: bool,
    pub case_sensitive: bool,
    pub is_regex: bool,
    pub search_in_expired: bool,
    pub search_in_recycle_bin: bool,
    pub search_in_templates: bool,
    /// Skip groups whose searching is disabled.
    pub respect_disabled_groups: bool,
    pub max_results: usize,
    /// Group to search below; the root when unset.
    pub start_group: Option<NodeId>,
}

impl Default for SearchParameters {
    fn default() -> Self {
        Self {
            text: String::new(),
            search_in_titles: true,
            search_in_usernames: true,
            search_in_passwords: false,
            search_in_urls: true,
            search_in_notes: true,
            search_in_uuids: false,
            search_in_other_fields: true,
            search_in_tags: true,
            case_sensitive: false,
            is_regex: false,
            search_in_expired: false,
            search_in_recycle_bin: false,
            search_in_templates: false,
            respect_disabled_groups: true,
            max_results: DEFAULT_MAX_RESULTS,
            start_group: None,
        }
    }
}

impl SearchParameters {
    pub fn new(text: &str) -> Self {
        Self {
            text: text.to_string(),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone)]
pub struct SearchResult {
    /// Virtual group titled with the quoted query; `entries` holds the hits.
    pub group: Group,
    pub capped: bool,
    max_results: usize,
}

impl SearchResult {
    pub fn entries(&self) -> &[NodeId] {
        &self.group.entries
    }

    pub fn len(&self) -> usize {
        self.group.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.group.entries.is_empty()
    }

    /// Hit count for display, `"999+"` once the cap was reached.
    pub fn count_label(&self) -> String {
        if self.capped {
            format!("{}+", self.max_results)
        } else {
            self.len().to_string()
        }
    }
}

enum Matcher {
    Words { words: Vec<String>, case_sensitive: bool },
    Pattern(Regex),
}

impl Matcher {
    fn new(params: &SearchParameters) -> Result<Self> {
        if params.is_regex {
            let regex = RegexBuilder::new(&format!("^(?:{})$", params.text))
                .dot_matches_new_line(true)
                .case_insensitive(!params.case_sensitive)
                .build()
                .map_err(|e| DatabaseError::Other(format!("Неверное регулярное выражение: {}", e)))?;
            return Ok(Matcher::Pattern(regex));
        }
        let words = params
            .text
            .split(' ')
            .filter(|w| !w.is_empty())
            .map(|w| {
                if params.case_sensitive {
                    w.to_string()
                } else {
                    w.to_lowercase()
                }
            })
            .collect();
        Ok(Matcher::Words {
            words,
            case_sensitive: params.case_sensitive,
        })
    }

    /// Every word must occur in this one value.
    fn matches(&self, value: &str) -> bool {
        match self {
            Matcher::Pattern(regex) => regex.is_match(value),
            Matcher::Words { words, case_sensitive } => {
                if words.is_empty() || value.is_empty() {
                    return false;
                }
                if *case_sensitive {
                    words.iter().all(|w| value.contains(w.as_str()))
                } else {
                    let lowered = value.to_lowercase();
                    words.iter().all(|w| lowered.contains(w.as_str()))
                }
            }
        }
    }

    fn matches_entry(&self, entry: &Entry, params: &SearchParameters) -> bool {
        (params.search_in_titles && self.matches(entry.title()))
            || (params.search_in_usernames && self.matches(entry.username()))
            || (params.search_in_passwords && self.matches(entry.password()))
            || (params.search_in_urls && self.matches(entry.url()))
            || (params.search_in_notes && self.matches(entry.notes()))
            || (params.search_in_uuids
                && entry.id.as_uuid().map_or(false, |u| self.matches(&uuid_hex(&u))))
            || (params.search_in_other_fields
                && entry.custom_fields().any(|(_, v)| self.matches(v.as_str())))
            || (params.search_in_tags && entry.tags.iter().any(|t| self.matches(t)))
    }
}

/// Collects entries matching `params` below the start group.
pub fn search(db: &Database, params: &SearchParameters) -> Result<SearchResult> {
    let mut group = Group::new(&format!("\"{}\"", params.text));
    group.parent = None;
    let mut result = SearchResult {
        group,
        capped: false,
        max_results: params.max_results,
    };
    if params.text.trim().is_empty() || params.max_results == 0 {
        return Ok(result);
    }

    let matcher = Matcher::new(params)?;
    let start = params.start_group.unwrap_or_else(|| db.root_id());
    let recycle_bin = db.meta.recycle_bin;
    let templates = db.meta.entry_templates_group;

    let mut hits: Vec<NodeId> = Vec::new();
    let mut capped = false;
    db.do_for_each_child(
        &start,
        &mut |entry: &Entry| {
            if !params.search_in_expired && entry.is_expired() {
                return Visit::Continue;
            }
            if matcher.matches_entry(entry, params) {
                hits.push(entry.id);
                if hits.len() >= params.max_results {
                    capped = true;
                    return Visit::Stop;
                }
            }
            Visit::Continue
        },
        &mut |group: &Group| {
            // An explicit opt-in overrides the bin's own searching flag.
            if Some(group.id) == recycle_bin {
                return if params.search_in_recycle_bin {
                    GroupVisit::Enter
                } else {
                    GroupVisit::Skip
                };
            }
            if Some(group.id) == templates {
                return if params.search_in_templates {
                    GroupVisit::Enter
                } else {
                    GroupVisit::Skip
                };
            }
            if params.respect_disabled_groups && !group.is_searchable() {
                return GroupVisit::Skip;
            }
            GroupVisit::Enter
        },
        false,
    );

    debug!(hits = hits.len(), capped, "search finished");
    result.group.entries = hits;
    result.capped = capped;
    Ok(result)
}
