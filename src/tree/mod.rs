//! In-memory password tree
//!
//! Groups and entries with their history, the deduplicated attachment pool,
//! search and merging.

pub mod binary;
pub mod database;
pub mod entry;
pub mod group;
pub mod merge;
pub mod node;
pub mod search;

pub use binary::{BinaryCache, BinaryPool, ScratchDirCache};
pub use database::{
    Compression, CryptoSettings, CustomIcon, Database, DeletedObject, FormatGeneration, GroupVisit,
    HistoryLimits, Meta, Visit, LEGACY_ROOT_ID,
};
pub use entry::{Attachment, AutoType, AutoTypeAssociation, Entry, ProtectedValue};
pub use group::Group;
pub use merge::MergeSummary;
pub use node::{CustomData, NodeIcon, NodeId, NodeKind, NodeRef, Times, Timestamp};
pub use search::{search, SearchParameters, SearchResult};
