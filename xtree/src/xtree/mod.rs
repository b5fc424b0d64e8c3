//! Disk-resident X-tree for high-dimensional point data.
//!
//! The X-tree (Berchtold, Keim, Kriegel, VLDB'96) generalizes the R*-tree
//! in two ways: every directory entry tracks the history of split axes
//! used beneath it, and when no split with acceptable overlap exists the
//! node becomes a variable-size supernode instead of splitting. This
//! module provides:
//! - the paged tree data model (leaf, directory and supernodes),
//! - the insertion path with forced reinsertion and the X-split,
//! - the page file layout with the appended supernode region,
//! - the commit/load protocol.

pub mod split_history;
pub mod xtree_constants;
pub mod xtree_settings;
pub mod xtree_storage;
pub mod xtree_types;

mod xsplit;
mod xtree_impl;

pub use split_history::SplitHistory;
pub use xtree_constants::ROOT_PAGE_ID;
pub use xtree_impl::XTree;
pub use xtree_settings::{Capacities, Overlap, XTreeSettings};
pub use xtree_storage::PageStore;
pub use xtree_types::{
    DirectoryEntry, LeafEntry, Node, NodeKind, PageId, XTreeError, XTreeHeader, XTreeResult,
    XTreeStats,
};
