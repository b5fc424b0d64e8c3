//! Constants for the X-tree page file format.

use super::xtree_types::PageId;

/// Magic number identifying an X-tree page file ("XTRE").
pub const MAGIC: u32 = 0x58545245;

/// File format version.
pub const VERSION: u32 = 1;

/// Size of the node prelude every page starts with:
/// `page_id: u32, is_leaf: u8, is_super: u8, num_entries: u32, capacity: u32`.
pub const NODE_PRELUDE_SIZE: usize = 14;

/// Number of page-size slots reserved at the start of the file for the
/// header. Page `i` lives at byte offset `(HEADER_PAGES + i) * page_size`.
pub const HEADER_PAGES: u32 = 1;

/// The root node keeps this page id for the whole life of the tree; root
/// splits move the old root's content to a fresh page instead.
pub const ROOT_PAGE_ID: PageId = 0;

/// Default page size in bytes.
pub const DEFAULT_PAGE_SIZE: u32 = 4096;

/// Default overlap threshold above which a topological split is rejected.
pub const DEFAULT_MAX_OVERLAP: f32 = 0.2;

/// Default ratio deriving `leaf_minimum`/`dir_minimum` from the capacities.
pub const DEFAULT_REL_MIN_ENTRIES: f64 = 0.4;

/// Default ratio deriving `min_fanout` from the directory capacity.
pub const DEFAULT_REL_MIN_FANOUT: f64 = 0.3;

/// Default fraction of a node's entries removed on forced reinsertion.
pub const DEFAULT_REINSERT_FRACTION: f64 = 0.3;
