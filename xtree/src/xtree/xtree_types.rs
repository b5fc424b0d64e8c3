//! Core types for the X-tree: error taxonomy, entries, the node variant and
//! the file header, together with their fixed on-disk encoding.
//!
//! Every page begins with a 14-byte prelude
//! (`page_id: u32, is_leaf: u8, is_super: u8, num_entries: u32,
//! capacity: u32`) followed by the entries. The layout is fixed-width and
//! little-endian so capacities can be derived from the page size ahead of
//! time.

use std::io;

use thiserror::Error;

use super::split_history::SplitHistory;
use super::xtree_constants::NODE_PRELUDE_SIZE;
use crate::bounding_box::{BoundingBox, Spatial};

// ============================================================================
// Error Types
// ============================================================================

/// Errors surfaced at the index boundary.
#[derive(Debug, Error)]
pub enum XTreeError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    #[error("corrupt index file: {0}")]
    CorruptFile(String),

    #[error("numeric overflow: {0}")]
    NumericOverflow(String),

    #[error("capacity exceeded: {0}")]
    CapacityExceeded(String),

    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),

    #[error("operation not supported: {0}")]
    NotSupported(&'static str),

    #[error("invalid tree state: {0}")]
    InvalidState(String),
}

/// Result type for index operations.
pub type XTreeResult<T> = Result<T, XTreeError>;

/// Page id, the unique and stable identifier of a node.
pub type PageId = u32;

// ============================================================================
// Byte codec helpers
// ============================================================================

pub(crate) fn put_u8(buf: &mut Vec<u8>, v: u8) {
    buf.push(v);
}

pub(crate) fn put_u32(buf: &mut Vec<u8>, v: u32) {
    buf.extend_from_slice(&v.to_le_bytes());
}

pub(crate) fn put_u64(buf: &mut Vec<u8>, v: u64) {
    buf.extend_from_slice(&v.to_le_bytes());
}

pub(crate) fn put_f32(buf: &mut Vec<u8>, v: f32) {
    buf.extend_from_slice(&v.to_le_bytes());
}

pub(crate) fn put_f64(buf: &mut Vec<u8>, v: f64) {
    buf.extend_from_slice(&v.to_le_bytes());
}

/// Bounds-checked little-endian reader over a byte slice. Running past the
/// end means the page bytes do not describe what the prelude promised.
pub(crate) struct ByteReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> ByteReader<'a> {
    pub fn new(buf: &'a [u8]) -> ByteReader<'a> {
        ByteReader { buf, pos: 0 }
    }

    fn take(&mut self, n: usize) -> XTreeResult<&'a [u8]> {
        if self.pos + n > self.buf.len() {
            return Err(XTreeError::CorruptFile(format!(
                "unexpected end of page at byte {} (wanted {} more)",
                self.pos, n
            )));
        }
        let s = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(s)
    }

    pub fn u8(&mut self) -> XTreeResult<u8> {
        Ok(self.take(1)?[0])
    }

    pub fn u32(&mut self) -> XTreeResult<u32> {
        Ok(u32::from_le_bytes(self.take(4)?.try_into().unwrap()))
    }

    pub fn u64(&mut self) -> XTreeResult<u64> {
        Ok(u64::from_le_bytes(self.take(8)?.try_into().unwrap()))
    }

    pub fn f32(&mut self) -> XTreeResult<f32> {
        Ok(f32::from_le_bytes(self.take(4)?.try_into().unwrap()))
    }

    pub fn f64(&mut self) -> XTreeResult<f64> {
        Ok(f64::from_le_bytes(self.take(8)?.try_into().unwrap()))
    }
}

// ============================================================================
// Entries
// ============================================================================

/// An entry in a leaf node: one indexed point with its external id.
#[derive(Debug, Clone, PartialEq)]
pub struct LeafEntry {
    pub id: u64,
    pub point: Vec<f64>,
}

impl LeafEntry {
    pub fn new(id: u64, point: Vec<f64>) -> LeafEntry {
        LeafEntry { id, point }
    }

    /// Serialized size: `id: u64` plus d coordinates.
    pub fn encoded_len(dims: u32) -> usize {
        8 + 8 * dims as usize
    }

    fn encode(&self, buf: &mut Vec<u8>) {
        put_u64(buf, self.id);
        for &c in &self.point {
            put_f64(buf, c);
        }
    }

    fn decode(r: &mut ByteReader<'_>, dims: u32) -> XTreeResult<LeafEntry> {
        let id = r.u64()?;
        let mut point = Vec::with_capacity(dims as usize);
        for _ in 0..dims {
            point.push(r.f64()?);
        }
        Ok(LeafEntry { id, point })
    }
}

impl Spatial for LeafEntry {
    fn dims(&self) -> usize {
        self.point.len()
    }

    fn lo(&self, dim: usize) -> f64 {
        self.point[dim]
    }

    fn hi(&self, dim: usize) -> f64 {
        self.point[dim]
    }
}

/// An entry in a directory node: child page, its MBR and the split history
/// accumulated for the subtree.
#[derive(Debug, Clone)]
pub struct DirectoryEntry {
    pub child: PageId,
    pub mbr: BoundingBox,
    pub split_history: SplitHistory,
}

impl DirectoryEntry {
    pub fn new(child: PageId, mbr: BoundingBox, split_history: SplitHistory) -> DirectoryEntry {
        DirectoryEntry {
            child,
            mbr,
            split_history,
        }
    }

    /// Serialized size: `child: u32`, both MBR corners, history words.
    pub fn encoded_len(dims: u32) -> usize {
        4 + 16 * dims as usize + 8 * SplitHistory::word_count(dims)
    }

    fn encode(&self, buf: &mut Vec<u8>) {
        put_u32(buf, self.child);
        for &c in self.mbr.lo_coords() {
            put_f64(buf, c);
        }
        for &c in self.mbr.hi_coords() {
            put_f64(buf, c);
        }
        for &w in self.split_history.words() {
            put_u64(buf, w);
        }
    }

    fn decode(r: &mut ByteReader<'_>, dims: u32) -> XTreeResult<DirectoryEntry> {
        let child = r.u32()?;
        let mut lo = Vec::with_capacity(dims as usize);
        let mut hi = Vec::with_capacity(dims as usize);
        for _ in 0..dims {
            lo.push(r.f64()?);
        }
        for _ in 0..dims {
            hi.push(r.f64()?);
        }
        let mut words = Vec::with_capacity(SplitHistory::word_count(dims));
        for _ in 0..SplitHistory::word_count(dims) {
            words.push(r.u64()?);
        }
        Ok(DirectoryEntry {
            child,
            mbr: BoundingBox::new(lo, hi),
            split_history: SplitHistory::from_words(dims, words),
        })
    }
}

impl Spatial for DirectoryEntry {
    fn dims(&self) -> usize {
        self.mbr.dims()
    }

    fn lo(&self, dim: usize) -> f64 {
        self.mbr.lo(dim)
    }

    fn hi(&self, dim: usize) -> f64 {
        self.mbr.hi(dim)
    }
}

// ============================================================================
// Node
// ============================================================================

/// Kind of a node page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    Leaf,
    Directory,
    Super,
}

/// A tree node. Supernodes are directory nodes whose capacity has grown
/// beyond the regular directory capacity in multiples of it; they carry
/// their grown capacity explicitly and live in memory until commit.
#[derive(Debug, Clone)]
pub enum Node {
    Leaf {
        page_id: PageId,
        entries: Vec<LeafEntry>,
    },
    Directory {
        page_id: PageId,
        entries: Vec<DirectoryEntry>,
    },
    Super {
        page_id: PageId,
        entries: Vec<DirectoryEntry>,
        capacity: u32,
    },
}

impl Node {
    pub fn new_leaf(page_id: PageId) -> Node {
        Node::Leaf {
            page_id,
            entries: Vec::new(),
        }
    }

    pub fn new_directory(page_id: PageId) -> Node {
        Node::Directory {
            page_id,
            entries: Vec::new(),
        }
    }

    pub fn page_id(&self) -> PageId {
        match self {
            Node::Leaf { page_id, .. }
            | Node::Directory { page_id, .. }
            | Node::Super { page_id, .. } => *page_id,
        }
    }

    pub fn set_page_id(&mut self, id: PageId) {
        match self {
            Node::Leaf { page_id, .. }
            | Node::Directory { page_id, .. }
            | Node::Super { page_id, .. } => *page_id = id,
        }
    }

    pub fn kind(&self) -> NodeKind {
        match self {
            Node::Leaf { .. } => NodeKind::Leaf,
            Node::Directory { .. } => NodeKind::Directory,
            Node::Super { .. } => NodeKind::Super,
        }
    }

    pub fn is_leaf(&self) -> bool {
        matches!(self, Node::Leaf { .. })
    }

    pub fn is_super(&self) -> bool {
        matches!(self, Node::Super { .. })
    }

    pub fn num_entries(&self) -> usize {
        match self {
            Node::Leaf { entries, .. } => entries.len(),
            Node::Directory { entries, .. } | Node::Super { entries, .. } => entries.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.num_entries() == 0
    }

    /// Maximum stable fill of this node. A node transiently holding one
    /// entry more than this is overflowing and gets treated on the way up.
    pub fn capacity(&self, leaf_capacity: u32, dir_capacity: u32) -> u32 {
        match self {
            Node::Leaf { .. } => leaf_capacity,
            Node::Directory { .. } => dir_capacity,
            Node::Super { capacity, .. } => *capacity,
        }
    }

    pub fn leaf_entries(&self) -> &[LeafEntry] {
        match self {
            Node::Leaf { entries, .. } => entries,
            _ => &[],
        }
    }

    pub fn leaf_entries_mut(&mut self) -> &mut Vec<LeafEntry> {
        match self {
            Node::Leaf { entries, .. } => entries,
            _ => panic!("not a leaf node"),
        }
    }

    pub fn dir_entries(&self) -> &[DirectoryEntry] {
        match self {
            Node::Directory { entries, .. } | Node::Super { entries, .. } => entries,
            _ => &[],
        }
    }

    pub fn dir_entries_mut(&mut self) -> &mut Vec<DirectoryEntry> {
        match self {
            Node::Directory { entries, .. } | Node::Super { entries, .. } => entries,
            _ => panic!("not a directory node"),
        }
    }

    pub fn add_leaf_entry(&mut self, e: LeafEntry) {
        self.leaf_entries_mut().push(e);
    }

    pub fn add_directory_entry(&mut self, e: DirectoryEntry) {
        self.dir_entries_mut().push(e);
    }

    /// Tight bounding box over all entries, or `None` for an empty node.
    pub fn compute_mbr(&self) -> Option<BoundingBox> {
        match self {
            Node::Leaf { entries, .. } => {
                let mut it = entries.iter();
                let mut mbr = BoundingBox::of(it.next()?);
                for e in it {
                    mbr.expand(e);
                }
                Some(mbr)
            }
            Node::Directory { entries, .. } | Node::Super { entries, .. } => {
                let mut it = entries.iter();
                let mut mbr = it.next()?.mbr.clone();
                for e in it {
                    mbr.expand(&e.mbr);
                }
                Some(mbr)
            }
        }
    }

    /// Converts a directory node into a supernode with one growth step of
    /// extra capacity, so the overflowing entry fits with headroom.
    pub fn make_super(&mut self, dir_capacity: u32) -> XTreeResult<u32> {
        match self {
            Node::Directory { page_id, entries } => {
                let capacity = 2 * dir_capacity;
                let node = Node::Super {
                    page_id: *page_id,
                    entries: std::mem::take(entries),
                    capacity,
                };
                *self = node;
                Ok(capacity)
            }
            _ => Err(XTreeError::InvalidState(
                "only a directory node can become a supernode".into(),
            )),
        }
    }

    /// Grows a supernode by one growth step, returning the new capacity.
    pub fn grow_super(&mut self, dir_capacity: u32) -> XTreeResult<u32> {
        match self {
            Node::Super { capacity, .. } => {
                *capacity += dir_capacity;
                Ok(*capacity)
            }
            _ => Err(XTreeError::InvalidState("grow_super on a non-supernode".into())),
        }
    }

    /// Shrinks a supernode by one growth step. When the capacity recedes to
    /// exactly the regular directory capacity the node is reclassified as a
    /// normal directory node. Returns the new capacity.
    pub fn shrink_super(&mut self, dir_capacity: u32) -> XTreeResult<u32> {
        match self {
            Node::Super {
                page_id,
                entries,
                capacity,
            } => {
                let new_capacity = *capacity - dir_capacity;
                if entries.len() as u32 > new_capacity {
                    return Err(XTreeError::InvalidState(format!(
                        "cannot shrink supernode {} below its fill ({} entries)",
                        page_id,
                        entries.len()
                    )));
                }
                if new_capacity == dir_capacity {
                    *self = Node::Directory {
                        page_id: *page_id,
                        entries: std::mem::take(entries),
                    };
                } else {
                    *capacity = new_capacity;
                }
                Ok(new_capacity)
            }
            _ => Err(XTreeError::InvalidState("shrink_super on a non-supernode".into())),
        }
    }

    /// Serializes the node: 14-byte prelude followed by the entries.
    /// The page-size padding is applied by the page store.
    pub fn encode(&self, dims: u32, leaf_capacity: u32, dir_capacity: u32) -> Vec<u8> {
        let mut buf = Vec::with_capacity(NODE_PRELUDE_SIZE);
        put_u32(&mut buf, self.page_id());
        put_u8(&mut buf, self.is_leaf() as u8);
        put_u8(&mut buf, self.is_super() as u8);
        put_u32(&mut buf, self.num_entries() as u32);
        put_u32(&mut buf, self.capacity(leaf_capacity, dir_capacity));
        match self {
            Node::Leaf { entries, .. } => {
                for e in entries {
                    e.encode(&mut buf);
                }
            }
            Node::Directory { entries, .. } | Node::Super { entries, .. } => {
                for e in entries {
                    e.encode(&mut buf);
                }
            }
        }
        buf
    }

    /// Deserializes a node from page bytes, validating the prelude against
    /// the tree-wide capacities.
    pub fn decode(
        buf: &[u8],
        dims: u32,
        leaf_capacity: u32,
        dir_capacity: u32,
    ) -> XTreeResult<Node> {
        let mut r = ByteReader::new(buf);
        let page_id = r.u32()?;
        let is_leaf = r.u8()? != 0;
        let is_super = r.u8()? != 0;
        let num_entries = r.u32()?;
        let capacity = r.u32()?;

        if is_leaf && is_super {
            return Err(XTreeError::CorruptFile(format!(
                "page {page_id} is flagged both leaf and supernode"
            )));
        }
        let expected = if is_leaf {
            leaf_capacity
        } else if is_super {
            capacity
        } else {
            dir_capacity
        };
        if capacity != expected {
            return Err(XTreeError::CorruptFile(format!(
                "page {page_id} declares capacity {capacity}, expected {expected}"
            )));
        }
        // one slot of slack: a crash may leave a transiently overflowing page
        if num_entries > capacity + 1 {
            return Err(XTreeError::CorruptFile(format!(
                "page {page_id} declares {num_entries} entries for capacity {capacity}"
            )));
        }

        if is_leaf {
            let mut entries = Vec::with_capacity(num_entries as usize);
            for _ in 0..num_entries {
                entries.push(LeafEntry::decode(&mut r, dims)?);
            }
            Ok(Node::Leaf { page_id, entries })
        } else {
            let mut entries = Vec::with_capacity(num_entries as usize);
            for _ in 0..num_entries {
                entries.push(DirectoryEntry::decode(&mut r, dims)?);
            }
            if is_super {
                Ok(Node::Super {
                    page_id,
                    entries,
                    capacity,
                })
            } else {
                Ok(Node::Directory { page_id, entries })
            }
        }
    }
}

// ============================================================================
// File Header
// ============================================================================

/// File header stored in the reserved region at the start of the page file.
/// Extends the generic paged-tree header with the X-tree parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct XTreeHeader {
    pub magic: u32,
    pub version: u32,
    pub page_size: u32,
    pub dir_capacity: u32,
    pub leaf_capacity: u32,
    pub dir_minimum: u32,
    pub leaf_minimum: u32,
    pub min_fanout: u32,
    pub num_elements: u64,
    pub dimensionality: u32,
    pub max_overlap: f32,
    /// Byte offset of the supernode region relative to the start of the
    /// paged region, 0 while the tree has never been committed.
    pub supernode_offset: u64,
}

impl XTreeHeader {
    pub const ENCODED_LEN: usize = 56;

    pub fn validate(&self) -> XTreeResult<()> {
        if self.magic != super::xtree_constants::MAGIC {
            return Err(XTreeError::CorruptFile("bad magic number".into()));
        }
        if self.version != super::xtree_constants::VERSION {
            return Err(XTreeError::CorruptFile(format!(
                "unsupported file format version {}",
                self.version
            )));
        }
        Ok(())
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(Self::ENCODED_LEN);
        put_u32(&mut buf, self.magic);
        put_u32(&mut buf, self.version);
        put_u32(&mut buf, self.page_size);
        put_u32(&mut buf, self.dir_capacity);
        put_u32(&mut buf, self.leaf_capacity);
        put_u32(&mut buf, self.dir_minimum);
        put_u32(&mut buf, self.leaf_minimum);
        put_u32(&mut buf, self.min_fanout);
        put_u64(&mut buf, self.num_elements);
        put_u32(&mut buf, self.dimensionality);
        put_f32(&mut buf, self.max_overlap);
        put_u64(&mut buf, self.supernode_offset);
        buf
    }

    pub fn decode(buf: &[u8]) -> XTreeResult<XTreeHeader> {
        let mut r = ByteReader::new(buf);
        Ok(XTreeHeader {
            magic: r.u32()?,
            version: r.u32()?,
            page_size: r.u32()?,
            dir_capacity: r.u32()?,
            leaf_capacity: r.u32()?,
            dir_minimum: r.u32()?,
            leaf_minimum: r.u32()?,
            min_fanout: r.u32()?,
            num_elements: r.u64()?,
            dimensionality: r.u32()?,
            max_overlap: r.f32()?,
            supernode_offset: r.u64()?,
        })
    }
}

// ============================================================================
// Statistics
// ============================================================================

/// Aggregate statistics over the tree structure.
#[derive(Debug, Clone, Default)]
pub struct XTreeStats {
    pub height: u32,
    pub num_elements: u64,
    pub leaf_nodes: u64,
    pub dir_nodes: u64,
    pub super_nodes: u64,
    pub min_super_capacity: Option<u32>,
    pub max_super_capacity: Option<u32>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_dir_entry(dims: u32, child: PageId) -> DirectoryEntry {
        let mut history = SplitHistory::new(dims);
        history.set(0);
        DirectoryEntry::new(
            child,
            BoundingBox::new(vec![0.0; dims as usize], vec![1.0; dims as usize]),
            history,
        )
    }

    #[test]
    fn test_leaf_node_round_trip() {
        let mut node = Node::new_leaf(7);
        node.add_leaf_entry(LeafEntry::new(1, vec![0.5, 1.5]));
        node.add_leaf_entry(LeafEntry::new(2, vec![-3.0, 4.0]));

        let bytes = node.encode(2, 4, 4);
        assert_eq!(bytes.len(), NODE_PRELUDE_SIZE + 2 * LeafEntry::encoded_len(2));

        let back = Node::decode(&bytes, 2, 4, 4).unwrap();
        assert_eq!(back.page_id(), 7);
        assert_eq!(back.kind(), NodeKind::Leaf);
        assert_eq!(back.leaf_entries(), node.leaf_entries());
    }

    #[test]
    fn test_directory_node_round_trip() {
        let mut node = Node::new_directory(3);
        node.add_directory_entry(sample_dir_entry(2, 10));
        node.add_directory_entry(sample_dir_entry(2, 11));

        let bytes = node.encode(2, 4, 4);
        let back = Node::decode(&bytes, 2, 4, 4).unwrap();
        assert_eq!(back.kind(), NodeKind::Directory);
        assert_eq!(back.num_entries(), 2);
        assert_eq!(back.dir_entries()[1].child, 11);
        assert!(back.dir_entries()[0].split_history.is_set(0));
    }

    #[test]
    fn test_supernode_round_trip() {
        let mut node = Node::new_directory(5);
        for i in 0..5 {
            node.add_directory_entry(sample_dir_entry(2, 20 + i));
        }
        assert_eq!(node.make_super(4).unwrap(), 8);
        assert!(node.is_super());

        let bytes = node.encode(2, 4, 4);
        let back = Node::decode(&bytes, 2, 4, 4).unwrap();
        assert_eq!(back.kind(), NodeKind::Super);
        assert_eq!(back.capacity(4, 4), 8);
        assert_eq!(back.num_entries(), 5);
    }

    #[test]
    fn test_grow_and_shrink_super() {
        let mut node = Node::new_directory(5);
        for i in 0..5 {
            node.add_directory_entry(sample_dir_entry(2, 20 + i));
        }
        node.make_super(4).unwrap();
        assert_eq!(node.grow_super(4).unwrap(), 12);

        node.dir_entries_mut().truncate(3);
        assert_eq!(node.shrink_super(4).unwrap(), 8);
        assert!(node.is_super());
        assert_eq!(node.shrink_super(4).unwrap(), 4);
        // receded to the regular capacity: reclassified
        assert!(!node.is_super());
        assert_eq!(node.kind(), NodeKind::Directory);
    }

    #[test]
    fn test_shrink_super_rejects_underfit() {
        let mut node = Node::new_directory(5);
        for i in 0..7 {
            node.add_directory_entry(sample_dir_entry(2, 20 + i));
        }
        node.make_super(4).unwrap();
        // 7 entries do not fit a capacity of 4
        assert!(node.shrink_super(4).is_err());
    }

    #[test]
    fn test_decode_rejects_wrong_capacity() {
        let node = Node::new_leaf(1);
        let bytes = node.encode(2, 4, 4);
        let err = Node::decode(&bytes, 2, 8, 4).unwrap_err();
        assert!(matches!(err, XTreeError::CorruptFile(_)));
    }

    #[test]
    fn test_decode_rejects_truncated_page() {
        let mut node = Node::new_leaf(1);
        node.add_leaf_entry(LeafEntry::new(1, vec![0.0, 0.0]));
        let bytes = node.encode(2, 4, 4);
        let err = Node::decode(&bytes[..bytes.len() - 1], 2, 4, 4).unwrap_err();
        assert!(matches!(err, XTreeError::CorruptFile(_)));
    }

    #[test]
    fn test_compute_mbr() {
        let mut node = Node::new_leaf(1);
        assert!(node.compute_mbr().is_none());
        node.add_leaf_entry(LeafEntry::new(1, vec![0.0, 2.0]));
        node.add_leaf_entry(LeafEntry::new(2, vec![4.0, -1.0]));
        let mbr = node.compute_mbr().unwrap();
        assert_eq!(mbr, BoundingBox::new(vec![0.0, -1.0], vec![4.0, 2.0]));
    }

    #[test]
    fn test_header_round_trip() {
        let header = XTreeHeader {
            magic: super::super::xtree_constants::MAGIC,
            version: super::super::xtree_constants::VERSION,
            page_size: 4096,
            dir_capacity: 24,
            leaf_capacity: 40,
            dir_minimum: 9,
            leaf_minimum: 16,
            min_fanout: 7,
            num_elements: 12345,
            dimensionality: 8,
            max_overlap: 0.2,
            supernode_offset: 81920,
        };
        let bytes = header.encode();
        assert_eq!(bytes.len(), XTreeHeader::ENCODED_LEN);
        let back = XTreeHeader::decode(&bytes).unwrap();
        assert_eq!(header, back);
        assert!(back.validate().is_ok());
    }

    #[test]
    fn test_header_validate_rejects_bad_magic() {
        let mut header = XTreeHeader {
            magic: 0xDEADBEEF,
            version: 1,
            page_size: 4096,
            dir_capacity: 4,
            leaf_capacity: 4,
            dir_minimum: 2,
            leaf_minimum: 2,
            min_fanout: 2,
            num_elements: 0,
            dimensionality: 2,
            max_overlap: 0.2,
            supernode_offset: 0,
        };
        assert!(header.validate().is_err());
        header.magic = super::super::xtree_constants::MAGIC;
        header.version = 99;
        assert!(header.validate().is_err());
    }
}
