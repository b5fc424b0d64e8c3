//! Fixed-size page storage for the X-tree.
//!
//! The file holds one reserved header slot, then the regular pages, then —
//! after a commit — the variable-size supernode region:
//!
//! ```text
//! [ header page ] [ pages 0..next_page_id-1 ] [ supernodes ]
//! ```
//!
//! Every regular page is exactly `page_size` bytes and starts with the
//! 14-byte node prelude. A supernode block starts with the same prelude but
//! occupies `ceil(capacity / dir_capacity)` contiguous page-size slots.
//! Each `read_page`/`write_page` call is one seek plus one read/write.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};

use parking_lot::RwLock;
use std::collections::BTreeMap;

use super::xtree_constants::{HEADER_PAGES, NODE_PRELUDE_SIZE};
use super::xtree_settings::Capacities;
use super::xtree_types::{ByteReader, Node, PageId, XTreeError, XTreeHeader, XTreeResult};

/// Page-granular storage over a single file, plus the monotonic page id
/// counter that decides where the supernode region starts.
pub struct PageStore {
    file: RwLock<File>,
    #[allow(dead_code)]
    path: PathBuf,
    page_size: u32,
    next_page_id: AtomicU32,
}

impl PageStore {
    /// Creates a new, empty page file, truncating any existing one.
    pub fn create(path: &Path, page_size: u32) -> XTreeResult<PageStore> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;

        Ok(PageStore {
            file: RwLock::new(file),
            path: path.to_path_buf(),
            page_size,
            next_page_id: AtomicU32::new(0),
        })
    }

    /// Opens an existing page file. Only the header slot is read eagerly;
    /// the caller restores `next_page_id` from the header.
    pub fn open(path: &Path) -> XTreeResult<(PageStore, XTreeHeader)> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;

        let store = PageStore {
            file: RwLock::new(file),
            path: path.to_path_buf(),
            page_size: 0,
            next_page_id: AtomicU32::new(0),
        };
        let header = store.read_header()?;
        header.validate()?;
        let store = PageStore {
            page_size: header.page_size,
            ..store
        };
        Ok((store, header))
    }

    pub fn page_size(&self) -> u32 {
        self.page_size
    }

    /// Allocates the next page id. Monotonic; freed pages are not reused.
    pub fn alloc(&self) -> PageId {
        self.next_page_id.fetch_add(1, Ordering::SeqCst)
    }

    pub fn next_page_id(&self) -> PageId {
        self.next_page_id.load(Ordering::SeqCst)
    }

    pub fn set_next_page_id(&self, id: PageId) {
        self.next_page_id.store(id, Ordering::SeqCst);
    }

    fn page_offset(&self, page_id: PageId) -> u64 {
        (HEADER_PAGES as u64 + page_id as u64) * self.page_size as u64
    }

    /// Absolute byte offset where the supernode region currently starts.
    pub fn supernode_region_start(&self) -> u64 {
        self.page_offset(self.next_page_id())
    }

    /// Reads the header from the reserved slot at the start of the file.
    pub fn read_header(&self) -> XTreeResult<XTreeHeader> {
        let mut file = self.file.write();
        file.seek(SeekFrom::Start(0))?;
        let mut buf = vec![0u8; XTreeHeader::ENCODED_LEN];
        file.read_exact(&mut buf)?;
        XTreeHeader::decode(&buf)
    }

    /// Writes the header, zero-padded to its reserved slot.
    pub fn write_header(&self, header: &XTreeHeader) -> XTreeResult<()> {
        let mut padded = header.encode();
        padded.resize((HEADER_PAGES * self.page_size) as usize, 0);

        let mut file = self.file.write();
        file.seek(SeekFrom::Start(0))?;
        file.write_all(&padded)?;
        Ok(())
    }

    /// Reads a single regular page. Supernodes never come from here; the
    /// tree serves them from its in-memory map.
    pub fn read_page(&self, page_id: PageId, dims: u32, caps: &Capacities) -> XTreeResult<Node> {
        if page_id >= self.next_page_id() {
            return Err(XTreeError::CorruptFile(format!(
                "read of unallocated page {page_id}"
            )));
        }

        let mut buf = vec![0u8; self.page_size as usize];
        {
            let mut file = self.file.write();
            file.seek(SeekFrom::Start(self.page_offset(page_id)))?;
            file.read_exact(&mut buf)?;
        }

        let node = Node::decode(&buf, dims, caps.leaf_capacity, caps.dir_capacity)?;
        if node.page_id() != page_id {
            return Err(XTreeError::CorruptFile(format!(
                "page {} carries id {}",
                page_id,
                node.page_id()
            )));
        }
        Ok(node)
    }

    /// Writes a single regular page, zero-padded to the page size.
    pub fn write_page(&self, node: &Node, dims: u32, caps: &Capacities) -> XTreeResult<()> {
        debug_assert!(!node.is_super(), "supernodes are persisted at commit");

        let mut bytes = node.encode(dims, caps.leaf_capacity, caps.dir_capacity);
        if bytes.len() > self.page_size as usize {
            return Err(XTreeError::CapacityExceeded(format!(
                "node {} needs {} bytes, page size is {}",
                node.page_id(),
                bytes.len(),
                self.page_size
            )));
        }
        bytes.resize(self.page_size as usize, 0);

        let mut file = self.file.write();
        file.seek(SeekFrom::Start(self.page_offset(node.page_id())))?;
        file.write_all(&bytes)?;
        Ok(())
    }

    /// Writes the supernode region after the paged area, in map iteration
    /// order, each node zero-padded to `ceil(capacity / dir_cap)` pages.
    /// Any previous region is truncated away first so repeated commits of
    /// an unchanged tree produce identical bytes.
    pub fn write_supernode_region(
        &self,
        supernodes: &BTreeMap<PageId, Node>,
        dims: u32,
        caps: &Capacities,
    ) -> XTreeResult<u64> {
        let start = self.supernode_region_start();
        let mut written = 0u64;

        let mut file = self.file.write();
        file.set_len(start)?;
        file.seek(SeekFrom::Start(start))?;
        for node in supernodes.values() {
            let capacity = node.capacity(caps.leaf_capacity, caps.dir_capacity);
            let budget = caps.super_pages(capacity) as usize * self.page_size as usize;
            let mut bytes = node.encode(dims, caps.leaf_capacity, caps.dir_capacity);
            if bytes.len() > budget {
                return Err(XTreeError::CapacityExceeded(format!(
                    "supernode {} needs {} bytes, its budget is {} pages of {}",
                    node.page_id(),
                    bytes.len(),
                    caps.super_pages(capacity),
                    self.page_size
                )));
            }
            bytes.resize(budget, 0);
            file.write_all(&bytes)?;
            written += budget as u64;
        }
        Ok(written)
    }

    /// Scans the supernode region back into a map. Every block must carry
    /// the supernode flag and agree with its own prelude.
    pub fn read_supernode_region(
        &self,
        dims: u32,
        caps: &Capacities,
    ) -> XTreeResult<BTreeMap<PageId, Node>> {
        let mut supernodes = BTreeMap::new();
        let start = self.supernode_region_start();

        let mut file = self.file.write();
        let file_len = file.metadata()?.len();
        let mut pos = start;
        while pos + self.page_size as u64 <= file_len {
            file.seek(SeekFrom::Start(pos))?;
            let mut prelude = [0u8; NODE_PRELUDE_SIZE];
            file.read_exact(&mut prelude)?;

            let mut r = ByteReader::new(&prelude);
            let page_id = r.u32()?;
            let _is_leaf = r.u8()?;
            let is_super = r.u8()? != 0;
            let num_entries = r.u32()?;
            let capacity = r.u32()?;
            if !is_super {
                return Err(XTreeError::CorruptFile(format!(
                    "non-supernode page {page_id} at supernode offset {pos}"
                )));
            }

            let block_len = caps.super_pages(capacity) as u64 * self.page_size as u64;
            if pos + block_len > file_len {
                return Err(XTreeError::CorruptFile(format!(
                    "truncated supernode {page_id}: {block_len} bytes past offset {pos}"
                )));
            }
            let mut block = vec![0u8; block_len as usize];
            file.seek(SeekFrom::Start(pos))?;
            file.read_exact(&mut block)?;

            let node = Node::decode(&block, dims, caps.leaf_capacity, caps.dir_capacity)?;
            if node.page_id() != page_id
                || node.num_entries() as u32 != num_entries
                || node.capacity(caps.leaf_capacity, caps.dir_capacity) != capacity
                || !node.is_super()
            {
                return Err(XTreeError::CorruptFile(format!(
                    "supernode {page_id} does not match its prelude"
                )));
            }
            supernodes.insert(page_id, node);
            pos += block_len;
        }
        Ok(supernodes)
    }

    /// Flushes file contents and metadata to stable storage.
    pub fn sync(&self) -> XTreeResult<()> {
        self.file.write().sync_all()?;
        Ok(())
    }

    /// Current length of the backing file in bytes.
    pub fn file_len(&self) -> XTreeResult<u64> {
        Ok(self.file.write().metadata()?.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bounding_box::BoundingBox;
    use crate::xtree::split_history::SplitHistory;
    use crate::xtree::xtree_constants::{MAGIC, VERSION};
    use crate::xtree::xtree_settings::{Capacities, XTreeSettings};
    use crate::xtree::xtree_types::{DirectoryEntry, LeafEntry};
    use tempfile::tempdir;

    fn caps_for_tests() -> Capacities {
        let settings = XTreeSettings {
            page_size: 256,
            leaf_capacity: Some(4),
            dir_capacity: Some(4),
            ..XTreeSettings::default()
        };
        Capacities::derive(&settings, 2).unwrap()
    }

    fn header_for_tests(caps: &Capacities) -> XTreeHeader {
        XTreeHeader {
            magic: MAGIC,
            version: VERSION,
            page_size: 256,
            dir_capacity: caps.dir_capacity,
            leaf_capacity: caps.leaf_capacity,
            dir_minimum: caps.dir_minimum,
            leaf_minimum: caps.leaf_minimum,
            min_fanout: caps.min_fanout,
            num_elements: 0,
            dimensionality: 2,
            max_overlap: 0.2,
            supernode_offset: 0,
        }
    }

    #[test]
    fn test_create_and_open() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.xtree");
        let caps = caps_for_tests();

        let store = PageStore::create(&path, 256).unwrap();
        store.write_header(&header_for_tests(&caps)).unwrap();
        drop(store);

        let (store, header) = PageStore::open(&path).unwrap();
        assert_eq!(store.page_size(), 256);
        assert_eq!(header.leaf_capacity, 4);
    }

    #[test]
    fn test_alloc_is_monotonic() {
        let dir = tempdir().unwrap();
        let store = PageStore::create(&dir.path().join("t.xtree"), 256).unwrap();
        assert_eq!(store.alloc(), 0);
        assert_eq!(store.alloc(), 1);
        assert_eq!(store.alloc(), 2);
        assert_eq!(store.next_page_id(), 3);
    }

    #[test]
    fn test_page_round_trip() {
        let dir = tempdir().unwrap();
        let store = PageStore::create(&dir.path().join("t.xtree"), 256).unwrap();
        let caps = caps_for_tests();

        let page_id = store.alloc();
        let mut node = Node::new_leaf(page_id);
        node.add_leaf_entry(LeafEntry::new(9, vec![1.0, 2.0]));
        store.write_page(&node, 2, &caps).unwrap();

        let back = store.read_page(page_id, 2, &caps).unwrap();
        assert_eq!(back.num_entries(), 1);
        assert_eq!(back.leaf_entries()[0].id, 9);
    }

    #[test]
    fn test_read_unallocated_page_fails() {
        let dir = tempdir().unwrap();
        let store = PageStore::create(&dir.path().join("t.xtree"), 256).unwrap();
        let caps = caps_for_tests();
        assert!(matches!(
            store.read_page(3, 2, &caps),
            Err(XTreeError::CorruptFile(_))
        ));
    }

    #[test]
    fn test_supernode_region_round_trip() {
        let dir = tempdir().unwrap();
        let store = PageStore::create(&dir.path().join("t.xtree"), 256).unwrap();
        let caps = caps_for_tests();
        store.write_header(&header_for_tests(&caps)).unwrap();

        let page_id = store.alloc();
        let mut node = Node::new_directory(page_id);
        for i in 0..5u32 {
            node.add_directory_entry(DirectoryEntry::new(
                10 + i,
                BoundingBox::new(vec![0.0, 0.0], vec![1.0, 1.0]),
                SplitHistory::new(2),
            ));
        }
        node.make_super(caps.dir_capacity).unwrap();

        let mut supers = BTreeMap::new();
        supers.insert(page_id, node);
        let written = store.write_supernode_region(&supers, 2, &caps).unwrap();
        assert_eq!(written, 2 * 256); // capacity 8 = 2 growth steps

        let back = store.read_supernode_region(2, &caps).unwrap();
        assert_eq!(back.len(), 1);
        let node = back.get(&page_id).unwrap();
        assert!(node.is_super());
        assert_eq!(node.num_entries(), 5);
        assert_eq!(node.capacity(caps.leaf_capacity, caps.dir_capacity), 8);
    }

    #[test]
    fn test_supernode_region_rejects_regular_page() {
        let dir = tempdir().unwrap();
        let store = PageStore::create(&dir.path().join("t.xtree"), 256).unwrap();
        let caps = caps_for_tests();
        store.write_header(&header_for_tests(&caps)).unwrap();

        // write a regular page where the supernode region begins
        let page_id = store.alloc();
        let node = Node::new_leaf(page_id);
        store.write_page(&node, 2, &caps).unwrap();
        store.set_next_page_id(page_id); // pretend the page was never allocated

        assert!(matches!(
            store.read_supernode_region(2, &caps),
            Err(XTreeError::CorruptFile(_))
        ));
    }

    #[test]
    fn test_rewriting_supernode_region_truncates() {
        let dir = tempdir().unwrap();
        let store = PageStore::create(&dir.path().join("t.xtree"), 256).unwrap();
        let caps = caps_for_tests();
        store.write_header(&header_for_tests(&caps)).unwrap();

        let page_id = store.alloc();
        let mut node = Node::new_directory(page_id);
        for i in 0..5u32 {
            node.add_directory_entry(DirectoryEntry::new(
                10 + i,
                BoundingBox::new(vec![0.0, 0.0], vec![1.0, 1.0]),
                SplitHistory::new(2),
            ));
        }
        node.make_super(caps.dir_capacity).unwrap();
        let mut supers = BTreeMap::new();
        supers.insert(page_id, node);

        store.write_supernode_region(&supers, 2, &caps).unwrap();
        let len_once = store.file_len().unwrap();
        store.write_supernode_region(&supers, 2, &caps).unwrap();
        assert_eq!(store.file_len().unwrap(), len_once);

        // an emptied map truncates the region away entirely
        store
            .write_supernode_region(&BTreeMap::new(), 2, &caps)
            .unwrap();
        assert_eq!(store.file_len().unwrap(), store.supernode_region_start());
    }
}
