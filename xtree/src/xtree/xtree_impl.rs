//! The X-tree proper: insertion driver, choose-subtree, overflow treatment
//! with forced reinsertion and the supernode escape hatch, window queries,
//! and the commit/load protocol.
//!
//! Supernodes are served from an in-memory map for the whole life of the
//! tree and only reach the file as a trailer behind the paged region at
//! commit time. The index is single-writer; mutating operations serialize
//! behind one lock.

use std::collections::{BTreeMap, VecDeque};
use std::path::Path;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use super::split_history::SplitHistory;
use super::xsplit::{DataOverlapOracle, SplitItem, XSplitter};
use super::xtree_constants::{HEADER_PAGES, MAGIC, ROOT_PAGE_ID, VERSION};
use super::xtree_settings::{Capacities, Overlap, XTreeSettings};
use super::xtree_storage::PageStore;
use super::xtree_types::{
    DirectoryEntry, LeafEntry, Node, PageId, XTreeError, XTreeHeader, XTreeResult, XTreeStats,
};
use crate::bounding_box::{BoundingBox, Spatial};

/// Path from the root to a node: `(page_id, index_in_parent)` per step.
/// The root carries a dummy index. There are no upward pointers; the path
/// is how the insertion driver walks back to the root.
type TreePath = Vec<(PageId, usize)>;

/// Disk-resident X-tree over d-dimensional points.
pub struct XTree {
    inner: Arc<XTreeInner>,
}

struct XTreeInner {
    storage: PageStore,
    settings: XTreeSettings,
    caps: Capacities,
    dims: u32,
    header: RwLock<XTreeHeader>,
    /// Supernodes by page id; consulted before the page store on every
    /// read and written out only on commit. Ordered so commits are
    /// byte-deterministic.
    supernodes: RwLock<BTreeMap<PageId, Node>>,
    height: RwLock<u32>,
    /// Split axes used at root level, inherited by both halves whenever
    /// the root splits.
    root_history: RwLock<SplitHistory>,
    /// Levels that already saw a forced reinsertion during the current
    /// insertion; reset by every top-level insert.
    reinserted_levels: RwLock<Vec<bool>>,
    closed: RwLock<bool>,
    write_lock: Mutex<()>,
}

enum OverflowOutcome {
    /// Entries were removed and reinserted from the root; treatment done.
    Reinserted,
    /// The node could not be split acceptably and became a supernode.
    SupernodeConversion,
    /// The node was split; the new sibling must be linked into the parent.
    Split {
        node: Node,
        new_node: Node,
        axis: usize,
    },
}

impl XTree {
    /// Creates a new, empty index at the given path for points of the
    /// given dimensionality. Any existing file is truncated.
    pub fn create(
        path: impl AsRef<Path>,
        dimensionality: u32,
        settings: XTreeSettings,
    ) -> XTreeResult<XTree> {
        let caps = Capacities::derive(&settings, dimensionality)?;
        let storage = PageStore::create(path.as_ref(), settings.page_size)?;

        let header = XTreeHeader {
            magic: MAGIC,
            version: VERSION,
            page_size: settings.page_size,
            dir_capacity: caps.dir_capacity,
            leaf_capacity: caps.leaf_capacity,
            dir_minimum: caps.dir_minimum,
            leaf_minimum: caps.leaf_minimum,
            min_fanout: caps.min_fanout,
            num_elements: 0,
            dimensionality,
            max_overlap: settings.max_overlap,
            supernode_offset: 0,
        };
        storage.write_header(&header)?;

        let root_id = storage.alloc();
        debug_assert_eq!(root_id, ROOT_PAGE_ID);
        storage.write_page(&Node::new_leaf(root_id), dimensionality, &caps)?;
        storage.sync()?;

        Ok(XTree {
            inner: Arc::new(XTreeInner {
                storage,
                settings,
                caps,
                dims: dimensionality,
                header: RwLock::new(header),
                supernodes: RwLock::new(BTreeMap::new()),
                height: RwLock::new(1),
                root_history: RwLock::new(SplitHistory::new(dimensionality)),
                reinserted_levels: RwLock::new(Vec::new()),
                closed: RwLock::new(false),
                write_lock: Mutex::new(()),
            }),
        })
    }

    /// Opens a committed index. Capacities, dimensionality and the overlap
    /// threshold come from the file header; the remaining runtime knobs
    /// use their defaults.
    pub fn open(path: impl AsRef<Path>) -> XTreeResult<XTree> {
        Self::open_with_settings(path, XTreeSettings::default())
    }

    /// Opens a committed index with explicit runtime settings. Fields that
    /// are persisted in the header always win over the passed settings.
    pub fn open_with_settings(
        path: impl AsRef<Path>,
        settings: XTreeSettings,
    ) -> XTreeResult<XTree> {
        let (storage, header) = PageStore::open(path.as_ref())?;
        let caps = Capacities {
            leaf_capacity: header.leaf_capacity,
            dir_capacity: header.dir_capacity,
            leaf_minimum: header.leaf_minimum,
            dir_minimum: header.dir_minimum,
            min_fanout: header.min_fanout,
        };
        let dims = header.dimensionality;
        let settings = XTreeSettings {
            page_size: header.page_size,
            max_overlap: header.max_overlap,
            leaf_capacity: Some(header.leaf_capacity),
            dir_capacity: Some(header.dir_capacity),
            ..settings
        };

        if header.supernode_offset > 0 {
            storage
                .set_next_page_id((header.supernode_offset / header.page_size as u64) as PageId);
        } else {
            // never committed with supernodes: every page slot is regular
            let pages = (storage.file_len()? / header.page_size as u64)
                .saturating_sub(HEADER_PAGES as u64);
            storage.set_next_page_id(pages as PageId);
        }

        let supernodes = if header.supernode_offset > 0 {
            storage.read_supernode_region(dims, &caps)?
        } else {
            BTreeMap::new()
        };

        let tree = XTree {
            inner: Arc::new(XTreeInner {
                storage,
                settings,
                caps,
                dims,
                header: RwLock::new(header),
                supernodes: RwLock::new(supernodes),
                height: RwLock::new(1),
                root_history: RwLock::new(SplitHistory::new(dims)),
                reinserted_levels: RwLock::new(Vec::new()),
                closed: RwLock::new(false),
                write_lock: Mutex::new(()),
            }),
        };
        let height = tree.compute_height()?;
        *tree.inner.height.write() = height;
        Ok(tree)
    }

    // ------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------

    /// Number of points currently indexed.
    pub fn size(&self) -> u64 {
        self.inner.header.read().num_elements
    }

    /// Height of the tree; 1 for a lone root leaf.
    pub fn height(&self) -> u32 {
        *self.inner.height.read()
    }

    pub fn dimensionality(&self) -> u32 {
        self.inner.dims
    }

    pub fn capacities(&self) -> Capacities {
        self.inner.caps
    }

    pub fn settings(&self) -> &XTreeSettings {
        &self.inner.settings
    }

    /// Number of supernodes currently held in memory.
    pub fn supernode_count(&self) -> usize {
        self.inner.supernodes.read().len()
    }

    pub fn is_supernode(&self, page_id: PageId) -> bool {
        self.inner.supernodes.read().contains_key(&page_id)
    }

    /// Bounding box of the whole tree, `None` while empty.
    pub fn root_mbr(&self) -> XTreeResult<Option<BoundingBox>> {
        Ok(self.get_node(ROOT_PAGE_ID)?.compute_mbr())
    }

    fn check_closed(&self) -> XTreeResult<()> {
        if *self.inner.closed.read() {
            return Err(XTreeError::InvalidState("index is closed".into()));
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Node access
    // ------------------------------------------------------------------

    /// Fetches a node: supernodes from the in-memory map, everything else
    /// from its page.
    fn get_node(&self, page_id: PageId) -> XTreeResult<Node> {
        if let Some(node) = self.inner.supernodes.read().get(&page_id) {
            return Ok(node.clone());
        }
        let node = self
            .inner
            .storage
            .read_page(page_id, self.inner.dims, &self.inner.caps)?;
        // every supernode must be in the map
        debug_assert!(!node.is_super());
        Ok(node)
    }

    /// Persists a node: supernodes into the map (until commit), regular
    /// nodes through to their page.
    fn write_node(&self, node: &Node) -> XTreeResult<()> {
        if node.is_super() {
            self.inner
                .supernodes
                .write()
                .insert(node.page_id(), node.clone());
            Ok(())
        } else {
            self.inner
                .storage
                .write_page(node, self.inner.dims, &self.inner.caps)
        }
    }

    fn node_overflows(&self, node: &Node) -> bool {
        node.num_entries() as u32
            > node.capacity(self.inner.caps.leaf_capacity, self.inner.caps.dir_capacity)
    }

    /// Walks leftmost children from the root; used after load.
    fn compute_height(&self) -> XTreeResult<u32> {
        let mut node = self.get_node(ROOT_PAGE_ID)?;
        let mut height = 1;
        while !node.is_leaf() && node.num_entries() > 0 {
            node = self.get_node(node.dir_entries()[0].child)?;
            height += 1;
        }
        Ok(height)
    }

    // ------------------------------------------------------------------
    // Insertion
    // ------------------------------------------------------------------

    /// Inserts a point with its external id.
    pub fn insert(&self, point: &[f64], id: u64) -> XTreeResult<()> {
        self.check_closed()?;
        if point.len() != self.inner.dims as usize {
            return Err(XTreeError::InvalidState(format!(
                "point has {} dimensions, the tree indexes {}",
                point.len(),
                self.inner.dims
            )));
        }
        if point.iter().any(|c| !c.is_finite()) {
            return Err(XTreeError::NumericOverflow(
                "point coordinates must be finite".into(),
            ));
        }

        let _guard = self.inner.write_lock.lock();
        let height = *self.inner.height.read() as usize;
        *self.inner.reinserted_levels.write() = vec![false; height + 2];

        self.insert_leaf_entry(LeafEntry::new(id, point.to_vec()))?;
        self.inner.header.write().num_elements += 1;
        Ok(())
    }

    /// Bulk loading is advertised but not supported; fails without side
    /// effects.
    pub fn bulk_load(&self, _points: &[(Vec<f64>, u64)]) -> XTreeResult<()> {
        Err(XTreeError::NotSupported("bulk load"))
    }

    /// Deletion is not supported; fails without side effects.
    pub fn remove(&self, _point: &[f64], _id: u64) -> XTreeResult<bool> {
        Err(XTreeError::NotSupported("delete"))
    }

    fn insert_leaf_entry(&self, entry: LeafEntry) -> XTreeResult<()> {
        let mbr = BoundingBox::point(&entry.point);
        let path = self.choose_subtree(&mbr, 1)?;
        let leaf_id = path.last().unwrap().0;

        let mut leaf = self.get_node(leaf_id)?;
        leaf.add_leaf_entry(entry);
        self.write_node(&leaf)?;

        if !self.node_overflows(&leaf) {
            if path.len() == 1 {
                return Ok(());
            }
            // cheap exit: the parent entry already covered the point
            let parent = self.get_node(path[path.len() - 2].0)?;
            if parent.dir_entries()[path.last().unwrap().1].mbr.contains(&mbr) {
                return Ok(());
            }
        }
        self.adjust_tree(path)
    }

    fn insert_directory_entry(&self, entry: DirectoryEntry, level: u32) -> XTreeResult<()> {
        let mbr = entry.mbr.clone();
        let path = self.choose_subtree(&mbr, level)?;
        let node_id = path.last().unwrap().0;

        let mut node = self.get_node(node_id)?;
        node.add_directory_entry(entry);
        self.write_node(&node)?;

        if !self.node_overflows(&node) {
            if path.len() == 1 {
                return Ok(());
            }
            let parent = self.get_node(path[path.len() - 2].0)?;
            if parent.dir_entries()[path.last().unwrap().1].mbr.contains(&mbr) {
                return Ok(());
            }
        }
        self.adjust_tree(path)
    }

    /// Level of the node at the end of a path; leaves are level 1.
    fn level_of(&self, path_len: usize) -> u32 {
        *self.inner.height.read() + 1 - path_len as u32
    }

    // ------------------------------------------------------------------
    // Choose-subtree
    // ------------------------------------------------------------------

    /// Descends from the root to the node at `target_level` that should
    /// receive an entry with the given MBR. Containment wins outright;
    /// otherwise the child with the least overlap enlargement, then least
    /// volume enlargement, then least volume is chosen. Iterative on
    /// purpose: the recursion depth would be the tree height.
    fn choose_subtree(&self, mbr: &BoundingBox, target_level: u32) -> XTreeResult<TreePath> {
        let height = *self.inner.height.read();
        debug_assert!(target_level >= 1 && target_level <= height);

        let mut path: TreePath = vec![(ROOT_PAGE_ID, 0)];
        loop {
            let node = self.get_node(path.last().unwrap().0)?;
            let level = height + 1 - path.len() as u32;
            if node.is_leaf() || level == target_level {
                return Ok(path);
            }
            let entries = node.dir_entries();
            if entries.is_empty() {
                return Err(XTreeError::InvalidState(format!(
                    "directory node {} has no entries",
                    node.page_id()
                )));
            }

            // containment test first: among covering children the smallest
            // volume wins
            let mut covering: Option<(usize, f64)> = None;
            for (i, e) in entries.iter().enumerate() {
                if e.mbr.contains(mbr) {
                    let volume = e.mbr.volume()?;
                    if covering.map_or(true, |(_, best)| volume < best) {
                        covering = Some((i, volume));
                    }
                }
            }

            let chosen = match covering {
                Some((i, _)) => i,
                None => self.choose_least_enlargement(&node, mbr)?,
            };
            path.push((entries[chosen].child, chosen));
        }
    }

    fn choose_least_enlargement(&self, node: &Node, mbr: &BoundingBox) -> XTreeResult<usize> {
        let entries = node.dir_entries();
        // the overlap-increase term only applies directly above the leaves,
        // and is skipped for supernodes unless configured otherwise
        let test_overlap = self.get_node(entries[0].child)?.is_leaf()
            && !(self.inner.settings.omit_overlap_for_supernodes && node.is_super());

        let mut best: Option<(f64, f64, f64, usize)> = None;
        for (i, e) in entries.iter().enumerate() {
            let test_mbr = BoundingBox::union(&e.mbr, mbr);
            let overlap_inc = if test_overlap {
                self.overlap_increase(entries, i, &test_mbr)?
            } else {
                0.0
            };
            let volume = e.mbr.volume()?;
            let volume_inc = test_mbr.volume()? - volume;

            let better = match best {
                None => true,
                Some((b_inc, b_vol_inc, b_vol, _)) => {
                    overlap_inc < b_inc
                        || (overlap_inc == b_inc
                            && (volume_inc < b_vol_inc
                                || (volume_inc == b_vol_inc && volume < b_vol)))
                }
            };
            if better {
                best = Some((overlap_inc, volume_inc, volume, i));
            }
        }
        Ok(best.unwrap().3)
    }

    /// Change in the summed pairwise intersection volume with all siblings
    /// when entry `i` grows to `test_mbr`. Only dimensions that actually
    /// changed are multiplied out, and a sibling that is disjoint from the
    /// grown box in any dimension short-circuits to zero.
    fn overlap_increase(
        &self,
        entries: &[DirectoryEntry],
        i: usize,
        test_mbr: &BoundingBox,
    ) -> XTreeResult<f64> {
        let e = &entries[i];
        let dims = self.inner.dims as usize;

        let mut dimension_changed = vec![false; dims];
        for (d, changed) in dimension_changed.iter_mut().enumerate() {
            *changed = e.lo(d) > test_mbr.lo(d) || e.hi(d) < test_mbr.hi(d);
        }

        let mut increase = 0.0;
        for (j, other) in entries.iter().enumerate() {
            if j == i {
                continue;
            }
            let mut unchanged_product = 1.0;
            let mut overlap_old = 1.0;
            let mut overlap_new = 1.0;
            let mut disjoint = false;
            for d in 0..dims {
                if dimension_changed[d] {
                    if test_mbr.lo(d) > other.hi(d) || test_mbr.hi(d) < other.lo(d) {
                        disjoint = true; // the old box has no overlap either
                        break;
                    }
                    overlap_new *=
                        test_mbr.hi(d).min(other.hi(d)) - test_mbr.lo(d).max(other.lo(d));
                    if overlap_old != 0.0 {
                        let old = (e.hi(d).min(other.hi(d)) - e.lo(d).max(other.lo(d))).max(0.0);
                        overlap_old *= old;
                    }
                } else {
                    if e.lo(d) > other.hi(d) || e.hi(d) < other.lo(d) {
                        disjoint = true;
                        break;
                    }
                    unchanged_product *= e.hi(d).min(other.hi(d)) - e.lo(d).max(other.lo(d));
                }
            }
            if !disjoint && unchanged_product != 0.0 {
                increase += unchanged_product * (overlap_new - overlap_old);
            }
        }
        if !increase.is_finite() {
            return Err(XTreeError::NumericOverflow(
                "overlap increase is not finite; re-scale the data".into(),
            ));
        }
        Ok(increase)
    }

    // ------------------------------------------------------------------
    // Tree adjustment
    // ------------------------------------------------------------------

    /// Walks from the end of the path back to the root, treating overflows
    /// and propagating MBR changes.
    fn adjust_tree(&self, mut path: TreePath) -> XTreeResult<()> {
        loop {
            let page_id = path.last().unwrap().0;
            let mut node = self.get_node(page_id)?;

            if self.node_overflows(&node) {
                if node.is_super() {
                    let capacity = node.grow_super(self.inner.caps.dir_capacity)?;
                    log::debug!("extended supernode {page_id} to capacity {capacity}");
                    self.write_node(&node)?;
                    if path.len() == 1 {
                        return Ok(());
                    }
                    if !self.update_parent_mbr(&path, &node)? {
                        return Ok(());
                    }
                    path.pop();
                    continue;
                }

                let level = self.level_of(path.len());
                match self.overflow_treatment(node, &path, level)? {
                    OverflowOutcome::Reinserted => return Ok(()),
                    OverflowOutcome::SupernodeConversion => {
                        if path.len() == 1 {
                            return Ok(());
                        }
                        let node = self.get_node(page_id)?;
                        if !self.update_parent_mbr(&path, &node)? {
                            return Ok(());
                        }
                        path.pop();
                        continue;
                    }
                    OverflowOutcome::Split {
                        node,
                        new_node,
                        axis,
                    } => {
                        if path.len() == 1 {
                            return self.create_new_root(node, new_node, axis);
                        }
                        let (parent_id, idx) = (path[path.len() - 2].0, path.last().unwrap().1);
                        let mut parent = self.get_node(parent_id)?;
                        let old_mbr = node.compute_mbr().ok_or_else(|| {
                            XTreeError::InvalidState("split produced an empty node".into())
                        })?;
                        let new_mbr = new_node.compute_mbr().ok_or_else(|| {
                            XTreeError::InvalidState("split produced an empty sibling".into())
                        })?;
                        {
                            let entries = parent.dir_entries_mut();
                            let old_entry = &mut entries[idx];
                            old_entry.mbr = old_mbr;
                            old_entry.split_history.set(axis);
                            let history = old_entry.split_history.clone();
                            let new_entry =
                                DirectoryEntry::new(new_node.page_id(), new_mbr, history);
                            entries.push(new_entry);
                        }
                        self.write_node(&parent)?;
                        path.pop();
                        continue;
                    }
                }
            }

            // no overflow: propagate the MBR change, if any
            if path.len() == 1 {
                return Ok(());
            }
            let changed = self.update_parent_mbr(&path, &node)?;
            if node.is_leaf() || changed {
                path.pop();
                continue;
            }
            return Ok(());
        }
    }

    /// Refreshes the parent entry's MBR from the node's current extent.
    /// Returns whether it changed; the parent is only written when it did.
    fn update_parent_mbr(&self, path: &TreePath, node: &Node) -> XTreeResult<bool> {
        let (parent_id, idx) = (path[path.len() - 2].0, path.last().unwrap().1);
        let mut parent = self.get_node(parent_id)?;
        let new_mbr = node.compute_mbr().ok_or_else(|| {
            XTreeError::InvalidState(format!("node {} has no entries", node.page_id()))
        })?;
        let entry = &mut parent.dir_entries_mut()[idx];
        if entry.mbr == new_mbr {
            return Ok(false);
        }
        entry.mbr = new_mbr;
        self.write_node(&parent)?;
        Ok(true)
    }

    fn overflow_treatment(
        &self,
        node: Node,
        path: &TreePath,
        level: u32,
    ) -> XTreeResult<OverflowOutcome> {
        let reinsert_count = (node.capacity(
            self.inner.caps.leaf_capacity,
            self.inner.caps.dir_capacity,
        ) as f64
            * self.inner.settings.reinsert_fraction)
            .ceil() as usize;

        let first_overflow_here = path.len() > 1 && reinsert_count > 0 && {
            let mut marks = self.inner.reinserted_levels.write();
            let idx = level as usize;
            if idx >= marks.len() {
                marks.resize(idx + 1, false);
            }
            let first = !marks[idx];
            marks[idx] = true;
            first
        };

        if first_overflow_here {
            self.reinsert(node, path, level, reinsert_count)?;
            return Ok(OverflowOutcome::Reinserted);
        }
        self.split_node(node)
    }

    // ------------------------------------------------------------------
    // Forced reinsertion
    // ------------------------------------------------------------------

    /// R*-style forced reinsertion: removes the entries farthest from the
    /// node's center and reinserts them from the root at the same level,
    /// closest first.
    fn reinsert(
        &self,
        mut node: Node,
        path: &TreePath,
        level: u32,
        count: usize,
    ) -> XTreeResult<()> {
        let node_mbr = node.compute_mbr().ok_or_else(|| {
            XTreeError::InvalidState("overflowing node has no entries".into())
        })?;

        let distances: Vec<f64> = match &node {
            Node::Leaf { entries, .. } => entries
                .iter()
                .map(|e| node_mbr.center_distance_sq(e))
                .collect(),
            _ => node
                .dir_entries()
                .iter()
                .map(|e| node_mbr.center_distance_sq(&e.mbr))
                .collect(),
        };
        let mut order: Vec<usize> = (0..distances.len()).collect();
        order.sort_by(|&a, &b| {
            distances[b]
                .partial_cmp(&distances[a])
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        let count = count.min(order.len().saturating_sub(1));
        let removed = &order[..count];

        let mut keep = vec![true; distances.len()];
        for &i in removed {
            keep[i] = false;
        }

        let mut removed_leaves: Vec<LeafEntry> = Vec::new();
        let mut removed_dirs: Vec<DirectoryEntry> = Vec::new();
        match &mut node {
            Node::Leaf { entries, .. } => {
                removed_leaves = removed.iter().map(|&i| entries[i].clone()).collect();
                let mut i = 0;
                entries.retain(|_| {
                    let k = keep[i];
                    i += 1;
                    k
                });
            }
            Node::Directory { entries, .. } | Node::Super { entries, .. } => {
                removed_dirs = removed.iter().map(|&i| entries[i].clone()).collect();
                let mut i = 0;
                entries.retain(|_| {
                    let k = keep[i];
                    i += 1;
                    k
                });
            }
        }
        log::debug!(
            "reinserting {} entries from node {} at level {}",
            count,
            node.page_id(),
            level
        );

        self.write_node(&node)?;
        self.handle_super_underflow(&mut node)?;
        self.adjust_path_mbrs(path)?;

        // closest first: the removal order above is farthest first
        for entry in removed_leaves.into_iter().rev() {
            self.insert_leaf_entry(entry)?;
        }
        for entry in removed_dirs.into_iter().rev() {
            self.insert_directory_entry(entry, level)?;
        }
        Ok(())
    }

    /// Shrinks a supernode that lost enough entries, converting it back to
    /// a regular directory node once its capacity recedes to `dir_cap`.
    /// A no-op for regular nodes. Returns whether anything changed.
    fn handle_super_underflow(&self, node: &mut Node) -> XTreeResult<bool> {
        let dir_cap = self.inner.caps.dir_capacity;
        let leaf_cap = self.inner.caps.leaf_capacity;
        let mut changed = false;
        while node.is_super()
            && node.capacity(leaf_cap, dir_cap) - node.num_entries() as u32 >= dir_cap
        {
            let capacity = node.shrink_super(dir_cap)?;
            changed = true;
            log::debug!("shrunk supernode {} to capacity {capacity}", node.page_id());
        }
        if changed {
            if !node.is_super() {
                self.inner.supernodes.write().remove(&node.page_id());
            }
            self.write_node(node)?;
        }
        Ok(changed)
    }

    /// Tightens ancestor MBRs bottom-up after entries were removed from
    /// the node at the end of the path.
    fn adjust_path_mbrs(&self, path: &TreePath) -> XTreeResult<()> {
        for depth in (1..path.len()).rev() {
            let (node_id, idx) = path[depth];
            let parent_id = path[depth - 1].0;
            let node = self.get_node(node_id)?;
            let mut parent = self.get_node(parent_id)?;
            let new_mbr = node.compute_mbr().ok_or_else(|| {
                XTreeError::InvalidState(format!("node {node_id} has no entries"))
            })?;
            let entry = &mut parent.dir_entries_mut()[idx];
            if entry.mbr == new_mbr {
                break; // ancestors are already tight
            }
            entry.mbr = new_mbr;
            self.write_node(&parent)?;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Split
    // ------------------------------------------------------------------

    fn split_node(&self, mut node: Node) -> XTreeResult<OverflowOutcome> {
        debug_assert!(!node.is_super(), "supernodes grow instead of splitting");
        let caps = &self.inner.caps;
        let settings = &self.inner.settings;
        let is_leaf = node.is_leaf();

        let items: Vec<SplitItem> = match &node {
            Node::Leaf { entries, .. } => entries
                .iter()
                .map(|e| SplitItem {
                    mbr: BoundingBox::of(e),
                    history: None,
                })
                .collect(),
            _ => node
                .dir_entries()
                .iter()
                .map(|e| SplitItem {
                    mbr: e.mbr.clone(),
                    history: Some(e.split_history.clone()),
                })
                .collect(),
        };

        // point-count oracle, only consulted for the data overlap measure
        let child_pages: Vec<PageId> = if is_leaf {
            Vec::new()
        } else {
            node.dir_entries().iter().map(|e| e.child).collect()
        };
        let leaf_count = |i: usize, region: &BoundingBox| -> XTreeResult<u64> {
            Ok(region.contains(&items[i].mbr) as u64)
        };
        let dir_count = |i: usize, region: &BoundingBox| -> XTreeResult<u64> {
            self.count_points_in(child_pages[i], region)
        };
        let oracle = if settings.overlap_type == Overlap::Data {
            let total = if is_leaf {
                items.len() as u64
            } else {
                let mut total = 0;
                for &child in &child_pages {
                    total += self.subtree_point_count(child)?;
                }
                total
            };
            let count_in: &dyn Fn(usize, &BoundingBox) -> XTreeResult<u64> =
                if is_leaf { &leaf_count } else { &dir_count };
            Some(DataOverlapOracle { count_in, total })
        } else {
            None
        };

        let mut splitter = XSplitter::new(
            &items,
            self.inner.dims as usize,
            caps.min_fanout as usize,
            settings.max_overlap as f64,
            settings.overlap_type,
            oracle,
        );

        let mut plan = splitter.topological_split()?;
        if plan.is_none() {
            if is_leaf {
                return Err(XTreeError::InvalidState(
                    "topological split failed in a leaf node".into(),
                ));
            }
            plan = splitter
                .minimum_overlap_split()?
                .filter(|p| p.overlap <= settings.max_overlap as f64);
        }

        match plan {
            Some(plan) => {
                let new_page = self.inner.storage.alloc();
                let new_node = Self::apply_split(&mut node, new_page, &plan.first, &plan.second)?;
                // new children are durable before the parent references them
                self.write_node(&node)?;
                self.write_node(&new_node)?;
                log::debug!(
                    "split node {} on axis {} into sibling {} (overlap {:.4})",
                    node.page_id(),
                    plan.axis,
                    new_page,
                    plan.overlap
                );
                Ok(OverflowOutcome::Split {
                    node,
                    new_node,
                    axis: plan.axis,
                })
            }
            None => {
                let page_id = node.page_id();
                let capacity = node.make_super(caps.dir_capacity)?;
                self.write_node(&node)?;
                log::debug!(
                    "no split below overlap {:.4}; node {page_id} became a supernode of capacity {capacity}",
                    splitter.past_overlap()
                );
                Ok(OverflowOutcome::SupernodeConversion)
            }
        }
    }

    /// Partitions the node's entries: the first group stays, the second
    /// moves to a fresh sibling of the same kind.
    fn apply_split(
        node: &mut Node,
        new_page: PageId,
        first: &[usize],
        second: &[usize],
    ) -> XTreeResult<Node> {
        match node {
            Node::Leaf { entries, .. } => {
                let all = std::mem::take(entries);
                *entries = first.iter().map(|&i| all[i].clone()).collect();
                let moved = second.iter().map(|&i| all[i].clone()).collect();
                Ok(Node::Leaf {
                    page_id: new_page,
                    entries: moved,
                })
            }
            Node::Directory { entries, .. } => {
                let all = std::mem::take(entries);
                *entries = first.iter().map(|&i| all[i].clone()).collect();
                let moved = second.iter().map(|&i| all[i].clone()).collect();
                Ok(Node::Directory {
                    page_id: new_page,
                    entries: moved,
                })
            }
            Node::Super { .. } => Err(XTreeError::InvalidState(
                "supernodes are never split".into(),
            )),
        }
    }

    /// Replaces the root after a root split. The old root's content moves
    /// to a freshly allocated page so the root keeps its well-known id.
    fn create_new_root(&self, mut old_root: Node, new_node: Node, axis: usize) -> XTreeResult<()> {
        let moved_id = self.inner.storage.alloc();
        if old_root.is_super() {
            self.inner.supernodes.write().remove(&ROOT_PAGE_ID);
        }
        old_root.set_page_id(moved_id);
        self.write_node(&old_root)?;
        self.write_node(&new_node)?;

        let history = {
            let mut root_history = self.inner.root_history.write();
            root_history.set(axis);
            root_history.clone()
        };
        let old_mbr = old_root.compute_mbr().ok_or_else(|| {
            XTreeError::InvalidState("old root has no entries".into())
        })?;
        let new_mbr = new_node.compute_mbr().ok_or_else(|| {
            XTreeError::InvalidState("new sibling has no entries".into())
        })?;

        let mut root = Node::new_directory(ROOT_PAGE_ID);
        root.add_directory_entry(DirectoryEntry::new(moved_id, old_mbr, history.clone()));
        root.add_directory_entry(DirectoryEntry::new(new_node.page_id(), new_mbr, history));
        self.write_node(&root)?;

        let mut height = self.inner.height.write();
        *height += 1;
        log::debug!("root split on axis {axis}; height is now {}", *height);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Point counting (data overlap measure)
    // ------------------------------------------------------------------

    fn count_points_in(&self, page_id: PageId, region: &BoundingBox) -> XTreeResult<u64> {
        let node = self.get_node(page_id)?;
        match &node {
            Node::Leaf { entries, .. } => Ok(entries
                .iter()
                .filter(|e| region.contains(*e))
                .count() as u64),
            _ => {
                let mut total = 0;
                for e in node.dir_entries() {
                    if e.mbr.intersects(region) {
                        total += self.count_points_in(e.child, region)?;
                    }
                }
                Ok(total)
            }
        }
    }

    fn subtree_point_count(&self, page_id: PageId) -> XTreeResult<u64> {
        let node = self.get_node(page_id)?;
        match &node {
            Node::Leaf { entries, .. } => Ok(entries.len() as u64),
            _ => {
                let mut total = 0;
                for e in node.dir_entries() {
                    total += self.subtree_point_count(e.child)?;
                }
                Ok(total)
            }
        }
    }

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

    /// Ids of all points whose position intersects the query box.
    pub fn query_intersecting(&self, query: &BoundingBox) -> XTreeResult<Vec<u64>> {
        self.check_closed()?;
        let mut results = Vec::new();
        self.search(ROOT_PAGE_ID, query, &mut results)?;
        Ok(results)
    }

    /// Ids of all points contained in the query box. For point data this
    /// coincides with [`XTree::query_intersecting`]; both are kept for
    /// parity with box-shaped queries.
    pub fn query_contained(&self, query: &BoundingBox) -> XTreeResult<Vec<u64>> {
        self.query_intersecting(query)
    }

    fn search(
        &self,
        page_id: PageId,
        query: &BoundingBox,
        results: &mut Vec<u64>,
    ) -> XTreeResult<()> {
        let node = self.get_node(page_id)?;
        match &node {
            Node::Leaf { entries, .. } => {
                for e in entries {
                    if query.contains(e) {
                        results.push(e.id);
                    }
                }
            }
            _ => {
                for e in node.dir_entries() {
                    if e.mbr.intersects(query) {
                        self.search(e.child, query, results)?;
                    }
                }
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Statistics
    // ------------------------------------------------------------------

    /// Counts nodes per kind by a breadth-first walk.
    pub fn stats(&self) -> XTreeResult<XTreeStats> {
        self.check_closed()?;
        let mut stats = XTreeStats {
            height: self.height(),
            num_elements: self.size(),
            ..XTreeStats::default()
        };

        let mut queue = VecDeque::from([ROOT_PAGE_ID]);
        while let Some(page_id) = queue.pop_front() {
            let node = self.get_node(page_id)?;
            match &node {
                Node::Leaf { .. } => stats.leaf_nodes += 1,
                Node::Directory { entries, .. } => {
                    stats.dir_nodes += 1;
                    queue.extend(entries.iter().map(|e| e.child));
                }
                Node::Super {
                    entries, capacity, ..
                } => {
                    stats.super_nodes += 1;
                    stats.min_super_capacity = Some(
                        stats
                            .min_super_capacity
                            .map_or(*capacity, |c| c.min(*capacity)),
                    );
                    stats.max_super_capacity = Some(
                        stats
                            .max_super_capacity
                            .map_or(*capacity, |c| c.max(*capacity)),
                    );
                    queue.extend(entries.iter().map(|e| e.child));
                }
            }
        }
        Ok(stats)
    }

    // ------------------------------------------------------------------
    // Commit & close
    // ------------------------------------------------------------------

    /// Persists the header and appends all supernodes behind the paged
    /// region. Regular pages are already durable at this point; the commit
    /// makes the supernodes and the element count so.
    pub fn commit(&self) -> XTreeResult<()> {
        self.check_closed()?;
        let _guard = self.inner.write_lock.lock();

        let mut header = self.inner.header.write();
        header.supernode_offset =
            self.inner.storage.next_page_id() as u64 * header.page_size as u64;
        self.inner.storage.write_header(&header)?;
        drop(header);

        let supernodes = self.inner.supernodes.read();
        self.inner
            .storage
            .write_supernode_region(&supernodes, self.inner.dims, &self.inner.caps)?;
        drop(supernodes);

        self.inner.storage.sync()?;
        Ok(())
    }

    /// Commits and marks the index closed; later operations fail.
    pub fn close(&self) -> XTreeResult<()> {
        {
            let closed = self.inner.closed.read();
            if *closed {
                return Ok(());
            }
        }
        self.commit()?;
        *self.inner.closed.write() = true;
        Ok(())
    }
}

impl Drop for XTree {
    fn drop(&mut self) {
        // best effort: an explicitly closed tree was already committed
        if !*self.inner.closed.read() {
            let _ = self.commit();
        }
    }
}
