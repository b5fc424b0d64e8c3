//! Configuration for the X-tree and the capacities derived from it.

use serde::{Deserialize, Serialize};

use super::xtree_constants::{
    DEFAULT_MAX_OVERLAP, DEFAULT_PAGE_SIZE, DEFAULT_REINSERT_FRACTION, DEFAULT_REL_MIN_ENTRIES,
    DEFAULT_REL_MIN_FANOUT, NODE_PRELUDE_SIZE,
};
use super::xtree_types::{DirectoryEntry, LeafEntry, XTreeError, XTreeResult};

/// How the overlap of two split halves is measured.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Overlap {
    /// `intersection_volume(A, B) / (volume(A) + volume(B))`.
    Volume,
    /// Fraction of the data points beneath the two halves whose position
    /// lies inside `intersection(A, B)`.
    Data,
}

/// Tuning knobs of the index. Validated once at construction; invalid
/// combinations are reported as `ConfigInvalid` before any file is touched.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct XTreeSettings {
    /// Bytes per page; together with the entry sizes this determines the
    /// node capacities.
    pub page_size: u32,
    /// Overlap measure used by the X-split.
    pub overlap_type: Overlap,
    /// Threshold in [0, 1] above which a topological split is rejected.
    pub max_overlap: f32,
    /// Ratio deriving `leaf_minimum`/`dir_minimum` from the capacities.
    pub rel_min_entries: f64,
    /// Ratio deriving `min_fanout` from the directory capacity.
    pub rel_min_fanout: f64,
    /// Fraction of a node's entries removed on the first overflow per level.
    pub reinsert_fraction: f64,
    /// Skip the overlap-increase term of choose-subtree when descending
    /// into a supernode. Necessary for some parameterizations to finish
    /// tree construction in reasonable time.
    pub omit_overlap_for_supernodes: bool,
    /// Explicit leaf capacity instead of the derived one. Must still fit
    /// the page layout; mainly for tests and tuning experiments.
    pub leaf_capacity: Option<u32>,
    /// Explicit directory capacity instead of the derived one.
    pub dir_capacity: Option<u32>,
}

impl Default for XTreeSettings {
    fn default() -> XTreeSettings {
        XTreeSettings {
            page_size: DEFAULT_PAGE_SIZE,
            overlap_type: Overlap::Volume,
            max_overlap: DEFAULT_MAX_OVERLAP,
            rel_min_entries: DEFAULT_REL_MIN_ENTRIES,
            rel_min_fanout: DEFAULT_REL_MIN_FANOUT,
            reinsert_fraction: DEFAULT_REINSERT_FRACTION,
            omit_overlap_for_supernodes: true,
            leaf_capacity: None,
            dir_capacity: None,
        }
    }
}

impl XTreeSettings {
    pub fn validate(&self) -> XTreeResult<()> {
        if self.page_size < 64 {
            return Err(XTreeError::ConfigInvalid(format!(
                "page_size of {} bytes is too small",
                self.page_size
            )));
        }
        if !(0.0..=1.0).contains(&self.max_overlap) {
            return Err(XTreeError::ConfigInvalid(format!(
                "max_overlap must lie in [0, 1], got {}",
                self.max_overlap
            )));
        }
        if !(0.0 < self.rel_min_entries && self.rel_min_entries <= 0.5) {
            return Err(XTreeError::ConfigInvalid(format!(
                "rel_min_entries must lie in (0, 0.5], got {}",
                self.rel_min_entries
            )));
        }
        if !(0.0 < self.rel_min_fanout && self.rel_min_fanout < 1.0) {
            return Err(XTreeError::ConfigInvalid(format!(
                "rel_min_fanout must lie in (0, 1), got {}",
                self.rel_min_fanout
            )));
        }
        if !(0.0..1.0).contains(&self.reinsert_fraction) {
            return Err(XTreeError::ConfigInvalid(format!(
                "reinsert_fraction must lie in [0, 1), got {}",
                self.reinsert_fraction
            )));
        }
        Ok(())
    }
}

/// Node capacities and split bounds, fixed at construction time from the
/// page size and the measured per-entry byte sizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capacities {
    pub leaf_capacity: u32,
    pub dir_capacity: u32,
    pub leaf_minimum: u32,
    pub dir_minimum: u32,
    pub min_fanout: u32,
}

impl Capacities {
    /// Derives the capacities for a tree of the given dimensionality.
    ///
    /// One entry slot per page is held back so the transiently overflowing
    /// node can still be written before its overflow is treated.
    pub fn derive(settings: &XTreeSettings, dims: u32) -> XTreeResult<Capacities> {
        settings.validate()?;
        if dims == 0 {
            return Err(XTreeError::ConfigInvalid("dimensionality must be positive".into()));
        }

        let page = settings.page_size as usize;
        let leaf_entry = LeafEntry::encoded_len(dims);
        let dir_entry = DirectoryEntry::encoded_len(dims);

        let leaf_capacity = match settings.leaf_capacity {
            Some(cap) => {
                Self::check_fit(page, "leaf", cap, leaf_entry)?;
                cap
            }
            None => Self::fit(page, leaf_entry),
        };
        let dir_capacity = match settings.dir_capacity {
            Some(cap) => {
                Self::check_fit(page, "directory", cap, dir_entry)?;
                cap
            }
            None => Self::fit(page, dir_entry),
        };

        if leaf_capacity <= 1 {
            return Err(XTreeError::ConfigInvalid(format!(
                "page_size of {} bytes holds no more than one {}-dimensional leaf entry",
                settings.page_size, dims
            )));
        }
        if dir_capacity <= 1 {
            return Err(XTreeError::ConfigInvalid(format!(
                "page_size of {} bytes holds no more than one {}-dimensional directory entry",
                settings.page_size, dims
            )));
        }
        if leaf_capacity < 10 {
            log::warn!(
                "page size is chosen very small, leaf capacity is only {leaf_capacity}"
            );
        }
        if dir_capacity < 10 {
            log::warn!(
                "page size is chosen very small, directory capacity is only {dir_capacity}"
            );
        }

        let leaf_minimum =
            (((leaf_capacity - 1) as f64 * settings.rel_min_entries).round() as u32).max(2);
        let dir_minimum =
            (((dir_capacity - 1) as f64 * settings.rel_min_entries).round() as u32).max(2);
        let min_fanout =
            (((dir_capacity - 1) as f64 * settings.rel_min_fanout).round() as u32).max(2);

        // an overflowing node holds capacity + 1 entries and both split
        // halves must reach min_fanout
        if 2 * min_fanout > dir_capacity + 1 || 2 * min_fanout > leaf_capacity + 1 {
            return Err(XTreeError::ConfigInvalid(format!(
                "min_fanout of {min_fanout} leaves no legal split for capacities \
                 {leaf_capacity}/{dir_capacity}"
            )));
        }

        Ok(Capacities {
            leaf_capacity,
            dir_capacity,
            leaf_minimum,
            dir_minimum,
            min_fanout,
        })
    }

    /// Largest stable fill such that `fill + 1` entries still fit the page.
    fn fit(page: usize, entry_len: usize) -> u32 {
        let usable = page.saturating_sub(NODE_PRELUDE_SIZE);
        (usable / entry_len).saturating_sub(1) as u32
    }

    fn check_fit(page: usize, kind: &str, cap: u32, entry_len: usize) -> XTreeResult<()> {
        let needed = NODE_PRELUDE_SIZE + (cap as usize + 1) * entry_len;
        if needed > page {
            return Err(XTreeError::ConfigInvalid(format!(
                "{kind} capacity {cap} needs {needed} bytes per page, page_size is {page}"
            )));
        }
        Ok(())
    }

    /// Number of page-size slots a supernode of the given capacity occupies
    /// in the supernode region.
    pub fn super_pages(&self, capacity: u32) -> u32 {
        (capacity + self.dir_capacity - 1) / self.dir_capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let settings = XTreeSettings::default();
        assert!(settings.validate().is_ok());
        let caps = Capacities::derive(&settings, 8).unwrap();
        assert!(caps.leaf_capacity > caps.dir_capacity);
        assert!(caps.leaf_minimum >= 2);
        assert!(caps.dir_minimum >= 2);
        assert!(caps.min_fanout >= 2);
    }

    #[test]
    fn test_derived_capacities_fit_page() {
        let settings = XTreeSettings::default();
        for dims in [2u32, 4, 16, 64] {
            let caps = Capacities::derive(&settings, dims).unwrap();
            let leaf_bytes = super::super::xtree_constants::NODE_PRELUDE_SIZE
                + (caps.leaf_capacity as usize + 1) * LeafEntry::encoded_len(dims);
            let dir_bytes = super::super::xtree_constants::NODE_PRELUDE_SIZE
                + (caps.dir_capacity as usize + 1) * DirectoryEntry::encoded_len(dims);
            assert!(leaf_bytes <= settings.page_size as usize);
            assert!(dir_bytes <= settings.page_size as usize);
        }
    }

    #[test]
    fn test_page_too_small() {
        let settings = XTreeSettings {
            page_size: 64,
            ..XTreeSettings::default()
        };
        let err = Capacities::derive(&settings, 16).unwrap_err();
        assert!(matches!(err, XTreeError::ConfigInvalid(_)));
    }

    #[test]
    fn test_capacity_override() {
        let settings = XTreeSettings {
            page_size: 256,
            leaf_capacity: Some(4),
            dir_capacity: Some(4),
            ..XTreeSettings::default()
        };
        let caps = Capacities::derive(&settings, 2).unwrap();
        assert_eq!(caps.leaf_capacity, 4);
        assert_eq!(caps.dir_capacity, 4);
        assert_eq!(caps.leaf_minimum, 2);
        assert_eq!(caps.dir_minimum, 2);
        assert_eq!(caps.min_fanout, 2);
    }

    #[test]
    fn test_capacity_override_must_fit() {
        let settings = XTreeSettings {
            page_size: 128,
            dir_capacity: Some(16),
            ..XTreeSettings::default()
        };
        assert!(matches!(
            Capacities::derive(&settings, 2),
            Err(XTreeError::ConfigInvalid(_))
        ));
    }

    #[test]
    fn test_invalid_ranges_rejected() {
        let mut s = XTreeSettings::default();
        s.max_overlap = 1.5;
        assert!(s.validate().is_err());

        let mut s = XTreeSettings::default();
        s.rel_min_entries = 0.0;
        assert!(s.validate().is_err());

        let mut s = XTreeSettings::default();
        s.reinsert_fraction = 1.0;
        assert!(s.validate().is_err());
    }

    #[test]
    fn test_super_pages() {
        let caps = Capacities {
            leaf_capacity: 4,
            dir_capacity: 4,
            leaf_minimum: 2,
            dir_minimum: 2,
            min_fanout: 2,
        };
        assert_eq!(caps.super_pages(8), 2);
        assert_eq!(caps.super_pages(12), 3);
    }
}
