//! # xtree - a disk-resident X-tree spatial index
//!
//! This crate implements the X-tree of Berchtold, Keim and Kriegel
//! (VLDB'96): a paged, dynamic spatial index for high-dimensional point
//! data. It extends the R*-tree with per-entry split histories and with
//! supernodes, variable-size directory nodes used whenever no split with
//! acceptable overlap exists.
//!
//! ## Features
//!
//! - **Disk-resident**: fixed-size pages with a single reserved header
//!   slot; supernodes are kept in memory and appended behind the paged
//!   region on commit
//! - **R\*-style insertion**: choose-subtree with overlap-enlargement,
//!   forced reinsertion on the first overflow per level
//! - **X-split**: topological split with the split-history constraint,
//!   minimum-overlap fallback, supernode escape hatch
//! - **Window queries**: intersection and containment over the indexed
//!   points
//! - **Single-writer**: mutation serializes behind one lock
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use xtree::{BoundingBox, XTree, XTreeSettings};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let tree = XTree::create("points.xtree", 3, XTreeSettings::default())?;
//!
//! tree.insert(&[0.1, 0.2, 0.3], 1)?;
//! tree.insert(&[0.4, 0.5, 0.6], 2)?;
//!
//! let hits = tree.query_intersecting(&BoundingBox::new(
//!     vec![0.0, 0.0, 0.0],
//!     vec![0.25, 0.25, 0.35],
//! ))?;
//! assert_eq!(hits, vec![1]);
//!
//! tree.commit()?;
//! # Ok(())
//! # }
//! ```
//!
//! Reopening a committed index restores capacities and the supernode map
//! from the file:
//!
//! ```rust,no_run
//! use xtree::XTree;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let tree = XTree::open("points.xtree")?;
//! println!("{} points, height {}", tree.size(), tree.height());
//! # Ok(())
//! # }
//! ```

pub mod bounding_box;
pub mod xtree;

pub use bounding_box::{BoundingBox, Spatial};
pub use xtree::{
    Capacities, Overlap, XTree, XTreeError, XTreeHeader, XTreeResult, XTreeSettings, XTreeStats,
};
