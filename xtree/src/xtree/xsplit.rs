//! The X-split: topological split candidate enumeration with split-history
//! constraint, minimum-overlap fallback and the supernode escape hatch.
//!
//! The splitter works on prepared [`SplitItem`]s so leaf and directory
//! splits share one enumeration. For the data-count overlap measure the
//! caller supplies an oracle that counts the data points beneath an item
//! inside a query box; the volume measure is purely geometric.

use std::cmp::Ordering;

use super::split_history::SplitHistory;
use super::xtree_settings::Overlap;
use super::xtree_types::{XTreeError, XTreeResult};
use crate::bounding_box::{BoundingBox, Spatial};

/// One entry of the overflowing node, reduced to what the split needs.
/// `history` is `None` for leaf entries, which are unconstrained.
pub(crate) struct SplitItem {
    pub mbr: BoundingBox,
    pub history: Option<SplitHistory>,
}

/// A chosen partition: indices into the original entry slice.
#[derive(Debug, Clone)]
pub(crate) struct SplitPlan {
    pub axis: usize,
    pub first: Vec<usize>,
    pub second: Vec<usize>,
    pub overlap: f64,
}

/// Point-count access for the `Overlap::Data` measure: `count_in(i, b)`
/// returns the number of data points beneath item `i` lying inside `b`,
/// `total` the number of points beneath all items together.
pub(crate) struct DataOverlapOracle<'a> {
    pub count_in: &'a dyn Fn(usize, &BoundingBox) -> XTreeResult<u64>,
    pub total: u64,
}

pub(crate) struct XSplitter<'a> {
    items: &'a [SplitItem],
    dims: usize,
    min_fanout: usize,
    max_overlap: f64,
    overlap_type: Overlap,
    data: Option<DataOverlapOracle<'a>>,
    past_overlap: f64,
}

impl<'a> XSplitter<'a> {
    pub fn new(
        items: &'a [SplitItem],
        dims: usize,
        min_fanout: usize,
        max_overlap: f64,
        overlap_type: Overlap,
        data: Option<DataOverlapOracle<'a>>,
    ) -> XSplitter<'a> {
        debug_assert!(items.len() >= 2 * min_fanout);
        XSplitter {
            items,
            dims,
            min_fanout,
            max_overlap,
            overlap_type,
            data,
            past_overlap: f64::INFINITY,
        }
    }

    /// Smallest overlap seen by the last enumeration, for diagnostics.
    pub fn past_overlap(&self) -> f64 {
        self.past_overlap
    }

    /// The preferred split: restrict the axes by the split histories, rank
    /// them by the perimeter-sum goodness of all their candidates, then
    /// take the minimum-overlap candidate along the best axis. Returns
    /// `None` when no axis survives the history constraint or the best
    /// candidate still exceeds the overlap threshold.
    pub fn topological_split(&mut self) -> XTreeResult<Option<SplitPlan>> {
        if self.items.len() < 2 * self.min_fanout {
            return Ok(None);
        }
        let axes = self.candidate_axes();
        if axes.is_empty() {
            return Ok(None);
        }

        let mut best_axis = axes[0];
        let mut best_score = f64::INFINITY;
        for &axis in &axes {
            let score = self.axis_score(axis)?;
            if score < best_score {
                best_score = score;
                best_axis = axis;
            }
        }

        let plan = self
            .min_overlap_on_axes(&[best_axis])?
            .expect("an axis with candidates always yields a plan");
        if plan.overlap > self.max_overlap {
            log::debug!(
                "topological split failed on axis {}: overlap {:.4} > {:.4}",
                best_axis,
                plan.overlap,
                self.max_overlap
            );
            return Ok(None);
        }
        Ok(Some(plan))
    }

    /// The fallback for directory nodes: the globally minimal-overlap
    /// candidate across all axes, irrespective of axis goodness and of the
    /// split histories. The caller compares the result against the overlap
    /// threshold and converts to a supernode when it still exceeds it.
    pub fn minimum_overlap_split(&mut self) -> XTreeResult<Option<SplitPlan>> {
        if self.items.len() < 2 * self.min_fanout {
            return Ok(None);
        }
        let axes: Vec<usize> = (0..self.dims).collect();
        self.min_overlap_on_axes(&axes)
    }

    /// Axes a directory split may legally use: the history bit must be set
    /// in all entries or in none. Leaf entries carry no history and leave
    /// every axis available.
    fn candidate_axes(&self) -> Vec<usize> {
        if self.items.iter().any(|i| i.history.is_none()) {
            return (0..self.dims).collect();
        }
        (0..self.dims)
            .filter(|&axis| {
                let mut any = false;
                let mut all = true;
                for item in self.items {
                    let set = item.history.as_ref().unwrap().is_set(axis);
                    any |= set;
                    all &= set;
                }
                all || !any
            })
            .collect()
    }

    /// Entry indices sorted by the lower and by the upper bound along an
    /// axis; both orders contribute split candidates.
    fn sorted_orders(&self, axis: usize) -> [Vec<usize>; 2] {
        let mut by_lo: Vec<usize> = (0..self.items.len()).collect();
        by_lo.sort_by(|&a, &b| {
            self.items[a]
                .mbr
                .lo(axis)
                .partial_cmp(&self.items[b].mbr.lo(axis))
                .unwrap_or(Ordering::Equal)
        });
        let mut by_hi: Vec<usize> = (0..self.items.len()).collect();
        by_hi.sort_by(|&a, &b| {
            self.items[a]
                .mbr
                .hi(axis)
                .partial_cmp(&self.items[b].mbr.hi(axis))
                .unwrap_or(Ordering::Equal)
        });
        [by_lo, by_hi]
    }

    /// Running unions over an order: `prefix[k]` covers `order[0..=k]`,
    /// `suffix[k]` covers `order[k..]`.
    fn prefix_suffix(&self, order: &[usize]) -> (Vec<BoundingBox>, Vec<BoundingBox>) {
        let n = order.len();
        let mut prefix = Vec::with_capacity(n);
        let mut running = self.items[order[0]].mbr.clone();
        prefix.push(running.clone());
        for &i in &order[1..] {
            running.expand(&self.items[i].mbr);
            prefix.push(running.clone());
        }

        let mut suffix = vec![BoundingBox::default(); n];
        let mut running = self.items[order[n - 1]].mbr.clone();
        suffix[n - 1] = running.clone();
        for k in (0..n - 1).rev() {
            running.expand(&self.items[order[k]].mbr);
            suffix[k] = running.clone();
        }
        (prefix, suffix)
    }

    /// Goodness of an axis: the summed perimeters of both halves over all
    /// candidates of both sort orders. Smaller is better.
    fn axis_score(&self, axis: usize) -> XTreeResult<f64> {
        let n = self.items.len();
        let mut score = 0.0;
        for order in self.sorted_orders(axis) {
            let (prefix, suffix) = self.prefix_suffix(&order);
            for k in self.min_fanout..=(n - self.min_fanout) {
                score += prefix[k - 1].perimeter() + suffix[k].perimeter();
            }
        }
        if !score.is_finite() {
            return Err(XTreeError::NumericOverflow(format!(
                "axis {axis} split goodness is not finite"
            )));
        }
        Ok(score)
    }

    /// Minimum-overlap candidate across the given axes; overlap ties are
    /// broken by the smaller total volume of the two halves.
    fn min_overlap_on_axes(&mut self, axes: &[usize]) -> XTreeResult<Option<SplitPlan>> {
        let n = self.items.len();
        let mut best: Option<(f64, f64, SplitPlan)> = None;

        for &axis in axes {
            for order in self.sorted_orders(axis) {
                let (prefix, suffix) = self.prefix_suffix(&order);
                for k in self.min_fanout..=(n - self.min_fanout) {
                    let a = &prefix[k - 1];
                    let b = &suffix[k];
                    let overlap = self.candidate_overlap(a, b)?;
                    let volumes = a.volume()? + b.volume()?;
                    let better = match &best {
                        None => true,
                        Some((best_overlap, best_volumes, _)) => {
                            overlap < *best_overlap
                                || (overlap == *best_overlap && volumes < *best_volumes)
                        }
                    };
                    if better {
                        best = Some((
                            overlap,
                            volumes,
                            SplitPlan {
                                axis,
                                first: order[..k].to_vec(),
                                second: order[k..].to_vec(),
                                overlap,
                            },
                        ));
                    }
                }
            }
        }

        Ok(best.map(|(overlap, _, plan)| {
            self.past_overlap = self.past_overlap.min(overlap);
            plan
        }))
    }

    fn candidate_overlap(&self, a: &BoundingBox, b: &BoundingBox) -> XTreeResult<f64> {
        match self.overlap_type {
            Overlap::Volume => {
                let intersection = a.intersection_volume(b)?;
                if intersection <= 0.0 {
                    return Ok(0.0);
                }
                let volumes = a.volume()? + b.volume()?;
                Ok(intersection / volumes)
            }
            Overlap::Data => {
                let oracle = self.data.as_ref().ok_or_else(|| {
                    XTreeError::InvalidState(
                        "data overlap requires a point-count oracle".into(),
                    )
                })?;
                if oracle.total == 0 {
                    return Ok(0.0);
                }
                let region = match BoundingBox::intersection(a, b) {
                    Some(region) => region,
                    None => return Ok(0.0),
                };
                let mut inside = 0u64;
                for i in 0..self.items.len() {
                    inside += (oracle.count_in)(i, &region)?;
                }
                Ok(inside as f64 / oracle.total as f64)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn leaf_item(x: f64, y: f64) -> SplitItem {
        SplitItem {
            mbr: BoundingBox::point(&[x, y]),
            history: None,
        }
    }

    fn dir_item(lo: [f64; 2], hi: [f64; 2], history_axes: &[usize]) -> SplitItem {
        let mut history = SplitHistory::new(2);
        for &a in history_axes {
            history.set(a);
        }
        SplitItem {
            mbr: BoundingBox::new(lo.to_vec(), hi.to_vec()),
            history: Some(history),
        }
    }

    #[test]
    fn test_collinear_points_split_on_spread_axis() {
        // points on the line x = 0, arriving out of order; only axis 1
        // separates them, so its candidates have the smaller perimeters
        let items: Vec<SplitItem> = [0.0, 3.0, 1.0, 4.0, 2.0]
            .iter()
            .map(|&y| leaf_item(0.0, y))
            .collect();
        let mut splitter = XSplitter::new(&items, 2, 2, 0.2, Overlap::Volume, None);
        let plan = splitter.topological_split().unwrap().unwrap();
        assert_eq!(plan.axis, 1);
        assert!(plan.first.len() >= 2 && plan.second.len() >= 2);
        assert_eq!(plan.overlap, 0.0);
    }

    #[test]
    fn test_partition_respects_sort_order() {
        let items: Vec<SplitItem> =
            [3.0, 0.0, 4.0, 1.0, 2.0].iter().map(|&y| leaf_item(0.0, y)).collect();
        let mut splitter = XSplitter::new(&items, 2, 2, 0.2, Overlap::Volume, None);
        let plan = splitter.topological_split().unwrap().unwrap();
        // the halves must be separated along the chosen axis
        let max_first = plan
            .first
            .iter()
            .map(|&i| items[i].mbr.hi(1))
            .fold(f64::NEG_INFINITY, f64::max);
        let min_second = plan
            .second
            .iter()
            .map(|&i| items[i].mbr.lo(1))
            .fold(f64::INFINITY, f64::min);
        assert!(max_first <= min_second);
    }

    #[test]
    fn test_history_constraint_filters_axes() {
        // all entries were split along axis 0 before, none along axis 1:
        // both axes pass the all-or-none test
        let items = vec![
            dir_item([0.0, 0.0], [1.0, 1.0], &[0]),
            dir_item([2.0, 0.0], [3.0, 1.0], &[0]),
            dir_item([0.0, 2.0], [1.0, 3.0], &[0]),
            dir_item([2.0, 2.0], [3.0, 3.0], &[0]),
        ];
        let splitter = XSplitter::new(&items, 2, 2, 0.2, Overlap::Volume, None);
        assert_eq!(splitter.candidate_axes(), vec![0, 1]);

        // axis 0 set in some but not all entries: only axis 1 remains
        let items = vec![
            dir_item([0.0, 0.0], [1.0, 1.0], &[0]),
            dir_item([2.0, 0.0], [3.0, 1.0], &[]),
            dir_item([0.0, 2.0], [1.0, 3.0], &[0]),
            dir_item([2.0, 2.0], [3.0, 3.0], &[]),
        ];
        let splitter = XSplitter::new(&items, 2, 2, 0.2, Overlap::Volume, None);
        assert_eq!(splitter.candidate_axes(), vec![1]);
    }

    #[test]
    fn test_no_candidate_axis_fails_topological() {
        // every axis disagrees across the histories
        let items = vec![
            dir_item([0.0, 0.0], [1.0, 1.0], &[0]),
            dir_item([2.0, 0.0], [3.0, 1.0], &[1]),
            dir_item([0.0, 2.0], [1.0, 3.0], &[0]),
            dir_item([2.0, 2.0], [3.0, 3.0], &[1]),
        ];
        let mut splitter = XSplitter::new(&items, 2, 2, 0.2, Overlap::Volume, None);
        assert!(splitter.topological_split().unwrap().is_none());
        // the fallback still produces the best possible partition
        let plan = splitter.minimum_overlap_split().unwrap().unwrap();
        assert_eq!(plan.overlap, 0.0);
    }

    #[test]
    fn test_identical_mbrs_exceed_threshold() {
        // five identical boxes cannot be separated: overlap is 0.5
        let items: Vec<SplitItem> = (0..5)
            .map(|_| dir_item([0.0, 0.0], [2.0, 2.0], &[]))
            .collect();
        let mut splitter = XSplitter::new(&items, 2, 2, 0.2, Overlap::Volume, None);
        assert!(splitter.topological_split().unwrap().is_none());
        let plan = splitter.minimum_overlap_split().unwrap().unwrap();
        assert!((plan.overlap - 0.5).abs() < 1e-9);
        assert!(plan.overlap > 0.2);
    }

    #[test]
    fn test_degenerate_point_boxes_have_zero_overlap() {
        // duplicate points: both halves collapse to the same point, but the
        // volume measure treats zero-volume intersections as zero overlap
        let items: Vec<SplitItem> = (0..4).map(|_| leaf_item(1.0, 1.0)).collect();
        let mut splitter = XSplitter::new(&items, 2, 2, 0.2, Overlap::Volume, None);
        let plan = splitter.topological_split().unwrap().unwrap();
        assert_eq!(plan.overlap, 0.0);
    }

    #[test]
    fn test_data_overlap_counts_points() {
        // two clusters of points with one straggler in the middle
        let coords = [
            [0.0, 0.0],
            [0.0, 1.0],
            [5.0, 5.0],
            [0.5, 0.5],
            [5.0, 6.0],
        ];
        let items: Vec<SplitItem> = coords
            .iter()
            .map(|c| leaf_item(c[0], c[1]))
            .collect();
        let count_in = |i: usize, b: &BoundingBox| -> XTreeResult<u64> {
            Ok(b.contains(&items[i].mbr) as u64)
        };
        let oracle = DataOverlapOracle {
            count_in: &count_in,
            total: coords.len() as u64,
        };
        let mut splitter = XSplitter::new(&items, 2, 2, 0.2, Overlap::Data, Some(oracle));
        let plan = splitter.topological_split().unwrap().unwrap();
        // clean separation: no point in the intersection of the halves
        assert_eq!(plan.overlap, 0.0);
        assert_eq!(plan.first.len() + plan.second.len(), 5);
    }

    #[test]
    fn test_past_overlap_tracks_minimum() {
        let items: Vec<SplitItem> = (0..5)
            .map(|_| dir_item([0.0, 0.0], [2.0, 2.0], &[]))
            .collect();
        let mut splitter = XSplitter::new(&items, 2, 2, 0.2, Overlap::Volume, None);
        let _ = splitter.topological_split().unwrap();
        assert!((splitter.past_overlap() - 0.5).abs() < 1e-9);
    }
}
