//! Axis-aligned minimum bounding rectangles over d-dimensional space.
//!
//! `BoundingBox` is the geometric workhorse of the index: every node,
//! directory entry and query region is described by one. The [`Spatial`]
//! trait gives points, entries and boxes a uniform read-only view so the
//! geometry routines below work on all of them without materializing
//! intermediate boxes.

use serde::{Deserialize, Serialize};

use crate::xtree::xtree_types::{XTreeError, XTreeResult};

/// Read-only view of an axis-aligned spatial object: `dims` dimensions,
/// each spanning `[lo(d), hi(d)]`. A point has `lo(d) == hi(d)` everywhere.
pub trait Spatial {
    fn dims(&self) -> usize;
    fn lo(&self, dim: usize) -> f64;
    fn hi(&self, dim: usize) -> f64;

    /// Volume of the object, `∏ (hi - lo)`.
    ///
    /// Fails with `NumericOverflow` when the product is not finite; callers
    /// in the insertion path treat that as fatal for the current insertion.
    fn volume(&self) -> XTreeResult<f64> {
        let mut v = 1.0;
        for d in 0..self.dims() {
            v *= self.hi(d) - self.lo(d);
        }
        if !v.is_finite() {
            return Err(XTreeError::NumericOverflow(format!(
                "volume is not finite ({v}); re-scale the data"
            )));
        }
        Ok(v)
    }

    /// Sum of the extents over all dimensions (the "margin" of R*-tree
    /// literature). Used as the goodness measure of split candidates.
    fn perimeter(&self) -> f64 {
        let mut p = 0.0;
        for d in 0..self.dims() {
            p += self.hi(d) - self.lo(d);
        }
        p
    }

    /// Center coordinate in the given dimension.
    fn center(&self, dim: usize) -> f64 {
        (self.lo(dim) + self.hi(dim)) / 2.0
    }

    /// True when `other` lies completely inside this object.
    fn contains<S: Spatial>(&self, other: &S) -> bool {
        for d in 0..self.dims() {
            if self.lo(d) > other.lo(d) || other.hi(d) > self.hi(d) {
                return false;
            }
        }
        true
    }

    /// True when the two objects share at least a boundary point.
    fn intersects<S: Spatial>(&self, other: &S) -> bool {
        for d in 0..self.dims() {
            if self.lo(d) > other.hi(d) || self.hi(d) < other.lo(d) {
                return false;
            }
        }
        true
    }

    /// Volume of the intersection, `∏ max(0, min(hi) - max(lo))`.
    fn intersection_volume<S: Spatial>(&self, other: &S) -> XTreeResult<f64> {
        let mut v = 1.0;
        for d in 0..self.dims() {
            let extent = self.hi(d).min(other.hi(d)) - self.lo(d).max(other.lo(d));
            if extent <= 0.0 {
                return Ok(0.0);
            }
            v *= extent;
        }
        if !v.is_finite() {
            return Err(XTreeError::NumericOverflow(format!(
                "intersection volume is not finite ({v})"
            )));
        }
        Ok(v)
    }

    /// Strict componentwise floating-point equality, no epsilon.
    fn equals_exact<S: Spatial>(&self, other: &S) -> bool {
        if self.dims() != other.dims() {
            return false;
        }
        for d in 0..self.dims() {
            if self.lo(d) != other.lo(d) || self.hi(d) != other.hi(d) {
                return false;
            }
        }
        true
    }

    /// Squared L2 distance between the centers of two objects.
    fn center_distance_sq<S: Spatial>(&self, other: &S) -> f64 {
        let mut sum = 0.0;
        for d in 0..self.dims() {
            let delta = self.center(d) - other.center(d);
            sum += delta * delta;
        }
        sum
    }
}

/// A d-dimensional minimum bounding rectangle given by its minimum and
/// maximum corner. Invariant: `lo[d] <= hi[d]` for every dimension.
#[derive(Clone, PartialEq, Default, Debug, Serialize, Deserialize)]
pub struct BoundingBox {
    lo: Vec<f64>,
    hi: Vec<f64>,
}

impl BoundingBox {
    /// Creates a bounding box from its two corners.
    pub fn new(lo: Vec<f64>, hi: Vec<f64>) -> BoundingBox {
        debug_assert_eq!(lo.len(), hi.len());
        BoundingBox { lo, hi }
    }

    /// Creates a degenerate box around a single point (`lo == hi`).
    pub fn point(coords: &[f64]) -> BoundingBox {
        BoundingBox {
            lo: coords.to_vec(),
            hi: coords.to_vec(),
        }
    }

    /// Materializes any [`Spatial`] object into an owned box.
    pub fn of<S: Spatial>(s: &S) -> BoundingBox {
        let mut lo = Vec::with_capacity(s.dims());
        let mut hi = Vec::with_capacity(s.dims());
        for d in 0..s.dims() {
            lo.push(s.lo(d));
            hi.push(s.hi(d));
        }
        BoundingBox { lo, hi }
    }

    /// Componentwise min/max union of two objects.
    pub fn union<A: Spatial, B: Spatial>(a: &A, b: &B) -> BoundingBox {
        debug_assert_eq!(a.dims(), b.dims());
        let mut lo = Vec::with_capacity(a.dims());
        let mut hi = Vec::with_capacity(a.dims());
        for d in 0..a.dims() {
            lo.push(a.lo(d).min(b.lo(d)));
            hi.push(a.hi(d).max(b.hi(d)));
        }
        BoundingBox { lo, hi }
    }

    /// Grows this box in place to cover `other`.
    pub fn expand<S: Spatial>(&mut self, other: &S) {
        debug_assert_eq!(self.lo.len(), other.dims());
        for d in 0..self.lo.len() {
            self.lo[d] = self.lo[d].min(other.lo(d));
            self.hi[d] = self.hi[d].max(other.hi(d));
        }
    }

    /// Intersection of two objects, or `None` if they are disjoint.
    pub fn intersection<A: Spatial, B: Spatial>(a: &A, b: &B) -> Option<BoundingBox> {
        debug_assert_eq!(a.dims(), b.dims());
        let mut lo = Vec::with_capacity(a.dims());
        let mut hi = Vec::with_capacity(a.dims());
        for d in 0..a.dims() {
            let l = a.lo(d).max(b.lo(d));
            let h = a.hi(d).min(b.hi(d));
            if l > h {
                return None;
            }
            lo.push(l);
            hi.push(h);
        }
        Some(BoundingBox { lo, hi })
    }

    pub fn lo_coords(&self) -> &[f64] {
        &self.lo
    }

    pub fn hi_coords(&self) -> &[f64] {
        &self.hi
    }

    /// Checks that `lo <= hi` holds in every dimension and that all
    /// coordinates are finite.
    pub fn is_valid(&self) -> bool {
        self.lo.len() == self.hi.len()
            && self
                .lo
                .iter()
                .zip(&self.hi)
                .all(|(l, h)| l.is_finite() && h.is_finite() && l <= h)
    }

    /// Checks whether this box is a point (`lo == hi` everywhere).
    pub fn is_point(&self) -> bool {
        self.lo == self.hi
    }
}

impl Spatial for BoundingBox {
    fn dims(&self) -> usize {
        self.lo.len()
    }

    fn lo(&self, dim: usize) -> f64 {
        self.lo[dim]
    }

    fn hi(&self, dim: usize) -> f64 {
        self.hi[dim]
    }
}

impl std::fmt::Display for BoundingBox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "BoundingBox({:?}, {:?})", self.lo, self.hi)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bbox2(lo_x: f64, lo_y: f64, hi_x: f64, hi_y: f64) -> BoundingBox {
        BoundingBox::new(vec![lo_x, lo_y], vec![hi_x, hi_y])
    }

    #[test]
    fn test_new_and_accessors() {
        let b = bbox2(1.0, 2.0, 3.0, 4.0);
        assert_eq!(b.dims(), 2);
        assert_eq!(b.lo(0), 1.0);
        assert_eq!(b.lo(1), 2.0);
        assert_eq!(b.hi(0), 3.0);
        assert_eq!(b.hi(1), 4.0);
    }

    #[test]
    fn test_point_box() {
        let p = BoundingBox::point(&[5.0, 6.0]);
        assert!(p.is_point());
        assert_eq!(p.volume().unwrap(), 0.0);
        assert!(p.is_valid());
    }

    #[test]
    fn test_volume() {
        let b = bbox2(0.0, 0.0, 10.0, 5.0);
        assert_eq!(b.volume().unwrap(), 50.0);
    }

    #[test]
    fn test_volume_overflow() {
        let b = BoundingBox::new(vec![f64::MIN; 4], vec![f64::MAX; 4]);
        assert!(matches!(b.volume(), Err(XTreeError::NumericOverflow(_))));
    }

    #[test]
    fn test_perimeter() {
        let b = bbox2(0.0, 0.0, 10.0, 5.0);
        assert_eq!(b.perimeter(), 15.0);
    }

    #[test]
    fn test_center() {
        let b = bbox2(0.0, 0.0, 10.0, 10.0);
        assert_eq!(b.center(0), 5.0);
        assert_eq!(b.center(1), 5.0);
    }

    #[test]
    fn test_contains() {
        let outer = bbox2(0.0, 0.0, 10.0, 10.0);
        let inner = bbox2(2.0, 2.0, 8.0, 8.0);
        let partial = bbox2(5.0, 5.0, 15.0, 15.0);

        assert!(outer.contains(&inner));
        assert!(outer.contains(&outer));
        assert!(!outer.contains(&partial));
        assert!(!inner.contains(&outer));
    }

    #[test]
    fn test_intersects_touching_counts() {
        let a = bbox2(0.0, 0.0, 10.0, 10.0);
        let b = bbox2(10.0, 10.0, 20.0, 20.0);
        let c = bbox2(11.0, 11.0, 20.0, 20.0);

        assert!(a.intersects(&b));
        assert!(!a.intersects(&c));
    }

    #[test]
    fn test_union() {
        let a = bbox2(0.0, 0.0, 5.0, 5.0);
        let b = bbox2(3.0, 3.0, 10.0, 10.0);
        let u = BoundingBox::union(&a, &b);
        assert_eq!(u, bbox2(0.0, 0.0, 10.0, 10.0));
    }

    #[test]
    fn test_expand() {
        let mut a = bbox2(0.0, 0.0, 5.0, 5.0);
        a.expand(&BoundingBox::point(&[-1.0, 7.0]));
        assert_eq!(a, bbox2(-1.0, 0.0, 5.0, 7.0));
    }

    #[test]
    fn test_intersection_volume() {
        let a = bbox2(0.0, 0.0, 10.0, 10.0);
        let b = bbox2(5.0, 5.0, 15.0, 15.0);
        let c = bbox2(20.0, 20.0, 30.0, 30.0);

        assert_eq!(a.intersection_volume(&b).unwrap(), 25.0);
        assert_eq!(a.intersection_volume(&c).unwrap(), 0.0);
        // touching edges have zero intersection volume
        let d = bbox2(10.0, 0.0, 20.0, 10.0);
        assert_eq!(a.intersection_volume(&d).unwrap(), 0.0);
    }

    #[test]
    fn test_intersection_box() {
        let a = bbox2(0.0, 0.0, 10.0, 10.0);
        let b = bbox2(5.0, 5.0, 15.0, 15.0);
        assert_eq!(
            BoundingBox::intersection(&a, &b),
            Some(bbox2(5.0, 5.0, 10.0, 10.0))
        );
        let c = bbox2(20.0, 20.0, 30.0, 30.0);
        assert_eq!(BoundingBox::intersection(&a, &c), None);
    }

    #[test]
    fn test_equals_exact() {
        let a = bbox2(1.0, 2.0, 3.0, 4.0);
        let b = bbox2(1.0, 2.0, 3.0, 4.0);
        let c = bbox2(1.0, 2.0, 3.0, 4.0 + 1e-12);
        assert!(a.equals_exact(&b));
        assert!(!a.equals_exact(&c));
    }

    #[test]
    fn test_center_distance() {
        let a = bbox2(0.0, 0.0, 2.0, 2.0);
        let b = bbox2(3.0, 1.0, 5.0, 1.0);
        // centers (1,1) and (4,1)
        assert_eq!(a.center_distance_sq(&b), 9.0);
    }

    #[test]
    fn test_is_valid() {
        assert!(bbox2(0.0, 0.0, 1.0, 1.0).is_valid());
        assert!(!bbox2(1.0, 0.0, 0.0, 1.0).is_valid());
        assert!(!BoundingBox::new(vec![0.0], vec![f64::INFINITY]).is_valid());
    }

    #[test]
    fn test_serde_round_trip() {
        let b = bbox2(1.5, 2.5, 3.5, 4.5);
        let json = serde_json::to_string(&b).unwrap();
        let back: BoundingBox = serde_json::from_str(&json).unwrap();
        assert_eq!(b, back);
    }
}
