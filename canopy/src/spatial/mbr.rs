use serde::{Deserialize, Serialize};

/// An n-dimensional minimum bounding rectangle.
///
/// `Mbr` is stored as two coordinate vectors of equal length. A point is an
/// `Mbr` whose min and max coincide; volumes of such degenerate boxes are 0.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Mbr {
    min: Vec<f64>,
    max: Vec<f64>,
}

impl Mbr {
    /// Creates a rectangle from its lower and upper corners.
    ///
    /// Both vectors must have the same length and satisfy `min[d] <= max[d]`.
    pub fn new(min: Vec<f64>, max: Vec<f64>) -> Mbr {
        debug_assert_eq!(min.len(), max.len(), "corner dimensionality differs");
        Mbr { min, max }
    }

    /// The degenerate rectangle of a single point.
    pub fn point(coordinates: &[f64]) -> Mbr {
        Mbr {
            min: coordinates.to_vec(),
            max: coordinates.to_vec(),
        }
    }

    pub fn dim(&self) -> usize {
        self.min.len()
    }

    #[inline]
    pub fn min(&self, d: usize) -> f64 {
        self.min[d]
    }

    #[inline]
    pub fn max(&self, d: usize) -> f64 {
        self.max[d]
    }

    pub fn mins(&self) -> &[f64] {
        &self.min
    }

    pub fn maxs(&self) -> &[f64] {
        &self.max
    }

    /// Product of the side lengths.
    pub fn volume(&self) -> f64 {
        self.min
            .iter()
            .zip(&self.max)
            .map(|(lo, hi)| hi - lo)
            .product()
    }

    /// Sum of the side lengths (the R*-tree "margin").
    pub fn margin(&self) -> f64 {
        self.min.iter().zip(&self.max).map(|(lo, hi)| hi - lo).sum()
    }

    pub fn center(&self) -> Vec<f64> {
        self.min
            .iter()
            .zip(&self.max)
            .map(|(lo, hi)| (lo + hi) / 2.0)
            .collect()
    }

    #[inline]
    pub fn center_along(&self, d: usize) -> f64 {
        (self.min[d] + self.max[d]) / 2.0
    }

    pub fn union(&self, other: &Mbr) -> Mbr {
        let mut merged = self.clone();
        merged.extend(other);
        merged
    }

    /// Grow this rectangle to cover `other`.
    pub fn extend(&mut self, other: &Mbr) {
        for d in 0..self.dim() {
            self.min[d] = self.min[d].min(other.min[d]);
            self.max[d] = self.max[d].max(other.max[d]);
        }
    }

    pub fn extend_point(&mut self, point: &[f64]) {
        for (d, v) in point.iter().enumerate() {
            self.min[d] = self.min[d].min(*v);
            self.max[d] = self.max[d].max(*v);
        }
    }

    /// Volume that would be added by covering `other`.
    pub fn enlargement(&self, other: &Mbr) -> f64 {
        self.union(other).volume() - self.volume()
    }

    pub fn intersects(&self, other: &Mbr) -> bool {
        (0..self.dim()).all(|d| self.min[d] <= other.max[d] && other.min[d] <= self.max[d])
    }

    /// Volume of the intersection, 0 when disjoint.
    pub fn overlap(&self, other: &Mbr) -> f64 {
        let mut volume = 1.0;
        for d in 0..self.dim() {
            let side = self.max[d].min(other.max[d]) - self.min[d].max(other.min[d]);
            if side <= 0.0 {
                return 0.0;
            }
            volume *= side;
        }
        volume
    }

    pub fn contains(&self, other: &Mbr) -> bool {
        (0..self.dim()).all(|d| self.min[d] <= other.min[d] && other.max[d] <= self.max[d])
    }

    pub fn contains_point(&self, point: &[f64]) -> bool {
        point
            .iter()
            .enumerate()
            .all(|(d, v)| self.min[d] <= *v && *v <= self.max[d])
    }

    /// Union of a sequence of rectangles, `None` for an empty sequence.
    pub fn union_all<'a, I>(mbrs: I) -> Option<Mbr>
    where
        I: IntoIterator<Item = &'a Mbr>,
    {
        let mut iter = mbrs.into_iter();
        let mut acc = iter.next()?.clone();
        for mbr in iter {
            acc.extend(mbr);
        }
        Some(acc)
    }
}

impl std::fmt::Display for Mbr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Mbr({:?}, {:?})", self.min, self.max)
    }
}
