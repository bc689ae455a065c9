//! Distance contract consumed by the index engines.
//!
//! The engines never compute distances on their own beyond bound arithmetic;
//! every object-to-object distance goes through [`Distance`], and every
//! point-to-rectangle bound through [`SpatialDistance::min_dist`]. Metric
//! pruning is only exact when the function is symmetric and satisfies the
//! triangle inequality.

use crate::spatial::Mbr;

/// A distance function over objects of type `O`.
pub trait Distance<O: ?Sized>: Send + Sync {
    fn distance(&self, a: &O, b: &O) -> f64;
}

/// A distance over coordinate vectors that can also bound the distance from
/// a point to anything inside a rectangle.
pub trait SpatialDistance: Distance<[f64]> {
    /// Smallest possible distance between `point` and any point of `mbr`.
    fn min_dist(&self, mbr: &Mbr, point: &[f64]) -> f64;
}

/// Classic L2 distance.
#[derive(Debug, Clone, Copy, Default)]
pub struct EuclideanDistance;

/// L1 (city block) distance.
#[derive(Debug, Clone, Copy, Default)]
pub struct ManhattanDistance;

/// L-infinity (Chebyshev) distance.
#[derive(Debug, Clone, Copy, Default)]
pub struct MaximumDistance;

/// Edit distance between strings, counted in unicode scalar values.
#[derive(Debug, Clone, Copy, Default)]
pub struct LevenshteinDistance;

#[inline]
fn axis_gap(mbr: &Mbr, point: &[f64], d: usize) -> f64 {
    let v = point[d];
    if v < mbr.min(d) {
        mbr.min(d) - v
    } else if v > mbr.max(d) {
        v - mbr.max(d)
    } else {
        0.0
    }
}

impl Distance<[f64]> for EuclideanDistance {
    fn distance(&self, a: &[f64], b: &[f64]) -> f64 {
        a.iter()
            .zip(b)
            .map(|(x, y)| (x - y) * (x - y))
            .sum::<f64>()
            .sqrt()
    }
}

impl SpatialDistance for EuclideanDistance {
    fn min_dist(&self, mbr: &Mbr, point: &[f64]) -> f64 {
        (0..point.len())
            .map(|d| {
                let gap = axis_gap(mbr, point, d);
                gap * gap
            })
            .sum::<f64>()
            .sqrt()
    }
}

impl Distance<[f64]> for ManhattanDistance {
    fn distance(&self, a: &[f64], b: &[f64]) -> f64 {
        a.iter().zip(b).map(|(x, y)| (x - y).abs()).sum()
    }
}

impl SpatialDistance for ManhattanDistance {
    fn min_dist(&self, mbr: &Mbr, point: &[f64]) -> f64 {
        (0..point.len()).map(|d| axis_gap(mbr, point, d)).sum()
    }
}

impl Distance<[f64]> for MaximumDistance {
    fn distance(&self, a: &[f64], b: &[f64]) -> f64 {
        a.iter()
            .zip(b)
            .map(|(x, y)| (x - y).abs())
            .fold(0.0, f64::max)
    }
}

impl SpatialDistance for MaximumDistance {
    fn min_dist(&self, mbr: &Mbr, point: &[f64]) -> f64 {
        (0..point.len())
            .map(|d| axis_gap(mbr, point, d))
            .fold(0.0, f64::max)
    }
}

// Owned vectors, so metric trees can index `Vec<f64>` relations directly.
macro_rules! vector_distance {
    ($($ty:ty),*) => {
        $(
            impl Distance<Vec<f64>> for $ty {
                #[inline]
                fn distance(&self, a: &Vec<f64>, b: &Vec<f64>) -> f64 {
                    <Self as Distance<[f64]>>::distance(self, a.as_slice(), b.as_slice())
                }
            }
        )*
    };
}

vector_distance!(EuclideanDistance, ManhattanDistance, MaximumDistance);

impl Distance<str> for LevenshteinDistance {
    fn distance(&self, a: &str, b: &str) -> f64 {
        let a: Vec<char> = a.chars().collect();
        let b: Vec<char> = b.chars().collect();
        if a.is_empty() || b.is_empty() {
            return a.len().max(b.len()) as f64;
        }

        let mut prev: Vec<usize> = (0..=b.len()).collect();
        let mut curr = vec![0usize; b.len() + 1];
        for (i, ca) in a.iter().enumerate() {
            curr[0] = i + 1;
            for (j, cb) in b.iter().enumerate() {
                let substitution = prev[j] + usize::from(ca != cb);
                curr[j + 1] = substitution.min(prev[j + 1] + 1).min(curr[j] + 1);
            }
            std::mem::swap(&mut prev, &mut curr);
        }
        prev[b.len()] as f64
    }
}

impl Distance<String> for LevenshteinDistance {
    #[inline]
    fn distance(&self, a: &String, b: &String) -> f64 {
        <Self as Distance<str>>::distance(self, a.as_str(), b.as_str())
    }
}
