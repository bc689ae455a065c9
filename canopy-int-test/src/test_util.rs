//! Shared fixtures: seeded random data and linear-scan references.

use canopy::{Distance, EuclideanDistance, Neighbor, ObjectId, RTreeSettings};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Uniform points in the unit cube, with ids `0..n`.
pub fn random_points(n: usize, dims: usize, seed: u64) -> Vec<(ObjectId, Vec<f64>)> {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..n)
        .map(|i| (i as ObjectId, (0..dims).map(|_| rng.gen::<f64>()).collect()))
        .collect()
}

/// Uniform query points, independent of any data set.
pub fn random_queries(n: usize, dims: usize, seed: u64) -> Vec<Vec<f64>> {
    random_points(n, dims, seed)
        .into_iter()
        .map(|(_, p)| p)
        .collect()
}

pub fn euclidean(a: &[f64], b: &[f64]) -> f64 {
    EuclideanDistance.distance(a, b)
}

/// The `k` smallest distances from `query`, by linear scan.
pub fn linear_knn(points: &[(ObjectId, Vec<f64>)], query: &[f64], k: usize) -> Vec<f64> {
    let mut distances: Vec<f64> = points.iter().map(|(_, p)| euclidean(p, query)).collect();
    distances.sort_by(f64::total_cmp);
    distances.truncate(k);
    distances
}

/// Ids within `radius` of `query`, by linear scan, sorted.
pub fn linear_range(points: &[(ObjectId, Vec<f64>)], query: &[f64], radius: f64) -> Vec<ObjectId> {
    let mut ids: Vec<ObjectId> = points
        .iter()
        .filter(|(_, p)| euclidean(p, query) <= radius)
        .map(|(id, _)| *id)
        .collect();
    ids.sort_unstable();
    ids
}

pub fn distances(neighbors: &[Neighbor]) -> Vec<f64> {
    neighbors.iter().map(|n| n.distance).collect()
}

pub fn sorted_ids(neighbors: &[Neighbor]) -> Vec<ObjectId> {
    let mut ids: Vec<ObjectId> = neighbors.iter().map(|n| n.id).collect();
    ids.sort_unstable();
    ids
}

/// R*-tree settings with both capacities fixed and integrity checks on.
pub fn rtree_settings(capacity: usize) -> RTreeSettings {
    RTreeSettings::builder()
        .leaf_capacity(capacity)
        .dir_capacity(capacity)
        .integrity_checks(true)
        .build()
        .expect("valid settings")
}
