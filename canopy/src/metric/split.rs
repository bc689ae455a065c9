//! Metric node splits.
//!
//! A split first promotes two entries whose objects become the routing
//! objects of the two halves, then distributes every entry between them. All
//! distances between the entries are computed once into a [`DistanceMatrix`].

use std::fmt::Debug;

use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Symmetric matrix of pairwise distances between the entries of a node.
#[derive(Debug, Clone)]
pub struct DistanceMatrix {
    n: usize,
    values: Vec<f64>,
}

impl DistanceMatrix {
    /// Fill the matrix, calling `distance` once per unordered pair.
    pub fn new(n: usize, mut distance: impl FnMut(usize, usize) -> f64) -> Self {
        let mut values = vec![0.0; n * n];
        for i in 0..n {
            for j in (i + 1)..n {
                let d = distance(i, j);
                values[i * n + j] = d;
                values[j * n + i] = d;
            }
        }
        Self { n, values }
    }

    pub fn len(&self) -> usize {
        self.n
    }

    pub fn is_empty(&self) -> bool {
        self.n == 0
    }

    #[inline]
    pub fn get(&self, i: usize, j: usize) -> f64 {
        self.values[i * self.n + j]
    }
}

/// Entry indexes of both halves together with their covering radii. The
/// promoted entries come first in their groups.
#[derive(Debug, Clone, PartialEq)]
pub struct Assignment {
    pub first: Vec<usize>,
    pub second: Vec<usize>,
    pub first_radius: f64,
    pub second_radius: f64,
}

impl Assignment {
    fn new(first: Vec<usize>, second: Vec<usize>, matrix: &DistanceMatrix, radii: &[f64]) -> Self {
        let first_radius = group_radius(&first, matrix, radii);
        let second_radius = group_radius(&second, matrix, radii);
        Self {
            first,
            second,
            first_radius,
            second_radius,
        }
    }

    pub fn max_radius(&self) -> f64 {
        self.first_radius.max(self.second_radius)
    }
}

/// Radius around `group[0]` covering every entry of the group, counting the
/// entries' own covering radii.
fn group_radius(group: &[usize], matrix: &DistanceMatrix, radii: &[f64]) -> f64 {
    let Some(&seed) = group.first() else {
        return 0.0;
    };
    group
        .iter()
        .map(|&i| matrix.get(i, seed) + radii[i])
        .fold(0.0, f64::max)
}

/// Splits entries between two promoted routing objects.
pub trait Distribution: Debug + Send + Sync {
    /// `radii[i]` is the covering radius of entry `i`, 0 for objects. Both
    /// groups end up with at least `min_fill` entries when there are enough.
    fn distribute(
        &self,
        matrix: &DistanceMatrix,
        radii: &[f64],
        seeds: (usize, usize),
        min_fill: usize,
    ) -> Assignment;
}

fn sorted_by_distance(matrix: &DistanceMatrix, seed: usize) -> Vec<usize> {
    let mut order: Vec<usize> = (0..matrix.len()).collect();
    order.sort_by(|&a, &b| matrix.get(a, seed).total_cmp(&matrix.get(b, seed)));
    order
}

/// Both routing objects take turns claiming their nearest unassigned entry,
/// so the halves differ in size by at most one.
#[derive(Debug, Clone, Copy, Default)]
pub struct Balanced;

impl Distribution for Balanced {
    fn distribute(
        &self,
        matrix: &DistanceMatrix,
        radii: &[f64],
        seeds: (usize, usize),
        _min_fill: usize,
    ) -> Assignment {
        let n = matrix.len();
        let mut assigned = vec![false; n];
        assigned[seeds.0] = true;
        assigned[seeds.1] = true;
        let mut first = vec![seeds.0];
        let mut second = vec![seeds.1];

        let orders = [sorted_by_distance(matrix, seeds.0), sorted_by_distance(matrix, seeds.1)];
        let mut cursors = [0usize, 0usize];
        let mut remaining = n.saturating_sub(2);
        let mut turn = 0;
        while remaining > 0 {
            let order = &orders[turn];
            while assigned[order[cursors[turn]]] {
                cursors[turn] += 1;
            }
            let i = order[cursors[turn]];
            assigned[i] = true;
            if turn == 0 {
                first.push(i);
            } else {
                second.push(i);
            }
            remaining -= 1;
            turn = 1 - turn;
        }
        Assignment::new(first, second, matrix, radii)
    }
}

/// Every entry goes to its nearer routing object; entries closest to the
/// boundary move over when a half would stay underfull.
#[derive(Debug, Clone, Copy, Default)]
pub struct GeneralizedHyperplane;

impl GeneralizedHyperplane {
    /// Move entries from `from` to `to` until `to` holds `min_fill` entries.
    fn refill(
        to: &mut Vec<usize>,
        from: &mut Vec<usize>,
        to_seed: usize,
        from_seed: usize,
        matrix: &DistanceMatrix,
        min_fill: usize,
    ) {
        while to.len() < min_fill && from.len() > min_fill {
            let Some(position) = from
                .iter()
                .enumerate()
                .skip(1)
                .min_by(|a, b| {
                    let pa = matrix.get(*a.1, to_seed) - matrix.get(*a.1, from_seed);
                    let pb = matrix.get(*b.1, to_seed) - matrix.get(*b.1, from_seed);
                    pa.total_cmp(&pb)
                })
                .map(|(position, _)| position)
            else {
                break;
            };
            to.push(from.remove(position));
        }
    }
}

impl Distribution for GeneralizedHyperplane {
    fn distribute(
        &self,
        matrix: &DistanceMatrix,
        radii: &[f64],
        seeds: (usize, usize),
        min_fill: usize,
    ) -> Assignment {
        let mut first = vec![seeds.0];
        let mut second = vec![seeds.1];
        for i in 0..matrix.len() {
            if i == seeds.0 || i == seeds.1 {
                continue;
            }
            let d0 = matrix.get(i, seeds.0);
            let d1 = matrix.get(i, seeds.1);
            if d0 < d1 || (d0 == d1 && first.len() <= second.len()) {
                first.push(i);
            } else {
                second.push(i);
            }
        }
        Self::refill(&mut first, &mut second, seeds.0, seeds.1, matrix, min_fill);
        Self::refill(&mut second, &mut first, seeds.1, seeds.0, matrix, min_fill);
        Assignment::new(first, second, matrix, radii)
    }
}

/// Picks the two entries whose objects route the halves of a split.
pub trait Promotion: Debug + Send + Sync {
    /// `parent_distances` are the entries' distances to the routing object of
    /// the overflowing node, `None` when the root splits.
    fn promote(
        &self,
        matrix: &DistanceMatrix,
        radii: &[f64],
        parent_distances: Option<&[f64]>,
        distribution: &dyn Distribution,
        min_fill: usize,
    ) -> (usize, usize);
}

fn farthest_pair(matrix: &DistanceMatrix) -> (usize, usize) {
    let mut best = (0, 1);
    let mut best_distance = f64::NEG_INFINITY;
    for i in 0..matrix.len() {
        for j in (i + 1)..matrix.len() {
            if matrix.get(i, j) > best_distance {
                best_distance = matrix.get(i, j);
                best = (i, j);
            }
        }
    }
    best
}

/// Try every pair and keep the one whose larger covering radius is smallest.
#[derive(Debug, Clone, Copy, Default)]
pub struct MmRad;

impl Promotion for MmRad {
    fn promote(
        &self,
        matrix: &DistanceMatrix,
        radii: &[f64],
        _parent_distances: Option<&[f64]>,
        distribution: &dyn Distribution,
        min_fill: usize,
    ) -> (usize, usize) {
        let mut best = (0, 1);
        let mut best_radius = f64::INFINITY;
        for i in 0..matrix.len() {
            for j in (i + 1)..matrix.len() {
                let radius = distribution
                    .distribute(matrix, radii, (i, j), min_fill)
                    .max_radius();
                if radius < best_radius {
                    best_radius = radius;
                    best = (i, j);
                }
            }
        }
        best
    }
}

/// Keep the old routing object and promote the entry farthest from it.
#[derive(Debug, Clone, Copy, Default)]
pub struct MlbDist;

impl Promotion for MlbDist {
    fn promote(
        &self,
        matrix: &DistanceMatrix,
        _radii: &[f64],
        parent_distances: Option<&[f64]>,
        _distribution: &dyn Distribution,
        _min_fill: usize,
    ) -> (usize, usize) {
        let Some(distances) = parent_distances else {
            return farthest_pair(matrix);
        };
        let by_distance = |a: &(usize, &f64), b: &(usize, &f64)| a.1.total_cmp(b.1);
        let nearest = distances.iter().enumerate().min_by(by_distance);
        let farthest = distances.iter().enumerate().max_by(by_distance);
        match (nearest, farthest) {
            (Some((a, _)), Some((b, _))) if a != b => (a, b),
            _ => farthest_pair(matrix),
        }
    }
}

/// Promote the two entries farthest from each other.
#[derive(Debug, Clone, Copy, Default)]
pub struct FarthestPoints;

impl Promotion for FarthestPoints {
    fn promote(
        &self,
        matrix: &DistanceMatrix,
        _radii: &[f64],
        _parent_distances: Option<&[f64]>,
        _distribution: &dyn Distribution,
        _min_fill: usize,
    ) -> (usize, usize) {
        farthest_pair(matrix)
    }
}

/// Promote two entries drawn from a seeded generator.
#[derive(Debug)]
pub struct RandomPromotion {
    rng: Mutex<StdRng>,
}

impl RandomPromotion {
    pub fn new(seed: u64) -> Self {
        Self {
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }
}

impl Default for RandomPromotion {
    fn default() -> Self {
        Self::new(0)
    }
}

impl Promotion for RandomPromotion {
    fn promote(
        &self,
        matrix: &DistanceMatrix,
        _radii: &[f64],
        _parent_distances: Option<&[f64]>,
        _distribution: &dyn Distribution,
        _min_fill: usize,
    ) -> (usize, usize) {
        let n = matrix.len();
        let mut rng = self.rng.lock();
        let first = rng.gen_range(0..n);
        let mut second = rng.gen_range(0..n - 1);
        if second >= first {
            second += 1;
        }
        (first, second)
    }
}
