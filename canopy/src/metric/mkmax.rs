//! Reverse k-nearest-neighbor queries on top of an [`MTree`].
//!
//! Every leaf entry carries the distance to its object's `k_max`-th nearest
//! neighbor, every directory entry the maximum over its subtree. An object
//! `p` is a reverse k-nearest neighbor of a query `q` when `q` lies within
//! `p`'s own k-nearest-neighbor distance; `p` counts among its own neighbors.

use log::debug;

use super::tree::ball_lower_bound;
use super::{MTree, MetricEntry};
use crate::distance::Distance;
use crate::errors::{IndexError, IndexResult};
use crate::search::Neighbor;
use crate::storage::{ObjectId, PageId};

/// An M-tree maintaining kNN distances for reverse kNN queries with
/// `k <= k_max`.
pub struct MkMaxTree<O, D> {
    tree: MTree<O, D>,
    k_max: usize,
}

impl<O, D: Distance<O>> MkMaxTree<O, D> {
    /// Wrap `tree`, computing the kNN distance of every object it holds.
    pub fn new(tree: MTree<O, D>, k_max: usize) -> IndexResult<Self> {
        if k_max == 0 {
            return Err(IndexError::InvalidArgument(
                "k_max must be at least 1".into(),
            ));
        }
        let mut index = Self { tree, k_max };
        index.refresh_all()?;
        Ok(index)
    }

    pub fn k_max(&self) -> usize {
        self.k_max
    }

    pub fn tree(&self) -> &MTree<O, D> {
        &self.tree
    }

    pub fn into_inner(self) -> MTree<O, D> {
        self.tree
    }

    /// Insert every object, then recompute all kNN distances once.
    pub fn initialize(&mut self, objects: Vec<O>) -> IndexResult<Vec<ObjectId>> {
        let ids = self.tree.initialize(objects)?;
        self.refresh_all()?;
        Ok(ids)
    }

    /// Add an object. Objects that gain it as a closer neighbor get their kNN
    /// distance recomputed.
    pub fn insert(&mut self, object: O) -> IndexResult<ObjectId> {
        let id = self.tree.insert(object)?;
        let affected = {
            let object = self.tree.object(id)?;
            self.candidates(object)?
        };
        self.refresh(id)?;
        for (other, _) in affected {
            if other != id {
                self.refresh(other)?;
            }
        }
        Ok(id)
    }

    /// Remove an object. Objects that had it among their neighbors get their
    /// kNN distance recomputed.
    pub fn delete(&mut self, id: ObjectId) -> IndexResult<bool> {
        let affected = match self.tree.get(id) {
            Some(object) => self.candidates(object)?,
            None => return Ok(false),
        };
        if !self.tree.delete(id)? {
            return Ok(false);
        }
        for (other, _) in affected {
            if other != id {
                self.refresh(other)?;
            }
        }
        Ok(true)
    }

    /// Stored `k_max`-nearest-neighbor distance of `id`. Infinite while the
    /// tree holds fewer than `k_max` objects.
    pub fn knn_distance(&self, id: ObjectId) -> IndexResult<Option<f64>> {
        self.tree.knn_distance_of(id)
    }

    /// Objects having `query` among their `k` nearest neighbors, closest
    /// first.
    pub fn reverse_knn(&self, query: &O, k: usize) -> IndexResult<Vec<Neighbor>> {
        self.tree.tree_file.check_open()?;
        if k > self.k_max {
            return Err(IndexError::InvalidArgument(format!(
                "reverse {k}-NN query exceeds k_max {}",
                self.k_max
            )));
        }
        if k == 0 {
            return Ok(Vec::new());
        }
        self.tree.stats.count_rknn_query();

        let mut candidates = self.candidates(query)?;
        if k < self.k_max {
            let found = candidates.len();
            let mut refined = Vec::with_capacity(found);
            for (id, distance) in candidates {
                if distance <= self.kth_distance(id, k)? {
                    refined.push((id, distance));
                }
            }
            debug!(
                "Reverse {}-NN refinement kept {} of {} candidates",
                k,
                refined.len(),
                found
            );
            candidates = refined;
        }

        candidates.sort_by(|a, b| a.1.total_cmp(&b.1).then(a.0.cmp(&b.0)));
        Ok(candidates
            .into_iter()
            .map(|(id, distance)| Neighbor { id, distance })
            .collect())
    }

    /// Objects whose stored kNN distance reaches `query`, with their
    /// distance to it.
    fn candidates(&self, query: &O) -> IndexResult<Vec<(ObjectId, f64)>> {
        let mut out = Vec::new();
        let Some(root) = self.tree.root_page() else {
            return Ok(out);
        };
        let mut stack: Vec<(PageId, Option<f64>)> = vec![(root, None)];
        while let Some((page, routing_distance)) = stack.pop() {
            let node = self.tree.pages().read_node(page)?;
            for entry in &node.entries {
                if let Some(to_routing) = routing_distance {
                    let gap = (to_routing - entry.parent_distance()).abs();
                    if ball_lower_bound(gap, entry.covering_radius()) > entry.knn_distance() {
                        continue;
                    }
                }
                let distance = self
                    .tree
                    .dist(query, self.tree.object(entry.object_id())?);
                match entry {
                    MetricEntry::Leaf {
                        object_id,
                        knn_distance,
                        ..
                    } => {
                        if distance <= *knn_distance {
                            out.push((*object_id, distance));
                        }
                    }
                    MetricEntry::Directory {
                        covering_radius,
                        child_page,
                        knn_distance,
                        ..
                    } => {
                        if ball_lower_bound(distance, *covering_radius) <= *knn_distance {
                            stack.push((*child_page, Some(distance)));
                        }
                    }
                }
            }
        }
        Ok(out)
    }

    /// Distance from `id` to its `k`-th nearest neighbor, itself included.
    fn kth_distance(&self, id: ObjectId, k: usize) -> IndexResult<f64> {
        let object = self.tree.object(id)?;
        let neighbors = self.tree.knn(object, k)?;
        Ok(if neighbors.len() < k {
            f64::INFINITY
        } else {
            neighbors[k - 1].distance
        })
    }

    fn refresh(&mut self, id: ObjectId) -> IndexResult<()> {
        let distance = self.kth_distance(id, self.k_max)?;
        self.tree.set_knn_distance(id, distance)?;
        Ok(())
    }

    fn refresh_all(&mut self) -> IndexResult<()> {
        let ids: Vec<ObjectId> = self.tree.iter().map(|(id, _)| id).collect();
        for id in &ids {
            self.refresh(*id)?;
        }
        if !ids.is_empty() {
            debug!("Computed {}-NN distances of {} objects", self.k_max, ids.len());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::distance::EuclideanDistance;
    use crate::metric::MTreeSettings;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn init_logger() {
        let _ = env_logger::builder().is_test(true).try_init();
    }

    fn settings() -> MTreeSettings {
        MTreeSettings::builder()
            .leaf_capacity(6)
            .dir_capacity(6)
            .integrity_checks(true)
            .build()
            .unwrap()
    }

    fn random_points(n: usize, seed: u64) -> Vec<Vec<f64>> {
        let mut rng = StdRng::seed_from_u64(seed);
        (0..n).map(|_| vec![rng.gen::<f64>(), rng.gen::<f64>()]).collect()
    }

    fn euclidean(a: &[f64], b: &[f64]) -> f64 {
        EuclideanDistance.distance(a, b)
    }

    /// Reverse kNN by definition, over every live object.
    fn brute_force(objects: &[(ObjectId, Vec<f64>)], query: &[f64], k: usize) -> Vec<ObjectId> {
        let mut out: Vec<ObjectId> = objects
            .iter()
            .filter(|(_, p)| {
                let mut distances: Vec<f64> = objects.iter().map(|(_, o)| euclidean(p, o)).collect();
                distances.sort_by(f64::total_cmp);
                let kth = distances.get(k - 1).copied().unwrap_or(f64::INFINITY);
                euclidean(p, query) <= kth
            })
            .map(|(id, _)| *id)
            .collect();
        out.sort_unstable();
        out
    }

    fn live(index: &MkMaxTree<Vec<f64>, EuclideanDistance>) -> Vec<(ObjectId, Vec<f64>)> {
        index.tree().iter().map(|(id, p)| (id, p.clone())).collect()
    }

    fn reverse_ids(index: &MkMaxTree<Vec<f64>, EuclideanDistance>, query: &[f64], k: usize) -> Vec<ObjectId> {
        let mut ids: Vec<ObjectId> = index
            .reverse_knn(&query.to_vec(), k)
            .unwrap()
            .into_iter()
            .map(|n| n.id)
            .collect();
        ids.sort_unstable();
        ids
    }

    fn build(points: Vec<Vec<f64>>, k_max: usize) -> MkMaxTree<Vec<f64>, EuclideanDistance> {
        let tree = MTree::in_memory(EuclideanDistance, settings()).unwrap();
        let mut index = MkMaxTree::new(tree, k_max).unwrap();
        index.initialize(points).unwrap();
        index
    }

    #[test]
    fn test_knn_distances_after_initialize() {
        let points = vec![vec![0.0, 0.0], vec![1.0, 0.0], vec![3.0, 0.0], vec![7.0, 0.0]];
        let index = build(points, 2);
        // the nearest neighbor of each object is itself, the second one decides
        assert_eq!(index.knn_distance(0).unwrap(), Some(1.0));
        assert_eq!(index.knn_distance(1).unwrap(), Some(1.0));
        assert_eq!(index.knn_distance(2).unwrap(), Some(2.0));
        assert_eq!(index.knn_distance(3).unwrap(), Some(4.0));
        assert_eq!(index.knn_distance(9).unwrap(), None);
    }

    #[test]
    fn test_reverse_knn_matches_definition() {
        init_logger();
        let index = build(random_points(120, 1), 4);
        let objects = live(&index);
        let mut rng = StdRng::seed_from_u64(2);
        for _ in 0..15 {
            let query = vec![rng.gen::<f64>(), rng.gen::<f64>()];
            for k in 1..=4 {
                assert_eq!(
                    reverse_ids(&index, &query, k),
                    brute_force(&objects, &query, k),
                    "k = {}",
                    k
                );
            }
        }
        assert!(index.tree().stats().counters.rknn_queries >= 60);
    }

    #[test]
    fn test_results_sorted_by_distance() {
        let index = build(random_points(60, 3), 3);
        let hits = index.reverse_knn(&vec![0.5, 0.5], 3).unwrap();
        assert!(hits.windows(2).all(|w| w[0].distance <= w[1].distance));
    }

    #[test]
    fn test_maintenance_on_insert_and_delete() {
        init_logger();
        let points = random_points(80, 4);
        let tree = MTree::in_memory(EuclideanDistance, settings()).unwrap();
        let mut index = MkMaxTree::new(tree, 3).unwrap();
        for point in points {
            index.insert(point).unwrap();
        }
        for id in (0..80).step_by(3) {
            assert!(index.delete(id).unwrap());
        }
        assert!(!index.delete(0).unwrap());

        let objects = live(&index);
        for (id, point) in &objects {
            let mut distances: Vec<f64> = objects.iter().map(|(_, o)| euclidean(point, o)).collect();
            distances.sort_by(f64::total_cmp);
            assert_eq!(index.knn_distance(*id).unwrap(), Some(distances[2]), "object {}", id);
        }
        let query = vec![0.25, 0.75];
        for k in 1..=3 {
            assert_eq!(reverse_ids(&index, &query, k), brute_force(&objects, &query, k));
        }
    }

    #[test]
    fn test_small_tree_has_infinite_distances() {
        let index = build(vec![vec![0.0, 0.0], vec![1.0, 1.0]], 5);
        assert_eq!(index.knn_distance(0).unwrap(), Some(f64::INFINITY));
        // every object reaches any query while it has fewer than k neighbors
        assert_eq!(reverse_ids(&index, &[50.0, 50.0], 5), vec![0, 1]);
    }

    #[test]
    fn test_arguments() {
        let tree = MTree::<Vec<f64>, _>::in_memory(EuclideanDistance, settings()).unwrap();
        assert!(matches!(
            MkMaxTree::new(tree, 0),
            Err(IndexError::InvalidArgument(_))
        ));
        let index = build(random_points(10, 5), 2);
        assert!(matches!(
            index.reverse_knn(&vec![0.0, 0.0], 3),
            Err(IndexError::InvalidArgument(_))
        ));
        assert!(index.reverse_knn(&vec![0.0, 0.0], 0).unwrap().is_empty());
    }

    #[test]
    fn test_wraps_existing_tree() {
        let mut tree = MTree::in_memory(EuclideanDistance, settings()).unwrap();
        tree.initialize(random_points(40, 6)).unwrap();
        let index = MkMaxTree::new(tree, 2).unwrap();
        let objects = live(&index);
        let query = vec![0.4, 0.4];
        assert_eq!(reverse_ids(&index, &query, 2), brute_force(&objects, &query, 2));
        assert_eq!(index.into_inner().len(), 40);
    }
}
