//! Nearest neighbor, range and incremental queries on an [`RStarTree`].

use super::tree::check_finite;
use super::{RStarTree, SpatialEntry};
use crate::distance::SpatialDistance;
use crate::errors::{IndexError, IndexResult};
use crate::search::{self, Frontier, Neighbor, PrioritySearch, SearchSpace};
use crate::storage::{PageId, NO_PAGE};

impl<D: SpatialDistance> RStarTree<D> {
    fn check_query(&self, query: &[f64]) -> IndexResult<()> {
        self.tree_file.check_open()?;
        let dim = self.tree_file.header.dim as usize;
        if dim != 0 && query.len() != dim {
            return Err(IndexError::DimensionMismatch {
                expected: dim,
                actual: query.len(),
            });
        }
        check_finite(query)
    }

    /// The `k` points closest to `query`, closest first. Equal distances keep
    /// traversal order.
    pub fn knn(&self, query: &[f64], k: usize) -> IndexResult<Vec<Neighbor>> {
        self.check_query(query)?;
        self.stats.count_knn_query();
        search::knn(self, query, k)
    }

    /// Every point within `radius` of `query`, closest first.
    pub fn range(&self, query: &[f64], radius: f64) -> IndexResult<Vec<Neighbor>> {
        self.check_query(query)?;
        if radius.is_nan() || radius < 0.0 {
            return Err(IndexError::InvalidArgument(format!(
                "radius must be non-negative, got {radius}"
            )));
        }
        self.stats.count_range_query();
        search::range(self, query, radius)
    }

    /// Points in non-decreasing distance order, produced on demand.
    pub fn priority_search<'a>(&'a self, query: &'a [f64]) -> IndexResult<PrioritySearch<'a, Self>> {
        self.check_query(query)?;
        Ok(PrioritySearch::new(self, query))
    }
}

impl<D: SpatialDistance> SearchSpace for RStarTree<D> {
    type Query = [f64];

    fn search_root(&self) -> IndexResult<Option<PageId>> {
        self.tree_file.check_open()?;
        let root = self.tree_file.header.root;
        Ok((root != NO_PAGE).then_some(root))
    }

    fn expand(
        &self,
        query: &[f64],
        page: PageId,
        _routing_distance: Option<f64>,
        frontier: &mut Frontier,
    ) -> IndexResult<()> {
        let node = self.pages().read_node(page)?;
        for entry in &node.entries {
            match entry {
                SpatialEntry::Leaf {
                    object_id,
                    coordinates,
                } => {
                    self.stats.count_distance_calc();
                    let distance = self.distance.distance(query, coordinates.as_slice());
                    frontier.push_object(distance, *object_id);
                }
                SpatialEntry::Directory { child_page, mbr } => {
                    frontier.push_page(self.distance.min_dist(mbr, query), *child_page, None);
                }
            }
        }
        Ok(())
    }
}
