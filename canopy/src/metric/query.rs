//! Nearest neighbor, range and incremental queries on an [`MTree`].

use super::tree::ball_lower_bound;
use super::{MTree, MetricEntry};
use crate::distance::Distance;
use crate::errors::{IndexError, IndexResult};
use crate::search::{self, Frontier, Neighbor, PrioritySearch, SearchSpace};
use crate::storage::PageId;

impl<O, D: Distance<O>> MTree<O, D> {
    /// The `k` objects closest to `query`, closest first.
    pub fn knn(&self, query: &O, k: usize) -> IndexResult<Vec<Neighbor>> {
        self.tree_file.check_open()?;
        self.stats.count_knn_query();
        search::knn(self, query, k)
    }

    /// Every object within `radius` of `query`, closest first.
    pub fn range(&self, query: &O, radius: f64) -> IndexResult<Vec<Neighbor>> {
        self.tree_file.check_open()?;
        if radius.is_nan() || radius < 0.0 {
            return Err(IndexError::InvalidArgument(format!(
                "radius must be non-negative, got {radius}"
            )));
        }
        self.stats.count_range_query();
        search::range(self, query, radius)
    }

    /// Objects in non-decreasing distance order, produced on demand.
    pub fn priority_search<'a>(&'a self, query: &'a O) -> IndexResult<PrioritySearch<'a, Self>> {
        self.tree_file.check_open()?;
        Ok(PrioritySearch::new(self, query))
    }
}

impl<O, D: Distance<O>> SearchSpace for MTree<O, D> {
    type Query = O;

    fn search_root(&self) -> IndexResult<Option<PageId>> {
        self.tree_file.check_open()?;
        Ok(self.root_page())
    }

    /// `routing_distance` is the distance from the query to the routing
    /// object of `page`; together with the stored parent distances it rules
    /// out entries without computing their distance.
    fn expand(
        &self,
        query: &O,
        page: PageId,
        routing_distance: Option<f64>,
        frontier: &mut Frontier,
    ) -> IndexResult<()> {
        let node = self.pages().read_node(page)?;
        for entry in &node.entries {
            if let Some(to_routing) = routing_distance {
                let gap = (to_routing - entry.parent_distance()).abs();
                if ball_lower_bound(gap, entry.covering_radius()) > frontier.bound() {
                    continue;
                }
            }

            let distance = self.dist(query, self.object(entry.object_id())?);
            match entry {
                MetricEntry::Leaf { object_id, .. } => {
                    frontier.push_object(distance, *object_id);
                }
                MetricEntry::Directory {
                    covering_radius,
                    child_page,
                    ..
                } => {
                    frontier.push_page(
                        ball_lower_bound(distance, *covering_radius),
                        *child_page,
                        Some(distance),
                    );
                }
            }
        }
        Ok(())
    }
}
