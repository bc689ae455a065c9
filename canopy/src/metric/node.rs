use serde::{Deserialize, Serialize};

use crate::storage::{ObjectId, PageId};

/// An entry of a metric node.
///
/// Objects live in the tree's relation; entries refer to them by id.
/// `parent_distance` is the distance to the routing object of the node's own
/// entry in its parent (0 in the root). `knn_distance` is the reverse-kNN
/// aggregate: an object's own k-nearest-neighbor distance in a leaf, the
/// maximum over the subtree in a directory. Plain M-trees leave it at 0.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum MetricEntry {
    Leaf {
        object_id: ObjectId,
        parent_distance: f64,
        knn_distance: f64,
    },
    Directory {
        routing_id: ObjectId,
        covering_radius: f64,
        parent_distance: f64,
        child_page: PageId,
        knn_distance: f64,
    },
}

impl MetricEntry {
    pub fn leaf(object_id: ObjectId, parent_distance: f64) -> Self {
        MetricEntry::Leaf {
            object_id,
            parent_distance,
            knn_distance: 0.0,
        }
    }

    pub fn directory(
        routing_id: ObjectId,
        covering_radius: f64,
        parent_distance: f64,
        child_page: PageId,
    ) -> Self {
        MetricEntry::Directory {
            routing_id,
            covering_radius,
            parent_distance,
            child_page,
            knn_distance: 0.0,
        }
    }

    /// The object of a leaf entry, the routing object of a directory entry.
    #[inline]
    pub fn object_id(&self) -> ObjectId {
        match self {
            MetricEntry::Leaf { object_id, .. } => *object_id,
            MetricEntry::Directory { routing_id, .. } => *routing_id,
        }
    }

    #[inline]
    pub fn parent_distance(&self) -> f64 {
        match self {
            MetricEntry::Leaf {
                parent_distance, ..
            }
            | MetricEntry::Directory {
                parent_distance, ..
            } => *parent_distance,
        }
    }

    pub fn set_parent_distance(&mut self, distance: f64) {
        match self {
            MetricEntry::Leaf {
                parent_distance, ..
            }
            | MetricEntry::Directory {
                parent_distance, ..
            } => *parent_distance = distance,
        }
    }

    /// 0 for leaf entries.
    #[inline]
    pub fn covering_radius(&self) -> f64 {
        match self {
            MetricEntry::Leaf { .. } => 0.0,
            MetricEntry::Directory {
                covering_radius, ..
            } => *covering_radius,
        }
    }

    #[inline]
    pub fn knn_distance(&self) -> f64 {
        match self {
            MetricEntry::Leaf { knn_distance, .. } | MetricEntry::Directory { knn_distance, .. } => {
                *knn_distance
            }
        }
    }

    pub fn set_knn_distance(&mut self, distance: f64) {
        match self {
            MetricEntry::Leaf { knn_distance, .. } | MetricEntry::Directory { knn_distance, .. } => {
                *knn_distance = distance
            }
        }
    }

    pub fn child_page(&self) -> Option<PageId> {
        match self {
            MetricEntry::Directory { child_page, .. } => Some(*child_page),
            MetricEntry::Leaf { .. } => None,
        }
    }

    pub fn is_leaf_entry(&self) -> bool {
        matches!(self, MetricEntry::Leaf { .. })
    }
}

/// One page of a metric tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricNode {
    pub page_id: PageId,
    pub leaf: bool,
    pub entries: Vec<MetricEntry>,
}

impl MetricNode {
    pub fn with_entries(page_id: PageId, leaf: bool, entries: Vec<MetricEntry>) -> Self {
        Self {
            page_id,
            leaf,
            entries,
        }
    }

    pub fn add_entry(&mut self, entry: MetricEntry) {
        debug_assert_eq!(entry.is_leaf_entry(), self.leaf, "entry kind does not match node");
        self.entries.push(entry);
    }

    pub fn entries(&self) -> &[MetricEntry] {
        &self.entries
    }

    pub fn is_leaf(&self) -> bool {
        self.leaf
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Covering radius around this node's routing object, from the entries'
    /// parent distances: `max(parent_distance + covering_radius)`.
    pub fn covering_radius(&self) -> f64 {
        self.entries
            .iter()
            .map(|e| e.parent_distance() + e.covering_radius())
            .fold(0.0, f64::max)
    }

    /// Largest kNN distance found among the entries.
    pub fn max_knn_distance(&self) -> f64 {
        self.entries
            .iter()
            .map(MetricEntry::knn_distance)
            .fold(0.0, f64::max)
    }

    pub fn position_of_child(&self, child: PageId) -> Option<usize> {
        self.entries
            .iter()
            .position(|e| e.child_page() == Some(child))
    }

    pub fn position_of_object(&self, id: ObjectId) -> Option<usize> {
        self.entries
            .iter()
            .position(|e| matches!(e, MetricEntry::Leaf { object_id, .. } if *object_id == id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_covering_radius_from_entries() {
        let node = MetricNode::with_entries(
            4,
            false,
            vec![
                MetricEntry::directory(1, 2.0, 3.0, 10),
                MetricEntry::directory(2, 0.5, 4.0, 11),
            ],
        );
        assert_eq!(node.covering_radius(), 5.0);
        assert_eq!(node.position_of_child(11), Some(1));
        assert_eq!(node.position_of_child(12), None);
    }

    #[test]
    fn test_leaf_accessors() {
        let mut entry = MetricEntry::leaf(7, 1.5);
        assert_eq!(entry.object_id(), 7);
        assert_eq!(entry.covering_radius(), 0.0);
        assert_eq!(entry.child_page(), None);
        entry.set_knn_distance(0.25);
        entry.set_parent_distance(2.0);
        assert_eq!(entry.knn_distance(), 0.25);
        assert_eq!(entry.parent_distance(), 2.0);

        let mut node = MetricNode::with_entries(1, true, Vec::new());
        assert_eq!(node.covering_radius(), 0.0);
        node.add_entry(entry);
        node.add_entry(MetricEntry::leaf(9, 0.5));
        assert_eq!(node.covering_radius(), 2.0);
        assert_eq!(node.max_knn_distance(), 0.25);
        assert_eq!(node.position_of_object(9), Some(1));
    }
}
