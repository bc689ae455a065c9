use std::borrow::Cow;

use serde::{Deserialize, Serialize};

use super::Mbr;
use crate::storage::{ObjectId, PageId};

/// An entry of a spatial node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SpatialEntry {
    /// An indexed point.
    Leaf {
        object_id: ObjectId,
        coordinates: Vec<f64>,
    },
    /// A child page together with the rectangle bounding its subtree.
    Directory { child_page: PageId, mbr: Mbr },
}

impl SpatialEntry {
    pub fn leaf(object_id: ObjectId, coordinates: Vec<f64>) -> Self {
        SpatialEntry::Leaf {
            object_id,
            coordinates,
        }
    }

    pub fn directory(child_page: PageId, mbr: Mbr) -> Self {
        SpatialEntry::Directory { child_page, mbr }
    }

    /// Bounding rectangle of the entry; borrowed for directory entries.
    pub fn mbr(&self) -> Cow<'_, Mbr> {
        match self {
            SpatialEntry::Leaf { coordinates, .. } => Cow::Owned(Mbr::point(coordinates)),
            SpatialEntry::Directory { mbr, .. } => Cow::Borrowed(mbr),
        }
    }

    #[inline]
    pub fn lo(&self, d: usize) -> f64 {
        match self {
            SpatialEntry::Leaf { coordinates, .. } => coordinates[d],
            SpatialEntry::Directory { mbr, .. } => mbr.min(d),
        }
    }

    #[inline]
    pub fn hi(&self, d: usize) -> f64 {
        match self {
            SpatialEntry::Leaf { coordinates, .. } => coordinates[d],
            SpatialEntry::Directory { mbr, .. } => mbr.max(d),
        }
    }

    #[inline]
    pub fn center_along(&self, d: usize) -> f64 {
        (self.lo(d) + self.hi(d)) / 2.0
    }

    pub fn center(&self) -> Vec<f64> {
        (0..self.dim()).map(|d| self.center_along(d)).collect()
    }

    pub fn dim(&self) -> usize {
        match self {
            SpatialEntry::Leaf { coordinates, .. } => coordinates.len(),
            SpatialEntry::Directory { mbr, .. } => mbr.dim(),
        }
    }

    pub fn child_page(&self) -> Option<PageId> {
        match self {
            SpatialEntry::Directory { child_page, .. } => Some(*child_page),
            SpatialEntry::Leaf { .. } => None,
        }
    }

    pub fn object_id(&self) -> Option<ObjectId> {
        match self {
            SpatialEntry::Leaf { object_id, .. } => Some(*object_id),
            SpatialEntry::Directory { .. } => None,
        }
    }

    pub fn is_leaf_entry(&self) -> bool {
        matches!(self, SpatialEntry::Leaf { .. })
    }
}

/// One page of a spatial tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpatialNode {
    pub page_id: PageId,
    pub leaf: bool,
    pub entries: Vec<SpatialEntry>,
}

impl SpatialNode {
    pub fn new(page_id: PageId, leaf: bool) -> Self {
        Self {
            page_id,
            leaf,
            entries: Vec::new(),
        }
    }

    pub fn with_entries(page_id: PageId, leaf: bool, entries: Vec<SpatialEntry>) -> Self {
        Self {
            page_id,
            leaf,
            entries,
        }
    }

    pub fn add_entry(&mut self, entry: SpatialEntry) {
        debug_assert_eq!(entry.is_leaf_entry(), self.leaf, "entry kind does not match node");
        self.entries.push(entry);
    }

    pub fn entries(&self) -> &[SpatialEntry] {
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

    /// Rectangle enclosing every entry, `None` for an empty node.
    pub fn compute_mbr(&self) -> Option<Mbr> {
        let mut iter = self.entries.iter();
        let mut acc = iter.next()?.mbr().into_owned();
        for entry in iter {
            match entry {
                SpatialEntry::Leaf { coordinates, .. } => acc.extend_point(coordinates),
                SpatialEntry::Directory { mbr, .. } => acc.extend(mbr),
            }
        }
        Some(acc)
    }

    /// Index of the directory entry pointing at `child`.
    pub fn position_of_child(&self, child: PageId) -> Option<usize> {
        self.entries
            .iter()
            .position(|e| e.child_page() == Some(child))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compute_mbr_leaf() {
        let mut node = SpatialNode::new(3, true);
        assert!(node.compute_mbr().is_none());
        node.add_entry(SpatialEntry::leaf(1, vec![1.0, 4.0]));
        node.add_entry(SpatialEntry::leaf(2, vec![3.0, 2.0]));
        let mbr = node.compute_mbr().unwrap();
        assert_eq!(mbr, Mbr::new(vec![1.0, 2.0], vec![3.0, 4.0]));
        assert_eq!(node.len(), 2);
    }

    #[test]
    fn test_compute_mbr_directory() {
        let node = SpatialNode::with_entries(
            1,
            false,
            vec![
                SpatialEntry::directory(5, Mbr::new(vec![0.0, 0.0], vec![1.0, 1.0])),
                SpatialEntry::directory(6, Mbr::new(vec![-1.0, 0.5], vec![0.5, 3.0])),
            ],
        );
        assert_eq!(
            node.compute_mbr().unwrap(),
            Mbr::new(vec![-1.0, 0.0], vec![1.0, 3.0])
        );
        assert_eq!(node.position_of_child(6), Some(1));
        assert_eq!(node.position_of_child(7), None);
    }

    #[test]
    fn test_entry_accessors() {
        let leaf = SpatialEntry::leaf(9, vec![2.0, 3.0]);
        assert_eq!(leaf.object_id(), Some(9));
        assert_eq!(leaf.child_page(), None);
        assert_eq!(leaf.lo(1), 3.0);
        assert_eq!(leaf.hi(1), 3.0);
        assert!(matches!(leaf.mbr(), Cow::Owned(_)));

        let dir = SpatialEntry::directory(4, Mbr::new(vec![0.0], vec![2.0]));
        assert_eq!(dir.center(), vec![1.0]);
        assert!(matches!(dir.mbr(), Cow::Borrowed(_)));
    }

    #[test]
    fn test_node_survives_bincode() {
        let node = SpatialNode::with_entries(2, true, vec![SpatialEntry::leaf(7, vec![0.25, 0.5])]);
        let bytes = bincode::serde::encode_to_vec(&node, bincode::config::legacy()).unwrap();
        let (decoded, _): (SpatialNode, usize) =
            bincode::serde::decode_from_slice(&bytes, bincode::config::legacy()).unwrap();
        assert_eq!(decoded, node);
    }
}
