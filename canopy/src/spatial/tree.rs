//! The R*-tree engine: insertion with forced reinsertion, splits, bulk
//! loading, deletion with condensation and structural checks.
//!
//! Levels are counted from the leaves: leaf nodes sit on level 0 and the root
//! on level `height - 1`. A node on level `l > 0` holds directory entries
//! whose children sit on level `l - 1`.

use std::sync::Arc;

use log::debug;
use serde::{Deserialize, Serialize};

use super::reinsert::{ReinsertGuard, ReinsertStrategy};
use super::{
    BulkSplit, Mbr, OverflowTreatment, RTreeSettings, SortTileRecursive, SpatialEntry,
    SpatialNode,
};
use crate::distance::{EuclideanDistance, SpatialDistance};
use crate::errors::{IndexError, IndexResult};
use crate::settings::{derive_capacity, min_fill};
use crate::stats::{TreeStatistics, TreeStats};
use crate::storage::{
    MemoryPageStore, ObjectId, PageFile, PageId, PageStore, TreeFile, TreeHeader, NO_PAGE,
};

/// Persistent state of an R*-tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) struct SpatialHeader {
    kind: u32,
    pub(crate) root: PageId,
    /// Number of levels, 0 for an empty tree.
    pub(crate) height: u32,
    pub(crate) size: u64,
    /// 0 until the first point fixes it.
    pub(crate) dim: u32,
    pub(crate) leaf_capacity: u32,
    pub(crate) dir_capacity: u32,
}

impl SpatialHeader {
    fn new() -> Self {
        Self {
            kind: Self::KIND,
            root: NO_PAGE,
            height: 0,
            size: 0,
            dim: 0,
            leaf_capacity: 0,
            dir_capacity: 0,
        }
    }
}

impl TreeHeader for SpatialHeader {
    const KIND: u32 = 0x5253_5452;
    const NAME: &'static str = "an R*-tree";

    fn kind(&self) -> u32 {
        self.kind
    }
}

/// A paged R*-tree over points of a fixed dimensionality.
///
/// Mutations take `&mut self`; queries take `&self` and may run from several
/// threads at once. Node capacities are derived from the page size when the
/// first point fixes the dimensionality, unless the settings give them.
///
/// ## Example
///
/// ```rust,ignore
/// let mut tree = RStarTree::in_memory(RTreeSettings::default())?;
/// tree.insert(1, &[0.5, 0.5])?;
/// tree.insert(2, &[0.1, 0.9])?;
/// let nearest = tree.knn(&[0.4, 0.4], 1)?;
/// assert_eq!(nearest[0].id, 1);
/// ```
pub struct RStarTree<D = EuclideanDistance> {
    pub(super) tree_file: TreeFile<SpatialNode, SpatialHeader>,
    pub(super) settings: RTreeSettings,
    pub(super) distance: D,
    pub(super) stats: Arc<TreeStatistics>,
    leaf_min: usize,
    dir_min: usize,
}

impl RStarTree<EuclideanDistance> {
    /// A tree on a fresh in-memory store of `settings.tree.page_size` bytes per page.
    pub fn in_memory(settings: RTreeSettings) -> IndexResult<Self> {
        let store: Arc<dyn PageStore> = Arc::new(MemoryPageStore::new(settings.tree.page_size));
        Self::create(store, settings)
    }

    /// Start a new tree in an empty store.
    pub fn create(store: Arc<dyn PageStore>, settings: RTreeSettings) -> IndexResult<Self> {
        RStarTree::create_with_distance(store, settings, EuclideanDistance)
    }

    /// Open the tree held by `store`. Capacities come from the stored header.
    pub fn open(store: Arc<dyn PageStore>, settings: RTreeSettings) -> IndexResult<Self> {
        RStarTree::open_with_distance(store, settings, EuclideanDistance)
    }
}

impl<D> RStarTree<D> {
    /// The same tree, queried with another distance.
    ///
    /// The structure only depends on rectangles, so any distance with a
    /// rectangle lower bound can be swapped in.
    pub fn with_distance<D2: SpatialDistance>(self, distance: D2) -> RStarTree<D2> {
        RStarTree {
            tree_file: self.tree_file,
            settings: self.settings,
            distance,
            stats: self.stats,
            leaf_min: self.leaf_min,
            dir_min: self.dir_min,
        }
    }

    pub fn distance(&self) -> &D {
        &self.distance
    }

    pub fn settings(&self) -> &RTreeSettings {
        &self.settings
    }

    pub fn height(&self) -> usize {
        self.tree_file.header.height as usize
    }

    pub fn len(&self) -> usize {
        self.tree_file.header.size as usize
    }

    pub fn is_empty(&self) -> bool {
        self.tree_file.header.size == 0
    }

    /// Dimensionality of the indexed points, `None` before the first insert.
    pub fn dim(&self) -> Option<usize> {
        match self.tree_file.header.dim {
            0 => None,
            dim => Some(dim as usize),
        }
    }

    /// Maximum entries of a leaf, 0 until the dimensionality is known.
    pub fn leaf_capacity(&self) -> usize {
        self.tree_file.header.leaf_capacity as usize
    }

    /// Maximum entries of a directory node, 0 until the dimensionality is known.
    pub fn dir_capacity(&self) -> usize {
        self.tree_file.header.dir_capacity as usize
    }

    pub fn statistics(&self) -> &Arc<TreeStatistics> {
        &self.stats
    }

    pub fn stats(&self) -> TreeStats {
        let header = &self.tree_file.header;
        TreeStats {
            total_entries: header.size,
            tree_height: header.height,
            cached_pages: self.tree_file.pages.cached_pages() as u64,
            leaf_capacity: header.leaf_capacity as usize,
            dir_capacity: header.dir_capacity as usize,
            counters: self.stats.snapshot(),
        }
    }

    /// Write dirty pages and the tree header to the store.
    pub fn flush(&self) -> IndexResult<()> {
        self.tree_file.flush()
    }

    /// Flush and refuse any further operation.
    pub fn close(&mut self) -> IndexResult<()> {
        self.tree_file.close()
    }
}

impl<D: SpatialDistance> RStarTree<D> {
    pub fn create_with_distance(
        store: Arc<dyn PageStore>,
        settings: RTreeSettings,
        distance: D,
    ) -> IndexResult<Self> {
        settings.validate()?;
        let stats = settings.tree.statistics_handle();
        let pages = PageFile::new(store, settings.tree.cache_pages, Arc::clone(&stats))?;
        let tree_file = TreeFile::create(pages, SpatialHeader::new())?;
        debug!(
            "Created R*-tree with page size {}",
            tree_file.pages.page_size()
        );
        Ok(Self {
            tree_file,
            settings,
            distance,
            stats,
            leaf_min: 0,
            dir_min: 0,
        })
    }

    pub fn open_with_distance(
        store: Arc<dyn PageStore>,
        settings: RTreeSettings,
        distance: D,
    ) -> IndexResult<Self> {
        settings.validate()?;
        let stats = settings.tree.statistics_handle();
        let pages = PageFile::new(store, settings.tree.cache_pages, Arc::clone(&stats))?;
        let tree_file: TreeFile<SpatialNode, SpatialHeader> = TreeFile::open(pages)?;
        let mut tree = Self {
            tree_file,
            settings,
            distance,
            stats,
            leaf_min: 0,
            dir_min: 0,
        };
        tree.apply_min_fill();
        debug!(
            "Opened R*-tree: {} objects, height {}",
            tree.len(),
            tree.height()
        );
        Ok(tree)
    }

    #[inline]
    pub(super) fn pages(&self) -> &PageFile<SpatialNode> {
        &self.tree_file.pages
    }

    fn capacity(&self, leaf: bool) -> usize {
        if leaf {
            self.leaf_capacity()
        } else {
            self.dir_capacity()
        }
    }

    fn min_fill(&self, leaf: bool) -> usize {
        if leaf {
            self.leaf_min
        } else {
            self.dir_min
        }
    }

    fn apply_min_fill(&mut self) {
        let relative = self.settings.tree.relative_min_fill;
        self.leaf_min = min_fill(self.leaf_capacity(), relative);
        self.dir_min = min_fill(self.dir_capacity(), relative);
    }

    /// Fix the dimensionality on first use and derive the node capacities.
    fn fix_dimensionality(&mut self, dim: usize) -> IndexResult<()> {
        let known = self.tree_file.header.dim as usize;
        if known != 0 {
            return if known == dim {
                Ok(())
            } else {
                Err(IndexError::DimensionMismatch {
                    expected: known,
                    actual: dim,
                })
            };
        }
        if dim == 0 {
            return Err(IndexError::InvalidArgument(
                "points need at least one dimension".into(),
            ));
        }

        let page_size = self.pages().page_size();
        let leaf_capacity =
            node_capacity(page_size, true, dim, self.settings.tree.leaf_capacity)?;
        let dir_capacity = node_capacity(page_size, false, dim, self.settings.tree.dir_capacity)?;

        let header = &mut self.tree_file.header;
        header.dim = dim as u32;
        header.leaf_capacity = leaf_capacity as u32;
        header.dir_capacity = dir_capacity as u32;
        self.apply_min_fill();
        debug!(
            "R*-tree holds {}-dimensional points: leaf capacity {}, directory capacity {}",
            dim, leaf_capacity, dir_capacity
        );
        Ok(())
    }

    fn check_integrity_if_enabled(&self) -> IndexResult<()> {
        if self.settings.tree.integrity_checks {
            self.verify_integrity()
        } else {
            Ok(())
        }
    }

    /// Add a point. Ids are not checked for uniqueness.
    pub fn insert(&mut self, id: ObjectId, point: &[f64]) -> IndexResult<()> {
        self.tree_file.check_open()?;
        check_finite(point)?;
        self.fix_dimensionality(point.len())?;
        self.insert_leaf_entry(SpatialEntry::leaf(id, point.to_vec()))?;
        self.tree_file.header.size += 1;
        self.check_integrity_if_enabled()
    }

    /// Load the objects into the tree, in one bulk pass when a bulk split is
    /// configured and the tree is empty, one insert at a time otherwise.
    pub fn initialize(&mut self, objects: Vec<(ObjectId, Vec<f64>)>) -> IndexResult<()> {
        self.tree_file.check_open()?;
        if self.settings.bulk_split.is_some() && self.tree_file.header.root == NO_PAGE {
            return self.bulk_load(objects);
        }
        for (id, point) in objects {
            self.insert(id, &point)?;
        }
        Ok(())
    }

    fn insert_leaf_entry(&mut self, entry: SpatialEntry) -> IndexResult<()> {
        if self.tree_file.header.root == NO_PAGE {
            let page = self.pages().allocate()?;
            self.pages()
                .write_node(page, SpatialNode::with_entries(page, true, vec![entry]))?;
            let header = &mut self.tree_file.header;
            header.root = page;
            header.height = 1;
            return Ok(());
        }
        self.insert_entry(entry, 0, &mut ReinsertGuard::new())
    }

    /// Insert `entry` into a node on `level`.
    fn insert_entry(
        &mut self,
        entry: SpatialEntry,
        level: usize,
        guard: &mut ReinsertGuard,
    ) -> IndexResult<()> {
        let mbr = entry.mbr().into_owned();
        let path = self.choose_path(&mbr, level)?;
        let target = path[path.len() - 1];
        let mut node = (*self.pages().read_node(target)?).clone();
        node.entries.push(entry);
        self.settle(path, node, level, guard)
    }

    /// Pages from the root down to the node on `level` that should take `mbr`.
    fn choose_path(&self, mbr: &Mbr, level: usize) -> IndexResult<Vec<PageId>> {
        let mut page = self.tree_file.header.root;
        let mut path = vec![page];
        let mut current = self.height() - 1;
        while current > level {
            let node = self.pages().read_node(page)?;
            let index = self.choose_subtree(&node.entries, mbr, current == 1);
            page = node.entries[index].child_page().ok_or_else(|| {
                IndexError::IntegrityViolation(format!(
                    "directory page {} holds a leaf entry",
                    node.page_id
                ))
            })?;
            path.push(page);
            current -= 1;
        }
        Ok(path)
    }

    fn choose_subtree(&self, entries: &[SpatialEntry], mbr: &Mbr, children_are_leaves: bool) -> usize {
        // an entry that already covers the object needs no enlargement at all
        let mut containing: Option<(usize, f64)> = None;
        for (i, entry) in entries.iter().enumerate() {
            let bound = entry.mbr();
            if bound.contains(mbr) {
                let volume = bound.volume();
                if containing.map_or(true, |(_, best)| volume < best) {
                    containing = Some((i, volume));
                }
            }
        }
        match containing {
            Some((i, _)) => i,
            None => self
                .settings
                .insertion
                .choose(entries, mbr, children_are_leaves),
        }
    }

    /// Write a modified node, treating an overflow first.
    fn settle(
        &mut self,
        path: Vec<PageId>,
        node: SpatialNode,
        level: usize,
        guard: &mut ReinsertGuard,
    ) -> IndexResult<()> {
        if node.len() <= self.capacity(node.leaf) {
            self.pages().write_node(node.page_id, node)?;
            return self.adjust_bounds(&path);
        }

        // the root is never reinserted
        let reinsert = match &self.settings.overflow {
            OverflowTreatment::Reinsert(strategy) if path.len() > 1 => Some(Arc::clone(strategy)),
            _ => None,
        };
        if let Some(strategy) = reinsert {
            if guard.claim(level) {
                return self.reinsert(path, node, level, strategy.as_ref(), guard);
            }
        }
        self.split(path, node, level, guard)
    }

    /// Recompute the directory entries along `path`, bottom-up, stopping as
    /// soon as a bound is unchanged.
    fn adjust_bounds(&self, path: &[PageId]) -> IndexResult<()> {
        for i in (1..path.len()).rev() {
            let mbr = node_mbr(&*self.pages().read_node(path[i])?)?;
            let parent = self.pages().read_node(path[i - 1])?;
            let pos = child_position(&parent, path[i])?;
            if *parent.entries[pos].mbr() == mbr {
                break;
            }
            let mut parent = SpatialNode::clone(&parent);
            parent.entries[pos] = SpatialEntry::directory(path[i], mbr);
            self.pages().write_node(parent.page_id, parent)?;
        }
        Ok(())
    }

    fn reinsert(
        &mut self,
        path: Vec<PageId>,
        node: SpatialNode,
        level: usize,
        strategy: &dyn ReinsertStrategy,
        guard: &mut ReinsertGuard,
    ) -> IndexResult<()> {
        let center = node_mbr(&node)?.center();
        let amount = ((self.settings.reinsert_amount * node.len() as f64) as usize)
            .clamp(1, node.len() - 1);
        let chosen = strategy.select(&node.entries, &center, amount);

        let SpatialNode {
            page_id,
            leaf,
            entries,
        } = node;
        let mut slots: Vec<Option<SpatialEntry>> = entries.into_iter().map(Some).collect();
        let removed: Vec<SpatialEntry> = chosen.iter().filter_map(|&i| slots[i].take()).collect();
        let kept = SpatialNode::with_entries(page_id, leaf, slots.into_iter().flatten().collect());

        self.stats.count_reinsertion();
        debug!(
            "Reinserting {} entries of page {} at level {}",
            removed.len(),
            page_id,
            level
        );
        self.pages().write_node(page_id, kept)?;
        self.adjust_bounds(&path)?;
        for entry in removed {
            self.insert_entry(entry, level, guard)?;
        }
        Ok(())
    }

    fn split(
        &mut self,
        mut path: Vec<PageId>,
        node: SpatialNode,
        level: usize,
        guard: &mut ReinsertGuard,
    ) -> IndexResult<()> {
        let (first, second) = self.settings.split.split(&node.entries, self.min_fill(node.leaf));
        let SpatialNode {
            page_id,
            leaf,
            entries,
        } = node;
        let mut slots: Vec<Option<SpatialEntry>> = entries.into_iter().map(Some).collect();
        let mut take = |group: &[usize]| -> Vec<SpatialEntry> {
            group.iter().filter_map(|&i| slots[i].take()).collect()
        };
        let left = SpatialNode::with_entries(page_id, leaf, take(&first));
        let sibling = self.pages().allocate()?;
        let right = SpatialNode::with_entries(sibling, leaf, take(&second));
        let left_mbr = node_mbr(&left)?;
        let right_mbr = node_mbr(&right)?;

        self.stats.count_split();
        debug!(
            "Split page {} on level {} into {} and {} entries (new page {})",
            page_id,
            level,
            left.len(),
            right.len(),
            sibling
        );
        self.pages().write_node(page_id, left)?;
        self.pages().write_node(sibling, right)?;

        if path.len() == 1 {
            let root = self.pages().allocate()?;
            let node = SpatialNode::with_entries(
                root,
                false,
                vec![
                    SpatialEntry::directory(page_id, left_mbr),
                    SpatialEntry::directory(sibling, right_mbr),
                ],
            );
            self.pages().write_node(root, node)?;
            let header = &mut self.tree_file.header;
            header.root = root;
            header.height += 1;
            debug!("Root split, new root {} at height {}", root, header.height);
            return Ok(());
        }

        path.pop();
        let parent_page = path[path.len() - 1];
        let mut parent = (*self.pages().read_node(parent_page)?).clone();
        let pos = child_position(&parent, page_id)?;
        parent.entries[pos] = SpatialEntry::directory(page_id, left_mbr);
        parent.entries.push(SpatialEntry::directory(sibling, right_mbr));
        self.settle(path, parent, level + 1, guard)
    }

    /// Build an empty tree bottom-up from a complete object set.
    pub fn bulk_load(&mut self, objects: Vec<(ObjectId, Vec<f64>)>) -> IndexResult<()> {
        self.tree_file.check_open()?;
        if self.tree_file.header.root != NO_PAGE {
            return Err(IndexError::InvalidOperation(
                "bulk load needs an empty tree".into(),
            ));
        }
        let Some((_, first)) = objects.first() else {
            return Ok(());
        };
        let dim = first.len();
        for (_, point) in &objects {
            check_finite(point)?;
            if point.len() != dim {
                return Err(IndexError::DimensionMismatch {
                    expected: dim,
                    actual: point.len(),
                });
            }
        }
        self.fix_dimensionality(dim)?;

        let count = objects.len();
        let entries = objects
            .into_iter()
            .map(|(id, point)| SpatialEntry::leaf(id, point))
            .collect();
        let strategy = self.bulk_strategy();
        let (root, height) = self.build_levels(entries, strategy.as_ref())?;

        let header = &mut self.tree_file.header;
        header.root = root;
        header.height = height;
        header.size = count as u64;
        debug!("Bulk loaded {} objects, height {}", count, height);
        self.check_integrity_if_enabled()
    }

    fn bulk_strategy(&self) -> Arc<dyn BulkSplit> {
        self.settings
            .bulk_split
            .clone()
            .unwrap_or_else(|| Arc::new(SortTileRecursive))
    }

    /// Pack `entries` into leaves, then directory levels, until one node
    /// remains. Returns the root page and the height.
    fn build_levels(
        &self,
        entries: Vec<SpatialEntry>,
        strategy: &dyn BulkSplit,
    ) -> IndexResult<(PageId, u32)> {
        let mut current = entries;
        let mut leaf = true;
        let mut height = 1;
        loop {
            let capacity = self.capacity(leaf);
            if current.len() <= capacity {
                let page = self.pages().allocate()?;
                self.pages()
                    .write_node(page, SpatialNode::with_entries(page, leaf, current))?;
                return Ok((page, height));
            }

            let groups = strategy.partition(&current, self.min_fill(leaf), capacity);
            let mut slots: Vec<Option<SpatialEntry>> = current.into_iter().map(Some).collect();
            let mut next = Vec::with_capacity(groups.len());
            for group in groups {
                let members: Vec<SpatialEntry> =
                    group.iter().filter_map(|&i| slots[i].take()).collect();
                if members.is_empty() {
                    continue;
                }
                let page = self.pages().allocate()?;
                let node = SpatialNode::with_entries(page, leaf, members);
                let mbr = node_mbr(&node)?;
                self.pages().write_node(page, node)?;
                next.push(SpatialEntry::directory(page, mbr));
            }
            debug!("Bulk load: {} pages on level {}", next.len(), height - 1);
            current = next;
            leaf = false;
            height += 1;
        }
    }

    /// Remove the object `id` stored at `point`. Returns whether it was found.
    pub fn delete(&mut self, id: ObjectId, point: &[f64]) -> IndexResult<bool> {
        self.tree_file.check_open()?;
        let header = &self.tree_file.header;
        let root = header.root;
        if root == NO_PAGE {
            return Ok(false);
        }
        if point.len() != header.dim as usize {
            return Err(IndexError::DimensionMismatch {
                expected: header.dim as usize,
                actual: point.len(),
            });
        }

        let Some((path, index)) = self.find_leaf(root, id, point)? else {
            return Ok(false);
        };
        let mut leaf = (*self.pages().read_node(path[path.len() - 1])?).clone();
        leaf.entries.remove(index);
        self.tree_file.header.size -= 1;
        self.condense(path, leaf)?;
        self.check_integrity_if_enabled()?;
        Ok(true)
    }

    /// Path to the leaf holding the entry, and its index there.
    fn find_leaf(
        &self,
        page: PageId,
        id: ObjectId,
        point: &[f64],
    ) -> IndexResult<Option<(Vec<PageId>, usize)>> {
        let node = self.pages().read_node(page)?;
        if node.leaf {
            let found = node.entries.iter().position(|e| {
                matches!(e, SpatialEntry::Leaf { object_id, coordinates }
                    if *object_id == id && coordinates.as_slice() == point)
            });
            return Ok(found.map(|index| (vec![page], index)));
        }
        for entry in &node.entries {
            if let SpatialEntry::Directory { child_page, mbr } = entry {
                if mbr.contains_point(point) {
                    if let Some((mut path, index)) = self.find_leaf(*child_page, id, point)? {
                        path.insert(0, page);
                        return Ok(Some((path, index)));
                    }
                }
            }
        }
        Ok(None)
    }

    /// Walk up from a shrunken leaf. Underfull nodes are cut off and their
    /// entries reinserted on their own level once the path is consistent.
    fn condense(&mut self, mut path: Vec<PageId>, leaf: SpatialNode) -> IndexResult<()> {
        let mut orphans: Vec<(SpatialEntry, usize)> = Vec::new();
        let mut node = leaf;
        let mut level = 0;
        while path.len() > 1 {
            path.pop();
            let parent_page = path[path.len() - 1];
            let mut parent = (*self.pages().read_node(parent_page)?).clone();
            let pos = child_position(&parent, node.page_id)?;
            if node.len() < self.min_fill(node.leaf) {
                debug!(
                    "Dissolving underfull page {} ({} entries) on level {}",
                    node.page_id,
                    node.len(),
                    level
                );
                parent.entries.remove(pos);
                self.pages().free(node.page_id)?;
                orphans.extend(node.entries.into_iter().map(|e| (e, level)));
            } else {
                parent.entries[pos] = SpatialEntry::directory(node.page_id, node_mbr(&node)?);
                self.pages().write_node(node.page_id, node)?;
            }
            node = parent;
            level += 1;
        }
        self.settle_root(node)?;

        // whole subtrees first, so the leaf entries find their final shape
        orphans.sort_by(|a, b| b.1.cmp(&a.1));
        for (entry, level) in orphans {
            self.reinsert_orphan(entry, level)?;
        }
        Ok(())
    }

    /// Store the root after a deletion, collapsing single-child directories.
    fn settle_root(&mut self, root: SpatialNode) -> IndexResult<()> {
        let mut root = root;
        loop {
            if root.is_empty() {
                self.pages().free(root.page_id)?;
                let header = &mut self.tree_file.header;
                header.root = NO_PAGE;
                header.height = 0;
                debug!("R*-tree is empty");
                return Ok(());
            }
            if root.leaf || root.len() > 1 {
                let page = root.page_id;
                self.pages().write_node(page, root)?;
                self.tree_file.header.root = page;
                return Ok(());
            }

            let child = root.entries[0].child_page().ok_or_else(|| {
                IndexError::IntegrityViolation(format!(
                    "directory page {} holds a leaf entry",
                    root.page_id
                ))
            })?;
            self.pages().free(root.page_id)?;
            let header = &mut self.tree_file.header;
            header.height -= 1;
            debug!("Collapsed root into page {}, height {}", child, header.height);
            root = (*self.pages().read_node(child)?).clone();
        }
    }

    fn reinsert_orphan(&mut self, entry: SpatialEntry, level: usize) -> IndexResult<()> {
        if level == 0 {
            return self.insert_leaf_entry(entry);
        }
        if level < self.height() {
            return self.insert_entry(entry, level, &mut ReinsertGuard::new());
        }

        // the tree shrank below this subtree, reinsert its points one by one
        let page = entry.child_page().ok_or_else(|| {
            IndexError::IntegrityViolation("orphaned leaf entry above the leaves".into())
        })?;
        for leaf_entry in self.collect_leaf_entries(page, true)? {
            self.insert_leaf_entry(leaf_entry)?;
        }
        Ok(())
    }

    /// Every leaf entry below `page`, optionally releasing the pages visited.
    fn collect_leaf_entries(&self, page: PageId, release: bool) -> IndexResult<Vec<SpatialEntry>> {
        let mut out = Vec::new();
        let mut stack = vec![page];
        while let Some(page) = stack.pop() {
            let node = self.pages().read_node(page)?;
            if release {
                self.pages().free(page)?;
            }
            if node.leaf {
                out.extend(node.entries.iter().cloned());
            } else {
                stack.extend(node.entries.iter().rev().filter_map(|e| e.child_page()));
            }
        }
        Ok(out)
    }

    /// All indexed objects in tree order.
    pub fn objects(&self) -> IndexResult<Vec<(ObjectId, Vec<f64>)>> {
        self.tree_file.check_open()?;
        let root = self.tree_file.header.root;
        if root == NO_PAGE {
            return Ok(Vec::new());
        }
        Ok(self
            .collect_leaf_entries(root, false)?
            .into_iter()
            .filter_map(|e| match e {
                SpatialEntry::Leaf {
                    object_id,
                    coordinates,
                } => Some((object_id, coordinates)),
                SpatialEntry::Directory { .. } => None,
            })
            .collect())
    }

    /// Reorganize the tree by bulk loading its own contents.
    pub fn rebuild(&mut self) -> IndexResult<()> {
        self.tree_file.check_open()?;
        let root = self.tree_file.header.root;
        if root == NO_PAGE {
            return Ok(());
        }
        let entries = self.collect_leaf_entries(root, true)?;
        let strategy = self.bulk_strategy();
        let (root, height) = self.build_levels(entries, strategy.as_ref())?;
        let header = &mut self.tree_file.header;
        header.root = root;
        header.height = height;
        debug!("Rebuilt R*-tree: {} objects, height {}", header.size, height);
        self.check_integrity_if_enabled()
    }

    /// Check uniform leaf depth, exact directory rectangles, capacities,
    /// entry kinds, dimensionality and the object count.
    pub fn verify_integrity(&self) -> IndexResult<()> {
        self.tree_file.check_open()?;
        let header = &self.tree_file.header;
        if header.root == NO_PAGE {
            if header.size != 0 || header.height != 0 {
                return Err(IndexError::IntegrityViolation(format!(
                    "empty tree reports {} objects and height {}",
                    header.size, header.height
                )));
            }
            return Ok(());
        }
        if header.height == 0 {
            return Err(IndexError::IntegrityViolation(
                "tree with a root reports height 0".into(),
            ));
        }

        let mut count = 0;
        self.verify_node(header.root, header.height as usize - 1, None, &mut count)?;
        if count != header.size {
            return Err(IndexError::IntegrityViolation(format!(
                "leaves hold {} objects, header says {}",
                count, header.size
            )));
        }
        Ok(())
    }

    fn verify_node(
        &self,
        page: PageId,
        level: usize,
        expected: Option<&Mbr>,
        count: &mut u64,
    ) -> IndexResult<()> {
        let violation = |msg: String| Err(IndexError::IntegrityViolation(msg));
        let node = self.pages().read_node(page)?;
        if node.page_id != page {
            return violation(format!("page {} claims to be page {}", page, node.page_id));
        }
        if node.leaf != (level == 0) {
            return violation(format!(
                "page {} on level {} has leaf flag {}",
                page, level, node.leaf
            ));
        }
        if node.is_empty() {
            return violation(format!("page {} is empty", page));
        }
        if node.len() > self.capacity(node.leaf) {
            return violation(format!(
                "page {} holds {} entries, capacity is {}",
                page,
                node.len(),
                self.capacity(node.leaf)
            ));
        }
        if expected.is_none() && !node.leaf && node.len() < 2 {
            return violation(format!("directory root {} has a single child", page));
        }
        if expected.is_some() && node.len() < self.min_fill(node.leaf) {
            return violation(format!(
                "page {} holds {} entries, minimum fill is {}",
                page,
                node.len(),
                self.min_fill(node.leaf)
            ));
        }
        if let Some(expected) = expected {
            let actual = node_mbr(&node)?;
            if actual != *expected {
                return violation(format!(
                    "entry for page {} holds {} but the subtree spans {}",
                    page, expected, actual
                ));
            }
        }

        let dim = self.tree_file.header.dim as usize;
        for entry in &node.entries {
            if entry.dim() != dim {
                return violation(format!(
                    "page {} holds a {}-dimensional entry, tree is {}-dimensional",
                    page,
                    entry.dim(),
                    dim
                ));
            }
            match entry {
                SpatialEntry::Leaf { .. } if node.leaf => *count += 1,
                SpatialEntry::Directory { child_page, mbr } if !node.leaf => {
                    self.verify_node(*child_page, level - 1, Some(mbr), count)?
                }
                _ => return violation(format!("page {} mixes entry kinds", page)),
            }
        }
        Ok(())
    }
}

pub(super) fn check_finite(point: &[f64]) -> IndexResult<()> {
    if point.iter().all(|v| v.is_finite()) {
        Ok(())
    } else {
        Err(IndexError::InvalidArgument(format!(
            "coordinates must be finite: {:?}",
            point
        )))
    }
}

fn node_mbr(node: &SpatialNode) -> IndexResult<Mbr> {
    node.compute_mbr().ok_or_else(|| {
        IndexError::IntegrityViolation(format!("page {} has no entries", node.page_id))
    })
}

fn child_position(parent: &SpatialNode, child: PageId) -> IndexResult<usize> {
    parent.position_of_child(child).ok_or_else(|| {
        IndexError::IntegrityViolation(format!(
            "page {} is not a child of page {}",
            child, parent.page_id
        ))
    })
}

/// Entries per node: the explicit setting when given (checked against the
/// page size), otherwise as many as fit a page.
fn node_capacity(
    page_size: usize,
    leaf: bool,
    dim: usize,
    explicit: Option<usize>,
) -> IndexResult<usize> {
    let kind = if leaf { "leaf" } else { "directory" };
    let sample = |n: usize| -> IndexResult<usize> {
        let entries = (0..n)
            .map(|i| {
                if leaf {
                    SpatialEntry::leaf(i as ObjectId, vec![0.0; dim])
                } else {
                    SpatialEntry::directory(i as PageId, Mbr::point(&vec![0.0; dim]))
                }
            })
            .collect();
        PageFile::<SpatialNode>::encoded_size(&SpatialNode::with_entries(NO_PAGE, leaf, entries))
    };
    let one = sample(1)?;
    let entry_size = sample(2)? - one;
    let overhead = one - entry_size;

    match explicit {
        Some(capacity) => {
            let needed = overhead + capacity * entry_size;
            if needed > page_size {
                return Err(IndexError::InvalidSettings(format!(
                    "{kind} capacity {capacity} needs {needed} bytes per page, page size is {page_size}"
                )));
            }
            Ok(capacity)
        }
        None => derive_capacity(kind, page_size, overhead, entry_size),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spatial::{
        CloseReinsert, FarReinsert, HilbertCurve, LinearSplit, MaxExtension, OneDimSort,
        QuadraticSplit, ZCurve,
    };
    use crate::storage::FilePageStore;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use tempfile::tempdir;

    fn init_logger() {
        let _ = env_logger::builder().is_test(true).try_init();
    }

    fn random_points(n: usize, dims: usize, seed: u64) -> Vec<(ObjectId, Vec<f64>)> {
        let mut rng = StdRng::seed_from_u64(seed);
        (0..n)
            .map(|i| (i as ObjectId, (0..dims).map(|_| rng.gen::<f64>()).collect()))
            .collect()
    }

    fn small_settings() -> RTreeSettings {
        RTreeSettings::builder()
            .leaf_capacity(8)
            .dir_capacity(8)
            .integrity_checks(true)
            .build()
            .unwrap()
    }

    fn euclidean(a: &[f64], b: &[f64]) -> f64 {
        a.iter().zip(b).map(|(x, y)| (x - y) * (x - y)).sum::<f64>().sqrt()
    }

    fn brute_force(points: &[(ObjectId, Vec<f64>)], query: &[f64], k: usize) -> Vec<f64> {
        let mut distances: Vec<f64> = points.iter().map(|(_, p)| euclidean(p, query)).collect();
        distances.sort_by(f64::total_cmp);
        distances.truncate(k);
        distances
    }

    fn knn_distances<D: SpatialDistance>(tree: &RStarTree<D>, query: &[f64], k: usize) -> Vec<f64> {
        tree.knn(query, k)
            .unwrap()
            .into_iter()
            .map(|n| n.distance)
            .collect()
    }

    fn build(settings: RTreeSettings, points: &[(ObjectId, Vec<f64>)]) -> RStarTree {
        let mut tree = RStarTree::in_memory(settings).unwrap();
        for (id, point) in points {
            tree.insert(*id, point).unwrap();
        }
        tree
    }

    #[test]
    fn test_empty_tree() {
        let tree = RStarTree::in_memory(RTreeSettings::default()).unwrap();
        assert!(tree.is_empty());
        assert_eq!(tree.height(), 0);
        assert_eq!(tree.dim(), None);
        assert!(tree.knn(&[0.0, 0.0], 3).unwrap().is_empty());
        assert!(tree.range(&[0.0, 0.0], 10.0).unwrap().is_empty());
        assert!(tree.verify_integrity().is_ok());
    }

    #[test]
    fn test_capacities_derived_from_page_size() {
        let mut tree = RStarTree::in_memory(RTreeSettings::default()).unwrap();
        tree.insert(1, &[0.0, 0.0]).unwrap();
        assert_eq!(tree.dim(), Some(2));
        assert!(tree.leaf_capacity() > 100, "leaf capacity {}", tree.leaf_capacity());
        assert!(tree.dir_capacity() > 50, "dir capacity {}", tree.dir_capacity());
        assert!(tree.leaf_capacity() > tree.dir_capacity());
    }

    #[test]
    fn test_explicit_capacity_must_fit_page() {
        let settings = RTreeSettings::builder()
            .page_size(256)
            .leaf_capacity(100)
            .build()
            .unwrap();
        let mut tree = RStarTree::in_memory(settings).unwrap();
        let result = tree.insert(1, &[0.0, 0.0]);
        assert!(matches!(result, Err(IndexError::InvalidSettings(_))));
    }

    #[test]
    fn test_tiny_page_rejected() {
        let settings = RTreeSettings::builder().page_size(128).build().unwrap();
        let mut tree = RStarTree::in_memory(settings).unwrap();
        assert!(matches!(
            tree.insert(1, &[0.0; 8]),
            Err(IndexError::InvalidSettings(_))
        ));
    }

    #[test]
    fn test_insert_grows_height() {
        init_logger();
        let points = random_points(300, 2, 1);
        let tree = build(small_settings(), &points);
        assert_eq!(tree.len(), 300);
        assert!(tree.height() >= 3, "height {}", tree.height());
        assert!(tree.stats().counters.splits > 0);
        tree.verify_integrity().unwrap();
    }

    #[test]
    fn test_reinsertion_happens_before_split() {
        let points = random_points(300, 2, 2);
        let tree = build(small_settings(), &points);
        assert!(tree.stats().counters.reinsertions > 0);

        let settings = RTreeSettings::builder()
            .leaf_capacity(8)
            .dir_capacity(8)
            .overflow(OverflowTreatment::SplitOnly)
            .build()
            .unwrap();
        let tree = build(settings, &points);
        assert_eq!(tree.stats().counters.reinsertions, 0);
        tree.verify_integrity().unwrap();
    }

    #[test]
    fn test_knn_matches_linear_scan() {
        let points = random_points(500, 3, 3);
        let tree = build(small_settings(), &points);
        let mut rng = StdRng::seed_from_u64(99);
        for _ in 0..20 {
            let query: Vec<f64> = (0..3).map(|_| rng.gen()).collect();
            for k in [1, 5, 17] {
                assert_eq!(knn_distances(&tree, &query, k), brute_force(&points, &query, k));
            }
        }
    }

    #[test]
    fn test_every_strategy_keeps_the_tree_valid() {
        let points = random_points(250, 2, 4);
        let variants = vec![
            RTreeSettings::builder().split(QuadraticSplit),
            RTreeSettings::builder().split(LinearSplit),
            RTreeSettings::builder().overflow(OverflowTreatment::Reinsert(Arc::new(FarReinsert))),
            RTreeSettings::builder().overflow(OverflowTreatment::Reinsert(Arc::new(CloseReinsert))),
            RTreeSettings::builder().insertion(crate::spatial::LeastOverlap),
        ];
        for builder in variants {
            let settings = builder
                .leaf_capacity(6)
                .dir_capacity(5)
                .integrity_checks(true)
                .build()
                .unwrap();
            let tree = build(settings, &points);
            assert_eq!(tree.len(), 250);
            let query = [0.3, 0.6];
            assert_eq!(knn_distances(&tree, &query, 7), brute_force(&points, &query, 7));
        }
    }

    #[test]
    fn test_bulk_load_with_every_split() {
        let points = random_points(1000, 2, 5);
        let splits: Vec<Arc<dyn BulkSplit>> = vec![
            Arc::new(OneDimSort),
            Arc::new(SortTileRecursive),
            Arc::new(MaxExtension),
            Arc::new(ZCurve),
            Arc::new(HilbertCurve),
        ];
        for split in splits {
            let mut settings = small_settings();
            settings.bulk_split = Some(split);
            let mut tree = RStarTree::in_memory(settings).unwrap();
            tree.initialize(points.clone()).unwrap();
            assert_eq!(tree.len(), 1000);
            assert_eq!(tree.stats().counters.splits, 0);
            tree.verify_integrity().unwrap();
            let query = [0.5, 0.5];
            assert_eq!(knn_distances(&tree, &query, 10), brute_force(&points, &query, 10));
        }
    }

    #[test]
    fn test_bulk_load_single_leaf() {
        let points = random_points(5, 2, 6);
        let mut tree = RStarTree::in_memory(small_settings()).unwrap();
        tree.bulk_load(points).unwrap();
        assert_eq!(tree.height(), 1);
        assert_eq!(tree.len(), 5);
    }

    #[test]
    fn test_bulk_load_needs_empty_tree() {
        let mut tree = RStarTree::in_memory(small_settings()).unwrap();
        tree.insert(1, &[0.0, 0.0]).unwrap();
        let result = tree.bulk_load(random_points(10, 2, 7));
        assert!(matches!(result, Err(IndexError::InvalidOperation(_))));
    }

    #[test]
    fn test_bulk_load_rejects_mixed_dimensions() {
        let mut tree = RStarTree::in_memory(small_settings()).unwrap();
        let result = tree.bulk_load(vec![(1, vec![0.0, 0.0]), (2, vec![1.0])]);
        assert!(matches!(
            result,
            Err(IndexError::DimensionMismatch {
                expected: 2,
                actual: 1
            })
        ));
    }

    #[test]
    fn test_dimension_and_value_checks() {
        let mut tree = RStarTree::in_memory(small_settings()).unwrap();
        tree.insert(1, &[0.0, 0.0]).unwrap();
        assert!(matches!(
            tree.insert(2, &[0.0, 0.0, 0.0]),
            Err(IndexError::DimensionMismatch { .. })
        ));
        assert!(matches!(
            tree.insert(3, &[f64::NAN, 0.0]),
            Err(IndexError::InvalidArgument(_))
        ));
        assert!(matches!(
            tree.knn(&[0.0], 1),
            Err(IndexError::DimensionMismatch { .. })
        ));
        assert!(matches!(
            tree.range(&[0.0, 0.0], -1.0),
            Err(IndexError::InvalidArgument(_))
        ));
        assert_eq!(tree.len(), 1);
    }

    #[test]
    fn test_delete_condenses() {
        init_logger();
        let points = random_points(400, 2, 8);
        let mut tree = build(small_settings(), &points);

        for (id, point) in points.iter().step_by(2) {
            assert!(tree.delete(*id, point).unwrap());
        }
        assert_eq!(tree.len(), 200);
        tree.verify_integrity().unwrap();

        let remaining: Vec<(ObjectId, Vec<f64>)> = points.iter().skip(1).step_by(2).cloned().collect();
        let query = [0.25, 0.75];
        assert_eq!(knn_distances(&tree, &query, 15), brute_force(&remaining, &query, 15));
    }

    #[test]
    fn test_min_fill_holds_after_bulk_load_and_churn() {
        let splits: Vec<Arc<dyn BulkSplit>> = vec![
            Arc::new(OneDimSort),
            Arc::new(SortTileRecursive),
            Arc::new(MaxExtension),
            Arc::new(ZCurve),
            Arc::new(HilbertCurve),
        ];
        for split in splits {
            for n in [9, 17, 25, 65, 130, 1001] {
                let mut settings = small_settings();
                settings.bulk_split = Some(Arc::clone(&split));
                let mut tree = RStarTree::in_memory(settings).unwrap();
                tree.bulk_load(random_points(n, 2, n as u64)).unwrap();
                tree.verify_integrity()
                    .unwrap_or_else(|e| panic!("{:?} with {} points: {}", split, n, e));
            }
        }

        let points = random_points(600, 2, 12);
        let mut tree = build(small_settings(), &points);
        for (id, point) in points.iter().step_by(3) {
            assert!(tree.delete(*id, point).unwrap());
        }
        tree.verify_integrity().unwrap();
    }

    #[test]
    fn test_underfull_page_is_reported() {
        let points = random_points(100, 2, 13);
        let tree = build(small_settings(), &points);
        let root = tree.pages().read_node(tree.tree_file.header.root).unwrap();
        let child = root.entries[0].child_page().unwrap();
        let node = tree.pages().read_node(child).unwrap();
        let shrunk = SpatialNode::with_entries(child, node.leaf, node.entries[..1].to_vec());
        tree.pages().write_node(child, shrunk).unwrap();

        let error = tree.verify_integrity().unwrap_err();
        assert!(error.to_string().contains("minimum fill"), "{}", error);
    }

    #[test]
    fn test_delete_missing() {
        let points = random_points(50, 2, 9);
        let mut tree = build(small_settings(), &points);
        assert!(!tree.delete(1000, &[0.5, 0.5]).unwrap());
        // right id, wrong place
        assert!(!tree.delete(0, &[2.0, 2.0]).unwrap());
        assert_eq!(tree.len(), 50);
    }

    #[test]
    fn test_delete_everything() {
        let points = random_points(120, 2, 10);
        let mut tree = build(small_settings(), &points);
        for (id, point) in &points {
            assert!(tree.delete(*id, point).unwrap());
        }
        assert!(tree.is_empty());
        assert_eq!(tree.height(), 0);
        tree.verify_integrity().unwrap();

        tree.insert(7, &[0.1, 0.2]).unwrap();
        assert_eq!(tree.knn(&[0.0, 0.0], 1).unwrap()[0].id, 7);
    }

    #[test]
    fn test_rebuild_preserves_answers() {
        let points = random_points(300, 2, 11);
        let mut tree = build(small_settings(), &points);
        let query = [0.9, 0.1];
        let before = knn_distances(&tree, &query, 12);
        tree.rebuild().unwrap();
        assert_eq!(tree.len(), 300);
        assert_eq!(knn_distances(&tree, &query, 12), before);
        let mut ids: Vec<ObjectId> = tree.objects().unwrap().into_iter().map(|(id, _)| id).collect();
        ids.sort_unstable();
        assert_eq!(ids, (0..300).collect::<Vec<_>>());
    }

    #[test]
    fn test_closed_tree_refuses_work() {
        let mut tree = RStarTree::in_memory(small_settings()).unwrap();
        tree.insert(1, &[0.0, 0.0]).unwrap();
        tree.close().unwrap();
        assert!(matches!(tree.insert(2, &[1.0, 1.0]), Err(IndexError::Closed)));
        assert!(matches!(tree.knn(&[0.0, 0.0], 1), Err(IndexError::Closed)));
        assert!(matches!(tree.flush(), Err(IndexError::Closed)));
        assert!(tree.close().is_ok());
    }

    #[test]
    fn test_persistence_round_trip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("points.rtree");
        let points = random_points(600, 2, 12);
        let query = [0.4, 0.4];
        let expected = brute_force(&points, &query, 9);
        {
            let store: Arc<dyn PageStore> = Arc::new(FilePageStore::create(&path, 1024).unwrap());
            let settings = RTreeSettings::builder().cache_pages(16).build().unwrap();
            let mut tree = RStarTree::create(store, settings).unwrap();
            for (id, point) in &points {
                tree.insert(*id, point).unwrap();
            }
            tree.close().unwrap();
        }

        let store: Arc<dyn PageStore> = Arc::new(FilePageStore::open(&path).unwrap());
        let tree = RStarTree::open(store, RTreeSettings::default()).unwrap();
        assert_eq!(tree.len(), 600);
        assert_eq!(tree.dim(), Some(2));
        tree.verify_integrity().unwrap();
        assert_eq!(knn_distances(&tree, &query, 9), expected);
    }

    #[test]
    fn test_open_empty_store_fails() {
        let store: Arc<dyn PageStore> = Arc::new(MemoryPageStore::new(4096));
        assert!(matches!(
            RStarTree::open(store, RTreeSettings::default()),
            Err(IndexError::InvalidOperation(_))
        ));
    }

    #[test]
    fn test_with_distance_changes_metric() {
        let mut tree = RStarTree::in_memory(small_settings()).unwrap();
        tree.insert(1, &[3.0, 4.0]).unwrap();
        let euclid = tree.knn(&[0.0, 0.0], 1).unwrap();
        assert_eq!(euclid[0].distance, 5.0);

        let tree = tree.with_distance(crate::distance::ManhattanDistance);
        let manhattan = tree.knn(&[0.0, 0.0], 1).unwrap();
        assert_eq!(manhattan[0].distance, 7.0);
    }
}
