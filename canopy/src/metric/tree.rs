//! The M-tree engine.
//!
//! Objects live in an in-memory relation indexed by their id; the pages only
//! hold ids, parent distances and covering radii. Levels are counted from the
//! leaves as in the spatial tree.
//!
//! A deleted object leaves its leaf at once but stays in the relation while
//! directory entries still use it as their routing object. Such retired
//! objects are swept in batches.

use std::collections::HashSet;
use std::sync::Arc;

use log::debug;
use serde::{Deserialize, Serialize};

use super::split::DistanceMatrix;
use super::{MTreeSettings, MetricEntry, MetricNode};
use crate::distance::Distance;
use crate::errors::{IndexError, IndexResult};
use crate::settings::{derive_capacity, min_fill};
use crate::stats::{TreeStatistics, TreeStats};
use crate::storage::{
    MemoryPageStore, ObjectId, PageFile, PageId, PageStore, TreeFile, TreeHeader, NO_PAGE,
};

/// Relative slack granted to covering radii, which are sums of rounded
/// distances.
pub(super) const RADIUS_SLACK: f64 = 1e-9;

/// Whether `distance` lies inside `radius`, allowing for rounding.
#[inline]
pub(super) fn within(distance: f64, radius: f64) -> bool {
    distance <= radius + RADIUS_SLACK * (1.0 + radius)
}

/// Lower bound of the distance from a query to anything inside a ball of
/// `radius` whose center is `gap` away.
#[inline]
pub(super) fn ball_lower_bound(gap: f64, radius: f64) -> f64 {
    (gap - radius - RADIUS_SLACK * (1.0 + radius)).max(0.0)
}

/// Retired objects are swept once there are this many, or a quarter of the
/// tree size if that is larger.
const RETIRED_SWEEP: usize = 64;

/// Persistent state of an M-tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) struct MetricHeader {
    kind: u32,
    pub(crate) root: PageId,
    pub(crate) height: u32,
    pub(crate) size: u64,
    /// Id the next inserted object receives; ids are never reused.
    pub(crate) next_id: u64,
    pub(crate) leaf_capacity: u32,
    pub(crate) dir_capacity: u32,
}

impl TreeHeader for MetricHeader {
    const KIND: u32 = 0x4d54_5245;
    const NAME: &'static str = "an M-tree";

    fn kind(&self) -> u32 {
        self.kind
    }
}

/// One node on a root-to-node path, with the routing object of the entry
/// that points at it (`None` for the root).
#[derive(Debug, Clone, Copy)]
pub(super) struct PathStep {
    pub(super) page: PageId,
    pub(super) routing: Option<ObjectId>,
}

/// A paged M-tree over objects of type `O` under the metric `D`.
///
/// Ids are handed out in insertion order starting at 0. Mutations take
/// `&mut self`; queries take `&self`.
///
/// ## Example
///
/// ```rust,ignore
/// let mut tree = MTree::in_memory(LevenshteinDistance, MTreeSettings::default())?;
/// let id = tree.insert("kitten".to_string())?;
/// tree.insert("sitting".to_string())?;
/// let hits = tree.range(&"mitten".to_string(), 1.0)?;
/// assert_eq!(hits[0].id, id);
/// ```
pub struct MTree<O, D> {
    pub(super) tree_file: TreeFile<MetricNode, MetricHeader>,
    pub(super) relation: Vec<Option<O>>,
    /// Whether a leaf indexes the object, per id.
    indexed: Vec<bool>,
    /// Deleted objects kept for routing.
    retired: Vec<ObjectId>,
    pub(super) settings: MTreeSettings,
    pub(super) distance: D,
    pub(super) stats: Arc<TreeStatistics>,
    leaf_min: usize,
    dir_min: usize,
}

impl<O, D> MTree<O, D> {
    pub fn distance(&self) -> &D {
        &self.distance
    }

    pub fn settings(&self) -> &MTreeSettings {
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

    pub fn leaf_capacity(&self) -> usize {
        self.tree_file.header.leaf_capacity as usize
    }

    pub fn dir_capacity(&self) -> usize {
        self.tree_file.header.dir_capacity as usize
    }

    /// The object stored under `id`, if it is still indexed.
    pub fn get(&self, id: ObjectId) -> Option<&O> {
        let index = id as usize;
        if self.indexed.get(index).copied().unwrap_or(false) {
            self.relation[index].as_ref()
        } else {
            None
        }
    }

    /// Indexed objects in id order.
    pub fn iter(&self) -> impl Iterator<Item = (ObjectId, &O)> + '_ {
        self.relation
            .iter()
            .zip(&self.indexed)
            .enumerate()
            .filter_map(|(id, (object, &indexed))| {
                object.as_ref().filter(|_| indexed).map(|o| (id as ObjectId, o))
            })
    }

    /// Deleted objects still held because directory entries route through
    /// them.
    pub fn retired_len(&self) -> usize {
        self.retired.len()
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

    /// Write dirty pages and the tree header to the store. The relation is
    /// owned by the caller and not persisted.
    pub fn flush(&self) -> IndexResult<()> {
        self.tree_file.flush()
    }

    pub fn close(&mut self) -> IndexResult<()> {
        self.tree_file.close()
    }
}

impl<O, D: Distance<O>> MTree<O, D> {
    pub fn in_memory(distance: D, settings: MTreeSettings) -> IndexResult<Self> {
        let store: Arc<dyn PageStore> = Arc::new(MemoryPageStore::new(settings.tree.page_size));
        Self::create(store, distance, settings)
    }

    /// Start a new tree in an empty store.
    pub fn create(
        store: Arc<dyn PageStore>,
        distance: D,
        settings: MTreeSettings,
    ) -> IndexResult<Self> {
        settings.validate()?;
        let stats = settings.tree.statistics_handle();
        let pages = PageFile::new(store, settings.tree.cache_pages, Arc::clone(&stats))?;
        let page_size = pages.page_size();
        let leaf_capacity = node_capacity(page_size, true, settings.tree.leaf_capacity)?;
        let dir_capacity = node_capacity(page_size, false, settings.tree.dir_capacity)?;
        let header = MetricHeader {
            kind: MetricHeader::KIND,
            root: NO_PAGE,
            height: 0,
            size: 0,
            next_id: 0,
            leaf_capacity: leaf_capacity as u32,
            dir_capacity: dir_capacity as u32,
        };
        let tree_file = TreeFile::create(pages, header)?;
        debug!(
            "Created M-tree: leaf capacity {}, directory capacity {}",
            leaf_capacity, dir_capacity
        );
        let mut tree = Self {
            tree_file,
            relation: Vec::new(),
            indexed: Vec::new(),
            retired: Vec::new(),
            settings,
            distance,
            stats,
            leaf_min: 0,
            dir_min: 0,
        };
        tree.apply_min_fill();
        Ok(tree)
    }

    /// Open the tree held by `store`. `relation[i]` must be the object that
    /// was inserted with id `i`; objects deleted since are dropped unless a
    /// directory entry still routes through them.
    pub fn open(
        store: Arc<dyn PageStore>,
        distance: D,
        settings: MTreeSettings,
        relation: Vec<O>,
    ) -> IndexResult<Self> {
        settings.validate()?;
        let stats = settings.tree.statistics_handle();
        let pages = PageFile::new(store, settings.tree.cache_pages, Arc::clone(&stats))?;
        let tree_file: TreeFile<MetricNode, MetricHeader> = TreeFile::open(pages)?;
        let assigned = tree_file.header.next_id as usize;
        if relation.len() < assigned {
            return Err(IndexError::InvalidArgument(format!(
                "relation holds {} objects, the tree assigned {} ids",
                relation.len(),
                assigned
            )));
        }

        let mut tree = Self {
            tree_file,
            relation: Vec::new(),
            indexed: Vec::new(),
            retired: Vec::new(),
            settings,
            distance,
            stats,
            leaf_min: 0,
            dir_min: 0,
        };
        tree.apply_min_fill();

        let beyond = |id: ObjectId| {
            IndexError::IntegrityViolation(format!(
                "page holds object {} beyond the assigned ids",
                id
            ))
        };
        let mut indexed = vec![false; assigned];
        let mut routed = vec![false; assigned];
        if let Some(root) = tree.root_page() {
            for entry in tree.collect_leaf_entries(root, false)? {
                let id = entry.object_id();
                *indexed.get_mut(id as usize).ok_or_else(|| beyond(id))? = true;
            }
            for id in tree.routing_ids()? {
                *routed.get_mut(id as usize).ok_or_else(|| beyond(id))? = true;
            }
        }
        tree.relation = relation
            .into_iter()
            .take(assigned)
            .enumerate()
            .map(|(i, object)| (indexed[i] || routed[i]).then_some(object))
            .collect();
        tree.retired = (0..assigned)
            .filter(|&i| routed[i] && !indexed[i])
            .map(|i| i as ObjectId)
            .collect();
        tree.indexed = indexed;
        debug!(
            "Opened M-tree: {} objects, height {}",
            tree.len(),
            tree.height()
        );
        Ok(tree)
    }

    #[inline]
    pub(super) fn pages(&self) -> &PageFile<MetricNode> {
        &self.tree_file.pages
    }

    pub(super) fn root_page(&self) -> Option<PageId> {
        let root = self.tree_file.header.root;
        (root != NO_PAGE).then_some(root)
    }

    /// The object behind `id`, indexed or retired.
    pub(super) fn object(&self, id: ObjectId) -> IndexResult<&O> {
        self.relation.get(id as usize).and_then(Option::as_ref).ok_or_else(|| {
            IndexError::IntegrityViolation(format!("object {} is not in the relation", id))
        })
    }

    /// Counted distance computation.
    #[inline]
    pub(super) fn dist(&self, a: &O, b: &O) -> f64 {
        self.stats.count_distance_calc();
        self.distance.distance(a, b)
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

    fn check_integrity_if_enabled(&self) -> IndexResult<()> {
        if self.settings.tree.integrity_checks {
            self.verify_integrity()
        } else {
            Ok(())
        }
    }

    /// Add an object and return its id.
    pub fn insert(&mut self, object: O) -> IndexResult<ObjectId> {
        self.tree_file.check_open()?;
        let id = self.tree_file.header.next_id;
        self.tree_file.header.next_id += 1;
        self.relation.push(Some(object));
        self.indexed.push(true);
        self.insert_leaf(id, 0.0)?;
        self.tree_file.header.size += 1;
        self.check_integrity_if_enabled()?;
        Ok(id)
    }

    /// Insert every object, returning the ids in input order.
    pub fn initialize(&mut self, objects: Vec<O>) -> IndexResult<Vec<ObjectId>> {
        self.tree_file.check_open()?;
        objects.into_iter().map(|o| self.insert(o)).collect()
    }

    /// Place a leaf entry for an object already in the relation.
    fn insert_leaf(&mut self, id: ObjectId, knn_distance: f64) -> IndexResult<()> {
        if self.tree_file.header.root == NO_PAGE {
            let page = self.pages().allocate()?;
            let mut entry = MetricEntry::leaf(id, 0.0);
            entry.set_knn_distance(knn_distance);
            self.pages()
                .write_node(page, MetricNode::with_entries(page, true, vec![entry]))?;
            let header = &mut self.tree_file.header;
            header.root = page;
            header.height = 1;
            return Ok(());
        }

        let (path, parent_distance) = {
            let object = self.object(id)?;
            self.choose_path(object)?
        };
        let target = path[path.len() - 1].page;
        let mut node = (*self.pages().read_node(target)?).clone();
        let mut entry = MetricEntry::leaf(id, parent_distance);
        entry.set_knn_distance(knn_distance);
        node.add_entry(entry);
        self.settle(path, node)
    }

    /// Path from the root to the leaf that should take `object`, and the
    /// distance from the object to that leaf's routing object.
    fn choose_path(&self, object: &O) -> IndexResult<(Vec<PathStep>, f64)> {
        let mut step = PathStep {
            page: self.tree_file.header.root,
            routing: None,
        };
        let mut path = Vec::with_capacity(self.height());
        let mut parent_distance = 0.0;
        loop {
            let node = self.pages().read_node(step.page)?;
            path.push(step);
            if node.leaf {
                return Ok((path, parent_distance));
            }

            let mut candidates = Vec::with_capacity(node.len());
            for entry in &node.entries {
                let distance = self.dist(object, self.object(entry.object_id())?);
                candidates.push((distance, entry.covering_radius()));
            }
            let index = self.settings.insertion.choose(&candidates);
            let entry = &node.entries[index];
            let child = entry.child_page().ok_or_else(|| {
                IndexError::IntegrityViolation(format!(
                    "directory page {} holds a leaf entry",
                    node.page_id
                ))
            })?;
            parent_distance = candidates[index].0;
            step = PathStep {
                page: child,
                routing: Some(entry.object_id()),
            };
        }
    }

    fn settle(&mut self, path: Vec<PathStep>, node: MetricNode) -> IndexResult<()> {
        if node.len() <= self.capacity(node.leaf) {
            self.pages().write_node(node.page_id, node)?;
            return self.adjust_radii(&path);
        }
        self.split(path, node)
    }

    /// Refresh covering radii and kNN aggregates along `path`, bottom-up,
    /// stopping at the first entry that does not change.
    fn adjust_radii(&self, path: &[PathStep]) -> IndexResult<()> {
        for i in (1..path.len()).rev() {
            let child = self.pages().read_node(path[i].page)?;
            let parent = self.pages().read_node(path[i - 1].page)?;
            let pos = child_position(&parent, path[i].page)?;
            let mut entry = parent.entries[pos].clone();
            if !refresh_entry(&mut entry, &child) {
                break;
            }
            let mut parent = MetricNode::clone(&parent);
            parent.entries[pos] = entry;
            self.pages().write_node(parent.page_id, parent)?;
        }
        Ok(())
    }

    fn split(&mut self, mut path: Vec<PathStep>, node: MetricNode) -> IndexResult<()> {
        let MetricNode {
            page_id,
            leaf,
            entries,
        } = node;
        let ids: Vec<ObjectId> = entries.iter().map(MetricEntry::object_id).collect();
        let matrix = {
            let objects = ids
                .iter()
                .map(|&id| self.object(id))
                .collect::<IndexResult<Vec<&O>>>()?;
            DistanceMatrix::new(objects.len(), |i, j| self.dist(objects[i], objects[j]))
        };
        let radii: Vec<f64> = entries.iter().map(MetricEntry::covering_radius).collect();
        let parent_distances: Option<Vec<f64>> = (path.len() > 1)
            .then(|| entries.iter().map(MetricEntry::parent_distance).collect());

        let min_fill = self.min_fill(leaf);
        let distribution = Arc::clone(&self.settings.distribution);
        let (a, b) = self.settings.promotion.promote(
            &matrix,
            &radii,
            parent_distances.as_deref(),
            distribution.as_ref(),
            min_fill,
        );
        let assignment = distribution.distribute(&matrix, &radii, (a, b), min_fill);

        let mut slots: Vec<Option<MetricEntry>> = entries.into_iter().map(Some).collect();
        let mut take = |group: &[usize], seed: usize| -> Vec<MetricEntry> {
            group
                .iter()
                .filter_map(|&i| {
                    slots[i].take().map(|mut entry| {
                        entry.set_parent_distance(matrix.get(i, seed));
                        entry
                    })
                })
                .collect()
        };
        let left = MetricNode::with_entries(page_id, leaf, take(&assignment.first, a));
        let sibling = self.pages().allocate()?;
        let right = MetricNode::with_entries(sibling, leaf, take(&assignment.second, b));
        let mut left_entry = routing_entry(ids[a], &left);
        let mut right_entry = routing_entry(ids[b], &right);

        self.stats.count_split();
        debug!(
            "Split metric page {} into {} and {} entries (new page {}), radii {:.4} and {:.4}",
            page_id,
            left.len(),
            right.len(),
            sibling,
            left_entry.covering_radius(),
            right_entry.covering_radius()
        );
        self.pages().write_node(page_id, left)?;
        self.pages().write_node(sibling, right)?;

        if path.len() == 1 {
            let root = self.pages().allocate()?;
            let node = MetricNode::with_entries(root, false, vec![left_entry, right_entry]);
            self.pages().write_node(root, node)?;
            let header = &mut self.tree_file.header;
            header.root = root;
            header.height += 1;
            debug!("Root split, new root {} at height {}", root, header.height);
            return Ok(());
        }

        path.pop();
        let parent_step = path[path.len() - 1];
        if let Some(routing) = parent_step.routing {
            let routing = self.object(routing)?;
            left_entry.set_parent_distance(self.dist(self.object(ids[a])?, routing));
            right_entry.set_parent_distance(self.dist(self.object(ids[b])?, routing));
        }
        let mut parent = (*self.pages().read_node(parent_step.page)?).clone();
        let pos = child_position(&parent, page_id)?;
        parent.entries[pos] = left_entry;
        parent.entries.push(right_entry);
        self.settle(path, parent)
    }

    /// Remove the object `id`. Returns whether it was indexed.
    pub fn delete(&mut self, id: ObjectId) -> IndexResult<bool> {
        self.tree_file.check_open()?;
        let Some(root) = self.root_page() else {
            return Ok(false);
        };
        let found = match self.get(id) {
            Some(object) => self.find_leaf(
                PathStep {
                    page: root,
                    routing: None,
                },
                object,
                id,
            )?,
            None => return Ok(false),
        };
        let Some((path, index)) = found else {
            return Ok(false);
        };

        let mut leaf = (*self.pages().read_node(path[path.len() - 1].page)?).clone();
        leaf.entries.remove(index);
        self.indexed[id as usize] = false;
        self.retired.push(id);
        self.tree_file.header.size -= 1;
        self.condense(path, leaf)?;
        let threshold = RETIRED_SWEEP.max(self.len() / 4);
        if self.is_empty() || self.retired.len() >= threshold {
            self.release_retired()?;
        }
        self.check_integrity_if_enabled()?;
        Ok(true)
    }

    /// Drop retired objects that no directory entry routes through any more.
    fn release_retired(&mut self) -> IndexResult<()> {
        if self.retired.is_empty() {
            return Ok(());
        }
        let routed: HashSet<ObjectId> = self.routing_ids()?.into_iter().collect();
        let before = self.retired.len();
        let mut kept = Vec::new();
        for id in std::mem::take(&mut self.retired) {
            if routed.contains(&id) {
                kept.push(id);
            } else {
                self.relation[id as usize] = None;
            }
        }
        self.retired = kept;
        debug!(
            "Released {} deleted objects, {} still route",
            before - self.retired.len(),
            self.retired.len()
        );
        Ok(())
    }

    /// Routing object ids of every directory entry.
    pub(super) fn routing_ids(&self) -> IndexResult<Vec<ObjectId>> {
        let mut out = Vec::new();
        let Some(root) = self.root_page() else {
            return Ok(out);
        };
        // leaves sit at level 1 here
        let mut stack = vec![(root, self.height())];
        while let Some((page, level)) = stack.pop() {
            if level <= 1 {
                continue;
            }
            let node = self.pages().read_node(page)?;
            for entry in &node.entries {
                if let MetricEntry::Directory {
                    routing_id,
                    child_page,
                    ..
                } = entry
                {
                    out.push(*routing_id);
                    stack.push((*child_page, level - 1));
                }
            }
        }
        Ok(out)
    }

    /// Path to the leaf holding `id`, and its index there.
    pub(super) fn find_leaf(
        &self,
        step: PathStep,
        object: &O,
        id: ObjectId,
    ) -> IndexResult<Option<(Vec<PathStep>, usize)>> {
        let node = self.pages().read_node(step.page)?;
        if node.leaf {
            return Ok(node.position_of_object(id).map(|index| (vec![step], index)));
        }
        for entry in &node.entries {
            if let MetricEntry::Directory {
                routing_id,
                covering_radius,
                child_page,
                ..
            } = entry
            {
                let distance = self.dist(object, self.object(*routing_id)?);
                if !within(distance, *covering_radius) {
                    continue;
                }
                let child = PathStep {
                    page: *child_page,
                    routing: Some(*routing_id),
                };
                if let Some((mut path, index)) = self.find_leaf(child, object, id)? {
                    path.insert(0, step);
                    return Ok(Some((path, index)));
                }
            }
        }
        Ok(None)
    }

    /// Walk up from a shrunken leaf, cutting off underfull nodes. Objects
    /// below a cut node are reinserted once the path is consistent.
    fn condense(&mut self, mut path: Vec<PathStep>, leaf: MetricNode) -> IndexResult<()> {
        let mut orphans: Vec<MetricEntry> = Vec::new();
        let mut node = leaf;
        while path.len() > 1 {
            path.pop();
            let parent_page = path[path.len() - 1].page;
            let mut parent = (*self.pages().read_node(parent_page)?).clone();
            let pos = child_position(&parent, node.page_id)?;
            if node.len() < self.min_fill(node.leaf) {
                debug!(
                    "Dissolving underfull metric page {} ({} entries)",
                    node.page_id,
                    node.len()
                );
                parent.entries.remove(pos);
                orphans.extend(self.release_subtree(node)?);
            } else {
                refresh_entry(&mut parent.entries[pos], &node);
                self.pages().write_node(node.page_id, node)?;
            }
            node = parent;
        }
        self.settle_root(node)?;

        for entry in orphans {
            self.insert_leaf(entry.object_id(), entry.knn_distance())?;
        }
        Ok(())
    }

    /// Free a detached node with its subtree and return its leaf entries.
    fn release_subtree(&self, node: MetricNode) -> IndexResult<Vec<MetricEntry>> {
        self.pages().free(node.page_id)?;
        if node.leaf {
            return Ok(node.entries);
        }
        let mut out = Vec::new();
        for entry in &node.entries {
            if let Some(child) = entry.child_page() {
                out.extend(self.collect_leaf_entries(child, true)?);
            }
        }
        Ok(out)
    }

    /// Store the root after a deletion, collapsing single-child directories.
    fn settle_root(&mut self, root: MetricNode) -> IndexResult<()> {
        let mut root = root;
        loop {
            if root.is_empty() {
                self.pages().free(root.page_id)?;
                let header = &mut self.tree_file.header;
                header.root = NO_PAGE;
                header.height = 0;
                debug!("M-tree is empty");
                return Ok(());
            }
            if root.leaf || root.len() > 1 {
                // the root has no routing object
                for entry in &mut root.entries {
                    entry.set_parent_distance(0.0);
                }
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

    /// Every leaf entry below `page`, optionally releasing the pages visited.
    pub(super) fn collect_leaf_entries(
        &self,
        page: PageId,
        release: bool,
    ) -> IndexResult<Vec<MetricEntry>> {
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

    /// Reorganize the tree by reinserting its own contents.
    pub fn rebuild(&mut self) -> IndexResult<()> {
        self.tree_file.check_open()?;
        let Some(root) = self.root_page() else {
            return Ok(());
        };
        let entries = self.collect_leaf_entries(root, true)?;
        let header = &mut self.tree_file.header;
        header.root = NO_PAGE;
        header.height = 0;
        for entry in entries {
            self.insert_leaf(entry.object_id(), entry.knn_distance())?;
        }
        self.release_retired()?;
        debug!(
            "Rebuilt M-tree: {} objects, height {}",
            self.len(),
            self.height()
        );
        self.check_integrity_if_enabled()
    }

    /// Set the kNN distance of a leaf entry and refresh the aggregates above.
    /// Returns whether the object was found.
    pub(crate) fn set_knn_distance(&mut self, id: ObjectId, value: f64) -> IndexResult<bool> {
        self.tree_file.check_open()?;
        let Some((path, index)) = self.locate(id)? else {
            return Ok(false);
        };
        let leaf_page = path[path.len() - 1].page;
        let mut leaf = (*self.pages().read_node(leaf_page)?).clone();
        if leaf.entries[index].knn_distance() == value {
            return Ok(true);
        }
        leaf.entries[index].set_knn_distance(value);
        self.pages().write_node(leaf_page, leaf)?;
        self.adjust_radii(&path)?;
        Ok(true)
    }

    /// Stored kNN distance of `id`, `None` when the object is not indexed.
    pub(crate) fn knn_distance_of(&self, id: ObjectId) -> IndexResult<Option<f64>> {
        self.tree_file.check_open()?;
        let Some((path, index)) = self.locate(id)? else {
            return Ok(None);
        };
        let leaf = self.pages().read_node(path[path.len() - 1].page)?;
        Ok(Some(leaf.entries[index].knn_distance()))
    }

    fn locate(&self, id: ObjectId) -> IndexResult<Option<(Vec<PathStep>, usize)>> {
        match (self.root_page(), self.get(id)) {
            (Some(root), Some(object)) => self.find_leaf(
                PathStep {
                    page: root,
                    routing: None,
                },
                object,
                id,
            ),
            _ => Ok(None),
        }
    }

    /// Check uniform leaf depth, parent distances, covering radii (every
    /// object lies inside the ball of each of its ancestors), kNN aggregates,
    /// capacities, minimum fill below the root and the object count.
    pub fn verify_integrity(&self) -> IndexResult<()> {
        self.tree_file.check_open()?;
        let header = &self.tree_file.header;
        let Some(root) = self.root_page() else {
            if header.size != 0 || header.height != 0 {
                return Err(IndexError::IntegrityViolation(format!(
                    "empty tree reports {} objects and height {}",
                    header.size, header.height
                )));
            }
            return Ok(());
        };
        if header.height == 0 {
            return Err(IndexError::IntegrityViolation(
                "tree with a root reports height 0".into(),
            ));
        }

        let mut count = 0;
        let mut balls = Vec::with_capacity(header.height as usize);
        self.verify_node(root, header.height as usize - 1, None, &mut balls, &mut count)?;
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
        parent: Option<&MetricEntry>,
        balls: &mut Vec<(ObjectId, f64)>,
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
        if parent.is_none() && !node.leaf && node.len() < 2 {
            return violation(format!("directory root {} has a single child", page));
        }
        if parent.is_some() && node.len() < self.min_fill(node.leaf) {
            return violation(format!(
                "page {} holds {} entries, minimum fill is {}",
                page,
                node.len(),
                self.min_fill(node.leaf)
            ));
        }
        if let Some(parent) = parent {
            let radius = node.covering_radius();
            if (parent.covering_radius() - radius).abs() > RADIUS_SLACK * (1.0 + radius) {
                return violation(format!(
                    "entry for page {} has radius {} but the subtree needs {}",
                    page,
                    parent.covering_radius(),
                    radius
                ));
            }
            if parent.knn_distance() != node.max_knn_distance() {
                return violation(format!(
                    "entry for page {} aggregates kNN distance {}, subtree holds {}",
                    page,
                    parent.knn_distance(),
                    node.max_knn_distance()
                ));
            }
        }

        let routing = match parent {
            Some(entry) => Some(self.object(entry.object_id())?),
            None => None,
        };
        for entry in &node.entries {
            let object = self.object(entry.object_id())?;
            let expected = routing.map_or(0.0, |r| self.distance.distance(object, r));
            if (entry.parent_distance() - expected).abs() > RADIUS_SLACK * (1.0 + expected) {
                return violation(format!(
                    "entry for object {} on page {} stores parent distance {}, actual {}",
                    entry.object_id(),
                    page,
                    entry.parent_distance(),
                    expected
                ));
            }
            match entry {
                MetricEntry::Leaf { object_id, .. } if node.leaf => {
                    if self.get(*object_id).is_none() {
                        return violation(format!(
                            "leaf {} holds deleted object {}",
                            page, object_id
                        ));
                    }
                    for &(routing, radius) in balls.iter() {
                        let distance = self.distance.distance(object, self.object(routing)?);
                        if !within(distance, radius) {
                            return violation(format!(
                                "object {} lies {} from routing object {}, radius is {}",
                                object_id, distance, routing, radius
                            ));
                        }
                    }
                    *count += 1;
                }
                MetricEntry::Directory {
                    routing_id,
                    covering_radius,
                    child_page,
                    ..
                } if !node.leaf => {
                    balls.push((*routing_id, *covering_radius));
                    self.verify_node(*child_page, level - 1, Some(entry), balls, count)?;
                    balls.pop();
                }
                _ => return violation(format!("page {} mixes entry kinds", page)),
            }
        }
        Ok(())
    }
}

/// Directory entry routing to `node` through the object `routing`.
fn routing_entry(routing: ObjectId, node: &MetricNode) -> MetricEntry {
    let mut entry = MetricEntry::directory(routing, node.covering_radius(), 0.0, node.page_id);
    entry.set_knn_distance(node.max_knn_distance());
    entry
}

/// Bring a directory entry in line with its child. Returns whether it changed.
fn refresh_entry(entry: &mut MetricEntry, child: &MetricNode) -> bool {
    let radius = child.covering_radius();
    let knn = child.max_knn_distance();
    match entry {
        MetricEntry::Directory {
            covering_radius,
            knn_distance,
            ..
        } => {
            if *covering_radius == radius && *knn_distance == knn {
                return false;
            }
            *covering_radius = radius;
            *knn_distance = knn;
            true
        }
        MetricEntry::Leaf { .. } => false,
    }
}

fn child_position(parent: &MetricNode, child: PageId) -> IndexResult<usize> {
    parent.position_of_child(child).ok_or_else(|| {
        IndexError::IntegrityViolation(format!(
            "page {} is not a child of page {}",
            child, parent.page_id
        ))
    })
}

/// Entries per node: the explicit setting when given (checked against the
/// page size), otherwise as many as fit a page.
fn node_capacity(page_size: usize, leaf: bool, explicit: Option<usize>) -> IndexResult<usize> {
    let kind = if leaf { "leaf" } else { "directory" };
    let sample = |n: usize| -> IndexResult<usize> {
        let entries = (0..n)
            .map(|i| {
                if leaf {
                    MetricEntry::leaf(i as ObjectId, 0.0)
                } else {
                    MetricEntry::directory(i as ObjectId, 0.0, 0.0, i as PageId)
                }
            })
            .collect();
        PageFile::<MetricNode>::encoded_size(&MetricNode::with_entries(NO_PAGE, leaf, entries))
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
    use crate::distance::{EuclideanDistance, LevenshteinDistance};
    use crate::metric::{FarthestPoints, GeneralizedHyperplane, MlbDist, RandomPromotion};
    use crate::storage::FilePageStore;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use tempfile::tempdir;

    fn init_logger() {
        let _ = env_logger::builder().is_test(true).try_init();
    }

    fn random_points(n: usize, dims: usize, seed: u64) -> Vec<Vec<f64>> {
        let mut rng = StdRng::seed_from_u64(seed);
        (0..n)
            .map(|_| (0..dims).map(|_| rng.gen::<f64>()).collect())
            .collect()
    }

    fn small_settings() -> MTreeSettings {
        MTreeSettings::builder()
            .leaf_capacity(8)
            .dir_capacity(8)
            .integrity_checks(true)
            .build()
            .unwrap()
    }

    fn build(
        settings: MTreeSettings,
        points: &[Vec<f64>],
    ) -> MTree<Vec<f64>, EuclideanDistance> {
        let mut tree = MTree::in_memory(EuclideanDistance, settings).unwrap();
        tree.initialize(points.to_vec()).unwrap();
        tree
    }

    fn brute_force(points: &[Vec<f64>], query: &[f64], k: usize) -> Vec<f64> {
        let mut distances: Vec<f64> = points
            .iter()
            .map(|p| EuclideanDistance.distance(p.as_slice(), query))
            .collect();
        distances.sort_by(f64::total_cmp);
        distances.truncate(k);
        distances
    }

    #[test]
    fn test_empty_tree() {
        let tree: MTree<Vec<f64>, _> =
            MTree::in_memory(EuclideanDistance, MTreeSettings::default()).unwrap();
        assert!(tree.is_empty());
        assert_eq!(tree.height(), 0);
        assert!(tree.leaf_capacity() > 100, "leaf capacity {}", tree.leaf_capacity());
        assert!(tree.dir_capacity() > 50, "dir capacity {}", tree.dir_capacity());
        assert!(tree.knn(&vec![0.0, 0.0], 3).unwrap().is_empty());
        tree.verify_integrity().unwrap();
    }

    #[test]
    fn test_explicit_capacity_must_fit_page() {
        let settings = MTreeSettings::builder()
            .page_size(256)
            .leaf_capacity(100)
            .build()
            .unwrap();
        let result = MTree::<Vec<f64>, _>::in_memory(EuclideanDistance, settings);
        assert!(matches!(result, Err(IndexError::InvalidSettings(_))));
    }

    #[test]
    fn test_ids_follow_insertion_order() {
        let mut tree = MTree::in_memory(LevenshteinDistance, small_settings()).unwrap();
        let ids = tree
            .initialize(vec!["alpha".to_string(), "beta".to_string()])
            .unwrap();
        assert_eq!(ids, vec![0, 1]);
        assert_eq!(tree.insert("gamma".to_string()).unwrap(), 2);
        assert_eq!(tree.get(1).map(String::as_str), Some("beta"));
        assert_eq!(tree.get(3), None);
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
    fn test_knn_matches_brute_force_for_every_policy() {
        init_logger();
        let points = random_points(250, 3, 2);
        let variants = vec![
            small_settings(),
            MTreeSettings::builder()
                .leaf_capacity(8)
                .dir_capacity(8)
                .integrity_checks(true)
                .promotion(MlbDist)
                .distribution(GeneralizedHyperplane)
                .build()
                .unwrap(),
            MTreeSettings::builder()
                .leaf_capacity(8)
                .dir_capacity(8)
                .integrity_checks(true)
                .promotion(FarthestPoints)
                .build()
                .unwrap(),
            MTreeSettings::builder()
                .leaf_capacity(8)
                .dir_capacity(8)
                .integrity_checks(true)
                .promotion(RandomPromotion::new(9))
                .distribution(GeneralizedHyperplane)
                .build()
                .unwrap(),
        ];
        let queries = random_points(10, 3, 3);
        for settings in variants {
            let tree = build(settings, &points);
            for query in &queries {
                let found: Vec<f64> = tree
                    .knn(query, 7)
                    .unwrap()
                    .into_iter()
                    .map(|n| n.distance)
                    .collect();
                assert_eq!(found, brute_force(&points, query, 7));
            }
        }
    }

    #[test]
    fn test_delete_condenses() {
        init_logger();
        let points = random_points(200, 2, 4);
        let mut tree = build(small_settings(), &points);
        for id in (0..200).step_by(2) {
            assert!(tree.delete(id).unwrap(), "object {} not found", id);
        }
        assert_eq!(tree.len(), 100);
        assert!(tree.get(0).is_none());
        tree.verify_integrity().unwrap();

        let remaining: Vec<Vec<f64>> = points.iter().skip(1).step_by(2).cloned().collect();
        let query = vec![0.5, 0.5];
        let found: Vec<f64> = tree
            .knn(&query, 5)
            .unwrap()
            .into_iter()
            .map(|n| n.distance)
            .collect();
        assert_eq!(found, brute_force(&remaining, &query, 5));
        assert!(tree.knn(&query, 100).unwrap().iter().all(|n| n.id % 2 == 1));
    }

    #[test]
    fn test_delete_missing() {
        let points = random_points(20, 2, 5);
        let mut tree = build(small_settings(), &points);
        assert!(!tree.delete(99).unwrap());
        assert!(tree.delete(3).unwrap());
        assert!(!tree.delete(3).unwrap());
        assert_eq!(tree.len(), 19);
    }

    #[test]
    fn test_delete_everything() {
        let points = random_points(60, 2, 6);
        let mut tree = build(small_settings(), &points);
        for id in 0..60 {
            assert!(tree.delete(id).unwrap());
        }
        assert!(tree.is_empty());
        assert_eq!(tree.height(), 0);
        tree.verify_integrity().unwrap();
        let id = tree.insert(vec![0.1, 0.2]).unwrap();
        assert_eq!(id, 60);
        assert_eq!(tree.knn(&vec![0.0, 0.0], 1).unwrap()[0].id, 60);
    }

    fn line_tree(n: usize) -> (MTree<Vec<f64>, EuclideanDistance>, Vec<Vec<f64>>) {
        let settings = MTreeSettings::builder()
            .leaf_capacity(4)
            .dir_capacity(4)
            .integrity_checks(true)
            .build()
            .unwrap();
        let points: Vec<Vec<f64>> = (0..n).map(|i| vec![i as f64, 0.0]).collect();
        (build(settings, &points), points)
    }

    #[test]
    fn test_queries_survive_deleting_routing_objects() {
        init_logger();
        let (mut tree, points) = line_tree(20);
        assert!(tree.height() >= 2);
        let query = vec![7.3, 0.4];
        for id in 0..20 {
            assert!(tree.delete(id).unwrap(), "object {} not found", id);
            let remaining = &points[id as usize + 1..];
            let k = remaining.len().min(3);
            let found: Vec<f64> = tree
                .knn(&query, k)
                .unwrap()
                .into_iter()
                .map(|n| n.distance)
                .collect();
            assert_eq!(found, brute_force(remaining, &query, k), "after deleting {}", id);
            let hits = tree.range(&query, 5.0).unwrap();
            assert!(hits.iter().all(|n| n.id > id));
        }
        assert!(tree.is_empty());
        assert_eq!(tree.retired_len(), 0);
        assert!(tree.relation.iter().all(Option::is_none));
    }

    #[test]
    fn test_deleted_routing_objects_are_held_until_unused() {
        let (mut tree, points) = line_tree(40);
        let mut routing = tree.routing_ids().unwrap();
        routing.sort_unstable();
        routing.dedup();
        assert!(!routing.is_empty());
        for &id in &routing {
            assert!(tree.delete(id).unwrap());
        }
        assert!(tree.retired_len() > 0);
        for &id in &routing {
            assert!(tree.get(id).is_none());
            assert!(!tree.delete(id).unwrap());
        }
        assert!(tree.iter().all(|(id, _)| routing.binary_search(&id).is_err()));

        let remaining: Vec<Vec<f64>> = points
            .iter()
            .enumerate()
            .filter(|(i, _)| routing.binary_search(&(*i as ObjectId)).is_err())
            .map(|(_, p)| p.clone())
            .collect();
        let query = vec![21.5, 0.0];
        let found: Vec<f64> = tree
            .knn(&query, 5)
            .unwrap()
            .into_iter()
            .map(|n| n.distance)
            .collect();
        assert_eq!(found, brute_force(&remaining, &query, 5));

        tree.rebuild().unwrap();
        assert_eq!(tree.retired_len(), 0);
        assert_eq!(tree.len(), remaining.len());
        for &id in &routing {
            assert!(tree.relation[id as usize].is_none());
        }
    }

    #[test]
    fn test_underfull_page_is_reported() {
        let points = random_points(200, 2, 14);
        let settings = MTreeSettings::builder()
            .leaf_capacity(8)
            .dir_capacity(8)
            .build()
            .unwrap();
        let tree = build(settings, &points);
        tree.verify_integrity().unwrap();
        let root = tree.pages().read_node(tree.tree_file.header.root).unwrap();
        let child = root.entries[0].child_page().unwrap();
        let node = tree.pages().read_node(child).unwrap();
        let shrunk = MetricNode::with_entries(child, node.leaf, node.entries[..1].to_vec());
        tree.pages().write_node(child, shrunk).unwrap();

        let error = tree.verify_integrity().unwrap_err();
        assert!(error.to_string().contains("minimum fill"), "{}", error);
    }

    #[test]
    fn test_rebuild_keeps_objects() {
        let points = random_points(150, 2, 7);
        let mut tree = build(small_settings(), &points);
        tree.rebuild().unwrap();
        assert_eq!(tree.len(), 150);
        tree.verify_integrity().unwrap();
        let query = vec![0.3, 0.6];
        let found: Vec<f64> = tree
            .knn(&query, 4)
            .unwrap()
            .into_iter()
            .map(|n| n.distance)
            .collect();
        assert_eq!(found, brute_force(&points, &query, 4));
    }

    #[test]
    fn test_knn_distance_hooks() {
        let points = random_points(80, 2, 8);
        let mut tree = build(small_settings(), &points);
        assert_eq!(tree.knn_distance_of(5).unwrap(), Some(0.0));
        assert!(tree.set_knn_distance(5, 0.75).unwrap());
        assert_eq!(tree.knn_distance_of(5).unwrap(), Some(0.75));
        assert!(!tree.set_knn_distance(500, 1.0).unwrap());
        assert_eq!(tree.knn_distance_of(500).unwrap(), None);
        // the aggregate above the leaf follows
        tree.verify_integrity().unwrap();
        let root = tree.pages().read_node(tree.root_page().unwrap()).unwrap();
        assert_eq!(root.max_knn_distance(), 0.75);
    }

    #[test]
    fn test_closed_tree() {
        let mut tree = build(small_settings(), &random_points(10, 2, 9));
        tree.close().unwrap();
        assert!(matches!(tree.insert(vec![0.0, 0.0]), Err(IndexError::Closed)));
        assert!(matches!(tree.knn(&vec![0.0, 0.0], 1), Err(IndexError::Closed)));
        assert!(tree.close().is_ok());
    }

    #[test]
    fn test_persistence_round_trip() {
        init_logger();
        let dir = tempdir().unwrap();
        let path = dir.path().join("mtree.db");
        let points = random_points(120, 2, 10);
        let settings = MTreeSettings::builder()
            .leaf_capacity(8)
            .dir_capacity(8)
            .cache_pages(16)
            .build()
            .unwrap();
        {
            let store: Arc<dyn PageStore> = Arc::new(FilePageStore::create(&path, 1024).unwrap());
            let mut tree = MTree::create(store, EuclideanDistance, settings.clone()).unwrap();
            tree.initialize(points.clone()).unwrap();
            tree.delete(7).unwrap();
            tree.close().unwrap();
        }

        let store: Arc<dyn PageStore> = Arc::new(FilePageStore::open(&path).unwrap());
        let tree = MTree::open(store, EuclideanDistance, settings, points.clone()).unwrap();
        assert_eq!(tree.len(), 119);
        assert!(tree.get(7).is_none());
        tree.verify_integrity().unwrap();
        let query = vec![0.5, 0.5];
        let mut remaining = points.clone();
        remaining.remove(7);
        let found: Vec<f64> = tree
            .knn(&query, 6)
            .unwrap()
            .into_iter()
            .map(|n| n.distance)
            .collect();
        assert_eq!(found, brute_force(&remaining, &query, 6));
    }

    #[test]
    fn test_open_needs_full_relation() {
        let store: Arc<dyn PageStore> = Arc::new(MemoryPageStore::new(1024));
        {
            let mut tree =
                MTree::create(Arc::clone(&store), EuclideanDistance, small_settings()).unwrap();
            tree.initialize(random_points(5, 2, 11)).unwrap();
            tree.flush().unwrap();
        }
        let result = MTree::open(store, EuclideanDistance, small_settings(), random_points(3, 2, 11));
        assert!(matches!(result, Err(IndexError::InvalidArgument(_))));
    }
}
