//! Branch-and-bound search shared by the spatial and metric trees.
//!
//! A tree only has to say where the search starts and how one page is
//! expanded into bounded candidates; the traversal, pruning and the kNN bound
//! live here. Objects are queued with their exact distance, so results come
//! out in non-decreasing distance order.

use log::trace;

use super::{CandidateQueue, KnnHeap, Target};
use crate::errors::IndexResult;
use crate::storage::{ObjectId, PageId};

/// One search result.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Neighbor {
    pub id: ObjectId,
    pub distance: f64,
}

/// The open candidates of a running search plus its pruning bound.
#[derive(Debug)]
pub struct Frontier {
    queue: CandidateQueue,
    knn: Option<KnnHeap>,
    max_radius: f64,
}

impl Frontier {
    fn new() -> Self {
        Self {
            queue: CandidateQueue::new(),
            knn: None,
            max_radius: f64::INFINITY,
        }
    }

    /// Anything farther than this can no longer be part of the answer.
    pub fn bound(&self) -> f64 {
        match &self.knn {
            Some(heap) => self.max_radius.min(heap.kth_distance()),
            None => self.max_radius,
        }
    }

    /// Queue a page whose subtree is at least `lower_bound` away.
    pub fn push_page(
        &mut self,
        lower_bound: f64,
        page: PageId,
        routing_distance: Option<f64>,
    ) -> bool {
        if lower_bound <= self.bound() {
            self.queue.push(lower_bound, Target::Page(page), routing_distance);
            true
        } else {
            false
        }
    }

    /// Queue an object at its exact distance, tightening the kNN bound.
    pub fn push_object(&mut self, distance: f64, id: ObjectId) -> bool {
        if distance <= self.bound() {
            self.queue.push(distance, Target::Object(id), None);
            if let Some(heap) = self.knn.as_mut() {
                heap.offer(distance);
            }
            true
        } else {
            false
        }
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}

/// A tree that can be searched by [`PrioritySearch`].
pub trait SearchSpace {
    type Query: ?Sized;

    /// Root page of the tree, `None` when the tree is empty.
    fn search_root(&self) -> IndexResult<Option<PageId>>;

    /// Push the children of `page` that may still beat `frontier.bound()`.
    ///
    /// `routing_distance` is whatever was stored with the page's candidate.
    fn expand(
        &self,
        query: &Self::Query,
        page: PageId,
        routing_distance: Option<f64>,
        frontier: &mut Frontier,
    ) -> IndexResult<()>;
}

/// Lazy best-first search.
///
/// Each call to `next` pops candidates until an object surfaces, expanding
/// pages on the way without recursing. Dropping the iterator is all it takes
/// to stop a search early.
pub struct PrioritySearch<'a, S: SearchSpace + ?Sized> {
    space: &'a S,
    query: &'a S::Query,
    frontier: Frontier,
    remaining: Option<usize>,
    seeded: bool,
    done: bool,
}

impl<'a, S: SearchSpace + ?Sized> PrioritySearch<'a, S> {
    pub fn new(space: &'a S, query: &'a S::Query) -> Self {
        Self {
            space,
            query,
            frontier: Frontier::new(),
            remaining: None,
            seeded: false,
            done: false,
        }
    }

    /// Stop after `k` results and prune against the running k-th distance.
    pub fn with_limit(mut self, k: usize) -> Self {
        self.frontier.knn = Some(KnnHeap::new(k));
        self.remaining = Some(k);
        self
    }

    /// Never report anything farther than `radius`.
    pub fn with_max_radius(mut self, radius: f64) -> Self {
        self.frontier.max_radius = radius;
        self
    }

    pub fn current_bound(&self) -> f64 {
        self.frontier.bound()
    }

    fn seed(&mut self) -> IndexResult<()> {
        self.seeded = true;
        if let Some(root) = self.space.search_root()? {
            self.frontier.push_page(0.0, root, None);
        }
        Ok(())
    }
}

impl<S: SearchSpace + ?Sized> Iterator for PrioritySearch<'_, S> {
    type Item = IndexResult<Neighbor>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done || self.remaining == Some(0) {
            return None;
        }
        if !self.seeded {
            if let Err(e) = self.seed() {
                self.done = true;
                return Some(Err(e));
            }
        }

        while let Some(candidate) = self.frontier.queue.pop() {
            if candidate.key > self.frontier.bound() {
                // every remaining candidate is at least this far away
                self.frontier.queue.clear();
                break;
            }
            match candidate.target {
                Target::Object(id) => {
                    if let Some(remaining) = self.remaining.as_mut() {
                        *remaining -= 1;
                    }
                    return Some(Ok(Neighbor {
                        id,
                        distance: candidate.key,
                    }));
                }
                Target::Page(page) => {
                    trace!("Expanding page {} at bound {}", page, candidate.key);
                    if let Err(e) = self.space.expand(
                        self.query,
                        page,
                        candidate.routing_distance,
                        &mut self.frontier,
                    ) {
                        self.done = true;
                        return Some(Err(e));
                    }
                }
            }
        }
        self.done = true;
        None
    }
}

/// The `k` nearest objects, closest first.
pub fn knn<S: SearchSpace + ?Sized>(
    space: &S,
    query: &S::Query,
    k: usize,
) -> IndexResult<Vec<Neighbor>> {
    if k == 0 {
        return Ok(Vec::new());
    }
    PrioritySearch::new(space, query).with_limit(k).collect()
}

/// Every object within `radius`, closest first.
pub fn range<S: SearchSpace + ?Sized>(
    space: &S,
    query: &S::Query,
    radius: f64,
) -> IndexResult<Vec<Neighbor>> {
    PrioritySearch::new(space, query)
        .with_max_radius(radius)
        .collect()
}
