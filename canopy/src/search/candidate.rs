use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;

use crate::storage::{ObjectId, PageId};

/// What a candidate points at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target {
    Page(PageId),
    Object(ObjectId),
}

/// A priority queue element.
///
/// `key` is a lower bound of the distance between the query and anything
/// reachable through `target`; for objects it is the exact distance. Metric
/// trees carry the distance from the query to the routing object of a page in
/// `routing_distance`, so children can be pruned before paying for a distance
/// computation.
#[derive(Debug, Clone, Copy)]
pub struct Candidate {
    pub key: f64,
    pub target: Target,
    pub routing_distance: Option<f64>,
    seq: u64,
}

impl PartialEq for Candidate {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Candidate {}

impl PartialOrd for Candidate {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Candidate {
    fn cmp(&self, other: &Self) -> Ordering {
        self.key
            .total_cmp(&other.key)
            .then_with(|| self.seq.cmp(&other.seq))
    }
}

/// Min-priority queue of candidates. Equal keys pop in push order.
#[derive(Debug, Default)]
pub struct CandidateQueue {
    heap: BinaryHeap<Reverse<Candidate>>,
    next_seq: u64,
}

impl CandidateQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, key: f64, target: Target, routing_distance: Option<f64>) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.heap.push(Reverse(Candidate {
            key,
            target,
            routing_distance,
            seq,
        }));
    }

    pub fn pop(&mut self) -> Option<Candidate> {
        self.heap.pop().map(|Reverse(c)| c)
    }

    pub fn peek_key(&self) -> Option<f64> {
        self.heap.peek().map(|Reverse(c)| c.key)
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    pub fn clear(&mut self) {
        self.heap.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pops_in_key_order() {
        let mut queue = CandidateQueue::new();
        queue.push(3.0, Target::Object(3), None);
        queue.push(1.0, Target::Object(1), None);
        queue.push(2.0, Target::Page(7), Some(0.5));

        assert_eq!(queue.peek_key(), Some(1.0));
        let keys: Vec<f64> = std::iter::from_fn(|| queue.pop()).map(|c| c.key).collect();
        assert_eq!(keys, vec![1.0, 2.0, 3.0]);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_ties_pop_fifo() {
        let mut queue = CandidateQueue::new();
        for id in 0..5 {
            queue.push(1.0, Target::Object(id), None);
        }
        queue.push(0.5, Target::Object(99), None);

        assert_eq!(queue.pop().unwrap().target, Target::Object(99));
        for id in 0..5 {
            assert_eq!(queue.pop().unwrap().target, Target::Object(id));
        }
    }

    #[test]
    fn test_routing_distance_carried() {
        let mut queue = CandidateQueue::new();
        queue.push(0.0, Target::Page(1), Some(4.5));
        let c = queue.pop().unwrap();
        assert_eq!(c.routing_distance, Some(4.5));
        assert_eq!(queue.len(), 0);
    }
}
