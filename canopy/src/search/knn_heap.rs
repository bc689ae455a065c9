use std::cmp::Ordering;
use std::collections::BinaryHeap;

#[derive(Debug, Clone, Copy)]
struct Dist(f64);

impl PartialEq for Dist {
    fn eq(&self, other: &Self) -> bool {
        self.0.total_cmp(&other.0) == Ordering::Equal
    }
}

impl Eq for Dist {}

impl PartialOrd for Dist {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Dist {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.total_cmp(&other.0)
    }
}

/// Bounded max-heap over the k best distances seen so far.
#[derive(Debug, Clone)]
pub struct KnnHeap {
    k: usize,
    heap: BinaryHeap<Dist>,
}

impl KnnHeap {
    pub fn new(k: usize) -> Self {
        Self {
            k,
            heap: BinaryHeap::with_capacity(k.min(1024) + 1),
        }
    }

    /// Offer a distance; returns whether it entered the k best.
    pub fn offer(&mut self, distance: f64) -> bool {
        if self.k == 0 {
            return false;
        }
        if self.heap.len() < self.k {
            self.heap.push(Dist(distance));
            return true;
        }
        match self.heap.peek() {
            Some(worst) if distance < worst.0 => {
                self.heap.pop();
                self.heap.push(Dist(distance));
                true
            }
            _ => false,
        }
    }

    /// The current k-th best distance, `+inf` until k distances were offered.
    pub fn kth_distance(&self) -> f64 {
        if self.k == 0 {
            return f64::NEG_INFINITY;
        }
        if self.heap.len() < self.k {
            return f64::INFINITY;
        }
        self.heap.peek().map_or(f64::INFINITY, |d| d.0)
    }

    pub fn k(&self) -> usize {
        self.k
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.heap.len() >= self.k
    }
}
