//! Candidate queues and the shared branch-and-bound search.

mod candidate;
mod knn_heap;
mod priority;

pub use candidate::{Candidate, CandidateQueue, Target};
pub use knn_heap::KnnHeap;
pub use priority::{knn, range, Frontier, Neighbor, PrioritySearch, SearchSpace};
