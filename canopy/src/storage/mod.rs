//! Paged storage underneath both tree families.
//!
//! A [`PageStore`] moves raw, fixed-size pages. A [`PageFile`] sits on top of
//! a store and hands out decoded nodes through an LRU [`PageCache`], framing
//! every page with a CRC-32 so corruption is detected on read.

mod file_store;
mod memory_store;
mod page_cache;
mod page_file;
mod page_store;
mod tree_file;

pub use file_store::FilePageStore;
pub use memory_store::MemoryPageStore;
pub use page_cache::{CachedPage, PageCache};
pub use page_file::{PageFile, PageFrame};
pub use page_store::PageStore;
pub(crate) use tree_file::{TreeFile, TreeHeader};

/// Identifier of a page inside a store. Page 0 is reserved for the header.
pub type PageId = u64;

/// Identifier of an indexed object.
pub type ObjectId = u64;

/// Page id that never refers to a node.
pub const NO_PAGE: PageId = 0;
