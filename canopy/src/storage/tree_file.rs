//! A page file paired with the header of the tree living in it.

use log::{debug, warn};
use serde::de::DeserializeOwned;
use serde::Serialize;

use super::PageFile;
use crate::errors::{IndexError, IndexResult};

/// Header of one tree family, stored in the header slot of a page store.
pub(crate) trait TreeHeader: Serialize + DeserializeOwned {
    /// Tag telling tree families apart.
    const KIND: u32;
    const NAME: &'static str;

    fn kind(&self) -> u32;
}

/// Owns the pages and the header of one tree.
///
/// The header is kept in memory and written to the store header slot on
/// [`TreeFile::flush`]. Dropping an open tree file flushes it on a best
/// effort basis.
pub(crate) struct TreeFile<N, H>
where
    N: Serialize + DeserializeOwned,
    H: TreeHeader,
{
    pub(crate) pages: PageFile<N>,
    pub(crate) header: H,
    closed: bool,
}

impl<N, H> TreeFile<N, H>
where
    N: Serialize + DeserializeOwned,
    H: TreeHeader,
{
    /// Start a new tree in an empty store.
    pub(crate) fn create(pages: PageFile<N>, header: H) -> IndexResult<Self> {
        if pages.store().read_header()?.is_some() {
            return Err(IndexError::InvalidOperation(
                "store already holds an index".into(),
            ));
        }
        let tree_file = Self {
            pages,
            header,
            closed: false,
        };
        tree_file.write_header()?;
        Ok(tree_file)
    }

    /// Load the header of an existing tree.
    pub(crate) fn open(pages: PageFile<N>) -> IndexResult<Self> {
        let bytes = pages
            .store()
            .read_header()?
            .ok_or_else(|| IndexError::InvalidOperation("store holds no index".into()))?;
        let (header, _): (H, usize) =
            bincode::serde::decode_from_slice(&bytes, bincode::config::legacy()).map_err(|e| {
                IndexError::InvalidOperation(format!("store does not hold {}: {}", H::NAME, e))
            })?;
        if header.kind() != H::KIND {
            return Err(IndexError::InvalidOperation(format!(
                "store does not hold {}",
                H::NAME
            )));
        }
        Ok(Self {
            pages,
            header,
            closed: false,
        })
    }

    #[inline]
    pub(crate) fn check_open(&self) -> IndexResult<()> {
        if self.closed {
            Err(IndexError::Closed)
        } else {
            Ok(())
        }
    }

    fn write_header(&self) -> IndexResult<()> {
        let bytes = bincode::serde::encode_to_vec(&self.header, bincode::config::legacy())?;
        self.pages.store().write_header(&bytes)
    }

    /// Write dirty pages and the header, then sync the store.
    pub(crate) fn flush(&self) -> IndexResult<()> {
        self.check_open()?;
        self.pages.flush()?;
        self.write_header()?;
        self.pages.store().sync()
    }

    pub(crate) fn close(&mut self) -> IndexResult<()> {
        if self.closed {
            return Ok(());
        }
        self.flush()?;
        self.closed = true;
        debug!("Closed tree file");
        Ok(())
    }
}

impl<N, H> Drop for TreeFile<N, H>
where
    N: Serialize + DeserializeOwned,
    H: TreeHeader,
{
    fn drop(&mut self) {
        if !self.closed {
            if let Err(e) = self.flush() {
                warn!("Failed to flush tree on drop: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stats::TreeStatistics;
    use crate::storage::{FilePageStore, MemoryPageStore, PageStore};
    use serde::Deserialize;
    use std::sync::Arc;
    use tempfile::tempdir;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Header {
        kind: u32,
        root: u64,
        size: u64,
    }

    impl TreeHeader for Header {
        const KIND: u32 = 7;
        const NAME: &'static str = "a test tree";

        fn kind(&self) -> u32 {
            self.kind
        }
    }

    fn header(root: u64, size: u64) -> Header {
        Header {
            kind: Header::KIND,
            root,
            size,
        }
    }

    fn pages(store: Arc<dyn PageStore>) -> PageFile<Vec<u32>> {
        PageFile::new(store, 8, TreeStatistics::new()).unwrap()
    }

    #[test]
    fn test_create_refuses_used_store() {
        let store: Arc<dyn PageStore> = Arc::new(MemoryPageStore::new(256));
        let first = TreeFile::create(pages(Arc::clone(&store)), header(0, 0));
        assert!(first.is_ok());
        let second = TreeFile::create(pages(store), header(0, 0));
        assert!(matches!(second, Err(IndexError::InvalidOperation(_))));
    }

    #[test]
    fn test_open_requires_header() {
        let store: Arc<dyn PageStore> = Arc::new(MemoryPageStore::new(256));
        let result: IndexResult<TreeFile<Vec<u32>, Header>> = TreeFile::open(pages(store));
        assert!(matches!(result, Err(IndexError::InvalidOperation(_))));
    }

    #[test]
    fn test_open_rejects_other_kind() {
        let store: Arc<dyn PageStore> = Arc::new(MemoryPageStore::new(256));
        let mut other = header(0, 0);
        other.kind = 99;
        let bytes = bincode::serde::encode_to_vec(&other, bincode::config::legacy()).unwrap();
        store.write_header(&bytes).unwrap();
        let result: IndexResult<TreeFile<Vec<u32>, Header>> = TreeFile::open(pages(store));
        assert!(matches!(result, Err(IndexError::InvalidOperation(_))));
    }

    #[test]
    fn test_header_survives_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("tree.pages");
        let page_id;
        {
            let store: Arc<dyn PageStore> = Arc::new(FilePageStore::create(&path, 256).unwrap());
            let mut tree_file =
                TreeFile::create(pages(store), header(0, 0)).unwrap();
            page_id = tree_file.pages.allocate().unwrap();
            tree_file.pages.write_node(page_id, vec![1, 2, 3]).unwrap();
            tree_file.header = header(page_id, 3);
            tree_file.close().unwrap();
            assert!(matches!(tree_file.flush(), Err(IndexError::Closed)));
        }

        let store: Arc<dyn PageStore> = Arc::new(FilePageStore::open(&path).unwrap());
        let tree_file: TreeFile<Vec<u32>, Header> = TreeFile::open(pages(store)).unwrap();
        assert_eq!(tree_file.header, header(page_id, 3));
        assert_eq!(*tree_file.pages.read_node(page_id).unwrap(), vec![1, 2, 3]);
    }

    #[test]
    fn test_drop_flushes() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("tree.pages");
        {
            let store: Arc<dyn PageStore> = Arc::new(FilePageStore::create(&path, 256).unwrap());
            let mut tree_file =
                TreeFile::create(pages(store), header(0, 0)).unwrap();
            tree_file.header.size = 42;
        }
        let store: Arc<dyn PageStore> = Arc::new(FilePageStore::open(&path).unwrap());
        let tree_file: TreeFile<Vec<u32>, Header> = TreeFile::open(pages(store)).unwrap();
        assert_eq!(tree_file.header.size, 42);
    }
}
