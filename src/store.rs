//! Page store boundary.
//!
//! The tree core consumes storage through three operations and never looks
//! behind them: durability, checksumming, free-list management, and page
//! reuse policy all live on the other side of this trait.

use std::collections::HashMap;

use tracing::trace;

use crate::btree::node::PAGE_SIZE;
use crate::types::{Error, PageId, Result};

/// Storage collaborator owning the id→bytes mapping for fixed-size pages.
///
/// `fetch` may be called multiple times per operation for the same id;
/// `allocate` is called once per newly materialized node; `release` at most
/// once per superseded id, and only after the replacement content has been
/// fully constructed.
pub trait PageStore {
    /// Return an owned copy of the page bytes for `id`.
    fn fetch(&self, id: PageId) -> Result<Vec<u8>>;

    /// Persist `page` as a new page and return its id.
    fn allocate(&mut self, page: &[u8]) -> Result<PageId>;

    /// Release a page id whose content has been superseded.
    fn release(&mut self, id: PageId) -> Result<()>;
}

/// Heap-backed [`PageStore`] for embedding and tests.
///
/// Ids are handed out from a monotonic counter starting at 1, so id 0 never
/// collides with the reserved "no page" value.
pub struct MemPageStore {
    pages: HashMap<u64, Vec<u8>>,
    next_id: u64,
}

// Derived `Default` would zero `next_id` and hand out the reserved id 0.
impl Default for MemPageStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemPageStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self {
            pages: HashMap::new(),
            next_id: 1,
        }
    }

    /// Number of live (allocated and not yet released) pages.
    pub fn live_pages(&self) -> usize {
        self.pages.len()
    }
}

impl PageStore for MemPageStore {
    fn fetch(&self, id: PageId) -> Result<Vec<u8>> {
        self.pages
            .get(&id.0)
            .cloned()
            .ok_or(Error::Store("fetch of unallocated page id"))
    }

    fn allocate(&mut self, page: &[u8]) -> Result<PageId> {
        if page.len() != PAGE_SIZE {
            return Err(Error::Store("allocate requires exactly one page"));
        }
        let id = self.next_id;
        self.next_id = self
            .next_id
            .checked_add(1)
            .ok_or(Error::Store("page id space exhausted"))?;
        self.pages.insert(id, page.to_vec());
        trace!(page_id = id, "allocated page");
        Ok(PageId(id))
    }

    fn release(&mut self, id: PageId) -> Result<()> {
        if self.pages.remove(&id.0).is_none() {
            return Err(Error::Store("release of unallocated page id"));
        }
        trace!(page_id = id.0, "released page");
        Ok(())
    }
}
