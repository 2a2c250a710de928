//! Copy-on-write B+ tree page core.
//!
//! This crate implements the in-memory algorithmic heart of a page-oriented
//! B+ tree index: a byte-exact 4096-byte node layout, in-node search, node
//! splitting and sibling merging, and recursive copy-on-write insert/delete
//! across tree levels. Storage is consumed through the three-operation
//! [`store::PageStore`] boundary; durability, caching, page-id allocation
//! policy, and concurrency control belong to the store implementation.
//!
//! ```
//! use pagetree::{BTree, MemPageStore};
//!
//! let mut tree = BTree::new(MemPageStore::new());
//! tree.insert(b"name", b"pagetree")?;
//! assert_eq!(tree.get(b"name")?.as_deref(), Some(&b"pagetree"[..]));
//! assert!(tree.delete(b"name")?);
//! assert_eq!(tree.root(), None);
//! # Ok::<(), pagetree::Error>(())
//! ```

pub mod btree;
pub mod store;
pub mod types;

pub use btree::BTree;
pub use store::{MemPageStore, PageStore};
pub use types::{Error, PageId, Result};
