//! Shared identifiers and the crate-wide error type.

use std::fmt;

/// Identifier of a fixed-size page owned by the external page store.
///
/// Page id 0 is reserved to mean "no page"; APIs surface that state as
/// `Option<PageId>` and only the on-page child arrays carry the raw zero.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct PageId(pub u64);

impl fmt::Display for PageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Errors surfaced by the tree core and the page store boundary.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// A page decoded from the store is internally inconsistent. Fatal:
    /// no partial repair is attempted.
    #[error("corruption: {0}")]
    Corruption(&'static str),
    /// A caller-supplied argument violates a size or shape constraint.
    #[error("invalid argument: {0}")]
    Invalid(&'static str),
    /// The page store failed to honor a fetch, allocate, or release call.
    #[error("page store: {0}")]
    Store(&'static str),
}

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, Error>;

/// Decode a raw on-page pointer, mapping the reserved zero to `None`.
pub fn decode_page_id(raw: u64) -> Option<PageId> {
    if raw == 0 {
        None
    } else {
        Some(PageId(raw))
    }
}
