//! Merge engine: decide whether an under-capacity node should absorb a
//! sibling, and concatenate two nodes into one.

use tracing::debug;

use crate::btree::node::{Node, HEADER_LEN, PAGE_SIZE};
use crate::store::PageStore;
use crate::types::{Error, Result};

/// A node becomes a merge candidate once its encoded size drops below this
/// byte threshold.
pub(crate) const MERGE_LOW_WATER: usize = PAGE_SIZE / 4;

/// Which sibling of the updated child the merge consumes.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum Sibling {
    /// Sibling at `child_index - 1`; it becomes the left merge input.
    Left,
    /// Sibling at `child_index + 1`; it becomes the right merge input.
    Right,
}

/// Fetch and decode the child of `parent` at `idx`.
fn load_child<S: PageStore>(store: &S, parent: &Node, idx: u16) -> Result<Node> {
    let child = parent
        .child(idx)
        .ok_or(Error::Corruption("internal child pointer is zero"))?;
    Node::decode(store.fetch(child)?)
}

fn fits_merged(left: &Node, right: &Node) -> bool {
    // Concatenated entries share a single header.
    left.encoded_len() + right.encoded_len() - HEADER_LEN <= PAGE_SIZE
}

/// Decide whether `updated` (the rebuilt child at `idx`) should merge, and
/// with which sibling. The left sibling is preferred; either direction
/// requires the combined node to fit one page.
pub(crate) fn sibling_for_merge<S: PageStore>(
    store: &S,
    parent: &Node,
    idx: u16,
    updated: &Node,
) -> Result<Option<(Sibling, Node)>> {
    if updated.encoded_len() >= MERGE_LOW_WATER {
        return Ok(None);
    }
    if idx > 0 {
        let sibling = load_child(store, parent, idx - 1)?;
        if fits_merged(&sibling, updated) {
            return Ok(Some((Sibling::Left, sibling)));
        }
    }
    if idx + 1 < parent.nkeys() {
        let sibling = load_child(store, parent, idx + 1)?;
        if fits_merged(updated, &sibling) {
            return Ok(Some((Sibling::Right, sibling)));
        }
    }
    Ok(None)
}

/// Concatenate `left` then `right` into one node under a combined header.
/// Caller guarantees matching kinds and a combined size within one page.
pub(crate) fn merge(left: &Node, right: &Node) -> Node {
    debug_assert_eq!(left.kind(), right.kind());
    debug_assert!(fits_merged(left, right));
    let mut merged = Node::build(left.kind(), left.nkeys() + right.nkeys());
    merged.append_range(left, 0, 0, left.nkeys());
    merged.append_range(right, left.nkeys(), 0, right.nkeys());
    debug!(
        left = left.nkeys(),
        right = right.nkeys(),
        "merged sibling nodes"
    );
    merged
}
