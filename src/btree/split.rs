//! Split engine: turn an over-capacity node into 1–3 nodes that each fit
//! one page.

use smallvec::{smallvec, SmallVec};
use tracing::trace;

use crate::btree::node::{Node, PAGE_SIZE};

/// In-order result of a split; at most three nodes.
pub(crate) type SplitParts = SmallVec<[Node; 3]>;

/// Split `old` at a boundary chosen so the right half is guaranteed to fit
/// one page. The left half usually fits as well; a single large entry can
/// force it transiently over capacity, which [`split_max_three`] resolves
/// with one more pass.
fn split_two(old: &Node) -> (Node, Node) {
    let nkeys = old.nkeys();
    debug_assert!(nkeys >= 2, "oversized node must hold at least two entries");
    let mut nleft = nkeys / 2;
    while nleft > 1 && old.range_len(0, nleft) > PAGE_SIZE {
        nleft -= 1;
    }
    while nleft + 1 < nkeys && old.range_len(nleft, nkeys) > PAGE_SIZE {
        nleft += 1;
    }

    let mut left = Node::build(old.kind(), nleft);
    left.append_range(old, 0, 0, nleft);
    let mut right = Node::build(old.kind(), nkeys - nleft);
    right.append_range(old, 0, nleft, nkeys - nleft);
    debug_assert!(right.encoded_len() <= PAGE_SIZE);
    (left, right)
}

/// Split `old` into at most three capacity-respecting nodes.
///
/// A node that already fits passes through unchanged; otherwise it is split
/// in two, and an oversized left half is split once more. The concatenated
/// key ranges of the result reproduce the input's key range in order.
pub(crate) fn split_max_three(old: Node) -> SplitParts {
    if old.encoded_len() <= PAGE_SIZE {
        return smallvec![old];
    }
    let (left, right) = split_two(&old);
    if left.encoded_len() <= PAGE_SIZE {
        trace!(left = left.nkeys(), right = right.nkeys(), "split node in two");
        return smallvec![left, right];
    }
    // One entry always fits a page, so re-splitting the left half converges.
    let (first, second) = split_two(&left);
    debug_assert!(first.encoded_len() <= PAGE_SIZE);
    debug_assert!(second.encoded_len() <= PAGE_SIZE);
    trace!(
        first = first.nkeys(),
        second = second.nkeys(),
        third = right.nkeys(),
        "split node in three"
    );
    smallvec![first, second, right]
}
