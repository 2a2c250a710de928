//! Tree handle and the copy-on-write insert/delete pipelines.
//!
//! Every mutation decodes existing pages into transient owned nodes, builds
//! replacements, allocates them as new pages, and releases the superseded
//! ids once the replacement content exists. The only cross-operation state
//! is the root page id.

use tracing::debug;

use crate::btree::merge::{self, Sibling};
use crate::btree::node::{Node, NodeKind, MAX_KEY_LEN, MAX_VAL_LEN};
use crate::btree::split::split_max_three;
use crate::store::PageStore;
use crate::types::{Error, PageId, Result};

/// B+ tree over a page store.
///
/// `root` is `None` for the logically empty tree (the on-page encoding
/// reserves id 0 for this). Callers persist the root id across operations;
/// everything else lives in the store.
pub struct BTree<S: PageStore> {
    store: S,
    root: Option<PageId>,
}

impl<S: PageStore> BTree<S> {
    /// Create a handle over an empty tree.
    pub fn new(store: S) -> Self {
        Self { store, root: None }
    }

    /// Open a handle positioned at a previously persisted root.
    pub fn open(store: S, root: Option<PageId>) -> Self {
        Self { store, root }
    }

    /// Current root page id; `None` while the tree is empty.
    pub fn root(&self) -> Option<PageId> {
        self.root
    }

    /// Shared access to the underlying page store.
    pub fn store(&self) -> &S {
        &self.store
    }

    /// Give the page store back, e.g. to reopen the tree later with the
    /// root id returned by [`BTree::root`].
    pub fn into_store(self) -> S {
        self.store
    }

    fn load(&self, id: PageId) -> Result<Node> {
        Node::decode(self.store.fetch(id)?)
    }

    /// Look up the value stored under `key`.
    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let Some(root) = self.root else {
            return Ok(None);
        };
        let mut node = self.load(root)?;
        loop {
            let idx = node.lookup_le(key);
            match node.kind() {
                NodeKind::Leaf => {
                    if node.nkeys() > 0 && node.key(idx) == key {
                        return Ok(Some(node.val(idx).to_vec()));
                    }
                    return Ok(None);
                }
                NodeKind::Internal => {
                    let child = node
                        .child(idx)
                        .ok_or(Error::Corruption("internal child pointer is zero"))?;
                    node = self.load(child)?;
                }
            }
        }
    }

    /// Insert `key` → `value`, overwriting any existing binding.
    pub fn insert(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        check_key(key)?;
        if value.len() > MAX_VAL_LEN {
            return Err(Error::Invalid("value exceeds maximum size"));
        }
        let Some(root) = self.root else {
            let mut leaf = Node::build(NodeKind::Leaf, 1);
            leaf.append_entry(0, None, key, value);
            self.root = Some(self.store.allocate(leaf.page()?)?);
            debug!("bootstrapped single-entry leaf root");
            return Ok(());
        };

        let root_node = self.load(root)?;
        let updated = self.insert_into(&root_node, key, value)?;
        let parts = split_max_three(updated);
        let new_root = if parts.len() == 1 {
            self.store.allocate(parts[0].page()?)?
        } else {
            // The root itself split: add one level above the parts.
            let mut grown = Node::build(NodeKind::Internal, parts.len() as u16);
            for (idx, part) in parts.iter().enumerate() {
                let id = self.store.allocate(part.page()?)?;
                grown.append_entry(idx as u16, Some(id), part.key(0), b"");
            }
            debug!(children = parts.len(), "root split; tree grew one level");
            self.store.allocate(grown.page()?)?
        };
        // Released last so a failed allocation leaves the retained root id
        // naming a live page.
        self.store.release(root)?;
        self.root = Some(new_root);
        Ok(())
    }

    fn insert_into(&mut self, node: &Node, key: &[u8], value: &[u8]) -> Result<Node> {
        let idx = node.lookup_le(key);
        match node.kind() {
            NodeKind::Leaf => Ok(leaf_insert(node, idx, key, value)),
            NodeKind::Internal => {
                let child_id = node
                    .child(idx)
                    .ok_or(Error::Corruption("internal child pointer is zero"))?;
                let child = self.load(child_id)?;
                let updated = self.insert_into(&child, key, value)?;

                let parts = split_max_three(updated);
                let nkeys = node.nkeys();
                let mut parent = Node::build(NodeKind::Internal, nkeys + parts.len() as u16 - 1);
                parent.append_range(node, 0, 0, idx);
                for (i, part) in parts.iter().enumerate() {
                    let id = self.store.allocate(part.page()?)?;
                    parent.append_entry(idx + i as u16, Some(id), part.key(0), b"");
                }
                parent.append_range(node, idx + parts.len() as u16, idx + 1, nkeys - idx - 1);
                self.store.release(child_id)?;
                Ok(parent)
            }
        }
    }

    /// Delete `key`. Returns `true` iff the key existed and was removed.
    pub fn delete(&mut self, key: &[u8]) -> Result<bool> {
        check_key(key)?;
        let Some(root) = self.root else {
            return Ok(false);
        };
        let root_node = self.load(root)?;
        let Some(updated) = self.delete_from(&root_node, key)? else {
            return Ok(false);
        };

        let new_root = if updated.kind() == NodeKind::Internal && updated.nkeys() == 1 {
            // A single-entry internal root adds nothing: adopt its child.
            debug!("root collapsed one level");
            Some(
                updated
                    .child(0)
                    .ok_or(Error::Corruption("internal child pointer is zero"))?,
            )
        } else if updated.nkeys() == 0 {
            debug!("tree drained to empty");
            None
        } else {
            Some(self.store.allocate(updated.page()?)?)
        };
        self.store.release(root)?;
        self.root = new_root;
        Ok(true)
    }

    fn delete_from(&mut self, node: &Node, key: &[u8]) -> Result<Option<Node>> {
        let idx = node.lookup_le(key);
        match node.kind() {
            NodeKind::Leaf => {
                if node.nkeys() == 0 || node.key(idx) != key {
                    return Ok(None);
                }
                let nkeys = node.nkeys();
                let mut updated = Node::build(NodeKind::Leaf, nkeys - 1);
                updated.append_range(node, 0, 0, idx);
                updated.append_range(node, idx, idx + 1, nkeys - idx - 1);
                Ok(Some(updated))
            }
            NodeKind::Internal => self.delete_child(node, idx, key),
        }
    }

    fn delete_child(&mut self, parent: &Node, idx: u16, key: &[u8]) -> Result<Option<Node>> {
        let child_id = parent
            .child(idx)
            .ok_or(Error::Corruption("internal child pointer is zero"))?;
        let child = self.load(child_id)?;
        let Some(updated) = self.delete_from(&child, key)? else {
            return Ok(None);
        };

        let nkeys = parent.nkeys();
        let rebuilt = match merge::sibling_for_merge(&self.store, parent, idx, &updated)? {
            Some((Sibling::Left, sibling)) => {
                let merged = merge::merge(&sibling, &updated);
                let merged_id = self.store.allocate(merged.page()?)?;
                let sibling_id = parent
                    .child(idx - 1)
                    .ok_or(Error::Corruption("internal child pointer is zero"))?;
                self.store.release(sibling_id)?;
                let mut rebuilt = Node::build(NodeKind::Internal, nkeys - 1);
                rebuilt.append_range(parent, 0, 0, idx - 1);
                rebuilt.append_entry(idx - 1, Some(merged_id), merged.key(0), b"");
                rebuilt.append_range(parent, idx, idx + 1, nkeys - idx - 1);
                rebuilt
            }
            Some((Sibling::Right, sibling)) => {
                let merged = merge::merge(&updated, &sibling);
                let merged_id = self.store.allocate(merged.page()?)?;
                let sibling_id = parent
                    .child(idx + 1)
                    .ok_or(Error::Corruption("internal child pointer is zero"))?;
                self.store.release(sibling_id)?;
                let mut rebuilt = Node::build(NodeKind::Internal, nkeys - 1);
                rebuilt.append_range(parent, 0, 0, idx);
                rebuilt.append_entry(idx, Some(merged_id), merged.key(0), b"");
                rebuilt.append_range(parent, idx + 1, idx + 2, nkeys - idx - 2);
                rebuilt
            }
            None if updated.nkeys() == 0 => {
                // An empty node merges into any sibling, so reaching here
                // means the parent has exactly this one child. The empty
                // child is discarded unallocated and the parent emptied.
                debug_assert!(nkeys == 1 && idx == 0);
                Node::build(NodeKind::Internal, 0)
            }
            None => {
                let updated_id = self.store.allocate(updated.page()?)?;
                let mut rebuilt = Node::build(NodeKind::Internal, nkeys);
                rebuilt.append_range(parent, 0, 0, idx);
                rebuilt.append_entry(idx, Some(updated_id), updated.key(0), b"");
                rebuilt.append_range(parent, idx + 1, idx + 1, nkeys - idx - 1);
                rebuilt
            }
        };
        self.store.release(child_id)?;
        Ok(Some(rebuilt))
    }
}

fn check_key(key: &[u8]) -> Result<()> {
    if key.is_empty() {
        return Err(Error::Invalid("empty key"));
    }
    if key.len() > MAX_KEY_LEN {
        return Err(Error::Invalid("key exceeds maximum size"));
    }
    Ok(())
}

/// Rebuild a leaf with `key`/`value` inserted or overwritten.
///
/// `idx` is the `lookup_le` result. Leaves carry no -infinity dummy entry,
/// so a key sorting before the whole leaf inserts at index 0 instead of
/// after the located index.
fn leaf_insert(leaf: &Node, idx: u16, key: &[u8], value: &[u8]) -> Node {
    let nkeys = leaf.nkeys();
    if leaf.key(idx) == key {
        let mut updated = Node::build(NodeKind::Leaf, nkeys);
        updated.append_range(leaf, 0, 0, idx);
        updated.append_entry(idx, None, key, value);
        updated.append_range(leaf, idx + 1, idx + 1, nkeys - idx - 1);
        return updated;
    }
    let at = if idx == 0 && key < leaf.key(0) {
        0
    } else {
        idx + 1
    };
    let mut updated = Node::build(NodeKind::Leaf, nkeys + 1);
    updated.append_range(leaf, 0, 0, at);
    updated.append_entry(at, None, key, value);
    updated.append_range(leaf, at + 1, at, nkeys - at);
    updated
}
