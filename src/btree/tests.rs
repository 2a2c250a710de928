use std::cell::Cell;
use std::collections::BTreeMap;

use proptest::prelude::*;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

use crate::btree::node::{Node, NodeKind, PAGE_SIZE};
use crate::btree::BTree;
use crate::store::{MemPageStore, PageStore};
use crate::types::{Error, PageId, Result};

#[derive(Default)]
struct TreeShape {
    internal_pages: usize,
    leaf_pages: usize,
    pairs: Vec<(Vec<u8>, Vec<u8>)>,
}

/// Walk every reachable page, asserting the per-node invariants along the
/// way: strict key order, encoded size within one page, and every internal
/// entry keyed by the smallest key reachable through its child.
fn check_tree(tree: &BTree<MemPageStore>) -> TreeShape {
    let mut shape = TreeShape::default();
    if let Some(root) = tree.root() {
        check_subtree(tree.store(), root, &mut shape);
    }
    for pair in shape.pairs.windows(2) {
        assert!(pair[0].0 < pair[1].0, "leaf keys out of order across pages");
    }
    shape
}

fn check_subtree(store: &MemPageStore, id: PageId, shape: &mut TreeShape) -> Vec<u8> {
    let node = Node::decode(store.fetch(id).expect("page reachable")).expect("page decodes");
    assert!(node.encoded_len() <= PAGE_SIZE, "committed node exceeds page");
    assert!(node.nkeys() >= 1, "committed node is empty");
    for idx in 1..node.nkeys() {
        assert!(node.key(idx - 1) < node.key(idx), "node keys out of order");
    }
    match node.kind() {
        NodeKind::Leaf => {
            shape.leaf_pages += 1;
            for idx in 0..node.nkeys() {
                shape
                    .pairs
                    .push((node.key(idx).to_vec(), node.val(idx).to_vec()));
            }
            node.key(0).to_vec()
        }
        NodeKind::Internal => {
            shape.internal_pages += 1;
            let mut first = Vec::new();
            for idx in 0..node.nkeys() {
                let child = node.child(idx).expect("non-zero child pointer");
                let child_min = check_subtree(store, child, shape);
                assert_eq!(
                    node.key(idx),
                    &child_min[..],
                    "internal entry key must equal child's smallest key"
                );
                if idx == 0 {
                    first = child_min;
                }
            }
            first
        }
    }
}

fn key_of(i: u32) -> Vec<u8> {
    format!("key-{i:05}").into_bytes()
}

fn val_of(i: u32, pad: usize) -> Vec<u8> {
    let mut val = format!("val-{i}-").into_bytes();
    val.resize(val.len() + pad, b'.');
    val
}

#[test]
fn insert_then_get_roundtrip() -> Result<()> {
    let mut tree = BTree::new(MemPageStore::new());
    for i in 0..64 {
        tree.insert(&key_of(i), &val_of(i, 10))?;
    }
    for i in 0..64 {
        assert_eq!(tree.get(&key_of(i))?, Some(val_of(i, 10)));
    }
    assert_eq!(tree.get(b"missing")?, None);
    check_tree(&tree);
    Ok(())
}

#[test]
fn overwrite_replaces_value_without_growing() -> Result<()> {
    let mut tree = BTree::new(MemPageStore::new());
    for i in 0..32 {
        tree.insert(&key_of(i), &val_of(i, 10))?;
    }
    let before = check_tree(&tree).pairs.len();
    tree.insert(&key_of(7), b"rewritten")?;
    let shape = check_tree(&tree);
    assert_eq!(shape.pairs.len(), before);
    assert_eq!(tree.get(&key_of(7))?.as_deref(), Some(&b"rewritten"[..]));
    Ok(())
}

#[test]
fn delete_present_and_absent() -> Result<()> {
    let mut tree = BTree::new(MemPageStore::new());
    tree.insert(b"alpha", b"1")?;
    tree.insert(b"beta", b"2")?;
    assert!(tree.delete(b"alpha")?);
    assert_eq!(tree.get(b"alpha")?, None);
    assert!(!tree.delete(b"alpha")?);
    assert!(!tree.delete(b"gamma")?);
    assert_eq!(tree.get(b"beta")?.as_deref(), Some(&b"2"[..]));
    Ok(())
}

#[test]
fn delete_on_empty_tree_is_false() -> Result<()> {
    let mut tree = BTree::new(MemPageStore::new());
    assert!(!tree.delete(b"anything")?);
    assert_eq!(tree.root(), None);
    Ok(())
}

#[test]
fn alphabet_scenario() -> Result<()> {
    let mut tree = BTree::new(MemPageStore::new());
    for letter in b'a'..=b'z' {
        tree.insert(&[letter], &[letter.to_ascii_uppercase()])?;
    }
    assert!(tree.delete(b"m")?);
    assert_eq!(tree.get(b"m")?, None);
    for letter in (b'a'..=b'z').filter(|&l| l != b'm') {
        assert_eq!(tree.get(&[letter])?, Some(vec![letter.to_ascii_uppercase()]));
    }
    check_tree(&tree);
    Ok(())
}

#[test]
fn max_sized_value_fits_without_split() -> Result<()> {
    let mut tree = BTree::new(MemPageStore::new());
    let value = vec![0xAB; 3000];
    tree.insert(b"big", &value)?;
    assert_eq!(tree.get(b"big")?, Some(value));
    // A single maximal entry always fits one page.
    assert_eq!(tree.store().live_pages(), 1);
    Ok(())
}

#[test]
fn key_smaller_than_every_stored_key_inserts_first() -> Result<()> {
    let mut tree = BTree::new(MemPageStore::new());
    tree.insert(b"mango", b"1")?;
    tree.insert(b"peach", b"2")?;
    tree.insert(b"apple", b"3")?;
    assert_eq!(tree.get(b"apple")?.as_deref(), Some(&b"3"[..]));
    let shape = check_tree(&tree);
    assert_eq!(shape.pairs[0].0, b"apple".to_vec());
    Ok(())
}

#[test]
fn multi_page_tree_keeps_invariants() -> Result<()> {
    let mut tree = BTree::new(MemPageStore::new());
    for i in 0..400 {
        tree.insert(&key_of(i), &val_of(i, 100))?;
    }
    let shape = check_tree(&tree);
    assert!(shape.leaf_pages > 1, "expected the tree to span pages");
    assert!(shape.internal_pages >= 1);
    assert_eq!(shape.pairs.len(), 400);
    for i in (0..400).step_by(37) {
        assert_eq!(tree.get(&key_of(i))?, Some(val_of(i, 100)));
    }
    Ok(())
}

#[test]
fn three_level_tree_resolves_lookups() -> Result<()> {
    let mut tree = BTree::new(MemPageStore::new());
    for i in 0..2000 {
        tree.insert(&key_of(i), &val_of(i, 450))?;
    }
    let shape = check_tree(&tree);
    assert!(
        shape.internal_pages > 1,
        "expected more than one internal page (got {})",
        shape.internal_pages
    );
    for i in (0..2000).step_by(113) {
        assert_eq!(tree.get(&key_of(i))?, Some(val_of(i, 450)));
    }
    Ok(())
}

#[test]
fn deletions_trigger_sibling_merge() -> Result<()> {
    let mut tree = BTree::new(MemPageStore::new());
    for i in 0..120 {
        tree.insert(&key_of(i), &val_of(i, 100))?;
    }
    let before = check_tree(&tree);
    assert!(before.leaf_pages >= 3);

    // Drain the low end of the key space until its leaf falls below the
    // low-water mark and is absorbed by a sibling.
    let mut removed = 0;
    for i in 0..40 {
        assert!(tree.delete(&key_of(i))?);
        removed += 1;
        let shape = check_tree(&tree);
        assert_eq!(shape.pairs.len(), 120 - removed);
        if shape.leaf_pages < before.leaf_pages {
            return Ok(());
        }
    }
    panic!("no merge observed after draining a leaf");
}

#[test]
fn insert_all_then_delete_all_returns_to_empty() -> Result<()> {
    let mut rng = ChaCha8Rng::seed_from_u64(0xBEEF);
    let mut tree = BTree::new(MemPageStore::new());
    let mut keys: Vec<u32> = (0..300).collect();
    for &i in &keys {
        tree.insert(&key_of(i), &val_of(i, 60))?;
    }
    keys.shuffle(&mut rng);
    for &i in &keys {
        assert!(tree.delete(&key_of(i))?, "key {i} should be present");
    }
    assert_eq!(tree.root(), None);
    assert_eq!(tree.store().live_pages(), 0, "all pages must be released");
    Ok(())
}

#[test]
fn randomized_ops_match_reference_model() -> Result<()> {
    let mut rng = ChaCha8Rng::seed_from_u64(42);
    let mut tree = BTree::new(MemPageStore::new());
    let mut model: BTreeMap<Vec<u8>, Vec<u8>> = BTreeMap::new();

    for step in 0..1500u32 {
        let k: u32 = rng.gen_range(0..250);
        let key = key_of(k);
        if rng.gen_bool(0.6) {
            let value = val_of(step, rng.gen_range(0..120));
            tree.insert(&key, &value)?;
            model.insert(key, value);
        } else {
            let expected = model.remove(&key).is_some();
            assert_eq!(tree.delete(&key)?, expected);
        }
        if step % 250 == 0 {
            let shape = check_tree(&tree);
            assert_eq!(shape.pairs.len(), model.len());
        }
    }

    let shape = check_tree(&tree);
    let expected: Vec<_> = model
        .iter()
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    assert_eq!(shape.pairs, expected);

    let keys: Vec<_> = model.keys().cloned().collect();
    for key in keys {
        assert!(tree.delete(&key)?);
    }
    assert_eq!(tree.root(), None);
    assert_eq!(tree.store().live_pages(), 0);
    Ok(())
}

/// Store whose next allocations can be made to fail, for exercising
/// mutation paths against a misbehaving backend.
struct FlakyStore {
    inner: MemPageStore,
    refusals: Cell<u32>,
}

impl FlakyStore {
    fn new() -> Self {
        Self {
            inner: MemPageStore::new(),
            refusals: Cell::new(0),
        }
    }

    fn refuse_next_allocations(&self, n: u32) {
        self.refusals.set(n);
    }
}

impl PageStore for FlakyStore {
    fn fetch(&self, id: PageId) -> crate::types::Result<Vec<u8>> {
        self.inner.fetch(id)
    }

    fn allocate(&mut self, page: &[u8]) -> crate::types::Result<PageId> {
        let left = self.refusals.get();
        if left > 0 {
            self.refusals.set(left - 1);
            return Err(Error::Store("allocation refused"));
        }
        self.inner.allocate(page)
    }

    fn release(&mut self, id: PageId) -> crate::types::Result<()> {
        self.inner.release(id)
    }
}

#[test]
fn failed_allocation_leaves_previous_root_readable() -> Result<()> {
    let mut tree = BTree::new(FlakyStore::new());
    tree.insert(b"stable", b"1")?;
    tree.insert(b"other", b"2")?;
    let root = tree.root().expect("root present");

    tree.store().refuse_next_allocations(1);
    assert!(matches!(tree.insert(b"third", b"3"), Err(Error::Store(_))));
    assert_eq!(tree.root(), Some(root));
    assert_eq!(tree.get(b"stable")?.as_deref(), Some(&b"1"[..]));
    assert_eq!(tree.get(b"other")?.as_deref(), Some(&b"2"[..]));

    tree.store().refuse_next_allocations(1);
    assert!(matches!(tree.delete(b"stable"), Err(Error::Store(_))));
    assert_eq!(tree.root(), Some(root));
    assert_eq!(tree.get(b"stable")?.as_deref(), Some(&b"1"[..]));
    Ok(())
}

#[test]
fn rejects_constraint_violations() {
    let mut tree = BTree::new(MemPageStore::new());
    assert!(matches!(tree.insert(b"", b"v"), Err(Error::Invalid(_))));
    assert!(matches!(
        tree.insert(&vec![b'k'; 1001], b"v"),
        Err(Error::Invalid(_))
    ));
    assert!(matches!(
        tree.insert(b"k", &vec![b'v'; 3001]),
        Err(Error::Invalid(_))
    ));
    assert!(matches!(tree.delete(b""), Err(Error::Invalid(_))));
    assert!(matches!(
        tree.delete(&vec![b'k'; 1001]),
        Err(Error::Invalid(_))
    ));
    // Nothing was mutated by any rejected call.
    assert_eq!(tree.root(), None);
    assert_eq!(tree.store().live_pages(), 0);
}

#[test]
fn boundary_sizes_are_accepted() -> Result<()> {
    let mut tree = BTree::new(MemPageStore::new());
    tree.insert(&vec![b'k'; 1000], &vec![b'v'; 3000])?;
    assert_eq!(tree.get(&vec![b'k'; 1000])?, Some(vec![b'v'; 3000]));
    check_tree(&tree);
    Ok(())
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn prop_tree_matches_btreemap(ops in proptest::collection::vec((0u32..60, any::<bool>(), 0usize..80), 1..160)) {
        let mut tree = BTree::new(MemPageStore::new());
        let mut model: BTreeMap<Vec<u8>, Vec<u8>> = BTreeMap::new();
        for (k, is_insert, pad) in ops {
            let key = key_of(k);
            if is_insert {
                let value = val_of(k, pad);
                tree.insert(&key, &value).unwrap();
                model.insert(key, value);
            } else {
                let expected = model.remove(&key).is_some();
                prop_assert_eq!(tree.delete(&key).unwrap(), expected);
            }
        }
        let shape = check_tree(&tree);
        let expected: Vec<_> = model.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
        prop_assert_eq!(shape.pairs, expected);
        for k in 0..60u32 {
            prop_assert_eq!(tree.get(&key_of(k)).unwrap(), model.get(&key_of(k)).cloned());
        }
    }
}
