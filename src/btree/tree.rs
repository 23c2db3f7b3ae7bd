//! # Copy-on-Write B+ Tree
//!
//! Mutations never touch existing pages. Inserting or deleting produces a
//! fresh copy of every node along the root-to-leaf path; the replaced pages
//! are handed to the free-list and the new pages are staged in the store.
//! The caller publishes the returned root, so until the pager flushes and
//! the master page is rewritten, the previous tree remains intact on disk.
//!
//! Slot 0 of every node is the sentinel for its subtree: the smallest key
//! reachable below it. The root created by the first insert carries an
//! empty sentinel key, which makes `find_le` total: any lookup key has a
//! slot at or below it.
//!
//! An insert builds the replacement node in a double-page scratch buffer
//! and then splits it into one, two, or three pages. Three are needed when
//! a single oversized pair straddles the balance point: the first pass
//! guarantees only the right half fits, so a too-big left half is split
//! once more, isolating the offending pair in the middle. A third failure
//! is impossible for inputs within the key/value size bounds and panics.
//!
//! A delete may leave a node under a quarter page; it is then merged into
//! a sibling when the combined size fits a page. When the root ends up as
//! an internal node with a single child, the child is promoted.

use eyre::{ensure, Result};
use smallvec::{smallvec, SmallVec};

use crate::config::{
    KEY_LEN_SIZE, MAX_KEY_SIZE, MAX_VALUE_SIZE, NODE_HEADER_SIZE, OFFSET_SIZE, PAGE_SIZE,
    POINTER_SIZE, VAL_LEN_SIZE,
};
use crate::storage::PageStore;

use super::node::{NodeBuf, NodeRef, NodeType};

/// 1..3 page-sized fragments of a split.
type Split = SmallVec<[NodeBuf; 3]>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Merge {
    None,
    Left,
    Right,
}

/// Point lookup. Returns a slice borrowed from the store, valid while the
/// store is not mutated.
pub fn lookup<'a, S: PageStore>(store: &'a S, root: u64, key: &[u8]) -> Result<Option<&'a [u8]>> {
    if root == 0 || key.is_empty() || key.len() > MAX_KEY_SIZE {
        return Ok(None);
    }
    let mut id = root;
    loop {
        let node = NodeRef::new(store.load(id)?);
        let idx = node.find_le(key);
        match node.node_type() {
            NodeType::Leaf => {
                return Ok((node.key(idx) == key).then(|| node.value(idx)));
            }
            NodeType::Internal => id = node.ptr(idx),
        }
    }
}

/// Mutating handle over a tree rooted in a page store. The caller reads the
/// (possibly changed) root back through [`BTree::root`] after a mutation.
pub struct BTree<'s, S: PageStore> {
    store: &'s mut S,
    root: u64,
}

impl<'s, S: PageStore> BTree<'s, S> {
    pub fn new(store: &'s mut S, root: u64) -> Self {
        Self { store, root }
    }

    pub fn root(&self) -> u64 {
        self.root
    }

    /// Insert or overwrite a key.
    pub fn insert(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        ensure!(!key.is_empty(), "key is empty");
        ensure!(
            key.len() <= MAX_KEY_SIZE,
            "key size {} exceeds maximum {}",
            key.len(),
            MAX_KEY_SIZE
        );
        ensure!(
            value.len() <= MAX_VALUE_SIZE,
            "value size {} exceeds maximum {}",
            value.len(),
            MAX_VALUE_SIZE
        );

        let node = if self.root == 0 {
            // First insert: the sentinel makes the leaf cover the whole key
            // space, so descents never fall off the left edge. A maximal
            // pair next to the sentinel can exceed one page, so even this
            // leaf goes through the split below.
            let mut node = NodeBuf::scratch();
            node.set_header(NodeType::Leaf, 2);
            node.write_slot(0, 0, b"", b"");
            node.write_slot(1, 0, key, value);
            node
        } else {
            let node = self.load_owned(self.root)?;
            self.store.free(self.root)?;
            self.insert_into(node, key, value)?
        };
        let pieces = split(node);

        if pieces.len() == 1 {
            let page = pieces.into_iter().next().unwrap().into_page();
            self.root = self.store.allocate(page)?;
        } else {
            // The root split: add a level referencing each fragment by its
            // first key.
            let mut root = NodeBuf::page();
            root.set_header(NodeType::Internal, pieces.len());
            for (i, piece) in pieces.into_iter().enumerate() {
                let first = piece.as_node().key(0).to_vec();
                let id = self.store.allocate(piece.into_page())?;
                root.write_slot(i, id, &first, b"");
            }
            self.root = self.store.allocate(root.into_page())?;
        }
        Ok(())
    }

    /// Delete a key. Returns whether it was present.
    pub fn delete(&mut self, key: &[u8]) -> Result<bool> {
        ensure!(!key.is_empty(), "key is empty");
        ensure!(
            key.len() <= MAX_KEY_SIZE,
            "key size {} exceeds maximum {}",
            key.len(),
            MAX_KEY_SIZE
        );

        if self.root == 0 {
            return Ok(false);
        }

        let root = self.load_owned(self.root)?;
        let Some(updated) = self.delete_from(root, key)? else {
            return Ok(false);
        };
        self.store.free(self.root)?;

        let view = updated.as_node();
        if view.node_type() == NodeType::Internal && view.nkeys() == 1 {
            // The root is down to one child: drop a level.
            self.root = view.ptr(0);
        } else {
            self.root = self.store.allocate(updated.into_page())?;
        }
        Ok(true)
    }

    fn load_owned(&self, id: u64) -> Result<NodeBuf> {
        Ok(NodeBuf::from_slice(self.store.load(id)?))
    }

    fn insert_into(&mut self, node: NodeBuf, key: &[u8], value: &[u8]) -> Result<NodeBuf> {
        let mut new = NodeBuf::scratch();
        let src = node.as_node();
        let idx = src.find_le(key);

        match src.node_type() {
            NodeType::Leaf => {
                if src.key(idx) == key {
                    // Overwrite in place of slot idx.
                    new.set_header(NodeType::Leaf, src.nkeys());
                    new.copy_range(src, 0, 0, idx);
                    new.write_slot(idx, 0, key, value);
                    new.copy_range(src, idx + 1, idx + 1, src.nkeys() - idx - 1);
                } else {
                    // Insert after idx.
                    new.set_header(NodeType::Leaf, src.nkeys() + 1);
                    new.copy_range(src, 0, 0, idx + 1);
                    new.write_slot(idx + 1, 0, key, value);
                    new.copy_range(src, idx + 2, idx + 1, src.nkeys() - idx - 1);
                }
                Ok(new)
            }
            NodeType::Internal => {
                let child_ptr = src.ptr(idx);
                let child = self.load_owned(child_ptr)?;
                self.store.free(child_ptr)?;
                let child = self.insert_into(child, key, value)?;
                let pieces = split(child);
                self.replace_children(&mut new, node.as_node(), idx, idx + 1, pieces)?;
                Ok(new)
            }
        }
    }

    fn delete_from(&mut self, node: NodeBuf, key: &[u8]) -> Result<Option<NodeBuf>> {
        let src = node.as_node();
        let idx = src.find_le(key);

        match src.node_type() {
            NodeType::Leaf => {
                if src.key(idx) != key {
                    return Ok(None);
                }
                let mut new = NodeBuf::page();
                new.set_header(NodeType::Leaf, src.nkeys() - 1);
                new.copy_range(src, 0, 0, idx);
                new.copy_range(src, idx, idx + 1, src.nkeys() - idx - 1);
                Ok(Some(new))
            }
            NodeType::Internal => {
                let child_ptr = src.ptr(idx);
                let child = self.load_owned(child_ptr)?;
                let Some(updated) = self.delete_from(child, key)? else {
                    return Ok(None);
                };
                self.store.free(child_ptr)?;

                let mut new = NodeBuf::page();
                match self.should_merge(node.as_node(), idx, updated.as_node())? {
                    Merge::Left => {
                        let sibling_ptr = node.as_node().ptr(idx - 1);
                        let sibling = self.load_owned(sibling_ptr)?;
                        let merged = merge_nodes(sibling.as_node(), updated.as_node());
                        self.store.free(sibling_ptr)?;
                        self.replace_children(
                            &mut new,
                            node.as_node(),
                            idx - 1,
                            idx + 1,
                            smallvec![merged],
                        )?;
                    }
                    Merge::Right => {
                        let sibling_ptr = node.as_node().ptr(idx + 1);
                        let sibling = self.load_owned(sibling_ptr)?;
                        let merged = merge_nodes(updated.as_node(), sibling.as_node());
                        self.store.free(sibling_ptr)?;
                        self.replace_children(
                            &mut new,
                            node.as_node(),
                            idx,
                            idx + 2,
                            smallvec![merged],
                        )?;
                    }
                    Merge::None => {
                        self.replace_children(
                            &mut new,
                            node.as_node(),
                            idx,
                            idx + 1,
                            smallvec![updated],
                        )?;
                    }
                }
                Ok(Some(new))
            }
        }
    }

    /// Rebuild `old` into `new` with slots `[start, end)` replaced by one
    /// slot per piece, each pointing at the freshly allocated piece and
    /// keyed by its first key. Covers the insert case (one slot becomes up
    /// to three) and the merge case (two slots become one).
    fn replace_children(
        &mut self,
        new: &mut NodeBuf,
        old: NodeRef<'_>,
        start: usize,
        end: usize,
        pieces: Split,
    ) -> Result<()> {
        new.set_header(NodeType::Internal, old.nkeys() + pieces.len() - (end - start));
        new.copy_range(old, 0, 0, start);
        let mut slot = start;
        for piece in pieces {
            let first = piece.as_node().key(0).to_vec();
            let id = self.store.allocate(piece.into_page())?;
            new.write_slot(slot, id, &first, b"");
            slot += 1;
        }
        new.copy_range(old, slot, end, old.nkeys() - end);
        Ok(())
    }

    fn should_merge(&self, parent: NodeRef<'_>, idx: usize, child: NodeRef<'_>) -> Result<Merge> {
        if child.size() > PAGE_SIZE / 4 {
            return Ok(Merge::None);
        }
        if idx > 0 {
            let sibling = NodeRef::new(self.store.load(parent.ptr(idx - 1))?);
            if sibling.size() + child.size() - NODE_HEADER_SIZE <= PAGE_SIZE {
                return Ok(Merge::Left);
            }
        }
        if idx + 1 < parent.nkeys() {
            let sibling = NodeRef::new(self.store.load(parent.ptr(idx + 1))?);
            if sibling.size() + child.size() - NODE_HEADER_SIZE <= PAGE_SIZE {
                return Ok(Merge::Right);
            }
        }
        Ok(Merge::None)
    }
}

fn merge_nodes(left: NodeRef<'_>, right: NodeRef<'_>) -> NodeBuf {
    let mut new = NodeBuf::page();
    new.set_header(left.node_type(), left.nkeys() + right.nkeys());
    new.copy_range(left, 0, 0, left.nkeys());
    new.copy_range(right, left.nkeys(), 0, right.nkeys());
    new
}

/// Split an oversized copy-on-write result into 1..3 page-sized pieces.
fn split(node: NodeBuf) -> Split {
    if node.size() <= PAGE_SIZE {
        return smallvec![node];
    }

    let (left, right) = split_left_right(node.as_node());
    if left.size() <= PAGE_SIZE {
        return smallvec![left, right];
    }

    // One oversized pair straddled the balance point; isolate it.
    let (left_left, middle) = split_left_right(left.as_node());
    assert!(
        left_left.size() <= PAGE_SIZE,
        "node still exceeds page size after a three-way split"
    );
    smallvec![left_left, middle, right]
}

/// Split a node into a left and right part without reordering slots. Walks
/// the slots from the high end accumulating the right-hand size; the right
/// part is guaranteed to fit a page, the left part may not (one huge slot
/// can be stranded there). Slot 0 always stays on the left.
fn split_left_right(src: NodeRef<'_>) -> (NodeBuf, NodeBuf) {
    let nkeys = src.nkeys();
    let mut right_size = NODE_HEADER_SIZE;
    let mut right_idx = nkeys;
    for i in (1..nkeys).rev() {
        let extra = POINTER_SIZE
            + OFFSET_SIZE
            + KEY_LEN_SIZE
            + VAL_LEN_SIZE
            + src.key(i).len()
            + src.value(i).len();
        if right_size + extra > PAGE_SIZE {
            break;
        }
        right_size += extra;
        right_idx = i;
    }
    assert!(right_idx < nkeys, "split produced an empty right fragment");

    let mut left = NodeBuf::scratch();
    left.set_header(src.node_type(), right_idx);
    left.copy_range(src, 0, 0, right_idx);

    let mut right = NodeBuf::page();
    right.set_header(src.node_type(), nkeys - right_idx);
    right.copy_range(src, 0, right_idx, nkeys - right_idx);

    (left, right)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemPageStore;

    fn collect(store: &MemPageStore, root: u64) -> Vec<(Vec<u8>, Vec<u8>)> {
        let mut out = Vec::new();
        walk(store, root, &mut out);
        out
    }

    fn walk(store: &MemPageStore, id: u64, out: &mut Vec<(Vec<u8>, Vec<u8>)>) {
        if id == 0 {
            return;
        }
        let node = NodeRef::new(store.load(id).unwrap());
        for i in 0..node.nkeys() {
            match node.node_type() {
                NodeType::Internal => walk(store, node.ptr(i), out),
                NodeType::Leaf => {
                    if !node.key(i).is_empty() {
                        out.push((node.key(i).to_vec(), node.value(i).to_vec()));
                    }
                }
            }
        }
    }

    /// Walk the tree checking the structural invariants: every node fits a
    /// page, keys are non-decreasing, and each internal slot key equals the
    /// first key of its child.
    fn check_invariants(store: &MemPageStore, id: u64) {
        if id == 0 {
            return;
        }
        let node = NodeRef::new(store.load(id).unwrap());
        assert!(node.size() <= PAGE_SIZE, "node {id} overflows a page");
        assert!(node.nkeys() >= 1, "node {id} has no slots");
        for i in 1..node.nkeys() {
            assert!(node.key(i - 1) <= node.key(i), "keys out of order in {id}");
        }
        if node.node_type() == NodeType::Internal {
            for i in 0..node.nkeys() {
                let child = NodeRef::new(store.load(node.ptr(i)).unwrap());
                assert_eq!(
                    node.key(i),
                    child.key(0),
                    "separator of node {id} diverges from child sentinel"
                );
                check_invariants(store, node.ptr(i));
            }
        }
    }

    fn tree_set(store: &mut MemPageStore, root: u64, key: &[u8], value: &[u8]) -> u64 {
        let mut tree = BTree::new(store, root);
        tree.insert(key, value).unwrap();
        tree.root()
    }

    fn tree_del(store: &mut MemPageStore, root: u64, key: &[u8]) -> (u64, bool) {
        let mut tree = BTree::new(store, root);
        let deleted = tree.delete(key).unwrap();
        (tree.root(), deleted)
    }

    #[test]
    fn first_insert_creates_a_sentinel_leaf() {
        let mut store = MemPageStore::new();
        let root = tree_set(&mut store, 0, b"hello", b"world");

        let node = NodeRef::new(store.load(root).unwrap());
        assert_eq!(node.node_type(), NodeType::Leaf);
        assert_eq!(node.nkeys(), 2);
        assert_eq!(node.key(0), b"");
        assert_eq!(node.key(1), b"hello");
        assert_eq!(node.value(1), b"world");
    }

    #[test]
    fn lookup_on_empty_tree_finds_nothing() {
        let store = MemPageStore::new();
        assert!(lookup(&store, 0, b"missing").unwrap().is_none());
    }

    #[test]
    fn insert_then_lookup_many_keys() {
        let mut store = MemPageStore::new();
        let mut root = 0;
        for i in 0..200u32 {
            let key = format!("key{i:05}");
            let value = format!("value{i:05}");
            root = tree_set(&mut store, root, key.as_bytes(), value.as_bytes());
        }

        check_invariants(&store, root);
        for i in 0..200u32 {
            let key = format!("key{i:05}");
            let expected = format!("value{i:05}");
            assert_eq!(
                lookup(&store, root, key.as_bytes()).unwrap(),
                Some(expected.as_bytes()),
                "missing {key}"
            );
        }
        assert!(lookup(&store, root, b"key99999").unwrap().is_none());
    }

    #[test]
    fn reverse_order_inserts_stay_sorted() {
        let mut store = MemPageStore::new();
        let mut root = 0;
        for i in (0..200u32).rev() {
            let key = format!("key{i:05}");
            root = tree_set(&mut store, root, key.as_bytes(), b"v");
        }

        check_invariants(&store, root);
        let pairs = collect(&store, root);
        assert_eq!(pairs.len(), 200);
        let mut sorted = pairs.clone();
        sorted.sort();
        assert_eq!(pairs, sorted);
    }

    #[test]
    fn overwrite_replaces_the_value() {
        let mut store = MemPageStore::new();
        let mut root = tree_set(&mut store, 0, b"ab", b"one");
        root = tree_set(&mut store, root, b"cd", b"two");
        root = tree_set(&mut store, root, b"ab", b"ONE");

        assert_eq!(lookup(&store, root, b"ab").unwrap(), Some(&b"ONE"[..]));
        assert_eq!(lookup(&store, root, b"cd").unwrap(), Some(&b"two"[..]));
        assert_eq!(collect(&store, root).len(), 2);
    }

    #[test]
    fn empty_key_is_rejected() {
        let mut store = MemPageStore::new();
        let mut tree = BTree::new(&mut store, 0);
        assert!(tree.insert(b"", b"v").is_err());
        assert!(tree.delete(b"").is_err());
    }

    #[test]
    fn oversize_key_and_value_are_rejected() {
        let mut store = MemPageStore::new();
        let mut tree = BTree::new(&mut store, 0);
        assert!(tree.insert(&vec![b'k'; MAX_KEY_SIZE + 1], b"v").is_err());
        assert!(tree.insert(b"k", &vec![b'v'; MAX_VALUE_SIZE + 1]).is_err());
    }

    #[test]
    fn delete_returns_false_for_missing_keys() {
        let mut store = MemPageStore::new();
        let root = tree_set(&mut store, 0, b"present", b"v");

        let (root, deleted) = tree_del(&mut store, root, b"absent");
        assert!(!deleted);
        let (_, deleted_again) = tree_del(&mut store, root, b"absent");
        assert!(!deleted_again);
    }

    #[test]
    fn delete_is_idempotent_beyond_the_first() {
        let mut store = MemPageStore::new();
        let mut root = tree_set(&mut store, 0, b"a", b"1");
        root = tree_set(&mut store, root, b"b", b"2");

        let (root, first) = tree_del(&mut store, root, b"a");
        assert!(first);
        let (root, second) = tree_del(&mut store, root, b"a");
        assert!(!second);
        assert!(lookup(&store, root, b"a").unwrap().is_none());
        assert_eq!(lookup(&store, root, b"b").unwrap(), Some(&b"2"[..]));
    }

    #[test]
    fn interleaved_inserts_and_deletes_keep_invariants() {
        let mut store = MemPageStore::new();
        let mut root = 0;
        for i in 0..300u32 {
            let key = format!("k{i:05}");
            root = tree_set(&mut store, root, key.as_bytes(), b"value");
        }
        for i in (0..300u32).step_by(2) {
            let key = format!("k{i:05}");
            let (new_root, deleted) = tree_del(&mut store, root, key.as_bytes());
            assert!(deleted, "failed to delete {key}");
            root = new_root;
        }

        check_invariants(&store, root);
        for i in 0..300u32 {
            let key = format!("k{i:05}");
            let found = lookup(&store, root, key.as_bytes()).unwrap();
            assert_eq!(found.is_some(), i % 2 == 1, "wrong presence for {key}");
        }
    }

    #[test]
    fn large_pairs_split_the_root_into_three_leaves() {
        // No two of these pairs fit one page together, so the second
        // insert splits the root leaf and the third splits again, leaving
        // one internal root over three leaves.
        let mut store = MemPageStore::new();
        let mut root = tree_set(&mut store, 0, b"k1", &vec![1u8; 2500]);
        root = tree_set(&mut store, root, b"k2", &vec![2u8; 2500]);
        root = tree_set(&mut store, root, b"k3", &vec![3u8; 2000]);

        check_invariants(&store, root);
        let node = NodeRef::new(store.load(root).unwrap());
        assert_eq!(node.node_type(), NodeType::Internal);
        assert_eq!(node.nkeys(), 3);

        let pairs = collect(&store, root);
        assert_eq!(
            pairs.iter().map(|(k, _)| k.clone()).collect::<Vec<_>>(),
            vec![b"k1".to_vec(), b"k2".to_vec(), b"k3".to_vec()]
        );
        assert_eq!(lookup(&store, root, b"k2").unwrap(), Some(&vec![2u8; 2500][..]));
    }

    #[test]
    fn oversized_insert_result_always_splits_within_bounds() {
        // Maximal pairs force repeated splits; every stored node must stay
        // within the page bound, which check_invariants asserts.
        let mut store = MemPageStore::new();
        let mut root = 0;
        for i in 0..8u8 {
            let key = vec![b'a' + i; MAX_KEY_SIZE];
            let value = vec![i; MAX_VALUE_SIZE];
            root = tree_set(&mut store, root, &key, &value);
        }

        check_invariants(&store, root);
        assert_eq!(collect(&store, root).len(), 8);
    }

    #[test]
    fn deleting_down_to_one_child_collapses_the_root() {
        // Two fat pairs force a split into two leaves; deleting one key
        // merges and promotes the remaining leaf back to the root.
        let mut store = MemPageStore::new();
        let mut root = tree_set(&mut store, 0, b"k1", &vec![1u8; 2500]);
        root = tree_set(&mut store, root, b"k2", &vec![2u8; 2500]);

        let split_root = NodeRef::new(store.load(root).unwrap());
        assert_eq!(split_root.node_type(), NodeType::Internal);
        let old_root = root;
        let old_children: Vec<u64> = (0..split_root.nkeys()).map(|i| split_root.ptr(i)).collect();

        let (root, deleted) = tree_del(&mut store, root, b"k2");
        assert!(deleted);

        let node = NodeRef::new(store.load(root).unwrap());
        assert_eq!(node.node_type(), NodeType::Leaf);
        assert_eq!(lookup(&store, root, b"k1").unwrap(), Some(&vec![1u8; 2500][..]));
        assert!(lookup(&store, root, b"k2").unwrap().is_none());

        // The old root and both old children were released; the survivor
        // is a fresh merged page.
        assert!(store.freed().contains(&old_root));
        for child in old_children {
            assert!(store.freed().contains(&child));
        }
    }

    #[test]
    fn deleting_everything_returns_to_a_sentinel_leaf() {
        let mut store = MemPageStore::new();
        let mut root = 0;
        for i in 0..40u32 {
            let key = format!("k{i:03}");
            root = tree_set(&mut store, root, key.as_bytes(), &vec![0u8; 200]);
        }
        let before = NodeRef::new(store.load(root).unwrap());
        assert_eq!(before.node_type(), NodeType::Internal);

        for i in 0..40u32 {
            let key = format!("k{i:03}");
            let (new_root, deleted) = tree_del(&mut store, root, key.as_bytes());
            assert!(deleted);
            root = new_root;
            check_invariants(&store, root);
        }

        // Everything deleted: back to a single leaf holding the sentinel.
        let node = NodeRef::new(store.load(root).unwrap());
        assert_eq!(node.node_type(), NodeType::Leaf);
        assert_eq!(node.nkeys(), 1);
        assert_eq!(node.key(0), b"");
    }

    #[test]
    fn copy_on_write_frees_the_replaced_path() {
        let mut store = MemPageStore::new();
        let root = tree_set(&mut store, 0, b"a", b"1");
        assert!(store.freed().is_empty());

        let new_root = tree_set(&mut store, root, b"b", b"2");
        assert_ne!(root, new_root);
        assert_eq!(store.freed(), &[root]);
    }
}
