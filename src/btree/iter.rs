//! Ordered iteration over the tree.
//!
//! An iterator is a stack of `(node, slot)` frames from the root down to a
//! leaf, holding page views borrowed from the store; since the store is
//! borrowed shared for the iterator's lifetime, no flush can invalidate the
//! frames. Advancing within a leaf bumps the top index; at a node edge the
//! stack is popped to the deepest frame that can advance and the walk
//! descends the edge-most path back to a leaf.
//!
//! The root sentinel (the empty key in the leftmost leaf) is not a value:
//! [`TreeIter::current`] returns `None` on it, and moving backwards onto it
//! ends the iteration.

use eyre::Result;

use crate::storage::PageStore;

use super::node::{NodeRef, NodeType};

/// Comparison for [`TreeIter::seek`]: position on the first entry whose key
/// relates to the seek key this way.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cmp {
    Lt,
    Le,
    Ge,
    Gt,
}

impl Cmp {
    fn forward(self) -> bool {
        matches!(self, Cmp::Ge | Cmp::Gt)
    }

    fn ok(self, key: &[u8], target: &[u8]) -> bool {
        match self {
            Cmp::Ge => key >= target,
            Cmp::Gt => key > target,
            Cmp::Lt => key < target,
            Cmp::Le => key <= target,
        }
    }
}

struct Frame<'a> {
    node: NodeRef<'a>,
    idx: usize,
}

pub struct TreeIter<'a, S: PageStore> {
    store: &'a S,
    stack: Vec<Frame<'a>>,
}

impl<'a, S: PageStore> TreeIter<'a, S> {
    /// Descend to the greatest entry with key `<=` the given key. With the
    /// sentinel covering the low end of the key space, the descent always
    /// lands somewhere; on a key below every stored key it lands on the
    /// sentinel itself.
    pub fn seek_le(store: &'a S, root: u64, key: &[u8]) -> Result<Self> {
        let mut iter = Self {
            store,
            stack: Vec::new(),
        };
        let mut id = root;
        while id != 0 {
            let node = NodeRef::new(store.load(id)?);
            let idx = node.find_le(key);
            id = match node.node_type() {
                NodeType::Internal => node.ptr(idx),
                NodeType::Leaf => 0,
            };
            iter.stack.push(Frame { node, idx });
        }
        Ok(iter)
    }

    /// Position on the first entry satisfying `cmp` relative to `key`, or
    /// past the end when none does.
    pub fn seek(store: &'a S, root: u64, key: &[u8], cmp: Cmp) -> Result<Self> {
        let mut iter = Self::seek_le(store, root, key)?;
        if cmp == Cmp::Le || iter.stack.is_empty() {
            return Ok(iter);
        }
        if cmp.forward() && iter.at_sentinel() {
            iter.next()?;
        }
        if let Some((found, _)) = iter.current() {
            if !cmp.ok(found, key) {
                if cmp.forward() {
                    iter.next()?;
                } else {
                    iter.prev()?;
                }
            }
        }
        Ok(iter)
    }

    fn is_valid(&self) -> bool {
        self.stack.last().is_some_and(|frame| {
            frame.node.node_type() == NodeType::Leaf && frame.idx < frame.node.nkeys()
        })
    }

    fn at_sentinel(&self) -> bool {
        self.is_valid() && {
            let frame = self.stack.last().unwrap();
            frame.node.key(frame.idx).is_empty()
        }
    }

    /// The entry under the cursor, or `None` when the iterator is past
    /// either end or parked on the sentinel.
    pub fn current(&self) -> Option<(&'a [u8], &'a [u8])> {
        let frame = self.stack.last()?;
        if frame.node.node_type() != NodeType::Leaf || frame.idx >= frame.node.nkeys() {
            return None;
        }
        let key = frame.node.key(frame.idx);
        if key.is_empty() {
            return None;
        }
        Some((key, frame.node.value(frame.idx)))
    }

    /// Advance to the next entry. Returns `false` (and invalidates the
    /// iterator) when there is none.
    pub fn next(&mut self) -> Result<bool> {
        if !self.is_valid() {
            return Ok(false);
        }

        {
            let top = self.stack.last_mut().unwrap();
            if top.idx + 1 < top.node.nkeys() {
                top.idx += 1;
                return Ok(true);
            }
        }

        // Pop to the deepest frame with a right neighbour.
        let mut keep = self.stack.len();
        while keep > 0 {
            let frame = &self.stack[keep - 1];
            if frame.idx + 1 < frame.node.nkeys() {
                break;
            }
            keep -= 1;
        }
        if keep == 0 {
            self.stack.clear();
            return Ok(false);
        }
        self.stack.truncate(keep);
        self.stack.last_mut().unwrap().idx += 1;

        self.descend(|_| 0)?;
        Ok(true)
    }

    /// Step back to the previous entry. Returns `false` (and invalidates
    /// the iterator) when the sentinel is reached.
    pub fn prev(&mut self) -> Result<bool> {
        if !self.is_valid() {
            return Ok(false);
        }

        {
            let top = self.stack.last_mut().unwrap();
            if top.idx > 0 {
                top.idx -= 1;
                if top.node.key(top.idx).is_empty() {
                    self.stack.clear();
                    return Ok(false);
                }
                return Ok(true);
            }
        }

        // Pop to the deepest frame with a left neighbour.
        let mut keep = self.stack.len();
        while keep > 0 && self.stack[keep - 1].idx == 0 {
            keep -= 1;
        }
        if keep == 0 {
            self.stack.clear();
            return Ok(false);
        }
        self.stack.truncate(keep);
        self.stack.last_mut().unwrap().idx -= 1;

        self.descend(|node| node.nkeys() - 1)?;

        let top = self.stack.last().unwrap();
        if top.node.key(top.idx).is_empty() {
            self.stack.clear();
            return Ok(false);
        }
        Ok(true)
    }

    /// Walk from the top frame down to a leaf, choosing the slot given by
    /// `pick` at each internal level.
    fn descend(&mut self, pick: impl Fn(NodeRef<'a>) -> usize) -> Result<()> {
        let store = self.store;
        loop {
            let child_id = match self.stack.last() {
                Some(top) if top.node.node_type() == NodeType::Internal => top.node.ptr(top.idx),
                _ => break,
            };
            let child = NodeRef::new(store.load(child_id)?);
            let idx = pick(child);
            self.stack.push(Frame { node: child, idx });
        }
        Ok(())
    }
}
